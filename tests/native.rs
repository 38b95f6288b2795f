//! End-to-end scenarios against the native DWARF engine.
//!
//! These need a C toolchain and ptrace permissions, so they are ignored by
//! default: `cargo test -- --ignored` runs them on a capable host.

use cog_debug::config::Settings;
use cog_debug::driver::{
    Driver, InspectOutcome, InspectRequest, LaunchConfig, RunAction, ScopeKind, StopReason,
};
use cog_debug::native::NativeDriver;
use cog_debug::sandbox::SandboxPolicy;
use serial_test::serial;
use std::path::PathBuf;
use std::process::Command;

fn project_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

/// Compile fixtures/simple.c with debug info into the target directory.
fn build_fixture() -> PathBuf {
    let source = project_dir().join("fixtures").join("simple.c");
    let out = std::env::temp_dir().join(format!("cog-debug-fixture-{}", std::process::id()));
    let status = Command::new("cc")
        .args(["-g", "-O0", "-o"])
        .arg(&out)
        .arg(&source)
        .status()
        .expect("cc is available");
    assert!(status.success(), "fixture compilation failed");
    out
}

fn native_driver() -> NativeDriver {
    NativeDriver::new(
        Settings::default(),
        SandboxPolicy::new(project_dir()).allow_write(std::env::temp_dir()),
    )
}

#[test]
#[serial]
#[ignore = "needs cc and ptrace; run with --ignored"]
fn breakpoint_hit_and_step_over() {
    let program = build_fixture();
    let mut driver = native_driver();

    let mut config = LaunchConfig::new(&program);
    config.stop_on_entry = true;
    driver.launch(&config).unwrap();

    // line 4 is `int sum = a + b;` inside add()
    let source = project_dir().join("fixtures").join("simple.c");
    let bp = driver.set_breakpoint(&source, 4, None, None).unwrap();
    assert!(bp.verified);
    assert_eq!(bp.line, 4);

    let stop = driver.run(RunAction::Continue).unwrap();
    assert_eq!(stop.stop_reason, StopReason::Breakpoint);

    // locals of add() are visible at the stop point
    let outcome = driver
        .inspect(&InspectRequest::Scope {
            scope: ScopeKind::Locals,
            frame_id: 0,
        })
        .unwrap();
    let InspectOutcome::Variables(vars) = outcome else {
        panic!("expected variables");
    };
    let names: Vec<_> = vars.iter().map(|v| v.name.as_str()).collect();
    assert!(names.contains(&"a"));
    assert!(names.contains(&"b"));
    let a = vars.iter().find(|v| v.name == "a").unwrap();
    assert_eq!(a.value, "42");

    let stop = driver.run(RunAction::StepOver).unwrap();
    assert_eq!(stop.stop_reason, StopReason::Step);

    driver.stop();
    let _ = std::fs::remove_file(&program);
}

#[test]
#[serial]
#[ignore = "needs cc and ptrace; run with --ignored"]
fn backtrace_spans_main_and_callee() {
    let program = build_fixture();
    let mut driver = native_driver();

    driver.launch(&LaunchConfig::new(&program)).unwrap();
    let source = project_dir().join("fixtures").join("simple.c");
    driver.set_breakpoint(&source, 4, None, None).unwrap();
    driver.run(RunAction::Continue).unwrap();

    let InspectOutcome::Frames(frames) = driver.inspect(&InspectRequest::Stack).unwrap() else {
        panic!("expected frames");
    };
    assert!(frames.len() >= 2);
    assert!(frames[0].name.contains("add"));
    assert!(frames.iter().any(|f| f.name.contains("main")));

    driver.stop();
    let _ = std::fs::remove_file(&program);
}

#[test]
#[serial]
#[ignore = "needs cc and ptrace; run with --ignored"]
fn program_runs_to_exit() {
    let program = build_fixture();
    let mut driver = native_driver();

    driver.launch(&LaunchConfig::new(&program)).unwrap();
    let stop = driver.run(RunAction::Continue).unwrap();
    assert_eq!(stop.stop_reason, StopReason::Exit);
    assert_eq!(stop.exit_code, Some(0));

    let _ = std::fs::remove_file(&program);
}
