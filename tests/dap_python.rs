//! End-to-end scenario against a real debugpy adapter.
//!
//! Needs `python3 -m debugpy` installed; ignored by default.

use cog_debug::config::Settings;
use cog_debug::dap::DapDriver;
use cog_debug::driver::{
    Driver, InspectOutcome, InspectRequest, LaunchConfig, RunAction, ScopeKind, StopReason,
};
use cog_debug::sandbox::SandboxPolicy;
use serial_test::serial;
use std::path::PathBuf;

fn project_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

#[test]
#[serial]
#[ignore = "needs python3 with debugpy; run with --ignored"]
fn python_breakpoint_hit() {
    let program = project_dir().join("fixtures").join("simple.py");
    let mut driver = DapDriver::new(
        Settings::default(),
        SandboxPolicy::new(project_dir()).allow_write(std::env::temp_dir()),
    );

    let mut config = LaunchConfig::new(&program);
    config.stop_on_entry = true;
    driver.launch(&config).unwrap();

    let bp = driver.set_breakpoint(&program, 4, None, None).unwrap();
    assert!(bp.verified);

    let stop = driver.run(RunAction::Continue).unwrap();
    assert_eq!(stop.stop_reason, StopReason::Breakpoint);

    let outcome = driver
        .inspect(&InspectRequest::Scope {
            scope: ScopeKind::Locals,
            frame_id: 0,
        })
        .unwrap();
    let InspectOutcome::Variables(vars) = outcome else {
        panic!("expected variables");
    };
    assert!(vars.iter().any(|v| v.name == "x" && v.value == "42"));

    driver.stop();
}
