//! Debuggee process instantiation: fork + traceme + exec, with ASLR
//! disabled and the sandbox applied between fork and exec.

use crate::driver::LaunchConfig;
use crate::native::error::Error;
use crate::sandbox::SandboxPolicy;
use nix::sys;
use nix::sys::personality::Persona;
use nix::sys::ptrace::Options;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader};
use std::os::unix::process::CommandExt;
use std::process::Command;

/// A spawned, ptrace-attached debuggee, stopped at its exec trap.
pub struct Debuggee {
    pub pid: Pid,
    child: std::process::Child,
}

impl Debuggee {
    /// Fork and exec the debuggee. The child calls `PTRACE_TRACEME`,
    /// disables address randomization and applies the sandbox before exec;
    /// the parent waits for the exec trap, so on return the process is
    /// stopped at its entry with the full memory image mapped.
    pub fn launch(config: &LaunchConfig, sandbox: &SandboxPolicy) -> Result<Self, Error> {
        let (stdout_reader, stdout_writer) = os_pipe::pipe()?;
        let stderr_writer = stdout_writer.try_clone()?;

        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .stdout(stdout_writer)
            .stderr(stderr_writer);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &config.env {
            command.env(key, value);
        }

        let sandbox = sandbox.clone();
        unsafe {
            command.pre_exec(move || {
                sys::personality::set(Persona::ADDR_NO_RANDOMIZE)?;
                #[cfg(target_os = "linux")]
                if let Err(e) = sandbox.apply() {
                    // surfaced on the gateway's stderr through the pipe
                    eprintln!("sandbox setup failed: {e}");
                    return Err(std::io::Error::other(e.to_string()));
                }
                sys::ptrace::traceme().map_err(std::io::Error::from)?;
                Ok(())
            });
        }

        let child = command.spawn()?;
        let pid = Pid::from_raw(child.id() as i32);

        // exec under TRACEME delivers a SIGTRAP once the new image is up
        match waitpid(pid, None).map_err(Error::Waitpid)? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
            WaitStatus::Exited(_, code) => return Err(Error::ProcessExit(code)),
            other => {
                log::warn!(target: "tracer", "unexpected launch status: {other:?}");
            }
        }
        sys::ptrace::setoptions(pid, Options::PTRACE_O_EXITKILL).map_err(Error::Ptrace)?;

        forward_output(stdout_reader);
        log::info!(target: "tracer", "debuggee {} started (pid {pid})", config.program.display());
        Ok(Self { pid, child })
    }

    /// Forcibly terminate and reap the debuggee.
    pub fn kill(&mut self) {
        let _ = sys::signal::kill(self.pid, Signal::SIGKILL);
        let _ = self.child.wait();
    }

    /// Reap an already-exited debuggee so no zombie outlives the session.
    pub fn reap(&mut self) {
        let _ = self.child.try_wait();
    }
}

/// Pump debuggee output into the log. Plumbing only: the thread dies with
/// the pipe when the debuggee exits.
fn forward_output(reader: os_pipe::PipeReader) {
    std::thread::spawn(move || {
        let reader = BufReader::new(reader);
        for line in reader.lines() {
            match line {
                Ok(line) => log::info!(target: "debuggee", "{line}"),
                Err(_) => break,
            }
        }
    });
}

/// Runtime load base of the executable: zero for fixed-address binaries,
/// the lowest file-backed mapping for PIE.
pub fn mapping_base(pid: Pid, program: &std::path::Path, is_pie: bool) -> Result<u64, Error> {
    if !is_pie {
        return Ok(0);
    }

    let maps = proc_maps::get_process_maps(pid.as_raw())
        .map_err(|_| Error::MappingNotFound(program.display().to_string()))?;
    let canonical = program.canonicalize().unwrap_or_else(|_| program.to_path_buf());

    maps.iter()
        .filter(|map| map.filename() == Some(canonical.as_path()) || map.filename() == Some(program))
        .map(|map| map.start() as u64)
        .min()
        .ok_or_else(|| Error::MappingNotFound(program.display().to_string()))
}
