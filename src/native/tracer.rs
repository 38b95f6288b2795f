//! The waitpid loop: resume the debuggee, classify the next stop.
//!
//! The gateway debugs a single current thread; signals that do not concern
//! the debugging process are forwarded to the debuggee and execution
//! continues. Every wait is bounded by the configured backend timeout.

use crate::native::error::Error;
use crate::native::registers;
use nix::sys;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::time::{Duration, Instant};

/// Sent by the kernel from somewhere
pub const SI_KERNEL: i32 = 0x80;
/// Process breakpoint
pub const TRAP_BRKPT: i32 = 0x1;
/// Process trace trap
pub const TRAP_TRACE: i32 = 0x2;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Signals that don't interrupt the debugging process and are sent to the
/// debugee directly on fire.
static QUIET_SIGNALS: [Signal; 6] = [
    Signal::SIGALRM,
    Signal::SIGURG,
    Signal::SIGCHLD,
    Signal::SIGIO,
    Signal::SIGVTALRM,
    Signal::SIGPROF,
];

/// Why the debuggee stopped (or vanished).
#[derive(Debug)]
pub enum StopEvent {
    /// A planted trap fired; `pc` is the breakpoint address (already
    /// rewound on architectures that report PC past the trap).
    TrapHit { pc: u64 },
    /// A single-step completed.
    SingleStep,
    /// The debuggee received a signal the gateway does not swallow.
    Signal(Signal),
    /// The debuggee exited with a code.
    Exited(i32),
}

/// Controls one traced process.
pub struct Tracer {
    pid: Pid,
    timeout: Duration,
}

impl Tracer {
    pub fn new(pid: Pid, timeout: Duration) -> Self {
        Self { pid, timeout }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Continue execution until the next stop.
    pub fn resume(&self, signal: Option<Signal>) -> Result<StopEvent, Error> {
        sys::ptrace::cont(self.pid, signal).map_err(Error::Ptrace)?;
        self.wait()
    }

    /// Execute one instruction.
    pub fn single_step(&self, signal: Option<Signal>) -> Result<StopEvent, Error> {
        sys::ptrace::step(self.pid, signal).map_err(Error::Ptrace)?;
        self.wait()
    }

    fn wait(&self) -> Result<StopEvent, Error> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let status = match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout(self.timeout.as_millis() as u64));
                    }
                    std::thread::sleep(WAIT_POLL_INTERVAL);
                    continue;
                }
                Ok(status) => status,
                Err(e) => return Err(Error::Waitpid(e)),
            };
            log::debug!(target: "tracer", "wait status: {status:?}");

            match status {
                WaitStatus::Exited(_, code) => return Ok(StopEvent::Exited(code)),
                WaitStatus::Signaled(_, signal, _) => {
                    log::debug!(target: "tracer", "debuggee killed by {signal}");
                    return Ok(StopEvent::Exited(128 + signal as i32));
                }
                WaitStatus::Stopped(pid, Signal::SIGTRAP) => {
                    let info = sys::ptrace::getsiginfo(pid).map_err(Error::Ptrace)?;
                    match info.si_code {
                        TRAP_BRKPT | SI_KERNEL => {
                            let pc = registers::get_pc(pid)?
                                - crate::native::breakpoint::TRAP_PC_OFFSET;
                            registers::set_pc(pid, pc)?;
                            return Ok(StopEvent::TrapHit { pc });
                        }
                        TRAP_TRACE => return Ok(StopEvent::SingleStep),
                        code => {
                            log::debug!(target: "tracer", "unexpected SIGTRAP code {code}");
                            return Ok(StopEvent::SingleStep);
                        }
                    }
                }
                WaitStatus::Stopped(_, signal) if QUIET_SIGNALS.contains(&signal) => {
                    // forward and keep running
                    sys::ptrace::cont(self.pid, Some(signal)).map_err(Error::Ptrace)?;
                }
                WaitStatus::Stopped(_, signal) => return Ok(StopEvent::Signal(signal)),
                other => {
                    log::warn!(target: "tracer", "unexpected wait status: {other:?}");
                    sys::ptrace::cont(self.pid, None).map_err(Error::Ptrace)?;
                }
            }
        }
    }
}
