//! Software breakpoints: a saved original byte at an address, replaced by
//! the architecture's trap instruction.

use nix::libc::c_void;
use nix::sys;
use nix::unistd::Pid;
use std::cell::Cell;

#[cfg(target_arch = "x86_64")]
mod arch {
    /// `int3`
    pub const TRAP_CODE: u64 = 0xCC;
    pub const TRAP_MASK: u64 = 0xff;
    /// On x86-64 the trap reports PC one past the breakpoint address.
    pub const TRAP_PC_OFFSET: u64 = 1;
}

#[cfg(target_arch = "aarch64")]
mod arch {
    /// `brk #0`
    pub const TRAP_CODE: u64 = 0xd420_0000;
    pub const TRAP_MASK: u64 = 0xffff_ffff;
    pub const TRAP_PC_OFFSET: u64 = 0;
}

pub use arch::TRAP_PC_OFFSET;

/// One planted trap. The original instruction bytes are kept so the
/// breakpoint can be disabled and stepped over.
pub struct Breakpoint {
    pub addr: u64,
    pid: Pid,
    saved_data: Cell<u64>,
    enabled: Cell<bool>,
}

impl Breakpoint {
    pub fn new(addr: u64, pid: Pid) -> Self {
        Self {
            addr,
            pid,
            saved_data: Cell::default(),
            enabled: Cell::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    fn as_ptr(&self) -> *mut c_void {
        self.addr as *mut c_void
    }

    /// Save the original bytes and write the trap instruction.
    pub fn enable(&self) -> nix::Result<()> {
        let data = sys::ptrace::read(self.pid, self.as_ptr())? as u64;
        self.saved_data.set(data & arch::TRAP_MASK);
        let patched = (data & !arch::TRAP_MASK) | arch::TRAP_CODE;
        unsafe {
            sys::ptrace::write(self.pid, self.as_ptr(), patched as *mut c_void)?;
        }
        self.enabled.set(true);
        Ok(())
    }

    /// Restore the original bytes.
    pub fn disable(&self) -> nix::Result<()> {
        let data = sys::ptrace::read(self.pid, self.as_ptr())? as u64;
        let restored = (data & !arch::TRAP_MASK) | self.saved_data.get();
        unsafe {
            sys::ptrace::write(self.pid, self.as_ptr(), restored as *mut c_void)?;
        }
        self.enabled.set(false);
        Ok(())
    }
}
