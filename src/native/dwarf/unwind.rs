//! Call-stack unwinding from DWARF call frame information.
//!
//! Frames are recovered by interpreting CFI rules: compute the canonical
//! frame address, restore the caller's registers per rule, then follow the
//! return-address column. Expression-valued rules end the walk instead of
//! failing it: a partial backtrace beats none.

use crate::native::dwarf::{DebugInfo, EndianRcSlice, PlaceDescriptor};
use crate::native::error::Error;
use crate::native::registers::{RegisterSnapshot, DWARF_SP};
use gimli::{CfaRule, FrameDescriptionEntry, RegisterRule, UnwindSection, UnwindTableRow};
use nix::libc::c_void;
use nix::sys;
use nix::unistd::Pid;

/// Detailed information about a single stack frame in the unwind path.
#[derive(Debug, Clone)]
pub struct FrameSpan {
    /// Relocated instruction pointer.
    pub ip: u64,
    pub func_name: Option<String>,
    pub place: Option<PlaceDescriptor>,
}

const MAX_FRAMES: usize = 128;

/// Unwinds one debuggee's stack using its parsed frame information.
pub struct Unwinder<'a> {
    info: &'a DebugInfo,
    base: u64,
}

impl<'a> Unwinder<'a> {
    pub fn new(info: &'a DebugInfo, base: u64) -> Self {
        Self { info, base }
    }

    /// Unwind the thread's stack and return a backtrace.
    pub fn backtrace(&self, pid: Pid) -> Result<Vec<FrameSpan>, Error> {
        let mut registers = RegisterSnapshot::current(pid)?;
        let mut backtrace = vec![];
        // return addresses point past the call; look their rows up at -1
        let mut lookup_adjust = 0u64;

        while backtrace.len() < MAX_FRAMES {
            let pc = registers.pc();
            if pc == 0 {
                break;
            }
            let global = pc.wrapping_sub(self.base).wrapping_sub(lookup_adjust);
            backtrace.push(FrameSpan {
                ip: pc,
                func_name: self.info.function_name_at(global),
                place: self.info.find_place_from_pc(global),
            });

            if !self.step(pid, &mut registers, global)? {
                break;
            }
            lookup_adjust = 1;
        }
        Ok(backtrace)
    }

    /// Return address of the current frame, if one can be recovered.
    pub fn return_address(&self, pid: Pid) -> Result<Option<u64>, Error> {
        let mut registers = RegisterSnapshot::current(pid)?;
        let global = registers.pc().wrapping_sub(self.base);
        if self.step(pid, &mut registers, global)? {
            Ok(Some(registers.pc()))
        } else {
            Ok(None)
        }
    }

    /// Canonical frame address of the current frame.
    pub fn cfa(&self, pid: Pid) -> Result<u64, Error> {
        let registers = RegisterSnapshot::current(pid)?;
        let global = registers.pc().wrapping_sub(self.base);
        self.cfa_with(&registers, global)
    }

    /// Canonical frame address for an arbitrary frame's registers.
    pub fn cfa_with(
        &self,
        registers: &RegisterSnapshot,
        global_pc: u64,
    ) -> Result<u64, Error> {
        let (_, row) = self
            .row_for(global_pc)?
            .ok_or(Error::NoUnwindInfo(global_pc))?;
        cfa_of(&row, registers)
    }

    /// Registers as they were in frame `frame_num` (0 = innermost).
    pub fn registers_at_frame(
        &self,
        pid: Pid,
        frame_num: u32,
    ) -> Result<RegisterSnapshot, Error> {
        let mut registers = RegisterSnapshot::current(pid)?;
        let mut lookup_adjust = 0u64;
        for _ in 0..frame_num {
            let global = registers
                .pc()
                .wrapping_sub(self.base)
                .wrapping_sub(lookup_adjust);
            if !self.step(pid, &mut registers, global)? {
                return Err(Error::FrameNotFound(frame_num));
            }
            lookup_adjust = 1;
        }
        Ok(registers)
    }

    /// Restore the caller's registers. Returns false when the walk ends.
    fn step(
        &self,
        pid: Pid,
        registers: &mut RegisterSnapshot,
        global_pc: u64,
    ) -> Result<bool, Error> {
        let Some((fde, row)) = self.row_for(global_pc)? else {
            return Ok(false);
        };
        let Ok(cfa) = cfa_of(&row, registers) else {
            return Ok(false);
        };

        let mut next = registers.clone();
        for (register, rule) in row.registers() {
            match rule {
                RegisterRule::Undefined => next.forget(*register),
                RegisterRule::SameValue => {}
                RegisterRule::Offset(offset) => {
                    let addr = cfa.wrapping_add(*offset as u64);
                    next.update(*register, read_word(pid, addr)?);
                }
                RegisterRule::ValOffset(offset) => {
                    next.update(*register, cfa.wrapping_add(*offset as u64));
                }
                RegisterRule::Register(other) => {
                    if let Ok(value) = registers.value(*other) {
                        next.update(*register, value);
                    }
                }
                RegisterRule::Constant(value) => next.update(*register, *value),
                // expression rules end the walk for this register
                RegisterRule::Expression(_) | RegisterRule::ValExpression(_) => {
                    next.forget(*register)
                }
                _ => {}
            }
        }

        let ra_column = fde.cie().return_address_register();
        let Ok(return_addr) = next.value(ra_column) else {
            return Ok(false);
        };
        if return_addr == 0 || return_addr == registers.pc() {
            return Ok(false);
        }

        next.update(DWARF_SP, cfa);
        next.set_pc(return_addr);
        *registers = next;
        Ok(true)
    }

    fn row_for(
        &self,
        global_pc: u64,
    ) -> Result<
        Option<(
            FrameDescriptionEntry<EndianRcSlice>,
            UnwindTableRow<EndianRcSlice>,
        )>,
        Error,
    > {
        match row_in(&self.info.eh_frame, &self.info.bases, global_pc)? {
            Some(found) => Ok(Some(found)),
            None => match &self.info.debug_frame {
                Some(debug_frame) => {
                    Ok(row_in(debug_frame, &self.info.bases, global_pc)?)
                }
                None => Ok(None),
            },
        }
    }
}

fn cfa_of(
    row: &UnwindTableRow<EndianRcSlice>,
    registers: &RegisterSnapshot,
) -> Result<u64, Error> {
    match row.cfa() {
        CfaRule::RegisterAndOffset { register, offset } => Ok(registers
            .value(*register)?
            .wrapping_add(*offset as u64)),
        CfaRule::Expression(_) => Err(Error::UnsupportedCfaRule),
    }
}

fn row_in<S: UnwindSection<EndianRcSlice>>(
    section: &S,
    bases: &gimli::BaseAddresses,
    pc: u64,
) -> Result<
    Option<(
        FrameDescriptionEntry<EndianRcSlice>,
        UnwindTableRow<EndianRcSlice>,
    )>,
    Error,
> {
    let fde = match section.fde_for_address(bases, pc, S::cie_from_offset) {
        Ok(fde) => fde,
        Err(gimli::Error::NoUnwindInfoForAddress) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut ctx = Box::new(gimli::UnwindContext::new());
    let row = fde
        .unwind_info_for_address(section, bases, &mut ctx, pc)?
        .clone();
    Ok(Some((fde, row)))
}

fn read_word(pid: Pid, addr: u64) -> Result<u64, Error> {
    sys::ptrace::read(pid, addr as *mut c_void)
        .map(|value| value as u64)
        .map_err(Error::Ptrace)
}
