//! Variable location decoding and value rendering.
//!
//! Location expressions are decoded straight from DWARF expression bytes:
//! the engine recognizes registers, frame offsets and plain memory
//! addresses. Values render by their DWARF type: base encodings by width,
//! pointers as `0xADDR`, enumerations as `Name(value)`; aggregates expose
//! their members through child slots the driver turns into
//! `variables_reference` handles.

use crate::native::dwarf::leb128;
use crate::native::dwarf::{DebugInfo, DieRef, ParsedUnit};
use crate::native::error::Error;
use crate::native::registers::RegisterSnapshot;
use gimli::{
    AttributeValue, Reader as _, UnitOffset, DW_ATE_boolean, DW_ATE_float, DW_ATE_signed,
    DW_ATE_signed_char, DW_ATE_unsigned, DW_ATE_unsigned_char, DW_TAG_array_type,
    DW_TAG_base_type, DW_TAG_class_type, DW_TAG_const_type, DW_TAG_enumeration_type,
    DW_TAG_enumerator, DW_TAG_member, DW_TAG_pointer_type, DW_TAG_restrict_type,
    DW_TAG_structure_type, DW_TAG_subrange_type, DW_TAG_typedef, DW_TAG_union_type,
    DW_TAG_volatile_type,
};
use nix::libc::{c_long, c_void};
use nix::sys;
use nix::unistd::Pid;

// DWARF expression opcodes the engine recognizes.
const DW_OP_ADDR: u8 = 0x03;
const DW_OP_BREG0: u8 = 0x70;
const DW_OP_BREG31: u8 = 0x8f;
const DW_OP_REG0: u8 = 0x50;
const DW_OP_REG31: u8 = 0x6f;
const DW_OP_REGX: u8 = 0x90;
const DW_OP_FBREG: u8 = 0x91;
const DW_OP_CALL_FRAME_CFA: u8 = 0x9c;

/// Where a variable lives right now.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Location {
    /// The value sits in a register.
    Register(gimli::Register),
    /// Offset from the frame base.
    FrameOffset(i64),
    /// Offset from a register's value.
    RegisterOffset(gimli::Register, i64),
    /// A global memory address (relocation pending).
    Address(u64),
}

/// Decode a single-location DWARF expression.
pub fn decode_location(bytes: &[u8]) -> Result<Location, Error> {
    let op = *bytes
        .first()
        .ok_or(leb128::DecodeError::UnexpectedEndOfData)?;
    let mut pos = 1usize;
    match op {
        DW_OP_ADDR => {
            let raw: [u8; 8] = bytes
                .get(1..9)
                .ok_or(leb128::DecodeError::UnexpectedEndOfData)?
                .try_into()
                .expect("slice is 8 bytes");
            Ok(Location::Address(u64::from_le_bytes(raw)))
        }
        DW_OP_FBREG => Ok(Location::FrameOffset(leb128::read_sleb128(bytes, &mut pos)?)),
        DW_OP_REG0..=DW_OP_REG31 => Ok(Location::Register(gimli::Register(
            (op - DW_OP_REG0) as u16,
        ))),
        DW_OP_REGX => Ok(Location::Register(gimli::Register(
            leb128::read_uleb128(bytes, &mut pos)? as u16,
        ))),
        DW_OP_BREG0..=DW_OP_BREG31 => Ok(Location::RegisterOffset(
            gimli::Register((op - DW_OP_BREG0) as u16),
            leb128::read_sleb128(bytes, &mut pos)?,
        )),
        other => Err(Error::UnsupportedLocation(other)),
    }
}

/// How a function's frame base is computed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameBaseRule {
    /// `DW_OP_call_frame_cfa`: take the CFA from frame information.
    Cfa,
    /// A register plus offset (`DW_OP_bregN` / `DW_OP_regN`).
    Register(gimli::Register, i64),
}

pub fn decode_frame_base(bytes: &[u8]) -> Result<FrameBaseRule, Error> {
    let op = *bytes
        .first()
        .ok_or(leb128::DecodeError::UnexpectedEndOfData)?;
    let mut pos = 1usize;
    match op {
        DW_OP_CALL_FRAME_CFA => Ok(FrameBaseRule::Cfa),
        DW_OP_REG0..=DW_OP_REG31 => Ok(FrameBaseRule::Register(
            gimli::Register((op - DW_OP_REG0) as u16),
            0,
        )),
        DW_OP_BREG0..=DW_OP_BREG31 => Ok(FrameBaseRule::Register(
            gimli::Register((op - DW_OP_BREG0) as u16),
            leb128::read_sleb128(bytes, &mut pos)?,
        )),
        other => Err(Error::UnsupportedLocation(other)),
    }
}

/// Resolved view of a DWARF type DIE.
#[derive(Debug, Clone)]
pub enum TypeInfo {
    Base {
        name: String,
        byte_size: u64,
        encoding: gimli::DwAte,
    },
    Pointer {
        name: String,
    },
    Enum {
        name: String,
        byte_size: u64,
        enumerators: Vec<(i64, String)>,
    },
    Struct {
        name: String,
        byte_size: Option<u64>,
        members: Vec<Member>,
    },
    Array {
        element: Box<TypeInfo>,
        element_size: Option<u64>,
        element_offset: Option<UnitOffset>,
        count: Option<u64>,
    },
    Unknown {
        name: String,
    },
}

#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub offset: i64,
    pub type_offset: Option<UnitOffset>,
}

impl TypeInfo {
    pub fn name(&self) -> String {
        match self {
            TypeInfo::Base { name, .. }
            | TypeInfo::Pointer { name }
            | TypeInfo::Enum { name, .. }
            | TypeInfo::Struct { name, .. }
            | TypeInfo::Unknown { name } => name.clone(),
            TypeInfo::Array { element, .. } => format!("[{}]", element.name()),
        }
    }

    pub fn byte_size(&self) -> Option<u64> {
        match self {
            TypeInfo::Base { byte_size, .. } | TypeInfo::Enum { byte_size, .. } => {
                Some(*byte_size)
            }
            TypeInfo::Pointer { .. } => Some(8),
            TypeInfo::Struct { byte_size, .. } => *byte_size,
            TypeInfo::Array {
                element_size,
                count,
                ..
            } => match (element_size, count) {
                (Some(size), Some(count)) => Some(size * count),
                _ => None,
            },
            TypeInfo::Unknown { .. } => None,
        }
    }
}

/// Resolve a type DIE, peeling typedefs and cv-qualifiers.
pub fn resolve_type(unit: &ParsedUnit, offset: UnitOffset) -> TypeInfo {
    resolve_type_inner(unit, offset, 0)
}

fn resolve_type_inner(unit: &ParsedUnit, offset: UnitOffset, depth: u8) -> TypeInfo {
    let unknown = |name: &str| TypeInfo::Unknown {
        name: name.to_string(),
    };
    if depth > 16 {
        return unknown("<recursive>");
    }
    let Some(die) = unit.die_by_offset(offset) else {
        return unknown("<unresolved>");
    };
    let name = die.name.clone().unwrap_or_else(|| "<anonymous>".into());

    match die.tag {
        DW_TAG_base_type => TypeInfo::Base {
            byte_size: die.byte_size.unwrap_or(8),
            encoding: die.encoding.unwrap_or(DW_ATE_signed),
            name,
        },
        DW_TAG_pointer_type => {
            let target = die
                .type_ref
                .map(|t| resolve_type_inner(unit, t, depth + 1).name())
                .unwrap_or_else(|| "void".into());
            TypeInfo::Pointer {
                name: format!("*{target}"),
            }
        }
        DW_TAG_enumeration_type => {
            let enumerators = die
                .children
                .iter()
                .filter_map(|&child| {
                    let child = &unit.dies[child];
                    if child.tag != DW_TAG_enumerator {
                        return None;
                    }
                    Some((child.const_value?, child.name.clone()?))
                })
                .collect();
            TypeInfo::Enum {
                byte_size: die.byte_size.unwrap_or(4),
                enumerators,
                name,
            }
        }
        tag if tag == DW_TAG_structure_type
            || tag == DW_TAG_class_type
            || tag == DW_TAG_union_type =>
        {
            let members = die
                .children
                .iter()
                .filter_map(|&child| {
                    let child = &unit.dies[child];
                    if child.tag != DW_TAG_member {
                        return None;
                    }
                    Some(Member {
                        name: child.name.clone().unwrap_or_else(|| "<anon>".into()),
                        offset: child.member_location.unwrap_or(0),
                        type_offset: child.type_ref,
                    })
                })
                .collect();
            TypeInfo::Struct {
                byte_size: die.byte_size,
                members,
                name,
            }
        }
        DW_TAG_array_type => {
            let element_offset = die.type_ref;
            let element = element_offset
                .map(|t| resolve_type_inner(unit, t, depth + 1))
                .unwrap_or_else(|| unknown("<element>"));
            let count = die.element_count.or_else(|| {
                die.children.iter().find_map(|&child| {
                    let child = &unit.dies[child];
                    (child.tag == DW_TAG_subrange_type)
                        .then_some(child.element_count)
                        .flatten()
                })
            });
            TypeInfo::Array {
                element_size: element.byte_size(),
                element: Box::new(element),
                element_offset,
                count,
            }
        }
        tag if tag == DW_TAG_typedef
            || tag == DW_TAG_const_type
            || tag == DW_TAG_volatile_type
            || tag == DW_TAG_restrict_type =>
        {
            match die.type_ref {
                Some(target) => resolve_type_inner(unit, target, depth + 1),
                None => unknown(&name),
            }
        }
        _ => unknown(&name),
    }
}

/// A member or element reachable from an aggregate value. The driver wraps
/// these into `variables_reference` handles.
#[derive(Debug, Clone)]
pub struct ChildSlot {
    pub name: String,
    /// Runtime address, when the parent was addressable.
    pub address: Option<u64>,
    pub unit: usize,
    pub type_offset: Option<UnitOffset>,
}

/// A rendered value plus its expandable children.
#[derive(Debug, Clone)]
pub struct Evaluated {
    pub value: String,
    pub type_name: String,
    pub children: Vec<ChildSlot>,
}

impl Evaluated {
    fn scalar(value: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            type_name: type_name.into(),
            children: vec![],
        }
    }
}

const MAX_ARRAY_CHILDREN: u64 = 64;

/// Evaluation context for one stopped debuggee.
pub struct EvalContext<'a> {
    pub info: &'a DebugInfo,
    pub pid: Pid,
    /// Runtime mapping base for relocating global addresses.
    pub base: u64,
}

impl EvalContext<'_> {
    /// Evaluate one variable DIE in the given register/frame context.
    pub fn evaluate_die(
        &self,
        var: DieRef,
        registers: &RegisterSnapshot,
        frame_base: Option<u64>,
    ) -> Result<Evaluated, Error> {
        let die = self.info.die(var);
        let unit = self.info.unit(var.unit);

        let ty = die
            .type_ref
            .map(|offset| resolve_type(unit, offset))
            .unwrap_or(TypeInfo::Unknown {
                name: "<untyped>".into(),
            });

        let Some(location) = die.location.as_ref() else {
            return Ok(Evaluated::scalar("<optimized out>", ty.name()));
        };
        let expr = match location.value() {
            AttributeValue::Exprloc(expr) => expr,
            // location lists (variables moving between registers) are out
            // of the recognized set
            _ => return Ok(Evaluated::scalar("<optimized out>", ty.name())),
        };
        let bytes = expr.0.to_slice()?;

        match decode_location(&bytes)? {
            Location::Address(global) => {
                self.render_at(global.wrapping_add(self.base), &ty, var.unit)
            }
            Location::FrameOffset(offset) => {
                let frame_base = frame_base.ok_or(Error::NoFBA)?;
                self.render_at(frame_base.wrapping_add(offset as u64), &ty, var.unit)
            }
            Location::RegisterOffset(register, offset) => {
                let addr = registers.value(register)?.wrapping_add(offset as u64);
                self.render_at(addr, &ty, var.unit)
            }
            Location::Register(register) => {
                let raw = registers.value(register)?.to_ne_bytes();
                let size = ty.byte_size().unwrap_or(8).min(8) as usize;
                // register-resident values are not addressable, no children
                let mut rendered = self.render_bytes(&raw[..size], &ty, None, var.unit);
                rendered.children.clear();
                Ok(rendered)
            }
        }
    }

    /// Render the value found at a runtime address.
    pub fn render_at(
        &self,
        addr: u64,
        ty: &TypeInfo,
        unit: usize,
    ) -> Result<Evaluated, Error> {
        let size = ty.byte_size().unwrap_or(8).min(4096);
        let bytes = self.read_memory(addr, size as usize)?;
        Ok(self.render_bytes(&bytes, ty, Some(addr), unit))
    }

    /// Render a child slot produced by a previous evaluation.
    pub fn render_slot(&self, slot: &ChildSlot) -> Result<Evaluated, Error> {
        let unit = self.info.unit(slot.unit);
        let ty = slot
            .type_offset
            .map(|offset| resolve_type(unit, offset))
            .unwrap_or(TypeInfo::Unknown {
                name: "<untyped>".into(),
            });
        match slot.address {
            Some(addr) => self.render_at(addr, &ty, slot.unit),
            None => Ok(Evaluated::scalar("<unavailable>", ty.name())),
        }
    }

    fn render_bytes(
        &self,
        bytes: &[u8],
        ty: &TypeInfo,
        addr: Option<u64>,
        unit: usize,
    ) -> Evaluated {
        match ty {
            TypeInfo::Base {
                name,
                byte_size,
                encoding,
            } => Evaluated::scalar(
                render_base(bytes, *byte_size, *encoding),
                name.clone(),
            ),
            TypeInfo::Pointer { name } => {
                let value = read_uint(bytes, 8);
                Evaluated::scalar(format!("0x{value:x}"), name.clone())
            }
            TypeInfo::Enum {
                name,
                byte_size,
                enumerators,
            } => {
                let raw = read_int(bytes, *byte_size as usize);
                let label = enumerators
                    .iter()
                    .find(|(value, _)| *value == raw)
                    .map(|(_, name)| name.as_str());
                let value = match label {
                    Some(label) => format!("{label}({raw})"),
                    None => format!("({raw})"),
                };
                Evaluated::scalar(value, name.clone())
            }
            TypeInfo::Struct { name, members, .. } => {
                let children = members
                    .iter()
                    .map(|member| ChildSlot {
                        name: member.name.clone(),
                        address: addr.map(|a| a.wrapping_add(member.offset as u64)),
                        unit,
                        type_offset: member.type_offset,
                    })
                    .collect::<Vec<_>>();
                Evaluated {
                    value: format!("{{...}} ({} fields)", children.len()),
                    type_name: name.clone(),
                    children,
                }
            }
            TypeInfo::Array {
                element,
                element_size,
                element_offset,
                count,
            } => {
                let count = count.unwrap_or(0);
                let shown = count.min(MAX_ARRAY_CHILDREN);
                let children = match (addr, element_size) {
                    (Some(addr), Some(size)) => (0..shown)
                        .map(|index| ChildSlot {
                            name: format!("[{index}]"),
                            address: Some(addr.wrapping_add(index * size)),
                            unit,
                            type_offset: *element_offset,
                        })
                        .collect(),
                    _ => vec![],
                };
                Evaluated {
                    value: format!("[...; {count}]"),
                    type_name: format!("[{}]", element.name()),
                    children,
                }
            }
            TypeInfo::Unknown { name } => Evaluated::scalar("<unavailable>", name.clone()),
        }
    }

    /// Read N bytes from the debuggee.
    pub fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>, Error> {
        let mut remaining = len as isize;
        let mut result = Vec::with_capacity(len);
        let word = std::mem::size_of::<c_long>();

        let mut addr = addr as *mut c_long;
        while remaining > 0 {
            let value =
                sys::ptrace::read(self.pid, addr as *mut c_void).map_err(Error::Ptrace)?;
            result.extend(value.to_ne_bytes().into_iter().take(remaining as usize));
            remaining -= word as isize;
            addr = unsafe { addr.offset(1) };
        }
        Ok(result)
    }
}

fn read_uint(bytes: &[u8], max: usize) -> u64 {
    let mut raw = [0u8; 8];
    let n = bytes.len().min(max).min(8);
    raw[..n].copy_from_slice(&bytes[..n]);
    u64::from_le_bytes(raw)
}

fn read_int(bytes: &[u8], size: usize) -> i64 {
    let unsigned = read_uint(bytes, size.max(1));
    let bits = (size.min(8) * 8) as u32;
    if bits >= 64 {
        return unsigned as i64;
    }
    // sign extend
    let shift = 64 - bits;
    ((unsigned << shift) as i64) >> shift
}

fn render_base(bytes: &[u8], byte_size: u64, encoding: gimli::DwAte) -> String {
    let size = byte_size as usize;
    match encoding {
        DW_ATE_boolean => {
            if read_uint(bytes, size.max(1)) == 0 {
                "false".into()
            } else {
                "true".into()
            }
        }
        DW_ATE_float => match size {
            4 => format!("{}", f32::from_le_bytes(first4(bytes))),
            _ => format!("{}", f64::from_le_bytes(first8(bytes))),
        },
        DW_ATE_signed => format!("{}", read_int(bytes, size)),
        DW_ATE_unsigned => format!("{}", read_uint(bytes, size.max(1))),
        DW_ATE_signed_char | DW_ATE_unsigned_char => {
            let raw = read_uint(bytes, 1) as u32;
            match char::from_u32(raw) {
                Some(c) if !c.is_control() => format!("'{c}' ({raw})"),
                _ => format!("({raw})"),
            }
        }
        _ => format!("0x{:x}", read_uint(bytes, size.max(1))),
    }
}

fn first4(bytes: &[u8]) -> [u8; 4] {
    let mut raw = [0u8; 4];
    let n = bytes.len().min(4);
    raw[..n].copy_from_slice(&bytes[..n]);
    raw
}

fn first8(bytes: &[u8]) -> [u8; 8] {
    let mut raw = [0u8; 8];
    let n = bytes.len().min(8);
    raw[..n].copy_from_slice(&bytes[..n]);
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_opcodes_decode() {
        // DW_OP_fbreg -20
        let loc = decode_location(&[DW_OP_FBREG, 0x6c]).unwrap();
        assert_eq!(loc, Location::FrameOffset(-20));

        // DW_OP_reg5 (rdi)
        let loc = decode_location(&[DW_OP_REG0 + 5]).unwrap();
        assert_eq!(loc, Location::Register(gimli::Register(5)));

        // DW_OP_breg7 8 (rsp + 8)
        let loc = decode_location(&[DW_OP_BREG0 + 7, 0x08]).unwrap();
        assert_eq!(loc, Location::RegisterOffset(gimli::Register(7), 8));

        // DW_OP_addr
        let mut bytes = vec![DW_OP_ADDR];
        bytes.extend(0x404028u64.to_le_bytes());
        assert_eq!(decode_location(&bytes).unwrap(), Location::Address(0x404028));
    }

    #[test]
    fn truncated_location_is_an_error() {
        let err = decode_location(&[DW_OP_ADDR, 0x01, 0x02]).unwrap_err();
        assert!(matches!(
            err,
            Error::Leb128(leb128::DecodeError::UnexpectedEndOfData)
        ));

        let err = decode_location(&[]).unwrap_err();
        assert!(matches!(
            err,
            Error::Leb128(leb128::DecodeError::UnexpectedEndOfData)
        ));
    }

    #[test]
    fn unrecognized_opcode_is_reported_with_its_code() {
        let err = decode_location(&[0x9c]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedLocation(0x9c)));
    }

    #[test]
    fn frame_base_rules_decode() {
        assert_eq!(
            decode_frame_base(&[DW_OP_CALL_FRAME_CFA]).unwrap(),
            FrameBaseRule::Cfa
        );
        assert_eq!(
            decode_frame_base(&[DW_OP_BREG0 + 6, 0x10]).unwrap(),
            FrameBaseRule::Register(gimli::Register(6), 16)
        );
    }

    #[test]
    fn base_values_render_by_encoding() {
        assert_eq!(render_base(&42i32.to_le_bytes(), 4, DW_ATE_signed), "42");
        assert_eq!(render_base(&(-7i64).to_le_bytes(), 8, DW_ATE_signed), "-7");
        assert_eq!(render_base(&300u16.to_le_bytes(), 2, DW_ATE_unsigned), "300");
        assert_eq!(render_base(&[1], 1, DW_ATE_boolean), "true");
        assert_eq!(render_base(&[0], 1, DW_ATE_boolean), "false");
        assert_eq!(
            render_base(&2.5f64.to_le_bytes(), 8, DW_ATE_float),
            "2.5"
        );
        assert_eq!(
            render_base(&[b'x'], 1, DW_ATE_signed_char),
            "'x' (120)"
        );
    }

    #[test]
    fn sign_extension_respects_width() {
        assert_eq!(read_int(&(-1i8).to_le_bytes(), 1), -1);
        assert_eq!(read_int(&(0xffu8).to_le_bytes(), 1), -1);
        assert_eq!(read_int(&(-300i16).to_le_bytes(), 2), -300);
        assert_eq!(read_int(&u32::MAX.to_le_bytes(), 4), -1);
    }
}
