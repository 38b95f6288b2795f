//! Debug-information parsing and indexing for ELF and Mach-O binaries.
//!
//! One [`DebugInfo`] per debuggee: compilation units with their file
//! tables, line rows sorted by address, a flat DIE tree per unit, frame
//! information for unwinding and the object symbol table as a naming
//! fallback. All addresses in here are global (link-time); relocation by
//! the runtime mapping base happens in the engine.

pub mod eval;
pub mod leb128;
pub mod unwind;

use crate::native::error::Error;
use fallible_iterator::FallibleIterator;
use gimli::{
    Attribute, AttributeValue, DwAte, DwTag, Range, Reader, RunTimeEndian, Section, UnitOffset,
    DW_AT_byte_size, DW_AT_const_value, DW_AT_count, DW_AT_data_member_location, DW_AT_encoding,
    DW_AT_frame_base, DW_AT_high_pc, DW_AT_location, DW_AT_low_pc, DW_AT_name, DW_AT_type,
    DW_AT_upper_bound, DW_TAG_formal_parameter, DW_TAG_lexical_block, DW_TAG_subprogram,
    DW_TAG_variable,
};
use object::{Object, ObjectKind, ObjectSection, ObjectSymbol, SymbolKind};
use std::borrow::Cow;
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::path::Path;
use std::rc::Rc;

pub type EndianRcSlice = gimli::EndianRcSlice<gimli::RunTimeEndian>;

/// A source position resolved from the line index.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceDescriptor {
    pub file: String,
    pub line: u64,
    pub column: u64,
    /// Global (link-time) address of the row.
    pub address: u64,
    pub is_stmt: bool,
}

#[derive(PartialEq, Debug)]
struct LineRow {
    address: u64,
    file_index: u64,
    line: u64,
    column: u64,
    is_stmt: bool,
}

#[derive(Debug)]
struct DieRange {
    range: Range,
    die_idx: usize,
}

/// Flattened debug information entry. Only the attributes the engine
/// consumes are materialized.
#[derive(Debug)]
pub struct Die {
    pub tag: DwTag,
    pub offset: UnitOffset,
    pub name: Option<String>,
    pub low_pc: Option<u64>,
    pub high_pc: Option<u64>,
    pub ranges: Vec<Range>,
    pub location: Option<Attribute<EndianRcSlice>>,
    pub fb_addr: Option<Attribute<EndianRcSlice>>,
    pub type_ref: Option<UnitOffset>,
    pub byte_size: Option<u64>,
    pub encoding: Option<DwAte>,
    pub const_value: Option<i64>,
    pub member_location: Option<i64>,
    pub element_count: Option<u64>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

/// One parsed compilation unit.
pub struct ParsedUnit {
    files: Vec<String>,
    ranges: Vec<Range>,
    lines: Vec<LineRow>,
    pub dies: Vec<Die>,
    die_ranges: Vec<DieRange>,
    offsets: HashMap<UnitOffset, usize>,
}

impl ParsedUnit {
    fn place(&self, row: &LineRow) -> PlaceDescriptor {
        PlaceDescriptor {
            file: self
                .files
                .get(row.file_index as usize)
                .cloned()
                .unwrap_or_default(),
            line: row.line,
            column: row.column,
            address: row.address,
            is_stmt: row.is_stmt,
        }
    }

    pub fn die_by_offset(&self, offset: UnitOffset) -> Option<&Die> {
        self.offsets.get(&offset).map(|idx| &self.dies[*idx])
    }
}

/// Reference to one DIE: (unit index, die index).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DieRef {
    pub unit: usize,
    pub die: usize,
}

/// All debug information of one binary.
pub struct DebugInfo {
    units: Vec<ParsedUnit>,
    /// Function symbols sorted by address, for naming frames without DWARF.
    function_symbols: Vec<(u64, String)>,
    pub eh_frame: gimli::EhFrame<EndianRcSlice>,
    pub debug_frame: Option<gimli::DebugFrame<EndianRcSlice>>,
    pub bases: gimli::BaseAddresses,
    entry_point: u64,
    pie: bool,
}

fn load_section<'a>(
    id: gimli::SectionId,
    file: &object::File<'a>,
    endian: RunTimeEndian,
) -> EndianRcSlice {
    // Mach-O spells ".debug_info" as "__debug_info"
    let data = file
        .section_by_name(id.name())
        .or_else(|| file.section_by_name(&id.name().replacen('.', "__", 1)))
        .and_then(|section| section.uncompressed_data().ok())
        .unwrap_or(Cow::Borrowed(&[]));
    gimli::EndianRcSlice::new(Rc::from(&*data), endian)
}

impl DebugInfo {
    /// Parse an ELF or Mach-O binary and build every index the engine uses.
    pub fn parse(path: &Path) -> Result<Self, Error> {
        let file = std::fs::File::open(path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let object = object::File::parse(&*mmap)?;

        let endian = if object.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let dwarf = gimli::Dwarf::load(|id| {
            Ok::<_, gimli::Error>(load_section(id, &object, endian))
        })?;

        let eh_frame = gimli::EhFrame::load(|id| {
            Ok::<_, gimli::Error>(load_section(id, &object, endian))
        })?;
        let debug_frame = if object.section_by_name(".debug_frame").is_some()
            || object.section_by_name("__debug_frame").is_some()
        {
            let mut frame = gimli::DebugFrame::load(|id| {
                Ok::<_, gimli::Error>(load_section(id, &object, endian))
            })?;
            frame.set_address_size(8);
            Some(frame)
        } else {
            None
        };

        let mut bases = gimli::BaseAddresses::default();
        if let Some(section) = object.section_by_name(".text") {
            bases = bases.set_text(section.address());
        }
        if let Some(section) = object.section_by_name(".eh_frame") {
            bases = bases.set_eh_frame(section.address());
        }
        if let Some(section) = object.section_by_name(".eh_frame_hdr") {
            bases = bases.set_eh_frame_hdr(section.address());
        }
        if let Some(section) = object.section_by_name(".got") {
            bases = bases.set_got(section.address());
        }

        let function_symbols = collect_function_symbols(&object);
        let units = parse_units(&dwarf)?;

        Ok(Self {
            units,
            function_symbols,
            eh_frame,
            debug_frame,
            bases,
            entry_point: object.entry(),
            pie: matches!(object.kind(), ObjectKind::Dynamic),
        })
    }

    pub fn entry_point(&self) -> u64 {
        self.entry_point
    }

    /// Position-independent executables need a runtime mapping base.
    pub fn is_pie(&self) -> bool {
        self.pie
    }

    pub fn unit(&self, idx: usize) -> &ParsedUnit {
        &self.units[idx]
    }

    fn find_unit(&self, pc: u64) -> Option<(usize, &ParsedUnit)> {
        self.units.iter().enumerate().find(|(_, unit)| {
            match unit.ranges.binary_search_by_key(&pc, |r| r.begin) {
                Ok(_) => true,
                Err(pos) => unit.ranges[..pos]
                    .iter()
                    .rev()
                    .any(|range| range.begin <= pc && pc < range.end),
            }
        })
    }

    /// The source row covering a global address.
    pub fn find_place_from_pc(&self, pc: u64) -> Option<PlaceDescriptor> {
        let (_, unit) = self.find_unit(pc)?;
        let pos = match unit.lines.binary_search_by_key(&pc, |row| row.address) {
            Ok(pos) => pos,
            Err(0) => return None,
            Err(pos) => pos - 1,
        };
        unit.lines.get(pos).map(|row| unit.place(row))
    }

    /// Translate (file, line) to the statement row with the lowest address.
    /// The file may be given as an absolute path or a suffix of one.
    pub fn place_for_line(&self, file: &Path, line: u64) -> Result<PlaceDescriptor, Error> {
        let mut file_seen = false;
        let mut best: Option<(&ParsedUnit, &LineRow)> = None;

        for unit in &self.units {
            for (file_index, candidate) in unit.files.iter().enumerate() {
                if !path_matches(candidate, file) {
                    continue;
                }
                file_seen = true;
                for row in unit
                    .lines
                    .iter()
                    .filter(|row| row.file_index == file_index as u64 && row.line == line)
                {
                    let better = match best {
                        Some((_, chosen)) => (row.is_stmt && !chosen.is_stmt)
                            || (row.is_stmt == chosen.is_stmt && row.address < chosen.address),
                        None => true,
                    };
                    if better {
                        best = Some((unit, row));
                    }
                }
            }
        }

        match best {
            Some((unit, row)) => Ok(unit.place(row)),
            None if file_seen => Err(Error::NoPlaceForLine(
                file.display().to_string(),
                line as u32,
            )),
            None => Err(Error::FileNotIndexed(file.display().to_string())),
        }
    }

    /// Innermost function DIE covering a global address.
    pub fn find_function_by_pc(&self, pc: u64) -> Option<DieRef> {
        let (unit_idx, unit) = self.find_unit(pc)?;
        let search_to = match unit
            .die_ranges
            .binary_search_by_key(&pc, |dr| dr.range.begin)
        {
            Ok(pos) => pos + 1,
            Err(pos) => pos,
        };

        unit.die_ranges[..search_to]
            .iter()
            .rev()
            .find(|dr| {
                unit.dies[dr.die_idx].tag == DW_TAG_subprogram
                    && dr.range.begin <= pc
                    && pc < dr.range.end
            })
            .map(|dr| DieRef {
                unit: unit_idx,
                die: dr.die_idx,
            })
    }

    pub fn find_function_by_name(&self, name: &str) -> Option<DieRef> {
        for (unit_idx, unit) in self.units.iter().enumerate() {
            for (die_idx, die) in unit.dies.iter().enumerate() {
                if die.tag == DW_TAG_subprogram && die.name.as_deref() == Some(name) {
                    return Some(DieRef {
                        unit: unit_idx,
                        die: die_idx,
                    });
                }
            }
        }
        None
    }

    pub fn die(&self, r: DieRef) -> &Die {
        &self.units[r.unit].dies[r.die]
    }

    /// Demangled function name for a global address: DWARF first, then the
    /// symbol table.
    pub fn function_name_at(&self, pc: u64) -> Option<String> {
        if let Some(func) = self.find_function_by_pc(pc) {
            if let Some(name) = &self.die(func).name {
                return Some(rustc_demangle::demangle(name).to_string());
            }
        }
        let pos = match self
            .function_symbols
            .binary_search_by_key(&pc, |(addr, _)| *addr)
        {
            Ok(pos) => pos,
            Err(0) => return None,
            Err(pos) => pos - 1,
        };
        self.function_symbols
            .get(pos)
            .map(|(_, name)| rustc_demangle::demangle(name).to_string())
    }

    /// All statement-row addresses inside the ranges of a function.
    pub fn statement_addresses(&self, func: DieRef) -> Vec<u64> {
        let unit = &self.units[func.unit];
        let die = &unit.dies[func.die];
        let mut addresses = vec![];
        for range in &die.ranges {
            let from = unit
                .lines
                .partition_point(|row| row.address < range.begin);
            for row in unit.lines[from..]
                .iter()
                .take_while(|row| row.address < range.end)
            {
                if row.is_stmt {
                    addresses.push(row.address);
                }
            }
        }
        addresses.sort_unstable();
        addresses.dedup();
        addresses
    }

    /// Variables and formal parameters visible at `pc` inside a function.
    /// Lexical blocks are honored: a block that does not cover `pc` hides
    /// its variables.
    pub fn variables_in_scope(&self, func: DieRef, pc: u64, parameters_only: bool) -> Vec<DieRef> {
        let unit = &self.units[func.unit];
        let mut out = vec![];
        collect_scope_vars(unit, func.die, pc, parameters_only, &mut out);
        out.into_iter()
            .map(|die| DieRef {
                unit: func.unit,
                die,
            })
            .collect()
    }

    /// Top-level variables of the unit covering `pc`.
    pub fn globals_at(&self, pc: u64) -> Vec<DieRef> {
        let Some((unit_idx, unit)) = self.find_unit(pc) else {
            return vec![];
        };
        if unit.dies.is_empty() {
            return vec![];
        }
        unit.dies[0]
            .children
            .iter()
            .filter(|idx| unit.dies[**idx].tag == DW_TAG_variable)
            .map(|idx| DieRef {
                unit: unit_idx,
                die: *idx,
            })
            .collect()
    }
}

fn collect_scope_vars(
    unit: &ParsedUnit,
    die_idx: usize,
    pc: u64,
    parameters_only: bool,
    out: &mut Vec<usize>,
) {
    for &child in &unit.dies[die_idx].children {
        let die = &unit.dies[child];
        match die.tag {
            DW_TAG_formal_parameter => out.push(child),
            DW_TAG_variable if !parameters_only => out.push(child),
            DW_TAG_lexical_block => {
                let covers = die.ranges.is_empty()
                    || die.ranges.iter().any(|r| r.begin <= pc && pc < r.end);
                if covers {
                    collect_scope_vars(unit, child, pc, parameters_only, out);
                }
            }
            _ => {}
        }
    }
}

/// Does an indexed file path answer a breakpoint request for `requested`?
/// Exact match first; otherwise the trailing components must agree.
fn path_matches(candidate: &str, requested: &Path) -> bool {
    let candidate = Path::new(candidate);
    if candidate == requested {
        return true;
    }
    match (candidate.file_name(), requested.file_name()) {
        (Some(a), Some(b)) if a == b => {
            candidate.ends_with(requested) || requested.ends_with(candidate) || {
                // same file name and one path is relative to some build dir
                let tail: Vec<_> = requested.components().rev().take(2).collect();
                let candidate_tail: Vec<_> = candidate.components().rev().take(2).collect();
                tail == candidate_tail
            }
        }
        _ => false,
    }
}

fn collect_function_symbols(object: &object::File<'_>) -> Vec<(u64, String)> {
    let mut symbols: Vec<(u64, String)> = object
        .symbols()
        .filter(|s| s.kind() == SymbolKind::Text && s.address() != 0)
        .filter_map(|s| s.name().ok().map(|name| (s.address(), name.to_string())))
        .collect();
    symbols.sort_by_key(|(addr, _)| *addr);
    symbols.dedup_by_key(|(addr, _)| *addr);
    symbols
}

fn parse_units(dwarf: &gimli::Dwarf<EndianRcSlice>) -> Result<Vec<ParsedUnit>, Error> {
    dwarf
        .units()
        .map(|header| {
            let unit = dwarf.unit(header)?;

            let mut lines = vec![];
            let mut files = vec![];
            if let Some(ref line_program) = unit.line_program {
                let mut rows = line_program.clone().rows();
                lines = parse_lines(&mut rows)?;
                files = parse_files(dwarf, &unit, &rows)?;
            }
            lines.sort_by_key(|row| row.address);

            let mut unit_ranges = dwarf.unit_ranges(&unit)?.collect::<Vec<_>>()?;
            unit_ranges.sort_by_key(|r| r.begin);

            let mut dies: Vec<Die> = vec![];
            let mut die_ranges = vec![];
            let mut offsets = HashMap::new();
            let mut stack: Vec<usize> = vec![];
            let mut depth = 0isize;

            let mut cursor = unit.entries();
            while let Some((delta, die)) = cursor.next_dfs()? {
                depth += delta;
                stack.truncate(depth.max(0) as usize);
                let parent = stack.last().copied();

                let mut low_pc = None;
                if let Some(attr) = die.attr(DW_AT_low_pc)? {
                    match attr.value() {
                        AttributeValue::Addr(value) => low_pc = Some(value),
                        AttributeValue::DebugAddrIndex(index) => {
                            low_pc = Some(dwarf.address(&unit, index)?)
                        }
                        _ => {}
                    }
                }
                let mut high_pc = None;
                if let Some(attr) = die.attr(DW_AT_high_pc)? {
                    match attr.value() {
                        AttributeValue::Addr(value) => high_pc = Some(value),
                        AttributeValue::DebugAddrIndex(index) => {
                            high_pc = Some(dwarf.address(&unit, index)?)
                        }
                        AttributeValue::Udata(value) => {
                            high_pc = Some(low_pc.unwrap_or(0) + value)
                        }
                        _ => {}
                    }
                }

                let name = die
                    .attr(DW_AT_name)?
                    .and_then(|attr| dwarf.attr_string(&unit, attr.value()).ok())
                    .map(|s| s.to_string_lossy().map(|s| s.to_string()))
                    .transpose()?;

                let type_ref = match die.attr(DW_AT_type)?.map(|attr| attr.value()) {
                    Some(AttributeValue::UnitRef(offset)) => Some(offset),
                    _ => None,
                };

                let byte_size = die
                    .attr(DW_AT_byte_size)?
                    .and_then(|attr| attr.udata_value());
                let encoding = match die.attr(DW_AT_encoding)?.map(|attr| attr.value()) {
                    Some(AttributeValue::Encoding(ate)) => Some(ate),
                    _ => None,
                };
                let const_value = die.attr(DW_AT_const_value)?.and_then(|attr| {
                    attr.sdata_value()
                        .or_else(|| attr.udata_value().map(|v| v as i64))
                });
                let member_location = die.attr(DW_AT_data_member_location)?.and_then(|attr| {
                    attr.sdata_value()
                        .or_else(|| attr.udata_value().map(|v| v as i64))
                });
                let element_count = match (
                    die.attr(DW_AT_count)?.and_then(|a| a.udata_value()),
                    die.attr(DW_AT_upper_bound)?.and_then(|a| a.udata_value()),
                ) {
                    (Some(count), _) => Some(count),
                    (None, Some(upper)) => Some(upper + 1),
                    _ => None,
                };

                let mut ranges = vec![];
                dwarf.die_ranges(&unit, die)?.for_each(|r| {
                    ranges.push(r);
                    Ok(())
                })?;

                let die_idx = dies.len();
                for range in &ranges {
                    die_ranges.push(DieRange {
                        range: *range,
                        die_idx,
                    });
                }
                offsets.insert(die.offset(), die_idx);
                if let Some(parent) = parent {
                    dies[parent].children.push(die_idx);
                }

                dies.push(Die {
                    tag: die.tag(),
                    offset: die.offset(),
                    name,
                    low_pc,
                    high_pc,
                    ranges,
                    location: die.attr(DW_AT_location)?,
                    fb_addr: die.attr(DW_AT_frame_base)?,
                    type_ref,
                    byte_size,
                    encoding,
                    const_value,
                    member_location,
                    element_count,
                    parent,
                    children: vec![],
                });
                stack.push(die_idx);
            }
            die_ranges.sort_by_key(|dr| dr.range.begin);

            Ok(ParsedUnit {
                files,
                ranges: unit_ranges,
                lines,
                dies,
                die_ranges,
                offsets,
            })
        })
        .collect::<Vec<_>>()
        .map_err(Into::into)
}

fn parse_lines<R, Offset>(
    rows: &mut gimli::LineRows<R, gimli::IncompleteLineProgram<R, Offset>, Offset>,
) -> gimli::Result<Vec<LineRow>>
where
    R: gimli::Reader<Offset = Offset>,
    Offset: gimli::ReaderOffset,
{
    let mut lines = vec![];
    while let Some((_, line_row)) = rows.next_row()? {
        if line_row.end_sequence() {
            continue;
        }
        let column = match line_row.column() {
            gimli::ColumnType::LeftEdge => 0,
            gimli::ColumnType::Column(x) => x.get(),
        };
        lines.push(LineRow {
            address: line_row.address(),
            file_index: line_row.file_index(),
            line: line_row.line().map(NonZeroU64::get).unwrap_or(0),
            column,
            is_stmt: line_row.is_stmt(),
        })
    }
    Ok(lines)
}

fn parse_files<R, Offset>(
    dwarf: &gimli::Dwarf<R>,
    unit: &gimli::Unit<R>,
    rows: &gimli::LineRows<R, gimli::IncompleteLineProgram<R, Offset>, Offset>,
) -> gimli::Result<Vec<String>>
where
    R: gimli::Reader<Offset = Offset>,
    Offset: gimli::ReaderOffset,
{
    let mut files = vec![];
    let header = rows.header();
    match header.file(0) {
        Some(file) => files.push(render_file_path(unit, file, header, dwarf)?),
        None => files.push(String::from("")),
    }
    let mut index = 1;
    while let Some(file) = header.file(index) {
        files.push(render_file_path(unit, file, header, dwarf)?);
        index += 1;
    }
    Ok(files)
}

fn render_file_path<R: Reader>(
    dw_unit: &gimli::Unit<R>,
    file: &gimli::FileEntry<R, R::Offset>,
    header: &gimli::LineProgramHeader<R, R::Offset>,
    sections: &gimli::Dwarf<R>,
) -> Result<String, gimli::Error> {
    let mut path = if let Some(ref comp_dir) = dw_unit.comp_dir {
        comp_dir.to_string_lossy()?.into_owned()
    } else {
        String::new()
    };

    if file.directory_index() != 0 {
        if let Some(directory) = file.directory(header) {
            path_push(
                &mut path,
                sections
                    .attr_string(dw_unit, directory)?
                    .to_string_lossy()?
                    .as_ref(),
            );
        }
    }

    path_push(
        &mut path,
        sections
            .attr_string(dw_unit, file.path_name())?
            .to_string_lossy()?
            .as_ref(),
    );

    Ok(path)
}

fn path_push(path: &mut String, p: &str) {
    if p.starts_with('/') {
        *path = p.to_string();
    } else {
        let dir_separator = '/';
        if !path.is_empty() && !path.ends_with(dir_separator) {
            path.push(dir_separator);
        }
        *path += p;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_matching_accepts_suffix_forms() {
        assert!(path_matches("/p/fixtures/simple.c", Path::new("/p/fixtures/simple.c")));
        assert!(path_matches(
            "/build/checkout/fixtures/simple.c",
            Path::new("/p/fixtures/simple.c")
        ));
        assert!(!path_matches(
            "/p/fixtures/other.c",
            Path::new("/p/fixtures/simple.c")
        ));
        assert!(!path_matches(
            "/p/other/simple.c",
            Path::new("/p/fixtures/simple.c")
        ));
    }

    #[test]
    fn file_paths_compose_from_comp_dir() {
        let mut path = String::from("/home/build");
        path_push(&mut path, "src");
        path_push(&mut path, "main.c");
        assert_eq!(path, "/home/build/src/main.c");

        let mut absolute = String::from("/home/build");
        path_push(&mut absolute, "/abs/override.c");
        assert_eq!(absolute, "/abs/override.c");
    }
}
