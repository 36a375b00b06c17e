//! A DWARF v4 reader over the image's debug sections.
//!
//! [`Dwarf`] enumerates compile units in `.debug_info`, parses abbreviation
//! tables out of `.debug_abbrev` lazily (memoized per table offset), and
//! yields [`Die`]s whose attribute values stay undecoded until asked for.
//! A DIE records only byte positions; the typed accessors on [`Attr`] decode
//! on demand, which keeps walking cheap.
//!
//! Only the 32-bit DWARF v4 flavour with 8-byte addresses is accepted.
//! The attribute/form/tag vocabulary comes from `gimli`'s constants.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::Range;
use std::rc::Rc;

use gimli::{
    DwAt, DwForm, DwTag, DW_AT_high_pc, DW_AT_low_pc, DW_AT_sibling, DW_FORM_addr, DW_FORM_block,
    DW_FORM_block1, DW_FORM_block2, DW_FORM_block4, DW_FORM_data1, DW_FORM_data2, DW_FORM_data4,
    DW_FORM_data8, DW_FORM_exprloc, DW_FORM_flag, DW_FORM_flag_present, DW_FORM_indirect,
    DW_FORM_ref1, DW_FORM_ref2, DW_FORM_ref4, DW_FORM_ref8, DW_FORM_ref_addr, DW_FORM_ref_udata,
    DW_FORM_sdata, DW_FORM_sec_offset, DW_FORM_string, DW_FORM_strp, DW_FORM_udata,
};

use crate::addr::FileAddr;
use crate::elf::Elf;
use crate::errors::{DebuggerError, Result};

/// One `(attribute, form)` pair of an abbreviation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrSpec {
    pub attr: DwAt,
    pub form: DwForm,
}

/// One abbreviation declaration.
#[derive(Debug)]
pub struct Abbrev {
    pub code: u64,
    pub tag: DwTag,
    pub has_children: bool,
    pub attr_specs: Vec<AttrSpec>,
}

/// An abbreviation table, keyed by abbreviation code.
pub type AbbrevTable = HashMap<u64, Rc<Abbrev>>;

/// One compile unit's slice of `.debug_info` (header included) and the
/// offset of its abbreviation table.
#[derive(Debug, Clone)]
pub struct CompileUnit {
    data: Range<usize>,
    abbrev_offset: usize,
}

impl CompileUnit {
    /// The unit's byte range within `.debug_info`.
    pub fn data(&self) -> Range<usize> {
        self.data.clone()
    }

    pub fn abbrev_offset(&self) -> usize {
        self.abbrev_offset
    }
}

/// A debugging information entry.
///
/// Holds its byte position, its compile unit, its abbreviation, the recorded
/// positions of its attribute values, and the position of the byte following
/// it. A null DIE (terminating a sibling list) has no abbreviation.
#[derive(Debug, Clone)]
pub struct Die {
    position: usize,
    cu_index: usize,
    abbrev: Option<Rc<Abbrev>>,
    attr_locs: Vec<usize>,
    next: usize,
}

impl Die {
    pub fn is_null(&self) -> bool {
        self.abbrev.is_none()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Position of the byte immediately following this DIE.
    pub fn next(&self) -> usize {
        self.next
    }

    pub fn cu_index(&self) -> usize {
        self.cu_index
    }

    pub fn abbrev(&self) -> Option<&Rc<Abbrev>> {
        self.abbrev.as_ref()
    }

    pub fn tag(&self) -> Option<DwTag> {
        self.abbrev.as_ref().map(|abbrev| abbrev.tag)
    }

    pub fn has_children(&self) -> bool {
        self.abbrev
            .as_ref()
            .is_some_and(|abbrev| abbrev.has_children)
    }

    /// Whether the DIE carries the given attribute.
    pub fn contains(&self, attribute: DwAt) -> bool {
        self.abbrev
            .as_ref()
            .is_some_and(|abbrev| abbrev.attr_specs.iter().any(|spec| spec.attr == attribute))
    }
}

impl PartialEq for Die {
    fn eq(&self, other: &Self) -> bool {
        let same_abbrev = match (&self.abbrev, &other.abbrev) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_abbrev && self.next == other.next
    }
}

/// The DWARF data of one ELF image.
pub struct Dwarf {
    elf: Rc<Elf>,
    compile_units: Vec<CompileUnit>,
    abbrev_tables: RefCell<HashMap<usize, Rc<AbbrevTable>>>,
}

impl Dwarf {
    /// Enumerates the compile units of `elf`'s `.debug_info`.
    pub fn new(elf: &Rc<Elf>) -> Result<Dwarf> {
        let mut dwarf = Dwarf {
            elf: Rc::clone(elf),
            compile_units: Vec::new(),
            abbrev_tables: RefCell::new(HashMap::new()),
        };
        dwarf.compile_units = parse_compile_units(&dwarf.elf)?;
        Ok(dwarf)
    }

    pub fn elf(&self) -> &Rc<Elf> {
        &self.elf
    }

    pub fn compile_units(&self) -> &[CompileUnit] {
        &self.compile_units
    }

    fn debug_info(&self) -> &[u8] {
        self.elf.get_section_contents(".debug_info")
    }

    /// The abbreviation table at `offset` in `.debug_abbrev`, parsed on
    /// first use.
    pub fn abbrev_table(&self, offset: usize) -> Result<Rc<AbbrevTable>> {
        if let Some(table) = self.abbrev_tables.borrow().get(&offset) {
            return Ok(Rc::clone(table));
        }

        let table = Rc::new(parse_abbrev_table(&self.elf, offset)?);
        self.abbrev_tables
            .borrow_mut()
            .insert(offset, Rc::clone(&table));
        Ok(table)
    }

    /// The root DIE of a compile unit.
    pub fn root(&self, cu_index: usize) -> Result<Die> {
        // the v4 unit header is 11 bytes
        let start = self.compile_units[cu_index].data.start + 11;
        self.parse_die(cu_index, start)
    }

    /// Parses the DIE at byte position `pos` of `.debug_info`.
    fn parse_die(&self, cu_index: usize, pos: usize) -> Result<Die> {
        let cu = &self.compile_units[cu_index];
        let mut cursor = Cursor::new(self.debug_info(), pos, cu.data.end);

        let position = cursor.position();
        let code = cursor.uleb128()?;
        if code == 0 {
            return Ok(Die {
                position,
                cu_index,
                abbrev: None,
                attr_locs: Vec::new(),
                next: cursor.position(),
            });
        }

        let table = self.abbrev_table(cu.abbrev_offset)?;
        let abbrev = table.get(&code).cloned().ok_or_else(|| {
            DebuggerError::InvalidDwarf(format!("no abbreviation carries code {code}"))
        })?;

        let mut attr_locs = Vec::with_capacity(abbrev.attr_specs.len());
        for spec in &abbrev.attr_specs {
            attr_locs.push(cursor.position());
            cursor.skip_form(spec.form)?;
        }

        Ok(Die {
            position,
            cu_index,
            abbrev: Some(abbrev),
            attr_locs,
            next: cursor.position(),
        })
    }

    /// The named attribute of `die`, ready for decoding.
    pub fn attr(&self, die: &Die, name: DwAt) -> Result<Attr<'_>> {
        let abbrev = die
            .abbrev
            .as_ref()
            .ok_or(DebuggerError::AttributeDoesNotExist(name))?;
        let index = abbrev
            .attr_specs
            .iter()
            .position(|spec| spec.attr == name)
            .ok_or(DebuggerError::AttributeDoesNotExist(name))?;

        Ok(Attr {
            dwarf: self,
            cu_index: die.cu_index,
            name,
            form: abbrev.attr_specs[index].form,
            location: die.attr_locs[index],
        })
    }

    /// `DW_AT_low_pc` as a file address.
    pub fn low_pc(&self, die: &Die) -> Result<FileAddr> {
        self.attr(die, DW_AT_low_pc)?.as_address()
    }

    /// `DW_AT_high_pc`, either an absolute address or an offset from
    /// `low_pc`.
    pub fn high_pc(&self, die: &Die) -> Result<FileAddr> {
        let attr = self.attr(die, DW_AT_high_pc)?;
        if attr.form() == DW_FORM_addr {
            attr.as_address()
        } else {
            Ok(self.low_pc(die)? + attr.as_int()?)
        }
    }

    /// Iterates the direct children of `die`, ending at the null DIE that
    /// terminates the sibling list.
    pub fn children(&self, die: &Die) -> DieChildren<'_> {
        let current = if die.has_children() {
            Some(self.parse_die(die.cu_index, die.next))
        } else {
            None
        };
        DieChildren {
            dwarf: self,
            current,
        }
    }

    /// The byte position immediately after `die`'s whole subtree, i.e. after
    /// the null DIE terminating its children.
    pub fn position_after_subtree(&self, die: &Die) -> Result<usize> {
        if !die.has_children() {
            return Ok(die.next);
        }

        let mut pos = die.next;
        loop {
            let child = self.parse_die(die.cu_index, pos)?;
            if child.is_null() {
                return Ok(child.next);
            }
            pos = if !child.has_children() {
                child.next
            } else if child.contains(DW_AT_sibling) {
                self.attr(&child, DW_AT_sibling)?.as_reference()?.position
            } else {
                self.position_after_subtree(&child)?
            };
        }
    }

    fn cu_containing(&self, pos: usize) -> Option<usize> {
        self.compile_units
            .iter()
            .position(|cu| cu.data.start <= pos && pos < cu.data.end)
    }
}

impl std::fmt::Debug for Dwarf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dwarf")
            .field("path", &self.elf.path())
            .field("compile_units", &self.compile_units.len())
            .finish()
    }
}

/// Iterator over the direct children of a DIE.
pub struct DieChildren<'dw> {
    dwarf: &'dw Dwarf,
    current: Option<Result<Die>>,
}

impl DieChildren<'_> {
    fn advance(&self, die: &Die) -> Result<Die> {
        if !die.has_children() {
            self.dwarf.parse_die(die.cu_index, die.next)
        } else if die.contains(DW_AT_sibling) {
            self.dwarf.attr(die, DW_AT_sibling)?.as_reference()
        } else {
            let after = self.dwarf.position_after_subtree(die)?;
            self.dwarf.parse_die(die.cu_index, after)
        }
    }
}

impl Iterator for DieChildren<'_> {
    type Item = Result<Die>;

    fn next(&mut self) -> Option<Self::Item> {
        let die = match self.current.take()? {
            Ok(die) => die,
            Err(error) => return Some(Err(error)),
        };
        if die.is_null() {
            return None;
        }
        self.current = Some(self.advance(&die));
        Some(Ok(die))
    }
}

/// One attribute of a DIE, decoded lazily from its recorded position.
pub struct Attr<'dw> {
    dwarf: &'dw Dwarf,
    cu_index: usize,
    name: DwAt,
    form: DwForm,
    location: usize,
}

impl std::fmt::Debug for Attr<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attr")
            .field("cu_index", &self.cu_index)
            .field("name", &self.name)
            .field("form", &self.form)
            .field("location", &self.location)
            .finish()
    }
}

impl<'dw> Attr<'dw> {
    pub fn name(&self) -> DwAt {
        self.name
    }

    pub fn form(&self) -> DwForm {
        self.form
    }

    fn cursor(&self) -> Cursor<'dw> {
        let end = self.dwarf.compile_units[self.cu_index].data.end;
        Cursor::new(self.dwarf.debug_info(), self.location, end)
    }

    /// Decodes a `DW_FORM_addr` value.
    pub fn as_address(&self) -> Result<FileAddr> {
        if self.form != DW_FORM_addr {
            return Err(DebuggerError::InvalidDwarf(format!(
                "attribute {} is no address",
                self.name
            )));
        }
        Ok(FileAddr::new(self.dwarf.elf(), self.cursor().u64()?))
    }

    /// Decodes a `DW_FORM_sec_offset` value.
    pub fn as_section_offset(&self) -> Result<u32> {
        if self.form != DW_FORM_sec_offset {
            return Err(DebuggerError::InvalidDwarf(format!(
                "attribute {} is no section offset",
                self.name
            )));
        }
        self.cursor().u32()
    }

    /// Decodes the constant data forms.
    pub fn as_int(&self) -> Result<u64> {
        let mut cursor = self.cursor();
        match self.form {
            DW_FORM_data1 => Ok(u64::from(cursor.u8()?)),
            DW_FORM_data2 => Ok(u64::from(cursor.u16()?)),
            DW_FORM_data4 => Ok(u64::from(cursor.u32()?)),
            DW_FORM_data8 => cursor.u64(),
            DW_FORM_udata => cursor.uleb128(),
            form => Err(DebuggerError::InvalidDwarf(format!(
                "attribute {} of form {form} is no integer",
                self.name
            ))),
        }
    }

    /// The inline span of a block form (`block*`, `exprloc`), undecoded.
    pub fn as_block(&self) -> Result<&'dw [u8]> {
        let mut cursor = self.cursor();
        let size = match self.form {
            DW_FORM_block1 => usize::from(cursor.u8()?),
            DW_FORM_block2 => usize::from(cursor.u16()?),
            DW_FORM_block4 => cursor.u32()? as usize,
            DW_FORM_block | DW_FORM_exprloc => cursor.uleb128()? as usize,
            form => {
                return Err(DebuggerError::InvalidDwarf(format!(
                    "attribute {} of form {form} is no block",
                    self.name
                )))
            }
        };
        cursor.take(size)
    }

    /// An inline string or a `DW_FORM_strp` indirection into `.debug_str`.
    pub fn as_string(&self) -> Result<&'dw str> {
        let mut cursor = self.cursor();
        match self.form {
            DW_FORM_string => cursor.string(),
            DW_FORM_strp => {
                let offset = cursor.u32()? as usize;
                let strings = self.dwarf.elf.get_section_contents(".debug_str");
                let mut string_cursor = Cursor::new(strings, offset, strings.len());
                string_cursor.string()
            }
            form => Err(DebuggerError::InvalidDwarf(format!(
                "attribute {} of form {form} is no string",
                self.name
            ))),
        }
    }

    /// Resolves a reference form to its DIE. `ref*` forms resolve within the
    /// compile unit; `ref_addr` resolves across units.
    pub fn as_reference(&self) -> Result<Die> {
        let mut cursor = self.cursor();
        let offset = match self.form {
            DW_FORM_ref1 => u64::from(cursor.u8()?),
            DW_FORM_ref2 => u64::from(cursor.u16()?),
            DW_FORM_ref4 => u64::from(cursor.u32()?),
            DW_FORM_ref8 => cursor.u64()?,
            DW_FORM_ref_udata => cursor.uleb128()?,
            DW_FORM_ref_addr => {
                let pos = cursor.u32()? as usize;
                let cu_index = self.dwarf.cu_containing(pos).ok_or_else(|| {
                    DebuggerError::InvalidDwarf(format!(
                        "reference target {pos:#x} is outside every compile unit"
                    ))
                })?;
                return self.dwarf.parse_die(cu_index, pos);
            }
            form => {
                return Err(DebuggerError::InvalidDwarf(format!(
                    "attribute {} of form {form} is no reference",
                    self.name
                )))
            }
        };

        let cu_start = self.dwarf.compile_units[self.cu_index].data.start;
        self.dwarf.parse_die(self.cu_index, cu_start + offset as usize)
    }
}

/// Byte cursor over a debug section with an exclusive bound.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8], pos: usize, end: usize) -> Self {
        Cursor {
            data,
            pos,
            end: end.min(data.len()),
        }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn finished(&self) -> bool {
        self.pos >= self.end
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        let end = self.pos + count;
        if end > self.end {
            return Err(truncated());
        }
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn uleb128(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0;
        loop {
            let byte = self.u8()?;
            result |= u64::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
    }

    fn sleb128(&mut self) -> Result<i64> {
        let mut result = 0u64;
        let mut shift = 0;
        let mut byte;
        loop {
            byte = self.u8()?;
            result |= u64::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                break;
            }
        }
        if shift < 64 && byte & 0x40 != 0 {
            result |= !0u64 << shift;
        }
        Ok(result as i64)
    }

    /// A null-terminated string starting at the cursor.
    fn string(&mut self) -> Result<&'a str> {
        let rest = &self.data[self.pos..self.end];
        let nul = rest.iter().position(|&b| b == 0).ok_or_else(truncated)?;
        self.pos += nul + 1;
        std::str::from_utf8(&rest[..nul])
            .map_err(|_| DebuggerError::InvalidDwarf("string is not UTF-8".into()))
    }

    /// Skips one attribute value of the given form.
    fn skip_form(&mut self, form: DwForm) -> Result<()> {
        match form {
            DW_FORM_flag_present => {}
            DW_FORM_data1 | DW_FORM_ref1 | DW_FORM_flag => {
                self.take(1)?;
            }
            DW_FORM_data2 | DW_FORM_ref2 => {
                self.take(2)?;
            }
            DW_FORM_data4 | DW_FORM_ref4 | DW_FORM_ref_addr | DW_FORM_sec_offset
            | DW_FORM_strp => {
                self.take(4)?;
            }
            DW_FORM_data8 | DW_FORM_addr | DW_FORM_ref8 => {
                self.take(8)?;
            }
            DW_FORM_sdata => {
                self.sleb128()?;
            }
            DW_FORM_udata | DW_FORM_ref_udata => {
                self.uleb128()?;
            }
            DW_FORM_block1 => {
                let size = usize::from(self.u8()?);
                self.take(size)?;
            }
            DW_FORM_block2 => {
                let size = usize::from(self.u16()?);
                self.take(size)?;
            }
            DW_FORM_block4 => {
                let size = self.u32()? as usize;
                self.take(size)?;
            }
            DW_FORM_block | DW_FORM_exprloc => {
                let size = self.uleb128()? as usize;
                self.take(size)?;
            }
            DW_FORM_string => {
                self.string()?;
            }
            DW_FORM_indirect => {
                let real = self.uleb128()?;
                self.skip_form(DwForm(real as u16))?;
            }
            other => {
                return Err(DebuggerError::InvalidDwarf(format!(
                    "unrecognized DWARF form {other}"
                )))
            }
        }
        Ok(())
    }
}

fn truncated() -> DebuggerError {
    DebuggerError::InvalidDwarf("data ends mid-value".into())
}

fn parse_compile_units(elf: &Rc<Elf>) -> Result<Vec<CompileUnit>> {
    let info = elf.get_section_contents(".debug_info");
    let mut units = Vec::new();
    let mut cursor = Cursor::new(info, 0, info.len());

    while !cursor.finished() {
        let start = cursor.position();
        let size = cursor.u32()?;
        let version = cursor.u16()?;
        let abbrev_offset = cursor.u32()?;
        let address_size = cursor.u8()?;

        if size == 0xffff_ffff {
            return Err(DebuggerError::UnsupportedDwarf(
                "only 32-bit DWARF is supported".into(),
            ));
        }
        if version != 4 {
            return Err(DebuggerError::UnsupportedDwarf(format!(
                "only DWARF version 4 is supported, found {version}"
            )));
        }
        if address_size != 8 {
            return Err(DebuggerError::UnsupportedDwarf(format!(
                "only 8-byte addresses are supported, found {address_size}"
            )));
        }

        let end = start + size as usize + 4;
        if size < 7 || end > info.len() {
            return Err(truncated());
        }
        units.push(CompileUnit {
            data: start..end,
            abbrev_offset: abbrev_offset as usize,
        });
        cursor = Cursor::new(info, end, info.len());
    }

    Ok(units)
}

fn parse_abbrev_table(elf: &Rc<Elf>, offset: usize) -> Result<AbbrevTable> {
    let section = elf.get_section_contents(".debug_abbrev");
    let mut cursor = Cursor::new(section, offset, section.len());

    let mut table = AbbrevTable::new();
    loop {
        let code = cursor.uleb128()?;
        if code == 0 {
            break;
        }
        let tag = cursor.uleb128()?;
        let has_children = cursor.u8()? != 0;

        let mut attr_specs = Vec::new();
        loop {
            let attr = cursor.uleb128()?;
            let form = cursor.uleb128()?;
            if attr == 0 {
                break;
            }
            attr_specs.push(AttrSpec {
                attr: DwAt(attr as u16),
                form: DwForm(form as u16),
            });
        }

        table.insert(
            code,
            Rc::new(Abbrev {
                code,
                tag: DwTag(tag as u16),
                has_children,
                attr_specs,
            }),
        );
    }

    Ok(table)
}

#[cfg(test)]
mod test {
    use super::*;

    fn cursor(bytes: &[u8]) -> Cursor<'_> {
        Cursor::new(bytes, 0, bytes.len())
    }

    #[test]
    fn test_uleb128() {
        assert_eq!(cursor(&[0x00]).uleb128().unwrap(), 0);
        assert_eq!(cursor(&[0x7f]).uleb128().unwrap(), 127);
        assert_eq!(cursor(&[0xe5, 0x8e, 0x26]).uleb128().unwrap(), 624485);
    }

    #[test]
    fn test_sleb128() {
        assert_eq!(cursor(&[0x7f]).sleb128().unwrap(), -1);
        assert_eq!(cursor(&[0xc0, 0xbb, 0x78]).sleb128().unwrap(), -123456);
        assert_eq!(cursor(&[0x3f]).sleb128().unwrap(), 63);
    }

    #[test]
    fn test_fixed_reads_are_little_endian() {
        let mut c = cursor(&[0x34, 0x12, 0x78, 0x56]);
        assert_eq!(c.u16().unwrap(), 0x1234);
        assert_eq!(c.u16().unwrap(), 0x5678);
        assert!(c.finished());
        assert!(c.u8().is_err());
    }

    #[test]
    fn test_skip_form_sizes() {
        let bytes = [0u8; 16];
        for (form, expected) in [
            (DW_FORM_flag_present, 0),
            (DW_FORM_data1, 1),
            (DW_FORM_ref2, 2),
            (DW_FORM_strp, 4),
            (DW_FORM_addr, 8),
        ] {
            let mut c = cursor(&bytes);
            c.skip_form(form).unwrap();
            assert_eq!(c.position(), expected, "{form}");
        }

        // block1: one length byte plus that many content bytes
        let mut c = cursor(&[3, 9, 9, 9, 0xaa]);
        c.skip_form(DW_FORM_block1).unwrap();
        assert_eq!(c.position(), 4);

        // inline string: bytes through the terminator
        let mut c = cursor(b"ore\0rest");
        c.skip_form(DW_FORM_string).unwrap();
        assert_eq!(c.position(), 4);

        // indirect: the real form follows as ULEB
        let mut c = cursor(&[DW_FORM_data2.0 as u8, 1, 2, 3]);
        c.skip_form(DW_FORM_indirect).unwrap();
        assert_eq!(c.position(), 3);

        let mut c = cursor(&bytes);
        assert!(c.skip_form(DwForm(0x7777)).is_err());
    }
}
