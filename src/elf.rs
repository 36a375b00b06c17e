//! The ELF image: a memory-mapped executable and its symbol tables.
//!
//! An [`Elf`] owns the read-only mapping of one file for the life of the
//! debug session. Parsing happens once at open time: the header, the section
//! header table (honoring the extended-numbering rule for more than 0xff00
//! sections), a name → section map, and the symbol tables with both a
//! name-keyed multimap (mangled and demangled spellings) and an
//! address-range-keyed map for address → symbol queries.
//!
//! The image's load bias starts at zero and is set once via
//! [`Elf::notify_loaded`] after the process engine has computed where the
//! loader actually placed the image.

use std::cell::Cell;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use bytemuck::{Pod, Zeroable};
use memmap2::Mmap;
use tracing::debug;

use crate::addr::{FileAddr, VirtAddr};
use crate::errors::{DebuggerError, Result};

/// The ELF64 file header.
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
#[repr(C)]
pub struct Elf64Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// One ELF64 section header.
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
#[repr(C)]
pub struct Elf64Shdr {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

/// One ELF64 symbol table entry.
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
#[repr(C)]
pub struct Elf64Sym {
    pub st_name: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

pub const STT_FUNC: u8 = 2;
pub const STT_TLS: u8 = 6;

/// The type nibble of `st_info`.
pub fn elf64_st_type(st_info: u8) -> u8 {
    st_info & 0xf
}

/// A memory-mapped ELF64 image and its parsed tables.
pub struct Elf {
    path: PathBuf,
    data: Mmap,
    header: Elf64Ehdr,
    section_headers: Vec<Elf64Shdr>,
    section_map: HashMap<String, usize>,
    symbol_table: Vec<Elf64Sym>,
    symbol_name_map: HashMap<String, Vec<usize>>,
    // (start, end, symbol index), half-open ranges sorted by start
    symbol_addr_map: Vec<(u64, u64, usize)>,
    load_bias: Cell<VirtAddr>,
}

impl Elf {
    /// Maps and parses the file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Rc<Elf>> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        // the mapping is read-only and lives exactly as long as the image
        let data = unsafe { Mmap::map(&file) }?;

        let header_size = std::mem::size_of::<Elf64Ehdr>();
        if data.len() < header_size {
            return Err(DebuggerError::InvalidElf(format!(
                "{} is too small for an ELF header",
                path.display()
            )));
        }
        let header: Elf64Ehdr = bytemuck::pod_read_unaligned(&data[..header_size]);

        if header.e_ident[..4] != *b"\x7fELF" {
            return Err(DebuggerError::InvalidElf(format!(
                "{} carries no ELF magic",
                path.display()
            )));
        }
        if header.e_ident[4] != 2 || header.e_ident[5] != 1 {
            return Err(DebuggerError::InvalidElf(format!(
                "{} is not a little-endian 64-bit image",
                path.display()
            )));
        }

        let mut elf = Elf {
            path,
            data,
            header,
            section_headers: Vec::new(),
            section_map: HashMap::new(),
            symbol_table: Vec::new(),
            symbol_name_map: HashMap::new(),
            symbol_addr_map: Vec::new(),
            load_bias: Cell::new(VirtAddr::NULL),
        };

        elf.parse_section_headers()?;
        elf.build_section_map();
        elf.parse_symbol_table()?;
        elf.build_symbol_maps();

        debug!(
            "opened {} with {} sections and {} symbols",
            elf.path.display(),
            elf.section_headers.len(),
            elf.symbol_table.len()
        );
        Ok(Rc::new(elf))
    }

    fn parse_section_headers(&mut self) -> Result<()> {
        let entry_size = std::mem::size_of::<Elf64Shdr>();
        let mut count = self.header.e_shnum as u64;

        // extended numbering: a zero count stores the real one in the first
        // header's sh_size
        if count == 0 && self.header.e_shentsize != 0 {
            count = self.read_section_header(self.header.e_shoff as usize)?.sh_size;
        }

        let mut offset = self.header.e_shoff as usize;
        for _ in 0..count {
            self.section_headers.push(self.read_section_header(offset)?);
            offset += entry_size;
        }
        Ok(())
    }

    fn read_section_header(&self, offset: usize) -> Result<Elf64Shdr> {
        let end = offset + std::mem::size_of::<Elf64Shdr>();
        let bytes = self.data.get(offset..end).ok_or_else(|| {
            DebuggerError::InvalidElf(format!(
                "{} truncates its section header table",
                self.path.display()
            ))
        })?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    fn build_section_map(&mut self) {
        for index in 0..self.section_headers.len() {
            let name = self
                .get_section_name(self.section_headers[index].sh_name as usize)
                .to_string();
            self.section_map.insert(name, index);
        }
    }

    fn parse_symbol_table(&mut self) -> Result<()> {
        let Some(symtab) = self.get_section(".symtab").or_else(|| self.get_section(".dynsym"))
        else {
            return Ok(());
        };

        let entry_size = std::mem::size_of::<Elf64Sym>();
        if symtab.sh_entsize as usize != entry_size {
            return Err(DebuggerError::InvalidElf(format!(
                "{} has a symbol table with entry size {}",
                self.path.display(),
                symtab.sh_entsize
            )));
        }

        let start = symtab.sh_offset as usize;
        let end = start + symtab.sh_size as usize;
        let bytes = self.data.get(start..end).ok_or_else(|| {
            DebuggerError::InvalidElf(format!(
                "{} truncates its symbol table",
                self.path.display()
            ))
        })?;

        self.symbol_table = bytes
            .chunks_exact(entry_size)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        Ok(())
    }

    fn build_symbol_maps(&mut self) {
        for index in 0..self.symbol_table.len() {
            let symbol = self.symbol_table[index];
            let mangled = cstr_at(self.string_table(), symbol.st_name as usize).to_string();
            if !mangled.is_empty() {
                if let Some(demangled) = demangle(&mangled) {
                    self.symbol_name_map
                        .entry(demangled)
                        .or_default()
                        .push(index);
                }
                self.symbol_name_map.entry(mangled).or_default().push(index);
            }

            if symbol.st_value != 0
                && symbol.st_name != 0
                && elf64_st_type(symbol.st_info) != STT_TLS
            {
                self.symbol_addr_map.push((
                    symbol.st_value,
                    symbol.st_value + symbol.st_size,
                    index,
                ));
            }
        }
        self.symbol_addr_map.sort_unstable();
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &Elf64Ehdr {
        &self.header
    }

    pub fn section_headers(&self) -> &[Elf64Shdr] {
        &self.section_headers
    }

    pub fn load_bias(&self) -> VirtAddr {
        self.load_bias.get()
    }

    /// Records where the loader placed this image. Called once by the target
    /// after the tracee is up.
    pub fn notify_loaded(&self, address: VirtAddr) {
        self.load_bias.set(address);
    }

    /// The section name stored at `offset` in the section-header string
    /// table.
    pub fn get_section_name(&self, offset: usize) -> &str {
        let Some(shstrtab) = self.section_headers.get(self.header.e_shstrndx as usize) else {
            return "";
        };
        let start = shstrtab.sh_offset as usize;
        let end = start + shstrtab.sh_size as usize;
        match self.data.get(start..end) {
            Some(table) => cstr_at(table, offset),
            None => "",
        }
    }

    pub fn get_section(&self, name: &str) -> Option<&Elf64Shdr> {
        self.section_map
            .get(name)
            .map(|&index| &self.section_headers[index])
    }

    /// The raw bytes of a section, or the empty slice when the section does
    /// not exist.
    pub fn get_section_contents(&self, name: &str) -> &[u8] {
        match self.get_section(name) {
            Some(section) => {
                let start = section.sh_offset as usize;
                let end = start + section.sh_size as usize;
                self.data.get(start..end).unwrap_or(&[])
            }
            None => &[],
        }
    }

    /// A string from the symbol string table (`.strtab`, falling back to
    /// `.dynstr`).
    pub fn get_string(&self, index: usize) -> &str {
        cstr_at(self.string_table(), index)
    }

    fn string_table(&self) -> &[u8] {
        let section = self
            .get_section(".strtab")
            .or_else(|| self.get_section(".dynstr"));
        match section {
            Some(section) => {
                let start = section.sh_offset as usize;
                let end = start + section.sh_size as usize;
                self.data.get(start..end).unwrap_or(&[])
            }
            None => &[],
        }
    }

    pub fn get_section_start_address(self: &Rc<Self>, name: &str) -> Option<FileAddr> {
        self.get_section(name)
            .map(|section| FileAddr::new(self, section.sh_addr))
    }

    /// The section whose file-address range contains `addr`, if `addr`
    /// belongs to this image.
    pub fn section_containing_file_addr(&self, addr: &FileAddr) -> Option<&Elf64Shdr> {
        if !std::ptr::eq(Rc::as_ptr(addr.elf()), self) {
            return None;
        }
        self.section_headers.iter().find(|section| {
            section.sh_addr <= addr.addr() && addr.addr() < section.sh_addr + section.sh_size
        })
    }

    /// The section whose loaded range contains `addr`.
    pub fn section_containing_virt_addr(&self, addr: VirtAddr) -> Option<&Elf64Shdr> {
        let bias = self.load_bias.get().addr();
        self.section_headers.iter().find(|section| {
            section.sh_addr != 0
                && bias + section.sh_addr <= addr.addr()
                && addr.addr() < bias + section.sh_addr + section.sh_size
        })
    }

    /// All symbols under the given name, mangled or demangled.
    pub fn get_symbols_by_name(&self, name: &str) -> Vec<&Elf64Sym> {
        match self.symbol_name_map.get(name) {
            Some(indices) => indices.iter().map(|&i| &self.symbol_table[i]).collect(),
            None => Vec::new(),
        }
    }

    /// The symbol starting exactly at `address`.
    pub fn get_symbol_at_address(&self, address: &FileAddr) -> Option<&Elf64Sym> {
        if !std::ptr::eq(Rc::as_ptr(address.elf()), self) {
            return None;
        }
        let target = address.addr();
        let index = self
            .symbol_addr_map
            .partition_point(|&(start, _, _)| start < target);
        let &(start, _, symbol) = self.symbol_addr_map.get(index)?;
        (start == target).then(|| &self.symbol_table[symbol])
    }

    /// The symbol starting exactly at virtual address `address`.
    pub fn get_symbol_at_virt_addr(self: &Rc<Self>, address: VirtAddr) -> Option<&Elf64Sym> {
        let file_addr = address.to_file_addr(self)?;
        self.get_symbol_at_address(&file_addr)
    }

    /// The symbol whose `[start, end)` range contains `address`; ties go to
    /// the lowest start.
    pub fn get_symbol_containing_address(&self, address: &FileAddr) -> Option<&Elf64Sym> {
        if !std::ptr::eq(Rc::as_ptr(address.elf()), self) || self.symbol_addr_map.is_empty() {
            return None;
        }

        let target = address.addr();
        let index = self
            .symbol_addr_map
            .partition_point(|&(start, _, _)| start < target);

        if let Some(&(start, _, symbol)) = self.symbol_addr_map.get(index) {
            if start == target {
                return Some(&self.symbol_table[symbol]);
            }
        }

        let &(start, end, symbol) = self.symbol_addr_map.get(index.checked_sub(1)?)?;
        (start < target && target < end).then(|| &self.symbol_table[symbol])
    }

    /// The symbol whose loaded range contains virtual address `address`.
    pub fn get_symbol_containing_virt_addr(self: &Rc<Self>, address: VirtAddr) -> Option<&Elf64Sym> {
        let file_addr = address.to_file_addr(self)?;
        self.get_symbol_containing_address(&file_addr)
    }
}

impl std::fmt::Debug for Elf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Elf")
            .field("path", &self.path)
            .field("sections", &self.section_headers.len())
            .field("symbols", &self.symbol_table.len())
            .field("load_bias", &self.load_bias.get())
            .finish()
    }
}

/// The null-terminated string at `offset` inside `table`.
fn cstr_at(table: &[u8], offset: usize) -> &str {
    let Some(rest) = table.get(offset..) else {
        return "";
    };
    let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    std::str::from_utf8(&rest[..end]).unwrap_or("")
}

/// Demangles C++ (and Rust) symbol spellings; `None` when the name is not
/// mangled.
fn demangle(mangled: &str) -> Option<String> {
    if mangled.starts_with("_R") {
        let demangled = format!("{:#}", rustc_demangle::demangle(mangled));
        return (demangled != mangled).then_some(demangled);
    }

    if mangled.starts_with("_Z") {
        if let Ok(symbol) = cpp_demangle::Symbol::new(mangled.as_bytes()) {
            if let Ok(demangled) = symbol.demangle(&cpp_demangle::DemangleOptions::default()) {
                return Some(demangled);
            }
        }
        let demangled = format!("{:#}", rustc_demangle::demangle(mangled));
        return (demangled != mangled).then_some(demangled);
    }

    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_st_type_nibble() {
        assert_eq!(elf64_st_type(0x12), STT_FUNC);
        assert_eq!(elf64_st_type(0x26), STT_TLS);
    }

    #[test]
    fn test_cstr_at() {
        let table = b"\0hello\0world\0";
        assert_eq!(cstr_at(table, 1), "hello");
        assert_eq!(cstr_at(table, 7), "world");
        assert_eq!(cstr_at(table, 0), "");
        assert_eq!(cstr_at(table, 100), "");
    }

    #[test]
    fn test_demangle_spellings() {
        assert_eq!(
            demangle("_Z9find_seamiPKc").as_deref(),
            Some("find_seam(int, char const*)")
        );
        assert!(demangle("plain_c_symbol").is_none());
    }
}
