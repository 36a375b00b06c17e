//! Shared fixtures for the integration tests: a synthetic ELF64 image
//! builder and a hand-assembled DWARF v4 compile-unit pair.
#![allow(dead_code)]

use std::io::Write;
use std::path::PathBuf;

use bytemuck::bytes_of;
use tempfile::NamedTempFile;

use pickaxe::elf::{Elf64Ehdr, Elf64Shdr, Elf64Sym};

pub const SHT_PROGBITS: u32 = 1;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;

/// Assembles a minimal but well-formed ELF64 image on disk.
///
/// The layout is: header, section contents in declaration order, section
/// header table. A null section, `.symtab`, `.strtab` and `.shstrtab` are
/// added automatically.
pub struct ElfFixture {
    entry: u64,
    sections: Vec<(String, u32, u64, Vec<u8>)>,
    symbols: Vec<(String, u8, u64, u64)>,
}

impl ElfFixture {
    pub fn new() -> Self {
        ElfFixture {
            entry: 0x401000,
            sections: Vec::new(),
            symbols: Vec::new(),
        }
    }

    pub fn entry(mut self, entry: u64) -> Self {
        self.entry = entry;
        self
    }

    pub fn section(mut self, name: &str, sh_type: u32, addr: u64, data: Vec<u8>) -> Self {
        self.sections.push((name.to_string(), sh_type, addr, data));
        self
    }

    /// Adds a symbol placed in the first declared section.
    pub fn symbol(mut self, name: &str, info: u8, value: u64, size: u64) -> Self {
        self.symbols.push((name.to_string(), info, value, size));
        self
    }

    pub fn build(self) -> NamedTempFile {
        // symbol string table, starting with the empty string
        let mut strtab = vec![0u8];
        let mut symbols = vec![Elf64Sym {
            st_name: 0,
            st_info: 0,
            st_other: 0,
            st_shndx: 0,
            st_value: 0,
            st_size: 0,
        }];
        for (name, info, value, size) in &self.symbols {
            let st_name = strtab.len() as u32;
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
            symbols.push(Elf64Sym {
                st_name,
                st_info: *info,
                st_other: 0,
                st_shndx: 1,
                st_value: *value,
                st_size: *size,
            });
        }
        let mut symtab = Vec::new();
        for symbol in &symbols {
            symtab.extend_from_slice(bytes_of(symbol));
        }

        // final section list: null, user sections, symtab, strtab, shstrtab
        let mut sections: Vec<(String, u32, u64, Vec<u8>, u32, u64)> =
            vec![(String::new(), 0, 0, Vec::new(), 0, 0)];
        for (name, sh_type, addr, data) in self.sections {
            sections.push((name, sh_type, addr, data, 0, 0));
        }
        let strtab_index = sections.len() as u32 + 1;
        sections.push((
            ".symtab".to_string(),
            SHT_SYMTAB,
            0,
            symtab,
            strtab_index,
            std::mem::size_of::<Elf64Sym>() as u64,
        ));
        sections.push((".strtab".to_string(), SHT_STRTAB, 0, strtab, 0, 0));
        sections.push((".shstrtab".to_string(), SHT_STRTAB, 0, Vec::new(), 0, 0));

        // section-name string table, filled in after all names are known
        let mut shstrtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for (name, ..) in &sections {
            if name.is_empty() {
                name_offsets.push(0);
            } else {
                name_offsets.push(shstrtab.len() as u32);
                shstrtab.extend_from_slice(name.as_bytes());
                shstrtab.push(0);
            }
        }
        let shstrtab_index = sections.len() - 1;
        sections[shstrtab_index].3 = shstrtab;

        // lay out contents after the header, headers after the contents
        let header_size = std::mem::size_of::<Elf64Ehdr>() as u64;
        let mut offset = header_size;
        let mut headers = Vec::new();
        for (index, (_, sh_type, addr, data, link, entsize)) in sections.iter().enumerate() {
            headers.push(Elf64Shdr {
                sh_name: name_offsets[index],
                sh_type: *sh_type,
                sh_flags: 0,
                sh_addr: *addr,
                sh_offset: offset,
                sh_size: data.len() as u64,
                sh_link: *link,
                sh_info: 0,
                sh_addralign: 1,
                sh_entsize: *entsize,
            });
            offset += data.len() as u64;
        }

        let header = Elf64Ehdr {
            e_ident: [
                0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            ],
            e_type: 2,
            e_machine: 62,
            e_version: 1,
            e_entry: self.entry,
            e_phoff: 0,
            e_shoff: offset,
            e_flags: 0,
            e_ehsize: header_size as u16,
            e_phentsize: 0,
            e_phnum: 0,
            e_shentsize: std::mem::size_of::<Elf64Shdr>() as u16,
            e_shnum: sections.len() as u16,
            e_shstrndx: shstrtab_index as u16,
        };

        let mut file = NamedTempFile::new().expect("could not create fixture file");
        file.write_all(bytes_of(&header)).unwrap();
        for (.., data, _, _) in &sections {
            file.write_all(data).unwrap();
        }
        for shdr in &headers {
            file.write_all(bytes_of(shdr)).unwrap();
        }
        file.flush().unwrap();
        file
    }
}

/// Hand-assembled DWARF v4 sections with two compile units.
///
/// Unit one describes `deep_mine.c`:
///
/// ```text
/// compile_unit "deep_mine.c"
/// ├── subprogram "extract"        [0x401000, +0x10)
/// ├── lexical_block @0x401000
/// │   └── subprogram "refine"     [0x401010, +0x10)
/// ├── subprogram "smelt"          (has children and a sibling link)
/// │   └── subprogram "assay"      [0x401020, +0x8)
/// └── subprogram "hoist"          [0x401030, +0x8)
/// ```
///
/// Unit two (`smelter.c`) holds one subprogram whose abstract origin refers
/// across units to `extract` via `DW_FORM_ref_addr`.
pub struct DwarfFixture {
    pub abbrev: Vec<u8>,
    pub info: Vec<u8>,
    pub strings: Vec<u8>,
    /// Section offset of the `extract` DIE (also its offset in unit one).
    pub extract_offset: usize,
}

pub fn dwarf_fixture() -> DwarfFixture {
    let mut strings = vec![0u8];
    let extract = push_str(&mut strings, "extract");
    let refine = push_str(&mut strings, "refine");
    let smelt = push_str(&mut strings, "smelt");
    let assay = push_str(&mut strings, "assay");
    let hoist = push_str(&mut strings, "hoist");

    #[rustfmt::skip]
    let abbrev = vec![
        // 1: compile_unit, has children; name as inline string
        0x01, 0x11, 0x01,  0x03, 0x08,  0x00, 0x00,
        // 2: subprogram, leaf; name strp, low_pc addr, high_pc data8
        0x02, 0x2e, 0x00,  0x03, 0x0e,  0x11, 0x01,  0x12, 0x07,  0x00, 0x00,
        // 3: lexical_block, has children; low_pc addr
        0x03, 0x0b, 0x01,  0x11, 0x01,  0x00, 0x00,
        // 4: subprogram, has children; sibling ref4, name strp
        0x04, 0x2e, 0x01,  0x01, 0x13,  0x03, 0x0e,  0x00, 0x00,
        // 5: subprogram, leaf; abstract_origin ref_addr, name strp
        0x05, 0x2e, 0x00,  0x31, 0x10,  0x03, 0x0e,  0x00, 0x00,
        0x00,
    ];

    let mut info = Vec::new();

    // ---- unit one -------------------------------------------------------
    let unit_start = info.len();
    info.extend_from_slice(&[0; 4]); // length, patched below
    info.extend_from_slice(&4u16.to_le_bytes());
    info.extend_from_slice(&0u32.to_le_bytes());
    info.push(8);

    info.push(1);
    info.extend_from_slice(b"deep_mine.c\0");

    let extract_offset = info.len();
    info.push(2);
    info.extend_from_slice(&extract.to_le_bytes());
    info.extend_from_slice(&0x401000u64.to_le_bytes());
    info.extend_from_slice(&0x10u64.to_le_bytes());

    info.push(3);
    info.extend_from_slice(&0x401000u64.to_le_bytes());
    {
        info.push(2);
        info.extend_from_slice(&refine.to_le_bytes());
        info.extend_from_slice(&0x401010u64.to_le_bytes());
        info.extend_from_slice(&0x10u64.to_le_bytes());
        info.push(0);
    }

    info.push(4);
    let sibling_patch = info.len();
    info.extend_from_slice(&[0; 4]);
    info.extend_from_slice(&smelt.to_le_bytes());
    {
        info.push(2);
        info.extend_from_slice(&assay.to_le_bytes());
        info.extend_from_slice(&0x401020u64.to_le_bytes());
        info.extend_from_slice(&0x8u64.to_le_bytes());
        info.push(0);
    }

    let hoist_offset = info.len() as u32;
    info[sibling_patch..sibling_patch + 4].copy_from_slice(&hoist_offset.to_le_bytes());
    info.push(2);
    info.extend_from_slice(&hoist.to_le_bytes());
    info.extend_from_slice(&0x401030u64.to_le_bytes());
    info.extend_from_slice(&0x8u64.to_le_bytes());

    info.push(0); // end of the root's children
    patch_unit_length(&mut info, unit_start);

    // ---- unit two -------------------------------------------------------
    let unit_start = info.len();
    info.extend_from_slice(&[0; 4]);
    info.extend_from_slice(&4u16.to_le_bytes());
    info.extend_from_slice(&0u32.to_le_bytes());
    info.push(8);

    info.push(1);
    info.extend_from_slice(b"smelter.c\0");

    info.push(5);
    info.extend_from_slice(&(extract_offset as u32).to_le_bytes());
    info.extend_from_slice(&smelt.to_le_bytes());

    info.push(0);
    patch_unit_length(&mut info, unit_start);

    DwarfFixture {
        abbrev,
        info,
        strings,
        extract_offset,
    }
}

fn push_str(table: &mut Vec<u8>, text: &str) -> u32 {
    let offset = table.len() as u32;
    table.extend_from_slice(text.as_bytes());
    table.push(0);
    offset
}

fn patch_unit_length(info: &mut [u8], unit_start: usize) {
    let length = (info.len() - unit_start - 4) as u32;
    info[unit_start..unit_start + 4].copy_from_slice(&length.to_le_bytes());
}

/// Resolves a program name through `PATH`, the way `execvp` would.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
