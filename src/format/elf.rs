//! ELF64 encoder.
//!
//! File layout:
//! - ELF header
//! - one `PT_LOAD` program header per segment
//! - zero padding up to the page-aligned data area
//! - section payloads in file order
//! - section name string table
//! - section headers: null, one per section, string table

use std::io::Write;

use object::elf;
use object::endian::{U16, U32, U64};
use object::pod::bytes_of;
use object::Endianness;

use super::{check_bytecode, write_payload, Counting, Encoder};
use crate::error::{Error, Result};
use crate::image::Image;
use crate::layout::{Section, SectionKind, Segment};
use crate::utils::align_up;

const EHDR_SIZE: u64 = 64;
const PHDR_SIZE: u64 = 56;
const SHDR_SIZE: u64 = 64;

/// Section names, indexed by offset.
const SHSTRTAB: &[u8] = b"\0.text\0.data\0.bss\0.rodata\0.shstrtab\0";
const NAME_TEXT: u32 = 1;
const NAME_DATA: u32 = 7;
const NAME_BSS: u32 = 13;
const NAME_RODATA: u32 = 18;
const NAME_SHSTRTAB: u32 = 26;

fn u16(v: u16) -> U16<Endianness> {
    U16::new(Endianness::Little, v)
}
fn u32(v: u32) -> U32<Endianness> {
    U32::new(Endianness::Little, v)
}
fn u64(v: u64) -> U64<Endianness> {
    U64::new(Endianness::Little, v)
}

/// The ELF64 (x86-64 Linux) encoder.
#[derive(Debug, Clone, Default)]
pub struct Elf {
    expected_entry: Option<u64>,
}

impl Elf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuses to write images whose entry point is not `entry`.
    pub fn with_entry(entry: u64) -> Self {
        Self { expected_entry: Some(entry) }
    }

    fn section_table_offset(&self, image: &Image) -> u64 {
        let data_end = self.data_start(image) + image.file_size();
        align_up(data_end + SHSTRTAB.len() as u64, 8)
    }
}

fn segment_flags(segment: &Segment) -> u32 {
    let prot = segment.kind.protection();
    let mut flags = 0;
    if prot.read {
        flags |= elf::PF_R;
    }
    if prot.write {
        flags |= elf::PF_W;
    }
    if prot.execute {
        flags |= elf::PF_X;
    }
    flags
}

/// Name offset, `sh_type` and `sh_flags` for a section.
fn section_attributes(section: &Section) -> (u32, u32, u32) {
    if !section.occupies_file() {
        return (NAME_BSS, elf::SHT_NOBITS, elf::SHF_ALLOC | elf::SHF_WRITE);
    }
    match section.kind {
        SectionKind::Data | SectionKind::Bytecode => (NAME_DATA, elf::SHT_PROGBITS, elf::SHF_ALLOC | elf::SHF_WRITE),
        SectionKind::Text | SectionKind::Code => (NAME_TEXT, elf::SHT_PROGBITS, elf::SHF_ALLOC | elf::SHF_EXECINSTR),
        SectionKind::Const => (NAME_RODATA, elf::SHT_PROGBITS, elf::SHF_ALLOC),
        SectionKind::Bss => (NAME_BSS, elf::SHT_NOBITS, elf::SHF_ALLOC | elf::SHF_WRITE),
    }
}

impl Encoder for Elf {
    fn name(&self) -> &'static str {
        "ELF"
    }

    fn header_size(&self, image: &Image) -> u64 {
        EHDR_SIZE + PHDR_SIZE * image.num_segments() as u64
    }

    fn write(&self, out: &mut dyn Write, image: &Image, bytecode: &[u8]) -> Result<()> {
        if let Some(entry) = self.expected_entry {
            if image.vm_entry_point() != entry {
                return Err(Error::invalid(format!(
                    "entry point 0x{:x} is not at 0x{:x}",
                    image.vm_entry_point(), entry
                )));
            }
        }
        check_bytecode(image, bytecode)?;

        let phnum = u16::try_from(image.num_segments())
            .map_err(|_| Error::invalid("too many segments for ELF"))?;
        let shnum = u16::try_from(image.num_sections() + 2)
            .ok()
            .filter(|&n| n < elf::SHN_LORESERVE)
            .ok_or_else(|| Error::invalid("too many sections for ELF"))?;

        let data_start = self.data_start(image);
        let data_end = data_start + image.file_size();
        let shoff = self.section_table_offset(image);

        let mut out = Counting::new(out);

        // ELF file header
        let file_header = elf::FileHeader64::<Endianness> {
            e_ident: elf::Ident {
                magic: elf::ELFMAG,
                class: elf::ELFCLASS64,
                data: elf::ELFDATA2LSB,
                version: elf::EV_CURRENT,
                os_abi: elf::ELFOSABI_SYSV,
                abi_version: 0,
                padding: [0; 7],
            },
            e_type: u16(elf::ET_EXEC),
            e_machine: u16(elf::EM_X86_64),
            e_version: u32(elf::EV_CURRENT as u32),
            e_entry: u64(image.vm_entry_point()),
            e_phoff: u64(EHDR_SIZE),
            e_shoff: u64(shoff),
            e_flags: u32(0),
            e_ehsize: u16(EHDR_SIZE as u16),
            e_phentsize: u16(PHDR_SIZE as u16),
            e_phnum: u16(phnum),
            e_shentsize: u16(SHDR_SIZE as u16),
            e_shnum: u16(shnum),
            e_shstrndx: u16(shnum - 1),
        };
        out.write_all(bytes_of(&file_header))?;

        // One LOAD program header per segment
        for segment in image.segments() {
            let prog_header = elf::ProgramHeader64::<Endianness> {
                p_type: u32(elf::PT_LOAD),
                p_flags: u32(segment_flags(segment)),
                p_offset: u64(data_start + segment.file_start),
                p_vaddr: u64(segment.vm_start),
                p_paddr: u64(segment.vm_start),
                p_filesz: u64(segment.file_size),
                p_memsz: u64(segment.vm_size),
                p_align: u64(segment.vm_align),
            };
            out.write_all(bytes_of(&prog_header))?;
        }
        tracing::trace!("fp=0x{:x} after program headers", out.pos);

        out.pad_to(data_start)?;
        write_payload(&mut out, image, data_start, bytecode)?;
        out.pad_to(data_end)?;

        out.write_all(SHSTRTAB)?;
        out.pad_to(shoff)?;

        // Null section header
        let null_sec = elf::SectionHeader64::<Endianness> {
            sh_name: u32(0),
            sh_type: u32(elf::SHT_NULL),
            sh_flags: u64(0),
            sh_addr: u64(0),
            sh_offset: u64(0),
            sh_size: u64(0),
            sh_link: u32(0),
            sh_info: u32(0),
            sh_addralign: u64(0),
            sh_entsize: u64(0),
        };
        out.write_all(bytes_of(&null_sec))?;

        // Section headers for each section
        for segment in image.segments() {
            for section in segment.sections() {
                let (name, sh_type, flags) = section_attributes(section);
                let sec_header = elf::SectionHeader64::<Endianness> {
                    sh_name: u32(name),
                    sh_type: u32(sh_type),
                    sh_flags: u64(flags as u64),
                    sh_addr: u64(segment.vm_start + section.vm_offset_to_seg),
                    sh_offset: u64(data_start + segment.file_start + section.file_offset_to_seg),
                    sh_size: u64(section.size),
                    sh_link: u32(0),
                    sh_info: u32(0),
                    sh_addralign: u64(section.vm_align),
                    sh_entsize: u64(0),
                };
                out.write_all(bytes_of(&sec_header))?;
            }
        }

        // Section header string table header
        let shstrtab_header = elf::SectionHeader64::<Endianness> {
            sh_name: u32(NAME_SHSTRTAB),
            sh_type: u32(elf::SHT_STRTAB),
            sh_flags: u64(0),
            sh_addr: u64(0),
            sh_offset: u64(data_end),
            sh_size: u64(SHSTRTAB.len() as u64),
            sh_link: u32(0),
            sh_info: u32(0),
            sh_addralign: u64(1),
            sh_entsize: u64(0),
        };
        out.write_all(bytes_of(&shstrtab_header))?;
        out.flush()?;

        tracing::debug!(
            "wrote ELF: {} program headers, {} section headers, 0x{:x} bytes",
            phnum,
            shnum,
            out.pos
        );
        Ok(())
    }
}
