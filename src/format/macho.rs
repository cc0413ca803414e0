//! Mach-O 64 encoder (x86-64 macOS).
//!
//! File layout:
//! - Mach header
//! - load commands: one `LC_SEGMENT_64` per segment (with a single `section_64` when
//!   the segment has sections), `__LINKEDIT`, the dyld commands, `LC_SYMTAB` and
//!   `LC_MAIN`
//! - zero padding up to the page-aligned data area
//! - section payloads in file order
//!
//! The symbol and dyld tables are left empty; `__LINKEDIT` maps nothing.

use std::io::Write;
use std::mem;

use object::endian::{BigEndian, U32, U64};
use object::macho;
use object::pod::bytes_of;
use object::Endianness;

use super::{check_bytecode, write_payload, Counting, Encoder};
use crate::error::{Error, Result};
use crate::image::Image;
use crate::layout::{Segment, SegmentKind};
use crate::utils::align_up;

const DYLD_PATH: &[u8] = b"/usr/lib/dyld";
const LIBSYSTEM_PATH: &[u8] = b"/usr/lib/libSystem.B.dylib";
const LIBSYSTEM_TIMESTAMP: u32 = 2;
const LIBSYSTEM_CURRENT_VERSION: u32 = 0x4ca_0a01;
const LIBSYSTEM_COMPAT_VERSION: u32 = 0x1_0000;

/// Number of load commands besides the segments.
const FIXED_COMMANDS: u32 = 7;

fn u32(v: u32) -> U32<Endianness> {
    U32::new(Endianness::Little, v)
}
fn u64(v: u64) -> U64<Endianness> {
    U64::new(Endianness::Little, v)
}

fn name16(name: &str) -> [u8; 16] {
    let mut out = [0; 16];
    out[..name.len()].copy_from_slice(name.as_bytes());
    out
}

const fn size_of<T>() -> u32 {
    mem::size_of::<T>() as u32
}

/// Size of a command carrying a trailing NUL terminated string, padded to 8 bytes.
fn string_command_size(fixed: u32, string: &[u8]) -> u32 {
    align_up(u64::from(fixed) + string.len() as u64 + 1, 8) as u32
}

fn dylinker_command_size() -> u32 {
    string_command_size(size_of::<macho::DylinkerCommand<Endianness>>(), DYLD_PATH)
}

fn dylib_command_size() -> u32 {
    string_command_size(size_of::<macho::DylibCommand<Endianness>>(), LIBSYSTEM_PATH)
}

fn segment_name(kind: SegmentKind) -> &'static str {
    match kind {
        SegmentKind::Null => "__PAGEZERO",
        SegmentKind::Code => "__TEXT",
        SegmentKind::Data => "__DATA",
    }
}

fn vm_prot(segment: &Segment) -> u32 {
    let prot = segment.kind.protection();
    let mut flags = 0;
    if prot.read {
        flags |= macho::VM_PROT_READ;
    }
    if prot.write {
        flags |= macho::VM_PROT_WRITE;
    }
    if prot.execute {
        flags |= macho::VM_PROT_EXECUTE;
    }
    flags
}

/// The Mach-O encoder.
#[derive(Debug, Clone, Default)]
pub struct MachO;

impl MachO {
    pub fn new() -> Self {
        Self
    }

    fn segment_command_size(segment: &Segment) -> u32 {
        let sections = if segment.sections().is_empty() { 0 } else { 1 };
        size_of::<macho::SegmentCommand64<Endianness>>() + sections * size_of::<macho::Section64<Endianness>>()
    }

    fn load_commands_size(image: &Image) -> u32 {
        let segments: u32 = image.segments().iter().map(Self::segment_command_size).sum();
        segments
            + size_of::<macho::SegmentCommand64<Endianness>>()
            + size_of::<macho::DyldInfoCommand<Endianness>>()
            + size_of::<macho::DysymtabCommand<Endianness>>()
            + dylinker_command_size()
            + dylib_command_size()
            + size_of::<macho::SymtabCommand<Endianness>>()
            + size_of::<macho::EntryPointCommand<Endianness>>()
    }

    /// File offset of a segment's `section_64`, which only has 32 bits for it.
    fn section_offset(segment: &Segment, data_start: u64) -> Result<u32> {
        if segment.file_size == 0 {
            return Ok(0);
        }
        u32::try_from(data_start + segment.file_start)
            .map_err(|_| Error::invalid("section offset does not fit in Mach-O"))
    }

    fn write_segment(&self, out: &mut Counting<'_>, segment: &Segment, data_start: u64) -> Result<()> {
        let segname = name16(segment_name(segment.kind));
        let has_file = segment.file_size > 0;
        let nsects = if segment.sections().is_empty() { 0 } else { 1 };
        let prot = vm_prot(segment);

        let command = macho::SegmentCommand64::<Endianness> {
            cmd: u32(macho::LC_SEGMENT_64),
            cmdsize: u32(Self::segment_command_size(segment)),
            segname,
            vmaddr: u64(segment.vm_start),
            vmsize: u64(segment.vm_size),
            fileoff: u64(if has_file { data_start + segment.file_start } else { 0 }),
            filesize: u64(segment.file_size),
            maxprot: u32(prot),
            initprot: u32(prot),
            nsects: u32(nsects),
            flags: u32(0),
        };
        out.write_all(bytes_of(&command))?;
        if nsects == 0 {
            return Ok(());
        }

        let (sectname, flags) = match (segment.kind, has_file) {
            (SegmentKind::Code, _) => (
                "__text",
                macho::S_REGULAR | macho::S_ATTR_PURE_INSTRUCTIONS | macho::S_ATTR_SOME_INSTRUCTIONS,
            ),
            (_, true) => ("__data", macho::S_REGULAR),
            (_, false) => ("__data", macho::S_ZEROFILL),
        };
        let offset = Self::section_offset(segment, data_start)?;
        // Trailing zero-fill sections are left to the segment's vmsize.
        let size = if has_file {
            segment.content_size().min(segment.file_size)
        } else {
            segment.content_size()
        };

        let section = macho::Section64::<Endianness> {
            sectname: name16(sectname),
            segname,
            addr: u64(segment.vm_start),
            size: u64(size),
            offset: u32(offset),
            align: u32(segment.max_section_align().trailing_zeros()),
            reloff: u32(0),
            nreloc: u32(0),
            flags: u32(flags),
            reserved1: u32(0),
            reserved2: u32(0),
            reserved3: u32(0),
        };
        out.write_all(bytes_of(&section))?;
        Ok(())
    }

    fn write_linkedit(&self, out: &mut Counting<'_>, image: &Image, data_start: u64) -> Result<()> {
        let vmaddr = image
            .segments()
            .last()
            .map(|seg| align_up(seg.vm_end(), image.page_size()))
            .unwrap_or(0);
        let command = macho::SegmentCommand64::<Endianness> {
            cmd: u32(macho::LC_SEGMENT_64),
            cmdsize: u32(size_of::<macho::SegmentCommand64<Endianness>>()),
            segname: name16("__LINKEDIT"),
            vmaddr: u64(vmaddr),
            vmsize: u64(0),
            fileoff: u64(data_start + image.file_size()),
            filesize: u64(0),
            maxprot: u32(macho::VM_PROT_READ),
            initprot: u32(macho::VM_PROT_READ),
            nsects: u32(0),
            flags: u32(0),
        };
        out.write_all(bytes_of(&command))?;
        Ok(())
    }

    /// A load command with nothing but its header filled in.
    fn write_empty_command(&self, out: &mut Counting<'_>, cmd: u32, cmdsize: u32) -> Result<()> {
        out.write_all(bytes_of(&u32(cmd)))?;
        out.write_all(bytes_of(&u32(cmdsize)))?;
        out.zeros(u64::from(cmdsize) - 8)?;
        Ok(())
    }

    fn write_string(&self, out: &mut Counting<'_>, string: &[u8], fixed: u32, cmdsize: u32) -> Result<()> {
        out.write_all(string)?;
        out.zeros(u64::from(cmdsize - fixed) - string.len() as u64)?;
        Ok(())
    }

    fn write_dyld_commands(&self, out: &mut Counting<'_>) -> Result<()> {
        self.write_empty_command(
            out,
            macho::LC_DYLD_INFO_ONLY,
            size_of::<macho::DyldInfoCommand<Endianness>>(),
        )?;
        self.write_empty_command(out, macho::LC_DYSYMTAB, size_of::<macho::DysymtabCommand<Endianness>>())?;

        let fixed = size_of::<macho::DylinkerCommand<Endianness>>();
        let cmdsize = dylinker_command_size();
        let dylinker = macho::DylinkerCommand::<Endianness> {
            cmd: u32(macho::LC_LOAD_DYLINKER),
            cmdsize: u32(cmdsize),
            name: macho::LcStr { offset: u32(fixed) },
        };
        out.write_all(bytes_of(&dylinker))?;
        self.write_string(out, DYLD_PATH, fixed, cmdsize)?;

        let fixed = size_of::<macho::DylibCommand<Endianness>>();
        let cmdsize = dylib_command_size();
        let dylib = macho::DylibCommand::<Endianness> {
            cmd: u32(macho::LC_LOAD_DYLIB),
            cmdsize: u32(cmdsize),
            dylib: macho::Dylib {
                name: macho::LcStr { offset: u32(fixed) },
                timestamp: u32(LIBSYSTEM_TIMESTAMP),
                current_version: u32(LIBSYSTEM_CURRENT_VERSION),
                compatibility_version: u32(LIBSYSTEM_COMPAT_VERSION),
            },
        };
        out.write_all(bytes_of(&dylib))?;
        self.write_string(out, LIBSYSTEM_PATH, fixed, cmdsize)?;
        Ok(())
    }
}

impl Encoder for MachO {
    fn name(&self) -> &'static str {
        "Mach-O"
    }

    fn header_size(&self, image: &Image) -> u64 {
        u64::from(size_of::<macho::MachHeader64<Endianness>>()) + u64::from(Self::load_commands_size(image))
    }

    fn write(&self, out: &mut dyn Write, image: &Image, bytecode: &[u8]) -> Result<()> {
        check_bytecode(image, bytecode)?;

        let ncmds = u32::try_from(image.num_segments())
            .ok()
            .and_then(|n| n.checked_add(FIXED_COMMANDS))
            .ok_or_else(|| Error::invalid("too many segments for Mach-O"))?;
        let sizeofcmds = Self::load_commands_size(image);
        let data_start = self.data_start(image);
        for segment in image.segments() {
            Self::section_offset(segment, data_start)?;
        }

        let mut out = Counting::new(out);

        let header = macho::MachHeader64::<Endianness> {
            magic: U32::new(BigEndian, macho::MH_CIGAM_64),
            cputype: u32(macho::CPU_TYPE_X86_64),
            cpusubtype: u32(macho::CPU_SUBTYPE_LIB64 | macho::CPU_SUBTYPE_X86_64_ALL),
            filetype: u32(macho::MH_EXECUTE),
            ncmds: u32(ncmds),
            sizeofcmds: u32(sizeofcmds),
            flags: u32(macho::MH_NOUNDEFS),
            reserved: u32(0),
        };
        out.write_all(bytes_of(&header))?;

        for segment in image.segments() {
            self.write_segment(&mut out, segment, data_start)?;
        }
        self.write_linkedit(&mut out, image, data_start)?;
        self.write_dyld_commands(&mut out)?;
        self.write_empty_command(&mut out, macho::LC_SYMTAB, size_of::<macho::SymtabCommand<Endianness>>())?;

        let main = macho::EntryPointCommand::<Endianness> {
            cmd: u32(macho::LC_MAIN),
            cmdsize: u32(size_of::<macho::EntryPointCommand<Endianness>>()),
            entryoff: u64(data_start + image.vm_file_offset()),
            stacksize: u64(0),
        };
        out.write_all(bytes_of(&main))?;
        tracing::trace!("fp=0x{:x} after load commands", out.pos);

        out.pad_to(data_start)?;
        write_payload(&mut out, image, data_start, bytecode)?;
        out.pad_to(data_start + image.file_size())?;
        out.flush()?;

        tracing::debug!("wrote Mach-O: {} load commands, 0x{:x} bytes", ncmds, out.pos);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SectionKind;
    use crate::vm::{VmRoutine, VmRoutines};
    use object::Object;

    fn u32_at(buf: &[u8], off: usize) -> u32 {
        u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
    }
    fn u64_at(buf: &[u8], off: usize) -> u64 {
        u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
    }

    /// Offsets of all load commands with the given `cmd`.
    fn find_commands(buf: &[u8], cmd: u32) -> Vec<usize> {
        let ncmds = u32_at(buf, 16) as usize;
        let mut off = 32;
        let mut found = Vec::new();
        for _ in 0..ncmds {
            if u32_at(buf, off) == cmd {
                found.push(off);
            }
            off += u32_at(buf, off + 4) as usize;
        }
        found
    }

    fn vm_image(bytecode: &[u8]) -> Image {
        let routines = VmRoutines {
            id: "ivm".to_string(),
            interrupt: VmRoutine::new("__interrupt", 0, vec![0xc3]),
            machine: VmRoutine::new("__vm", 0, vec![0x31, 0xc0, 0xc3]),
            loader: VmRoutine::new("__loader", 0, vec![0x55, 0x48, 0x89, 0xe5]),
        };
        let mut image = Image::create(0x10, 0x400, 0x100).unwrap();
        image.add_segment(SegmentKind::Null, 0x1000, Some(0), 0x1000, 0).unwrap();
        image.load_vm_code(&routines, Some(0x400000), 16).unwrap();
        image.reserve_vm_data(0x8000000, bytecode.len() as u64).unwrap();
        image
    }

    #[test]
    fn header_and_load_commands() {
        let bytecode = b"\x0eHello, world!\n";
        let image = vm_image(bytecode);
        let encoder = MachO::new();
        let mut buf = Vec::new();
        encoder.write(&mut buf, &image, bytecode).unwrap();

        assert_eq!(&buf[..4], &[0xcf, 0xfa, 0xed, 0xfe]);
        assert_eq!(u32_at(&buf, 4), macho::CPU_TYPE_X86_64);
        assert_eq!(u32_at(&buf, 12), macho::MH_EXECUTE);
        assert_eq!(u32_at(&buf, 16), 3 + FIXED_COMMANDS);
        // __PAGEZERO, __TEXT + section, __DATA + section, __LINKEDIT, dyld info,
        // dysymtab, dylinker, dylib, symtab, main.
        let expected = 72 + 152 + 152 + 72 + 48 + 80 + 32 + 56 + 24 + 24;
        assert_eq!(u32_at(&buf, 20), expected);
        assert_eq!(encoder.header_size(&image), 32 + expected as u64);

        let data_start = encoder.data_start(&image);
        assert_eq!(data_start, 0x1000);
        assert_eq!(buf.len() as u64, data_start + image.file_size());

        let segments = find_commands(&buf, macho::LC_SEGMENT_64);
        assert_eq!(segments.len(), 4);
        assert_eq!(&buf[segments[0] + 8..segments[0] + 18], b"__PAGEZERO");
        assert_eq!(u32_at(&buf, segments[0] + 56), 0); // maxprot

        let text = segments[1];
        assert_eq!(&buf[text + 8..text + 14], b"__TEXT");
        assert_eq!(u64_at(&buf, text + 24), 0x400000);
        assert_eq!(u64_at(&buf, text + 40), data_start);
        assert_eq!(u32_at(&buf, text + 56), macho::VM_PROT_READ | macho::VM_PROT_EXECUTE);
        let sect = text + 72;
        assert_eq!(&buf[sect..sect + 6], b"__text");
        assert_eq!(u32_at(&buf, sect + 52), 4); // log2(16)

        let linkedit = segments[3];
        assert_eq!(&buf[linkedit + 8..linkedit + 18], b"__LINKEDIT");
        assert_eq!(u64_at(&buf, linkedit + 40), data_start + image.file_size());

        let main = find_commands(&buf, macho::LC_MAIN)[0];
        assert_eq!(u64_at(&buf, main + 8), data_start + image.vm_file_offset());
        let entry = u64_at(&buf, main + 8) as usize;
        assert_eq!(&buf[entry..entry + 4], &[0x55, 0x48, 0x89, 0xe5]);

        let dylib = find_commands(&buf, macho::LC_LOAD_DYLIB)[0];
        assert_eq!(u32_at(&buf, dylib + 8), 24);
        assert_eq!(u32_at(&buf, dylib + 16), LIBSYSTEM_CURRENT_VERSION);
        assert_eq!(&buf[dylib + 24..dylib + 24 + LIBSYSTEM_PATH.len()], LIBSYSTEM_PATH);

        let dylinker = find_commands(&buf, macho::LC_LOAD_DYLINKER)[0];
        assert_eq!(u32_at(&buf, dylinker + 4), 32);
        assert_eq!(&buf[dylinker + 12..dylinker + 12 + DYLD_PATH.len()], DYLD_PATH);

        let file = object::File::parse(&*buf).unwrap();
        assert_eq!(file.format(), object::BinaryFormat::MachO);
    }

    #[test]
    fn bytecode_lands_at_its_address() {
        let bytecode = b"\x01\x02\x03\x04\x05";
        let image = vm_image(bytecode);
        let mut buf = Vec::new();
        MachO::new().write(&mut buf, &image, bytecode).unwrap();

        let data = find_commands(&buf, macho::LC_SEGMENT_64)[2];
        let vmaddr = u64_at(&buf, data + 24);
        let fileoff = u64_at(&buf, data + 40);
        let offset = (fileoff + image.entry_point().mem_addr - vmaddr) as usize;
        assert_eq!(&buf[offset..offset + bytecode.len()], bytecode);
        assert_eq!(fileoff % 0x1000, vmaddr % 0x1000);
    }

    #[test]
    fn zero_filled_segment_has_no_file_offset() {
        let mut image = Image::create(0x10, 0x400, 0x100).unwrap();
        image.add_segment(SegmentKind::Null, 0x1000, Some(0), 0x1000, 0).unwrap();
        let data = image.add_segment(SegmentKind::Data, 0x1000, None, 0x1000, 0).unwrap();
        image.add_section(data, SectionKind::Bss, 0x10, None, 0x1000).unwrap();

        let mut buf = Vec::new();
        MachO::new().write(&mut buf, &image, &[]).unwrap();
        let seg = find_commands(&buf, macho::LC_SEGMENT_64)[1];
        assert_eq!(u64_at(&buf, seg + 40), 0);
        assert_eq!(u64_at(&buf, seg + 48), 0);
        let sect = seg + 72;
        assert_eq!(u32_at(&buf, sect + 64), macho::S_ZEROFILL);
    }

    #[test]
    fn mixed_segment_section_stops_at_file_bytes() {
        let mut image = Image::create(0x10, 0x400, 0x100).unwrap();
        let data = image.add_segment(SegmentKind::Data, 0x1000, Some(0x8000000), 0x1000, 0x10).unwrap();
        image.add_section(data, SectionKind::Data, 0x10, Some(vec![7; 0x10]), 0x10).unwrap();
        image.add_section(data, SectionKind::Bss, 0x10, None, 0x100).unwrap();

        let mut buf = Vec::new();
        MachO::new().write(&mut buf, &image, &[]).unwrap();
        let sect = find_commands(&buf, macho::LC_SEGMENT_64)[0] + 72;
        assert_eq!(u64_at(&buf, sect + 40), 0x10);
        assert_eq!(u32_at(&buf, sect + 64), macho::S_REGULAR);
    }

    #[test]
    fn rejects_file_offsets_past_32_bits() {
        let mut image = Image::create(0x10, 0x400, 0x100).unwrap();
        let big = image.add_segment(SegmentKind::Data, 0x1000, None, 0x1_0000_0000, 0x1000).unwrap();
        image.add_section(big, SectionKind::Data, 0x1000, None, 0x1_0000_0000).unwrap();
        let next = image.add_segment(SegmentKind::Data, 0x1000, None, 0x1000, 0x1000).unwrap();
        image.add_section(next, SectionKind::Data, 0x10, None, 0x10).unwrap();

        let mut buf = Vec::new();
        assert!(matches!(
            MachO::new().write(&mut buf, &image, &[]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_bytecode_of_wrong_length() {
        let image = vm_image(b"abcd");
        let mut buf = Vec::new();
        assert!(matches!(
            MachO::new().write(&mut buf, &image, b"abcdef"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(buf.is_empty());
    }
}
