use ivmld::error::Error;
use ivmld::format::Format;
use ivmld::image::Image;
use ivmld::layout::SegmentKind;
use ivmld::linker::{Linker, Options};
use ivmld::vm::{RoutineNames, VmRoutines};
use object::write::{self, StandardSection, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, Object, ObjectSection, ObjectSegment, SymbolFlags, SymbolKind,
    SymbolScope,
};

const LOADER: &[u8] = &[0x48, 0x31, 0xff, 0xb8, 0x3c, 0x00, 0x00, 0x00, 0x0f, 0x05];
const MACHINE: &[u8] = &[0x55, 0x48, 0x89, 0xe5, 0x5d, 0xc3];
const INTERRUPT: &[u8] = &[0xc3];

fn vm_object(format: BinaryFormat) -> Vec<u8> {
    let mut obj = write::Object::new(format, Architecture::X86_64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    for (name, code) in [("__loader", LOADER), ("__vm", MACHINE), ("__interrupt", INTERRUPT)] {
        let offset = obj.append_section_data(text, code, 16);
        obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: offset,
            size: code.len() as u64,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
    }
    obj.write().unwrap()
}

fn build(format: Format, vm: &[u8], bytecode: &[u8]) -> (Linker, Vec<u8>) {
    let routines = VmRoutines::from_object("ivm", vm, &RoutineNames::default()).unwrap();
    let mut linker = Linker::new(Options::new(format)).unwrap();
    linker.load_vm(&routines).unwrap();
    linker.reserve_data(bytecode.len() as u64).unwrap();
    let mut buf = Vec::new();
    linker.encode(&mut buf, bytecode).unwrap();
    (linker, buf)
}

fn file_offset_of(file: &object::File<'_>, addr: u64) -> usize {
    let segment = file
        .segments()
        .find(|s| s.address() <= addr && addr < s.address() + s.size())
        .unwrap();
    let (offset, _) = segment.file_range();
    (offset + addr - segment.address()) as usize
}

#[test]
fn elf_executable_from_elf_object() {
    let bytecode = b"\x0eHello, world!\n";
    let (linker, buf) = build(Format::Elf, &vm_object(BinaryFormat::Elf), bytecode);

    let file = object::File::parse(&*buf).unwrap();
    assert_eq!(file.format(), BinaryFormat::Elf);
    assert_eq!(file.architecture(), Architecture::X86_64);
    assert_eq!(file.entry(), 0x400000);
    assert_eq!(file.segments().count(), 3);

    let entry = file_offset_of(&file, file.entry());
    assert_eq!(&buf[entry..entry + LOADER.len()], LOADER);

    let state = linker.image().entry_point();
    let machine = file_offset_of(&file, state.machine_addr);
    assert_eq!(&buf[machine..machine + MACHINE.len()], MACHINE);
    let mem = file_offset_of(&file, state.mem_addr);
    assert_eq!(&buf[mem..mem + bytecode.len()], bytecode);

    // The runtime state at the start of the data segment names its own VM.
    let data = file_offset_of(&file, state.data_addr);
    assert_eq!(&buf[data..data + 4], b"ivm\0");

    let text = file.section_by_name(".text").unwrap();
    assert_eq!(text.address(), 0x400000);
}

#[test]
fn macho_executable_from_macho_object() {
    let bytecode = b"\x01\x02\x03";
    let (linker, buf) = build(Format::MachO, &vm_object(BinaryFormat::MachO), bytecode);

    let file = object::File::parse(&*buf).unwrap();
    assert_eq!(file.format(), BinaryFormat::MachO);
    let names: Vec<_> = file.segments().map(|s| s.name().unwrap().unwrap_or("").to_string()).collect();
    assert_eq!(names, ["__PAGEZERO", "__TEXT", "__DATA", "__LINKEDIT"]);

    let state = linker.image().entry_point();
    let mem = file_offset_of(&file, state.mem_addr);
    assert_eq!(&buf[mem..mem + bytecode.len()], bytecode);
}

#[test]
fn writes_executable_file() {
    let bytecode = b"\x00";
    let routines = VmRoutines::from_object("ivm", &vm_object(BinaryFormat::Elf), &RoutineNames::default()).unwrap();
    let mut linker = Linker::new(Options::new(Format::Elf)).unwrap();
    linker.load_vm(&routines).unwrap();
    linker.reserve_data(1).unwrap();

    let path = std::env::temp_dir().join(format!("ivmld-test-{}", std::process::id()));
    linker.write(&path, bytecode).unwrap();
    let written = std::fs::read(&path).unwrap();
    assert_eq!(&written[..4], b"\x7fELF");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    // Bytecode of the wrong length fails and leaves no file behind.
    assert!(linker.write(&path, b"too long").is_err());
    assert!(!path.exists());
}

#[test]
fn builder_errors_surface_through_pipeline() {
    let routines = VmRoutines::from_object("ivm", &vm_object(BinaryFormat::Elf), &RoutineNames::default()).unwrap();
    let mut options = Options::new(Format::Elf);
    options.image.frame_count = 1;
    let mut linker = Linker::new(options).unwrap();
    linker.load_vm(&routines).unwrap();

    let err = linker.reserve_data(0x401).unwrap_err();
    let builder = err.downcast_ref::<Error>().unwrap();
    assert!(matches!(builder, Error::InvalidArgument(_)));
    assert_eq!(builder.errno(), 22);
}

#[test]
fn zero_filled_image_encodes_in_both_formats() {
    let mut image = Image::create(0x10, 0x400, 0x100).unwrap();
    image.add_segment(SegmentKind::Null, 0x1000, Some(0), 0x1000, 0).unwrap();
    let data = image.add_segment(SegmentKind::Data, 0x1000, None, 0x1000, 0).unwrap();
    image.add_section(data, ivmld::layout::SectionKind::Bss, 0x10, None, 0x1000).unwrap();
    assert_eq!(image.file_size(), 0);

    for format in [Format::Elf, Format::MachO] {
        let mut buf = Vec::new();
        format.encoder().write(&mut buf, &image, &[]).unwrap();
        assert!(object::File::parse(&*buf).is_ok());
    }
    image.remove();
}
