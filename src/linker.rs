//! Core image-building pipeline.
//!
//! This module contains the `Linker` struct, which drives an [`Image`] through the
//! embedding protocol:
//! 1. Setup: creates the image and the NULL guard segment at address 0.
//! 2. Code: places the VM routines in the CODE segment.
//! 3. Data: reserves the runtime state and the bytecode area.
//! 4. Output: encodes the image in the selected format.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::format::elf::Elf;
use crate::format::{Encoder, Format};
use crate::image::{Image, ImageConfig};
use crate::layout::SegmentKind;
use crate::vm::VmRoutines;

pub const DEFAULT_CODE_ADDR: u64 = 0x400000;
pub const DEFAULT_CODE_ALIGN: u64 = 16;
pub const DEFAULT_DATA_ADDR: u64 = 0x8000000;

/// Everything the pipeline needs besides its inputs.
#[derive(Debug, Clone)]
pub struct Options {
    pub image: ImageConfig,
    pub code_addr: u64,
    pub code_align: u64,
    pub data_addr: u64,
    pub format: Format,
}

impl Options {
    /// Default addresses with the given output format.
    pub fn new(format: Format) -> Self {
        Self {
            image: ImageConfig::default(),
            code_addr: DEFAULT_CODE_ADDR,
            code_align: DEFAULT_CODE_ALIGN,
            data_addr: DEFAULT_DATA_ADDR,
            format,
        }
    }
}

pub struct Linker {
    options: Options,
    image: Image,
}

impl Linker {
    pub fn new(options: Options) -> Result<Self> {
        let mut image = Image::with_config(options.image).context("failed to create image")?;
        let page = image.page_size();
        image
            .add_segment(SegmentKind::Null, page, Some(0), page, 0)
            .context("failed to add NULL segment")?;
        Ok(Self { options, image })
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn load_vm(&mut self, routines: &VmRoutines) -> Result<()> {
        self.image
            .load_vm_code(routines, Some(self.options.code_addr), self.options.code_align)
            .with_context(|| format!("failed to load VM code at 0x{:x}", self.options.code_addr))
    }

    pub fn reserve_data(&mut self, bytecode_size: u64) -> Result<()> {
        self.image
            .reserve_vm_data(self.options.data_addr, bytecode_size)
            .with_context(|| format!("failed to reserve VM data at 0x{:x}", self.options.data_addr))?;
        Ok(())
    }

    fn encoder(&self) -> Box<dyn Encoder> {
        match self.options.format {
            Format::Elf => Box::new(Elf::with_entry(self.options.code_addr)),
            format => format.encoder(),
        }
    }

    /// Encodes the image into `out`.
    pub fn encode(&self, out: &mut dyn Write, bytecode: &[u8]) -> Result<()> {
        let encoder = self.encoder();
        encoder
            .write(out, &self.image, bytecode)
            .with_context(|| format!("failed to encode {} image", encoder.name()))
    }

    /// Writes the executable to `path`. A partially written file is removed.
    pub fn write(&self, path: &Path, bytecode: &[u8]) -> Result<()> {
        let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        let mut out = BufWriter::new(file);

        let written = self.encode(&mut out, bytecode).and_then(|()| {
            out.flush()
                .with_context(|| format!("failed to write {}", path.display()))
        });
        if let Err(err) = written {
            drop(out);
            if let Err(rm) = fs::remove_file(path) {
                tracing::warn!("failed to remove {}: {}", path.display(), rm);
            }
            return Err(err);
        }
        drop(out);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o755))
                .with_context(|| format!("failed to make {} executable", path.display()))?;
        }

        tracing::info!(
            "wrote {} executable {} (entry 0x{:x})",
            self.encoder().name(),
            path.display(),
            self.image.vm_entry_point()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::vm::VmRoutine;

    fn routines() -> VmRoutines {
        VmRoutines {
            id: "ivm".to_string(),
            interrupt: VmRoutine::new("__interrupt", 0, vec![0xc3]),
            machine: VmRoutine::new("__vm", 0, vec![0xc3]),
            loader: VmRoutine::new("__loader", 0, vec![0x90, 0xc3]),
        }
    }

    #[test]
    fn new_adds_null_segment() {
        let linker = Linker::new(Options::new(Format::Elf)).unwrap();
        let null = &linker.image().segments()[0];
        assert_eq!(null.kind, SegmentKind::Null);
        assert_eq!((null.vm_start, null.vm_size, null.file_size), (0, 0x1000, 0));
    }

    #[test]
    fn pipeline_encodes_elf() {
        let mut linker = Linker::new(Options::new(Format::Elf)).unwrap();
        linker.load_vm(&routines()).unwrap();
        linker.reserve_data(3).unwrap();

        let mut buf = Vec::new();
        linker.encode(&mut buf, b"abc").unwrap();
        assert_eq!(&buf[..4], b"\x7fELF");
        assert_eq!(linker.image().vm_entry_point(), DEFAULT_CODE_ADDR);
    }

    #[test]
    fn failures_keep_builder_error() {
        let mut options = Options::new(Format::Elf);
        options.data_addr = 0x8000010;
        let mut linker = Linker::new(options).unwrap();
        linker.load_vm(&routines()).unwrap();
        let err = linker.reserve_data(3).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::AddressMismatch { .. })));
    }
}
