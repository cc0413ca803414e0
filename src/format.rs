//! Output format abstraction.
//!
//! This module defines the `Encoder` trait implemented by each executable container
//! format. An encoder consumes a finished [`Image`] and writes, in file order: its
//! header tables, zero padding up to the page-aligned data area, the section payloads
//! with their padding, then any format-specific trailer.

use std::io::{self, Write};

use crate::error::{Error, Result};
use crate::image::Image;
use crate::layout::SectionKind;
use crate::utils::align_up;

pub mod elf;
pub mod macho;

/// A trait representing an executable container format (e.g., ELF, Mach-O).
pub trait Encoder {
    /// Human readable name of the format.
    fn name(&self) -> &'static str;

    /// Size of everything written before the data area, known from the image's
    /// counters alone.
    fn header_size(&self, image: &Image) -> u64;

    /// Serializes `image` to `out`, substituting `bytecode` for every bytecode section.
    fn write(&self, out: &mut dyn Write, image: &Image, bytecode: &[u8]) -> Result<()>;

    /// File offset of the data area.
    fn data_start(&self, image: &Image) -> u64 {
        align_up(self.header_size(image), image.page_size())
    }
}

/// Supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Elf,
    MachO,
}

impl Format {
    /// The native executable format of the operating system this was built for.
    pub fn host() -> Result<Self> {
        Self::for_os(std::env::consts::OS)
    }

    pub fn for_os(os: &str) -> Result<Self> {
        match os {
            "linux" | "freebsd" | "netbsd" | "openbsd" => Ok(Format::Elf),
            "macos" => Ok(Format::MachO),
            other => Err(Error::invalid(format!("no output format for {}", other))),
        }
    }

    /// An encoder with default settings.
    pub fn encoder(self) -> Box<dyn Encoder> {
        match self {
            Format::Elf => Box::new(elf::Elf::new()),
            Format::MachO => Box::new(macho::MachO::new()),
        }
    }
}

/// Writer adapter tracking the current file position.
pub(crate) struct Counting<'a> {
    inner: &'a mut dyn Write,
    pub pos: u64,
}

impl<'a> Counting<'a> {
    pub fn new(inner: &'a mut dyn Write) -> Self {
        Self { inner, pos: 0 }
    }

    pub fn zeros(&mut self, count: u64) -> io::Result<()> {
        const ZEROS: [u8; 512] = [0; 512];
        let mut left = count;
        while left > 0 {
            let n = left.min(ZEROS.len() as u64) as usize;
            self.write_all(&ZEROS[..n])?;
            left -= n as u64;
        }
        Ok(())
    }

    /// Pads with zeros up to `offset`.
    pub fn pad_to(&mut self, offset: u64) -> Result<()> {
        if offset < self.pos {
            return Err(Error::invalid(format!(
                "layout error: at 0x{:x}, expected to be at most 0x{:x}",
                self.pos, offset
            )));
        }
        self.zeros(offset - self.pos)?;
        Ok(())
    }
}

impl Write for Counting<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Every bytecode section must be exactly as large as the supplied bytecode.
pub(crate) fn check_bytecode(image: &Image, bytecode: &[u8]) -> Result<()> {
    let sections = image.segments().iter().flat_map(|seg| seg.sections());
    for section in sections.filter(|s| s.kind == SectionKind::Bytecode) {
        if section.size != bytecode.len() as u64 {
            return Err(Error::invalid(format!(
                "bytecode is 0x{:x} bytes, its section reserves 0x{:x}",
                bytecode.len(),
                section.size
            )));
        }
    }
    Ok(())
}

/// Writes all section payloads in file order, each followed by its padding.
pub(crate) fn write_payload(out: &mut Counting<'_>, image: &Image, data_start: u64, bytecode: &[u8]) -> Result<()> {
    for segment in image.segments() {
        for section in segment.sections().iter().filter(|s| s.occupies_file()) {
            let expected = data_start + segment.file_start + section.file_offset_to_seg;
            if out.pos != expected {
                return Err(Error::invalid(format!(
                    "layout error: section {:?} at 0x{:x}, expected 0x{:x}",
                    section.kind, out.pos, expected
                )));
            }

            let payload = match section.kind {
                SectionKind::Bytecode => Some(bytecode),
                _ => section.data(),
            };
            match payload {
                Some(bytes) => out.write_all(bytes)?,
                None => out.zeros(section.size)?,
            }
            out.zeros(section.file_padding)?;

            tracing::trace!(
                "fp=0x{:x} vm_addr=0x{:x}",
                out.pos,
                segment.vm_start + section.vm_offset_to_seg
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_for_os() {
        assert_eq!(Format::for_os("linux").unwrap(), Format::Elf);
        assert_eq!(Format::for_os("macos").unwrap(), Format::MachO);
        assert!(matches!(Format::for_os("windows"), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn counting_writer_pads() {
        let mut buf = Vec::new();
        let mut out = Counting::new(&mut buf);
        out.write_all(b"abc").unwrap();
        out.pad_to(0x600).unwrap();
        assert_eq!(out.pos, 0x600);
        assert!(out.pad_to(0x10).is_err());
        assert_eq!(buf.len(), 0x600);
        assert!(buf[3..].iter().all(|&b| b == 0));
    }
}
