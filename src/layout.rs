//! Layout management.
//!
//! This module defines the structures describing the output image's memory layout:
//! segments (contiguous virtual-memory regions with uniform access rights) and the
//! sections laid out inside them. Placement is computed once, when an item is added,
//! from the item before it; nothing is ever moved afterwards.

use crate::error::{Error, Result};
use crate::utils::{checked_align_up, is_valid_align};

/// The role of a segment, which also fixes its access rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Inaccessible guard region in low memory.
    Null,
    /// VM instructions (read + execute).
    Code,
    /// VM runtime state and guest bytecode (read + write).
    Data,
}

/// Access rights of a mapped segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl SegmentKind {
    pub fn protection(self) -> Protection {
        match self {
            SegmentKind::Null => Protection::default(),
            SegmentKind::Code => Protection { read: true, write: false, execute: true },
            SegmentKind::Data => Protection { read: true, write: true, execute: false },
        }
    }
}

/// The kind of payload a section holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Data,
    Text,
    Code,
    /// Guest bytecode; the payload is supplied to the encoder, not stored here.
    Bytecode,
    /// Zero-filled, never occupies file bytes.
    Bss,
    Const,
}

/// Handle to a segment of an [`Image`](crate::image::Image).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentId(pub(crate) usize);

/// Handle to a section of an [`Image`](crate::image::Image).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionId {
    pub(crate) segment: usize,
    pub(crate) index: usize,
}

impl SectionId {
    pub fn segment(&self) -> SegmentId {
        SegmentId(self.segment)
    }
}

/// One contiguous span of data within a segment.
#[derive(Debug, Clone)]
pub struct Section {
    pub kind: SectionKind,
    /// Logical payload size in bytes.
    pub size: u64,
    /// Payload, or `None` for zero-filled sections and the bytecode placeholder.
    pub data: Option<Vec<u8>>,
    pub vm_align: u64,
    /// Offset from the segment's `vm_start`.
    pub vm_offset_to_seg: u64,
    /// `size` rounded up to `vm_align`.
    pub vm_size: u64,
    /// Effective file alignment; zero when the section has no file content.
    pub file_align: u64,
    /// Offset from the segment's `file_start`.
    pub file_offset_to_seg: u64,
    /// Zero bytes written after the payload to honor `file_align`.
    pub file_padding: u64,
}

impl Section {
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn occupies_file(&self) -> bool {
        self.file_align != 0
    }

    /// Bytes this section contributes to the output file.
    pub fn file_extent(&self) -> u64 {
        if self.occupies_file() {
            self.size + self.file_padding
        } else {
            0
        }
    }
}

/// One contiguous virtual-memory region of the output image.
#[derive(Debug, Clone)]
pub struct Segment {
    pub kind: SegmentKind,
    pub vm_align: u64,
    pub vm_start: u64,
    pub vm_size: u64,
    /// Position of the segment's content relative to the start of the data area.
    pub file_start: u64,
    /// File alignment handed down to the sections; zero means no file content.
    pub file_align: u64,
    pub file_size: u64,
    sections: Vec<Section>,
}

impl Segment {
    pub(crate) fn new(
        kind: SegmentKind,
        vm_align: u64,
        vm_start: u64,
        vm_size: u64,
        file_start: u64,
        file_align: u64,
    ) -> Self {
        Self {
            kind,
            vm_align,
            vm_start,
            vm_size,
            file_start,
            file_align,
            file_size: 0,
            sections: Vec::new(),
        }
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// First address past the segment.
    pub fn vm_end(&self) -> u64 {
        self.vm_start + self.vm_size
    }

    /// True if `[start, end)` intersects this segment's virtual range.
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        start < self.vm_end() && self.vm_start < end
    }

    /// Virtual extent actually used by sections.
    pub fn content_size(&self) -> u64 {
        self.sections
            .last()
            .map(|s| s.vm_offset_to_seg + s.vm_size)
            .unwrap_or(0)
    }

    /// Largest alignment requested by any section, or the segment's own if it has none.
    pub fn max_section_align(&self) -> u64 {
        self.sections
            .iter()
            .map(|s| s.vm_align)
            .max()
            .unwrap_or(self.vm_align)
    }

    /// Computes where a new section would be placed, without adding it.
    pub(crate) fn place_section(
        &self,
        kind: SectionKind,
        vm_align: u64,
        data: Option<Vec<u8>>,
        size: u64,
    ) -> Result<Section> {
        if !is_valid_align(vm_align) {
            return Err(Error::invalid(format!("section alignment 0x{:x} is not a power of two", vm_align)));
        }
        if vm_align > self.vm_align {
            return Err(Error::invalid(format!(
                "section alignment 0x{:x} exceeds segment alignment 0x{:x}",
                vm_align, self.vm_align
            )));
        }
        if let Some(bytes) = &data {
            if bytes.len() as u64 != size {
                return Err(Error::invalid(format!(
                    "section data is 0x{:x} bytes, declared size is 0x{:x}",
                    bytes.len(),
                    size
                )));
            }
        }

        let too_large = || Error::OutOfSpace { required: size, available: self.vm_size };

        let (vm_offset_to_seg, file_offset_to_seg) = match self.sections.last() {
            Some(prev) => (
                checked_align_up(prev.vm_offset_to_seg + prev.vm_size, vm_align).ok_or_else(too_large)?,
                prev.file_offset_to_seg + prev.file_extent(),
            ),
            None => (0, 0),
        };
        let vm_size = checked_align_up(size, vm_align).ok_or_else(too_large)?;

        let end = vm_offset_to_seg.checked_add(vm_size).ok_or_else(too_large)?;
        if end > self.vm_size {
            return Err(Error::OutOfSpace {
                required: vm_size,
                available: self.vm_size.saturating_sub(vm_offset_to_seg),
            });
        }

        let file_align = if kind == SectionKind::Bss { 0 } else { self.file_align };
        let file_padding = if file_align > 0 {
            checked_align_up(size, file_align).ok_or_else(too_large)? - size
        } else {
            0
        };

        Ok(Section {
            kind,
            size,
            data,
            vm_align,
            vm_offset_to_seg,
            vm_size,
            file_align,
            file_offset_to_seg,
            file_padding,
        })
    }

    /// Appends an already placed section and returns its index.
    pub(crate) fn push_section(&mut self, section: Section) -> Result<usize> {
        self.sections.try_reserve(1)?;
        self.file_size += section.file_extent();
        self.sections.push(section);
        Ok(self.sections.len() - 1)
    }
}
