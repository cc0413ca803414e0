//! Image builder.
//!
//! An [`Image`] owns an ordered list of segments (insertion order is both address
//! order and file order), the running counters the encoders need to size their header
//! tables, and the entry-point record of the embedded VM.
//!
//! Building an image follows a fixed protocol:
//! 1. [`Image::create`] (or [`Image::with_config`]).
//! 2. Optionally add a NULL guard segment with [`Image::add_segment`].
//! 3. [`Image::load_vm_code`] places the VM routines in a CODE segment.
//! 4. [`Image::reserve_vm_data`] adds the DATA segment holding the runtime state and
//!    the bytecode placeholder. It embeds addresses computed in step 3.
//!
//! The finished image is handed to an [`Encoder`](crate::format::Encoder).

use crate::error::{Error, Result};
use crate::layout::{Section, SectionId, SectionKind, Segment, SegmentId, SegmentKind};
use crate::runtime::{EntryPoint, RuntimeLayout};
use crate::utils::{checked_align_up, is_valid_align};
use crate::vm::VmRoutines;

pub const DEFAULT_PAGE_SIZE: u64 = 0x1000;

/// Alignment of the runtime-state section inside the DATA segment.
const RUNTIME_ALIGN: u64 = 16;

/// Parameters fixed when an image is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageConfig {
    /// Depth of the VM's internal state stack.
    pub state_stack_size: u64,
    /// Size of one frame of guest memory; a power of two.
    pub frame_size: u64,
    pub frame_count: u64,
    /// Default alignment unit for segments.
    pub page_size: u64,
    /// Where automatic placement starts when there is no previous segment.
    pub base_addr: u64,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            state_stack_size: 0x10,
            frame_size: 0x400,
            frame_count: 0x100,
            page_size: DEFAULT_PAGE_SIZE,
            base_addr: 0,
        }
    }
}

#[derive(Debug)]
pub struct Image {
    segments: Vec<Segment>,
    entry: EntryPoint,
    runtime: RuntimeLayout,
    vm_entry_point: u64,
    vm_file_offset: u64,
    file_size: u64,
    num_segments: usize,
    num_sections: usize,
    page_size: u64,
    base_addr: u64,
    code_loaded: bool,
    data_reserved: bool,
}

impl Image {
    /// Creates an empty image with the default page size.
    pub fn create(state_stack_size: u64, frame_size: u64, frame_count: u64) -> Result<Self> {
        Self::with_config(ImageConfig {
            state_stack_size,
            frame_size,
            frame_count,
            ..ImageConfig::default()
        })
    }

    pub fn with_config(config: ImageConfig) -> Result<Self> {
        if !is_valid_align(config.page_size) {
            return Err(Error::invalid(format!("page size 0x{:x} is not a power of two", config.page_size)));
        }
        let runtime = RuntimeLayout::new(config.state_stack_size, config.frame_size, config.frame_count)?;
        let entry = EntryPoint {
            state_stack_size: config.state_stack_size,
            mem_size: runtime.capacity(),
            ..EntryPoint::default()
        };

        tracing::debug!(
            "created image: page size 0x{:x}, runtime state 0x{:x} bytes, capacity 0x{:x}",
            config.page_size,
            runtime.size,
            runtime.capacity()
        );

        Ok(Self {
            segments: Vec::new(),
            entry,
            runtime,
            vm_entry_point: 0,
            vm_file_offset: 0,
            file_size: 0,
            num_segments: 0,
            num_sections: 0,
            page_size: config.page_size,
            base_addr: config.base_addr,
            code_loaded: false,
            data_reserved: false,
        })
    }

    /// Destroys the image with everything it owns. Safe at any stage of construction.
    pub fn remove(self) {
        tracing::trace!("removing image with {} segments", self.segments.len());
    }

    /// Address where execution begins (the loader routine).
    pub fn vm_entry_point(&self) -> u64 {
        self.vm_entry_point
    }

    /// Offset of the loader routine from the start of the data area.
    pub fn vm_file_offset(&self) -> u64 {
        self.vm_file_offset
    }

    /// Bytes consumed by section content, excluding encoder headers and trailers.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn num_segments(&self) -> usize {
        self.num_segments
    }

    pub fn num_sections(&self) -> usize {
        self.num_sections
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment(&self, id: SegmentId) -> Option<&Segment> {
        self.segments.get(id.0)
    }

    pub fn section(&self, id: SectionId) -> Option<&Section> {
        self.segments.get(id.segment)?.sections().get(id.index)
    }

    /// The VM's entry-point record as filled in so far.
    pub fn entry_point(&self) -> &EntryPoint {
        &self.entry
    }

    pub fn runtime_layout(&self) -> &RuntimeLayout {
        &self.runtime
    }

    /// Where a segment would start if added now.
    fn place_segment(&self, vm_align: u64, vm_addr: Option<u64>) -> Option<u64> {
        match (vm_addr, self.segments.last()) {
            (Some(addr), _) => checked_align_up(addr, vm_align),
            (None, Some(prev)) => checked_align_up(prev.vm_end(), vm_align),
            (None, None) => checked_align_up(self.base_addr, vm_align),
        }
    }

    /// Creates a segment and appends it to the image.
    ///
    /// With `vm_addr` of `None` the segment follows the previous one. Either way the
    /// start is rounded up to `vm_align`. The new range must not overlap, or precede,
    /// any existing segment.
    pub fn add_segment(
        &mut self,
        kind: SegmentKind,
        vm_align: u64,
        vm_addr: Option<u64>,
        vm_size: u64,
        file_align: u64,
    ) -> Result<SegmentId> {
        if !is_valid_align(vm_align) {
            return Err(Error::invalid(format!("segment alignment 0x{:x} is not a power of two", vm_align)));
        }
        if file_align != 0 && !is_valid_align(file_align) {
            return Err(Error::invalid(format!("file alignment 0x{:x} is not a power of two", file_align)));
        }

        let start = self
            .place_segment(vm_align, vm_addr)
            .ok_or_else(|| Error::invalid("segment start address overflows"))?;
        let end = start
            .checked_add(vm_size)
            .ok_or(Error::AddressOverlap { start, end: u64::MAX })?;

        if self.segments.iter().any(|seg| seg.overlaps(start, end)) {
            return Err(Error::AddressOverlap { start, end });
        }
        if let Some(prev) = self.segments.last() {
            if start < prev.vm_end() {
                return Err(Error::AddressOverlap { start, end });
            }
        }

        self.segments.try_reserve(1)?;
        self.segments
            .push(Segment::new(kind, vm_align, start, vm_size, self.file_size, file_align));
        self.num_segments += 1;

        tracing::debug!(
            "segment {:?}: vm 0x{:x}..0x{:x}, file start 0x{:x}",
            kind,
            start,
            end,
            self.file_size
        );
        Ok(SegmentId(self.segments.len() - 1))
    }

    /// Adds a segment and runs `fill` on it. If `fill` fails the segment is removed
    /// again, together with whatever sections it received.
    fn with_new_segment<T>(
        &mut self,
        kind: SegmentKind,
        vm_addr: Option<u64>,
        vm_size: u64,
        fill: impl FnOnce(&mut Self, SegmentId) -> Result<T>,
    ) -> Result<T> {
        let page = self.page_size;
        let segment = self.add_segment(kind, page, vm_addr, vm_size, page)?;
        let filled = fill(self, segment);
        if filled.is_err() {
            self.pop_segment();
        }
        filled
    }

    /// Removes the last segment and its share of the counters.
    fn pop_segment(&mut self) {
        if let Some(seg) = self.segments.pop() {
            self.num_segments -= 1;
            self.num_sections -= seg.sections().len();
            self.file_size -= seg.file_size;
            tracing::debug!("dropped segment {:?} at 0x{:x}", seg.kind, seg.vm_start);
        }
    }

    /// Creates a section and appends it to `segment`.
    ///
    /// Sections with file content can only go into the last segment, since the file
    /// positions of later segments are already fixed.
    pub fn add_section(
        &mut self,
        segment: SegmentId,
        kind: SectionKind,
        vm_align: u64,
        data: Option<Vec<u8>>,
        size: u64,
    ) -> Result<SectionId> {
        let is_last = segment.0 + 1 == self.segments.len();
        let seg = self
            .segments
            .get_mut(segment.0)
            .ok_or_else(|| Error::invalid(format!("no segment with index {}", segment.0)))?;

        let section = seg.place_section(kind, vm_align, data, size)?;
        if section.occupies_file() && !is_last {
            return Err(Error::invalid("cannot add file content to a segment followed by another segment"));
        }

        tracing::debug!(
            "section {:?}: vm 0x{:x} (+0x{:x}), file +0x{:x}, 0x{:x} bytes + 0x{:x} padding",
            kind,
            seg.vm_start + section.vm_offset_to_seg,
            section.vm_size,
            section.file_offset_to_seg,
            section.size,
            section.file_padding
        );

        let extent = section.file_extent();
        let index = seg.push_section(section)?;
        self.file_size += extent;
        self.num_sections += 1;
        Ok(SectionId { segment: segment.0, index })
    }

    /// Copies the VM routines into a new CODE segment.
    ///
    /// The routines are staged back to back, loader first, each rounded up to
    /// `code_align`. The loader's address becomes the image entry point; the machine
    /// and interrupt addresses go into the entry-point record.
    pub fn load_vm_code(&mut self, routines: &VmRoutines, code_addr: Option<u64>, code_align: u64) -> Result<()> {
        if self.code_loaded {
            return Err(Error::invalid("VM code is already loaded"));
        }
        if !is_valid_align(code_align) || code_align > self.page_size {
            return Err(Error::invalid(format!("code alignment 0x{:x} is not valid", code_align)));
        }
        if routines.loader.code.is_empty() {
            return Err(Error::invalid("VM loader routine is empty"));
        }
        let mut entry = self.entry.clone();
        entry.set_id(&routines.id)?;

        let mut offsets = [0u64; 3];
        let mut staged = 0u64;
        for (offset, routine) in offsets.iter_mut().zip(routines.in_load_order()) {
            *offset = staged;
            staged = staged
                .checked_add(routine.size())
                .and_then(|n| checked_align_up(n, code_align))
                .ok_or_else(|| Error::invalid("VM code too large"))?;
        }

        let mut buffer = Vec::new();
        buffer.try_reserve_exact(staged as usize)?;
        for (offset, routine) in offsets.iter().zip(routines.in_load_order()) {
            buffer.resize(*offset as usize, 0);
            buffer.extend_from_slice(&routine.code);
        }
        buffer.resize(staged as usize, 0);
        let [loader_off, machine_off, intr_off] = offsets;

        let section = self.with_new_segment(SegmentKind::Code, code_addr, staged, |image, segment| {
            image.add_section(segment, SectionKind::Code, code_align, Some(buffer), staged)
        })?;

        let seg = &self.segments[section.segment];
        let sect = &seg.sections()[section.index];
        let start = seg.vm_start + sect.vm_offset_to_seg;
        self.vm_entry_point = start + loader_off;
        self.vm_file_offset = seg.file_start + sect.file_offset_to_seg + loader_off;
        entry.machine_addr = start + machine_off;
        entry.intr_addr = start + intr_off;
        self.entry = entry;
        self.code_loaded = true;

        tracing::info!(
            "loaded VM {:?}: entry 0x{:x}, machine 0x{:x}, interrupt 0x{:x}",
            routines.id,
            self.vm_entry_point,
            self.entry.machine_addr,
            self.entry.intr_addr
        );
        Ok(())
    }

    /// Adds the DATA segment at `data_addr`: the VM runtime state followed by room for
    /// `bytecode_size` bytes of guest bytecode. Must run after [`Image::load_vm_code`].
    pub fn reserve_vm_data(&mut self, data_addr: u64, bytecode_size: u64) -> Result<SectionId> {
        if !self.code_loaded {
            return Err(Error::invalid("VM code must be loaded before reserving VM data"));
        }
        if self.data_reserved {
            return Err(Error::invalid("VM data is already reserved"));
        }
        let capacity = self.runtime.capacity();
        if bytecode_size > capacity {
            return Err(Error::invalid(format!(
                "bytecode is 0x{:x} bytes, capacity is 0x{:x}",
                bytecode_size, capacity
            )));
        }

        let page = self.page_size;
        let placed = self
            .place_segment(page, Some(data_addr))
            .ok_or_else(|| Error::invalid("data address overflows"))?;
        if placed != data_addr {
            return Err(Error::AddressMismatch { expected: data_addr, actual: placed });
        }

        let state_size = self.runtime.size;
        let too_large = || Error::invalid("data segment too large");
        let bytecode_offset = checked_align_up(state_size, RUNTIME_ALIGN)
            .and_then(|n| checked_align_up(n, page))
            .ok_or_else(too_large)?;
        let vm_size = checked_align_up(capacity, page)
            .and_then(|n| n.checked_add(bytecode_offset))
            .ok_or_else(too_large)?;
        // Every address below is inside this range.
        let end = data_addr
            .checked_add(vm_size)
            .ok_or(Error::AddressOverlap { start: data_addr, end: u64::MAX })?;

        let mut entry = self.entry.clone();
        entry.data_addr = data_addr;
        entry.mem_addr = data_addr + bytecode_offset;
        entry.mem_size = capacity;
        entry.regs_addr = data_addr + self.runtime.offset_to_regs;
        entry.states_addr = data_addr + self.runtime.offset_to_states;
        entry.frames_addr = data_addr + self.runtime.offset_to_frames;
        debug_assert!(entry.mem_addr + capacity <= end);
        let state = self.runtime.encode(&entry, bytecode_size)?;

        let mem_addr = entry.mem_addr;
        let bytecode = self.with_new_segment(SegmentKind::Data, Some(data_addr), vm_size, |image, segment| {
            image.add_section(segment, SectionKind::Data, RUNTIME_ALIGN, Some(state), state_size)?;
            let bytecode = image.add_section(segment, SectionKind::Bytecode, page, None, bytecode_size)?;
            let actual = image.segments[segment.0].vm_start
                + image.segments[segment.0].sections()[bytecode.index].vm_offset_to_seg;
            if actual != mem_addr {
                return Err(Error::AddressMismatch { expected: mem_addr, actual });
            }
            Ok(bytecode)
        })?;

        self.entry = entry;
        self.data_reserved = true;
        tracing::info!(
            "reserved VM data at 0x{:x}: bytecode 0x{:x} bytes at 0x{:x}",
            data_addr,
            bytecode_size,
            self.entry.mem_addr
        );
        Ok(bytecode)
    }
}
