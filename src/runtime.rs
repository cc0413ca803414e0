//! VM runtime state.
//!
//! The embedded VM finds itself through a record written into the first section of
//! its DATA segment. The record is a fixed sequence of 16-byte aligned blocks, all
//! little-endian, holding absolute addresses only:
//!
//! | block        | size                        |
//! |--------------|-----------------------------|
//! | entry point  | 96                          |
//! | registers    | 1120                        |
//! | state stack  | 16 × `state_stack_size`     |
//! | frame table  | 16 + 16 × `frame_count`     |
//!
//! The frame table splits the guest bytecode area into `frame_size` slices.

use crate::error::{Error, Result};
use crate::utils::align_up;

pub const ID_LEN: usize = 16;

const ENTRY_POINT_SIZE: u64 = 96;
/// ip, sb, sp, bp, imask, intr, then the interrupt vectors and general registers.
const REGISTERS_SIZE: u64 = (20 + 4 * NUM_INTERRUPT_VECTORS as u64 + 4 * NUM_REGISTERS as u64 + 15) & !15;
const STATE_SIZE: u64 = 16;
const FRAME_TABLE_HEADER_SIZE: u64 = 16;
const FRAME_SIZE: u64 = 16;

pub const NUM_INTERRUPT_VECTORS: usize = 16;
pub const NUM_REGISTERS: usize = 256;

/// All interrupts masked until the guest installs vectors.
pub const DEFAULT_INTERRUPT_MASK: u16 = 0xffff;

/// Frame attributes.
pub const FRAME_ATTR_READ: u16 = 0x0001;
pub const FRAME_ATTR_WRITE: u16 = 0x0002;
pub const FRAME_ATTR_EXEC: u16 = 0x0004;
pub const FRAME_ATTR_ALLOC: u16 = 0x0008;

/// Addresses describing where the VM and its data live once the image is mapped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryPoint {
    pub id: [u8; ID_LEN],
    pub state_stack_size: u64,
    pub data_addr: u64,
    /// Start of the guest bytecode area.
    pub mem_addr: u64,
    /// Capacity of the guest bytecode area.
    pub mem_size: u64,
    pub machine_addr: u64,
    pub intr_addr: u64,
    pub regs_addr: u64,
    pub states_addr: u64,
    pub frames_addr: u64,
}

impl EntryPoint {
    /// Stores `id` as a NUL terminated string.
    pub fn set_id(&mut self, id: &str) -> Result<()> {
        let bytes = id.as_bytes();
        if bytes.len() >= ID_LEN || bytes.contains(&0) {
            return Err(Error::invalid(format!("VM id {:?} does not fit in {} bytes", id, ID_LEN - 1)));
        }
        self.id = [0; ID_LEN];
        self.id[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn id(&self) -> &str {
        let len = self.id.iter().position(|&b| b == 0).unwrap_or(ID_LEN);
        std::str::from_utf8(&self.id[..len]).unwrap_or("")
    }
}

/// Sizes and offsets of the runtime-state blocks, fixed when the image is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeLayout {
    pub state_stack_size: u64,
    pub frame_size: u64,
    pub frame_count: u64,
    pub offset_to_regs: u64,
    pub offset_to_states: u64,
    pub offset_to_frames: u64,
    pub size: u64,
}

impl RuntimeLayout {
    pub fn new(state_stack_size: u64, frame_size: u64, frame_count: u64) -> Result<Self> {
        if state_stack_size == 0 {
            return Err(Error::invalid("state stack size must be non-zero"));
        }
        if !frame_size.is_power_of_two() {
            return Err(Error::invalid(format!("frame size 0x{:x} is not a power of two", frame_size)));
        }
        if frame_count == 0 {
            return Err(Error::invalid("frame count must be non-zero"));
        }
        if frame_size.checked_mul(frame_count).is_none() {
            return Err(Error::invalid("frame table capacity overflows"));
        }

        let states_len = state_stack_size
            .checked_mul(STATE_SIZE)
            .ok_or_else(|| Error::invalid("state stack too large"))?;
        let frames_len = frame_count
            .checked_mul(FRAME_SIZE)
            .and_then(|n| n.checked_add(FRAME_TABLE_HEADER_SIZE))
            .ok_or_else(|| Error::invalid("frame table too large"))?;

        let offset_to_regs = ENTRY_POINT_SIZE;
        let offset_to_states = offset_to_regs + REGISTERS_SIZE;
        let offset_to_frames = offset_to_states
            .checked_add(states_len)
            .ok_or_else(|| Error::invalid("state stack too large"))?;
        let size = offset_to_frames
            .checked_add(frames_len)
            .ok_or_else(|| Error::invalid("frame table too large"))?;

        Ok(Self {
            state_stack_size,
            frame_size,
            frame_count,
            offset_to_regs,
            offset_to_states,
            offset_to_frames,
            size,
        })
    }

    /// Bytes of guest memory reachable through the frame table.
    pub fn capacity(&self) -> u64 {
        self.frame_size * self.frame_count
    }

    pub fn fnum_shift(&self) -> u64 {
        self.frame_size.trailing_zeros() as u64
    }

    /// Serializes the runtime state for an image whose entry point is `entry`.
    ///
    /// `bytecode_size` marks how many leading frames hold guest code.
    pub fn encode(&self, entry: &EntryPoint, bytecode_size: u64) -> Result<Vec<u8>> {
        if entry.mem_addr.checked_add(self.capacity()).is_none() {
            return Err(Error::invalid(format!(
                "guest memory at 0x{:x} runs past the end of the address space",
                entry.mem_addr
            )));
        }
        let mut out = Vec::new();
        out.try_reserve_exact(self.size as usize)?;

        // Entry point record.
        out.extend_from_slice(&entry.id);
        for value in [
            entry.state_stack_size,
            entry.data_addr,
            entry.mem_addr,
            entry.mem_size,
            entry.machine_addr,
            entry.intr_addr,
            entry.regs_addr,
            entry.states_addr,
            entry.frames_addr,
        ] {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out.resize(self.offset_to_regs as usize, 0);

        // Registers: ip, sb, sp, bp, imask, intr, iv[], r[].
        let regs = out.len();
        out.resize(regs + REGISTERS_SIZE as usize, 0);
        out[regs + 16..regs + 18].copy_from_slice(&DEFAULT_INTERRUPT_MASK.to_le_bytes());

        // State stack starts out empty.
        out.resize(self.offset_to_frames as usize, 0);

        out.extend_from_slice(&self.frame_count.to_le_bytes());
        out.extend_from_slice(&self.fnum_shift().to_le_bytes());
        let code_frames = align_up(bytecode_size, self.frame_size) / self.frame_size;
        for i in 0..self.frame_count {
            let attr = if i < code_frames {
                FRAME_ATTR_READ | FRAME_ATTR_WRITE | FRAME_ATTR_EXEC | FRAME_ATTR_ALLOC
            } else {
                FRAME_ATTR_READ | FRAME_ATTR_WRITE | FRAME_ATTR_ALLOC
            };
            out.extend_from_slice(&(entry.mem_addr + i * self.frame_size).to_le_bytes());
            out.extend_from_slice(&attr.to_le_bytes());
            out.extend_from_slice(&(-1i16).to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
        }

        debug_assert_eq!(out.len() as u64, self.size);
        Ok(out)
    }
}
