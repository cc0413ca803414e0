//! Configuration module.
//!
//! This module defines the command-line interface (CLI) using `clap`. It handles the
//! input files, the output path, the image geometry and the VM symbol names.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::error::Result;
use crate::format::Format;
use crate::image::{ImageConfig, DEFAULT_PAGE_SIZE};
use crate::linker::{Options, DEFAULT_CODE_ADDR, DEFAULT_CODE_ALIGN, DEFAULT_DATA_ADDR};
use crate::vm::RoutineNames;

/// Output format selection on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    /// The host operating system's format.
    Auto,
    Elf,
    Macho,
}

impl FormatArg {
    pub fn resolve(self) -> Result<Format> {
        match self {
            FormatArg::Auto => Format::host(),
            FormatArg::Elf => Ok(Format::Elf),
            FormatArg::Macho => Ok(Format::MachO),
        }
    }
}

/// Parses a decimal or `0x`-prefixed hexadecimal integer.
pub fn parse_int(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim().replace('_', "");
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid integer {:?}: {}", s, e))
}

/// Builds a standalone executable embedding a bytecode VM and a guest program.
///
/// The VM routines are read from an object file or shared library; the bytecode
/// file is copied verbatim into the image's data segment.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Object file or shared library providing the VM routines
    pub vm_object: PathBuf,

    /// Guest bytecode to embed
    pub bytecode: PathBuf,

    /// Output file
    #[arg(short, long, default_value = "a.out", help = "Path to the output executable")]
    pub output: PathBuf,

    /// Executable format
    #[arg(long, value_enum, default_value_t = FormatArg::Auto)]
    pub format: FormatArg,

    /// Address of the CODE segment (the entry point)
    #[arg(long, value_parser = parse_int, default_value_t = DEFAULT_CODE_ADDR)]
    pub code_addr: u64,

    /// Alignment of each VM routine
    #[arg(long, value_parser = parse_int, default_value_t = DEFAULT_CODE_ALIGN)]
    pub code_align: u64,

    /// Address of the DATA segment
    #[arg(long, value_parser = parse_int, default_value_t = DEFAULT_DATA_ADDR)]
    pub data_addr: u64,

    /// Size of one guest memory frame (power of two)
    #[arg(long, value_parser = parse_int, default_value_t = ImageConfig::default().frame_size)]
    pub frame_size: u64,

    /// Number of guest memory frames
    #[arg(long, value_parser = parse_int, default_value_t = ImageConfig::default().frame_count)]
    pub frames: u64,

    /// Depth of the VM state stack
    #[arg(long, value_parser = parse_int, default_value_t = ImageConfig::default().state_stack_size)]
    pub state_stack: u64,

    /// Page size used for segment alignment
    #[arg(long, value_parser = parse_int, default_value_t = DEFAULT_PAGE_SIZE)]
    pub page_size: u64,

    /// VM identifier stored in the image
    #[arg(long, default_value = "ivm")]
    pub vm_id: String,

    #[arg(long, default_value = "__loader")]
    pub loader_symbol: String,

    #[arg(long, default_value = "__vm")]
    pub machine_symbol: String,

    #[arg(long, default_value = "__interrupt")]
    pub interrupt_symbol: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", help = "Set the logging level")]
    pub log_level: String,
}

impl Config {
    pub fn routine_names(&self) -> RoutineNames {
        RoutineNames {
            loader: self.loader_symbol.clone(),
            machine: self.machine_symbol.clone(),
            interrupt: self.interrupt_symbol.clone(),
        }
    }

    pub fn options(&self) -> Result<Options> {
        Ok(Options {
            image: ImageConfig {
                state_stack_size: self.state_stack,
                frame_size: self.frame_size,
                frame_count: self.frames,
                page_size: self.page_size,
                base_addr: 0,
            },
            code_addr: self.code_addr,
            code_align: self.code_align,
            data_addr: self.data_addr,
            format: self.format.resolve()?,
        })
    }
}
