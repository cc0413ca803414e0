//! Executable image builder for a bytecode VM.
//!
//! This library lays out a VM and its guest bytecode as a native executable.
//! It is organized into several modules:
//! - `config`: CLI configuration.
//! - `error`: Builder error kinds.
//! - `layout`: Segments and sections, and their placement arithmetic.
//! - `image`: The image builder and the VM embedding protocol.
//! - `runtime`: The VM's runtime-state record.
//! - `vm`: VM routines and their extraction from object files.
//! - `format`: ELF and Mach-O encoders.
//! - `linker`: The end-to-end pipeline.

pub mod config;
pub mod error;
pub mod format;
pub mod image;
pub mod layout;
pub mod linker;
pub mod runtime;
pub mod utils;
pub mod vm;
