//! Entry point for the ivmld image builder.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap` and set up logging.
//! 2. Map the VM object file and extract the VM routines.
//! 3. Read the guest bytecode.
//! 4. Execute the pipeline: create, load VM, reserve data, write.
//!
//! Errors are reported via `anyhow`; the exit status is the failing step's error
//! code.

use anyhow::{Context, Result};
use clap::Parser;
use memmap2::Mmap;
use std::fs::{self, File};
use tracing_subscriber::EnvFilter;

use ivmld::config::Config;
use ivmld::error::Error;
use ivmld::linker::Linker;
use ivmld::vm::VmRoutines;

fn run(config: &Config) -> Result<()> {
    let vm_file = File::open(&config.vm_object)
        .with_context(|| format!("failed to open {}", config.vm_object.display()))?;
    // SAFETY: the mapping is only read while the file is open.
    let mmap = unsafe { Mmap::map(&vm_file)? };
    let routines = VmRoutines::from_object(&config.vm_id, &mmap, &config.routine_names())
        .with_context(|| format!("failed to read VM from {}", config.vm_object.display()))?;

    let bytecode = fs::read(&config.bytecode)
        .with_context(|| format!("failed to read {}", config.bytecode.display()))?;

    let mut linker = Linker::new(config.options()?)?;
    linker.load_vm(&routines)?;
    linker.reserve_data(bytecode.len() as u64)?;
    linker.write(&config.output, &bytecode)?;
    Ok(())
}

fn main() {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(&config) {
        eprintln!("error: {:#}", err);
        let code = err.downcast_ref::<Error>().map(Error::errno).unwrap_or(1);
        std::process::exit(code);
    }
    println!("Built {}", config.output.display());
}
