//! VM self-description.
//!
//! The embedded VM is an opaque code blob made of three routines: the loader (the
//! image entry point), the machine loop, and the interrupt handler. Each routine is
//! carried as an explicit byte buffer; [`VmRoutines::from_object`] extracts them from
//! a compiled object file or shared library by symbol name.

use anyhow::{anyhow, Context, Result};
use object::{Object, ObjectSection, ObjectSymbol, SymbolKind};

/// One VM routine: its symbol name, its address in the file it came from, and its code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRoutine {
    pub name: String,
    pub addr: u64,
    pub code: Vec<u8>,
}

impl VmRoutine {
    pub fn new(name: &str, addr: u64, code: Vec<u8>) -> Self {
        Self { name: name.to_string(), addr, code }
    }

    pub fn size(&self) -> u64 {
        self.code.len() as u64
    }
}

/// The three routines making up a VM implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRoutines {
    /// Identifier stored in the entry-point record.
    pub id: String,
    pub interrupt: VmRoutine,
    pub machine: VmRoutine,
    pub loader: VmRoutine,
}

/// Symbol names of the VM routines inside an object file.
#[derive(Debug, Clone)]
pub struct RoutineNames {
    pub loader: String,
    pub machine: String,
    pub interrupt: String,
}

impl Default for RoutineNames {
    fn default() -> Self {
        Self {
            loader: "__loader".to_string(),
            machine: "__vm".to_string(),
            interrupt: "__interrupt".to_string(),
        }
    }
}

impl VmRoutines {
    /// Reads the three routines out of an ELF or Mach-O object/shared library.
    pub fn from_object(id: &str, data: &[u8], names: &RoutineNames) -> Result<Self> {
        let obj = object::File::parse(data).context("failed to parse VM object file")?;
        Ok(Self {
            id: id.to_string(),
            interrupt: extract_routine(&obj, &names.interrupt)?,
            machine: extract_routine(&obj, &names.machine)?,
            loader: extract_routine(&obj, &names.loader)?,
        })
    }

    /// Routines in staging order: loader first, since it is the entry point.
    pub fn in_load_order(&self) -> [&VmRoutine; 3] {
        [&self.loader, &self.machine, &self.interrupt]
    }
}

fn extract_routine(obj: &object::File<'_>, name: &str) -> Result<VmRoutine> {
    let symbol = obj
        .symbols()
        .find(|s| s.is_definition() && symbol_matches(s.name().unwrap_or(""), name))
        .ok_or_else(|| anyhow!("VM routine {} not found", name))?;
    let section_index = symbol
        .section_index()
        .ok_or_else(|| anyhow!("VM routine {} is not defined in a section", name))?;
    let section = obj.section_by_index(section_index)?;

    if symbol.kind() != SymbolKind::Text {
        tracing::warn!("VM routine {} has symbol kind {:?}", name, symbol.kind());
    }
    if section.relocations().next().is_some() {
        tracing::warn!(
            "section {} holding {} has relocations; captured code is not relocated",
            section.name().unwrap_or("?"),
            name
        );
    }

    let size = match symbol.size() {
        0 => distance_to_next_symbol(obj, &section, symbol.address()),
        size => size,
    };

    let bytes = section.data()?;
    let start = symbol
        .address()
        .checked_sub(section.address())
        .ok_or_else(|| anyhow!("VM routine {} lies before its section", name))? as usize;
    let end = start
        .checked_add(size as usize)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| anyhow!("VM routine {} extends past its section", name))?;

    tracing::debug!("VM routine {} at 0x{:x}, 0x{:x} bytes", name, symbol.address(), size);
    Ok(VmRoutine::new(name, symbol.address(), bytes[start..end].to_vec()))
}

/// Mach-O prefixes C symbols with an underscore.
fn symbol_matches(symbol: &str, name: &str) -> bool {
    symbol == name || symbol.strip_prefix('_') == Some(name)
}

/// Size of a symbol without a recorded size: up to the next symbol in the same
/// section, or the end of the section.
fn distance_to_next_symbol(obj: &object::File<'_>, section: &object::Section<'_, '_>, addr: u64) -> u64 {
    let section_end = section.address() + section.size();
    let next = obj
        .symbols()
        .filter(|s| s.section_index() == Some(section.index()) && s.kind() != SymbolKind::Section)
        .map(|s| s.address())
        .filter(|&a| a > addr)
        .min()
        .unwrap_or(section_end);
    next.min(section_end) - addr
}
