use std::path::PathBuf;

use thiserror::Error;

use crate::model::{CrossReference, Function, IrInstruction, Section, Symbol};

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Image I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse image: {0}")]
    Parse(String),
    #[error("Address 0x{0:X} is not backed by image bytes")]
    Unmapped(u64),
    #[error("Write of {len} bytes at 0x{address:X} runs past the end of its section")]
    OutOfBounds { address: u64, len: usize },
}

/// Host view of an analyzed executable image.
///
/// Implemented by whatever owns disassembly and analysis (an in-memory table
/// for tests, an ELF loader, a disassembler plugin). The patch pipeline only
/// talks to the image through this trait.
pub trait BinaryImage {
    /// Architecture identifier, e.g. `x86_64` or `arm64`.
    fn architecture(&self) -> &str;

    /// Address width in bytes (4 or 8).
    fn address_size(&self) -> usize;

    fn symbol_by_raw_name(&self, name: &str) -> Option<Symbol>;

    /// All code locations that reference `address`.
    fn code_refs(&self, address: u64) -> Vec<CrossReference>;

    /// Functions whose body covers `address`, in host order.
    fn functions_containing(&self, address: u64) -> Vec<Function>;

    /// Lowers the instruction at `address` inside `function` to call semantics.
    fn call_instruction_at(&self, function: &Function, address: u64) -> Option<IrInstruction>;

    fn sections(&self) -> Vec<Section>;

    fn functions(&self) -> Vec<Function>;

    /// Disassembly text for diagnostics.
    fn disassembly_at(&self, address: u64) -> Option<String>;

    /// Encoded length of the instruction starting at `address`.
    fn instruction_length(&self, address: u64) -> Option<usize>;

    fn read(&self, address: u64, len: usize) -> Option<Vec<u8>>;

    fn write(&mut self, address: u64, bytes: &[u8]) -> Result<usize, ImageError>;

    /// Re-runs analysis of `function` after its bytes changed.
    fn reanalyze(&mut self, function: &Function);
}
