#[cfg(feature = "elf-image")]
pub mod elf;
pub mod memory;

#[cfg(feature = "elf-image")]
pub use elf::ElfImage;
pub use memory::{MemoryImage, WriteRecord};
