//! Table-driven images and a scripted encoder for pipeline tests.

use std::cell::RefCell;

use callpatch_core::model::Argument;
use callpatch_core::services::backends::MemoryImage;
use callpatch_core::services::encoder::{EncodeError, EncoderMode, InstructionEncoder};

pub const BASE: u64 = 0x1000;
pub const SIZE: usize = 0x1000;
pub const MAIN: (u64, u64) = (0x1000, 0x1100);
pub const PLT_SEC: (u64, u64) = (0x1800, 0x1830);
pub const PRINTF: u64 = 0x1800;
pub const PUTS: u64 = 0x1810;

/// `printf(buf)`
pub const ELIGIBLE: u64 = 0x1010;
/// `printf("%d\n", x)`
pub const TWO_ARGS: u64 = 0x1020;
/// `printf("hello\n")`
pub const LITERAL: u64 = 0x1030;

/// Image without any call sites: `.text`, `.plt.sec`, main, printf, puts.
pub fn base_image() -> MemoryImage {
    MemoryImage::x86_64(BASE, SIZE)
        .with_section(".text", BASE, PLT_SEC.0)
        .with_section(".plt.sec", PLT_SEC.0, PLT_SEC.1)
        .with_named_function("main", MAIN.0, MAIN.1)
        .with_named_function("printf", PRINTF, PRINTF + 0x10)
        .with_named_function("puts", PUTS, PUTS + 0x10)
}

/// `main` calling printf three times; only the first call is eligible.
pub fn printf_image() -> MemoryImage {
    base_image()
        .with_call(ELIGIBLE, PRINTF, 5, vec![Argument::variable("rax")])
        .with_call(
            TWO_ARGS,
            PRINTF,
            5,
            vec![Argument::literal("0x2004"), Argument::variable("esi")],
        )
        .with_call(LITERAL, PRINTF, 5, vec![Argument::literal("0x2010")])
}

/// `E8 rel32` for a call placed at `from`.
pub fn rel_call(from: u64, target: u64) -> Vec<u8> {
    let rel = (target as i64 - (from as i64 + 5)) as i32;
    let mut bytes = vec![0xE8];
    bytes.extend_from_slice(&rel.to_le_bytes());
    bytes
}

/// Encodes `call 0x...` as `E8 rel32` and fails on chosen addresses.
///
/// Every address it is asked to assemble at is recorded.
pub struct ScriptedEncoder {
    mode: EncoderMode,
    fail_at: Vec<u64>,
    seen: RefCell<Vec<u64>>,
}

impl ScriptedEncoder {
    pub fn new() -> Self {
        Self { mode: EncoderMode::Mode64, fail_at: Vec::new(), seen: RefCell::new(Vec::new()) }
    }

    pub fn with_mode(mode: EncoderMode) -> Self {
        Self { mode, ..Self::new() }
    }

    pub fn failing_at(addresses: &[u64]) -> Self {
        Self { fail_at: addresses.to_vec(), ..Self::new() }
    }

    pub fn seen(&self) -> Vec<u64> {
        self.seen.borrow().clone()
    }
}

impl InstructionEncoder for ScriptedEncoder {
    fn assemble(&self, text: &str, address: u64) -> Result<Vec<u8>, EncodeError> {
        self.seen.borrow_mut().push(address);
        if self.fail_at.contains(&address) {
            return Err(EncodeError::Assembler(format!("scripted failure at {address:#x}")));
        }
        let target = text
            .strip_prefix("call 0x")
            .and_then(|hex| u64::from_str_radix(hex, 16).ok())
            .ok_or_else(|| EncodeError::Syntax(text.to_string()))?;
        Ok(rel_call(address, target))
    }

    fn mode(&self) -> EncoderMode {
        self.mode
    }
}
