//! Instruction encoding: textual assembly to machine code at a fixed address.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Addressing mode for the x86 family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderMode {
    Mode32,
    Mode64,
}

impl EncoderMode {
    /// Picks the mode for a host address width in bytes.
    pub fn from_address_size(size: usize) -> Option<Self> {
        match size {
            4 => Some(EncoderMode::Mode32),
            8 => Some(EncoderMode::Mode64),
            _ => None,
        }
    }

    pub fn bitness(&self) -> u32 {
        match self {
            EncoderMode::Mode32 => 32,
            EncoderMode::Mode64 => 64,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Invalid assembly syntax: {0}")]
    Syntax(String),
    #[error("Unsupported instruction or operand: {0}")]
    Unsupported(String),
    #[error("Assembler error: {0}")]
    Assembler(String),
}

/// Assembles one statement as if it were placed at `address`.
pub trait InstructionEncoder {
    fn assemble(&self, text: &str, address: u64) -> Result<Vec<u8>, EncodeError>;

    fn mode(&self) -> EncoderMode;
}

#[cfg(feature = "iced-encoder")]
pub use iced::IcedEncoder;

#[cfg(feature = "iced-encoder")]
mod iced {
    use iced_x86::code_asm::CodeAssembler;
    use iced_x86::IcedError;
    use tracing::trace;

    use super::{EncodeError, EncoderMode, InstructionEncoder};

    fn asm_err(e: IcedError) -> EncodeError {
        EncodeError::Assembler(e.to_string())
    }

    /// Text assembler backed by iced-x86's `CodeAssembler`.
    ///
    /// Only the statements the patcher emits are understood: `call <imm>`,
    /// `jmp <imm>` and `nop`. Immediates may be hex (`0x...`) or decimal.
    #[derive(Debug, Clone, Copy)]
    pub struct IcedEncoder {
        mode: EncoderMode,
    }

    impl IcedEncoder {
        pub fn new(mode: EncoderMode) -> Self {
            Self { mode }
        }

        fn emit(&self, asm: &mut CodeAssembler, text: &str) -> Result<(), EncodeError> {
            let text = text.trim().to_lowercase();
            let mut parts = text.splitn(2, char::is_whitespace);
            let mnemonic = parts.next().unwrap_or("");
            let operand = parts.next().map(str::trim).unwrap_or("");

            trace!(mnemonic = %mnemonic, operand = %operand, "emitting instruction");

            match mnemonic {
                "nop" => asm.nop().map_err(asm_err),
                "call" => {
                    let target = self.parse_target(operand)?;
                    asm.call(target).map_err(asm_err)
                }
                "jmp" => {
                    let target = self.parse_target(operand)?;
                    asm.jmp(target).map_err(asm_err)
                }
                "" => Err(EncodeError::Syntax("empty statement".into())),
                other => Err(EncodeError::Unsupported(other.to_string())),
            }
        }

        fn parse_target(&self, operand: &str) -> Result<u64, EncodeError> {
            let value = parse_imm(operand)?;
            if self.mode == EncoderMode::Mode32 && value > u64::from(u32::MAX) {
                return Err(EncodeError::Unsupported(format!(
                    "target 0x{value:X} out of range for 32-bit mode"
                )));
            }
            Ok(value)
        }
    }

    impl InstructionEncoder for IcedEncoder {
        fn assemble(&self, text: &str, address: u64) -> Result<Vec<u8>, EncodeError> {
            let mut asm = CodeAssembler::new(self.mode.bitness()).map_err(asm_err)?;
            self.emit(&mut asm, text)?;
            asm.assemble(address).map_err(asm_err)
        }

        fn mode(&self) -> EncoderMode {
            self.mode
        }
    }

    fn parse_imm(s: &str) -> Result<u64, EncodeError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EncodeError::Syntax("missing operand".into()));
        }
        let parsed = if let Some(hex) = s.strip_prefix("0x") {
            u64::from_str_radix(hex, 16)
        } else if let Some(hex) = s.strip_suffix('h') {
            u64::from_str_radix(hex, 16)
        } else {
            s.parse::<u64>()
        };
        parsed.map_err(|_| EncodeError::Syntax(format!("invalid immediate '{s}'")))
    }

}
