//! Core data model (IR) for symbols, functions, sections, and call sites.
//!
//! Everything here is transient: a host image hands these out, the patch
//! pipeline consumes them, and nothing is persisted between runs.

use serde::{Deserialize, Serialize};

/// A named address in the image, looked up by exact raw name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub address: u64,
}

impl Symbol {
    pub fn new(name: impl Into<String>, address: u64) -> Self {
        Self { name: name.into(), address }
    }
}

/// How a code location refers to a target address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    Call,
    Jump,
    Data,
}

/// A code location that references some target address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossReference {
    pub from: u64,
    pub kind: RefKind,
}

/// A function known to the host, covering `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub start: u64,
    pub end: u64,
}

impl Function {
    pub fn new(name: impl Into<String>, start: u64, end: u64) -> Self {
        Self { name: name.into(), start, end }
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }
}

/// A named section and its virtual address range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub name: String,
    pub start: u64,
    pub end: u64,
}

impl Section {
    pub fn new(name: impl Into<String>, start: u64, end: u64) -> Self {
        Self { name: name.into(), start, end }
    }
}

/// Shape of a lifted call argument. Only the tag matters to validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgumentKind {
    /// An already materialized value (register or memory variable).
    Variable,
    /// Anything derived: arithmetic, address-of a local, etc.
    Computed,
    /// A constant or constant pointer (e.g. a format string in `.rodata`).
    Literal,
}

/// A call argument as produced by IR lowering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Argument {
    pub kind: ArgumentKind,
    /// Human-readable expression, diagnostics only.
    pub expr: String,
}

impl Argument {
    pub fn new(kind: ArgumentKind, expr: impl Into<String>) -> Self {
        Self { kind, expr: expr.into() }
    }

    pub fn variable(expr: impl Into<String>) -> Self {
        Self::new(ArgumentKind::Variable, expr)
    }

    pub fn computed(expr: impl Into<String>) -> Self {
        Self::new(ArgumentKind::Computed, expr)
    }

    pub fn literal(expr: impl Into<String>) -> Self {
        Self::new(ArgumentKind::Literal, expr)
    }
}

/// Non-call control transfers that may still reference a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    /// `jmp target` leaving the function.
    TailCall,
    /// `call reg` / `call [mem]`.
    IndirectCall,
    /// Intra-function direct jump.
    Jump,
}

/// Call-semantics view of one instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IrInstruction {
    Call { target: Option<u64>, params: Vec<Argument> },
    ControlTransfer { kind: TransferKind },
    Other,
}

/// A confirmed direct call to the source symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    pub address: u64,
    pub caller: Function,
    pub args: Vec<Argument>,
}
