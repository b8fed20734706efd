use std::collections::BTreeMap;

use crate::model::{
    Argument, CrossReference, Function, IrInstruction, RefKind, Section, Symbol, TransferKind,
};
use crate::services::image::{BinaryImage, ImageError};

/// Filler byte for address space nobody has written yet (`int3`).
const FILL: u8 = 0xCC;
/// `call rel32`
const CALL_REL32: u8 = 0xE8;

#[derive(Debug, Clone)]
struct MemoryInstruction {
    length: usize,
    text: String,
    ir: IrInstruction,
}

/// A write observed by [`MemoryImage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub address: u64,
    pub bytes: Vec<u8>,
}

/// Table-driven host image.
///
/// Sections, functions, symbols and instructions are declared up front with
/// the `with_*` builders. Every write and re-analysis request is recorded so
/// callers can inspect exactly what a patch run did. Re-analysing a function
/// decodes any `E8 rel32` written over a declared instruction and retargets
/// that instruction and its cross-reference, like a real host would.
#[derive(Debug, Clone)]
pub struct MemoryImage {
    arch: String,
    address_size: usize,
    base: u64,
    bytes: Vec<u8>,
    sections: Vec<Section>,
    functions: Vec<Function>,
    symbols: Vec<Symbol>,
    refs: BTreeMap<u64, Vec<CrossReference>>,
    instructions: BTreeMap<u64, MemoryInstruction>,
    writes: Vec<WriteRecord>,
    reanalyzed: Vec<Function>,
}

impl MemoryImage {
    /// Creates an empty image of `size` bytes mapped at `base`.
    pub fn new(arch: impl Into<String>, address_size: usize, base: u64, size: usize) -> Self {
        Self {
            arch: arch.into(),
            address_size,
            base,
            bytes: vec![FILL; size],
            sections: Vec::new(),
            functions: Vec::new(),
            symbols: Vec::new(),
            refs: BTreeMap::new(),
            instructions: BTreeMap::new(),
            writes: Vec::new(),
            reanalyzed: Vec::new(),
        }
    }

    /// x86_64 image with 8-byte addresses.
    pub fn x86_64(base: u64, size: usize) -> Self {
        Self::new("x86_64", 8, base, size)
    }

    pub fn with_section(mut self, name: &str, start: u64, end: u64) -> Self {
        self.sections.push(Section::new(name, start, end));
        self
    }

    pub fn with_function(mut self, name: &str, start: u64, end: u64) -> Self {
        self.functions.push(Function::new(name, start, end));
        self
    }

    pub fn with_symbol(mut self, name: &str, address: u64) -> Self {
        self.symbols.push(Symbol::new(name, address));
        self
    }

    /// Declares a function and a same-named symbol at its start.
    pub fn with_named_function(self, name: &str, start: u64, end: u64) -> Self {
        self.with_function(name, start, end).with_symbol(name, start)
    }

    /// Declares a direct call at `from` to `target` with lifted `params`.
    pub fn with_call(self, from: u64, target: u64, length: usize, params: Vec<Argument>) -> Self {
        self.with_instruction(
            from,
            target,
            RefKind::Call,
            length,
            format!("call 0x{target:x}"),
            IrInstruction::Call { target: Some(target), params },
        )
    }

    /// Declares a `jmp target` leaving the function at `from`.
    pub fn with_tail_jump(self, from: u64, target: u64, length: usize) -> Self {
        self.with_instruction(
            from,
            target,
            RefKind::Jump,
            length,
            format!("jmp 0x{target:x}"),
            IrInstruction::ControlTransfer { kind: TransferKind::TailCall },
        )
    }

    /// Declares a non-call reference to `target` (e.g. loading its address).
    pub fn with_data_ref(self, from: u64, target: u64, length: usize) -> Self {
        self.with_instruction(
            from,
            target,
            RefKind::Data,
            length,
            format!("lea rax, [0x{target:x}]"),
            IrInstruction::Other,
        )
    }

    fn with_instruction(
        mut self,
        from: u64,
        target: u64,
        kind: RefKind,
        length: usize,
        text: String,
        ir: IrInstruction,
    ) -> Self {
        self.refs.entry(target).or_default().push(CrossReference { from, kind });
        self.instructions.insert(from, MemoryInstruction { length, text, ir });
        self
    }

    /// Every write seen so far, in order.
    pub fn writes(&self) -> &[WriteRecord] {
        &self.writes
    }

    /// Every function passed to `reanalyze`, in order.
    pub fn reanalyzed(&self) -> &[Function] {
        &self.reanalyzed
    }

    /// Target of a `call rel32` currently in the bytes at a declared
    /// five-byte instruction.
    fn written_call_target(&self, address: u64) -> Option<u64> {
        if self.instructions.get(&address)?.length != 5 {
            return None;
        }
        let bytes = self.read(address, 5)?;
        if bytes[0] != CALL_REL32 {
            return None;
        }
        let rel = i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        Some(address.wrapping_add(5).wrapping_add(i64::from(rel) as u64))
    }

    fn retarget_call(&mut self, from: u64, target: u64) {
        for refs in self.refs.values_mut() {
            refs.retain(|r| r.from != from);
        }
        self.refs.retain(|_, refs| !refs.is_empty());
        self.refs.entry(target).or_default().push(CrossReference { from, kind: RefKind::Call });

        if let Some(insn) = self.instructions.get_mut(&from) {
            let params = match std::mem::replace(&mut insn.ir, IrInstruction::Other) {
                IrInstruction::Call { params, .. } => params,
                _ => Vec::new(),
            };
            insn.text = format!("call 0x{target:x}");
            insn.ir = IrInstruction::Call { target: Some(target), params };
        }
    }

    fn offset(&self, address: u64, len: usize) -> Option<usize> {
        let start = usize::try_from(address.checked_sub(self.base)?).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.bytes.len()).then_some(start)
    }
}

impl BinaryImage for MemoryImage {
    fn architecture(&self) -> &str {
        &self.arch
    }

    fn address_size(&self) -> usize {
        self.address_size
    }

    fn symbol_by_raw_name(&self, name: &str) -> Option<Symbol> {
        self.symbols.iter().find(|s| s.name == name).cloned()
    }

    fn code_refs(&self, address: u64) -> Vec<CrossReference> {
        self.refs.get(&address).cloned().unwrap_or_default()
    }

    fn functions_containing(&self, address: u64) -> Vec<Function> {
        self.functions.iter().filter(|f| f.contains(address)).cloned().collect()
    }

    fn call_instruction_at(&self, function: &Function, address: u64) -> Option<IrInstruction> {
        if !function.contains(address) {
            return None;
        }
        self.instructions.get(&address).map(|i| i.ir.clone())
    }

    fn sections(&self) -> Vec<Section> {
        self.sections.clone()
    }

    fn functions(&self) -> Vec<Function> {
        self.functions.clone()
    }

    fn disassembly_at(&self, address: u64) -> Option<String> {
        self.instructions.get(&address).map(|i| i.text.clone())
    }

    fn instruction_length(&self, address: u64) -> Option<usize> {
        self.instructions.get(&address).map(|i| i.length)
    }

    fn read(&self, address: u64, len: usize) -> Option<Vec<u8>> {
        let start = self.offset(address, len)?;
        Some(self.bytes[start..start + len].to_vec())
    }

    fn write(&mut self, address: u64, bytes: &[u8]) -> Result<usize, ImageError> {
        let start = self
            .offset(address, bytes.len())
            .ok_or(ImageError::OutOfBounds { address, len: bytes.len() })?;
        self.bytes[start..start + bytes.len()].copy_from_slice(bytes);
        self.writes.push(WriteRecord { address, bytes: bytes.to_vec() });
        Ok(bytes.len())
    }

    fn reanalyze(&mut self, function: &Function) {
        self.reanalyzed.push(function.clone());
        let rewritten: Vec<(u64, u64)> = self
            .instructions
            .keys()
            .filter(|&&from| function.contains(from))
            .filter_map(|&from| Some((from, self.written_call_target(from)?)))
            .collect();
        for (from, target) in rewritten {
            self.retarget_call(from, target);
        }
    }
}
