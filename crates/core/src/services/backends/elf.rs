use std::fs;
use std::path::Path;

use capstone::arch::x86::X86OperandType;
use capstone::arch::ArchOperand;
use capstone::{arch, prelude::*, Capstone, InsnGroupId, RegId};
use goblin::elf::{self, Elf};
use tracing::{debug, warn};

use crate::model::{
    Argument, CrossReference, Function, IrInstruction, RefKind, Section, Symbol, TransferKind,
};
use crate::services::image::{BinaryImage, ImageError};

/// Size of one lazy-binding PLT stub on x86 (`.plt` and `.plt.sec` alike).
const PLT_ENTRY_SIZE: u64 = 16;

#[derive(Debug, Clone)]
struct SectionRange {
    name: String,
    start: u64,
    end: u64,
    file_offset: Option<usize>,
    executable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Operand {
    Reg(String),
    Imm(i64),
    Mem { base: Option<String>, index: Option<String>, disp: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Call,
    Jump,
    Return,
    Sequential,
}

#[derive(Debug, Clone)]
struct DecodedInsn {
    address: u64,
    len: usize,
    mnemonic: String,
    op_str: String,
    flow: Flow,
    operands: Vec<Operand>,
}

impl DecodedInsn {
    fn next_address(&self) -> u64 {
        self.address.wrapping_add(self.len as u64)
    }

    fn text(&self) -> String {
        format!("{} {}", self.mnemonic, self.op_str).trim().to_string()
    }

    /// Absolute target of `call imm` / `jmp imm`.
    fn direct_target(&self) -> Option<u64> {
        match self.operands.as_slice() {
            [Operand::Imm(imm)] => Some(*imm as u64),
            _ => None,
        }
    }

    /// Address resolved from a `[rip + disp]` operand.
    fn rip_relative_target(&self) -> Option<u64> {
        self.operands.iter().find_map(|op| match op {
            Operand::Mem { base: Some(base), index: None, disp } if base == "rip" => {
                Some(self.next_address().wrapping_add(*disp as u64))
            }
            _ => None,
        })
    }

    /// Source operand text of a two-operand instruction.
    fn source_text(&self) -> &str {
        self.op_str.split_once(", ").map(|(_, src)| src).unwrap_or(&self.op_str)
    }
}

#[derive(Debug, Clone)]
struct FunctionBody {
    function: Function,
    insns: Vec<DecodedInsn>,
}

/// ELF executable loaded from disk, analyzed with goblin + capstone.
///
/// Functions come from `.symtab` plus one synthesized stub per `.rela.plt`
/// import. Cross-references and call arguments are recovered by
/// disassembling every function; `reanalyze` re-disassembles from the
/// current (possibly patched) bytes.
pub struct ElfImage {
    bytes: Vec<u8>,
    arch: String,
    address_size: usize,
    sections: Vec<SectionRange>,
    symbols: Vec<Symbol>,
    bodies: Vec<FunctionBody>,
}

fn arch_from_machine(machine: u16) -> String {
    match machine {
        elf::header::EM_X86_64 => "x86_64".into(),
        elf::header::EM_386 => "x86".into(),
        elf::header::EM_AARCH64 => "arm64".into(),
        elf::header::EM_ARM => "arm".into(),
        other => format!("elf-machine-{other}"),
    }
}

/// Capstone handle for the x86 family; `None` for anything we cannot lift.
fn make_cs(arch: &str) -> Result<Option<Capstone>, ImageError> {
    let mode = match arch {
        "x86_64" => arch::x86::ArchMode::Mode64,
        "x86" => arch::x86::ArchMode::Mode32,
        _ => return Ok(None),
    };
    Capstone::new()
        .x86()
        .mode(mode)
        .detail(true)
        .build()
        .map(Some)
        .map_err(|e| ImageError::Parse(format!("capstone init failed: {e}")))
}

fn collect_sections(elf: &Elf) -> Vec<SectionRange> {
    elf.section_headers
        .iter()
        .filter(|sh| sh.sh_addr != 0)
        .map(|sh| SectionRange {
            name: elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("").to_string(),
            start: sh.sh_addr,
            end: sh.sh_addr.saturating_add(sh.sh_size),
            file_offset: (sh.sh_type != elf::section_header::SHT_NOBITS)
                .then_some(sh.sh_offset as usize),
            executable: sh.sh_flags & u64::from(elf::section_header::SHF_EXECINSTR) != 0,
        })
        .collect()
}

fn plt_stub_address(
    plt_sec: Option<&SectionRange>,
    plt: Option<&SectionRange>,
    index: usize,
) -> Option<u64> {
    // `.plt` starts with the resolver stub PLT0; `.plt.sec` does not.
    let (section, slot) = match (plt_sec, plt) {
        (Some(sec), _) => (sec, index as u64),
        (None, Some(plt)) => (plt, index as u64 + 1),
        (None, None) => return None,
    };
    let address = section.start.checked_add(slot.checked_mul(PLT_ENTRY_SIZE)?)?;
    (address.checked_add(PLT_ENTRY_SIZE)? <= section.end).then_some(address)
}

/// Import stubs named after the symbol they resolve, as disassemblers show them.
fn plt_stubs(elf: &Elf, sections: &[SectionRange]) -> Vec<(String, u64)> {
    let plt_sec = sections.iter().find(|s| s.name == ".plt.sec");
    let plt = sections.iter().find(|s| s.name == ".plt");
    elf.pltrelocs
        .iter()
        .enumerate()
        .filter_map(|(idx, reloc)| {
            let sym = elf.dynsyms.get(reloc.r_sym)?;
            let name = elf.dynstrtab.get_at(sym.st_name)?;
            if name.is_empty() {
                return None;
            }
            let address = plt_stub_address(plt_sec, plt, idx)?;
            Some((name.to_string(), address))
        })
        .collect()
}

fn collect_symbols_and_functions(
    elf: &Elf,
    sections: &[SectionRange],
) -> (Vec<Symbol>, Vec<Function>) {
    let mut symbols = Vec::new();
    let mut candidates: Vec<(String, u64, Option<u64>)> = Vec::new();

    for sym in &elf.syms {
        if sym.st_value == 0 || sym.st_shndx == elf::section_header::SHN_UNDEF as usize {
            continue;
        }
        let name = elf.strtab.get_at(sym.st_name).unwrap_or("").to_string();
        if name.is_empty() {
            continue;
        }
        if sym.is_function() {
            let size = (sym.st_size > 0).then_some(sym.st_size);
            candidates.push((name.clone(), sym.st_value, size));
        }
        symbols.push(Symbol::new(name, sym.st_value));
    }

    for (name, address) in plt_stubs(elf, sections) {
        if !symbols.iter().any(|s| s.name == name) {
            symbols.push(Symbol::new(name.clone(), address));
        }
        candidates.push((name, address, Some(PLT_ENTRY_SIZE)));
    }

    candidates.sort_by_key(|(_, start, _)| *start);
    candidates.dedup_by_key(|(_, start, _)| *start);

    let starts: Vec<u64> = candidates.iter().map(|(_, start, _)| *start).collect();
    let functions = candidates
        .into_iter()
        .enumerate()
        .filter_map(|(idx, (name, start, size))| {
            let section = sections.iter().find(|s| start >= s.start && start < s.end)?;
            let end = match size {
                Some(size) => start.saturating_add(size),
                None => starts.get(idx + 1).copied().unwrap_or(section.end),
            };
            Some(Function::new(name, start, end.min(section.end)))
        })
        .collect();

    (symbols, functions)
}

fn file_range(sections: &[SectionRange], address: u64, len: usize) -> Result<usize, ImageError> {
    let section = sections
        .iter()
        .find(|s| address >= s.start && address < s.end && s.file_offset.is_some())
        .ok_or(ImageError::Unmapped(address))?;
    if address.saturating_add(len as u64) > section.end {
        return Err(ImageError::OutOfBounds { address, len });
    }
    let offset = section.file_offset.ok_or(ImageError::Unmapped(address))?;
    Ok(offset + (address - section.start) as usize)
}

fn reg_name(cs: &Capstone, reg: RegId) -> Option<String> {
    if reg.0 == 0 {
        return None;
    }
    cs.reg_name(reg).map(|n| n.to_lowercase())
}

fn decode(cs: &Capstone, code: &[u8], address: u64) -> Vec<DecodedInsn> {
    let insns = match cs.disasm_all(code, address) {
        Ok(insns) => insns,
        Err(e) => {
            warn!(address = format_args!("{address:#x}"), error = %e, "disassembly failed");
            return Vec::new();
        }
    };

    let call = InsnGroupId(capstone::InsnGroupType::CS_GRP_CALL as u8);
    let jump = InsnGroupId(capstone::InsnGroupType::CS_GRP_JUMP as u8);
    let ret = InsnGroupId(capstone::InsnGroupType::CS_GRP_RET as u8);

    insns
        .iter()
        .map(|i| {
            let (flow, operands) = match cs.insn_detail(i) {
                Ok(detail) => {
                    let groups = detail.groups();
                    let flow = if groups.contains(&call) {
                        Flow::Call
                    } else if groups.contains(&jump) {
                        Flow::Jump
                    } else if groups.contains(&ret) {
                        Flow::Return
                    } else {
                        Flow::Sequential
                    };
                    let operands = detail
                        .arch_detail()
                        .operands()
                        .into_iter()
                        .filter_map(|op| match op {
                            ArchOperand::X86Operand(op) => match &op.op_type {
                                X86OperandType::Reg(reg) => reg_name(cs, *reg).map(Operand::Reg),
                                X86OperandType::Imm(imm) => Some(Operand::Imm(*imm)),
                                X86OperandType::Mem(mem) => Some(Operand::Mem {
                                    base: reg_name(cs, mem.base()),
                                    index: reg_name(cs, mem.index()),
                                    disp: mem.disp(),
                                }),
                                _ => None,
                            },
                            _ => None,
                        })
                        .collect();
                    (flow, operands)
                }
                Err(_) => (Flow::Sequential, Vec::new()),
            };
            DecodedInsn {
                address: i.address(),
                len: i.bytes().len(),
                mnemonic: i.mnemonic().unwrap_or("").to_lowercase(),
                op_str: i.op_str().unwrap_or("").to_string(),
                flow,
                operands,
            }
        })
        .collect()
}

fn decode_function(
    cs: &Capstone,
    bytes: &[u8],
    sections: &[SectionRange],
    function: &Function,
) -> Vec<DecodedInsn> {
    let executable = sections
        .iter()
        .any(|s| s.executable && function.start >= s.start && function.start < s.end);
    if !executable || function.end <= function.start {
        return Vec::new();
    }
    let len = (function.end - function.start) as usize;
    match file_range(sections, function.start, len) {
        Ok(start) if start + len <= bytes.len() => {
            decode(cs, &bytes[start..start + len], function.start)
        }
        _ => {
            debug!(function = %function.name, "function body not file-backed");
            Vec::new()
        }
    }
}

/// Instructions that read but do not overwrite their first operand.
fn writes_first_operand(mnemonic: &str) -> bool {
    !matches!(mnemonic, "cmp" | "test" | "push" | "bt" | "nop")
}

fn is_move(mnemonic: &str) -> bool {
    matches!(mnemonic, "mov" | "movzx" | "movsx" | "movsxd" | "movabs")
}

fn classify_value(value: &Operand, expr: &str) -> Argument {
    match value {
        Operand::Imm(imm) => Argument::literal(format!("{imm:#x}")),
        Operand::Reg(_) | Operand::Mem { .. } => Argument::variable(expr),
    }
}

/// Classifies what `insn` stores into its destination.
fn classify_source(insn: &DecodedInsn) -> Argument {
    let dest = insn.operands.first();
    let source = insn.operands.get(1);
    match (insn.mnemonic.as_str(), source) {
        ("lea", Some(Operand::Mem { base: Some(base), index: None, disp }))
            if base == "rip" =>
        {
            Argument::literal(format!("{:#x}", insn.next_address().wrapping_add(*disp as u64)))
        }
        ("lea", _) => Argument::computed(format!("&{}", insn.source_text())),
        ("xor", Some(src)) if Some(src) == dest => Argument::literal("0"),
        (m, Some(src)) if is_move(m) => classify_value(src, insn.source_text()),
        _ => Argument::computed(insn.text()),
    }
}

/// Canonical 64-bit name of a general purpose register, so `eax` and `rax`
/// compare equal.
fn reg_family(reg: &str) -> &str {
    match reg {
        "eax" | "ax" | "al" | "ah" => "rax",
        "ebx" | "bx" | "bl" | "bh" => "rbx",
        "ecx" | "cx" | "cl" | "ch" => "rcx",
        "edx" | "dx" | "dl" | "dh" => "rdx",
        "esi" | "si" | "sil" => "rsi",
        "edi" | "di" | "dil" => "rdi",
        "ebp" | "bp" | "bpl" => "rbp",
        "esp" | "sp" | "spl" => "rsp",
        _ => match reg.strip_suffix(['d', 'w', 'b']) {
            Some(base) if base.len() > 1 && base[1..].bytes().all(|b| b.is_ascii_digit()) => base,
            _ => reg,
        },
    }
}

/// Like [`classify_source`], but a register copy is classified by what the
/// source register last held within `older` (the rest of the block, newest
/// first).
fn resolve_source(insn: &DecodedInsn, older: &[&DecodedInsn]) -> Argument {
    match insn.operands.get(1) {
        Some(src @ Operand::Reg(_)) if is_move(&insn.mnemonic) => {
            resolve_value(src, insn.source_text(), older)
        }
        _ => classify_source(insn),
    }
}

/// Classifies a stored value. A register not defined in `older` is a variable.
fn resolve_value(value: &Operand, expr: &str, older: &[&DecodedInsn]) -> Argument {
    let Operand::Reg(reg) = value else { return classify_value(value, expr) };
    let family = reg_family(reg);
    let definition = older.iter().position(|insn| {
        writes_first_operand(&insn.mnemonic)
            && matches!(insn.operands.first(), Some(Operand::Reg(dest)) if reg_family(dest) == family)
    });
    match definition {
        Some(pos) => resolve_source(older[pos], &older[pos + 1..]),
        None => Argument::variable(expr),
    }
}

/// Instructions of the basic block that ends right before a call, newest first.
fn block_before(preceding: &[DecodedInsn]) -> impl Iterator<Item = &DecodedInsn> {
    preceding.iter().rev().take_while(|i| i.flow == Flow::Sequential)
}

fn sysv_slot(reg: &str) -> Option<usize> {
    match reg {
        "rdi" | "edi" | "di" | "dil" => Some(0),
        "rsi" | "esi" | "si" | "sil" => Some(1),
        "rdx" | "edx" | "dx" | "dl" => Some(2),
        "rcx" | "ecx" | "cx" | "cl" => Some(3),
        "r8" | "r8d" | "r8w" | "r8b" => Some(4),
        "r9" | "r9d" | "r9w" | "r9b" => Some(5),
        _ => None,
    }
}

/// System V x86_64: integer arguments in rdi, rsi, rdx, rcx, r8, r9.
fn lift_sysv(preceding: &[DecodedInsn]) -> Vec<Argument> {
    let block: Vec<&DecodedInsn> = block_before(preceding).collect();
    let mut slots: [Option<Argument>; 6] = Default::default();
    for (idx, insn) in block.iter().enumerate() {
        let Some(Operand::Reg(dest)) = insn.operands.first() else { continue };
        if !writes_first_operand(&insn.mnemonic) {
            continue;
        }
        if let Some(slot) = sysv_slot(dest) {
            if slots[slot].is_none() {
                slots[slot] = Some(resolve_source(insn, &block[idx + 1..]));
            }
        }
    }
    slots.into_iter().map_while(|s| s).collect()
}

/// cdecl: arguments pushed right to left, or stored to `[esp + 4 * n]`.
fn lift_cdecl(preceding: &[DecodedInsn]) -> Vec<Argument> {
    let mut slots: Vec<Option<Argument>> = Vec::new();
    let mut pushes = 0usize;
    let assign = |slots: &mut Vec<Option<Argument>>, slot: usize, arg: Argument| {
        if slots.len() <= slot {
            slots.resize(slot + 1, None);
        }
        if slots[slot].is_none() {
            slots[slot] = Some(arg);
        }
    };

    let block: Vec<&DecodedInsn> = block_before(preceding).collect();
    for (idx, insn) in block.iter().enumerate() {
        let older = &block[idx + 1..];
        match (insn.mnemonic.as_str(), insn.operands.first()) {
            ("push", Some(value)) => {
                assign(&mut slots, pushes, resolve_value(value, &insn.op_str, older));
                pushes += 1;
            }
            (m, Some(Operand::Mem { base: Some(base), index: None, disp }))
                if is_move(m) && base == "esp" && *disp >= 0 && disp % 4 == 0 =>
            {
                if let Some(src) = insn.operands.get(1) {
                    let arg = resolve_value(src, insn.source_text(), older);
                    assign(&mut slots, (*disp / 4) as usize, arg);
                }
            }
            _ => {}
        }
    }
    slots.into_iter().map_while(|s| s).collect()
}

impl ElfImage {
    /// Reads and analyzes an ELF file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let path = path.as_ref();
        let bytes = fs::read(path)
            .map_err(|source| ImageError::Io { path: path.to_path_buf(), source })?;
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ImageError> {
        let (arch, address_size, sections, symbols, functions) = {
            let elf = Elf::parse(&bytes).map_err(|e| ImageError::Parse(e.to_string()))?;
            let sections = collect_sections(&elf);
            let (symbols, functions) = collect_symbols_and_functions(&elf, &sections);
            let address_size = if elf.is_64 { 8 } else { 4 };
            (arch_from_machine(elf.header.e_machine), address_size, sections, symbols, functions)
        };

        let cs = make_cs(&arch)?;
        let bodies = functions
            .into_iter()
            .map(|function| {
                let insns = cs
                    .as_ref()
                    .map(|cs| decode_function(cs, &bytes, &sections, &function))
                    .unwrap_or_default();
                FunctionBody { function, insns }
            })
            .collect::<Vec<_>>();

        debug!(
            arch = %arch,
            functions = bodies.len(),
            symbols = symbols.len(),
            "loaded ELF image"
        );

        Ok(Self { bytes, arch, address_size, sections, symbols, bodies })
    }

    /// Writes the current (possibly patched) image bytes to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ImageError> {
        let path = path.as_ref();
        fs::write(path, &self.bytes)
            .map_err(|source| ImageError::Io { path: path.to_path_buf(), source })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn insn_at(&self, address: u64) -> Option<(&FunctionBody, usize)> {
        self.bodies.iter().find_map(|body| {
            if !body.function.contains(address) {
                return None;
            }
            body.insns.iter().position(|i| i.address == address).map(|idx| (body, idx))
        })
    }

    fn lift_params(&self, preceding: &[DecodedInsn]) -> Vec<Argument> {
        if self.address_size == 8 {
            lift_sysv(preceding)
        } else {
            lift_cdecl(preceding)
        }
    }
}

impl BinaryImage for ElfImage {
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
        self.bodies
            .iter()
            .flat_map(|body| body.insns.iter())
            .filter_map(|insn| {
                let kind = match insn.flow {
                    Flow::Call if insn.direct_target() == Some(address) => RefKind::Call,
                    Flow::Jump if insn.direct_target() == Some(address) => RefKind::Jump,
                    _ if insn.rip_relative_target() == Some(address) => RefKind::Data,
                    _ => return None,
                };
                Some(CrossReference { from: insn.address, kind })
            })
            .collect()
    }

    fn functions_containing(&self, address: u64) -> Vec<Function> {
        self.bodies
            .iter()
            .filter(|b| b.function.contains(address))
            .map(|b| b.function.clone())
            .collect()
    }

    fn call_instruction_at(&self, function: &Function, address: u64) -> Option<IrInstruction> {
        let body = self.bodies.iter().find(|b| b.function.start == function.start)?;
        let idx = body.insns.iter().position(|i| i.address == address)?;
        let insn = &body.insns[idx];
        let ir = match insn.flow {
            Flow::Call => match insn.direct_target() {
                Some(target) => IrInstruction::Call {
                    target: Some(target),
                    params: self.lift_params(&body.insns[..idx]),
                },
                None => IrInstruction::ControlTransfer { kind: TransferKind::IndirectCall },
            },
            Flow::Jump => match insn.direct_target() {
                Some(target) if !body.function.contains(target) => {
                    IrInstruction::ControlTransfer { kind: TransferKind::TailCall }
                }
                _ => IrInstruction::ControlTransfer { kind: TransferKind::Jump },
            },
            Flow::Return | Flow::Sequential => IrInstruction::Other,
        };
        Some(ir)
    }

    fn sections(&self) -> Vec<Section> {
        self.sections.iter().map(|s| Section::new(s.name.clone(), s.start, s.end)).collect()
    }

    fn functions(&self) -> Vec<Function> {
        self.bodies.iter().map(|b| b.function.clone()).collect()
    }

    fn disassembly_at(&self, address: u64) -> Option<String> {
        self.insn_at(address).map(|(body, idx)| body.insns[idx].text())
    }

    fn instruction_length(&self, address: u64) -> Option<usize> {
        self.insn_at(address).map(|(body, idx)| body.insns[idx].len)
    }

    fn read(&self, address: u64, len: usize) -> Option<Vec<u8>> {
        let start = file_range(&self.sections, address, len).ok()?;
        self.bytes.get(start..start + len).map(<[u8]>::to_vec)
    }

    fn write(&mut self, address: u64, bytes: &[u8]) -> Result<usize, ImageError> {
        let start = file_range(&self.sections, address, bytes.len())?;
        let target = self
            .bytes
            .get_mut(start..start + bytes.len())
            .ok_or(ImageError::OutOfBounds { address, len: bytes.len() })?;
        target.copy_from_slice(bytes);
        Ok(bytes.len())
    }

    fn reanalyze(&mut self, function: &Function) {
        let cs = match make_cs(&self.arch) {
            Ok(Some(cs)) => cs,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, function = %function.name, "reanalysis skipped");
                return;
            }
        };
        let Some(idx) = self.bodies.iter().position(|b| b.function.start == function.start)
        else {
            return;
        };
        let insns = decode_function(&cs, &self.bytes, &self.sections, &self.bodies[idx].function);
        debug!(function = %function.name, instructions = insns.len(), "reanalyzed function");
        self.bodies[idx].insns = insns;
    }
}
