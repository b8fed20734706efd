//! Small x86_64 ELF executables for tests, written with `object`.
//!
//! Layout of the default fixture:
//! - `.text` at 0x401000 holding `main` (four printf calls) and `wrapper`
//!   (an address load of printf followed by a tail jump to it).
//! - `.plt.sec` at 0x401100 holding 16-byte stubs for `printf` and `puts`.
#![allow(dead_code)]

pub mod memory;

use std::path::{Path, PathBuf};

use object::elf;
use object::write::elf::{FileHeader, SectionHeader, Sym, Writer};
use object::Endianness;

pub const TEXT_ADDR: u64 = 0x401000;
pub const PLT_SEC_ADDR: u64 = 0x401100;
pub const PRINTF_ADDR: u64 = PLT_SEC_ADDR;
pub const PUTS_ADDR: u64 = PLT_SEC_ADDR + 0x10;
/// Where the literal format strings would live.
pub const RODATA_ADDR: u64 = 0x402000;

const MOV_RDI_RAX: [u8; 3] = [0x48, 0x89, 0xC7];
const MOV_EAX_0: [u8; 5] = [0xB8, 0x00, 0x00, 0x00, 0x00];
const MOV_ESI_EBX: [u8; 2] = [0x89, 0xDE];
const RET: [u8; 1] = [0xC3];
const LEA_RDI_RIP: [u8; 3] = [0x48, 0x8D, 0x3D];
const LEA_RAX_RIP: [u8; 3] = [0x48, 0x8D, 0x05];

/// endbr64; jmp [rip + 0x2f00]; nop dword [rax + rax]; nop
const PLT_STUB: [u8; 16] = [
    0xF3, 0x0F, 0x1E, 0xFA, 0xFF, 0x25, 0x00, 0x2F, 0x00, 0x00, 0x0F, 0x1F, 0x44, 0x00, 0x00, 0x90,
];

/// Emits position-dependent x86_64 code starting at a fixed address.
pub struct CodeBuilder {
    base: u64,
    bytes: Vec<u8>,
}

impl CodeBuilder {
    pub fn new(base: u64) -> Self {
        Self { base, bytes: Vec::new() }
    }

    pub fn here(&self) -> u64 {
        self.base + self.bytes.len() as u64
    }

    pub fn raw(&mut self, bytes: &[u8]) -> u64 {
        let at = self.here();
        self.bytes.extend_from_slice(bytes);
        at
    }

    fn rel32(&mut self, opcode: &[u8], target: u64) -> u64 {
        let at = self.here();
        let next = at + opcode.len() as u64 + 4;
        let rel = (target as i64 - next as i64) as i32;
        self.bytes.extend_from_slice(opcode);
        self.bytes.extend_from_slice(&rel.to_le_bytes());
        at
    }

    /// `call target` (E8 rel32), returns the instruction address.
    pub fn call(&mut self, target: u64) -> u64 {
        self.rel32(&[0xE8], target)
    }

    /// `jmp target` (E9 rel32).
    pub fn jmp(&mut self, target: u64) -> u64 {
        self.rel32(&[0xE9], target)
    }

    /// `lea <reg>, [rip + disp]` with the 3-byte prefix selecting the register.
    pub fn lea_rip(&mut self, prefix: [u8; 3], target: u64) -> u64 {
        self.rel32(&prefix, target)
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

pub struct FixtureOptions {
    pub machine: u16,
    pub plt_section: &'static str,
    pub with_puts: bool,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self { machine: elf::EM_X86_64, plt_section: ".plt.sec", with_puts: true }
    }
}

/// The printf scenario plus the addresses of each interesting instruction.
pub struct PrintfFixture {
    pub bytes: Vec<u8>,
    /// `mov rdi, rax; mov eax, 0; call printf`
    pub eligible: u64,
    /// `lea rdi, [fmt]; mov esi, ebx; call printf`
    pub two_args: u64,
    /// `lea rdi, [fmt]; call printf`
    pub literal: u64,
    /// `lea rax, [fmt]; mov rdi, rax; mov eax, 0; call printf`, as gcc emits
    /// for `printf("...")` in PIE code at -O0.
    pub literal_via_rax: u64,
    pub main: (u64, u64),
    /// `lea rax, [printf]` inside `wrapper`.
    pub address_load: u64,
    /// `jmp printf` ending `wrapper`.
    pub tail_jump: u64,
}

struct FixtureSymbol {
    name: &'static str,
    in_plt: bool,
    value: u64,
    size: u64,
}

pub fn printf_fixture() -> PrintfFixture {
    printf_fixture_with(FixtureOptions::default())
}

pub fn printf_fixture_with(options: FixtureOptions) -> PrintfFixture {
    let mut code = CodeBuilder::new(TEXT_ADDR);

    code.raw(&MOV_RDI_RAX);
    code.raw(&MOV_EAX_0);
    let eligible = code.call(PRINTF_ADDR);

    code.lea_rip(LEA_RDI_RIP, RODATA_ADDR);
    code.raw(&MOV_ESI_EBX);
    let two_args = code.call(PRINTF_ADDR);

    code.lea_rip(LEA_RDI_RIP, RODATA_ADDR + 0x10);
    let literal = code.call(PRINTF_ADDR);

    code.lea_rip(LEA_RAX_RIP, RODATA_ADDR + 0x20);
    code.raw(&MOV_RDI_RAX);
    code.raw(&MOV_EAX_0);
    let literal_via_rax = code.call(PRINTF_ADDR);
    code.raw(&RET);

    let wrapper = code.here();
    let address_load = code.lea_rip(LEA_RAX_RIP, PRINTF_ADDR);
    let tail_jump = code.jmp(PRINTF_ADDR);
    let text_end = code.here();
    let text = code.finish();

    let mut plt = PLT_STUB.to_vec();
    let mut symbols = vec![
        FixtureSymbol { name: "main", in_plt: false, value: TEXT_ADDR, size: wrapper - TEXT_ADDR },
        FixtureSymbol { name: "wrapper", in_plt: false, value: wrapper, size: text_end - wrapper },
        FixtureSymbol { name: "printf", in_plt: true, value: PRINTF_ADDR, size: 16 },
    ];
    if options.with_puts {
        plt.extend_from_slice(&PLT_STUB);
        symbols.push(FixtureSymbol { name: "puts", in_plt: true, value: PUTS_ADDR, size: 16 });
    }

    let bytes = write_elf(&options, &text, &plt, &symbols);
    PrintfFixture {
        bytes,
        eligible,
        two_args,
        literal,
        literal_via_rax,
        main: (TEXT_ADDR, wrapper),
        address_load,
        tail_jump,
    }
}

fn write_elf(
    options: &FixtureOptions,
    text: &[u8],
    plt: &[u8],
    symbols: &[FixtureSymbol],
) -> Vec<u8> {
    let mut out = Vec::new();
    {
        let mut writer = Writer::new(Endianness::Little, true, &mut out);
        writer.reserve_file_header();

        writer.reserve_null_section_index();
        let text_name = writer.add_section_name(b".text");
        let text_index = writer.reserve_section_index();
        let plt_name = writer.add_section_name(options.plt_section.as_bytes());
        let plt_index = writer.reserve_section_index();

        writer.reserve_null_symbol_index();
        let symbol_names: Vec<_> = symbols
            .iter()
            .map(|sym| {
                let section = if sym.in_plt { plt_index } else { text_index };
                writer.reserve_symbol_index(Some(section));
                (writer.add_string(sym.name.as_bytes()), section)
            })
            .collect();

        writer.reserve_symtab_section_index();
        writer.reserve_strtab_section_index();
        writer.reserve_shstrtab_section_index();

        let text_offset = writer.reserve(text.len(), 16);
        let plt_offset = writer.reserve(plt.len(), 16);
        writer.reserve_symtab();
        writer.reserve_strtab();
        writer.reserve_shstrtab();
        writer.reserve_section_headers();

        writer
            .write_file_header(&FileHeader {
                os_abi: elf::ELFOSABI_NONE,
                abi_version: 0,
                e_type: elf::ET_EXEC,
                e_machine: options.machine,
                e_entry: TEXT_ADDR,
                e_flags: 0,
            })
            .expect("file header");
        writer.write_align(16);
        writer.write(text);
        writer.write_align(16);
        writer.write(plt);

        writer.write_null_symbol();
        for (sym, (name, section)) in symbols.iter().zip(&symbol_names) {
            writer.write_symbol(&Sym {
                name: Some(*name),
                section: Some(*section),
                st_info: (elf::STB_GLOBAL << 4) | elf::STT_FUNC,
                st_other: elf::STV_DEFAULT,
                st_shndx: 0,
                st_value: sym.value,
                st_size: sym.size,
            });
        }
        writer.write_strtab();
        writer.write_shstrtab();

        let exec_flags = u64::from(elf::SHF_ALLOC | elf::SHF_EXECINSTR);
        writer.write_null_section_header();
        writer.write_section_header(&SectionHeader {
            name: Some(text_name),
            sh_type: elf::SHT_PROGBITS,
            sh_flags: exec_flags,
            sh_addr: TEXT_ADDR,
            sh_offset: text_offset as u64,
            sh_size: text.len() as u64,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 16,
            sh_entsize: 0,
        });
        writer.write_section_header(&SectionHeader {
            name: Some(plt_name),
            sh_type: elf::SHT_PROGBITS,
            sh_flags: exec_flags,
            sh_addr: PLT_SEC_ADDR,
            sh_offset: plt_offset as u64,
            sh_size: plt.len() as u64,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 16,
            sh_entsize: 16,
        });
        writer.write_symtab_section_header(1);
        writer.write_strtab_section_header();
        writer.write_shstrtab_section_header();
    }
    out
}

/// Writes `bytes` under `dir` and returns the path.
pub fn write_fixture(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).expect("write fixture");
    path
}
