//! The ELF image loader: an external collaborator that populates guest
//! memory from `PT_LOAD` segments and sets up PC/SP. Not part of the
//! decoder/interpreter/JIT core; kept separate and liberal with
//! `.expect()`-free but still process-ending errors, matching the
//! teacher's own loader style.

use std::path::Path;

use elf::abi::PT_LOAD;
use elf::endian::AnyEndian;
use elf::ElfBytes;
use thiserror::Error;

use crate::machine::MachineState;
use crate::memory::MemoryError;

/// RISC-V machine type as defined by the ELF specification.
const EM_RISCV: u16 = 0xF3;

/// Stack pointer seeded by the loader, near the top of a 128 MiB guest
/// address space.
pub const DEFAULT_STACK_POINTER: u32 = 0x07FF_F000;

#[derive(Error, Debug)]
pub enum ElfLoadError {
    #[error("could not read ELF file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse ELF file: {0}")]
    Parse(#[from] elf::ParseError),
    #[error("not a 32-bit ELF file")]
    Not32Bit,
    #[error("not a RISC-V binary (e_machine = 0x{0:04x})")]
    WrongMachine(u16),
    #[error("segment load failed: {0}")]
    Memory(#[from] MemoryError),
}

/// Validate and load a 32-bit little-endian RISC-V ELF file into
/// `machine`'s memory: every `PT_LOAD` segment is copied to its
/// `p_vaddr`, with `[p_vaddr + p_filesz, p_vaddr + p_memsz)` zero-filled
/// for BSS. On success, PC is set to `e_entry` and x2 (sp) to
/// [`DEFAULT_STACK_POINTER`].
pub fn load_elf(machine: &mut MachineState, path: impl AsRef<Path>) -> Result<(), ElfLoadError> {
    let file_data = std::fs::read(path)?;
    let file = ElfBytes::<AnyEndian>::minimal_parse(&file_data)?;

    if !file.ehdr.class.eq(&elf::file::Class::ELF32) {
        return Err(ElfLoadError::Not32Bit);
    }
    if file.ehdr.e_machine != EM_RISCV {
        return Err(ElfLoadError::WrongMachine(file.ehdr.e_machine));
    }

    println!("Entry point: 0x{:08x}", file.ehdr.e_entry);

    if let Some(segments) = file.segments() {
        for (i, phdr) in segments.iter().enumerate() {
            if phdr.p_type != PT_LOAD {
                continue;
            }
            println!(
                "Loading segment {i} at 0x{:08x} (size: {} bytes)",
                phdr.p_vaddr, phdr.p_filesz
            );

            let start = phdr.p_offset as usize;
            let end = start + phdr.p_filesz as usize;
            let data = &file_data[start..end];
            machine.memory.write_bytes(phdr.p_vaddr as u32, data)?;

            let bss_len = phdr.p_memsz - phdr.p_filesz;
            if bss_len > 0 {
                let bss_addr = phdr.p_vaddr as u32 + phdr.p_filesz as u32;
                machine.memory.zero_fill(bss_addr, bss_len as u32)?;
            }
        }
    }

    machine.pc = file.ehdr.e_entry as u32;
    machine.registers.write(2, DEFAULT_STACK_POINTER).unwrap();

    println!("ELF loaded successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_elf32_riscv(entry: u32, load_addr: u32, text: &[u8]) -> Vec<u8> {
        // Hand-assemble the smallest valid ELF32 RISC-V file with one
        // PT_LOAD segment carrying `text`, for loader tests that don't
        // need a real toolchain-produced binary.
        let ehdr_size = 52u16;
        let phdr_size = 32u16;
        let phoff = ehdr_size as u32;
        let text_off = phoff as u32 + phdr_size as u32;

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0x7f, b'E', b'L', b'F']);
        bytes.push(1); // EI_CLASS = ELFCLASS32
        bytes.push(1); // EI_DATA = little endian
        bytes.push(1); // EI_VERSION
        bytes.extend_from_slice(&[0u8; 9]); // padding
        bytes.extend_from_slice(&2u16.to_le_bytes()); // e_type = ET_EXEC
        bytes.extend_from_slice(&EM_RISCV.to_le_bytes()); // e_machine
        bytes.extend_from_slice(&1u32.to_le_bytes()); // e_version
        bytes.extend_from_slice(&entry.to_le_bytes()); // e_entry
        bytes.extend_from_slice(&phoff.to_le_bytes()); // e_phoff
        bytes.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
        bytes.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        bytes.extend_from_slice(&ehdr_size.to_le_bytes()); // e_ehsize
        bytes.extend_from_slice(&phdr_size.to_le_bytes()); // e_phentsize
        bytes.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
        bytes.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
        bytes.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        bytes.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
        assert_eq!(bytes.len(), ehdr_size as usize);

        bytes.extend_from_slice(&1u32.to_le_bytes()); // p_type = PT_LOAD
        bytes.extend_from_slice(&text_off.to_le_bytes()); // p_offset
        bytes.extend_from_slice(&load_addr.to_le_bytes()); // p_vaddr
        bytes.extend_from_slice(&load_addr.to_le_bytes()); // p_paddr
        bytes.extend_from_slice(&(text.len() as u32).to_le_bytes()); // p_filesz
        bytes.extend_from_slice(&(text.len() as u32 + 16).to_le_bytes()); // p_memsz (with BSS)
        bytes.extend_from_slice(&6u32.to_le_bytes()); // p_flags = R+X
        bytes.extend_from_slice(&4u32.to_le_bytes()); // p_align
        assert_eq!(bytes.len(), (ehdr_size + phdr_size) as usize);

        bytes.extend_from_slice(text);
        bytes
    }

    #[test]
    fn loads_a_single_pt_load_segment() {
        let text = [0x93, 0x00, 0xA0, 0x00]; // addi x1,x0,10
        let image = minimal_elf32_riscv(0x1000, 0x1000, &text);
        let dir = std::env::temp_dir();
        let path = dir.join("rv32jit_loader_test_single_segment.elf");
        std::fs::write(&path, &image).unwrap();

        let mut machine = MachineState::new(1 << 20);
        load_elf(&mut machine, &path).unwrap();

        assert_eq!(machine.pc, 0x1000);
        assert_eq!(machine.registers.read(2).unwrap(), DEFAULT_STACK_POINTER);
        assert_eq!(machine.memory.read_word(0x1000).unwrap(), 0x00A00093);
        // BSS past filesz should read as zero.
        assert_eq!(machine.memory.read_word(0x1000 + 4).unwrap(), 0);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rejects_non_riscv_machine_type() {
        let mut image = minimal_elf32_riscv(0x1000, 0x1000, &[0u8; 4]);
        image[18] = 0x3e; // e_machine low byte -> x86_64 (0x3e), not RISC-V
        image[19] = 0x00;
        let dir = std::env::temp_dir();
        let path = dir.join("rv32jit_loader_test_wrong_machine.elf");
        std::fs::write(&path, &image).unwrap();

        let mut machine = MachineState::new(1 << 20);
        let result = load_elf(&mut machine, &path);
        assert!(matches!(result, Err(ElfLoadError::WrongMachine(0x3e))));

        std::fs::remove_file(&path).ok();
    }
}
