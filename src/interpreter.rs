//! Fetch-decode-execute loop over a [`MachineState`], plus the ECALL
//! syscall trap.

use std::io::{self, Write};

use thiserror::Error;

use crate::decode::{decode, DecodeError, DecodedInstruction, Format};
use crate::machine::MachineState;
use crate::memory::MemoryError;
use crate::profiler::Profiler;

#[derive(Error, Debug)]
pub enum Trap {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("memory fault: {0}")]
    Memory(#[from] MemoryError),
    #[error("breakpoint encountered")]
    Breakpoint,
    #[error("exit with code {0}")]
    Exit(u8),
    #[error("unsupported instruction")]
    UnsupportedInstr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxInstructions,
    Exit(u8),
}

#[derive(Debug)]
pub struct RunReport {
    pub instructions_executed: u64,
    pub stopped: StopReason,
}

/// Drives one [`MachineState`] through its fetch-decode-execute cycle.
/// Holds a non-owning mutable reference to the state it interprets, and
/// an optional profiler that is fed one `record(pc)` call per executed
/// instruction.
pub struct Interpreter<'a> {
    pub machine: &'a mut MachineState,
    pub profiler: Option<&'a mut Profiler>,
}

impl<'a> Interpreter<'a> {
    pub fn new(machine: &'a mut MachineState) -> Self {
        Self {
            machine,
            profiler: None,
        }
    }

    pub fn with_profiler(machine: &'a mut MachineState, profiler: &'a mut Profiler) -> Self {
        Self {
            machine,
            profiler: Some(profiler),
        }
    }

    /// Execute exactly one guest instruction at the current PC.
    pub fn step(&mut self) -> Result<(), Trap> {
        let pc = self.machine.pc;
        let raw = self.machine.memory.read_word(pc)?;
        let inst = decode(raw)?;

        if let Some(profiler) = self.profiler.as_deref_mut() {
            profiler.record(pc);
        }

        match inst.format {
            Format::R => self.execute_r(&inst),
            Format::I => self.execute_i(&inst),
            Format::S => self.execute_s(&inst),
            Format::B => self.execute_b(&inst),
            Format::U => self.execute_u(&inst),
            Format::J => self.execute_j(&inst),
        }
    }

    /// Step repeatedly until `max` instructions have executed, an exit
    /// syscall fires, or a fault is raised.
    pub fn run(&mut self, max: u64) -> Result<RunReport, Trap> {
        let mut count = 0u64;
        while count < max {
            match self.step() {
                Ok(()) => count += 1,
                Err(Trap::Exit(code)) => {
                    count += 1;
                    return Ok(RunReport {
                        instructions_executed: count,
                        stopped: StopReason::Exit(code),
                    });
                }
                Err(other) => return Err(other),
            }
        }
        Ok(RunReport {
            instructions_executed: count,
            stopped: StopReason::MaxInstructions,
        })
    }

    fn set_x(&mut self, which: u8, value: u32) {
        // Registers::write already drops writes to x0; unwrap is safe
        // since `which` always comes from a 5-bit decoded field.
        self.machine.registers.write(which as usize, value).unwrap();
    }

    fn x(&self, which: u8) -> u32 {
        self.machine.registers.read(which as usize).unwrap()
    }

    fn execute_r(&mut self, inst: &DecodedInstruction) -> Result<(), Trap> {
        let a = self.x(inst.rs1);
        let b = self.x(inst.rs2);
        let result = match (inst.funct3, inst.funct7) {
            (0x0, 0x00) => a.wrapping_add(b),
            (0x0, 0x20) => a.wrapping_sub(b),
            (0x1, _) => a << (b & 0x1f),
            (0x2, _) => ((a as i32) < (b as i32)) as u32,
            (0x3, _) => (a < b) as u32,
            (0x4, _) => a ^ b,
            (0x5, 0x00) => a >> (b & 0x1f),
            (0x5, 0x20) => ((a as i32) >> (b & 0x1f)) as u32,
            (0x6, _) => a | b,
            (0x7, _) => a & b,
            _ => return Err(Trap::UnsupportedInstr),
        };
        self.set_x(inst.rd, result);
        self.machine.pc = self.machine.pc.wrapping_add(4);
        Ok(())
    }

    fn execute_i(&mut self, inst: &DecodedInstruction) -> Result<(), Trap> {
        use crate::decode::{OPCODE_JALR, OPCODE_LOAD, OPCODE_OP_IMM, OPCODE_SYSTEM};

        match inst.opcode {
            OPCODE_OP_IMM => {
                let a = self.x(inst.rs1);
                let imm = inst.imm;
                let result = match inst.funct3 {
                    0x0 => a.wrapping_add(imm as u32),
                    0x4 => a ^ (imm as u32),
                    0x6 => a | (imm as u32),
                    0x7 => a & (imm as u32),
                    0x1 => a << (imm as u32 & 0x1f),
                    0x5 if imm & 0x400 == 0 => a >> (imm as u32 & 0x1f),
                    0x5 => ((a as i32) >> (imm & 0x1f)) as u32,
                    0x2 => ((a as i32) < imm) as u32,
                    0x3 => (a < (imm as u32)) as u32,
                    _ => return Err(Trap::UnsupportedInstr),
                };
                self.set_x(inst.rd, result);
                self.machine.pc = self.machine.pc.wrapping_add(4);
                Ok(())
            }
            OPCODE_LOAD => {
                let addr = self.x(inst.rs1).wrapping_add(inst.imm as u32);
                let result = match inst.funct3 {
                    0x0 => (self.machine.memory.read_byte(addr)? as i8) as i32 as u32,
                    0x1 => (self.machine.memory.read_halfword(addr)? as i16) as i32 as u32,
                    0x2 => self.machine.memory.read_word(addr)?,
                    0x4 => self.machine.memory.read_byte(addr)? as u32,
                    0x5 => self.machine.memory.read_halfword(addr)? as u32,
                    _ => return Err(Trap::UnsupportedInstr),
                };
                self.set_x(inst.rd, result);
                self.machine.pc = self.machine.pc.wrapping_add(4);
                Ok(())
            }
            OPCODE_JALR => {
                let target = self.x(inst.rs1).wrapping_add(inst.imm as u32) & !1u32;
                let return_addr = self.machine.pc.wrapping_add(4);
                self.set_x(inst.rd, return_addr);
                self.machine.pc = target;
                Ok(())
            }
            OPCODE_SYSTEM => {
                if inst.imm == 0 {
                    self.handle_ecall()?;
                    self.machine.pc = self.machine.pc.wrapping_add(4);
                    Ok(())
                } else if inst.imm == 1 {
                    Err(Trap::Breakpoint)
                } else {
                    Err(Trap::UnsupportedInstr)
                }
            }
            _ => Err(Trap::UnsupportedInstr),
        }
    }

    fn execute_s(&mut self, inst: &DecodedInstruction) -> Result<(), Trap> {
        let addr = self.x(inst.rs1).wrapping_add(inst.imm as u32);
        let value = self.x(inst.rs2);
        match inst.funct3 {
            0x0 => self.machine.memory.write_byte(addr, value as u8)?,
            0x1 => self.machine.memory.write_halfword(addr, value as u16)?,
            0x2 => self.machine.memory.write_word(addr, value)?,
            _ => return Err(Trap::UnsupportedInstr),
        }
        self.machine.pc = self.machine.pc.wrapping_add(4);
        Ok(())
    }

    fn execute_b(&mut self, inst: &DecodedInstruction) -> Result<(), Trap> {
        let a = self.x(inst.rs1);
        let b = self.x(inst.rs2);
        let taken = match inst.funct3 {
            0x0 => a == b,
            0x1 => a != b,
            0x4 => (a as i32) < (b as i32),
            0x5 => (a as i32) >= (b as i32),
            0x6 => a < b,
            0x7 => a >= b,
            _ => return Err(Trap::UnsupportedInstr),
        };
        self.machine.pc = if taken {
            self.machine.pc.wrapping_add(inst.imm as u32)
        } else {
            self.machine.pc.wrapping_add(4)
        };
        Ok(())
    }

    fn execute_u(&mut self, inst: &DecodedInstruction) -> Result<(), Trap> {
        use crate::decode::OPCODE_LUI;

        let result = if inst.opcode == OPCODE_LUI {
            inst.imm as u32
        } else {
            self.machine.pc.wrapping_add(inst.imm as u32)
        };
        self.set_x(inst.rd, result);
        self.machine.pc = self.machine.pc.wrapping_add(4);
        Ok(())
    }

    fn execute_j(&mut self, inst: &DecodedInstruction) -> Result<(), Trap> {
        let return_addr = self.machine.pc.wrapping_add(4);
        self.set_x(inst.rd, return_addr);
        self.machine.pc = self.machine.pc.wrapping_add(inst.imm as u32);
        Ok(())
    }

    fn handle_ecall(&mut self) -> Result<(), Trap> {
        let syscall_num = self.x(17); // a7
        let a0 = self.x(10);
        let a1 = self.x(11);
        let a2 = self.x(12);

        match syscall_num {
            93 => {
                let code = (a0 & 0xff) as u8;
                println!("Program exited with code {code}");
                Err(Trap::Exit(code))
            }
            64 => {
                if a0 == 1 {
                    let mut out = Vec::with_capacity(a2 as usize);
                    for i in 0..a2 {
                        out.push(self.machine.memory.read_byte(a1.wrapping_add(i))?);
                    }
                    io::stdout().write_all(&out).ok();
                    self.set_x(10, a2);
                } else {
                    self.set_x(10, 0xffff_ffff);
                }
                Ok(())
            }
            other => {
                eprintln!("unknown syscall: {other}");
                self.set_x(10, 0xffff_ffff);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_program(machine: &mut MachineState, base: u32, words: &[u32]) {
        for (i, word) in words.iter().enumerate() {
            machine
                .memory
                .write_word(base + 4 * i as u32, *word)
                .unwrap();
        }
        machine.pc = base;
    }

    #[test]
    fn three_instruction_add() {
        let mut machine = MachineState::new(4096);
        load_program(
            &mut machine,
            0x1000,
            &[0x00A00093, 0x01400113, 0x002081B3],
        );
        let mut interp = Interpreter::new(&mut machine);
        for _ in 0..3 {
            interp.step().unwrap();
        }
        assert_eq!(machine.registers.read(1).unwrap(), 10);
        assert_eq!(machine.registers.read(2).unwrap(), 20);
        assert_eq!(machine.registers.read(3).unwrap(), 30);
        assert_eq!(machine.pc, 0x100C);
    }

    #[test]
    fn branch_backward_loop() {
        // addi x1,x0,5 ; addi x1,x1,-1 ; bne x1,x0,-4 ; addi x2,x0,42
        let mut machine = MachineState::new(4096);
        load_program(
            &mut machine,
            0x1000,
            &[0x00500093, 0xFFF08093, 0xFE009EE3, 0x02A00113],
        );
        let mut interp = Interpreter::new(&mut machine);
        let report = interp.run(100).unwrap();
        assert_eq!(machine.registers.read(1).unwrap(), 0);
        assert_eq!(machine.registers.read(2).unwrap(), 42);
        assert_eq!(report.stopped, StopReason::MaxInstructions);
    }

    #[test]
    fn x0_is_immutable_under_interpretation() {
        // addi x0,x0,7 ; add x1,x0,x0
        let mut machine = MachineState::new(4096);
        load_program(&mut machine, 0x1000, &[0x00700013, 0x000081B3]);
        let mut interp = Interpreter::new(&mut machine);
        interp.step().unwrap();
        interp.step().unwrap();
        assert_eq!(machine.registers.read(0).unwrap(), 0);
        assert_eq!(machine.registers.read(1).unwrap(), 0);
    }

    #[test]
    fn exit_syscall_ends_the_run() {
        // li a7,93 (addi x17,x0,93) ; ecall
        let mut machine = MachineState::new(4096);
        machine.registers.write(10, 7).unwrap(); // a0 = exit code
        load_program(&mut machine, 0x1000, &[0x05D00893, 0x00000073]);
        let mut interp = Interpreter::new(&mut machine);
        let report = interp.run(10).unwrap();
        assert_eq!(report.stopped, StopReason::Exit(7));
        assert_eq!(report.instructions_executed, 2);
    }

    #[test]
    fn ebreak_is_fatal() {
        // ecall encoding with imm=1 is EBREAK: 0x00100073
        let mut machine = MachineState::new(4096);
        load_program(&mut machine, 0x1000, &[0x00100073]);
        let mut interp = Interpreter::new(&mut machine);
        assert!(matches!(interp.step(), Err(Trap::Breakpoint)));
    }

    #[test]
    fn out_of_range_fetch_is_a_memory_fault() {
        let mut machine = MachineState::new(16);
        machine.pc = 100;
        let mut interp = Interpreter::new(&mut machine);
        assert!(matches!(interp.step(), Err(Trap::Memory(_))));
    }
}
