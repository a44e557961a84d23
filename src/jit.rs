//! Template JIT: translates a guest RV32I basic block into native
//! ARM64 code via [`Arm64Emitter`], caches the resulting entry point
//! keyed by guest start-PC, and exposes a calling shim that takes the
//! guest register array's base address.
//!
//! Grounded in `jit/jit_compiler.cpp`'s `compile_basic_block` /
//! `compile_instruction`: the block-boundary policy (register bank
//! 0..7, hard ceiling of 10 instructions, stop at branch/jump/JALR/
//! ECALL or an unsupported opcode), the `x_i -> W(9+i)` register
//! mapping, and the prologue/epilogue load/store-back shape are all
//! carried over unchanged; only the encoder underneath differs (the
//! Rust [`Arm64Emitter`] instead of hand-written byte sequences).

use std::collections::HashMap;
use std::mem;

use crate::arm64_emitter::Arm64Emitter;
use crate::code_buffer::CodeBuffer;
use crate::decode::{decode, DecodedInstruction, Format};
use crate::machine::MachineState;

/// Compiled blocks receive the register array's base pointer in X0 and
/// return nothing; they mutate `registers[1..=30]` in place (the
/// prologue/epilogue never touch x0 or register indices >= 8).
type CompiledFn = unsafe extern "C" fn(*mut u32);

/// First RV32I register the JIT's host register bank cannot reach.
/// Guest registers 0..SUPPORTED_REGISTER_COUNT map to W9..W16; any
/// instruction reading or writing a register at or above this bound
/// ends the block (never a hard error — spec.md section 9's resolved
/// Open Question).
const SUPPORTED_REGISTER_COUNT: u8 = 8;

/// Lowest host scratch register used for the guest register bank;
/// guest x_i lives in W(HOST_BANK_BASE + i).
const HOST_BANK_BASE: u8 = 9;

/// Hard ceiling on instructions translated into a single block,
/// matching the teacher's `instructions_compiled < 10`.
const MAX_BLOCK_INSTRUCTIONS: usize = 10;

fn host_reg(guest: u8) -> u8 {
    HOST_BANK_BASE + guest
}

/// An entry in the compiled-block cache: an executable function
/// pointer co-owned with the [`CodeBuffer`] it lives in (so the buffer
/// outlives every pointer handed out from it), plus the guest
/// instruction span it covers so the driver can re-synchronize PC.
struct CompiledBlock {
    buffer: CodeBuffer,
    entry: CompiledFn,
    instructions: u32,
}

/// Owns every compiled block's [`CodeBuffer`] and the start-PC -> entry
/// mapping. Never evicts entries within a run (spec.md section 3: the
/// running guest program is assumed non-self-modifying).
#[derive(Default)]
pub struct JitCompiler {
    cache: HashMap<u32, CompiledBlock>,
}

impl JitCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_compiled(&self, pc: u32) -> bool {
        self.cache.contains_key(&pc)
    }

    pub fn compiled_block_count(&self) -> usize {
        self.cache.len()
    }

    /// Look up a compiled entry for `pc`. Returns the callable shim and
    /// the number of guest instructions it covers (for PC
    /// re-synchronization after invocation), or `None` if nothing is
    /// compiled there yet.
    pub fn lookup(&self, pc: u32) -> Option<(CompiledFn, u32)> {
        self.cache.get(&pc).map(|b| (b.entry, b.instructions))
    }

    /// Guest-byte span a compiled block covers (`4 * instructions`),
    /// used by the driver to re-synchronize PC after invocation.
    pub fn span_bytes(&self, pc: u32) -> Option<u32> {
        self.cache.get(&pc).map(|b| b.instructions * 4)
    }

    /// Invoke a previously compiled block, passing the guest register
    /// array's base pointer per the calling convention of spec.md
    /// section 4.6. Returns the number of guest instructions the block
    /// covers so the caller can advance PC by `4 * instructions`.
    ///
    /// # Safety
    /// `pc` must name an entry this compiler produced; `machine` must
    /// outlive the call and its registers must be the live bank the
    /// block was compiled against.
    pub unsafe fn invoke(&self, pc: u32, machine: &mut MachineState) -> Option<u32> {
        let (entry, instructions) = self.lookup(pc)?;
        entry(machine.registers.as_mut_ptr());
        Some(instructions)
    }

    /// Attempt to compile a basic block starting at `start_pc`. Stops
    /// at the first instruction that is unsupported, touches a
    /// register outside the 0..8 bank, is a branch/jump/JALR/ECALL, or
    /// after [`MAX_BLOCK_INSTRUCTIONS`]. An empty block (nothing
    /// translatable) is discarded and leaves no cache entry, per
    /// spec.md section 4.6's block boundary policy. Encoding/overflow
    /// failures are swallowed the same way: this never errors to the
    /// caller, it just leaves `pc` uncompiled (spec.md section 9's
    /// resolved Open Question, grounded in `jit_compiler.cpp`'s `catch`
    /// around the whole compile loop).
    pub fn compile_block(&mut self, machine: &MachineState, start_pc: u32) {
        if self.cache.contains_key(&start_pc) {
            return;
        }
        match try_compile(machine, start_pc) {
            Some(block) => {
                println!(
                    "JIT: compiled {} instruction(s) at 0x{start_pc:08x}",
                    block.instructions
                );
                self.cache.insert(start_pc, block);
            }
            None => {
                println!("JIT: no instructions compiled at 0x{start_pc:08x}");
            }
        }
    }
}

/// Instructions the translator can lower today: R-type ALU ops, plus
/// `ADDI` with a small non-negative immediate (spec.md section 4.6).
fn translate_one(emitter: &mut Arm64Emitter, inst: &DecodedInstruction) -> Option<bool> {
    use crate::decode::{OPCODE_OP, OPCODE_OP_IMM};

    if inst.opcode == OPCODE_OP {
        let rd = host_reg(inst.rd);
        let rs1 = host_reg(inst.rs1);
        let rs2 = host_reg(inst.rs2);
        let ok = match (inst.funct3, inst.funct7) {
            (0x0, 0x00) => emitter.add(rd, rs1, rs2).is_ok(),
            (0x0, 0x20) => emitter.sub(rd, rs1, rs2).is_ok(),
            (0x4, _) => emitter.eor(rd, rs1, rs2).is_ok(),
            (0x6, _) => emitter.orr(rd, rs1, rs2).is_ok(),
            (0x7, _) => emitter.and(rd, rs1, rs2).is_ok(),
            _ => return Some(false),
        };
        return Some(ok);
    }

    if inst.opcode == OPCODE_OP_IMM && inst.funct3 == 0x0 && (0..=0xFFFF).contains(&inst.imm) {
        let rd = host_reg(inst.rd);
        let rs1 = host_reg(inst.rs1);
        // Reserve W8 (outside the guest bank) as the immediate scratch.
        let scratch = 8u8;
        let ok = emitter.mov_imm16(scratch, inst.imm as u16).is_ok()
            && emitter.add(rd, rs1, scratch).is_ok();
        return Some(ok);
    }

    Some(false)
}

/// True if `inst` ends a basic block regardless of whether the
/// translator can lower it: branches, jumps, JALR, and ECALL always
/// stop compilation (spec.md section 4.6).
fn is_block_boundary(inst: &DecodedInstruction) -> bool {
    use crate::decode::{OPCODE_JAL, OPCODE_JALR, OPCODE_SYSTEM};

    matches!(inst.format, Format::B)
        || inst.opcode == OPCODE_JAL
        || inst.opcode == OPCODE_JALR
        || inst.opcode == OPCODE_SYSTEM
}

/// True if any register `inst` reads or writes falls outside the
/// JIT's supported 0..8 bank.
fn touches_unsupported_register(inst: &DecodedInstruction) -> bool {
    let rd_out = inst.rd >= SUPPORTED_REGISTER_COUNT
        && matches!(inst.format, Format::R | Format::I | Format::U | Format::J);
    let rs1_out = inst.rs1 >= SUPPORTED_REGISTER_COUNT
        && matches!(inst.format, Format::R | Format::I | Format::S | Format::B);
    let rs2_out = inst.rs2 >= SUPPORTED_REGISTER_COUNT
        && matches!(inst.format, Format::R | Format::S | Format::B);
    rd_out || rs1_out || rs2_out
}

fn try_compile(machine: &MachineState, start_pc: u32) -> Option<CompiledBlock> {
    let mut buffer = CodeBuffer::with_default_size().ok()?;
    let mut emitter = Arm64Emitter::new(&mut buffer);

    // Prologue: x0's live copy is always zero; x1..x7 are loaded from
    // [X0 + 4*i]. X0 itself (the register-array base pointer) is left
    // untouched so the epilogue can still address memory through it.
    if emitter.mov_imm16(host_reg(0), 0).is_err() {
        return None;
    }
    for i in 1..SUPPORTED_REGISTER_COUNT {
        if emitter.ldr(host_reg(i), 0, i as i32 * 4).is_err() {
            return None;
        }
    }

    let mut pc = start_pc;
    let mut compiled = 0u32;

    while (compiled as usize) < MAX_BLOCK_INSTRUCTIONS {
        let raw = match machine.memory.read_word(pc) {
            Ok(raw) => raw,
            Err(_) => break,
        };
        let inst = match decode(raw) {
            Ok(inst) => inst,
            Err(_) => break,
        };

        if touches_unsupported_register(&inst) {
            break;
        }

        let boundary = is_block_boundary(&inst);
        if boundary {
            break;
        }

        match translate_one(&mut emitter, &inst) {
            Some(true) => {
                compiled += 1;
                pc = pc.wrapping_add(4);
            }
            Some(false) | None => break,
        }
    }

    if compiled == 0 {
        return None;
    }

    // Epilogue: store the live bank back, then return.
    for i in 1..SUPPORTED_REGISTER_COUNT {
        if emitter.str(host_reg(i), 0, i as i32 * 4).is_err() {
            return None;
        }
    }
    if emitter.ret().is_err() {
        return None;
    }

    if buffer.seal().is_err() {
        return None;
    }

    let entry_ptr = buffer.entry_ptr().ok()?;
    let entry: CompiledFn = unsafe { mem::transmute(entry_ptr) };

    Some(CompiledBlock {
        buffer,
        entry,
        instructions: compiled,
    })
}
