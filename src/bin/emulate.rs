//! CLI entry point: loads an ELF binary and runs it to completion,
//! optionally profiling, JIT-accelerating hot blocks, or single-
//! stepping with a debug prompt. Reference-only per spec.md section 6
//! ("not core"); grounded in the teacher's own `src/bin/emulate.rs`
//! (clap derive + `clap-num::maybe_hex` + a `rustyline`-backed
//! press-enter-to-continue prompt).

use std::io::{self, Write};

use clap::Parser;
use clap_num::maybe_hex;

use rv32jit::elf_loader::load_elf;
use rv32jit::interpreter::{Interpreter, Trap};
use rv32jit::jit::JitCompiler;
use rv32jit::machine::MachineState;
use rv32jit::memory::DEFAULT_MEMORY_SIZE;
use rv32jit::profiler::Profiler;

/// Run an RV32I ELF binary under the interpreter, with optional
/// profiling and ARM64 JIT acceleration.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Args {
    /// Path to a statically-linked 32-bit RISC-V ELF executable
    input: String,

    /// Maximum number of guest instructions to execute (use 0x prefix
    /// for hexadecimal)
    #[arg(short = 'n', long, value_parser=maybe_hex::<u64>, default_value = "100000000")]
    max_instructions: u64,

    /// Enable the per-PC execution profiler and print a report on exit
    #[arg(short, long)]
    profile: bool,

    /// Enable the ARM64 template JIT for hot basic blocks
    #[arg(short, long)]
    jit: bool,

    /// Execution count at which a PC becomes a JIT compile candidate
    #[arg(long, value_parser=maybe_hex::<u64>, default_value = "50")]
    jit_threshold: u64,

    /// Single-step through each instruction, printing state and
    /// waiting for Enter between steps
    #[arg(short, long)]
    debug: bool,

    /// Print the 8-word memory region starting from this address on
    /// every debug step (use 0x prefix for hexadecimal)
    #[arg(short, long, value_parser=maybe_hex::<u32>)]
    memory: Option<u32>,
}

fn press_enter_to_continue() {
    let mut stdout = io::stdout();
    write!(stdout, "Press enter to continue...").unwrap();
    stdout.flush().unwrap();
    let mut editor = rustyline::DefaultEditor::new().unwrap();
    let _ = editor.readline("");
}

fn main() {
    let args = Args::parse();

    let mut machine = MachineState::new(DEFAULT_MEMORY_SIZE);
    if let Err(e) = load_elf(&mut machine, &args.input) {
        eprintln!("error loading ELF: {e}");
        std::process::exit(1);
    }

    let mut profiler = Profiler::new();
    if !args.profile {
        profiler.disable();
    }
    let mut jit = JitCompiler::new();

    println!("Beginning execution\n");

    let mut executed = 0u64;
    let exit_code = loop {
        if executed >= args.max_instructions {
            break 0;
        }

        if args.jit {
            if let Some(span) = run_jit_step(&jit, &mut machine) {
                executed += (span / 4) as u64;
                continue;
            }
        }

        let mut interp = Interpreter::with_profiler(&mut machine, &mut profiler);
        let step_pc = interp.machine.pc;
        match interp.step() {
            Ok(()) => executed += 1,
            Err(Trap::Exit(code)) => break code,
            Err(trap) => {
                eprintln!("fatal trap at pc=0x{step_pc:08x}: {trap}");
                eprintln!("{}", machine.dump_registers());
                std::process::exit(1);
            }
        }

        if args.jit && profiler.count_at(step_pc) >= args.jit_threshold {
            jit.compile_block(&machine, step_pc);
        }

        if args.debug {
            println!("{}", machine.dump_registers());
            if let Some(base) = args.memory {
                println!("Memory:");
                println!("{}", machine.dump_memory_range(base, 32));
            }
            press_enter_to_continue();
        }
    };

    println!("\nProgram ended after {executed} instruction(s), exit code {exit_code}");
    if args.profile {
        profiler.print_report();
    }
    std::process::exit(exit_code as i32);
}

/// Look up a compiled block at the machine's current PC and, if one
/// exists, invoke it and advance PC by the guest-byte span it covers.
/// Returns that span so the caller can update the instruction count.
fn run_jit_step(jit: &JitCompiler, machine: &mut MachineState) -> Option<u32> {
    let pc = machine.pc;
    let span = jit.span_bytes(pc)?;
    unsafe {
        jit.invoke(pc, machine)?;
    }
    machine.pc = machine.pc.wrapping_add(span);
    Some(span)
}
