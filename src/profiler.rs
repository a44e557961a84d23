//! Per-PC execution-count tracking, used to pick JIT compile targets and
//! (at the CLI level) to print a hot-instruction report.

use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct Profiler {
    counts: HashMap<u32, u64>,
    total_instructions: u64,
    enabled: bool,
}

impl Profiler {
    pub fn new() -> Self {
        Self {
            counts: HashMap::new(),
            total_instructions: 0,
            enabled: true,
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn reset(&mut self) {
        self.counts.clear();
        self.total_instructions = 0;
    }

    /// Increment the execution count for `pc`. No-op while disabled.
    pub fn record(&mut self, pc: u32) {
        if !self.enabled {
            return;
        }
        *self.counts.entry(pc).or_insert(0) += 1;
        self.total_instructions += 1;
    }

    pub fn total_instructions(&self) -> u64 {
        self.total_instructions
    }

    pub fn unique_instructions(&self) -> usize {
        self.counts.len()
    }

    pub fn count_at(&self, pc: u32) -> u64 {
        self.counts.get(&pc).copied().unwrap_or(0)
    }

    pub fn instruction_percentage(&self, pc: u32) -> f64 {
        if self.total_instructions == 0 {
            return 0.0;
        }
        self.count_at(pc) as f64 / self.total_instructions as f64 * 100.0
    }

    /// The `n` highest-count PCs, descending by count, ties broken by PC
    /// ascending for determinism.
    pub fn hot_list(&self, n: usize) -> Vec<(u32, u64)> {
        let mut entries: Vec<(u32, u64)> = self.counts.iter().map(|(&pc, &c)| (pc, c)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        entries.truncate(n);
        entries
    }

    /// All PCs whose count is at least `threshold`, used by the JIT as
    /// compile candidates.
    pub fn hot_threshold(&self, threshold: u64) -> Vec<u32> {
        let mut pcs: Vec<u32> = self
            .counts
            .iter()
            .filter(|&(_, &count)| count >= threshold)
            .map(|(&pc, _)| pc)
            .collect();
        pcs.sort_unstable();
        pcs
    }

    /// Presentation helper mirroring a profiler's printed report: top-20
    /// hot list with percentages, followed by any hot loops above 100
    /// executions. Not used by the interpreter or JIT.
    pub fn print_report(&self) {
        println!("\n=== Execution Profile ===");
        println!("Total instructions: {}", self.total_instructions);
        println!("Unique PCs: {}", self.unique_instructions());
        println!("\n=== Top 20 Hottest Instructions ===");
        for (pc, count) in self.hot_list(20) {
            println!(
                "0x{pc:08x}  {count:<13}  {:.2}%",
                self.instruction_percentage(pc)
            );
        }
        let hot_loops = self.hot_threshold(100);
        if !hot_loops.is_empty() {
            println!("\n=== Hot Loops (>=100 executions) ===");
            for pc in hot_loops {
                println!("0x{pc:08x} - executed {} times", self.count_at(pc));
            }
        }
    }
}
