#![allow(non_camel_case_types, clippy::upper_case_acronyms)]

pub mod instructions;
pub mod mem;
pub mod pc;

pub use instructions::InstructionCounts;
pub use mem::Accesses;
pub use pc::{PcStats, PerPc};

use serde::{Deserialize, Serialize};

/// Telemetry collected while executing warps.
///
/// Purely observational: nothing in here feeds back into scheduling.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub accesses: Accesses,
    pub instructions: InstructionCounts,
    pub pc: PerPc,
}

impl Stats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_smem_bank_conflict(&mut self, pc: u64, n: u64) {
        self.pc.entry(pc).smem_bank_conflicts += n;
    }

    pub fn add_uncoalesced_gmem(&mut self, pc: u64, n: u64) {
        self.pc.entry(pc).uncoalesced_gmem += n;
    }

    pub fn add_warp_divergence(&mut self, pc: u64, n: u64) {
        self.pc.entry(pc).warp_divergence += n;
    }

    pub fn add_latency(&mut self, pc: u64, latency: u64) {
        self.pc.entry(pc).latency += latency;
    }
}

impl std::ops::AddAssign for Stats {
    fn add_assign(&mut self, other: Self) {
        self.accesses += other.accesses;
        self.instructions += other.instructions;
        self.pc += other.pc;
    }
}
