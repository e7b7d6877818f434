use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Counters attributed to a single program counter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PcStats {
    /// Shared memory transactions after bank conflict serialization.
    pub smem_bank_conflicts: u64,
    /// Global memory transactions generated by the instruction.
    pub uncoalesced_gmem: u64,
    /// Number of times a warp diverged at this instruction.
    pub warp_divergence: u64,
    /// Accumulated `latency * active threads`.
    pub latency: u64,
}

impl std::ops::AddAssign for PcStats {
    fn add_assign(&mut self, other: Self) {
        self.smem_bank_conflicts += other.smem_bank_conflicts;
        self.uncoalesced_gmem += other.uncoalesced_gmem;
        self.warp_divergence += other.warp_divergence;
        self.latency += other.latency;
    }
}

/// Per-PC statistics in first-seen order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerPc(pub IndexMap<u64, PcStats>);

impl PerPc {
    pub fn entry(&mut self, pc: u64) -> &mut PcStats {
        self.0.entry(pc).or_default()
    }

    #[must_use]
    pub fn get(&self, pc: u64) -> PcStats {
        self.0.get(&pc).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn sorted(&self) -> Vec<(u64, PcStats)> {
        let mut entries: Vec<_> = self.0.iter().map(|(pc, s)| (*pc, *s)).collect();
        entries.sort_by_key(|(pc, _)| *pc);
        entries
    }

    #[must_use]
    pub fn total(&self) -> PcStats {
        let mut total = PcStats::default();
        for stats in self.0.values() {
            total += *stats;
        }
        total
    }
}

impl std::ops::AddAssign for PerPc {
    fn add_assign(&mut self, other: Self) {
        for (pc, stats) in other.0 {
            *self.entry(pc) += stats;
        }
    }
}
