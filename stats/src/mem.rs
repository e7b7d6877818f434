use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind of a memory access handed to the memory pipeline.
#[derive(
    Debug,
    strum::EnumIter,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub enum AccessKind {
    GLOBAL_ACC_R,
    LOCAL_ACC_R,
    CONST_ACC_R,
    TEXTURE_ACC_R,
    GLOBAL_ACC_W,
    LOCAL_ACC_W,
}

impl AccessKind {
    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(self, AccessKind::GLOBAL_ACC_W | AccessKind::LOCAL_ACC_W)
    }
}

/// Number of generated accesses per kind.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accesses(pub HashMap<AccessKind, u64>);

impl std::fmt::Debug for Accesses {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_map().entries(self.sorted()).finish()
    }
}

impl std::ops::AddAssign for Accesses {
    fn add_assign(&mut self, other: Self) {
        for (kind, count) in other.0 {
            *self.0.entry(kind).or_insert(0) += count;
        }
    }
}

impl Accesses {
    pub fn inc(&mut self, kind: impl Into<AccessKind>, count: u64) {
        *self.0.entry(kind.into()).or_insert(0) += count;
    }

    #[must_use]
    pub fn num_accesses(&self, kind: AccessKind) -> u64 {
        self.0.get(&kind).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn num_writes(&self) -> u64 {
        self.0
            .iter()
            .filter_map(|(kind, count)| kind.is_write().then_some(count))
            .sum()
    }

    #[must_use]
    pub fn num_reads(&self) -> u64 {
        self.0
            .iter()
            .filter_map(|(kind, count)| (!kind.is_write()).then_some(count))
            .sum()
    }

    /// Non-zero counts ordered by kind.
    #[must_use]
    pub fn sorted(&self) -> Vec<(AccessKind, u64)> {
        let mut counts: Vec<_> = self
            .0
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(kind, count)| (*kind, *count))
            .collect();
        counts.sort();
        counts
    }
}
