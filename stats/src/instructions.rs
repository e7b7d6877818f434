use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(
    Debug,
    Copy,
    Clone,
    strum::EnumIter,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub enum MemorySpace {
    Local,
    Shared,
    Constant,
    Texture,
    Global,
    /// Kernel parameters (read-only, global to all threads of a kernel).
    ParamKernel,
    /// Thread-local parameters.
    ParamLocal,
    /// Parameter buffer of a dynamically launched child kernel.
    ChildParam,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadStore {
    pub loads: u64,
    pub stores: u64,
}

impl LoadStore {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.loads + self.stores
    }
}

/// Memory instructions that generated accesses, per memory space.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionCounts(pub BTreeMap<MemorySpace, LoadStore>);

impl std::ops::AddAssign for InstructionCounts {
    fn add_assign(&mut self, other: Self) {
        for (space, counts) in other.0 {
            let entry = self.0.entry(space).or_default();
            entry.loads += counts.loads;
            entry.stores += counts.stores;
        }
    }
}

impl InstructionCounts {
    pub fn inc(&mut self, space: impl Into<MemorySpace>, is_store: bool, count: u64) {
        let entry = self.0.entry(space.into()).or_default();
        if is_store {
            entry.stores += count;
        } else {
            entry.loads += count;
        }
    }

    #[must_use]
    pub fn get(&self, space: MemorySpace) -> LoadStore {
        self.0.get(&space).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.0.values().map(LoadStore::total).sum()
    }
}
