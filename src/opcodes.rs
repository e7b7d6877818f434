use serde::{Deserialize, Serialize};

/// Operation class of a decoded instruction.
///
/// The core only distinguishes instructions by class: memory instructions
/// generate accesses, calls and returns drive the divergence stack.
#[derive(
    strum::AsRefStr,
    strum::EnumIter,
    Debug,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[repr(usize)]
pub enum ArchOp {
    /// No-op
    NO_OP,
    ALU_OP,
    SFU_OP,
    ALU_SFU_OP,
    /// Load operation
    LOAD_OP,
    /// Store operation
    STORE_OP,
    BRANCH_OP,
    BARRIER_OP,
    MEMORY_BARRIER_OP,
    CALL_OPS,
    RET_OPS,
}

impl ArchOp {
    #[must_use]
    pub fn is_memory(self) -> bool {
        matches!(
            self,
            Self::LOAD_OP | Self::STORE_OP | Self::BARRIER_OP | Self::MEMORY_BARRIER_OP
        )
    }
}

impl std::fmt::Display for ArchOp {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}
