use super::address;
use bitvec::BitArr;

/// Largest segment a single memory access can cover, in bytes.
pub const MAX_MEMORY_ACCESS_SIZE: usize = 128;

/// Number of 32-byte chunks in a maximal segment.
pub const SECTOR_CHUNK_SIZE: usize = 4;

pub type ByteMask = BitArr!(for MAX_MEMORY_ACCESS_SIZE);
pub type SectorMask = BitArr!(for SECTOR_CHUNK_SIZE, in u8);

/// Block address of `addr` for a power-of-two `line_size`.
#[must_use]
#[inline]
pub fn line_size_based_tag_func(addr: address, line_size: u64) -> address {
    debug_assert!(line_size.is_power_of_two());
    addr & !(line_size - 1)
}

pub mod access {
    use crate::warp::ToBitString;
    use serde::{Deserialize, Serialize};

    #[derive(
        Debug,
        strum::EnumIter,
        strum::EnumCount,
        strum::AsRefStr,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
    )]
    pub enum Kind {
        GLOBAL_ACC_R,
        LOCAL_ACC_R,
        CONST_ACC_R,
        TEXTURE_ACC_R,
        GLOBAL_ACC_W,
        LOCAL_ACC_W,
    }

    impl From<Kind> for stats::mem::AccessKind {
        fn from(kind: Kind) -> Self {
            match kind {
                Kind::GLOBAL_ACC_R => Self::GLOBAL_ACC_R,
                Kind::LOCAL_ACC_R => Self::LOCAL_ACC_R,
                Kind::CONST_ACC_R => Self::CONST_ACC_R,
                Kind::TEXTURE_ACC_R => Self::TEXTURE_ACC_R,
                Kind::GLOBAL_ACC_W => Self::GLOBAL_ACC_W,
                Kind::LOCAL_ACC_W => Self::LOCAL_ACC_W,
            }
        }
    }

    impl Kind {
        /// Kind of a global or local access in the given direction.
        #[must_use]
        pub fn global(is_write: bool) -> Self {
            if is_write {
                Self::GLOBAL_ACC_W
            } else {
                Self::GLOBAL_ACC_R
            }
        }

        #[must_use]
        pub fn local(is_write: bool) -> Self {
            if is_write {
                Self::LOCAL_ACC_W
            } else {
                Self::LOCAL_ACC_R
            }
        }

        #[must_use]
        pub fn is_global(&self) -> bool {
            matches!(self, Kind::GLOBAL_ACC_R | Kind::GLOBAL_ACC_W)
        }

        #[must_use]
        pub fn is_local(&self) -> bool {
            matches!(self, Kind::LOCAL_ACC_R | Kind::LOCAL_ACC_W)
        }

        #[must_use]
        pub fn is_write(&self) -> bool {
            matches!(self, Kind::GLOBAL_ACC_W | Kind::LOCAL_ACC_W)
        }
    }

    impl std::fmt::Display for Kind {
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str(self.as_ref())
        }
    }

    /// A hardware memory request generated by a warp instruction.
    ///
    /// Immutable once built; consumed in queue order by the memory pipeline.
    #[allow(clippy::module_name_repetitions)]
    #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct MemAccess {
        /// Requested address.
        pub addr: crate::address,
        pub is_write: bool,
        /// Requested number of bytes.
        pub req_size_bytes: u32,
        /// Access kind.
        pub kind: Kind,
        /// Warp active mask of the threads participating in this access.
        pub warp_active_mask: crate::warp::ActiveMask,
        /// Byte mask (relative to the enclosing 128 byte segment).
        pub byte_mask: super::ByteMask,
        /// 32-byte chunks of the enclosing 128 byte segment that are used.
        pub sector_mask: super::SectorMask,
    }

    impl std::fmt::Debug for MemAccess {
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.debug_struct("MemAccess")
                .field("addr", &self.addr)
                .field("kind", &self.kind)
                .field("req_size_bytes", &self.req_size_bytes)
                .field("is_write", &self.is_write)
                .field("active_mask", &self.warp_active_mask.to_bit_string())
                .field("byte_mask", &self.byte_mask.to_bit_string())
                .field("sector_mask", &self.sector_mask.to_bit_string())
                .finish()
        }
    }

    impl std::fmt::Display for MemAccess {
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(
                f,
                "{}@{:#x}[{}B]",
                self.kind, self.addr, self.req_size_bytes
            )
        }
    }

    #[derive(Debug, Clone)]
    pub struct Builder {
        pub kind: Kind,
        pub addr: crate::address,
        pub req_size_bytes: u32,
        pub is_write: bool,
        pub warp_active_mask: crate::warp::ActiveMask,
        pub byte_mask: super::ByteMask,
        pub sector_mask: super::SectorMask,
    }

    impl Builder {
        #[must_use]
        pub fn build(self) -> MemAccess {
            assert_eq!(self.kind.is_write(), self.is_write);
            MemAccess {
                addr: self.addr,
                is_write: self.is_write,
                req_size_bytes: self.req_size_bytes,
                kind: self.kind,
                warp_active_mask: self.warp_active_mask,
                byte_mask: self.byte_mask,
                sector_mask: self.sector_mask,
            }
        }
    }
}
