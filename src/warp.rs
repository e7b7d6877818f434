use bitvec::{array::BitArray, BitArr};
use itertools::Itertools;

/// Maximum supported warp size.
///
/// The configured warp size may be smaller (e.g. for tests), but never larger.
pub const MAX_WARP_SIZE: usize = 32;

/// Thread active mask.
///
/// Bitmask where a 1 at position i means that thread i is active for the current instruction.
pub type ActiveMask = BitArr!(for MAX_WARP_SIZE, in u32);

pub trait ToBitString {
    fn to_bit_string(&self) -> String;
}

impl<A, O> ToBitString for bitvec::slice::BitSlice<A, O>
where
    A: bitvec::store::BitStore,
    O: bitvec::order::BitOrder,
{
    fn to_bit_string(&self) -> String {
        self.iter()
            .rev()
            .map(|b| if *b { "1" } else { "0" })
            .join("")
    }
}

/// Mask with the first `warp_size` lanes set.
#[must_use]
pub fn full_mask(warp_size: usize) -> ActiveMask {
    assert!(
        warp_size <= MAX_WARP_SIZE,
        "warp size {warp_size} exceeds maximum of {MAX_WARP_SIZE}"
    );
    let mut mask = BitArray::ZERO;
    mask[..warp_size].fill(true);
    mask
}

/// Builds an active mask from a list of lanes.
#[must_use]
pub fn mask_from_lanes(lanes: impl IntoIterator<Item = usize>) -> ActiveMask {
    let mut mask = BitArray::ZERO;
    for lane in lanes {
        mask.set(lane, true);
    }
    mask
}
