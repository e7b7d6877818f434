use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Three dimensional grid or block extent (or coordinate).
#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dim {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to parse {value:?}: {source:?}")]
    Parse {
        value: String,
        source: Option<std::num::ParseIntError>,
    },
}

static DIM_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\(?\s*(\d+)\s*(?:,\s*(\d+)\s*)?(?:,\s*(\d+)\s*)?\)?\s*$")
        .expect("valid dim regex")
});

impl TryFrom<&str> for Dim {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let captures = DIM_REGEX.captures(value).ok_or_else(|| Error::Parse {
            value: value.to_string(),
            source: None,
        })?;
        // missing y and z components default to one
        let get_dim = |i: usize| match captures.get(i) {
            None => Ok(1),
            Some(dim) => dim.as_str().parse().map_err(|err| Error::Parse {
                value: value.to_string(),
                source: Some(err),
            }),
        };

        Ok(Self {
            x: get_dim(1)?,
            y: get_dim(2)?,
            z: get_dim(3)?,
        })
    }
}

impl std::str::FromStr for Dim {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::try_from(value)
    }
}

impl Dim {
    pub const ZERO: Self = Self { x: 0, y: 0, z: 0 };

    #[must_use]
    #[inline]
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    #[must_use]
    #[inline]
    pub fn size(&self) -> u64 {
        u64::from(self.x) * u64::from(self.y) * u64::from(self.z)
    }

    #[must_use]
    #[inline]
    pub fn into_tuple(&self) -> (u32, u32, u32) {
        (self.x, self.y, self.z)
    }

    /// Linear index of this coordinate inside `bound` (x fastest).
    #[must_use]
    #[inline]
    pub fn linear_index(&self, bound: &Dim) -> u64 {
        let x = u64::from(self.x);
        let y = u64::from(self.y);
        let z = u64::from(self.z);
        let bound_x = u64::from(bound.x);
        let bound_y = u64::from(bound.y);
        z * bound_y * bound_x + y * bound_x + x
    }

    /// Advances this coordinate in x, then y, then z order.
    ///
    /// Returns `true` if the coordinate overflowed `bound`.
    /// On overflow, `z` is left at `bound.z`.
    pub fn increment_x_then_y_then_z(&mut self, bound: &Dim) -> bool {
        self.x += 1;
        if self.x >= bound.x {
            self.x = 0;
            self.y += 1;
            if self.y >= bound.y {
                self.y = 0;
                if self.z < bound.z {
                    self.z += 1;
                }
                if self.z >= bound.z {
                    return true;
                }
            }
        }
        false
    }

    /// Whether this coordinate lies outside of `bound`.
    #[must_use]
    #[inline]
    pub fn exceeds(&self, bound: &Dim) -> bool {
        self.x >= bound.x || self.y >= bound.y || self.z >= bound.z
    }
}

impl std::fmt::Display for Dim {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

impl From<u32> for Dim {
    #[inline]
    fn from(dim: u32) -> Self {
        Self { x: dim, y: 1, z: 1 }
    }
}

impl From<(u32, u32)> for Dim {
    #[inline]
    fn from(dim: (u32, u32)) -> Self {
        let (x, y) = dim;
        Self { x, y, z: 1 }
    }
}

impl From<(u32, u32, u32)> for Dim {
    #[inline]
    fn from(dim: (u32, u32, u32)) -> Self {
        let (x, y, z) = dim;
        Self { x, y, z }
    }
}
