use std::fmt;

/// Reference to a polygon (or off-mesh link) of the navigation data.
///
/// Zero is reserved as the null reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct PolyRef(u64);

impl PolyRef {
    pub const NULL: PolyRef = PolyRef(0);

    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn id(self) -> u64 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for PolyRef {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for PolyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
