use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_GUID: AtomicU64 = AtomicU64::new(1);
static NEXT_FUID: AtomicU64 = AtomicU64::new(1);

/// Process-global identifier shared by every tensor and operator
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Guid(u64);

/// Functional identifier, unique among the tensors of a graph
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Fuid(u64);

impl Guid {
    pub(crate) fn next() -> Self {
        Self(NEXT_GUID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Fuid {
    pub(crate) fn next() -> Self {
        Self(NEXT_FUID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for Fuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
