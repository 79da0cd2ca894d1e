use std::sync::atomic::{AtomicU64, Ordering};

/// A globally unique thread identifier, stable across both mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl ThreadId {
    /// Allocates the next identifier. Ids are never recycled within one
    /// process lifetime.
    pub fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_unique() {
        let a = ThreadId::next();
        let b = ThreadId::next();
        assert!(b.as_u64() > a.as_u64());
    }
}
