//! Connection identifiers.
//!
//! Every Framed Duplex Channel is assigned a [`ConnectionId`] the moment it
//! is created (whether dialed or accepted), purely for logging and tracing.
//! Ids are never reused and carry no wire-visible meaning.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Monotone identifier for a single connection's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next connection id. Thread-safe, process-wide, never reused.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric value, for inclusion in log lines.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotone_and_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        let c = ConnectionId::next();
        assert!(a.get() < b.get());
        assert!(b.get() < c.get());
    }

    #[test]
    fn display_format() {
        let id = ConnectionId::next();
        assert!(format!("{id}").starts_with("conn#"));
    }
}
