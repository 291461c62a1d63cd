//! Per-public-key spare pool.
//!
//! The Relay Broker Server parks one LIFO stack of authenticated, idle
//! connections per registered public key. Popping (on splice) always takes
//! the most recently parked spare — the warmest connection, least likely
//! to have gone stale.
//!
//! All mutations are serialized behind one lock, matching the concurrency
//! model's "broker pool map guarded by a single lock" requirement: pushes on
//! successful auth, pops on splice, removals on close.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::ids::ConnectionId;

/// A parked spare connection, identified by its connection id so the pool
/// can remove it later without holding the connection object itself.
pub struct Spare<T> {
    /// The connection id, for logging and removal.
    pub id: ConnectionId,
    /// The parked value (an FDC, or a handle that can stop its ping/pong
    /// loop and hand off the underlying connection).
    pub value: T,
}

impl<T> fmt::Debug for Spare<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spare").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Keyed LIFO pool of spare connections, one stack per registered public key
/// (hex-encoded, since public keys are used as map keys and log fields
/// throughout the broker).
pub struct SparePool<T> {
    stacks: Mutex<HashMap<String, Vec<Spare<T>>>>,
}

impl<T> Default for SparePool<T> {
    fn default() -> Self {
        Self {
            stacks: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> fmt::Debug for SparePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SparePool").finish_non_exhaustive()
    }
}

impl<T> SparePool<T> {
    /// A fresh, empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a newly authenticated spare under `public_key_hex`.
    pub async fn push(&self, public_key_hex: &str, spare: Spare<T>) {
        let mut stacks = self.stacks.lock().await;
        stacks.entry(public_key_hex.to_string()).or_default().push(spare);
    }

    /// Pop the most recently parked spare for `public_key_hex`, if any.
    pub async fn pop(&self, public_key_hex: &str) -> Option<Spare<T>> {
        let mut stacks = self.stacks.lock().await;
        let stack = stacks.get_mut(public_key_hex)?;
        let spare = stack.pop();
        if stack.is_empty() {
            stacks.remove(public_key_hex);
        }
        spare
    }

    /// Remove a specific parked spare by id (used when its FDC closes while
    /// still parked, rather than being popped for splice).
    pub async fn remove(&self, public_key_hex: &str, id: ConnectionId) -> bool {
        let mut stacks = self.stacks.lock().await;
        let Some(stack) = stacks.get_mut(public_key_hex) else {
            return false;
        };
        let before = stack.len();
        stack.retain(|spare| spare.id != id);
        let removed = stack.len() != before;
        if stack.is_empty() {
            stacks.remove(public_key_hex);
        }
        removed
    }

    /// Total number of parked spares across all public keys, for pool
    /// accounting invariants in tests.
    pub async fn total_parked(&self) -> usize {
        self.stacks.lock().await.values().map(Vec::len).sum()
    }

    /// Number of spares parked under one public key.
    pub async fn parked_for(&self, public_key_hex: &str) -> usize {
        self.stacks
            .lock()
            .await
            .get(public_key_hex)
            .map_or(0, Vec::len)
    }

    /// Remove and return every parked spare across all public keys, for
    /// graceful shutdown: close parked spares before exiting, leaving
    /// established post-handover splices alone.
    pub async fn drain_all(&self) -> Vec<Spare<T>> {
        let mut stacks = self.stacks.lock().await;
        let drained = stacks.drain().flat_map(|(_, stack)| stack).collect();
        drained
    }
}

/// A shareable pool handle, the form every broker task actually holds.
pub type SharedSparePool<T> = Arc<SparePool<T>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_then_pop_is_lifo() {
        let pool: SparePool<u32> = SparePool::new();
        pool.push("ab", Spare { id: ConnectionId::next(), value: 1 }).await;
        pool.push("ab", Spare { id: ConnectionId::next(), value: 2 }).await;
        let top = pool.pop("ab").await.unwrap();
        assert_eq!(top.value, 2);
        let next = pool.pop("ab").await.unwrap();
        assert_eq!(next.value, 1);
        assert!(pool.pop("ab").await.is_none());
    }

    #[tokio::test]
    async fn pop_on_empty_key_is_none() {
        let pool: SparePool<u32> = SparePool::new();
        assert!(pool.pop("never-registered").await.is_none());
    }

    #[tokio::test]
    async fn remove_by_id_drops_only_that_spare() {
        let pool: SparePool<u32> = SparePool::new();
        let keep = ConnectionId::next();
        let drop_id = ConnectionId::next();
        pool.push("ab", Spare { id: keep, value: 1 }).await;
        pool.push("ab", Spare { id: drop_id, value: 2 }).await;
        assert!(pool.remove("ab", drop_id).await);
        assert_eq!(pool.parked_for("ab").await, 1);
        let remaining = pool.pop("ab").await.unwrap();
        assert_eq!(remaining.id, keep);
    }

    #[tokio::test]
    async fn pool_accounting_matches_pushes_minus_pops_and_removals() {
        let pool: SparePool<u32> = SparePool::new();
        for i in 0..5u32 {
            pool.push("k", Spare { id: ConnectionId::next(), value: i }).await;
        }
        assert_eq!(pool.total_parked().await, 5);
        pool.pop("k").await;
        assert_eq!(pool.total_parked().await, 4);
        let id = ConnectionId::next();
        pool.push("k", Spare { id, value: 9 }).await;
        pool.remove("k", id).await;
        assert_eq!(pool.total_parked().await, 4);
    }
}
