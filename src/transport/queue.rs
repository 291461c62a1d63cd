//! Blocking queue and multi-waiter one-shot primitives underlying the
//! Framed Duplex Channel.
//!
//! [`BoundedQueue`] is the bounded FIFO behind `FramedDuplexChannel::recv*`:
//! a producer (the socket read loop) pushes frames without blocking; a
//! single consumer suspends in `recv` until an item arrives, a timeout
//! fires, or the queue is closed. Pushing past capacity does not block the
//! producer and does not silently evict — it marks the queue overflowed so
//! the next (or currently suspended) `recv` resolves with
//! [`QueueError::QueueOverflow`], matching the "suspend until item,
//! timeout, or cancellation" contract with no unbounded buffering.
//!
//! [`MultiPromise`] is the multi-waiter one-shot: many tasks can await the
//! same event (e.g. "this channel has reached a terminal state") and all of
//! them resolve together the instant it fires, including any task that
//! starts waiting after the event already happened.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};

/// Failure modes for [`BoundedQueue::recv`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Another `recv` call is already pending.
    ReaderBusy,
    /// The queue was full with no consumer; the oldest pending wait (or the
    /// next `recv`) observes this instead of the dropped frame.
    QueueOverflow,
    /// The queue was closed; carries the accumulated close reason.
    Closed(String),
    /// The caller-supplied timeout elapsed first.
    Timeout,
    /// The wait was cancelled externally (not a failure from the caller's view).
    Cancelled,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReaderBusy => write!(f, "a recv is already pending"),
            Self::QueueOverflow => write!(f, "queue overflow"),
            Self::Closed(reason) => write!(f, "closed: {reason}"),
            Self::Timeout => write!(f, "timed out"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for QueueError {}

struct Waiter<T> {
    tx: oneshot::Sender<Result<T, QueueError>>,
}

struct State<T> {
    items: VecDeque<T>,
    capacity: usize,
    waiter: Option<Waiter<T>>,
    overflowed: bool,
    closed: Option<String>,
}

/// Bounded single-consumer FIFO with timeout/cancellation-aware `recv`.
pub struct BoundedQueue<T> {
    state: Mutex<State<T>>,
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> BoundedQueue<T> {
    /// Create a queue with the given bounded `capacity` (config's
    /// `max_frame_queue`).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                capacity: capacity.max(1),
                waiter: None,
                overflowed: false,
                closed: None,
            }),
        }
    }

    /// Push an item. If a `recv` is pending it is woken immediately;
    /// otherwise the item is buffered up to `capacity`. Pushing past
    /// capacity marks the queue overflowed and drops the item — the
    /// producer never blocks. No-op once closed.
    pub async fn push(&self, item: T) {
        let mut state = self.state.lock().await;
        if state.closed.is_some() {
            return;
        }
        if let Some(waiter) = state.waiter.take() {
            // A send error here just means the waiting recv() already timed
            // out/cancelled and dropped its receiver; nothing to clean up.
            let _ = waiter.tx.send(Ok(item));
            return;
        }
        if state.items.len() >= state.capacity {
            state.overflowed = true;
            return;
        }
        state.items.push_back(item);
    }

    /// Suspend until an item is available, `timeout` elapses, or the queue
    /// closes. Fails immediately with [`QueueError::ReaderBusy`] if another
    /// `recv` is already pending — invariant (i) of the Framed Duplex
    /// Channel contract.
    pub async fn recv(&self, timeout: Option<Duration>) -> Result<T, QueueError> {
        let rx = {
            let mut state = self.state.lock().await;
            if state.waiter.is_some() {
                return Err(QueueError::ReaderBusy);
            }
            if let Some(item) = state.items.pop_front() {
                return Ok(item);
            }
            if state.overflowed {
                state.overflowed = false;
                return Err(QueueError::QueueOverflow);
            }
            if let Some(reason) = &state.closed {
                return Err(QueueError::Closed(reason.clone()));
            }
            let (tx, rx) = oneshot::channel();
            state.waiter = Some(Waiter { tx });
            rx
        };

        match timeout {
            Some(duration) => match tokio::time::timeout(duration, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_canceled)) => Err(QueueError::Cancelled),
                Err(_elapsed) => {
                    self.state.lock().await.waiter = None;
                    Err(QueueError::Timeout)
                }
            },
            None => match rx.await {
                Ok(result) => result,
                Err(_canceled) => Err(QueueError::Cancelled),
            },
        }
    }

    /// Drain all currently buffered items, in order. Used when switching
    /// into push mode (`subscribe`) — the queue must hand off whatever it
    /// already holds before a handler takes over.
    pub async fn drain(&self) -> Vec<T> {
        let mut state = self.state.lock().await;
        state.items.drain(..).collect()
    }

    /// Wake a pending `recv` with `Cancelled`, without closing the queue.
    /// Used when switching into push mode: a `recv` already suspended must
    /// fail fast instead of waiting on a queue that will never receive
    /// another item again.
    pub async fn reject_pending_reader(&self) {
        let mut state = self.state.lock().await;
        if let Some(waiter) = state.waiter.take() {
            let _ = waiter.tx.send(Err(QueueError::Cancelled));
        }
    }

    /// Close the queue with a reason. Any pending `recv` is woken with
    /// `Closed(reason)`; subsequent `push`/`recv` calls observe the same.
    pub async fn close(&self, reason: String) {
        let mut state = self.state.lock().await;
        if state.closed.is_some() {
            return;
        }
        if let Some(waiter) = state.waiter.take() {
            let _ = waiter.tx.send(Err(QueueError::Closed(reason.clone())));
        }
        state.closed = Some(reason);
    }

    /// Whether a `recv` is currently pending (for diagnostics/tests).
    pub async fn has_pending_reader(&self) -> bool {
        self.state.lock().await.waiter.is_some()
    }
}

/// A value that many independent waiters can await together; once resolved,
/// every existing and future waiter observes the same value.
pub struct MultiPromise<T: Clone + Send + 'static> {
    state: Mutex<MultiState<T>>,
}

struct MultiState<T> {
    value: Option<T>,
    waiters: Vec<oneshot::Sender<T>>,
}

impl<T: Clone + Send + 'static> fmt::Debug for MultiPromise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiPromise").finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> Default for MultiPromise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> MultiPromise<T> {
    /// Create an unresolved promise.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MultiState {
                value: None,
                waiters: Vec::new(),
            }),
        }
    }

    /// Resolve the promise for every current and future waiter. Only the
    /// first call has an effect; later calls are no-ops, matching "closing
    /// an already-closed channel is a no-op".
    pub async fn resolve(&self, value: T) {
        let mut state = self.state.lock().await;
        if state.value.is_some() {
            return;
        }
        state.value = Some(value.clone());
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(value.clone());
        }
    }

    /// Await resolution, optionally bounded by `timeout`.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<T, QueueError> {
        let rx = {
            let mut state = self.state.lock().await;
            if let Some(value) = &state.value {
                return Ok(value.clone());
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            rx
        };

        match timeout {
            Some(duration) => match tokio::time::timeout(duration, rx).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(_canceled)) => Err(QueueError::Cancelled),
                Err(_elapsed) => Err(QueueError::Timeout),
            },
            None => rx.await.map_err(|_canceled| QueueError::Cancelled),
        }
    }

    /// Whether the promise has already resolved.
    pub async fn is_resolved(&self) -> bool {
        self.state.lock().await.value.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn push_then_recv_returns_item_in_order() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(4);
        queue.push(1).await;
        queue.push(2).await;
        assert_eq!(queue.recv(None).await.unwrap(), 1);
        assert_eq!(queue.recv(None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn recv_wakes_on_push_when_waiting() {
        let queue = Arc::new(BoundedQueue::<u32>::new(4));
        let reader = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.recv(Some(Duration::from_secs(1))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(42).await;
        assert_eq!(reader.await.unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn second_concurrent_recv_is_reader_busy() {
        let queue = Arc::new(BoundedQueue::<u32>::new(4));
        let queue2 = Arc::clone(&queue);
        let first = tokio::spawn(async move { queue2.recv(Some(Duration::from_millis(200))).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = queue.recv(Some(Duration::from_millis(10))).await;
        assert_eq!(second, Err(QueueError::ReaderBusy));
        queue.push(7).await;
        assert_eq!(first.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn overflow_without_consumer_surfaces_on_next_recv() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(2);
        queue.push(1).await;
        queue.push(2).await;
        queue.push(3).await; // dropped, marks overflowed
        assert_eq!(queue.recv(None).await, Err(QueueError::QueueOverflow));
        // queue state cleared after reporting overflow once
        assert_eq!(queue.recv(None).await.unwrap(), 1);
        assert_eq!(queue.recv(None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn recv_times_out_when_empty() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(2);
        let result = queue.recv(Some(Duration::from_millis(20))).await;
        assert_eq!(result, Err(QueueError::Timeout));
        assert!(!queue.has_pending_reader().await);
    }

    #[tokio::test]
    async fn close_wakes_pending_recv_with_reason() {
        let queue = Arc::new(BoundedQueue::<u32>::new(2));
        let queue2 = Arc::clone(&queue);
        let reader = tokio::spawn(async move { queue2.recv(Some(Duration::from_secs(1))).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close("local close: bye".to_string()).await;
        assert_eq!(
            reader.await.unwrap(),
            Err(QueueError::Closed("local close: bye".to_string()))
        );
    }

    #[tokio::test]
    async fn multi_promise_resolves_existing_and_future_waiters() {
        let promise: Arc<MultiPromise<&'static str>> = Arc::new(MultiPromise::new());
        let p2 = Arc::clone(&promise);
        let early = tokio::spawn(async move { p2.wait(Some(Duration::from_secs(1))).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        promise.resolve("done").await;
        assert_eq!(early.await.unwrap().unwrap(), "done");
        // future waiter sees the already-resolved value instantly
        assert_eq!(
            promise.wait(Some(Duration::from_millis(10))).await.unwrap(),
            "done"
        );
    }

    #[tokio::test]
    async fn multi_promise_second_resolve_is_noop() {
        let promise = MultiPromise::new();
        promise.resolve(1).await;
        promise.resolve(2).await;
        assert_eq!(promise.wait(None).await.unwrap(), 1);
    }
}
