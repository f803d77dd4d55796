//! A single-assignment result cell.
//!
//! Used by the listener to signal "the subscription is live" to other tasks.
//! Only the first `set_result` takes effect.

use std::time::Duration;
use tokio::sync::watch;

/// A single-assignment cell that can be awaited from any number of tasks.
pub struct Future<T: Clone> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> Future<T> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Whether the result has been set.
    pub fn done(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Set the result. The first write wins; later writes are ignored.
    pub fn set_result(&self, value: T) {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(value);
                true
            } else {
                false
            }
        });
    }

    /// Wait for the result.
    pub async fn result(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            // The sender lives as long as self, so changed() cannot fail
            // while we hold a borrow of self.
            if rx.changed().await.is_err() {
                unreachable!("watch sender dropped while borrowed");
            }
        }
    }

    /// Wait for the result, giving up after `timeout`.
    pub async fn result_timeout(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.result()).await.ok()
    }
}

impl<T: Clone> Default for Future<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_then_result() {
        let future: Future<u32> = Future::new();
        assert!(!future.done());
        future.set_result(7);
        assert!(future.done());
        assert_eq!(future.result().await, 7);
    }

    #[tokio::test]
    async fn test_first_write_wins() {
        let future: Future<u32> = Future::new();
        future.set_result(1);
        future.set_result(2);
        assert_eq!(future.result().await, 1);
    }

    #[test]
    fn test_result_is_pending_until_set() {
        let future: Future<u32> = Future::new();
        let mut waiter = tokio_test::task::spawn(future.result());
        tokio_test::assert_pending!(waiter.poll());
        future.set_result(9);
        assert!(waiter.is_woken());
        tokio_test::assert_ready_eq!(waiter.poll(), 9);
    }

    #[tokio::test]
    async fn test_result_blocks_until_set() {
        let future = std::sync::Arc::new(Future::<bool>::new());
        let waiter = future.clone();
        let handle = tokio::spawn(async move { waiter.result().await });
        tokio::task::yield_now().await;
        future.set_result(true);
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_result_timeout_elapses() {
        let future: Future<bool> = Future::new();
        let got = future.result_timeout(Duration::from_millis(10)).await;
        assert_eq!(got, None);
    }
}
