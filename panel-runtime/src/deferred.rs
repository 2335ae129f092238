// panel-runtime/src/deferred.rs
use tokio::sync::watch;

/// A resettable, observable future: "has this async milestone happened yet".
///
/// Unlike a oneshot, a `Deferred` can be observed by any number of waiters,
/// inspected synchronously, and reset back to pending when the milestone is
/// invalidated (a frame going unready, a panel reset).
pub struct Deferred<T: Clone> {
    tx: watch::Sender<Option<T>>,
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone> Deferred<T> {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self { tx, rx }
    }

    /// Resolve the milestone. Returns false if it was already resolved,
    /// in which case the value is dropped.
    pub fn resolve(&self, value: T) -> bool {
        let mut slot = Some(value);
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = slot.take();
                true
            } else {
                false
            }
        })
    }

    /// Reset back to pending. Returns true if a resolved value was cleared.
    pub fn reset(&self) -> bool {
        self.tx.send_if_modified(|current| current.take().is_some())
    }

    pub fn is_resolved(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The resolved value, if any, without waiting
    pub fn peek(&self) -> Option<T> {
        self.rx.borrow().clone()
    }

    /// Wait until the milestone resolves. Returns immediately if it already
    /// has. A reset while waiting keeps the waiter pending.
    pub async fn wait(&self) -> T {
        let mut rx = self.rx.clone();
        loop {
            let current = rx.borrow().clone();
            if let Some(value) = current {
                return value;
            }
            // The sender lives in self, so changed() cannot fail while the
            // Deferred is alive.
            if rx.changed().await.is_err() {
                unreachable!("deferred sender dropped while waiting");
            }
        }
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn resolves_once() {
        let deferred = Deferred::new();
        assert!(deferred.resolve(1));
        assert!(!deferred.resolve(2));
        assert_eq!(deferred.wait().await, 1);
    }

    #[tokio::test]
    async fn wakes_pending_waiters() {
        let deferred = Arc::new(Deferred::new());
        let waiter = {
            let deferred = deferred.clone();
            tokio::spawn(async move { deferred.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        deferred.resolve("ready");
        assert_eq!(waiter.await.unwrap(), "ready");
    }

    #[tokio::test]
    async fn reset_returns_to_pending() {
        let deferred = Deferred::new();
        deferred.resolve(5);
        assert!(deferred.reset());
        assert!(!deferred.is_resolved());
        assert_eq!(deferred.peek(), None);
        // resolvable again after reset
        assert!(deferred.resolve(6));
        assert_eq!(deferred.wait().await, 6);
    }
}
