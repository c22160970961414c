// Concurrent connection cap shared by the accept loops of one tunnel

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Caps the number of relays a tunnel runs at once. A limit of 0 means
/// unbounded. When capped, the accept loop waits for a permit before
/// taking the next connection, so excess peers queue in the listen backlog.
#[derive(Debug, Clone)]
pub struct ConnectionLimit {
    semaphore: Option<Arc<Semaphore>>,
    active: Arc<AtomicUsize>,
}

impl ConnectionLimit {
    pub fn new(max_connections: usize) -> Self {
        let semaphore = if max_connections == 0 {
            None
        } else {
            Some(Arc::new(Semaphore::new(max_connections)))
        };
        Self {
            semaphore,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0)
    }

    pub fn is_bounded(&self) -> bool {
        self.semaphore.is_some()
    }

    /// Relays currently holding a permit
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait until a relay slot is free
    pub async fn acquire(&self) -> ConnectionPermit {
        let permit = match &self.semaphore {
            // The semaphore is never closed, so acquisition only fails if that changes
            Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
            None => None,
        };
        self.active.fetch_add(1, Ordering::SeqCst);
        ConnectionPermit {
            _permit: permit,
            active: self.active.clone(),
        }
    }
}

impl Default for ConnectionLimit {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Held by a relay task for its lifetime
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: Option<OwnedSemaphorePermit>,
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_unbounded_never_waits() {
        let limit = ConnectionLimit::unbounded();
        assert!(!limit.is_bounded());
        let permits: Vec<_> = acquire_many(&limit, 50).await;
        assert_eq!(limit.active(), 50);
        drop(permits);
        assert_eq!(limit.active(), 0);
    }

    async fn acquire_many(limit: &ConnectionLimit, n: usize) -> Vec<ConnectionPermit> {
        let mut permits = Vec::with_capacity(n);
        for _ in 0..n {
            permits.push(limit.acquire().await);
        }
        permits
    }

    #[tokio::test]
    async fn test_bounded_waits_for_release() {
        let limit = ConnectionLimit::new(2);
        let first = limit.acquire().await;
        let _second = limit.acquire().await;

        let waiter = limit.clone();
        let third = tokio::spawn(async move { waiter.acquire().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!third.is_finished());
        assert_eq!(limit.active(), 2);

        drop(first);
        let _third = tokio::time::timeout(Duration::from_secs(1), third)
            .await
            .expect("permit should be granted after release")
            .unwrap();
        assert_eq!(limit.active(), 2);
    }
}
