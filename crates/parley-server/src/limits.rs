//! Cap on concurrently accepted sockets (`ws.conn`).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts live sockets and refuses new ones past `max_connections`.
#[derive(Debug)]
pub struct ConnectionLimiter {
    max_connections: usize,
    active: Arc<AtomicUsize>,
}

impl ConnectionLimiter {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reserve a slot. Returns `None` when the cap is reached.
    ///
    /// The returned guard is `Send` so it can be moved into the connection's
    /// task; the slot stays taken until that task drops it.
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_connections).then_some(current + 1)
            })
            .ok()?;
        Some(ConnectionGuard {
            counter: self.active.clone(),
        })
    }

    /// Number of slots currently held.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// RAII guard that releases its slot on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_reached() {
        let limiter = ConnectionLimiter::new(2);
        let _g1 = limiter.try_acquire().unwrap();
        let _g2 = limiter.try_acquire().unwrap();
        assert!(limiter.try_acquire().is_none());
        assert_eq!(limiter.active(), 2);
    }

    #[test]
    fn test_guard_releases() {
        let limiter = ConnectionLimiter::new(1);
        {
            let _guard = limiter.try_acquire().unwrap();
            assert_eq!(limiter.active(), 1);
            assert!(limiter.try_acquire().is_none());
        }
        assert_eq!(limiter.active(), 0);
        assert!(limiter.try_acquire().is_some());
    }
}
