//! Bounded connection pool for the durable tier
//!
//! Explicit pool sizing with backpressure: a caller that cannot get a
//! connection within the acquire timeout fails with `ResourceExhausted`
//! instead of queueing forever.

use std::ops::Deref;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Semaphore, SemaphorePermit};

use crate::error::{Result, StrataError};

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Configured pool size
    pub size: usize,
    /// Connections currently checked out
    pub in_use: usize,
    /// Total successful acquisitions
    pub total_acquired: u64,
    /// Acquisitions that gave up after the timeout
    pub acquire_timeouts: u64,
}

/// A fixed-size pool of connection handles.
///
/// New handles are cloned from a template on demand, so the pool never holds
/// more than `size` live handles and never opens one eagerly.
#[derive(Debug)]
pub struct ConnectionPool<T: Clone> {
    template: T,
    idle: Mutex<Vec<T>>,
    permits: Semaphore,
    size: usize,
    acquire_timeout: Duration,
    total_acquired: AtomicU64,
    acquire_timeouts: AtomicU64,
}

impl<T: Clone> ConnectionPool<T> {
    /// Create a pool of `size` connections cloned from `template`
    pub fn new(template: T, size: usize, acquire_timeout: Duration) -> Self {
        let size = size.max(1);
        Self {
            template,
            idle: Mutex::new(Vec::with_capacity(size)),
            permits: Semaphore::new(size),
            size,
            acquire_timeout,
            total_acquired: AtomicU64::new(0),
            acquire_timeouts: AtomicU64::new(0),
        }
    }

    /// Check out a connection, waiting at most the acquire timeout
    pub async fn acquire(&self) -> Result<PooledConnection<'_, T>> {
        let permit = match tokio::time::timeout(self.acquire_timeout, self.permits.acquire()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(StrataError::Storage("connection pool closed".to_string()));
            }
            Err(_) => {
                self.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(StrataError::ResourceExhausted(format!(
                    "no durable connection available within {}ms (pool size {})",
                    self.acquire_timeout.as_millis(),
                    self.size
                )));
            }
        };

        let conn = self
            .idle
            .lock()
            .ok()
            .and_then(|mut idle| idle.pop())
            .unwrap_or_else(|| self.template.clone());

        self.total_acquired.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection {
            pool: self,
            conn: Some(conn),
            _permit: permit,
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.size,
            in_use: self.size - self.permits.available_permits(),
            total_acquired: self.total_acquired.load(Ordering::Relaxed),
            acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn release(&self, conn: T) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(conn);
        }
    }
}

/// A checked-out connection; returned to the pool on drop
pub struct PooledConnection<'a, T: Clone> {
    pool: &'a ConnectionPool<T>,
    conn: Option<T>,
    _permit: SemaphorePermit<'a>,
}

impl<T: Clone> Deref for PooledConnection<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.conn {
            Some(conn) => conn,
            None => &self.pool.template,
        }
    }
}

impl<T: Clone> Drop for PooledConnection<'_, T> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let pool = ConnectionPool::new(7_u32, 2, Duration::from_millis(50));

        {
            let a = pool.acquire().await.unwrap();
            let b = pool.acquire().await.unwrap();
            assert_eq!(*a, 7);
            assert_eq!(*b, 7);
            assert_eq!(pool.stats().in_use, 2);
        }

        assert_eq!(pool.stats().in_use, 0);
        assert_eq!(pool.stats().total_acquired, 2);
    }

    #[tokio::test]
    async fn test_saturated_pool_reports_resource_exhausted() {
        let pool = ConnectionPool::new((), 1, Duration::from_millis(20));
        let _held = pool.acquire().await.unwrap();

        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, StrataError::ResourceExhausted(_)));
        assert_eq!(pool.stats().acquire_timeouts, 1);
    }

    #[tokio::test]
    async fn test_waiter_gets_released_connection() {
        let pool = std::sync::Arc::new(ConnectionPool::new((), 1, Duration::from_secs(2)));
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        assert!(waiter.await.unwrap().is_ok());
    }

    #[test]
    fn test_zero_size_is_clamped() {
        let pool = ConnectionPool::new((), 0, Duration::from_millis(10));
        assert_eq!(pool.size(), 1);
    }
}
