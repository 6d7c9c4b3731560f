use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per `local_order_no`, so dispatch, callbacks and remote
/// queries for the same order apply their read-check-write one at a time.
/// Different orders never contend. Entries are dropped once nobody holds or
/// waits on them.
#[derive(Clone, Default)]
pub struct OrderLocks {
    inner: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

pub struct OrderGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl OrderLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, local_order_no: &str) -> OrderGuard {
        let mutex = self
            .inner
            .entry(local_order_no.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        OrderGuard {
            key: local_order_no.to_string(),
            guard: Some(guard),
            locks: self.inner.clone(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.len()
    }
}

impl Drop for OrderGuard {
    fn drop(&mut self) {
        // Release first; the owned guard holds a strong reference of its own.
        drop(self.guard.take());
        self.locks.remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_order_is_serialized() {
        let locks = OrderLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _g = locks.acquire("TEST123").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn different_orders_do_not_block() {
        let locks = OrderLocks::new();
        let _a = locks.acquire("A").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("B")).await;
        assert!(b.is_ok());
    }
}
