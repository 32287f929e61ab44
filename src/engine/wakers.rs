//! Wake handles for local workers

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Notify, RwLock};

/// Per-identity wake signal shared by producers and workers
///
/// A wake sent while the worker is busy is kept and consumed by its next idle
/// wait, so an enqueue is never missed.
#[derive(Debug, Clone, Default)]
pub struct Wakers {
    inner: Arc<RwLock<HashMap<String, Arc<Notify>>>>,
}

impl Wakers {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_create(&self, identity_id: &str) -> Arc<Notify> {
        if let Some(notify) = self.inner.read().await.get(identity_id) {
            return notify.clone();
        }
        self.inner
            .write()
            .await
            .entry(identity_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Wake the identity's worker if one runs in this process
    pub async fn wake(&self, identity_id: &str) -> bool {
        match self.inner.read().await.get(identity_id) {
            Some(notify) => {
                notify.notify_one();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wake_before_wait_is_kept() {
        let wakers = Wakers::new();
        assert!(!wakers.wake("bot-a").await);

        let notify = wakers.get_or_create("bot-a").await;
        assert!(wakers.wake("bot-a").await);

        tokio::time::timeout(Duration::from_millis(100), notify.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_same_handle_per_identity() {
        let wakers = Wakers::new();
        let a = wakers.get_or_create("bot-a").await;
        let b = wakers.get_or_create("bot-a").await;
        assert!(Arc::ptr_eq(&a, &b));
    }
}
