//! Change detection on the configuration store.

use std::time::Duration;

use tracing::{info, warn};

use crate::store::ConfigStore;

/// Tracks the last change-sequence number the loop acted on.
#[derive(Debug)]
pub struct ConfigWatcher {
    seqno: u64,
    timeout: Duration,
}

impl ConfigWatcher {
    pub fn new(timeout: Duration) -> Self {
        Self { seqno: 0, timeout }
    }

    /// The sequence number recorded by the last [`ConfigWatcher::mark`].
    pub fn watermark(&self) -> u64 {
        self.seqno
    }

    pub fn mark(&mut self, seqno: u64) {
        if seqno != self.seqno {
            info!("seqno change from {} to {}", self.seqno, seqno);
        }
        self.seqno = seqno;
    }

    /// Returns true when the store's counter differs from the watermark,
    /// without waiting.
    pub fn is_stale<S: ConfigStore>(&self, store: &S) -> bool {
        store.change_seqno() != self.seqno
    }

    /// Waits until the store reports new data or the timeout elapses, then
    /// pulls updates and reports whether the counter moved past the
    /// watermark.
    ///
    /// Store errors are logged and reported as "unchanged"; the next poll
    /// retries.
    pub async fn poll<S: ConfigStore>(&self, store: &mut S) -> bool {
        if !self.is_stale(store) {
            let _ = tokio::time::timeout(self.timeout, store.changed()).await;
        }
        if let Err(error) = store.run().await {
            warn!("configuration store unavailable, retrying: {}", error);
            return false;
        }
        self.is_stale(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreDocument};

    #[tokio::test]
    async fn test_poll_times_out_without_change() {
        let (mut store, _handle) = MemoryStore::new(StoreDocument::default());
        store.run().await.unwrap();
        let watcher = ConfigWatcher::new(Duration::from_millis(20));

        assert!(!watcher.poll(&mut store).await);
    }

    #[tokio::test]
    async fn test_poll_reports_commit() {
        let (mut store, handle) = MemoryStore::new(StoreDocument::default());
        store.run().await.unwrap();
        let mut watcher = ConfigWatcher::new(Duration::from_secs(5));
        watcher.mark(store.change_seqno());

        handle.commit(|document| document.cur_cfg = 1).unwrap();
        assert!(watcher.poll(&mut store).await);

        watcher.mark(store.change_seqno());
        assert_eq!(watcher.watermark(), 1);
        assert!(!watcher.is_stale(&store));
    }
}
