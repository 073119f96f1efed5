//! Named async locks.
//!
//! One mutex per key, created on first use and dropped again when the last
//! guard for it goes away, so the map only holds keys that are in use.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;

type LockTable = DashMap<String, Arc<Mutex<()>>>;

#[derive(Default)]
pub struct LockMap {
    locks: Arc<LockTable>,
}

impl LockMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> NamedLockGuard {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        NamedLockGuard {
            key: key.to_string(),
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    /// Like [`Self::acquire`], giving up with [`SyncError::Cancelled`] when
    /// the token fires first.
    pub async fn acquire_cancellable(&self, key: &str, token: &CancellationToken) -> Result<NamedLockGuard, SyncError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(SyncError::Cancelled),
            guard = self.acquire(key) => Ok(guard),
        }
    }

    /// Acquire several keys in sorted order, so two callers asking for
    /// overlapping sets cannot deadlock.
    pub async fn acquire_many(&self, keys: &[String], token: &CancellationToken) -> Result<Vec<NamedLockGuard>, SyncError> {
        let mut sorted: Vec<&String> = keys.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for key in sorted {
            guards.push(self.acquire_cancellable(key, token).await?);
        }
        Ok(guards)
    }

    /// Keys currently held or waited on.
    #[must_use]
    pub fn active(&self) -> usize {
        self.locks.len()
    }
}

pub struct NamedLockGuard {
    key: String,
    locks: Arc<LockTable>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl NamedLockGuard {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for NamedLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map itself still references the mutex: nobody holds or awaits it.
        self.locks.remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
