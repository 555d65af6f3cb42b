//! In-memory caches that are carried across a deploy.
//!
//! The outgoing instance writes a [`CachesSnapshot`] to the blob store right
//! before it retires; the incoming instance reads it back before it starts
//! responding. The snapshot is best-effort: a missing blob or key restores
//! nothing.

pub mod notified;

use crate::blob::BlobStore;
use crate::coordinator::CacheHandoff;
use async_trait::async_trait;
use color_eyre::eyre::{Result, WrapErr};
use notified::{NotifiedCache, NotifiedSnapshot};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

/// Blob key of the caches snapshot.
pub const CACHES_KEY: &str = "caches.json";

/// On-disk snapshot. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachesSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notified_pings: Option<NotifiedSnapshot>,
}

/// Shared handle to the notified-pings cache.
pub type SharedNotifiedCache = Arc<Mutex<NotifiedCache>>;

/// Lock a shared cache, recovering from a poisoned lock.
pub fn lock(cache: &SharedNotifiedCache) -> MutexGuard<'_, NotifiedCache> {
    cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Gathers and repopulates the process caches through the blob store.
pub struct CachesService {
    blobs: Arc<dyn BlobStore>,
    notified: SharedNotifiedCache,
}

impl CachesService {
    pub fn new(blobs: Arc<dyn BlobStore>, notified: SharedNotifiedCache) -> Self {
        Self { blobs, notified }
    }

    pub fn gather(&self) -> CachesSnapshot {
        CachesSnapshot {
            notified_pings: Some(lock(&self.notified).snapshot()),
        }
    }

    pub fn populate(&self, snapshot: CachesSnapshot) {
        let notified_count = snapshot.notified_pings.as_ref().map(|s| s.entries.len());
        if let Some(notified) = snapshot.notified_pings {
            lock(&self.notified).restore(notified);
        }
        tracing::info!(
            notified_pings = ?notified_count,
            "recovered cached state from previous instance"
        );
    }
}

#[async_trait]
impl CacheHandoff for CachesService {
    async fn persist(&self) -> Result<()> {
        let snapshot = self.gather();
        let bytes = serde_json::to_vec(&snapshot).wrap_err("failed to encode caches")?;
        self.blobs
            .put(CACHES_KEY, bytes)
            .await
            .wrap_err("failed to store caches")
    }

    async fn restore(&self) -> Result<()> {
        let Some(bytes) = self
            .blobs
            .get(CACHES_KEY)
            .await
            .wrap_err("failed to fetch caches")?
        else {
            tracing::info!("no cached state to restore");
            return Ok(());
        };
        if bytes.is_empty() {
            tracing::info!("no cached state to restore");
            return Ok(());
        }
        let snapshot: CachesSnapshot =
            serde_json::from_slice(&bytes).wrap_err("failed to decode caches")?;
        self.populate(snapshot);
        Ok(())
    }
}
