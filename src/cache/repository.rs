//! Seams to the durable datastore and object storage.

use anyhow::Result;
use async_trait::async_trait;

use crate::cache::{CampaignRecord, DownloadSession, LocalFileStorage};

#[async_trait]
pub trait CampaignRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<CampaignRecord>>;
    async fn get(&self, id: &str) -> Result<Option<CampaignRecord>>;
    /// Inserts or fully replaces the row with `record.id`.
    async fn put(&self, record: &CampaignRecord) -> Result<()>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Persists a new row. Fails if `session_token` is already taken.
    async fn insert(&self, session: &DownloadSession) -> Result<()>;
    async fn find(&self, token: &str) -> Result<Option<DownloadSession>>;
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// `Ok(false)` when the object was already gone.
    async fn delete(&self, key: &str) -> Result<bool>;
    /// The object key for a URL inside the managed namespace.
    fn key_for_url(&self, url: &str) -> Option<String>;
}

#[async_trait]
impl ObjectStore for LocalFileStorage {
    async fn delete(&self, key: &str) -> Result<bool> {
        LocalFileStorage::delete(self, key).await
    }

    fn key_for_url(&self, url: &str) -> Option<String> {
        LocalFileStorage::key_for_url(self, url)
    }
}

/// Record ids become file names; anything that could escape the directory is refused.
pub(crate) fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\'])
        && !id.chars().any(char::is_control)
}
