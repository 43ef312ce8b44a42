use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;

use crate::cache::repository::{SessionRepository, is_safe_id};
use crate::cache::{DownloadSession, LocalFileStorage};

const SESSION_DIR: &str = "sessions";

/// Session rows as `sessions/<token>.json`; the token is the primary key.
#[derive(Clone, Debug)]
pub struct FileSessionStore {
    storage: Arc<LocalFileStorage>,
}

impl FileSessionStore {
    pub fn new(storage: Arc<LocalFileStorage>) -> Self {
        Self { storage }
    }

    fn key(token: &str) -> String {
        format!("{SESSION_DIR}/{token}.json")
    }
}

#[async_trait]
impl SessionRepository for FileSessionStore {
    async fn insert(&self, session: &DownloadSession) -> Result<()> {
        if !is_safe_id(&session.session_token) {
            return Err(anyhow!("invalid session token"));
        }
        let payload = serde_json::to_vec_pretty(session)?;
        self.storage
            .put_new(&Self::key(&session.session_token), &payload)
            .await
    }

    async fn find(&self, token: &str) -> Result<Option<DownloadSession>> {
        if !is_safe_id(token) {
            return Ok(None);
        }
        match self.storage.get(&Self::key(token)).await? {
            Some(bytes) => {
                let session = serde_json::from_slice(&bytes).context("decode session row")?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }
}
