use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tracing::warn;

use crate::cache::repository::{CampaignRepository, is_safe_id};
use crate::cache::{CampaignRecord, LocalFileStorage};

const CAMPAIGN_DIR: &str = "campaigns";

/// Campaign rows as `campaigns/<id>.json` documents.
#[derive(Clone, Debug)]
pub struct FileCampaignStore {
    storage: Arc<LocalFileStorage>,
}

impl FileCampaignStore {
    pub fn new(storage: Arc<LocalFileStorage>) -> Self {
        Self { storage }
    }

    fn key(id: &str) -> String {
        format!("{CAMPAIGN_DIR}/{id}.json")
    }
}

#[async_trait]
impl CampaignRepository for FileCampaignStore {
    async fn list(&self) -> Result<Vec<CampaignRecord>> {
        let mut records = Vec::new();
        for key in self.storage.list(CAMPAIGN_DIR).await? {
            if !key.ends_with(".json") {
                continue;
            }
            let Some(bytes) = self.storage.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<CampaignRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(err) => warn!(%key, error = %err, "skipping unreadable campaign row"),
            }
        }
        Ok(records)
    }

    async fn get(&self, id: &str) -> Result<Option<CampaignRecord>> {
        if !is_safe_id(id) {
            return Ok(None);
        }
        let key = Self::key(id);
        match self.storage.get(&key).await? {
            Some(bytes) => {
                let record = serde_json::from_slice(&bytes)
                    .with_context(|| format!("decode campaign row {key}"))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, record: &CampaignRecord) -> Result<()> {
        if !is_safe_id(&record.id) {
            return Err(anyhow!("invalid campaign id: {:?}", record.id));
        }
        let payload = serde_json::to_vec_pretty(record)?;
        self.storage.put(&Self::key(&record.id), &payload).await
    }
}
