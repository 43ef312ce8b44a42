use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One generated image attached to a campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub prompt: String,
    /// Empty for generations that never produced a file.
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reused_from: Option<ReuseSource>,
}

impl AssetRecord {
    /// Only assets with both a prompt and a file may be matched or reused.
    pub fn is_reusable(&self) -> bool {
        !self.prompt.trim().is_empty() && !self.url.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReuseSource {
    pub source_campaign: String,
    pub similarity_score: f64,
}

/// A campaign row as held by the durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub generated_images: Vec<AssetRecord>,
    #[serde(default)]
    pub generated_videos: Vec<String>,
}

/// The content a download session points at.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentBundle {
    #[serde(default)]
    pub generated_images: Vec<String>,
    #[serde(default)]
    pub uploaded_image: Option<String>,
    #[serde(default)]
    pub video_scripts: Vec<String>,
    #[serde(default)]
    pub email_copy: Option<String>,
    #[serde(default)]
    pub banner_copy: Option<String>,
    #[serde(default)]
    pub landing_page_concept: Option<String>,
}

impl ContentBundle {
    pub fn is_empty(&self) -> bool {
        fn blank(value: &Option<String>) -> bool {
            value.as_deref().is_none_or(|v| v.trim().is_empty())
        }
        self.generated_images.iter().all(|url| url.trim().is_empty())
            && blank(&self.uploaded_image)
            && self.video_scripts.iter().all(|script| script.trim().is_empty())
            && blank(&self.email_copy)
            && blank(&self.banner_copy)
            && blank(&self.landing_page_concept)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadSession {
    pub session_token: String,
    pub campaign_data: ContentBundle,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DownloadSession {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}
