//! Deduplication of image generation work against previously generated assets.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::batch::{self, BatchReport};
use crate::cache::{AssetRecord, CampaignRecord, CampaignRepository, ObjectStore, ReuseSource};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::similarity;

const APPROX_IMAGE_MB: f64 = 0.5;
const APPROX_VIDEO_MB: f64 = 5.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityMatch {
    pub original_prompt: String,
    pub similar_prompt: String,
    pub similarity_score: f64,
    pub existing_url: String,
    pub source_campaign: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReuseMapping {
    pub new_prompt: String,
    pub existing_url: String,
    pub source_campaign: String,
    pub similarity_score: f64,
}

/// How `reuse_assets` treats the campaign's current asset list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReuseMode {
    /// The mappings become the whole asset list.
    #[default]
    Replace,
    /// Assets with a mapped prompt are replaced, everything else is kept.
    Merge,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupReport {
    pub deleted_count: usize,
    pub deleted_assets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_campaigns: usize,
    pub total_images: usize,
    pub total_videos: usize,
    pub avg_images_per_campaign: f64,
    pub storage_usage_mb: f64,
}

pub struct AssetCacheManager {
    campaigns: Arc<dyn CampaignRepository>,
    objects: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    delete_timeout: Duration,
    image_cost_usd: f64,
}

impl AssetCacheManager {
    pub fn new(
        campaigns: Arc<dyn CampaignRepository>,
        objects: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        Self {
            campaigns,
            objects,
            clock,
            delete_timeout: config.storage_timeout,
            image_cost_usd: config.image_cost_usd,
        }
    }

    /// Every (candidate, stored asset) pair scoring at least `threshold`.
    ///
    /// Pairs come back in store order; nothing is deduplicated.
    #[instrument(skip(self, candidates), fields(candidates = candidates.len()))]
    pub async fn find_similar(
        &self,
        candidates: &[String],
        threshold: f64,
    ) -> Result<Vec<SimilarityMatch>> {
        if !threshold.is_finite() {
            return Err(Error::invalid_input("similarity_threshold must be a number"));
        }
        let campaigns = self.campaigns.list().await?;

        let mut matches = Vec::new();
        for campaign in &campaigns {
            for asset in campaign.generated_images.iter().filter(|a| a.is_reusable()) {
                for candidate in candidates {
                    let similarity_score = similarity::score(candidate, &asset.prompt);
                    if similarity_score >= threshold {
                        matches.push(SimilarityMatch {
                            original_prompt: candidate.clone(),
                            similar_prompt: asset.prompt.clone(),
                            similarity_score,
                            existing_url: asset.url.clone(),
                            source_campaign: campaign.id.clone(),
                            created_at: campaign.created_at,
                        });
                    }
                }
            }
        }
        debug!(found = matches.len(), "similarity search finished");
        Ok(matches)
    }

    /// Estimated spend avoided if every matched candidate reuses an asset.
    pub fn potential_savings(&self, matches: &[SimilarityMatch]) -> f64 {
        let distinct: HashSet<&str> = matches.iter().map(|m| m.original_prompt.as_str()).collect();
        distinct.len() as f64 * self.image_cost_usd
    }

    /// Records reused assets on `campaign_id` and returns its new asset list.
    #[instrument(skip(self, mappings), fields(mappings = mappings.len()))]
    pub async fn reuse_assets(
        &self,
        campaign_id: &str,
        mappings: &[ReuseMapping],
        mode: ReuseMode,
    ) -> Result<Vec<AssetRecord>> {
        if campaign_id.trim().is_empty() {
            return Err(Error::invalid_input("campaignId is required"));
        }
        if let Some(bad) = mappings
            .iter()
            .find(|m| m.new_prompt.trim().is_empty() || m.existing_url.trim().is_empty())
        {
            return Err(Error::invalid_input(format!(
                "mapping for {:?} needs both new_prompt and existing_url",
                bad.new_prompt
            )));
        }

        let mut campaign = self
            .campaigns
            .get(campaign_id)
            .await?
            .ok_or_else(|| Error::not_found("campaign", campaign_id))?;

        let reused: Vec<AssetRecord> = mappings
            .iter()
            .map(|m| AssetRecord {
                prompt: m.new_prompt.clone(),
                url: m.existing_url.clone(),
                reused_from: Some(ReuseSource {
                    source_campaign: m.source_campaign.clone(),
                    similarity_score: m.similarity_score,
                }),
            })
            .collect();

        campaign.generated_images = match mode {
            ReuseMode::Replace => reused,
            ReuseMode::Merge => merge_assets(std::mem::take(&mut campaign.generated_images), reused),
        };
        self.campaigns.put(&campaign).await?;

        info!(campaign = campaign_id, ?mode, count = mappings.len(), "recorded reused assets");
        Ok(campaign.generated_images)
    }

    /// Deletes managed objects of campaigns older than `retention_days`.
    ///
    /// Per-object failures and timeouts are logged and skipped. Swept records
    /// are dropped from their campaign row so a repeat run finds nothing.
    #[instrument(skip(self))]
    pub async fn cleanup_unused(&self, retention_days: u32) -> Result<CleanupReport> {
        // A window reaching past the earliest representable instant sweeps nothing.
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(chrono::Duration::days(i64::from(retention_days)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let campaigns = self.campaigns.list().await?;

        let mut targets = Vec::new();
        for campaign in campaigns.iter().filter(|c| c.created_at < cutoff) {
            for asset in &campaign.generated_images {
                if let Some(key) = self.objects.key_for_url(&asset.url) {
                    targets.push((asset.url.clone(), (campaign.id.clone(), key)));
                }
            }
        }
        if targets.is_empty() {
            info!("cleanup found nothing to delete");
            return Ok(CleanupReport {
                deleted_count: 0,
                deleted_assets: Vec::new(),
            });
        }

        let objects = self.objects.clone();
        let timeout = self.delete_timeout;
        let outcomes = batch::run_isolated(targets, batch::DEFAULT_CONCURRENCY, move |(campaign_id, key): (String, String)| {
            let objects = objects.clone();
            async move {
                let removed = delete_with_timeout(objects.as_ref(), &key, timeout).await?;
                Ok::<_, anyhow::Error>((campaign_id, removed))
            }
        })
        .await;
        let report = BatchReport::from_outcomes(outcomes);

        let deleted_assets: Vec<String> = report
            .succeeded
            .iter()
            .filter(|(_, (_, removed))| *removed)
            .map(|(url, _)| url.clone())
            .collect();
        let mut gone: HashMap<&str, HashSet<&str>> = HashMap::new();
        for (url, (campaign_id, _)) in &report.succeeded {
            gone.entry(campaign_id.as_str()).or_default().insert(url.as_str());
        }

        for (campaign_id, urls) in gone {
            if let Err(err) = self.drop_swept_assets(campaign_id, &urls).await {
                warn!(campaign = campaign_id, error = %err, "failed to drop swept assets from campaign");
            }
        }

        info!(
            deleted = deleted_assets.len(),
            skipped = report.failed.len(),
            retention_days,
            "cleanup sweep finished"
        );
        Ok(CleanupReport {
            deleted_count: deleted_assets.len(),
            deleted_assets,
        })
    }

    /// Removes `urls` from the current row, not the snapshot the sweep started from.
    async fn drop_swept_assets(&self, campaign_id: &str, urls: &HashSet<&str>) -> anyhow::Result<()> {
        let Some(mut campaign) = self.campaigns.get(campaign_id).await? else {
            return Ok(());
        };
        let before = campaign.generated_images.len();
        campaign.generated_images.retain(|a| !urls.contains(a.url.as_str()));
        if campaign.generated_images.len() != before {
            self.campaigns.put(&campaign).await?;
        }
        Ok(())
    }

    pub async fn get_stats(&self) -> Result<CacheStats> {
        let campaigns = self.campaigns.list().await?;
        Ok(aggregate_stats(&campaigns))
    }
}

/// Deletes one object, giving up after `timeout` with [`Error::Timeout`].
async fn delete_with_timeout(
    objects: &dyn ObjectStore,
    key: &str,
    timeout: Duration,
) -> anyhow::Result<bool> {
    match tokio::time::timeout(timeout, objects.delete(key)).await {
        Ok(removed) => removed,
        Err(_) => Err(Error::Timeout {
            operation: "delete object",
            millis: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
        .into()),
    }
}

fn merge_assets(existing: Vec<AssetRecord>, reused: Vec<AssetRecord>) -> Vec<AssetRecord> {
    let mapped: HashSet<&str> = reused.iter().map(|a| a.prompt.as_str()).collect();
    let mut merged: Vec<AssetRecord> = existing
        .into_iter()
        .filter(|a| !mapped.contains(a.prompt.as_str()))
        .collect();
    merged.extend(reused);
    merged
}

fn aggregate_stats(campaigns: &[CampaignRecord]) -> CacheStats {
    let total_campaigns = campaigns.len();
    let total_images: usize = campaigns.iter().map(|c| c.generated_images.len()).sum();
    let total_videos: usize = campaigns.iter().map(|c| c.generated_videos.len()).sum();
    let avg_images_per_campaign = if total_campaigns == 0 {
        0.0
    } else {
        total_images as f64 / total_campaigns as f64
    };
    CacheStats {
        total_campaigns,
        total_images,
        total_videos,
        avg_images_per_campaign,
        storage_usage_mb: total_images as f64 * APPROX_IMAGE_MB + total_videos as f64 * APPROX_VIDEO_MB,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{FileCampaignStore, LocalFileStorage};
    use crate::clock::ManualClock;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::path::Path;

    const BASE_URL: &str = "http://cdn.test/cache";

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn asset(prompt: &str, url: &str) -> AssetRecord {
        AssetRecord {
            prompt: prompt.to_string(),
            url: url.to_string(),
            reused_from: None,
        }
    }

    fn campaign(id: &str, created_at: DateTime<Utc>, images: Vec<AssetRecord>) -> CampaignRecord {
        CampaignRecord {
            id: id.to_string(),
            name: id.to_string(),
            created_at,
            generated_images: images,
            generated_videos: Vec::new(),
        }
    }

    struct Fixture {
        tmp: tempfile::TempDir,
        storage: Arc<LocalFileStorage>,
        store: Arc<FileCampaignStore>,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let storage = Arc::new(LocalFileStorage::new(dir.path().to_path_buf(), BASE_URL.to_string()));
            Self {
                store: Arc::new(FileCampaignStore::new(storage.clone())),
                storage,
                clock: Arc::new(ManualClock::new(start())),
                tmp: dir,
            }
        }

        fn manager(&self) -> AssetCacheManager {
            self.manager_with_objects(self.storage.clone())
        }

        fn manager_with_objects(&self, objects: Arc<dyn ObjectStore>) -> AssetCacheManager {
            AssetCacheManager::new(self.store.clone(), objects, self.clock.clone(), &Config::default())
        }

        fn dir(&self) -> &Path {
            self.tmp.path()
        }
    }

    #[tokio::test]
    async fn finds_products_that_share_words() {
        let fx = Fixture::new();
        fx.store
            .put(&campaign(
                "spring",
                start(),
                vec![
                    asset("blue running shoes on white background", "http://cdn.test/cache/a.png"),
                    asset("blue running shoes on white background", ""),
                ],
            ))
            .await
            .unwrap();
        let manager = fx.manager();

        let candidates = vec![
            "blue running shoes outdoor shot".to_string(),
            "red winter coat".to_string(),
        ];
        let matches = manager.find_similar(&candidates, 0.3).await.unwrap();

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].original_prompt, "blue running shoes outdoor shot");
        assert_eq!(matches[0].source_campaign, "spring");
        assert_eq!(matches[0].existing_url, "http://cdn.test/cache/a.png");
        assert!(matches[0].similarity_score > 0.3);
        assert!((manager.potential_savings(&matches) - 0.04).abs() < 1e-9);
    }

    #[tokio::test]
    async fn raising_threshold_never_adds_matches() {
        let fx = Fixture::new();
        fx.store
            .put(&campaign(
                "c1",
                start(),
                vec![
                    asset("leather boots autumn forest", "http://cdn.test/cache/1.png"),
                    asset("leather boots studio light", "http://cdn.test/cache/2.png"),
                    asset("canvas sneakers beach sunset", "http://cdn.test/cache/3.png"),
                ],
            ))
            .await
            .unwrap();
        let manager = fx.manager();
        let candidates = vec!["leather boots beach sunset".to_string()];

        let mut previous = usize::MAX;
        for threshold in [0.0, 0.2, 0.4, 0.5, 0.75, 1.0] {
            let count = manager.find_similar(&candidates, threshold).await.unwrap().len();
            assert!(count <= previous, "threshold {threshold} grew matches");
            previous = count;
        }
    }

    #[tokio::test]
    async fn reuse_replaces_by_default_and_merges_on_request() {
        let fx = Fixture::new();
        fx.store
            .put(&campaign(
                "target",
                start(),
                vec![
                    asset("hero shot", "http://cdn.test/cache/hero.png"),
                    asset("lifestyle shot", "http://cdn.test/cache/life.png"),
                ],
            ))
            .await
            .unwrap();
        let manager = fx.manager();
        let mappings = vec![ReuseMapping {
            new_prompt: "hero shot".to_string(),
            existing_url: "http://cdn.test/cache/old-hero.png".to_string(),
            source_campaign: "source".to_string(),
            similarity_score: 0.8,
        }];

        let merged = manager.reuse_assets("target", &mappings, ReuseMode::Merge).await.unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].prompt, "lifestyle shot");
        assert_eq!(merged[1].url, "http://cdn.test/cache/old-hero.png");

        let replaced = manager.reuse_assets("target", &mappings, ReuseMode::Replace).await.unwrap();
        assert_eq!(replaced.len(), 1);
        let again = manager.reuse_assets("target", &mappings, ReuseMode::Replace).await.unwrap();
        assert_eq!(replaced, again);

        let stored = fx.store.get("target").await.unwrap().unwrap();
        assert_eq!(stored.generated_images, again);
        assert_eq!(
            stored.generated_images[0].reused_from.as_ref().unwrap().source_campaign,
            "source"
        );
    }

    #[tokio::test]
    async fn reuse_rejects_unknown_campaign_and_bad_mappings() {
        let fx = Fixture::new();
        let manager = fx.manager();

        let err = manager.reuse_assets("ghost", &[], ReuseMode::Replace).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { resource: "campaign", .. }));

        let err = manager.reuse_assets(" ", &[], ReuseMode::Replace).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let bad = vec![ReuseMapping {
            new_prompt: "p".to_string(),
            existing_url: String::new(),
            source_campaign: "s".to_string(),
            similarity_score: 1.0,
        }];
        let err = manager.reuse_assets("ghost", &bad, ReuseMode::Replace).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn cleanup_deletes_old_managed_objects_once() {
        let fx = Fixture::new();
        fx.storage.put("images/old.png", b"old").await.unwrap();
        fx.storage.put("images/new.png", b"new").await.unwrap();
        let old_url = fx.storage.get_public_url("images/old.png");
        let new_url = fx.storage.get_public_url("images/new.png");

        fx.store
            .put(&campaign(
                "old",
                start() - chrono::Duration::days(45),
                vec![
                    asset("old shot", &old_url),
                    asset("external shot", "https://elsewhere.test/x.png"),
                ],
            ))
            .await
            .unwrap();
        fx.store
            .put(&campaign("fresh", start() - chrono::Duration::days(2), vec![asset("new shot", &new_url)]))
            .await
            .unwrap();
        let manager = fx.manager();

        let first = manager.cleanup_unused(30).await.unwrap();
        assert_eq!(first.deleted_count, 1);
        assert_eq!(first.deleted_assets, vec![old_url.clone()]);
        assert!(!fx.dir().join("images/old.png").exists());
        assert!(fx.dir().join("images/new.png").exists());

        let old = fx.store.get("old").await.unwrap().unwrap();
        assert_eq!(old.generated_images, vec![asset("external shot", "https://elsewhere.test/x.png")]);

        let second = manager.cleanup_unused(30).await.unwrap();
        assert_eq!(second.deleted_count, 0);
        assert!(second.deleted_assets.is_empty());
    }

    struct FlakyObjects {
        inner: Arc<LocalFileStorage>,
    }

    #[async_trait]
    impl ObjectStore for FlakyObjects {
        async fn delete(&self, key: &str) -> anyhow::Result<bool> {
            if key.contains("stuck") {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if key.contains("broken") {
                return Err(anyhow!("permission denied"));
            }
            self.inner.delete(key).await
        }

        fn key_for_url(&self, url: &str) -> Option<String> {
            self.inner.key_for_url(url)
        }
    }

    #[tokio::test]
    async fn cleanup_skips_failing_and_slow_objects() {
        let fx = Fixture::new();
        for key in ["images/ok.png", "images/broken.png", "images/stuck.png"] {
            fx.storage.put(key, b"x").await.unwrap();
        }
        let urls: Vec<String> = ["ok", "broken", "stuck"]
            .iter()
            .map(|name| fx.storage.get_public_url(&format!("images/{name}.png")))
            .collect();
        fx.store
            .put(&campaign(
                "old",
                start() - chrono::Duration::days(90),
                urls.iter().map(|u| asset("shot", u)).collect(),
            ))
            .await
            .unwrap();

        let mut config = Config::default();
        config.storage_timeout = Duration::from_millis(50);
        let manager = AssetCacheManager::new(
            fx.store.clone(),
            Arc::new(FlakyObjects { inner: fx.storage.clone() }),
            fx.clock.clone(),
            &config,
        );

        let report = manager.cleanup_unused(30).await.unwrap();
        assert_eq!(report.deleted_count, 1);
        assert_eq!(report.deleted_assets, vec![urls[0].clone()]);

        let remaining = fx.store.get("old").await.unwrap().unwrap().generated_images;
        assert_eq!(remaining.len(), 2);
    }

    #[tokio::test]
    async fn huge_retention_window_sweeps_nothing() {
        let fx = Fixture::new();
        fx.storage.put("images/ancient.png", b"x").await.unwrap();
        let url = fx.storage.get_public_url("images/ancient.png");
        fx.store
            .put(&campaign("ancient", start() - chrono::Duration::days(3650), vec![asset("shot", &url)]))
            .await
            .unwrap();

        let report = fx.manager().cleanup_unused(u32::MAX).await.unwrap();
        assert_eq!(report.deleted_count, 0);
        assert!(fx.dir().join("images/ancient.png").exists());
    }

    /// Writes to the campaign row while a deletion is in flight.
    struct RowWritingObjects {
        inner: Arc<LocalFileStorage>,
        store: Arc<FileCampaignStore>,
    }

    #[async_trait]
    impl ObjectStore for RowWritingObjects {
        async fn delete(&self, key: &str) -> anyhow::Result<bool> {
            let mut row = self.store.get("old").await?.expect("row exists");
            row.name = "Renamed mid-sweep".to_string();
            row.generated_images.push(asset("fresh shot", "http://cdn.test/cache/images/fresh.png"));
            self.store.put(&row).await?;
            self.inner.delete(key).await
        }

        fn key_for_url(&self, url: &str) -> Option<String> {
            self.inner.key_for_url(url)
        }
    }

    #[tokio::test]
    async fn cleanup_keeps_writes_made_during_the_sweep() {
        let fx = Fixture::new();
        fx.storage.put("images/stale.png", b"x").await.unwrap();
        let stale = fx.storage.get_public_url("images/stale.png");
        fx.store
            .put(&campaign("old", start() - chrono::Duration::days(60), vec![asset("stale shot", &stale)]))
            .await
            .unwrap();
        let manager = fx.manager_with_objects(Arc::new(RowWritingObjects {
            inner: fx.storage.clone(),
            store: fx.store.clone(),
        }));

        let report = manager.cleanup_unused(30).await.unwrap();
        assert_eq!(report.deleted_assets, vec![stale]);

        let row = fx.store.get("old").await.unwrap().unwrap();
        assert_eq!(row.name, "Renamed mid-sweep");
        assert_eq!(
            row.generated_images,
            vec![asset("fresh shot", "http://cdn.test/cache/images/fresh.png")]
        );
    }

    #[tokio::test]
    async fn slow_delete_fails_with_timeout_error() {
        let fx = Fixture::new();
        fx.storage.put("images/stuck.png", b"x").await.unwrap();
        let objects = FlakyObjects { inner: fx.storage.clone() };

        let err = delete_with_timeout(&objects, "images/stuck.png", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Timeout { operation: "delete object", millis: 20 })
        ));
        assert!(delete_with_timeout(fx.storage.as_ref(), "images/stuck.png", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn stats_on_empty_store_are_zero() {
        let fx = Fixture::new();
        let stats = fx.manager().get_stats().await.unwrap();
        assert_eq!(stats.total_campaigns, 0);
        assert_eq!(stats.avg_images_per_campaign, 0.0);
        assert_eq!(stats.storage_usage_mb, 0.0);
    }

    #[tokio::test]
    async fn stats_aggregate_over_campaigns() {
        let fx = Fixture::new();
        let mut with_video = campaign("a", start(), vec![asset("p1", "u1"), asset("p2", "u2"), asset("p3", "u3")]);
        with_video.generated_videos = vec!["http://cdn.test/cache/v.mp4".to_string()];
        fx.store.put(&with_video).await.unwrap();
        fx.store.put(&campaign("b", start(), vec![asset("p4", "u4")])).await.unwrap();

        let stats = fx.manager().get_stats().await.unwrap();
        assert_eq!(stats.total_campaigns, 2);
        assert_eq!(stats.total_images, 4);
        assert_eq!(stats.total_videos, 1);
        assert_eq!(stats.avg_images_per_campaign, 2.0);
        assert_eq!(stats.storage_usage_mb, 7.0);
    }
}
