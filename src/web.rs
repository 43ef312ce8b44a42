use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::assets::{AssetCacheManager, ReuseMapping, ReuseMode};
use crate::bundle;
use crate::cache::{
    ContentBundle, FileCampaignStore, FileSessionStore, LocalFileStorage, content_digest,
    extension_for_mime,
};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::Error;
use crate::session::{FingerprintLookup, SessionBroker};

const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

/// Everything a request handler needs, built once per process.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub assets: Arc<AssetCacheManager>,
    pub sessions: Arc<SessionBroker>,
    pub storage: Arc<LocalFileStorage>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Self {
        let storage = Arc::new(LocalFileStorage::new(
            config.assets_dir(),
            config.cache_base_url.clone(),
        ));
        let rows = Arc::new(LocalFileStorage::new(
            config.data_dir(),
            config.cache_base_url.clone(),
        ));
        let assets = AssetCacheManager::new(
            Arc::new(FileCampaignStore::new(rows.clone())),
            storage.clone(),
            clock.clone(),
            &config,
        );
        let sessions = SessionBroker::new(
            Arc::new(FileSessionStore::new(rows)),
            Arc::new(FingerprintLookup::new()),
            clock,
            config.session_ttl,
        );
        Self {
            config: Arc::new(config),
            assets: Arc::new(assets),
            sessions: Arc::new(sessions),
            storage,
            http: reqwest::Client::new(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let config = state.config.clone();
    Router::new()
        .route(&config.route("/asset-manager"), post(asset_manager))
        .route(
            &config.route("/download-sessions"),
            post(create_session).get(get_session),
        )
        .route(&config.route("/download"), get(download))
        .route(
            &config.route("/upload"),
            post(handle_image_upload).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .nest_service("/cache", ServeDir::new(config.assets_dir()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::InvalidInput(message) => json_error(StatusCode::BAD_REQUEST, message),
            // Expired and unknown sessions share one body.
            Error::NotFound { resource, .. } => {
                json_error(StatusCode::NOT_FOUND, &format!("{resource} not found"))
            }
            Error::Upstream(_) | Error::Timeout { .. } => {
                error!(error = %self, "upstream failure");
                json_error(StatusCode::BAD_GATEWAY, &self.to_string())
            }
        }
    }
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &Bytes) -> Result<T, Error> {
    serde_json::from_slice(body).map_err(|err| Error::invalid_input(format!("malformed request: {err}")))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum AssetManagerRequest {
    FindSimilar {
        prompts: Option<Vec<String>>,
        similarity_threshold: Option<f64>,
    },
    ReuseAssets {
        #[serde(rename = "campaignId", alias = "campaign_id")]
        campaign_id: Option<String>,
        mappings: Option<Vec<ReuseMapping>>,
        #[serde(default)]
        mode: ReuseMode,
    },
    CleanupUnused {
        retention_days: Option<u32>,
    },
    GetStats {},
}

pub async fn asset_manager(State(state): State<AppState>, body: Bytes) -> Result<Response, Error> {
    let request: AssetManagerRequest = parse_body(&body)?;
    let response = match request {
        AssetManagerRequest::FindSimilar {
            prompts,
            similarity_threshold,
        } => {
            let prompts = prompts.ok_or_else(|| Error::invalid_input("prompts array is required"))?;
            let threshold = similarity_threshold.unwrap_or(state.config.similarity_threshold);
            let matches = state.assets.find_similar(&prompts, threshold).await?;
            let potential_savings = state.assets.potential_savings(&matches);
            let total_found = matches.len();
            json!({
                "similar_assets": matches,
                "total_found": total_found,
                "potential_savings": potential_savings,
            })
        }
        AssetManagerRequest::ReuseAssets {
            campaign_id,
            mappings,
            mode,
        } => {
            let campaign_id = campaign_id.ok_or_else(|| Error::invalid_input("campaignId is required"))?;
            let mappings = mappings.ok_or_else(|| Error::invalid_input("mappings array is required"))?;
            let assets = state.assets.reuse_assets(&campaign_id, &mappings, mode).await?;
            json!({
                "reused_count": mappings.len(),
                "message": format!("Reused {} existing assets", mappings.len()),
                "assets": assets,
            })
        }
        AssetManagerRequest::CleanupUnused { retention_days } => {
            let days = retention_days.unwrap_or(state.config.retention_days);
            let report = state.assets.cleanup_unused(days).await?;
            json!({
                "message": format!("Cleaned up {} unused assets", report.deleted_count),
                "deleted_count": report.deleted_count,
                "deleted_assets": report.deleted_assets,
            })
        }
        AssetManagerRequest::GetStats {} => {
            let stats = state.assets.get_stats().await?;
            json!({ "stats": stats })
        }
    };
    Ok(Json(response).into_response())
}

#[derive(Serialize)]
struct SessionCreated {
    session_token: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    session: Option<String>,
}

impl SessionQuery {
    fn token(&self) -> Result<&str, Error> {
        self.session
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| Error::invalid_input("session query parameter is required"))
    }
}

pub async fn create_session(State(state): State<AppState>, body: Bytes) -> Result<Response, Error> {
    let bundle: ContentBundle = parse_body(&body)?;
    let session_token = state.sessions.create_or_get(&bundle).await?;
    Ok((StatusCode::OK, Json(SessionCreated { session_token })).into_response())
}

pub async fn get_session(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<ContentBundle>, Error> {
    let bundle = state.sessions.get(query.token()?).await?;
    Ok(Json(bundle))
}

pub async fn download(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<bundle::PackagedBundle>, Error> {
    let bundle = state.sessions.get(query.token()?).await?;
    let packaged = bundle::package(&state.http, &bundle, state.config.storage_timeout).await;
    if !packaged.skipped.is_empty() {
        warn!(skipped = packaged.skipped.len(), "download packaged with missing images");
    }
    Ok(Json(packaged))
}

#[derive(Serialize)]
struct UploadResponse {
    url: String,
    key: String,
}

fn extension_from_filename(file_name: &str) -> Option<String> {
    let (_, ext) = file_name.rsplit_once('.')?;
    let trimmed = ext.trim();
    (!trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_alphanumeric()))
        .then(|| trimmed.to_lowercase())
}

fn resolve_extension(file_name: &str, content_type: Option<&str>) -> String {
    if let Some(ext) = extension_from_filename(file_name) {
        return ext;
    }
    content_type
        .and_then(extension_for_mime)
        .unwrap_or("bin")
        .to_string()
}

/// Stores an uploaded product photo in managed storage.
pub async fn handle_image_upload(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let mut upload = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("file") => {
                let content_type = field.content_type().map(str::to_string);
                let file_name = field.file_name().unwrap_or("").to_string();
                match field.bytes().await {
                    Ok(data) => upload = Some((file_name, content_type, data)),
                    Err(err) => {
                        return json_error(StatusCode::BAD_REQUEST, &format!("failed to read file: {err}"));
                    }
                }
                break;
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(err) => {
                return json_error(StatusCode::BAD_REQUEST, &format!("failed to read form: {err}"));
            }
        }
    }

    let Some((file_name, content_type, bytes)) = upload else {
        return json_error(StatusCode::BAD_REQUEST, "no file field in upload");
    };
    if let Some(content_type) = content_type.as_deref() {
        if !content_type.starts_with("image/") {
            return json_error(StatusCode::BAD_REQUEST, "only image uploads are accepted");
        }
    }
    if bytes.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "uploaded file is empty");
    }

    let ext = resolve_extension(&file_name, content_type.as_deref());
    let key = format!("uploads/{}.{ext}", content_digest(&bytes));
    if let Err(err) = state.storage.put(&key, bytes.as_ref()).await {
        error!(%key, error = %err, "failed to store upload");
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, &format!("failed to store file: {err}"));
    }

    let url = state.storage.get_public_url(&key);
    (StatusCode::OK, Json(UploadResponse { url, key })).into_response()
}
