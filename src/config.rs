//! Process configuration read from the environment.
//!
//! `main` calls `dotenvy::dotenv()` first, so any of these may also live in a
//! `.env` file. Blank or unparsable values fall back to the defaults.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 60 * 60;
/// Longest accepted session lifetime: one week.
pub const MAX_SESSION_TTL_SECS: u64 = 7 * 24 * 60 * 60;
pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.7;
pub const DEFAULT_STORAGE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_IMAGE_COST_USD: f64 = 0.04;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Optional path prefix guarding every route.
    pub secret_key: Option<String>,
    pub cache_dir: PathBuf,
    /// Public base URL of the managed storage namespace, ending in `/cache`.
    pub cache_base_url: String,
    pub session_ttl: Duration,
    pub retention_days: u32,
    pub similarity_threshold: f64,
    pub storage_timeout: Duration,
    pub image_cost_usd: f64,
}

impl Default for Config {
    fn default() -> Self {
        let bind_address = format!("0.0.0.0:{DEFAULT_PORT}");
        Self {
            port: DEFAULT_PORT,
            secret_key: None,
            cache_dir: default_cache_dir(),
            cache_base_url: normalize_base_url(&bind_address),
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            retention_days: DEFAULT_RETENTION_DAYS,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            storage_timeout: Duration::from_millis(DEFAULT_STORAGE_TIMEOUT_MS),
            image_cost_usd: DEFAULT_IMAGE_COST_USD,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = parse_var::<u16>("PORT") {
            config.port = port;
        }
        config.secret_key = non_empty_var("SECRET_KEY");
        if let Some(dir) = non_empty_var("CACHE_DIR") {
            config.cache_dir = PathBuf::from(dir);
        }
        config.cache_base_url = resolve_cache_base_url(&config.bind_address());

        if let Some(ttl) = parse_var::<u64>("SESSION_TTL_SECS").and_then(session_ttl_from_secs) {
            config.session_ttl = ttl;
        }
        if let Some(days) = parse_var::<u32>("ASSET_RETENTION_DAYS") {
            config.retention_days = days;
        }
        if let Some(threshold) = parse_var::<f64>("SIMILARITY_THRESHOLD").filter(|t| t.is_finite()) {
            config.similarity_threshold = threshold.clamp(0.0, 1.0);
        }
        if let Some(millis) = parse_var::<u64>("STORAGE_TIMEOUT_MS").filter(|ms| *ms > 0) {
            config.storage_timeout = Duration::from_millis(millis);
        }
        if let Some(cost) = parse_var::<f64>("IMAGE_COST_USD").filter(|c| c.is_finite() && *c >= 0.0) {
            config.image_cost_usd = cost;
        }

        config
    }

    /// Managed object storage, served publicly under `/cache`.
    pub fn assets_dir(&self) -> PathBuf {
        self.cache_dir.join("assets")
    }

    /// Campaign and session rows. Never served.
    pub fn data_dir(&self) -> PathBuf {
        self.cache_dir.join("data")
    }

    pub fn bind_address(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    /// Prefix a route with the secret key, when one is configured.
    pub fn route(&self, path: &str) -> String {
        match self.secret_key.as_deref() {
            Some(secret) => format!("/{secret}{path}"),
            None => path.to_string(),
        }
    }
}

/// Session lifetimes must be positive and at most [`MAX_SESSION_TTL_SECS`].
fn session_ttl_from_secs(secs: u64) -> Option<Duration> {
    (1..=MAX_SESSION_TTL_SECS)
        .contains(&secs)
        .then(|| Duration::from_secs(secs))
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    non_empty_var(name).and_then(|value| value.parse::<T>().ok())
}

fn default_cache_dir() -> PathBuf {
    let mut base = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push("creative-cache");
    base
}

fn resolve_cache_base_url(bind_address: &str) -> String {
    if let Some(cache_url) = non_empty_var("CACHE_URL") {
        return format!("{}/cache", cache_url.trim_end_matches('/'));
    }
    let domain = non_empty_var("DOMAIN").unwrap_or_else(|| bind_address.to_string());
    normalize_base_url(&domain)
}

fn normalize_base_url(raw_domain: &str) -> String {
    let trimmed = raw_domain.trim().trim_end_matches('/');
    let base = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    format!("{}/cache", collapse_scheme(&base))
}

/// Collapses doubled schemes such as `http://https://host`, keeping the innermost.
pub(crate) fn collapse_scheme(raw: &str) -> String {
    let mut value = raw.to_string();
    loop {
        let Some((_, rest)) = value.split_once("://") else {
            return value;
        };
        if rest.starts_with("http://") || rest.starts_with("https://") {
            value = rest.to_string();
        } else {
            return value;
        }
    }
}
