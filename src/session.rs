//! Short-lived download sessions for assembled content bundles.
//!
//! A session row is the source of truth. [`FingerprintLookup`] only remembers
//! which token was last minted for a bundle fingerprint, and every hit is
//! re-read from the session store before it is returned.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, instrument};

use crate::cache::{ContentBundle, DownloadSession, SessionRepository};
use crate::clock::Clock;
use crate::config::MAX_SESSION_TTL_SECS;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;

const TOKEN_PART_LEN: usize = 13;
const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Clone)]
struct LookupEntry {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Process-local fingerprint → token accelerator. Safe to share; never authoritative.
///
/// Entries whose session has expired are pruned on every insert, so the map
/// holds at most the sessions minted within one TTL.
#[derive(Debug, Default)]
pub struct FingerprintLookup {
    entries: Mutex<HashMap<Fingerprint, LookupEntry>>,
}

impl FingerprintLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<String> {
        self.lock().get(fingerprint).map(|entry| entry.token.clone())
    }

    pub fn insert(
        &self,
        fingerprint: Fingerprint,
        token: String,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        let mut entries = self.lock();
        entries.retain(|_, entry| entry.expires_at > now);
        entries.insert(fingerprint, LookupEntry { token, expires_at });
    }

    /// Drops the entry only if it still points at `stale_token`.
    pub fn evict(&self, fingerprint: &Fingerprint, stale_token: &str) {
        let mut entries = self.lock();
        if entries.get(fingerprint).is_some_and(|entry| entry.token == stale_token) {
            entries.remove(fingerprint);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Fingerprint, LookupEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Two independent 13-character base-36 strings.
pub fn generate_token() -> String {
    let mut token = String::with_capacity(TOKEN_PART_LEN * 2);
    for _ in 0..2 {
        token.extend((0..TOKEN_PART_LEN).map(|_| char::from(BASE36[fastrand::usize(..BASE36.len())])));
    }
    token
}

pub struct SessionBroker {
    sessions: Arc<dyn SessionRepository>,
    lookup: Arc<FingerprintLookup>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl SessionBroker {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        lookup: Arc<FingerprintLookup>,
        clock: Arc<dyn Clock>,
        ttl: std::time::Duration,
    ) -> Self {
        let ttl = Duration::from_std(ttl).unwrap_or_else(|_| Duration::hours(1));
        let ttl = if ttl > Duration::zero() { ttl } else { Duration::hours(1) };
        let ttl = ttl.min(Duration::seconds(MAX_SESSION_TTL_SECS as i64));
        Self {
            sessions,
            lookup,
            clock,
            ttl,
        }
    }

    /// Returns a live token for `bundle`, minting and persisting one if needed.
    #[instrument(skip_all)]
    pub async fn create_or_get(&self, bundle: &ContentBundle) -> Result<String> {
        if bundle.is_empty() {
            return Err(Error::invalid_input("campaign data is empty"));
        }
        let fingerprint = Fingerprint::of(bundle);

        if let Some(token) = self.lookup.get(&fingerprint) {
            let now = self.clock.now();
            match self.sessions.find(&token).await? {
                Some(session) if session.is_live(now) => {
                    debug!(%fingerprint, "download session cache hit");
                    return Ok(token);
                }
                _ => {
                    debug!(%fingerprint, "cached download session is gone or expired");
                    self.lookup.evict(&fingerprint, &token);
                }
            }
        }

        let created_at = self.clock.now();
        let session = DownloadSession {
            session_token: generate_token(),
            campaign_data: bundle.clone(),
            created_at,
            expires_at: created_at
                .checked_add_signed(self.ttl)
                .ok_or_else(|| Error::invalid_input("session lifetime is out of range"))?,
        };
        self.sessions.insert(&session).await?;
        self.lookup.insert(
            fingerprint,
            session.session_token.clone(),
            session.expires_at,
            created_at,
        );

        info!(expires_at = %session.expires_at, "created download session");
        Ok(session.session_token)
    }

    /// The bundle behind a live session. Missing and expired look the same.
    pub async fn get(&self, token: &str) -> Result<ContentBundle> {
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::invalid_input("session token is required"));
        }
        match self.sessions.find(token).await? {
            Some(session) if session.is_live(self.clock.now()) => Ok(session.campaign_data),
            _ => Err(Error::not_found("session", token)),
        }
    }
}
