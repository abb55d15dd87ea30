//! Time-boxed cache of the server-reported session state

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{PlatformError, Result};

/// How long a fetched [`SessionConfig`] stays valid
pub const CONFIG_TTL: Duration = Duration::from_secs(5 * 60);

/// Session state as reported by the destination's config endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(alias = "login", default)]
    pub is_login: bool,
    /// Per-session token required on state-changing requests (`st`)
    #[serde(alias = "st", default, deserialize_with = "string_or_number")]
    pub auth_token: String,
    #[serde(alias = "uid", default, deserialize_with = "string_or_number")]
    pub account_id: String,
}

impl SessionConfig {
    pub fn from_payload(payload: Value, url: &str) -> Result<Self> {
        serde_json::from_value(payload.clone()).map_err(|_| {
            PlatformError::UnexpectedResponse(crate::error::RawResponse {
                url: url.to_string(),
                status: 200,
                body: payload.to_string(),
            })
            .into()
        })
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

/// A snapshot together with the instant it was fetched
#[derive(Debug, Clone)]
pub struct CachedConfig {
    pub value: Arc<SessionConfig>,
    pub fetched_at: Instant,
}

impl CachedConfig {
    pub fn is_stale(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.fetched_at) >= ttl
    }
}

/// Holds at most one [`SessionConfig`] snapshot
///
/// The lock is held across a refresh, so concurrent callers wait for the
/// one in-flight fetch instead of issuing their own. A failed refresh
/// clears the slot; the old snapshot is never served as a fallback.
pub struct ConfigCache {
    ttl: Duration,
    slot: Mutex<Option<CachedConfig>>,
}

impl Default for ConfigCache {
    fn default() -> Self {
        Self::new(CONFIG_TTL)
    }
}

impl ConfigCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached snapshot if still fresh, otherwise exactly one `fetch`
    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> Result<Arc<SessionConfig>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SessionConfig>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(cached) = slot.as_ref() {
            if !cached.is_stale(Instant::now(), self.ttl) {
                return Ok(cached.value.clone());
            }
        }
        Self::store(&mut slot, fetch().await)
    }

    /// Fetch unconditionally and replace the snapshot
    pub async fn refresh<F, Fut>(&self, fetch: F) -> Result<Arc<SessionConfig>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SessionConfig>>,
    {
        let mut slot = self.slot.lock().await;
        Self::store(&mut slot, fetch().await)
    }

    fn store(
        slot: &mut Option<CachedConfig>,
        fetched: Result<SessionConfig>,
    ) -> Result<Arc<SessionConfig>> {
        match fetched {
            Ok(config) => {
                let value = Arc::new(config);
                *slot = Some(CachedConfig {
                    value: value.clone(),
                    fetched_at: Instant::now(),
                });
                Ok(value)
            }
            Err(e) => {
                *slot = None;
                Err(e)
            }
        }
    }

    /// Current snapshot without fetching, stale or not
    pub async fn peek(&self) -> Option<CachedConfig> {
        self.slot.lock().await.clone()
    }

    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }
}
