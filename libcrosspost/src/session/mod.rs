//! Credential-bearing HTTP session for the destination platform
//!
//! [`SessionClient`] owns one `reqwest::Client`, the live [`Credential`] and
//! a set of session-wide headers. Each request goes through a
//! [`MiddlewareChain`] (cookies, anti-forgery token, tracing), has its
//! envelope validated, and optionally passes a login gate first.
//!
//! # Example
//!
//! ```no_run
//! use libcrosspost::config::{DestinationConfig, SessionSettings};
//! use libcrosspost::credentials::{Credential, DomainRule};
//! use libcrosspost::session::{Call, SessionClient};
//!
//! # async fn example(credential: Credential) -> libcrosspost::Result<()> {
//! let endpoints = DestinationConfig::default();
//! let session = SessionClient::authenticate(
//!     &SessionSettings::default(),
//!     &endpoints,
//!     DomainRule::default(),
//!     credential,
//! )
//! .await?;
//!
//! let config = session.config().await?;
//! println!("logged in as {}", config.account_id);
//!
//! // Gated call with a referer that is restored afterwards
//! let _payload = session
//!     .execute(Call::get(&endpoints.compose_referer).referer(&endpoints.base_url))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config_cache;
pub mod envelope;
pub mod middleware;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, REFERER, USER_AGENT};
use reqwest::{multipart, Method, Url};
use serde_json::Value;
use std::sync::{Arc, Mutex, RwLock};

use crate::config::{DestinationConfig, SessionSettings};
use crate::credentials::{Credential, DomainRule};
use crate::error::{PlatformError, RawResponse, Result};

pub use config_cache::{CachedConfig, ConfigCache, SessionConfig, CONFIG_TTL};
pub use envelope::unwrap_envelope;
pub use middleware::{
    Completion, CookieLayer, Exchange, HookGuard, Middleware, MiddlewareChain, TokenLayer,
    TraceLayer,
};

/// Header that carries the anti-forgery token
pub const TOKEN_HEADER: &str = "x-xsrf-token";

const JSON_ACCEPT: &str = "application/json, text/plain, */*";
const MOBILE_USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 10; Pixel 4) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/110.0.0.0 Mobile Safari/537.36";

/// Whether a referer override replaces an existing value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefererMode {
    Replace,
    /// Leave a referer set by an outer scope alone
    KeepExisting,
}

#[derive(Debug, Clone)]
struct RefererOverride {
    url: String,
    mode: RefererMode,
}

/// Request body
pub enum Payload {
    Empty,
    Form(Vec<(String, String)>),
    Multipart(multipart::Form),
}

/// One logical call through the session
pub struct Call {
    method: Method,
    url: String,
    query: Vec<(String, String)>,
    payload: Payload,
    referer: Option<RefererOverride>,
    auth_required: bool,
}

impl Call {
    pub fn new(method: Method, url: &str) -> Self {
        Self {
            method,
            url: url.to_string(),
            query: Vec::new(),
            payload: Payload::Empty,
            referer: None,
            auth_required: true,
        }
    }

    pub fn get(url: &str) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: &str) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn form<I, K, V>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.payload = Payload::Form(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn multipart(mut self, form: multipart::Form) -> Self {
        self.payload = Payload::Multipart(form);
        self
    }

    /// Use `url` as referer for this call only
    pub fn referer(mut self, url: &str) -> Self {
        self.referer = Some(RefererOverride {
            url: url.to_string(),
            mode: RefererMode::Replace,
        });
        self
    }

    /// Use `url` as referer unless an outer scope already set one
    pub fn referer_if_unset(mut self, url: &str) -> Self {
        self.referer = Some(RefererOverride {
            url: url.to_string(),
            mode: RefererMode::KeepExisting,
        });
        self
    }

    /// Skip the login gate
    pub fn public(mut self) -> Self {
        self.auth_required = false;
        self
    }
}

/// Restores the session referer when dropped
#[must_use = "the referer is restored as soon as the guard is dropped"]
pub struct RefererGuard {
    headers: Arc<Mutex<HeaderMap>>,
    previous: Option<Option<HeaderValue>>,
}

impl Drop for RefererGuard {
    fn drop(&mut self) {
        let Some(previous) = self.previous.take() else {
            return;
        };
        let mut headers = self.headers.lock().unwrap_or_else(|e| e.into_inner());
        match previous {
            Some(value) => {
                headers.insert(REFERER, value);
            }
            None => {
                headers.remove(REFERER);
            }
        }
    }
}

pub struct SessionClient {
    http: reqwest::Client,
    headers: Arc<Mutex<HeaderMap>>,
    credential: Arc<RwLock<Credential>>,
    chain: MiddlewareChain,
    cache: ConfigCache,
    config_url: String,
    base_url: String,
}

impl SessionClient {
    /// Build a session around `credential` without contacting the server
    pub fn new(
        settings: &SessionSettings,
        endpoints: &DestinationConfig,
        rule: DomainRule,
        credential: Credential,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(settings.timeout())
            .connect_timeout(settings.timeout());
        if let Some(proxy) = &settings.proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| PlatformError::Validation(format!("invalid proxy '{}': {}", proxy, e)))?;
            builder = builder.proxy(proxy);
        }
        let http = builder.build().map_err(PlatformError::from_reqwest)?;

        let credential = Arc::new(RwLock::new(credential));
        let token_header = HeaderName::from_static(TOKEN_HEADER);
        let chain = MiddlewareChain::new()
            .with(TraceLayer)
            .with(CookieLayer::new(credential.clone(), rule.clone()))
            .with(TokenLayer::new(credential.clone(), &rule.token_cookie, token_header));

        Ok(Self {
            http,
            headers: Arc::new(Mutex::new(default_headers())),
            credential,
            chain,
            cache: ConfigCache::default(),
            config_url: endpoints.config_url.clone(),
            base_url: endpoints.base_url.clone(),
        })
    }

    /// Build a session and confirm the credential is logged in
    pub async fn authenticate(
        settings: &SessionSettings,
        endpoints: &DestinationConfig,
        rule: DomainRule,
        credential: Credential,
    ) -> Result<Self> {
        let session = Self::new(settings, endpoints, rule, credential)?;
        let config = session.require_login().await?;
        tracing::info!(account_id = %config.account_id, "Destination session authenticated");
        Ok(session)
    }

    /// Snapshot of the live credential, including cookies the server rotated
    pub fn credential(&self) -> Credential {
        self.credential.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn middleware(&self) -> &MiddlewareChain {
        &self.chain
    }

    /// Current value of a session-wide header
    pub fn header(&self, name: &HeaderName) -> Option<HeaderValue> {
        self.headers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn referer(&self) -> Option<String> {
        self.header(&REFERER)
            .and_then(|v| v.to_str().ok().map(str::to_string))
    }

    /// Set the referer for the rest of the enclosing scope
    ///
    /// Unscoped on its own; pair it with [`SessionClient::scope_referer`] so
    /// the value is restored.
    pub fn set_referer(&self, url: &str) -> Result<()> {
        let value = header_value(url)?;
        self.headers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(REFERER, value);
        Ok(())
    }

    /// Override the referer until the returned guard is dropped
    pub fn scope_referer(&self, url: &str, mode: RefererMode) -> Result<RefererGuard> {
        let value = header_value(url)?;
        let mut headers = self.headers.lock().unwrap_or_else(|e| e.into_inner());
        let current = headers.get(REFERER).cloned();

        if mode == RefererMode::KeepExisting && current.is_some() {
            return Ok(RefererGuard {
                headers: self.headers.clone(),
                previous: None,
            });
        }

        headers.insert(REFERER, value);
        Ok(RefererGuard {
            headers: self.headers.clone(),
            previous: Some(current),
        })
    }

    /// Cached session config, refetched when older than [`CONFIG_TTL`]
    pub async fn config(&self) -> Result<Arc<SessionConfig>> {
        self.cache.get_or_refresh(|| self.fetch_config()).await
    }

    /// Refetch the session config regardless of age
    pub async fn refresh_config(&self) -> Result<Arc<SessionConfig>> {
        self.cache.refresh(|| self.fetch_config()).await
    }

    pub fn config_cache(&self) -> &ConfigCache {
        &self.cache
    }

    async fn fetch_config(&self) -> Result<SessionConfig> {
        let call = Call::get(&self.config_url).referer(&self.base_url).public();
        let payload = self.dispatch(call).await?;
        SessionConfig::from_payload(payload, &self.config_url)
    }

    /// Login gate: force a config refresh and insist on a logged-in session
    ///
    /// An envelope violation on the config endpoint means the credential is
    /// stale, so it is reported as an authentication failure.
    pub async fn require_login(&self) -> Result<Arc<SessionConfig>> {
        match self.refresh_config().await {
            Ok(config) if config.is_login => Ok(config),
            Ok(_) => Err(PlatformError::Authentication(
                "destination reports the session as logged out".to_string(),
            )
            .into()),
            Err(e) if e.is_unexpected_response() => {
                Err(PlatformError::Authentication(format!("session check failed: {}", e)).into())
            }
            Err(e) => Err(e),
        }
    }

    /// Run one call and return its unwrapped envelope payload
    pub async fn execute(&self, call: Call) -> Result<Value> {
        if call.auth_required {
            self.require_login().await?;
        }
        self.dispatch(call).await
    }

    async fn dispatch(&self, call: Call) -> Result<Value> {
        let _referer = match &call.referer {
            Some(r) => Some(self.scope_referer(&r.url, r.mode)?),
            None => None,
        };

        let mut url = Url::parse(&call.url)
            .map_err(|e| PlatformError::Validation(format!("invalid url '{}': {}", call.url, e)))?;
        if !call.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&call.query);
        }

        let mut headers = self.headers.lock().unwrap_or_else(|e| e.into_inner()).clone();
        headers.insert(ACCEPT, HeaderValue::from_static(JSON_ACCEPT));

        let mut hooks = self.chain.begin(Exchange::new(call.method, url, headers))?;
        let exchange = hooks.exchange();
        let mut request = self
            .http
            .request(exchange.method.clone(), exchange.url.clone())
            .headers(exchange.headers.clone());
        request = match call.payload {
            Payload::Empty => request,
            Payload::Form(fields) => request.form(&fields),
            Payload::Multipart(form) => request.multipart(form),
        };
        let url = exchange.url.to_string();

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let error = PlatformError::from_reqwest(e);
                hooks.complete(Completion::Failed(error.to_string()));
                return Err(error.into());
            }
        };

        let status = response.status();
        hooks.complete(Completion::Responded {
            status,
            headers: response.headers().clone(),
        });
        drop(hooks);

        let body = response.text().await.map_err(PlatformError::from_reqwest)?;
        unwrap_envelope(RawResponse {
            url,
            status: status.as_u16(),
            body,
        })
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| PlatformError::Validation(format!("invalid header value '{}': {}", value, e)).into())
}

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("mweibo-pwa", HeaderValue::from_static("1"));
    headers.insert("x-requested-with", HeaderValue::from_static("XMLHttpRequest"));
    headers.insert(USER_AGENT, HeaderValue::from_static(MOBILE_USER_AGENT));
    headers
}
