//! Ordered request/response hooks for the destination session
//!
//! Every request runs the `before` hook of each layer in order and then the
//! `after` hook of every layer that was entered, in reverse order. The
//! `after` hooks run from a drop guard, so they fire on success, on error,
//! and when the request future is dropped mid-flight.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE, SET_COOKIE};
use reqwest::{Method, StatusCode, Url};
use std::sync::{Arc, RwLock};

use crate::credentials::{Credential, DomainRule};
use crate::error::{PlatformError, Result};

/// One outbound request as seen by the middleware layers
#[derive(Debug, Clone)]
pub struct Exchange {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
}

impl Exchange {
    pub fn new(method: Method, url: Url, headers: HeaderMap) -> Self {
        Self {
            method,
            url,
            headers,
        }
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }
}

/// How an exchange ended, handed to every `after` hook
#[derive(Debug, Clone)]
pub enum Completion {
    /// The server answered (any status)
    Responded { status: StatusCode, headers: HeaderMap },
    /// The request failed before a response arrived
    Failed(String),
    /// The request future was dropped before finishing
    Abandoned,
}

pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    /// Decorate the request; an error aborts it before dispatch
    fn before(&self, exchange: &mut Exchange) -> Result<()> {
        let _ = exchange;
        Ok(())
    }

    /// Observe the outcome; always called once `before` succeeded
    fn after(&self, exchange: &Exchange, completion: &Completion) {
        let _ = (exchange, completion);
    }
}

#[derive(Clone, Default)]
pub struct MiddlewareChain {
    layers: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, layer: impl Middleware + 'static) -> Self {
        self.layers.push(Arc::new(layer));
        self
    }

    pub fn push(&mut self, layer: Arc<dyn Middleware>) {
        self.layers.push(layer);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.layers.iter().map(|l| l.name()).collect()
    }

    /// Run the `before` hooks and return the guard that owns the `after` hooks
    pub fn begin(&self, exchange: Exchange) -> Result<HookGuard<'_>> {
        let mut guard = HookGuard {
            layers: &self.layers,
            entered: 0,
            exchange,
            completion: Completion::Abandoned,
        };
        for layer in &self.layers {
            if let Err(e) = layer.before(&mut guard.exchange) {
                guard.completion = Completion::Failed(e.to_string());
                return Err(e);
            }
            guard.entered += 1;
        }
        Ok(guard)
    }
}

/// Runs the `after` hooks of entered layers when dropped
pub struct HookGuard<'a> {
    layers: &'a [Arc<dyn Middleware>],
    entered: usize,
    exchange: Exchange,
    completion: Completion,
}

impl HookGuard<'_> {
    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    pub fn complete(&mut self, completion: Completion) {
        self.completion = completion;
    }
}

impl Drop for HookGuard<'_> {
    fn drop(&mut self) {
        for layer in self.layers[..self.entered].iter().rev() {
            layer.after(&self.exchange, &self.completion);
        }
    }
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Sends the live credential as a `Cookie` header and merges `Set-Cookie`
/// replies back into it
pub struct CookieLayer {
    credential: Arc<RwLock<Credential>>,
    rule: DomainRule,
}

impl CookieLayer {
    pub fn new(credential: Arc<RwLock<Credential>>, rule: DomainRule) -> Self {
        Self { credential, rule }
    }
}

impl Middleware for CookieLayer {
    fn name(&self) -> &'static str {
        "cookies"
    }

    fn before(&self, exchange: &mut Exchange) -> Result<()> {
        let header = {
            let credential = self.credential.read().unwrap_or_else(|e| e.into_inner());
            credential.header_for(exchange.host(), unix_now())
        };
        if let Some(header) = header {
            let value = HeaderValue::from_str(&header)
                .map_err(|e| PlatformError::Validation(format!("cookie header: {}", e)))?;
            exchange.headers.insert(COOKIE, value);
        }
        Ok(())
    }

    fn after(&self, exchange: &Exchange, completion: &Completion) {
        let Completion::Responded { headers, .. } = completion else {
            return;
        };
        let mut credential = self.credential.write().unwrap_or_else(|e| e.into_inner());
        let now = unix_now();
        for value in headers.get_all(SET_COOKIE) {
            if let Ok(text) = value.to_str() {
                credential.apply_set_cookie(text, &self.rule, now);
                tracing::trace!(host = exchange.host(), "Merged Set-Cookie into session");
            }
        }
    }
}

/// Copies the anti-forgery token cookie into a request header
///
/// When the credential carries no token the header is left out.
pub struct TokenLayer {
    credential: Arc<RwLock<Credential>>,
    cookie: String,
    header: HeaderName,
}

impl TokenLayer {
    pub fn new(credential: Arc<RwLock<Credential>>, cookie: &str, header: HeaderName) -> Self {
        Self {
            credential,
            cookie: cookie.to_string(),
            header,
        }
    }
}

impl Middleware for TokenLayer {
    fn name(&self) -> &'static str {
        "auth-token"
    }

    fn before(&self, exchange: &mut Exchange) -> Result<()> {
        let token = {
            let credential = self.credential.read().unwrap_or_else(|e| e.into_inner());
            credential.get(&self.cookie).map(str::to_string)
        };
        match token {
            Some(token) => {
                let value = HeaderValue::from_str(&token)
                    .map_err(|e| PlatformError::Validation(format!("auth token header: {}", e)))?;
                exchange.headers.insert(self.header.clone(), value);
            }
            None => {
                exchange.headers.remove(&self.header);
            }
        }
        Ok(())
    }
}

/// Debug-level request log
pub struct TraceLayer;

impl Middleware for TraceLayer {
    fn name(&self) -> &'static str {
        "trace"
    }

    fn before(&self, exchange: &mut Exchange) -> Result<()> {
        tracing::debug!(method = %exchange.method, url = %exchange.url, "Destination request");
        Ok(())
    }

    fn after(&self, exchange: &Exchange, completion: &Completion) {
        match completion {
            Completion::Responded { status, .. } => {
                tracing::debug!(url = %exchange.url, status = status.as_u16(), "Destination response")
            }
            Completion::Failed(error) => {
                tracing::debug!(url = %exchange.url, error = %error, "Destination request failed")
            }
            Completion::Abandoned => {
                tracing::debug!(url = %exchange.url, "Destination request abandoned")
            }
        }
    }
}
