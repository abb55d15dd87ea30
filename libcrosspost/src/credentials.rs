//! Destination session credentials
//!
//! A [`Credential`] is the cookie set of a logged-in destination session. It
//! can be read from and written to several encodings through the
//! [`CredentialCodec`] strategies in [`codec`], and persisted with a
//! [`CredentialStore`] backend:
//!
//! - `FileCredentialStore`: a file in any of the codec formats
//! - `KeyringCredentialStore`: the OS keyring, holding the binary blob
//!
//! # Example
//!
//! ```no_run
//! use libcrosspost::credentials::{
//!     CredentialFormat, CredentialStore, DomainRule, FileCredentialStore,
//! };
//!
//! # fn example() -> libcrosspost::Result<()> {
//! let rule = DomainRule::default();
//!
//! // Import the value of a browser's Cookie header once...
//! let credential = CredentialFormat::Header
//!     .codec()
//!     .decode(b"SUB=abc; XSRF-TOKEN=f00", &rule)?;
//!
//! // ...and keep it in the full-fidelity blob format afterwards.
//! let store = FileCredentialStore::new("cookies.bin".into(), CredentialFormat::Blob);
//! store.save(&credential)?;
//! let reloaded = store.load(&rule)?;
//! assert_eq!(reloaded.get("XSRF-TOKEN"), Some("f00"));
//! # Ok(())
//! # }
//! ```

pub mod codec;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use zeroize::Zeroize;

use crate::config::SessionSettings;
use crate::error::{CredentialError, Result};

pub use codec::{BlobCodec, CookiesTxtCodec, CredentialCodec, CredentialFormat, HeaderCodec, JsonCodec};

/// One cookie of the destination session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Domain scope; a leading dot also matches subdomains
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    /// Unix timestamp, `None` for session cookies
    #[serde(default)]
    pub expires: Option<i64>,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: default_cookie_path(),
            secure: false,
            http_only: false,
            expires: None,
        }
    }

    /// Whether this cookie should be sent to `host`
    pub fn matches_host(&self, host: &str) -> bool {
        let bare = self.domain.trim_start_matches('.');
        if bare.eq_ignore_ascii_case(host) {
            return true;
        }
        self.domain.starts_with('.')
            && host.len() > bare.len()
            && host.to_ascii_lowercase().ends_with(&format!(".{}", bare.to_ascii_lowercase()))
    }

    fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires, Some(expires) if expires > 0 && expires <= now)
    }

    fn same_slot(&self, other: &Cookie) -> bool {
        self.name == other.name && self.domain == other.domain && self.path == other.path
    }
}

impl Drop for Cookie {
    fn drop(&mut self) {
        self.value.zeroize();
    }
}

/// Maps a cookie name to the domain it is scoped to
///
/// The destination sets its anti-forgery token on the mobile subdomain and
/// every other session cookie on the parent domain; encodings that carry no
/// domain (header text, JSON) are re-scoped with this rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRule {
    pub token_cookie: String,
    pub token_domain: String,
    pub default_domain: String,
}

impl Default for DomainRule {
    fn default() -> Self {
        Self::from_config(&SessionSettings::default())
    }
}

impl DomainRule {
    pub fn from_config(config: &SessionSettings) -> Self {
        Self {
            token_cookie: config.token_cookie.clone(),
            token_domain: config.token_domain.clone(),
            default_domain: config.default_domain.clone(),
        }
    }

    /// Scope every cookie to one domain (used against local test servers)
    pub fn single(token_cookie: &str, domain: &str) -> Self {
        Self {
            token_cookie: token_cookie.to_string(),
            token_domain: domain.to_string(),
            default_domain: domain.to_string(),
        }
    }

    pub fn domain_for(&self, key: &str) -> &str {
        if key == self.token_cookie {
            &self.token_domain
        } else {
            &self.default_domain
        }
    }
}

/// The cookie set of one destination session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    cookies: Vec<Cookie>,
}

impl Credential {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from bare name/value pairs, scoping each with `rule`
    pub fn from_pairs<I, K, V>(pairs: I, rule: &DomainRule) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut credential = Self::new();
        for (name, value) in pairs {
            let name = name.into();
            let domain = rule.domain_for(&name).to_string();
            credential.insert(Cookie::new(name, value, domain));
        }
        credential
    }

    /// Insert or replace the cookie with the same name, domain and path
    pub fn insert(&mut self, cookie: Cookie) {
        match self.cookies.iter_mut().find(|c| c.same_slot(&cookie)) {
            Some(existing) => *existing = cookie,
            None => self.cookies.push(cookie),
        }
    }

    /// First value stored under `name`, whatever its domain
    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.value.as_str())
    }

    pub fn remove(&mut self, name: &str) {
        self.cookies.retain(|c| c.name != name);
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Name/value view, dropping domain metadata (last one wins on clashes)
    pub fn to_pairs(&self) -> BTreeMap<String, String> {
        self.cookies
            .iter()
            .map(|c| (c.name.clone(), c.value.clone()))
            .collect()
    }

    /// `Cookie` header value for a request to `host`
    pub fn header_for(&self, host: &str, now: i64) -> Option<String> {
        let pairs: Vec<String> = self
            .cookies
            .iter()
            .filter(|c| c.matches_host(host) && !c.is_expired(now))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();
        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    /// Merge one `Set-Cookie` header received from `host`
    ///
    /// Without a `Domain` attribute the cookie is scoped with `rule`, the
    /// same way header-text credentials are.
    pub fn apply_set_cookie(&mut self, header: &str, rule: &DomainRule, now: i64) {
        let mut parts = header.split(';');
        let Some((name, value)) = parts.next().and_then(|p| p.split_once('=')) else {
            return;
        };
        let name = name.trim();
        if name.is_empty() {
            return;
        }

        let mut cookie = Cookie::new(name, value.trim(), rule.domain_for(name));
        let mut max_age = None;
        for attribute in parts {
            let (key, val) = match attribute.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attribute.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" if !val.is_empty() => {
                    cookie.domain = if val.starts_with('.') {
                        val.to_string()
                    } else {
                        format!(".{}", val)
                    };
                }
                "path" if !val.is_empty() => cookie.path = val.to_string(),
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                "max-age" => max_age = val.parse::<i64>().ok(),
                "expires" => {
                    cookie.expires = chrono::DateTime::parse_from_rfc2822(val)
                        .ok()
                        .map(|dt| dt.timestamp());
                }
                _ => {}
            }
        }
        if let Some(seconds) = max_age {
            cookie.expires = Some(now + seconds);
        }

        if cookie.is_expired(now) {
            self.cookies.retain(|c| !c.same_slot(&cookie));
        } else {
            self.insert(cookie);
        }
    }
}

/// Persistence backend for a [`Credential`]
pub trait CredentialStore: Send + Sync {
    /// Load the stored credential, scoping domain-less encodings with `rule`
    fn load(&self, rule: &DomainRule) -> Result<Credential>;

    /// Replace the stored credential
    fn save(&self, credential: &Credential) -> Result<()>;

    fn exists(&self) -> Result<bool>;

    /// Remove the stored credential; missing is not an error
    fn delete(&self) -> Result<()>;

    fn backend_name(&self) -> &str;
}

/// Which [`CredentialStore`] backs the destination session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Keyring,
}

/// Open the store described by the session configuration
pub fn open_store(config: &SessionSettings) -> Result<Box<dyn CredentialStore>> {
    match config.storage {
        StorageBackend::File => Ok(Box::new(FileCredentialStore::new(
            crate::config::expand_path(&config.credential_path),
            config.credential_format,
        ))),
        StorageBackend::Keyring => Ok(Box::new(KeyringCredentialStore::new(
            "crosspost.destination",
            &config.keyring_account,
        )?)),
    }
}

/// Refuse to read credentials through a symlink
pub fn validate_not_symlink(path: &Path) -> Result<()> {
    let metadata = std::fs::symlink_metadata(path).map_err(|e| {
        CredentialError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to read metadata for '{}': {}", path.display(), e),
        ))
    })?;

    if metadata.is_symlink() {
        return Err(CredentialError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!(
                "Credential file '{}' is a symbolic link; use a regular file",
                path.display()
            ),
        ))
        .into());
    }

    Ok(())
}

/// Credential kept in a file using one codec
pub struct FileCredentialStore {
    path: PathBuf,
    format: CredentialFormat,
}

impl FileCredentialStore {
    pub fn new(path: PathBuf, format: CredentialFormat) -> Self {
        Self { path, format }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> CredentialFormat {
        self.format
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self, rule: &DomainRule) -> Result<Credential> {
        if !self.path.exists() {
            return Err(CredentialError::NotFound(self.path.display().to_string()).into());
        }
        validate_not_symlink(&self.path)?;

        let data = std::fs::read(&self.path).map_err(CredentialError::Io)?;
        let credential = self.format.codec().decode(&data, rule)?;

        tracing::debug!(
            path = %self.path.display(),
            format = %self.format,
            cookies = credential.len(),
            "Loaded destination credential"
        );
        Ok(credential)
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        let data = self.format.codec().encode(credential)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(CredentialError::Io)?;
            }
        }
        std::fs::write(&self.path, data).map_err(CredentialError::Io)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.path, perms).map_err(CredentialError::Io)?;
        }

        tracing::debug!(path = %self.path.display(), format = %self.format, "Saved destination credential");
        Ok(())
    }

    fn exists(&self) -> Result<bool> {
        Ok(self.path.exists())
    }

    fn delete(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).map_err(CredentialError::Io)?;
        }
        Ok(())
    }

    fn backend_name(&self) -> &str {
        "file"
    }
}

/// Credential kept in the OS keyring as a base64 blob
pub struct KeyringCredentialStore {
    service: String,
    account: String,
}

impl KeyringCredentialStore {
    /// # Errors
    ///
    /// Returns `CredentialError::KeyringUnavailable` when no keyring can be
    /// reached (headless Linux without Secret Service, containers).
    pub fn new(service: &str, account: &str) -> Result<Self> {
        keyring::Entry::new(service, account)
            .map_err(|e| CredentialError::KeyringUnavailable(e.to_string()))?;
        Ok(Self {
            service: service.to_string(),
            account: account.to_string(),
        })
    }

    fn entry(&self) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, &self.account)
            .map_err(|e| CredentialError::KeyringUnavailable(e.to_string()).into())
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn load(&self, rule: &DomainRule) -> Result<Credential> {
        use base64::Engine;

        let encoded = match self.entry()?.get_password() {
            Ok(value) => value,
            Err(keyring::Error::NoEntry) => {
                return Err(CredentialError::NotFound(format!("{}/{}", self.service, self.account)).into())
            }
            Err(e) => return Err(CredentialError::Keyring(e.to_string()).into()),
        };
        let data = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| CredentialError::Malformed {
                format: "keyring".to_string(),
                reason: e.to_string(),
            })?;
        BlobCodec.decode(&data, rule)
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        use base64::Engine;

        let encoded = base64::engine::general_purpose::STANDARD.encode(BlobCodec.encode(credential)?);
        self.entry()?
            .set_password(&encoded)
            .map_err(|e| CredentialError::Keyring(e.to_string()))?;
        tracing::debug!(service = %self.service, account = %self.account, "Stored credential in OS keyring");
        Ok(())
    }

    fn exists(&self) -> Result<bool> {
        match self.entry()?.get_password() {
            Ok(_) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(CredentialError::Keyring(e.to_string()).into()),
        }
    }

    fn delete(&self) -> Result<()> {
        match self.entry()?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(CredentialError::Keyring(e.to_string()).into()),
        }
    }

    fn backend_name(&self) -> &str {
        "keyring"
    }
}
