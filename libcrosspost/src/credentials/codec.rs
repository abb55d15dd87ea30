//! Credential encodings
//!
//! | format        | keeps domains/expiry | typical source                     |
//! |---------------|----------------------|------------------------------------|
//! | `header`      | no (re-scoped)       | a browser request's `Cookie` value |
//! | `cookies-txt` | yes                  | browser export (Netscape format)   |
//! | `json`        | no (re-scoped)       | debugging only                     |
//! | `blob`        | yes                  | persistence (preferred)            |

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::str::FromStr;

use super::{Cookie, Credential, DomainRule};
use crate::error::{CredentialError, Result};

/// One way of turning a [`Credential`] into bytes and back
pub trait CredentialCodec: Send + Sync {
    fn format(&self) -> CredentialFormat;

    /// Decode; encodings without domain metadata are scoped with `rule`
    fn decode(&self, data: &[u8], rule: &DomainRule) -> Result<Credential>;

    fn encode(&self, credential: &Credential) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialFormat {
    Header,
    CookiesTxt,
    Json,
    Blob,
}

impl CredentialFormat {
    pub fn codec(&self) -> Box<dyn CredentialCodec> {
        match self {
            CredentialFormat::Header => Box::new(HeaderCodec),
            CredentialFormat::CookiesTxt => Box::new(CookiesTxtCodec),
            CredentialFormat::Json => Box::new(JsonCodec),
            CredentialFormat::Blob => Box::new(BlobCodec),
        }
    }

    /// Whether encoding through this format loses domain/expiry data
    pub fn is_lossy(&self) -> bool {
        matches!(self, CredentialFormat::Header | CredentialFormat::Json)
    }
}

impl FromStr for CredentialFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "header" => Ok(CredentialFormat::Header),
            "cookies-txt" | "cookies.txt" | "netscape" => Ok(CredentialFormat::CookiesTxt),
            "json" => Ok(CredentialFormat::Json),
            "blob" | "binary" => Ok(CredentialFormat::Blob),
            _ => Err(format!(
                "Invalid credential format: '{}'. Valid options: header, cookies-txt, json, blob",
                s
            )),
        }
    }
}

impl std::fmt::Display for CredentialFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialFormat::Header => write!(f, "header"),
            CredentialFormat::CookiesTxt => write!(f, "cookies-txt"),
            CredentialFormat::Json => write!(f, "json"),
            CredentialFormat::Blob => write!(f, "blob"),
        }
    }
}

fn malformed(format: CredentialFormat, reason: impl Into<String>) -> CredentialError {
    CredentialError::Malformed {
        format: format.to_string(),
        reason: reason.into(),
    }
}

fn utf8(format: CredentialFormat, data: &[u8]) -> Result<&str> {
    std::str::from_utf8(data).map_err(|e| malformed(format, e.to_string()).into())
}

/// `name=value; name2=value2` as sent in a `Cookie` request header
pub struct HeaderCodec;

impl CredentialCodec for HeaderCodec {
    fn format(&self) -> CredentialFormat {
        CredentialFormat::Header
    }

    fn decode(&self, data: &[u8], rule: &DomainRule) -> Result<Credential> {
        let text = utf8(self.format(), data)?;
        let mut pairs = Vec::new();
        for segment in text.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let (name, value) = segment
                .split_once('=')
                .ok_or_else(|| malformed(self.format(), format!("pair without '=': {}", segment)))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(malformed(self.format(), "empty cookie name").into());
            }
            pairs.push((name.to_string(), value.trim().to_string()));
        }
        Ok(Credential::from_pairs(pairs, rule))
    }

    fn encode(&self, credential: &Credential) -> Result<Vec<u8>> {
        let header = credential
            .cookies()
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ");
        Ok(header.into_bytes())
    }
}

const NETSCAPE_HEADER: &str = "# Netscape HTTP Cookie File";
const HTTP_ONLY_PREFIX: &str = "#HttpOnly_";

/// Browser-style cookie jar text (Netscape/Mozilla `cookies.txt`)
///
/// Seven tab-separated fields per line: domain, include-subdomains flag,
/// path, secure flag, expiry, name, value.
pub struct CookiesTxtCodec;

impl CredentialCodec for CookiesTxtCodec {
    fn format(&self) -> CredentialFormat {
        CredentialFormat::CookiesTxt
    }

    fn decode(&self, data: &[u8], _rule: &DomainRule) -> Result<Credential> {
        let text = utf8(self.format(), data)?;
        let mut credential = Credential::new();

        for (index, raw_line) in text.lines().enumerate() {
            let mut line = raw_line.trim_end_matches('\r');
            let mut http_only = false;
            if let Some(rest) = line.strip_prefix(HTTP_ONLY_PREFIX) {
                line = rest;
                http_only = true;
            } else if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != 7 {
                return Err(malformed(
                    self.format(),
                    format!("line {}: expected 7 fields, found {}", index + 1, fields.len()),
                )
                .into());
            }

            let include_subdomains = fields[1].eq_ignore_ascii_case("TRUE");
            let domain = if include_subdomains && !fields[0].starts_with('.') {
                format!(".{}", fields[0])
            } else {
                fields[0].to_string()
            };
            let expires = fields[4]
                .parse::<i64>()
                .map_err(|_| malformed(self.format(), format!("line {}: bad expiry", index + 1)))?;

            let mut cookie = Cookie::new(fields[5], fields[6], domain);
            cookie.path = fields[2].to_string();
            cookie.secure = fields[3].eq_ignore_ascii_case("TRUE");
            cookie.http_only = http_only;
            cookie.expires = if expires == 0 { None } else { Some(expires) };
            credential.insert(cookie);
        }

        Ok(credential)
    }

    fn encode(&self, credential: &Credential) -> Result<Vec<u8>> {
        let mut out = String::new();
        out.push_str(NETSCAPE_HEADER);
        out.push('\n');
        for cookie in credential.cookies() {
            if cookie.http_only {
                out.push_str(HTTP_ONLY_PREFIX);
            }
            let flag = |b: bool| if b { "TRUE" } else { "FALSE" };
            out.push_str(&format!(
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\n",
                cookie.domain,
                flag(cookie.domain.starts_with('.')),
                cookie.path,
                flag(cookie.secure),
                cookie.expires.unwrap_or(0),
                cookie.name,
                cookie.value
            ));
        }
        Ok(out.into_bytes())
    }
}

/// Flat JSON object of name → value
///
/// Drops domain, path and expiry; only meant for inspecting a session.
pub struct JsonCodec;

impl CredentialCodec for JsonCodec {
    fn format(&self) -> CredentialFormat {
        CredentialFormat::Json
    }

    fn decode(&self, data: &[u8], rule: &DomainRule) -> Result<Credential> {
        let pairs: BTreeMap<String, String> =
            serde_json::from_slice(data).map_err(|e| malformed(self.format(), e.to_string()))?;
        Ok(Credential::from_pairs(pairs, rule))
    }

    fn encode(&self, credential: &Credential) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(&credential.to_pairs())
            .map_err(|e| malformed(self.format(), e.to_string()).into())
    }
}

const BLOB_MAGIC: &[u8; 6] = b"XPJAR\x01";

#[derive(Serialize, Deserialize)]
struct BlobJar {
    cookies: Vec<Cookie>,
}

/// Opaque full-fidelity jar: magic header + deflated JSON
pub struct BlobCodec;

impl CredentialCodec for BlobCodec {
    fn format(&self) -> CredentialFormat {
        CredentialFormat::Blob
    }

    fn decode(&self, data: &[u8], _rule: &DomainRule) -> Result<Credential> {
        let body = data
            .strip_prefix(BLOB_MAGIC.as_slice())
            .ok_or_else(|| malformed(self.format(), "missing blob header"))?;

        let mut json = Vec::new();
        DeflateDecoder::new(body)
            .read_to_end(&mut json)
            .map_err(|e| malformed(self.format(), e.to_string()))?;
        let jar: BlobJar =
            serde_json::from_slice(&json).map_err(|e| malformed(self.format(), e.to_string()))?;

        let mut credential = Credential::new();
        for cookie in jar.cookies {
            credential.insert(cookie);
        }
        Ok(credential)
    }

    fn encode(&self, credential: &Credential) -> Result<Vec<u8>> {
        let jar = BlobJar {
            cookies: credential.cookies().to_vec(),
        };
        let json = serde_json::to_vec(&jar).map_err(|e| malformed(self.format(), e.to_string()))?;

        let mut out = BLOB_MAGIC.to_vec();
        let mut encoder = DeflateEncoder::new(&mut out, Compression::default());
        encoder.write_all(&json).map_err(CredentialError::Io)?;
        encoder.finish().map_err(CredentialError::Io)?;
        Ok(out)
    }
}
