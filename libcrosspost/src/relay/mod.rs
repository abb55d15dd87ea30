//! Posting to the destination platform
//!
//! [`RelayClient`] is the outward-facing capability built on
//! [`SessionClient`]: post with attachments, delete, upload. The pipeline
//! talks to it through the [`Destination`] trait so tests can swap in
//! [`mock::MockDestination`].

use async_trait::async_trait;
use reqwest::multipart;
use serde_json::Value;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::DestinationConfig;
use crate::error::{PlatformError, RawResponse, Result};
use crate::session::{Call, RefererMode, SessionClient, SessionConfig};

// Mock destination is available for all builds (not just tests) to support integration tests
pub mod mock;

/// Screen hint the mobile web client sends with every write
pub const SCREEN_HINT: &str = "screen:400x629";

/// File name used when an attachment has no path to derive one from
pub const STREAM_FILE_NAME: &str = "image_stream";

/// Who can see a relayed post
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Everyone,
    OnlyMe,
    Friends,
}

impl Visibility {
    pub fn code(&self) -> u8 {
        match self {
            Visibility::Everyone => 0,
            Visibility::OnlyMe => 1,
            Visibility::Friends => 6,
        }
    }
}

/// Where the bytes of an attachment come from
pub enum AttachmentSource {
    Path(PathBuf),
    /// An open stream; consumed and closed by the upload
    Stream {
        reader: Box<dyn AsyncRead + Send + Unpin>,
        name: Option<String>,
    },
}

impl AttachmentSource {
    pub fn stream(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        AttachmentSource::Stream {
            reader: Box::new(reader),
            name: None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            AttachmentSource::Path(path) => path.display().to_string(),
            AttachmentSource::Stream { name, .. } => {
                name.clone().unwrap_or_else(|| STREAM_FILE_NAME.to_string())
            }
        }
    }

    /// Read the whole attachment; the underlying file or stream is closed
    /// before this returns, whatever the outcome
    async fn into_part(self) -> Result<(String, Vec<u8>)> {
        match self {
            AttachmentSource::Path(path) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| STREAM_FILE_NAME.to_string());
                let bytes = tokio::fs::read(&path).await.map_err(|e| {
                    PlatformError::Validation(format!("cannot read attachment '{}': {}", path.display(), e))
                })?;
                Ok((name, bytes))
            }
            AttachmentSource::Stream { mut reader, name } => {
                let mut bytes = Vec::new();
                let read = reader.read_to_end(&mut bytes).await;
                drop(reader);
                read.map_err(|e| PlatformError::Validation(format!("cannot read attachment stream: {}", e)))?;
                Ok((name.unwrap_or_else(|| STREAM_FILE_NAME.to_string()), bytes))
            }
        }
    }
}

impl From<PathBuf> for AttachmentSource {
    fn from(path: PathBuf) -> Self {
        AttachmentSource::Path(path)
    }
}

/// Something the pipeline can relay posts to
#[async_trait]
pub trait Destination: Send + Sync {
    /// Publish `text` with attachments uploaded in order; returns the post id
    async fn post(
        &self,
        text: &str,
        attachments: Vec<AttachmentSource>,
        visibility: Visibility,
    ) -> Result<String>;

    async fn delete(&self, post_id: &str) -> Result<()>;

    fn name(&self) -> &str;
}

/// Destination client on top of an authenticated session
pub struct RelayClient {
    session: SessionClient,
    endpoints: DestinationConfig,
}

impl RelayClient {
    pub fn new(session: SessionClient, endpoints: DestinationConfig) -> Self {
        Self { session, endpoints }
    }

    pub fn session(&self) -> &SessionClient {
        &self.session
    }

    /// Upload one attachment and return its attachment id
    pub async fn upload(&self, source: AttachmentSource) -> Result<String> {
        let config = self.session.require_login().await?;
        self.upload_with(&config, source).await
    }

    async fn upload_with(&self, config: &SessionConfig, source: AttachmentSource) -> Result<String> {
        let described = source.describe();
        let (file_name, bytes) = source.into_part().await?;

        let part = multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("image/jpeg")
            .map_err(|e| PlatformError::Validation(e.to_string()))?;
        let form = multipart::Form::new()
            .text("type", "json")
            .text("st", config.auth_token.clone())
            .text("_spr", SCREEN_HINT)
            .part("pic", part);

        let call = Call::post(&self.endpoints.upload_url)
            .multipart(form)
            .referer_if_unset(&self.endpoints.compose_referer)
            .public();
        let payload = self.session.execute(call).await?;

        let pic_id = string_field(&payload, &["pic_id", "pid"]).ok_or_else(|| {
            self.missing_field(&self.endpoints.upload_url, &payload)
        })?;
        tracing::debug!(attachment = %described, pic_id = %pic_id, "Uploaded attachment");
        Ok(pic_id)
    }

    /// Publish a post; attachments are uploaded sequentially first
    pub async fn post(
        &self,
        text: &str,
        attachments: Vec<AttachmentSource>,
        visibility: Visibility,
    ) -> Result<String> {
        let config = self.session.require_login().await?;
        let _referer = self
            .session
            .scope_referer(&self.endpoints.compose_referer, RefererMode::Replace)?;

        let mut pic_ids: Vec<String> = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            pic_ids.push(self.upload_with(&config, attachment).await?);
            self.session.set_referer(&format!(
                "{}/?pids={}",
                self.endpoints.compose_referer,
                pic_ids.join(",")
            ))?;
        }

        let mut form = vec![
            ("content".to_string(), text.to_string()),
            ("st".to_string(), config.auth_token.clone()),
            ("_spr".to_string(), SCREEN_HINT.to_string()),
        ];
        if visibility != Visibility::Everyone {
            form.push(("visible".to_string(), visibility.code().to_string()));
        }
        if !pic_ids.is_empty() {
            form.push(("picId".to_string(), pic_ids.join(",")));
        }

        let payload = self
            .session
            .execute(Call::post(&self.endpoints.send_url).form(form).public())
            .await?;
        let post_id = string_field(&payload, &["id", "mid"])
            .ok_or_else(|| self.missing_field(&self.endpoints.send_url, &payload))?;

        tracing::info!(post_id = %post_id, attachments = pic_ids.len(), "Relayed post");
        Ok(post_id)
    }

    /// Delete a post; an unknown id surfaces as an unexpected response
    pub async fn delete(&self, post_id: &str) -> Result<()> {
        let config = self.session.require_login().await?;
        let referer = format!("{}detail/{}", self.endpoints.base_url, post_id);
        let call = Call::post(&self.endpoints.delete_url)
            .form([
                ("mid", post_id.to_string()),
                ("st", config.auth_token.clone()),
                ("_spr", SCREEN_HINT.to_string()),
            ])
            .referer(&referer)
            .public();
        self.session.execute(call).await?;
        tracing::info!(post_id = %post_id, "Deleted post");
        Ok(())
    }

    fn missing_field(&self, url: &str, payload: &Value) -> crate::error::CrosspostError {
        PlatformError::UnexpectedResponse(RawResponse {
            url: url.to_string(),
            status: 200,
            body: payload.to_string(),
        })
        .into()
    }
}

#[async_trait]
impl Destination for RelayClient {
    async fn post(
        &self,
        text: &str,
        attachments: Vec<AttachmentSource>,
        visibility: Visibility,
    ) -> Result<String> {
        RelayClient::post(self, text, attachments, visibility).await
    }

    async fn delete(&self, post_id: &str) -> Result<()> {
        RelayClient::delete(self, post_id).await
    }

    fn name(&self) -> &str {
        "weibo"
    }
}

fn string_field(payload: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match payload.get(*key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests;
