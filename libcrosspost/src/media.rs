//! Local copies of source media
//!
//! Photos go to the image directory and avatars to the profile directory.
//! Videos are recorded on the message but never downloaded.

use reqwest::Url;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{expand_path, MediaConfig};
use crate::error::{PlatformError, RawResponse, Result};
use crate::source::{MediaKind, SourceMedia};

/// Which directory a download lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDir {
    Profile,
    Image,
    Video,
}

pub struct MediaStore {
    client: reqwest::Client,
    profile_dir: PathBuf,
    image_dir: PathBuf,
    video_dir: PathBuf,
}

impl MediaStore {
    pub fn new(config: &MediaConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(PlatformError::from_reqwest)?;

        Ok(Self {
            client,
            profile_dir: expand_path(&config.profile_dir),
            image_dir: expand_path(&config.image_dir),
            video_dir: expand_path(&config.video_dir),
        })
    }

    pub fn dir(&self, dir: MediaDir) -> &Path {
        match dir {
            MediaDir::Profile => &self.profile_dir,
            MediaDir::Image => &self.image_dir,
            MediaDir::Video => &self.video_dir,
        }
    }

    /// Create all three media directories
    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.profile_dir, &self.image_dir, &self.video_dir] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }

    /// Download `url` into `dir`, returning the local path
    pub async fn download(&self, url: &str, dir: MediaDir) -> Result<PathBuf> {
        let target_dir = self.dir(dir);
        tokio::fs::create_dir_all(target_dir).await?;
        let path = target_dir.join(file_name_for(url));

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(PlatformError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PlatformError::UnexpectedResponse(RawResponse {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            })
            .into());
        }

        let bytes = response.bytes().await.map_err(PlatformError::from_reqwest)?;
        tokio::fs::write(&path, &bytes).await?;

        tracing::debug!(url = %url, path = %path.display(), size = bytes.len(), "Downloaded media");
        Ok(path)
    }

    /// Best-effort avatar download; `None` on any failure
    pub async fn fetch_profile_image(&self, url: Option<&str>) -> Option<String> {
        let url = url.filter(|u| !u.is_empty())?;
        match self.download(url, MediaDir::Profile).await {
            Ok(path) => Some(path.to_string_lossy().into_owned()),
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Profile image download failed");
                None
            }
        }
    }

    /// Download the photos of one post, in attachment order
    ///
    /// Photos that fail to download are left out; other media kinds are
    /// skipped.
    pub async fn fetch_photos(&self, media: &[SourceMedia]) -> Vec<String> {
        let urls: Vec<&str> = media
            .iter()
            .filter(|item| item.kind == MediaKind::Photo)
            .filter_map(|item| item.url.as_deref())
            .collect();
        self.fetch_photo_urls(urls).await
    }

    /// Download photo URLs into the image directory, skipping failures
    pub async fn fetch_photo_urls<'a>(&self, urls: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let mut paths = Vec::new();
        for url in urls.into_iter().filter(|u| !u.is_empty()) {
            match self.download(url, MediaDir::Image).await {
                Ok(path) => paths.push(path.to_string_lossy().into_owned()),
                Err(e) => tracing::warn!(url = %url, error = %e, "Photo download failed"),
            }
        }
        paths
    }
}

/// Local file name for `url`: its last path segment, or the SHA-256 of
/// the URL when there is none
pub fn file_name_for(url: &str) -> String {
    let segment = Url::parse(url).ok().and_then(|parsed| {
        parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
    });

    segment.unwrap_or_else(|| {
        let digest = Sha256::digest(url.as_bytes());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    })
}
