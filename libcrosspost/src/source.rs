//! Source platform feed
//!
//! [`SourceFeed`] is the boundary the poll loop fetches through;
//! [`TwitterFeedClient`] implements it against the Twitter v2 REST API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{PlatformError, RawResponse, Result};

/// An account on the source platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAccount {
    pub id: String,
    pub handle: String,
    pub name: String,
    pub description: Option<String>,
    pub profile_image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Video,
    AnimatedGif,
    Other(String),
}

impl MediaKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "photo" => MediaKind::Photo,
            "video" => MediaKind::Video,
            "animated_gif" => MediaKind::AnimatedGif,
            other => MediaKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::AnimatedGif => "animated_gif",
            MediaKind::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMedia {
    pub media_key: String,
    pub kind: MediaKind,
    /// Direct URL; only photos carry one
    pub url: Option<String>,
    pub preview_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePost {
    pub id: String,
    pub author_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub hashtags: Vec<String>,
    pub media: Vec<SourceMedia>,
}

/// Per-request fetch options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchParams {
    pub max_results: u32,
    pub end_time: Option<DateTime<Utc>>,
}

impl Default for FetchParams {
    fn default() -> Self {
        Self {
            max_results: 10,
            end_time: None,
        }
    }
}

/// Everything fetched for one poll cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedBatch {
    pub accounts: Vec<SourceAccount>,
    pub posts: Vec<SourcePost>,
}

impl FeedBatch {
    pub fn account(&self, id: &str) -> Option<&SourceAccount> {
        self.accounts.iter().find(|a| a.id == id)
    }
}

#[async_trait]
pub trait SourceFeed: Send + Sync {
    async fn accounts_by_handle(&self, handles: &[String]) -> Result<Vec<SourceAccount>>;

    async fn accounts_by_id(&self, ids: &[String]) -> Result<Vec<SourceAccount>>;

    /// Recent original posts (no retweets or replies) of one account
    async fn recent_posts(&self, account_id: &str, params: &FetchParams) -> Result<Vec<SourcePost>>;
}

/// Resolve `handles` and fetch each account's recent posts
///
/// A failure fetching one account's posts is logged and skipped; failing to
/// resolve the handles fails the whole batch.
pub async fn fetch_batch(
    feed: &Arc<dyn SourceFeed>,
    handles: &[String],
    params: &FetchParams,
) -> Result<FeedBatch> {
    if handles.is_empty() {
        return Ok(FeedBatch::default());
    }

    let accounts = feed.accounts_by_handle(handles).await?;
    let mut posts = Vec::new();
    for account in &accounts {
        match feed.recent_posts(&account.id, params).await {
            Ok(mut fetched) => posts.append(&mut fetched),
            Err(e) => {
                tracing::warn!(handle = %account.handle, error = %e, "Failed to fetch posts for account")
            }
        }
    }

    tracing::debug!(accounts = accounts.len(), posts = posts.len(), "Fetched source batch");
    Ok(FeedBatch { accounts, posts })
}

// Twitter v2 wire types

#[derive(Debug, Deserialize)]
struct UsersResponse {
    #[serde(default)]
    data: Vec<UserObject>,
}

#[derive(Debug, Deserialize)]
struct UserObject {
    id: String,
    name: String,
    username: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    profile_image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TweetsResponse {
    #[serde(default)]
    data: Vec<TweetObject>,
    #[serde(default)]
    includes: Option<Includes>,
}

#[derive(Debug, Deserialize)]
struct TweetObject {
    id: String,
    text: String,
    #[serde(default)]
    author_id: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    entities: Option<Entities>,
    #[serde(default)]
    attachments: Option<Attachments>,
}

#[derive(Debug, Deserialize)]
struct Entities {
    #[serde(default)]
    hashtags: Vec<Hashtag>,
}

#[derive(Debug, Deserialize)]
struct Hashtag {
    tag: String,
}

#[derive(Debug, Deserialize)]
struct Attachments {
    #[serde(default)]
    media_keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Includes {
    #[serde(default)]
    media: Vec<MediaObject>,
}

#[derive(Debug, Deserialize)]
struct MediaObject {
    media_key: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    preview_image_url: Option<String>,
}

impl From<UserObject> for SourceAccount {
    fn from(user: UserObject) -> Self {
        Self {
            id: user.id,
            handle: user.username,
            name: user.name,
            description: user.description,
            profile_image_url: user.profile_image_url,
        }
    }
}

const USER_FIELDS: &str = "profile_image_url,description";
const TWEET_FIELDS: &str = "created_at,entities";
const MEDIA_FIELDS: &str = "duration_ms,height,media_key,preview_image_url,type,url,width,public_metrics";

/// Twitter v2 client using an app-only bearer token
pub struct TwitterFeedClient {
    http: reqwest::Client,
    api_base: String,
    bearer_token: String,
}

impl TwitterFeedClient {
    pub fn new(api_base: &str, bearer_token: &str, timeout: std::time::Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(PlatformError::from_reqwest)?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            bearer_token: bearer_token.to_string(),
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = format!("{}{}", self.api_base, path);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.bearer_token)
            .query(query)
            .send()
            .await
            .map_err(PlatformError::from_reqwest)?;

        let status = response.status();
        let body = response.text().await.map_err(PlatformError::from_reqwest)?;
        let raw = || RawResponse {
            url: url.clone(),
            status: status.as_u16(),
            body: body.clone(),
        };

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(PlatformError::Authentication(format!("source API rejected the bearer token: {}", raw())).into());
        }
        if !status.is_success() {
            return Err(PlatformError::UnexpectedResponse(raw()).into());
        }
        serde_json::from_str(&body).map_err(|_| PlatformError::UnexpectedResponse(raw()).into())
    }

    async fn users(&self, path: &str, query: &[(&str, String)]) -> Result<Vec<SourceAccount>> {
        let response: UsersResponse = self.get(path, query).await?;
        Ok(response.data.into_iter().map(SourceAccount::from).collect())
    }
}

#[async_trait]
impl SourceFeed for TwitterFeedClient {
    async fn accounts_by_handle(&self, handles: &[String]) -> Result<Vec<SourceAccount>> {
        let usernames = handles
            .iter()
            .map(|h| h.trim_start_matches('@'))
            .collect::<Vec<_>>()
            .join(",");
        self.users(
            "/2/users/by",
            &[("usernames", usernames), ("user.fields", USER_FIELDS.to_string())],
        )
        .await
    }

    async fn accounts_by_id(&self, ids: &[String]) -> Result<Vec<SourceAccount>> {
        self.users(
            "/2/users",
            &[("ids", ids.join(",")), ("user.fields", USER_FIELDS.to_string())],
        )
        .await
    }

    async fn recent_posts(&self, account_id: &str, params: &FetchParams) -> Result<Vec<SourcePost>> {
        // The endpoint accepts 5..=100
        let max_results = params.max_results.clamp(5, 100);
        let mut query = vec![
            ("max_results", max_results.to_string()),
            ("tweet.fields", TWEET_FIELDS.to_string()),
            ("media.fields", MEDIA_FIELDS.to_string()),
            ("expansions", "attachments.media_keys".to_string()),
            ("exclude", "retweets,replies".to_string()),
        ];
        if let Some(end_time) = params.end_time {
            query.push(("end_time", end_time.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)));
        }

        let response: TweetsResponse = self
            .get(&format!("/2/users/{}/tweets", account_id), &query)
            .await?;

        let media_by_key: HashMap<String, MediaObject> = response
            .includes
            .map(|i| i.media)
            .unwrap_or_default()
            .into_iter()
            .map(|m| (m.media_key.clone(), m))
            .collect();

        Ok(response
            .data
            .into_iter()
            .map(|tweet| {
                let media = tweet
                    .attachments
                    .map(|a| a.media_keys)
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|key| media_by_key.get(key))
                    .map(|m| SourceMedia {
                        media_key: m.media_key.clone(),
                        kind: MediaKind::parse(&m.kind),
                        url: m.url.clone(),
                        preview_url: m.preview_image_url.clone(),
                    })
                    .collect();
                SourcePost {
                    id: tweet.id,
                    author_id: tweet.author_id.unwrap_or_else(|| account_id.to_string()),
                    text: tweet.text,
                    created_at: tweet.created_at,
                    hashtags: tweet
                        .entities
                        .map(|e| e.hashtags.into_iter().map(|h| h.tag).collect())
                        .unwrap_or_default(),
                    media,
                }
            })
            .collect())
    }
}
