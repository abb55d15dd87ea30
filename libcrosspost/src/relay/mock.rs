//! Mock destination for testing
//!
//! Records what would have been posted and can simulate failures and
//! latency, so pipeline logic can be exercised without a live session.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use super::{AttachmentSource, Destination, Visibility};
use crate::error::{PlatformError, Result};

/// One call to [`MockDestination::post`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPost {
    pub text: String,
    pub attachments: Vec<String>,
    pub visibility: Visibility,
}

/// Configuration for mock destination behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub name: String,

    /// Whether posting should succeed
    pub post_succeeds: bool,

    /// Error to return on posting failure
    pub post_error: Option<String>,

    /// Fail only posts whose text contains this marker
    pub fail_when_contains: Option<String>,

    /// Delay before completing operations (simulates network latency)
    pub delay: Duration,

    /// Posts that have been made (for verification)
    pub posted: Arc<Mutex<Vec<RecordedPost>>>,

    pub deleted: Arc<Mutex<Vec<String>>>,

    /// Highest number of overlapping `post` calls observed
    pub max_in_flight: Arc<AtomicUsize>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            name: "mock".to_string(),
            post_succeeds: true,
            post_error: None,
            fail_when_contains: None,
            delay: Duration::from_millis(0),
            posted: Arc::new(Mutex::new(Vec::new())),
            deleted: Arc::new(Mutex::new(Vec::new())),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }
}

pub struct MockDestination {
    config: MockConfig,
    in_flight: AtomicUsize,
    next_id: AtomicUsize,
}

impl MockDestination {
    pub fn new(config: MockConfig) -> Self {
        Self {
            config,
            in_flight: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
        }
    }

    /// A destination that accepts everything
    pub fn success() -> Self {
        Self::new(MockConfig::default())
    }

    /// A destination that rejects every post
    pub fn post_failure(error: &str) -> Self {
        Self::new(MockConfig {
            post_succeeds: false,
            post_error: Some(error.to_string()),
            ..Default::default()
        })
    }

    /// A destination that rejects posts containing `marker`
    pub fn failing_on(marker: &str) -> Self {
        Self::new(MockConfig {
            fail_when_contains: Some(marker.to_string()),
            ..Default::default()
        })
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self::new(MockConfig {
            delay,
            ..Default::default()
        })
    }

    pub fn posted(&self) -> Vec<RecordedPost> {
        self.config.posted.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.config.deleted.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.config.max_in_flight.load(Ordering::SeqCst)
    }

    fn should_fail(&self, text: &str) -> bool {
        !self.config.post_succeeds
            || self
                .config
                .fail_when_contains
                .as_deref()
                .is_some_and(|marker| text.contains(marker))
    }
}

#[async_trait]
impl Destination for MockDestination {
    async fn post(
        &self,
        text: &str,
        attachments: Vec<AttachmentSource>,
        visibility: Visibility,
    ) -> Result<String> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.config.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        let names: Vec<String> = attachments.iter().map(AttachmentSource::describe).collect();
        drop(attachments);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.should_fail(text) {
            let error_msg = self
                .config
                .post_error
                .clone()
                .unwrap_or_else(|| "Mock posting failed".to_string());
            return Err(PlatformError::Posting(error_msg).into());
        }

        self.config
            .posted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedPost {
                text: text.to_string(),
                attachments: names,
                visibility,
            });
        Ok(format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn delete(&self, post_id: &str) -> Result<()> {
        self.config
            .deleted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(post_id.to_string());
        Ok(())
    }

    fn name(&self) -> &str {
        &self.config.name
    }
}
