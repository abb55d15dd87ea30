//! Core record types for Crosspost

use serde::{Deserialize, Serialize};

/// A source account the relay follows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedAccount {
    pub platform_id: String,
    pub handle: String,
    pub first_tracked_at: i64,
    pub last_checked_at: i64,
}

impl TrackedAccount {
    pub fn new(platform_id: &str, handle: &str) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            platform_id: platform_id.to_string(),
            handle: handle.to_string(),
            first_tracked_at: now,
            last_checked_at: now,
        }
    }
}

/// Display metadata of a tracked account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountProfile {
    pub platform_id: String,
    pub handle: String,
    pub name: String,
    pub description: Option<String>,
    pub profile_image_url: Option<String>,
    /// Local copy of the avatar; `None` when the download failed
    pub profile_image_path: Option<String>,
    pub added_at: i64,
    pub updated_at: i64,
}

/// Delivery state of a relayed message
///
/// `Pending` moves to `Delivered` or `Failed`; neither of those ever changes
/// again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn code(&self) -> i64 {
        match self {
            DeliveryStatus::Pending => 0,
            DeliveryStatus::Delivered => 1,
            DeliveryStatus::Failed => -1,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(DeliveryStatus::Pending),
            1 => Some(DeliveryStatus::Delivered),
            -1 => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::Pending)
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(DeliveryStatus::Pending),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            _ => Err(format!(
                "Invalid delivery status: '{}'. Valid options: pending, delivered, failed",
                s
            )),
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Delivered => write!(f, "delivered"),
            DeliveryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A source post and its relay state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Dedup key
    pub platform_post_id: String,
    pub account_id: String,
    pub author_name: String,
    pub author_handle: String,
    pub body_text: String,
    pub posted_at: i64,
    pub source_url: String,
    pub hashtags: Vec<String>,
    pub media_urls: Vec<String>,
    pub media_kinds: Vec<String>,
    pub local_media_paths: Vec<String>,
    pub delivery_status: DeliveryStatus,
    pub delivered_at: Option<i64>,
    pub destination_post_id: Option<String>,
    pub error_message: Option<String>,
    pub enter_time: i64,
}

/// Result of an insert keyed on a unique column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The key already existed; nothing was written
    Duplicate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip() {
        for status in [DeliveryStatus::Pending, DeliveryStatus::Delivered, DeliveryStatus::Failed] {
            assert_eq!(DeliveryStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(DeliveryStatus::Failed.code(), -1);
        assert_eq!(DeliveryStatus::from_code(7), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!DeliveryStatus::Pending.is_terminal());
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(DeliveryStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("Delivered".parse::<DeliveryStatus>().unwrap(), DeliveryStatus::Delivered);
        assert!("sent".parse::<DeliveryStatus>().is_err());
        assert_eq!(DeliveryStatus::Failed.to_string(), "failed");
    }
}
