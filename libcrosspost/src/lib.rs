//! Crosspost - relay posts from a source feed to a destination account
//!
//! The library holds the authenticated destination session, the poll loop,
//! and the relay pipeline with its record store. The `crosspost-relay` and
//! `crosspost-creds` binaries are thin wrappers around it.

pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod logging;
pub mod media;
pub mod pipeline;
pub mod relay;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use credentials::{Credential, CredentialFormat, CredentialStore, DomainRule, StorageBackend};
pub use db::RecordStore;
pub use error::{CrosspostError, PlatformError, Result};
pub use pipeline::{CycleReport, PipelineSettings, RelayPipeline};
pub use relay::{Destination, RelayClient, Visibility};
pub use scheduler::{PollParams, PollScheduler};
pub use session::SessionClient;
pub use source::{SourceFeed, TwitterFeedClient};
pub use types::{DeliveryStatus, Message};
