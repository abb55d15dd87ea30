//! Relay pipeline
//!
//! One poll cycle runs in four steps:
//!
//! 1. sync the fetched accounts into the record store (new accounts get a
//!    profile and a best-effort avatar, changed profiles are refreshed, every
//!    tracked account is touched)
//! 2. insert each fetched post keyed by its platform id; duplicates are
//!    skipped without downloading their media
//! 3. submit every PENDING message to the single relay worker
//! 4. the worker posts each message and records DELIVERED or FAILED
//!
//! After the cycle the handle list is re-read. Newly listed handles restart
//! the poll chain with the extended target list and a larger fetch size; the
//! cycle after that restores the normal size.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{expand_path, SourceConfig};
use crate::db::RecordStore;
use crate::error::{CrosspostError, Result};
use crate::media::MediaStore;
use crate::relay::{AttachmentSource, Destination, Visibility};
use crate::scheduler::{PollHandler, PollParams, PollScheduler};
use crate::source::{
    fetch_batch, FeedBatch, FetchParams, MediaKind, SourceAccount, SourceFeed, SourcePost,
};
use crate::types::{AccountProfile, DeliveryStatus, InsertOutcome, Message, TrackedAccount};

/// Timestamp layout used in relayed text
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Pipeline knobs derived from `[source]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub handles: Vec<String>,
    pub handles_file: Option<PathBuf>,
    pub interval: Duration,
    pub initial_interval: Duration,
    pub max_results: u32,
    pub initial_max_results: u32,
    pub source_url_base: String,
    pub visibility: Visibility,
}

impl PipelineSettings {
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        Ok(Self {
            handles: config.handles.clone(),
            handles_file: config.handles_file.as_deref().map(expand_path),
            interval: config.poll_interval()?,
            initial_interval: config.first_interval()?,
            max_results: config.max_results,
            initial_max_results: config.initial_max_results,
            source_url_base: config.source_url_base.clone(),
            visibility: Visibility::default(),
        })
    }

    /// Configured handles plus the handles file, normalized and deduplicated
    ///
    /// A missing handles file counts as empty.
    pub fn read_handles(&self) -> Result<Vec<String>> {
        let mut handles = Vec::new();
        let mut seen = HashSet::new();

        let mut push = |raw: &str| {
            if let Some(handle) = normalize_handle(raw) {
                if seen.insert(handle.to_lowercase()) {
                    handles.push(handle);
                }
            }
        };

        for handle in &self.handles {
            push(handle);
        }

        if let Some(path) = &self.handles_file {
            match std::fs::read_to_string(path) {
                Ok(content) => content.lines().for_each(&mut push),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(path = %path.display(), "Handles file not found");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(handles)
    }
}

/// Strip whitespace and `@`; blank lines and `#` comments yield `None`
pub fn normalize_handle(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let handle = trimmed.replace('@', "");
    if handle.is_empty() {
        None
    } else {
        Some(handle)
    }
}

/// Link back to the source post
pub fn source_url(base: &str, handle: &str, post_id: &str) -> String {
    format!("{}/{}/status/{}", base.trim_end_matches('/'), handle, post_id)
}

/// Text relayed for one message
pub fn render_message(message: &Message) -> String {
    let timestamp = Utc
        .timestamp_opt(message.posted_at, 0)
        .single()
        .map(|t| t.format(TIME_FORMAT).to_string())
        .unwrap_or_default();

    format!(
        "{}\n@{}\n{}\n\n{}\n\n{}",
        message.author_name, message.author_handle, timestamp, message.body_text, message.source_url
    )
}

/// How one relay job ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Delivered { destination_post_id: String },
    Failed { error: String },
    /// The message left PENDING before the job ran
    Skipped,
}

struct RelayJob {
    message: Message,
    done: oneshot::Sender<JobOutcome>,
}

/// Single task draining relay jobs in submission order
pub struct RelayWorker {
    tx: mpsc::UnboundedSender<RelayJob>,
    handle: JoinHandle<()>,
}

impl RelayWorker {
    pub fn spawn(store: RecordStore, destination: Arc<dyn Destination>, visibility: Visibility) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<RelayJob>();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let outcome = relay_one(&store, destination.as_ref(), visibility, &job.message).await;
                // the submitter may have gone away; the record is already written
                let _ = job.done.send(outcome);
            }
            tracing::debug!("Relay worker drained");
        });

        Self { tx, handle }
    }

    /// Queue `message`; the receiver resolves when its job finishes
    pub fn submit(&self, message: Message) -> Result<oneshot::Receiver<JobOutcome>> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(RelayJob { message, done })
            .map_err(|_| CrosspostError::InvalidInput("relay worker has shut down".to_string()))?;
        Ok(rx)
    }

    /// Stop accepting jobs and wait for the queued ones
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Relay worker panicked");
        }
    }
}

async fn relay_one(
    store: &RecordStore,
    destination: &dyn Destination,
    visibility: Visibility,
    message: &Message,
) -> JobOutcome {
    let id = &message.platform_post_id;

    if message.delivery_status.is_terminal() {
        return JobOutcome::Skipped;
    }

    let text = render_message(message);
    let attachments: Vec<AttachmentSource> = message
        .local_media_paths
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| AttachmentSource::Path(PathBuf::from(p)))
        .collect();

    let result = destination.post(&text, attachments, visibility).await;
    let now = Utc::now().timestamp();

    let (recorded, outcome) = match result {
        Ok(destination_post_id) => {
            tracing::info!(
                post_id = %id,
                destination = destination.name(),
                destination_post_id = %destination_post_id,
                "Relayed message"
            );
            (
                store.mark_delivered(id, &destination_post_id, now).await,
                JobOutcome::Delivered { destination_post_id },
            )
        }
        Err(e) => {
            let error = e.to_string();
            tracing::warn!(post_id = %id, destination = destination.name(), error = %error, "Relay failed");
            (
                store.mark_failed(id, &error, now).await,
                JobOutcome::Failed { error },
            )
        }
    };

    match recorded {
        Ok(true) => outcome,
        Ok(false) => {
            tracing::warn!(post_id = %id, "Message was no longer pending; status left unchanged");
            JobOutcome::Skipped
        }
        Err(e) => {
            tracing::error!(post_id = %id, error = %e, "Failed to record delivery status");
            outcome
        }
    }
}

/// Counters for one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub new_accounts: usize,
    pub profiles_updated: usize,
    pub fetched: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub submitted: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Bookkeeping errors that were logged and skipped
    pub errors: Vec<String>,
}

pub struct RelayPipeline {
    store: RecordStore,
    media: MediaStore,
    worker: RelayWorker,
    settings: PipelineSettings,
    last_report: Mutex<Option<CycleReport>>,
}

impl RelayPipeline {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        store: RecordStore,
        media: MediaStore,
        destination: Arc<dyn Destination>,
        settings: PipelineSettings,
    ) -> Self {
        let worker = RelayWorker::spawn(store.clone(), destination, settings.visibility);
        Self {
            store,
            media,
            worker,
            settings,
            last_report: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn last_report(&self) -> Option<CycleReport> {
        self.last_report.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Parameters of the first poll chain
    ///
    /// Uses the larger fetch size when any listed handle is not tracked yet.
    pub async fn initial_params(&self) -> Result<PollParams> {
        let handles = self.settings.read_handles()?;
        let tracked: HashSet<String> = self
            .store
            .tracked_accounts()
            .await?
            .into_iter()
            .map(|a| a.handle.to_lowercase())
            .collect();

        let has_new = handles.iter().any(|h| !tracked.contains(&h.to_lowercase()));
        let max_results = if has_new {
            self.settings.initial_max_results
        } else {
            self.settings.max_results
        };

        Ok(PollParams::new(
            handles,
            self.settings.interval,
            FetchParams {
                max_results,
                end_time: None,
            },
        )
        .with_first_delay(self.settings.initial_interval))
    }

    /// Fetch and process a single batch without a scheduler
    pub async fn run_once(&self, feed: &Arc<dyn SourceFeed>) -> Result<CycleReport> {
        let params = self.initial_params().await?;
        let batch = fetch_batch(feed, &params.targets, &params.fetch).await?;
        self.run_cycle(&batch).await
    }

    /// Process one fetched batch end to end
    pub async fn run_cycle(&self, batch: &FeedBatch) -> Result<CycleReport> {
        let mut report = CycleReport {
            cycle_id: Uuid::new_v4(),
            fetched: batch.posts.len(),
            ..Default::default()
        };
        let span = tracing::info_span!("cycle", id = %report.cycle_id);

        async {
            self.sync_accounts(batch, &mut report).await;
            self.record_posts(batch, &mut report).await;
            self.relay_pending(&mut report).await?;

            tracing::info!(
                fetched = report.fetched,
                inserted = report.inserted,
                duplicates = report.duplicates,
                delivered = report.delivered,
                failed = report.failed,
                "Cycle complete"
            );
            Ok::<(), CrosspostError>(())
        }
        .instrument(span)
        .await?;

        *self.last_report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        Ok(report)
    }

    async fn sync_accounts(&self, batch: &FeedBatch, report: &mut CycleReport) {
        let now = Utc::now().timestamp();

        for account in &batch.accounts {
            if let Err(e) = self.sync_account(account, now, report).await {
                tracing::warn!(handle = %account.handle, error = %e, "Account sync failed");
                report.errors.push(e.to_string());
            }
        }

        if let Err(e) = self.store.touch_accounts(now).await {
            tracing::warn!(error = %e, "Failed to touch tracked accounts");
            report.errors.push(e.to_string());
        }
    }

    async fn sync_account(&self, account: &SourceAccount, now: i64, report: &mut CycleReport) -> Result<()> {
        let tracked = TrackedAccount {
            platform_id: account.id.clone(),
            handle: account.handle.clone(),
            first_tracked_at: now,
            last_checked_at: now,
        };

        if self.store.track_account(&tracked).await? == InsertOutcome::Inserted {
            let profile = AccountProfile {
                platform_id: account.id.clone(),
                handle: account.handle.clone(),
                name: account.name.clone(),
                description: account.description.clone(),
                profile_image_url: account.profile_image_url.clone(),
                profile_image_path: self
                    .media
                    .fetch_profile_image(account.profile_image_url.as_deref())
                    .await,
                added_at: now,
                updated_at: now,
            };
            self.store.upsert_profile(&profile).await?;
            tracing::info!(handle = %account.handle, id = %account.id, "Tracking new account");
            report.new_accounts += 1;
            return Ok(());
        }

        let Some(stored) = self.store.get_profile(&account.id).await? else {
            // tracked without a profile; write a fresh one
            let profile = AccountProfile {
                platform_id: account.id.clone(),
                handle: account.handle.clone(),
                name: account.name.clone(),
                description: account.description.clone(),
                profile_image_url: account.profile_image_url.clone(),
                profile_image_path: self
                    .media
                    .fetch_profile_image(account.profile_image_url.as_deref())
                    .await,
                added_at: now,
                updated_at: now,
            };
            self.store.upsert_profile(&profile).await?;
            report.profiles_updated += 1;
            return Ok(());
        };

        let changed = stored.handle != account.handle
            || stored.name != account.name
            || stored.description != account.description
            || stored.profile_image_url != account.profile_image_url;
        if !changed {
            return Ok(());
        }

        let profile_image_path = if stored.profile_image_url != account.profile_image_url {
            self.media
                .fetch_profile_image(account.profile_image_url.as_deref())
                .await
        } else {
            stored.profile_image_path.clone()
        };

        if stored.handle != account.handle {
            self.store.rename_account(&account.id, &account.handle).await?;
        }

        self.store
            .upsert_profile(&AccountProfile {
                handle: account.handle.clone(),
                name: account.name.clone(),
                description: account.description.clone(),
                profile_image_url: account.profile_image_url.clone(),
                profile_image_path,
                updated_at: now,
                ..stored
            })
            .await?;
        tracing::info!(handle = %account.handle, "Account profile updated");
        report.profiles_updated += 1;
        Ok(())
    }

    async fn record_posts(&self, batch: &FeedBatch, report: &mut CycleReport) {
        let now = Utc::now().timestamp();

        for post in &batch.posts {
            let Some(author) = batch.account(&post.author_id) else {
                tracing::warn!(post_id = %post.id, author_id = %post.author_id, "Post author not in batch");
                continue;
            };

            let message = self.message_for(post, author, now);
            match self.store.insert_message(&message).await {
                Ok(InsertOutcome::Inserted) => {
                    report.inserted += 1;
                    let paths = self.media.fetch_photos(&post.media).await;
                    if !paths.is_empty() {
                        if let Err(e) = self.store.set_local_media_paths(&post.id, &paths).await {
                            tracing::warn!(post_id = %post.id, error = %e, "Failed to record media paths");
                            report.errors.push(e.to_string());
                        }
                    }
                }
                Ok(InsertOutcome::Duplicate) => {
                    tracing::debug!(post_id = %post.id, "Post already recorded");
                    report.duplicates += 1;
                }
                Err(e) => {
                    tracing::warn!(post_id = %post.id, error = %e, "Failed to record post");
                    report.errors.push(e.to_string());
                }
            }
        }
    }

    fn message_for(&self, post: &SourcePost, author: &SourceAccount, now: i64) -> Message {
        let (media_urls, media_kinds): (Vec<String>, Vec<String>) = post
            .media
            .iter()
            .filter_map(|m| {
                m.url
                    .clone()
                    .or_else(|| m.preview_url.clone())
                    .map(|url| (url, m.kind.as_str().to_string()))
            })
            .unzip();

        Message {
            platform_post_id: post.id.clone(),
            account_id: author.id.clone(),
            author_name: author.name.clone(),
            author_handle: author.handle.clone(),
            body_text: post.text.clone(),
            posted_at: post.created_at.timestamp(),
            source_url: source_url(&self.settings.source_url_base, &author.handle, &post.id),
            hashtags: post.hashtags.clone(),
            media_urls,
            media_kinds,
            local_media_paths: Vec::new(),
            delivery_status: DeliveryStatus::Pending,
            delivered_at: None,
            destination_post_id: None,
            error_message: None,
            enter_time: now,
        }
    }

    async fn relay_pending(&self, report: &mut CycleReport) -> Result<()> {
        let pending = self.store.messages_by_status(DeliveryStatus::Pending).await?;

        let mut receivers = Vec::with_capacity(pending.len());
        for mut message in pending {
            self.restore_photos(&mut message, report).await;
            let id = message.platform_post_id.clone();
            receivers.push((id, self.worker.submit(message)?));
            report.submitted += 1;
        }

        for (id, rx) in receivers {
            match rx.await {
                Ok(JobOutcome::Delivered { .. }) => report.delivered += 1,
                Ok(JobOutcome::Failed { .. }) => report.failed += 1,
                Ok(JobOutcome::Skipped) => {}
                Err(_) => {
                    tracing::error!(post_id = %id, "Relay job dropped without an outcome");
                    report.errors.push(format!("relay job for {} dropped", id));
                }
            }
        }
        Ok(())
    }

    /// Download photos for a pending message recorded without local copies
    ///
    /// Happens when the process stopped between recording a post and
    /// storing its photo paths.
    async fn restore_photos(&self, message: &mut Message, report: &mut CycleReport) {
        if !message.local_media_paths.is_empty() {
            return;
        }
        let urls: Vec<&str> = message
            .media_urls
            .iter()
            .zip(&message.media_kinds)
            .filter(|(_, kind)| MediaKind::parse(kind) == MediaKind::Photo)
            .map(|(url, _)| url.as_str())
            .collect();
        if urls.is_empty() {
            return;
        }

        tracing::info!(post_id = %message.platform_post_id, photos = urls.len(), "Restoring missing photos");
        let paths = self.media.fetch_photo_urls(urls).await;
        if paths.is_empty() {
            return;
        }
        if let Err(e) = self
            .store
            .set_local_media_paths(&message.platform_post_id, &paths)
            .await
        {
            tracing::warn!(post_id = %message.platform_post_id, error = %e, "Failed to record media paths");
            report.errors.push(e.to_string());
        }
        message.local_media_paths = paths;
    }

    /// Next chain parameters after a cycle, if they differ from `current`
    pub fn next_params(&self, current: &PollParams) -> Result<Option<PollParams>> {
        let handles = self.settings.read_handles()?;
        let known: HashSet<String> = current.targets.iter().map(|t| t.to_lowercase()).collect();

        let added: Vec<String> = handles
            .iter()
            .filter(|h| !known.contains(&h.to_lowercase()))
            .cloned()
            .collect();

        if !added.is_empty() {
            tracing::info!(added = ?added, "New handles listed; restarting poll chain");
            let mut targets = current.targets.clone();
            targets.extend(added);
            let params = PollParams::new(
                targets,
                self.settings.interval,
                FetchParams {
                    max_results: self.settings.initial_max_results,
                    end_time: None,
                },
            )
            .with_first_delay(self.settings.initial_interval);
            return Ok(Some(params));
        }

        if current.fetch.max_results != self.settings.max_results || current.first_delay.is_some() {
            return Ok(Some(PollParams::new(
                current.targets.clone(),
                self.settings.interval,
                FetchParams {
                    max_results: self.settings.max_results,
                    end_time: None,
                },
            )));
        }

        Ok(None)
    }

    /// Stop the worker after the queued jobs finish
    pub async fn shutdown(self) {
        self.worker.shutdown().await;
    }
}

#[async_trait]
impl PollHandler for RelayPipeline {
    async fn on_batch(&self, scheduler: &PollScheduler, params: &PollParams, batch: FeedBatch) -> Result<()> {
        let cycle = self.run_cycle(&batch).await;

        // the chain is adjusted even when the cycle failed
        match self.next_params(params) {
            // a stop issued during the cycle wins over the restart
            Ok(Some(next)) => match scheduler.fired_generation() {
                Some(generation) => {
                    scheduler.replace(generation, next);
                }
                None => scheduler.start(next),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to re-read handles"),
        }

        cycle.map(|_| ())
    }
}
