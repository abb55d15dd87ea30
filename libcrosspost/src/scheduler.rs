//! Self-rearming poll loop
//!
//! The loop is a chain of one-shot timers rather than a fixed `loop`: each
//! fire fetches a batch, hands it to the [`PollHandler`], and arms the next
//! timer only if the chain that fired is still the current one. A handler
//! may call [`PollScheduler::replace`] with new parameters; that replaces the
//! chain unless it was stopped or replaced while the handler ran, and the
//! in-flight fire does not rearm.
//!
//! ```text
//! Idle --start--> Armed --timer--> Firing --handler done--> Armed
//!   ^               |                 |
//!   +-----stop------+------stop-------+ (in-flight fire completes, no rearm)
//! ```

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::source::{fetch_batch, FeedBatch, FetchParams, SourceFeed};

/// What one chain polls and how often
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollParams {
    pub targets: Vec<String>,
    pub interval: Duration,
    /// Delay before the first fire; `interval` when unset
    pub first_delay: Option<Duration>,
    pub fetch: FetchParams,
}

impl PollParams {
    pub fn new(targets: Vec<String>, interval: Duration, fetch: FetchParams) -> Self {
        Self {
            targets,
            interval,
            first_delay: None,
            fetch,
        }
    }

    pub fn with_first_delay(mut self, delay: Duration) -> Self {
        self.first_delay = Some(delay);
        self
    }
}

/// Receives each fetched batch
#[async_trait]
pub trait PollHandler: Send + Sync {
    /// Handle one batch; may restart `scheduler` with new parameters via
    /// [`PollScheduler::replace`]
    async fn on_batch(&self, scheduler: &PollScheduler, params: &PollParams, batch: FeedBatch) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Armed,
    Firing,
}

struct Slot {
    generation: u64,
    token: Option<CancellationToken>,
    state: SchedulerState,
    fires: u64,
    /// Fires currently running, including ones whose chain was stopped
    active: usize,
}

impl Slot {
    fn is_idle(&self) -> bool {
        self.state == SchedulerState::Idle && self.active == 0
    }
}

struct Inner {
    feed: Arc<dyn SourceFeed>,
    handler: Arc<dyn PollHandler>,
    slot: Mutex<Slot>,
    idle: Notify,
}

impl Inner {
    fn slot(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify_if_idle(&self, slot: &Slot) {
        if slot.is_idle() {
            self.idle.notify_waiters();
        }
    }
}

/// Owns at most one pending timer chain
#[derive(Clone)]
pub struct PollScheduler {
    inner: Arc<Inner>,
    /// Generation of the chain whose fire handed out this handle
    fired: Option<u64>,
}

impl PollScheduler {
    pub fn new(feed: Arc<dyn SourceFeed>, handler: Arc<dyn PollHandler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                feed,
                handler,
                slot: Mutex::new(Slot {
                    generation: 0,
                    token: None,
                    state: SchedulerState::Idle,
                    fires: 0,
                    active: 0,
                }),
                idle: Notify::new(),
            }),
            fired: None,
        }
    }

    /// Cancel any existing chain and arm a new one
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, params: PollParams) {
        let mut slot = self.inner.slot();
        self.arm(&mut slot, params);
    }

    /// Replace the chain only while `generation` is still the current one
    ///
    /// Returns `false` when the chain was stopped or replaced in the
    /// meantime; nothing is armed then.
    pub fn replace(&self, generation: u64, params: PollParams) -> bool {
        let mut slot = self.inner.slot();
        if slot.generation != generation || slot.token.is_none() {
            tracing::debug!(generation, current = slot.generation, "Poll chain gone; not replacing");
            return false;
        }
        self.arm(&mut slot, params);
        true
    }

    /// Generation of the chain whose fire is running this handler, if any
    pub fn fired_generation(&self) -> Option<u64> {
        self.fired
    }

    /// Generation of the current chain
    pub fn generation(&self) -> u64 {
        self.inner.slot().generation
    }

    fn arm(&self, slot: &mut Slot, params: PollParams) {
        let token = CancellationToken::new();
        if let Some(previous) = slot.token.take() {
            previous.cancel();
        }
        slot.generation += 1;
        slot.token = Some(token.clone());
        slot.state = SchedulerState::Armed;
        let generation = slot.generation;

        let delay = params.first_delay.unwrap_or(params.interval);
        tracing::info!(
            targets = params.targets.len(),
            interval_secs = params.interval.as_secs(),
            first_delay_secs = delay.as_secs(),
            max_results = params.fetch.max_results,
            "Poll chain armed"
        );
        tokio::spawn(run_armed(self.inner.clone(), params, generation, token, delay));
    }

    /// Cancel the pending timer; a fire already in flight finishes but does
    /// not rearm. No-op when idle.
    pub fn stop(&self) {
        let mut slot = self.inner.slot();
        if let Some(token) = slot.token.take() {
            token.cancel();
            slot.generation += 1;
            slot.state = SchedulerState::Idle;
            tracing::info!("Poll chain stopped");
            self.inner.notify_if_idle(&slot);
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.slot().state
    }

    pub fn is_running(&self) -> bool {
        self.state() != SchedulerState::Idle
    }

    /// Number of completed fires since construction
    pub fn fire_count(&self) -> u64 {
        self.inner.slot().fires
    }

    /// Resolves once the scheduler is idle and no fire is still running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // register before checking so a concurrent notify is not missed
            notified.as_mut().enable();
            if self.inner.slot().is_idle() {
                return;
            }
            notified.await;
        }
    }
}

fn run_armed(
    inner: Arc<Inner>,
    params: PollParams,
    generation: u64,
    token: CancellationToken,
    delay: Duration,
) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        {
            let mut slot = inner.slot();
            if slot.generation != generation || token.is_cancelled() {
                return;
            }
            slot.state = SchedulerState::Firing;
            slot.active += 1;
        }

        if let Err(panic) = AssertUnwindSafe(fire(&inner, &params, generation))
            .catch_unwind()
            .await
        {
            tracing::error!(panic = %panic_message(&*panic), "Poll fire panicked");
        }

        let rearm = {
            let mut slot = inner.slot();
            slot.fires += 1;
            slot.active -= 1;
            let current = slot.generation == generation && !token.is_cancelled();
            if current {
                slot.state = SchedulerState::Armed;
            }
            inner.notify_if_idle(&slot);
            current
        };

        if rearm {
            let interval = params.interval;
            tokio::spawn(run_armed(inner, params, generation, token, interval));
        } else {
            tracing::debug!(generation, "Poll chain superseded or cancelled; not rearming");
        }
    })
}

/// One fetch-and-handle cycle; errors are logged and the chain continues
async fn fire(inner: &Arc<Inner>, params: &PollParams, generation: u64) {
    let scheduler = PollScheduler {
        inner: inner.clone(),
        fired: Some(generation),
    };

    let batch = match fetch_batch(&inner.feed, &params.targets, &params.fetch).await {
        Ok(batch) => batch,
        Err(e) => {
            tracing::error!(error = %e, "Poll fetch failed");
            return;
        }
    };

    if let Err(e) = inner.handler.on_batch(&scheduler, params, batch).await {
        tracing::error!(error = %e, "Poll handler failed");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlatformError;
    use crate::source::{SourceAccount, SourcePost};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFeed {
        lookups: AtomicUsize,
        fail: bool,
    }

    impl CountingFeed {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                lookups: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl SourceFeed for CountingFeed {
        async fn accounts_by_handle(&self, handles: &[String]) -> Result<Vec<SourceAccount>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PlatformError::Transport("connection reset".into()).into());
            }
            Ok(handles
                .iter()
                .map(|h| SourceAccount {
                    id: format!("id-{}", h),
                    handle: h.clone(),
                    name: h.clone(),
                    description: None,
                    profile_image_url: None,
                })
                .collect())
        }

        async fn accounts_by_id(&self, _ids: &[String]) -> Result<Vec<SourceAccount>> {
            Ok(Vec::new())
        }

        async fn recent_posts(&self, _account_id: &str, _params: &FetchParams) -> Result<Vec<SourcePost>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<(Vec<String>, usize)>>,
        fail: bool,
        restart_with: Mutex<Option<PollParams>>,
        stop_inside: bool,
    }

    #[async_trait]
    impl PollHandler for Recorder {
        async fn on_batch(&self, scheduler: &PollScheduler, params: &PollParams, batch: FeedBatch) -> Result<()> {
            self.batches
                .lock()
                .unwrap()
                .push((params.targets.clone(), batch.accounts.len()));
            if let Some(next) = self.restart_with.lock().unwrap().take() {
                scheduler.start(next);
            }
            if self.stop_inside {
                scheduler.stop();
            }
            if self.fail {
                return Err(PlatformError::Posting("handler blew up".into()).into());
            }
            Ok(())
        }
    }

    fn params(targets: &[&str], secs: u64) -> PollParams {
        PollParams::new(
            targets.iter().map(|t| t.to_string()).collect(),
            Duration::from_secs(secs),
            FetchParams::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearms_on_interval() {
        let feed = CountingFeed::new(false);
        let handler = Arc::new(Recorder::default());
        let scheduler = PollScheduler::new(feed.clone(), handler.clone());

        scheduler.start(params(&["a"], 10));
        assert_eq!(scheduler.state(), SchedulerState::Armed);

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(feed.lookups.load(Ordering::SeqCst), 3);
        assert_eq!(handler.batches.lock().unwrap().len(), 3);
        assert_eq!(scheduler.state(), SchedulerState::Armed);
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_keeps_one_chain() {
        let feed = CountingFeed::new(false);
        let handler = Arc::new(Recorder::default());
        let scheduler = PollScheduler::new(feed.clone(), handler.clone());

        scheduler.start(params(&["a"], 10));
        scheduler.start(params(&["b"], 10));

        tokio::time::sleep(Duration::from_secs(25)).await;
        let batches = handler.batches.lock().unwrap().clone();
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|(targets, _)| targets == &vec!["b".to_string()]));
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_expiry_fires_nothing() {
        let feed = CountingFeed::new(false);
        let handler = Arc::new(Recorder::default());
        let scheduler = PollScheduler::new(feed.clone(), handler.clone());

        scheduler.start(params(&["a"], 10));
        tokio::time::sleep(Duration::from_secs(5)).await;
        scheduler.stop();
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(feed.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_when_idle_is_noop() {
        let scheduler = PollScheduler::new(CountingFeed::new(false), Arc::new(Recorder::default()));
        scheduler.stop();
        scheduler.stop();
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_inside_handler_prevents_rearm() {
        let feed = CountingFeed::new(false);
        let handler = Arc::new(Recorder {
            stop_inside: true,
            ..Default::default()
        });
        let scheduler = PollScheduler::new(feed.clone(), handler.clone());

        scheduler.start(params(&["a"], 10));
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(handler.batches.lock().unwrap().len(), 1);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(scheduler.fire_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_restart_changes_parameters() {
        let feed = CountingFeed::new(false);
        let handler = Arc::new(Recorder::default());
        *handler.restart_with.lock().unwrap() = Some(params(&["a", "b"], 20));
        let scheduler = PollScheduler::new(feed.clone(), handler.clone());

        scheduler.start(params(&["a"], 10));
        // fires at 10 (old chain, restarts), then 30 and 50 on the new chain
        tokio::time::sleep(Duration::from_secs(55)).await;
        let batches = handler.batches.lock().unwrap().clone();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0], (vec!["a".to_string()], 1));
        assert_eq!(batches[1], (vec!["a".to_string(), "b".to_string()], 2));
        assert_eq!(batches[2].0.len(), 2);
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_do_not_break_the_chain() {
        let feed = CountingFeed::new(true);
        let handler = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let scheduler = PollScheduler::new(feed.clone(), handler.clone());

        scheduler.start(params(&["a"], 10));
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(feed.lookups.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.state(), SchedulerState::Armed);
        scheduler.stop();
    }

    struct SlowHandler {
        finished: Mutex<bool>,
    }

    #[async_trait]
    impl PollHandler for SlowHandler {
        async fn on_batch(&self, _scheduler: &PollScheduler, _params: &PollParams, _batch: FeedBatch) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            *self.finished.lock().unwrap() = true;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_lets_the_inflight_fire_finish() {
        let handler = Arc::new(SlowHandler {
            finished: Mutex::new(false),
        });
        let scheduler = PollScheduler::new(CountingFeed::new(false), handler.clone());

        scheduler.start(params(&["a"], 10));
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(scheduler.state(), SchedulerState::Firing);

        scheduler.stop();
        assert!(!scheduler.is_running());
        scheduler.wait_idle().await;
        assert!(*handler.finished.lock().unwrap());
        assert_eq!(scheduler.fire_count(), 1);
    }

    /// Sleeps through the cycle, then tries to move the chain to new params
    struct RestartingHandler {
        replaced: Mutex<Option<bool>>,
    }

    #[async_trait]
    impl PollHandler for RestartingHandler {
        async fn on_batch(&self, scheduler: &PollScheduler, params: &PollParams, _batch: FeedBatch) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            let generation = scheduler.fired_generation().unwrap();
            let next = PollParams::new(params.targets.clone(), Duration::from_secs(5), params.fetch.clone());
            *self.replaced.lock().unwrap() = Some(scheduler.replace(generation, next));
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_cycle_wins_over_handler_restart() {
        let feed = CountingFeed::new(false);
        let handler = Arc::new(RestartingHandler {
            replaced: Mutex::new(None),
        });
        let scheduler = PollScheduler::new(feed.clone(), handler.clone());

        scheduler.start(params(&["a"], 10));
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(scheduler.state(), SchedulerState::Firing);

        scheduler.stop();
        scheduler.wait_idle().await;
        assert_eq!(*handler.replaced.lock().unwrap(), Some(false));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(feed.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_replace_moves_the_chain_when_current() {
        let feed = CountingFeed::new(false);
        let handler = Arc::new(RestartingHandler {
            replaced: Mutex::new(None),
        });
        let scheduler = PollScheduler::new(feed.clone(), handler.clone());

        scheduler.start(params(&["a"], 10));
        let first = scheduler.generation();
        // fire at 10, handler replaces at 40 with a 5s interval
        tokio::time::sleep(Duration::from_secs(41)).await;
        assert_eq!(*handler.replaced.lock().unwrap(), Some(true));
        assert_eq!(scheduler.generation(), first + 1);
        assert_eq!(scheduler.state(), SchedulerState::Armed);
        scheduler.stop();
    }

    #[test]
    fn test_replace_with_stale_generation_arms_nothing() {
        let scheduler = PollScheduler::new(CountingFeed::new(false), Arc::new(Recorder::default()));
        assert!(!scheduler.replace(0, params(&["a"], 10)));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(scheduler.fired_generation(), None);
    }

    struct PanickingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PollHandler for PanickingHandler {
        async fn on_batch(&self, _scheduler: &PollScheduler, _params: &PollParams, _batch: FeedBatch) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            panic!("handler bug");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_keeps_the_chain_alive() {
        let handler = Arc::new(PanickingHandler {
            calls: AtomicUsize::new(0),
        });
        let scheduler = PollScheduler::new(CountingFeed::new(false), handler.clone());

        scheduler.start(params(&["a"], 10));
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.fire_count(), 3);
        assert_eq!(scheduler.state(), SchedulerState::Armed);

        scheduler.stop();
        scheduler.wait_idle().await;
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_delay_overrides_interval_once() {
        let feed = CountingFeed::new(false);
        let handler = Arc::new(Recorder::default());
        let scheduler = PollScheduler::new(feed.clone(), handler.clone());

        scheduler.start(params(&["a"], 60).with_first_delay(Duration::from_secs(10)));
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(feed.lookups.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(50)).await;
        assert_eq!(feed.lookups.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(feed.lookups.load(Ordering::SeqCst), 2);
        scheduler.stop();
    }
}
