//! Cycle orchestration: fetch, rank, compare, notify, persist.

mod changes;
mod config;

pub use changes::{
    diff, render_notification, ChangeEntry, Direction, HEADLINE, NO_PREVIOUS_POSITION,
};
pub use config::{
    ConfigError, DirectionGlyphs, SyncConfig, DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_INTERVAL_SECS,
    DEFAULT_SNAPSHOT_PATH,
};

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rankwatch_core::RawProgramSection;
use rankwatch_notify::{DeliveryError, NotificationSink, WebhookSink};
use rankwatch_parser::{ExtractError, RankError};
use rankwatch_storage::{
    FetchError, FetchedPage, HttpClientConfig, HttpFetcher, SnapshotStore, StoreError,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinError;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Rank(#[from] RankError),
    #[error("parse worker failed: {0}")]
    Worker(#[from] JoinError),
    #[error("tracked identifier does not appear on the page")]
    TrackedIdNotFound,
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("fetch: {0}")]
    Fetch(#[from] FetchError),
    #[error("parse: {0}")]
    Parse(#[from] ParseError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("delivery: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Where the current ranking page comes from.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        self.fetch_text(url).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No snapshot (or an empty one) was stored; the current one was saved and nothing was sent.
    Bootstrapped { programs: usize },
    Unchanged,
    Notified { changes: Vec<ChangeEntry> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Fetching,
    Parsing,
    Ranking,
    Comparing,
    NoChange,
    Notifying,
    Persisting,
    Idle,
}

fn enter(state: CycleState) {
    debug!(?state, "cycle state");
}

pub struct SyncPipeline {
    config: Arc<SyncConfig>,
    store: SnapshotStore,
    source: Box<dyn PageSource>,
    sink: Box<dyn NotificationSink>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
        })?;
        let sink = WebhookSink::new(
            http.client().clone(),
            config.webhook.clone(),
            config.display_user.clone(),
        );
        let store = SnapshotStore::new(config.snapshot_path.clone());
        Ok(Self::from_parts(
            config,
            store,
            Box::new(http),
            Box::new(sink),
        ))
    }

    pub fn from_parts(
        config: SyncConfig,
        store: SnapshotStore,
        source: Box<dyn PageSource>,
        sink: Box<dyn NotificationSink>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            source,
            sink,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// One full cycle. Any error leaves the stored snapshot as it was.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, CycleError> {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("cycle", %cycle_id);
        self.run_cycle_inner().instrument(span).await
    }

    async fn run_cycle_inner(&self) -> Result<CycleOutcome, CycleError> {
        enter(CycleState::Fetching);
        let page = self.source.fetch(&self.config.site_url).await?;

        enter(CycleState::Parsing);
        let sections = extract_off_thread(page.body, self.config.tracked_id.clone()).await?;

        enter(CycleState::Ranking);
        let current = rankwatch_parser::rank_all(&sections).map_err(ParseError::from)?;

        enter(CycleState::Comparing);
        // An empty stored snapshot is a baseline too, not a page of new programs.
        let previous = match self.store.load_previous().await {
            Ok(previous) if !previous.is_empty() => previous,
            Ok(_) | Err(StoreError::Unavailable { .. }) => {
                enter(CycleState::Persisting);
                self.store.save(&current).await?;
                info!(programs = current.len(), "no previous snapshot; baseline stored");
                enter(CycleState::Idle);
                return Ok(CycleOutcome::Bootstrapped {
                    programs: current.len(),
                });
            }
            Err(err) => return Err(err.into()),
        };

        let changes = diff(&current, &previous);
        if changes.is_empty() {
            enter(CycleState::NoChange);
            info!(programs = current.len(), "no position changes");
            enter(CycleState::Idle);
            return Ok(CycleOutcome::Unchanged);
        }

        enter(CycleState::Notifying);
        let notification =
            render_notification(&changes, self.config.glyphs.as_ref(), Utc::now());
        self.sink.deliver(&notification).await?;

        enter(CycleState::Persisting);
        self.store.save(&current).await?;
        info!(changes = changes.len(), "position changes delivered");
        enter(CycleState::Idle);
        Ok(CycleOutcome::Notified { changes })
    }
}

async fn extract_off_thread(
    html: String,
    tracked_id: String,
) -> Result<Vec<RawProgramSection>, ParseError> {
    let sections =
        tokio::task::spawn_blocking(move || rankwatch_parser::extract(&html, &tracked_id))
            .await??;
    if sections.is_empty() {
        return Err(ParseError::TrackedIdNotFound);
    }
    Ok(sections)
}

#[derive(Debug)]
pub enum TickReport {
    /// A previous cycle was still running.
    Skipped,
    Ran(Result<CycleOutcome, CycleError>),
}

/// Runs the pipeline on a fixed interval, never two cycles at once.
#[derive(Clone)]
pub struct Driver {
    pipeline: Arc<SyncPipeline>,
    running: Arc<Mutex<()>>,
}

impl Driver {
    pub fn new(pipeline: SyncPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            running: Arc::new(Mutex::new(())),
        }
    }

    pub async fn tick(&self) -> TickReport {
        let Ok(_running) = self.running.try_lock() else {
            warn!("previous cycle still running; tick dropped");
            return TickReport::Skipped;
        };
        let result = self.pipeline.run_cycle().await;
        if let Err(err) = &result {
            error!(error = %err, "cycle failed");
        }
        TickReport::Ran(result)
    }

    pub async fn build_scheduler(&self) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let interval = self.pipeline.config().interval;
        let driver = self.clone();
        let job = Job::new_repeated_async(interval, move |_uuid, _l| {
            let driver = driver.clone();
            Box::pin(async move {
                driver.tick().await;
            })
        })
        .with_context(|| format!("creating repeated job every {}s", interval.as_secs()))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }

    /// First cycle right away, then one per interval until Ctrl-C.
    pub async fn run_until_shutdown(&self) -> Result<()> {
        self.tick().await;

        let mut sched = self.build_scheduler().await?;
        sched.start().await.context("starting scheduler")?;
        info!(
            interval_secs = self.pipeline.config().interval.as_secs(),
            "watching ranking page"
        );

        tokio::signal::ctrl_c()
            .await
            .context("waiting for ctrl-c")?;
        info!("shutdown requested");
        sched.shutdown().await.context("stopping scheduler")?;
        Ok(())
    }
}

pub async fn run_cycle_once_from_env() -> Result<CycleOutcome> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::new(config)?;
    Ok(pipeline.run_cycle().await?)
}

pub async fn run_watch_from_env() -> Result<()> {
    let config = SyncConfig::from_env()?;
    Driver::new(SyncPipeline::new(config)?)
        .run_until_shutdown()
        .await
}
