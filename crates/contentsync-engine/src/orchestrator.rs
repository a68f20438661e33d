//! The sync state machine.
//!
//! A [`SyncOrchestrator`] owns the configuration, the collaborators and the
//! lifecycle state of one content root. An attempt runs as a tokio task:
//!
//! ```text
//! Idle -> FetchingMetadata -> Planning -> Downloading -> AwaitingApply -> Applying -> Completed
//!                                                                                 \-> Failed
//! ```
//!
//! Applying is a separate, explicit step (or automatic with `auto_apply`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{RwLockReadGuard, Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use contentsync_core::{
    DocumentParser, JsonDocumentParser, PlanEntry, STATE_FILE_NAME, ScanConfig, ScanError,
    Snapshot, SyncConfig, SyncPlan, compute_sync_plan_with_staged, structure_differs,
};
use contentsync_ops::{
    ApplyAction, ApplyRequest, ApplyResult, ArchiveExtractor, DownloadError, DownloadRequest,
    DownloadTask, HttpTransport, OPERATION_CHANNEL_SIZE, OperationComplete, PART_SUFFIX,
    StandardExtractor, TaskProgress, Transport, UnpackError, clear_directory, resolve_url,
    start_apply,
};
use contentsync_scan::LocalScanner;

use crate::collector::{Collector, DetailedDownloadError, ErrorLog, TaskReport};
use crate::error::SyncError;
use crate::events::{EventBus, ListenerId, SyncEvent, SyncListener};
use crate::schedule::{SyncState, sync_due};
use crate::state::{SyncPhase, SyncStatus};

/// How often byte progress is published while downloads run.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Drives syncs for one content root. Cheap to clone.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    parser: Arc<dyn DocumentParser>,
    extractor: Arc<dyn ArchiveExtractor>,
    config: RwLock<SyncConfig>,
    state: Mutex<State>,
    events: EventBus,
    content_lock: tokio::sync::RwLock<()>,
    next_attempt: AtomicU64,
}

struct State {
    phase: SyncPhase,
    last_status: Option<SyncStatus>,
    attempt: Option<Attempt>,
    unpack_cancel: Option<CancellationToken>,
    plan: Option<SyncPlan>,
    remote_generated_on: Option<DateTime<Utc>>,
    errors: ErrorLog,
    last_error: Option<String>,
    persisted: SyncState,
}

#[derive(Clone)]
struct Attempt {
    id: u64,
    cancel: CancellationToken,
    done: watch::Receiver<Option<SyncStatus>>,
}

impl Attempt {
    fn handle(&self) -> SyncHandle {
        SyncHandle {
            attempt: self.id,
            cancel: self.cancel.clone(),
            done: self.done.clone(),
        }
    }
}

/// A view of one running (or finished) attempt.
///
/// Every caller of [`SyncOrchestrator::perform_sync`] during the same
/// attempt gets a handle to that attempt.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    attempt: u64,
    cancel: CancellationToken,
    done: watch::Receiver<Option<SyncStatus>>,
}

impl SyncHandle {
    /// Identifier of the attempt, unique per orchestrator.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Request cooperative cancellation of the attempt.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Final status, if the attempt has ended.
    pub fn try_status(&self) -> Option<SyncStatus> {
        *self.done.borrow()
    }

    /// Wait for the attempt to end.
    pub async fn wait(mut self) -> SyncStatus {
        match self.done.wait_for(Option::is_some).await {
            Ok(status) => status.unwrap_or(SyncStatus::Failed),
            Err(_) => SyncStatus::Failed,
        }
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SyncOrchestrator")
            .field("phase", &state.phase)
            .field("last_status", &state.last_status)
            .field("events", &self.inner.events)
            .finish()
    }
}

impl SyncOrchestrator {
    /// Create an orchestrator with explicit collaborators.
    ///
    /// Loads the persisted sync state from [`SyncConfig::state_path`].
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        parser: Arc<dyn DocumentParser>,
        extractor: Arc<dyn ArchiveExtractor>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let persisted = SyncState::load(&config.state_path());
        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                parser,
                extractor,
                config: RwLock::new(config),
                state: Mutex::new(State {
                    phase: SyncPhase::Idle,
                    last_status: None,
                    attempt: None,
                    unpack_cancel: None,
                    plan: None,
                    remote_generated_on: None,
                    errors: ErrorLog::default(),
                    last_error: None,
                    persisted,
                }),
                events: EventBus::new(),
                content_lock: tokio::sync::RwLock::new(()),
                next_attempt: AtomicU64::new(1),
            }),
        })
    }

    /// Orchestrator using HTTP, JSON documents and the standard extractor.
    ///
    /// The auth token is read once here; later [`configure`](Self::configure)
    /// calls do not change it.
    pub fn with_defaults(config: SyncConfig) -> Result<Self, SyncError> {
        let mut transport = HttpTransport::new()?.with_probe_url(config.metadata_url.clone());
        if let Some(token) = &config.auth_token {
            transport = transport.with_auth_token(token.clone());
        }
        Self::new(
            config,
            Arc::new(transport),
            Arc::new(JsonDocumentParser),
            Arc::new(StandardExtractor),
        )
    }

    /// Replace the configuration.
    pub fn configure(&self, config: SyncConfig) -> Result<(), SyncError> {
        config.validate()?;
        let mut state = self.inner.state.lock();
        if state.is_busy() {
            return Err(SyncError::Busy);
        }
        let mut current = self.inner.config.write();
        if current.state_path() != config.state_path() {
            state.persisted = SyncState::load(&config.state_path());
        }
        *current = config;
        tracing::debug!("configuration replaced");
        Ok(())
    }

    /// Start a sync, or join the one already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn perform_sync(&self) -> Result<SyncHandle, SyncError> {
        let mut state = self.inner.state.lock();
        if let Some(attempt) = &state.attempt {
            tracing::debug!(attempt = attempt.id, "joining in-flight sync");
            return Ok(attempt.handle());
        }
        if state.phase == SyncPhase::Applying {
            return Err(SyncError::Busy);
        }

        let id = self.inner.next_attempt.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(None);
        let attempt = Attempt {
            id,
            cancel: cancel.clone(),
            done: done_rx,
        };
        let handle = attempt.handle();
        state.attempt = Some(attempt);
        state.phase = SyncPhase::FetchingMetadata;
        state.errors.clear();
        state.last_error = None;
        drop(state);

        tracing::info!(attempt = id, "sync started");
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run_attempt(id, cancel, done_tx).await;
        });
        Ok(handle)
    }

    /// Cancel the running attempt or bootstrap unpack.
    ///
    /// Returns false when there was nothing to cancel.
    pub fn cancel_sync(&self) -> bool {
        let state = self.inner.state.lock();
        let mut cancelled = false;
        if let Some(attempt) = &state.attempt {
            tracing::info!(attempt = attempt.id, "cancelling sync");
            attempt.cancel.cancel();
            cancelled = true;
        }
        if let Some(token) = &state.unpack_cancel {
            token.cancel();
            cancelled = true;
        }
        cancelled
    }

    /// Whether a scheduler should start a new attempt now.
    ///
    /// False while an attempt runs, while a downloaded plan waits to be
    /// applied, before the sync interval has elapsed, or when offline.
    pub async fn should_start_scheduled_sync(&self) -> bool {
        let interval = self.inner.config.read().sync_interval();
        {
            let state = self.inner.state.lock();
            if state.is_busy() || state.phase == SyncPhase::AwaitingApply {
                return false;
            }
            if !sync_due(state.persisted.last_success, interval, Utc::now()) {
                return false;
            }
        }
        self.inner.transport.check_connectivity().await
    }

    /// Handle to the running attempt, or a fresh one if a sync is due.
    pub async fn kickoff_scheduled_or_ongoing_sync(&self) -> Option<SyncHandle> {
        if let Some(attempt) = &self.inner.state.lock().attempt {
            return Some(attempt.handle());
        }
        if !self.should_start_scheduled_sync().await {
            return None;
        }
        match self.perform_sync() {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::debug!(err = %err, "scheduled sync not started");
                None
            }
        }
    }

    /// Move the staged plan into the live content root.
    pub async fn apply_changes(&self) -> Result<OperationComplete, SyncError> {
        let plan = {
            let mut state = self.inner.state.lock();
            if state.is_busy() {
                return Err(SyncError::Busy);
            }
            if state.phase != SyncPhase::AwaitingApply {
                return Err(SyncError::NothingToApply);
            }
            let Some(plan) = state.plan.take() else {
                return Err(SyncError::NothingToApply);
            };
            state.phase = SyncPhase::Applying;
            plan
        };
        let config = self.config();
        let downloads_failed = plan.has_failed_downloads();
        let complete = self.inner.apply_plan(&config, plan).await;
        let mut state = self.inner.state.lock();
        match &complete {
            Ok(done) => {
                let status = apply_status(done);
                state.last_status = Some(if downloads_failed {
                    status.worst(SyncStatus::Failed)
                } else {
                    status
                });
            }
            Err(err) => {
                state.phase = SyncPhase::Failed;
                state.last_status = Some(SyncStatus::Failed);
                state.last_error = Some(err.to_string());
            }
        }
        complete
    }

    /// Seed an empty content root from the bootstrap archive.
    ///
    /// Returns whether anything was unpacked. Needs no network.
    pub async fn unpack_contents(&self) -> Result<bool, SyncError> {
        let config = self.config();
        let Some(archive) = config.bootstrap_archive.clone() else {
            return Ok(false);
        };
        if !dir_is_empty(&config.content_root).await {
            tracing::debug!(root = %config.content_root.display(), "content present, no unpack");
            return Ok(false);
        }
        if !tokio::fs::metadata(&archive)
            .await
            .is_ok_and(|m| m.is_file())
        {
            tracing::warn!(archive = %archive.display(), "bootstrap archive missing");
            return Ok(false);
        }

        let cancel = CancellationToken::new();
        {
            let mut state = self.inner.state.lock();
            if state.is_busy() || state.unpack_cancel.is_some() {
                return Err(SyncError::Busy);
            }
            state.unpack_cancel = Some(cancel.clone());
        }

        let result = self.inner.unpack(archive, config.content_root, cancel).await;
        self.inner.state.lock().unpack_cancel = None;
        result.map(|_| true)
    }

    /// Forget the plan and errors and return to idle.
    ///
    /// Staged files stay where they are. Returns false while busy.
    pub fn reset(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.is_busy() {
            return false;
        }
        state.phase = SyncPhase::Idle;
        state.plan = None;
        state.errors.clear();
        state.last_error = None;
        true
    }

    /// Delete every staged file and drop any plan that relied on them.
    pub async fn clean_staging_area(&self) -> Result<(), SyncError> {
        {
            let mut state = self.inner.state.lock();
            if state.is_busy() {
                return Err(SyncError::Busy);
            }
            if state.phase == SyncPhase::AwaitingApply {
                state.phase = SyncPhase::Idle;
                state.plan = None;
            }
        }
        let staging = self.inner.config.read().staging_root.clone();
        clear_staging(staging).await
    }

    pub fn phase(&self) -> SyncPhase {
        self.inner.state.lock().phase
    }

    /// Status of the most recent attempt or apply.
    pub fn last_status(&self) -> Option<SyncStatus> {
        self.inner.state.lock().last_status
    }

    pub fn is_sync_in_progress(&self) -> bool {
        self.inner.state.lock().is_busy()
    }

    /// Whether a downloaded plan is waiting for [`apply_changes`](Self::apply_changes).
    pub fn has_sync_items_to_apply(&self) -> bool {
        let state = self.inner.state.lock();
        state.phase == SyncPhase::AwaitingApply
            && state
                .plan
                .as_ref()
                .is_some_and(SyncPlan::has_items_for_app_to_apply)
    }

    /// The plan of the last attempt, if it has not been applied yet.
    pub fn current_plan(&self) -> Option<SyncPlan> {
        self.inner.state.lock().plan.clone()
    }

    /// Short error messages from the last attempt.
    pub fn download_errors(&self) -> Vec<String> {
        self.inner.state.lock().errors.messages().to_vec()
    }

    pub fn detailed_download_errors(&self) -> Vec<DetailedDownloadError> {
        self.inner.state.lock().errors.detailed().to_vec()
    }

    /// Why the last attempt failed.
    pub fn last_error(&self) -> Option<String> {
        self.inner.state.lock().last_error.clone()
    }

    /// `generated_on` of the last remote snapshot that was applied.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().persisted.last_generated_on
    }

    /// [`last_update`](Self::last_update) formatted for display.
    pub fn last_update_string(&self) -> String {
        match self.last_update() {
            Some(when) => when.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            None => "never".to_string(),
        }
    }

    /// End of the last attempt that downloaded without errors.
    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().persisted.last_success
    }

    /// Whether the last plan reported a directory layout change.
    pub fn structure_changed(&self) -> Option<bool> {
        self.inner
            .state
            .lock()
            .plan
            .as_ref()
            .and_then(SyncPlan::structure_changed)
    }

    pub fn is_category_disabled(&self, name: &str) -> bool {
        self.inner.config.read().is_category_disabled(name)
    }

    /// Toggle a category for the next attempt. Returns false for unknown names.
    pub fn set_category_enabled(&self, name: &str, enabled: bool) -> Result<bool, SyncError> {
        if self.inner.state.lock().is_busy() {
            return Err(SyncError::Busy);
        }
        Ok(self.inner.config.write().set_category_enabled(name, enabled))
    }

    /// A copy of the current configuration.
    pub fn config(&self) -> SyncConfig {
        self.inner.config.read().clone()
    }

    pub fn register_listener(&self, listener: Arc<dyn SyncListener>) -> ListenerId {
        self.inner.events.register(listener)
    }

    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.inner.events.unregister(id)
    }

    /// Shared access to the content root; blocks applying and unpacking.
    pub async fn content_read_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.inner.content_lock.read().await
    }
}

impl State {
    fn is_busy(&self) -> bool {
        self.attempt.is_some() || self.phase == SyncPhase::Applying
    }
}

impl Inner {
    fn set_phase(&self, phase: SyncPhase) {
        self.state.lock().phase = phase;
        tracing::info!(phase = %phase, "sync phase");
    }

    async fn run_attempt(
        self: Arc<Self>,
        id: u64,
        cancel: CancellationToken,
        done: watch::Sender<Option<SyncStatus>>,
    ) {
        let pipeline = tokio::spawn(Arc::clone(&self).pipeline(cancel));
        let result = match pipeline.await {
            Ok(result) => result,
            Err(err) => Err(SyncError::from(err)),
        };

        let status = match &result {
            Ok(status) => *status,
            Err(err) => err.status(),
        };
        {
            let mut state = self.state.lock();
            if let Err(err) = &result {
                state.phase = SyncPhase::Failed;
                state.last_error = Some(err.to_string());
            }
            state.last_status = Some(status);
            state.attempt = None;
        }
        match &result {
            Ok(_) => tracing::info!(attempt = id, status = %status, "sync finished"),
            Err(SyncError::Cancelled) => tracing::info!(attempt = id, "sync cancelled"),
            Err(err) => tracing::error!(attempt = id, status = %status, err = %err, "sync failed"),
        }

        self.events.emit(SyncEvent::SyncCompleted { status });
        done.send_replace(Some(status));
    }

    async fn pipeline(self: Arc<Self>, cancel: CancellationToken) -> Result<SyncStatus, SyncError> {
        let config = self.config.read().clone();

        let full_sync = dir_is_empty(&config.content_root).await;
        self.events.emit(SyncEvent::SyncStarted { full_sync });

        self.check_preconditions(&config).await?;

        let remote = self.fetch_snapshot(&config.metadata_url, &cancel).await?;
        let structure = match &config.structure_url {
            Some(url) if config.structure_sync => Some(self.fetch_snapshot(url, &cancel).await?),
            _ => None,
        };

        self.set_phase(SyncPhase::Planning);
        let mut plan = self.plan(&config, &remote, structure.as_ref()).await?;
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        self.events.emit(SyncEvent::PlanReady {
            additions: plan.additions().len(),
            modifications: plan.modifications().len(),
            removals: plan.removals().len(),
            symlinks: plan.symlinks_to_create().len(),
            downloads: plan.total_items_to_download(),
            bytes: plan.remaining_bytes(),
        });
        if plan.structure_changed() == Some(true) {
            self.events.emit(SyncEvent::StructureChanged);
        }

        self.set_phase(SyncPhase::Downloading);
        let downloaded = self.download_all(&config, &mut plan, &cancel).await;

        // Failed items stay out of the apply; everything that did stage
        // still lands.
        let failure = match downloaded {
            Ok(()) => None,
            Err(err @ SyncError::PartialDownloadFailure { .. }) if !cancel.is_cancelled() => {
                Some(err)
            }
            Err(err) => {
                self.keep_plan(&remote, plan);
                return Err(err);
            }
        };
        let has_changes = !apply_actions(&plan).is_empty();
        if let Some(err) = failure {
            if !has_changes {
                self.keep_plan(&remote, plan);
                return Err(err);
            }
            tracing::warn!(err = %err, "applying the downloads that succeeded");
            self.state.lock().last_error = Some(err.to_string());
        }
        let status = if plan.has_failed_downloads() {
            SyncStatus::Failed
        } else {
            SyncStatus::Ok
        };
        self.keep_plan(&remote, plan);

        if status.is_ok() {
            let persisted = {
                let mut state = self.state.lock();
                state.persisted.last_success = Some(Utc::now());
                if !has_changes {
                    state.persisted.last_generated_on = state.remote_generated_on;
                    state.plan = None;
                }
                state.persisted.clone()
            };
            if let Err(err) = persisted.save(&config.state_path()) {
                tracing::warn!(err = %err, "cannot persist sync state");
            }
        }

        if !has_changes {
            self.set_phase(SyncPhase::Completed);
            return Ok(status);
        }
        self.set_phase(SyncPhase::AwaitingApply);
        if !config.auto_apply {
            return Ok(status);
        }

        let plan = {
            let mut state = self.state.lock();
            state.phase = SyncPhase::Applying;
            state.plan.take()
        };
        let Some(plan) = plan else {
            return Err(SyncError::NothingToApply);
        };
        let complete = self.apply_plan(&config, plan).await?;
        Ok(status.worst(apply_status(&complete)))
    }

    fn keep_plan(&self, remote: &Snapshot, plan: SyncPlan) {
        let mut state = self.state.lock();
        state.remote_generated_on = Some(remote.generated_on());
        state.plan = Some(plan);
    }

    async fn check_preconditions(&self, config: &SyncConfig) -> Result<(), SyncError> {
        if config.auth_required && config.auth_token.as_deref().is_none_or(str::is_empty) {
            return Err(SyncError::AuthorizationFailed {
                message: "no credentials configured".to_string(),
            });
        }
        if !self.transport.check_connectivity().await {
            return Err(SyncError::NetworkUnavailable);
        }
        Ok(())
    }

    async fn fetch_snapshot(&self, url: &str, cancel: &CancellationToken) -> Result<Snapshot, SyncError> {
        let bytes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            fetched = self.transport.fetch_document(url) => fetched?,
        };
        let snapshot = self.parser.parse(&bytes)?;
        tracing::debug!(url, nodes = snapshot.len(), "parsed remote document");
        Ok(snapshot)
    }

    async fn plan(
        &self,
        config: &SyncConfig,
        remote: &Snapshot,
        structure: Option<&Snapshot>,
    ) -> Result<SyncPlan, SyncError> {
        let _read = self.content_lock.read().await;
        let content_root = config.content_root.clone();
        let staging_root = config.staging_root.clone();
        let (local, staged) = tokio::task::spawn_blocking(move || {
            let scanner = LocalScanner::new();
            let local = scanner.scan(&ScanConfig::new(content_root))?;
            let staged = scanner.scan(&staging_scan_config(staging_root))?;
            Ok::<_, ScanError>((local, staged))
        })
        .await??;

        let mut plan =
            compute_sync_plan_with_staged(&local, remote, &config.policy(), Some(&staged));
        if let Some(structure) = structure {
            plan.set_structure_changed(structure_differs(&local, structure));
        }
        Ok(plan)
    }

    /// Run every pending download through the bounded pool.
    ///
    /// This task is the only writer of `plan` and of the error log while
    /// downloads run.
    async fn download_all(
        &self,
        config: &SyncConfig,
        plan: &mut SyncPlan,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let pending = plan.pending_downloads();
        let total = pending.len();
        let bytes_total = pending.iter().map(PlanEntry::size).sum();
        let mut collector = Collector::new(total, bytes_total);
        if total == 0 {
            return Ok(());
        }
        tracing::info!(files = total, bytes = bytes_total, "downloading");

        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_downloads.max(1)));
        let (tx, mut rx) = mpsc::channel::<TaskReport>(OPERATION_CHANNEL_SIZE);
        let mut tasks = JoinSet::new();
        let mut counters: Vec<Arc<TaskProgress>> = Vec::with_capacity(total);

        for entry in pending {
            let request = match download_request(&config.metadata_url, &entry) {
                Ok(request) => request,
                Err(error) => {
                    let report = TaskReport::Failed {
                        path: entry.path.clone(),
                        url: entry.download_url().map(str::to_string),
                        error,
                    };
                    self.record(&mut collector, plan, report);
                    continue;
                }
            };
            let url = Some(request.url.clone());

            let task = DownloadTask::new(request, &config.staging_root, cancel.child_token());
            counters.push(task.progress());
            let transport = Arc::clone(&self.transport);
            let semaphore = Arc::clone(&semaphore);
            let tx = tx.clone();
            tasks.spawn(async move {
                let path = CompactString::from(task.path());
                let permit = semaphore.acquire_owned().await.ok();
                let report = match task.run(transport.as_ref()).await {
                    Ok(outcome) => TaskReport::Finished(outcome),
                    Err(error) => TaskReport::Failed { path, url, error },
                };
                drop(permit);
                let _ = tx.send(report).await;
            });
        }
        drop(tx);

        let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                report = rx.recv() => {
                    let Some(report) = report else {
                        break;
                    };
                    let current = match &report {
                        TaskReport::Finished(outcome) => outcome.path.clone(),
                        TaskReport::Failed { path, .. } => path.clone(),
                    };
                    self.record(&mut collector, plan, report);
                    let bytes = counters.iter().map(|c| c.bytes_transferred()).sum();
                    self.events.emit(collector.progress_event(bytes, Some(current)));
                }
                _ = ticker.tick() => {
                    let bytes = counters.iter().map(|c| c.bytes_transferred()).sum();
                    self.events.emit(collector.progress_event(bytes, None));
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                tracing::error!(err = %err, "download worker died");
            }
        }

        // Workers that died never reported.
        let orphaned: Vec<CompactString> =
            plan.remaining_downloads().map(CompactString::from).collect();
        for path in &orphaned {
            plan.record_download_failure(path);
            self.state.lock().errors.push(DetailedDownloadError {
                path: path.clone(),
                url: None,
                message: "download worker ended without a result".to_string(),
                occurred_at: Utc::now(),
            });
        }

        let failed = collector.failed() + orphaned.len();
        tracing::info!(
            staged = plan.staged().len(),
            failed,
            cancelled = collector.cancelled(),
            "downloads finished"
        );
        if failed > 0 {
            Err(SyncError::PartialDownloadFailure { failed, total })
        } else if cancel.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn record(&self, collector: &mut Collector, plan: &mut SyncPlan, report: TaskReport) {
        if let Some(error) = collector.on_report(plan, report) {
            self.state.lock().errors.push(error);
        }
    }

    /// Apply `plan` under the content write lock, then clear staging.
    ///
    /// Per-item failures are reported in the result and do not stop the run.
    async fn apply_plan(
        &self,
        config: &SyncConfig,
        plan: SyncPlan,
    ) -> Result<OperationComplete, SyncError> {
        let actions = apply_actions(&plan);
        let converged = !plan.has_failed_downloads();
        let total = actions.len();
        tracing::info!(actions = total, "applying staged changes");
        self.events.emit(SyncEvent::ApplyStarted { total });

        let guard = self.content_lock.write().await;
        tokio::fs::create_dir_all(&config.content_root)
            .await
            .map_err(|e| SyncError::io(&config.content_root, e))?;
        let mut rx = start_apply(ApplyRequest {
            content_root: config.content_root.clone(),
            staging_root: config.staging_root.clone(),
            actions,
        });

        let mut complete = None;
        while let Some(result) = rx.recv().await {
            match result {
                ApplyResult::Progress(progress) => {
                    self.events.emit(SyncEvent::ApplyProgress {
                        completed: progress.files_completed,
                        total: progress.files_total,
                    });
                }
                ApplyResult::Complete(done) => complete = Some(done),
            }
        }
        let complete =
            complete.ok_or_else(|| SyncError::Task("apply ended without a result".to_string()))?;

        if let Err(err) = clear_staging(config.staging_root.clone()).await {
            tracing::warn!(err = %err, "cannot clear staging area");
        }
        drop(guard);

        for error in &complete.errors {
            tracing::warn!(path = %error.path.display(), err = %error.message, "apply failed");
        }
        tracing::info!(summary = %complete.summary(), "apply finished");
        self.events.emit(SyncEvent::ApplyCompleted {
            succeeded: complete.succeeded,
            failed: complete.failed,
        });

        let persisted = {
            let mut state = self.state.lock();
            state.phase = SyncPhase::Completed;
            if converged {
                state.persisted.last_generated_on = state.remote_generated_on;
            }
            if let Some(first) = complete.errors.first() {
                state.last_error = Some(first.to_string());
            }
            state.persisted.clone()
        };
        if let Err(err) = persisted.save(&config.state_path()) {
            tracing::warn!(err = %err, "cannot persist sync state");
        }
        Ok(complete)
    }

    async fn unpack(
        self: &Arc<Self>,
        archive: PathBuf,
        dest: PathBuf,
        cancel: CancellationToken,
    ) -> Result<(), SyncError> {
        tracing::info!(archive = %archive.display(), "unpacking bootstrap content");
        self.events.emit(SyncEvent::UnpackDetected {
            archive: archive.clone(),
        });

        let guard = self.content_lock.write().await;
        let inner = Arc::clone(self);
        let extracted = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dest).map_err(|e| UnpackError::io(&dest, e))?;
            let entries = inner.extractor.entry_count(&archive)?;
            inner.events.emit(SyncEvent::UnpackTotal { entries });
            let events = &inner.events;
            inner.extractor.extract(&archive, &dest, entries, &cancel, &|progress| {
                events.emit(SyncEvent::UnpackProgress {
                    done: progress.entries_done,
                    total: progress.entries_total,
                });
            })
        })
        .await?;
        drop(guard);

        self.events.emit(SyncEvent::UnpackCompleted {
            success: extracted.is_ok(),
        });
        let files = extracted?;
        tracing::info!(files = files.len(), "bootstrap content unpacked");
        Ok(())
    }
}

fn apply_status(complete: &OperationComplete) -> SyncStatus {
    if complete.is_success() {
        SyncStatus::Ok
    } else {
        SyncStatus::Failed
    }
}

/// Actions in application order: removals, directories, files, symlinks.
fn apply_actions(plan: &SyncPlan) -> Vec<ApplyAction> {
    let mut actions = Vec::with_capacity(plan.total_items_to_apply() + plan.total_symlinks_to_apply());
    actions.extend(plan.removals().map(|e| ApplyAction::remove(e.path.clone())));
    actions.extend(
        plan.directories_to_create()
            .map(|e| ApplyAction::create_directory(e.path.clone())),
    );
    actions.extend(
        plan.additions()
            .chain(plan.modifications())
            .filter(|e| plan.is_staged(&e.path))
            .map(|e| ApplyAction::move_staged(e.path.clone())),
    );
    actions.extend(plan.symlinks_to_create().filter_map(|e| {
        e.symlink_target()
            .map(|target| ApplyAction::create_symlink(e.path.clone(), target))
    }));
    actions
}

fn download_request(base_url: &str, entry: &PlanEntry) -> Result<DownloadRequest, DownloadError> {
    let href = entry.download_url().ok_or_else(|| DownloadError::MissingUrl {
        path: entry.path.to_string(),
    })?;
    Ok(DownloadRequest {
        path: entry.path.clone(),
        url: resolve_url(base_url, href)?,
        expected_size: entry.expected_size(),
        modified: entry.file().and_then(|meta| meta.modified),
    })
}

/// Scan settings for the staging area: only finished files count.
fn staging_scan_config(root: PathBuf) -> ScanConfig {
    ScanConfig {
        ignore_patterns: vec![
            format!("*{PART_SUFFIX}"),
            STATE_FILE_NAME.to_string(),
            format!("{STATE_FILE_NAME}.tmp"),
        ],
        ..ScanConfig::new(root)
    }
}

async fn clear_staging(staging: PathBuf) -> Result<(), SyncError> {
    tokio::task::spawn_blocking(move || {
        clear_directory(&staging, &[STATE_FILE_NAME]).map_err(|e| SyncError::io(&staging, e))
    })
    .await?
}

/// Missing directories count as empty.
async fn dir_is_empty(path: &Path) -> bool {
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use contentsync_core::{FileMeta, SnapshotBuilder, SyncPolicy, compute_sync_plan};

    #[test]
    fn test_apply_order() {
        let when = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut local = SnapshotBuilder::new(when);
        local.add_file_at("old.txt", FileMeta::new(1)).unwrap();
        let mut remote = SnapshotBuilder::new(when);
        remote.add_symlink_at("latest", "docs/a.txt").unwrap();
        remote
            .add_file_at("docs/a.txt", FileMeta::new(3).with_download_url("/a"))
            .unwrap();
        let mut plan = compute_sync_plan(&local.build(), &remote.build(), &SyncPolicy::new());
        plan.mark_staged("docs/a.txt");

        let actions = apply_actions(&plan);
        assert_eq!(
            actions,
            vec![
                ApplyAction::remove("old.txt"),
                ApplyAction::create_directory("docs"),
                ApplyAction::move_staged("docs/a.txt"),
                ApplyAction::create_symlink("latest", "docs/a.txt"),
            ]
        );
    }

    #[test]
    fn test_unstaged_files_are_not_moved() {
        let when = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let local = SnapshotBuilder::new(when).build();
        let mut remote = SnapshotBuilder::new(when);
        remote
            .add_file_at("a.txt", FileMeta::new(3).with_download_url("/a"))
            .unwrap();
        let plan = compute_sync_plan(&local, &remote.build(), &SyncPolicy::new());
        assert!(apply_actions(&plan).is_empty());
    }

    #[test]
    fn test_download_request_resolves_relative_url() {
        let entry = PlanEntry {
            path: "dir/b.txt".into(),
            name: "b.txt".into(),
            kind: contentsync_core::NodeKind::File(
                FileMeta::new(5).with_download_url("files/b.txt"),
            ),
        };
        let request = download_request("https://cdn.test/content/meta.json", &entry).unwrap();
        assert_eq!(request.url, "https://cdn.test/content/files/b.txt");
        assert_eq!(request.expected_size, Some(5));

        let missing = PlanEntry {
            kind: contentsync_core::NodeKind::File(FileMeta::new(5)),
            ..entry
        };
        assert!(matches!(
            download_request("https://cdn.test/", &missing),
            Err(DownloadError::MissingUrl { .. })
        ));
    }

    #[test]
    fn test_staging_scan_ignores_part_files() {
        let config = staging_scan_config(PathBuf::from("/staging"));
        let matcher = config.ignore_matcher();
        assert!(matcher.matches("dir/a.txt.part", "a.txt.part"));
        assert!(matcher.matches(STATE_FILE_NAME, STATE_FILE_NAME));
        assert!(!matcher.matches("dir/a.txt", "a.txt"));
    }
}
