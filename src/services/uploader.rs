use crate::core::config::Config;
use crate::core::events::{FileRef, UploadEvent};
use crate::services::events::EventPublisher;
use crate::services::remote::{PollError, PollStatus, SubmitError, UploadApi};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const TIMEOUT_ERROR: &str = "Status check timeout.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Submit,
    Download,
}

/// Lifecycle of one file inside a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileState {
    Pending,
    Submitting,
    AwaitingCompletion { token: String, submitted_at: Instant },
    Complete { remote_id: String },
    Failed { stage: FailureStage, error: String },
}

impl FileState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FileState::Complete { .. } | FileState::Failed { .. })
    }

    /// Submitting -> AwaitingCompletion | Failed
    pub fn after_submit(result: Result<String, SubmitError>, now: Instant) -> FileState {
        match result {
            Ok(token) => FileState::AwaitingCompletion {
                token,
                submitted_at: now,
            },
            Err(e) => FileState::Failed {
                stage: FailureStage::Submit,
                error: e.to_string(),
            },
        }
    }

    /// AwaitingCompletion -> AwaitingCompletion | Complete | Failed
    pub fn after_poll(
        result: Result<PollStatus, PollError>,
        token: String,
        submitted_at: Instant,
    ) -> FileState {
        match result {
            Ok(PollStatus::Pending) => FileState::AwaitingCompletion {
                token,
                submitted_at,
            },
            Ok(PollStatus::Complete { remote_id }) => FileState::Complete { remote_id },
            Ok(PollStatus::Failed { reason }) => FileState::Failed {
                stage: FailureStage::Download,
                error: reason,
            },
            Err(e) => FileState::Failed {
                stage: FailureStage::Download,
                error: e.to_string(),
            },
        }
    }

    pub fn timed_out() -> FileState {
        FileState::Failed {
            stage: FailureStage::Download,
            error: TIMEOUT_ERROR.to_string(),
        }
    }

    /// The event published when a file enters this state, if any.
    pub fn event_for(&self, file: &FileRef) -> Option<UploadEvent> {
        match self {
            FileState::AwaitingCompletion { token, .. } => Some(UploadEvent::SubmitAccepted {
                file: file.clone(),
                token: token.clone(),
            }),
            FileState::Complete { remote_id } => Some(UploadEvent::DownloadComplete {
                file: file.clone(),
                remote_id: remote_id.clone(),
            }),
            FileState::Failed {
                stage: FailureStage::Submit,
                error,
            } => Some(UploadEvent::SubmitFailed {
                file: file.clone(),
                error: error.clone(),
            }),
            FileState::Failed {
                stage: FailureStage::Download,
                error,
            } => Some(UploadEvent::DownloadFailed {
                file: file.clone(),
                error: error.clone(),
            }),
            FileState::Pending | FileState::Submitting => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_concurrent_uploads: usize,
    pub max_concurrent_checks: Option<usize>,
    pub status_check_interval: Duration,
    pub upload_timeout: Duration,
    /// How long in-flight files may keep running after cancellation before they are aborted.
    pub shutdown_grace: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent_uploads: config.max_concurrent_uploads.max(1),
            max_concurrent_checks: config.max_concurrent_checks.filter(|n| *n > 0),
            status_check_interval: config.status_check_interval(),
            upload_timeout: config.upload_timeout(),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// FIFO of files waiting for an upload permit.
pub struct UploadQueue {
    tx: mpsc::UnboundedSender<FileRef>,
}

pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<FileRef>,
}

impl UploadQueue {
    pub fn channel() -> (UploadQueue, QueueReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (UploadQueue { tx }, QueueReceiver { rx })
    }

    pub fn push(&self, file: FileRef) -> bool {
        self.tx.send(file).is_ok()
    }

    /// Marks the end of input. The worker drains and returns once the queue is empty.
    pub fn close(self) {}
}

impl QueueReceiver {
    async fn next(&mut self) -> Option<FileRef> {
        self.rx.recv().await
    }

    fn discard_remaining(&mut self) -> usize {
        self.rx.close();
        let mut count = 0;
        while self.rx.try_recv().is_ok() {
            count += 1;
        }
        count
    }
}

/// Counts of how files left the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerOutcome {
    pub uploaded: usize,
    pub failed: usize,
    /// Started but stopped by cancellation before reaching a terminal state.
    pub interrupted: usize,
    /// Still queued when the run was cancelled.
    pub not_started: usize,
    pub cancelled: bool,
}

impl WorkerOutcome {
    fn record(&mut self, result: Result<Option<FileState>, JoinError>) {
        match result {
            Ok(Some(FileState::Complete { .. })) => self.uploaded += 1,
            Ok(Some(FileState::Failed { .. })) => self.failed += 1,
            Ok(_) => self.interrupted += 1,
            Err(e) if e.is_cancelled() => self.interrupted += 1,
            Err(e) => {
                error!("Upload task panicked: {}", e);
                self.interrupted += 1;
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkerStats {
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl WorkerStats {
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlightGuard(Arc<WorkerStats>);

impl InFlightGuard {
    fn enter(stats: Arc<WorkerStats>) -> Self {
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

struct FileTask {
    api: Arc<dyn UploadApi>,
    events: EventPublisher,
    check_permits: Option<Arc<Semaphore>>,
    status_check_interval: Duration,
    upload_timeout: Duration,
    cancel: CancellationToken,
}

impl FileTask {
    /// Drives one file to a terminal state. Returns `None` if cancelled first.
    async fn drive(&self, file: &FileRef) -> Option<FileState> {
        let mut state = FileState::Pending;
        loop {
            state = match state {
                FileState::Pending => {
                    if self.cancel.is_cancelled() {
                        return None;
                    }
                    FileState::Submitting
                }
                FileState::Submitting => {
                    let result = self.submit(&file.url).await;
                    let next = FileState::after_submit(result, Instant::now());
                    self.publish(&next, file);
                    next
                }
                FileState::AwaitingCompletion {
                    token,
                    submitted_at,
                } => {
                    if self.cancel.is_cancelled() {
                        return None;
                    }
                    let next = self.check_status(token, submitted_at).await;
                    if let FileState::AwaitingCompletion { .. } = next {
                        tokio::select! {
                            _ = tokio::time::sleep(self.status_check_interval) => {}
                            _ = self.cancel.cancelled() => return None,
                        }
                    } else {
                        self.publish(&next, file);
                    }
                    next
                }
                terminal => return Some(terminal),
            };
        }
    }

    async fn submit(&self, url: &str) -> Result<String, SubmitError> {
        match tokio::time::timeout(self.upload_timeout, self.api.submit(url)).await {
            Ok(result) => result,
            Err(_) => Err(SubmitError::Transport(format!(
                "no response within {:?}",
                self.upload_timeout
            ))),
        }
    }

    /// Waiting for a status-check permit counts against the timeout as well.
    async fn check_status(&self, token: String, submitted_at: Instant) -> FileState {
        let deadline = submitted_at + self.upload_timeout;
        if Instant::now() >= deadline {
            return FileState::timed_out();
        }

        let checked = tokio::time::timeout_at(deadline, async {
            let _permit = match &self.check_permits {
                Some(permits) => Some(permits.clone().acquire_owned().await.map_err(|_| {
                    PollError::Transport("status check limiter closed".to_string())
                })?),
                None => None,
            };
            self.api.poll(&token).await
        })
        .await;

        match checked {
            Ok(result) => FileState::after_poll(result, token, submitted_at),
            Err(_) => FileState::timed_out(),
        }
    }

    fn publish(&self, state: &FileState, file: &FileRef) {
        if let Some(event) = state.event_for(file) {
            self.events.publish(event);
        }
    }
}

/// Consumes an [`UploadQueue`] and drives every file through submit-then-poll.
pub struct UploadWorker {
    api: Arc<dyn UploadApi>,
    events: EventPublisher,
    settings: WorkerSettings,
    upload_permits: Arc<Semaphore>,
    check_permits: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
    stats: Arc<WorkerStats>,
}

impl UploadWorker {
    pub fn new(
        api: Arc<dyn UploadApi>,
        events: EventPublisher,
        settings: WorkerSettings,
        cancel: CancellationToken,
    ) -> Self {
        let upload_permits = Arc::new(Semaphore::new(settings.max_concurrent_uploads.max(1)));
        let check_permits = settings
            .max_concurrent_checks
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        Self {
            api,
            events,
            settings,
            upload_permits,
            check_permits,
            cancel,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    fn file_task(&self) -> Arc<FileTask> {
        Arc::new(FileTask {
            api: self.api.clone(),
            events: self.events.clone(),
            check_permits: self.check_permits.clone(),
            status_check_interval: self.settings.status_check_interval,
            upload_timeout: self.settings.upload_timeout,
            cancel: self.cancel.clone(),
        })
    }

    /// Runs until the queue is closed and drained, or until cancellation.
    pub async fn run(&self, mut queue: QueueReceiver) -> WorkerOutcome {
        let task = self.file_task();
        let mut tasks: JoinSet<Option<FileState>> = JoinSet::new();
        let mut outcome = WorkerOutcome::default();

        loop {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    outcome.cancelled = true;
                    break;
                }
                permit = self.upload_permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let file = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    outcome.cancelled = true;
                    break;
                }
                file = queue.next() => match file {
                    Some(file) => file,
                    None => break,
                },
            };

            debug!("Dequeued {}", file.path);
            let task = task.clone();
            let guard = InFlightGuard::enter(self.stats.clone());
            tasks.spawn(async move {
                let _permit = permit;
                let _guard = guard;
                task.drive(&file).await
            });

            while let Some(result) = tasks.try_join_next() {
                outcome.record(result);
            }
        }

        self.drain(&mut tasks, &mut outcome).await;

        if outcome.cancelled {
            outcome.not_started = queue.discard_remaining();
            warn!(
                "Upload worker cancelled: {} interrupted, {} not started",
                outcome.interrupted, outcome.not_started
            );
        } else {
            info!(
                "Upload queue drained: {} uploaded, {} failed",
                outcome.uploaded, outcome.failed
            );
        }
        outcome
    }

    async fn drain(&self, tasks: &mut JoinSet<Option<FileState>>, outcome: &mut WorkerOutcome) {
        while !outcome.cancelled {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => outcome.cancelled = true,
                next = tasks.join_next() => match next {
                    Some(result) => outcome.record(result),
                    None => return,
                },
            }
        }

        let grace = self.settings.shutdown_grace;
        let finished = tokio::time::timeout(grace, async {
            while let Some(result) = tasks.join_next().await {
                outcome.record(result);
            }
        })
        .await;

        if finished.is_err() {
            warn!(
                "{} upload tasks still running after {:?}, aborting",
                tasks.len(),
                grace
            );
            tasks.abort_all();
            while let Some(result) = tasks.join_next().await {
                outcome.record(result);
            }
        }
    }
}
