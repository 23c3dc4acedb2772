use crate::core::config::Config;
use crate::core::events::{EventKind, FileRef, UploadEvent};
use crate::db::{self, Selection};
use crate::services::events::EventBus;
use crate::services::remote::UploadApi;
use crate::services::reporter::Reporter;
use crate::services::sources::{FileSource, resolve_all};
use crate::services::uploader::{UploadQueue, UploadWorker, WorkerOutcome, WorkerSettings};
use crate::utils::lock_mutex;
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Retry files that failed in earlier runs. Off with `--skip-errors`.
    pub include_errors: bool,
    pub show_progress: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            include_errors: true,
            show_progress: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub attempt_id: i64,
    pub files_count: usize,
    pub successful: i64,
    pub failed: i64,
    pub cancelled: bool,
    pub report_path: Option<PathBuf>,
}

pub struct Coordinator {
    conn: Arc<Mutex<Connection>>,
    config: Arc<Config>,
    api: Arc<dyn UploadApi>,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        config: Arc<Config>,
        api: Arc<dyn UploadApi>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            conn,
            config,
            api,
            cancel,
        }
    }

    /// Enrolls everything the source knows about and uploads the selected files as one attempt.
    pub async fn run(&self, source: &dyn FileSource, options: RunOptions) -> Result<RunSummary> {
        let tag = source.tag();

        source.check_access().await?;
        let discovered = source.discover().await?;
        let enrolled = {
            let conn = lock_mutex(&self.conn)?;
            let tx = conn.unchecked_transaction()?;
            let mut enrolled = 0;
            for file in &discovered {
                if db::enroll_file(&tx, tag, &file.path, file.size)? {
                    enrolled += 1;
                }
            }
            tx.commit().context("commit enrolled files")?;
            enrolled
        };
        info!(
            "Discovered {} {} files, {} newly enrolled",
            discovered.len(),
            tag,
            enrolled
        );

        let pending = {
            let conn = lock_mutex(&self.conn)?;
            db::list_pending_files(&conn, tag, options.include_errors)?
        };
        let resolved = resolve_all(source, pending.iter().map(|f| f.path.as_str())).await?;
        let files: Vec<FileRef> = pending
            .iter()
            .zip(resolved)
            .map(|(row, (path, url))| FileRef::new(path, url, row.file_size))
            .collect();

        let attempt_id = {
            let conn = lock_mutex(&self.conn)?;
            let attempt_id = db::start_attempt(&conn, tag, files.len())?;
            db::mark_files_for_attempt(
                &conn,
                attempt_id,
                Selection::from_include_errors(options.include_errors),
            )?;
            attempt_id
        };

        let progress = if options.show_progress {
            upload_progress_bar(files.len() as u64)
        } else {
            ProgressBar::hidden()
        };

        let outcome = self.upload(tag, attempt_id, files, progress.clone()).await;
        if outcome.cancelled {
            progress.abandon();
        } else {
            progress.finish();
        }

        let result = {
            let conn = lock_mutex(&self.conn)?;
            db::finish_attempt(&conn, attempt_id, outcome.cancelled)?
        };

        let reports_dir = Path::new(&self.config.logs_dir);
        let report_path = match Reporter::generate_report(reports_dir, tag, &result) {
            Ok(path) => Some(path),
            Err(e) => {
                error!("Failed to write report for attempt {}: {:#}", attempt_id, e);
                None
            }
        };

        Ok(RunSummary {
            attempt_id,
            files_count: result.files.len(),
            successful: result.successful,
            failed: result.failed,
            cancelled: outcome.cancelled,
            report_path,
        })
    }

    async fn upload(
        &self,
        tag: &str,
        attempt_id: i64,
        files: Vec<FileRef>,
        progress: ProgressBar,
    ) -> WorkerOutcome {
        let mut bus = EventBus::new();
        bus.on(
            &EventKind::TERMINAL,
            persist_outcome(self.conn.clone(), tag.to_string(), attempt_id),
        )
        .on(&EventKind::TERMINAL, move |_| progress.inc(1))
        .on(&EventKind::ALL, log_event);
        let bus = bus.start();

        let worker = UploadWorker::new(
            self.api.clone(),
            bus.publisher(),
            WorkerSettings::from_config(&self.config),
            self.cancel.clone(),
        );

        let (queue, receiver) = UploadQueue::channel();
        for file in files {
            queue.push(file);
        }
        queue.close();

        let outcome = worker.run(receiver).await;
        drop(worker);
        bus.shutdown().await;
        outcome
    }
}

fn upload_progress_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    match ProgressStyle::with_template(
        "{msg} [{elapsed_precise}] {wide_bar:.cyan/blue} {pos}/{len} files ({eta})",
    ) {
        Ok(style) => bar.set_style(style.progress_chars("=>-")),
        Err(e) => warn!("Invalid progress template: {}", e),
    }
    bar.set_message("Upload progress");
    bar
}

/// Subscriber writing each terminal event to the files table.
fn persist_outcome(
    conn: Arc<Mutex<Connection>>,
    source: String,
    attempt_id: i64,
) -> impl Fn(&UploadEvent) + Send + Sync + 'static {
    move |event| {
        let result = lock_mutex(&conn).and_then(|conn| match event {
            UploadEvent::DownloadComplete { file, remote_id } => {
                db::record_success(&conn, &source, &file.path, attempt_id, remote_id)
            }
            UploadEvent::SubmitFailed { file, error }
            | UploadEvent::DownloadFailed { file, error } => {
                db::record_failure(&conn, &source, &file.path, error)
            }
            UploadEvent::SubmitAccepted { .. } => Ok(()),
        });
        if let Err(e) = result {
            error!(
                "Failed to persist {} for {}: {:#}",
                event.kind(),
                event.file().path,
                e
            );
        }
    }
}

fn log_event(event: &UploadEvent) {
    match event {
        UploadEvent::SubmitAccepted { file, token } => {
            debug!("{}: {} (token {})", event.kind(), file.path, token)
        }
        UploadEvent::DownloadComplete { file, remote_id } => {
            info!("{}: {} -> {}", event.kind(), file.path, remote_id)
        }
        UploadEvent::SubmitFailed { file, error } | UploadEvent::DownloadFailed { file, error } => {
            warn!("{}: {} ({})", event.kind(), file.path, error)
        }
    }
}
