//! Batch review of externally supplied files.
//!
//! A review job compares a set of already-downloaded files against the
//! store, first against the merged view (what is currently patched in) and
//! then against the pristine lower view. Jobs run one at a time on a
//! dedicated worker thread that owns the job record; everybody else only
//! ever sees immutable [`JobStatus`] snapshots.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{IoContext, OverlayError, Result};
use crate::patch::{Candidate, DiffBase, DiffEngine};
use crate::util;

/// Jobs that may wait behind the running one.
pub const DEFAULT_QUEUE_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReviewFile {
    /// Path relative to the package tree, e.g. `nixos/modules/misc/locate.nix`.
    pub filename: PathBuf,
    /// Where the candidate content was saved.
    pub local_path: PathBuf,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub patch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReviewRequest {
    /// Where the files came from, e.g. a pull request URL.
    pub source: String,
    #[serde(default)]
    pub files: Vec<ReviewFile>,
}

impl ReviewRequest {
    /// Read a TOML manifest. Relative `local_path`s are taken relative to
    /// the manifest's directory.
    pub fn load(manifest: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(manifest).at(manifest)?;
        let mut request: Self = toml::from_str(&content).map_err(|e| OverlayError::Parse {
            path: manifest.to_path_buf(),
            message: e.to_string(),
        })?;
        let dir = manifest.parent().unwrap_or_else(|| Path::new("."));
        for file in &mut request.files {
            if file.local_path.is_relative() {
                file.local_path = dir.join(&file.local_path);
            }
        }
        Ok(request)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Comparison {
    /// The store side of the comparison.
    pub text: String,
    pub diff: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileReport {
    pub filename: PathBuf,
    pub status: Option<String>,
    pub patch: Option<String>,
    pub local_path: PathBuf,
    pub file_text: Option<String>,
    pub upper: Option<Comparison>,
    pub lower: Option<Comparison>,
    pub errors: Vec<String>,
}

impl FileReport {
    fn new(file: &ReviewFile) -> Self {
        Self {
            filename: file.filename.clone(),
            status: file.status.clone(),
            patch: file.patch.clone(),
            local_path: file.local_path.clone(),
            file_text: None,
            upper: None,
            lower: None,
            errors: Vec::new(),
        }
    }
}

/// Point-in-time view of a job. Counters only grow, flags only flip to
/// `true` and timestamps are set once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub id: Ulid,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub files_count: usize,
    pub files_downloaded: bool,
    pub files_compared: bool,
    pub compare_upper_count: usize,
    pub compare_lower_count: usize,
    pub ready_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub files: Vec<FileReport>,
}

/// [`JobStatus`] without the per-file payload, for cheap polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobProgress {
    pub id: Ulid,
    pub started_at: DateTime<Utc>,
    pub files_count: usize,
    pub files_downloaded: bool,
    pub files_compared: bool,
    pub compare_upper_count: usize,
    pub compare_lower_count: usize,
    pub ready_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl JobStatus {
    fn new(id: Ulid, request: &ReviewRequest) -> Self {
        Self {
            id,
            source: request.source.clone(),
            started_at: Utc::now(),
            files_count: request.files.len(),
            files_downloaded: false,
            files_compared: false,
            compare_upper_count: 0,
            compare_lower_count: 0,
            ready_at: None,
            error: None,
            files: Vec::new(),
        }
    }

    pub const fn is_finished(&self) -> bool {
        self.ready_at.is_some() || self.error.is_some()
    }

    pub fn progress(&self) -> JobProgress {
        JobProgress {
            id: self.id,
            started_at: self.started_at,
            files_count: self.files_count,
            files_downloaded: self.files_downloaded,
            files_compared: self.files_compared,
            compare_upper_count: self.compare_upper_count,
            compare_lower_count: self.compare_lower_count,
            ready_at: self.ready_at,
            error: self.error.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| OverlayError::Job(e.to_string()))
    }
}

struct Job {
    record: JobStatus,
    request: ReviewRequest,
}

#[derive(Default)]
struct Board {
    statuses: Mutex<HashMap<Ulid, Arc<JobStatus>>>,
    updated: Condvar,
}

impl Board {
    fn publish(&self, status: &JobStatus) {
        let mut statuses = self.statuses.lock().unwrap_or_else(PoisonError::into_inner);
        statuses.insert(status.id, Arc::new(status.clone()));
        self.updated.notify_all();
    }
}

pub struct JobQueue {
    sender: Option<SyncSender<Job>>,
    board: Arc<Board>,
    worker: Option<JoinHandle<()>>,
}

impl JobQueue {
    /// Start the worker. At most `depth` jobs wait behind the running one.
    pub fn spawn(engine: Arc<DiffEngine>, depth: usize) -> Result<Self> {
        let (sender, receiver) = std::sync::mpsc::sync_channel(depth);
        let board = Arc::new(Board::default());
        let worker_board = Arc::clone(&board);
        let worker = std::thread::Builder::new()
            .name("review-worker".to_owned())
            .spawn(move || worker_loop(&engine, &receiver, &worker_board))
            .map_err(|e| OverlayError::Job(format!("failed to start worker: {e}")))?;
        Ok(Self {
            sender: Some(sender),
            board,
            worker: Some(worker),
        })
    }

    /// Queue a review and return its id without waiting for it.
    pub fn submit(&self, request: ReviewRequest) -> Result<Ulid> {
        let id = Ulid::new();
        let record = JobStatus::new(id, &request);
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| OverlayError::Job("queue is shut down".to_owned()))?;

        self.board.publish(&record);
        let sent = sender.try_send(Job { record, request });
        if let Err(e) = sent {
            self.board
                .statuses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            return Err(OverlayError::Job(match e {
                TrySendError::Full(_) => "queue is full".to_owned(),
                TrySendError::Disconnected(_) => "worker has stopped".to_owned(),
            }));
        }
        tracing::info!("queued review job {id}");
        Ok(id)
    }

    /// Latest snapshot of a job.
    pub fn status(&self, id: Ulid) -> Option<Arc<JobStatus>> {
        self.board
            .statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Block until the job has finished, successfully or not.
    pub fn wait(&self, id: Ulid) -> Option<Arc<JobStatus>> {
        let statuses = self.board.statuses.lock().unwrap_or_else(PoisonError::into_inner);
        let statuses = self
            .board
            .updated
            .wait_while(statuses, |s| s.get(&id).is_some_and(|job| !job.is_finished()))
            .unwrap_or_else(PoisonError::into_inner);
        statuses.get(&id).cloned()
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("review worker panicked");
            }
        }
    }
}

fn worker_loop(engine: &DiffEngine, receiver: &Receiver<Job>, board: &Board) {
    while let Ok(Job { mut record, request }) = receiver.recv() {
        let id = record.id;
        let span = tracing::info_span!("review", %id);
        let _enter = span.enter();
        run_job(engine, &request, &mut record, &mut |status: &JobStatus| board.publish(status));
        match &record.error {
            Some(error) => tracing::error!("review job failed: {error}"),
            None => tracing::debug!("review job finished: {:?}", record.progress()),
        }
    }
    tracing::debug!("review worker exiting");
}

/// Run one review to completion, publishing after every step.
pub fn run_job(
    engine: &DiffEngine,
    request: &ReviewRequest,
    record: &mut JobStatus,
    publish: &mut dyn FnMut(&JobStatus),
) {
    for file in &request.files {
        let mut report = FileReport::new(file);
        match util::read_text(&file.local_path) {
            Ok(text) => report.file_text = Some(text),
            Err(e) => report.errors.push(e.to_string()),
        }
        record.files.push(report);
    }
    record.files_downloaded = true;
    publish(record);

    if let Err(e) = compare_all(engine, request, record, publish) {
        record.error = Some(e.to_string());
        publish(record);
        return;
    }

    record.files_compared = true;
    record.ready_at = Some(Utc::now());
    tracing::info!(
        "review ready after {}s",
        (Utc::now() - record.started_at).num_seconds()
    );
    publish(record);
}

fn compare_all(
    engine: &DiffEngine,
    request: &ReviewRequest,
    record: &mut JobStatus,
    publish: &mut dyn FnMut(&JobStatus),
) -> Result<()> {
    let manager = engine.manager();

    // merged view first, so anything patched earlier shows up
    manager.start()?;
    for base in [DiffBase::Merged, DiffBase::Lower] {
        if base == DiffBase::Lower {
            manager.stop()?;
        }
        for (idx, file) in request.files.iter().enumerate() {
            if record.files.get(idx).is_none_or(|report| report.file_text.is_none()) {
                continue;
            }
            let candidate = Candidate::new(&file.local_path)
                .with_label(format!("{} in {}", file.filename.display(), request.source));
            let compared = engine.diff_against(&file.filename, &candidate, base);
            let Some(report) = record.files.get_mut(idx) else {
                continue;
            };
            match compared {
                Ok(outcome) => {
                    let comparison = Comparison {
                        text: outcome.before_text,
                        diff: outcome.unified_diff,
                    };
                    match base {
                        DiffBase::Merged => {
                            report.upper = Some(comparison);
                            record.compare_upper_count += 1;
                        }
                        DiffBase::Lower => {
                            report.lower = Some(comparison);
                            record.compare_lower_count += 1;
                        }
                    }
                }
                Err(e) => report.errors.push(e.to_string()),
            }
            publish(record);
        }
    }
    // the overlay is normally on
    manager.start()?;
    Ok(())
}
