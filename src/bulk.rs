//! BulkLoadEngine: line-per-query file loads with bounded parallelism
//!
//! Every non-blank line of a query file is one query. A file is windowed with
//! skip/take, then a fixed pool of workers pulls queries off a shared cursor
//! and runs them against the executor bound by the `ConnectionManager`.
//!
//! Completed queries (success or failure) go through a bounded channel to a
//! single reporter task, which writes one line per item to the sink and
//! collects failures for the failure artifact. Workers wait for channel
//! capacity, so a slow sink throttles the load instead of growing memory.
//!
//! Each query runs on its own task, so a panic inside an executor turns into
//! a failure of that one query.
//!
//! Cancellation stops dispatch and abandons in-flight calls. Results already
//! produced still drain through the reporter before the call returns.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionManager;
use crate::error::{GizmoError, GizmoResult};
use crate::executor::{ExecutorKind, QueryExecutor};
use crate::report::ProgressSink;
use crate::result::{format_hms, BulkContext, BulkResult, ErrorResult, ResultAggregate};

/// Prefix of script-console lines, stripped before execution
const CONSOLE_PREFIX: &str = ":>";

/// Bulk load settings
#[derive(Debug, Clone)]
pub struct BulkOptions {
    /// Lines dropped from the start of each file
    pub skip: usize,
    /// Lines kept after the skip; 0 keeps everything
    pub take: usize,
    /// Worker count per file
    pub parallelism: usize,
    /// Failure artifact, rewritten on every run. `None` disables it.
    pub failure_path: Option<PathBuf>,
    /// Capacity of the progress channel
    pub channel_capacity: usize,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            skip: 0,
            take: 0,
            parallelism: 8,
            failure_path: Some(PathBuf::from("failures.txt")),
            channel_capacity: 1024,
        }
    }
}

/// Totals of a finished (or cancelled) run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkSummary {
    /// Queries scheduled across all files
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Retries consumed across all reported queries
    pub retries: u64,
    pub elapsed: Duration,
    pub cancelled: bool,
}

/// One query taken from a file, with its 1-based line number
#[derive(Debug, Clone, PartialEq)]
pub struct QueryLine {
    pub line_number: usize,
    pub query: String,
}

/// What the workers hand to the reporter
#[derive(Debug)]
pub enum BulkItem {
    Success(BulkResult),
    Failure(ErrorResult),
    Message(String),
}

/// Trim a line and drop the console prefix. Blank lines yield `None`.
pub fn normalize_query(line: &str) -> Option<String> {
    let line = line.trim();
    let line = line.strip_prefix(CONSOLE_PREFIX).map(str::trim).unwrap_or(line);
    if line.is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}

/// Apply skip then take (0 = unbounded) and keep non-blank queries.
/// Line numbers stay relative to the whole file.
pub fn window_lines<S: AsRef<str>>(lines: &[S], skip: usize, take: usize) -> Vec<QueryLine> {
    let take = if take == 0 { usize::MAX } else { take };
    lines
        .iter()
        .enumerate()
        .skip(skip)
        .take(take)
        .filter_map(|(i, line)| {
            normalize_query(line.as_ref()).map(|query| QueryLine {
                line_number: i + 1,
                query,
            })
        })
        .collect()
}

/// Read a manifest and resolve its entries against the manifest's directory.
/// Returns the existing files and the entries that could not be found.
pub async fn read_manifest(manifest: &Path) -> GizmoResult<(Vec<PathBuf>, Vec<PathBuf>)> {
    let contents = tokio::fs::read_to_string(manifest).await?;
    let base = manifest.parent().unwrap_or_else(|| Path::new("."));

    let mut found = Vec::new();
    let mut missing = Vec::new();
    for entry in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let path = base.join(entry);
        if tokio::fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false) {
            found.push(path);
        } else {
            missing.push(path);
        }
    }
    Ok((found, missing))
}

/// State shared by the workers of one file
struct FileRun {
    executor: Arc<dyn QueryExecutor>,
    jobs: Vec<QueryLine>,
    file_name: String,
    next: AtomicUsize,
    completed: AtomicUsize,
    file_started: Instant,
    bulk_started: Instant,
    tx: mpsc::Sender<BulkItem>,
    cancel: CancellationToken,
}

impl FileRun {
    fn context(&self, worker: usize, line_number: usize, completed: usize) -> BulkContext {
        BulkContext {
            worker,
            file_name: self.file_name.clone(),
            line_number,
            completed,
            total: self.jobs.len(),
            file_elapsed: self.file_started.elapsed(),
            bulk_elapsed: self.bulk_started.elapsed(),
        }
    }
}

/// Run one query on its own task so that a panic in the executor fails only that query
async fn run_isolated(
    executor: &Arc<dyn QueryExecutor>,
    query: &str,
    cancel: &CancellationToken,
) -> GizmoResult<ResultAggregate> {
    let executor = executor.clone();
    let owned = query.to_string();
    let cancel = cancel.clone();
    let task = tokio::spawn(async move { executor.execute_query(&owned, &cancel).await });

    match task.await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => {
            let reason = panic_reason(e.into_panic());
            error!("Query panicked: {} :: {}", reason, query);
            Err(GizmoError::Internal(format!("query panicked: {}", reason)))
        }
        Err(_) => Err(GizmoError::Cancelled),
    }
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown cause".to_string()
    }
}

async fn run_worker(worker: usize, run: Arc<FileRun>) {
    loop {
        if run.cancel.is_cancelled() {
            break;
        }
        let index = run.next.fetch_add(1, Ordering::SeqCst);
        let Some(job) = run.jobs.get(index) else {
            break;
        };

        let outcome = run_isolated(&run.executor, &job.query, &run.cancel).await;
        if matches!(&outcome, Err(e) if e.is_cancelled()) {
            debug!("Worker {} stopped at {}:{}", worker, run.file_name, job.line_number);
            break;
        }

        let completed = run.completed.fetch_add(1, Ordering::SeqCst) + 1;
        let context = run.context(worker, job.line_number, completed);
        let item = match outcome {
            Ok(result) => BulkItem::Success(BulkResult { result, context }),
            Err(error) => BulkItem::Failure(ErrorResult {
                query: job.query.clone(),
                error,
                context,
            }),
        };

        if run.tx.send(item).await.is_err() {
            warn!("Progress reporter is gone; worker {} stopping", worker);
            break;
        }
    }
}

#[derive(Debug, Default)]
struct ReportTally {
    succeeded: usize,
    failed: usize,
    retries: u64,
}

async fn report(
    mut rx: mpsc::Receiver<BulkItem>,
    sink: Arc<dyn ProgressSink>,
    failure_path: Option<PathBuf>,
) -> GizmoResult<ReportTally> {
    let mut tally = ReportTally::default();
    let mut failures = Vec::new();

    while let Some(item) = rx.recv().await {
        match item {
            BulkItem::Success(result) => {
                tally.succeeded += 1;
                tally.retries += u64::from(result.result.retry_count());
                sink.write_line(&result.to_string());
            }
            BulkItem::Failure(failure) => {
                tally.failed += 1;
                tally.retries += u64::from(failure.retries());
                let line = failure.to_string();
                sink.write_line(&line);
                failures.push(line);
            }
            BulkItem::Message(line) => sink.write_line(&line),
        }
    }

    if let Some(path) = failure_path {
        let mut body = failures.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        tokio::fs::write(&path, body).await?;
        if !failures.is_empty() {
            info!("{} failed queries written to {}", failures.len(), path.display());
        }
    }

    Ok(tally)
}

pub struct BulkLoadEngine {
    manager: Arc<ConnectionManager>,
}

impl BulkLoadEngine {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// Load every file in order against `(name, kind)`.
    ///
    /// Fails only when the connection cannot be opened or verified; per-query
    /// failures are reported and counted, never returned.
    pub async fn load_files(
        &self,
        files: &[PathBuf],
        name: &str,
        kind: ExecutorKind,
        options: &BulkOptions,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> GizmoResult<BulkSummary> {
        let executor = self.manager.open(name, kind, cancel).await?;
        if !executor.test_connection(cancel).await {
            return Err(GizmoError::Connection(format!(
                "Unable to connect to '{}' at {}",
                name,
                executor.remote_message()
            )));
        }

        let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));
        let reporter = tokio::spawn(report(rx, sink, options.failure_path.clone()));

        let bulk_started = Instant::now();
        let mut total = 0;
        for path in files {
            if cancel.is_cancelled() {
                break;
            }
            match self
                .load_file(path, &executor, options, &tx, bulk_started, cancel)
                .await
            {
                Ok(scheduled) => total += scheduled,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    let _ = tx
                        .send(BulkItem::Message(format!("Unable to read {}: {}", path.display(), e)))
                        .await;
                }
            }
        }

        // closing the channel lets the reporter finish draining
        drop(tx);
        let tally = match reporter.await {
            Ok(Ok(tally)) => tally,
            Ok(Err(e)) => {
                error!("Failed to write the failure report: {}", e);
                return Err(e);
            }
            Err(e) => {
                error!("Progress reporter panicked: {}", e);
                ReportTally::default()
            }
        };

        let summary = BulkSummary {
            total,
            succeeded: tally.succeeded,
            failed: tally.failed,
            retries: tally.retries,
            elapsed: bulk_started.elapsed(),
            cancelled: cancel.is_cancelled(),
        };
        info!(
            "Bulk load finished: {}/{} succeeded, {} failed, {} retries in {}",
            summary.succeeded,
            summary.total,
            summary.failed,
            summary.retries,
            format_hms(summary.elapsed)
        );
        Ok(summary)
    }

    /// Load the files listed in a manifest. Missing entries are reported and skipped.
    pub async fn load_manifest(
        &self,
        manifest: &Path,
        name: &str,
        kind: ExecutorKind,
        options: &BulkOptions,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> GizmoResult<BulkSummary> {
        let (files, missing) = read_manifest(manifest).await?;
        for path in &missing {
            warn!("Manifest entry not found: {}", path.display());
            sink.write_line(&format!("File not found: {}", path.display()));
        }
        self.load_files(&files, name, kind, options, sink, cancel).await
    }

    /// Run one file to completion and return how many queries it scheduled
    async fn load_file(
        &self,
        path: &Path,
        executor: &Arc<dyn QueryExecutor>,
        options: &BulkOptions,
        tx: &mpsc::Sender<BulkItem>,
        bulk_started: Instant,
        cancel: &CancellationToken,
    ) -> GizmoResult<usize> {
        let contents = tokio::fs::read_to_string(path).await?;
        let lines: Vec<&str> = contents.lines().collect();
        let jobs = window_lines(&lines, options.skip, options.take);
        let scheduled = jobs.len();
        let parallelism = options.parallelism.max(1);

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        info!("Loading {} queries from {} with {} workers", scheduled, file_name, parallelism);

        let run = Arc::new(FileRun {
            executor: executor.clone(),
            jobs,
            file_name,
            next: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            file_started: Instant::now(),
            bulk_started,
            tx: tx.clone(),
            cancel: cancel.clone(),
        });

        let mut workers = JoinSet::new();
        let mut spawned = parallelism.min(scheduled.max(1));
        for worker in 0..spawned {
            workers.spawn(run_worker(worker, run.clone()));
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Bulk worker failed: {}", e);
                // keep the queue moving with a replacement
                if !cancel.is_cancelled() && run.next.load(Ordering::SeqCst) < run.jobs.len() {
                    workers.spawn(run_worker(spawned, run.clone()));
                    spawned += 1;
                }
            }
        }

        let elapsed = run.file_started.elapsed();
        let completed = run.completed.load(Ordering::SeqCst);
        let end = if options.take == 0 {
            lines.len()
        } else {
            options.skip + options.take
        };
        let qps = if elapsed.as_secs_f64() > 0.0 {
            completed as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let _ = tx
            .send(BulkItem::Message(format!(
                "{}:[{} to {}] q's. {} threads. {} {:.2} q/s",
                completed,
                options.skip,
                end,
                parallelism,
                format_hms(elapsed),
                qps
            )))
            .await;

        Ok(scheduled)
    }
}
