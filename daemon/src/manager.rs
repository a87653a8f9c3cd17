//! In-memory job table, FIFO admission queue and the render worker pool.
//!
//! Each queued item is received by exactly one worker, and only that worker
//! writes the job's mutable fields after submission, so entries need no lock
//! of their own. The `DashMap` only guards structural changes: insert on
//! submit, removal by the retention sweep, iteration by `list`.

use chrono::{Local, Utc};
use common::{Job, JobId, JobStatus, LabelRequest, StatsSnapshot};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use crate::error::PrintError;
use crate::metrics::MetricsCollector;
use crate::pipeline::PrintPipeline;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub max_parallel: usize,
    pub retention: Duration,
    pub auto_cleanup_output: bool,
    /// Extra timer-driven sweep so expiry still happens while the queue is idle.
    pub sweep_interval: Option<Duration>,
}

struct QueuedJob {
    id: JobId,
    request: LabelRequest,
    filename: String,
}

struct JobEntry {
    job: Job,
    // Submission order, breaks `created_at` ties in `list`.
    seq: u64,
}

pub struct JobManager {
    jobs: DashMap<JobId, JobEntry>,
    queue_tx: mpsc::UnboundedSender<QueuedJob>,
    queue_rx: Mutex<mpsc::UnboundedReceiver<QueuedJob>>,
    pipeline: Arc<PrintPipeline>,
    metrics: Arc<MetricsCollector>,
    settings: ManagerSettings,
    next_seq: AtomicU64,
    submitted: AtomicU64,
    shutdown: CancellationToken,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl JobManager {
    pub fn new(pipeline: Arc<PrintPipeline>, metrics: Arc<MetricsCollector>, mut settings: ManagerSettings) -> Self {
        settings.max_parallel = settings.max_parallel.max(1);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            jobs: DashMap::new(),
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
            pipeline,
            metrics,
            settings,
            next_seq: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            workers: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.settings.max_parallel
    }

    /// Lifetime number of submitted jobs (resets with the process).
    pub fn jobs_total(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Record a new `pending` job and queue it. Never waits on rendering;
    /// the request is expected to be validated already.
    pub fn submit(&self, request: LabelRequest) -> JobId {
        let id = JobId::new();
        let filename = make_output_filename(&request.template_name);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        let job = Job::pending(id.clone(), request.clone(), filename.clone());
        self.jobs.insert(id.clone(), JobEntry { job, seq });
        self.submitted.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_submission();

        let template = request.template_name.clone();
        if self.queue_tx.send(QueuedJob { id: id.clone(), request, filename }).is_err() {
            // Receiver lives as long as the manager; only reachable mid-drop.
            self.mark_failed(&id, &PrintError::Internal("job queue closed".into()));
            return id;
        }

        // Checked after the send: a shutdown that already drained the queue
        // would otherwise leave this item pending forever.
        if self.shutdown.is_cancelled() {
            if let Ok(mut queue) = self.queue_rx.try_lock() {
                self.fail_queued(&mut queue, "daemon is shutting down");
            }
            let pending = self
                .jobs
                .get(&id)
                .map_or(false, |entry| entry.job.status == JobStatus::Pending);
            if pending {
                self.mark_failed(&id, &PrintError::Cancelled("daemon is shutting down".into()));
            }
            return id;
        }

        log::info!("submitted job_id={}, template={}", id, template);
        id
    }

    pub fn get(&self, id: &JobId) -> Option<Job> {
        self.jobs.get(id).map(|entry| entry.job.clone())
    }

    /// The `limit` most recently created jobs, newest first.
    pub fn list(&self, limit: usize) -> Vec<Job> {
        let mut entries: Vec<(chrono::DateTime<Utc>, u64, Job)> = self
            .jobs
            .iter()
            .map(|entry| (entry.job.created_at, entry.seq, entry.job.clone()))
            .collect();
        entries.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));
        entries.into_iter().take(limit).map(|(_, _, job)| job).collect()
    }

    pub fn stats(&self) -> StatsSnapshot {
        let mut stats = StatsSnapshot {
            jobs_total: self.jobs_total(),
            queue_depth: self.metrics.queue_depth(),
            max_parallel: self.settings.max_parallel,
            ..Default::default()
        };
        for entry in self.jobs.iter() {
            match entry.job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Done => stats.done += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    pub fn start_workers(self: &Arc<Self>) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for wid in 0..self.settings.max_parallel {
            workers.push(tokio::spawn(Arc::clone(self).worker(wid)));
        }
        if let Some(period) = self.settings.sweep_interval {
            workers.push(tokio::spawn(Arc::clone(self).sweeper(period)));
        }
        log::info!("JobManager started with {} workers", self.settings.max_parallel);
    }

    /// Stop all workers. Jobs cut off mid-render, and jobs still waiting in
    /// the queue, end up `failed` with a cancellation error.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            if let Err(e) = handle.await {
                log::error!("Worker ended abnormally: {}", e);
            }
        }

        let mut queue = self.queue_rx.lock().await;
        self.fail_queued(&mut queue, "daemon shut down before the job started");
        log::info!("JobManager stopped");
    }

    fn fail_queued(&self, queue: &mut mpsc::UnboundedReceiver<QueuedJob>, reason: &str) {
        while let Ok(item) = queue.try_recv() {
            self.metrics.record_dequeue();
            self.mark_failed(&item.id, &PrintError::Cancelled(reason.to_string()));
        }
    }

    async fn worker(self: Arc<Self>, wid: usize) {
        log::info!("Worker-{} started (max={})", wid, self.settings.max_parallel);
        loop {
            let item = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                item = self.next_queued() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            self.metrics.record_dequeue();
            self.process(wid, item).await;
            self.sweep();
        }
        log::info!("Worker-{} stopped", wid);
    }

    async fn next_queued(&self) -> Option<QueuedJob> {
        self.queue_rx.lock().await.recv().await
    }

    async fn process(&self, wid: usize, item: QueuedJob) {
        let QueuedJob { id, request, filename } = item;
        if !self.transition(&id, |job| job.status = JobStatus::Running) {
            log::warn!("[Worker-{}] job_id={} no longer tracked, skipping", wid, id);
            return;
        }
        log::debug!("[Worker-{}] START job_id={}, template={}", wid, id, request.template_name);

        let started = Instant::now();
        let template = request.template_name.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let task_id = id.clone();
        // The render runs in its own task so a panic in it fails only this job.
        let mut task = tokio::spawn(async move {
            pipeline
                .run(task_id.as_str(), &request.template_name, &request.data, request.copies, &filename)
                .await
        });

        let outcome = tokio::select! {
            biased;
            joined = &mut task => joined.unwrap_or_else(|e| Err(join_failure(e))),
            _ = self.shutdown.cancelled() => {
                task.abort();
                let _ = task.await;
                Err(PrintError::Cancelled("daemon shut down during render".into()))
            }
        };

        match outcome {
            Ok(output_path) => {
                self.metrics.record_success(&template, started.elapsed().as_millis() as u64);
                log::info!("[Worker-{}] job_id={} completed -> {}", wid, id, output_path.display());
                self.mark_done(&id, output_path);
            }
            Err(e) => {
                self.metrics.record_failure();
                log::error!("[Worker-{}] job_id={} failed: {}", wid, id, e);
                self.mark_failed(&id, &e);
            }
        }
    }

    async fn sweeper(self: Arc<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.sweep();
                }
            }
        }
    }

    /// Drop every job created before the retention window, deleting its PDF
    /// when auto cleanup is on. Returns how many jobs were removed.
    pub fn sweep(&self) -> usize {
        let cutoff = match chrono::Duration::from_std(self.settings.retention)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window))
        {
            Some(cutoff) => cutoff,
            None => return 0,
        };

        let mut expired = Vec::new();
        self.jobs.retain(|_, entry| {
            if entry.job.created_at < cutoff {
                expired.push((entry.job.id.clone(), entry.job.output_path.take()));
                false
            } else {
                true
            }
        });

        for (id, output_path) in &expired {
            if self.settings.auto_cleanup_output {
                if let Some(path) = output_path {
                    remove_output(path);
                }
            }
            log::debug!("cleanup expired job_id={}", id);
        }

        self.metrics.record_expired(expired.len() as u64);
        expired.len()
    }

    /// Apply `update` to a live, non-terminal job and bump `updated_at`.
    fn transition<F>(&self, id: &JobId, update: F) -> bool
    where
        F: FnOnce(&mut Job),
    {
        let Some(mut entry) = self.jobs.get_mut(id) else {
            return false;
        };
        let job = &mut entry.job;
        if job.status.is_terminal() {
            log::warn!("job_id={} is already {}, ignoring update", id, job.status);
            return false;
        }
        update(job);
        job.updated_at = Utc::now().max(job.created_at);
        true
    }

    fn mark_done(&self, id: &JobId, output_path: PathBuf) {
        let recorded = output_path.clone();
        let tracked = self.transition(id, |job| {
            job.status = JobStatus::Done;
            job.output_path = Some(recorded);
        });
        // Swept while rendering: nothing will ever point at this PDF again.
        if !tracked && self.settings.auto_cleanup_output {
            remove_output(&output_path);
        }
    }

    fn mark_failed(&self, id: &JobId, error: &PrintError) {
        let message = error.to_string();
        self.transition(id, |job| {
            job.status = JobStatus::Failed;
            job.error = Some(message);
        });
    }
}

fn remove_output(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("deleted PDF: {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("failed to delete PDF {}: {}", path.display(), e),
    }
}

fn join_failure(err: JoinError) -> PrintError {
    if err.is_panic() {
        let payload = err.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        PrintError::Internal(format!("render task panicked: {}", message))
    } else {
        PrintError::Cancelled("render task was cancelled".into())
    }
}

/// `<template stem>_<YYYYmmdd_HHMMSS>.pdf`, restricted to `[A-Za-z0-9._-]`.
pub fn make_output_filename(template_name: &str) -> String {
    let stem = Path::new(template_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ts = Local::now().format("%Y%m%d_%H%M%S");
    format!("{}_{}.pdf", slug(&stem), ts)
}

fn slug(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
