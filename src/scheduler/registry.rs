//! Job registry: the shared table of running execution units.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{RwLock, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::timeline::{HandlerType, TimelineHandler};

/// How a job is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Plain execution unit (runs once or loops).
    Unit,
    /// Registered with the cron sub-scheduler.
    Cron,
}

/// Registry entry for one launched handler.
#[derive(Debug)]
pub struct Job {
    pub id: Uuid,
    pub timeline_id: Uuid,
    pub handler: Arc<TimelineHandler>,
    pub kind: JobKind,
    pub cancel: CancellationToken,
    pub started_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

impl Job {
    pub fn info(&self) -> JobInfo {
        JobInfo {
            id: self.id,
            timeline_id: self.timeline_id,
            handler_type: self.handler.handler_type.clone(),
            kind: self.kind,
            cancel: self.cancel.clone(),
            started_at: self.started_at,
            finished: self.handle.is_finished(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Split off the execution handle so the caller can join it.
    pub fn into_handle(self) -> JoinHandle<()> {
        self.handle
    }
}

/// Cloneable snapshot of a registry entry.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub id: Uuid,
    pub timeline_id: Uuid,
    pub handler_type: HandlerType,
    pub kind: JobKind,
    pub cancel: CancellationToken,
    pub started_at: DateTime<Utc>,
    pub finished: bool,
}

/// Thread-safe job table keyed by job id.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<Uuid, Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `body` as a job and register it.
    ///
    /// The task does not start until its entry is in the table, and it removes
    /// its own entry on exit (completion, cancellation or panic).
    pub async fn launch<F, Fut>(
        &self,
        timeline_id: Uuid,
        handler: Arc<TimelineHandler>,
        kind: JobKind,
        body: F,
    ) -> Uuid
    where
        F: FnOnce(Uuid, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (start_tx, start_rx) = oneshot::channel::<()>();
        let work = body(id, cancel.clone());
        let registry = self.clone();

        let handle = tokio::spawn(async move {
            if start_rx.await.is_ok()
                && let Err(panic) = AssertUnwindSafe(work).catch_unwind().await
            {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(job_id = %id, "Job panicked: {}", reason);
            }
            if registry.remove_by_job_id(id).await.is_some() {
                tracing::debug!(job_id = %id, "Job removed from registry");
            }
        });

        self.add(Job {
            id,
            timeline_id,
            handler,
            kind,
            cancel,
            started_at: Utc::now(),
            handle,
        })
        .await;
        let _ = start_tx.send(());
        id
    }

    /// Insert a job.
    pub async fn add(&self, job: Job) {
        self.jobs.write().await.insert(job.id, job);
    }

    /// Remove a job by id, returning it.
    pub async fn remove_by_job_id(&self, id: Uuid) -> Option<Job> {
        self.jobs.write().await.remove(&id)
    }

    /// Snapshot of the jobs belonging to one timeline.
    pub async fn all_for_timeline(&self, timeline_id: Uuid) -> Vec<JobInfo> {
        self.jobs
            .read()
            .await
            .values()
            .filter(|job| job.timeline_id == timeline_id)
            .map(Job::info)
            .collect()
    }

    /// Snapshot of every job.
    pub async fn all(&self) -> Vec<JobInfo> {
        self.jobs.read().await.values().map(Job::info).collect()
    }

    /// Remove and return every job of one timeline.
    pub async fn take_for_timeline(&self, timeline_id: Uuid) -> Vec<Job> {
        let mut jobs = self.jobs.write().await;
        let ids: Vec<Uuid> = jobs
            .values()
            .filter(|job| job.timeline_id == timeline_id)
            .map(|job| job.id)
            .collect();
        ids.iter().filter_map(|id| jobs.remove(id)).collect()
    }

    /// Remove and return every job.
    pub async fn take_all(&self) -> Vec<Job> {
        self.jobs.write().await.drain().map(|(_, job)| job).collect()
    }

    /// Cancel every job of one timeline without removing them.
    pub async fn cancel_for_timeline(&self, timeline_id: Uuid) -> usize {
        let jobs = self.jobs.read().await;
        let mut cancelled = 0;
        for job in jobs.values().filter(|job| job.timeline_id == timeline_id) {
            job.cancel.cancel();
            cancelled += 1;
        }
        cancelled
    }

    /// Cancel every job without removing them.
    pub async fn cancel_all(&self) -> usize {
        let jobs = self.jobs.read().await;
        for job in jobs.values() {
            job.cancel.cancel();
        }
        jobs.len()
    }

    pub async fn contains(&self, id: Uuid) -> bool {
        self.jobs.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Number of running jobs per handler type.
    pub async fn counts_by_type(&self) -> HashMap<HandlerType, usize> {
        let mut counts = HashMap::new();
        for job in self.jobs.read().await.values() {
            *counts.entry(job.handler.handler_type.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Release spare table capacity.
    pub async fn shrink(&self) {
        self.jobs.write().await.shrink_to_fit();
    }
}
