//! One-shot job scheduling — the replace-by-id primitive the engine books
//! its turns through.
//!
//! The trait is the host seam; [`TokioJobScheduler`] is the bundled
//! in-process implementation. Jobs are validated at fire time against the
//! registry (a superseded or cancelled job never fires), and run-times
//! already in the past fire immediately only within the misfire grace.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// What a fired job asks the engine to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInvocation {
    pub session_id: String,
    /// Set when the job was booked by a context task; carries its id.
    pub context_task_id: Option<String>,
}

impl JobInvocation {
    pub fn ordinary(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            context_task_id: None,
        }
    }

    pub fn contextual(session_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            context_task_id: Some(task_id.into()),
        }
    }
}

/// One-shot, replace-by-id job scheduling.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Book `invocation` to fire at `run_at`, replacing any job with the
    /// same id. A `run_at` already in the past fires immediately when the
    /// overdue amount is within `misfire_grace`, and is dropped otherwise.
    async fn schedule(
        &self,
        job_id: &str,
        run_at: DateTime<Utc>,
        invocation: JobInvocation,
        misfire_grace: Duration,
    );

    /// Cancel a booked job. Returns whether one existed.
    async fn cancel(&self, job_id: &str) -> bool;

    async fn contains(&self, job_id: &str) -> bool;

    /// Cancel everything (teardown).
    async fn cancel_all(&self);
}

struct BookedJob {
    generation: u64,
    handle: JoinHandle<()>,
}

/// The bundled scheduler: a registry of spawned sleepers that emit
/// invocations into a channel the engine drains.
pub struct TokioJobScheduler {
    jobs: Arc<Mutex<HashMap<String, BookedJob>>>,
    tx: mpsc::UnboundedSender<JobInvocation>,
    generations: AtomicU64,
}

impl TokioJobScheduler {
    /// Create the scheduler and the invocation stream it feeds.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JobInvocation>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                jobs: Arc::new(Mutex::new(HashMap::new())),
                tx,
                generations: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }
}

#[async_trait]
impl JobScheduler for TokioJobScheduler {
    async fn schedule(
        &self,
        job_id: &str,
        run_at: DateTime<Utc>,
        invocation: JobInvocation,
        misfire_grace: Duration,
    ) {
        let now = Utc::now();
        let delay = match (run_at - now).to_std() {
            Ok(d) => d,
            Err(_) => {
                let overdue = (now - run_at).to_std().unwrap_or_default();
                if overdue > misfire_grace {
                    tracing::warn!(
                        "job {} overdue by {:?}, beyond the misfire grace — dropped",
                        job_id,
                        overdue
                    );
                    return;
                }
                Duration::ZERO
            }
        };

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let mut jobs = self.jobs.lock().await;
        if let Some(old) = jobs.remove(job_id) {
            old.handle.abort();
        }

        let registry = Arc::clone(&self.jobs);
        let tx = self.tx.clone();
        let id = job_id.to_string();
        // The fire task re-checks the registry after sleeping, so a job
        // superseded mid-sleep never emits. Holding the lock until the
        // entry is inserted keeps zero-delay fires from racing it.
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut jobs = registry.lock().await;
            let current = match jobs.get(&id) {
                Some(job) if job.generation == generation => true,
                _ => false,
            };
            if current {
                jobs.remove(&id);
                drop(jobs);
                let _ = tx.send(invocation);
            }
        });

        jobs.insert(
            job_id.to_string(),
            BookedJob { generation, handle },
        );
    }

    async fn cancel(&self, job_id: &str) -> bool {
        let mut jobs = self.jobs.lock().await;
        match jobs.remove(job_id) {
            Some(job) => {
                job.handle.abort();
                true
            }
            None => false,
        }
    }

    async fn contains(&self, job_id: &str) -> bool {
        self.jobs.lock().await.contains_key(job_id)
    }

    async fn cancel_all(&self) {
        let mut jobs = self.jobs.lock().await;
        for (_, job) in jobs.drain() {
            job.handle.abort();
        }
    }
}
