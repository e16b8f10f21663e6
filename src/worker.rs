//! Background embedding generation
//!
//! The worker drains the backlog of un-embedded (or stale) summaries into the
//! [`EmbeddingStore`] in batches. It runs as a single tokio task controlled
//! through a [`WorkerHandle`]:
//!
//! - `pause()` is observed at every loop iteration and inside every wait
//! - `resume()` wakes a paused worker
//! - `shutdown()` always wins, including over a pause
//!
//! Every wait is cut into [`RESPONSIVENESS_SLICE`] pieces so a control change
//! is seen promptly even during a long backoff or idle sleep.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::cache::RagCache;
use crate::config::{ConfigProvider, WorkerSettings};
use crate::embedding::{EmbeddingBatch, EmbeddingClient};
use crate::error::{EmbeddingClientError, Result};
use crate::record::{ConversationId, WorkItem, WorkKey};
use crate::storage::{EmbeddingStore, JsonlFile};

/// Longest uninterrupted wait; bounds how long a pause or shutdown goes unnoticed
pub const RESPONSIVENESS_SLICE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Running,
    Paused,
    ShuttingDown,
}

/// Requested state plus the worker's acknowledgement that it is parked.
///
/// Both live in one watch channel so clearing the acknowledgement on resume
/// and setting it on pause cannot interleave.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Control {
    state: WorkerState,
    parked: bool,
}

/// Point-in-time view of the worker
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerStatus {
    pub state: WorkerState,

    /// The worker has acknowledged a pause and is not touching the store
    pub parked: bool,

    pub completed: u64,
    pub failed: u64,
    pub batches: u64,
    pub tokens_used: u64,
    pub spend: f64,
    pub current_item: Option<WorkKey>,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// An item the worker gave up on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJob {
    pub key: WorkKey,
    pub conversation_id: ConversationId,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

/// Receives items that failed permanently or ran out of retries
pub trait FailedJobSink: Send + Sync {
    fn record(&self, job: FailedJob);
}

/// Failed job list, optionally journaled to a JSONL file so it survives restarts
#[derive(Debug, Default)]
pub struct FailedJobLog {
    jobs: Mutex<Vec<FailedJob>>,
    journal: Option<JsonlFile<FailedJob>>,
}

impl FailedJobLog {
    /// In-memory only
    pub fn new() -> Self {
        Self::default()
    }

    /// Load earlier failures from `path` and append new ones to it
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let journal = JsonlFile::new(path)?;
        let jobs = journal.read_all()?;
        if !jobs.is_empty() {
            info!("Loaded {} failed embedding jobs from {:?}", jobs.len(), journal.path());
        }
        Ok(Self {
            jobs: Mutex::new(jobs),
            journal: Some(journal),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<FailedJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn jobs(&self) -> Vec<FailedJob> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut jobs = self.lock();
        jobs.clear();
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.truncate() {
                warn!("Failed to truncate {:?}: {}", journal.path(), e);
            }
        }
    }
}

impl FailedJobSink for FailedJobLog {
    fn record(&self, job: FailedJob) {
        let mut jobs = self.lock();
        if let Some(journal) = &self.journal {
            // The in-memory list stays authoritative for this run
            if let Err(e) = journal.append(&job) {
                warn!("Failed to journal failed job {}: {}", job.key, e);
            }
        }
        jobs.push(job);
    }
}

/// State shared between the task and its handle
struct Shared {
    control: watch::Sender<Control>,
    status: Mutex<WorkerStatus>,

    /// Failed items the running worker will not pick up again
    skip: Mutex<HashSet<WorkKey>>,
}

impl Shared {
    fn status(&self) -> MutexGuard<'_, WorkerStatus> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn skip(&self) -> MutexGuard<'_, HashSet<WorkKey>> {
        self.skip.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: WorkerState) {
        self.control.send_modify(|c| {
            // Shutdown is final
            if c.state != WorkerState::ShuttingDown {
                c.state = state;
            }
            if c.state != WorkerState::Paused {
                c.parked = false;
            }
        });
    }
}

/// Embedding generation worker, not yet started
pub struct EmbeddingWorker {
    store: Arc<EmbeddingStore>,
    client: Arc<dyn EmbeddingClient>,
    cache: Arc<RagCache>,
    config: Arc<dyn ConfigProvider>,
    sink: Arc<dyn FailedJobSink>,
}

impl EmbeddingWorker {
    pub fn new(
        store: Arc<EmbeddingStore>,
        client: Arc<dyn EmbeddingClient>,
        cache: Arc<RagCache>,
        config: Arc<dyn ConfigProvider>,
        sink: Arc<dyn FailedJobSink>,
    ) -> Self {
        Self {
            store,
            client,
            cache,
            config,
            sink,
        }
    }

    /// Start the loop on the current tokio runtime
    pub fn spawn(self) -> WorkerHandle {
        self.spawn_in(WorkerState::Running)
    }

    /// Start the loop already paused
    pub fn spawn_paused(self) -> WorkerHandle {
        self.spawn_in(WorkerState::Paused)
    }

    fn spawn_in(self, state: WorkerState) -> WorkerHandle {
        let (control, rx) = watch::channel(Control { state, parked: false });
        let shared = Arc::new(Shared {
            control,
            status: Mutex::new(WorkerStatus {
                started_at: Some(Utc::now()),
                ..Default::default()
            }),
            skip: Mutex::new(HashSet::new()),
        });

        let runner = Runner {
            worker: self,
            shared: shared.clone(),
            rx,
        };
        let task = tokio::spawn(runner.run());

        WorkerHandle {
            shared,
            task: Mutex::new(Some(task)),
        }
    }
}

/// Controls a running worker. Dropping the handle shuts the worker down.
pub struct WorkerHandle {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    pub fn pause(&self) {
        self.shared.set_state(WorkerState::Paused);
        info!("Embedding worker pause requested");
    }

    pub fn resume(&self) {
        self.shared.set_state(WorkerState::Running);
        info!("Embedding worker resumed");
    }

    pub fn state(&self) -> WorkerState {
        self.shared.control.borrow().state
    }

    /// Wait until the worker acknowledges a pause. False on timeout, or when
    /// no pause is requested or the worker has stopped.
    pub async fn wait_until_paused(&self, timeout: Duration) -> bool {
        let mut rx = self.shared.control.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|c| c.parked || c.state != WorkerState::Paused),
        )
        .await;

        match waited {
            Ok(Ok(control)) => control.parked,
            _ => false,
        }
    }

    /// Make previously failed items eligible again; returns how many
    pub fn retry_failed(&self) -> usize {
        let mut skip = self.shared.skip();
        let n = skip.len();
        skip.clear();
        n
    }

    /// Zero the counters and forget failures
    pub fn reset(&self) {
        self.shared.skip().clear();
        let mut status = self.shared.status();
        *status = WorkerStatus {
            started_at: status.started_at,
            ..Default::default()
        };
    }

    pub fn snapshot(&self) -> WorkerStatus {
        let control = *self.shared.control.borrow();
        let mut status = self.shared.status().clone();
        status.state = control.state;
        status.parked = control.parked;
        status
    }

    pub fn is_finished(&self) -> bool {
        match self.task.lock() {
            Ok(guard) => guard.as_ref().map_or(true, |t| t.is_finished()),
            Err(_) => true,
        }
    }

    /// Stop the worker, even if paused. False if it did not exit within `timeout`
    /// (the task is then aborted).
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.shared.set_state(WorkerState::ShuttingDown);

        let task = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(mut task) = task else {
            return true;
        };

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(_) => true,
            Err(_) => {
                warn!("Embedding worker did not stop within {:?}, aborting", timeout);
                task.abort();
                false
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shared.set_state(WorkerState::ShuttingDown);
    }
}

/// Outcome of an embedding attempt loop
enum Embedded {
    Batch(EmbeddingBatch),
    Failed,
    Stopped,
}

struct Runner {
    worker: EmbeddingWorker,
    shared: Arc<Shared>,
    rx: watch::Receiver<Control>,
}

impl Runner {
    async fn run(mut self) {
        info!("Embedding worker started");

        while self.checkpoint().await {
            let settings = self.worker.config.worker();
            let skip = self.shared.skip().clone();

            let items = match self.worker.store.pending_work(settings.batch_size, &skip) {
                Ok(items) => items,
                Err(e) => {
                    error!("Failed to discover pending summaries: {}", e);
                    self.shared.status().last_error = Some(e.to_string());
                    if !self.sleep(Duration::from_millis(settings.idle_poll_ms)).await {
                        break;
                    }
                    continue;
                }
            };

            if items.is_empty() {
                if !self.sleep(Duration::from_millis(settings.idle_poll_ms)).await {
                    break;
                }
                continue;
            }

            if !self.process_batch(items, &settings).await {
                break;
            }
            if !self.sleep(Duration::from_millis(settings.rate_limit_ms)).await {
                break;
            }
        }

        self.shared.status().current_item = None;
        info!("Embedding worker stopped");
    }

    /// Block while paused. False once shutdown was requested.
    async fn checkpoint(&mut self) -> bool {
        loop {
            let control = *self.rx.borrow_and_update();
            match control.state {
                WorkerState::ShuttingDown => return false,
                WorkerState::Running => return true,
                WorkerState::Paused => {
                    if !control.parked {
                        self.shared.control.send_modify(|c| {
                            if c.state == WorkerState::Paused {
                                c.parked = true;
                            }
                        });
                        debug!("Embedding worker parked");
                    }
                    if let Ok(Err(_)) = tokio::time::timeout(RESPONSIVENESS_SLICE, self.rx.changed()).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Sleep in slices, honouring pause and shutdown. False once shutdown was requested.
    async fn sleep(&mut self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if !self.checkpoint().await {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            tokio::time::sleep((deadline - now).min(RESPONSIVENESS_SLICE)).await;
        }
    }

    /// Embed and store one batch. False once shutdown was requested.
    async fn process_batch(&mut self, items: Vec<WorkItem>, settings: &WorkerSettings) -> bool {
        debug!("Embedding batch of {} summaries", items.len());
        self.shared.status().current_item = items.first().map(WorkItem::key);

        let batch = match self.embed(&items, settings).await {
            Embedded::Batch(batch) => batch,
            Embedded::Failed => return true,
            Embedded::Stopped => return false,
        };

        {
            let mut status = self.shared.status();
            status.batches += 1;
            status.tokens_used += batch.tokens_used;
            status.spend += batch.cost;
        }

        for (item, vector) in items.iter().zip(batch.vectors) {
            self.shared.status().current_item = Some(item.key());
            if !self.write(item, &vector, settings).await {
                return false;
            }
        }

        self.shared.status().current_item = None;
        true
    }

    /// Call the client once for the whole batch, retrying transient failures
    async fn embed(&mut self, items: &[WorkItem], settings: &WorkerSettings) -> Embedded {
        let texts: Vec<String> = items.iter().map(|i| i.text.clone()).collect();
        let mut backoff = Backoff::from_settings(settings);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let err = match self.worker.client.embed(&texts).await {
                Ok(batch) if batch.vectors.len() == items.len() => return Embedded::Batch(batch),
                Ok(batch) => EmbeddingClientError::permanent(format!(
                    "Client returned {} vectors for {} texts",
                    batch.vectors.len(),
                    items.len()
                )),
                Err(e) => e,
            };

            if err.is_retryable() && attempts < settings.max_attempts {
                let delay = backoff.next_delay();
                warn!(
                    "Embedding attempt {}/{} failed, retrying in {:?}: {}",
                    attempts, settings.max_attempts, delay, err
                );
                if !self.sleep(delay).await {
                    return Embedded::Stopped;
                }
                continue;
            }

            for item in items {
                self.record_failure(item, &err.to_string(), attempts);
            }
            return Embedded::Failed;
        }
    }

    /// Upsert one vector, retrying transient storage faults
    async fn write(&mut self, item: &WorkItem, vector: &[f32], settings: &WorkerSettings) -> bool {
        let mut backoff = Backoff::from_settings(settings);
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.worker.store.upsert(item.kind, item.ref_id, &item.text, vector) {
                Ok(upserted) => {
                    // A brand-new row can enter any ranking; a replaced one only affects its conversation
                    if upserted.inserted {
                        self.worker.cache.invalidate_all();
                    } else {
                        self.worker.cache.invalidate(item.conversation_id);
                    }
                    self.shared.status().completed += 1;
                    return true;
                }
                Err(e) if e.is_retryable() && attempts < settings.max_attempts => {
                    let delay = backoff.next_delay();
                    warn!("Writing {} failed, retrying in {:?}: {}", item.key(), delay, e);
                    if !self.sleep(delay).await {
                        return false;
                    }
                }
                Err(e) => {
                    self.record_failure(item, &e.to_string(), attempts);
                    return true;
                }
            }
        }
    }

    fn record_failure(&self, item: &WorkItem, reason: &str, attempts: u32) {
        error!("Giving up on {} after {} attempt(s): {}", item.key(), attempts, reason);

        self.shared.skip().insert(item.key());
        {
            let mut status = self.shared.status();
            status.failed += 1;
            status.last_error = Some(reason.to_string());
        }

        self.worker.sink.record(FailedJob {
            key: item.key(),
            conversation_id: item.conversation_id,
            error: reason.to_string(),
            attempts,
            failed_at: Utc::now(),
        });
    }
}
