use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

/// Per-job event ring capacity; the oldest events are dropped on overflow.
const EVENT_RING_CAPACITY: usize = 2000;
/// Terminal jobs retained for snapshot queries.
const HISTORY_CAPACITY: usize = 100;
/// Broadcast buffer for live subscribers.
const SUBSCRIBER_BUFFER: usize = 1024;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Error,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Error | JobState::Cancelled)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProgressKind {
    Git,
    Deps,
}

/// Job events as consumers see them; pattern-match on the `type` tag.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobEvent {
    Log {
        stream: LogStream,
        line: String,
    },
    Progress {
        kind: ProgressKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        percent: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    State {
        state: JobState,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl JobEvent {
    pub fn is_terminal_state(&self) -> bool {
        matches!(self, JobEvent::State { state, .. } if state.is_terminal())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobError {
    pub error_code: String,
    pub message: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: Uuid,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub type JobRunner = Box<dyn FnOnce(JobContext) -> JobFuture + Send>;
type CancelFn = Box<dyn FnOnce() + Send>;

struct JobRecord {
    id: Uuid,
    state: JobState,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<JobError>,
    events: VecDeque<JobEvent>,
    tx: broadcast::Sender<JobEvent>,
    cancel: Option<CancelFn>,
}

impl JobRecord {
    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            state: self.state,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            error: self.error.clone(),
        }
    }

    /// Append to the ring and fan out to live subscribers. Terminal jobs
    /// absorb later emissions so the final event stays the terminal state.
    fn emit(&mut self, event: JobEvent) {
        if self.state.is_terminal() && !event.is_terminal_state() {
            return;
        }
        if self.events.len() == EVENT_RING_CAPACITY {
            self.events.pop_front();
        }
        self.events.push_back(event.clone());
        let _ = self.tx.send(event);
    }
}

struct Inner {
    jobs: HashMap<Uuid, JobRecord>,
    history: VecDeque<Uuid>,
    queue: VecDeque<Uuid>,
    pending: HashMap<Uuid, JobRunner>,
    running: usize,
}

/// Bounded FIFO job queue with a concurrency cap, per-job event rings,
/// wall-clock timeouts, and cooperative cancellation.
#[derive(Clone)]
pub struct JobManager {
    max_concurrent: usize,
    timeout: Duration,
    inner: Arc<Mutex<Inner>>,
}

/// Handed to runners; the only way they touch their job.
#[derive(Clone)]
pub struct JobContext {
    id: Uuid,
    inner: Arc<Mutex<Inner>>,
}

impl JobContext {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn log_stdout(&self, line: impl Into<String>) {
        self.emit(JobEvent::Log {
            stream: LogStream::Stdout,
            line: line.into(),
        });
    }

    pub fn log_stderr(&self, line: impl Into<String>) {
        self.emit(JobEvent::Log {
            stream: LogStream::Stderr,
            line: line.into(),
        });
    }

    pub fn progress(&self, kind: ProgressKind, percent: Option<f64>, detail: Option<String>) {
        self.emit(JobEvent::Progress {
            kind,
            percent,
            detail,
        });
    }

    /// Register the handle that tears down the job's child process tree.
    /// If the job was cancelled before the handle arrived, it fires at
    /// once.
    pub fn set_cancel(&self, cancel: CancelFn) {
        let fire_now = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            match inner.jobs.get_mut(&self.id) {
                Some(record) if record.state.is_terminal() => true,
                Some(record) => {
                    record.cancel = Some(cancel);
                    return;
                }
                None => false,
            }
        };
        if fire_now {
            cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .jobs
            .get(&self.id)
            .is_some_and(|record| record.state == JobState::Cancelled)
    }

    fn emit(&self, event: JobEvent) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = inner.jobs.get_mut(&self.id) {
            record.emit(event);
        }
    }
}

impl JobManager {
    pub fn new(max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            timeout,
            inner: Arc::new(Mutex::new(Inner {
                jobs: HashMap::new(),
                history: VecDeque::new(),
                queue: VecDeque::new(),
                pending: HashMap::new(),
                running: 0,
            })),
        }
    }

    /// Register a new queued job and start it if a slot is free.
    pub fn enqueue<F, Fut>(&self, runner: F) -> JobSnapshot
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let boxed: JobRunner = Box::new(move |ctx| Box::pin(runner(ctx)));
        let id = Uuid::new_v4();
        let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        let record = JobRecord {
            id,
            state: JobState::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            events: VecDeque::new(),
            tx,
            cancel: None,
        };
        let snapshot = record.snapshot();

        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.jobs.insert(id, record);
            inner.history.push_back(id);
            evict_history(&mut inner);
            inner.queue.push_back(id);
            inner.pending.insert(id, boxed);
        }
        info!(job_id = %id, "job enqueued");

        self.drain();
        snapshot
    }

    pub fn get(&self, id: Uuid) -> Option<JobSnapshot> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.jobs.get(&id).map(JobRecord::snapshot)
    }

    pub fn counts_by_state(&self) -> HashMap<&'static str, usize> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut counts = HashMap::new();
        for record in inner.jobs.values() {
            let key = match record.state {
                JobState::Queued => "queued",
                JobState::Running => "running",
                JobState::Done => "done",
                JobState::Error => "error",
                JobState::Cancelled => "cancelled",
            };
            *counts.entry(key).or_insert(0) += 1;
        }
        counts
    }

    /// Replay-then-follow subscription: the returned events are everything
    /// in the ring at subscribe time, and the receiver carries every event
    /// emitted after it, with no gap between the two.
    pub fn subscribe(
        &self,
        id: Uuid,
    ) -> Option<(Vec<JobEvent>, broadcast::Receiver<JobEvent>)> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.jobs.get(&id).map(|record| {
            let rx = record.tx.subscribe();
            (record.events.iter().cloned().collect(), rx)
        })
    }

    /// Cancel a queued or running job. Terminal jobs report a conflict via
    /// `None`.
    pub fn cancel(&self, id: Uuid) -> Option<Result<JobSnapshot, ()>> {
        let (cancel, result) = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let record = inner.jobs.get_mut(&id)?;
            match record.state {
                state if state.is_terminal() => (None, Err(())),
                JobState::Queued => {
                    record.state = JobState::Cancelled;
                    record.finished_at = Some(Utc::now());
                    record.emit(JobEvent::State {
                        state: JobState::Cancelled,
                        message: None,
                    });
                    let snapshot = record.snapshot();
                    inner.queue.retain(|queued| *queued != id);
                    inner.pending.remove(&id);
                    (None, Ok(snapshot))
                }
                _ => {
                    record.state = JobState::Cancelled;
                    record.finished_at = Some(Utc::now());
                    record.emit(JobEvent::State {
                        state: JobState::Cancelled,
                        message: None,
                    });
                    (record.cancel.take(), Ok(record.snapshot()))
                }
            }
        };

        if let Some(cancel) = cancel {
            cancel();
        }
        if result.is_ok() {
            info!(job_id = %id, "job cancelled");
        }
        Some(result)
    }

    /// Start queued jobs while slots are free.
    fn drain(&self) {
        loop {
            let started = {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if inner.running >= self.max_concurrent {
                    return;
                }
                let Some(id) = next_startable(&mut inner) else {
                    return;
                };
                let Some(runner) = inner.pending.remove(&id) else {
                    continue;
                };
                inner.running += 1;
                let record = inner
                    .jobs
                    .get_mut(&id)
                    .expect("queued job has a record");
                record.state = JobState::Running;
                record.started_at = Some(Utc::now());
                record.emit(JobEvent::State {
                    state: JobState::Running,
                    message: None,
                });
                (id, runner)
            };

            let (id, runner) = started;
            let manager = self.clone();
            tokio::spawn(async move {
                manager.run_job(id, runner).await;
            });
        }
    }

    async fn run_job(self, id: Uuid, runner: JobRunner) {
        let ctx = JobContext {
            id,
            inner: self.inner.clone(),
        };
        let outcome = tokio::time::timeout(self.timeout, runner(ctx)).await;

        match outcome {
            Ok(Ok(())) => self.finish(id, JobState::Done, None, None),
            Ok(Err(err)) => {
                warn!(job_id = %id, error = %err, "job runner failed");
                self.finish(
                    id,
                    JobState::Error,
                    Some(JobError {
                        error_code: "internal_error".to_string(),
                        message: err.to_string(),
                    }),
                    None,
                );
            }
            Err(_) => {
                warn!(job_id = %id, "job timed out");
                let cancel = {
                    let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                    inner.jobs.get_mut(&id).and_then(|record| record.cancel.take())
                };
                if let Some(cancel) = cancel {
                    cancel();
                }
                self.finish(
                    id,
                    JobState::Error,
                    Some(JobError {
                        error_code: "timeout".to_string(),
                        message: "Timed out".to_string(),
                    }),
                    Some("Timed out".to_string()),
                );
            }
        }

        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.running = inner.running.saturating_sub(1);
        }
        self.drain();
    }

    /// Transition to a terminal state unless one was already reached (a
    /// cancelled job's late resolution must not overwrite it).
    fn finish(
        &self,
        id: Uuid,
        state: JobState,
        error: Option<JobError>,
        message: Option<String>,
    ) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(record) = inner.jobs.get_mut(&id) else {
            return;
        };
        if record.state.is_terminal() {
            return;
        }
        record.state = state;
        record.finished_at = Some(Utc::now());
        record.error = error;
        record.cancel = None;
        record.emit(JobEvent::State { state, message });
        info!(job_id = %id, state = ?state, "job finished");
    }
}

fn next_startable(inner: &mut Inner) -> Option<Uuid> {
    while let Some(id) = inner.queue.pop_front() {
        if inner
            .jobs
            .get(&id)
            .is_some_and(|record| record.state == JobState::Queued)
        {
            return Some(id);
        }
    }
    None
}

/// Keep at most `HISTORY_CAPACITY` records, evicting the oldest terminal
/// jobs first. Live jobs are never dropped.
fn evict_history(inner: &mut Inner) {
    while inner.history.len() > HISTORY_CAPACITY {
        let Some(position) = inner.history.iter().position(|id| {
            inner
                .jobs
                .get(id)
                .is_none_or(|record| record.state.is_terminal())
        }) else {
            return;
        };
        let id = inner.history.remove(position).expect("position is in range");
        inner.jobs.remove(&id);
        inner.pending.remove(&id);
    }
}
