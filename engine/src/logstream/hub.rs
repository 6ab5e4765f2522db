//! Log hub
//!
//! Sequence numbers are assigned under the hub lock, so events of one job are
//! numbered 1, 2, 3... with no gaps and reach every subscriber in that order.
//! A late subscriber first replays the job's history and then follows live
//! events. The terminal event closes the job's stream.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// One line of a job's log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub job_id: Uuid,
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub is_terminal: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogStreamError {
    #[error("log stream for job {0} is closed")]
    Closed(Uuid),
}

/// Hub settings
#[derive(Debug, Clone)]
pub struct LogHubOptions {
    /// Live buffer per job before slow subscribers lag
    pub channel_capacity: usize,

    /// Closed jobs kept for late subscribers
    pub retained_closed_jobs: usize,

    /// History kept per job
    pub max_events_per_job: usize,
}

impl Default for LogHubOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            retained_closed_jobs: 512,
            max_events_per_job: 10_000,
        }
    }
}

struct JobLog {
    history: VecDeque<LogEvent>,
    next_sequence: u64,
    closed: bool,
    sender: broadcast::Sender<LogEvent>,
}

impl JobLog {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            history: VecDeque::new(),
            next_sequence: 1,
            closed: false,
            sender,
        }
    }
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, JobLog>,
    closed_order: VecDeque<Uuid>,
}

pub struct LogHub {
    options: LogHubOptions,
    inner: Mutex<Inner>,
}

impl LogHub {
    pub fn new(options: LogHubOptions) -> Self {
        Self {
            options,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a non-terminal event
    pub fn emit(&self, job_id: Uuid, message: impl Into<String>) -> Result<LogEvent, LogStreamError> {
        self.push(job_id, message.into(), false)
    }

    /// Append the terminal event and close the job's stream
    pub fn emit_terminal(
        &self,
        job_id: Uuid,
        message: impl Into<String>,
    ) -> Result<LogEvent, LogStreamError> {
        self.push(job_id, message.into(), true)
    }

    fn push(&self, job_id: Uuid, message: String, terminal: bool) -> Result<LogEvent, LogStreamError> {
        let mut inner = self.lock();
        let capacity = self.options.channel_capacity;
        let log = inner
            .jobs
            .entry(job_id)
            .or_insert_with(|| JobLog::new(capacity));
        if log.closed {
            return Err(LogStreamError::Closed(job_id));
        }

        let event = LogEvent {
            job_id,
            sequence_number: log.next_sequence,
            timestamp: Utc::now(),
            message,
            is_terminal: terminal,
        };
        log.next_sequence += 1;
        log.history.push_back(event.clone());
        if log.history.len() > self.options.max_events_per_job {
            log.history.pop_front();
        }
        // No receivers is fine
        let _ = log.sender.send(event.clone());

        if terminal {
            log.closed = true;
            inner.closed_order.push_back(job_id);
            while inner.closed_order.len() > self.options.retained_closed_jobs {
                if let Some(evicted) = inner.closed_order.pop_front() {
                    inner.jobs.remove(&evicted);
                    debug!("Evicted log history of job {}", evicted);
                }
            }
        }
        Ok(event)
    }

    /// Snapshot of everything emitted so far for a job
    pub fn history(&self, job_id: Uuid) -> Vec<LogEvent> {
        self.lock()
            .jobs
            .get(&job_id)
            .map(|log| log.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether the job's terminal event was emitted
    pub fn is_closed(&self, job_id: Uuid) -> bool {
        self.lock()
            .jobs
            .get(&job_id)
            .map(|log| log.closed)
            .unwrap_or(false)
    }

    /// Subscribe to a job's log. History and the live receiver are taken
    /// under one lock, so no event is missed or seen twice.
    pub fn subscribe(self: &Arc<Self>, job_id: Uuid) -> LogSubscription {
        let mut inner = self.lock();
        let capacity = self.options.channel_capacity;
        let log = inner
            .jobs
            .entry(job_id)
            .or_insert_with(|| JobLog::new(capacity));

        let backlog: VecDeque<LogEvent> = log.history.iter().cloned().collect();
        let receiver = if log.closed {
            None
        } else {
            Some(log.sender.subscribe())
        };

        LogSubscription {
            hub: Arc::clone(self),
            job_id,
            backlog,
            receiver,
            last_sequence: 0,
            finished: false,
        }
    }
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new(LogHubOptions::default())
    }
}

/// Ordered view of one job's log
pub struct LogSubscription {
    hub: Arc<LogHub>,
    job_id: Uuid,
    backlog: VecDeque<LogEvent>,
    receiver: Option<broadcast::Receiver<LogEvent>>,
    last_sequence: u64,
    finished: bool,
}

impl LogSubscription {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Next event in sequence order, `None` once the stream is closed
    pub async fn next_event(&mut self) -> Option<LogEvent> {
        loop {
            if self.finished {
                return None;
            }

            if let Some(event) = self.backlog.pop_front() {
                if event.sequence_number <= self.last_sequence {
                    continue;
                }
                return Some(self.deliver(event));
            }

            let receiver = match self.receiver.as_mut() {
                Some(receiver) => receiver,
                None => {
                    self.finished = true;
                    return None;
                }
            };

            match receiver.recv().await {
                Ok(event) => {
                    if event.sequence_number <= self.last_sequence {
                        continue;
                    }
                    return Some(self.deliver(event));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Log subscriber of job {} lagged by {} events, replaying history",
                        self.job_id, skipped
                    );
                    let last = self.last_sequence;
                    self.backlog = self
                        .hub
                        .history(self.job_id)
                        .into_iter()
                        .filter(|event| event.sequence_number > last)
                        .collect();
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    fn deliver(&mut self, event: LogEvent) -> LogEvent {
        self.last_sequence = event.sequence_number;
        if event.is_terminal {
            self.finished = true;
        }
        event
    }

    /// Consume into a stream that ends after the terminal event
    pub fn into_stream(self) -> BoxStream<'static, LogEvent> {
        stream::unfold(self, |mut subscription| async move {
            subscription
                .next_event()
                .await
                .map(|event| (event, subscription))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequence_starts_at_one() {
        let hub = LogHub::default();
        let job = Uuid::new_v4();

        let first = hub.emit(job, "Pulling image").unwrap();
        let second = hub.emit(job, "Reconciling").unwrap();
        assert_eq!(first.sequence_number, 1);
        assert_eq!(second.sequence_number, 2);
        assert!(!second.is_terminal);
    }

    #[tokio::test]
    async fn test_terminal_closes_stream() {
        let hub = LogHub::default();
        let job = Uuid::new_v4();

        hub.emit_terminal(job, "Deployment completed successfully!").unwrap();
        assert!(hub.is_closed(job));
        assert_eq!(hub.emit(job, "late"), Err(LogStreamError::Closed(job)));
        assert_eq!(hub.history(job).len(), 1);
    }

    #[tokio::test]
    async fn test_late_subscriber_replays_then_follows() {
        let hub = Arc::new(LogHub::default());
        let job = Uuid::new_v4();
        hub.emit(job, "one").unwrap();

        let mut subscription = hub.subscribe(job);
        hub.emit(job, "two").unwrap();
        hub.emit_terminal(job, "done").unwrap();

        let mut messages = Vec::new();
        while let Some(event) = subscription.next_event().await {
            messages.push(event.message);
        }
        assert_eq!(messages, vec!["one", "two", "done"]);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_recovers_from_history() {
        let hub = Arc::new(LogHub::new(LogHubOptions {
            channel_capacity: 2,
            ..LogHubOptions::default()
        }));
        let job = Uuid::new_v4();
        let subscription = hub.subscribe(job);

        for i in 0..10 {
            hub.emit(job, format!("line {}", i)).unwrap();
        }
        hub.emit_terminal(job, "done").unwrap();

        let events: Vec<LogEvent> = subscription.into_stream().collect().await;
        let sequence: Vec<u64> = events.iter().map(|e| e.sequence_number).collect();
        assert_eq!(sequence, (1..=11).collect::<Vec<_>>());
        assert!(events.last().unwrap().is_terminal);
    }

    #[tokio::test]
    async fn test_closed_jobs_are_evicted() {
        let hub = LogHub::new(LogHubOptions {
            retained_closed_jobs: 1,
            ..LogHubOptions::default()
        });
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        hub.emit_terminal(old, "done").unwrap();
        hub.emit_terminal(new, "done").unwrap();

        assert!(hub.history(old).is_empty());
        assert_eq!(hub.history(new).len(), 1);
    }
}
