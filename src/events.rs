//! Per-job progress fan-out.
//!
//! Each subscriber gets its own unbounded channel, so publishing is a
//! non-blocking send and a slow reader only grows its own queue. Events for
//! one job reach every subscriber in publish order. There is no history
//! replay; [`ProgressPublisher::subscribe_with_snapshot`] prepends a
//! synthetic `connected` event carrying the current state instead.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::pipeline::{Job, Stage, WorkflowState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Synthetic first event for a new subscriber.
    Connected { state: WorkflowState, progress: u8 },
    StateChanged {
        from: WorkflowState,
        to: WorkflowState,
        progress: u8,
    },
    LogLine { message: String },
    StageCompleted { stage: Stage, confidence: f64 },
    JobTerminal {
        state: WorkflowState,
        success: bool,
        audit_failed: bool,
        error_message: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl ProgressEvent {
    pub fn new(job_id: &str, kind: EventKind) -> Self {
        Self {
            job_id: job_id.to_string(),
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Event name used by server-push transports.
    pub fn event_type(&self) -> &'static str {
        match &self.kind {
            EventKind::Connected { .. } => "connected",
            EventKind::StateChanged { .. } => "progress",
            EventKind::LogLine { .. } => "log",
            EventKind::StageCompleted { .. } => "stage_complete",
            EventKind::JobTerminal { success: true, .. } => "complete",
            EventKind::JobTerminal { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::JobTerminal { .. })
    }
}

pub type EventStream = mpsc::UnboundedReceiver<ProgressEvent>;

#[derive(Default)]
pub struct ProgressPublisher {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<ProgressEvent>>>>,
}

impl ProgressPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to a job's future events.
    pub fn subscribe(&self, job_id: &str) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().entry(job_id.to_string()).or_default().push(tx);
        rx
    }

    /// Attach and receive a `connected` event describing `job` first.
    ///
    /// Subscribing to a job that is already terminal yields the snapshot and
    /// the terminal event, then the stream ends.
    pub fn subscribe_with_snapshot(&self, job: &Job) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let connected = ProgressEvent::new(
            &job.id,
            EventKind::Connected {
                state: job.state,
                progress: job.progress(),
            },
        );
        // The receiver is alive, so these sends cannot fail.
        let _ = tx.send(connected);
        if job.is_terminal() {
            let _ = tx.send(ProgressEvent::new(&job.id, terminal_kind(job)));
        } else {
            self.lock().entry(job.id.clone()).or_default().push(tx);
        }
        rx
    }

    /// Deliver `kind` to every live subscriber of `job_id`.
    ///
    /// Never blocks. Closed subscribers are dropped; a terminal event also
    /// releases every subscriber of the job, ending their streams.
    pub fn publish(&self, job_id: &str, kind: EventKind) {
        let event = ProgressEvent::new(job_id, kind);
        let terminal = event.is_terminal();
        let mut subscribers = self.lock();

        let Some(senders) = subscribers.get_mut(job_id) else {
            return;
        };
        senders.retain(|tx| tx.send(event.clone()).is_ok());
        debug!(job_id, event = event.event_type(), receivers = senders.len(), "published");
        let release = terminal || senders.is_empty();
        if release {
            subscribers.remove(job_id);
        }
    }

    pub fn log(&self, job_id: &str, message: impl Into<String>) {
        self.publish(
            job_id,
            EventKind::LogLine {
                message: message.into(),
            },
        );
    }

    pub fn subscriber_count(&self, job_id: &str) -> usize {
        self.lock().get(job_id).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<mpsc::UnboundedSender<ProgressEvent>>>> {
        // A poisoned map only means a panic happened mid-publish; the map itself is intact.
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Terminal event describing a finished job.
pub fn terminal_kind(job: &Job) -> EventKind {
    EventKind::JobTerminal {
        state: job.state,
        success: job.success,
        audit_failed: job.audit_failed,
        error_message: job.error_message.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{JobInput, StateMachine};

    fn job() -> Job {
        Job::new(JobInput {
            job_description: "Security engineer".into(),
            baseline_document: "Pentests, threat models.".into(),
            sources: Vec::new(),
        })
    }

    fn log(n: usize) -> EventKind {
        EventKind::LogLine {
            message: format!("line {n}"),
        }
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order_for_every_subscriber() {
        let publisher = ProgressPublisher::new();
        let mut a = publisher.subscribe("job-1");
        let mut b = publisher.subscribe("job-1");

        for n in 0..50 {
            publisher.publish("job-1", log(n));
        }

        for rx in [&mut a, &mut b] {
            for n in 0..50 {
                assert_eq!(rx.recv().await.unwrap().kind, log(n));
            }
        }
    }

    #[test]
    fn publishing_without_subscribers_is_a_no_op() {
        let publisher = ProgressPublisher::new();
        publisher.log("nobody", "hello");
        assert_eq!(publisher.subscriber_count("nobody"), 0);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let publisher = ProgressPublisher::new();
        let keep = publisher.subscribe("job-1");
        drop(publisher.subscribe("job-1"));
        publisher.log("job-1", "x");
        assert_eq!(publisher.subscriber_count("job-1"), 1);
        drop(keep);
    }

    #[tokio::test]
    async fn late_subscriber_gets_snapshot_then_new_events_only() {
        let publisher = ProgressPublisher::new();
        let mut job = job();
        publisher.log(&job.id, "before subscribe");
        StateMachine::advance(&mut job).unwrap();

        let mut rx = publisher.subscribe_with_snapshot(&job);
        publisher.log(&job.id, "after subscribe");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type(), "connected");
        assert_eq!(
            first.kind,
            EventKind::Connected {
                state: WorkflowState::GapAnalysis,
                progress: 10
            }
        );
        let second = rx.recv().await.unwrap();
        assert_eq!(
            second.kind,
            EventKind::LogLine {
                message: "after subscribe".into()
            }
        );
    }

    #[tokio::test]
    async fn terminal_event_closes_streams() {
        let publisher = ProgressPublisher::new();
        let mut rx = publisher.subscribe("job-1");
        publisher.publish(
            "job-1",
            EventKind::JobTerminal {
                state: WorkflowState::Failed,
                success: false,
                audit_failed: false,
                error_message: Some("boom".into()),
            },
        );
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "error");
        assert!(rx.recv().await.is_none());
        assert_eq!(publisher.subscriber_count("job-1"), 0);
    }

    #[tokio::test]
    async fn snapshot_of_finished_job_ends_immediately() {
        let publisher = ProgressPublisher::new();
        let mut job = job();
        StateMachine::fail(&mut job, "cancelled by operator").unwrap();

        let mut rx = publisher.subscribe_with_snapshot(&job);
        assert_eq!(rx.recv().await.unwrap().event_type(), "connected");
        assert_eq!(rx.recv().await.unwrap().event_type(), "error");
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = ProgressEvent::new(
            "job-9",
            EventKind::StageCompleted {
                stage: Stage::Tailoring,
                confidence: 0.5,
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stage_completed");
        assert_eq!(json["stage"], "tailoring");
        assert_eq!(json["job_id"], "job-9");
        assert_eq!(event.event_type(), "stage_complete");
    }
}
