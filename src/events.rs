//! # Status Distribution Hub
//!
//! Fans job-state changes out to subscribed clients. Each owner gets a
//! broadcast channel; transport adapters (the WebSocket actor, and any
//! future transport) subscribe to the channel for their own identity and
//! forward events verbatim. The orchestration core publishes here and never
//! knows which transport, if any, is listening.
//!
//! ## Ordering:
//! Publishers mutate the job record first and publish second, and each job
//! is driven by a single task, so subscribers observe non-decreasing
//! progress and exactly one terminal event per job, after all of its
//! status updates.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;

use crate::jobs::job::JobSnapshot;

/// Buffered events per owner channel before slow subscribers start losing
/// the oldest entries.
const CHANNEL_CAPACITY: usize = 64;

/// A push event as delivered to subscribers.
///
/// Every variant carries the same snapshot the poll endpoint serves, so a
/// client can switch between channels without loss of information. The
/// `failed` variant additionally carries the classified error pair, and
/// `cancelled` is terminal and distinct from both completion and failure.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum StatusEvent {
    #[serde(rename = "status-update")]
    StatusUpdate {
        #[serde(flatten)]
        snapshot: JobSnapshot,
    },

    #[serde(rename = "completed")]
    Completed {
        #[serde(flatten)]
        snapshot: JobSnapshot,
    },

    #[serde(rename = "failed")]
    Failed {
        #[serde(flatten)]
        snapshot: JobSnapshot,
        error: String,
        details: String,
    },

    #[serde(rename = "cancelled")]
    Cancelled {
        #[serde(flatten)]
        snapshot: JobSnapshot,
        message: String,
    },
}

impl StatusEvent {
    /// Job this event belongs to.
    pub fn job_id(&self) -> &str {
        match self {
            StatusEvent::StatusUpdate { snapshot }
            | StatusEvent::Completed { snapshot }
            | StatusEvent::Failed { snapshot, .. }
            | StatusEvent::Cancelled { snapshot, .. } => &snapshot.job_id,
        }
    }

    /// Whether this event ends the job's event stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StatusEvent::StatusUpdate { .. })
    }
}

/// Per-owner fan-out of status events.
///
/// ## Lifecycle:
/// Created once at process start and injected wherever events are produced
/// or consumed. Channels are created lazily on first use and dropped when
/// the last subscriber disconnects and the next publish finds no receivers.
pub struct StatusHub {
    channels: RwLock<HashMap<String, broadcast::Sender<StatusEvent>>>,
}

impl StatusHub {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Publish an event to every subscriber of `owner_id`'s channel.
    ///
    /// Publishing with no subscribers is a no-op; the poll channel remains
    /// available for clients that never connect a socket.
    pub fn publish(&self, owner_id: &str, event: StatusEvent) {
        let mut channels = self.channels.write().unwrap();
        let stale = match channels.get(owner_id) {
            Some(sender) => sender.send(event).is_err(),
            None => return,
        };
        if stale {
            // Last receiver is gone; drop the channel.
            channels.remove(owner_id);
        }
    }

    /// Subscribe to the channel for `owner_id`.
    ///
    /// Callers must only pass their own authenticated identity; the
    /// transport adapter enforces that before calling here.
    pub fn subscribe(&self, owner_id: &str) -> broadcast::Receiver<StatusEvent> {
        let mut channels = self.channels.write().unwrap();
        channels
            .entry(owner_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Number of live owner channels, for the metrics endpoint.
    pub fn channel_count(&self) -> usize {
        self.channels.read().unwrap().len()
    }
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Advance a job's progress and fan the update out, in that order.
///
/// Mutate-then-publish: the registry record is updated before any
/// subscriber can observe the event, so poll and push never disagree. The
/// update is silently dropped once the job is cancelling or terminal.
pub fn publish_progress(hub: &StatusHub, job: &crate::jobs::job::Job, progress: u8, stage: &str) {
    if job.advance(progress, stage) {
        hub.publish(
            &job.owner_id,
            StatusEvent::StatusUpdate {
                snapshot: job.snapshot(),
            },
        );
    }
}
