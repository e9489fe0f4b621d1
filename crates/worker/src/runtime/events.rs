//! SSE event fan-out.
//!
//! A single broadcast channel feeds every connected `/api/stream/events`
//! client. Publishing never blocks; slow subscribers lag and are told so.

use serde::Serialize;
use tokio::sync::broadcast;

/// Channel capacity before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    Observation {
        id: i64,
        project: String,
        kind: String,
        title: Option<String>,
    },
    Summary {
        id: i64,
        project: String,
        request: Option<String>,
    },
    ProcessingStatus {
        active_sessions: usize,
        queued: i64,
    },
    SessionStart {
        session_db_id: i64,
        content_session_id: String,
        project: String,
    },
    SessionEnd {
        session_db_id: i64,
        content_session_id: String,
    },
    Log {
        level: String,
        message: String,
    },
}

impl WorkerEvent {
    /// SSE `event:` field name.
    pub fn event_name(&self) -> &'static str {
        match self {
            WorkerEvent::Observation { .. } => "observation",
            WorkerEvent::Summary { .. } => "summary",
            WorkerEvent::ProcessingStatus { .. } => "processing_status",
            WorkerEvent::SessionStart { .. } => "session_start",
            WorkerEvent::SessionEnd { .. } => "session_end",
            WorkerEvent::Log { .. } => "log",
        }
    }
}

#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<WorkerEvent>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish to all current subscribers. A send with no subscribers is
    /// fine - the event is simply dropped.
    pub fn publish(&self, event: WorkerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
