//! Coordination channel between the controller and the worker pool.
//!
//! Everything the pool agrees on travels as [`Message`]s over a topic-based
//! pub/sub bus: the controller publishes assign/revoke commands to a
//! per-worker topic, workers publish acks, releases, announcements, and
//! check-ins to the controller topic. Message handling is idempotent on both
//! sides, so duplicate delivery from a real broker is harmless.

pub mod bus;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::registry::{SessionLiveness, SessionTarget};

pub use bus::{BusHandle, CoordinationBus, InProcessBus};

/// Topic the controller listens on.
pub const CONTROLLER_TOPIC: &str = "netherd.controller";

/// Topic a single worker listens on.
pub fn worker_topic(worker_id: Uuid) -> String {
    format!("netherd.worker.{worker_id}")
}

/// Per-session slice of a check-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub liveness: SessionLiveness,
    /// Remote protocol session id, when the session is up
    pub handle: Option<u64>,
    /// Errors observed on this session since the last check-in
    pub errors: u64,
}

/// Worker → controller health and load report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkin {
    pub worker_id: Uuid,
    pub auth_key: Uuid,
    pub session_count: usize,
    pub events_since_checkin: u64,
    pub sessions: Vec<SessionReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// Controller → worker: offer of a target. Ownership is established only
    /// by the matching ack.
    Assign {
        session_id: Uuid,
        target: SessionTarget,
    },
    /// Worker → controller: claim accepted.
    Ack {
        session_id: Uuid,
        worker_id: Uuid,
        auth_key: Uuid,
    },
    /// Controller → worker: close the session and give the target back.
    Revoke { session_id: Uuid },
    /// Worker → controller: session closed, target no longer held.
    Released {
        session_id: Uuid,
        worker_id: Uuid,
        auth_key: Uuid,
    },
    Checkin(Checkin),
    /// Worker → controller: joins the pool.
    WorkerAnnounce {
        worker_id: Uuid,
        auth_key: Uuid,
        capacity: usize,
    },
    /// Controller → worker: fencing notice, the worker has been declared
    /// dead and must stop all sessions.
    WorkerDead { worker_id: Uuid },
}

impl Message {
    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Assign { .. } => "assign",
            Message::Ack { .. } => "ack",
            Message::Revoke { .. } => "revoke",
            Message::Released { .. } => "released",
            Message::Checkin(_) => "checkin",
            Message::WorkerAnnounce { .. } => "worker_announce",
            Message::WorkerDead { .. } => "worker_dead",
        }
    }
}
