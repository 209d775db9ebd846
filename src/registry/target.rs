use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    #[default]
    Default,
    Replay,
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionMode::Default => write!(f, "default"),
            SessionMode::Replay => write!(f, "replay"),
        }
    }
}

/// Connection description produced by a datastore. Carries no registry
/// identity; the registry mints a `session_id` when the spec is admitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSpec {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub protocol_filter: Option<String>,
    pub mode: SessionMode,
    /// Adapter-specific metadata (site, role, vendor tags, ...)
    #[serde(default)]
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl TargetSpec {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 830,
            username: None,
            password: None,
            protocol_filter: None,
            mode: SessionMode::Default,
            meta: serde_json::Map::new(),
        }
    }
}

/// One device the pool should hold a session to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTarget {
    /// Registry-assigned identity; set exactly once, never reused while the
    /// record exists.
    pub session_id: Uuid,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub protocol_filter: Option<String>,
    pub mode: SessionMode,
    #[serde(default)]
    pub meta: serde_json::Map<String, serde_json::Value>,
    /// Remote protocol session id, present only while a session is live
    pub protocol_session_handle: Option<u64>,
    pub assigned_worker: Option<Uuid>,
    /// Set when the host vanished from the latest aggregation pass; a stale
    /// target takes no new assignment and is retired once its session closes.
    pub stale: bool,
    pub created_at: DateTime<Utc>,
}

impl SessionTarget {
    pub fn from_spec(spec: TargetSpec) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            host: spec.host,
            port: spec.port,
            username: spec.username,
            password: spec.password,
            protocol_filter: spec.protocol_filter,
            mode: spec.mode,
            meta: spec.meta,
            protocol_session_handle: None,
            assigned_worker: None,
            stale: false,
            created_at: Utc::now(),
        }
    }

    /// Refresh connection parameters from a newer spec for the same host,
    /// keeping registry identity and assignment state.
    pub fn refresh_from(&mut self, spec: TargetSpec) {
        debug_assert_eq!(self.host, spec.host);
        self.port = spec.port;
        self.username = spec.username;
        self.password = spec.password;
        self.protocol_filter = spec.protocol_filter;
        self.mode = spec.mode;
        self.meta = spec.meta;
        self.stale = false;
    }
}

/// Assignment state machine for one target.
///
/// `Unassigned → ClaimPending → Assigned → (SessionActive ⇄ SessionRetrying)`
/// then back to `Unassigned` on release or worker death. Retirement is
/// terminal and removes the record from the registry outright, so it has no
/// state here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Unassigned,
    /// An assign command is outstanding; ownership is not established until
    /// the worker acks, and the claim expires at `deadline`.
    ClaimPending { worker: Uuid, deadline: Instant },
    Assigned { worker: Uuid },
    SessionActive { worker: Uuid },
    SessionRetrying { worker: Uuid },
}

impl TargetState {
    /// The worker that currently owns (or is being offered) this target.
    pub fn owner(&self) -> Option<Uuid> {
        match self {
            TargetState::Unassigned => None,
            TargetState::ClaimPending { worker, .. }
            | TargetState::Assigned { worker }
            | TargetState::SessionActive { worker }
            | TargetState::SessionRetrying { worker } => Some(*worker),
        }
    }

    /// True once a worker has acked, i.e. it owns the session.
    pub fn is_owned(&self) -> bool {
        matches!(
            self,
            TargetState::Assigned { .. }
                | TargetState::SessionActive { .. }
                | TargetState::SessionRetrying { .. }
        )
    }
}

impl std::fmt::Display for TargetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetState::Unassigned => write!(f, "unassigned"),
            TargetState::ClaimPending { worker, .. } => write!(f, "claim-pending({worker})"),
            TargetState::Assigned { worker } => write!(f, "assigned({worker})"),
            TargetState::SessionActive { worker } => write!(f, "session-active({worker})"),
            TargetState::SessionRetrying { worker } => write!(f, "session-retrying({worker})"),
        }
    }
}
