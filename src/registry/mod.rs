//! The session registry: authoritative mapping from `session_id` to a target
//! record and its assignment state.
//!
//! The controller is the registry's only writer. Workers never touch it
//! directly; every transition here is driven by the claim/ack/revoke/release
//! message protocol, which keeps ownership changes for a given `session_id`
//! totally ordered without any distributed locking.

pub mod target;

use std::collections::HashMap;
use std::time::Instant;

use uuid::Uuid;

pub use target::{SessionMode, SessionTarget, TargetSpec, TargetState};

/// Per-session liveness as reported by the owning worker in a check-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SessionLiveness {
    Active,
    Retrying,
}

/// One record plus its assignment state.
#[derive(Debug, Clone)]
pub struct TargetEntry {
    pub target: SessionTarget,
    pub state: TargetState,
}

/// Outcome of one inventory upsert pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub admitted: usize,
    pub refreshed: usize,
    pub draining: usize,
    pub retired: usize,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: HashMap<Uuid, TargetEntry>,
    by_host: HashMap<String, Uuid>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one aggregation pass.
    ///
    /// New hosts are admitted with a fresh `session_id`; known hosts keep
    /// their identity and refresh connection parameters; hosts absent from
    /// `specs` are retired immediately when unowned, or marked stale and left
    /// to drain when a worker still holds their session.
    pub fn upsert_inventory(&mut self, specs: Vec<TargetSpec>) -> UpsertSummary {
        let mut summary = UpsertSummary::default();
        let mut seen: Vec<String> = Vec::with_capacity(specs.len());

        for spec in specs {
            seen.push(spec.host.clone());
            match self.by_host.get(&spec.host) {
                Some(id) => {
                    let entry = self
                        .entries
                        .get_mut(id)
                        .expect("by_host index out of sync with entries");
                    entry.target.refresh_from(spec);
                    summary.refreshed += 1;
                }
                None => {
                    let target = SessionTarget::from_spec(spec);
                    tracing::info!(
                        session_id = %target.session_id,
                        host = %target.host,
                        "Target admitted to registry"
                    );
                    self.by_host.insert(target.host.clone(), target.session_id);
                    self.entries.insert(
                        target.session_id,
                        TargetEntry {
                            target,
                            state: TargetState::Unassigned,
                        },
                    );
                    summary.admitted += 1;
                }
            }
        }

        // Sweep hosts that vanished from the inventory.
        let missing: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|(_, e)| !seen.contains(&e.target.host))
            .map(|(id, _)| *id)
            .collect();

        for id in missing {
            let owned = self
                .entries
                .get(&id)
                .map(|e| e.state.owner().is_some())
                .unwrap_or(false);
            if owned {
                let entry = self.entries.get_mut(&id).expect("entry just observed");
                if !entry.target.stale {
                    tracing::info!(
                        session_id = %id,
                        host = %entry.target.host,
                        "Target left inventory while in session, draining"
                    );
                }
                entry.target.stale = true;
                summary.draining += 1;
            } else {
                self.retire(id);
                summary.retired += 1;
            }
        }

        summary
    }

    fn retire(&mut self, session_id: Uuid) {
        if let Some(entry) = self.entries.remove(&session_id) {
            self.by_host.remove(&entry.target.host);
            tracing::info!(
                session_id = %session_id,
                host = %entry.target.host,
                "Target retired"
            );
        }
    }

    pub fn get(&self, session_id: &Uuid) -> Option<&TargetEntry> {
        self.entries.get(session_id)
    }

    pub fn all_entries(&self) -> Vec<&TargetEntry> {
        let mut entries: Vec<&TargetEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.target.created_at);
        entries
    }

    /// Targets eligible for a new claim: unassigned and not draining.
    pub fn assignable(&self) -> Vec<&SessionTarget> {
        let mut targets: Vec<&SessionTarget> = self
            .entries
            .values()
            .filter(|e| e.state == TargetState::Unassigned && !e.target.stale)
            .map(|e| &e.target)
            .collect();
        // Deterministic claim order for reproducible assignment passes
        targets.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        targets
    }

    pub fn sessions_of(&self, worker: Uuid) -> Vec<Uuid> {
        self.entries
            .iter()
            .filter(|(_, e)| e.state.owner() == Some(worker))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Move an unassigned target to claim-pending and return the record to
    /// send in the assign command. Refuses anything not currently
    /// unassigned, which is what makes double-claims impossible.
    pub fn begin_claim(
        &mut self,
        session_id: Uuid,
        worker: Uuid,
        deadline: Instant,
    ) -> Option<SessionTarget> {
        let entry = self.entries.get_mut(&session_id)?;
        if entry.state != TargetState::Unassigned || entry.target.stale {
            return None;
        }
        entry.state = TargetState::ClaimPending { worker, deadline };
        Some(entry.target.clone())
    }

    /// Apply a worker's ack. Only a claim pending for that exact worker
    /// transitions to assigned; duplicate or stray acks are no-ops.
    pub fn complete_claim(&mut self, session_id: Uuid, worker: Uuid) -> bool {
        let Some(entry) = self.entries.get_mut(&session_id) else {
            tracing::warn!(session_id = %session_id, worker_id = %worker, "Ack for unknown target");
            return false;
        };
        match entry.state {
            TargetState::ClaimPending { worker: offered, .. } if offered == worker => {
                entry.state = TargetState::Assigned { worker };
                entry.target.assigned_worker = Some(worker);
                tracing::info!(
                    session_id = %session_id,
                    worker_id = %worker,
                    host = %entry.target.host,
                    "Target assigned"
                );
                true
            }
            TargetState::Assigned { worker: owner }
            | TargetState::SessionActive { worker: owner }
            | TargetState::SessionRetrying { worker: owner }
                if owner == worker =>
            {
                // Duplicate ack delivery
                false
            }
            _ => {
                tracing::warn!(
                    session_id = %session_id,
                    worker_id = %worker,
                    state = %entry.state,
                    "Ack does not match outstanding claim, ignoring"
                );
                false
            }
        }
    }

    /// Return expired claims to the unassigned pool. Yields the offered
    /// worker with each session so the caller can drop the reservation.
    pub fn expire_claims(&mut self, now: Instant) -> Vec<(Uuid, Uuid)> {
        let mut expired = Vec::new();
        for (id, entry) in self.entries.iter_mut() {
            if let TargetState::ClaimPending { worker, deadline } = entry.state {
                if deadline <= now {
                    tracing::warn!(
                        session_id = %id,
                        worker_id = %worker,
                        host = %entry.target.host,
                        "Claim timed out, returning target to pool"
                    );
                    entry.state = TargetState::Unassigned;
                    expired.push((*id, worker));
                }
            }
        }
        expired
    }

    /// Apply a worker's `released` reply. Clears ownership; a draining
    /// target retires here instead of returning to the pool.
    pub fn release(&mut self, session_id: Uuid, worker: Uuid) -> bool {
        let Some(entry) = self.entries.get_mut(&session_id) else {
            return false;
        };
        if entry.state.owner() != Some(worker) {
            tracing::warn!(
                session_id = %session_id,
                worker_id = %worker,
                "Release from a worker that does not own the session, ignoring"
            );
            return false;
        }
        entry.target.assigned_worker = None;
        entry.target.protocol_session_handle = None;
        if entry.target.stale {
            self.retire(session_id);
        } else {
            entry.state = TargetState::Unassigned;
            tracing::info!(session_id = %session_id, worker_id = %worker, "Target released");
        }
        true
    }

    /// Return every session owned (or offered to) a dead worker to the pool
    /// at once. No drain: the worker cannot be trusted to close gracefully.
    pub fn release_worker(&mut self, worker: Uuid) -> Vec<Uuid> {
        let owned = self.sessions_of(worker);
        for id in &owned {
            let entry = self.entries.get_mut(id).expect("session listed as owned");
            entry.target.assigned_worker = None;
            entry.target.protocol_session_handle = None;
            if entry.target.stale {
                self.retire(*id);
            } else {
                entry.state = TargetState::Unassigned;
            }
        }
        if !owned.is_empty() {
            tracing::info!(
                worker_id = %worker,
                released = owned.len(),
                "Released all sessions of dead worker"
            );
        }
        owned
    }

    /// Fold one check-in session report into the record. Liveness and the
    /// remote protocol handle only ever flow in via check-ins.
    pub fn apply_session_report(
        &mut self,
        session_id: Uuid,
        worker: Uuid,
        liveness: SessionLiveness,
        handle: Option<u64>,
    ) {
        let Some(entry) = self.entries.get_mut(&session_id) else {
            return;
        };
        if !entry.state.is_owned() || entry.state.owner() != Some(worker) {
            return;
        }
        entry.state = match liveness {
            SessionLiveness::Active => TargetState::SessionActive { worker },
            SessionLiveness::Retrying => TargetState::SessionRetrying { worker },
        };
        entry.target.protocol_session_handle = match liveness {
            SessionLiveness::Active => handle,
            SessionLiveness::Retrying => None,
        };
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
