use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::coordination::Checkin;

/// Controller-side view of one worker process.
#[derive(Debug, Clone)]
pub struct WorkerDescriptor {
    pub id: Uuid,
    /// Shared secret presented at announce time; every later message from
    /// this worker id must carry the same key.
    pub auth_key: Uuid,
    pub capacity: usize,
    /// Sessions currently owned by (or offered to) this worker
    pub sessions: HashSet<Uuid>,
    pub last_seen: Instant,
    pub total_events: u64,
    pub session_errors: HashMap<Uuid, u64>,
}

impl WorkerDescriptor {
    pub fn new(id: Uuid, auth_key: Uuid, capacity: usize) -> Self {
        Self {
            id,
            auth_key,
            capacity,
            sessions: HashSet::new(),
            last_seen: Instant::now(),
            total_events: 0,
            session_errors: HashMap::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn is_alive(&self, window: Duration) -> bool {
        self.last_seen.elapsed() < window
    }

    pub fn has_free_slot(&self) -> bool {
        self.sessions.len() < self.capacity
    }
}

/// Tracks the worker pool: announcements, authentication, liveness, and the
/// least-loaded assignment policy.
#[derive(Debug)]
pub struct WorkerDirectory {
    workers: HashMap<Uuid, WorkerDescriptor>,
    /// A worker silent for longer than this is dead
    dead_after: Duration,
}

impl WorkerDirectory {
    pub fn new(dead_after: Duration) -> Self {
        Self {
            workers: HashMap::new(),
            dead_after,
        }
    }

    /// Register a worker from its announce message. The auth key is trusted
    /// on first use; a re-announce for a live worker id with a different key
    /// is rejected so a rogue duplicate cannot hijack the id.
    pub fn announce(&mut self, id: Uuid, auth_key: Uuid, capacity: usize) -> bool {
        if let Some(existing) = self.workers.get_mut(&id) {
            if existing.auth_key != auth_key {
                tracing::warn!(worker_id = %id, "Announce with mismatched auth key rejected");
                return false;
            }
            // Same process re-announcing (e.g. after a bus reconnect)
            existing.capacity = capacity;
            existing.touch();
            return true;
        }
        tracing::info!(worker_id = %id, capacity, "Worker registered");
        self.workers
            .insert(id, WorkerDescriptor::new(id, auth_key, capacity));
        true
    }

    /// Validate the auth key on a message from `id`. Unknown workers fail.
    pub fn authenticate(&self, id: Uuid, auth_key: Uuid) -> bool {
        match self.workers.get(&id) {
            Some(w) if w.auth_key == auth_key => true,
            Some(_) => {
                tracing::warn!(worker_id = %id, "Message with bad auth key dropped");
                false
            }
            None => {
                tracing::warn!(worker_id = %id, "Message from unknown worker dropped");
                false
            }
        }
    }

    /// Any authenticated message proves the worker is alive.
    pub fn touch(&mut self, id: Uuid) {
        if let Some(w) = self.workers.get_mut(&id) {
            w.touch();
        }
    }

    /// Fold a check-in into the descriptor. Caller authenticates first.
    pub fn apply_checkin(&mut self, checkin: &Checkin) {
        if let Some(w) = self.workers.get_mut(&checkin.worker_id) {
            w.touch();
            w.total_events += checkin.events_since_checkin;
            for report in &checkin.sessions {
                if report.errors > 0 {
                    *w.session_errors.entry(report.session_id).or_insert(0) += report.errors;
                }
            }
        }
    }

    /// Pick the worker to offer the next target to: alive, below capacity,
    /// lowest `sessions/capacity`, ties broken by id ascending so repeated
    /// passes are reproducible.
    pub fn candidate(&self) -> Option<Uuid> {
        self.workers
            .values()
            .filter(|w| w.is_alive(self.dead_after) && w.has_free_slot())
            .min_by(|a, b| {
                // Compare a.len/a.cap vs b.len/b.cap without floats
                let lhs = a.sessions.len() as u64 * b.capacity as u64;
                let rhs = b.sessions.len() as u64 * a.capacity as u64;
                lhs.cmp(&rhs).then_with(|| a.id.cmp(&b.id))
            })
            .map(|w| w.id)
    }

    pub fn note_session(&mut self, worker_id: Uuid, session_id: Uuid) {
        if let Some(w) = self.workers.get_mut(&worker_id) {
            w.sessions.insert(session_id);
        }
    }

    pub fn forget_session(&mut self, worker_id: Uuid, session_id: Uuid) {
        if let Some(w) = self.workers.get_mut(&worker_id) {
            w.sessions.remove(&session_id);
            w.session_errors.remove(&session_id);
        }
    }

    /// Workers whose check-ins stopped for the whole liveness window.
    pub fn dead_workers(&self) -> Vec<Uuid> {
        self.workers
            .values()
            .filter(|w| !w.is_alive(self.dead_after))
            .map(|w| w.id)
            .collect()
    }

    /// Drop a dead worker, returning its descriptor for session cleanup.
    pub fn remove(&mut self, worker_id: Uuid) -> Option<WorkerDescriptor> {
        self.workers.remove(&worker_id)
    }

    pub fn get(&self, worker_id: &Uuid) -> Option<&WorkerDescriptor> {
        self.workers.get(worker_id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> WorkerDirectory {
        WorkerDirectory::new(Duration::from_secs(60))
    }

    #[test]
    fn announce_is_trust_on_first_use() {
        let mut dir = directory();
        let (id, key) = (Uuid::new_v4(), Uuid::new_v4());
        assert!(dir.announce(id, key, 4));
        assert!(dir.authenticate(id, key));
        assert!(!dir.authenticate(id, Uuid::new_v4()));

        // Re-announce with the same key is fine, with another key is not
        assert!(dir.announce(id, key, 8));
        assert_eq!(dir.get(&id).unwrap().capacity, 8);
        assert!(!dir.announce(id, Uuid::new_v4(), 8));
    }

    #[test]
    fn candidate_prefers_least_loaded() {
        let mut dir = directory();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        dir.announce(a, Uuid::new_v4(), 10);
        dir.announce(b, Uuid::new_v4(), 10);

        dir.note_session(a, Uuid::new_v4());
        dir.note_session(a, Uuid::new_v4());
        dir.note_session(b, Uuid::new_v4());

        assert_eq!(dir.candidate(), Some(b));
    }

    #[test]
    fn candidate_tie_breaks_by_id_ascending() {
        let mut dir = directory();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        dir.announce(a, Uuid::new_v4(), 5);
        dir.announce(b, Uuid::new_v4(), 5);

        let expected = a.min(b);
        assert_eq!(dir.candidate(), Some(expected));
    }

    #[test]
    fn candidate_respects_relative_load_not_absolute() {
        let mut dir = directory();
        let small = Uuid::new_v4();
        let big = Uuid::new_v4();
        dir.announce(small, Uuid::new_v4(), 2);
        dir.announce(big, Uuid::new_v4(), 20);

        // small: 1/2 load, big: 5/20 load → big wins despite more sessions
        dir.note_session(small, Uuid::new_v4());
        for _ in 0..5 {
            dir.note_session(big, Uuid::new_v4());
        }
        assert_eq!(dir.candidate(), Some(big));
    }

    #[test]
    fn full_worker_is_never_a_candidate() {
        let mut dir = directory();
        let a = Uuid::new_v4();
        dir.announce(a, Uuid::new_v4(), 1);
        dir.note_session(a, Uuid::new_v4());
        assert_eq!(dir.candidate(), None);
    }

    #[test]
    fn silent_worker_goes_dead() {
        let mut dir = WorkerDirectory::new(Duration::from_millis(0));
        let a = Uuid::new_v4();
        dir.announce(a, Uuid::new_v4(), 1);
        assert_eq!(dir.dead_workers(), vec![a]);
        assert_eq!(dir.candidate(), None);

        let desc = dir.remove(a).unwrap();
        assert_eq!(desc.id, a);
        assert!(dir.is_empty());
    }

    #[test]
    fn checkin_accumulates_events_and_errors() {
        let mut dir = directory();
        let id = Uuid::new_v4();
        let key = Uuid::new_v4();
        dir.announce(id, key, 4);

        let sid = Uuid::new_v4();
        let checkin = Checkin {
            worker_id: id,
            auth_key: key,
            session_count: 1,
            events_since_checkin: 100,
            sessions: vec![crate::coordination::SessionReport {
                session_id: sid,
                liveness: crate::registry::SessionLiveness::Retrying,
                handle: None,
                errors: 3,
            }],
        };
        dir.apply_checkin(&checkin);
        dir.apply_checkin(&checkin);

        let w = dir.get(&id).unwrap();
        assert_eq!(w.total_events, 200);
        assert_eq!(w.session_errors.get(&sid), Some(&6));
    }
}
