//! Worker process: one control task plus one session task per owned target.
//!
//! The control task is the only part of a worker that talks to the
//! coordination bus. It:
//!
//! 1. **Announces** itself (id, auth key, capacity) when it joins the pool
//! 2. **Accepts claims** below capacity with an explicit ack; at capacity it
//!    stays silent and lets the claim expire (backpressure, not an error)
//! 3. **Spawns session tasks** and relays their events
//! 4. **Checks in** on the earlier of the report interval or the event
//!    budget, carrying per-session liveness and error counts
//! 5. **Revokes cooperatively**: a revoked session is cancelled, closed, and
//!    only then reported released
//!
//! Workers never write assignment state anywhere; ownership lives in the
//! controller's registry and changes only through this message exchange.

pub mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::coordination::{
    worker_topic, BusHandle, Checkin, Message, SessionReport, CONTROLLER_TOPIC,
};
use crate::error::Result;
use crate::registry::{SessionLiveness, SessionTarget};

pub use session::{
    DeviceSession, SessionEvent, SessionFactory, SessionRunner, TcpSessionFactory,
};

/// How long a shutting-down worker waits for its sessions to close.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct SessionSlot {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    target: SessionTarget,
    liveness: SessionLiveness,
    handle: Option<u64>,
    errors_since_checkin: u64,
    /// Set when a revoke arrived; the release goes out once the task closes
    revoked: bool,
}

pub struct Worker {
    pub id: Uuid,
    auth_key: Uuid,
    config: WorkerConfig,
    bus: BusHandle,
    factory: Arc<dyn SessionFactory>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        bus: BusHandle,
        factory: Arc<dyn SessionFactory>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            auth_key: Uuid::new_v4(),
            config,
            bus,
            factory,
        }
    }

    /// Run the control loop until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        // Subscribe before announcing so no command can slip past
        let mut commands = self.bus.subscribe(&worker_topic(self.id)).await?;
        self.announce().await?;

        let (event_tx, mut events) = mpsc::channel::<SessionEvent>(256);
        let mut slots: HashMap<Uuid, SessionSlot> = HashMap::new();
        let mut events_since_checkin: u64 = 0;
        let mut checkin_interval = tokio::time::interval(self.config.checkin_interval);
        checkin_interval.tick().await; // immediate first tick

        loop {
            tokio::select! {
                Some(message) = commands.recv() => {
                    self.handle_command(message, &mut slots, &event_tx).await;
                }
                Some(event) = events.recv() => {
                    events_since_checkin += 1;
                    self.handle_event(event, &mut slots).await;
                    if events_since_checkin > self.config.max_events_before_checkin {
                        self.checkin(&mut slots, &mut events_since_checkin).await;
                        checkin_interval.reset();
                    }
                }
                _ = checkin_interval.tick() => {
                    self.checkin(&mut slots, &mut events_since_checkin).await;
                }
                _ = shutdown.cancelled() => {
                    break;
                }
            }
        }

        self.drain(slots, &mut events).await;
        tracing::info!(worker_id = %self.id, "Worker stopped");
        Ok(())
    }

    async fn announce(&self) -> Result<()> {
        tracing::info!(worker_id = %self.id, capacity = self.config.capacity, "Worker announcing");
        self.bus
            .publish(
                CONTROLLER_TOPIC,
                Message::WorkerAnnounce {
                    worker_id: self.id,
                    auth_key: self.auth_key,
                    capacity: self.config.capacity,
                },
            )
            .await
    }

    async fn handle_command(
        &self,
        message: Message,
        slots: &mut HashMap<Uuid, SessionSlot>,
        event_tx: &mpsc::Sender<SessionEvent>,
    ) {
        match message {
            Message::Assign { session_id, target } => {
                if slots.contains_key(&session_id) {
                    // Duplicate delivery; ownership is already ours, re-ack
                    self.send_ack(session_id).await;
                    return;
                }
                if slots.len() >= self.config.capacity {
                    tracing::debug!(
                        worker_id = %self.id,
                        session_id = %session_id,
                        "At capacity, letting claim expire"
                    );
                    return;
                }
                self.spawn_session(session_id, target, slots, event_tx);
                self.send_ack(session_id).await;
            }
            Message::Revoke { session_id } => {
                match slots.get_mut(&session_id) {
                    Some(slot) => {
                        tracing::info!(
                            worker_id = %self.id,
                            session_id = %session_id,
                            "Revoking session"
                        );
                        slot.revoked = true;
                        slot.cancel.cancel();
                    }
                    None => {
                        // Already gone; repeat the release so a lost reply
                        // cannot wedge the controller
                        self.send_released(session_id).await;
                    }
                }
            }
            Message::WorkerDead { worker_id } if worker_id == self.id => {
                tracing::warn!(
                    worker_id = %self.id,
                    sessions = slots.len(),
                    "Declared dead by controller, fencing all sessions"
                );
                for (_, slot) in slots.drain() {
                    slot.cancel.cancel();
                    slot.task.abort();
                }
                // Rejoin the pool with the same identity
                if let Err(err) = self.announce().await {
                    tracing::warn!(worker_id = %self.id, error = %err, "Re-announce failed");
                }
            }
            other => {
                tracing::debug!(
                    worker_id = %self.id,
                    kind = other.kind(),
                    "Ignoring message not meant for a worker"
                );
            }
        }
    }

    fn spawn_session(
        &self,
        session_id: Uuid,
        target: SessionTarget,
        slots: &mut HashMap<Uuid, SessionSlot>,
        event_tx: &mpsc::Sender<SessionEvent>,
    ) {
        tracing::info!(
            worker_id = %self.id,
            session_id = %session_id,
            host = %target.host,
            "Claim accepted, starting session task"
        );
        let cancel = CancellationToken::new();
        let runner = SessionRunner::new(
            target.clone(),
            Arc::clone(&self.factory),
            event_tx.clone(),
            cancel.clone(),
            self.config.retry_backoff_min,
            self.config.retry_backoff_max,
        );
        let task = tokio::spawn(runner.run());
        slots.insert(
            session_id,
            SessionSlot {
                cancel,
                task,
                target,
                liveness: SessionLiveness::Retrying,
                handle: None,
                errors_since_checkin: 0,
                revoked: false,
            },
        );
    }

    async fn handle_event(&self, event: SessionEvent, slots: &mut HashMap<Uuid, SessionSlot>) {
        let session_id = event.session_id();
        match event {
            SessionEvent::Opened { handle, .. } => {
                if let Some(slot) = slots.get_mut(&session_id) {
                    slot.liveness = SessionLiveness::Active;
                    slot.handle = Some(handle);
                }
            }
            SessionEvent::Retrying { .. } => {
                if let Some(slot) = slots.get_mut(&session_id) {
                    slot.liveness = SessionLiveness::Retrying;
                    slot.handle = None;
                    slot.errors_since_checkin += 1;
                }
            }
            SessionEvent::Closed { .. } => {
                if let Some(slot) = slots.remove(&session_id) {
                    if slot.revoked {
                        self.send_released(session_id).await;
                    } else {
                        tracing::debug!(
                            worker_id = %self.id,
                            session_id = %session_id,
                            host = %slot.target.host,
                            "Session task closed"
                        );
                    }
                }
            }
        }
    }

    async fn send_ack(&self, session_id: Uuid) {
        let message = Message::Ack {
            session_id,
            worker_id: self.id,
            auth_key: self.auth_key,
        };
        if let Err(err) = self.bus.publish(CONTROLLER_TOPIC, message).await {
            tracing::warn!(worker_id = %self.id, session_id = %session_id, error = %err, "Ack publish failed");
        }
    }

    async fn send_released(&self, session_id: Uuid) {
        let message = Message::Released {
            session_id,
            worker_id: self.id,
            auth_key: self.auth_key,
        };
        if let Err(err) = self.bus.publish(CONTROLLER_TOPIC, message).await {
            tracing::warn!(worker_id = %self.id, session_id = %session_id, error = %err, "Release publish failed");
        }
    }

    async fn checkin(&self, slots: &mut HashMap<Uuid, SessionSlot>, events_since: &mut u64) {
        let sessions: Vec<SessionReport> = slots
            .iter()
            .map(|(id, slot)| SessionReport {
                session_id: *id,
                liveness: slot.liveness,
                handle: slot.handle,
                errors: slot.errors_since_checkin,
            })
            .collect();
        for slot in slots.values_mut() {
            slot.errors_since_checkin = 0;
        }
        let checkin = Checkin {
            worker_id: self.id,
            auth_key: self.auth_key,
            session_count: slots.len(),
            events_since_checkin: *events_since,
            sessions,
        };
        tracing::debug!(
            worker_id = %self.id,
            sessions = checkin.session_count,
            events = checkin.events_since_checkin,
            "Checking in"
        );
        if let Err(err) = self
            .bus
            .publish(CONTROLLER_TOPIC, Message::Checkin(checkin))
            .await
        {
            tracing::warn!(worker_id = %self.id, error = %err, "Check-in publish failed");
        }
        *events_since = 0;
    }

    /// Graceful shutdown: cancel every session and report each closure.
    async fn drain(
        &self,
        mut slots: HashMap<Uuid, SessionSlot>,
        events: &mut mpsc::Receiver<SessionEvent>,
    ) {
        if slots.is_empty() {
            return;
        }
        tracing::info!(worker_id = %self.id, sessions = slots.len(), "Draining sessions");
        for slot in slots.values() {
            slot.cancel.cancel();
        }

        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while !slots.is_empty() {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(
                        worker_id = %self.id,
                        remaining = slots.len(),
                        "Drain timed out, abandoning remaining session tasks"
                    );
                    break;
                }
            };
            match event {
                Some(SessionEvent::Closed { session_id }) => {
                    if slots.remove(&session_id).is_some() {
                        self.send_released(session_id).await;
                    }
                }
                Some(_) => {}
                None => break,
            }
        }
    }
}
