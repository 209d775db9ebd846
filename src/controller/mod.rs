//! The controller: sole writer of assignment state.
//!
//! One `tokio::select!` loop serializes every registry mutation. Its
//! branches:
//!
//! 1. **Bus intake**: announces, acks, releases, and check-ins from workers
//! 2. **Reconcile tick**: expire overdue claims, sweep dead workers, chase
//!    overdue revokes, then run one assignment pass
//! 3. **Refresh tick**: re-run inventory aggregation (optional)
//! 4. **Commands**: operator/test requests (revoke, refresh)
//!
//! Assignment is a claim protocol, not a push: the controller offers a
//! target to the least-loaded worker and the record only becomes assigned
//! when that worker's ack comes back. An unacked claim expires back into the
//! pool, so a slow or full worker costs one claim timeout, never ownership.

pub mod directory;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ControllerConfig;
use crate::coordination::{worker_topic, BusHandle, Message, CONTROLLER_TOPIC};
use crate::error::Result;
use crate::inventory::Aggregator;
use crate::registry::SessionRegistry;

pub use directory::{WorkerDescriptor, WorkerDirectory};

/// A worker this many overdue revokes in a row is declared dead.
const REVOKE_STRIKES_BEFORE_DEAD: u32 = 3;

/// Operator/test-facing requests, serialized into the control loop the same
/// way bus messages are.
#[derive(Debug)]
pub enum ControllerCommand {
    /// Ask the owning worker to close a session and give the target back
    Revoke { session_id: Uuid },
    /// Re-run inventory aggregation now
    Refresh,
}

pub struct Controller {
    config: ControllerConfig,
    bus: BusHandle,
    aggregator: Aggregator,
    registry: Arc<RwLock<SessionRegistry>>,
    directory: Arc<RwLock<WorkerDirectory>>,
    command_tx: mpsc::Sender<ControllerCommand>,
    command_rx: Option<mpsc::Receiver<ControllerCommand>>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        bus: BusHandle,
        aggregator: Aggregator,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(64);
        let directory = WorkerDirectory::new(config.dead_after());
        Self {
            config,
            bus,
            aggregator,
            registry: Arc::new(RwLock::new(SessionRegistry::new())),
            directory: Arc::new(RwLock::new(directory)),
            command_tx,
            command_rx: Some(command_rx),
        }
    }

    /// Shared read handle onto the registry.
    pub fn registry(&self) -> Arc<RwLock<SessionRegistry>> {
        Arc::clone(&self.registry)
    }

    /// Shared read handle onto the worker directory.
    pub fn directory(&self) -> Arc<RwLock<WorkerDirectory>> {
        Arc::clone(&self.directory)
    }

    pub fn command_sender(&self) -> mpsc::Sender<ControllerCommand> {
        self.command_tx.clone()
    }

    /// Run until `shutdown` fires. Performs the initial aggregation pass
    /// before entering the loop.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let mut messages = self.bus.subscribe(CONTROLLER_TOPIC).await?;
        let mut commands = self
            .command_rx
            .take()
            .expect("controller run() called twice");

        self.refresh_inventory().await;

        let mut reconcile = tokio::time::interval(self.config.reconcile_interval);
        let mut refresh = self.config.refresh_interval.map(|period| {
            let mut interval = tokio::time::interval(period);
            // The immediate tick would duplicate the startup pass
            interval.reset();
            interval
        });

        // Revokes awaiting a release, and per-worker overdue-revoke strikes.
        let mut pending_revokes: HashMap<Uuid, (Uuid, Instant)> = HashMap::new();
        let mut revoke_strikes: HashMap<Uuid, u32> = HashMap::new();

        loop {
            tokio::select! {
                Some(message) = messages.recv() => {
                    self.handle_message(message, &mut pending_revokes, &mut revoke_strikes).await;
                }
                Some(command) = commands.recv() => {
                    self.handle_command(command, &mut pending_revokes).await;
                }
                _ = reconcile.tick() => {
                    self.reconcile(&mut pending_revokes, &mut revoke_strikes).await;
                }
                _ = async {
                    match refresh.as_mut() {
                        Some(interval) => { interval.tick().await; }
                        None => std::future::pending().await,
                    }
                } => {
                    self.refresh_inventory().await;
                }
                _ = shutdown.cancelled() => {
                    break;
                }
            }
        }

        tracing::info!("Controller stopped");
        Ok(())
    }

    /// Run every datastore and fold the result set into the registry.
    async fn refresh_inventory(&self) {
        let specs = self.aggregator.collect().await;
        let summary = self.registry.write().await.upsert_inventory(specs);
        tracing::info!(
            admitted = summary.admitted,
            refreshed = summary.refreshed,
            draining = summary.draining,
            retired = summary.retired,
            "Inventory pass applied"
        );
    }

    async fn handle_message(
        &self,
        message: Message,
        pending_revokes: &mut HashMap<Uuid, (Uuid, Instant)>,
        revoke_strikes: &mut HashMap<Uuid, u32>,
    ) {
        match message {
            Message::WorkerAnnounce {
                worker_id,
                auth_key,
                capacity,
            } => {
                self.directory
                    .write()
                    .await
                    .announce(worker_id, auth_key, capacity);
            }
            Message::Ack {
                session_id,
                worker_id,
                auth_key,
            } => {
                if !self.directory.read().await.authenticate(worker_id, auth_key) {
                    return;
                }
                self.directory.write().await.touch(worker_id);
                if self
                    .registry
                    .write()
                    .await
                    .complete_claim(session_id, worker_id)
                {
                    self.directory
                        .write()
                        .await
                        .note_session(worker_id, session_id);
                    return;
                }
                // Rejected ack. A duplicate from the owner is harmless, but
                // any other worker has started a session it will never own
                // and must be told to stand down.
                let owner = {
                    let registry = self.registry.read().await;
                    registry.get(&session_id).and_then(|e| e.state.owner())
                };
                if owner != Some(worker_id) {
                    if let Err(err) = self
                        .bus
                        .publish(&worker_topic(worker_id), Message::Revoke { session_id })
                        .await
                    {
                        tracing::warn!(session_id = %session_id, error = %err, "Revoke publish failed");
                    }
                }
            }
            Message::Released {
                session_id,
                worker_id,
                auth_key,
            } => {
                if !self.directory.read().await.authenticate(worker_id, auth_key) {
                    return;
                }
                self.directory.write().await.touch(worker_id);
                if self.registry.write().await.release(session_id, worker_id) {
                    self.directory
                        .write()
                        .await
                        .forget_session(worker_id, session_id);
                }
                // Only the worker the revoke was addressed to settles it
                if pending_revokes
                    .get(&session_id)
                    .is_some_and(|(addressee, _)| *addressee == worker_id)
                {
                    pending_revokes.remove(&session_id);
                    revoke_strikes.remove(&worker_id);
                }
            }
            Message::Checkin(checkin) => {
                if !self
                    .directory
                    .read()
                    .await
                    .authenticate(checkin.worker_id, checkin.auth_key)
                {
                    return;
                }
                self.directory.write().await.apply_checkin(&checkin);
                let mut foreign: Vec<Uuid> = Vec::new();
                {
                    let mut registry = self.registry.write().await;
                    for report in &checkin.sessions {
                        registry.apply_session_report(
                            report.session_id,
                            checkin.worker_id,
                            report.liveness,
                            report.handle,
                        );
                        // A session this worker holds but does not own: a
                        // stale assign it acked after the claim moved on.
                        let owner = registry
                            .get(&report.session_id)
                            .and_then(|e| e.state.owner());
                        if owner != Some(checkin.worker_id) {
                            foreign.push(report.session_id);
                        }
                    }
                }
                for session_id in foreign {
                    tracing::warn!(
                        session_id = %session_id,
                        worker_id = %checkin.worker_id,
                        "Worker reported a session it does not own, revoking"
                    );
                    if let Err(err) = self
                        .bus
                        .publish(
                            &worker_topic(checkin.worker_id),
                            Message::Revoke { session_id },
                        )
                        .await
                    {
                        tracing::warn!(session_id = %session_id, error = %err, "Revoke publish failed");
                    }
                }
            }
            other => {
                tracing::debug!(kind = other.kind(), "Ignoring message not meant for the controller");
            }
        }
    }

    async fn handle_command(
        &self,
        command: ControllerCommand,
        pending_revokes: &mut HashMap<Uuid, (Uuid, Instant)>,
    ) {
        match command {
            ControllerCommand::Revoke { session_id } => {
                self.send_revoke(session_id, pending_revokes).await;
            }
            ControllerCommand::Refresh => {
                self.refresh_inventory().await;
            }
        }
    }

    async fn send_revoke(
        &self,
        session_id: Uuid,
        pending_revokes: &mut HashMap<Uuid, (Uuid, Instant)>,
    ) {
        let owner = {
            let registry = self.registry.read().await;
            registry.get(&session_id).and_then(|e| e.state.owner())
        };
        let Some(worker_id) = owner else {
            tracing::warn!(session_id = %session_id, "Revoke requested for unowned target");
            return;
        };
        tracing::info!(session_id = %session_id, worker_id = %worker_id, "Revoking session");
        pending_revokes.insert(
            session_id,
            (worker_id, Instant::now() + self.config.revoke_grace),
        );
        if let Err(err) = self
            .bus
            .publish(&worker_topic(worker_id), Message::Revoke { session_id })
            .await
        {
            tracing::warn!(session_id = %session_id, error = %err, "Revoke publish failed");
        }
    }

    /// One reconcile pass: claim expiry, dead-worker sweep, revoke chasing,
    /// then assignment.
    async fn reconcile(
        &self,
        pending_revokes: &mut HashMap<Uuid, (Uuid, Instant)>,
        revoke_strikes: &mut HashMap<Uuid, u32>,
    ) {
        let now = Instant::now();

        // Claims nobody acked go back to the pool.
        let expired = self.registry.write().await.expire_claims(now);
        if !expired.is_empty() {
            let mut directory = self.directory.write().await;
            for (session_id, worker_id) in &expired {
                directory.forget_session(*worker_id, *session_id);
            }
        }
        // The offered worker may have acked into the void and already
        // started a session; the revoke makes it stand down. Harmless if it
        // never acked.
        for (session_id, worker_id) in expired {
            if let Err(err) = self
                .bus
                .publish(&worker_topic(worker_id), Message::Revoke { session_id })
                .await
            {
                tracing::warn!(session_id = %session_id, error = %err, "Revoke publish failed");
            }
        }

        // Workers whose check-ins stopped lose everything at once.
        let dead: Vec<Uuid> = self.directory.read().await.dead_workers();
        for worker_id in dead {
            self.declare_dead(worker_id, pending_revokes, revoke_strikes)
                .await;
        }

        // Chase revokes that outlived their grace period.
        let overdue: Vec<(Uuid, Uuid)> = pending_revokes
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(session_id, (worker_id, _))| (*session_id, *worker_id))
            .collect();
        for (session_id, worker_id) in overdue {
            let strikes = revoke_strikes.entry(worker_id).or_insert(0);
            *strikes += 1;
            tracing::warn!(
                session_id = %session_id,
                worker_id = %worker_id,
                strikes = *strikes,
                "Revoke unanswered past grace period"
            );
            if *strikes >= REVOKE_STRIKES_BEFORE_DEAD {
                self.declare_dead(worker_id, pending_revokes, revoke_strikes)
                    .await;
            } else {
                // Nudge again with a fresh deadline
                pending_revokes.insert(
                    session_id,
                    (worker_id, now + self.config.revoke_grace),
                );
                if let Err(err) = self
                    .bus
                    .publish(&worker_topic(worker_id), Message::Revoke { session_id })
                    .await
                {
                    tracing::warn!(session_id = %session_id, error = %err, "Revoke publish failed");
                }
            }
        }

        self.assignment_pass().await;
    }

    /// Remove a worker from the pool and free its sessions immediately.
    async fn declare_dead(
        &self,
        worker_id: Uuid,
        pending_revokes: &mut HashMap<Uuid, (Uuid, Instant)>,
        revoke_strikes: &mut HashMap<Uuid, u32>,
    ) {
        let removed = self.directory.write().await.remove(worker_id);
        if removed.is_none() {
            return;
        }
        tracing::warn!(worker_id = %worker_id, "Worker declared dead");
        let released = self.registry.write().await.release_worker(worker_id);
        pending_revokes.retain(|_, (owner, _)| *owner != worker_id);
        revoke_strikes.remove(&worker_id);
        tracing::info!(
            worker_id = %worker_id,
            sessions = released.len(),
            "Dead worker's sessions returned to the pool"
        );
        // Fencing notice; a live-but-silent worker must stop its sessions
        if let Err(err) = self
            .bus
            .publish(&worker_topic(worker_id), Message::WorkerDead { worker_id })
            .await
        {
            tracing::warn!(worker_id = %worker_id, error = %err, "Fence publish failed");
        }
    }

    /// Offer every assignable target to the current least-loaded worker.
    async fn assignment_pass(&self) {
        let assignable: Vec<Uuid> = {
            let registry = self.registry.read().await;
            registry
                .assignable()
                .iter()
                .map(|t| t.session_id)
                .collect()
        };
        if assignable.is_empty() {
            return;
        }

        for session_id in assignable {
            let Some(worker_id) = self.directory.read().await.candidate() else {
                tracing::debug!("No workers available for assignment");
                return;
            };
            let deadline = Instant::now() + self.config.claim_timeout;
            let target = {
                let mut registry = self.registry.write().await;
                registry.begin_claim(session_id, worker_id, deadline)
            };
            let Some(target) = target else {
                continue;
            };
            // Reserve the slot so this pass spreads load instead of piling
            // every offer onto the same worker
            self.directory
                .write()
                .await
                .note_session(worker_id, session_id);
            tracing::info!(
                session_id = %session_id,
                worker_id = %worker_id,
                host = %target.host,
                "Offering target to worker"
            );
            if let Err(err) = self
                .bus
                .publish(
                    &worker_topic(worker_id),
                    Message::Assign { session_id, target },
                )
                .await
            {
                tracing::warn!(session_id = %session_id, error = %err, "Assign publish failed");
            }
        }
    }
}
