//! The session boundary and the per-session task.
//!
//! The core never sees protocol framing: a [`SessionFactory`] opens a
//! [`DeviceSession`] for a target, and the session exposes only liveness,
//! close, and an opaque remote handle. [`SessionRunner`] is the task a worker
//! spawns per owned target; it keeps one session up for the lifetime of the
//! assignment, reconnecting with capped backoff and closing cooperatively on
//! revocation. A hang inside one runner never touches its siblings or the
//! control task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{NetherdError, Result};
use crate::registry::{SessionMode, SessionTarget};

/// How often a runner probes its session for liveness.
const LIVENESS_POLL: Duration = Duration::from_secs(5);

/// One live management session to a device.
#[async_trait]
pub trait DeviceSession: Send {
    /// Remote protocol session id, if the protocol layer exposes one.
    fn remote_handle(&self) -> Option<u64>;

    async fn is_alive(&mut self) -> bool;

    async fn close(&mut self);
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, target: &SessionTarget) -> Result<Box<dyn DeviceSession>>;
}

/// What a session task tells its control task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Session established, with its remote handle
    Opened { session_id: Uuid, handle: u64 },
    /// Session lost or connect failed; the runner is backing off
    Retrying { session_id: Uuid },
    /// Runner finished (after revoke or worker shutdown)
    Closed { session_id: Uuid },
}

impl SessionEvent {
    pub fn session_id(&self) -> Uuid {
        match self {
            SessionEvent::Opened { session_id, .. }
            | SessionEvent::Retrying { session_id }
            | SessionEvent::Closed { session_id } => *session_id,
        }
    }
}

/// Plain TCP session factory.
///
/// Dials `host:port` with the configured connect timeout. Wire framing after
/// connect is out of scope, so the remote handle is a locally minted
/// sequence number. `mode` is forwarded for factories that understand
/// replay; this one opens fresh sessions regardless.
pub struct TcpSessionFactory {
    connect_timeout: Duration,
    next_handle: AtomicU64,
}

impl TcpSessionFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            next_handle: AtomicU64::new(1),
        }
    }
}

struct TcpSession {
    stream: TcpStream,
    handle: u64,
}

#[async_trait]
impl SessionFactory for TcpSessionFactory {
    async fn open(&self, target: &SessionTarget) -> Result<Box<dyn DeviceSession>> {
        if target.mode == SessionMode::Replay {
            tracing::debug!(
                session_id = %target.session_id,
                host = %target.host,
                "Replay mode requested; TCP factory opens a fresh session"
            );
        }
        let addr = format!("{}:{}", target.host, target.port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| NetherdError::Connect {
                host: target.host.clone(),
                reason: format!("connect timed out after {:?}", self.connect_timeout),
            })?
            .map_err(|err| NetherdError::Connect {
                host: target.host.clone(),
                reason: err.to_string(),
            })?;
        Ok(Box::new(TcpSession {
            stream,
            handle: self.next_handle.fetch_add(1, Ordering::Relaxed),
        }))
    }
}

#[async_trait]
impl DeviceSession for TcpSession {
    fn remote_handle(&self) -> Option<u64> {
        Some(self.handle)
    }

    async fn is_alive(&mut self) -> bool {
        // A zero-length read distinguishes an orderly remote close (Ok(0))
        // from a merely idle connection (WouldBlock).
        let mut probe = [0u8; 1];
        match self.stream.try_read(&mut probe) {
            Ok(0) => false,
            Ok(_) => true,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }

    async fn close(&mut self) {
        use tokio::io::AsyncWriteExt;
        let _ = self.stream.shutdown().await;
    }
}

/// Owns exactly one assignment for its whole lifetime.
pub struct SessionRunner {
    target: SessionTarget,
    factory: Arc<dyn SessionFactory>,
    events: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
    backoff_min: Duration,
    backoff_max: Duration,
}

impl SessionRunner {
    pub fn new(
        target: SessionTarget,
        factory: Arc<dyn SessionFactory>,
        events: mpsc::Sender<SessionEvent>,
        cancel: CancellationToken,
        backoff_min: Duration,
        backoff_max: Duration,
    ) -> Self {
        Self {
            target,
            factory,
            events,
            cancel,
            backoff_min,
            backoff_max,
        }
    }

    pub async fn run(self) {
        let session_id = self.target.session_id;
        let mut backoff = self.backoff_min;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let opened = tokio::select! {
                result = self.factory.open(&self.target) => result,
                _ = self.cancel.cancelled() => break,
            };

            match opened {
                Ok(mut session) => {
                    backoff = self.backoff_min;
                    let handle = session.remote_handle().unwrap_or_default();
                    tracing::info!(
                        session_id = %session_id,
                        host = %self.target.host,
                        handle,
                        "Session established"
                    );
                    let _ = self
                        .events
                        .send(SessionEvent::Opened { session_id, handle })
                        .await;

                    if self.watch(&mut *session).await {
                        // Cancelled: close and finish
                        session.close().await;
                        break;
                    }
                    // Session died underneath us
                    tracing::warn!(
                        session_id = %session_id,
                        host = %self.target.host,
                        "Session lost, reconnecting"
                    );
                    let _ = self.events.send(SessionEvent::Retrying { session_id }).await;
                }
                Err(err) => {
                    tracing::warn!(
                        session_id = %session_id,
                        host = %self.target.host,
                        error = %err,
                        "Session connect failed"
                    );
                    let _ = self.events.send(SessionEvent::Retrying { session_id }).await;
                }
            }

            // Back off before the next attempt, still watching for revoke
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.cancel.cancelled() => break,
            }
            backoff = (backoff * 2).min(self.backoff_max);
        }

        let _ = self.events.send(SessionEvent::Closed { session_id }).await;
        tracing::info!(session_id = %session_id, host = %self.target.host, "Session task finished");
    }

    /// Watch a live session. Returns true when cancelled, false when the
    /// session died.
    async fn watch(&self, session: &mut dyn DeviceSession) -> bool {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return true,
                _ = tokio::time::sleep(LIVENESS_POLL) => {
                    if !session.is_alive().await {
                        return false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Factory whose sessions fail the first `fail_opens` connect attempts,
    /// then stay alive until closed.
    struct ScriptedFactory {
        fail_opens: AtomicUsize,
    }

    struct ScriptedSession;

    #[async_trait]
    impl DeviceSession for ScriptedSession {
        fn remote_handle(&self) -> Option<u64> {
            Some(7)
        }

        async fn is_alive(&mut self) -> bool {
            true
        }

        async fn close(&mut self) {}
    }

    #[async_trait]
    impl SessionFactory for ScriptedFactory {
        async fn open(&self, target: &SessionTarget) -> Result<Box<dyn DeviceSession>> {
            let remaining = self.fail_opens.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_opens.store(remaining - 1, Ordering::SeqCst);
                return Err(NetherdError::Connect {
                    host: target.host.clone(),
                    reason: "scripted failure".into(),
                });
            }
            Ok(Box::new(ScriptedSession))
        }
    }

    fn target() -> SessionTarget {
        SessionTarget::from_spec(crate::registry::TargetSpec::new("10.0.0.1"))
    }

    fn runner(
        fail_opens: usize,
        cancel: CancellationToken,
    ) -> (SessionRunner, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let runner = SessionRunner::new(
            target(),
            Arc::new(ScriptedFactory {
                fail_opens: AtomicUsize::new(fail_opens),
            }),
            tx,
            cancel,
            Duration::from_millis(10),
            Duration::from_millis(100),
        );
        (runner, rx)
    }

    #[tokio::test]
    async fn reports_opened_then_closes_on_cancel() {
        let cancel = CancellationToken::new();
        let (runner, mut rx) = runner(0, cancel.clone());
        let id = runner.target.session_id;
        let task = tokio::spawn(runner.run());

        assert_eq!(
            rx.recv().await,
            Some(SessionEvent::Opened {
                session_id: id,
                handle: 7
            })
        );

        cancel.cancel();
        assert_eq!(rx.recv().await, Some(SessionEvent::Closed { session_id: id }));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn retries_failed_connects_with_backoff() {
        let cancel = CancellationToken::new();
        let (runner, mut rx) = runner(2, cancel.clone());
        let id = runner.target.session_id;
        let task = tokio::spawn(runner.run());

        assert_eq!(rx.recv().await, Some(SessionEvent::Retrying { session_id: id }));
        assert_eq!(rx.recv().await, Some(SessionEvent::Retrying { session_id: id }));
        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::Opened { session_id, .. }) if session_id == id
        ));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_during_backoff_still_finishes_cleanly() {
        let cancel = CancellationToken::new();
        let (runner, mut rx) = runner(usize::MAX, cancel.clone());
        let id = runner.target.session_id;
        let task = tokio::spawn(runner.run());

        assert_eq!(rx.recv().await, Some(SessionEvent::Retrying { session_id: id }));
        cancel.cancel();
        // More retry events may already be in flight; the runner must still
        // end with exactly one Closed.
        loop {
            match rx.recv().await {
                Some(SessionEvent::Retrying { .. }) => continue,
                Some(SessionEvent::Closed { session_id }) => {
                    assert_eq!(session_id, id);
                    break;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        task.await.unwrap();
    }
}
