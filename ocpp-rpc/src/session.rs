//! Connection session
//!
//! One session per physical connection. Lifecycle:
//!
//! ```text
//! Connecting --attach--> Open --close / peer gone / write failure--> Closing --> Closed
//! ```
//!
//! Once attached, three tasks run per session:
//! - writer: sole owner of the transport sink, fed by a bounded queue
//! - reader: decodes inbound frames in arrival order and routes them
//! - sweeper: periodically fails calls whose deadline has passed
//!
//! Entering `Closing` fails every pending call with `Disconnected` exactly
//! once, then the session is `Closed` and the tasks wind down.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::dispatcher::Dispatcher;
use crate::engine::{Engine, Outbox};
use crate::error::{CallFailure, SessionError};
use crate::transport::{FrameSink, FrameStream};

/// Session state in the connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, transport not attached yet
    Connecting,
    /// Calls may be issued and frames are processed
    Open,
    /// Shutting down; pending calls are being failed
    Closing,
    /// Terminal
    Closed,
}

impl SessionState {
    fn is_closing(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

struct Shared {
    id: String,
    sweep_interval: Duration,
    state: watch::Sender<SessionState>,
    engine: Arc<Engine>,
    /// Taken by `attach`
    outbound_rx: Mutex<Option<mpsc::Receiver<String>>>,
}

/// Handle on one connection; clones share the same session
#[derive(Clone)]
pub struct Session {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

impl Session {
    /// Create a session in `Connecting`
    pub fn new(id: impl Into<String>, config: SessionConfig, dispatcher: Arc<Dispatcher>) -> Self {
        let id = id.into();
        let (state, state_rx) = watch::channel(SessionState::Connecting);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue);

        let engine = Arc::new(Engine::new(
            id.clone(),
            &config,
            dispatcher,
            Outbox::new(state_rx, outbound_tx),
        ));

        Self {
            inner: Arc::new(Shared {
                id,
                sweep_interval: config.sweep_interval,
                state,
                engine,
                outbound_rx: Mutex::new(Some(outbound_rx)),
            }),
        }
    }

    /// Attach a transport and open the session
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach<S, R>(&self, sink: S, stream: R) -> Result<(), SessionError>
    where
        S: FrameSink,
        R: FrameStream,
    {
        let state = self.state();
        if state != SessionState::Connecting {
            return Err(SessionError::SessionNotOpen(state));
        }

        let outbound_rx = self
            .inner
            .outbound_rx
            .lock()
            .take()
            .ok_or(SessionError::SessionNotOpen(state))?;

        let opened = self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = SessionState::Open;
                true
            } else {
                false
            }
        });
        if !opened {
            return Err(SessionError::SessionNotOpen(self.state()));
        }

        tokio::spawn(run_writer(self.clone(), sink, outbound_rx));
        tokio::spawn(run_reader(self.clone(), stream));
        tokio::spawn(run_sweeper(
            Arc::clone(&self.inner.engine),
            self.inner.state.subscribe(),
            self.inner.sweep_interval,
        ));

        info!("Session {} open", self.inner.id);
        Ok(())
    }

    /// Send a CALL and wait for the matching reply
    pub async fn call(
        &self,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, CallFailure> {
        self.inner.engine.call(action, payload, timeout).await
    }

    /// `call` with the configured default timeout
    pub async fn call_default(&self, action: &str, payload: Value) -> Result<Value, CallFailure> {
        self.inner.engine.call_default(action, payload).await
    }

    /// Close the session, failing all pending calls
    ///
    /// Returns false if the session was already closing.
    pub fn close(&self, reason: impl Into<String>) -> bool {
        let began = self.inner.state.send_if_modified(|state| {
            if state.is_closing() {
                false
            } else {
                *state = SessionState::Closing;
                true
            }
        });
        if !began {
            return false;
        }

        let reason = reason.into();
        info!("Closing session {}: {}", self.inner.id, reason);

        let evicted = self.inner.engine.pending().evict_all(&reason);
        if evicted > 0 {
            warn!(
                "Failed {} pending call(s) on {} ({})",
                evicted, self.inner.id, reason
            );
        }

        self.inner.state.send_replace(SessionState::Closed);
        true
    }

    /// Wait until the session is `Closed`
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        // Sender lives in `self`, so this cannot fail
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Number of outbound calls awaiting a reply
    pub fn pending_calls(&self) -> usize {
        self.inner.engine.pending().len()
    }

    /// Whether both handles refer to the same session
    pub fn ptr_eq(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.inner.engine
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        self.inner.engine.dispatcher()
    }
}

async fn run_writer<S: FrameSink>(session: Session, mut sink: S, mut outbound: mpsc::Receiver<String>) {
    let mut state = session.inner.state.subscribe();

    loop {
        tokio::select! {
            // Drain queued frames before noticing a close
            biased;

            msg = outbound.recv() => {
                let Some(text) = msg else { break };
                debug!("Sending on {}: {}", session.id(), text);

                if let Err(e) = sink.send(text).await {
                    error!("Failed to write to {}: {}", session.id(), e);
                    session.close(format!("write failed: {}", e));
                    break;
                }
            }

            changed = state.changed() => {
                if changed.is_err() || state.borrow_and_update().is_closing() {
                    break;
                }
            }
        }
    }

    if let Err(e) = sink.close().await {
        debug!("Closing transport of {}: {}", session.id(), e);
    }
}

async fn run_reader<R: FrameStream>(session: Session, mut stream: R) {
    let mut state = session.inner.state.subscribe();

    loop {
        tokio::select! {
            frame = stream.recv() => match frame {
                Some(Ok(text)) => {
                    debug!("Received on {}: {}", session.id(), text);
                    session.inner.engine.route(&text);
                }
                Some(Err(e)) if !e.is_fatal() => {
                    warn!("Skipping unreadable frame on {}: {}", session.id(), e);
                }
                Some(Err(e)) => {
                    error!("Transport error on {}: {}", session.id(), e);
                    session.close(format!("transport error: {}", e));
                    break;
                }
                None => {
                    info!("Peer closed connection {}", session.id());
                    session.close("peer closed the connection");
                    break;
                }
            },

            changed = state.changed() => {
                if changed.is_err() || state.borrow_and_update().is_closing() {
                    break;
                }
            }
        }
    }
}

async fn run_sweeper(engine: Arc<Engine>, mut state: watch::Receiver<SessionState>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                engine.sweep(Instant::now());
            }

            changed = state.changed() => {
                if changed.is_err() || state.borrow_and_update().is_closing() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory_pair;
    use serde_json::json;

    fn session(id: &str) -> Session {
        Session::new(id, SessionConfig::default(), Arc::new(Dispatcher::new()))
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let session = session("CP001");
        assert_eq!(session.state(), SessionState::Connecting);

        let (sink, stream, _peer) = memory_pair();
        session.attach(sink, stream).unwrap();
        assert_eq!(session.state(), SessionState::Open);

        assert!(session.close("shutdown"));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.close("again"));

        session.closed().await;
    }

    #[tokio::test]
    async fn test_call_before_open() {
        let session = session("CP001");

        let err = session
            .call("Heartbeat", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            CallFailure::Rejected(SessionError::SessionNotOpen(SessionState::Connecting))
        );
        assert_eq!(session.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_attach_twice() {
        let session = session("CP001");
        let (sink, stream, _peer) = memory_pair();
        session.attach(sink, stream).unwrap();

        let (sink, stream, _peer2) = memory_pair();
        assert_eq!(
            session.attach(sink, stream).unwrap_err(),
            SessionError::SessionNotOpen(SessionState::Open)
        );
    }

    #[tokio::test]
    async fn test_close_when_peer_disconnects() {
        let session = session("CP001");
        let (sink, stream, mut peer) = memory_pair();
        session.attach(sink, stream).unwrap();

        peer.disconnect();
        session.closed().await;

        // Writer closes its sink on the way out
        assert!(peer.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_call_after_close() {
        let session = session("CP001");
        let (sink, stream, _peer) = memory_pair();
        session.attach(sink, stream).unwrap();
        session.close("done");

        let err = session
            .call("Heartbeat", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CallFailure::Rejected(SessionError::SessionNotOpen(SessionState::Closed))
        );
    }
}
