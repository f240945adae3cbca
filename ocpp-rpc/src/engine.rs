//! Correlation engine
//!
//! Issues outbound calls and matches replies to them by message id, never by
//! arrival order. Inbound CALLs are handed to the dispatcher on their own
//! task so the reader keeps draining the connection while handlers run.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::SessionConfig;
use crate::dispatcher::{CallContext, Dispatcher};
use crate::error::{CallFailure, DispatchError, SessionError};
use crate::frame::{self, ErrorCode, Frame};
use crate::pending::{CallIdGenerator, Outcome, PendingTable};
use crate::session::SessionState;

/// Handle on the session's outbound queue
pub(crate) struct Outbox {
    state: watch::Receiver<SessionState>,
    tx: mpsc::Sender<String>,
}

impl Outbox {
    pub(crate) fn new(state: watch::Receiver<SessionState>, tx: mpsc::Sender<String>) -> Self {
        Self { state, tx }
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        match *self.state.borrow() {
            SessionState::Open => Ok(()),
            other => Err(SessionError::SessionNotOpen(other)),
        }
    }

    /// Queue one frame for the writer task
    async fn submit(&self, text: String) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.tx
            .send(text)
            .await
            .map_err(|_| SessionError::SessionNotOpen(*self.state.borrow()))
    }

    /// Queue one frame without waiting for room
    fn try_submit(&self, text: String) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.tx.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => {
                SessionError::SessionNotOpen(*self.state.borrow())
            }
        })
    }
}

/// Stand-in deadline for timeouts the clock cannot represent
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

fn settle(
    outcome: Result<Outcome, oneshot::error::RecvError>,
    timeout: Duration,
) -> Result<Value, CallFailure> {
    match outcome {
        Ok(Outcome::Result(payload)) => Ok(payload),
        Ok(Outcome::Error {
            code,
            description,
            details,
        }) => Err(CallFailure::Remote {
            code,
            description,
            details,
        }),
        Ok(Outcome::Timeout) => Err(CallFailure::Timeout(timeout)),
        Ok(Outcome::ConnectionClosed(reason)) => Err(CallFailure::Disconnected(reason)),
        Err(_) => Err(CallFailure::Disconnected("pending call dropped".into())),
    }
}

/// Removes the pending entry if the caller stops waiting before resolution
struct CancelGuard<'a> {
    pending: &'a PendingTable,
    message_id: &'a str,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        // No-op once the entry was resolved or evicted
        self.pending.cancel(self.message_id);
    }
}

/// Call correlation for one session
pub struct Engine {
    session_id: String,
    default_timeout: Duration,
    pending: PendingTable,
    ids: CallIdGenerator,
    dispatcher: Arc<Dispatcher>,
    /// One permit per inbound call being handled
    handler_slots: Arc<Semaphore>,
    outbox: Outbox,
}

impl Engine {
    pub(crate) fn new(
        session_id: String,
        config: &SessionConfig,
        dispatcher: Arc<Dispatcher>,
        outbox: Outbox,
    ) -> Self {
        Self {
            session_id,
            default_timeout: config.default_call_timeout,
            pending: PendingTable::new(),
            ids: CallIdGenerator::new(config.id_strategy),
            dispatcher,
            handler_slots: Arc::new(Semaphore::new(
                config.max_concurrent_handlers.clamp(1, Semaphore::MAX_PERMITS),
            )),
            outbox,
        }
    }

    /// Send a CALL and wait for its reply
    ///
    /// Dropping the returned future cancels the call: its pending entry is
    /// removed and a reply arriving later is logged and ignored.
    pub async fn call(
        &self,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, CallFailure> {
        self.outbox.ensure_open()?;

        let deadline = deadline_after(timeout);
        let (message_id, mut reply) = self.pending.register_next(&self.ids, action, deadline)?;
        let _guard = CancelGuard {
            pending: &self.pending,
            message_id: &message_id,
        };

        debug!("{} -> {} ({})", self.session_id, action, message_id);

        // A full queue must not hold the caller past its deadline or a close
        tokio::select! {
            sent = self.outbox.submit(frame::encode_call(&message_id, action, &payload)) => sent?,
            outcome = &mut reply => return settle(outcome, timeout),
        }

        settle(reply.await, timeout)
    }

    /// `call` with the session's default timeout
    pub async fn call_default(&self, action: &str, payload: Value) -> Result<Value, CallFailure> {
        self.call(action, payload, self.default_timeout).await
    }

    /// Route one inbound frame; never waits on a pending call
    pub(crate) fn route(self: &Arc<Self>, text: &str) {
        match frame::decode(text) {
            Ok(Frame::CallResult {
                message_id,
                payload,
            }) => {
                self.pending.resolve(&message_id, Outcome::Result(payload));
            }
            Ok(Frame::CallError {
                message_id,
                code,
                description,
                details,
            }) => {
                debug!("{} answered {} with {}: {}", self.session_id, message_id, code, description);
                self.pending.resolve(
                    &message_id,
                    Outcome::Error {
                        code,
                        description,
                        details,
                    },
                );
            }
            Ok(Frame::Call {
                message_id,
                action,
                payload,
            }) => match Arc::clone(&self.handler_slots).try_acquire_owned() {
                Ok(permit) => self.spawn_dispatch(message_id, action, payload, permit),
                Err(_) => {
                    warn!(
                        "{} has too many calls in flight, rejecting {} ({})",
                        self.session_id, action, message_id
                    );
                    self.reply_now(frame::encode_error(
                        &message_id,
                        ErrorCode::GenericError.as_str(),
                        "Too many concurrent calls",
                        &json!({}),
                    ));
                }
            },
            Err(err) => {
                warn!("Dropping undecodable frame from {}: {}", self.session_id, err);
                if let Some(reply) = frame::rejection_for(text, &err) {
                    self.reply_now(reply);
                }
            }
        }
    }

    fn spawn_dispatch(
        self: &Arc<Self>,
        message_id: String,
        action: String,
        payload: Value,
        permit: OwnedSemaphorePermit,
    ) {
        let engine = Arc::clone(self);

        tokio::spawn(async move {
            let _permit = permit;
            let ctx = CallContext {
                session_id: engine.session_id.clone(),
                message_id: message_id.clone(),
                action: action.clone(),
            };

            // Inner task so a panicking handler still gets an answer on the wire
            let dispatcher = Arc::clone(&engine.dispatcher);
            let handler_action = action.clone();
            let outcome =
                tokio::spawn(async move { dispatcher.dispatch(ctx, &handler_action, payload).await })
                    .await;

            let reply = match outcome {
                Ok(Ok(result)) => frame::encode_result(&message_id, &result),
                Ok(Err(DispatchError::UnhandledAction(action))) => {
                    warn!("{} called unhandled action {}", engine.session_id, action);
                    frame::encode_error(
                        &message_id,
                        ErrorCode::NotImplemented.as_str(),
                        &format!("Unknown action: {}", action),
                        &json!({}),
                    )
                }
                Ok(Err(DispatchError::Handler(e))) => {
                    debug!("{} ({}) failed: {}", action, message_id, e);
                    frame::encode_error(&message_id, &e.code, &e.description, &e.details)
                }
                Ok(Err(other)) => frame::encode_error(
                    &message_id,
                    ErrorCode::InternalError.as_str(),
                    &other.to_string(),
                    &json!({}),
                ),
                Err(join_error) => {
                    error!("Handler for {} ({}) aborted: {}", action, message_id, join_error);
                    frame::encode_error(
                        &message_id,
                        ErrorCode::InternalError.as_str(),
                        "handler failed",
                        &json!({}),
                    )
                }
            };

            if let Err(e) = engine.outbox.submit(reply).await {
                warn!("Could not answer {} ({}): {}", action, message_id, e);
            }
        });
    }

    fn reply_now(&self, text: String) {
        if let Err(e) = self.outbox.try_submit(text) {
            warn!("Could not send rejection to {}: {}", self.session_id, e);
        }
    }

    /// Fail every call whose deadline has passed
    pub fn sweep(&self, now: Instant) -> Vec<String> {
        self.pending.evict_expired(now)
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}
