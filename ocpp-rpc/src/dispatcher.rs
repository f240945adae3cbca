//! Routing of inbound CALLs to registered action handlers
//!
//! Handlers can be registered at any time; the table sits behind an
//! `RwLock` and the handler is cloned out before it runs, so a slow handler
//! never holds the lock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{DispatchError, HandlerError};

/// Where an inbound call came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    /// Session (charge point) identifier
    pub session_id: String,
    /// Message id of the inbound CALL
    pub message_id: String,
    pub action: String,
}

/// Handles one action
///
/// Implemented for plain async closures as well:
///
/// ```
/// use ocpp_rpc::{CallContext, Dispatcher, HandlerError};
/// use serde_json::{json, Value};
///
/// let dispatcher = Dispatcher::new();
/// dispatcher
///     .register_handler("Heartbeat", |_ctx: CallContext, _payload: Value| async move {
///         Ok::<_, HandlerError>(json!({"currentTime": "2024-01-01T00:00:00Z"}))
///     })
///     .unwrap();
/// ```
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, ctx: CallContext, payload: Value) -> Result<Value, HandlerError>;
}

#[async_trait]
impl<F, Fut> ActionHandler for F
where
    F: Fn(CallContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: CallContext, payload: Value) -> Result<Value, HandlerError> {
        (self)(ctx, payload).await
    }
}

/// Action name -> handler table
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; each action can be claimed once
    pub fn register_handler<H>(&self, action: impl Into<String>, handler: H) -> Result<(), DispatchError>
    where
        H: ActionHandler + 'static,
    {
        let action = action.into();
        let mut handlers = self.handlers.write();

        if handlers.contains_key(&action) {
            return Err(DispatchError::DuplicateHandler(action));
        }

        info!("Registered handler for {}", action);
        handlers.insert(action, Arc::new(handler));
        Ok(())
    }

    /// Run the handler registered for `action`
    pub async fn dispatch(
        &self,
        ctx: CallContext,
        action: &str,
        payload: Value,
    ) -> Result<Value, DispatchError> {
        let handler = self
            .handlers
            .read()
            .get(action)
            .cloned()
            .ok_or_else(|| DispatchError::UnhandledAction(action.to_string()))?;

        debug!("Dispatching {} ({}) from {}", action, ctx.message_id, ctx.session_id);
        Ok(handler.handle(ctx, payload).await?)
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.read().contains_key(action)
    }

    /// Registered action names, sorted
    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self.handlers.read().keys().cloned().collect();
        actions.sort();
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ErrorCode;
    use serde_json::json;

    fn ctx(action: &str) -> CallContext {
        CallContext {
            session_id: "CP001".into(),
            message_id: "m-1".into(),
            action: action.into(),
        }
    }

    struct Echo;

    #[async_trait]
    impl ActionHandler for Echo {
        async fn handle(&self, ctx: CallContext, payload: Value) -> Result<Value, HandlerError> {
            Ok(json!({"from": ctx.session_id, "echo": payload}))
        }
    }

    #[tokio::test]
    async fn test_dispatch_to_registered_handler() {
        let dispatcher = Dispatcher::new();
        dispatcher.register_handler("DataTransfer", Echo).unwrap();

        let reply = dispatcher
            .dispatch(ctx("DataTransfer"), "DataTransfer", json!({"data": "x"}))
            .await
            .unwrap();

        assert_eq!(reply, json!({"from": "CP001", "echo": {"data": "x"}}));
    }

    #[tokio::test]
    async fn test_unhandled_action() {
        let dispatcher = Dispatcher::new();
        let err = dispatcher
            .dispatch(ctx("Reset"), "Reset", json!({}))
            .await
            .unwrap_err();

        assert_eq!(err, DispatchError::UnhandledAction("Reset".into()));
    }

    #[test]
    fn test_duplicate_handler() {
        let dispatcher = Dispatcher::new();
        dispatcher.register_handler("DataTransfer", Echo).unwrap();

        assert_eq!(
            dispatcher.register_handler("DataTransfer", Echo).unwrap_err(),
            DispatchError::DuplicateHandler("DataTransfer".into())
        );
        assert_eq!(dispatcher.actions(), vec!["DataTransfer".to_string()]);
    }

    #[tokio::test]
    async fn test_closure_handler_failure() {
        let dispatcher = Dispatcher::new();
        dispatcher
            .register_handler("Authorize", |_ctx: CallContext, payload: Value| async move {
                payload
                    .get("idTag")
                    .and_then(Value::as_str)
                    .map(|_| json!({"idTagInfo": {"status": "Accepted"}}))
                    .ok_or_else(|| HandlerError::new(ErrorCode::FormationViolation, "idTag missing"))
            })
            .unwrap();

        assert!(dispatcher.contains("Authorize"));

        let err = dispatcher
            .dispatch(ctx("Authorize"), "Authorize", json!({}))
            .await
            .unwrap_err();

        match err {
            DispatchError::Handler(e) => {
                assert_eq!(e.code, "FormationViolation");
                assert_eq!(e.description, "idTag missing");
            }
            other => panic!("Expected handler error, got {:?}", other),
        }
    }
}
