//! Central system action handlers
//!
//! Core profile actions a charge point sends to the central system:
//! - BootNotification / Heartbeat
//! - StatusNotification
//! - Authorize
//! - StartTransaction / StopTransaction
//! - MeterValues
//!
//! Handlers run on the session's dispatch tasks; the registry and the
//! transaction table are the only shared state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ocpp_rpc::{ActionHandler, CallContext, DispatchError, Dispatcher, HandlerError};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::messages::*;
use crate::registry::{ChargePointRegistry, ChargePointState};

/// Heartbeat interval handed out in BootNotification replies (seconds)
pub const HEARTBEAT_INTERVAL: u32 = 300;

/// A transaction between StartTransaction and StopTransaction
#[derive(Debug, Clone)]
pub struct Transaction {
    pub charge_point_id: String,
    pub connector_id: u32,
    pub id_tag: String,
    pub meter_start: i64,
    pub started_at: DateTime<Utc>,
}

/// Central system state shared by every charge point session
pub struct CentralSystem {
    registry: Arc<ChargePointRegistry>,
    next_transaction_id: AtomicI32,
    transactions: Mutex<HashMap<i32, Transaction>>,
}

type HandlerFn = fn(&CentralSystem, &CallContext, Value) -> Result<Value, HandlerError>;

/// Binds one handler method to the shared central system
struct Route {
    central: Arc<CentralSystem>,
    handle: HandlerFn,
}

#[async_trait]
impl ActionHandler for Route {
    async fn handle(&self, ctx: CallContext, payload: Value) -> Result<Value, HandlerError> {
        (self.handle)(&self.central, &ctx, payload)
    }
}

fn parse<T: DeserializeOwned>(payload: Value) -> Result<T, HandlerError> {
    Ok(serde_json::from_value(payload)?)
}

fn reply<T: Serialize>(response: &T) -> Result<Value, HandlerError> {
    serde_json::to_value(response).map_err(HandlerError::internal)
}

/// Authorization decision for an id tag
pub fn authorize_id_tag(id_tag: &str) -> AuthorizationStatus {
    if id_tag.starts_with("BLOCKED") {
        AuthorizationStatus::Blocked
    } else if id_tag.starts_with("EXPIRED") {
        AuthorizationStatus::Expired
    } else if id_tag.starts_with("INVALID") {
        AuthorizationStatus::Invalid
    } else {
        AuthorizationStatus::Accepted
    }
}

impl CentralSystem {
    pub fn new(registry: Arc<ChargePointRegistry>) -> Self {
        Self {
            registry,
            next_transaction_id: AtomicI32::new(1),
            transactions: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ChargePointRegistry> {
        &self.registry
    }

    pub fn active_transactions(&self) -> usize {
        self.transactions.lock().len()
    }

    /// Dispatcher with every core profile action registered
    pub fn dispatcher(self: &Arc<Self>) -> Result<Dispatcher, DispatchError> {
        let routes: [(&str, HandlerFn); 7] = [
            ("BootNotification", Self::boot_notification),
            ("Heartbeat", Self::heartbeat),
            ("StatusNotification", Self::status_notification),
            ("Authorize", Self::authorize),
            ("StartTransaction", Self::start_transaction),
            ("StopTransaction", Self::stop_transaction),
            ("MeterValues", Self::meter_values),
        ];

        let dispatcher = Dispatcher::new();
        for (action, handle) in routes {
            dispatcher.register_handler(
                action,
                Route {
                    central: Arc::clone(self),
                    handle,
                },
            )?;
        }
        Ok(dispatcher)
    }

    fn set_state(&self, charge_point_id: &str, state: ChargePointState) {
        if !self.registry.set_state(charge_point_id, state) {
            debug!("State update for unregistered charge point {}", charge_point_id);
        }
    }

    pub fn boot_notification(&self, ctx: &CallContext, payload: Value) -> Result<Value, HandlerError> {
        let request: BootNotificationRequest = parse(payload)?;

        info!(
            "BootNotification from {}: {} {} (serial: {}, firmware: {})",
            ctx.session_id,
            request.charge_point_vendor,
            request.charge_point_model,
            request.charge_point_serial_number.as_deref().unwrap_or("-"),
            request.firmware_version.as_deref().unwrap_or("-"),
        );

        self.registry.set_identity(
            &ctx.session_id,
            &request.charge_point_vendor,
            &request.charge_point_model,
        );
        self.set_state(&ctx.session_id, ChargePointState::Available);

        reply(&BootNotificationResponse {
            status: RegistrationStatus::Accepted,
            current_time: Utc::now(),
            interval: HEARTBEAT_INTERVAL,
        })
    }

    pub fn heartbeat(&self, ctx: &CallContext, _payload: Value) -> Result<Value, HandlerError> {
        debug!("Heartbeat from {}", ctx.session_id);
        reply(&HeartbeatResponse {
            current_time: Utc::now(),
        })
    }

    pub fn status_notification(&self, ctx: &CallContext, payload: Value) -> Result<Value, HandlerError> {
        let request: StatusNotificationRequest = parse(payload)?;

        info!(
            "StatusNotification from {}: connector {} {:?} ({})",
            ctx.session_id, request.connector_id, request.status, request.error_code
        );

        match ChargePointState::from_status(request.status) {
            Some(state) => self.set_state(&ctx.session_id, state),
            None => debug!("Ignoring untracked status from {}", ctx.session_id),
        }

        Ok(json!({}))
    }

    pub fn authorize(&self, ctx: &CallContext, payload: Value) -> Result<Value, HandlerError> {
        let request: AuthorizeRequest = parse(payload)?;
        let status = authorize_id_tag(&request.id_tag);

        info!("Authorize {} from {}: {:?}", request.id_tag, ctx.session_id, status);

        reply(&AuthorizeResponse {
            id_tag_info: IdTagInfo::new(status),
        })
    }

    pub fn start_transaction(&self, ctx: &CallContext, payload: Value) -> Result<Value, HandlerError> {
        let request: StartTransactionRequest = parse(payload)?;
        let transaction_id = self.next_transaction_id.fetch_add(1, Ordering::SeqCst);

        info!(
            "StartTransaction {} on {} connector {}: idTag {}, meterStart {} Wh",
            transaction_id, ctx.session_id, request.connector_id, request.id_tag, request.meter_start
        );

        self.transactions.lock().insert(
            transaction_id,
            Transaction {
                charge_point_id: ctx.session_id.clone(),
                connector_id: request.connector_id,
                id_tag: request.id_tag,
                meter_start: request.meter_start,
                started_at: request.timestamp.unwrap_or_else(Utc::now),
            },
        );
        self.set_state(&ctx.session_id, ChargePointState::Charging);

        reply(&StartTransactionResponse {
            transaction_id,
            id_tag_info: IdTagInfo::new(AuthorizationStatus::Accepted),
        })
    }

    pub fn stop_transaction(&self, ctx: &CallContext, payload: Value) -> Result<Value, HandlerError> {
        let request: StopTransactionRequest = parse(payload)?;
        let reason = request.reason.as_deref().unwrap_or("Local");

        match self.transactions.lock().remove(&request.transaction_id) {
            Some(tx) => {
                if tx.charge_point_id != ctx.session_id {
                    warn!(
                        "Transaction {} started on {} but stopped by {}",
                        request.transaction_id, tx.charge_point_id, ctx.session_id
                    );
                }
                info!(
                    "StopTransaction {} on {} connector {} ({}): {} Wh in {}s ({})",
                    request.transaction_id,
                    ctx.session_id,
                    tx.connector_id,
                    tx.id_tag,
                    request.meter_stop - tx.meter_start,
                    (Utc::now() - tx.started_at).num_seconds(),
                    reason
                );
            }
            None => warn!(
                "StopTransaction for unknown transaction {} from {} ({})",
                request.transaction_id, ctx.session_id, reason
            ),
        }
        self.set_state(&ctx.session_id, ChargePointState::Available);

        reply(&StopTransactionResponse {
            id_tag_info: request
                .id_tag
                .as_deref()
                .map(|tag| IdTagInfo::new(authorize_id_tag(tag))),
        })
    }

    pub fn meter_values(&self, ctx: &CallContext, payload: Value) -> Result<Value, HandlerError> {
        let request: MeterValuesRequest = parse(payload)?;

        for meter_value in &request.meter_value {
            for sample in &meter_value.sampled_value {
                info!(
                    "MeterValues from {} connector {} (tx {:?}): {} = {} {}",
                    ctx.session_id,
                    request.connector_id,
                    request.transaction_id,
                    sample.measurand(),
                    sample.value,
                    sample.unit()
                );
            }
        }

        Ok(json!({}))
    }
}
