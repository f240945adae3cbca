//! Scripted charge point
//!
//! Drives one complete charging session against a central system:
//!
//! 1. BootNotification
//! 2. Heartbeat
//! 3. StatusNotification (Available)
//! 4. Authorize
//! 5. StartTransaction
//! 6. MeterValues
//! 7. StopTransaction
//! 8. StatusNotification (Available)
//!
//! Every step is an ordinary correlated call; the script stops at the first
//! step that fails.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ocpp_rpc::{ws, CallFailure, Dispatcher, Session, SessionConfig, WsConfig};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::messages::*;

/// Id tag presented by the simulated driver
pub const ID_TAG: &str = "RFID12345678";

/// Why the script stopped early
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("{step} failed: {source}")]
    Call {
        step: &'static str,
        #[source]
        source: CallFailure,
    },

    #[error("{step} reply not understood: {source}")]
    Reply {
        step: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{step} rejected: {status}")]
    Rejected { step: &'static str, status: String },
}

/// Outcome of a completed run
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptSummary {
    pub heartbeat_interval: u32,
    pub transaction_id: i32,
    pub energy_wh: i64,
    pub steps: usize,
}

/// Meter readings reported during the transaction
#[derive(Debug, Clone, Copy)]
struct Readings {
    energy_wh: i64,
    voltage: u32,
    current: u32,
}

impl Readings {
    fn random() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            energy_wh: rng.gen_range(4_000..6_000),
            voltage: rng.gen_range(220..=240),
            current: rng.gen_range(10..=32),
        }
    }
}

/// One correlated call with typed request and response
async fn step<Req, Resp>(
    session: &Session,
    step: &'static str,
    request: &Req,
    timeout: Duration,
) -> Result<Resp, ScriptError>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let payload =
        serde_json::to_value(request).map_err(|source| ScriptError::Reply { step, source })?;

    let reply = session
        .call(step, payload, timeout)
        .await
        .map_err(|source| ScriptError::Call { step, source })?;

    serde_json::from_value(reply).map_err(|source| ScriptError::Reply { step, source })
}

fn status_available() -> StatusNotificationRequest {
    StatusNotificationRequest {
        connector_id: 1,
        error_code: "NoError".into(),
        status: ChargePointStatus::Available,
        timestamp: Some(Utc::now()),
        info: None,
    }
}

/// Run the charging script over an open session
pub async fn run_script(
    session: &Session,
    station: &str,
    timeout: Duration,
) -> Result<ScriptSummary, ScriptError> {
    let boot: BootNotificationResponse = step(
        session,
        "BootNotification",
        &BootNotificationRequest {
            charge_point_vendor: "TestVendor".into(),
            charge_point_model: "TestModel".into(),
            charge_point_serial_number: Some(format!("{}-SN", station)),
            firmware_version: Some("1.0.0".into()),
        },
        timeout,
    )
    .await?;
    if boot.status != RegistrationStatus::Accepted {
        return Err(ScriptError::Rejected {
            step: "BootNotification",
            status: format!("{:?}", boot.status),
        });
    }
    info!("Registered with central system, heartbeat every {}s", boot.interval);

    let heartbeat: HeartbeatResponse =
        step(session, "Heartbeat", &serde_json::json!({}), timeout).await?;
    info!("Central system time: {}", heartbeat.current_time);

    let _: serde_json::Value =
        step(session, "StatusNotification", &status_available(), timeout).await?;

    let authorized: AuthorizeResponse = step(
        session,
        "Authorize",
        &AuthorizeRequest {
            id_tag: ID_TAG.into(),
        },
        timeout,
    )
    .await?;
    if authorized.id_tag_info.status != AuthorizationStatus::Accepted {
        return Err(ScriptError::Rejected {
            step: "Authorize",
            status: format!("{:?}", authorized.id_tag_info.status),
        });
    }

    let meter_start = 0;
    let started: StartTransactionResponse = step(
        session,
        "StartTransaction",
        &StartTransactionRequest {
            connector_id: 1,
            id_tag: ID_TAG.into(),
            meter_start,
            timestamp: Some(Utc::now()),
            reservation_id: None,
        },
        timeout,
    )
    .await?;
    let transaction_id = started.transaction_id;
    info!("Transaction {} started", transaction_id);

    let readings = Readings::random();
    let _: serde_json::Value = step(
        session,
        "MeterValues",
        &MeterValuesRequest {
            connector_id: 1,
            transaction_id: Some(transaction_id),
            meter_value: vec![MeterValue {
                timestamp: Some(Utc::now()),
                sampled_value: vec![
                    SampledValue::new(readings.energy_wh, "Energy.Active.Import.Register", "Wh"),
                    SampledValue::new(readings.voltage, "Voltage", "V"),
                    SampledValue::new(readings.current, "Current.Import", "A"),
                ],
            }],
        },
        timeout,
    )
    .await?;

    let meter_stop = meter_start + readings.energy_wh * 3;
    let _: StopTransactionResponse = step(
        session,
        "StopTransaction",
        &StopTransactionRequest {
            transaction_id,
            meter_stop,
            timestamp: Some(Utc::now()),
            id_tag: None,
            reason: Some("Local".into()),
        },
        timeout,
    )
    .await?;
    info!("Transaction {} stopped at {} Wh", transaction_id, meter_stop);

    let _: serde_json::Value =
        step(session, "StatusNotification", &status_available(), timeout).await?;

    Ok(ScriptSummary {
        heartbeat_interval: boot.interval,
        transaction_id,
        energy_wh: meter_stop - meter_start,
        steps: 8,
    })
}

/// Connect to `url` as `station` and run the script
pub async fn simulate(
    url: &str,
    station: &str,
    session_config: SessionConfig,
    ws_config: &WsConfig,
) -> Result<ScriptSummary, Box<dyn std::error::Error>> {
    let timeout = session_config.default_call_timeout;
    let (sink, stream) = ws::connect(url, station, ws_config).await?;

    let session = Session::new(station, session_config, Arc::new(Dispatcher::new()));
    session.attach(sink, stream)?;

    let outcome = run_script(&session, station, timeout).await;
    session.close("simulation finished");

    Ok(outcome?)
}
