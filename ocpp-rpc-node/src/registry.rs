//! Connected charge points
//!
//! One record per charge point id. A charge point that reconnects replaces its
//! previous record and the old session is closed.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ocpp_rpc::Session;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::messages::ChargePointStatus;

/// Charge point state as seen by the central system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargePointState {
    Disconnected,
    Connected,
    Available,
    Preparing,
    Charging,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
}

impl ChargePointState {
    /// State implied by a StatusNotification; `None` for statuses not tracked
    pub fn from_status(status: ChargePointStatus) -> Option<Self> {
        match status {
            ChargePointStatus::Available => Some(Self::Available),
            ChargePointStatus::Preparing => Some(Self::Preparing),
            ChargePointStatus::Charging
            | ChargePointStatus::SuspendedEV
            | ChargePointStatus::SuspendedEVSE => Some(Self::Charging),
            ChargePointStatus::Finishing => Some(Self::Finishing),
            ChargePointStatus::Reserved => Some(Self::Reserved),
            ChargePointStatus::Unavailable => Some(Self::Unavailable),
            ChargePointStatus::Faulted => Some(Self::Faulted),
            ChargePointStatus::Other => None,
        }
    }
}

/// What the central system knows about one charge point
#[derive(Debug, Clone)]
pub struct ChargePointRecord {
    pub session: Session,
    pub state: ChargePointState,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub connected_at: DateTime<Utc>,
}

/// Charge point id -> record
#[derive(Default)]
pub struct ChargePointRegistry {
    charge_points: RwLock<HashMap<String, ChargePointRecord>>,
}

impl ChargePointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly connected session under its id
    ///
    /// Returns the session it replaced, which has been closed.
    pub fn add(&self, session: Session) -> Option<Session> {
        let record = ChargePointRecord {
            session: session.clone(),
            state: ChargePointState::Connected,
            vendor: None,
            model: None,
            connected_at: Utc::now(),
        };

        let replaced = self
            .charge_points
            .write()
            .insert(session.id().to_string(), record);

        info!(
            "Charge point {} connected ({} total)",
            session.id(),
            self.count()
        );

        replaced.map(|old| {
            warn!("Charge point {} reconnected, closing previous session", session.id());
            old.session.close("replaced by a new connection");
            old.session
        })
    }

    /// Remove `session` if it is still the one registered under its id
    pub fn remove(&self, session: &Session) -> bool {
        let mut charge_points = self.charge_points.write();

        let current = charge_points
            .get(session.id())
            .is_some_and(|record| record.session.ptr_eq(session));
        if current {
            if let Some(record) = charge_points.remove(session.id()) {
                info!(
                    "Charge point {} disconnected after {}s",
                    session.id(),
                    (Utc::now() - record.connected_at).num_seconds()
                );
            }
        }
        current
    }

    pub fn get(&self, id: &str) -> Option<ChargePointRecord> {
        self.charge_points.read().get(id).cloned()
    }

    /// Current state; `Disconnected` for unknown ids
    pub fn state(&self, id: &str) -> ChargePointState {
        self.charge_points
            .read()
            .get(id)
            .map(|r| r.state)
            .unwrap_or(ChargePointState::Disconnected)
    }

    pub fn set_state(&self, id: &str, state: ChargePointState) -> bool {
        match self.charge_points.write().get_mut(id) {
            Some(record) => {
                if record.state != state {
                    info!("Charge point {}: {:?} -> {:?}", id, record.state, state);
                }
                record.state = state;
                true
            }
            None => false,
        }
    }

    /// Record vendor and model from BootNotification
    pub fn set_identity(&self, id: &str, vendor: &str, model: &str) -> bool {
        match self.charge_points.write().get_mut(id) {
            Some(record) => {
                record.vendor = Some(vendor.to_string());
                record.model = Some(model.to_string());
                true
            }
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.charge_points.read().len()
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.charge_points.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close every registered session; records go away as their connections end
    pub fn close_all(&self, reason: &str) -> usize {
        let sessions: Vec<Session> = self
            .charge_points
            .read()
            .values()
            .map(|r| r.session.clone())
            .collect();

        sessions.iter().filter(|s| s.close(reason)).count()
    }
}
