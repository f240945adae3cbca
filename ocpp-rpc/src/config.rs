//! Configuration for sessions and the WebSocket transport
//!
//! Both structs follow the same shape: sensible `Default`s plus `with_*`
//! builder methods for the knobs callers usually touch.

use std::time::Duration;

/// How outbound call ids are generated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallIdStrategy {
    /// Decimal `u64` counter; wraps and skips ids still pending
    #[default]
    Counter,
    /// Random v4 UUIDs
    Uuid,
}

/// Per-session settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Timeout used by `call_default`
    pub default_call_timeout: Duration,

    /// Period of the timeout sweeper; bounds how late a timeout is reported
    pub sweep_interval: Duration,

    /// Capacity of the outbound frame queue feeding the writer task
    pub outbound_queue: usize,

    /// Call id generation
    pub id_strategy: CallIdStrategy,

    /// Inbound calls handled at once; further calls are answered `GenericError`
    pub max_concurrent_handlers: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_call_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_millis(100),
            outbound_queue: 64,
            id_strategy: CallIdStrategy::Counter,
            max_concurrent_handlers: 32,
        }
    }
}

impl SessionConfig {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.default_call_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        // tokio::time::interval panics on a zero period
        self.sweep_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_outbound_queue(mut self, capacity: usize) -> Self {
        self.outbound_queue = capacity.max(1);
        self
    }

    pub fn with_id_strategy(mut self, strategy: CallIdStrategy) -> Self {
        self.id_strategy = strategy;
        self
    }

    pub fn with_max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.max_concurrent_handlers = limit.max(1);
        self
    }
}

/// WebSocket transport settings
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Subprotocol offered by clients and echoed by servers
    pub subprotocol: String,

    /// Maximum size of one reassembled message
    pub max_message_size: usize,

    /// Maximum size of a single WebSocket frame
    pub max_frame_size: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            subprotocol: "ocpp1.6".to_string(),
            max_message_size: 64 * 1024,
            max_frame_size: 16 * 1024,
        }
    }
}

impl WsConfig {
    pub fn with_subprotocol(mut self, subprotocol: impl Into<String>) -> Self {
        self.subprotocol = subprotocol.into();
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = SessionConfig::default()
            .with_call_timeout(Duration::from_secs(5))
            .with_sweep_interval(Duration::ZERO)
            .with_outbound_queue(0)
            .with_id_strategy(CallIdStrategy::Uuid)
            .with_max_concurrent_handlers(0);

        assert_eq!(config.default_call_timeout, Duration::from_secs(5));
        assert_eq!(config.sweep_interval, Duration::from_millis(1));
        assert_eq!(config.outbound_queue, 1);
        assert_eq!(config.id_strategy, CallIdStrategy::Uuid);
        assert_eq!(config.max_concurrent_handlers, 1);

        let ws = WsConfig::default().with_subprotocol("ocpp2.0.1");
        assert_eq!(ws.subprotocol, "ocpp2.0.1");
        assert_eq!(ws.max_frame_size, 16 * 1024);
    }
}
