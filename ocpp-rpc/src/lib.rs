//! # OCPP-J RPC Core
//!
//! Call correlation for OCPP-J over WebSocket: every outbound CALL is matched
//! to its CALLRESULT or CALLERROR by message id, inbound CALLs are routed to
//! registered action handlers, and nothing is left waiting when a call times
//! out or the connection drops.
//!
//! ## Architecture
//!
//! ```text
//!  Session::call(action, payload, timeout)
//!       │                                ▲ Result / CallFailure
//!       ▼                                │
//! ┌──────────────────────────────────────┴──┐
//! │  Engine                                 │
//! │  ┌─────────────┐   ┌─────────────────┐  │
//! │  │ CallId gen  │──►│  PendingTable   │◄─┼── sweeper (timeouts)
//! │  └─────────────┘   └────────▲────────┘  │
//! │                             │ resolve   │
//! │  ┌─────────────┐   ┌────────┴────────┐  │
//! │  │ Dispatcher  │◄──│  route(frame)   │  │
//! │  └─────────────┘   └────────▲────────┘  │
//! └──────┬──────────────────────┼───────────┘
//!        │ outbound queue       │ reader task
//!        ▼                      │
//!   writer task ──► FrameSink   FrameStream (WebSocket / in-memory)
//! ```
//!
//! ## Frames
//!
//! | Type | Layout |
//! |------|--------|
//! | CALL | `[2, "<id>", "<action>", {payload}]` |
//! | CALLRESULT | `[3, "<id>", {payload}]` |
//! | CALLERROR | `[4, "<id>", "<code>", "<description>", {details}]` |
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use ocpp_rpc::{ws, Dispatcher, Session, SessionConfig, WsConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (sink, stream) = ws::connect("ws://localhost:8081/ocpp", "CP001", &WsConfig::default()).await?;
//!
//!     let session = Session::new("CP001", SessionConfig::default(), Arc::new(Dispatcher::new()));
//!     session.attach(sink, stream)?;
//!
//!     let reply = session
//!         .call("Heartbeat", json!({}), Duration::from_secs(10))
//!         .await?;
//!     println!("currentTime = {}", reply["currentTime"]);
//!
//!     session.close("done");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod frame;
pub mod pending;
pub mod session;
pub mod transport;
pub mod ws;

pub use config::{CallIdStrategy, SessionConfig, WsConfig};
pub use dispatcher::{ActionHandler, CallContext, Dispatcher};
pub use engine::Engine;
pub use error::{
    CallFailure, DispatchError, FrameError, HandlerError, SessionError, TransportError,
};
pub use frame::{ErrorCode, Frame, MessageType};
pub use pending::{CallIdGenerator, Outcome, PendingTable};
pub use session::{Session, SessionState};
pub use transport::{memory_pair, FrameSink, FrameStream, MemoryPeer, MemorySink, MemoryStream};
