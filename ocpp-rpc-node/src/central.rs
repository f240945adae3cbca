//! Central system server
//!
//! Accepts charge point WebSocket connections, opens one session per
//! connection and keeps the registry in step with connection lifetimes.

use std::net::SocketAddr;
use std::sync::Arc;

use ocpp_rpc::{ws, Dispatcher, Session, SessionConfig, WsConfig};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::handlers::CentralSystem;

/// Serve charge points on `bind` until Ctrl-C
pub async fn serve(
    bind: SocketAddr,
    central: Arc<CentralSystem>,
    session_config: SessionConfig,
    ws_config: WsConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(bind).await?;
    let dispatcher = Arc::new(central.dispatcher()?);

    info!("Central system listening on ws://{}/ocpp/<chargePointId>", listener.local_addr()?);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(
                        stream,
                        peer,
                        Arc::clone(&central),
                        Arc::clone(&dispatcher),
                        session_config.clone(),
                        ws_config.clone(),
                    ));
                }
                Err(e) => warn!("Accept failed: {}", e),
            },

            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    info!("Closing charge points: {:?}", central.registry().ids());
    let closed = central.registry().close_all("central system shutting down");
    info!(
        "Closed {} session(s), {} transaction(s) left open",
        closed,
        central.active_transactions()
    );
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    central: Arc<CentralSystem>,
    dispatcher: Arc<Dispatcher>,
    session_config: SessionConfig,
    ws_config: WsConfig,
) {
    let (charge_point_id, sink, stream) = match ws::accept(stream, &ws_config).await {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", peer, e);
            return;
        }
    };

    info!("Charge point {} connected from {}", charge_point_id, peer);

    let session = Session::new(charge_point_id, session_config, dispatcher);
    central.registry().add(session.clone());

    if let Err(e) = session.attach(sink, stream) {
        error!("Could not open session {}: {}", session.id(), e);
        central.registry().remove(&session);
        return;
    }

    session.closed().await;

    let registry = central.registry();
    if let Some(record) = registry.get(session.id()).filter(|r| r.session.ptr_eq(&session)) {
        info!(
            "Charge point {} ({} {}) closed in state {:?}",
            session.id(),
            record.vendor.as_deref().unwrap_or("?"),
            record.model.as_deref().unwrap_or("?"),
            registry.state(session.id())
        );
    }
    registry.remove(&session);
}
