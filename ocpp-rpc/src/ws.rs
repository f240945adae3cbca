//! WebSocket transport
//!
//! Client and server handshakes for OCPP-J over `tokio-tungstenite`, plus the
//! [`FrameSink`]/[`FrameStream`] implementations a [`crate::Session`] runs on.
//! Handles:
//! - OCPP subprotocol negotiation (`Sec-WebSocket-Protocol`)
//! - charge point identity from the URL path
//! - text/binary/control frame sorting

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{
    accept_hdr_async_with_config, connect_async_with_config, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::config::WsConfig;
use crate::error::TransportError;
use crate::transport::{FrameSink, FrameStream};

/// Write half of a WebSocket connection
pub struct WsSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

/// Read half of a WebSocket connection
pub struct WsStream<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

/// Client connection halves
pub type ClientSink = WsSink<MaybeTlsStream<TcpStream>>;
pub type ClientStream = WsStream<MaybeTlsStream<TcpStream>>;

fn split<S>(ws: WebSocketStream<S>) -> (WsSink<S>, WsStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, stream) = ws.split();
    (WsSink { inner: sink }, WsStream { inner: stream })
}

fn tungstenite_config(config: &WsConfig) -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(config.max_message_size),
        max_frame_size: Some(config.max_frame_size),
        ..Default::default()
    }
}

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, station_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), station_id)
}

/// Charge point identity from a request path: `/ocpp/CP001` -> `CP001`
pub fn charge_point_id_from_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .last()
        .unwrap_or("unknown")
        .to_string()
}

/// Connect to a central system as `station_id`
pub async fn connect(
    base_url: &str,
    station_id: &str,
    config: &WsConfig,
) -> Result<(ClientSink, ClientStream), TransportError> {
    let url = build_ocpp_url(base_url, station_id);

    let mut request = url.as_str().into_client_request()?;
    let protocol = HeaderValue::from_str(&config.subprotocol)
        .map_err(|_| TransportError::InvalidRequest(config.subprotocol.clone()))?;
    request
        .headers_mut()
        .insert(header::SEC_WEBSOCKET_PROTOCOL, protocol);

    let (ws, response) =
        connect_async_with_config(request, Some(tungstenite_config(config)), false).await?;

    let accepted = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());

    if accepted != Some(config.subprotocol.as_str()) {
        warn!(
            "Central system did not accept {} subprotocol, got: {:?}",
            config.subprotocol, accepted
        );
    }

    info!("WebSocket connected to {}", url);
    Ok(split(ws))
}

/// Accept a charge point connection
///
/// Returns the charge point id taken from the request path along with the
/// connection halves.
pub async fn accept<S>(
    stream: S,
    config: &WsConfig,
) -> Result<(String, WsSink<S>, WsStream<S>), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let path = Arc::new(Mutex::new(String::new()));
    let captured = Arc::clone(&path);
    let subprotocol = config.subprotocol.clone();

    let callback = move |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        *captured.lock() = request.uri().path().to_string();

        let offered = request
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').any(|p| p.trim() == subprotocol))
            .unwrap_or(false);

        if offered {
            if let Ok(value) = HeaderValue::from_str(&subprotocol) {
                response
                    .headers_mut()
                    .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
            }
        } else {
            warn!(
                "Client at {} did not offer {} subprotocol",
                request.uri().path(),
                subprotocol
            );
        }

        Ok(response)
    };

    let ws = accept_hdr_async_with_config(stream, callback, Some(tungstenite_config(config))).await?;
    let charge_point_id = charge_point_id_from_path(&path.lock());

    let (sink, stream) = split(ws);
    Ok((charge_point_id, sink, stream))
}

#[async_trait]
impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.inner.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.inner.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl<S> FrameStream for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(data)) => {
                    return Some(String::from_utf8(data).map_err(|_| TransportError::InvalidUtf8))
                }
                Ok(Message::Close(frame)) => {
                    debug!("WebSocket close frame: {:?}", frame);
                    return None;
                }
                // Pongs are queued by tungstenite itself
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => return None,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_ocpp_url() {
        let url = build_ocpp_url("ws://localhost:8081/ocpp", "CP001");
        assert_eq!(url, "ws://localhost:8081/ocpp/CP001");

        let url = build_ocpp_url("ws://localhost:8081/ocpp/", "CP001");
        assert_eq!(url, "ws://localhost:8081/ocpp/CP001");
    }

    #[test]
    fn test_charge_point_id_from_path() {
        assert_eq!(charge_point_id_from_path("/ocpp/CP001"), "CP001");
        assert_eq!(charge_point_id_from_path("/CP001"), "CP001");
        assert_eq!(charge_point_id_from_path("/ocpp/CP001/"), "CP001");
        assert_eq!(charge_point_id_from_path("/"), "unknown");
        assert_eq!(charge_point_id_from_path(""), "unknown");
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let config = WsConfig::default();

        let server = tokio::spawn({
            let config = config.clone();
            async move { accept(server_io, &config).await }
        });

        let mut request = "ws://localhost/ocpp/CP042".into_client_request().unwrap();
        request.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("ocpp1.6"),
        );
        let (client, response) = tokio_tungstenite::client_async(request, client_io)
            .await
            .unwrap();
        assert_eq!(
            response.headers().get(header::SEC_WEBSOCKET_PROTOCOL).unwrap(),
            "ocpp1.6"
        );

        let (charge_point_id, mut sink, mut stream) = server.await.unwrap().unwrap();
        assert_eq!(charge_point_id, "CP042");

        let (mut client_sink, mut client_stream) = split(client);
        client_sink.send(r#"[2,"1","Heartbeat",{}]"#.to_string()).await.unwrap();
        assert_eq!(
            stream.recv().await.unwrap().unwrap(),
            r#"[2,"1","Heartbeat",{}]"#
        );

        sink.send(r#"[3,"1",{}]"#.to_string()).await.unwrap();
        assert_eq!(client_stream.recv().await.unwrap().unwrap(), r#"[3,"1",{}]"#);

        client_sink.close().await.unwrap();
        assert!(stream.recv().await.is_none());
    }
}
