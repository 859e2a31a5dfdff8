//! tokio-tungstenite transport.
//!
//! Splits the socket into a writer task fed by the outbound channel and a
//! reader task that forwards binary frames inbound. The bearer token travels
//! in the upgrade request's `Authorization` header.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::{ConnectRequest, Connector, TransportFrame, TransportLink};
use crate::error::TransportError;

/// Connector for `ws://` and `wss://` endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

/// Endpoint URL with the room id as a query parameter.
pub(crate) fn room_url(endpoint: &str, room_id: &str) -> Result<Url, TransportError> {
    let mut url =
        Url::parse(endpoint).map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(TransportError::InvalidEndpoint(format!(
                "unsupported scheme '{other}'"
            )))
        }
    }
    url.query_pairs_mut().append_pair("room", room_id);
    Ok(url)
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, request: &ConnectRequest) -> Result<TransportLink, TransportError> {
        let url = room_url(&request.endpoint, &request.room_id)?;
        let mut http_request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", request.token))
            .map_err(|e| TransportError::ConnectionFailed(format!("invalid token: {e}")))?;
        http_request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws_stream, _) = tokio_tungstenite::connect_async(http_request)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        log::debug!("WebSocket open for room {}", request.room_id);

        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportFrame>();

        // Writer: runs until every outbound sender is dropped.
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if let Err(e) = ws_writer.send(Message::Binary(data.into())).await {
                    log::warn!("WebSocket send failed: {e}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader: forwards binary frames until close or error.
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        if in_tx.send(TransportFrame::Binary(data.into())).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        let _ = in_tx.send(TransportFrame::Closed);
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = in_tx.send(TransportFrame::Failed(e.to_string()));
                        return;
                    }
                }
            }
            let _ = in_tx.send(TransportFrame::Closed);
        });

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
