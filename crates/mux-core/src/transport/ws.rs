//! WebSocket [`Connector`] on top of `tokio-tungstenite`.
//!
//! Text frames pass through unchanged, binary frames are accepted when they
//! hold UTF-8, control frames are swallowed (tungstenite answers pings on its
//! own), and a close frame ends the stream.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt, future};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{Connector, Link};
use crate::error::MuxError;

/// Connects over `ws://` / `wss://` (TLS via native-tls).
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    /// Extra HTTP headers for the handshake.
    extra_headers: HashMap<String, String>,
}

impl WsConnector {
    pub fn new(extra_headers: HashMap<String, String>) -> Self {
        Self { extra_headers }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Link, MuxError> {
        use tokio_tungstenite::tungstenite::http::Request;

        let mut request = Request::builder().uri(url).header("Host", extract_host(url));
        for (key, value) in &self.extra_headers {
            request = request.header(key.as_str(), value.as_str());
        }
        let request = request
            .body(())
            .map_err(|e| MuxError::Transport(format!("invalid handshake request: {e}")))?;

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| MuxError::Transport(format!("connect to {url} failed: {e}")))?;
        info!("[mux-ws] connected to {url}");

        let (ws_write, ws_read) = stream.split();

        let sink = ws_write
            .sink_map_err(|e| MuxError::Transport(format!("send error: {e}")))
            .with(|text: String| future::ready(Ok::<_, MuxError>(Message::Text(text.into()))));

        let stream = ws_read.filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        warn!("[mux-ws] dropping non-UTF-8 binary frame ({} bytes)", data.len());
                        None
                    }
                },
                Ok(Message::Close(frame)) => {
                    debug!("[mux-ws] received close frame: {frame:?}");
                    None
                }
                Ok(_) => None, // Ping, Pong, Frame
                Err(e) => Some(Err(MuxError::Transport(format!("read error: {e}")))),
            })
        });

        Ok(Link::new(Box::pin(sink), Box::pin(stream)))
    }
}

/// Extract the host (with port, if any) from a URL string.
fn extract_host(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| match (u.host_str(), u.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            _ => String::new(),
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_header_from_url() {
        assert_eq!(extract_host("wss://test.deribit.com/ws/api/v2"), "test.deribit.com");
        assert_eq!(extract_host("ws://127.0.0.1:9000/ws"), "127.0.0.1:9000");
        assert_eq!(extract_host("not a url"), "");
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        // Port 1 on localhost is never a WebSocket server.
        let result = WsConnector::default().connect("ws://127.0.0.1:1/ws").await;
        assert!(matches!(result, Err(MuxError::Transport(_))));
    }
}
