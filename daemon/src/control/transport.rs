use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::ControlConfig;

/// Opens control connections.
#[async_trait]
pub trait ControlTransport: Send + Sync {
    async fn dial(&self) -> Result<Box<dyn ControlLink>>;
}

/// One open text-frame connection.
#[async_trait]
pub trait ControlLink: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;
    /// Next text frame, or `None` once the peer has closed the connection.
    /// Must be cancel-safe: the manager races it against outbound frames.
    async fn recv_text(&mut self) -> Result<Option<String>>;
}

/// Control-channel URL derived from the API endpoint. Only the authority of
/// the endpoint is kept; `http` maps to `ws` and `https` to `wss`.
pub fn control_url(api_base: &str, cfg: &ControlConfig) -> Result<String> {
    let base = Url::parse(api_base).with_context(|| format!("parsing API endpoint {api_base}"))?;
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => bail!("unsupported API endpoint scheme {other:?}"),
    };
    let Some(host) = base.host_str() else {
        bail!("API endpoint {api_base} has no host");
    };
    let authority = match base.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let path = if cfg.path.starts_with('/') {
        cfg.path.clone()
    } else {
        format!("/{}", cfg.path)
    };
    if cfg.query.is_empty() {
        Ok(format!("{scheme}://{authority}{path}"))
    } else {
        Ok(format!("{scheme}://{authority}{path}?{}", cfg.query))
    }
}

/// WebSocket transport. The dial, including the HTTP upgrade, is bounded by
/// `handshake_timeout`.
pub struct WsTransport {
    url: String,
    handshake_timeout: Duration,
}

impl WsTransport {
    pub fn new(url: String, handshake_timeout: Duration) -> Self {
        Self {
            url,
            handshake_timeout,
        }
    }
}

#[async_trait]
impl ControlTransport for WsTransport {
    async fn dial(&self) -> Result<Box<dyn ControlLink>> {
        let (stream, _response) =
            tokio::time::timeout(self.handshake_timeout, connect_async(self.url.as_str()))
                .await
                .with_context(|| {
                    format!("dial to {} timed out after {:?}", self.url, self.handshake_timeout)
                })?
                .with_context(|| format!("dialing {}", self.url))?;
        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl ControlLink for WsLink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::Text(text))
            .await
            .context("writing control frame")
    }

    async fn recv_text(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                None | Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                // WebSocket-level pings are answered by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e).context("reading control frame"),
            }
        }
    }
}
