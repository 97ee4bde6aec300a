#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::trace;
use url::Url;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type BoxTransport = Box<dyn Transport>;

/// Factory for transports, injectable so tests can script sessions.
pub type TransportConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<BoxTransport>> + Send + Sync>;

/// One bidirectional line-oriented connection to the relay.
#[async_trait]
pub trait Transport: Send {
	/// Next inbound text payload (may hold several newline-separated
	/// lines). `Ok(None)` means the peer closed the connection.
	async fn next_text(&mut self) -> anyhow::Result<Option<String>>;

	/// Send one protocol line.
	async fn send_line(&mut self, line: &str) -> anyhow::Result<()>;

	async fn close(&mut self) -> anyhow::Result<()>;
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Production transport: secure WebSocket carrying text lines.
pub struct WsTransport {
	ws: WsStream,
}

impl WsTransport {
	pub async fn connect(url: Url) -> anyhow::Result<Self> {
		let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
			.await
			.context("connect_async to relay ws")?;
		Ok(Self { ws })
	}

	/// Default connector used when the engine config does not inject
	/// one.
	pub fn connector() -> TransportConnector {
		Arc::new(|url: Url| {
			Box::pin(async move {
				let transport = WsTransport::connect(url).await?;
				Ok(Box::new(transport) as BoxTransport)
			}) as BoxFuture<'static, anyhow::Result<BoxTransport>>
		})
	}
}

#[async_trait]
impl Transport for WsTransport {
	async fn next_text(&mut self) -> anyhow::Result<Option<String>> {
		loop {
			let Some(msg) = self.ws.next().await else {
				return Ok(None);
			};
			let msg = msg.context("ws read")?;

			match msg {
				Message::Text(text) => return Ok(Some(text.to_string())),
				Message::Ping(payload) => {
					trace!("ws ping");
					let _ = self.ws.send(Message::Pong(payload)).await;
				}
				Message::Close(frame) => {
					trace!(?frame, "ws close frame");
					return Ok(None);
				}
				Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {}
			}
		}
	}

	async fn send_line(&mut self, line: &str) -> anyhow::Result<()> {
		self.ws
			.send(Message::Text(line.to_string().into()))
			.await
			.context("ws send")
	}

	async fn close(&mut self) -> anyhow::Result<()> {
		self.ws.close(None).await.context("ws close")
	}
}
