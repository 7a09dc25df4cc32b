#![forbid(unsafe_code)]

// WebSocket transport - JSON event frames over tokio-tungstenite

use super::{Connection, Connector};
use crate::error::TransportError;
use crate::protocol::{InboundEvent, OutboundEvent};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects over WebSocket; every frame is `{"type": <event>, ...payload}`.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, _) = connect_async(url).await?;
        let (write, read) = stream.split();
        Ok(Box::new(WsConnection { write, read }))
    }
}

pub struct WsConnection {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn emit(&mut self, event: OutboundEvent) -> Result<(), TransportError> {
        let json = serde_json::to_string(&event)?;
        self.write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<InboundEvent> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return Some(InboundEvent::decode(text.as_str())),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(e)) => {
                    debug!("WebSocket read error: {}", e);
                    return None;
                }
                // Ping/Pong handled by the library
                Some(Ok(_)) => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.write.close().await {
            debug!("WebSocket close failed: {}", e);
        }
    }
}
