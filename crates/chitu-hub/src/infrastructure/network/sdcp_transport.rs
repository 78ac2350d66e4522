//! tokio-tungstenite implementation of [`PrinterTransport`].
//!
//! Each printer serves SDCP at `ws://<ip>:<port>/websocket`.  WebSocket
//! protocol pings are answered by tungstenite itself when the stream is next
//! polled or written; the session only sees them as liveness.

use async_trait::async_trait;
use chitu_core::PrinterDescriptor;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use super::session_manager::{LinkEvent, PrinterLink, PrinterTransport, TransportError};

#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PrinterTransport for WebSocketTransport {
    async fn connect(&self, printer: &PrinterDescriptor) -> Result<Box<dyn PrinterLink>, TransportError> {
        let url = printer.websocket_url();
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(format!("{url}: {e}")))?;
        debug!("websocket open to {url}");
        Ok(Box::new(WebSocketLink { stream, url }))
    }
}

struct WebSocketLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    url: String,
}

#[async_trait]
impl PrinterLink for WebSocketLink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn next_event(&mut self) -> Option<Result<LinkEvent, TransportError>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => return None,
                Err(e) => return Some(Err(TransportError::Io(e.to_string()))),
            };
            return Some(Ok(match msg {
                WsMessage::Text(text) => LinkEvent::Text(text),
                WsMessage::Binary(data) => LinkEvent::Binary(data.len()),
                WsMessage::Ping(_) => LinkEvent::Ping,
                WsMessage::Pong(_) => LinkEvent::Pong,
                WsMessage::Close(frame) => {
                    debug!("{}: close frame {frame:?}", self.url);
                    return None;
                }
                WsMessage::Frame(_) => continue,
            }));
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("{}: close failed: {e}", self.url);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[tokio::test]
    async fn test_link_exchanges_text_with_printer() {
        // Arrange
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let printer_task = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let got = ws.next().await.unwrap().unwrap();
            ws.send(WsMessage::Text("pong".into())).await.unwrap();
            got
        });
        let mut printer = PrinterDescriptor::new("P1", "Mars", addr.ip());
        printer.port = addr.port();

        // Act
        let mut link = WebSocketTransport::new().connect(&printer).await.unwrap();
        link.send_text("ping".into()).await.unwrap();
        let event = link.next_event().await.unwrap().unwrap();

        // Assert
        assert_eq!(event, LinkEvent::Text("pong".into()));
        assert_eq!(printer_task.await.unwrap(), WsMessage::Text("ping".into()));
    }

    #[tokio::test]
    async fn test_refused_connection_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let mut printer = PrinterDescriptor::new("P1", "Mars", addr.ip());
        printer.port = addr.port();

        let result = WebSocketTransport::new().connect(&printer).await;

        assert!(matches!(result, Err(TransportError::Connect(_))));
    }
}
