//! `Transport` over a tokio-tungstenite socket
//!
//! Frames are handed to a per-socket writer task through an unbounded
//! channel, so `send` never awaits.

use crate::error::TransportError;
use crate::transport::{Frame, Transport};

use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// Write half of an accepted WebSocket
pub struct WsTransport {
    tx: mpsc::UnboundedSender<Message>,
    open: AtomicBool,
}

impl WsTransport {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            tx,
            open: AtomicBool::new(true),
        }
    }

    /// Record that the peer went away and release the writer task
    ///
    /// Later sends fail fast. The pool may keep this transport registered
    /// while a reconnect is pending, so the writer cannot wait for every
    /// sender to drop.
    pub fn mark_closed(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.tx.send(Message::Close(None));
        }
    }
}

impl Transport for WsTransport {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }

        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Ping(payload) => Message::Ping(payload),
            Frame::Pong(payload) => Message::Pong(payload),
        };

        self.tx.send(message).map_err(|_| {
            self.mark_closed();
            TransportError::Closed
        })
    }

    fn close(&self, code: u16, reason: &str) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Owned(reason.to_string()),
        };
        // Writer already gone means the socket is down anyway
        let _ = self.tx.send(Message::Close(Some(frame)));
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }
}

/// Drain queued frames into the socket until a close frame goes out
pub async fn write_loop(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        let closing = message.is_close();
        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "WebSocket write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}
