//! WebSocket accept layer
//!
//! Accepts clients with tokio-tungstenite and registers each socket with
//! the pool. The handshake query supplies the client id (`client_id=`) and
//! tags (`tag.<name>=<value>`); without a client id the peer address is
//! used.

mod transport;

pub use transport::{write_loop, WsTransport};

use crate::error::PoolError;
use crate::pool::ConnectionPool;
use crate::shard::Tags;
use crate::transport::{close_code, Transport, TransportEvent};

use futures_util::StreamExt;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// No status code present in the peer's close frame
const NO_STATUS: u16 = 1005;

/// Accept sockets until the pool shuts down
pub async fn serve(listener: TcpListener, pool: ConnectionPool) {
    let shutdown = pool.closed();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_socket(stream, peer, pool.clone()));
                }
                Err(e) => warn!(error = %e, "Failed to accept TCP connection"),
            },
            _ = &mut shutdown => {
                debug!("WebSocket listener stopping");
                break;
            }
        }
    }
}

/// Client id and tags from the handshake query string
pub fn parse_handshake_query(query: Option<&str>, peer: SocketAddr) -> (String, Tags) {
    let mut client_id = None;
    let mut tags = Tags::new();

    for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key == "client_id" && !value.is_empty() {
            client_id = Some(value.to_string());
        } else if let Some(tag) = key.strip_prefix("tag.") {
            if !tag.is_empty() {
                tags.insert(tag.to_string(), value.to_string());
            }
        }
    }

    (client_id.unwrap_or_else(|| peer.to_string()), tags)
}

async fn handle_socket(stream: TcpStream, peer: SocketAddr, pool: ConnectionPool) {
    let query = Arc::new(Mutex::new(None::<String>));
    let captured = Arc::clone(&query);

    let socket = match tokio_tungstenite::accept_hdr_async(
        stream,
        move |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
            *captured.lock() = req.uri().query().map(str::to_string);
            Ok(response)
        },
    )
    .await
    {
        Ok(socket) => socket,
        Err(e) => {
            debug!(%peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let query = query.lock().take();
    let (client_id, tags) = parse_handshake_query(query.as_deref(), peer);

    let (sink, mut source) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(sink, rx));
    let transport = Arc::new(WsTransport::new(tx));

    let id = match pool.add_connection(transport.clone(), client_id.clone(), tags) {
        Ok(id) => id,
        Err(e) => {
            let code = match e {
                PoolError::PoolFull { .. } => close_code::TRY_AGAIN_LATER,
                _ => close_code::GOING_AWAY,
            };
            info!(%peer, client_id, error = %e, code, "Rejecting WebSocket client");
            transport.close(code, &e.to_string());
            let _ = writer.await;
            return;
        }
    };

    debug!(connection_id = %id, %peer, client_id, "WebSocket client registered");

    let shutdown = pool.closed();
    tokio::pin!(shutdown);

    let (code, reason) = loop {
        let next = tokio::select! {
            next = source.next() => next,
            _ = &mut shutdown => break (close_code::GOING_AWAY, "Server shutdown".to_string()),
        };

        let event = match next {
            Some(Ok(Message::Text(text))) => TransportEvent::Message(text),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => TransportEvent::Message(text),
                Err(_) => TransportEvent::Error("binary frame is not valid UTF-8".to_string()),
            },
            Some(Ok(Message::Ping(payload))) => TransportEvent::Ping(payload),
            Some(Ok(Message::Pong(payload))) => TransportEvent::Pong(payload),
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|f| (u16::from(f.code), f.reason.into_owned()))
                    .unwrap_or((NO_STATUS, String::new()));
            }
            Some(Ok(Message::Frame(_))) => continue,
            Some(Err(e)) => {
                pool.handle_transport_event(&id, TransportEvent::Error(e.to_string()));
                break (close_code::ABNORMAL, e.to_string());
            }
            None => break (close_code::ABNORMAL, "stream ended".to_string()),
        };

        pool.handle_transport_event(&id, event);
    };

    transport.mark_closed();
    pool.handle_transport_event(&id, TransportEvent::Close { code, reason });
    let _ = writer.await;

    debug!(connection_id = %id, %peer, code, "WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::events::PoolEvent;
    use crate::shard::ConnectionState;
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    fn peer() -> SocketAddr {
        "10.0.0.7:5123".parse().unwrap()
    }

    #[test]
    fn client_id_from_query() {
        let (client_id, tags) = parse_handshake_query(Some("client_id=abc&tag.room=lobby"), peer());
        assert_eq!(client_id, "abc");
        assert_eq!(tags.get("room").map(String::as_str), Some("lobby"));
    }

    #[test]
    fn falls_back_to_peer_address() {
        let (client_id, tags) = parse_handshake_query(None, peer());
        assert_eq!(client_id, "10.0.0.7:5123");
        assert!(tags.is_empty());

        let (client_id, _) = parse_handshake_query(Some("client_id="), peer());
        assert_eq!(client_id, "10.0.0.7:5123");
    }

    #[test]
    fn ignores_unrelated_parameters() {
        let (_, tags) = parse_handshake_query(Some("foo=bar&tag.=x&tag.tier"), peer());
        assert_eq!(tags.len(), 1);
        assert_eq!(tags.get("tier").map(String::as_str), Some(""));
    }

    async fn accept_one(pool: &ConnectionPool) -> (SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let pool = pool.clone();
        let task = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            handle_socket(stream, peer, pool).await;
        });
        (addr, task)
    }

    async fn wait_for_registration(pool: &ConnectionPool) {
        timeout(Duration::from_secs(5), async {
            while pool.connection_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn peer_close_ends_socket_task() {
        let pool = ConnectionPool::new(PoolConfig {
            reconnect: false,
            ..PoolConfig::default()
        })
        .unwrap();
        let (addr, task) = accept_one(&pool).await;

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/?client_id=c1"))
            .await
            .unwrap();
        wait_for_registration(&pool).await;

        client.close(None).await.unwrap();
        drop(client);

        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn socket_task_ends_while_reconnect_is_pending() {
        let pool = ConnectionPool::new(PoolConfig::default()).unwrap();
        let mut events = pool.subscribe();
        let (addr, task) = accept_one(&pool).await;

        let client = tokio_tungstenite::connect_async(format!("ws://{addr}/?client_id=c2"))
            .await
            .unwrap()
            .0;
        wait_for_registration(&pool).await;
        let id = match events.try_recv().unwrap() {
            PoolEvent::Connection { connection_id, .. } => connection_id,
            other => panic!("unexpected event {other:?}"),
        };
        drop(client);

        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        let meta = pool.get_connection(&id).unwrap();
        assert_eq!(meta.state, ConnectionState::ReconnectPending);
        pool.shutdown();
    }
}
