//! WebSocket transport for hub subscribers.
//!
//! Each accepted socket runs one read pump and one write pump. The write
//! pump drains the subscriber's hub queue and owns transport liveness:
//! a protocol ping every 30 s, with a deadline armed at each send —
//! teardown if the matching pong has not landed within 10 s. The read pump
//! parses client commands and hands them to the hub; anything unparsable
//! is answered with an `invalid_format` error.

use crate::hub::Hub;
use crate::models::{ClientMessage, ServerMessage};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::header::USER_AGENT;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::http::AppState;

/// Largest inbound message a client may send.
const MAX_INBOUND_MESSAGE_SIZE: usize = 512 * 1024;
const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_DEADLINE: Duration = Duration::from_secs(10);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    info!("new realtime connection from {addr} ({user_agent})");

    ws.max_message_size(MAX_INBOUND_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state.hub.clone(), addr, user_agent))
}

async fn handle_socket(socket: WebSocket, hub: Hub, addr: SocketAddr, user_agent: String) {
    let (mut sink, mut stream) = socket.split();
    let (id, mut outbound) = hub.admit(addr.to_string(), user_agent);
    let last_pong = Arc::new(Mutex::new(Instant::now()));

    let write_pong = last_pong.clone();
    let mut write_pump = tokio::spawn(async move {
        let mut ping_ticker =
            tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
        // set when a ping goes out, cleared once the matching pong lands
        let mut ping_sent: Option<Instant> = None;
        loop {
            let pong_due = ping_sent.map(|sent| sent + PONG_DEADLINE);
            tokio::select! {
                msg = outbound.recv() => match msg {
                    Some(msg) => {
                        let json = match serde_json::to_string(&msg) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!("dropping unserializable message for {id}: {e}");
                                continue;
                            }
                        };
                        if sink.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    // hub closed the queue: eviction or shutdown
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                },
                _ = ping_ticker.tick() => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    ping_sent = Some(Instant::now());
                }
                _ = async {
                    match pong_due {
                        Some(due) => tokio::time::sleep_until(due).await,
                        None => std::future::pending().await,
                    }
                } => {
                    let answered = ping_sent.is_some_and(|sent| *write_pong.lock() >= sent);
                    if !answered {
                        debug!("subscriber {id} missed its pong deadline");
                        break;
                    }
                    ping_sent = None;
                }
            }
        }
    });

    loop {
        tokio::select! {
            // the write pump ending means a missed pong deadline, a write
            // failure or a closed hub queue: abort the connection
            _ = &mut write_pump => break,
            msg = stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(cmd) => hub.dispatch(id, cmd).await,
                            Err(e) => {
                                debug!("invalid message from {id}: {e}");
                                hub.send_to(
                                    id,
                                    ServerMessage::error("invalid_format", "unrecognized message"),
                                );
                            }
                        }
                    }
                    Message::Pong(_) => *last_pong.lock() = Instant::now(),
                    Message::Close(_) => break,
                    // axum answers Ping frames itself; binary payloads are
                    // not part of the protocol
                    _ => {}
                }
            }
        }
    }

    hub.evict(id);
    write_pump.abort();
    debug!("realtime connection from {addr} closed");
}
