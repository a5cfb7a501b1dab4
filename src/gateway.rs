use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::auth;
use crate::config::Config;
use crate::db;
use crate::error::RelayError;
use crate::messages::{self, OutgoingMessage};
use crate::presence::Presence;
use crate::protocol::{Ack, ClientEvent, ClientFrame, ServerEvent};
use crate::rooms;

/// Shared state of the gateway process. The presence table and the
/// broadcast channel live here; per-connection room membership does not.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool<SqliteConnectionManager>,
    pub presence: Arc<Presence>,
    pub event_tx: broadcast::Sender<ServerEvent>,
    pub config: Config,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let manager = SqliteConnectionManager::file(&config.db_path);
        let pool = Pool::new(manager)?;
        pool.get()?.execute_batch(db::SCHEMA)?;
        let (event_tx, _rx) = broadcast::channel(256);
        Ok(Self {
            pool,
            presence: Arc::new(Presence::new()),
            event_tx,
            config,
        })
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Run the gateway bound to the configured address.
pub async fn run(config: Config) -> Result<()> {
    let state = AppState::new(config)?;
    let addr: SocketAddr = state.config.bind.parse()?;
    tracing::info!(%addr, "starting gateway");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    let user_id = authenticate(&state, &headers).map_err(|_| StatusCode::UNAUTHORIZED)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user_id)))
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, RelayError> {
    let conn = state.pool.get()?;
    auth::authenticate_handshake(&conn, state.config.jwt_secret.as_bytes(), headers)
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: String) {
    let conn_id = Uuid::new_v4();
    tracing::info!(user = %user_id, conn = %conn_id, "connection established");
    let (mut sender, mut receiver) = socket.split();

    state.presence.connect(&user_id, conn_id);
    let _ = state.event_tx.send(ServerEvent::OnlineUsers {
        user_ids: state.presence.snapshot(),
    });

    // Subscribe before taking the snapshot so the direct copy sent to
    // this connection is at least as fresh as the next event it sees.
    let mut events = BroadcastStream::new(state.event_tx.subscribe());
    send_frame(
        &mut sender,
        &ServerEvent::OnlineUsers {
            user_ids: state.presence.snapshot(),
        },
    )
    .await;

    // Room membership is scoped to this connection and dies with it; a
    // reconnecting client must join again.
    let mut joined: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            Some(ev) = events.next() => {
                match ev {
                    Ok(ev) => {
                        if wants(&joined, &ev) {
                            send_frame(&mut sender, &ev).await;
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        // Best-effort delivery; the next history fetch
                        // is the client's consistency backstop.
                        tracing::debug!(user = %user_id, skipped, "slow consumer dropped events");
                    }
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let ack = handle_frame(&state, &user_id, &mut joined, &text);
                        send_frame(&mut sender, &ack).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            else => break,
        }
    }

    state.presence.disconnect(&user_id, conn_id);
    let _ = state.event_tx.send(ServerEvent::OnlineUsers {
        user_ids: state.presence.snapshot(),
    });
    tracing::info!(user = %user_id, conn = %conn_id, "connection closed");
}

fn wants(joined: &HashSet<String>, ev: &ServerEvent) -> bool {
    match ev.room_id() {
        None => true,
        Some(room_id) => joined.contains(room_id),
    }
}

async fn send_frame<T: Serialize>(sender: &mut SplitSink<WebSocket, Message>, frame: &T) {
    if let Ok(text) = serde_json::to_string(frame) {
        let _ = sender.send(Message::Text(text)).await;
    }
}

fn handle_frame(
    state: &AppState,
    user_id: &str,
    joined: &mut HashSet<String>,
    raw: &str,
) -> Ack {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return Ack::fail(0, "Invalid request"),
    };
    let seq = value.get("seq").and_then(|v| v.as_u64()).unwrap_or(0);
    let frame: ClientFrame = match serde_json::from_value(value) {
        Ok(f) => f,
        Err(_) => return Ack::fail(seq, "Invalid request"),
    };
    dispatch(state, user_id, joined, frame.seq, frame.event)
}

fn dispatch(
    state: &AppState,
    user_id: &str,
    joined: &mut HashSet<String>,
    seq: u64,
    event: ClientEvent,
) -> Ack {
    match event {
        ClientEvent::DmJoin { other_user_id } => join_room(state, joined, seq, "join chat", |conn| {
            rooms::authorize_dm(conn, user_id, &other_user_id)
        }),
        ClientEvent::GroupJoin { group_id } => {
            join_room(state, joined, seq, "join group", |conn| {
                rooms::authorize_group(conn, user_id, &group_id)
            })
        }
        ClientEvent::MessageSend(payload) => {
            let res = state.pool.get().map_err(RelayError::from).and_then(|conn| {
                let out = OutgoingMessage {
                    kind: payload.kind,
                    other_user_id: payload.other_user_id.as_deref(),
                    group_id: payload.group_id.as_deref(),
                    text: payload.text.as_deref(),
                    image: payload.image.as_deref(),
                };
                messages::send_message(&conn, user_id, &out)
            });
            match res {
                Ok((room_id, message)) => {
                    let _ = state.event_tx.send(ServerEvent::MessageNew {
                        room_id: room_id.clone(),
                        message,
                    });
                    Ack::ok_with_room(seq, room_id)
                }
                Err(e) => fail(seq, "send message", e),
            }
        }
        ClientEvent::MessageDelete { message_id } => {
            let res = state
                .pool
                .get()
                .map_err(RelayError::from)
                .and_then(|conn| messages::delete_message(&conn, user_id, &message_id));
            match res {
                Ok((room_id, message_id)) => {
                    let _ = state
                        .event_tx
                        .send(ServerEvent::MessageDeleted { room_id, message_id });
                    Ack::ok(seq)
                }
                Err(e) => fail(seq, "delete message", e),
            }
        }
        ClientEvent::MessageEdit { message_id, text } => {
            let res = state
                .pool
                .get()
                .map_err(RelayError::from)
                .and_then(|conn| messages::edit_message(&conn, user_id, &message_id, &text));
            match res {
                Ok((room_id, message)) => {
                    let _ = state
                        .event_tx
                        .send(ServerEvent::MessageUpdated { room_id, message });
                    Ack::ok(seq)
                }
                Err(e) => fail(seq, "edit message", e),
            }
        }
    }
}

/// Joining an already-joined room is a no-op success.
fn join_room(
    state: &AppState,
    joined: &mut HashSet<String>,
    seq: u64,
    op: &str,
    authorize: impl FnOnce(&Connection) -> Result<String, RelayError>,
) -> Ack {
    let res = state
        .pool
        .get()
        .map_err(RelayError::from)
        .and_then(|conn| authorize(&conn));
    match res {
        Ok(room_id) => {
            joined.insert(room_id.clone());
            Ack::ok_with_room(seq, room_id)
        }
        Err(e) => fail(seq, op, e),
    }
}

fn fail(seq: u64, op: &str, err: RelayError) -> Ack {
    if err.is_internal() {
        tracing::warn!(%op, error = %err, "relay operation failed");
    }
    Ack::fail(seq, err.ack_message(op))
}
