use std::net::{SocketAddr, TcpListener};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use lingolink::auth;
use lingolink::config::Config;
use lingolink::gateway::{build_router, AppState};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async, tungstenite::client::IntoClientRequest, tungstenite::Message as WsMessage,
    MaybeTlsStream, WebSocketStream,
};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &str = "integration-secret";

async fn spawn_server() -> (SocketAddr, JoinHandle<()>, AppState, tempfile::TempDir) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        bind: addr.to_string(),
        db_path: tmp.path().join("chat.db"),
        jwt_secret: SECRET.into(),
        logging_enabled: false,
    };
    let state = AppState::new(config).unwrap();
    seed(&state);
    let app = build_router(state.clone());
    let server = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    (addr, server, state, tmp)
}

fn seed(state: &AppState) {
    let conn = state.pool.get().unwrap();
    conn.execute_batch(
        r#"
        INSERT INTO users (id, full_name, profile_pic) VALUES
          ('a1', 'Alice', 'data:image/png;base64,AAAA'),
          ('b2', 'Bob', ''),
          ('c3', 'Carol', ''),
          ('d4', 'Dave', '');
        INSERT INTO friendships (user_id, friend_id) VALUES ('a1', 'b2'), ('b2', 'a1');
        INSERT INTO "groups" (id, name, admin_id) VALUES ('g1', 'Study Group', 'a1');
        INSERT INTO group_members (group_id, user_id) VALUES ('g1', 'a1'), ('g1', 'b2'), ('g1', 'd4');
        "#,
    )
    .unwrap();
}

async fn connect(addr: SocketAddr, user_id: &str) -> Ws {
    let token = auth::issue_jwt(SECRET.as_bytes(), user_id, time::Duration::hours(1)).unwrap();
    let mut req = format!("ws://{addr}/ws").into_client_request().unwrap();
    req.headers_mut()
        .insert("Cookie", format!("jwt={token}").parse().unwrap());
    let (ws, _) = connect_async(req).await.unwrap();
    ws
}

async fn next_json(ws: &mut Ws) -> Value {
    loop {
        match ws.next().await.expect("socket closed").expect("socket error") {
            WsMessage::Text(txt) => return serde_json::from_str(&txt).unwrap(),
            _ => continue,
        }
    }
}

async fn wait_for_event(ws: &mut Ws, event: &str) -> Value {
    loop {
        let v = next_json(ws).await;
        if v["event"] == event {
            return v;
        }
    }
}

/// Send a request frame and read frames until its acknowledgment comes
/// back; broadcasts interleaved before the ack are discarded.
async fn request(ws: &mut Ws, seq: u64, event: &str, data: Value) -> Value {
    ws.send(WsMessage::Text(
        json!({"seq": seq, "event": event, "data": data}).to_string(),
    ))
    .await
    .unwrap();
    loop {
        let v = next_json(ws).await;
        if v["seq"] == seq {
            return v;
        }
    }
}

async fn assert_no_event(ws: &mut Ws, event: &str, dur: Duration) {
    let deadline = tokio::time::Instant::now() + dur;
    loop {
        let Some(remaining) = deadline.checked_duration_since(tokio::time::Instant::now()) else {
            return;
        };
        match tokio::time::timeout(remaining, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(WsMessage::Text(txt)))) => {
                let v: Value = serde_json::from_str(&txt).unwrap();
                assert_ne!(v["event"], event, "unexpected {event} delivery: {v}");
            }
            Ok(_) => return,
        }
    }
}

fn message_count(state: &AppState) -> i64 {
    state
        .pool
        .get()
        .unwrap()
        .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
        .unwrap()
}

#[tokio::test]
async fn rejects_unauthenticated_handshake() {
    let (addr, server, _state, _tmp) = spawn_server().await;

    // no credential at all
    let req = format!("ws://{addr}/ws").into_client_request().unwrap();
    assert!(connect_async(req).await.is_err());

    // token signed with the wrong secret
    let bad = auth::issue_jwt(b"other-secret", "a1", time::Duration::hours(1)).unwrap();
    let mut req = format!("ws://{addr}/ws").into_client_request().unwrap();
    req.headers_mut()
        .insert("Cookie", format!("jwt={bad}").parse().unwrap());
    assert!(connect_async(req).await.is_err());

    // token for a user the store does not know
    let ghost = auth::issue_jwt(SECRET.as_bytes(), "ghost", time::Duration::hours(1)).unwrap();
    let mut req = format!("ws://{addr}/ws").into_client_request().unwrap();
    req.headers_mut()
        .insert("Cookie", format!("jwt={ghost}").parse().unwrap());
    assert!(connect_async(req).await.is_err());

    server.abort();
}

#[tokio::test]
async fn presence_tracks_connections_per_user() {
    let (addr, server, _state, _tmp) = spawn_server().await;

    let mut bob = connect(addr, "b2").await;
    let snap = wait_for_event(&mut bob, "presence:onlineUsers").await;
    assert_eq!(snap["data"]["userIds"], json!(["b2"]));

    let mut alice_1 = connect(addr, "a1").await;
    let ev = wait_for_event(&mut bob, "presence:onlineUsers").await;
    assert_eq!(ev["data"]["userIds"], json!(["a1", "b2"]));

    // a second connection from the same user stays a single entry
    let mut alice_2 = connect(addr, "a1").await;
    let ev = wait_for_event(&mut bob, "presence:onlineUsers").await;
    assert_eq!(ev["data"]["userIds"], json!(["a1", "b2"]));

    alice_1.close(None).await.unwrap();
    let ev = wait_for_event(&mut bob, "presence:onlineUsers").await;
    assert_eq!(ev["data"]["userIds"], json!(["a1", "b2"]));

    alice_2.close(None).await.unwrap();
    let ev = wait_for_event(&mut bob, "presence:onlineUsers").await;
    assert_eq!(ev["data"]["userIds"], json!(["b2"]));

    server.abort();
}

#[tokio::test]
async fn dm_send_edit_delete_end_to_end() {
    let (addr, server, _state, _tmp) = spawn_server().await;
    let mut alice = connect(addr, "a1").await;
    let mut bob = connect(addr, "b2").await;

    let ack = request(&mut alice, 1, "dm:join", json!({"otherUserId": "b2"})).await;
    assert_eq!(ack["ok"], true);
    assert_eq!(ack["roomId"], "dm-a1-b2");
    let ack = request(&mut bob, 1, "dm:join", json!({"otherUserId": "a1"})).await;
    assert_eq!(ack["roomId"], "dm-a1-b2");

    let ack = request(
        &mut alice,
        2,
        "message:send",
        json!({"kind": "dm", "otherUserId": "b2", "text": "hi"}),
    )
    .await;
    assert_eq!(ack["ok"], true);
    assert_eq!(ack["roomId"], "dm-a1-b2");

    let ev = wait_for_event(&mut bob, "message:new").await;
    assert_eq!(ev["data"]["roomId"], "dm-a1-b2");
    let message = &ev["data"]["message"];
    assert_eq!(message["text"], "hi");
    assert_eq!(message["kind"], "dm");
    assert_eq!(message["sender"]["fullName"], "Alice");
    // Alice's data-URL avatar is stripped from broadcasts
    assert_eq!(message["sender"]["profilePic"], "");
    let message_id = message["id"].as_str().unwrap().to_string();

    let ack = request(
        &mut alice,
        3,
        "message:edit",
        json!({"messageId": message_id, "text": "hi there"}),
    )
    .await;
    assert_eq!(ack["ok"], true);
    let ev = wait_for_event(&mut bob, "message:updated").await;
    assert_eq!(ev["data"]["message"]["id"], message_id.as_str());
    assert_eq!(ev["data"]["message"]["text"], "hi there");

    let ack = request(&mut alice, 4, "message:delete", json!({"messageId": message_id})).await;
    assert_eq!(ack["ok"], true);
    let ev = wait_for_event(&mut bob, "message:deleted").await;
    assert_eq!(ev["data"]["roomId"], "dm-a1-b2");
    assert_eq!(ev["data"]["messageId"], message_id.as_str());

    server.abort();
}

#[tokio::test]
async fn invalid_sends_are_acked_without_side_effects() {
    let (addr, server, state, _tmp) = spawn_server().await;
    let mut alice = connect(addr, "a1").await;

    let ack = request(
        &mut alice,
        1,
        "message:send",
        json!({"kind": "dm", "otherUserId": "b2"}),
    )
    .await;
    assert_eq!(ack["ok"], false);
    assert_eq!(ack["message"], "Message is empty");

    let ack = request(
        &mut alice,
        2,
        "message:send",
        json!({"kind": "dm", "otherUserId": "c3", "text": "hey"}),
    )
    .await;
    assert_eq!(ack["message"], "You can only chat with friends");

    let ack = request(
        &mut alice,
        3,
        "message:send",
        json!({"kind": "dm", "otherUserId": "zz", "text": "hey"}),
    )
    .await;
    assert_eq!(ack["message"], "User not found");

    let ack = request(
        &mut alice,
        4,
        "message:send",
        json!({"kind": "dm", "otherUserId": "b2", "image": "https://not-a-data-url.png"}),
    )
    .await;
    assert_eq!(ack["message"], "Invalid image format");

    let oversized = format!("data:image/png;base64,{}", "A".repeat(1_000_001));
    let ack = request(
        &mut alice,
        5,
        "message:send",
        json!({"kind": "dm", "otherUserId": "b2", "image": oversized}),
    )
    .await;
    assert_eq!(ack["message"], "Image is too large");

    assert_eq!(message_count(&state), 0);
    server.abort();
}

#[tokio::test]
async fn group_membership_is_enforced_at_join_and_send() {
    let (addr, server, _state, _tmp) = spawn_server().await;
    let mut carol = connect(addr, "c3").await;

    let ack = request(&mut carol, 1, "group:join", json!({"groupId": "g1"})).await;
    assert_eq!(ack["ok"], false);
    assert_eq!(ack["message"], "You are not a member of this group");

    let ack = request(&mut carol, 2, "group:join", json!({"groupId": "nope"})).await;
    assert_eq!(ack["message"], "Group not found");

    let ack = request(
        &mut carol,
        3,
        "message:send",
        json!({"kind": "group", "groupId": "g1", "text": "let me in"}),
    )
    .await;
    assert_eq!(ack["message"], "You are not a member of this group");

    let mut alice = connect(addr, "a1").await;
    let mut bob = connect(addr, "b2").await;
    let ack = request(&mut alice, 1, "group:join", json!({"groupId": "g1"})).await;
    assert_eq!(ack["roomId"], "group-g1");
    let ack = request(&mut bob, 1, "group:join", json!({"groupId": "g1"})).await;
    assert_eq!(ack["ok"], true);

    let ack = request(
        &mut alice,
        2,
        "message:send",
        json!({"kind": "group", "groupId": "g1", "text": "hello group"}),
    )
    .await;
    assert_eq!(ack["ok"], true);

    let ev = wait_for_event(&mut bob, "message:new").await;
    assert_eq!(ev["data"]["message"]["text"], "hello group");
    // Carol never joined the room, so the broadcast must not reach her.
    assert_no_event(&mut carol, "message:new", Duration::from_millis(400)).await;

    server.abort();
}

#[tokio::test]
async fn group_admin_may_delete_others_messages() {
    let (addr, server, _state, _tmp) = spawn_server().await;
    let mut alice = connect(addr, "a1").await;
    let mut bob = connect(addr, "b2").await;
    let mut dave = connect(addr, "d4").await;
    for (ws, seq) in [(&mut alice, 1), (&mut bob, 1), (&mut dave, 1)] {
        let ack = request(ws, seq, "group:join", json!({"groupId": "g1"})).await;
        assert_eq!(ack["ok"], true);
    }

    let ack = request(
        &mut bob,
        2,
        "message:send",
        json!({"kind": "group", "groupId": "g1", "text": "from bob"}),
    )
    .await;
    assert_eq!(ack["ok"], true);
    let ev = wait_for_event(&mut alice, "message:new").await;
    let message_id = ev["data"]["message"]["id"].as_str().unwrap().to_string();

    // a plain member who is not the sender cannot delete
    let ack = request(&mut dave, 2, "message:delete", json!({"messageId": message_id})).await;
    assert_eq!(ack["ok"], false);
    assert_eq!(ack["message"], "Not allowed");

    // the admin can
    let ack = request(&mut alice, 2, "message:delete", json!({"messageId": message_id})).await;
    assert_eq!(ack["ok"], true);
    let ev = wait_for_event(&mut bob, "message:deleted").await;
    assert_eq!(ev["data"]["roomId"], "group-g1");
    assert_eq!(ev["data"]["messageId"], message_id.as_str());

    server.abort();
}

#[tokio::test]
async fn edit_rules_and_id_validation() {
    let (addr, server, state, _tmp) = spawn_server().await;
    let mut alice = connect(addr, "a1").await;
    let mut bob = connect(addr, "b2").await;
    request(&mut alice, 1, "dm:join", json!({"otherUserId": "b2"})).await;
    request(&mut bob, 1, "dm:join", json!({"otherUserId": "a1"})).await;

    let ack = request(
        &mut alice,
        2,
        "message:send",
        json!({"kind": "dm", "otherUserId": "b2", "text": "orig"}),
    )
    .await;
    assert_eq!(ack["ok"], true);
    let ev = wait_for_event(&mut bob, "message:new").await;
    let message_id = ev["data"]["message"]["id"].as_str().unwrap().to_string();

    // only the sender may edit
    let ack = request(
        &mut bob,
        2,
        "message:edit",
        json!({"messageId": message_id, "text": "hijack"}),
    )
    .await;
    assert_eq!(ack["message"], "Not allowed");

    let long = "x".repeat(2001);
    let ack = request(
        &mut alice,
        3,
        "message:edit",
        json!({"messageId": message_id, "text": long}),
    )
    .await;
    assert_eq!(ack["message"], "Message is too long");

    // the stored text is untouched by rejected edits
    let stored: String = state
        .pool
        .get()
        .unwrap()
        .query_row(
            "SELECT text FROM messages WHERE id = ?1",
            [&message_id],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(stored, "orig");

    let ack = request(
        &mut alice,
        4,
        "message:edit",
        json!({"messageId": "not-a-uuid", "text": "x"}),
    )
    .await;
    assert_eq!(ack["message"], "Invalid message id");

    let ack = request(
        &mut alice,
        5,
        "message:delete",
        json!({"messageId": "00000000-0000-4000-8000-000000000000"}),
    )
    .await;
    assert_eq!(ack["message"], "Message not found");

    server.abort();
}

#[tokio::test]
async fn double_join_does_not_duplicate_delivery() {
    let (addr, server, _state, _tmp) = spawn_server().await;
    let mut alice = connect(addr, "a1").await;
    let mut bob = connect(addr, "b2").await;

    let ack = request(&mut alice, 1, "dm:join", json!({"otherUserId": "b2"})).await;
    assert_eq!(ack["ok"], true);
    let ack = request(&mut alice, 2, "dm:join", json!({"otherUserId": "b2"})).await;
    assert_eq!(ack["ok"], true);

    let ack = request(
        &mut bob,
        1,
        "message:send",
        json!({"kind": "dm", "otherUserId": "a1", "text": "ping"}),
    )
    .await;
    assert_eq!(ack["ok"], true);

    let ev = wait_for_event(&mut alice, "message:new").await;
    assert_eq!(ev["data"]["message"]["text"], "ping");
    assert_no_event(&mut alice, "message:new", Duration::from_millis(400)).await;

    server.abort();
}
