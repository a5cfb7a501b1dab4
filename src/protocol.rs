use serde::{Deserialize, Serialize};

use crate::model::{Message, MessageKind};

/// Client request frame: an event name, its payload and a sequence
/// number echoed back on the acknowledgment.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    pub seq: u64,
    #[serde(flatten)]
    pub event: ClientEvent,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "dm:join", rename_all = "camelCase")]
    DmJoin { other_user_id: String },
    #[serde(rename = "group:join", rename_all = "camelCase")]
    GroupJoin { group_id: String },
    #[serde(rename = "message:send")]
    MessageSend(SendPayload),
    #[serde(rename = "message:delete", rename_all = "camelCase")]
    MessageDelete { message_id: String },
    #[serde(rename = "message:edit", rename_all = "camelCase")]
    MessageEdit { message_id: String, text: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendPayload {
    pub kind: MessageKind,
    #[serde(default)]
    pub other_user_id: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

/// Per-request acknowledgment, delivered only to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub seq: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Ack {
    pub fn ok(seq: u64) -> Self {
        Self {
            seq,
            ok: true,
            room_id: None,
            message: None,
        }
    }

    pub fn ok_with_room(seq: u64, room_id: String) -> Self {
        Self {
            seq,
            ok: true,
            room_id: Some(room_id),
            message: None,
        }
    }

    pub fn fail(seq: u64, message: impl Into<String>) -> Self {
        Self {
            seq,
            ok: false,
            room_id: None,
            message: Some(message.into()),
        }
    }
}

/// Server broadcast frames. Presence goes to every connection; message
/// events only to connections joined to the room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "presence:onlineUsers", rename_all = "camelCase")]
    OnlineUsers { user_ids: Vec<String> },
    #[serde(rename = "message:new", rename_all = "camelCase")]
    MessageNew { room_id: String, message: Message },
    #[serde(rename = "message:updated", rename_all = "camelCase")]
    MessageUpdated { room_id: String, message: Message },
    #[serde(rename = "message:deleted", rename_all = "camelCase")]
    MessageDeleted { room_id: String, message_id: String },
}

impl ServerEvent {
    /// Room the event is scoped to; `None` means broadcast to everyone.
    pub fn room_id(&self) -> Option<&str> {
        match self {
            ServerEvent::OnlineUsers { .. } => None,
            ServerEvent::MessageNew { room_id, .. }
            | ServerEvent::MessageUpdated { room_id, .. }
            | ServerEvent::MessageDeleted { room_id, .. } => Some(room_id),
        }
    }
}
