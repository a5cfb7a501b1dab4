use serde::{Deserialize, Serialize};

/// Whether a message belongs to a direct conversation or a group room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Dm,
    Group,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Dm => "dm",
            MessageKind::Group => "group",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "dm" => Some(MessageKind::Dm),
            "group" => Some(MessageKind::Group),
            _ => None,
        }
    }
}

/// Sender profile fields carried on broadcast messages. An embedded
/// data-URL avatar is stripped before broadcast so large payloads are
/// not resent with every message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderProfile {
    pub id: String,
    pub full_name: String,
    pub profile_pic: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub kind: MessageKind,
    pub room_id: String,
    pub sender: SenderProfile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub image: String,
    pub created_at: i64,
}
