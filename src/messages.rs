use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::RelayError;
use crate::model::{Message, MessageKind, SenderProfile};
use crate::rooms;

/// Ceiling for edited/sent text, in characters.
pub const MAX_TEXT_CHARS: usize = 2000;
/// Ceiling for an embedded image, in data-URL characters (roughly 1.37x
/// the raw byte size).
pub const MAX_IMAGE_DATA_URL_CHARS: usize = 1_000_000;

const IMAGE_DATA_URL_PREFIX: &str = "data:image/";

/// A message as submitted by a client, before validation.
pub struct OutgoingMessage<'a> {
    pub kind: MessageKind,
    pub other_user_id: Option<&'a str>,
    pub group_id: Option<&'a str>,
    pub text: Option<&'a str>,
    pub image: Option<&'a str>,
}

/// Validate, authorize and persist a message, returning the room id and
/// the populated message ready for broadcast.
///
/// Authorization is re-run here on every send via the same functions the
/// join path uses; a prior successful join is not assumed. The check and
/// the insert are not one transaction, so membership revoked in between
/// can still let one message through (accepted for chat delivery).
pub fn send_message(
    conn: &Connection,
    sender_id: &str,
    out: &OutgoingMessage,
) -> Result<(String, Message), RelayError> {
    let text = out.text.unwrap_or("").trim().to_string();
    let image = out.image.unwrap_or("").to_string();

    if text.is_empty() && image.is_empty() {
        return Err(RelayError::EmptyMessage);
    }
    if !image.is_empty() {
        if !image.starts_with(IMAGE_DATA_URL_PREFIX) {
            return Err(RelayError::InvalidImage);
        }
        if image.len() > MAX_IMAGE_DATA_URL_CHARS {
            return Err(RelayError::ImageTooLarge);
        }
    }
    let (room_id, recipient_id, group_id) = match out.kind {
        MessageKind::Dm => {
            let other = out.other_user_id.ok_or(RelayError::UserNotFound)?;
            let room_id = rooms::authorize_dm(conn, sender_id, other)?;
            (room_id, Some(other.to_string()), None)
        }
        MessageKind::Group => {
            let gid = out.group_id.ok_or(RelayError::GroupNotFound)?;
            let room_id = rooms::authorize_group(conn, sender_id, gid)?;
            (room_id, None, Some(gid.to_string()))
        }
    };

    let id = Uuid::new_v4().to_string();
    let created_at = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT INTO messages (id, kind, room_id, sender_id, recipient_id, group_id, text, image, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            id,
            out.kind.as_str(),
            room_id,
            sender_id,
            recipient_id,
            group_id,
            text,
            image,
            created_at
        ],
    )?;

    let sender = load_sender(conn, sender_id)?;
    let message = Message {
        id,
        kind: out.kind,
        room_id: room_id.clone(),
        sender,
        recipient_id,
        group_id,
        text,
        image,
        created_at,
    };
    Ok((room_id, message))
}

/// Replace a message's text. Only the original sender may edit; for
/// group messages the sender must still be a member or the admin. The
/// image is never touched by an edit.
pub fn edit_message(
    conn: &Connection,
    requester: &str,
    message_id: &str,
    text: &str,
) -> Result<(String, Message), RelayError> {
    let id = parse_message_id(message_id)?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(RelayError::EmptyMessage);
    }
    if trimmed.chars().count() > MAX_TEXT_CHARS {
        return Err(RelayError::TextTooLong);
    }

    let stored = fetch_message(conn, &id)?.ok_or(RelayError::MessageNotFound)?;
    if stored.sender_id != requester {
        return Err(RelayError::NotAllowed);
    }
    if stored.kind == MessageKind::Group {
        let gid = stored.group_id.as_deref().ok_or(RelayError::MessageNotFound)?;
        let group = rooms::find_group(conn, gid)?.ok_or(RelayError::NotAllowed)?;
        let still_in_group =
            rooms::is_group_member(conn, gid, requester)? || group.admin_id == requester;
        if !still_in_group {
            return Err(RelayError::NotAllowed);
        }
    }

    conn.execute(
        "UPDATE messages SET text = ?2 WHERE id = ?1",
        params![id, trimmed],
    )?;

    let sender = load_sender(conn, &stored.sender_id)?;
    let message = Message {
        id,
        kind: stored.kind,
        room_id: stored.room_id.clone(),
        sender,
        recipient_id: stored.recipient_id,
        group_id: stored.group_id,
        text: trimmed.to_string(),
        image: stored.image,
        created_at: stored.created_at,
    };
    Ok((stored.room_id, message))
}

/// Remove a message. The sender may always delete their own message;
/// the group admin may additionally delete any message in their group.
pub fn delete_message(
    conn: &Connection,
    requester: &str,
    message_id: &str,
) -> Result<(String, String), RelayError> {
    let id = parse_message_id(message_id)?;
    let stored = fetch_message(conn, &id)?.ok_or(RelayError::MessageNotFound)?;

    if stored.sender_id != requester {
        let is_admin = match (stored.kind, stored.group_id.as_deref()) {
            (MessageKind::Group, Some(gid)) => rooms::find_group(conn, gid)?
                .map(|g| g.admin_id == requester)
                .unwrap_or(false),
            _ => false,
        };
        if !is_admin {
            return Err(RelayError::NotAllowed);
        }
    }

    conn.execute("DELETE FROM messages WHERE id = ?1", [&id])?;
    Ok((stored.room_id, id))
}

/// Ascending history page for a room, used to seed a conversation view.
///
/// Timestamps are second-granular, so ties are broken by rowid to keep
/// messages written within the same second in insertion order.
pub fn list_room_messages(
    conn: &Connection,
    room_id: &str,
    limit: usize,
) -> Result<Vec<Message>, RelayError> {
    let limit = limit.min(200);
    let mut stmt = conn.prepare(
        "SELECT m.id, m.kind, m.room_id, m.sender_id, m.recipient_id, m.group_id, m.text, m.image, m.created_at, \
                u.full_name, u.profile_pic \
         FROM messages m JOIN users u ON u.id = m.sender_id \
         WHERE m.room_id = ?1 ORDER BY m.created_at ASC, m.rowid ASC LIMIT ?2",
    )?;
    let iter = stmt.query_map(params![room_id, limit as i64], |row| {
        Ok(Message {
            id: row.get(0)?,
            kind: MessageKind::from_db(&row.get::<_, String>(1)?).unwrap_or(MessageKind::Dm),
            room_id: row.get(2)?,
            sender: SenderProfile {
                id: row.get(3)?,
                full_name: row.get(9)?,
                profile_pic: strip_embedded_avatar(row.get(10)?),
            },
            recipient_id: row.get(4)?,
            group_id: row.get(5)?,
            text: row.get(6)?,
            image: row.get(7)?,
            created_at: row.get(8)?,
        })
    })?;
    let mut out = Vec::new();
    for m in iter {
        out.push(m?);
    }
    Ok(out)
}

struct StoredMessage {
    kind: MessageKind,
    room_id: String,
    sender_id: String,
    recipient_id: Option<String>,
    group_id: Option<String>,
    image: String,
    created_at: i64,
}

fn fetch_message(conn: &Connection, id: &str) -> Result<Option<StoredMessage>, RelayError> {
    let mut stmt = conn.prepare(
        "SELECT kind, room_id, sender_id, recipient_id, group_id, image, created_at \
         FROM messages WHERE id = ?1",
    )?;
    let row = stmt
        .query_row([id], |row| {
            Ok(StoredMessage {
                kind: MessageKind::from_db(&row.get::<_, String>(0)?)
                    .unwrap_or(MessageKind::Dm),
                room_id: row.get(1)?,
                sender_id: row.get(2)?,
                recipient_id: row.get(3)?,
                group_id: row.get(4)?,
                image: row.get(5)?,
                created_at: row.get(6)?,
            })
        })
        .optional()?;
    Ok(row)
}

fn load_sender(conn: &Connection, user_id: &str) -> Result<SenderProfile, RelayError> {
    let mut stmt = conn.prepare("SELECT full_name, profile_pic FROM users WHERE id = ?1")?;
    let profile = stmt
        .query_row([user_id], |row| {
            Ok(SenderProfile {
                id: user_id.to_string(),
                full_name: row.get(0)?,
                profile_pic: strip_embedded_avatar(row.get(1)?),
            })
        })
        .optional()?;
    profile.ok_or(RelayError::UserNotFound)
}

/// Data-URL avatars can run to hundreds of kilobytes; broadcasts carry
/// an empty string instead and clients fall back to a placeholder.
fn strip_embedded_avatar(profile_pic: String) -> String {
    if profile_pic.starts_with(IMAGE_DATA_URL_PREFIX) {
        String::new()
    } else {
        profile_pic
    }
}

fn parse_message_id(raw: &str) -> Result<String, RelayError> {
    Uuid::parse_str(raw)
        .map(|u| u.to_string())
        .map_err(|_| RelayError::InvalidMessageId)
}
