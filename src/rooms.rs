use rusqlite::{params, Connection, OptionalExtension};

use crate::error::RelayError;

/// Canonical room id for a direct conversation. The two participant ids
/// are sorted lexicographically so both sides derive the same id.
pub fn dm_room_id(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("dm-{lo}-{hi}")
}

/// Canonical room id for a group conversation.
pub fn group_room_id(group_id: &str) -> String {
    format!("group-{group_id}")
}

pub fn user_exists(conn: &Connection, user_id: &str) -> Result<bool, RelayError> {
    let mut stmt = conn.prepare("SELECT 1 FROM users WHERE id = ?1")?;
    let found: Option<i64> = stmt.query_row([user_id], |row| row.get(0)).optional()?;
    Ok(found.is_some())
}

pub fn are_friends(conn: &Connection, user_id: &str, friend_id: &str) -> Result<bool, RelayError> {
    let mut stmt =
        conn.prepare("SELECT 1 FROM friendships WHERE user_id = ?1 AND friend_id = ?2")?;
    let found: Option<i64> = stmt
        .query_row(params![user_id, friend_id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

pub struct GroupRow {
    pub id: String,
    pub admin_id: String,
}

pub fn find_group(conn: &Connection, group_id: &str) -> Result<Option<GroupRow>, RelayError> {
    let mut stmt = conn.prepare(r#"SELECT id, admin_id FROM "groups" WHERE id = ?1"#)?;
    let row = stmt
        .query_row([group_id], |row| {
            Ok(GroupRow {
                id: row.get(0)?,
                admin_id: row.get(1)?,
            })
        })
        .optional()?;
    Ok(row)
}

pub fn is_group_member(
    conn: &Connection,
    group_id: &str,
    user_id: &str,
) -> Result<bool, RelayError> {
    let mut stmt =
        conn.prepare("SELECT 1 FROM group_members WHERE group_id = ?1 AND user_id = ?2")?;
    let found: Option<i64> = stmt
        .query_row(params![group_id, user_id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

/// Authorize a direct conversation with `other_user_id` and return the
/// room id. Used both at join time and re-run on every send.
pub fn authorize_dm(
    conn: &Connection,
    me: &str,
    other_user_id: &str,
) -> Result<String, RelayError> {
    if !user_exists(conn, other_user_id)? {
        return Err(RelayError::UserNotFound);
    }
    if !are_friends(conn, me, other_user_id)? {
        return Err(RelayError::NotFriends);
    }
    Ok(dm_room_id(me, other_user_id))
}

/// Authorize access to a group's room and return the room id. Used both
/// at join time and re-run on every send.
pub fn authorize_group(conn: &Connection, me: &str, group_id: &str) -> Result<String, RelayError> {
    if find_group(conn, group_id)?.is_none() {
        return Err(RelayError::GroupNotFound);
    }
    if !is_group_member(conn, group_id, me)? {
        return Err(RelayError::NotMember);
    }
    Ok(group_room_id(group_id))
}
