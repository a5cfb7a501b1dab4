//! Client-side sync state: the presence mirror and the per-conversation
//! timeline that merges a history fetch with the live event stream.

use std::collections::HashSet;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::RelayError;
use crate::messages::MAX_IMAGE_DATA_URL_CHARS;
use crate::model::Message;
use crate::protocol::{Ack, ServerEvent};

/// Client-side watchdog for the history fetch plus join handshake; the
/// caller surfaces an error instead of hanging past this.
pub const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Raw file ceiling before data-URL encoding, which expands size ~1.37x.
pub const MAX_IMAGE_FILE_BYTES: usize = 700 * 1024;

/// Mirror of the server's presence broadcasts plus the transport state.
/// Not tied to any conversation; any view needing an online badge reads
/// from here.
#[derive(Debug, Default)]
pub struct PresenceStore {
    is_connected: bool,
    online_user_ids: HashSet<String>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport connect/disconnect. A disconnect clears the online set;
    /// the next broadcast after reconnecting repopulates it.
    pub fn set_connected(&mut self, connected: bool) {
        self.is_connected = connected;
        if !connected {
            self.online_user_ids.clear();
        }
    }

    pub fn apply(&mut self, event: &ServerEvent) {
        if let ServerEvent::OnlineUsers { user_ids } = event {
            self.online_user_ids = user_ids.iter().cloned().collect();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online_user_ids.contains(user_id)
    }

    pub fn online_user_ids(&self) -> &HashSet<String> {
        &self.online_user_ids
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewState {
    Loading,
    Ready,
    Error(String),
    Closed,
}

/// State machine for one open conversation. The view is Ready only once
/// both the history page has loaded and the room join was acknowledged;
/// only then are live events folded into the timeline.
#[derive(Debug)]
pub struct ConversationView {
    room_id: String,
    state: ViewState,
    history_loaded: bool,
    join_acked: bool,
    messages: Vec<Message>,
}

impl ConversationView {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            state: ViewState::Loading,
            history_loaded: false,
            join_acked: false,
            messages: Vec::new(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn state(&self) -> &ViewState {
        &self.state
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Seed the timeline with the historical page.
    pub fn load_history(&mut self, page: Vec<Message>) {
        if self.state != ViewState::Loading {
            return;
        }
        self.messages = page;
        self.history_loaded = true;
        self.maybe_ready();
    }

    /// Fold in the acknowledgment of the room-join request.
    pub fn join_ack(&mut self, ack: &Ack) {
        if self.state != ViewState::Loading {
            return;
        }
        if ack.ok {
            self.join_acked = true;
            self.maybe_ready();
        } else {
            let reason = ack
                .message
                .clone()
                .unwrap_or_else(|| "Could not join chat".to_string());
            self.state = ViewState::Error(reason);
        }
    }

    /// Record a failure from the caller's watchdog or history fetch.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.state == ViewState::Loading {
            self.state = ViewState::Error(reason.into());
        }
    }

    fn maybe_ready(&mut self) {
        if self.history_loaded && self.join_acked {
            self.state = ViewState::Ready;
        }
    }

    /// Apply a live broadcast. Events for other rooms are ignored, and
    /// redelivered updates/deletes are idempotent no-ops.
    pub fn apply(&mut self, event: &ServerEvent) {
        if self.state != ViewState::Ready {
            return;
        }
        if event.room_id() != Some(self.room_id.as_str()) {
            return;
        }
        match event {
            ServerEvent::MessageNew { message, .. } => {
                if !self.messages.iter().any(|m| m.id == message.id) {
                    self.messages.push(message.clone());
                }
            }
            ServerEvent::MessageUpdated { message, .. } => {
                if let Some(existing) = self.messages.iter_mut().find(|m| m.id == message.id) {
                    *existing = message.clone();
                }
            }
            ServerEvent::MessageDeleted { message_id, .. } => {
                self.messages.retain(|m| m.id != *message_id);
            }
            ServerEvent::OnlineUsers { .. } => {}
        }
    }

    /// Leaving unregisters the view; the transport-level room membership
    /// is left to expire with the connection.
    pub fn close(&mut self) {
        self.state = ViewState::Closed;
    }
}

/// Pre-flight an image file and encode it as a data URL for sending.
pub fn encode_image(bytes: &[u8], mime: &str) -> Result<String, RelayError> {
    if !mime.starts_with("image/") {
        return Err(RelayError::InvalidImage);
    }
    if bytes.len() > MAX_IMAGE_FILE_BYTES {
        return Err(RelayError::ImageTooLarge);
    }
    let encoded = format!("data:{mime};base64,{}", STANDARD.encode(bytes));
    // Belt and braces: the relay enforces the same ceiling on the
    // encoded form.
    if encoded.len() > MAX_IMAGE_DATA_URL_CHARS {
        return Err(RelayError::ImageTooLarge);
    }
    Ok(encoded)
}
