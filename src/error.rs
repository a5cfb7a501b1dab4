use thiserror::Error;

/// Failure taxonomy for relay operations. Display strings are the
/// user-facing acknowledgment messages; store failures are wrapped and
/// replaced with a generic per-operation message at the gateway edge.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("User not found")]
    UserNotFound,
    #[error("Group not found")]
    GroupNotFound,
    #[error("Message not found")]
    MessageNotFound,
    #[error("You can only chat with friends")]
    NotFriends,
    #[error("You are not a member of this group")]
    NotMember,
    #[error("Not allowed")]
    NotAllowed,
    #[error("Message is empty")]
    EmptyMessage,
    #[error("Invalid image format")]
    InvalidImage,
    #[error("Image is too large")]
    ImageTooLarge,
    #[error("Message is too long")]
    TextTooLong,
    #[error("Invalid message id")]
    InvalidMessageId,
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
    #[error(transparent)]
    Pool(#[from] r2d2::Error),
}

impl RelayError {
    /// Unexpected store failures must not leak to clients.
    pub fn is_internal(&self) -> bool {
        matches!(self, RelayError::Db(_) | RelayError::Pool(_))
    }

    /// Message placed in a failed acknowledgment for the given operation.
    pub fn ack_message(&self, op: &str) -> String {
        if self.is_internal() {
            format!("Failed to {op}")
        } else {
            self.to_string()
        }
    }
}
