//! ID generation
//!
//! Message ids look like `msg-{uuidv7}`, lease holder tokens like
//! `holder-{uuidv7}`. UUIDv7 keeps generated ids roughly time-ordered.

use uuid::Uuid;

/// Generate a message id for producers that don't supply one
pub fn generate_message_id() -> String {
    format!("msg-{}", Uuid::now_v7())
}

/// Generate a lease holder token, unique per scheduler process
pub fn generate_holder_token() -> String {
    format!("holder-{}", Uuid::now_v7())
}
