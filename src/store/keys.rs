//! Persisted key layout

/// Counter used for message insertion order
pub const MESSAGE_SEQ: &str = "seq:messages";

/// Message record keyed by id
pub fn message(id: &str) -> String {
    format!("msg:{}", id)
}

/// Active (dispatchable) messages of an identity, scored by due time
pub fn due_index(identity_id: &str) -> String {
    format!("due:{}", identity_id)
}

/// Dead-lettered and failed messages, scored by finish time
pub fn dead_index(identity_id: &str) -> String {
    format!("dead:{}", identity_id)
}

/// Sent and cancelled messages, scored by finish time
pub fn done_index(identity_id: &str) -> String {
    format!("done:{}", identity_id)
}

/// Lease record keyed by identity
pub fn lease(identity_id: &str) -> String {
    format!("lease:{}", identity_id)
}

/// Rate-limit bucket keyed by identity
pub fn bucket(identity_id: &str) -> String {
    format!("bucket:{}", identity_id)
}

/// Identity control state (paused, online, last error)
pub fn identity(identity_id: &str) -> String {
    format!("identity:{}", identity_id)
}

/// Recent sends from an identity to one target
pub fn target(identity_id: &str, target: &str) -> String {
    format!("target:{}:{}", identity_id, target)
}
