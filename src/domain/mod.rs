//! Domain types for dispatchd
//!
//! Core records: Message, IdentityConfig/IdentityState, Lease,
//! RateLimitBucket, TargetActivity. All are serialized as JSON into the
//! state store.

mod id;
mod identity;
mod lease;
mod message;
mod priority;

pub use id::{generate_holder_token, generate_message_id};
pub use identity::{IdentityConfig, IdentityState};
pub use lease::{Lease, RateLimitBucket, TARGET_WINDOW_MS, TargetActivity};
pub use message::{Message, MessageStatus, NewMessage, Recurrence};
pub use priority::MessagePriority;
