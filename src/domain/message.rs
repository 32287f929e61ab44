//! Message domain type
//!
//! A Message is one unit of outbound work owned by a bot identity. Records
//! are keyed by id in the state store; the active per-identity index orders
//! them by due time.

use serde::{Deserialize, Serialize};

use super::id::generate_message_id;
use super::priority::MessagePriority;

/// Message lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Waiting for its due time or a retry
    #[default]
    Pending,
    /// Claimed by a worker that is sending it right now
    Leased,
    /// Delivered
    Sent,
    /// Transient failures exhausted `max_attempts`
    Failed,
    /// Permanent delivery failure, kept for inspection
    DeadLettered,
    /// Cancelled by an operator or expired before dispatch
    Cancelled,
}

impl MessageStatus {
    /// Terminal statuses never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::DeadLettered | Self::Cancelled)
    }

    /// Statuses a worker may pick up for sending
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, Self::Pending | Self::Leased)
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Leased => write!(f, "leased"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
            Self::DeadLettered => write!(f, "dead_lettered"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "leased" => Ok(Self::Leased),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "dead_lettered" => Ok(Self::DeadLettered),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown message status: {}", s)),
        }
    }
}

/// Repeat schedule of a recurring message
///
/// Each occurrence is its own message; the next one is enqueued once the
/// current one is sent or fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    /// Period between occurrences (milliseconds)
    pub every_ms: u64,

    /// Stop after this many occurrences (unbounded when absent)
    #[serde(default)]
    pub max_occurrences: Option<u32>,

    /// 1-based number of this occurrence
    #[serde(default = "first_occurrence")]
    pub occurrence: u32,

    /// Id of the first message of the series; filled in on enqueue
    #[serde(default)]
    pub series_id: Option<String>,
}

fn first_occurrence() -> u32 {
    1
}

impl Recurrence {
    pub fn new(every_ms: u64, max_occurrences: Option<u32>) -> Self {
        Self {
            every_ms,
            max_occurrences,
            occurrence: 1,
            series_id: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_occurrences.is_some_and(|max| self.occurrence >= max)
    }
}

/// A scheduled outbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier, used for deduplication
    pub id: String,

    /// Owning bot identity
    pub identity_id: String,

    /// Destination chat reference (opaque)
    pub target: String,

    /// Message body (opaque)
    pub payload: String,

    /// Earliest dispatch time (Unix milliseconds)
    pub scheduled_at: i64,

    /// Current status
    pub status: MessageStatus,

    /// Delivery attempts that ended in a transient failure
    pub attempt_count: u32,

    /// Last delivery error (if any)
    pub last_error: Option<String>,

    /// Due time of the next retry, overrides `scheduled_at` once set
    pub next_retry_at: Option<i64>,

    /// Drop the message instead of sending it after this time
    #[serde(default)]
    pub expires_at: Option<i64>,

    /// Insertion sequence, FIFO tie-break for equal due times
    #[serde(default)]
    pub seq: u64,

    /// Tie-break ahead of `seq` among messages due at the same time
    #[serde(default)]
    pub priority: MessagePriority,

    /// Repeat schedule, if this message is part of a series
    #[serde(default)]
    pub recurrence: Option<Recurrence>,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,

    /// When the message reached a terminal status
    #[serde(default)]
    pub finished_at: Option<i64>,
}

impl Message {
    /// Effective due time: the pending retry if any, else the schedule
    pub fn due_at(&self) -> i64 {
        self.next_retry_at.unwrap_or(self.scheduled_at)
    }

    /// Check if the message may be dispatched at `now`
    pub fn is_due(&self, now: i64) -> bool {
        self.status.is_dispatchable() && self.due_at() <= now
    }

    /// Position among messages with the same due time
    pub fn order_key(&self) -> u64 {
        self.priority.tie_break(self.seq)
    }

    /// The series' next occurrence, due strictly after `now`
    ///
    /// Periods missed while the identity was paused or offline are skipped.
    /// The id is derived from the series so a repeated call after a crash
    /// enqueues the same message.
    pub fn next_occurrence(&self, now: i64) -> Option<NewMessage> {
        let recurrence = self.recurrence.as_ref()?;
        if recurrence.is_exhausted() {
            return None;
        }

        let every = recurrence.every_ms.max(1) as i64;
        let periods = (now - self.scheduled_at).max(0) / every + 1;
        let scheduled_at = self.scheduled_at + periods * every;
        let series_id = recurrence.series_id.clone().unwrap_or_else(|| self.id.clone());
        let occurrence = recurrence.occurrence + 1;

        Some(NewMessage {
            id: Some(format!("{}.{}", series_id, occurrence)),
            identity_id: self.identity_id.clone(),
            target: self.target.clone(),
            payload: self.payload.clone(),
            scheduled_at,
            expires_at: self.expires_at.map(|at| at + (scheduled_at - self.scheduled_at)),
            priority: self.priority,
            recurrence: Some(Recurrence {
                occurrence,
                series_id: Some(series_id),
                ..recurrence.clone()
            }),
        })
    }

    /// Check if the message expired before it could be sent
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|exp| exp < now)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Update the status; terminal statuses stamp `finished_at`
    pub fn set_status(&mut self, status: MessageStatus, now: i64) {
        self.status = status;
        self.updated_at = now;
        if status.is_terminal() {
            self.finished_at = Some(now);
        }
    }

    /// Set an error
    pub fn set_error(&mut self, error: impl Into<String>, now: i64) {
        self.last_error = Some(error.into());
        self.updated_at = now;
    }
}

/// Producer-side request to enqueue a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    /// Caller-supplied id; generated when absent
    pub id: Option<String>,
    pub identity_id: String,
    pub target: String,
    pub payload: String,
    pub scheduled_at: i64,
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub priority: MessagePriority,
    #[serde(default)]
    pub recurrence: Option<Recurrence>,
}

impl NewMessage {
    /// Message due at `scheduled_at`
    pub fn new(
        identity_id: impl Into<String>,
        target: impl Into<String>,
        payload: impl Into<String>,
        scheduled_at: i64,
    ) -> Self {
        Self {
            id: None,
            identity_id: identity_id.into(),
            target: target.into(),
            payload: payload.into(),
            scheduled_at,
            expires_at: None,
            priority: MessagePriority::Normal,
            recurrence: None,
        }
    }

    /// Use a specific id (for idempotent producers)
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Drop the message if not sent by `expires_at`
    pub fn with_expiry(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Re-enqueue every `every_ms` after each send, up to `max_occurrences`
    pub fn repeating(mut self, every_ms: u64, max_occurrences: Option<u32>) -> Self {
        self.recurrence = Some(Recurrence::new(every_ms, max_occurrences));
        self
    }

    /// Build the stored record
    pub fn into_message(self, seq: u64, now: i64) -> Message {
        let id = self.id.unwrap_or_else(generate_message_id);
        let recurrence = self.recurrence.map(|r| Recurrence {
            series_id: r.series_id.or_else(|| Some(id.clone())),
            ..r
        });
        Message {
            id,
            identity_id: self.identity_id,
            target: self.target,
            payload: self.payload,
            scheduled_at: self.scheduled_at,
            status: MessageStatus::Pending,
            attempt_count: 0,
            last_error: None,
            next_retry_at: None,
            expires_at: self.expires_at,
            seq,
            priority: self.priority,
            recurrence,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        NewMessage::new("bot-a", "chat-1", "hello", 1_000)
            .with_id("m1")
            .into_message(7, 500)
    }

    #[test]
    fn test_into_message_defaults() {
        let msg = sample();
        assert_eq!(msg.id, "m1");
        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(msg.attempt_count, 0);
        assert_eq!(msg.seq, 7);
        assert_eq!(msg.created_at, 500);
        assert!(msg.finished_at.is_none());
    }

    #[test]
    fn test_generated_id_when_absent() {
        let msg = NewMessage::new("bot-a", "chat-1", "hi", 0).into_message(1, 0);
        assert!(msg.id.starts_with("msg-"));
    }

    #[test]
    fn test_due_at_prefers_retry() {
        let mut msg = sample();
        assert_eq!(msg.due_at(), 1_000);
        assert!(!msg.is_due(999));
        assert!(msg.is_due(1_000));

        msg.next_retry_at = Some(5_000);
        assert_eq!(msg.due_at(), 5_000);
        assert!(!msg.is_due(1_000));
    }

    #[test]
    fn test_terminal_status_stamps_finished_at() {
        let mut msg = sample();
        msg.set_status(MessageStatus::Leased, 1_100);
        assert!(msg.finished_at.is_none());
        assert!(msg.is_due(1_100));

        msg.set_status(MessageStatus::Sent, 1_200);
        assert!(msg.is_terminal());
        assert_eq!(msg.finished_at, Some(1_200));
        assert!(!msg.is_due(2_000));
    }

    #[test]
    fn test_expiry() {
        let msg = NewMessage::new("bot-a", "chat-1", "hi", 0)
            .with_expiry(100)
            .into_message(1, 0);
        assert!(!msg.is_expired(100));
        assert!(msg.is_expired(101));
    }

    #[test]
    fn test_order_key_puts_priority_before_seq() {
        let normal = NewMessage::new("bot-a", "chat-1", "hi", 0).into_message(1, 0);
        let urgent = NewMessage::new("bot-a", "chat-1", "hi", 0)
            .with_priority(MessagePriority::Urgent)
            .into_message(2, 0);
        assert!(urgent.order_key() < normal.order_key());
    }

    #[test]
    fn test_next_occurrence_of_series() {
        let msg = NewMessage::new("bot-a", "chat-1", "daily", 1_000)
            .with_id("digest")
            .with_priority(MessagePriority::High)
            .with_expiry(1_500)
            .repeating(10_000, Some(3))
            .into_message(1, 0);

        let second = msg.next_occurrence(1_200).unwrap();
        assert_eq!(second.id.as_deref(), Some("digest.2"));
        assert_eq!(second.scheduled_at, 11_000);
        assert_eq!(second.expires_at, Some(11_500));
        assert_eq!(second.priority, MessagePriority::High);

        let second = second.into_message(2, 1_200);
        let third = second.next_occurrence(11_000).unwrap();
        assert_eq!(third.id.as_deref(), Some("digest.3"));
        assert_eq!(third.scheduled_at, 21_000);

        let third = third.into_message(3, 11_000);
        assert!(third.next_occurrence(21_000).is_none());
    }

    #[test]
    fn test_next_occurrence_skips_missed_periods() {
        let msg = NewMessage::new("bot-a", "chat-1", "tick", 0)
            .with_id("s")
            .repeating(100, None)
            .into_message(1, 0);

        let next = msg.next_occurrence(350).unwrap();
        assert_eq!(next.scheduled_at, 400);
        assert_eq!(next.id.as_deref(), Some("s.2"));

        // Exactly on a period boundary the next one is a full period later
        assert_eq!(msg.next_occurrence(400).unwrap().scheduled_at, 500);
    }

    #[test]
    fn test_one_off_has_no_next_occurrence() {
        assert!(sample().next_occurrence(5_000).is_none());
    }

    #[test]
    fn test_status_roundtrip_strings() {
        for status in [
            MessageStatus::Pending,
            MessageStatus::Leased,
            MessageStatus::Sent,
            MessageStatus::Failed,
            MessageStatus::DeadLettered,
            MessageStatus::Cancelled,
        ] {
            let parsed: MessageStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<MessageStatus>().is_err());
    }
}
