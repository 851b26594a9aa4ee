//! modbot-types: shared data model and collaborator traits.
//!
//! Everything the lifecycle crates exchange lives here: infraction and
//! reminder records, the traits the outer bot layer implements (DM delivery,
//! guild side effects, mod-log entries), and the human duration parser.

pub mod duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ──────────────────── Infractions ────────────────────

/// The kind of sanction an infraction records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfractionKind {
    Ban,
    Kick,
    Mute,
    VoiceBan,
    Warning,
    Note,
}

impl InfractionKind {
    /// Whether this kind carries ongoing state that can expire or be
    /// pardoned. Kicks, warnings and notes are one-shot: their records are
    /// inserted already inactive and there is nothing to reverse later.
    pub fn has_active_state(self) -> bool {
        matches!(self, Self::Ban | Self::Mute | Self::VoiceBan)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ban => "ban",
            Self::Kick => "kick",
            Self::Mute => "mute",
            Self::VoiceBan => "voice_ban",
            Self::Warning => "warning",
            Self::Note => "note",
        }
    }
}

impl std::fmt::Display for InfractionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown infraction kind `{0}`")]
pub struct UnknownKind(pub String);

impl std::str::FromStr for InfractionKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ban" => Ok(Self::Ban),
            "kick" => Ok(Self::Kick),
            "mute" => Ok(Self::Mute),
            "voice_ban" => Ok(Self::VoiceBan),
            "warning" => Ok(Self::Warning),
            "note" => Ok(Self::Note),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

/// A persisted moderation sanction.
///
/// Identity fields never change after creation; only `active`, `reason` and
/// `expires_at` are mutable. `permanent` is derived from `expires_at` at
/// insert time and kept in sync by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Infraction {
    pub id: i64,
    pub kind: InfractionKind,
    pub user: u64,
    pub guild: u64,
    pub actor: u64,
    pub reason: Option<String>,
    /// Hidden (shadow) infractions never DM the subject.
    pub hidden: bool,
    pub active: bool,
    pub permanent: bool,
    pub inserted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Infraction {
    /// Whether this record is eligible for expiry scheduling.
    pub fn is_schedulable(&self) -> bool {
        self.active && self.expires_at.is_some()
    }
}

/// Fields for a not-yet-persisted infraction. The store derives `active`,
/// `permanent` and `inserted_at`.
#[derive(Debug, Clone)]
pub struct NewInfraction {
    pub kind: InfractionKind,
    pub user: u64,
    pub guild: u64,
    pub actor: u64,
    pub reason: Option<String>,
    pub hidden: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

// ──────────────────── Reminders ────────────────────

/// A persisted personal reminder. Existence implies pending; the record is
/// deleted once delivered or cancelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    pub id: i64,
    pub author: u64,
    pub channel: u64,
    pub guild: u64,
    /// The message that created the reminder, for a jump-back link.
    pub origin_message: u64,
    pub content: String,
    pub expires_at: DateTime<Utc>,
    /// Extra users or roles to ping on delivery.
    pub mentions: Vec<u64>,
}

/// Fields for a not-yet-persisted reminder.
#[derive(Debug, Clone)]
pub struct NewReminder {
    pub author: u64,
    pub channel: u64,
    pub guild: u64,
    pub origin_message: u64,
    pub content: String,
    pub expires_at: DateTime<Utc>,
    pub mentions: Vec<u64>,
}

// ──────────────────── Collaborator traits ────────────────────

/// Failure modes shared by every platform side effect. The lifecycle crates
/// interpret these three identically across all sanction kinds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("the bot lacks permissions for this action")]
    Forbidden,
    #[error("subject not found; they probably left the guild")]
    NotFound,
    #[error("platform error: {0}")]
    Other(String),
}

/// Guild-level side effects that implement sanctions.
///
/// Implemented by the chat-platform client, which is out of scope here.
#[async_trait::async_trait]
pub trait GuildGateway: Send + Sync {
    async fn ban(&self, guild: u64, user: u64, reason: Option<&str>) -> Result<(), GatewayError>;
    async fn unban(&self, guild: u64, user: u64) -> Result<(), GatewayError>;
    async fn kick(&self, guild: u64, user: u64, reason: Option<&str>) -> Result<(), GatewayError>;
    async fn add_mute_role(&self, guild: u64, user: u64) -> Result<(), GatewayError>;
    async fn remove_mute_role(&self, guild: u64, user: u64) -> Result<(), GatewayError>;
    async fn revoke_voice(&self, guild: u64, user: u64) -> Result<(), GatewayError>;
    async fn restore_voice(&self, guild: u64, user: u64) -> Result<(), GatewayError>;
}

/// DM-style notification delivery. Failures are expected (closed DMs,
/// departed subjects) and reported as `false`, never as errors.
#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    /// Tell the subject about a new sanction. Returns whether the message
    /// was delivered.
    async fn notify_sanction(&self, user: u64, infraction: &Infraction) -> bool;
    /// Tell the subject their sanction was lifted.
    async fn notify_pardon(&self, user: u64, kind: InfractionKind) -> bool;
}

/// Reminder delivery back into the originating channel.
#[async_trait::async_trait]
pub trait ReminderSink: Send + Sync {
    /// Whether the author and delivery channel still resolve.
    async fn can_deliver(&self, reminder: &Reminder) -> bool;
    /// Deliver the reminder. `overdue` marks deliveries that missed their
    /// target time because the process was down.
    async fn deliver(&self, reminder: &Reminder, overdue: bool) -> Result<(), GatewayError>;
}

/// A structured mod-log entry emitted by the infraction lifecycle.
#[derive(Debug, Clone)]
pub enum AuditEvent {
    Applied {
        infraction: Infraction,
        /// Whether the subject was DMed; `None` when the infraction is
        /// hidden and no DM was attempted.
        dm_sent: Option<bool>,
    },
    ApplyFailed {
        kind: InfractionKind,
        user: u64,
        error: String,
    },
    Pardoned {
        infraction: Infraction,
        failure: Option<String>,
    },
    Expired {
        infraction: Infraction,
        failure: Option<String>,
    },
}

/// One-directional mod-log handle. The sink never calls back into the
/// lifecycle crates; it only renders entries somewhere visible.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    /// Record an entry. Fire-and-forget; implementations swallow platform
    /// failures.
    async fn record(&self, event: AuditEvent);
}
