//! modbot-moderation: the infraction lifecycle manager.
//!
//! Applies, pardons, deactivates and reapplies sanctions, driving the
//! scheduler for expiry and the record store for durable state. The chat
//! platform itself is reached only through the collaborator traits in
//! `modbot-types`.

mod service;

pub use service::{
    ApplyOutcome, ApplyRequest, DeactivationReport, ExpiryEdit, InfractionEdit, InfractionService,
    PardonOutcome, RECONCILE_KEY,
};

use serde::{Deserialize, Serialize};

use modbot_types::{GatewayError, InfractionKind};

#[derive(Debug, thiserror::Error)]
pub enum ModerationError {
    #[error("you cannot issue a {0} against yourself")]
    SelfTarget(InfractionKind),
    #[error("no infraction with id {0}")]
    NotFound(i64),
    #[error("neither a new expiry nor a new reason was given")]
    NothingToEdit,
    #[error("cannot edit the expiry of an inactive infraction (#{0})")]
    InactiveExpiryEdit(i64),
    #[error("user already has an active {kind} (see infraction #{id})")]
    AlreadyActive { kind: InfractionKind, id: i64 },
    #[error("{0} infractions have no active state to deactivate")]
    NoActiveState(InfractionKind),
    #[error("failed to apply {kind}: {source}")]
    ApplyFailed {
        kind: InfractionKind,
        #[source]
        source: GatewayError,
        /// The just-created record could not be rolled back either.
        rollback_failed: bool,
    },
    #[error("storage error: {0}")]
    Storage(#[from] modbot_storage::StorageError),
}

/// Tunables for the infraction lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationConfig {
    /// Sanctions with less remaining time than this are deactivated instead
    /// of reapplied when the subject rejoins.
    #[serde(default = "default_reapply_floor_secs")]
    pub reapply_floor_secs: i64,
}

fn default_reapply_floor_secs() -> i64 {
    60
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            reapply_floor_secs: default_reapply_floor_secs(),
        }
    }
}
