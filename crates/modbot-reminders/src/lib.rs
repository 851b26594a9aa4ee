//! Scheduled one-shot reminders with delivery, editing and startup
//! reconciliation.

mod service;

pub use service::{ReminderEdit, ReminderService, RECONCILE_KEY};

use serde::{Deserialize, Serialize};

use modbot_storage::StorageError;

pub type Result<T> = std::result::Result<T, ReminderError>;

#[derive(Debug, thiserror::Error)]
pub enum ReminderError {
    #[error("there are already {limit} pending reminders")]
    TooManyReminders { limit: usize },

    #[error("no reminder with id {0}")]
    NotFound(i64),

    #[error("reminder {0} belongs to another user")]
    NotOwner(i64),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Tunables for the reminder lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderConfig {
    /// Total pending reminders allowed across all authors.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

fn default_max_pending() -> usize {
    100
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
        }
    }
}
