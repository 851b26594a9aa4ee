//! Reminder record CRUD.
//!
//! A reminder has no active flag; existence implies pending. Delivery and
//! cancellation both end in deletion.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row};
use tracing::trace;

use modbot_types::{NewReminder, Reminder};

use crate::{ModBotStore, Result, from_millis, to_millis};

const COLUMNS: &str = "id, author, channel, guild, origin_message, content, expires_at, mentions";

fn join_mentions(mentions: &[u64]) -> String {
    mentions
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn split_mentions(raw: &str) -> Vec<u64> {
    raw.split(',').filter_map(|s| s.parse().ok()).collect()
}

fn reminder_from_row(row: &Row<'_>) -> rusqlite::Result<Reminder> {
    let mentions: String = row.get(7)?;
    Ok(Reminder {
        id: row.get(0)?,
        author: row.get::<_, i64>(1)? as u64,
        channel: row.get::<_, i64>(2)? as u64,
        guild: row.get::<_, i64>(3)? as u64,
        origin_message: row.get::<_, i64>(4)? as u64,
        content: row.get(5)?,
        expires_at: from_millis(row.get(6)?)?,
        mentions: split_mentions(&mentions),
    })
}

/// Partial update for a reminder; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ReminderPatch {
    pub content: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub mentions: Option<Vec<u64>>,
}

impl ModBotStore {
    /// Persist a new reminder and return it with its generated id.
    pub async fn create_reminder(&self, new: NewReminder) -> Result<Reminder> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO reminders
                    (author, channel, guild, origin_message, content, expires_at, mentions)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    new.author as i64,
                    new.channel as i64,
                    new.guild as i64,
                    new.origin_message as i64,
                    new.content,
                    to_millis(new.expires_at),
                    join_mentions(&new.mentions),
                ],
            )?;
            let id = conn.last_insert_rowid();
            trace!(id, author = new.author, "created reminder record");

            Ok(Reminder {
                id,
                author: new.author,
                channel: new.channel,
                guild: new.guild,
                origin_message: new.origin_message,
                content: new.content,
                expires_at: new.expires_at,
                mentions: new.mentions,
            })
        })
        .await
    }

    /// Fetch a reminder by id.
    pub async fn get_reminder(&self, id: i64) -> Result<Option<Reminder>> {
        self.call(move |conn| {
            let result = conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM reminders WHERE id = ?1"),
                    rusqlite::params![id],
                    reminder_from_row,
                )
                .optional()?;
            Ok(result)
        })
        .await
    }

    /// Every pending reminder, soonest first (reconciliation order).
    pub async fn list_reminders(&self) -> Result<Vec<Reminder>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM reminders ORDER BY expires_at ASC"
            ))?;
            let rows = stmt
                .query_map([], reminder_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// An author's pending reminders, soonest first.
    pub async fn reminders_for_author(&self, author: u64) -> Result<Vec<Reminder>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM reminders WHERE author = ?1 ORDER BY expires_at ASC"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![author as i64], reminder_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// How many reminders are pending in total (admission control).
    pub async fn count_reminders(&self) -> Result<usize> {
        self.call(move |conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM reminders", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    /// Apply a partial update and return the updated record, or `None` if
    /// the reminder no longer exists.
    pub async fn update_reminder(&self, id: i64, patch: ReminderPatch) -> Result<Option<Reminder>> {
        self.call(move |conn| {
            if let Some(content) = &patch.content {
                conn.execute(
                    "UPDATE reminders SET content = ?1 WHERE id = ?2",
                    rusqlite::params![content, id],
                )?;
            }
            if let Some(expires_at) = patch.expires_at {
                conn.execute(
                    "UPDATE reminders SET expires_at = ?1 WHERE id = ?2",
                    rusqlite::params![to_millis(expires_at), id],
                )?;
            }
            if let Some(mentions) = &patch.mentions {
                conn.execute(
                    "UPDATE reminders SET mentions = ?1 WHERE id = ?2",
                    rusqlite::params![join_mentions(mentions), id],
                )?;
            }
            let result = conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM reminders WHERE id = ?1"),
                    rusqlite::params![id],
                    reminder_from_row,
                )
                .optional()?;
            Ok(result)
        })
        .await
    }

    /// Delete a reminder (delivered or cancelled). Returns whether a row
    /// was removed.
    pub async fn delete_reminder(&self, id: i64) -> Result<bool> {
        self.call(move |conn| {
            let count = conn.execute("DELETE FROM reminders WHERE id = ?1", rusqlite::params![id])?;
            Ok(count > 0)
        })
        .await
    }
}
