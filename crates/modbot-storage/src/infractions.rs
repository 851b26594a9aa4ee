//! Infraction record CRUD.
//!
//! Records are never deleted on expiry; they stay for audit and search. The
//! single deletion path is rollback of an apply whose side effect failed.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row};
use tracing::trace;

use modbot_types::{Infraction, InfractionKind, NewInfraction};

use crate::{ModBotStore, Result, from_millis, to_millis};

const COLUMNS: &str =
    "id, kind, user, guild, actor, reason, hidden, active, permanent, inserted_at, expires_at";

/// Filter set for history queries; `None` fields match everything. The
/// default query returns the full record history.
#[derive(Debug, Clone, Copy, Default)]
pub struct InfractionQuery {
    pub kind: Option<InfractionKind>,
    pub user: Option<u64>,
    pub guild: Option<u64>,
    pub active: Option<bool>,
}

fn infraction_from_row(row: &Row<'_>) -> rusqlite::Result<Infraction> {
    let kind: String = row.get(1)?;
    let kind = kind.parse::<InfractionKind>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(err))
    })?;
    let expires_at = row
        .get::<_, Option<i64>>(10)?
        .map(from_millis)
        .transpose()?;

    Ok(Infraction {
        id: row.get(0)?,
        kind,
        user: row.get::<_, i64>(2)? as u64,
        guild: row.get::<_, i64>(3)? as u64,
        actor: row.get::<_, i64>(4)? as u64,
        reason: row.get(5)?,
        hidden: row.get::<_, i64>(6)? != 0,
        active: row.get::<_, i64>(7)? != 0,
        permanent: row.get::<_, i64>(8)? != 0,
        inserted_at: from_millis(row.get(9)?)?,
        expires_at,
    })
}

impl ModBotStore {
    /// Persist a new infraction and return it with its generated id.
    ///
    /// `active` is derived from the kind (one-shot kinds are born inactive)
    /// and `permanent` from the absence of an expiry.
    pub async fn create_infraction(&self, new: NewInfraction) -> Result<Infraction> {
        let inserted_at = Utc::now();
        self.call(move |conn| {
            let active = new.kind.has_active_state();
            let permanent = new.expires_at.is_none();
            conn.execute(
                "INSERT INTO infractions
                    (kind, user, guild, actor, reason, hidden, active, permanent, inserted_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    new.kind.as_str(),
                    new.user as i64,
                    new.guild as i64,
                    new.actor as i64,
                    new.reason,
                    new.hidden as i64,
                    active as i64,
                    permanent as i64,
                    to_millis(inserted_at),
                    new.expires_at.map(to_millis),
                ],
            )?;
            let id = conn.last_insert_rowid();
            trace!(id, kind = %new.kind, "created infraction record");

            Ok(Infraction {
                id,
                kind: new.kind,
                user: new.user,
                guild: new.guild,
                actor: new.actor,
                reason: new.reason,
                hidden: new.hidden,
                active,
                permanent,
                inserted_at,
                expires_at: new.expires_at,
            })
        })
        .await
    }

    /// Fetch an infraction by id.
    pub async fn get_infraction(&self, id: i64) -> Result<Option<Infraction>> {
        self.call(move |conn| {
            let result = conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM infractions WHERE id = ?1"),
                    rusqlite::params![id],
                    infraction_from_row,
                )
                .optional()?;
            Ok(result)
        })
        .await
    }

    /// The single active infraction of `kind` for a user in a guild, if any.
    pub async fn active_infraction(
        &self,
        kind: InfractionKind,
        user: u64,
        guild: u64,
    ) -> Result<Option<Infraction>> {
        self.call(move |conn| {
            let result = conn
                .query_row(
                    &format!(
                        "SELECT {COLUMNS} FROM infractions
                         WHERE active = 1 AND kind = ?1 AND user = ?2 AND guild = ?3
                         LIMIT 1"
                    ),
                    rusqlite::params![kind.as_str(), user as i64, guild as i64],
                    infraction_from_row,
                )
                .optional()?;
            Ok(result)
        })
        .await
    }

    /// All active infractions for a user in a guild, used to re-establish
    /// sanctions when a subject rejoins.
    pub async fn active_infractions_for_user(
        &self,
        user: u64,
        guild: u64,
    ) -> Result<Vec<Infraction>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM infractions
                 WHERE active = 1 AND user = ?1 AND guild = ?2
                 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map(
                    rusqlite::params![user as i64, guild as i64],
                    infraction_from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Records matching the query filters, inactive history included,
    /// newest first.
    pub async fn find_infractions(&self, query: InfractionQuery) -> Result<Vec<Infraction>> {
        self.call(move |conn| {
            let mut sql = format!("SELECT {COLUMNS} FROM infractions");
            let mut clauses: Vec<&str> = Vec::new();
            let mut params: Vec<rusqlite::types::Value> = Vec::new();
            if let Some(kind) = query.kind {
                clauses.push("kind = ?");
                params.push(kind.as_str().to_string().into());
            }
            if let Some(user) = query.user {
                clauses.push("user = ?");
                params.push((user as i64).into());
            }
            if let Some(guild) = query.guild {
                clauses.push("guild = ?");
                params.push((guild as i64).into());
            }
            if let Some(active) = query.active {
                clauses.push("active = ?");
                params.push((active as i64).into());
            }
            if !clauses.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&clauses.join(" AND "));
            }
            sql.push_str(" ORDER BY inserted_at DESC, id DESC");

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(params), infraction_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Every record eligible for expiry scheduling: active with a non-null
    /// expiry, oldest expiry first (reconciliation order).
    pub async fn schedulable_infractions(&self) -> Result<Vec<Infraction>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM infractions
                 WHERE active = 1 AND expires_at IS NOT NULL
                 ORDER BY expires_at ASC"
            ))?;
            let rows = stmt
                .query_map([], infraction_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Mark an infraction inactive. Idempotent.
    pub async fn set_infraction_inactive(&self, id: i64) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "UPDATE infractions SET active = 0 WHERE id = ?1",
                rusqlite::params![id],
            )?;
            Ok(())
        })
        .await
    }

    /// Update the human-readable reason of an infraction.
    pub async fn update_infraction_reason(
        &self,
        id: i64,
        reason: Option<String>,
    ) -> Result<Option<Infraction>> {
        self.call(move |conn| {
            conn.execute(
                "UPDATE infractions SET reason = ?1 WHERE id = ?2",
                rusqlite::params![reason, id],
            )?;
            let result = conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM infractions WHERE id = ?1"),
                    rusqlite::params![id],
                    infraction_from_row,
                )
                .optional()?;
            Ok(result)
        })
        .await
    }

    /// Update the expiry of an infraction, keeping `permanent` in sync.
    pub async fn update_infraction_expiry(
        &self,
        id: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Infraction>> {
        self.call(move |conn| {
            conn.execute(
                "UPDATE infractions SET expires_at = ?1, permanent = ?2 WHERE id = ?3",
                rusqlite::params![expires_at.map(to_millis), expires_at.is_none() as i64, id],
            )?;
            let result = conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM infractions WHERE id = ?1"),
                    rusqlite::params![id],
                    infraction_from_row,
                )
                .optional()?;
            Ok(result)
        })
        .await
    }

    /// Delete an infraction record. Only used to roll back a failed apply.
    pub async fn delete_infraction(&self, id: i64) -> Result<bool> {
        self.call(move |conn| {
            let count = conn.execute(
                "DELETE FROM infractions WHERE id = ?1",
                rusqlite::params![id],
            )?;
            Ok(count > 0)
        })
        .await
    }
}
