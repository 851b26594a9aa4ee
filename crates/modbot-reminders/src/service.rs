//! Reminder creation, rescheduling, delivery and startup reconciliation.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, trace, warn};

use modbot_scheduler::Scheduler;
use modbot_storage::{ModBotStore, ReminderPatch};
use modbot_types::{GatewayError, NewReminder, Reminder, ReminderSink};

use crate::{ReminderConfig, ReminderError, Result};

/// Reserved scheduler key for the recurring reconciliation pass. Record ids
/// are positive, so the sentinel can never collide.
pub const RECONCILE_KEY: i64 = -1;

/// Author-requested changes to a pending reminder; `None` fields keep their
/// current value.
#[derive(Debug, Clone, Default)]
pub struct ReminderEdit {
    pub content: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub mentions: Option<Vec<u64>>,
}

/// Drives the reminder lifecycle: created → pending → delivered-and-deleted.
/// A reminder exists in the store exactly as long as it is undelivered.
pub struct ReminderService {
    store: Arc<ModBotStore>,
    scheduler: Scheduler<i64>,
    sink: Arc<dyn ReminderSink>,
    config: ReminderConfig,
}

impl ReminderService {
    pub fn new(
        store: Arc<ModBotStore>,
        scheduler: Scheduler<i64>,
        sink: Arc<dyn ReminderSink>,
        config: ReminderConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            scheduler,
            sink,
            config,
        })
    }

    /// Persist a new reminder and register its delivery timer.
    pub async fn create(self: &Arc<Self>, mut new: NewReminder) -> Result<Reminder> {
        let pending = self.store.count_reminders().await?;
        if pending >= self.config.max_pending {
            debug!(
                author = new.author,
                pending,
                "declining reminder; the pending cap is reached"
            );
            return Err(ReminderError::TooManyReminders {
                limit: self.config.max_pending,
            });
        }

        new.mentions = sanitize_mentions(new.author, new.mentions);
        let reminder = self.store.create_reminder(new).await?;
        self.schedule_delivery(&reminder);
        info!(
            id = reminder.id,
            author = reminder.author,
            expires_at = %reminder.expires_at,
            "created reminder"
        );
        Ok(reminder)
    }

    /// Apply an author's edit and move the delivery timer to the new expiry.
    pub async fn edit(self: &Arc<Self>, id: i64, author: u64, edit: ReminderEdit) -> Result<Reminder> {
        self.ensure_can_modify(id, author).await?;

        let patch = ReminderPatch {
            content: edit.content,
            expires_at: edit.expires_at,
            mentions: edit
                .mentions
                .map(|mentions| sanitize_mentions(author, mentions)),
        };
        let Some(reminder) = self.store.update_reminder(id, patch).await? else {
            return Err(ReminderError::NotFound(id));
        };

        // Replace rather than adjust: the old timer may already hold a stale
        // expiry, so cancel and schedule from the updated record.
        self.scheduler.cancel(&id);
        self.schedule_delivery(&reminder);
        info!(id, author, "edited reminder");
        Ok(reminder)
    }

    /// Delete a pending reminder and drop its timer.
    pub async fn cancel(&self, id: i64, author: u64) -> Result<()> {
        self.ensure_can_modify(id, author).await?;
        self.store.delete_reminder(id).await?;
        self.scheduler.cancel(&id);
        info!(id, author, "cancelled reminder");
        Ok(())
    }

    /// All pending reminders for an author, soonest first.
    pub async fn list(&self, author: u64) -> Result<Vec<Reminder>> {
        Ok(self.store.reminders_for_author(author).await?)
    }

    /// Startup reconciliation: rebuild delivery timers from the store.
    ///
    /// Reminders whose author or channel no longer resolve are deleted
    /// instead of scheduled. Reminders that came due while the process was
    /// down are delivered immediately and flagged as overdue. The pass
    /// re-registers itself at the latest expiry it scheduled, so reminders
    /// created while it was in flight are picked up by the next pass.
    /// Returns how many reminders were handled.
    pub fn reconcile(
        self: &Arc<Self>,
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'static>> {
        let this = Arc::clone(self);
        Box::pin(async move { this.reconcile_inner().await })
    }

    async fn reconcile_inner(self: &Arc<Self>) -> Result<usize> {
        let now = Utc::now();
        let reminders = self.store.list_reminders().await?;
        let mut handled = 0;
        let mut next_pass: Option<DateTime<Utc>> = None;

        for reminder in reminders {
            if self.scheduler.contains(&reminder.id) {
                continue;
            }
            handled += 1;
            if !self.sink.can_deliver(&reminder).await {
                warn!(
                    id = reminder.id,
                    author = reminder.author,
                    "reminder no longer resolves; deleting instead of scheduling"
                );
                self.store.delete_reminder(reminder.id).await?;
            } else if reminder.expires_at <= now {
                trace!(id = reminder.id, "delivering overdue reminder");
                self.fire(reminder.id, true).await;
            } else {
                trace!(id = reminder.id, "scheduling reminder delivery");
                self.schedule_delivery(&reminder);
                next_pass = next_pass.max(Some(reminder.expires_at));
            }
        }

        if let Some(latest) = next_pass {
            // Just after the last delivery, so its deletion has landed and
            // the pass cannot re-schedule a reminder that is mid-delivery.
            let next_pass = latest + Duration::seconds(1);
            debug!(%next_pass, "scheduling follow-up reconciliation pass");
            let service = Arc::clone(self);
            self.scheduler.schedule_at(next_pass, RECONCILE_KEY, async move {
                if let Err(err) = Box::pin(service.reconcile()).await {
                    error!("reminder reconciliation pass failed: {err}");
                }
            });
        }

        debug!(count = handled, "reminder reconciliation complete");
        Ok(handled)
    }

    /// Drop every pending timer. Used at subsystem shutdown; the store is
    /// untouched and a later reconciliation pass restores the timers.
    pub fn shutdown(&self) {
        self.scheduler.cancel_all();
    }

    fn schedule_delivery(self: &Arc<Self>, reminder: &Reminder) {
        let service = Arc::clone(self);
        let id = reminder.id;
        self.scheduler
            .schedule_at(reminder.expires_at, id, async move {
                service.fire(id, false).await;
            });
    }

    /// Delivery callback. Re-fetches the record: the timer may race an edit
    /// or cancellation, so firing against a missing record is a no-op.
    ///
    /// Delivery is one-shot. Whether it succeeds, fails, or the reminder no
    /// longer resolves, the record is deleted; there is no retry.
    async fn fire(&self, id: i64, overdue: bool) {
        let reminder = match self.store.get_reminder(id).await {
            Ok(Some(reminder)) => reminder,
            Ok(None) => {
                debug!(id, "delivery fired for a missing reminder; nothing to do");
                return;
            }
            Err(err) => {
                error!(id, "failed to load reminder at delivery: {err}");
                return;
            }
        };

        if !self.sink.can_deliver(&reminder).await {
            warn!(
                id,
                author = reminder.author,
                "reminder no longer resolves; deleting without delivery"
            );
        } else {
            match self.sink.deliver(&reminder, overdue).await {
                Ok(()) => info!(id, author = reminder.author, overdue, "delivered reminder"),
                Err(GatewayError::NotFound) => {
                    info!(id, "reminder channel disappeared before delivery")
                }
                Err(err) => error!(id, "failed to deliver reminder: {err}"),
            }
        }

        if let Err(err) = self.store.delete_reminder(id).await {
            error!(id, "failed to delete reminder after delivery: {err}");
        }
    }

    /// The reminder must exist and belong to the requesting author.
    async fn ensure_can_modify(&self, id: i64, author: u64) -> Result<()> {
        let Some(reminder) = self.store.get_reminder(id).await? else {
            return Err(ReminderError::NotFound(id));
        };
        if reminder.author != author {
            debug!(id, author, owner = reminder.author, "rejecting foreign reminder access");
            return Err(ReminderError::NotOwner(id));
        }
        Ok(())
    }
}

/// Drop duplicates and the author's own id; the author is always pinged.
fn sanitize_mentions(author: u64, mentions: Vec<u64>) -> Vec<u64> {
    let mut seen = HashSet::new();
    mentions
        .into_iter()
        .filter(|&id| id != author && seen.insert(id))
        .collect()
}
