//! Infraction application, pardoning, expiry and startup reconciliation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, trace, warn};

use modbot_scheduler::Scheduler;
use modbot_storage::{InfractionQuery, ModBotStore};
use modbot_types::{
    AuditEvent, AuditSink, GatewayError, GuildGateway, Infraction, InfractionKind, NewInfraction,
    NotificationSink,
};

use crate::{ModerationConfig, ModerationError};

/// Reserved scheduler key for the recurring reconciliation pass. Record ids
/// are positive, so the sentinel can never collide.
pub const RECONCILE_KEY: i64 = -1;

/// A moderator's request to sanction a user.
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub kind: InfractionKind,
    pub user: u64,
    pub guild: u64,
    pub actor: u64,
    pub reason: Option<String>,
    pub hidden: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A moderator's change to an infraction's expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryEdit {
    /// Drop the expiry; the sanction holds until pardoned.
    Permanent,
    At(DateTime<Utc>),
}

/// A moderator's changes to an existing infraction; `None` fields keep
/// their current value. At least one field must be set.
#[derive(Debug, Clone, Default)]
pub struct InfractionEdit {
    pub reason: Option<String>,
    pub expiry: Option<ExpiryEdit>,
}

/// The result of a successful apply.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub infraction: Infraction,
    /// Whether the subject was DMed; `None` when the infraction is hidden
    /// and no DM was attempted.
    pub dm_sent: Option<bool>,
}

/// What a deactivation accomplished, beyond the guaranteed `active = false`
/// transition. Collaborator failures live here as text, never as errors.
#[derive(Debug, Clone, Default)]
pub struct DeactivationReport {
    /// Human-readable description of a reversal failure, if any.
    pub failure: Option<String>,
    /// Informational notes, e.g. the subject had already left.
    pub note: Option<String>,
    /// Whether a pardon DM was delivered; `None` when not attempted.
    pub dm_sent: Option<bool>,
}

#[derive(Debug, Clone)]
pub enum PardonOutcome {
    /// No active record of the requested kind exists for the user.
    NotFound,
    Pardoned {
        infraction: Infraction,
        report: DeactivationReport,
    },
}

/// Drives the sanction state machine: created → ACTIVE → INACTIVE, with
/// one-shot kinds (kick, warning, note) born INACTIVE.
pub struct InfractionService {
    store: Arc<ModBotStore>,
    scheduler: Scheduler<i64>,
    gateway: Arc<dyn GuildGateway>,
    notifier: Arc<dyn NotificationSink>,
    audit: Arc<dyn AuditSink>,
    config: ModerationConfig,
}

impl InfractionService {
    pub fn new(
        store: Arc<ModBotStore>,
        scheduler: Scheduler<i64>,
        gateway: Arc<dyn GuildGateway>,
        notifier: Arc<dyn NotificationSink>,
        audit: Arc<dyn AuditSink>,
        config: ModerationConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            scheduler,
            gateway,
            notifier,
            audit,
            config,
        })
    }

    /// Apply a sanction: persist the record, notify the subject, execute
    /// the side effect and schedule expiry.
    ///
    /// A failed side effect rolls the record back; a failed apply leaves no
    /// trace and must be re-invoked by a new moderator action.
    pub async fn apply(self: &Arc<Self>, request: ApplyRequest) -> Result<ApplyOutcome, ModerationError> {
        if request.user == request.actor {
            return Err(ModerationError::SelfTarget(request.kind));
        }
        if request.kind.has_active_state() {
            if let Some(existing) = self
                .store
                .active_infraction(request.kind, request.user, request.guild)
                .await?
            {
                debug!(
                    kind = %request.kind,
                    user = request.user,
                    existing = existing.id,
                    "declining apply; an active record already exists"
                );
                return Err(ModerationError::AlreadyActive {
                    kind: request.kind,
                    id: existing.id,
                });
            }
        }

        let infraction = self
            .store
            .create_infraction(NewInfraction {
                kind: request.kind,
                user: request.user,
                guild: request.guild,
                actor: request.actor,
                reason: request.reason,
                hidden: request.hidden,
                expires_at: request.expires_at,
            })
            .await?;
        trace!(id = infraction.id, kind = %infraction.kind, "applying infraction");

        // DM before the side effect: once a ban or kick lands, the subject
        // no longer shares a guild with the bot and cannot be reached.
        let mut dm_sent = None;
        if !infraction.hidden {
            let delivered = self
                .notifier
                .notify_sanction(infraction.user, &infraction)
                .await;
            if !delivered {
                debug!(id = infraction.id, user = infraction.user, "sanction DM not delivered");
            }
            dm_sent = Some(delivered);
        }

        if let Err(err) = self.execute_side_effect(&infraction).await {
            match &err {
                GatewayError::Forbidden => warn!(
                    id = infraction.id,
                    kind = %infraction.kind,
                    "failed to apply infraction: bot lacks permissions"
                ),
                GatewayError::NotFound => info!(
                    id = infraction.id,
                    kind = %infraction.kind,
                    user = infraction.user,
                    "cannot apply infraction: subject left the guild"
                ),
                GatewayError::Other(msg) => error!(
                    id = infraction.id,
                    kind = %infraction.kind,
                    "failed to apply infraction: {msg}"
                ),
            }

            let rollback_failed = match self.store.delete_infraction(infraction.id).await {
                Ok(_) => {
                    trace!(id = infraction.id, "rolled back record for failed apply");
                    false
                }
                Err(del) => {
                    error!(
                        id = infraction.id,
                        "failed to delete record after failed apply: {del}"
                    );
                    true
                }
            };
            self.audit
                .record(AuditEvent::ApplyFailed {
                    kind: infraction.kind,
                    user: infraction.user,
                    error: err.to_string(),
                })
                .await;
            return Err(ModerationError::ApplyFailed {
                kind: infraction.kind,
                source: err,
                rollback_failed,
            });
        }

        if infraction.is_schedulable() {
            self.schedule_expiration(&infraction);
        }

        info!(
            id = infraction.id,
            kind = %infraction.kind,
            user = infraction.user,
            "applied infraction"
        );
        self.audit
            .record(AuditEvent::Applied {
                infraction: infraction.clone(),
                dm_sent,
            })
            .await;
        Ok(ApplyOutcome { infraction, dm_sent })
    }

    /// Prematurely end the active infraction of `kind` for a user.
    pub async fn pardon(
        &self,
        kind: InfractionKind,
        user: u64,
        guild: u64,
        notify: bool,
    ) -> Result<PardonOutcome, ModerationError> {
        let Some(infraction) = self.store.active_infraction(kind, user, guild).await? else {
            debug!(%kind, user, "no active infraction to pardon");
            return Ok(PardonOutcome::NotFound);
        };

        let report = self.deactivate(&infraction, notify).await?;
        if let Some(failure) = &report.failure {
            warn!(id = infraction.id, "pardon completed with failure: {failure}");
        } else {
            info!(id = infraction.id, %kind, user, "pardoned infraction");
        }
        self.audit
            .record(AuditEvent::Pardoned {
                infraction: infraction.clone(),
                failure: report.failure.clone(),
            })
            .await;
        Ok(PardonOutcome::Pardoned { infraction, report })
    }

    /// Edit an infraction's reason and/or expiry.
    ///
    /// Expiry edits are relative to the record's lifecycle, not just the
    /// stored field: changing it moves the expiry timer, and dropping it
    /// makes the sanction permanent. An expiry edit on an inactive record
    /// is declined; when a reason edit accompanies it, the reason is
    /// applied and only the expiry part is skipped.
    pub async fn edit(
        self: &Arc<Self>,
        id: i64,
        edit: InfractionEdit,
    ) -> Result<Infraction, ModerationError> {
        if edit.reason.is_none() && edit.expiry.is_none() {
            return Err(ModerationError::NothingToEdit);
        }
        let Some(existing) = self.store.get_infraction(id).await? else {
            return Err(ModerationError::NotFound(id));
        };

        let mut expiry = edit.expiry;
        if expiry.is_some() && !existing.active {
            if edit.reason.is_none() {
                return Err(ModerationError::InactiveExpiryEdit(id));
            }
            debug!(id, "skipping expiry edit on an inactive infraction");
            expiry = None;
        }

        let mut updated = existing.clone();
        if let Some(reason) = edit.reason {
            updated = self
                .store
                .update_infraction_reason(id, Some(reason))
                .await?
                .ok_or(ModerationError::NotFound(id))?;
        }
        if let Some(expiry) = expiry {
            let expires_at = match expiry {
                ExpiryEdit::Permanent => None,
                ExpiryEdit::At(when) => Some(when),
            };
            updated = self
                .store
                .update_infraction_expiry(id, expires_at)
                .await?
                .ok_or(ModerationError::NotFound(id))?;

            // A timer only exists if the record previously had an expiry.
            if existing.expires_at.is_some() {
                self.scheduler.cancel(&id);
            }
            if updated.is_schedulable() {
                self.schedule_expiration(&updated);
            }
            info!(
                id,
                expires_at = ?updated.expires_at,
                "moved infraction expiry"
            );
        }
        Ok(updated)
    }

    /// Infraction history matching the query, inactive records included.
    pub async fn search(&self, query: InfractionQuery) -> Result<Vec<Infraction>, ModerationError> {
        Ok(self.store.find_infractions(query).await?)
    }

    /// Reverse a sanction's side effect, mark the record inactive and drop
    /// its timer.
    ///
    /// The inactive transition and the timer cancellation happen no matter
    /// how the reversal went; collaborator failures only survive in the
    /// report text. Kinds without an active state are an invariant
    /// violation and mutate nothing.
    pub async fn deactivate(
        &self,
        infraction: &Infraction,
        notify: bool,
    ) -> Result<DeactivationReport, ModerationError> {
        if !infraction.kind.has_active_state() {
            return Err(ModerationError::NoActiveState(infraction.kind));
        }

        let mut report = DeactivationReport::default();
        trace!(id = infraction.id, kind = %infraction.kind, "deactivating infraction");

        match self.reverse_side_effect(infraction).await {
            Ok(()) => {}
            Err(GatewayError::NotFound) => {
                info!(
                    id = infraction.id,
                    user = infraction.user,
                    "subject already left the guild; nothing to reverse"
                );
                report.note = Some("subject left the guild".into());
            }
            Err(GatewayError::Forbidden) => {
                warn!(
                    id = infraction.id,
                    kind = %infraction.kind,
                    "failed to reverse infraction: bot lacks permissions"
                );
                report.failure = Some("the bot lacks permissions to reverse this sanction".into());
            }
            Err(GatewayError::Other(msg)) => {
                error!(
                    id = infraction.id,
                    kind = %infraction.kind,
                    "failed to reverse infraction: {msg}"
                );
                report.failure = Some(format!("platform error: {msg}"));
            }
        }

        if let Err(err) = self.store.set_infraction_inactive(infraction.id).await {
            error!(id = infraction.id, "failed to mark infraction inactive: {err}");
            report
                .failure
                .get_or_insert_with(|| format!("storage error: {err}"));
        }
        if infraction.expires_at.is_some() {
            // Idempotent even when this runs from the expiry task itself.
            self.scheduler.cancel(&infraction.id);
        }

        if notify && !infraction.hidden {
            report.dm_sent = Some(
                self.notifier
                    .notify_pardon(infraction.user, infraction.kind)
                    .await,
            );
        }
        Ok(report)
    }

    /// Re-establish a sanction after its subject rejoined the guild.
    ///
    /// With less than the configured floor remaining, the sanction is
    /// deactivated instead of reinstated for a few moments. Reapply
    /// failures are logged but never mutate the record; it still expires on
    /// schedule.
    pub async fn reapply(&self, infraction: &Infraction) -> Result<(), ModerationError> {
        if !infraction.active || !infraction.kind.has_active_state() {
            debug!(id = infraction.id, "nothing to reapply");
            return Ok(());
        }

        if let Some(expires_at) = infraction.expires_at {
            let remaining = expires_at - Utc::now();
            if remaining < Duration::seconds(self.config.reapply_floor_secs) {
                info!(
                    id = infraction.id,
                    "deactivating instead of reapplying; less than {}s remain",
                    self.config.reapply_floor_secs
                );
                self.deactivate(infraction, true).await?;
                return Ok(());
            }
        }

        match self.execute_side_effect(infraction).await {
            Ok(()) => info!(
                id = infraction.id,
                kind = %infraction.kind,
                user = infraction.user,
                "re-applied infraction upon rejoin"
            ),
            Err(GatewayError::NotFound) => info!(
                id = infraction.id,
                user = infraction.user,
                "cannot reapply infraction; subject left again"
            ),
            Err(err) => error!(
                id = infraction.id,
                kind = %infraction.kind,
                "failed to reapply infraction: {err}"
            ),
        }
        Ok(())
    }

    /// Reapply every still-active sanction for a rejoining subject.
    pub async fn reapply_for_user(&self, user: u64, guild: u64) -> Result<usize, ModerationError> {
        let infractions = self.store.active_infractions_for_user(user, guild).await?;
        let mut count = 0;
        for infraction in &infractions {
            if infraction.kind.has_active_state() {
                self.reapply(infraction).await?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Register the expiry timer for a schedulable record under its id.
    pub fn schedule_expiration(self: &Arc<Self>, infraction: &Infraction) {
        let Some(expires_at) = infraction.expires_at else {
            return;
        };
        let service = Arc::clone(self);
        let id = infraction.id;
        self.scheduler
            .schedule_at(expires_at, id, async move { service.expire(id).await });
    }

    /// Expiry callback. Re-fetches the record: the timer may race a pardon,
    /// so firing against an inactive or missing record is a no-op.
    async fn expire(&self, id: i64) {
        let infraction = match self.store.get_infraction(id).await {
            Ok(Some(infraction)) if infraction.active => infraction,
            Ok(_) => {
                debug!(id, "expiry fired for an inactive or missing infraction; nothing to do");
                return;
            }
            Err(err) => {
                error!(id, "failed to load infraction at expiry: {err}");
                return;
            }
        };

        match self.deactivate(&infraction, true).await {
            Ok(report) => {
                info!(id, kind = %infraction.kind, "infraction expired");
                self.audit
                    .record(AuditEvent::Expired {
                        infraction,
                        failure: report.failure,
                    })
                    .await;
            }
            Err(err) => error!(id, "failed to deactivate expired infraction: {err}"),
        }
    }

    /// Startup reconciliation: rebuild expiry timers from the store.
    ///
    /// Overdue records fire promptly through the normal scheduling path.
    /// The pass re-registers itself at the latest expiry it scheduled, so
    /// records created while it was in flight are picked up by the next
    /// pass. Returns how many records were scheduled.
    pub fn reconcile(
        self: &Arc<Self>,
    ) -> Pin<Box<dyn Future<Output = Result<usize, ModerationError>> + Send + 'static>> {
        let this = Arc::clone(self);
        Box::pin(async move { this.reconcile_inner().await })
    }

    async fn reconcile_inner(self: &Arc<Self>) -> Result<usize, ModerationError> {
        let infractions = self.store.schedulable_infractions().await?;
        let to_schedule: Vec<Infraction> = infractions
            .into_iter()
            .filter(|infraction| !self.scheduler.contains(&infraction.id))
            .collect();

        for infraction in &to_schedule {
            trace!(id = infraction.id, "scheduling expiration");
            self.schedule_expiration(infraction);
        }

        if let Some(latest) = to_schedule.iter().filter_map(|i| i.expires_at).max() {
            // Just after the last expiry, so its deactivation has landed and
            // the pass cannot re-schedule a record that is mid-expiry.
            let next_pass = latest + Duration::seconds(1);
            debug!(%next_pass, "scheduling follow-up reconciliation pass");
            let service = Arc::clone(self);
            self.scheduler.schedule_at(next_pass, RECONCILE_KEY, async move {
                if let Err(err) = Box::pin(service.reconcile()).await {
                    error!("infraction reconciliation pass failed: {err}");
                }
            });
        }

        debug!(count = to_schedule.len(), "infraction reconciliation complete");
        Ok(to_schedule.len())
    }

    /// Drop every pending timer. Used at subsystem shutdown; the store is
    /// untouched and a later reconciliation pass restores the timers.
    pub fn shutdown(&self) {
        self.scheduler.cancel_all();
    }

    async fn execute_side_effect(&self, infraction: &Infraction) -> Result<(), GatewayError> {
        let reason = infraction.reason.as_deref();
        match infraction.kind {
            InfractionKind::Ban => {
                self.gateway
                    .ban(infraction.guild, infraction.user, reason)
                    .await
            }
            InfractionKind::Kick => {
                self.gateway
                    .kick(infraction.guild, infraction.user, reason)
                    .await
            }
            InfractionKind::Mute => {
                self.gateway
                    .add_mute_role(infraction.guild, infraction.user)
                    .await
            }
            InfractionKind::VoiceBan => {
                self.gateway
                    .revoke_voice(infraction.guild, infraction.user)
                    .await
            }
            // Nothing platform-side to do; the record is the sanction.
            InfractionKind::Warning | InfractionKind::Note => Ok(()),
        }
    }

    /// Per-kind reversal table. Callers guarantee the kind has an active
    /// state.
    async fn reverse_side_effect(&self, infraction: &Infraction) -> Result<(), GatewayError> {
        match infraction.kind {
            InfractionKind::Ban => self.gateway.unban(infraction.guild, infraction.user).await,
            InfractionKind::Mute => {
                self.gateway
                    .remove_mute_role(infraction.guild, infraction.user)
                    .await
            }
            InfractionKind::VoiceBan => {
                self.gateway
                    .restore_voice(infraction.guild, infraction.user)
                    .await
            }
            InfractionKind::Kick | InfractionKind::Warning | InfractionKind::Note => {
                unreachable!("deactivate rejects kinds without an active state")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;

    /// Shared call log so tests can assert cross-collaborator ordering.
    type CallLog = Arc<Mutex<Vec<String>>>;

    struct FakeGateway {
        calls: CallLog,
        fail_with: Mutex<Option<GatewayError>>,
    }

    impl FakeGateway {
        fn new(calls: CallLog) -> Arc<Self> {
            Arc::new(Self {
                calls,
                fail_with: Mutex::new(None),
            })
        }

        fn fail_with(&self, err: GatewayError) {
            *self.fail_with.lock().unwrap() = Some(err);
        }

        fn hit(&self, what: &str, user: u64) -> Result<(), GatewayError> {
            self.calls.lock().unwrap().push(format!("{what}:{user}"));
            match self.fail_with.lock().unwrap().clone() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        fn count(&self, what: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.starts_with(what))
                .count()
        }
    }

    #[async_trait]
    impl GuildGateway for FakeGateway {
        async fn ban(&self, _: u64, user: u64, _: Option<&str>) -> Result<(), GatewayError> {
            self.hit("ban", user)
        }
        async fn unban(&self, _: u64, user: u64) -> Result<(), GatewayError> {
            self.hit("unban", user)
        }
        async fn kick(&self, _: u64, user: u64, _: Option<&str>) -> Result<(), GatewayError> {
            self.hit("kick", user)
        }
        async fn add_mute_role(&self, _: u64, user: u64) -> Result<(), GatewayError> {
            self.hit("add_mute_role", user)
        }
        async fn remove_mute_role(&self, _: u64, user: u64) -> Result<(), GatewayError> {
            self.hit("remove_mute_role", user)
        }
        async fn revoke_voice(&self, _: u64, user: u64) -> Result<(), GatewayError> {
            self.hit("revoke_voice", user)
        }
        async fn restore_voice(&self, _: u64, user: u64) -> Result<(), GatewayError> {
            self.hit("restore_voice", user)
        }
    }

    struct FakeNotifier {
        calls: CallLog,
        deliverable: AtomicBool,
    }

    impl FakeNotifier {
        fn new(calls: CallLog) -> Arc<Self> {
            Arc::new(Self {
                calls,
                deliverable: AtomicBool::new(true),
            })
        }
    }

    #[async_trait]
    impl NotificationSink for FakeNotifier {
        async fn notify_sanction(&self, user: u64, _: &Infraction) -> bool {
            self.calls.lock().unwrap().push(format!("dm_sanction:{user}"));
            self.deliverable.load(Ordering::SeqCst)
        }
        async fn notify_pardon(&self, user: u64, _: InfractionKind) -> bool {
            self.calls.lock().unwrap().push(format!("dm_pardon:{user}"));
            self.deliverable.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct FakeAudit {
        events: Mutex<Vec<AuditEvent>>,
    }

    #[async_trait]
    impl AuditSink for FakeAudit {
        async fn record(&self, event: AuditEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    struct Harness {
        service: Arc<InfractionService>,
        store: Arc<ModBotStore>,
        scheduler: Scheduler<i64>,
        gateway: Arc<FakeGateway>,
        audit: Arc<FakeAudit>,
        calls: CallLog,
    }

    fn harness() -> Harness {
        let calls: CallLog = Arc::default();
        let store = Arc::new(ModBotStore::open_in_memory().unwrap());
        let scheduler = Scheduler::new("InfractionService");
        let gateway = FakeGateway::new(calls.clone());
        let notifier = FakeNotifier::new(calls.clone());
        let audit = Arc::new(FakeAudit::default());
        let service = InfractionService::new(
            store.clone(),
            scheduler.clone(),
            gateway.clone(),
            notifier,
            audit.clone(),
            ModerationConfig::default(),
        );
        Harness {
            service,
            store,
            scheduler,
            gateway,
            audit,
            calls,
        }
    }

    fn mute_request(user: u64, expires_at: Option<chrono::DateTime<Utc>>) -> ApplyRequest {
        ApplyRequest {
            kind: InfractionKind::Mute,
            user,
            guild: 500,
            actor: 900,
            reason: Some("spamming".into()),
            hidden: false,
            expires_at,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn temporary_mute_expires_with_one_reversal() {
        let h = harness();
        let expiry = Utc::now() + Duration::seconds(90);
        let outcome = h.service.apply(mute_request(1, Some(expiry))).await.unwrap();

        assert_eq!(outcome.dm_sent, Some(true));
        assert!(h.scheduler.contains(&outcome.infraction.id));
        let stored = h
            .store
            .get_infraction(outcome.infraction.id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.active);

        tokio::time::sleep(StdDuration::from_secs(120)).await;

        let stored = h
            .store
            .get_infraction(outcome.infraction.id)
            .await
            .unwrap()
            .unwrap();
        assert!(!stored.active);
        assert_eq!(h.gateway.count("remove_mute_role"), 1);
        assert!(!h.scheduler.contains(&outcome.infraction.id));

        let events = h.audit.events.lock().unwrap();
        assert!(matches!(events.last(), Some(AuditEvent::Expired { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn dm_attempted_before_side_effect() {
        let h = harness();
        h.service
            .apply(ApplyRequest {
                kind: InfractionKind::Ban,
                ..mute_request(1, None)
            })
            .await
            .unwrap();

        let calls = h.calls.lock().unwrap();
        assert_eq!(*calls, vec!["dm_sanction:1".to_string(), "ban:1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_infraction_skips_dm() {
        let h = harness();
        let outcome = h
            .service
            .apply(ApplyRequest {
                hidden: true,
                ..mute_request(1, None)
            })
            .await
            .unwrap();

        assert_eq!(outcome.dm_sent, None);
        assert_eq!(h.gateway.count("add_mute_role"), 1);
        assert!(h.calls.lock().unwrap().iter().all(|c| !c.starts_with("dm_")));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_apply_rolls_back_record() {
        let h = harness();
        h.gateway.fail_with(GatewayError::Forbidden);

        let err = h
            .service
            .apply(mute_request(1, Some(Utc::now() + Duration::hours(1))))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ModerationError::ApplyFailed {
                source: GatewayError::Forbidden,
                rollback_failed: false,
                ..
            }
        ));

        // Failed application leaves no trace and no timer.
        assert!(
            h.store
                .active_infraction(InfractionKind::Mute, 1, 500)
                .await
                .unwrap()
                .is_none()
        );
        assert!(h.scheduler.is_empty());
        let events = h.audit.events.lock().unwrap();
        assert!(matches!(events.last(), Some(AuditEvent::ApplyFailed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn pardon_without_active_record_is_clean() {
        let h = harness();
        let outcome = h
            .service
            .pardon(InfractionKind::Mute, 1, 500, true)
            .await
            .unwrap();

        assert!(matches!(outcome, PardonOutcome::NotFound));
        assert!(h.calls.lock().unwrap().is_empty());
        assert!(h.audit.events.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pardon_cancels_expiry_timer() {
        let h = harness();
        let outcome = h
            .service
            .apply(mute_request(1, Some(Utc::now() + Duration::hours(1))))
            .await
            .unwrap();

        let pardon = h
            .service
            .pardon(InfractionKind::Mute, 1, 500, true)
            .await
            .unwrap();
        let PardonOutcome::Pardoned { report, .. } = pardon else {
            panic!("expected a pardoned outcome");
        };
        assert!(report.failure.is_none());
        assert_eq!(report.dm_sent, Some(true));
        assert!(!h.scheduler.contains(&outcome.infraction.id));

        // Well past the original expiry: no second reversal.
        tokio::time::sleep(StdDuration::from_secs(7200)).await;
        assert_eq!(h.gateway.count("remove_mute_role"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deactivate_proceeds_when_subject_left() {
        let h = harness();
        let outcome = h
            .service
            .apply(mute_request(1, Some(Utc::now() + Duration::hours(1))))
            .await
            .unwrap();

        h.gateway.fail_with(GatewayError::NotFound);
        let report = h
            .service
            .deactivate(&outcome.infraction, false)
            .await
            .unwrap();

        // Departure is a note, not a failure; the record still goes inactive.
        assert!(report.failure.is_none());
        assert_eq!(report.note.as_deref(), Some("subject left the guild"));
        let stored = h
            .store
            .get_infraction(outcome.infraction.id)
            .await
            .unwrap()
            .unwrap();
        assert!(!stored.active);
    }

    #[tokio::test(start_paused = true)]
    async fn deactivate_forbidden_still_goes_inactive() {
        let h = harness();
        let outcome = h
            .service
            .apply(mute_request(1, Some(Utc::now() + Duration::hours(1))))
            .await
            .unwrap();

        h.gateway.fail_with(GatewayError::Forbidden);
        let report = h
            .service
            .deactivate(&outcome.infraction, false)
            .await
            .unwrap();

        assert!(report.failure.is_some());
        let stored = h
            .store
            .get_infraction(outcome.infraction.id)
            .await
            .unwrap()
            .unwrap();
        assert!(!stored.active);
        assert!(!h.scheduler.contains(&outcome.infraction.id));
    }

    #[tokio::test(start_paused = true)]
    async fn deactivating_one_shot_kind_is_invariant_violation() {
        let h = harness();
        let outcome = h
            .service
            .apply(ApplyRequest {
                kind: InfractionKind::Warning,
                ..mute_request(1, None)
            })
            .await
            .unwrap();
        assert!(!outcome.infraction.active);

        let err = h
            .service
            .deactivate(&outcome.infraction, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ModerationError::NoActiveState(InfractionKind::Warning)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn second_apply_of_same_kind_declined() {
        let h = harness();
        let first = h
            .service
            .apply(mute_request(1, Some(Utc::now() + Duration::hours(1))))
            .await
            .unwrap();

        // Declined regardless of whether the new request is permanent.
        let err = h.service.apply(mute_request(1, None)).await.unwrap_err();
        assert!(matches!(
            err,
            ModerationError::AlreadyActive { id, .. } if id == first.infraction.id
        ));
        assert_eq!(h.gateway.count("add_mute_role"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn self_target_rejected() {
        let h = harness();
        let err = h
            .service
            .apply(ApplyRequest {
                user: 900,
                actor: 900,
                ..mute_request(900, None)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ModerationError::SelfTarget(_)));
        assert!(h.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_edit_moves_the_timer() {
        let h = harness();
        let outcome = h
            .service
            .apply(mute_request(1, Some(Utc::now() + Duration::seconds(60))))
            .await
            .unwrap();
        let id = outcome.infraction.id;

        let updated = h
            .service
            .edit(
                id,
                InfractionEdit {
                    expiry: Some(ExpiryEdit::At(Utc::now() + Duration::seconds(600))),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(updated.expires_at > outcome.infraction.expires_at);

        // Nothing fires at the original expiry.
        tokio::time::sleep(StdDuration::from_secs(120)).await;
        assert_eq!(h.gateway.count("remove_mute_role"), 0);
        assert!(h.store.get_infraction(id).await.unwrap().unwrap().active);

        tokio::time::sleep(StdDuration::from_secs(600)).await;
        assert_eq!(h.gateway.count("remove_mute_role"), 1);
        assert!(!h.store.get_infraction(id).await.unwrap().unwrap().active);
    }

    #[tokio::test(start_paused = true)]
    async fn edit_to_permanent_cancels_the_timer() {
        let h = harness();
        let outcome = h
            .service
            .apply(mute_request(1, Some(Utc::now() + Duration::seconds(60))))
            .await
            .unwrap();
        let id = outcome.infraction.id;

        let updated = h
            .service
            .edit(
                id,
                InfractionEdit {
                    expiry: Some(ExpiryEdit::Permanent),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(updated.permanent);
        assert!(updated.expires_at.is_none());
        assert!(!h.scheduler.contains(&id));

        tokio::time::sleep(StdDuration::from_secs(3600)).await;
        assert!(h.store.get_infraction(id).await.unwrap().unwrap().active);
        assert_eq!(h.gateway.count("remove_mute_role"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reason_edit_leaves_timer_alone() {
        let h = harness();
        let outcome = h
            .service
            .apply(mute_request(1, Some(Utc::now() + Duration::seconds(60))))
            .await
            .unwrap();
        let id = outcome.infraction.id;

        let updated = h
            .service
            .edit(
                id,
                InfractionEdit {
                    reason: Some("repeat offender".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.reason.as_deref(), Some("repeat offender"));
        assert_eq!(updated.expires_at, outcome.infraction.expires_at);

        tokio::time::sleep(StdDuration::from_secs(90)).await;
        assert_eq!(h.gateway.count("remove_mute_role"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_edit_on_inactive_record_declined() {
        let h = harness();
        let outcome = h
            .service
            .apply(mute_request(1, Some(Utc::now() + Duration::seconds(30))))
            .await
            .unwrap();
        let id = outcome.infraction.id;
        tokio::time::sleep(StdDuration::from_secs(60)).await;

        // Expiry alone is an error; with a reason, the reason still lands.
        let err = h
            .service
            .edit(
                id,
                InfractionEdit {
                    expiry: Some(ExpiryEdit::At(Utc::now() + Duration::hours(1))),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ModerationError::InactiveExpiryEdit(got) if got == id));

        let updated = h
            .service
            .edit(
                id,
                InfractionEdit {
                    reason: Some("appealed".into()),
                    expiry: Some(ExpiryEdit::At(Utc::now() + Duration::hours(1))),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.reason.as_deref(), Some("appealed"));
        assert!(!updated.active);
        assert_eq!(updated.expires_at, outcome.infraction.expires_at);
        assert!(!h.scheduler.contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_edit_rejected() {
        let h = harness();
        let outcome = h.service.apply(mute_request(1, None)).await.unwrap();

        let err = h
            .service
            .edit(outcome.infraction.id, InfractionEdit::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ModerationError::NothingToEdit));

        let err = h
            .service
            .edit(
                9999,
                InfractionEdit {
                    reason: Some("ghost".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ModerationError::NotFound(9999)));
    }

    #[tokio::test(start_paused = true)]
    async fn search_reaches_expired_history() {
        let h = harness();
        let outcome = h
            .service
            .apply(mute_request(1, Some(Utc::now() + Duration::seconds(30))))
            .await
            .unwrap();
        h.service
            .apply(ApplyRequest {
                kind: InfractionKind::Warning,
                ..mute_request(1, None)
            })
            .await
            .unwrap();
        tokio::time::sleep(StdDuration::from_secs(60)).await;

        // The expired mute is gone from the active view but not the history.
        assert!(
            h.store
                .active_infraction(InfractionKind::Mute, 1, 500)
                .await
                .unwrap()
                .is_none()
        );
        let history = h
            .service
            .search(InfractionQuery {
                user: Some(1),
                guild: Some(500),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(history.len(), 2);

        let expired = h
            .service
            .search(InfractionQuery {
                kind: Some(InfractionKind::Mute),
                active: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(
            expired.iter().map(|i| i.id).collect::<Vec<_>>(),
            vec![outcome.infraction.id]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reapply_with_little_time_left_deactivates() {
        let h = harness();
        // Seed the store directly, as reconciliation would after a restart.
        let infraction = h
            .store
            .create_infraction(NewInfraction {
                kind: InfractionKind::Mute,
                user: 1,
                guild: 500,
                actor: 900,
                reason: None,
                hidden: false,
                expires_at: Some(Utc::now() + Duration::seconds(30)),
            })
            .await
            .unwrap();

        h.service.reapply(&infraction).await.unwrap();

        assert_eq!(h.gateway.count("add_mute_role"), 0);
        assert_eq!(h.gateway.count("remove_mute_role"), 1);
        let stored = h.store.get_infraction(infraction.id).await.unwrap().unwrap();
        assert!(!stored.active);
    }

    #[tokio::test(start_paused = true)]
    async fn reapply_reinstates_side_effect() {
        let h = harness();
        let infraction = h
            .store
            .create_infraction(NewInfraction {
                kind: InfractionKind::Mute,
                user: 1,
                guild: 500,
                actor: 900,
                reason: None,
                hidden: false,
                expires_at: Some(Utc::now() + Duration::hours(1)),
            })
            .await
            .unwrap();

        h.service.reapply_for_user(1, 500).await.unwrap();

        assert_eq!(h.gateway.count("add_mute_role"), 1);
        let stored = h.store.get_infraction(infraction.id).await.unwrap().unwrap();
        assert!(stored.active);
    }

    #[tokio::test(start_paused = true)]
    async fn reapply_failure_leaves_record_untouched() {
        let h = harness();
        let infraction = h
            .store
            .create_infraction(NewInfraction {
                kind: InfractionKind::Mute,
                user: 1,
                guild: 500,
                actor: 900,
                reason: None,
                hidden: false,
                expires_at: Some(Utc::now() + Duration::hours(1)),
            })
            .await
            .unwrap();

        h.gateway.fail_with(GatewayError::Other("rate limited".into()));
        h.service.reapply(&infraction).await.unwrap();

        let stored = h.store.get_infraction(infraction.id).await.unwrap().unwrap();
        assert!(stored.active);
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_schedules_future_and_fires_overdue() {
        let h = harness();
        let now = Utc::now();

        let overdue = h
            .store
            .create_infraction(NewInfraction {
                kind: InfractionKind::Mute,
                user: 1,
                guild: 500,
                actor: 900,
                reason: None,
                hidden: false,
                expires_at: Some(now - Duration::seconds(10)),
            })
            .await
            .unwrap();
        let future = h
            .store
            .create_infraction(NewInfraction {
                kind: InfractionKind::VoiceBan,
                user: 2,
                guild: 500,
                actor: 900,
                reason: None,
                hidden: false,
                expires_at: Some(now + Duration::seconds(300)),
            })
            .await
            .unwrap();
        // Permanent: never scheduled.
        h.store
            .create_infraction(NewInfraction {
                kind: InfractionKind::Ban,
                user: 3,
                guild: 500,
                actor: 900,
                reason: None,
                hidden: false,
                expires_at: None,
            })
            .await
            .unwrap();

        let scheduled = h.service.reconcile().await.unwrap();
        assert_eq!(scheduled, 2);
        assert!(h.scheduler.contains(&RECONCILE_KEY));

        // The overdue record fires promptly.
        tokio::time::sleep(StdDuration::from_secs(1)).await;
        let stored = h.store.get_infraction(overdue.id).await.unwrap().unwrap();
        assert!(!stored.active);
        assert_eq!(h.gateway.count("remove_mute_role"), 1);

        // The future record fires at its exact expiry, and the follow-up
        // pass finds nothing left to do.
        tokio::time::sleep(StdDuration::from_secs(600)).await;
        let stored = h.store.get_infraction(future.id).await.unwrap().unwrap();
        assert!(!stored.active);
        assert_eq!(h.gateway.count("restore_voice"), 1);
        assert!(h.scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_many_without_duplicates_or_drops() {
        let h = harness();
        let now = Utc::now();
        let total = 25;

        for user in 0..total {
            h.store
                .create_infraction(NewInfraction {
                    kind: InfractionKind::Mute,
                    user,
                    guild: 500,
                    actor: 900,
                    reason: None,
                    hidden: false,
                    // A mix of overdue and future expiries.
                    expires_at: Some(now + Duration::seconds(user as i64 * 17 - 60)),
                })
                .await
                .unwrap();
        }

        let scheduled = h.service.reconcile().await.unwrap();
        assert_eq!(scheduled, total as usize);

        // Running again while everything is pending schedules nothing new.
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        let again = h.service.reconcile().await.unwrap();
        assert_eq!(again, 0);

        tokio::time::sleep(StdDuration::from_secs(3600)).await;
        assert_eq!(h.gateway.count("remove_mute_role"), total as usize);
        assert!(h.scheduler.is_empty());
    }
}
