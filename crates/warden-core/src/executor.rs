//! Panel state transitions: deactivate, reactivate, delete.
//!
//! Every entry point takes the per-panel lock first and reloads the panel under
//! it. Panel-level remote calls happen before any local state change; when the
//! local commit fails afterwards the remote side is compensated. Sub-account
//! calls are best effort and reported individually.

use std::{sync::Arc, time::Duration};

use chrono::Utc;

use crate::{
    audit::{AuditEvent, AuditLogger},
    credentials::DeactivationCredential,
    domain::{DeactivationCommit, Panel, PanelId, PanelState, Secret, SubAccountStatus, UserId},
    errors::Error,
    events::{
        DeactivationReason, DeactivationReport, DeletionReport, EngineEvent, PanelRef,
        ReactivationReport, SubAccountAction, SubAccountReport,
    },
    locks::PanelLocks,
    ports::{Notifier, PanelStore, RemotePanelClient},
    sessions::SessionPool,
    traffic::TrafficTracker,
    Result,
};

/// How a staged credential rotation left behind by an interrupted
/// deactivation was resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RotationRecovery {
    NothingStaged,
    /// The remote never took the replacement; the staged values were dropped.
    NotApplied,
    /// The replacement had been applied; the original credential is back.
    RolledBack,
}

/// Outcome of reactivating every deactivated panel of one operator.
#[derive(Debug, Default)]
pub struct OperatorReactivation {
    pub reactivated: Vec<ReactivationReport>,
    pub failed: Vec<(PanelRef, String)>,
}

pub struct Executor {
    store: Arc<dyn PanelStore>,
    sessions: Arc<SessionPool>,
    locks: Arc<PanelLocks>,
    traffic: TrafficTracker,
    notifier: Arc<dyn Notifier>,
    audit: Option<AuditLogger>,
    credential: DeactivationCredential,
    call_delay: Duration,
}

impl Executor {
    pub fn new(
        store: Arc<dyn PanelStore>,
        sessions: Arc<SessionPool>,
        locks: Arc<PanelLocks>,
        notifier: Arc<dyn Notifier>,
        credential: DeactivationCredential,
    ) -> Self {
        Self {
            traffic: TrafficTracker::new(store.clone()),
            store,
            sessions,
            locks,
            notifier,
            audit: None,
            credential,
            call_delay: Duration::ZERO,
        }
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Spacing between consecutive sub-account calls.
    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    pub fn credential(&self) -> &DeactivationCredential {
        &self.credential
    }

    // ============== Deactivation ==============

    /// Deactivate a panel. On an already deactivated panel only the
    /// sub-account step is re-applied (`repaired` in the report).
    pub async fn deactivate(
        &self,
        id: PanelId,
        reason: DeactivationReason,
        actor: Option<UserId>,
    ) -> Result<DeactivationReport> {
        let _guard = self.locks.lock_panel(id).await;
        let panel = self.load(id).await?;
        if !panel.is_active() {
            return self.repair_deactivated(panel, reason, actor).await;
        }
        self.deactivate_locked(panel, reason, actor).await
    }

    /// Deactivate only if the panel is still active once the lock is held.
    /// Returns `None` when a concurrent action got there first.
    pub async fn deactivate_if_active(
        &self,
        id: PanelId,
        reason: DeactivationReason,
    ) -> Result<Option<DeactivationReport>> {
        let _guard = self.locks.lock_panel(id).await;
        let panel = self.load(id).await?;
        if !panel.is_active() {
            tracing::debug!(panel = id.0, "already deactivated, skipping");
            return Ok(None);
        }
        self.deactivate_locked(panel, reason, None).await.map(Some)
    }

    async fn deactivate_locked(
        &self,
        panel: Panel,
        reason: DeactivationReason,
        actor: Option<UserId>,
    ) -> Result<DeactivationReport> {
        if panel.pending_password.is_some() {
            self.resolve_staged_rotation(&panel, actor).await?;
        }
        let original = panel.password.clone();
        let replacement = self.credential.next();

        self.store
            .stage_rotation(panel.id, &original, &replacement)
            .await?;

        if let Err(e) = self
            .rotate_credential(&panel.username, &original, &replacement)
            .await
        {
            if matches!(e, Error::RemoteUnreachable(_)) {
                // The password change may have landed. Both credentials stay
                // staged until a later check finds out which one works.
                tracing::warn!(
                    panel = %panel.username,
                    "credential rotation timed out; remote state unknown"
                );
            } else if let Err(clear_err) = self.store.clear_staged_rotation(panel.id).await {
                tracing::warn!(panel = %panel.username, error = %clear_err, "failed to clear staged credential");
            }
            self.emit_failure(&panel, "deactivation", &e, actor).await;
            return Err(e);
        }
        self.sessions.invalidate(&panel.username).await;

        let sub_accounts = self
            .apply_to_sub_accounts(&panel.username, &replacement, SubAccountAction::Disable)
            .await;

        let commit = DeactivationCommit {
            reason: reason.to_string(),
            at: Utc::now(),
            original_password: original.clone(),
            new_password: replacement.clone(),
        };
        if let Err(e) = self.store.commit_deactivation(panel.id, &commit).await {
            tracing::error!(panel = %panel.username, error = %e, "deactivation commit failed, compensating");
            return Err(self
                .compensate_deactivation(&panel, &original, &replacement, &sub_accounts, e, actor)
                .await);
        }

        let report = DeactivationReport {
            panel: PanelRef::from(&panel),
            reason,
            sub_accounts,
            repaired: false,
        };
        self.emit(EngineEvent::Deactivated(report.clone()), actor).await;
        Ok(report)
    }

    /// Undo a rotation whose local commit failed. Returns the error to surface.
    async fn compensate_deactivation(
        &self,
        panel: &Panel,
        original: &Secret,
        replacement: &Secret,
        disabled: &SubAccountReport,
        commit_err: Error,
        actor: Option<UserId>,
    ) -> Error {
        if let Err(e) = self
            .rotate_credential(&panel.username, replacement, original)
            .await
        {
            let err = Error::inconsistent(
                &panel.username,
                format!(
                    "local commit failed ({commit_err}) and restoring the remote credential failed ({})",
                    e.brief()
                ),
            );
            self.emit_inconsistent(panel, &err, actor).await;
            return err;
        }
        self.sessions.invalidate(&panel.username).await;

        let mut restored = SubAccountReport::new(SubAccountAction::Enable);
        if !disabled.succeeded.is_empty() {
            match self.sessions.fresh_session(&panel.username, original).await {
                Ok(session) => {
                    for name in &disabled.succeeded {
                        self.pace().await;
                        match session.set_user_enabled(name, true).await {
                            Ok(()) => restored.succeeded.push(name.clone()),
                            Err(e) => restored.failed.push((name.clone(), e.brief())),
                        }
                    }
                }
                Err(e) => restored.listing_error = Some(e.brief()),
            }
        }
        if let Err(e) = self.store.clear_staged_rotation(panel.id).await {
            tracing::warn!(panel = %panel.username, error = %e, "failed to clear staged credential");
        }
        if !restored.is_clean() {
            let err = Error::inconsistent(
                &panel.username,
                format!(
                    "local commit failed ({commit_err}); credential restored but {}",
                    restored.summary()
                ),
            );
            self.emit_inconsistent(panel, &err, actor).await;
            return err;
        }

        self.emit_failure(panel, "deactivation", &commit_err, actor)
            .await;
        commit_err
    }

    /// Settle a rotation left staged on an active panel by an interrupted
    /// deactivation: find out which credential the remote accepts and put the
    /// original back if the replacement had landed.
    pub async fn recover_interrupted_rotation(&self, id: PanelId) -> Result<RotationRecovery> {
        let _guard = self.locks.lock_panel(id).await;
        let panel = self.load(id).await?;
        if !panel.is_active() || panel.pending_password.is_none() {
            return Ok(RotationRecovery::NothingStaged);
        }
        self.resolve_staged_rotation(&panel, None).await
    }

    async fn resolve_staged_rotation(
        &self,
        panel: &Panel,
        actor: Option<UserId>,
    ) -> Result<RotationRecovery> {
        let (Some(original), Some(pending)) = (&panel.original_password, &panel.pending_password)
        else {
            return Ok(RotationRecovery::NothingStaged);
        };

        match self.sessions.check_credential(&panel.username, pending).await {
            Ok(()) => {
                if let Err(e) = self
                    .rotate_credential(&panel.username, pending, original)
                    .await
                {
                    self.emit_failure(panel, "credential recovery", &e, actor)
                        .await;
                    return Err(e);
                }
                self.sessions.invalidate(&panel.username).await;
                self.store.clear_staged_rotation(panel.id).await?;
                tracing::warn!(
                    panel = %panel.username,
                    "replacement credential had been applied; original restored"
                );
                Ok(RotationRecovery::RolledBack)
            }
            Err(e) if e.is_unauthorized() => {
                match self.sessions.check_credential(&panel.username, original).await {
                    Ok(()) => {
                        self.store.clear_staged_rotation(panel.id).await?;
                        tracing::info!(
                            panel = %panel.username,
                            "staged rotation never reached the remote; cleared"
                        );
                        Ok(RotationRecovery::NotApplied)
                    }
                    Err(e) if e.is_unauthorized() => {
                        let err = Error::inconsistent(
                            &panel.username,
                            "neither the stored nor the staged replacement credential is accepted",
                        );
                        self.emit_inconsistent(panel, &err, actor).await;
                        Err(err)
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn repair_deactivated(
        &self,
        panel: Panel,
        reason: DeactivationReason,
        actor: Option<UserId>,
    ) -> Result<DeactivationReport> {
        tracing::info!(panel = %panel.username, "panel already deactivated, re-disabling sub-accounts");
        let sub_accounts = self
            .apply_to_sub_accounts(&panel.username, &panel.password, SubAccountAction::Disable)
            .await;
        let report = DeactivationReport {
            panel: PanelRef::from(&panel),
            reason,
            sub_accounts,
            repaired: true,
        };
        self.emit(EngineEvent::Deactivated(report.clone()), actor).await;
        Ok(report)
    }

    // ============== Reactivation ==============

    pub async fn reactivate(&self, id: PanelId, actor: Option<UserId>) -> Result<ReactivationReport> {
        let _guard = self.locks.lock_panel(id).await;
        let panel = self.load(id).await?;
        if panel.is_active() {
            return Ok(ReactivationReport {
                panel: PanelRef::from(&panel),
                sub_accounts: SubAccountReport::new(SubAccountAction::Enable),
                already_active: true,
            });
        }

        let Some(original) = panel.original_password.clone() else {
            let err = Error::inconsistent(
                &panel.username,
                "deactivated panel has no stored original credential",
            );
            self.emit_inconsistent(&panel, &err, actor).await;
            return Err(err);
        };

        if let Err(e) = self
            .rotate_credential(&panel.username, &panel.password, &original)
            .await
        {
            // An earlier attempt may have restored the original remotely and
            // then lost its response.
            let restored = e.is_unauthorized()
                && self
                    .sessions
                    .check_credential(&panel.username, &original)
                    .await
                    .is_ok();
            if !restored {
                self.emit_failure(&panel, "reactivation", &e, actor).await;
                return Err(e);
            }
            tracing::warn!(panel = %panel.username, "original credential already restored remotely");
        }
        self.sessions.invalidate(&panel.username).await;

        if let Err(commit_err) = self.store.commit_reactivation(panel.id, &original).await {
            tracing::error!(panel = %panel.username, error = %commit_err, "reactivation commit failed, compensating");
            if let Err(e) = self
                .rotate_credential(&panel.username, &original, &panel.password)
                .await
            {
                let err = Error::inconsistent(
                    &panel.username,
                    format!(
                        "local commit failed ({commit_err}) and rotating the credential back failed ({})",
                        e.brief()
                    ),
                );
                self.emit_inconsistent(&panel, &err, actor).await;
                return Err(err);
            }
            self.sessions.invalidate(&panel.username).await;
            self.emit_failure(&panel, "reactivation", &commit_err, actor)
                .await;
            return Err(commit_err);
        }

        let sub_accounts = self
            .apply_to_sub_accounts(&panel.username, &original, SubAccountAction::Enable)
            .await;
        let report = ReactivationReport {
            panel: PanelRef::from(&panel),
            sub_accounts,
            already_active: false,
        };
        self.emit(EngineEvent::Reactivated(report.clone()), actor).await;
        Ok(report)
    }

    /// Reactivate every deactivated panel owned by `operator`, one at a time.
    pub async fn reactivate_operator(
        &self,
        operator: UserId,
        actor: Option<UserId>,
    ) -> Result<OperatorReactivation> {
        let panels = self.store.operator_panels(operator).await?;
        let mut out = OperatorReactivation::default();
        for panel in panels.iter().filter(|p| p.state == PanelState::Deactivated) {
            match self.reactivate(panel.id, actor).await {
                Ok(report) if report.already_active => {}
                Ok(report) => out.reactivated.push(report),
                Err(e) => out.failed.push((PanelRef::from(panel), e.to_string())),
            }
        }
        Ok(out)
    }

    // ============== Deletion ==============

    /// Delete every sub-account (preserving its traffic first), then the
    /// remote admin, then the local record. Any sub-account failure stops
    /// before the panel-level step so the deletion can be retried.
    pub async fn delete_panel(&self, id: PanelId, actor: Option<UserId>) -> Result<DeletionReport> {
        let guard = self.locks.lock_panel(id).await;
        let panel = self.load(id).await?;

        let session = match self
            .sessions
            .fresh_session(&panel.username, &panel.password)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                self.emit_failure(&panel, "deletion", &e, actor).await;
                return Err(e);
            }
        };
        let users = match session.fetch_users(&panel.username).await {
            Ok(u) => u,
            Err(e) => {
                self.emit_failure(&panel, "deletion", &e, actor).await;
                return Err(e);
            }
        };

        let mut sub_accounts = SubAccountReport::new(SubAccountAction::Delete);
        let mut preserved_traffic = 0u64;
        for (i, user) in users.iter().enumerate() {
            if i > 0 {
                self.pace().await;
            }
            let amount = user.consumed_traffic();
            if let Err(e) = self.traffic.preserve(panel.id, amount).await {
                sub_accounts
                    .failed
                    .push((user.username.clone(), format!("traffic not preserved: {e}")));
                continue;
            }
            preserved_traffic = preserved_traffic.saturating_add(amount);
            match session.delete_user(&user.username).await {
                Ok(()) => sub_accounts.succeeded.push(user.username.clone()),
                Err(e) => sub_accounts.failed.push((user.username.clone(), e.brief())),
            }
        }

        if !sub_accounts.is_clean() {
            let err = Error::Incomplete(format!(
                "panel {} kept: {}",
                panel.username,
                sub_accounts.summary()
            ));
            self.emit_failure(&panel, "deletion", &err, actor).await;
            return Err(err);
        }

        let admin_result = match self
            .sessions
            .fresh_admin_session(&panel.username, &panel.password)
            .await
        {
            Ok(admin) => admin.delete_admin(&panel.username).await,
            Err(e) => Err(e),
        };
        if let Err(e) = admin_result {
            self.emit_failure(&panel, "deletion", &e, actor).await;
            return Err(e);
        }

        if let Err(e) = self.store.delete_panel(panel.id).await {
            let err = Error::inconsistent(
                &panel.username,
                format!("remote admin deleted but the local record remains ({e})"),
            );
            self.emit_inconsistent(&panel, &err, actor).await;
            return Err(err);
        }

        self.sessions.invalidate(&panel.username).await;
        drop(guard);
        self.locks.forget(panel.id).await;

        let report = DeletionReport {
            panel: PanelRef::from(&panel),
            sub_accounts,
            preserved_traffic,
        };
        self.emit(EngineEvent::Deleted(report.clone()), actor).await;
        Ok(report)
    }

    /// Delete one sub-account of a panel, preserving its traffic first.
    /// Returns the preserved amount.
    pub async fn delete_sub_account(
        &self,
        id: PanelId,
        sub_account: &str,
        actor: Option<UserId>,
    ) -> Result<u64> {
        let _guard = self.locks.lock_panel(id).await;
        let panel = self.load(id).await?;
        let session = self
            .sessions
            .fresh_session(&panel.username, &panel.password)
            .await?;
        let users = session.fetch_users(&panel.username).await?;
        let Some(user) = users.iter().find(|u| u.username == sub_account) else {
            return Err(Error::NotFound(format!(
                "sub-account {sub_account} under panel {}",
                panel.username
            )));
        };

        let amount = user.consumed_traffic();
        self.traffic.preserve(panel.id, amount).await?;
        session.delete_user(sub_account).await?;

        self.emit(
            EngineEvent::SubAccountDeleted {
                panel: PanelRef::from(&panel),
                sub_account: sub_account.to_string(),
                preserved_traffic: amount,
            },
            actor,
        )
        .await;
        Ok(amount)
    }

    // ============== Helpers ==============

    async fn load(&self, id: PanelId) -> Result<Panel> {
        self.store
            .panel(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("panel {id}")))
    }

    /// Change the panel's remote credential from `current` to `next`.
    async fn rotate_credential(&self, username: &str, current: &Secret, next: &Secret) -> Result<()> {
        let admin = self.sessions.fresh_admin_session(username, current).await?;
        admin.set_password(username, next, false).await
    }

    /// Authenticate as the panel with `password` and disable (or enable) every
    /// sub-account that needs it.
    async fn apply_to_sub_accounts(
        &self,
        username: &str,
        password: &Secret,
        action: SubAccountAction,
    ) -> SubAccountReport {
        let session = match self.sessions.fresh_session(username, password).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(panel = %username, error = %e, "could not open panel session");
                return SubAccountReport::listing_failed(action, e.brief());
            }
        };
        self.apply_with_session(session.as_ref(), username, action)
            .await
    }

    async fn apply_with_session(
        &self,
        session: &dyn RemotePanelClient,
        username: &str,
        action: SubAccountAction,
    ) -> SubAccountReport {
        let users = match session.fetch_users(username).await {
            Ok(u) => u,
            Err(e) => {
                tracing::warn!(panel = %username, error = %e, "could not list sub-accounts");
                return SubAccountReport::listing_failed(action, e.brief());
            }
        };
        let (wanted, enable) = match action {
            SubAccountAction::Enable => (SubAccountStatus::Disabled, true),
            _ => (SubAccountStatus::Active, false),
        };

        let mut report = SubAccountReport::new(action);
        for user in users.iter().filter(|u| u.status == wanted) {
            if report.attempted() > 0 {
                self.pace().await;
            }
            match session.set_user_enabled(&user.username, enable).await {
                Ok(()) => report.succeeded.push(user.username.clone()),
                Err(e) => {
                    tracing::warn!(panel = %username, sub_account = %user.username, error = %e, "sub-account update failed");
                    report.failed.push((user.username.clone(), e.brief()));
                }
            }
        }
        report
    }

    async fn pace(&self) {
        if !self.call_delay.is_zero() {
            tokio::time::sleep(self.call_delay).await;
        }
    }

    /// Log, audit and notify. Delivery failures never fail the operation.
    pub(crate) async fn emit(&self, event: EngineEvent, actor: Option<UserId>) {
        match &event {
            EngineEvent::TransitionFailed { .. } => {
                tracing::warn!(panel = event.panel().id.0, kind = event.kind(), "{}", event.describe())
            }
            EngineEvent::InconsistentState { .. } => {
                tracing::error!(panel = event.panel().id.0, kind = event.kind(), "{}", event.describe())
            }
            _ => tracing::info!(panel = event.panel().id.0, kind = event.kind(), "{}", event.describe()),
        }
        if let Some(audit) = &self.audit {
            audit.record(AuditEvent::from_engine_event(&event, actor.map(|a| a.0)));
        }
        if let Err(e) = self.notifier.notify(&event).await {
            tracing::warn!(error = %e, kind = event.kind(), "notification failed");
        }
    }

    async fn emit_failure(&self, panel: &Panel, action: &str, err: &Error, actor: Option<UserId>) {
        self.emit(
            EngineEvent::TransitionFailed {
                panel: PanelRef::from(panel),
                action: action.to_string(),
                error: err.to_string(),
            },
            actor,
        )
        .await;
    }

    async fn emit_inconsistent(&self, panel: &Panel, err: &Error, actor: Option<UserId>) {
        let detail = match err {
            Error::InconsistentState { detail, .. } => detail.clone(),
            other => other.to_string(),
        };
        self.emit(
            EngineEvent::InconsistentState {
                panel: PanelRef::from(panel),
                detail,
            },
            actor,
        )
        .await;
    }
}
