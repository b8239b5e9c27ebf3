use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    domain::{
        CumulativeTraffic, DeactivationCommit, NewPanel, Panel, PanelId, PanelState, Quotas,
        Secret, SubAccount, UserId,
    },
    events::EngineEvent,
    Result,
};

/// Opens authenticated sessions against the remote panel service.
///
/// `connect` is the `authenticate` step: it fails with `RemoteRejected` when the
/// credential is refused and `RemoteUnreachable` when the service cannot be reached.
#[async_trait]
pub trait RemotePanelConnector: Send + Sync {
    async fn connect(&self, username: &str, password: &Secret)
        -> Result<Arc<dyn RemotePanelClient>>;
}

/// One authenticated session. Every call is bounded by the adapter's timeout.
#[async_trait]
pub trait RemotePanelClient: Send + Sync {
    /// The account this session is authenticated as.
    fn username(&self) -> &str;

    /// Sub-accounts owned by the given panel.
    async fn fetch_users(&self, panel_username: &str) -> Result<Vec<SubAccount>>;

    async fn fetch_admin_exists(&self, username: &str) -> Result<bool>;

    async fn set_password(&self, username: &str, password: &Secret, is_sudo: bool) -> Result<()>;

    async fn set_user_enabled(&self, username: &str, enabled: bool) -> Result<()>;

    async fn delete_user(&self, username: &str) -> Result<()>;

    async fn delete_admin(&self, username: &str) -> Result<()>;

    async fn create_admin(
        &self,
        username: &str,
        password: &Secret,
        telegram_id: i64,
        is_sudo: bool,
    ) -> Result<()>;
}

/// Durable storage for panels and their cumulative traffic counters.
///
/// Credential and state fields are only ever written together by the
/// `commit_*` methods, each of which is a single atomic update.
#[async_trait]
pub trait PanelStore: Send + Sync {
    /// Inserts the panel and its zeroed traffic counter in one transaction.
    async fn insert_panel(&self, panel: NewPanel) -> Result<Panel>;

    async fn panel(&self, id: PanelId) -> Result<Option<Panel>>;

    async fn panel_by_username(&self, username: &str) -> Result<Option<Panel>>;

    async fn list_panels(&self, state: Option<PanelState>) -> Result<Vec<Panel>>;

    async fn operator_panels(&self, operator: UserId) -> Result<Vec<Panel>>;

    async fn update_quotas(&self, id: PanelId, quotas: &Quotas) -> Result<()>;

    /// Write-ahead of a deactivation's credential rotation: the credential
    /// about to be replaced and its replacement, both recorded before the
    /// remote password changes.
    async fn stage_rotation(&self, id: PanelId, original: &Secret, pending: &Secret)
        -> Result<()>;

    /// Drops the staged rotation of an active panel.
    async fn clear_staged_rotation(&self, id: PanelId) -> Result<()>;

    /// `active -> deactivated`. Fails with `InconsistentState` if the row is not active.
    async fn commit_deactivation(&self, id: PanelId, commit: &DeactivationCommit) -> Result<()>;

    /// `deactivated -> active`, restoring the credential and clearing metadata.
    /// Fails with `InconsistentState` if the row is not deactivated.
    async fn commit_reactivation(&self, id: PanelId, restored_password: &Secret) -> Result<()>;

    /// Removes the panel and its traffic counter in one transaction.
    async fn delete_panel(&self, id: PanelId) -> Result<()>;

    async fn cumulative_traffic(&self, id: PanelId) -> Result<Option<CumulativeTraffic>>;

    /// Atomic write-if-greater of `observed` into the counter.
    /// Returns the counter afterwards (creating the row if absent).
    async fn raise_cumulative_traffic(
        &self,
        id: PanelId,
        observed: u64,
        at: DateTime<Utc>,
    ) -> Result<u64>;

    /// Atomic unconditional increment of the counter by `amount`.
    /// Returns the counter afterwards (creating the row if absent).
    async fn preserve_traffic(&self, id: PanelId, amount: u64, at: DateTime<Utc>) -> Result<u64>;
}

/// Receives engine events (warnings, transitions, failures).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &EngineEvent) -> Result<()>;
}
