//! Outcome reports and the events the engine emits to the operator surface.

use std::fmt;

use crate::{
    domain::{Panel, PanelId, UserId},
    formatting::format_bytes,
    limits::{LimitCheckResult, Warning},
};

/// Identity of a panel as carried in events, without credentials.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PanelRef {
    pub id: PanelId,
    pub username: String,
    pub label: String,
    pub operator: UserId,
}

impl From<&Panel> for PanelRef {
    fn from(p: &Panel) -> Self {
        Self {
            id: p.id,
            username: p.username.clone(),
            label: p.label(),
            operator: p.operator,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeactivationReason {
    Expired,
    LimitExceeded { cause: String },
    Manual { by: UserId, note: Option<String> },
}

impl DeactivationReason {
    /// Reason for an automatic deactivation; `None` when nothing was breached.
    pub fn from_check(check: &LimitCheckResult) -> Option<Self> {
        if check.expired {
            return Some(Self::Expired);
        }
        check.cause().map(|cause| Self::LimitExceeded { cause })
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, Self::Manual { .. })
    }
}

impl fmt::Display for DeactivationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired => f.write_str("validity period ended"),
            Self::LimitExceeded { cause } => write!(f, "limit exceeded: {cause}"),
            Self::Manual { by, note: Some(note) } => {
                write!(f, "manual deactivation by {}: {note}", by.0)
            }
            Self::Manual { by, note: None } => write!(f, "manual deactivation by {}", by.0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubAccountAction {
    Disable,
    Enable,
    Delete,
}

impl SubAccountAction {
    fn past_tense(self) -> &'static str {
        match self {
            Self::Disable => "disabled",
            Self::Enable => "enabled",
            Self::Delete => "deleted",
        }
    }
}

/// Per-sub-account results of one executor step. Failures never abort the step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubAccountReport {
    pub action: SubAccountAction,
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Set when the sub-accounts could not be listed at all.
    pub listing_error: Option<String>,
}

impl SubAccountReport {
    pub fn new(action: SubAccountAction) -> Self {
        Self {
            action,
            succeeded: Vec::new(),
            failed: Vec::new(),
            listing_error: None,
        }
    }

    pub fn listing_failed(action: SubAccountAction, error: String) -> Self {
        Self {
            listing_error: Some(error),
            ..Self::new(action)
        }
    }

    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.listing_error.is_none()
    }

    /// e.g. `2/3 disabled, 1 failed: carol (HTTP 500)`.
    pub fn summary(&self) -> String {
        let verb = self.action.past_tense();
        if let Some(err) = &self.listing_error {
            return format!("sub-accounts not {verb}: listing failed ({err})");
        }
        if self.attempted() == 0 {
            return format!("no sub-accounts needed to be {verb}");
        }
        let mut out = format!("{}/{} {verb}", self.succeeded.len(), self.attempted());
        if !self.failed.is_empty() {
            let details = self
                .failed
                .iter()
                .map(|(user, why)| format!("{user} ({why})"))
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&format!(", {} failed: {details}", self.failed.len()));
        }
        out
    }
}

#[derive(Clone, Debug)]
pub struct DeactivationReport {
    pub panel: PanelRef,
    pub reason: DeactivationReason,
    pub sub_accounts: SubAccountReport,
    /// The panel was already deactivated; only sub-accounts were re-disabled.
    pub repaired: bool,
}

#[derive(Clone, Debug)]
pub struct ReactivationReport {
    pub panel: PanelRef,
    pub sub_accounts: SubAccountReport,
    /// The panel was already active; nothing was done.
    pub already_active: bool,
}

#[derive(Clone, Debug)]
pub struct DeletionReport {
    pub panel: PanelRef,
    pub sub_accounts: SubAccountReport,
    pub preserved_traffic: u64,
}

#[derive(Clone, Debug)]
pub enum EngineEvent {
    LimitWarning {
        panel: PanelRef,
        warnings: Vec<Warning>,
        remaining_days: i64,
    },
    Deactivated(DeactivationReport),
    Reactivated(ReactivationReport),
    Deleted(DeletionReport),
    SubAccountDeleted {
        panel: PanelRef,
        sub_account: String,
        preserved_traffic: u64,
    },
    TransitionFailed {
        panel: PanelRef,
        action: String,
        error: String,
    },
    InconsistentState {
        panel: PanelRef,
        detail: String,
    },
}

impl EngineEvent {
    pub fn panel(&self) -> &PanelRef {
        match self {
            Self::LimitWarning { panel, .. }
            | Self::SubAccountDeleted { panel, .. }
            | Self::TransitionFailed { panel, .. }
            | Self::InconsistentState { panel, .. } => panel,
            Self::Deactivated(r) => &r.panel,
            Self::Reactivated(r) => &r.panel,
            Self::Deleted(r) => &r.panel,
        }
    }

    /// The operator who should hear about this event besides the sudo admins.
    pub fn owner_recipient(&self) -> Option<UserId> {
        match self {
            Self::LimitWarning { panel, .. } => Some(panel.operator),
            Self::Deactivated(r) => Some(r.panel.operator),
            Self::Reactivated(r) => Some(r.panel.operator),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::LimitWarning { .. } => "limit_warning",
            Self::Deactivated(_) => "deactivated",
            Self::Reactivated(_) => "reactivated",
            Self::Deleted(_) => "deleted",
            Self::SubAccountDeleted { .. } => "sub_account_deleted",
            Self::TransitionFailed { .. } => "transition_failed",
            Self::InconsistentState { .. } => "inconsistent_state",
        }
    }

    /// Plain-text one-liner for logs and audit records.
    pub fn describe(&self) -> String {
        let p = self.panel();
        match self {
            Self::LimitWarning { warnings, .. } => format!(
                "panel {} near limits: {}",
                p.username,
                warnings
                    .iter()
                    .map(|w| w.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Self::Deactivated(r) => format!(
                "panel {} deactivated ({}); {}",
                p.username,
                r.reason,
                r.sub_accounts.summary()
            ),
            Self::Reactivated(r) => {
                format!("panel {} reactivated; {}", p.username, r.sub_accounts.summary())
            }
            Self::Deleted(r) => format!(
                "panel {} deleted; {}; preserved {}",
                p.username,
                r.sub_accounts.summary(),
                format_bytes(r.preserved_traffic)
            ),
            Self::SubAccountDeleted {
                sub_account,
                preserved_traffic,
                ..
            } => format!(
                "sub-account {sub_account} of {} deleted; preserved {}",
                p.username,
                format_bytes(*preserved_traffic)
            ),
            Self::TransitionFailed { action, error, .. } => {
                format!("{action} of panel {} failed: {error}", p.username)
            }
            Self::InconsistentState { detail, .. } => {
                format!("panel {} is inconsistent: {detail}", p.username)
            }
        }
    }
}
