use std::{fmt, sync::OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::{errors::Error, Result};

pub const SECONDS_PER_DAY: i64 = 86_400;
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Telegram user id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub i64);

/// Telegram chat id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChatId(pub i64);

/// Telegram message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub i32);

/// A stable reference to a Telegram message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// Internally assigned panel id. Stable and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PanelId(pub i64);

impl fmt::Display for PanelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A credential that never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PanelState {
    Active,
    Deactivated,
}

impl PanelState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Deactivated => "deactivated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "deactivated" => Some(Self::Deactivated),
            _ => None,
        }
    }
}

/// Limits assigned to a panel. Zero in `max_users`, `max_traffic` or
/// `max_total_time` means that dimension is unlimited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Quotas {
    pub max_users: u32,
    /// Bytes.
    pub max_traffic: u64,
    /// Seconds.
    pub max_total_time: u64,
    pub validity_days: u32,
}

impl Default for Quotas {
    fn default() -> Self {
        Self {
            max_users: 10,
            max_traffic: 100 * GIB,
            max_total_time: 30 * SECONDS_PER_DAY as u64,
            validity_days: 30,
        }
    }
}

impl Quotas {
    pub fn validate(&self) -> Result<()> {
        if self.validity_days == 0 {
            return Err(Error::InvalidInput(
                "validity_days must be at least 1".to_string(),
            ));
        }
        if self.validity_days > 36_500 {
            return Err(Error::InvalidInput(
                "validity_days must be at most 36500".to_string(),
            ));
        }
        if self.max_traffic > i64::MAX as u64 || self.max_total_time > i64::MAX as u64 {
            return Err(Error::InvalidInput("quota value out of range".to_string()));
        }
        Ok(())
    }
}

/// Why and when a panel was deactivated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeactivationInfo {
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// A delegated sub-account on the remote service, owned by one operator.
#[derive(Clone, Debug)]
pub struct Panel {
    pub id: PanelId,
    pub operator: UserId,
    pub display_name: Option<String>,
    pub username: String,
    pub password: Secret,
    /// The credential to restore on reactivation. While the panel is still
    /// active this holds a staged value from an in-flight deactivation.
    pub original_password: Option<Secret>,
    /// Replacement credential of an in-flight deactivation, recorded before
    /// the remote password is changed. Cleared once the outcome is known.
    pub pending_password: Option<Secret>,
    pub quotas: Quotas,
    pub state: PanelState,
    pub deactivation: Option<DeactivationInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Panel {
    pub fn is_active(&self) -> bool {
        self.state == PanelState::Active
    }

    pub fn label(&self) -> String {
        match &self.display_name {
            Some(name) if !name.trim().is_empty() => format!("{name} ({})", self.username),
            _ => self.username.clone(),
        }
    }
}

/// Input for inserting a panel record.
#[derive(Clone, Debug)]
pub struct NewPanel {
    pub operator: UserId,
    pub display_name: Option<String>,
    pub username: String,
    pub password: Secret,
    pub quotas: Quotas,
    pub created_at: DateTime<Utc>,
}

/// Fields written together when a deactivation is committed.
#[derive(Clone, Debug)]
pub struct DeactivationCommit {
    pub reason: String,
    pub at: DateTime<Utc>,
    pub original_password: Secret,
    pub new_password: Secret,
}

/// Non-decreasing traffic counter for one panel. Raised to the observed total
/// when that is higher, and incremented by the traffic of deleted sub-accounts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CumulativeTraffic {
    pub panel_id: PanelId,
    pub bytes: u64,
    pub last_updated: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubAccountStatus {
    Active,
    Disabled,
    Limited,
    Expired,
    OnHold,
    Other(String),
}

impl SubAccountStatus {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "active" => Self::Active,
            "disabled" => Self::Disabled,
            "limited" => Self::Limited,
            "expired" => Self::Expired,
            "on_hold" => Self::OnHold,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Remote view of one end-user account under a panel.
#[derive(Clone, Debug)]
pub struct SubAccount {
    pub username: String,
    pub status: SubAccountStatus,
    pub used_traffic: u64,
    pub lifetime_used_traffic: u64,
    pub data_limit: Option<u64>,
    /// Unix seconds; `None` means no expiry.
    pub expire: Option<i64>,
    pub admin: Option<String>,
}

impl SubAccount {
    /// Traffic attributable to this sub-account. The lifetime figure already
    /// includes the current period when the service reports it.
    pub fn consumed_traffic(&self) -> u64 {
        self.used_traffic.max(self.lifetime_used_traffic)
    }

    /// Whether the account occupies one of the panel's user slots.
    pub fn counts_toward_quota(&self, now: DateTime<Utc>) -> bool {
        let live_status = matches!(
            self.status,
            SubAccountStatus::Active | SubAccountStatus::Limited | SubAccountStatus::OnHold
        );
        let not_expired = match self.expire {
            Some(ts) if ts > 0 => ts > now.timestamp(),
            _ => true,
        };
        live_status && not_expired
    }
}

/// Aggregate usage of a panel as observed at one point in time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PanelUsage {
    pub user_count: u32,
    pub observed_traffic: u64,
}

impl PanelUsage {
    pub fn from_sub_accounts(accounts: &[SubAccount], now: DateTime<Utc>) -> Self {
        let user_count = accounts
            .iter()
            .filter(|a| a.counts_toward_quota(now))
            .count() as u32;
        let observed_traffic = accounts
            .iter()
            .map(SubAccount::consumed_traffic)
            .fold(0u64, u64::saturating_add);
        Self {
            user_count,
            observed_traffic,
        }
    }
}

fn username_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9_]{3,32}$").expect("valid regex"))
}

/// Remote usernames are lowercase ASCII, digits and underscores, 3 to 32 chars.
pub fn validate_panel_username(username: &str) -> Result<()> {
    if username_re().is_match(username) {
        return Ok(());
    }
    Err(Error::InvalidInput(format!(
        "invalid panel username {username:?}: use 3-32 lowercase letters, digits or underscores"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn account(status: &str, used: u64, lifetime: u64, expire: Option<i64>) -> SubAccount {
        SubAccount {
            username: "u".to_string(),
            status: SubAccountStatus::parse(status),
            used_traffic: used,
            lifetime_used_traffic: lifetime,
            data_limit: None,
            expire,
            admin: None,
        }
    }

    #[test]
    fn secret_is_redacted_in_debug() {
        let s = Secret::new("hunter2");
        assert_eq!(format!("{s:?}"), "Secret(***)");
        assert_eq!(s.expose(), "hunter2");
    }

    #[test]
    fn consumed_traffic_takes_the_larger_counter() {
        assert_eq!(account("active", 10, 0, None).consumed_traffic(), 10);
        assert_eq!(account("active", 10, 40, None).consumed_traffic(), 40);
    }

    #[test]
    fn usage_counts_only_live_unexpired_accounts() {
        let now = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        let past = now.timestamp() - 1;
        let future = now.timestamp() + 3600;
        let accounts = vec![
            account("active", 5, 0, None),
            account("limited", 5, 0, Some(future)),
            account("disabled", 5, 0, None),
            account("active", 5, 0, Some(past)),
            account("expired", 5, 0, None),
        ];
        let usage = PanelUsage::from_sub_accounts(&accounts, now);
        assert_eq!(usage.user_count, 2);
        // Every account's traffic counts, even ones no longer occupying a slot.
        assert_eq!(usage.observed_traffic, 25);
    }

    #[test]
    fn username_validation() {
        assert!(validate_panel_username("shop_01").is_ok());
        assert!(validate_panel_username("ab").is_err());
        assert!(validate_panel_username("Shop").is_err());
        assert!(validate_panel_username("with space").is_err());
    }

    #[test]
    fn quotas_require_positive_validity() {
        assert!(Quotas::default().validate().is_ok());
        let q = Quotas {
            validity_days: 0,
            ..Quotas::default()
        };
        assert!(q.validate().is_err());
    }

    #[test]
    fn state_round_trips_through_text() {
        assert_eq!(PanelState::parse("active"), Some(PanelState::Active));
        assert_eq!(
            PanelState::parse(PanelState::Deactivated.as_str()),
            Some(PanelState::Deactivated)
        );
        assert_eq!(PanelState::parse("gone"), None);
    }
}
