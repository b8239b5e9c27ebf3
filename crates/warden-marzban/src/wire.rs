//! JSON shapes of the panel service API.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use warden_core::domain::{SubAccount, SubAccountStatus};

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct UsersResponse {
    #[serde(default)]
    pub users: Vec<UserDto>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UserDto {
    pub username: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub used_traffic: Option<u64>,
    #[serde(default)]
    pub lifetime_used_traffic: Option<u64>,
    #[serde(default)]
    pub data_limit: Option<u64>,
    #[serde(default)]
    pub expire: Option<i64>,
    #[serde(default)]
    pub admin: Option<Value>,
}

impl UserDto {
    pub fn into_sub_account(self) -> SubAccount {
        SubAccount {
            admin: self.admin.as_ref().and_then(owner_username),
            username: self.username,
            status: SubAccountStatus::parse(self.status.as_deref().unwrap_or("")),
            used_traffic: self.used_traffic.unwrap_or(0),
            lifetime_used_traffic: self.lifetime_used_traffic.unwrap_or(0),
            data_limit: self.data_limit.filter(|l| *l > 0),
            expire: self.expire.filter(|e| *e > 0),
        }
    }
}

/// The owner field is a plain username on some versions of the service and
/// an admin object on others.
pub(crate) fn owner_username(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => map
            .get("username")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

/// Sub-accounts of `panel_username`. Entries owned by a different admin are
/// dropped; entries without an owner are kept.
pub(crate) fn parse_users(body: &str, panel_username: &str) -> serde_json::Result<Vec<SubAccount>> {
    let resp: UsersResponse = serde_json::from_str(body)?;
    Ok(resp
        .users
        .into_iter()
        .map(UserDto::into_sub_account)
        .filter(|u| u.admin.as_deref().map_or(true, |a| a == panel_username))
        .collect())
}

#[derive(Debug, Serialize)]
pub(crate) struct AdminUpdate<'a> {
    pub password: &'a str,
    pub is_sudo: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct AdminCreate<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub telegram_id: i64,
    pub is_sudo: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct UserStatusUpdate {
    pub status: &'static str,
}

impl UserStatusUpdate {
    pub fn new(enabled: bool) -> Self {
        Self {
            status: if enabled { "active" } else { "disabled" },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_users_with_either_owner_shape() {
        let body = r#"{
            "users": [
                {"username": "alice", "status": "active", "used_traffic": 100,
                 "lifetime_used_traffic": 250, "data_limit": 0, "expire": null,
                 "admin": {"username": "shop", "is_sudo": false}},
                {"username": "bob", "status": "disabled", "used_traffic": 5, "admin": "shop"},
                {"username": "eve", "status": "on_hold", "admin": "cafe"},
                {"username": "orphan", "status": "limited"}
            ],
            "total": 4
        }"#;

        let users = parse_users(body, "shop").unwrap();
        let names: Vec<_> = users.iter().map(|u| u.username.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob", "orphan"]);

        assert_eq!(users[0].consumed_traffic(), 250);
        assert_eq!(users[0].data_limit, None);
        assert_eq!(users[1].status, SubAccountStatus::Disabled);
        assert_eq!(users[1].lifetime_used_traffic, 0);
        assert_eq!(users[2].status, SubAccountStatus::Limited);
    }

    #[test]
    fn missing_users_key_is_empty() {
        assert!(parse_users("{}", "shop").unwrap().is_empty());
        assert!(parse_users("not json", "shop").is_err());
    }

    #[test]
    fn owner_extraction() {
        assert_eq!(owner_username(&Value::String("x".into())), Some("x".into()));
        assert_eq!(owner_username(&serde_json::json!({"id": 3})), None);
        assert_eq!(owner_username(&Value::Null), None);
    }

    #[test]
    fn status_payload() {
        let v = serde_json::to_value(UserStatusUpdate::new(false)).unwrap();
        assert_eq!(v, serde_json::json!({"status": "disabled"}));
    }
}
