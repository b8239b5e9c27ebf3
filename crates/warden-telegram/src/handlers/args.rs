//! Argument parsing for operator commands.

use warden_core::{
    domain::{PanelId, Quotas, Secret, UserId, GIB, SECONDS_PER_DAY},
    errors::Error,
    provisioning::NewPanelRequest,
    Result,
};

fn usage(text: &str) -> Error {
    Error::InvalidInput(format!("usage: {text}"))
}

/// Accepts `7` or `#7`.
pub fn panel_id(raw: &str) -> Result<PanelId> {
    raw.trim()
        .trim_start_matches('#')
        .parse::<i64>()
        .ok()
        .filter(|v| *v > 0)
        .map(PanelId)
        .ok_or_else(|| Error::InvalidInput(format!("not a panel id: {raw:?}")))
}

pub fn telegram_id(raw: &str) -> Result<UserId> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .filter(|v| *v > 0)
        .map(UserId)
        .ok_or_else(|| Error::InvalidInput(format!("not a telegram id: {raw:?}")))
}

fn number(raw: &str, what: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| Error::InvalidInput(format!("{what} must be a whole number, got {raw:?}")))
}

/// `<users> <traffic_gb> <time_days> <validity_days>`; zero means unlimited
/// for the first three.
pub fn quotas(parts: &[&str]) -> Result<Quotas> {
    let [users, traffic_gb, time_days, validity_days] = parts else {
        return Err(usage("<users> <traffic_gb> <time_days> <validity_days>"));
    };
    let users = number(users, "users")?;
    let traffic_gb = number(traffic_gb, "traffic_gb")?;
    let time_days = number(time_days, "time_days")?;
    let validity_days = number(validity_days, "validity_days")?;

    let q = Quotas {
        max_users: u32::try_from(users)
            .map_err(|_| Error::InvalidInput("users out of range".to_string()))?,
        max_traffic: traffic_gb
            .checked_mul(GIB)
            .ok_or_else(|| Error::InvalidInput("traffic_gb out of range".to_string()))?,
        max_total_time: time_days
            .checked_mul(SECONDS_PER_DAY as u64)
            .ok_or_else(|| Error::InvalidInput("time_days out of range".to_string()))?,
        validity_days: u32::try_from(validity_days)
            .map_err(|_| Error::InvalidInput("validity_days out of range".to_string()))?,
    };
    q.validate()?;
    Ok(q)
}

fn display_name(rest: &[&str]) -> Option<String> {
    let name = rest.join(" ");
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// `/newpanel <telegram_id> <username> <password> <users> <traffic_gb> <time_days> <validity_days> [display name]`
pub fn new_panel(parts: &[&str]) -> Result<NewPanelRequest> {
    if parts.len() < 7 {
        return Err(usage(
            "/newpanel <telegram_id> <username> <password> <users> <traffic_gb> <time_days> <validity_days> [display name]",
        ));
    }
    Ok(NewPanelRequest {
        operator: telegram_id(parts[0])?,
        username: parts[1].to_string(),
        password: Secret::new(parts[2]),
        quotas: quotas(&parts[3..7])?,
        display_name: display_name(&parts[7..]),
    })
}

/// `/register <telegram_id> <username> <password> [display name]`
pub fn existing_panel(parts: &[&str]) -> Result<NewPanelRequest> {
    if parts.len() < 3 {
        return Err(usage(
            "/register <telegram_id> <username> <password> [display name]",
        ));
    }
    Ok(NewPanelRequest {
        operator: telegram_id(parts[0])?,
        username: parts[1].to_string(),
        password: Secret::new(parts[2]),
        quotas: Quotas::default(),
        display_name: display_name(&parts[3..]),
    })
}
