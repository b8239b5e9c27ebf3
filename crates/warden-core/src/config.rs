use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use crate::{credentials::DeactivationCredential, domain::Secret, errors::Error, Result};

/// Typed configuration for the warden process.
///
/// Values come from the environment; a `.env` file in the working directory
/// fills in whatever the environment does not already define.
#[derive(Clone, Debug)]
pub struct Config {
    // Telegram
    pub bot_token: String,
    pub sudo_admins: Vec<i64>,

    // Remote panel service
    pub marzban_url: String,
    pub management_username: Option<String>,
    pub management_password: Option<Secret>,
    pub api_timeout: Duration,
    pub remote_call_delay: Duration,

    // Storage
    pub database_path: PathBuf,

    // Monitor loop
    pub monitoring_interval: Duration,
    pub warning_threshold: f64,
    pub monitor_concurrency: usize,

    pub deactivation_credential: DeactivationCredential,

    // Operator commands
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,

    // Audit
    pub audit_log_path: PathBuf,
    pub audit_log_json: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let bot_token = env_str("BOT_TOKEN").and_then(non_empty).ok_or_else(|| {
            Error::Config("BOT_TOKEN environment variable is required".to_string())
        })?;
        let sudo_admins = parse_csv_i64(env_str("SUDO_ADMINS"));
        if sudo_admins.is_empty() {
            return Err(Error::Config(
                "SUDO_ADMINS environment variable is required".to_string(),
            ));
        }

        let marzban_url = env_str("MARZBAN_URL")
            .and_then(non_empty)
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .ok_or_else(|| {
                Error::Config("MARZBAN_URL environment variable is required".to_string())
            })?;

        let management_username = env_str("MARZBAN_USERNAME").and_then(non_empty);
        let management_password = env_str("MARZBAN_PASSWORD")
            .and_then(non_empty)
            .map(Secret::new);
        if management_username.is_some() != management_password.is_some() {
            return Err(Error::Config(
                "MARZBAN_USERNAME and MARZBAN_PASSWORD must be set together".to_string(),
            ));
        }

        let api_timeout = Duration::from_secs(env_u64("API_TIMEOUT").unwrap_or(30).max(1));
        let remote_call_delay =
            Duration::from_millis(env_u64("REMOTE_CALL_DELAY_MS").unwrap_or(100));

        let database_path = PathBuf::from(
            env_str("DATABASE_PATH")
                .and_then(non_empty)
                .unwrap_or_else(|| "bot_database.db".to_string()),
        );

        let monitoring_interval =
            Duration::from_secs(env_u64("MONITORING_INTERVAL").unwrap_or(600).max(1));
        let warning_threshold = clamp_threshold(env_f64("WARNING_THRESHOLD").unwrap_or(0.8));
        let monitor_concurrency = env_usize("MONITOR_CONCURRENCY").unwrap_or(4).max(1);

        let deactivation_credential = DeactivationCredential::from_env_values(
            env_str("DEACTIVATION_CREDENTIAL").as_deref(),
            env_str("DEACTIVATION_PASSWORD"),
        )?;

        let rate_limit_requests = env_u64("RATE_LIMIT_REQUESTS").unwrap_or(20).clamp(1, 1000) as u32;
        let rate_limit_window =
            Duration::from_secs(env_u64("RATE_LIMIT_WINDOW").unwrap_or(60).max(1));

        let audit_log_path = PathBuf::from(
            env_str("AUDIT_LOG_PATH").unwrap_or("/tmp/panel-warden-audit.log".to_string()),
        );
        let audit_log_json = env_bool("AUDIT_LOG_JSON").unwrap_or(false);

        Ok(Self {
            bot_token,
            sudo_admins,
            marzban_url,
            management_username,
            management_password,
            api_timeout,
            remote_call_delay,
            database_path,
            monitoring_interval,
            warning_threshold,
            monitor_concurrency,
            deactivation_credential,
            rate_limit_requests,
            rate_limit_window,
            audit_log_path,
            audit_log_json,
        })
    }

    /// The privileged credential used for admin-level remote calls, if configured.
    pub fn management_credential(&self) -> Option<(String, Secret)> {
        match (&self.management_username, &self.management_password) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => None,
        }
    }

    pub fn is_sudo(&self, telegram_id: i64) -> bool {
        self.sudo_admins.contains(&telegram_id)
    }
}

fn clamp_threshold(v: f64) -> f64 {
    if !v.is_finite() || v <= 0.0 {
        return 0.8;
    }
    v.min(1.0)
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue; // existing env wins
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let key = k.trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }
        out.push((key.to_string(), val));
    }
    out
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_f64(key: &str) -> Option<f64> {
    env_str(key).and_then(|s| s.trim().parse::<f64>().ok())
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotenv_parsing_strips_quotes_and_comments() {
        let parsed = parse_dotenv(
            "# comment\nBOT_TOKEN=\"abc\"\nexport SUDO_ADMINS=1,2\n\nBROKEN\nMARZBAN_URL='https://p.example'\n",
        );
        assert_eq!(
            parsed,
            vec![
                ("BOT_TOKEN".to_string(), "abc".to_string()),
                ("SUDO_ADMINS".to_string(), "1,2".to_string()),
                ("MARZBAN_URL".to_string(), "https://p.example".to_string()),
            ]
        );
    }

    #[test]
    fn csv_ids_skip_garbage() {
        assert_eq!(
            parse_csv_i64(Some(" 12, x, ,34 ".to_string())),
            vec![12, 34]
        );
        assert!(parse_csv_i64(None).is_empty());
    }

    #[test]
    fn threshold_is_clamped() {
        assert_eq!(clamp_threshold(0.9), 0.9);
        assert_eq!(clamp_threshold(1.5), 1.0);
        assert_eq!(clamp_threshold(0.0), 0.8);
        assert_eq!(clamp_threshold(f64::NAN), 0.8);
    }
}
