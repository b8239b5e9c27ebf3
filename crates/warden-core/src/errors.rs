/// Core error type for the panel warden.
///
/// Adapter crates map their transport errors into this type so the engine can
/// tell "could not reach" apart from "reached and refused" and decide whether a
/// panel-level step must abort before any local mutation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    /// Timeout, connection failure, DNS failure. The remote end state is unknown.
    #[error("remote unreachable: {0}")]
    RemoteUnreachable(String),

    /// The remote service answered with a non-success status code.
    #[error("remote rejected {op}: HTTP {status}: {body}")]
    RemoteRejected {
        op: String,
        status: u16,
        body: String,
    },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Local and remote views disagree in a way the engine cannot repair on its own.
    #[error("inconsistent state for panel {panel}: {detail}")]
    InconsistentState { panel: String, detail: String },

    /// Some sub-account operations failed, so the panel-level step was not attempted.
    #[error("incomplete: {0}")]
    Incomplete(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    pub fn rejected(op: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Self::RemoteRejected {
            op: op.into(),
            status,
            body: body.into(),
        }
    }

    pub fn inconsistent(panel: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InconsistentState {
            panel: panel.into(),
            detail: detail.into(),
        }
    }

    /// True when the remote refused the credential (expired token, rotated password).
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::RemoteRejected { status: 401 | 403, .. })
    }

    /// Short one-line description used in per-sub-account failure summaries.
    pub fn brief(&self) -> String {
        match self {
            Self::RemoteRejected { status, body, .. } => {
                let body = body.trim();
                if body.is_empty() {
                    format!("HTTP {status}")
                } else {
                    format!(
                        "HTTP {status}: {}",
                        body.chars().take(120).collect::<String>()
                    )
                }
            }
            Self::RemoteUnreachable(msg) => format!("unreachable: {msg}"),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_only_for_auth_statuses() {
        assert!(Error::rejected("fetch users", 401, "").is_unauthorized());
        assert!(Error::rejected("fetch users", 403, "nope").is_unauthorized());
        assert!(!Error::rejected("fetch users", 500, "").is_unauthorized());
        assert!(!Error::RemoteUnreachable("timeout".into()).is_unauthorized());
    }

    #[test]
    fn brief_keeps_status_and_trims_body() {
        let e = Error::rejected("disable user", 500, format!("  {}  ", "x".repeat(300)));
        let b = e.brief();
        assert!(b.starts_with("HTTP 500: x"));
        assert_eq!(b.len(), "HTTP 500: ".len() + 120);

        assert_eq!(Error::rejected("x", 404, "").brief(), "HTTP 404");
    }
}
