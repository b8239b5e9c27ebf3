//! Deactivation credential policy and credential fingerprints.

use rand::Rng;
use sha2::{Digest, Sha256};

use crate::{domain::Secret, errors::Error, Result};

const RANDOM_CREDENTIAL_LEN: usize = 24;
const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// What a deactivated panel's remote password is rotated to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeactivationCredential {
    /// A fresh random value per deactivation. Nobody can guess it.
    Random,
    /// One well-known value for every deactivated panel. Lets the monitor
    /// recognise panels that are locked remotely but active locally.
    Fixed(Secret),
}

impl DeactivationCredential {
    pub fn from_env_values(mode: Option<&str>, fixed_password: Option<String>) -> Result<Self> {
        let mode = mode.map(|m| m.trim().to_lowercase()).unwrap_or_default();
        match mode.as_str() {
            "" | "random" => Ok(Self::Random),
            "fixed" => {
                let pw = fixed_password
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| {
                        Error::Config(
                            "DEACTIVATION_PASSWORD is required when DEACTIVATION_CREDENTIAL=fixed"
                                .to_string(),
                        )
                    })?;
                Ok(Self::Fixed(Secret::new(pw)))
            }
            other => Err(Error::Config(format!(
                "DEACTIVATION_CREDENTIAL must be 'random' or 'fixed', got {other:?}"
            ))),
        }
    }

    pub fn next(&self) -> Secret {
        match self {
            Self::Random => random_credential(),
            Self::Fixed(s) => s.clone(),
        }
    }

    pub fn sentinel(&self) -> Option<&Secret> {
        match self {
            Self::Random => None,
            Self::Fixed(s) => Some(s),
        }
    }
}

pub fn random_credential() -> Secret {
    let mut rng = rand::thread_rng();
    let value: String = (0..RANDOM_CREDENTIAL_LEN)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    Secret::new(value)
}

/// Short, stable, non-reversible identifier for a credential (logs, pool keys).
pub fn fingerprint(secret: &Secret) -> String {
    let mut h = Sha256::new();
    h.update(secret.expose().as_bytes());
    hex_prefix(&h.finalize(), 12)
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(len);
    for b in bytes {
        let _ = write!(&mut out, "{:02x}", b);
        if out.len() >= len {
            out.truncate(len);
            break;
        }
    }
    out
}
