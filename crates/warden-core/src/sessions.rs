//! Keyed pool of authenticated remote sessions.
//!
//! Sessions are keyed by account name plus a fingerprint of the credential, so
//! a rotated password never reuses a session opened with the old one.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::Mutex;

use crate::{
    credentials::fingerprint,
    domain::{Panel, Secret},
    errors::Error,
    ports::{RemotePanelClient, RemotePanelConnector},
    Result,
};

pub struct SessionPool {
    connector: Arc<dyn RemotePanelConnector>,
    management: Option<(String, Secret)>,
    sessions: Mutex<HashMap<String, PooledSession>>,
}

struct PooledSession {
    fingerprint: String,
    client: Arc<dyn RemotePanelClient>,
}

impl SessionPool {
    pub fn new(
        connector: Arc<dyn RemotePanelConnector>,
        management: Option<(String, Secret)>,
    ) -> Self {
        Self {
            connector,
            management,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn has_management(&self) -> bool {
        self.management.is_some()
    }

    /// Cached session for `username`/`password`, authenticating if needed.
    pub async fn session(
        &self,
        username: &str,
        password: &Secret,
    ) -> Result<Arc<dyn RemotePanelClient>> {
        let fp = fingerprint(password);
        {
            let map = self.sessions.lock().await;
            if let Some(s) = map.get(username).filter(|s| s.fingerprint == fp) {
                return Ok(s.client.clone());
            }
        }
        self.connect(username, password, fp).await
    }

    /// Always authenticates anew and replaces any cached session.
    pub async fn fresh_session(
        &self,
        username: &str,
        password: &Secret,
    ) -> Result<Arc<dyn RemotePanelClient>> {
        self.connect(username, password, fingerprint(password)).await
    }

    async fn connect(
        &self,
        username: &str,
        password: &Secret,
        fp: String,
    ) -> Result<Arc<dyn RemotePanelClient>> {
        tracing::debug!(username, credential = %fp, "opening remote session");
        let client = self.connector.connect(username, password).await?;
        self.sessions.lock().await.insert(
            username.to_string(),
            PooledSession {
                fingerprint: fp,
                client: client.clone(),
            },
        );
        Ok(client)
    }

    /// Session authenticated with the panel's own stored credential.
    pub async fn panel_session(&self, panel: &Panel) -> Result<Arc<dyn RemotePanelClient>> {
        self.session(&panel.username, &panel.password).await
    }

    /// Freshly authenticated session for admin-level calls on a panel (password
    /// changes, admin deletion). Uses the management credential when configured,
    /// otherwise the panel's own `current` credential.
    pub async fn fresh_admin_session(
        &self,
        panel_username: &str,
        current: &Secret,
    ) -> Result<Arc<dyn RemotePanelClient>> {
        match &self.management {
            Some((user, pw)) => self.fresh_session(user, pw).await,
            None => self.fresh_session(panel_username, current).await,
        }
    }

    pub async fn management_session(&self) -> Result<Arc<dyn RemotePanelClient>> {
        let Some((user, pw)) = &self.management else {
            return Err(Error::Config(
                "MARZBAN_USERNAME/MARZBAN_PASSWORD are required for this operation".to_string(),
            ));
        };
        self.session(user, pw).await
    }

    /// Authenticate once without caching. Used to prove a credential.
    pub async fn check_credential(&self, username: &str, password: &Secret) -> Result<()> {
        self.connector.connect(username, password).await.map(|_| ())
    }

    pub async fn invalidate(&self, username: &str) {
        self.sessions.lock().await.remove(username);
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
