//! HTTP adapter for the Marzban panel API.
//!
//! Every call is bounded by the client timeout. Transport failures become
//! `RemoteUnreachable`; any status outside an operation's success set becomes
//! `RemoteRejected` carrying the raw status and body.

mod wire;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, Url};
use warden_core::{
    config::Config,
    domain::{Secret, SubAccount},
    errors::Error,
    ports::{RemotePanelClient, RemotePanelConnector},
    Result,
};

use crate::wire::{AdminCreate, AdminUpdate, TokenResponse, UserStatusUpdate};

#[derive(Clone, Debug)]
pub struct MarzbanConnector {
    base: Url,
    http: reqwest::Client,
}

impl MarzbanConnector {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url.trim().trim_end_matches('/'))
            .map_err(|e| Error::Config(format!("invalid MARZBAN_URL {base_url:?}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(Error::Config(format!("invalid MARZBAN_URL {base_url:?}")));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("http client build failed: {e}")))?;
        Ok(Self { base, http })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(&cfg.marzban_url, cfg.api_timeout)
    }

    fn url(&self, segments: &[&str]) -> Url {
        endpoint(&self.base, segments)
    }
}

/// `base` joined with percent-encoded path segments.
fn endpoint(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

#[async_trait]
impl RemotePanelConnector for MarzbanConnector {
    async fn connect(
        &self,
        username: &str,
        password: &Secret,
    ) -> Result<Arc<dyn RemotePanelClient>> {
        let op = "authenticate";
        let resp = self
            .http
            .post(self.url(&["api", "admin", "token"]))
            .form(&[
                ("grant_type", "password"),
                ("username", username),
                ("password", password.expose()),
            ])
            .send()
            .await
            .map_err(|e| transport_error(op, e))?;
        let resp = accept(op, resp, &[200]).await?;
        let token: TokenResponse = read_json(op, resp).await?;
        tracing::debug!(username, "authenticated against panel service");

        Ok(Arc::new(MarzbanSession {
            base: self.base.clone(),
            http: self.http.clone(),
            username: username.to_string(),
            token: token.access_token,
        }))
    }
}

pub struct MarzbanSession {
    base: Url,
    http: reqwest::Client,
    username: String,
    token: String,
}

impl MarzbanSession {
    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        self.http
            .request(method, endpoint(&self.base, segments))
            .bearer_auth(&self.token)
    }

    async fn send(&self, op: &str, req: RequestBuilder, ok: &[u16]) -> Result<Response> {
        let resp = req.send().await.map_err(|e| transport_error(op, e))?;
        accept(op, resp, ok).await
    }
}

#[async_trait]
impl RemotePanelClient for MarzbanSession {
    fn username(&self) -> &str {
        &self.username
    }

    async fn fetch_users(&self, panel_username: &str) -> Result<Vec<SubAccount>> {
        let op = "fetch users";
        let req = self
            .request(Method::GET, &["api", "users"])
            .query(&[("admin", panel_username)]);
        let resp = self.send(op, req, &[200]).await?;
        let body = resp.text().await.map_err(|e| transport_error(op, e))?;
        wire::parse_users(&body, panel_username)
            .map_err(|e| Error::External(format!("{op}: unexpected response: {e}")))
    }

    async fn fetch_admin_exists(&self, username: &str) -> Result<bool> {
        let op = "admin exists";
        let req = self.request(Method::GET, &["api", "admin", username]);
        let resp = self.send(op, req, &[200, 404]).await?;
        Ok(resp.status().as_u16() == 200)
    }

    async fn set_password(&self, username: &str, password: &Secret, is_sudo: bool) -> Result<()> {
        let req = self
            .request(Method::PUT, &["api", "admin", username])
            .json(&AdminUpdate {
                password: password.expose(),
                is_sudo,
            });
        self.send("set password", req, &[200]).await?;
        tracing::info!(admin = username, "panel credential changed");
        Ok(())
    }

    async fn set_user_enabled(&self, username: &str, enabled: bool) -> Result<()> {
        let req = self
            .request(Method::PUT, &["api", "user", username])
            .json(&UserStatusUpdate::new(enabled));
        self.send("set user enabled", req, &[200]).await?;
        Ok(())
    }

    async fn delete_user(&self, username: &str) -> Result<()> {
        let req = self.request(Method::DELETE, &["api", "user", username]);
        self.send("delete user", req, &[200, 204]).await?;
        Ok(())
    }

    async fn delete_admin(&self, username: &str) -> Result<()> {
        let req = self.request(Method::DELETE, &["api", "admin", username]);
        self.send("delete admin", req, &[200, 204]).await?;
        Ok(())
    }

    async fn create_admin(
        &self,
        username: &str,
        password: &Secret,
        telegram_id: i64,
        is_sudo: bool,
    ) -> Result<()> {
        let req = self.request(Method::POST, &["api", "admin"]).json(&AdminCreate {
            username,
            password: password.expose(),
            telegram_id,
            is_sudo,
        });
        self.send("create admin", req, &[200, 201]).await?;
        Ok(())
    }
}

// ============== Response classification ==============

async fn accept(op: &str, resp: Response, ok: &[u16]) -> Result<Response> {
    let status = resp.status().as_u16();
    if ok.contains(&status) {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(classify(op, status, body))
}

fn classify(op: &str, status: u16, body: String) -> Error {
    if status == 401 || status == 403 {
        tracing::debug!(op, status, "panel service refused credential");
    } else {
        tracing::warn!(op, status, body = %body, "panel service rejected request");
    }
    Error::rejected(op, status, body)
}

fn transport_error(op: &str, e: reqwest::Error) -> Error {
    if e.is_decode() {
        return Error::External(format!("{op}: unexpected response: {e}"));
    }
    let kind = if e.is_timeout() { "timed out" } else { "request failed" };
    tracing::warn!(op, error = %e, "{kind}");
    Error::RemoteUnreachable(format!("{op} {kind}: {e}"))
}

async fn read_json<T: serde::de::DeserializeOwned>(op: &str, resp: Response) -> Result<T> {
    let body = resp.text().await.map_err(|e| transport_error(op, e))?;
    serde_json::from_str(&body)
        .map_err(|e| Error::External(format!("{op}: unexpected response: {e}")))
}
