//! Creating, registering and re-quoting panels.

use std::sync::Arc;

use chrono::Utc;

use crate::{
    audit::{AuditEvent, AuditLogger},
    domain::{validate_panel_username, NewPanel, Panel, PanelId, Quotas, Secret, UserId},
    errors::Error,
    ports::PanelStore,
    sessions::SessionPool,
    Result,
};

#[derive(Clone, Debug)]
pub struct NewPanelRequest {
    pub operator: UserId,
    pub username: String,
    pub password: Secret,
    pub display_name: Option<String>,
    pub quotas: Quotas,
}

impl NewPanelRequest {
    fn validate(&self) -> Result<()> {
        validate_panel_username(&self.username)?;
        if self.password.expose().trim().is_empty() {
            return Err(Error::InvalidInput("password must not be empty".to_string()));
        }
        self.quotas.validate()
    }

    fn into_new_panel(self) -> NewPanel {
        NewPanel {
            operator: self.operator,
            display_name: self.display_name,
            username: self.username,
            password: self.password,
            quotas: self.quotas,
            created_at: Utc::now(),
        }
    }
}

pub struct Provisioning {
    store: Arc<dyn PanelStore>,
    sessions: Arc<SessionPool>,
    audit: Option<AuditLogger>,
}

impl Provisioning {
    pub fn new(store: Arc<dyn PanelStore>, sessions: Arc<SessionPool>) -> Self {
        Self {
            store,
            sessions,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Create the admin remotely, then record it. A failed local insert
    /// removes the remote admin again.
    pub async fn create_panel(&self, req: NewPanelRequest, actor: Option<UserId>) -> Result<Panel> {
        req.validate()?;
        self.ensure_unknown_locally(&req.username).await?;

        let mgmt = self.sessions.management_session().await?;
        if mgmt.fetch_admin_exists(&req.username).await? {
            return Err(Error::InvalidInput(format!(
                "admin {} already exists on the remote panel",
                req.username
            )));
        }
        mgmt.create_admin(&req.username, &req.password, req.operator.0, false)
            .await?;

        let username = req.username.clone();
        let panel = match self.store.insert_panel(req.into_new_panel()).await {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(panel = %username, error = %e, "local insert failed, removing remote admin");
                if let Err(cleanup) = mgmt.delete_admin(&username).await {
                    return Err(Error::inconsistent(
                        &username,
                        format!(
                            "remote admin created but not recorded ({e}); removing it failed ({})",
                            cleanup.brief()
                        ),
                    ));
                }
                return Err(e);
            }
        };

        tracing::info!(panel = %panel.username, id = panel.id.0, operator = panel.operator.0, "panel created");
        self.record("panel_created", &panel, actor, None);
        Ok(panel)
    }

    /// Record an admin that already exists remotely, after proving the credential.
    pub async fn register_existing_panel(
        &self,
        req: NewPanelRequest,
        actor: Option<UserId>,
    ) -> Result<Panel> {
        req.validate()?;
        self.ensure_unknown_locally(&req.username).await?;
        self.sessions.check_credential(&req.username, &req.password).await?;

        let panel = self.store.insert_panel(req.into_new_panel()).await?;
        tracing::info!(panel = %panel.username, id = panel.id.0, "existing panel registered");
        self.record("panel_registered", &panel, actor, None);
        Ok(panel)
    }

    /// Replace a panel's quotas. `created_at` stays put, so validity is
    /// always counted from creation.
    pub async fn update_quotas(
        &self,
        id: PanelId,
        quotas: Quotas,
        actor: Option<UserId>,
    ) -> Result<Panel> {
        quotas.validate()?;
        self.store.update_quotas(id, &quotas).await?;
        let panel = self
            .store
            .panel(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("panel {id}")))?;
        let detail = format!(
            "users={} traffic={} time={}s validity={}d",
            quotas.max_users, quotas.max_traffic, quotas.max_total_time, quotas.validity_days
        );
        tracing::info!(panel = %panel.username, %detail, "quotas updated");
        self.record("quotas_updated", &panel, actor, Some(detail));
        Ok(panel)
    }

    async fn ensure_unknown_locally(&self, username: &str) -> Result<()> {
        if self.store.panel_by_username(username).await?.is_some() {
            return Err(Error::InvalidInput(format!(
                "panel {username} is already registered"
            )));
        }
        Ok(())
    }

    fn record(&self, event: &str, panel: &Panel, actor: Option<UserId>, detail: Option<String>) {
        let Some(audit) = &self.audit else {
            return;
        };
        let mut ev = AuditEvent::new(event).with_actor(actor.map(|a| a.0));
        ev.panel_id = Some(panel.id.0);
        ev.panel = Some(panel.username.clone());
        ev.operator_id = Some(panel.operator.0);
        ev.detail = detail;
        audit.record(ev);
    }
}
