//! Wires the engine's parts together from configuration and adapters.

use std::sync::Arc;

use crate::{
    audit::AuditLogger,
    config::Config,
    domain::{Panel, UserId},
    executor::Executor,
    locks::PanelLocks,
    monitor::{MonitorSettings, PanelMonitor, PassSummary},
    ports::{Notifier, PanelStore, RemotePanelConnector},
    provisioning::Provisioning,
    sessions::SessionPool,
    Result,
};

pub struct Engine {
    cfg: Arc<Config>,
    store: Arc<dyn PanelStore>,
    executor: Arc<Executor>,
    monitor: PanelMonitor,
    provisioning: Provisioning,
}

impl Engine {
    pub fn new(
        cfg: Arc<Config>,
        store: Arc<dyn PanelStore>,
        connector: Arc<dyn RemotePanelConnector>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let sessions = Arc::new(SessionPool::new(connector, cfg.management_credential()));
        let audit = AuditLogger::new(cfg.audit_log_path.clone(), cfg.audit_log_json);

        let executor = Arc::new(
            Executor::new(
                store.clone(),
                sessions.clone(),
                Arc::new(PanelLocks::default()),
                notifier,
                cfg.deactivation_credential.clone(),
            )
            .with_audit(audit.clone())
            .with_call_delay(cfg.remote_call_delay),
        );
        let monitor = PanelMonitor::new(
            store.clone(),
            sessions.clone(),
            executor.clone(),
            MonitorSettings::from_config(&cfg),
        );
        let provisioning = Provisioning::new(store.clone(), sessions).with_audit(audit);

        Self {
            cfg,
            store,
            executor,
            monitor,
            provisioning,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn store(&self) -> &Arc<dyn PanelStore> {
        &self.store
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn monitor(&self) -> &PanelMonitor {
        &self.monitor
    }

    pub fn provisioning(&self) -> &Provisioning {
        &self.provisioning
    }

    /// Run a monitor pass right away. `None` when one is already running.
    pub async fn run_check_now(&self) -> Result<Option<PassSummary>> {
        self.monitor.run_pass().await
    }

    pub async fn all_panels(&self) -> Result<Vec<Panel>> {
        self.store.list_panels(None).await
    }

    pub async fn operator_panels(&self, operator: UserId) -> Result<Vec<Panel>> {
        self.store.operator_panels(operator).await
    }
}
