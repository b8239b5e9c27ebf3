//! Recurring limit check over every active panel.
//!
//! - One pass per tick; a tick that finds a pass still running is skipped.
//! - Panels within a pass are checked concurrently, bounded by a semaphore.
//! - Expired panels are deactivated without looking at remote usage.
//! - A panel whose usage cannot be fetched is skipped for the cycle.
//! - Warnings are sent once per panel until the set of warned dimensions changes.
//! - A credential rotation left staged by an interrupted deactivation is
//!   settled before the panel is checked.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{
    sync::{Mutex, Semaphore},
    task::{JoinHandle, JoinSet},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    domain::{Panel, PanelId, PanelState, PanelUsage},
    errors::Error,
    events::{DeactivationReason, EngineEvent, PanelRef},
    executor::Executor,
    formatting::escape_html,
    limits::{self, Dimension, LimitCheckResult},
    ports::{PanelStore, RemotePanelClient},
    sessions::SessionPool,
    traffic::TrafficTracker,
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub warning_threshold: f64,
    pub concurrency: usize,
}

impl MonitorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            interval: cfg.monitoring_interval,
            warning_threshold: cfg.warning_threshold,
            concurrency: cfg.monitor_concurrency,
        }
    }
}

/// What happened to one panel during a pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PanelOutcome {
    Healthy,
    Warned,
    Deactivated,
    /// Nothing could be decided this cycle (remote unavailable, lost a race).
    Skipped(String),
    Failed(String),
    Inconsistent,
}

#[derive(Clone, Debug)]
pub struct PassSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub checked: usize,
    pub healthy: usize,
    pub warned: usize,
    pub deactivated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub inconsistent: usize,
}

impl PassSummary {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            checked: 0,
            healthy: 0,
            warned: 0,
            deactivated: 0,
            skipped: 0,
            failed: 0,
            inconsistent: 0,
        }
    }

    fn record(&mut self, outcome: &PanelOutcome) {
        self.checked += 1;
        match outcome {
            PanelOutcome::Healthy => self.healthy += 1,
            PanelOutcome::Warned => self.warned += 1,
            PanelOutcome::Deactivated => self.deactivated += 1,
            PanelOutcome::Skipped(_) => self.skipped += 1,
            PanelOutcome::Failed(_) => self.failed += 1,
            PanelOutcome::Inconsistent => self.inconsistent += 1,
        }
    }

    pub fn line(&self) -> String {
        format!(
            "{} checked: {} ok, {} warned, {} deactivated, {} skipped, {} failed, {} inconsistent",
            self.checked,
            self.healthy,
            self.warned,
            self.deactivated,
            self.skipped,
            self.failed,
            self.inconsistent
        )
    }
}

#[derive(Clone, Debug)]
pub struct MonitorStatus {
    pub running: bool,
    pub interval: Duration,
    pub passes: u64,
    pub last_pass: Option<PassSummary>,
}

/// Current usage of one panel as seen by an on-demand check.
#[derive(Clone, Debug)]
pub struct PanelInspection {
    pub panel: Panel,
    pub check: LimitCheckResult,
    /// False when the remote could not be reached and stored values were used.
    pub live: bool,
}

#[derive(Clone)]
pub struct PanelMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    store: Arc<dyn PanelStore>,
    sessions: Arc<SessionPool>,
    executor: Arc<Executor>,
    traffic: TrafficTracker,
    settings: MonitorSettings,
    pass_lock: Mutex<()>,
    state: Mutex<MonitorState>,
}

#[derive(Default)]
struct MonitorState {
    task: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
    passes: u64,
    last_pass: Option<PassSummary>,
    warned: HashMap<PanelId, BTreeSet<Dimension>>,
}

impl PanelMonitor {
    pub fn new(
        store: Arc<dyn PanelStore>,
        sessions: Arc<SessionPool>,
        executor: Arc<Executor>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                traffic: TrafficTracker::new(store.clone()),
                store,
                sessions,
                executor,
                settings,
                pass_lock: Mutex::new(()),
                state: Mutex::new(MonitorState::default()),
            }),
        }
    }

    /// Start the recurring loop. The first pass runs immediately.
    pub async fn start(&self) {
        let mut st = self.inner.state.lock().await;
        if st.task.is_some() {
            return;
        }

        let tok = CancellationToken::new();
        st.cancel = Some(tok.clone());
        let monitor = self.clone();
        let period = self.inner.settings.interval;
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                  _ = tok.cancelled() => break,
                  _ = tick.tick() => {
                    if let Err(e) = monitor.run_pass().await {
                      tracing::error!(error = %e, "monitor pass failed");
                    }
                  }
                }
            }
            tracing::info!("monitor loop stopped");
        });

        st.task = Some(handle);
        tracing::info!(
            interval_secs = period.as_secs(),
            concurrency = self.inner.settings.concurrency,
            "monitor loop started"
        );
    }

    /// Stop the loop and wait for it to exit. A pass already in flight runs
    /// to completion first.
    pub async fn stop(&self) {
        let (tok, task) = {
            let mut st = self.inner.state.lock().await;
            (st.cancel.take(), st.task.take())
        };
        if let Some(tok) = tok {
            tok.cancel();
        }
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "monitor loop ended abnormally");
            }
        }
    }

    pub async fn status(&self) -> MonitorStatus {
        let st = self.inner.state.lock().await;
        MonitorStatus {
            running: st.task.is_some(),
            interval: self.inner.settings.interval,
            passes: st.passes,
            last_pass: st.last_pass.clone(),
        }
    }

    pub async fn status_html(&self) -> String {
        let status = self.status().await;
        let mut lines = vec![format!(
            "<b>Monitor</b>: {} (every {}s, {} passes)",
            if status.running { "running" } else { "stopped" },
            status.interval.as_secs(),
            status.passes
        )];
        match status.last_pass {
            Some(p) => lines.push(format!(
                "Last pass {}: {}",
                escape_html(&p.finished_at.format("%Y-%m-%d %H:%M UTC").to_string()),
                escape_html(&p.line())
            )),
            None => lines.push("No pass has run yet".to_string()),
        }
        lines.join("\n")
    }

    /// Run one pass now. Returns `None` when a pass is already in flight.
    pub async fn run_pass(&self) -> Result<Option<PassSummary>> {
        let Ok(_pass) = self.inner.pass_lock.try_lock() else {
            tracing::info!("previous monitor pass still running, skipping");
            return Ok(None);
        };

        let mut summary = PassSummary::new(Utc::now());
        let panels = self.inner.store.list_panels(Some(PanelState::Active)).await?;
        tracing::debug!(panels = panels.len(), "monitor pass started");
        let active: BTreeSet<PanelId> = panels.iter().map(|p| p.id).collect();

        let permits = Arc::new(Semaphore::new(self.inner.settings.concurrency.max(1)));
        let mut set = JoinSet::new();
        for panel in panels {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::External(format!("worker pool closed: {e}")))?;
            let monitor = self.clone();
            set.spawn(async move {
                let _permit = permit;
                let id = panel.id;
                (id, monitor.check_panel(panel).await)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, outcome)) => {
                    if let PanelOutcome::Skipped(why) | PanelOutcome::Failed(why) = &outcome {
                        tracing::warn!(panel = id.0, reason = %why, "panel not evaluated");
                    }
                    summary.record(&outcome);
                }
                Err(e) => {
                    tracing::error!(error = %e, "panel check task failed");
                    summary.record(&PanelOutcome::Failed(e.to_string()));
                }
            }
        }

        summary.finished_at = Utc::now();
        tracing::info!(summary = %summary.line(), "monitor pass finished");
        let mut st = self.inner.state.lock().await;
        st.passes += 1;
        st.last_pass = Some(summary.clone());
        st.warned.retain(|id, _| active.contains(id));
        Ok(Some(summary))
    }

    async fn check_panel(&self, panel: Panel) -> PanelOutcome {
        if panel.pending_password.is_some() {
            if let Err(e) = self
                .inner
                .executor
                .recover_interrupted_rotation(panel.id)
                .await
            {
                return match e {
                    Error::InconsistentState { .. } => PanelOutcome::Inconsistent,
                    other => PanelOutcome::Skipped(format!("staged rotation unresolved: {other}")),
                };
            }
        }

        let now = Utc::now();
        if limits::is_expired(&panel, now) {
            return self.enforce(&panel, DeactivationReason::Expired).await;
        }

        let usage = match self.fetch_usage(&panel, now).await {
            Ok(u) => u,
            Err(e) if e.is_unauthorized() => return self.handle_rejected_credential(&panel).await,
            Err(e) => return PanelOutcome::Skipped(e.to_string()),
        };

        let effective = match self
            .inner
            .traffic
            .reconcile(panel.id, usage.observed_traffic)
            .await
        {
            Ok(v) => v,
            Err(e) => return PanelOutcome::Failed(e.to_string()),
        };

        let check = limits::evaluate(
            &panel,
            effective,
            usage.user_count,
            now,
            self.inner.settings.warning_threshold,
        );
        if let Some(reason) = DeactivationReason::from_check(&check) {
            return self.enforce(&panel, reason).await;
        }

        if check.warnings.is_empty() {
            self.inner.state.lock().await.warned.remove(&panel.id);
            return PanelOutcome::Healthy;
        }

        let dims: BTreeSet<Dimension> = check.warnings.iter().map(|w| w.dimension).collect();
        let is_new = {
            let mut st = self.inner.state.lock().await;
            if st.warned.get(&panel.id) == Some(&dims) {
                false
            } else {
                st.warned.insert(panel.id, dims);
                true
            }
        };
        if is_new {
            self.inner
                .executor
                .emit(
                    EngineEvent::LimitWarning {
                        panel: PanelRef::from(&panel),
                        warnings: check.warnings.clone(),
                        remaining_days: check.remaining_days,
                    },
                    None,
                )
                .await;
        }
        PanelOutcome::Warned
    }

    async fn enforce(&self, panel: &Panel, reason: DeactivationReason) -> PanelOutcome {
        self.inner.state.lock().await.warned.remove(&panel.id);
        match self
            .inner
            .executor
            .deactivate_if_active(panel.id, reason)
            .await
        {
            Ok(Some(_)) => PanelOutcome::Deactivated,
            Ok(None) => PanelOutcome::Skipped("no longer active".to_string()),
            Err(Error::InconsistentState { .. }) => PanelOutcome::Inconsistent,
            Err(e) => PanelOutcome::Failed(e.to_string()),
        }
    }

    /// Usage through the cached session; an expired token gets one fresh retry.
    async fn fetch_usage(&self, panel: &Panel, now: DateTime<Utc>) -> Result<PanelUsage> {
        let session = self.inner.sessions.panel_session(panel).await?;
        let users = match session.fetch_users(&panel.username).await {
            Err(e) if e.is_unauthorized() => {
                self.inner.sessions.invalidate(&panel.username).await;
                let fresh: Arc<dyn RemotePanelClient> = self
                    .inner
                    .sessions
                    .fresh_session(&panel.username, &panel.password)
                    .await?;
                fresh.fetch_users(&panel.username).await?
            }
            other => other?,
        };
        Ok(PanelUsage::from_sub_accounts(&users, now))
    }

    /// The stored credential no longer works. With a fixed deactivation
    /// credential we can tell whether the panel is locked remotely.
    async fn handle_rejected_credential(&self, panel: &Panel) -> PanelOutcome {
        self.inner.sessions.invalidate(&panel.username).await;
        let Some(sentinel) = self.inner.executor.credential().sentinel() else {
            return PanelOutcome::Skipped("stored credential rejected".to_string());
        };
        if self
            .inner
            .sessions
            .check_credential(&panel.username, sentinel)
            .await
            .is_err()
        {
            return PanelOutcome::Skipped("stored credential rejected".to_string());
        }
        self.inner
            .executor
            .emit(
                EngineEvent::InconsistentState {
                    panel: PanelRef::from(panel),
                    detail: "active locally but the remote credential is the deactivation credential"
                        .to_string(),
                },
                None,
            )
            .await;
        PanelOutcome::Inconsistent
    }

    /// Evaluate one panel on demand without enforcing anything. Falls back to
    /// the stored traffic when the remote cannot be reached.
    pub async fn inspect(&self, id: PanelId) -> Result<PanelInspection> {
        let panel = self
            .inner
            .store
            .panel(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("panel {id}")))?;
        let now = Utc::now();

        let (effective, user_count, live) = match self.fetch_usage(&panel, now).await {
            Ok(usage) if panel.is_active() => {
                let effective = self
                    .inner
                    .traffic
                    .reconcile(panel.id, usage.observed_traffic)
                    .await?;
                (effective, usage.user_count, true)
            }
            Ok(usage) => (
                self.inner.traffic.current(panel.id).await?,
                usage.user_count,
                true,
            ),
            Err(e) => {
                tracing::debug!(panel = %panel.username, error = %e, "inspect using stored values");
                (self.inner.traffic.current(panel.id).await?, 0, false)
            }
        };

        let check = limits::evaluate(
            &panel,
            effective,
            user_count,
            now,
            self.inner.settings.warning_threshold,
        );
        Ok(PanelInspection { panel, check, live })
    }
}
