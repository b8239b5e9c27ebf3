use std::sync::Arc;

use chrono::Utc;

use crate::{domain::PanelId, ports::PanelStore, Result};

/// Per-panel cumulative traffic counter that never decreases, no matter how
/// sub-accounts are deleted or recreated on the remote side.
#[derive(Clone)]
pub struct TrafficTracker {
    store: Arc<dyn PanelStore>,
}

impl TrafficTracker {
    pub fn new(store: Arc<dyn PanelStore>) -> Self {
        Self { store }
    }

    /// Fold a freshly observed total into the counter and return the effective
    /// cumulative traffic. Only writes when the observation raises the counter.
    pub async fn reconcile(&self, id: PanelId, observed: u64) -> Result<u64> {
        let effective = self
            .store
            .raise_cumulative_traffic(id, observed, Utc::now())
            .await?;
        tracing::debug!(panel = id.0, observed, effective, "traffic reconciled");
        Ok(effective)
    }

    /// Record traffic of a sub-account about to be deleted. Must complete
    /// before the remote deletion is issued.
    pub async fn preserve(&self, id: PanelId, amount: u64) -> Result<u64> {
        let total = self.store.preserve_traffic(id, amount, Utc::now()).await?;
        tracing::info!(panel = id.0, amount, cumulative = total, "traffic preserved");
        Ok(total)
    }

    /// Stored effective value, 0 when nothing was recorded yet.
    pub async fn current(&self, id: PanelId) -> Result<u64> {
        Ok(self
            .store
            .cumulative_traffic(id)
            .await?
            .map(|c| c.bytes)
            .unwrap_or(0))
    }
}
