use std::{collections::HashMap, sync::Arc};

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::PanelId;

/// One async mutex per panel. Every state transition holds its panel's guard,
/// so the monitor loop and manual actions never interleave on the same panel.
#[derive(Default)]
pub struct PanelLocks {
    inner: Mutex<HashMap<PanelId, Arc<Mutex<()>>>>,
}

impl PanelLocks {
    pub async fn lock_panel(&self, id: PanelId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop the entry of a deleted panel.
    pub async fn forget(&self, id: PanelId) {
        self.inner.lock().await.remove(&id);
    }
}
