//! SQLite persistence for panels and their cumulative traffic counters.
//!
//! Timestamps are stored as RFC 3339 text, byte counts as INTEGER. State and
//! credential columns are only changed together by the conditional
//! `commit_*` updates.

use std::{path::Path, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};
use warden_core::{
    domain::{
        CumulativeTraffic, DeactivationCommit, DeactivationInfo, NewPanel, Panel, PanelId,
        PanelState, Quotas, Secret, UserId,
    },
    errors::Error,
    ports::PanelStore,
    Result,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS panels (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        operator_id INTEGER NOT NULL,
        display_name TEXT,
        username TEXT NOT NULL UNIQUE,
        password TEXT NOT NULL,
        original_password TEXT,
        pending_password TEXT,
        max_users INTEGER NOT NULL,
        max_traffic INTEGER NOT NULL,
        max_total_time INTEGER NOT NULL,
        validity_days INTEGER NOT NULL,
        state TEXT NOT NULL DEFAULT 'active',
        deactivation_reason TEXT,
        deactivated_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_panels_operator ON panels(operator_id)",
    "CREATE INDEX IF NOT EXISTS idx_panels_state ON panels(state)",
    r#"
    CREATE TABLE IF NOT EXISTS cumulative_traffic (
        panel_id INTEGER PRIMARY KEY REFERENCES panels(id) ON DELETE CASCADE,
        bytes INTEGER NOT NULL DEFAULT 0,
        last_updated TEXT NOT NULL
    )
    "#,
];

const PANEL_COLUMNS: &str = "id, operator_id, display_name, username, password, original_password, \
     pending_password, max_users, max_traffic, max_total_time, validity_days, state, deactivation_reason, \
     deactivated_at, created_at, updated_at";

#[derive(Clone, Debug)]
pub struct SqlitePanelStore {
    pool: SqlitePool,
}

impl SqlitePanelStore {
    /// Open (creating if missing) the database file and apply the schema.
    pub async fn connect(path: &Path) -> Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .map_err(store_err)?;
        tracing::info!(path = %path.display(), "database opened");
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.init_db().await?;
        Ok(store)
    }

    async fn init_db(&self) -> Result<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(store_err)?;
        }
        Ok(())
    }

    async fn require_panel(&self, id: PanelId) -> Result<Panel> {
        self.panel(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("panel {id}")))
    }

    async fn fetch_panels(&self, sql: &str, bind: Option<String>) -> Result<Vec<Panel>> {
        let mut q = sqlx::query(sql);
        if let Some(v) = bind {
            q = q.bind(v);
        }
        let rows = q.fetch_all(&self.pool).await.map_err(store_err)?;
        rows.iter().map(panel_from_row).collect()
    }
}

#[async_trait]
impl PanelStore for SqlitePanelStore {
    async fn insert_panel(&self, panel: NewPanel) -> Result<Panel> {
        let ts = panel.created_at.to_rfc3339();
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let res = sqlx::query(
            r#"
            INSERT INTO panels (
                operator_id, display_name, username, password,
                max_users, max_traffic, max_total_time, validity_days,
                state, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, ?)
            "#,
        )
        .bind(panel.operator.0)
        .bind(&panel.display_name)
        .bind(&panel.username)
        .bind(panel.password.expose())
        .bind(panel.quotas.max_users as i64)
        .bind(to_i64(panel.quotas.max_traffic))
        .bind(to_i64(panel.quotas.max_total_time))
        .bind(panel.quotas.validity_days as i64)
        .bind(&ts)
        .bind(&ts)
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => Error::InvalidInput(format!(
                "panel {} is already registered",
                panel.username
            )),
            other => store_err(other),
        })?;
        let id = res.last_insert_rowid();

        sqlx::query(
            "INSERT INTO cumulative_traffic (panel_id, bytes, last_updated) VALUES (?, 0, ?)",
        )
        .bind(id)
        .bind(&ts)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        tracing::debug!(id, username = %panel.username, "panel inserted");
        self.require_panel(PanelId(id)).await
    }

    async fn panel(&self, id: PanelId) -> Result<Option<Panel>> {
        let row = sqlx::query(&format!("SELECT {PANEL_COLUMNS} FROM panels WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(panel_from_row).transpose()
    }

    async fn panel_by_username(&self, username: &str) -> Result<Option<Panel>> {
        let row = sqlx::query(&format!(
            "SELECT {PANEL_COLUMNS} FROM panels WHERE username = ?"
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.as_ref().map(panel_from_row).transpose()
    }

    async fn list_panels(&self, state: Option<PanelState>) -> Result<Vec<Panel>> {
        match state {
            Some(s) => {
                self.fetch_panels(
                    &format!("SELECT {PANEL_COLUMNS} FROM panels WHERE state = ? ORDER BY id"),
                    Some(s.as_str().to_string()),
                )
                .await
            }
            None => {
                self.fetch_panels(&format!("SELECT {PANEL_COLUMNS} FROM panels ORDER BY id"), None)
                    .await
            }
        }
    }

    async fn operator_panels(&self, operator: UserId) -> Result<Vec<Panel>> {
        let rows = sqlx::query(&format!(
            "SELECT {PANEL_COLUMNS} FROM panels WHERE operator_id = ? ORDER BY id"
        ))
        .bind(operator.0)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(panel_from_row).collect()
    }

    async fn update_quotas(&self, id: PanelId, quotas: &Quotas) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE panels
            SET max_users = ?, max_traffic = ?, max_total_time = ?, validity_days = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(quotas.max_users as i64)
        .bind(to_i64(quotas.max_traffic))
        .bind(to_i64(quotas.max_total_time))
        .bind(quotas.validity_days as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        if res.rows_affected() == 0 {
            return Err(Error::NotFound(format!("panel {id}")));
        }
        Ok(())
    }

    async fn stage_rotation(
        &self,
        id: PanelId,
        original: &Secret,
        pending: &Secret,
    ) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE panels
            SET original_password = ?, pending_password = ?, updated_at = ?
            WHERE id = ? AND state = 'active'
            "#,
        )
        .bind(original.expose())
        .bind(pending.expose())
        .bind(Utc::now().to_rfc3339())
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        if res.rows_affected() == 0 {
            return Err(self.transition_error(id, "panel is not active").await);
        }
        Ok(())
    }

    async fn clear_staged_rotation(&self, id: PanelId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE panels
            SET original_password = NULL, pending_password = NULL
            WHERE id = ? AND state = 'active'
            "#,
        )
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn commit_deactivation(&self, id: PanelId, commit: &DeactivationCommit) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE panels
            SET state = 'deactivated',
                password = ?,
                original_password = ?,
                pending_password = NULL,
                deactivation_reason = ?,
                deactivated_at = ?,
                updated_at = ?
            WHERE id = ? AND state = 'active'
            "#,
        )
        .bind(commit.new_password.expose())
        .bind(commit.original_password.expose())
        .bind(&commit.reason)
        .bind(commit.at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        if res.rows_affected() == 0 {
            return Err(self.transition_error(id, "panel is not active").await);
        }
        Ok(())
    }

    async fn commit_reactivation(&self, id: PanelId, restored_password: &Secret) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE panels
            SET state = 'active',
                password = ?,
                original_password = NULL,
                pending_password = NULL,
                deactivation_reason = NULL,
                deactivated_at = NULL,
                updated_at = ?
            WHERE id = ? AND state = 'deactivated'
            "#,
        )
        .bind(restored_password.expose())
        .bind(Utc::now().to_rfc3339())
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        if res.rows_affected() == 0 {
            return Err(self.transition_error(id, "panel is not deactivated").await);
        }
        Ok(())
    }

    async fn delete_panel(&self, id: PanelId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        sqlx::query("DELETE FROM cumulative_traffic WHERE panel_id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        sqlx::query("DELETE FROM panels WHERE id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn cumulative_traffic(&self, id: PanelId) -> Result<Option<CumulativeTraffic>> {
        let row = sqlx::query(
            "SELECT panel_id, bytes, last_updated FROM cumulative_traffic WHERE panel_id = ?",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(CumulativeTraffic {
            panel_id: PanelId(row.try_get("panel_id").map_err(store_err)?),
            bytes: from_i64(row.try_get("bytes").map_err(store_err)?),
            last_updated: parse_ts(&row.try_get::<String, _>("last_updated").map_err(store_err)?)?,
        }))
    }

    async fn raise_cumulative_traffic(
        &self,
        id: PanelId,
        observed: u64,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        sqlx::query(
            r#"
            INSERT INTO cumulative_traffic (panel_id, bytes, last_updated)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(panel_id) DO UPDATE
            SET bytes = excluded.bytes,
                last_updated = excluded.last_updated
            WHERE excluded.bytes > cumulative_traffic.bytes
            "#,
        )
        .bind(id.0)
        .bind(to_i64(observed))
        .bind(at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;
        let bytes: i64 = sqlx::query_scalar("SELECT bytes FROM cumulative_traffic WHERE panel_id = ?")
            .bind(id.0)
            .fetch_one(&mut *tx)
            .await
            .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        Ok(from_i64(bytes))
    }

    async fn preserve_traffic(&self, id: PanelId, amount: u64, at: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        sqlx::query(
            r#"
            INSERT INTO cumulative_traffic (panel_id, bytes, last_updated)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(panel_id) DO UPDATE
            SET bytes = cumulative_traffic.bytes + excluded.bytes,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(id.0)
        .bind(to_i64(amount))
        .bind(at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;
        let bytes: i64 = sqlx::query_scalar("SELECT bytes FROM cumulative_traffic WHERE panel_id = ?")
            .bind(id.0)
            .fetch_one(&mut *tx)
            .await
            .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        Ok(from_i64(bytes))
    }
}

impl SqlitePanelStore {
    /// Error for a conditional update that matched no row.
    async fn transition_error(&self, id: PanelId, detail: &str) -> Error {
        match self.panel(id).await {
            Ok(Some(p)) => Error::inconsistent(p.username, detail),
            Ok(None) => Error::NotFound(format!("panel {id}")),
            Err(e) => e,
        }
    }
}

fn panel_from_row(row: &SqliteRow) -> Result<Panel> {
    let state: String = row.try_get("state").map_err(store_err)?;
    let state = PanelState::parse(&state)
        .ok_or_else(|| Error::StoreUnavailable(format!("unknown panel state {state:?}")))?;

    let reason: Option<String> = row.try_get("deactivation_reason").map_err(store_err)?;
    let deactivated_at: Option<String> = row.try_get("deactivated_at").map_err(store_err)?;
    let deactivation = match (reason, deactivated_at) {
        (Some(reason), Some(at)) => Some(DeactivationInfo {
            reason,
            at: parse_ts(&at)?,
        }),
        _ => None,
    };

    Ok(Panel {
        id: PanelId(row.try_get("id").map_err(store_err)?),
        operator: UserId(row.try_get("operator_id").map_err(store_err)?),
        display_name: row.try_get("display_name").map_err(store_err)?,
        username: row.try_get("username").map_err(store_err)?,
        password: Secret::new(row.try_get::<String, _>("password").map_err(store_err)?),
        original_password: row
            .try_get::<Option<String>, _>("original_password")
            .map_err(store_err)?
            .map(Secret::new),
        pending_password: row
            .try_get::<Option<String>, _>("pending_password")
            .map_err(store_err)?
            .map(Secret::new),
        quotas: Quotas {
            max_users: row.try_get::<i64, _>("max_users").map_err(store_err)?.max(0) as u32,
            max_traffic: from_i64(row.try_get("max_traffic").map_err(store_err)?),
            max_total_time: from_i64(row.try_get("max_total_time").map_err(store_err)?),
            validity_days: row.try_get::<i64, _>("validity_days").map_err(store_err)?.max(0) as u32,
        },
        state,
        deactivation,
        created_at: parse_ts(&row.try_get::<String, _>("created_at").map_err(store_err)?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at").map_err(store_err)?)?,
    })
}

fn store_err(e: sqlx::Error) -> Error {
    Error::StoreUnavailable(e.to_string())
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| Error::StoreUnavailable(format!("bad timestamp {s:?}: {e}")))
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn from_i64(v: i64) -> u64 {
    v.max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    async fn store() -> SqlitePanelStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqlitePanelStore::from_pool(pool).await.unwrap()
    }

    fn new_panel(username: &str) -> NewPanel {
        NewPanel {
            operator: UserId(77),
            display_name: Some("Shop".into()),
            username: username.into(),
            password: Secret::new("pw"),
            quotas: Quotas::default(),
            created_at: Utc::now(),
        }
    }

    fn commit(reason: &str) -> DeactivationCommit {
        DeactivationCommit {
            reason: reason.into(),
            at: Utc::now(),
            original_password: Secret::new("pw"),
            new_password: Secret::new("rotated"),
        }
    }

    #[tokio::test]
    async fn insert_creates_zeroed_counter() {
        let s = store().await;
        let p = s.insert_panel(new_panel("shop")).await.unwrap();
        assert!(p.is_active());
        assert_eq!(p.quotas, Quotas::default());
        assert_eq!(p.display_name.as_deref(), Some("Shop"));

        let c = s.cumulative_traffic(p.id).await.unwrap().unwrap();
        assert_eq!(c.bytes, 0);

        let dup = s.insert_panel(new_panel("shop")).await.unwrap_err();
        assert!(matches!(dup, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn counter_only_moves_up() {
        let s = store().await;
        let p = s.insert_panel(new_panel("shop")).await.unwrap();
        let now = Utc::now();

        assert_eq!(s.raise_cumulative_traffic(p.id, 90 * GIB, now).await.unwrap(), 90 * GIB);
        assert_eq!(s.raise_cumulative_traffic(p.id, 40 * GIB, now).await.unwrap(), 90 * GIB);
        assert_eq!(s.raise_cumulative_traffic(p.id, 65 * GIB, now).await.unwrap(), 90 * GIB);
        assert_eq!(s.raise_cumulative_traffic(p.id, 110 * GIB, now).await.unwrap(), 110 * GIB);
    }

    #[tokio::test]
    async fn preserved_traffic_adds_to_stored_total() {
        let s = store().await;
        let p = s.insert_panel(new_panel("shop")).await.unwrap();
        let now = Utc::now();

        s.raise_cumulative_traffic(p.id, 50 * GIB, now).await.unwrap();
        assert_eq!(s.preserve_traffic(p.id, 35 * GIB, now).await.unwrap(), 85 * GIB);
        assert_eq!(s.raise_cumulative_traffic(p.id, 20 * GIB, now).await.unwrap(), 85 * GIB);
        assert_eq!(s.preserve_traffic(p.id, 5 * GIB, now).await.unwrap(), 90 * GIB);
        assert_eq!(s.raise_cumulative_traffic(p.id, 95 * GIB, now).await.unwrap(), 95 * GIB);
        assert_eq!(s.cumulative_traffic(p.id).await.unwrap().unwrap().bytes, 95 * GIB);
    }

    #[tokio::test]
    async fn deactivation_and_reactivation_commit_together() {
        let s = store().await;
        let p = s.insert_panel(new_panel("shop")).await.unwrap();

        s.stage_rotation(p.id, &Secret::new("pw"), &Secret::new("rotated"))
            .await
            .unwrap();
        s.commit_deactivation(p.id, &commit("limit exceeded")).await.unwrap();
        let d = s.panel(p.id).await.unwrap().unwrap();
        assert_eq!(d.state, PanelState::Deactivated);
        assert_eq!(d.password, Secret::new("rotated"));
        assert_eq!(d.original_password, Some(Secret::new("pw")));
        assert!(d.pending_password.is_none());
        assert_eq!(d.deactivation.unwrap().reason, "limit exceeded");

        // Second commit on a deactivated row is refused.
        let again = s.commit_deactivation(p.id, &commit("x")).await.unwrap_err();
        assert!(matches!(again, Error::InconsistentState { .. }));

        s.commit_reactivation(p.id, &Secret::new("pw")).await.unwrap();
        let r = s.panel(p.id).await.unwrap().unwrap();
        assert!(r.is_active());
        assert_eq!(r.password, Secret::new("pw"));
        assert!(r.original_password.is_none());
        assert!(r.deactivation.is_none());

        let again = s.commit_reactivation(p.id, &Secret::new("pw")).await.unwrap_err();
        assert!(matches!(again, Error::InconsistentState { .. }));
    }

    #[tokio::test]
    async fn staged_rotation_is_cleared_only_while_active() {
        let s = store().await;
        let p = s.insert_panel(new_panel("shop")).await.unwrap();
        s.stage_rotation(p.id, &Secret::new("pw"), &Secret::new("next"))
            .await
            .unwrap();
        let staged = s.panel(p.id).await.unwrap().unwrap();
        assert_eq!(staged.original_password, Some(Secret::new("pw")));
        assert_eq!(staged.pending_password, Some(Secret::new("next")));
        assert_eq!(staged.password, Secret::new("pw"));

        s.clear_staged_rotation(p.id).await.unwrap();
        let cleared = s.panel(p.id).await.unwrap().unwrap();
        assert!(cleared.original_password.is_none());
        assert!(cleared.pending_password.is_none());

        s.stage_rotation(p.id, &Secret::new("pw"), &Secret::new("rotated"))
            .await
            .unwrap();
        s.commit_deactivation(p.id, &commit("manual")).await.unwrap();
        s.clear_staged_rotation(p.id).await.unwrap();
        assert!(s.panel(p.id).await.unwrap().unwrap().original_password.is_some());
    }

    #[tokio::test]
    async fn delete_removes_panel_and_counter() {
        let s = store().await;
        let p = s.insert_panel(new_panel("shop")).await.unwrap();
        s.delete_panel(p.id).await.unwrap();
        assert!(s.panel(p.id).await.unwrap().is_none());
        assert!(s.cumulative_traffic(p.id).await.unwrap().is_none());

        let missing = s.commit_reactivation(p.id, &Secret::new("pw")).await.unwrap_err();
        assert!(matches!(missing, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn listing_filters() {
        let s = store().await;
        let a = s.insert_panel(new_panel("alpha")).await.unwrap();
        let mut other = new_panel("beta");
        other.operator = UserId(88);
        s.insert_panel(other).await.unwrap();
        s.stage_rotation(a.id, &Secret::new("pw"), &Secret::new("rotated"))
            .await
            .unwrap();
        s.commit_deactivation(a.id, &commit("manual")).await.unwrap();

        assert_eq!(s.list_panels(None).await.unwrap().len(), 2);
        let active = s.list_panels(Some(PanelState::Active)).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].username, "beta");
        assert_eq!(s.operator_panels(UserId(77)).await.unwrap().len(), 1);
        assert!(s.panel_by_username("beta").await.unwrap().is_some());

        let q = Quotas {
            max_users: 3,
            ..Quotas::default()
        };
        s.update_quotas(a.id, &q).await.unwrap();
        assert_eq!(s.panel(a.id).await.unwrap().unwrap().quotas.max_users, 3);
        assert!(matches!(
            s.update_quotas(PanelId(999), &q).await,
            Err(Error::NotFound(_))
        ));
    }
}
