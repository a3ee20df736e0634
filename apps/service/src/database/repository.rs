use anyhow::Result;
use async_trait::async_trait;
use libsql::params;

use super::models::ProblemStateRecord;
use crate::notifications::problem::NotifyProblem;
use crate::pool::{LibsqlManager, LibsqlPool};

/// Persistent state behind notifications: registered targets, known grids
/// and the per-problem ledger deciding what to announce
#[async_trait]
pub trait ProblemStore: Send + Sync {
    /// Whether a notification with this id is still registered
    async fn notification_exists(&self, notification_id: i64) -> Result<bool>;

    /// Register a notification, or refresh its params, and return its id
    async fn upsert_notification(&self, name: &str, kind: &str, params: &str) -> Result<i64>;

    /// Remember a grid name; already known names are ignored
    async fn record_grid(&self, grid_name: &str) -> Result<()>;

    async fn known_grids(&self) -> Result<Vec<String>>;

    /// Update the ledger with the problems observed at `now` and return
    /// those that must be announced. Committed before returning.
    ///
    /// A problem is announced when it has no ledger row (a row is only
    /// created when `frequency > 0`) or when its row has expired, in which
    /// case the row is pushed `frequency` seconds forward. Rows that have
    /// not expired only get `last_seen` refreshed.
    async fn reconcile(
        &self,
        notification_id: i64,
        problems: &[NotifyProblem],
        frequency: i64,
        now: i64,
    ) -> Result<Vec<NotifyProblem>>;

    /// Drop stale ledger rows.
    ///
    /// With `resolve_after > 0`, rows not seen for `resolve_after` seconds
    /// are deleted and their app data returned, so each problem resolves
    /// exactly once. Otherwise expired rows are deleted and nothing is
    /// reported.
    async fn resolve(&self, notification_id: i64, resolve_after: i64, now: i64) -> Result<Vec<String>>;

    async fn problem_records(&self, notification_id: i64) -> Result<Vec<ProblemStateRecord>>;
}

/// LibSQL database implementation
pub struct DatabaseImpl {
    pool: LibsqlPool,
}

impl DatabaseImpl {
    /// Create a new database instance from a pool
    pub fn new_from_pool(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    /// Get a connection from the pool
    async fn get_conn(&self) -> Result<deadpool::managed::Object<LibsqlManager>> {
        Ok(self.pool.get().await?)
    }
}

#[async_trait]
impl ProblemStore for DatabaseImpl {
    async fn notification_exists(&self, notification_id: i64) -> Result<bool> {
        let conn = self.get_conn().await?;
        let mut rows = conn.query("SELECT id FROM notifications WHERE id = ?", params![notification_id]).await?;
        Ok(rows.next().await?.is_some())
    }

    async fn upsert_notification(&self, name: &str, kind: &str, params: &str) -> Result<i64> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO notifications (name, type, params) VALUES (?, ?, ?)
             ON CONFLICT(name, type) DO UPDATE SET params = excluded.params",
            params![name.to_string(), kind.to_string(), params.to_string()],
        )
        .await?;

        let mut rows = conn
            .query("SELECT id FROM notifications WHERE name = ? AND type = ?", params![name.to_string(), kind.to_string()])
            .await?;
        let row = rows.next().await?.ok_or_else(|| anyhow::anyhow!("notification {name} ({kind}) missing after upsert"))?;
        Ok(row.get(0)?)
    }

    async fn record_grid(&self, grid_name: &str) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute("INSERT OR IGNORE INTO grids (grid_name) VALUES (?)", params![grid_name.to_string()]).await?;
        Ok(())
    }

    async fn known_grids(&self) -> Result<Vec<String>> {
        let conn = self.get_conn().await?;
        let mut rows = conn.query("SELECT DISTINCT grid_name FROM grids ORDER BY grid_name", ()).await?;

        let mut grids = Vec::new();
        while let Some(row) = rows.next().await? {
            grids.push(row.get(0)?);
        }
        Ok(grids)
    }

    async fn reconcile(
        &self,
        notification_id: i64,
        problems: &[NotifyProblem],
        frequency: i64,
        now: i64,
    ) -> Result<Vec<NotifyProblem>> {
        let conn = self.get_conn().await?;
        let tx = conn.transaction().await?;
        let expires = now + frequency;
        let mut to_notify = Vec::new();

        for problem in problems {
            let checksum = problem.checksum();
            let existing: Option<i64> = {
                let mut rows = tx
                    .query(
                        "SELECT expires FROM notification_problems WHERE notification_id = ? AND checksum = ?",
                        params![notification_id, checksum.clone()],
                    )
                    .await?;
                match rows.next().await? {
                    Some(row) => Some(row.get(0)?),
                    None => None,
                }
            };

            match existing {
                None => {
                    if frequency > 0 {
                        tx.execute(
                            "INSERT INTO notification_problems (notification_id, checksum, expires, last_seen, app_data)
                             VALUES (?, ?, ?, ?, ?)
                             ON CONFLICT(notification_id, checksum) DO NOTHING",
                            params![notification_id, checksum, expires, now, problem.app_data()],
                        )
                        .await?;
                    }
                    to_notify.push(problem.clone());
                }
                Some(row_expires) if row_expires <= now => {
                    tx.execute(
                        "UPDATE notification_problems SET expires = ?, last_seen = ? WHERE notification_id = ? AND checksum = ?",
                        params![expires, now, notification_id, checksum],
                    )
                    .await?;
                    to_notify.push(problem.clone());
                }
                Some(_) => {
                    tx.execute(
                        "UPDATE notification_problems SET last_seen = ? WHERE notification_id = ? AND checksum = ?",
                        params![now, notification_id, checksum],
                    )
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(to_notify)
    }

    async fn resolve(&self, notification_id: i64, resolve_after: i64, now: i64) -> Result<Vec<String>> {
        let conn = self.get_conn().await?;

        if resolve_after <= 0 {
            conn.execute(
                "DELETE FROM notification_problems WHERE notification_id = ? AND expires <= ?",
                params![notification_id, now],
            )
            .await?;
            return Ok(Vec::new());
        }

        let cutoff = now - resolve_after;
        let tx = conn.transaction().await?;
        let mut resolved = Vec::new();
        {
            let mut rows = tx
                .query(
                    "SELECT app_data FROM notification_problems WHERE notification_id = ? AND last_seen <= ? ORDER BY id",
                    params![notification_id, cutoff],
                )
                .await?;
            while let Some(row) = rows.next().await? {
                if let Some(app_data) = row.get::<Option<String>>(0)? {
                    resolved.push(app_data);
                }
            }
        }
        tx.execute(
            "DELETE FROM notification_problems WHERE notification_id = ? AND last_seen <= ?",
            params![notification_id, cutoff],
        )
        .await?;
        tx.commit().await?;

        Ok(resolved)
    }

    async fn problem_records(&self, notification_id: i64) -> Result<Vec<ProblemStateRecord>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT notification_id, checksum, expires, last_seen, app_data FROM notification_problems
                 WHERE notification_id = ? ORDER BY id",
                params![notification_id],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(ProblemStateRecord {
                notification_id: row.get(0)?,
                checksum: row.get(1)?,
                expires: row.get(2)?,
                last_seen: row.get(3)?,
                app_data: row.get(4)?,
            });
        }
        Ok(records)
    }
}
