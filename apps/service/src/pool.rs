use std::path::Path;

use anyhow::Result;
use deadpool::managed::{self, Pool, PoolConfig, RecycleError, RecycleResult};
use libsql::{Connection, Database, Error as LibsqlError};

pub struct LibsqlManager {
    database: Database,
}

impl LibsqlManager {
    pub fn new(database: Database) -> Self {
        Self { database }
    }
}

impl managed::Manager for LibsqlManager {
    type Type = Connection;
    type Error = LibsqlError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        let conn = self.database.connect()?;
        // concurrent notification runs write through separate connections
        conn.query("PRAGMA busy_timeout = 5000", ()).await?;
        Ok(conn)
    }

    async fn recycle(&self, conn: &mut Self::Type, _: &managed::Metrics) -> RecycleResult<Self::Error> {
        let mut rows = conn.query("SELECT 1", ()).await?;
        match rows.next().await? {
            Some(_) => Ok(()),
            None => Err(RecycleError::Message("connection returned no rows for SELECT 1".into())),
        }
    }
}

pub type LibsqlPool = Pool<LibsqlManager>;

/// Open (creating if needed) the local database at `path`
pub async fn open_pool(path: &Path, max_size: usize) -> Result<LibsqlPool> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let database = libsql::Builder::new_local(path).build().await?;
    let pool = Pool::builder(LibsqlManager::new(database)).config(PoolConfig::new(max_size.max(1))).build()?;
    Ok(pool)
}
