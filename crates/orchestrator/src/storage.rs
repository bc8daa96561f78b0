//! Durable state: the Persistent-ID high-water mark and the `servers` table.
//!
//! Schema migration itself lives outside this crate; a deployed master
//! assumes its tables already exist. What this module owns is the
//! orchestrator's own use of a SQL connection to persist two things across
//! restarts.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Context as _;
use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

/// One row of the `servers` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRow {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub state: String,
    pub version: String,
}

/// Durable state the orchestrator needs to survive a restart.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Reads the Persistent-ID high-water mark. Absence of any prior value
    /// (first boot) is `Ok(0)`; an unreachable store is fatal.
    async fn load_persistent_id(&self) -> anyhow::Result<u32>;

    /// Checkpoints the Persistent-ID high-water mark.
    async fn save_persistent_id(&self, value: u32) -> anyhow::Result<()>;

    /// Upserts a row of the `servers` table, keyed by `name`.
    async fn upsert_server(&self, row: &ServerRow) -> anyhow::Result<()>;

    /// Keeps the connection alive with a trivial round trip.
    async fn ping(&self) -> anyhow::Result<()>;
}

/// SQLite-backed implementation used in production.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Opens (and, if necessary, bootstraps) the database named by `connection`.
    ///
    /// Table creation here is bootstrap for a fresh database, not real
    /// migration tooling — a deployed master would run migrations ahead of
    /// time and this would be a no-op.
    pub async fn connect(connection: &str) -> anyhow::Result<SqliteStorage> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(connection)
            .await
            .with_context(|| format!("connecting to SQL storage at {connection}"))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS servers (
                name TEXT PRIMARY KEY,
                ip TEXT NOT NULL,
                port INTEGER NOT NULL,
                state TEXT NOT NULL,
                version TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .context("bootstrapping servers table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS persistent_id (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                high_water_mark INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .context("bootstrapping persistent_id table")?;

        Ok(SqliteStorage { pool })
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn load_persistent_id(&self) -> anyhow::Result<u32> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT high_water_mark FROM persistent_id WHERE id = 0")
            .fetch_optional(&self.pool)
            .await
            .context("loading persistent id high-water mark")?;

        Ok(row.map(|(v,)| v as u32).unwrap_or(0))
    }

    async fn save_persistent_id(&self, value: u32) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO persistent_id (id, high_water_mark) VALUES (0, ?1)
             ON CONFLICT(id) DO UPDATE SET high_water_mark = excluded.high_water_mark",
        )
        .bind(value as i64)
        .execute(&self.pool)
        .await
        .context("saving persistent id high-water mark")?;

        Ok(())
    }

    async fn upsert_server(&self, row: &ServerRow) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO servers (name, ip, port, state, version) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name) DO UPDATE SET ip = excluded.ip, port = excluded.port,
                state = excluded.state, version = excluded.version",
        )
        .bind(&row.name)
        .bind(&row.ip)
        .bind(row.port as i64)
        .bind(&row.state)
        .bind(&row.version)
        .execute(&self.pool)
        .await
        .context("upserting servers row")?;

        Ok(())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await.context("pinging SQL connection")?;
        Ok(())
    }
}

/// In-memory fake used by tests so they don't need a SQLite file on disk.
#[derive(Default)]
pub struct FakeStorage {
    persistent_id: Mutex<u32>,
    servers: Mutex<HashMap<String, ServerRow>>,
}

impl FakeStorage {
    pub fn new() -> FakeStorage {
        FakeStorage::default()
    }
}

#[async_trait]
impl Storage for FakeStorage {
    async fn load_persistent_id(&self) -> anyhow::Result<u32> {
        Ok(*self.persistent_id.lock().unwrap())
    }

    async fn save_persistent_id(&self, value: u32) -> anyhow::Result<()> {
        *self.persistent_id.lock().unwrap() = value;
        Ok(())
    }

    async fn upsert_server(&self, row: &ServerRow) -> anyhow::Result<()> {
        self.servers.lock().unwrap().insert(row.name.clone(), row.clone());
        Ok(())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn fake_storage_round_trips_persistent_id() {
        let storage = FakeStorage::new();
        assert_eq!(storage.load_persistent_id().await.unwrap(), 0);

        storage.save_persistent_id(42).await.unwrap();
        assert_eq!(storage.load_persistent_id().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn fake_storage_upserts_server_row() {
        let storage = FakeStorage::new();
        let row = ServerRow {
            name: "master".to_owned(),
            ip: "203.0.113.10".to_owned(),
            port: 9100,
            state: "running".to_owned(),
            version: "1".to_owned(),
        };

        storage.upsert_server(&row).await.unwrap();
        storage.upsert_server(&row).await.unwrap();
        assert_eq!(storage.servers.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sqlite_storage_bootstraps_and_persists() {
        let storage = SqliteStorage::connect("sqlite::memory:").await.expect("connect");

        assert_eq!(storage.load_persistent_id().await.unwrap(), 0);
        storage.save_persistent_id(7).await.unwrap();
        assert_eq!(storage.load_persistent_id().await.unwrap(), 7);

        let row = ServerRow {
            name: "master".to_owned(),
            ip: "203.0.113.10".to_owned(),
            port: 9100,
            state: "running".to_owned(),
            version: "1".to_owned(),
        };
        storage.upsert_server(&row).await.unwrap();
    }
}
