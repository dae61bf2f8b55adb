//! SQLite index backend.
//!
//! The pool is created on `open` and dropped on `close`. An in-memory
//! database lives as long as its single pooled connection, so the pool
//! never recycles connections.

mod find;
mod rows;
mod transaction;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::config::DatabaseConfig;
use crate::db::search::SqliteDialect;
use crate::db::traits::{Capabilities, DatabaseWrapper, Transaction, DATABASE_SCHEMA_VERSION};
use crate::models::{GlobalProperty, TransactionType};
use crate::registry::MainDicomTagsRegistry;
use crate::{Error, Result};

pub use transaction::SqliteTransaction;

pub struct SqliteDatabase {
    config: DatabaseConfig,
    registry: Arc<MainDicomTagsRegistry>,
    dialect: SqliteDialect,
    pool: RwLock<Option<SqlitePool>>,
}

impl SqliteDatabase {
    pub fn new(config: DatabaseConfig, registry: Arc<MainDicomTagsRegistry>) -> Self {
        let dialect = SqliteDialect {
            escape_brackets: config.escape_brackets,
            ..SqliteDialect::default()
        };
        Self {
            config,
            registry,
            dialect,
            pool: RwLock::new(None),
        }
    }

    /// A private in-memory index, mostly for tests and tools.
    pub fn in_memory(registry: Arc<MainDicomTagsRegistry>) -> Self {
        Self::new(DatabaseConfig::in_memory(), registry)
    }

    pub fn registry(&self) -> &Arc<MainDicomTagsRegistry> {
        &self.registry
    }

    fn pool(&self) -> Result<SqlitePool> {
        let guard = self
            .pool
            .read()
            .map_err(|_| Error::Internal("Database pool lock poisoned".to_string()))?;
        guard
            .clone()
            .ok_or_else(|| Error::BadSequenceOfCalls("The database is not open".to_string()))
    }

    fn connect_options(&self) -> Result<SqliteConnectOptions> {
        let options = if self.config.is_in_memory() {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(&self.config.path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
        };
        Ok(options
            .foreign_keys(true)
            .pragma("case_sensitive_like", "ON"))
    }

    async fn check_schema_version(pool: &SqlitePool) -> Result<()> {
        let version: Option<Option<String>> =
            sqlx::query_scalar("SELECT value FROM GlobalProperties WHERE property = $1")
                .bind(GlobalProperty::DatabaseSchemaVersion.code())
                .fetch_optional(pool)
                .await
                .map_err(Error::Database)?;

        let expected = DATABASE_SCHEMA_VERSION.to_string();
        match version.flatten() {
            Some(version) if version == expected => Ok(()),
            Some(version) => Err(Error::IncompatibleDatabaseVersion(format!(
                "found schema version {version}, expected {expected}"
            ))),
            None => Err(Error::IncompatibleDatabaseVersion(
                "missing schema version".to_string(),
            )),
        }
    }
}

#[async_trait]
impl DatabaseWrapper for SqliteDatabase {
    async fn open(&self) -> Result<()> {
        let already_open = self
            .pool
            .read()
            .map_err(|_| Error::Internal("Database pool lock poisoned".to_string()))?
            .is_some();
        if already_open {
            return Err(Error::BadSequenceOfCalls(
                "The database is already open".to_string(),
            ));
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(self.config.max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(self.connect_options()?)
            .await
            .map_err(Error::Database)?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        Self::check_schema_version(&pool).await?;

        tracing::info!(
            path = %self.config.path,
            native_find = self.config.enable_native_find,
            "Opened SQLite index"
        );

        let mut guard = self
            .pool
            .write()
            .map_err(|_| Error::Internal("Database pool lock poisoned".to_string()))?;
        *guard = Some(pool);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let pool = {
            let mut guard = self
                .pool
                .write()
                .map_err(|_| Error::Internal("Database pool lock poisoned".to_string()))?;
            guard.take()
        };
        if let Some(pool) = pool {
            pool.close().await;
            tracing::info!(path = %self.config.path, "Closed SQLite index");
        }
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            has_revisions_support: true,
            has_labels_support: true,
            has_find_support: self.config.enable_native_find,
            has_atomic_increment_global_property: true,
            has_key_value_stores_support: true,
            has_queues_support: true,
            has_flush_to_disk: true,
            has_measure_latency: true,
            has_attachment_custom_data_support: true,
            has_extended_changes: true,
        }
    }

    async fn start_transaction(&self, kind: TransactionType) -> Result<Box<dyn Transaction>> {
        let tx = self.pool()?.begin().await.map_err(Error::Database)?;
        Ok(Box::new(SqliteTransaction::new(
            tx,
            kind,
            Arc::clone(&self.registry),
            self.dialect,
            self.config.enable_native_find,
        )))
    }

    async fn flush_to_disk(&self) -> Result<()> {
        if self.config.is_in_memory() {
            return Ok(());
        }
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool()?)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn measure_latency(&self) -> Result<u64> {
        let pool = self.pool()?;
        let start = Instant::now();
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(Error::Database)?;
        Ok(u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX))
    }
}
