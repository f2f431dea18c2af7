//! Storage pool: pooled connections to the configured SQL backend with
//! named-transaction sessions.
//!
//! Backend selection happens once at startup from
//! `storage.connection.dbms_type`; backends not built into this binary
//! are rejected with a `Storage` error, mirroring the configuration
//! contract rather than panicking later.

use courier_common::{BrokerError, BrokerResult, DbmsType, StorageConfig};
use sqlx::any::{AnyPoolOptions, install_default_drivers};
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyConnection, AnyPool};
use std::time::Duration;

/// Attach the offending sql text to a backend error.
pub(crate) fn storage_err(err: sqlx::Error, sql: &str) -> BrokerError {
    BrokerError::storage(err.to_string(), sql)
}

/// Connection pool to the SQL store.
#[derive(Debug, Clone)]
pub struct StoragePool {
    pool: AnyPool,
    backend: DbmsType,
}

impl StoragePool {
    /// Build the pool for the configured backend.
    ///
    /// Fails with the `Storage` kind when the configured backend is not
    /// available in this build (`odbc`, `none`).
    pub async fn connect(config: &StorageConfig) -> BrokerResult<Self> {
        let backend = config.connection.dbms_type;
        match backend {
            DbmsType::SqliteNative | DbmsType::Postgres => {}
            DbmsType::Odbc | DbmsType::None => {
                return Err(BrokerError::storage(
                    "invalid DBMS",
                    backend.type_name(),
                ));
            }
        }

        install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(config.connection.max_connections)
            .acquire_timeout(Duration::from_secs(config.connection.acquire_timeout_secs))
            .connect(&config.connection.url)
            .await
            .map_err(|e| BrokerError::storage(e.to_string(), &config.connection.url))?;

        tracing::info!(
            backend = backend.type_name(),
            max_connections = config.connection.max_connections,
            "storage pool ready"
        );

        Ok(Self { pool, backend })
    }

    /// The selected backend.
    pub fn backend(&self) -> DbmsType {
        self.backend
    }

    /// Direct pool access for single-statement queries.
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Acquire a session; blocks (up to the acquire timeout) when the
    /// pool is exhausted.
    pub async fn session(&self) -> BrokerResult<StorageSession> {
        let conn = self.pool.acquire().await?;
        Ok(StorageSession {
            conn,
            tx_name: None,
        })
    }

    /// Execute a one-shot statement outside any transaction.
    pub async fn do_now(&self, sql: &str) -> BrokerResult<()> {
        sqlx::raw_sql(sql)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_err(e, sql))?;
        Ok(())
    }

    /// Execute a one-shot statement wrapped in a transaction named
    /// after the current worker task. Rolls back and propagates
    /// `Storage` on failure.
    pub async fn do_now_in_tx(&self, sql: &str) -> BrokerResult<()> {
        let tx_name = current_task_tx_name();
        let mut session = self.session().await?;
        session.begin_tx(&tx_name).await?;
        match sqlx::raw_sql(sql).execute(session.conn()).await {
            Ok(_) => session.commit_tx().await,
            Err(err) => {
                session.rollback_tx().await.ok();
                Err(storage_err(err, sql))
            }
        }
    }
}

/// Transaction name derived from the executing tokio task.
fn current_task_tx_name() -> String {
    match tokio::task::try_id() {
        Some(id) => format!("task-{id}"),
        None => "main".to_string(),
    }
}

/// A pooled connection with at most one open named transaction.
///
/// Names identify the transaction in logs and error context; the
/// underlying BEGIN/COMMIT/ROLLBACK statements are dialect-shared.
pub struct StorageSession {
    conn: PoolConnection<Any>,
    tx_name: Option<String>,
}

impl StorageSession {
    /// The underlying connection, for running bound queries.
    pub fn conn(&mut self) -> &mut AnyConnection {
        &mut self.conn
    }

    /// Whether a transaction is open on this session.
    pub fn in_tx(&self) -> bool {
        self.tx_name.is_some()
    }

    /// Name of the open transaction, if any.
    pub fn tx_name(&self) -> Option<&str> {
        self.tx_name.as_deref()
    }

    /// Open a transaction named for diagnostics.
    pub async fn begin_tx(&mut self, name: impl Into<String>) -> BrokerResult<()> {
        let name = name.into();
        if let Some(open) = &self.tx_name {
            return Err(BrokerError::invalid_state(format!(
                "transaction '{open}' already open, can't begin '{name}'"
            )));
        }
        sqlx::raw_sql("BEGIN")
            .execute(&mut *self.conn)
            .await
            .map_err(|e| storage_err(e, "BEGIN"))?;
        tracing::debug!(tx = %name, "transaction begun");
        self.tx_name = Some(name);
        Ok(())
    }

    /// Commit the open transaction.
    pub async fn commit_tx(&mut self) -> BrokerResult<()> {
        let name = self.tx_name.take().ok_or_else(|| {
            BrokerError::invalid_state("commit with no open transaction".to_string())
        })?;
        sqlx::raw_sql("COMMIT")
            .execute(&mut *self.conn)
            .await
            .map_err(|e| storage_err(e, "COMMIT"))?;
        tracing::debug!(tx = %name, "transaction committed");
        Ok(())
    }

    /// Roll back the open transaction.
    pub async fn rollback_tx(&mut self) -> BrokerResult<()> {
        let name = self.tx_name.take().ok_or_else(|| {
            BrokerError::invalid_state("rollback with no open transaction".to_string())
        })?;
        sqlx::raw_sql("ROLLBACK")
            .execute(&mut *self.conn)
            .await
            .map_err(|e| storage_err(e, "ROLLBACK"))?;
        tracing::debug!(tx = %name, "transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::ConnectionConfig;
    use sqlx::Row;

    fn sqlite_config(dir: &tempfile::TempDir) -> StorageConfig {
        let path = dir.path().join("storage.db");
        StorageConfig {
            connection: ConnectionConfig {
                dbms_type: DbmsType::SqliteNative,
                url: format!("sqlite://{}?mode=rwc", path.display()),
                max_connections: 4,
                acquire_timeout_secs: 5,
            },
            ..StorageConfig::default()
        }
    }

    #[tokio::test]
    async fn test_rejects_unbuilt_backends() {
        let mut config = StorageConfig::default();
        config.connection.dbms_type = DbmsType::Odbc;
        let err = StoragePool::connect(&config).await.unwrap_err();
        assert_eq!(err.kind(), courier_common::ErrorKind::Storage);

        config.connection.dbms_type = DbmsType::None;
        assert!(StoragePool::connect(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_do_now_and_session_tx() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoragePool::connect(&sqlite_config(&dir)).await.unwrap();

        store
            .do_now("create table if not exists t (id int not null)")
            .await
            .unwrap();
        store.do_now_in_tx("insert into t (id) values (1)").await.unwrap();

        let mut session = store.session().await.unwrap();
        session.begin_tx("test-tx").await.unwrap();
        assert_eq!(session.tx_name(), Some("test-tx"));
        sqlx::query("insert into t (id) values (2)")
            .execute(session.conn())
            .await
            .unwrap();
        session.rollback_tx().await.unwrap();
        assert!(!session.in_tx());

        let row = sqlx::query("select count(*) as n from t")
            .fetch_one(store.pool())
            .await
            .unwrap();
        let n: i64 = row.get("n");
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn test_nested_begin_is_invalid_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoragePool::connect(&sqlite_config(&dir)).await.unwrap();
        let mut session = store.session().await.unwrap();
        session.begin_tx("outer").await.unwrap();
        let err = session.begin_tx("inner").await.unwrap_err();
        assert_eq!(err.kind(), courier_common::ErrorKind::InvalidState);
        session.rollback_tx().await.unwrap();
    }
}
