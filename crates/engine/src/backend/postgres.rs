//! PostgreSQL driver
//!
//! Wraps an sqlx `PgPool`. The pool is private to this module; callers only
//! ever see a `PgConnection` borrowed from a scoped handle.
//!
//! Settings are assigned with `set_config(key, value, true)`, the function form
//! of `SET LOCAL`, so values can be bound as parameters and are discarded when
//! the transaction ends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use tenantry_core::{AuditLogEntry, Error, NewAuditEntry, Result, ValueKind};
use tracing::{debug, info};
use uuid::Uuid;

use super::Driver;
use crate::config::TenantryConfig;

const SET_LOCAL_TEXT: &str = "SELECT set_config($1, $2, true)";
const SET_LOCAL_UUID: &str = "SELECT set_config($1, $2::uuid::text, true)";
const CLEAR_LOCAL: &str = "SELECT set_config($1, '', true)";
const RESET_SAVEPOINT: &str = "tenantry_context_reset";

const INSERT_AUDIT: &str = "INSERT INTO audit_log \
     (actor_id, actor_email, action, correlation_id, reason, metadata) \
     VALUES ($1::uuid, $2, $3, $4, $5, $6) \
     RETURNING id, created_at";

/// Driver for PostgreSQL with row-level security
///
/// The connecting role must be subject to RLS: not a superuser, no
/// `BYPASSRLS`, and tables using `FORCE ROW LEVEL SECURITY` if the role owns
/// them.
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    /// Open the pool described by `config`
    ///
    /// Every physical connection gets the configured `statement_timeout` as a
    /// session setting when it is opened. That is the only session-level
    /// assignment this crate makes.
    ///
    /// # Errors
    /// `InvalidConfig` for a bad configuration or URL, otherwise the mapped
    /// connection error.
    pub async fn connect(config: &TenantryConfig) -> Result<Self> {
        config.validate()?;
        let options: PgConnectOptions = config
            .database_url
            .parse()
            .map_err(|e| Error::invalid_config(format!("invalid database_url: {}", e)))?;

        let statement_timeout = format!("{}ms", config.pool.statement_timeout_ms);
        let pool = PgPoolOptions::new()
            .max_connections(config.pool.max_connections)
            .min_connections(config.pool.min_connections)
            .acquire_timeout(config.pool.acquire_timeout())
            .idle_timeout(config.pool.idle_timeout())
            .after_connect(move |conn, _meta| {
                let statement_timeout = statement_timeout.clone();
                Box::pin(async move {
                    sqlx::query("SELECT set_config('statement_timeout', $1, false)")
                        .bind(statement_timeout)
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await?;

        info!(
            target: "tenantry::pool",
            max_connections = config.pool.max_connections,
            statement_timeout_ms = config.pool.statement_timeout_ms,
            "PostgreSQL pool ready"
        );
        Ok(Self { pool })
    }
}

#[async_trait]
impl Driver for PgBackend {
    type Transaction = Transaction<'static, Postgres>;
    type Connection = PoolConnection<Postgres>;
    type Executor = PgConnection;

    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn begin(&self) -> Result<Self::Transaction> {
        Ok(self.pool.begin().await?)
    }

    async fn acquire(&self) -> Result<Self::Connection> {
        Ok(self.pool.acquire().await?)
    }

    async fn set_config(
        &self,
        txn: &mut Self::Transaction,
        key: &str,
        value: &str,
        kind: ValueKind,
    ) -> Result<()> {
        let sql = match kind {
            ValueKind::Uuid => SET_LOCAL_UUID,
            ValueKind::Text => SET_LOCAL_TEXT,
        };
        sqlx::query(sql)
            .bind(key)
            .bind(value)
            .execute(&mut **txn)
            .await?;
        Ok(())
    }

    async fn clear_config(&self, txn: &mut Self::Transaction, key: &str) -> Result<()> {
        let conn: &mut PgConnection = txn;
        sqlx::query(&format!("SAVEPOINT {}", RESET_SAVEPOINT))
            .execute(&mut *conn)
            .await?;
        match sqlx::query(CLEAR_LOCAL).bind(key).execute(&mut *conn).await {
            Ok(_) => {
                sqlx::query(&format!("RELEASE SAVEPOINT {}", RESET_SAVEPOINT))
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            }
            Err(e) => {
                // Keep the enclosing transaction usable for commit
                if let Err(restore) = sqlx::query(&format!("ROLLBACK TO SAVEPOINT {}", RESET_SAVEPOINT))
                    .execute(&mut *conn)
                    .await
                {
                    debug!(target: "tenantry::context", error = %restore, "Savepoint restore failed");
                }
                Err(e.into())
            }
        }
    }

    async fn insert_audit(
        &self,
        txn: &mut Self::Transaction,
        entry: &NewAuditEntry,
    ) -> Result<AuditLogEntry> {
        let row = sqlx::query(INSERT_AUDIT)
            .bind(&entry.actor_id)
            .bind(&entry.actor_email)
            .bind(entry.action.as_str())
            .bind(&entry.correlation_id)
            .bind(&entry.reason)
            .bind(Json(&entry.metadata))
            .fetch_one(&mut **txn)
            .await?;
        let id: Uuid = row.try_get("id")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        Ok(AuditLogEntry::from_new(entry, id, created_at))
    }

    async fn commit(&self, txn: Self::Transaction) -> Result<()> {
        Ok(txn.commit().await?)
    }

    async fn rollback(&self, txn: Self::Transaction) -> Result<()> {
        Ok(txn.rollback().await?)
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn executor(txn: &mut Self::Transaction) -> &mut Self::Executor {
        txn
    }

    fn connection_executor(conn: &mut Self::Connection) -> &mut Self::Executor {
        conn
    }
}
