//! PostgreSQL transaction store implementation.

use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

use crate::domain::{
    AppError, DatabaseError, NewTransactionRecord, TransactionRecord, TransactionState,
    TransactionStore, TransactionType, TransactionUpdate,
};

/// PostgreSQL connection pool configuration
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

/// PostgreSQL-backed transaction store with connection pooling
pub struct PostgresTransactionStore {
    pool: PgPool,
}

impl PostgresTransactionStore {
    /// Create a new store with custom pool configuration
    pub async fn new(database_url: &str, config: PostgresConfig) -> Result<Self, AppError> {
        info!("Connecting to PostgreSQL...");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(database_url)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a new store with default pool configuration
    pub async fn with_defaults(database_url: &str) -> Result<Self, AppError> {
        Self::new(database_url, PostgresConfig::default()).await
    }

    /// Run database migrations using sqlx migrate
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Migration(e.to_string())))?;
        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying connection pool (for testing)
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Parse a database row into a TransactionRecord
    fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<TransactionRecord, AppError> {
        let tx_type: String = row.get("tx_type");
        let state: String = row.get("state");

        Ok(TransactionRecord {
            id: row.get("id"),
            chain_id: row.get::<i64, _>("chain_id") as u64,
            tx_type: TransactionType::from_str(&tx_type)
                .map_err(DatabaseError::Query)?,
            source_id: row.get("source_id"),
            trader: row.get("trader"),
            params: row.get("params"),
            nonce: row.get::<Option<i64>, _>("nonce").map(|n| n as u64),
            hash: row.get("hash"),
            gas_price: row.get::<Option<i64>, _>("gas_price").map(|g| g as u64),
            state: TransactionState::from_str(&state)
                .map_err(DatabaseError::Query)?,
            detail: row.get("detail"),
            error_code: row.get("error_code"),
            error_message: row.get("error_message"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl TransactionStore for PostgresTransactionStore {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_all(
        &self,
        chain_id: u64,
        tx_type: TransactionType,
        source_id: &str,
    ) -> Result<Vec<TransactionRecord>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT id, chain_id, tx_type, source_id, trader, params,
                   nonce, hash, gas_price, state, detail,
                   error_code, error_message, created_at, updated_at
            FROM transactions
            WHERE chain_id = $1 AND tx_type = $2 AND source_id = $3
            ORDER BY updated_at DESC
            "#,
        )
        .bind(chain_id as i64)
        .bind(tx_type.as_str())
        .bind(source_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        rows.iter().map(Self::row_to_record).collect()
    }

    #[instrument(skip(self, new), fields(source_id = %new.source_id))]
    async fn create(&self, new: &NewTransactionRecord) -> Result<TransactionRecord, AppError> {
        let row = sqlx::query(
            r#"
            INSERT INTO transactions (chain_id, tx_type, source_id, trader, params, state)
            VALUES ($1, $2, $3, $4, $5, 'created')
            RETURNING id, chain_id, tx_type, source_id, trader, params,
                      nonce, hash, gas_price, state, detail,
                      error_code, error_message, created_at, updated_at
            "#,
        )
        .bind(new.chain_id as i64)
        .bind(new.tx_type.as_str())
        .bind(&new.source_id)
        .bind(&new.trader)
        .bind(&new.params)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        Self::row_to_record(&row)
    }

    #[instrument(skip(self, update))]
    async fn update(
        &self,
        id: i64,
        update: &TransactionUpdate,
    ) -> Result<TransactionRecord, AppError> {
        let row = sqlx::query(
            r#"
            UPDATE transactions SET
                state = $2,
                nonce = COALESCE($3, nonce),
                hash = COALESCE($4, hash),
                gas_price = COALESCE($5, gas_price),
                detail = COALESCE($6, detail),
                error_code = COALESCE($7, error_code),
                error_message = COALESCE($8, error_message),
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, chain_id, tx_type, source_id, trader, params,
                      nonce, hash, gas_price, state, detail,
                      error_code, error_message, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(update.state.as_str())
        .bind(update.nonce.map(|n| n as i64))
        .bind(&update.hash)
        .bind(update.gas_price.map(|g| g as i64))
        .bind(&update.detail)
        .bind(&update.error_code)
        .bind(&update.error_message)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?
        .ok_or_else(|| AppError::Database(DatabaseError::NotFound(id.to_string())))?;

        Self::row_to_record(&row)
    }
}
