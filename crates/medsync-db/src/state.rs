//! Durable key/value state: job cursors and last-run statistics.

use medsync_core::error::AppError;
use medsync_core::traits::StateStore;
use sqlx::{PgPool, Pool, Postgres};

#[derive(Clone)]
pub struct PgStateStore {
    pool: Pool<Postgres>,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl StateStore for PgStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        sqlx::query_scalar("SELECT value FROM import_state WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::DatabaseError)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO import_state (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key)
            DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(String, String)>, AppError> {
        sqlx::query_as("SELECT key, value FROM import_state ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::DatabaseError)
    }
}
