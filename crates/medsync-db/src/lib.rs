//! Medsync DB - PostgreSQL implementations of the core store traits.
//!
//! - [`PgEntityStore`] / [`PgEntityTx`] - canonical entities, one
//!   transaction per imported page
//! - [`PgStateStore`] - the `import_state` key/value table
//!
//! The schema lives in the workspace `migrations/` directory and is embedded
//! at compile time by [`run_migrations`].

pub mod repository;
pub mod state;

pub use repository::{PgEntityStore, PgEntityTx};
pub use state::PgStateStore;

use medsync_core::error::AppError;
use sqlx::PgPool;

/// Applies any pending schema migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), AppError> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.into()))
}
