//! Database schema for jobs and course content.
//!
//! Every statement is `IF NOT EXISTS`, so the worker applies the schema on
//! each start.

use sqlx::PgPool;
use tracing::info;

pub const SCHEMA: &str = include_str!("../migrations/0001_generation_jobs.sql");

/// Create any missing tables and indexes.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    info!("database schema ensured");
    Ok(())
}
