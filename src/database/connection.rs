use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

use crate::errors::Result;

pub async fn get_pool(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    // Fail fast when the database is unreachable or the schema is missing.
    sqlx::query("SELECT 1").execute(&pool).await?;
    tracing::info!("Connected to Postgres");

    Ok(pool)
}
