//! Relational persistence: connection pool + migrations.
//!
//! Generalizes the teacher's `persistence.rs` (a single JSON snapshot file,
//! `load_state`/`save_state`) into a real relational store — the spec
//! requires a source of truth that outlives one process and supports
//! concurrent workers, which a flat file cannot give us.

pub mod channels;
pub mod models;
pub mod positions;
pub mod signals;

use sqlx::postgres::{PgPool, PgPoolOptions};

pub async fn connect(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("database connected and migrations applied");
    Ok(pool)
}
