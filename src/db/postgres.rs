use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

/// Creates a lazily connecting PostgreSQL connection pool
///
/// Connections are checked out per source call and returned when the guard
/// drops, so no request holds a connection beyond its own query.
pub fn create_pool(
    database_url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .acquire_timeout(acquire_timeout)
        .connect_lazy(database_url)?;

    Ok(pool)
}
