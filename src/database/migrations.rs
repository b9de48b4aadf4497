//! Schema migration runner.
//!
//! Migrations are embedded SQL files applied in timestamp order, tracked in
//! `asyncgate_schema_migrations`. The whole run happens under a Postgres
//! advisory lock so parallel processes (notably parallel test binaries
//! sharing one database) cannot race schema creation; contenders wait on the
//! lock and then observe the already-applied versions.

use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::error::{EngineError, Result};

/// Embedded migrations, in order. The version prefix is the filename
/// timestamp; it must strictly increase.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "20250210093000_initial_schema",
        include_str!("../../migrations/20250210093000_initial_schema.sql"),
    ),
    (
        "20250218141500_receipt_parent_index",
        include_str!("../../migrations/20250218141500_receipt_parent_index.sql"),
    ),
    (
        "20250226101500_task_progress",
        include_str!("../../migrations/20250226101500_task_progress.sql"),
    ),
];

// Deterministic key for the advisory lock; shared by every process that
// migrates the same database.
const MIGRATION_LOCK_KEY: i64 = 0x4153_594e_4347_5445;

pub struct DatabaseMigrations;

impl DatabaseMigrations {
    /// Apply all outstanding migrations. Idempotent and safe to call from
    /// multiple processes concurrently.
    pub async fn run_all(pool: &PgPool) -> Result<()> {
        let mut conn = pool.acquire().await?;

        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        let result = Self::run_locked(&mut conn).await;

        // Always release, even if a migration failed.
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        result
    }

    async fn run_locked(conn: &mut sqlx::PgConnection) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS asyncgate_schema_migrations (
                version    VARCHAR(255) PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        let applied: Vec<String> = sqlx::query("SELECT version FROM asyncgate_schema_migrations")
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .map(|row| row.get::<String, _>("version"))
            .collect();

        for &(version, sql) in MIGRATIONS {
            if applied.iter().any(|v| v == version) {
                debug!(version = version, "Migration already applied");
                continue;
            }

            info!(version = version, "Applying migration");
            // Migration files may contain multiple statements.
            sqlx::raw_sql(sql)
                .execute(&mut *conn)
                .await
                .map_err(|e| EngineError::Database {
                    operation: format!("migrate {version}"),
                    reason: e.to_string(),
                })?;

            sqlx::query("INSERT INTO asyncgate_schema_migrations (version) VALUES ($1)")
                .bind(version)
                .execute(&mut *conn)
                .await?;
        }

        Ok(())
    }
}
