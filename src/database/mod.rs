use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::errors::{DbError, DbResult};

// Embed migration SQL files at compile time
const MIGRATION_MUTATION_QUEUE: &str =
    include_str!("../../migrations/20250810000000_mutation_queue.sql");

// List of migrations with their names and SQL content
const MIGRATIONS: &[(&str, &str)] = &[(
    "20250810000000_mutation_queue.sql",
    MIGRATION_MUTATION_QUEUE,
)];

/// Open (or create) the local store and bring its schema up to date.
///
/// The engine must not start without a working store, so any failure here is
/// surfaced to the caller instead of being retried.
pub async fn init_db(db_url: &str) -> DbResult<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .map_err(|e| DbError::ConnectionPool(format!("Database connection failed: {}", e)))?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// Apply any migrations not yet recorded in the migrations table.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS migrations (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    for (name, sql) in MIGRATIONS {
        let applied: Option<(String,)> =
            sqlx::query_as("SELECT name FROM migrations WHERE name = ?")
                .bind(name)
                .fetch_optional(pool)
                .await?;

        if applied.is_some() {
            continue;
        }

        log::info!("Applying migration {}", name);

        let mut tx = pool
            .begin()
            .await
            .map_err(|e| DbError::Transaction(format!("Failed to begin migration: {}", e)))?;

        // SQLite cannot execute multiple statements in one prepared query;
        // split on statement boundaries and drop comment lines.
        for chunk in sql.split(';') {
            let statement: String = chunk
                .lines()
                .filter(|line| !line.trim_start().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| DbError::Migration(format!("{}: {}", name, e)))?;
        }

        sqlx::query("INSERT INTO migrations (name, applied_at) VALUES (?, ?)")
            .bind(name)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;

        tx.commit()
            .await
            .map_err(|e| DbError::Transaction(format!("Failed to commit migration: {}", e)))?;
    }

    Ok(())
}
