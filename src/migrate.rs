//! Idempotent schema creation.
//!
//! Each record kind gets its own records table and record/tag join table.
//! The `tags` table is shared, so a tag name is globally unique.
//! Report times are unix milliseconds; `created_at` and `updated_at` are
//! unix seconds.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Apply the schema to an open pool. Safe to run repeatedly.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS hacking_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            channel TEXT NOT NULL,
            message_id INTEGER NOT NULL,
            report_time_ms INTEGER NOT NULL,
            protocol TEXT NOT NULL,
            network TEXT NOT NULL,
            amount TEXT NOT NULL,
            tx_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transfer_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            channel TEXT NOT NULL,
            message_id INTEGER NOT NULL,
            report_time_ms INTEGER NOT NULL,
            token TEXT NOT NULL,
            amount TEXT NOT NULL,
            from_address TEXT NOT NULL,
            to_address TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tags (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        )
        "#,
    )
    .execute(pool)
    .await?;

    for (links, records) in [
        ("hacking_record_tags", "hacking_records"),
        ("transfer_record_tags", "transfer_records"),
    ] {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {links} (
                record_id INTEGER NOT NULL,
                tag_id INTEGER NOT NULL,
                PRIMARY KEY (record_id, tag_id),
                FOREIGN KEY (record_id) REFERENCES {records}(id),
                FOREIGN KEY (tag_id) REFERENCES tags(id)
            )
            "#,
        ))
        .execute(pool)
        .await?;

        // Tag-filtered pagination walks tag -> record ids.
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{links}_tag ON {links}(tag_id, record_id DESC)"
        ))
        .execute(pool)
        .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS watermarks (
            kind TEXT NOT NULL,
            channel TEXT NOT NULL,
            last_message_id INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (kind, channel)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_hacking_records_channel ON hacking_records(channel, message_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_transfer_records_channel ON transfer_records(channel, message_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
