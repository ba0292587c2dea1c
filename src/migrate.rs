use anyhow::Result;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    // Create users table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            email_connected INTEGER NOT NULL DEFAULT 0,
            storage_connected INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Create connections table. One row per (user, provider, role);
    // credential updates replace the row instead of appending.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS connections (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            role TEXT NOT NULL CHECK (role IN ('email', 'storage')),
            access_token TEXT NOT NULL,
            refresh_token TEXT NOT NULL,
            token_expiry INTEGER NOT NULL,
            last_synced_at INTEGER,
            UNIQUE(user_id, provider, role),
            FOREIGN KEY (user_id) REFERENCES users(id)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Create the attachment ledger. Append-only: rows are written once per
    // successfully filed attachment and never updated.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processed_attachments (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            source_message_id TEXT NOT NULL,
            original_filename TEXT NOT NULL,
            new_filename TEXT NOT NULL,
            doc_type TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            content_sha256 TEXT NOT NULL,
            storage_url TEXT NOT NULL,
            processed_at INTEGER NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(id)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_connections_user_id ON connections(user_id)")
        .execute(&pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_processed_user_time ON processed_attachments(user_id, processed_at DESC)",
    )
    .execute(&pool)
    .await?;

    pool.close().await;
    Ok(())
}
