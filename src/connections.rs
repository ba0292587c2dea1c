//! Credential store and user-row access.
//!
//! The pipeline reads stored OAuth connections and flips sync bookkeeping;
//! the `connect` command upserts them. One row per (user, provider, role);
//! credential updates replace, never append.

use anyhow::{bail, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{ConnectionRole, ProviderConnection, User};

pub async fn add_user(pool: &SqlitePool, email: &str) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now().timestamp();

    sqlx::query("INSERT INTO users (id, email, created_at) VALUES (?, ?, ?)")
        .bind(&id)
        .bind(email)
        .bind(now)
        .execute(pool)
        .await?;

    Ok(id)
}

pub async fn get_user(pool: &SqlitePool, user_id: &str) -> Result<Option<User>> {
    let row = sqlx::query(
        "SELECT id, email, email_connected, storage_connected, created_at FROM users WHERE id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| user_from_row(&r)))
}

pub async fn list_users(pool: &SqlitePool) -> Result<Vec<User>> {
    let rows = sqlx::query(
        "SELECT id, email, email_connected, storage_connected, created_at FROM users ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(user_from_row).collect())
}

/// Users eligible for the batch: both connections established.
pub async fn eligible_users(pool: &SqlitePool) -> Result<Vec<String>> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT id FROM users WHERE email_connected = 1 AND storage_connected = 1 ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await?;

    Ok(ids)
}

/// Store a credential pair for one (user, provider, role), replacing any
/// existing row, and flip the user's matching connected flag.
pub async fn upsert_connection(
    pool: &SqlitePool,
    user_id: &str,
    provider: &str,
    role: ConnectionRole,
    access_token: &str,
    refresh_token: &str,
    token_expiry: DateTime<Utc>,
) -> Result<()> {
    if get_user(pool, user_id).await?.is_none() {
        bail!("unknown user: {}", user_id);
    }

    sqlx::query(
        r#"
        INSERT INTO connections (id, user_id, provider, role, access_token, refresh_token, token_expiry)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id, provider, role) DO UPDATE SET
            access_token = excluded.access_token,
            refresh_token = excluded.refresh_token,
            token_expiry = excluded.token_expiry
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(user_id)
    .bind(provider)
    .bind(role.as_str())
    .bind(access_token)
    .bind(refresh_token)
    .bind(token_expiry.timestamp())
    .execute(pool)
    .await?;

    let flag_update = match role {
        ConnectionRole::Email => "UPDATE users SET email_connected = 1 WHERE id = ?",
        ConnectionRole::Storage => "UPDATE users SET storage_connected = 1 WHERE id = ?",
    };
    sqlx::query(flag_update).bind(user_id).execute(pool).await?;

    Ok(())
}

pub async fn get_connection(
    pool: &SqlitePool,
    user_id: &str,
    role: ConnectionRole,
) -> Result<Option<ProviderConnection>> {
    let row = sqlx::query(
        r#"
        SELECT id, user_id, provider, role, access_token, refresh_token, token_expiry, last_synced_at
        FROM connections WHERE user_id = ? AND role = ?
        "#,
    )
    .bind(user_id)
    .bind(role.as_str())
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| connection_from_row(&r, role)))
}

/// Persist a refreshed access token before any provider call uses it.
pub async fn update_tokens(
    pool: &SqlitePool,
    connection_id: &str,
    access_token: &str,
    token_expiry: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE connections SET access_token = ?, token_expiry = ? WHERE id = ?")
        .bind(access_token)
        .bind(token_expiry.timestamp())
        .bind(connection_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Liveness stamp written after a completed per-user pass. Less
/// authoritative than the ledger checkpoint.
pub async fn set_last_synced(
    pool: &SqlitePool,
    connection_id: &str,
    when: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE connections SET last_synced_at = ? WHERE id = ?")
        .bind(when.timestamp())
        .bind(connection_id)
        .execute(pool)
        .await?;

    Ok(())
}

fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> User {
    let created_at: i64 = row.get("created_at");
    let email_connected: i64 = row.get("email_connected");
    let storage_connected: i64 = row.get("storage_connected");

    User {
        id: row.get("id"),
        email: row.get("email"),
        email_connected: email_connected != 0,
        storage_connected: storage_connected != 0,
        created_at: Utc.timestamp_opt(created_at, 0).unwrap(),
    }
}

fn connection_from_row(row: &sqlx::sqlite::SqliteRow, role: ConnectionRole) -> ProviderConnection {
    let token_expiry: i64 = row.get("token_expiry");
    let last_synced_at: Option<i64> = row.get("last_synced_at");

    ProviderConnection {
        id: row.get("id"),
        user_id: row.get("user_id"),
        provider: row.get("provider"),
        role,
        access_token: row.get("access_token"),
        refresh_token: row.get("refresh_token"),
        token_expiry: Utc.timestamp_opt(token_expiry, 0).unwrap(),
        last_synced_at: last_synced_at.map(|ts| Utc.timestamp_opt(ts, 0).unwrap()),
    }
}
