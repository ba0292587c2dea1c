//! OAuth token refresh.
//!
//! The orchestrator refreshes proactively: a connection whose access token
//! expires within `google.refresh_margin_secs` is refreshed through the
//! provider token endpoint and persisted before any provider API call.
//!
//! The authorization-code exchange that created the connection in the
//! first place happens outside this crate; only already-stored credentials
//! are consumed here.
//!
//! # Environment Variables
//!
//! - `GOOGLE_CLIENT_ID` — required for refresh
//! - `GOOGLE_CLIENT_SECRET` — required for refresh

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use sqlx::SqlitePool;

use crate::config::GoogleConfig;
use crate::connections;
use crate::models::ProviderConnection;

/// A freshly minted access token and its expiry.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub token_expiry: DateTime<Utc>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Exchange a refresh token for a new access token.
pub async fn refresh_access_token(
    config: &GoogleConfig,
    refresh_token: &str,
) -> Result<RefreshedToken> {
    let client_id = std::env::var("GOOGLE_CLIENT_ID")
        .context("GOOGLE_CLIENT_ID environment variable not set")?;
    let client_secret = std::env::var("GOOGLE_CLIENT_SECRET")
        .context("GOOGLE_CLIENT_SECRET environment variable not set")?;

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(config.timeout_secs))
        .build()?;

    let params = [
        ("client_id", client_id.as_str()),
        ("client_secret", client_secret.as_str()),
        ("refresh_token", refresh_token),
        ("grant_type", "refresh_token"),
    ];

    let response = client
        .post(&config.token_endpoint)
        .form(&params)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("Token refresh failed ({}): {}", status, body);
    }

    let token: TokenResponse = response
        .json()
        .await
        .context("Invalid token endpoint response")?;

    Ok(RefreshedToken {
        access_token: token.access_token,
        token_expiry: Utc::now() + Duration::seconds(token.expires_in),
    })
}

/// Refresh the connection's access token if it expires within the
/// configured margin, persisting the new token before returning.
/// Returns `true` if a refresh happened.
pub async fn ensure_fresh(
    pool: &SqlitePool,
    config: &GoogleConfig,
    conn: &mut ProviderConnection,
) -> Result<bool> {
    let deadline = Utc::now() + Duration::seconds(config.refresh_margin_secs);
    if conn.token_expiry > deadline {
        return Ok(false);
    }

    let refreshed = refresh_access_token(config, &conn.refresh_token)
        .await
        .with_context(|| format!("refreshing {} connection", conn.role.as_str()))?;

    connections::update_tokens(pool, &conn.id, &refreshed.access_token, refreshed.token_expiry)
        .await?;

    conn.access_token = refreshed.access_token;
    conn.token_expiry = refreshed.token_expiry;
    Ok(true)
}
