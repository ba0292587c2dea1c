//! Attachment ledger.
//!
//! The append-only record of every attachment the pipeline has filed.
//! Doubles as the audit trail and as the incremental-sync source of
//! truth: the per-user checkpoint is the most recent `processed_at` here,
//! not the connection's liveness stamp.

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{Attachment, DocType, DocumentMetadata, ProcessedAttachment, UploadedFile};

/// Append one filed-attachment record. Written exactly once per
/// successful filing; never updated.
pub async fn append(
    pool: &SqlitePool,
    user_id: &str,
    attachment: &Attachment,
    metadata: &DocumentMetadata,
    uploaded: &UploadedFile,
    processed_at: DateTime<Utc>,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();

    let mut hasher = Sha256::new();
    hasher.update(&attachment.data);
    let content_sha256 = format!("{:x}", hasher.finalize());

    let metadata_json = serde_json::json!({
        "company": metadata.company,
        "date": metadata.date,
        "amount": metadata.amount,
        "parties": metadata.parties,
        "sender": attachment.sender,
        "subject": attachment.subject,
    });

    sqlx::query(
        r#"
        INSERT INTO processed_attachments
            (id, user_id, source_message_id, original_filename, new_filename,
             doc_type, metadata_json, content_sha256, storage_url, processed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(user_id)
    .bind(&attachment.source_message_id)
    .bind(&attachment.filename)
    .bind(&metadata.suggested_filename)
    .bind(metadata.doc_type.as_str())
    .bind(metadata_json.to_string())
    .bind(&content_sha256)
    .bind(&uploaded.view_url)
    .bind(processed_at.timestamp())
    .execute(pool)
    .await?;

    Ok(id)
}

/// The incremental-fetch boundary for one user: the latest `processed_at`
/// across their ledger, or `None` before any attachment was ever filed.
pub async fn checkpoint(pool: &SqlitePool, user_id: &str) -> Result<Option<DateTime<Utc>>> {
    let max: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(processed_at) FROM processed_attachments WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await?;

    Ok(max.map(|ts| Utc.timestamp_opt(ts, 0).unwrap()))
}

pub async fn count_for_user(pool: &SqlitePool, user_id: &str) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM processed_attachments WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(pool)
            .await?;

    Ok(count)
}

/// Most recently filed attachments for one user, newest first.
pub async fn recent_for_user(
    pool: &SqlitePool,
    user_id: &str,
    limit: i64,
) -> Result<Vec<ProcessedAttachment>> {
    let rows = sqlx::query(
        r#"
        SELECT id, user_id, source_message_id, original_filename, new_filename,
               doc_type, metadata_json, content_sha256, storage_url, processed_at
        FROM processed_attachments
        WHERE user_id = ?
        ORDER BY processed_at DESC, id ASC
        LIMIT ?
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let doc_type: String = row.get("doc_type");
            let processed_at: i64 = row.get("processed_at");

            ProcessedAttachment {
                id: row.get("id"),
                user_id: row.get("user_id"),
                source_message_id: row.get("source_message_id"),
                original_filename: row.get("original_filename"),
                new_filename: row.get("new_filename"),
                doc_type: DocType::parse(&doc_type),
                metadata_json: row.get("metadata_json"),
                content_sha256: row.get("content_sha256"),
                storage_url: row.get("storage_url"),
                processed_at: Utc.timestamp_opt(processed_at, 0).unwrap(),
            }
        })
        .collect())
}
