//! Gmail email source adapter.
//!
//! Lists messages carrying attachments through the Gmail REST API, pulls
//! the attachment bytes, and marks filed messages with an advisory label.
//! The provider query is checkpoint-bounded after the first run, and the
//! number of messages scanned per call is capped; anything beyond the cap
//! is picked up by the next scheduled run.
//!
//! A [`GmailSource`] is a scoped session: built from one user's stored
//! access token at the start of that user's pipeline pass and discarded at
//! the end. Nothing here is shared across users.
//!
//! # Endpoints
//!
//! | Call | Purpose |
//! |------|---------|
//! | `GET  users/me/messages` | Bounded incremental message listing |
//! | `GET  users/me/messages/{id}?format=full` | Headers + MIME part tree |
//! | `GET  users/me/messages/{id}/attachments/{id}` | Attachment bytes |
//! | `POST users/me/messages/{id}/modify` | Advisory processed label |

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::time::Duration;

use crate::config::{GoogleConfig, PipelineConfig};
use crate::models::Attachment;

/// A mailbox the pipeline can pull new attachments from.
///
/// `fetch_new_attachments` returns every attachment received after the
/// checkpoint (or within the default lookback window on a first run).
/// `mark_processed` is advisory source-side bookkeeping: idempotent, and
/// its failure never fails a pipeline pass.
#[async_trait]
pub trait EmailSource: Send + Sync {
    async fn fetch_new_attachments(
        &self,
        checkpoint: Option<DateTime<Utc>>,
    ) -> Result<Vec<Attachment>>;

    async fn mark_processed(&self, message_id: &str) -> Result<()>;
}

/// Gmail-backed [`EmailSource`] for one user's mailbox.
pub struct GmailSource {
    endpoint: String,
    access_token: String,
    max_messages: u32,
    lookback_hours: i64,
    processed_label_id: String,
    client: reqwest::Client,
}

impl GmailSource {
    pub fn new(
        google: &GoogleConfig,
        pipeline: &PipelineConfig,
        access_token: String,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(google.timeout_secs))
            .build()?;

        Ok(Self {
            endpoint: google.gmail_endpoint.trim_end_matches('/').to_string(),
            access_token,
            max_messages: pipeline.max_messages,
            lookback_hours: pipeline.lookback_hours,
            processed_label_id: pipeline.processed_label_id.clone(),
            client,
        })
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Gmail API error {}: {}", status, body);
        }

        Ok(response.json().await?)
    }

    async fn fetch_message_attachments(&self, message_id: &str) -> Result<Vec<Attachment>> {
        let url = format!(
            "{}/users/me/messages/{}?format=full",
            self.endpoint, message_id
        );
        let message = self.get_json(&url).await?;

        let headers = &message["payload"]["headers"];
        let sender = header_value(headers, "From").unwrap_or_default().to_string();
        let subject = header_value(headers, "Subject")
            .unwrap_or_default()
            .to_string();
        let received_at = message_received_at(&message);

        let mut parts = Vec::new();
        collect_attachment_parts(&message["payload"], &mut parts);

        let mut attachments = Vec::new();
        for part in parts {
            let url = format!(
                "{}/users/me/messages/{}/attachments/{}",
                self.endpoint, message_id, part.attachment_id
            );

            // One failed attachment body must not sink the others.
            let body = match self.get_json(&url).await {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(
                        message_id,
                        filename = %part.filename,
                        error = %e,
                        "failed to fetch attachment body, skipping"
                    );
                    continue;
                }
            };

            let Some(data) = body["data"].as_str() else {
                tracing::warn!(message_id, filename = %part.filename, "attachment body missing data");
                continue;
            };

            let bytes = match decode_body_data(data) {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(
                        message_id,
                        filename = %part.filename,
                        error = %e,
                        "attachment body not valid base64, skipping"
                    );
                    continue;
                }
            };

            attachments.push(Attachment {
                source_message_id: message_id.to_string(),
                filename: part.filename,
                mime_type: part.mime_type,
                size_bytes: part.size,
                data: bytes,
                sender: sender.clone(),
                subject: subject.clone(),
                received_at,
            });
        }

        Ok(attachments)
    }
}

#[async_trait]
impl EmailSource for GmailSource {
    async fn fetch_new_attachments(
        &self,
        checkpoint: Option<DateTime<Utc>>,
    ) -> Result<Vec<Attachment>> {
        let query = build_query(checkpoint, self.lookback_hours);
        let url = format!(
            "{}/users/me/messages?q={}&maxResults={}",
            self.endpoint,
            urlencode(&query),
            self.max_messages
        );

        let listing = self.get_json(&url).await.context("listing messages")?;

        let message_ids: Vec<String> = listing["messages"]
            .as_array()
            .map(|msgs| {
                msgs.iter()
                    .filter_map(|m| m["id"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let mut attachments = Vec::new();
        for message_id in &message_ids {
            match self.fetch_message_attachments(message_id).await {
                Ok(mut found) => attachments.append(&mut found),
                Err(e) => {
                    tracing::warn!(message_id, error = %e, "failed to read message, skipping");
                }
            }
        }

        Ok(attachments)
    }

    async fn mark_processed(&self, message_id: &str) -> Result<()> {
        let url = format!(
            "{}/users/me/messages/{}/modify",
            self.endpoint, message_id
        );

        let body = serde_json::json!({
            "addLabelIds": [self.processed_label_id],
            "removeLabelIds": [],
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Gmail modify error {}: {}", status, body);
        }

        Ok(())
    }
}

/// Attachment-bearing MIME part reference, before the body fetch.
struct AttachmentPart {
    filename: String,
    mime_type: String,
    attachment_id: String,
    size: i64,
}

/// Provider search query: unbounded-lookback only on a first run.
fn build_query(checkpoint: Option<DateTime<Utc>>, lookback_hours: i64) -> String {
    match checkpoint {
        Some(ts) => format!("has:attachment after:{}", ts.timestamp()),
        None => {
            // Gmail's relative operator has day granularity
            let days = (lookback_hours + 23) / 24;
            format!("has:attachment newer_than:{}d", days.max(1))
        }
    }
}

fn header_value<'a>(headers: &'a Value, name: &str) -> Option<&'a str> {
    headers.as_array()?.iter().find_map(|h| {
        if h["name"].as_str()? == name {
            h["value"].as_str()
        } else {
            None
        }
    })
}

/// Walk the part tree depth-first, keeping parts that carry both a
/// filename and an attachment reference. Inline content (images,
/// signatures) has no filename and is excluded.
fn collect_attachment_parts(payload: &Value, out: &mut Vec<AttachmentPart>) {
    if let Some(parts) = payload["parts"].as_array() {
        for part in parts {
            let filename = part["filename"].as_str().unwrap_or_default();
            let attachment_id = part["body"]["attachmentId"].as_str();

            if let (false, Some(attachment_id)) = (filename.is_empty(), attachment_id) {
                out.push(AttachmentPart {
                    filename: filename.to_string(),
                    mime_type: part["mimeType"]
                        .as_str()
                        .unwrap_or("application/octet-stream")
                        .to_string(),
                    attachment_id: attachment_id.to_string(),
                    size: part["body"]["size"].as_i64().unwrap_or(0),
                });
            }

            // multipart/* nests arbitrarily deep
            collect_attachment_parts(part, out);
        }
    }
}

/// Gmail's `internalDate` is epoch milliseconds as a string.
fn message_received_at(message: &Value) -> DateTime<Utc> {
    message["internalDate"]
        .as_str()
        .and_then(|ms| ms.parse::<i64>().ok())
        .map(|ms| Utc.timestamp_millis_opt(ms).unwrap())
        .unwrap_or_else(Utc::now)
}

/// Attachment bodies use the URL-safe base64 alphabet, padding optional.
fn decode_body_data(data: &str) -> Result<Vec<u8>> {
    let trimmed = data.trim_end_matches('=');
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(trimmed)
        .context("decoding attachment body")
}

/// Minimal query-string escaping for the Gmail `q` parameter.
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '.' | '~' => out.push(c),
            ' ' => out.push('+'),
            other => {
                let mut buf = [0u8; 4];
                for byte in other.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("%{:02X}", byte));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_query_first_run_uses_lookback() {
        assert_eq!(build_query(None, 24), "has:attachment newer_than:1d");
        assert_eq!(build_query(None, 72), "has:attachment newer_than:3d");
        assert_eq!(build_query(None, 1), "has:attachment newer_than:1d");
    }

    #[test]
    fn test_build_query_checkpoint_bounded() {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(
            build_query(Some(ts), 24),
            "has:attachment after:1700000000"
        );
    }

    #[test]
    fn test_header_value_lookup() {
        let headers = serde_json::json!([
            {"name": "From", "value": "billing@acme.com"},
            {"name": "Subject", "value": "Your October Invoice"},
        ]);
        assert_eq!(header_value(&headers, "From"), Some("billing@acme.com"));
        assert_eq!(header_value(&headers, "Subject"), Some("Your October Invoice"));
        assert_eq!(header_value(&headers, "Date"), None);
    }

    #[test]
    fn test_collect_attachment_parts_skips_inline() {
        let payload = serde_json::json!({
            "parts": [
                {"filename": "", "mimeType": "text/plain", "body": {"size": 20}},
                {"filename": "", "mimeType": "image/png", "body": {"attachmentId": "inline-1", "size": 5}},
                {"filename": "inv.pdf", "mimeType": "application/pdf", "body": {"attachmentId": "att-1", "size": 1234}},
            ]
        });

        let mut parts = Vec::new();
        collect_attachment_parts(&payload, &mut parts);

        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].filename, "inv.pdf");
        assert_eq!(parts[0].attachment_id, "att-1");
        assert_eq!(parts[0].size, 1234);
    }

    #[test]
    fn test_collect_attachment_parts_recurses_nested_multipart() {
        let payload = serde_json::json!({
            "parts": [
                {
                    "mimeType": "multipart/mixed",
                    "filename": "",
                    "body": {},
                    "parts": [
                        {"filename": "deep.xlsx", "mimeType": "application/vnd.ms-excel", "body": {"attachmentId": "att-9", "size": 10}},
                    ]
                }
            ]
        });

        let mut parts = Vec::new();
        collect_attachment_parts(&payload, &mut parts);

        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].filename, "deep.xlsx");
    }

    #[test]
    fn test_decode_body_data_url_safe() {
        // "hello" in URL-safe base64, with and without padding
        assert_eq!(decode_body_data("aGVsbG8").unwrap(), b"hello");
        assert_eq!(decode_body_data("aGVsbG8=").unwrap(), b"hello");
        assert!(decode_body_data("!!not base64!!").is_err());
    }

    #[test]
    fn test_message_received_at_from_internal_date() {
        let message = serde_json::json!({"internalDate": "1700000000000"});
        assert_eq!(message_received_at(&message).timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_urlencode_query() {
        assert_eq!(
            urlencode("has:attachment newer_than:1d"),
            "has%3Aattachment+newer_than%3A1d"
        );
    }
}
