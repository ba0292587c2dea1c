//! Google Drive storage destination adapter.
//!
//! Resolves the destination folder taxonomy (one root folder with a
//! subfolder per document category) and uploads renamed files into it.
//! Folder resolution is query-then-create: an existing folder with the
//! right name, parent, and type is reused; the first match wins on the
//! provider's stable listing order, so duplicate folders never make the
//! resolution fail. Upload failures always propagate; a silently dropped
//! file would desynchronize the ledger from the destination.
//!
//! Like [`GmailSource`](crate::email::GmailSource), a [`DriveStorage`] is
//! a scoped per-user session, never cached across users or runs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::config::{GoogleConfig, PipelineConfig};
use crate::models::{FolderTaxonomy, UploadedFile};

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// A cloud destination the pipeline can file attachments into.
#[async_trait]
pub trait StorageDestination: Send + Sync {
    /// Resolve (creating where missing) the folder taxonomy for this
    /// user. Called once per pipeline pass; results are not reused
    /// across passes.
    async fn ensure_taxonomy(&self) -> Result<FolderTaxonomy>;

    /// Single-shot upload of one file into one folder. Returns a stable
    /// id and a human-viewable link.
    async fn upload(
        &self,
        filename: &str,
        bytes: &[u8],
        mime_type: &str,
        folder_id: &str,
    ) -> Result<UploadedFile>;
}

/// Google Drive-backed [`StorageDestination`] for one user.
pub struct DriveStorage {
    endpoint: String,
    upload_endpoint: String,
    access_token: String,
    root_folder: String,
    client: reqwest::Client,
}

impl DriveStorage {
    pub fn new(
        google: &GoogleConfig,
        pipeline: &PipelineConfig,
        access_token: String,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(google.timeout_secs))
            .build()?;

        Ok(Self {
            endpoint: google.drive_endpoint.trim_end_matches('/').to_string(),
            upload_endpoint: google.drive_upload_endpoint.trim_end_matches('/').to_string(),
            access_token,
            root_folder: pipeline.root_folder.clone(),
            client,
        })
    }

    /// Find a folder by exact name under a parent, or create it.
    async fn ensure_folder(&self, name: &str, parent: Option<&str>) -> Result<String> {
        let query = folder_query(name, parent);
        let url = format!(
            "{}/files?q={}&fields=files(id,name)&spaces=drive",
            self.endpoint,
            urlencode(&query)
        );

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Drive list error {}: {}", status, body);
        }

        let listing: Value = response.json().await?;
        if let Some(id) = first_file_id(&listing) {
            return Ok(id);
        }

        let mut metadata = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME,
        });
        if let Some(parent) = parent {
            metadata["parents"] = serde_json::json!([parent]);
        }

        let response = self
            .client
            .post(format!("{}/files?fields=id", self.endpoint))
            .bearer_auth(&self.access_token)
            .json(&metadata)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Drive folder create error {}: {}", status, body);
        }

        let created: Value = response.json().await?;
        created["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Drive folder create response missing id"))
    }
}

#[async_trait]
impl StorageDestination for DriveStorage {
    async fn ensure_taxonomy(&self) -> Result<FolderTaxonomy> {
        let root = self.ensure_folder(&self.root_folder, None).await?;

        let invoices = self.ensure_folder("Invoices", Some(&root)).await?;
        let contracts = self.ensure_folder("Contracts", Some(&root)).await?;
        let receipts = self.ensure_folder("Receipts", Some(&root)).await?;
        let reports = self.ensure_folder("Reports", Some(&root)).await?;
        let other = self.ensure_folder("Other", Some(&root)).await?;

        Ok(FolderTaxonomy {
            root,
            invoices,
            contracts,
            receipts,
            reports,
            other,
        })
    }

    async fn upload(
        &self,
        filename: &str,
        bytes: &[u8],
        mime_type: &str,
        folder_id: &str,
    ) -> Result<UploadedFile> {
        let metadata = serde_json::json!({
            "name": filename,
            "parents": [folder_id],
        });

        let boundary = format!("apilot-{}", Uuid::new_v4());
        let body = build_multipart_body(&boundary, &metadata.to_string(), mime_type, bytes);

        let url = format!(
            "{}/files?uploadType=multipart&fields=id,webViewLink",
            self.upload_endpoint
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .header(
                "Content-Type",
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Drive upload error {}: {}", status, body);
        }

        let created: Value = response.json().await.context("parsing upload response")?;
        let id = created["id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Drive upload response missing id"))?
            .to_string();
        let view_url = created["webViewLink"].as_str().unwrap_or_default().to_string();

        Ok(UploadedFile { id, view_url })
    }
}

/// Drive search expression for a non-trashed folder with an exact name,
/// optionally under a parent.
fn folder_query(name: &str, parent: Option<&str>) -> String {
    let name = escape_query_value(name);
    match parent {
        Some(parent) => format!(
            "name='{}' and mimeType='{}' and '{}' in parents and trashed=false",
            name,
            FOLDER_MIME,
            escape_query_value(parent)
        ),
        None => format!(
            "name='{}' and mimeType='{}' and trashed=false",
            name, FOLDER_MIME
        ),
    }
}

/// Escape a value embedded in a single-quoted Drive query string.
fn escape_query_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// First match from a `files.list` response, in the provider's listing
/// order. `None` when nothing matched.
fn first_file_id(listing: &Value) -> Option<String> {
    listing["files"]
        .as_array()?
        .first()?
        .get("id")?
        .as_str()
        .map(str::to_string)
}

/// Assemble a `multipart/related` upload body: a JSON metadata part
/// followed by the media part.
fn build_multipart_body(
    boundary: &str,
    metadata_json: &str,
    mime_type: &str,
    bytes: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(bytes.len() + metadata_json.len() + 256);

    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata_json.as_bytes());
    body.extend_from_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", mime_type).as_bytes());
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

    body
}

/// Minimal query-string escaping for the Drive `q` parameter.
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
