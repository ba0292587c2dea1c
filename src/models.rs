//! Core data models used throughout Attachment Pilot.
//!
//! These types represent the attachments, classification metadata, and
//! connection records that flow through the ingestion and filing pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Closed document-type taxonomy. Anything a classifier returns outside
/// this set deserializes to [`DocType::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DocType {
    Invoice,
    Contract,
    Receipt,
    Report,
    Proposal,
    Other,
}

impl<'de> Deserialize<'de> for DocType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(DocType::parse(&s))
    }
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Invoice => "Invoice",
            DocType::Contract => "Contract",
            DocType::Receipt => "Receipt",
            DocType::Report => "Report",
            DocType::Proposal => "Proposal",
            DocType::Other => "Other",
        }
    }

    /// Parse a stored string back into the closed set; unknown values
    /// collapse to `Other`.
    pub fn parse(s: &str) -> Self {
        match s {
            "Invoice" => DocType::Invoice,
            "Contract" => DocType::Contract,
            "Receipt" => DocType::Receipt,
            "Report" => DocType::Report,
            "Proposal" => DocType::Proposal,
            _ => DocType::Other,
        }
    }
}

impl std::fmt::Display for DocType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for DocType {
    fn default() -> Self {
        DocType::Other
    }
}

/// Which side of the pipeline a stored credential serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Email,
    Storage,
}

impl ConnectionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionRole::Email => "email",
            ConnectionRole::Storage => "storage",
        }
    }
}

/// A user account, as far as the pipeline cares: identity plus the two
/// connected flags that gate batch eligibility.
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub email: String,
    pub email_connected: bool,
    pub storage_connected: bool,
    pub created_at: DateTime<Utc>,
}

/// A stored OAuth credential pair binding a user to one provider in one
/// role. `last_synced_at` is a liveness signal only; the ledger is the
/// authoritative checkpoint.
#[derive(Debug, Clone)]
pub struct ProviderConnection {
    pub id: String,
    pub user_id: String,
    pub provider: String,
    pub role: ConnectionRole,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expiry: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// One attachment pulled out of a source message. In-memory only: produced
/// by the email adapter, consumed within a single pipeline pass.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub source_message_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub data: Vec<u8>,
    pub sender: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
}

/// Structured metadata for one document, from the remote classifier or the
/// local fallback heuristic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(rename = "docType", default)]
    pub doc_type: DocType,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub parties: Vec<String>,
    #[serde(rename = "suggestedFilename", default)]
    pub suggested_filename: String,
}

/// A file created in the storage destination.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub id: String,
    pub view_url: String,
}

/// Resolved destination folder ids for one user, valid for one pipeline
/// pass. Re-resolved every run so external reorganization is tolerated.
#[derive(Debug, Clone)]
pub struct FolderTaxonomy {
    pub root: String,
    pub invoices: String,
    pub contracts: String,
    pub receipts: String,
    pub reports: String,
    pub other: String,
}

impl FolderTaxonomy {
    /// Total mapping from document type to destination folder. Types
    /// without a dedicated folder route to `other`.
    pub fn folder_for(&self, doc_type: DocType) -> &str {
        match doc_type {
            DocType::Invoice => &self.invoices,
            DocType::Contract => &self.contracts,
            DocType::Receipt => &self.receipts,
            DocType::Report => &self.reports,
            DocType::Proposal | DocType::Other => &self.other,
        }
    }
}

/// An attachment ledger row: written exactly once per successfully filed
/// attachment, immutable thereafter.
#[derive(Debug, Clone)]
pub struct ProcessedAttachment {
    pub id: String,
    pub user_id: String,
    pub source_message_id: String,
    pub original_filename: String,
    pub new_filename: String,
    pub doc_type: DocType,
    pub metadata_json: String,
    pub content_sha256: String,
    pub storage_url: String,
    pub processed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doctype_unknown_deserializes_to_other() {
        let dt: DocType = serde_json::from_str("\"Memo\"").unwrap();
        assert_eq!(dt, DocType::Other);
    }

    #[test]
    fn test_doctype_parse_roundtrip() {
        for dt in [
            DocType::Invoice,
            DocType::Contract,
            DocType::Receipt,
            DocType::Report,
            DocType::Proposal,
            DocType::Other,
        ] {
            assert_eq!(DocType::parse(dt.as_str()), dt);
        }
        assert_eq!(DocType::parse("whatever"), DocType::Other);
    }

    #[test]
    fn test_folder_routing_is_total() {
        let tax = FolderTaxonomy {
            root: "r".into(),
            invoices: "i".into(),
            contracts: "c".into(),
            receipts: "rc".into(),
            reports: "rp".into(),
            other: "o".into(),
        };
        assert_eq!(tax.folder_for(DocType::Invoice), "i");
        assert_eq!(tax.folder_for(DocType::Contract), "c");
        assert_eq!(tax.folder_for(DocType::Receipt), "rc");
        assert_eq!(tax.folder_for(DocType::Report), "rp");
        // No dedicated Proposals folder in the taxonomy
        assert_eq!(tax.folder_for(DocType::Proposal), "o");
        assert_eq!(tax.folder_for(DocType::Other), "o");
    }
}
