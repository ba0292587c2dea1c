//! Pipeline orchestration.
//!
//! Composes the adapters for one user's pass (connections, token
//! refresh, folder taxonomy, ledger checkpoint, fetch, classify, upload,
//! record) and aggregates passes across all eligible users.
//!
//! Isolation contract:
//! - a failure on one attachment is recorded and the loop continues;
//!   one bad file never aborts a user's batch,
//! - a failure outside the attachment loop fails that user's run,
//! - a failed user never aborts the batch.
//!
//! Sessions are scoped: provider clients are built from a user's stored
//! connection at the start of their pass and dropped at the end. There is
//! no process-wide client state.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::BTreeMap;

use crate::auth;
use crate::classify::Classifier;
use crate::config::Config;
use crate::connections;
use crate::email::{EmailSource, GmailSource};
use crate::excerpt::content_excerpt;
use crate::ledger;
use crate::models::{Attachment, ConnectionRole, FolderTaxonomy, ProviderConnection};
use crate::storage::{DriveStorage, StorageDestination};

/// Builds per-user provider sessions from stored connections.
///
/// The production factory builds Gmail/Drive REST clients; tests
/// substitute in-memory fakes behind the same seam.
pub trait SessionFactory: Send + Sync {
    fn email_source(&self, conn: &ProviderConnection) -> Result<Box<dyn EmailSource>>;
    fn storage(&self, conn: &ProviderConnection) -> Result<Box<dyn StorageDestination>>;
}

/// Factory for the reference provider pair (Gmail + Google Drive).
pub struct GoogleSessionFactory {
    config: Config,
}

impl GoogleSessionFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl SessionFactory for GoogleSessionFactory {
    fn email_source(&self, conn: &ProviderConnection) -> Result<Box<dyn EmailSource>> {
        Ok(Box::new(GmailSource::new(
            &self.config.google,
            &self.config.pipeline,
            conn.access_token.clone(),
        )?))
    }

    fn storage(&self, conn: &ProviderConnection) -> Result<Box<dyn StorageDestination>> {
        Ok(Box::new(DriveStorage::new(
            &self.config.google,
            &self.config.pipeline,
            conn.access_token.clone(),
        )?))
    }
}

/// Outcome of one user's pipeline pass.
#[derive(Debug, Clone, Serialize)]
pub struct UserRunResult {
    pub success: bool,
    pub processed: u32,
    pub errors: Vec<String>,
}

/// Aggregated outcome of one batch invocation.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub total: u32,
    pub successful: u32,
    pub failed: u32,
    pub results: BTreeMap<String, UserRunResult>,
}

/// Run the ingestion-classification-filing pipeline for one user.
///
/// Never returns an error: every fault is folded into the result, with
/// `success = false` only for faults outside the per-attachment loop.
pub async fn run_user(
    pool: &SqlitePool,
    config: &Config,
    factory: &dyn SessionFactory,
    classifier: &dyn Classifier,
    user_id: &str,
) -> UserRunResult {
    let mut errors = Vec::new();
    let mut processed = 0u32;

    match run_user_inner(pool, config, factory, classifier, user_id, &mut errors, &mut processed)
        .await
    {
        Ok(()) => {
            tracing::info!(user_id, processed, errors = errors.len(), "user pass complete");
            UserRunResult {
                success: true,
                processed,
                errors,
            }
        }
        Err(e) => {
            tracing::error!(user_id, error = %e, "user pass failed");
            errors.push(format!("{:#}", e));
            UserRunResult {
                success: false,
                processed,
                errors,
            }
        }
    }
}

async fn run_user_inner(
    pool: &SqlitePool,
    config: &Config,
    factory: &dyn SessionFactory,
    classifier: &dyn Classifier,
    user_id: &str,
    errors: &mut Vec<String>,
    processed: &mut u32,
) -> Result<()> {
    let Some(mut email_conn) = connections::get_connection(pool, user_id, ConnectionRole::Email).await?
    else {
        bail!("No Gmail connection found");
    };

    let Some(mut storage_conn) =
        connections::get_connection(pool, user_id, ConnectionRole::Storage).await?
    else {
        bail!("No Google Drive connection found");
    };

    // Expiring tokens are renewed and persisted before any provider call.
    auth::ensure_fresh(pool, &config.google, &mut email_conn).await?;
    auth::ensure_fresh(pool, &config.google, &mut storage_conn).await?;

    let email = factory.email_source(&email_conn)?;
    let storage = factory.storage(&storage_conn)?;

    let taxonomy = storage
        .ensure_taxonomy()
        .await
        .context("resolving folder taxonomy")?;

    // The ledger, not the connection's liveness stamp, decides what is new.
    let checkpoint = ledger::checkpoint(pool, user_id).await?;

    let attachments = email
        .fetch_new_attachments(checkpoint)
        .await
        .context("fetching attachments")?;

    tracing::info!(user_id, count = attachments.len(), "attachments to process");

    for attachment in &attachments {
        match file_one(pool, config, classifier, storage.as_ref(), &taxonomy, user_id, attachment)
            .await
        {
            Ok(()) => {
                // Source-side bookkeeping is advisory; its failure never
                // fails the pass.
                if let Err(e) = email.mark_processed(&attachment.source_message_id).await {
                    tracing::warn!(
                        user_id,
                        message_id = %attachment.source_message_id,
                        error = %e,
                        "failed to mark message processed"
                    );
                }
                *processed += 1;
            }
            Err(e) => {
                tracing::error!(user_id, filename = %attachment.filename, error = %e, "attachment failed");
                errors.push(format!("{}: {:#}", attachment.filename, e));
            }
        }
    }

    connections::set_last_synced(pool, &email_conn.id, Utc::now()).await?;

    Ok(())
}

/// Classify, route, upload, and record a single attachment.
async fn file_one(
    pool: &SqlitePool,
    config: &Config,
    classifier: &dyn Classifier,
    storage: &dyn StorageDestination,
    taxonomy: &FolderTaxonomy,
    user_id: &str,
    attachment: &Attachment,
) -> Result<()> {
    let excerpt = content_excerpt(
        &attachment.data,
        &attachment.mime_type,
        config.classifier.excerpt_chars,
    );

    let metadata = classifier
        .classify(
            &attachment.filename,
            &attachment.sender,
            &attachment.subject,
            excerpt.as_deref(),
        )
        .await;

    let folder_id = taxonomy.folder_for(metadata.doc_type);

    let uploaded = storage
        .upload(
            &metadata.suggested_filename,
            &attachment.data,
            &attachment.mime_type,
            folder_id,
        )
        .await
        .context("upload failed")?;

    ledger::append(pool, user_id, attachment, &metadata, &uploaded, Utc::now())
        .await
        .context("recording ledger entry")?;

    Ok(())
}

/// Run the pipeline for every eligible user, sequentially.
///
/// Fails only when the user set itself cannot be enumerated; per-user
/// faults are aggregated into the summary.
pub async fn run_all(
    pool: &SqlitePool,
    config: &Config,
    factory: &dyn SessionFactory,
    classifier: &dyn Classifier,
) -> Result<BatchSummary> {
    let users = connections::eligible_users(pool)
        .await
        .context("enumerating eligible users")?;

    tracing::info!(total = users.len(), "starting batch run");

    let mut results = BTreeMap::new();
    let mut successful = 0u32;
    let mut failed = 0u32;

    for user_id in &users {
        let result = run_user(pool, config, factory, classifier, user_id).await;
        if result.success {
            successful += 1;
        } else {
            failed += 1;
        }
        results.insert(user_id.clone(), result);
    }

    Ok(BatchSummary {
        total: users.len() as u32,
        successful,
        failed,
        results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::FallbackClassifier;
    use crate::config::{Config, DbConfig, ServerConfig};
    use crate::models::{DocType, UploadedFile};
    use crate::{db, migrate};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    // ============ Fake provider sessions ============

    #[derive(Default)]
    struct FakeState {
        marked: Mutex<Vec<String>>,
        uploads: Mutex<Vec<(String, String)>>, // (filename, folder id)
        taxonomy_calls: Mutex<u32>,
    }

    struct FakeFactory {
        attachments: Vec<Attachment>,
        fail_upload_containing: Option<String>,
        fail_taxonomy: bool,
        fail_mark: bool,
        state: Arc<FakeState>,
    }

    impl FakeFactory {
        fn new(attachments: Vec<Attachment>) -> Self {
            Self {
                attachments,
                fail_upload_containing: None,
                fail_taxonomy: false,
                fail_mark: false,
                state: Arc::new(FakeState::default()),
            }
        }
    }

    impl SessionFactory for FakeFactory {
        fn email_source(&self, _conn: &ProviderConnection) -> Result<Box<dyn EmailSource>> {
            Ok(Box::new(FakeEmail {
                attachments: self.attachments.clone(),
                fail_mark: self.fail_mark,
                state: self.state.clone(),
            }))
        }

        fn storage(&self, _conn: &ProviderConnection) -> Result<Box<dyn StorageDestination>> {
            Ok(Box::new(FakeStorage {
                fail_upload_containing: self.fail_upload_containing.clone(),
                fail_taxonomy: self.fail_taxonomy,
                state: self.state.clone(),
            }))
        }
    }

    struct FakeEmail {
        attachments: Vec<Attachment>,
        fail_mark: bool,
        state: Arc<FakeState>,
    }

    #[async_trait]
    impl EmailSource for FakeEmail {
        async fn fetch_new_attachments(
            &self,
            checkpoint: Option<DateTime<Utc>>,
        ) -> Result<Vec<Attachment>> {
            Ok(self
                .attachments
                .iter()
                .filter(|a| checkpoint.map_or(true, |cp| a.received_at > cp))
                .cloned()
                .collect())
        }

        async fn mark_processed(&self, message_id: &str) -> Result<()> {
            if self.fail_mark {
                bail!("label service unavailable");
            }
            self.state.marked.lock().unwrap().push(message_id.to_string());
            Ok(())
        }
    }

    struct FakeStorage {
        fail_upload_containing: Option<String>,
        fail_taxonomy: bool,
        state: Arc<FakeState>,
    }

    #[async_trait]
    impl StorageDestination for FakeStorage {
        async fn ensure_taxonomy(&self) -> Result<FolderTaxonomy> {
            if self.fail_taxonomy {
                bail!("storage quota exceeded");
            }
            *self.state.taxonomy_calls.lock().unwrap() += 1;
            Ok(FolderTaxonomy {
                root: "folder-root".to_string(),
                invoices: "folder-invoices".to_string(),
                contracts: "folder-contracts".to_string(),
                receipts: "folder-receipts".to_string(),
                reports: "folder-reports".to_string(),
                other: "folder-other".to_string(),
            })
        }

        async fn upload(
            &self,
            filename: &str,
            _bytes: &[u8],
            _mime_type: &str,
            folder_id: &str,
        ) -> Result<UploadedFile> {
            if let Some(marker) = &self.fail_upload_containing {
                if filename.contains(marker.as_str()) {
                    bail!("simulated upload outage");
                }
            }
            self.state
                .uploads
                .lock()
                .unwrap()
                .push((filename.to_string(), folder_id.to_string()));
            Ok(UploadedFile {
                id: format!("file-{}", filename),
                view_url: format!("https://storage.example/{}", filename),
            })
        }
    }

    // ============ Scaffolding ============

    async fn test_env() -> (TempDir, SqlitePool, Config) {
        let tmp = TempDir::new().unwrap();
        let config = Config {
            db: DbConfig {
                path: tmp.path().join("test.sqlite"),
            },
            google: Default::default(),
            classifier: Default::default(),
            pipeline: Default::default(),
            server: ServerConfig {
                bind: "127.0.0.1:0".to_string(),
            },
        };
        migrate::run_migrations(&config).await.unwrap();
        let pool = db::connect(&config).await.unwrap();
        (tmp, pool, config)
    }

    async fn connected_user(pool: &SqlitePool, email: &str) -> String {
        let user_id = connections::add_user(pool, email).await.unwrap();
        let expiry = Utc::now() + Duration::days(30);
        connections::upsert_connection(
            pool,
            &user_id,
            "gmail",
            ConnectionRole::Email,
            "email-token",
            "email-refresh",
            expiry,
        )
        .await
        .unwrap();
        connections::upsert_connection(
            pool,
            &user_id,
            "gdrive",
            ConnectionRole::Storage,
            "storage-token",
            "storage-refresh",
            expiry,
        )
        .await
        .unwrap();
        user_id
    }

    fn attachment(message_id: &str, filename: &str, sender: &str, subject: &str) -> Attachment {
        Attachment {
            source_message_id: message_id.to_string(),
            filename: filename.to_string(),
            mime_type: "application/pdf".to_string(),
            size_bytes: 4,
            data: b"PDF!".to_vec(),
            sender: sender.to_string(),
            subject: subject.to_string(),
            received_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    // ============ Per-user pipeline ============

    #[tokio::test]
    async fn test_missing_email_connection_fails_cleanly() {
        let (_tmp, pool, config) = test_env().await;
        let user_id = connections::add_user(&pool, "a@example.com").await.unwrap();

        let factory = FakeFactory::new(vec![]);
        let result = run_user(&pool, &config, &factory, &FallbackClassifier, &user_id).await;

        assert!(!result.success);
        assert_eq!(result.processed, 0);
        assert_eq!(result.errors, vec!["No Gmail connection found".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_storage_connection_fails_cleanly() {
        let (_tmp, pool, config) = test_env().await;
        let user_id = connections::add_user(&pool, "a@example.com").await.unwrap();
        connections::upsert_connection(
            &pool,
            &user_id,
            "gmail",
            ConnectionRole::Email,
            "t",
            "r",
            Utc::now() + Duration::days(30),
        )
        .await
        .unwrap();

        let factory = FakeFactory::new(vec![]);
        let result = run_user(&pool, &config, &factory, &FallbackClassifier, &user_id).await;

        assert!(!result.success);
        assert_eq!(result.errors, vec!["No Google Drive connection found".to_string()]);
    }

    #[tokio::test]
    async fn test_invoice_scenario_files_into_invoices_folder() {
        let (_tmp, pool, config) = test_env().await;
        let user_id = connected_user(&pool, "a@example.com").await;

        let factory = FakeFactory::new(vec![attachment(
            "msg-1",
            "inv.pdf",
            "billing@acme.com",
            "Your October Invoice",
        )]);
        let result = run_user(&pool, &config, &factory, &FallbackClassifier, &user_id).await;

        assert!(result.success);
        assert_eq!(result.processed, 1);
        assert!(result.errors.is_empty());

        // Routed to the invoices folder with a normalized name
        let uploads = factory.state.uploads.lock().unwrap().clone();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].1, "folder-invoices");
        assert!(uploads[0].0.ends_with("_acme_Invoice.pdf"));

        // Exactly one taxonomy resolution per pass
        assert_eq!(*factory.state.taxonomy_calls.lock().unwrap(), 1);

        // Ledger row written once, with the original filename
        let rows = ledger::recent_for_user(&pool, &user_id, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].original_filename, "inv.pdf");
        assert_eq!(rows[0].doc_type, DocType::Invoice);

        // Source message marked, liveness stamp written
        assert_eq!(
            factory.state.marked.lock().unwrap().clone(),
            vec!["msg-1".to_string()]
        );
        let conn = connections::get_connection(&pool, &user_id, ConnectionRole::Email)
            .await
            .unwrap()
            .unwrap();
        assert!(conn.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let (_tmp, pool, config) = test_env().await;
        let user_id = connected_user(&pool, "a@example.com").await;

        let factory = FakeFactory::new(vec![attachment(
            "msg-1",
            "inv.pdf",
            "billing@acme.com",
            "Your October Invoice",
        )]);

        let first = run_user(&pool, &config, &factory, &FallbackClassifier, &user_id).await;
        assert_eq!(first.processed, 1);

        // No new source attachments: the checkpoint filters everything out
        let second = run_user(&pool, &config, &factory, &FallbackClassifier, &user_id).await;
        assert!(second.success);
        assert_eq!(second.processed, 0);
        assert_eq!(ledger::count_for_user(&pool, &user_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_one_bad_attachment_does_not_abort_the_rest() {
        let (_tmp, pool, config) = test_env().await;
        let user_id = connected_user(&pool, "a@example.com").await;

        let mut factory = FakeFactory::new(vec![
            attachment("msg-1", "invoice-a.pdf", "x@a.com", "Invoice A"),
            attachment("msg-2", "poison-invoice.pdf", "x@b.com", "Invoice B"),
            attachment("msg-3", "invoice-c.pdf", "x@c.com", "Invoice C"),
        ]);
        factory.fail_upload_containing = Some("poison".to_string());

        let result = run_user(&pool, &config, &factory, &FallbackClassifier, &user_id).await;

        assert!(result.success);
        assert_eq!(result.processed, 2);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("poison-invoice.pdf: "));
        assert_eq!(ledger::count_for_user(&pool, &user_id).await.unwrap(), 2);
        // The failed message was never marked processed
        assert!(!factory
            .state
            .marked
            .lock()
            .unwrap()
            .contains(&"msg-2".to_string()));
    }

    #[tokio::test]
    async fn test_taxonomy_failure_is_pipeline_level() {
        let (_tmp, pool, config) = test_env().await;
        let user_id = connected_user(&pool, "a@example.com").await;

        let mut factory = FakeFactory::new(vec![attachment("m", "f.pdf", "x@a.com", "s")]);
        factory.fail_taxonomy = true;

        let result = run_user(&pool, &config, &factory, &FallbackClassifier, &user_id).await;

        assert!(!result.success);
        assert_eq!(result.processed, 0);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("resolving folder taxonomy"));
        assert_eq!(ledger::count_for_user(&pool, &user_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_processed_failure_is_nonfatal() {
        let (_tmp, pool, config) = test_env().await;
        let user_id = connected_user(&pool, "a@example.com").await;

        let mut factory = FakeFactory::new(vec![attachment(
            "msg-1",
            "receipt.pdf",
            "shop@store.com",
            "Your receipt",
        )]);
        factory.fail_mark = true;

        let result = run_user(&pool, &config, &factory, &FallbackClassifier, &user_id).await;

        assert!(result.success);
        assert_eq!(result.processed, 1);
        assert!(result.errors.is_empty());
        assert_eq!(ledger::count_for_user(&pool, &user_id).await.unwrap(), 1);
    }

    // ============ Batch orchestrator ============

    #[tokio::test]
    async fn test_run_all_over_empty_user_set() {
        let (_tmp, pool, config) = test_env().await;
        let factory = FakeFactory::new(vec![]);

        let summary = run_all(&pool, &config, &factory, &FallbackClassifier)
            .await
            .unwrap();

        assert_eq!(summary.total, 0);
        assert_eq!(summary.successful, 0);
        assert_eq!(summary.failed, 0);
        assert!(summary.results.is_empty());
    }

    #[tokio::test]
    async fn test_run_all_isolates_a_broken_user() {
        let (_tmp, pool, config) = test_env().await;

        let user_a = connected_user(&pool, "a@example.com").await;
        let user_c = connected_user(&pool, "c@example.com").await;

        // User B is flagged as connected but the storage row is gone;
        // their failure must not touch A or C.
        let user_b = connections::add_user(&pool, "b@example.com").await.unwrap();
        connections::upsert_connection(
            &pool,
            &user_b,
            "gmail",
            ConnectionRole::Email,
            "t",
            "r",
            Utc::now() + Duration::days(30),
        )
        .await
        .unwrap();
        sqlx::query("UPDATE users SET storage_connected = 1 WHERE id = ?")
            .bind(&user_b)
            .execute(&pool)
            .await
            .unwrap();

        let factory = FakeFactory::new(vec![]);
        let summary = run_all(&pool, &config, &factory, &FallbackClassifier)
            .await
            .unwrap();

        assert_eq!(summary.total, 3);
        assert_eq!(summary.successful, 2);
        assert_eq!(summary.failed, 1);
        assert!(summary.results[&user_a].success);
        assert!(summary.results[&user_c].success);
        assert!(!summary.results[&user_b].success);
        assert_eq!(
            summary.results[&user_b].errors,
            vec!["No Google Drive connection found".to_string()]
        );
    }
}
