//! Document classification.
//!
//! Defines the [`Classifier`] trait and concrete implementations:
//! - **[`FallbackClassifier`]** — the pure local heuristic; used when the
//!   provider is `"disabled"`.
//! - **[`OpenAiClassifier`]** — calls the chat completions API with a
//!   bounded prompt and retry/backoff, degrading to the local heuristic
//!   on any failure.
//!
//! Classification is total: every call returns a [`DocumentMetadata`] with
//! a `doc_type` inside the closed set and a non-empty filename composed
//! only of `[A-Za-z0-9._-]`.
//!
//! # Retry Strategy
//!
//! The OpenAI implementation uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::time::Duration;

use crate::config::ClassifierConfig;
use crate::models::{DocType, DocumentMetadata};

/// Trait for document classifiers.
///
/// Implementations must be total: the pipeline relies on every
/// attachment getting usable metadata, remote weather notwithstanding.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        filename: &str,
        sender: &str,
        subject: &str,
        content_excerpt: Option<&str>,
    ) -> DocumentMetadata;
}

/// Create the appropriate [`Classifier`] based on configuration.
pub fn create_classifier(config: &ClassifierConfig) -> Result<Box<dyn Classifier>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(FallbackClassifier)),
        "openai" => Ok(Box::new(OpenAiClassifier::new(config.clone())?)),
        other => bail!("Unknown classifier provider: {}", other),
    }
}

// ============ Fallback Classifier ============

/// Local-only classifier. Deterministic, never calls out, never fails.
pub struct FallbackClassifier;

#[async_trait]
impl Classifier for FallbackClassifier {
    async fn classify(
        &self,
        filename: &str,
        sender: &str,
        subject: &str,
        _content_excerpt: Option<&str>,
    ) -> DocumentMetadata {
        fallback_metadata(filename, sender, subject, Utc::now().date_naive())
    }
}

// ============ OpenAI Classifier ============

/// Classifier backed by the OpenAI chat completions API.
///
/// Requires the `OPENAI_API_KEY` environment variable to be set. The
/// prompt is bounded (excerpt pre-truncated by the caller, response token
/// cap from config) and the response must be a strict JSON object,
/// tolerating surrounding code-fence markup.
pub struct OpenAiClassifier {
    config: ClassifierConfig,
    client: reqwest::Client,
}

impl OpenAiClassifier {
    pub fn new(config: ClassifierConfig) -> Result<Self> {
        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    async fn classify_remote(
        &self,
        filename: &str,
        sender: &str,
        subject: &str,
        content_excerpt: Option<&str>,
    ) -> Result<DocumentMetadata> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;

        let model = self
            .config
            .model
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("classifier.model required"))?;

        let prompt = build_prompt(filename, sender, subject, content_excerpt);

        let body = serde_json::json!({
            "model": model,
            "messages": [
                {
                    "role": "system",
                    "content": "You are a document classification assistant. Analyze documents and extract structured metadata. Always respond with valid JSON.",
                },
                { "role": "user", "content": prompt },
            ],
            "temperature": 0.3,
            "max_tokens": self.config.max_response_tokens,
        });

        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&self.config.endpoint)
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        let content = json
                            .pointer("/choices/0/message/content")
                            .and_then(|c| c.as_str())
                            .ok_or_else(|| {
                                anyhow::anyhow!("Invalid completion response: missing content")
                            })?;
                        return parse_classification(content, filename, sender);
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "Classifier API error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Classifier API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Classification failed after retries")))
    }
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    async fn classify(
        &self,
        filename: &str,
        sender: &str,
        subject: &str,
        content_excerpt: Option<&str>,
    ) -> DocumentMetadata {
        match self
            .classify_remote(filename, sender, subject, content_excerpt)
            .await
        {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(filename, error = %e, "remote classification failed, using fallback");
                fallback_metadata(filename, sender, subject, Utc::now().date_naive())
            }
        }
    }
}

fn build_prompt(
    filename: &str,
    sender: &str,
    subject: &str,
    content_excerpt: Option<&str>,
) -> String {
    let mut prompt = format!(
        "Analyze this document and extract metadata:\n\n\
         Filename: {}\n\
         Email Sender: {}\n\
         Email Subject: {}\n",
        filename, sender, subject
    );

    if let Some(excerpt) = content_excerpt {
        prompt.push_str(&format!("Content Preview: {}\n", excerpt));
    }

    prompt.push_str(
        "\nClassify this document and extract:\n\
         1. Document type (Invoice, Contract, Receipt, Report, Proposal, or Other)\n\
         2. Company/entity name\n\
         3. Date (in YYYY-MM-DD format if found)\n\
         4. Amount (if it's an invoice or receipt)\n\
         5. Contract parties (if it's a contract)\n\n\
         Generate a clean filename following this format:\n\
         [Date]_[Company]_[DocType]_[Detail].[extension]\n\n\
         Respond in JSON format:\n\
         {\n\
           \"docType\": \"Invoice\",\n\
           \"company\": \"Acme Corp\",\n\
           \"date\": \"2026-02-22\",\n\
           \"amount\": \"$1,234.00\",\n\
           \"parties\": [],\n\
           \"suggestedFilename\": \"2026-02-22_AcmeCorp_Invoice_1234.pdf\"\n\
         }",
    );

    prompt
}

/// Decode a model response into validated metadata. Pure; any defect in
/// the response surfaces as an error for the caller to degrade on.
fn parse_classification(content: &str, filename: &str, sender: &str) -> Result<DocumentMetadata> {
    let stripped = strip_code_fences(content);
    let mut metadata: DocumentMetadata = serde_json::from_str(&stripped)?;

    // An out-of-set docType already collapsed to Other during decoding.
    // Filenames are normalized on every path, remote included.
    let suggested = metadata.suggested_filename.trim().to_string();
    metadata.suggested_filename = if suggested.is_empty() {
        let company = metadata
            .company
            .clone()
            .unwrap_or_else(|| company_from_sender(sender));
        fallback_filename(
            filename,
            metadata.date.as_deref().unwrap_or(""),
            &company,
            metadata.doc_type,
        )
    } else {
        sanitize_filename(&suggested)
    };

    Ok(metadata)
}

/// Remove surrounding Markdown code-fence markup from a model response.
fn strip_code_fences(content: &str) -> String {
    let trimmed = content.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix("```").unwrap_or(trimmed);
    trimmed.trim().to_string()
}

// ============ Fallback heuristics ============

/// Build complete metadata from local signals only. Pure and total: any
/// filename/sender/subject combination yields a valid result.
pub fn fallback_metadata(
    filename: &str,
    sender: &str,
    subject: &str,
    today: NaiveDate,
) -> DocumentMetadata {
    let doc_type = detect_doc_type(filename, subject);
    let company = company_from_sender(sender);
    let date = today.format("%Y-%m-%d").to_string();
    let suggested_filename = fallback_filename(filename, &date, &company, doc_type);

    DocumentMetadata {
        doc_type,
        company: Some(company),
        date: Some(date),
        amount: None,
        parties: Vec::new(),
        suggested_filename,
    }
}

/// Keyword classification over filename + subject, case-insensitive.
pub fn detect_doc_type(filename: &str, subject: &str) -> DocType {
    let text = format!("{} {}", filename, subject).to_lowercase();

    if text.contains("invoice") {
        DocType::Invoice
    } else if text.contains("contract") || text.contains("agreement") {
        DocType::Contract
    } else if text.contains("receipt") {
        DocType::Receipt
    } else if text.contains("report") {
        DocType::Report
    } else if text.contains("proposal") {
        DocType::Proposal
    } else {
        DocType::Other
    }
}

/// Derive a company token from the sender address: the domain label
/// before the TLD suffix, stripped of non-alphanumerics.
pub fn company_from_sender(sender: &str) -> String {
    let Some(at) = sender.find('@') else {
        return "Unknown".to_string();
    };

    let domain: String = sender[at + 1..]
        .chars()
        .take_while(|c| !matches!(c, '>' | '<' | ' ' | '\t'))
        .collect();

    let label = domain.split('.').next().unwrap_or("");
    let cleaned: String = label.chars().filter(|c| c.is_ascii_alphanumeric()).collect();

    if cleaned.is_empty() {
        "Unknown".to_string()
    } else {
        cleaned
    }
}

/// Synthesize `{date}_{company}_{docType}.{ext}`, normalized.
pub fn fallback_filename(
    original_filename: &str,
    date: &str,
    company: &str,
    doc_type: DocType,
) -> String {
    let extension = original_filename
        .rsplit('.')
        .next()
        .filter(|ext| !ext.is_empty() && *ext != original_filename)
        .unwrap_or("pdf");

    let date = if date.is_empty() { "undated" } else { date };
    let company = if company.is_empty() { "Unknown" } else { company };

    sanitize_filename(&format!(
        "{}_{}_{}.{}",
        date,
        company,
        doc_type.as_str(),
        extension
    ))
}

/// Collapse every character outside `[A-Za-z0-9._-]` to `_`, then
/// collapse runs of `_` to a single one.
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_underscore = false;

    for c in name.chars() {
        let mapped = if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            c
        } else {
            '_'
        };

        if mapped == '_' {
            if prev_underscore {
                continue;
            }
            prev_underscore = true;
        } else {
            prev_underscore = false;
        }
        out.push(mapped);
    }

    out
}
