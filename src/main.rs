//! # Attachment Pilot CLI (`apilot`)
//!
//! The `apilot` binary is the operator interface for the attachment
//! pipeline: database initialization, user and connection bookkeeping,
//! one-shot batch runs, and the cron trigger server.
//!
//! ## Usage
//!
//! ```bash
//! apilot --config ./config/apilot.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `apilot init` | Create the SQLite database and run schema migrations |
//! | `apilot users add <email>` | Register a user |
//! | `apilot users list` | List users and connected flags |
//! | `apilot connect <user-id>` | Store an OAuth credential pair for a user |
//! | `apilot connections` | Show per-user connection and sync status |
//! | `apilot run [--user <id>]` | Run the batch (or one user) once |
//! | `apilot serve` | Start the HTTP trigger server |

mod auth;
mod classify;
mod config;
mod connections;
mod db;
mod email;
mod excerpt;
mod ledger;
mod migrate;
mod models;
mod pipeline;
mod server;
mod storage;

use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::models::ConnectionRole;
use crate::pipeline::{GoogleSessionFactory, UserRunResult};

/// Attachment Pilot — watches mailboxes for attachments, classifies each
/// document, and files it into a cloud storage folder taxonomy.
#[derive(Parser)]
#[command(
    name = "apilot",
    about = "Attachment Pilot — email attachment ingestion, classification, and cloud filing",
    version,
    long_about = "Attachment Pilot pulls new attachments from connected mailboxes on a schedule, \
    classifies each document (remotely or with a local heuristic), renames it, uploads it into a \
    per-type folder taxonomy in the user's cloud storage, and records every filing in an \
    append-only ledger that doubles as the incremental-sync checkpoint."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/apilot.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (users,
    /// connections, processed_attachments). Idempotent.
    Init,

    /// Manage user rows.
    Users {
        #[command(subcommand)]
        action: UsersAction,
    },

    /// Store an OAuth credential pair for a user.
    ///
    /// Upserts the (user, provider, role) connection row and flips the
    /// user's matching connected flag. The authorization-code exchange
    /// that produced the tokens happens outside this tool.
    Connect {
        /// User id (from `apilot users list`).
        user_id: String,

        /// Connection role: `email` or `storage`.
        #[arg(long)]
        role: String,

        /// Provider identifier. Defaults to `gmail` for email and
        /// `gdrive` for storage.
        #[arg(long)]
        provider: Option<String>,

        /// OAuth access token.
        #[arg(long)]
        access_token: String,

        /// OAuth refresh token.
        #[arg(long)]
        refresh_token: String,

        /// Seconds until the access token expires.
        #[arg(long, default_value_t = 3600)]
        expires_in: i64,
    },

    /// Show per-user connection and sync status.
    Connections,

    /// Run the pipeline once, for all eligible users or a single one.
    Run {
        /// Process only this user id.
        #[arg(long)]
        user: Option<String>,
    },

    /// Start the HTTP trigger server.
    ///
    /// Exposes `/cron/process` for the external scheduler, authenticated
    /// with the `CRON_SECRET` bearer token.
    Serve,
}

/// User management subcommands.
#[derive(Subcommand)]
enum UsersAction {
    /// Register a user by email address.
    Add {
        /// The user's email address.
        email: String,
    },
    /// List users with their connected flags.
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Users { action } => match action {
            UsersAction::Add { email } => {
                let pool = db::connect(&cfg).await?;
                let id = connections::add_user(&pool, &email).await?;
                println!("{}", id);
            }
            UsersAction::List => {
                let pool = db::connect(&cfg).await?;
                let users = connections::list_users(&pool).await?;
                println!("{:<38} {:<28} {:<7} {:<7}", "ID", "EMAIL", "GMAIL", "DRIVE");
                for user in users {
                    println!(
                        "{:<38} {:<28} {:<7} {:<7}",
                        user.id, user.email, user.email_connected, user.storage_connected
                    );
                }
            }
        },
        Commands::Connect {
            user_id,
            role,
            provider,
            access_token,
            refresh_token,
            expires_in,
        } => {
            let role = match role.as_str() {
                "email" => ConnectionRole::Email,
                "storage" => ConnectionRole::Storage,
                other => bail!("Unknown role: '{}'. Must be email or storage.", other),
            };
            let provider = provider.unwrap_or_else(|| {
                match role {
                    ConnectionRole::Email => "gmail",
                    ConnectionRole::Storage => "gdrive",
                }
                .to_string()
            });

            let pool = db::connect(&cfg).await?;
            connections::upsert_connection(
                &pool,
                &user_id,
                &provider,
                role,
                &access_token,
                &refresh_token,
                Utc::now() + Duration::seconds(expires_in),
            )
            .await?;
            println!("connected {} ({}) for {}", role.as_str(), provider, user_id);
        }
        Commands::Connections => {
            let pool = db::connect(&cfg).await?;
            let users = connections::list_users(&pool).await?;
            println!(
                "{:<38} {:<24} {:<7} {:<7} {:<6} LAST SYNC",
                "USER", "EMAIL", "GMAIL", "DRIVE", "FILED"
            );
            for user in users {
                let filed = ledger::count_for_user(&pool, &user.id).await?;
                let last_sync = connections::get_connection(&pool, &user.id, ConnectionRole::Email)
                    .await?
                    .and_then(|c| c.last_synced_at)
                    .map(|ts| ts.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{:<38} {:<24} {:<7} {:<7} {:<6} {}",
                    user.id, user.email, user.email_connected, user.storage_connected, filed, last_sync
                );
            }
        }
        Commands::Run { user } => {
            let pool = db::connect(&cfg).await?;
            let classifier = classify::create_classifier(&cfg.classifier)?;
            let factory = GoogleSessionFactory::new(cfg.clone());

            match user {
                Some(user_id) => {
                    let result =
                        pipeline::run_user(&pool, &cfg, &factory, classifier.as_ref(), &user_id)
                            .await;
                    print_user_result(&user_id, &result);
                    if !result.success {
                        bail!("run failed for user {}", user_id);
                    }
                }
                None => {
                    let summary =
                        pipeline::run_all(&pool, &cfg, &factory, classifier.as_ref()).await?;
                    println!("batch run");
                    println!("  total: {}", summary.total);
                    println!("  successful: {}", summary.successful);
                    println!("  failed: {}", summary.failed);
                    for (user_id, result) in &summary.results {
                        print_user_result(user_id, result);
                    }
                    println!("ok");
                }
            }
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

fn print_user_result(user_id: &str, result: &UserRunResult) {
    let status = if result.success { "ok" } else { "FAILED" };
    println!("  {}: {}, processed {}", user_id, status, result.processed);
    for error in &result.errors {
        println!("    - {}", error);
    }
}
