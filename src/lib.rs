//! # Attachment Pilot
//!
//! A pull-based pipeline that watches users' mailboxes for incoming
//! attachments, classifies each document, and files the renamed bytes
//! into a folder taxonomy in the user's cloud storage.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌─────────────┐
//! │   Gmail     │──▶│   Pipeline    │──▶│ Google Drive │
//! │ (source)    │   │ classify+file │   │ (destination)│
//! └─────────────┘   └──────┬───────┘   └─────────────┘
//!                          │
//!                    ┌─────┴─────┐
//!                    ▼           ▼
//!               ┌─────────┐ ┌─────────┐
//!               │ SQLite  │ │  HTTP   │
//!               │ ledger  │ │ trigger │
//!               └─────────┘ └─────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! apilot init                       # create database
//! apilot users add jane@example.com
//! apilot connect <user-id> --role email ...
//! apilot connect <user-id> --role storage ...
//! apilot run                        # run the batch once
//! apilot serve                      # expose the cron trigger endpoint
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`connections`] | Credential store and user rows |
//! | [`auth`] | OAuth token refresh |
//! | [`email`] | Gmail source adapter |
//! | [`excerpt`] | Content excerpt extraction |
//! | [`classify`] | Document classification |
//! | [`storage`] | Google Drive destination adapter |
//! | [`ledger`] | Filed-attachment ledger |
//! | [`pipeline`] | Per-user and batch orchestration |
//! | [`server`] | Cron trigger HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod auth;
pub mod classify;
pub mod config;
pub mod connections;
pub mod db;
pub mod email;
pub mod excerpt;
pub mod ledger;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod server;
pub mod storage;
