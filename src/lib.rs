//! # docrelay
//!
//! Event-driven document ingestion: object-storage notifications in,
//! searchable text records out.
//!
//! docrelay has two stages joined by a durable queue. The **ingest
//! notifier** turns `Created` events into work items; the **queue
//! processor** fetches each object, extracts its text (OCR for images and scanned PDFs),
//! and writes one deterministically keyed record to a search index.
//! Writes are idempotent: a record id is the hash of its source locator,
//! unchanged content is never rewritten, and older extractions never
//! overwrite newer ones.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────┐   ┌────────────┐   ┌──────────────┐
//! │ S3 / fs      │──▶│ Notifier │──▶│ SQS/SQLite │──▶│  Processor   │
//! │ notification │   │ (filter) │   │   queue    │   │ fetch+extract│
//! └──────────────┘   └──────────┘   └─────┬──────┘   └──────┬───────┘
//!                                         │ dead letters    │ upsert
//!                                         ▼                 ▼
//!                                   ┌──────────┐   ┌────────────────────┐
//!                                   │   DLQ    │   │ OpenSearch/SQLite  │
//!                                   └──────────┘   └────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docrelay init                          # create sqlite tables
//! docrelay notify docs reports/q1.pdf    # enqueue one object
//! docrelay work --once                   # drain the queue
//! docrelay get docs/reports/q1.pdf       # show the indexed record
//! docrelay serve                         # push-mode HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`pipeline`] | Backend wiring from config |
//! | [`notifier`] | Storage events → work items |
//! | [`processor`] | Work items → index records |
//! | [`worker`] | Pull-mode queue consumer |
//! | [`server`] | Push-mode HTTP server |
//! | [`extract`], [`extract_ocr`] | Text extraction |
//! | [`store_s3`], [`store_fs`] | Object stores |
//! | [`queue_sqs`], [`queue_sqlite`] | Work queues and dead letters |
//! | [`index_opensearch`], [`index_sqlite`] | Search indexes |
//! | [`aws`] | SigV4 request signing |
//! | [`db`], [`migrate`] | SQLite connection and schema |

pub mod aws;
pub mod backfill;
pub mod config;
pub mod db;
pub mod dead_letters;
pub mod extract;
pub mod extract_ocr;
pub mod get;
pub mod index_opensearch;
pub mod index_sqlite;
pub mod migrate;
pub mod notifier;
pub mod pipeline;
pub mod processor;
pub mod queue_sqlite;
pub mod queue_sqs;
pub mod server;
pub mod stats;
pub mod store_fs;
pub mod store_s3;
pub mod telemetry;
pub mod worker;
