//! # docrelay Core
//!
//! Shared, runtime-agnostic logic for docrelay: work items, index records,
//! the error taxonomy, the collaborator traits the pipeline is written
//! against, the retry/dead-letter policy, and in-memory backends.
//!
//! This crate contains no tokio, sqlx, HTTP clients, or filesystem I/O.
//! Concrete backends (S3, SQS, OpenSearch, SQLite) live in the `docrelay`
//! crate and implement the traits defined here.

pub mod error;
pub mod event;
pub mod extract;
pub mod memory;
pub mod models;
pub mod retry;
pub mod traits;
