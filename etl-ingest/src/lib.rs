//! CDC file ingestion into analytical target tables.
//!
//! Each change file produced by the replication service is loaded into a staging table,
//! reconciled with the target schema, reduced to one row version per primary key and merged
//! into its target table. A ledger of processed files makes every file apply at most once.
//!
//! The store, ledger, blob store and notifier are traits with Postgres/S3/webhook back-ends
//! for production and in-memory back-ends for tests.

pub mod blob;
pub mod dedup;
pub mod error;
pub mod event;
pub mod keys;
pub mod ledger;
mod macros;
pub mod merge;
pub mod metrics;
pub mod migrations;
pub mod notification;
pub mod outcome;
pub mod pipeline;
pub mod reconcile;
pub mod schema_metadata;
pub mod sql;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod type_mapper;
pub mod types;
