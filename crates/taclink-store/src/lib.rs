//! # taclink-store
//!
//! Local persistence for the taclink messaging core, backed by SQLite.
//!
//! The persistence contract is deliberately simple: one *collection* per
//! message kind (plus one per kind for recipient statuses and one for the
//! identity cache), each stored as a single JSON blob that is loaded
//! wholesale at startup and rewritten wholesale on every mutation. A small
//! `meta` table holds scalar settings such as the self-assigned device
//! address.

pub mod database;
pub mod migrations;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
