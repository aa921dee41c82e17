//! # Meridian Persistence
//!
//! This crate is the system's durability boundary. It defines the [`Queries`]
//! trait — the only interface the execution core uses to read and write
//! ledger state — and provides [`SnapshotStore`], an in-memory implementation
//! that serializes the full object graph as JSON into per-trading-day
//! directories around settlement.
//!
//! ## Architectural Principles
//!
//! - **Boundary, not engine:** The core treats every call here as fallible
//!   and, at almost every write site, absorbs the failure after logging it
//!   (best-effort durability). Only a handful of service-level operations
//!   rethrow.
//! - **Whole-graph snapshots:** `backup` writes the entire ledger as one JSON
//!   document (`before_settlement.json` / `settled.json`), which is also the
//!   restore format.

// Declare the modules that constitute this crate.
pub mod error;
pub mod queries;
pub mod snapshot;

// Re-export the key components to provide a clean, public-facing API.
pub use error::StoreError;
pub use queries::Queries;
pub use snapshot::{LedgerGraph, SnapshotStore};
