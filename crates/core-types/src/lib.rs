//! # Meridian Core Types
//!
//! This crate is the contract ledger: the entity records shared by every other
//! crate in the system. A `Transaction` owns `Order`s, an `Order` owns a locked
//! set of `Contract` ids and an accumulating set of `Trade`s, and an `Account`
//! is the per-user balance sheet those entities settle into.
//!
//! ## Architectural Principles
//!
//! - **Layer 0 Data:** This is a pure data crate. It has no knowledge of the
//!   scheduler, the adapters, or persistence. Everything else depends on it;
//!   it depends on nothing in the workspace.
//! - **Ids, not pointers:** Cross-entity references (`order.transaction_id`,
//!   `contract.id` inside an order's locked set) are string ids resolved
//!   through lookup tables, so ownership flows one direction and no cyclic
//!   back-references exist.
//! - **No behavior beyond invariants:** The only logic here is state-tag
//!   formatting and the margin/commission ratio helpers that several crates
//!   must agree on.

// Declare the modules that constitute this crate.
pub mod codes;
pub mod enums;
pub mod structs;

// Re-export the key components to create a clean, public-facing API.
pub use enums::{ContractState, Direction, Offset, OrderOffset};
pub use structs::{
    Account, Bar, Contract, Instrument, Notice, Order, StrategyProfile, Tick, Trade, Transaction,
    User,
};
