//! # Meridian Risk
//!
//! The risk-engine boundary. The scheduler consults [`RiskAssess`] before
//! dispatching an armed transaction and after every fill; a failing risk
//! engine is reported back to the strategy as a coded notice and never kills
//! the worker loop.

use core_types::{Tick, Trade, Transaction};
use serde::{Deserialize, Serialize};

// Declare the modules that constitute this crate.
pub mod error;
pub mod permissive;

// Re-export the key components to provide a clean, public-facing API.
pub use error::RiskError;
pub use permissive::PermissiveRisk;

/// The verdict a risk engine returns: code 0 accepts, anything else rejects
/// with a reason the strategy sees verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskNotice {
    pub code: i32,
    pub message: String,
}

impl RiskNotice {
    /// An accepting verdict.
    pub fn good() -> Self {
        Self {
            code: 0,
            message: "good".to_string(),
        }
    }

    /// True when the verdict accepts.
    pub fn is_good(&self) -> bool {
        self.code == 0
    }
}

/// The before/after/notice hooks the execution core invokes.
///
/// Implementations must be defensive: an `Err` from any hook is converted
/// into a synthetic risk-fault notice (code 1005) by the caller, so a
/// defective risk engine degrades to noise rather than an outage.
pub trait RiskAssess: Send + Sync {
    /// Assesses an armed transaction against the tick that armed it, before
    /// any order is materialized.
    fn before(&self, tick: &Tick, transaction: &Transaction) -> Result<RiskNotice, RiskError>;

    /// Assesses a fill after it was applied to the ledger.
    fn after(&self, trade: &Trade, transaction: &Transaction) -> Result<RiskNotice, RiskError>;

    /// Receives a coded fault the core wants the risk engine to know about
    /// (over-trades, integrity faults).
    fn notice(&self, code: i32, message: &str);
}
