use crate::error::RiskError;
use crate::{RiskAssess, RiskNotice};
use core_types::{Tick, Trade, Transaction};
use tracing::warn;

/// A risk engine that accepts everything and logs the faults it is told
/// about. The default when no institutional risk engine is wired in.
#[derive(Debug, Clone, Default)]
pub struct PermissiveRisk;

impl RiskAssess for PermissiveRisk {
    fn before(&self, _tick: &Tick, _transaction: &Transaction) -> Result<RiskNotice, RiskError> {
        Ok(RiskNotice::good())
    }

    fn after(&self, _trade: &Trade, _transaction: &Transaction) -> Result<RiskNotice, RiskError> {
        Ok(RiskNotice::good())
    }

    fn notice(&self, code: i32, message: &str) {
        warn!(code, message, "Risk notice");
    }
}
