//! Coded failure taxonomy shared between the scheduler, the trackers, the
//! callback queues, and the notices delivered back to strategies.
//!
//! A transaction's `state` field is a free-text tag with the code embedded
//! (e.g. `"check-open;1003"`), built with [`state_tag`].

/// Success; also the code of the order-completion notice.
pub const OK: i32 = 0;
/// Account has no available funds at all.
pub const NO_AVAILABLE_FUNDS: i32 = 1001;
/// No margin/commission schedule found for the instrument.
pub const NO_INSTRUMENT: i32 = 1002;
/// Available funds cannot cover margin plus commission.
pub const INSUFFICIENT_FUNDS: i32 = 1003;
/// Not enough open contracts of the opposite direction to close.
pub const INSUFFICIENT_POSITION: i32 = 1004;
/// The risk engine itself failed; the defect is reported, never fatal.
pub const RISK_FAULT: i32 = 1005;
/// Transaction offset is neither open nor close. Fatal for the transaction.
pub const INVALID_OFFSET: i32 = 1006;
/// The same order id was registered for execution tracking twice.
pub const DUPLICATED_ORDER: i32 = 2002;
/// The broker never acknowledged the order inside the ack timeout.
pub const ACK_TIMEOUT: i32 = 3001;
/// A strategy callback returned an error.
pub const CALLBACK_FAULT: i32 = 4001;
/// A strategy callback overran its execution budget and was cancelled.
pub const CALLBACK_TIMEOUT: i32 = 4002;
/// The armed-transaction queue was full; arming skipped (backpressure).
pub const QUEUE_CAPACITY: i32 = 5001;
/// More volume filled against an order than the order asked for.
pub const OVER_TRADE: i32 = 5002;
/// Broker-side "market closed" reject; the transaction re-arms on the next
/// qualifying tick instead of aborting.
pub const MARKET_CLOSED: i32 = 10001;

/// Formats a transaction state tag with an embedded code, e.g.
/// `state_tag("check-open", 1003)` yields `"check-open;1003"`.
pub fn state_tag(phase: &str, code: i32) -> String {
    format!("{phase};{code}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_tag_embeds_code() {
        assert_eq!(state_tag("check-open", INSUFFICIENT_FUNDS), "check-open;1003");
        assert_eq!(state_tag("send", MARKET_CLOSED), "send;10001");
    }
}
