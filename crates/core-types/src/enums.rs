use serde::{Deserialize, Serialize};

/// The side of a transaction or order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    /// Returns the opposite side. Closing a position always trades against
    /// contracts held in the opposite direction.
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Buy => Direction::Sell,
            Direction::Sell => Direction::Buy,
        }
    }
}

/// Whether a transaction opens new position or closes existing position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Offset {
    Open,
    Close,
}

/// The offset carried by a broker order. A close transaction splits into one
/// order for lots opened today and one for lots carried from history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderOffset {
    Open,
    CloseToday,
    CloseHistory,
}

impl OrderOffset {
    /// True for either of the two closing offsets.
    pub fn is_close(&self) -> bool {
        matches!(self, OrderOffset::CloseToday | OrderOffset::CloseHistory)
    }
}

/// The lifecycle of a single lot of position.
///
/// `Opening -> Open` and `Closing -> Closed` happen only on a trade fill.
/// Unfilled `Opening` contracts are abandoned at settlement; unfilled
/// `Closing` contracts revert to `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractState {
    Opening,
    Open,
    Closing,
    Closed,
}
