use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("No settlement price for instrument '{0}'; cannot settle live contracts against it.")]
    MissingPrice(String),

    #[error("No instrument info for '{0}'; cannot compute margin or commission.")]
    MissingInstrument(String),

    #[error("Contract '{contract_id}' belongs to user '{user_id}' which has no account.")]
    OrphanContract {
        contract_id: String,
        user_id: String,
    },

    #[error("Persistence error: {0}")]
    Store(#[from] persistence::StoreError),
}
