use thiserror::Error;

/// Failure delivered to a purchase, consume or load callback.
///
/// `Display` is the human-readable message the host shows or logs; store
/// messages pass through verbatim.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PurchaseError {
    #[error("{0}")]
    Store(String),
    #[error("consumption not supported")]
    ConsumptionUnsupported,
    #[error("unknown product `{0}`")]
    UnknownProduct(String),
    #[error("purchase manager is not initialized")]
    NotInitialized,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ManagerError {
    #[error("purchase manager is already initialized")]
    AlreadyInitialized,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store connection failed: {0}")]
    Connection(String),
}
