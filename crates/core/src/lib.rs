pub mod cache;
pub mod config;
pub mod domain;
pub mod errors;
pub mod manager;
pub mod platform;
pub mod store;

pub use cache::{CacheError, CatalogCache, PlainTransform, SignedTransform, StorageTransform};
pub use config::{AppConfig, ConfigError, LoadOptions};
pub use domain::product::{Product, ProductId, StoreProduct};
pub use domain::transaction::{Transaction, TransactionState};
pub use errors::{ManagerError, PurchaseError, StoreError};
pub use manager::{completion_channel, Completion, PurchaseManager};
pub use platform::Platform;
pub use store::{
    binding_for, NativeClient, NoopStore, RequestId, SimulatedStore, StoreBinding, StoreEvent,
    StoreEvents,
};
