pub mod play_billing;
pub mod simulated;
pub mod storekit;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::product::{ProductId, StoreProduct};
use crate::domain::transaction::Transaction;
use crate::errors::StoreError;
use crate::platform::Platform;

pub use play_billing::{BillingClient, PlayBillingStore};
pub use simulated::SimulatedStore;
pub use storekit::{PaymentQueue, StoreKitStore};

/// Correlates a product query with its response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    ProductsLoaded { request: RequestId, products: Vec<StoreProduct> },
    ProductsFailed { request: RequestId, error: String },
    Transaction(Transaction),
}

/// Sending half of the manager's event queue, handed to the binding in `init`.
#[derive(Clone, Debug)]
pub struct StoreEvents {
    sender: mpsc::UnboundedSender<StoreEvent>,
}

impl StoreEvents {
    pub fn new(sender: mpsc::UnboundedSender<StoreEvent>) -> Self {
        Self { sender }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StoreEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }

    pub fn emit(&self, event: StoreEvent) {
        if self.sender.send(event).is_err() {
            debug!(event_name = "iap.store.event_dropped", "purchase manager is gone; dropping event");
        }
    }
}

/// Platform store capability set.
///
/// Every call only initiates work; outcomes arrive later as [`StoreEvent`]s on
/// the sender passed to [`StoreBinding::init`].
pub trait StoreBinding: Send {
    fn platform(&self) -> Platform;
    fn init(&mut self, events: StoreEvents) -> Result<(), StoreError>;
    fn load_products(&mut self, request: RequestId, ids: &[ProductId]);
    fn purchase(&mut self, id: &ProductId);
    fn supports_consumption(&self) -> bool {
        self.platform().supports_consumption()
    }
    fn consume_purchase(&mut self, id: &ProductId);
    fn restore(&mut self);
    fn requires_finish(&self) -> bool {
        self.platform().requires_transaction_finish()
    }
    fn finish_transaction(&mut self, _transaction: &Transaction) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopStore;

impl StoreBinding for NoopStore {
    fn platform(&self) -> Platform {
        Platform::Unsupported
    }

    fn init(&mut self, _events: StoreEvents) -> Result<(), StoreError> {
        Ok(())
    }

    fn load_products(&mut self, _request: RequestId, _ids: &[ProductId]) {}

    fn purchase(&mut self, _id: &ProductId) {}

    fn supports_consumption(&self) -> bool {
        false
    }

    fn consume_purchase(&mut self, _id: &ProductId) {}

    fn restore(&mut self) {}

    fn requires_finish(&self) -> bool {
        false
    }
}

/// Host-provided native store client.
pub enum NativeClient {
    PlayBilling(Box<dyn BillingClient>),
    StoreKit(Box<dyn PaymentQueue>),
}

pub fn binding_for(platform: Platform, native: Option<NativeClient>) -> Box<dyn StoreBinding> {
    match (platform, native) {
        (Platform::Android, Some(NativeClient::PlayBilling(client))) => {
            Box::new(PlayBillingStore::new(client))
        }
        (Platform::Ios, Some(NativeClient::StoreKit(queue))) => Box::new(StoreKitStore::new(queue)),
        (Platform::Unsupported, _) => Box::new(NoopStore),
        (platform, _) => {
            warn!(
                event_name = "iap.store.binding_missing",
                platform = platform.as_str(),
                "no matching native store client; store operations are disabled"
            );
            Box::new(NoopStore)
        }
    }
}
