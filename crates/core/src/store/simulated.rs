use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use super::{RequestId, StoreBinding, StoreEvent, StoreEvents};
use crate::domain::product::{ProductId, StoreProduct};
use crate::domain::transaction::{Transaction, TransactionState};
use crate::errors::StoreError;
use crate::platform::Platform;

/// In-process sandbox store with a scripted catalog.
///
/// Every initiation answers synchronously into the event queue, so a single
/// `dispatch_pending` on the manager observes the outcome.
#[derive(Debug)]
pub struct SimulatedStore {
    platform: Platform,
    catalog: Vec<StoreProduct>,
    owned: BTreeSet<ProductId>,
    failures: HashMap<ProductId, String>,
    events: Option<StoreEvents>,
}

impl SimulatedStore {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            catalog: Vec::new(),
            owned: BTreeSet::new(),
            failures: HashMap::new(),
            events: None,
        }
    }

    pub fn with_product(mut self, product: StoreProduct) -> Self {
        self.catalog.retain(|existing| existing.identifier != product.identifier);
        self.catalog.push(product);
        self
    }

    /// Marks a product as already bought on the store side, as if by an
    /// earlier install.
    pub fn with_owned(mut self, id: ProductId) -> Self {
        self.owned.insert(id);
        self
    }

    pub fn with_failure(mut self, id: ProductId, message: impl Into<String>) -> Self {
        self.failures.insert(id, message.into());
        self
    }

    pub fn owned(&self) -> impl Iterator<Item = &ProductId> {
        self.owned.iter()
    }

    fn knows(&self, id: &ProductId) -> bool {
        self.catalog.iter().any(|product| &product.identifier == id)
    }

    fn emit(&self, transaction: Transaction) {
        match &self.events {
            Some(events) => events.emit(StoreEvent::Transaction(transaction)),
            None => debug!(product_id = %transaction.product_id, "simulated store used before init"),
        }
    }

    fn settled(id: &ProductId, state: TransactionState) -> Transaction {
        Transaction::new(id.clone(), state)
            .with_transaction_id(Uuid::new_v4().to_string())
            .with_occurred_at(Utc::now())
    }
}

impl StoreBinding for SimulatedStore {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn init(&mut self, events: StoreEvents) -> Result<(), StoreError> {
        self.events = Some(events);
        Ok(())
    }

    fn load_products(&mut self, request: RequestId, ids: &[ProductId]) {
        let products = ids
            .iter()
            .filter_map(|id| self.catalog.iter().find(|product| &product.identifier == id))
            .cloned()
            .collect();
        if let Some(events) = &self.events {
            events.emit(StoreEvent::ProductsLoaded { request, products });
        }
    }

    fn purchase(&mut self, id: &ProductId) {
        if let Some(message) = self.failures.get(id) {
            let transaction = Transaction::failed(id.clone(), message.clone());
            self.emit(transaction);
            return;
        }
        if !self.knows(id) {
            self.emit(Transaction::failed(id.clone(), "item unavailable"));
            return;
        }

        self.owned.insert(id.clone());
        self.emit(Self::settled(id, TransactionState::Purchased));
    }

    fn consume_purchase(&mut self, id: &ProductId) {
        if let Some(message) = self.failures.get(id) {
            let transaction = Transaction::failed(id.clone(), message.clone());
            self.emit(transaction);
            return;
        }
        if !self.owned.remove(id) {
            self.emit(Transaction::failed(id.clone(), "item not owned"));
            return;
        }

        self.emit(Self::settled(id, TransactionState::Consumed));
    }

    fn restore(&mut self) {
        let restored: Vec<Transaction> = self
            .owned
            .iter()
            .map(|id| Self::settled(id, TransactionState::Restored))
            .collect();
        for transaction in restored {
            self.emit(transaction);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SimulatedStore;
    use crate::domain::product::{ProductId, StoreProduct};
    use crate::domain::transaction::TransactionState;
    use crate::platform::Platform;
    use crate::store::{RequestId, StoreBinding, StoreEvent, StoreEvents};

    fn drain(receiver: &mut tokio::sync::mpsc::UnboundedReceiver<StoreEvent>) -> Vec<StoreEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    fn states(events: &[StoreEvent]) -> Vec<(String, TransactionState)> {
        events
            .iter()
            .filter_map(|event| match event {
                StoreEvent::Transaction(transaction) => {
                    Some((transaction.product_id.0.clone(), transaction.state))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn load_returns_only_known_products_in_request_order() {
        let mut store = SimulatedStore::new(Platform::Android)
            .with_product(StoreProduct::new("coins_100"))
            .with_product(StoreProduct::new("remove_ads"));
        let (events, mut receiver) = StoreEvents::channel();
        store.init(events).expect("init");

        store.load_products(
            RequestId(4),
            &[ProductId::from("remove_ads"), ProductId::from("retired"), ProductId::from("coins_100")],
        );

        match drain(&mut receiver).as_slice() {
            [StoreEvent::ProductsLoaded { request, products }] => {
                assert_eq!(*request, RequestId(4));
                let ids: Vec<&str> = products.iter().map(|product| product.identifier.as_str()).collect();
                assert_eq!(ids, vec!["remove_ads", "coins_100"]);
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn purchase_consume_and_restore_follow_owned_set() {
        let mut store = SimulatedStore::new(Platform::Android)
            .with_product(StoreProduct::new("coins_100"))
            .with_product(StoreProduct::new("remove_ads"))
            .with_owned(ProductId::from("remove_ads"));
        let (events, mut receiver) = StoreEvents::channel();
        store.init(events).expect("init");

        store.purchase(&ProductId::from("coins_100"));
        store.consume_purchase(&ProductId::from("coins_100"));
        store.consume_purchase(&ProductId::from("coins_100"));
        store.restore();

        assert_eq!(
            states(&drain(&mut receiver)),
            vec![
                ("coins_100".to_string(), TransactionState::Purchased),
                ("coins_100".to_string(), TransactionState::Consumed),
                ("coins_100".to_string(), TransactionState::Failed),
                ("remove_ads".to_string(), TransactionState::Restored),
            ]
        );
    }

    #[test]
    fn scripted_failures_and_unknown_products_fail() {
        let mut store = SimulatedStore::new(Platform::Ios)
            .with_product(StoreProduct::new("remove_ads"))
            .with_failure(ProductId::from("remove_ads"), "card declined");
        let (events, mut receiver) = StoreEvents::channel();
        store.init(events).expect("init");

        store.purchase(&ProductId::from("remove_ads"));
        store.purchase(&ProductId::from("retired"));

        let events = drain(&mut receiver);
        let errors: Vec<Option<String>> = events
            .iter()
            .filter_map(|event| match event {
                StoreEvent::Transaction(transaction) => Some(transaction.error.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            errors,
            vec![Some("card declined".to_string()), Some("item unavailable".to_string())]
        );
        assert_eq!(store.owned().count(), 0);
    }
}
