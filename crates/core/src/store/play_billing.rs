use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};

use chrono::DateTime;
use tracing::{debug, info, warn};

use super::{RequestId, StoreBinding, StoreEvent, StoreEvents};
use crate::domain::product::{ProductId, StoreProduct};
use crate::domain::transaction::{Transaction, TransactionState};
use crate::errors::StoreError;
use crate::platform::Platform;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BillingResponseCode {
    Ok,
    UserCanceled,
    ServiceUnavailable,
    BillingUnavailable,
    ItemUnavailable,
    DeveloperError,
    Error,
    ItemAlreadyOwned,
    ItemNotOwned,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BillingResult {
    pub code: BillingResponseCode,
    pub debug_message: String,
}

impl BillingResult {
    pub fn ok() -> Self {
        Self { code: BillingResponseCode::Ok, debug_message: String::new() }
    }

    pub fn error(code: BillingResponseCode, debug_message: impl Into<String>) -> Self {
        Self { code, debug_message: debug_message.into() }
    }

    pub fn is_ok(&self) -> bool {
        self.code == BillingResponseCode::Ok
    }

    fn message(&self) -> String {
        if self.debug_message.trim().is_empty() {
            format!("billing response {:?}", self.code)
        } else {
            self.debug_message.clone()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProductDetails {
    pub product_id: String,
    pub title: String,
    pub description: String,
    pub formatted_price: String,
    pub price_amount_micros: i64,
    pub price_currency_code: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PurchaseState {
    Unspecified,
    Purchased,
    Pending,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Purchase {
    pub order_id: Option<String>,
    pub product_ids: Vec<String>,
    pub purchase_token: String,
    pub purchase_state: PurchaseState,
    pub purchase_time_millis: i64,
}

/// Callbacks raised by the native billing client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BillingEvent {
    ProductDetailsResponse { request: RequestId, result: BillingResult, details: Vec<ProductDetails> },
    PurchasesUpdated { result: BillingResult, purchases: Vec<Purchase> },
    ConsumeResponse { result: BillingResult, purchase_token: String },
    PurchasesQueried { result: BillingResult, purchases: Vec<Purchase> },
}

pub type BillingListener = Box<dyn Fn(BillingEvent) + Send + Sync>;

/// Host side of a Play-Billing-style client.
pub trait BillingClient: Send {
    fn start_connection(&mut self, listener: BillingListener) -> Result<(), StoreError>;
    fn query_product_details(&mut self, request: RequestId, product_ids: &[String]);
    fn launch_billing_flow(&mut self, product_id: &str);
    fn consume(&mut self, purchase_token: &str);
    fn query_purchases(&mut self);
}

impl<T: BillingClient + ?Sized> BillingClient for Box<T> {
    fn start_connection(&mut self, listener: BillingListener) -> Result<(), StoreError> {
        (**self).start_connection(listener)
    }

    fn query_product_details(&mut self, request: RequestId, product_ids: &[String]) {
        (**self).query_product_details(request, product_ids)
    }

    fn launch_billing_flow(&mut self, product_id: &str) {
        (**self).launch_billing_flow(product_id)
    }

    fn consume(&mut self, purchase_token: &str) {
        (**self).consume(purchase_token)
    }

    fn query_purchases(&mut self) {
        (**self).query_purchases()
    }
}

#[derive(Debug, Default)]
struct BillingState {
    // product id -> purchase token
    tokens: HashMap<String, String>,
    // purchase token -> product id
    consuming: HashMap<String, String>,
    // consumes waiting on a purchase query to learn their token
    awaiting_token: BTreeSet<String>,
    ready_to_consume: VecDeque<String>,
    restore_requested: bool,
    in_flight_purchase: Option<String>,
}

pub struct PlayBillingStore<C> {
    client: Arc<Mutex<C>>,
    state: Arc<Mutex<BillingState>>,
    events: Option<StoreEvents>,
}

impl<C: BillingClient + 'static> PlayBillingStore<C> {
    pub fn new(client: C) -> Self {
        Self {
            client: Arc::new(Mutex::new(client)),
            state: Arc::new(Mutex::new(BillingState::default())),
            events: None,
        }
    }

    fn call<R>(&self, call: impl FnOnce(&mut C) -> R) -> R {
        let result = call(&mut lock(&self.client));
        flush_consumes(&*self.client, &self.state);
        result
    }
}

impl<C: BillingClient + 'static> StoreBinding for PlayBillingStore<C> {
    fn platform(&self) -> Platform {
        Platform::Android
    }

    fn init(&mut self, events: StoreEvents) -> Result<(), StoreError> {
        let state = Arc::clone(&self.state);
        let client: Weak<Mutex<C>> = Arc::downgrade(&self.client);
        let sink = events.clone();
        self.events = Some(events);

        let listener: BillingListener = Box::new(move |event| {
            translate(event, &state, &sink);
            if let Some(client) = client.upgrade() {
                flush_consumes(&*client, &state);
            }
        });
        self.call(|client| client.start_connection(listener))
    }

    fn load_products(&mut self, request: RequestId, ids: &[ProductId]) {
        let ids: Vec<String> = ids.iter().map(|id| id.0.clone()).collect();
        self.call(|client| client.query_product_details(request, &ids));
    }

    fn purchase(&mut self, id: &ProductId) {
        lock(&self.state).in_flight_purchase = Some(id.0.clone());
        self.call(|client| client.launch_billing_flow(id.as_str()));
    }

    fn consume_purchase(&mut self, id: &ProductId) {
        let token = {
            let mut state = lock(&self.state);
            match state.tokens.get(id.as_str()).cloned() {
                Some(token) => {
                    state.consuming.insert(token.clone(), id.0.clone());
                    Some(token)
                }
                None => {
                    state.awaiting_token.insert(id.0.clone());
                    None
                }
            }
        };

        match token {
            Some(token) => self.call(|client| client.consume(&token)),
            None => {
                debug!(
                    event_name = "iap.play.consume_awaiting_token",
                    product_id = %id,
                    "no purchase token seen this session; querying purchases"
                );
                self.call(|client| client.query_purchases());
            }
        }
    }

    fn restore(&mut self) {
        lock(&self.state).restore_requested = true;
        self.call(|client| client.query_purchases());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Sends consume calls for tokens resolved by a purchase query.
fn flush_consumes<C: BillingClient>(client: &Mutex<C>, state: &Mutex<BillingState>) {
    loop {
        let mut client = match client.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            // A client call is still on the stack; it flushes when it returns.
            Err(TryLockError::WouldBlock) => return,
        };
        let next = lock(state).ready_to_consume.pop_front();
        let Some(token) = next else {
            return;
        };
        client.consume(&token);
    }
}

fn translate(event: BillingEvent, state: &Mutex<BillingState>, events: &StoreEvents) {
    match event {
        BillingEvent::ProductDetailsResponse { request, result, details } => {
            if result.is_ok() {
                let products = details.into_iter().map(store_product).collect();
                events.emit(StoreEvent::ProductsLoaded { request, products });
            } else {
                events.emit(StoreEvent::ProductsFailed { request, error: result.message() });
            }
        }
        BillingEvent::PurchasesUpdated { result, purchases } => {
            let transactions = purchases_updated(&result, purchases, &mut lock(state));
            for transaction in transactions {
                events.emit(StoreEvent::Transaction(transaction));
            }
        }
        BillingEvent::ConsumeResponse { result, purchase_token } => {
            let product_id = {
                let mut state = lock(state);
                let product_id = state.consuming.remove(&purchase_token);
                if let (true, Some(product_id)) = (result.is_ok(), &product_id) {
                    state.tokens.remove(product_id);
                }
                product_id
            };

            let Some(product_id) = product_id else {
                warn!(
                    event_name = "iap.play.consume_unknown_token",
                    "consume response for a token that was not being consumed"
                );
                return;
            };

            let transaction = if result.is_ok() {
                Transaction::new(ProductId(product_id), TransactionState::Consumed)
                    .with_transaction_id(purchase_token)
            } else {
                Transaction::failed(ProductId(product_id), result.message())
            };
            events.emit(StoreEvent::Transaction(transaction));
        }
        BillingEvent::PurchasesQueried { result, purchases } => {
            let mut guard = lock(state);
            let restore_requested = std::mem::take(&mut guard.restore_requested);
            let awaiting = std::mem::take(&mut guard.awaiting_token);

            if !result.is_ok() {
                drop(guard);
                warn!(
                    event_name = "iap.play.restore_failed",
                    error = %result.message(),
                    "purchase query failed; nothing restored"
                );
                for product_id in awaiting {
                    events.emit(StoreEvent::Transaction(Transaction::failed(
                        ProductId(product_id),
                        result.message(),
                    )));
                }
                return;
            }

            let mut restored = Vec::new();
            for purchase in purchases.iter().filter(|p| p.purchase_state == PurchaseState::Purchased) {
                restored.extend(owned_transactions(purchase, TransactionState::Restored, &mut guard));
            }

            let mut unowned = Vec::new();
            for product_id in awaiting {
                match guard.tokens.get(&product_id).cloned() {
                    Some(token) => {
                        guard.consuming.insert(token.clone(), product_id);
                        guard.ready_to_consume.push_back(token);
                    }
                    None => unowned.push(product_id),
                }
            }
            drop(guard);

            // A query issued only to find consume tokens must not look like a
            // restore, or the pending consume callback would fire early.
            if restore_requested {
                info!(
                    event_name = "iap.play.restore_completed",
                    restored = restored.len(),
                    "purchase query completed"
                );
                for transaction in restored {
                    events.emit(StoreEvent::Transaction(transaction));
                }
            }
            for product_id in unowned {
                let message = format!("`{product_id}` is not owned");
                events.emit(StoreEvent::Transaction(Transaction::failed(ProductId(product_id), message)));
            }
        }
    }
}

fn purchases_updated(
    result: &BillingResult,
    purchases: Vec<Purchase>,
    state: &mut BillingState,
) -> Vec<Transaction> {
    match result.code {
        BillingResponseCode::Ok => {
            let mut transactions = Vec::new();
            for purchase in purchases {
                match purchase.purchase_state {
                    PurchaseState::Purchased => {
                        if state
                            .in_flight_purchase
                            .as_ref()
                            .is_some_and(|id| purchase.product_ids.contains(id))
                        {
                            state.in_flight_purchase = None;
                        }
                        transactions.extend(owned_transactions(
                            &purchase,
                            TransactionState::Purchased,
                            state,
                        ));
                    }
                    PurchaseState::Pending => debug!(
                        event_name = "iap.play.purchase_pending",
                        token = %purchase.purchase_token,
                        "purchase is pending; waiting for a final state"
                    ),
                    PurchaseState::Unspecified => {}
                }
            }
            transactions
        }
        BillingResponseCode::UserCanceled => {
            let product_id = state.in_flight_purchase.take().unwrap_or_default();
            let message = Some(result.debug_message.clone()).filter(|m| !m.trim().is_empty());
            vec![Transaction::cancelled(ProductId(product_id), message)]
        }
        _ => {
            let product_id = state.in_flight_purchase.take().unwrap_or_default();
            vec![Transaction::failed(ProductId(product_id), result.message())]
        }
    }
}

fn owned_transactions(
    purchase: &Purchase,
    transaction_state: TransactionState,
    state: &mut BillingState,
) -> Vec<Transaction> {
    let occurred_at = DateTime::from_timestamp_millis(purchase.purchase_time_millis);
    purchase
        .product_ids
        .iter()
        .map(|product_id| {
            state.tokens.insert(product_id.clone(), purchase.purchase_token.clone());
            let mut transaction = Transaction::new(ProductId(product_id.clone()), transaction_state)
                .with_transaction_id(
                    purchase.order_id.clone().unwrap_or_else(|| purchase.purchase_token.clone()),
                );
            transaction.occurred_at = occurred_at;
            transaction
        })
        .collect()
}

fn store_product(details: ProductDetails) -> StoreProduct {
    StoreProduct {
        identifier: ProductId(details.product_id),
        title: Some(details.title),
        description: Some(details.description),
        localized_price: Some(details.formatted_price),
        price_amount_micros: Some(details.price_amount_micros),
        price_currency_code: Some(details.price_currency_code),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::sync::mpsc::UnboundedReceiver;

    use super::{
        BillingClient, BillingEvent, BillingListener, BillingResponseCode, BillingResult,
        PlayBillingStore, ProductDetails, Purchase, PurchaseState,
    };
    use crate::domain::product::ProductId;
    use crate::domain::transaction::TransactionState;
    use crate::errors::StoreError;
    use crate::store::{RequestId, StoreBinding, StoreEvent, StoreEvents};

    #[derive(Default)]
    struct Recorded {
        listener: Option<BillingListener>,
        calls: Vec<String>,
    }

    #[derive(Clone, Default)]
    struct FakeBillingClient {
        recorded: Arc<Mutex<Recorded>>,
    }

    impl FakeBillingClient {
        // The listener may call back into the client, so it runs unlocked.
        fn fire(&self, event: BillingEvent) {
            let listener =
                self.recorded.lock().expect("recorded lock").listener.take().expect("listener registered");
            listener(event);
            self.recorded.lock().expect("recorded lock").listener = Some(listener);
        }

        fn calls(&self) -> Vec<String> {
            self.recorded.lock().expect("recorded lock").calls.clone()
        }
    }

    impl BillingClient for FakeBillingClient {
        fn start_connection(&mut self, listener: BillingListener) -> Result<(), StoreError> {
            self.recorded.lock().expect("recorded lock").listener = Some(listener);
            Ok(())
        }

        fn query_product_details(&mut self, request: RequestId, product_ids: &[String]) {
            self.recorded
                .lock()
                .expect("recorded lock")
                .calls
                .push(format!("query:{}:{}", request.0, product_ids.join(",")));
        }

        fn launch_billing_flow(&mut self, product_id: &str) {
            self.recorded.lock().expect("recorded lock").calls.push(format!("buy:{product_id}"));
        }

        fn consume(&mut self, purchase_token: &str) {
            self.recorded
                .lock()
                .expect("recorded lock")
                .calls
                .push(format!("consume:{purchase_token}"));
        }

        fn query_purchases(&mut self) {
            self.recorded.lock().expect("recorded lock").calls.push("query_purchases".to_string());
        }
    }

    fn purchase(product_id: &str, token: &str, state: PurchaseState) -> Purchase {
        Purchase {
            order_id: Some(format!("GPA.{token}")),
            product_ids: vec![product_id.to_string()],
            purchase_token: token.to_string(),
            purchase_state: state,
            purchase_time_millis: 1_700_000_000_000,
        }
    }

    type Connected =
        (PlayBillingStore<FakeBillingClient>, FakeBillingClient, UnboundedReceiver<StoreEvent>);

    fn connected() -> Connected {
        let client = FakeBillingClient::default();
        let mut store = PlayBillingStore::new(client.clone());
        let (events, receiver) = StoreEvents::channel();
        store.init(events).expect("connect");
        (store, client, receiver)
    }

    fn transactions(
        receiver: &mut UnboundedReceiver<StoreEvent>,
    ) -> Vec<(String, TransactionState, Option<String>)> {
        let mut out = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            if let StoreEvent::Transaction(transaction) = event {
                out.push((transaction.product_id.0, transaction.state, transaction.error));
            }
        }
        out
    }

    #[test]
    fn product_details_map_to_store_products() {
        let (mut store, client, mut receiver) = connected();
        store.load_products(RequestId(3), &[ProductId::from("coins_100"), ProductId::from("nope")]);
        assert_eq!(client.calls(), vec!["query:3:coins_100,nope".to_string()]);

        client.fire(BillingEvent::ProductDetailsResponse {
            request: RequestId(3),
            result: BillingResult::ok(),
            details: vec![ProductDetails {
                product_id: "coins_100".to_string(),
                title: "100 Coins".to_string(),
                description: "A pile of coins".to_string(),
                formatted_price: "$0.99".to_string(),
                price_amount_micros: 990_000,
                price_currency_code: "USD".to_string(),
            }],
        });

        match receiver.try_recv().expect("products event") {
            StoreEvent::ProductsLoaded { request, products } => {
                assert_eq!(request, RequestId(3));
                assert_eq!(products.len(), 1);
                assert_eq!(products[0].identifier, ProductId::from("coins_100"));
                assert_eq!(products[0].price_amount_micros, Some(990_000));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn failed_product_query_reports_debug_message() {
        let (_store, client, mut receiver) = connected();
        client.fire(BillingEvent::ProductDetailsResponse {
            request: RequestId(1),
            result: BillingResult::error(BillingResponseCode::ServiceUnavailable, "offline"),
            details: Vec::new(),
        });

        assert_eq!(
            receiver.try_recv().expect("failure event"),
            StoreEvent::ProductsFailed { request: RequestId(1), error: "offline".to_string() }
        );
    }

    #[test]
    fn purchase_flow_outcomes_become_transactions() {
        let (mut store, client, mut receiver) = connected();

        store.purchase(&ProductId::from("remove_ads"));
        client.fire(BillingEvent::PurchasesUpdated {
            result: BillingResult::ok(),
            purchases: vec![
                purchase("remove_ads", "tok-1", PurchaseState::Purchased),
                purchase("coins_100", "tok-2", PurchaseState::Pending),
            ],
        });

        store.purchase(&ProductId::from("coins_100"));
        client.fire(BillingEvent::PurchasesUpdated {
            result: BillingResult::error(BillingResponseCode::UserCanceled, ""),
            purchases: Vec::new(),
        });

        store.purchase(&ProductId::from("coins_100"));
        client.fire(BillingEvent::PurchasesUpdated {
            result: BillingResult::error(BillingResponseCode::ItemUnavailable, "item gone"),
            purchases: Vec::new(),
        });

        assert_eq!(
            transactions(&mut receiver),
            vec![
                ("remove_ads".to_string(), TransactionState::Purchased, None),
                ("coins_100".to_string(), TransactionState::Cancelled, None),
                ("coins_100".to_string(), TransactionState::Failed, Some("item gone".to_string())),
            ]
        );
    }

    #[test]
    fn consume_uses_token_from_earlier_purchase() {
        let (mut store, client, mut receiver) = connected();

        store.purchase(&ProductId::from("coins_100"));
        client.fire(BillingEvent::PurchasesUpdated {
            result: BillingResult::ok(),
            purchases: vec![purchase("coins_100", "tok-9", PurchaseState::Purchased)],
        });
        store.consume_purchase(&ProductId::from("coins_100"));
        client.fire(BillingEvent::ConsumeResponse {
            result: BillingResult::ok(),
            purchase_token: "tok-9".to_string(),
        });

        assert!(client.calls().contains(&"consume:tok-9".to_string()));
        let states: Vec<TransactionState> =
            transactions(&mut receiver).into_iter().map(|(_, state, _)| state).collect();
        assert_eq!(states, vec![TransactionState::Purchased, TransactionState::Consumed]);
    }

    #[test]
    fn consume_after_restart_resolves_token_through_purchase_query() {
        let (mut store, client, mut receiver) = connected();

        store.consume_purchase(&ProductId::from("coins_100"));
        assert_eq!(client.calls(), vec!["query_purchases".to_string()]);
        assert!(transactions(&mut receiver).is_empty());

        client.fire(BillingEvent::PurchasesQueried {
            result: BillingResult::ok(),
            purchases: vec![
                purchase("coins_100", "tok-5", PurchaseState::Purchased),
                purchase("remove_ads", "tok-6", PurchaseState::Purchased),
            ],
        });
        assert_eq!(
            client.calls(),
            vec!["query_purchases".to_string(), "consume:tok-5".to_string()]
        );
        assert!(transactions(&mut receiver).is_empty(), "token lookup is not a restore");

        client.fire(BillingEvent::ConsumeResponse {
            result: BillingResult::ok(),
            purchase_token: "tok-5".to_string(),
        });
        assert_eq!(
            transactions(&mut receiver),
            vec![("coins_100".to_string(), TransactionState::Consumed, None)]
        );
    }

    #[test]
    fn consume_of_product_the_store_does_not_own_fails_after_query() {
        let (mut store, client, mut receiver) = connected();

        store.consume_purchase(&ProductId::from("coins_100"));
        client.fire(BillingEvent::PurchasesQueried {
            result: BillingResult::ok(),
            purchases: Vec::new(),
        });

        assert_eq!(client.calls(), vec!["query_purchases".to_string()]);
        assert_eq!(
            transactions(&mut receiver),
            vec![(
                "coins_100".to_string(),
                TransactionState::Failed,
                Some("`coins_100` is not owned".to_string())
            )]
        );
    }

    #[test]
    fn restore_emits_restored_for_owned_purchases_only() {
        let (mut store, client, mut receiver) = connected();

        store.restore();
        client.fire(BillingEvent::PurchasesQueried {
            result: BillingResult::ok(),
            purchases: vec![
                purchase("remove_ads", "tok-1", PurchaseState::Purchased),
                purchase("vip", "tok-2", PurchaseState::Pending),
            ],
        });

        assert_eq!(client.calls(), vec!["query_purchases".to_string()]);
        assert_eq!(
            transactions(&mut receiver),
            vec![("remove_ads".to_string(), TransactionState::Restored, None)]
        );
    }
}
