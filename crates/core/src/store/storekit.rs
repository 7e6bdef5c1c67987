use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::{RequestId, StoreBinding, StoreEvent, StoreEvents};
use crate::domain::product::{ProductId, StoreProduct};
use crate::domain::transaction::{Transaction, TransactionState};
use crate::errors::StoreError;
use crate::platform::Platform;

const MICROS_PER_UNIT: i64 = 1_000_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkProduct {
    pub product_identifier: String,
    pub localized_title: String,
    pub localized_description: String,
    pub price: Decimal,
    pub price_locale_currency_code: String,
    pub formatted_price: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkTransactionState {
    Purchasing,
    Purchased,
    Failed,
    Restored,
    Deferred,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkErrorCode {
    Unknown,
    ClientInvalid,
    PaymentCancelled,
    PaymentInvalid,
    PaymentNotAllowed,
    StoreProductNotAvailable,
    CloudServiceNetworkConnectionFailed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkError {
    pub code: SkErrorCode,
    pub localized_description: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkPaymentTransaction {
    pub transaction_identifier: Option<String>,
    pub product_identifier: String,
    pub state: SkTransactionState,
    pub error: Option<SkError>,
    pub transaction_date: Option<DateTime<Utc>>,
}

/// Notifications raised by the native payment queue and products requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PaymentQueueEvent {
    ProductsResponse { request: RequestId, products: Vec<SkProduct>, invalid_identifiers: Vec<String> },
    ProductsRequestFailed { request: RequestId, error: SkError },
    UpdatedTransactions(Vec<SkPaymentTransaction>),
    RestoreCompleted,
    RestoreFailed(SkError),
}

pub type PaymentQueueObserver = Box<dyn Fn(PaymentQueueEvent) + Send + Sync>;

/// Host side of a StoreKit-style payment queue.
pub trait PaymentQueue: Send {
    fn add_observer(&mut self, observer: PaymentQueueObserver) -> Result<(), StoreError>;
    fn request_products(&mut self, request: RequestId, product_identifiers: &[String]);
    fn can_make_payments(&self) -> bool;
    fn add_payment(&mut self, product_identifier: &str);
    fn restore_completed_transactions(&mut self);
    fn finish_transaction(&mut self, transaction_identifier: &str);
}

impl<T: PaymentQueue + ?Sized> PaymentQueue for Box<T> {
    fn add_observer(&mut self, observer: PaymentQueueObserver) -> Result<(), StoreError> {
        (**self).add_observer(observer)
    }

    fn request_products(&mut self, request: RequestId, product_identifiers: &[String]) {
        (**self).request_products(request, product_identifiers)
    }

    fn can_make_payments(&self) -> bool {
        (**self).can_make_payments()
    }

    fn add_payment(&mut self, product_identifier: &str) {
        (**self).add_payment(product_identifier)
    }

    fn restore_completed_transactions(&mut self) {
        (**self).restore_completed_transactions()
    }

    fn finish_transaction(&mut self, transaction_identifier: &str) {
        (**self).finish_transaction(transaction_identifier)
    }
}

pub struct StoreKitStore<Q> {
    queue: Q,
    events: Option<StoreEvents>,
}

impl<Q: PaymentQueue> StoreKitStore<Q> {
    pub fn new(queue: Q) -> Self {
        Self { queue, events: None }
    }
}

impl<Q: PaymentQueue> StoreBinding for StoreKitStore<Q> {
    fn platform(&self) -> Platform {
        Platform::Ios
    }

    fn init(&mut self, events: StoreEvents) -> Result<(), StoreError> {
        let sink = events.clone();
        self.events = Some(events);
        self.queue.add_observer(Box::new(move |event| translate(event, &sink)))
    }

    fn load_products(&mut self, request: RequestId, ids: &[ProductId]) {
        let ids: Vec<String> = ids.iter().map(|id| id.0.clone()).collect();
        self.queue.request_products(request, &ids);
    }

    fn purchase(&mut self, id: &ProductId) {
        if self.queue.can_make_payments() {
            self.queue.add_payment(id.as_str());
            return;
        }

        warn!(
            event_name = "iap.storekit.payments_disabled",
            product_id = %id,
            "device cannot make payments"
        );
        if let Some(events) = &self.events {
            events.emit(StoreEvent::Transaction(Transaction::failed(
                id.clone(),
                "payments are disabled on this device",
            )));
        }
    }

    fn consume_purchase(&mut self, id: &ProductId) {
        debug!(product_id = %id, "storekit has no consume call; ignoring");
    }

    fn restore(&mut self) {
        self.queue.restore_completed_transactions();
    }

    fn finish_transaction(&mut self, transaction: &Transaction) {
        match &transaction.transaction_id {
            Some(transaction_id) => self.queue.finish_transaction(transaction_id),
            None => debug!(
                product_id = %transaction.product_id,
                "transaction has no identifier; nothing to finish"
            ),
        }
    }
}

fn translate(event: PaymentQueueEvent, events: &StoreEvents) {
    match event {
        PaymentQueueEvent::ProductsResponse { request, products, invalid_identifiers } => {
            if !invalid_identifiers.is_empty() {
                info!(
                    event_name = "iap.storekit.invalid_identifiers",
                    identifiers = %invalid_identifiers.join(","),
                    "store does not recognize some product identifiers"
                );
            }
            let products = products.into_iter().map(store_product).collect();
            events.emit(StoreEvent::ProductsLoaded { request, products });
        }
        PaymentQueueEvent::ProductsRequestFailed { request, error } => {
            events.emit(StoreEvent::ProductsFailed { request, error: error.localized_description });
        }
        PaymentQueueEvent::UpdatedTransactions(transactions) => {
            for transaction in transactions.into_iter().filter_map(map_transaction) {
                events.emit(StoreEvent::Transaction(transaction));
            }
        }
        PaymentQueueEvent::RestoreCompleted => {
            info!(event_name = "iap.storekit.restore_completed", "restore finished");
        }
        PaymentQueueEvent::RestoreFailed(error) => {
            warn!(
                event_name = "iap.storekit.restore_failed",
                error = %error.localized_description,
                "restore failed"
            );
        }
    }
}

fn map_transaction(native: SkPaymentTransaction) -> Option<Transaction> {
    let product_id = ProductId(native.product_identifier);
    let mut transaction = match native.state {
        SkTransactionState::Purchasing | SkTransactionState::Deferred => return None,
        SkTransactionState::Purchased => Transaction::new(product_id, TransactionState::Purchased),
        SkTransactionState::Restored => Transaction::new(product_id, TransactionState::Restored),
        SkTransactionState::Failed => match native.error {
            Some(SkError { code: SkErrorCode::PaymentCancelled, localized_description }) => {
                Transaction::cancelled(product_id, Some(localized_description))
            }
            Some(error) => Transaction::failed(product_id, error.localized_description),
            None => Transaction::new(product_id, TransactionState::Failed),
        },
    };
    transaction.transaction_id = native.transaction_identifier;
    transaction.occurred_at = native.transaction_date;
    Some(transaction)
}

fn store_product(product: SkProduct) -> StoreProduct {
    // Prices beyond the i64 micros range are reported without an amount.
    let micros = product
        .price
        .checked_mul(Decimal::from(MICROS_PER_UNIT))
        .and_then(|micros| micros.round().to_i64());
    StoreProduct {
        identifier: ProductId(product.product_identifier),
        title: Some(product.localized_title),
        description: Some(product.localized_description),
        localized_price: Some(product.formatted_price),
        price_amount_micros: micros,
        price_currency_code: Some(product.price_locale_currency_code),
    }
}
