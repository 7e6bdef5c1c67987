use std::sync::{Arc, Mutex};

use purchasekit_core::cache::{CatalogCache, PlainTransform};
use purchasekit_core::errors::StoreError;
use purchasekit_core::store::play_billing::{
    BillingClient, BillingEvent, BillingListener, BillingResult, ProductDetails, Purchase,
    PurchaseState,
};
use purchasekit_core::store::{PlayBillingStore, RequestId};
use purchasekit_core::{completion_channel, ProductId, PurchaseManager};
use tempfile::TempDir;

/// Billing client that answers every call synchronously from inside the call.
#[derive(Default)]
struct InstantBillingClient {
    listener: Option<BillingListener>,
    owned: Vec<(String, String)>,
    consumed: Arc<Mutex<Vec<String>>>,
}

impl InstantBillingClient {
    fn owning(product_id: &str, token: &str) -> Self {
        Self { owned: vec![(product_id.to_string(), token.to_string())], ..Self::default() }
    }

    fn answer(&self, event: BillingEvent) {
        if let Some(listener) = &self.listener {
            listener(event);
        }
    }

    fn purchase(product_id: &str, token: &str) -> Purchase {
        Purchase {
            order_id: None,
            product_ids: vec![product_id.to_string()],
            purchase_token: token.to_string(),
            purchase_state: PurchaseState::Purchased,
            purchase_time_millis: 1_700_000_000_000,
        }
    }
}

impl BillingClient for InstantBillingClient {
    fn start_connection(&mut self, listener: BillingListener) -> Result<(), StoreError> {
        self.listener = Some(listener);
        Ok(())
    }

    fn query_product_details(&mut self, request: RequestId, product_ids: &[String]) {
        let details = product_ids
            .iter()
            .map(|id| ProductDetails {
                product_id: id.clone(),
                title: id.clone(),
                description: String::new(),
                formatted_price: "$0.99".to_string(),
                price_amount_micros: 990_000,
                price_currency_code: "USD".to_string(),
            })
            .collect();
        self.answer(BillingEvent::ProductDetailsResponse {
            request,
            result: BillingResult::ok(),
            details,
        });
    }

    fn launch_billing_flow(&mut self, product_id: &str) {
        let token = format!("tok-{product_id}");
        self.owned.push((product_id.to_string(), token.clone()));
        self.answer(BillingEvent::PurchasesUpdated {
            result: BillingResult::ok(),
            purchases: vec![Self::purchase(product_id, &token)],
        });
    }

    fn consume(&mut self, purchase_token: &str) {
        self.owned.retain(|(_, token)| token != purchase_token);
        self.consumed.lock().expect("consumed lock").push(purchase_token.to_string());
        self.answer(BillingEvent::ConsumeResponse {
            result: BillingResult::ok(),
            purchase_token: purchase_token.to_string(),
        });
    }

    fn query_purchases(&mut self) {
        let purchases =
            self.owned.iter().map(|(product_id, token)| Self::purchase(product_id, token)).collect();
        self.answer(BillingEvent::PurchasesQueried { result: BillingResult::ok(), purchases });
    }
}

fn start(client: InstantBillingClient, dir: &TempDir) -> PurchaseManager {
    let cache = CatalogCache::new(dir.path().join("iap_products.cache"), Arc::new(PlainTransform));
    let mut manager = PurchaseManager::new(
        [ProductId::from("coins_100")],
        Box::new(PlayBillingStore::new(client)),
        cache,
    );
    manager.init().expect("init");
    while manager.dispatch_pending() > 0 {}
    manager
}

#[test]
fn product_owned_from_cache_can_be_consumed_after_restart() {
    let dir = TempDir::new().expect("tempdir");

    let mut first = start(InstantBillingClient::default(), &dir);
    first.purchase(&ProductId::from("coins_100"), None);
    while first.dispatch_pending() > 0 {}
    assert!(first.is_owned(&ProductId::from("coins_100")));
    drop(first);

    let client = InstantBillingClient::owning("coins_100", "tok-coins_100");
    let consumed = Arc::clone(&client.consumed);
    let mut second = start(client, &dir);
    assert!(second.is_owned(&ProductId::from("coins_100")), "ownership comes from the cache");

    let (callback, mut receiver) = completion_channel();
    second.consume(&ProductId::from("coins_100"), Some(callback));
    while second.dispatch_pending() > 0 {}

    assert_eq!(receiver.try_recv(), Ok(Ok(())));
    assert!(!second.is_owned(&ProductId::from("coins_100")));
    assert_eq!(*consumed.lock().expect("consumed lock"), vec!["tok-coins_100".to_string()]);
}
