use std::sync::Arc;

use purchasekit_core::cache::{CatalogCache, SignedTransform};
use purchasekit_core::{
    completion_channel, Platform, ProductId, PurchaseError, PurchaseManager, SimulatedStore,
    StoreProduct,
};
use tempfile::TempDir;

const SIGNING_KEY: &str = "integration-signing-key";

fn signed_cache(dir: &TempDir) -> CatalogCache {
    CatalogCache::new(
        dir.path().join("iap_products.cache"),
        Arc::new(SignedTransform::new(SIGNING_KEY.to_string().into())),
    )
}

fn sandbox(platform: Platform) -> SimulatedStore {
    SimulatedStore::new(platform)
        .with_product(StoreProduct {
            title: Some("Remove Ads".to_string()),
            localized_price: Some("$2.99".to_string()),
            price_amount_micros: Some(2_990_000),
            price_currency_code: Some("USD".to_string()),
            ..StoreProduct::new("remove_ads")
        })
        .with_product(StoreProduct::new("coins_100"))
}

fn start(store: SimulatedStore, cache: CatalogCache, ids: &[&str]) -> PurchaseManager {
    let mut manager =
        PurchaseManager::new(ids.iter().map(|id| ProductId::from(*id)), Box::new(store), cache);
    manager.init().expect("init");
    while manager.dispatch_pending() > 0 {}
    manager
}

#[test]
fn ownership_survives_restart_through_signed_cache() {
    let dir = TempDir::new().expect("tempdir");

    let mut first = start(sandbox(Platform::Android), signed_cache(&dir), &["remove_ads", "coins_100"]);
    let remove_ads = first.product(&ProductId::from("remove_ads")).expect("catalog entry");
    assert_eq!(remove_ads.localized_price.as_deref(), Some("$2.99"));
    assert!(!remove_ads.is_owned);

    let (callback, mut receiver) = completion_channel();
    first.purchase(&ProductId::from("remove_ads"), Some(callback));
    first.dispatch_pending();
    assert_eq!(receiver.try_recv(), Ok(Ok(())));
    drop(first);

    // A fresh store that knows nothing about the earlier purchase.
    let second = start(sandbox(Platform::Android), signed_cache(&dir), &["remove_ads", "coins_100"]);
    assert!(second.is_owned(&ProductId::from("remove_ads")));
    assert!(!second.is_owned(&ProductId::from("coins_100")));
}

#[test]
fn newly_added_product_triggers_restore_from_store() {
    let dir = TempDir::new().expect("tempdir");
    let cache = signed_cache(&dir);

    let mut first = start(sandbox(Platform::Android), cache.clone(), &["remove_ads"]);
    first.purchase(&ProductId::from("remove_ads"), None);
    first.dispatch_pending();
    drop(first);

    let store = sandbox(Platform::Android).with_owned(ProductId::from("coins_100"));
    let second = start(store, cache, &["remove_ads", "coins_100"]);

    assert!(second.is_owned(&ProductId::from("remove_ads")));
    assert!(second.is_owned(&ProductId::from("coins_100")));
}

#[test]
fn cache_signed_with_another_key_is_ignored() {
    let dir = TempDir::new().expect("tempdir");
    let mut seeded = start(sandbox(Platform::Android), signed_cache(&dir), &["remove_ads"]);
    seeded.purchase(&ProductId::from("remove_ads"), None);
    seeded.dispatch_pending();

    let foreign = CatalogCache::new(
        dir.path().join("iap_products.cache"),
        Arc::new(SignedTransform::new("another-signing-key".to_string().into())),
    );
    let manager = start(sandbox(Platform::Android), foreign, &["remove_ads"]);

    assert!(!manager.is_owned(&ProductId::from("remove_ads")));
}

#[test]
fn ios_consume_never_reaches_the_store() {
    let dir = TempDir::new().expect("tempdir");
    let store = sandbox(Platform::Ios).with_owned(ProductId::from("coins_100"));
    let mut manager = start(store, signed_cache(&dir), &["coins_100"]);
    assert!(manager.is_owned(&ProductId::from("coins_100")));

    let (callback, mut receiver) = completion_channel();
    manager.consume(&ProductId::from("coins_100"), Some(callback));

    assert_eq!(receiver.try_recv(), Ok(Err(PurchaseError::ConsumptionUnsupported)));
    assert_eq!(manager.dispatch_pending(), 0);
    assert!(manager.is_owned(&ProductId::from("coins_100")));
}
