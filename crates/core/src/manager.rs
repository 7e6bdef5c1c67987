use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::cache::CatalogCache;
use crate::config::AppConfig;
use crate::domain::product::{Product, ProductId, StoreProduct};
use crate::domain::transaction::Transaction;
use crate::errors::{ManagerError, PurchaseError};
use crate::platform::Platform;
use crate::store::{binding_for, NativeClient, NoopStore, RequestId, StoreBinding, StoreEvent, StoreEvents};

/// Caller-supplied callback. `Ok(())` means success; the error's `Display` is
/// the message a host shows.
pub type Completion = Box<dyn FnOnce(Result<(), PurchaseError>) + Send>;

/// A [`Completion`] whose result can be awaited instead.
pub fn completion_channel() -> (Completion, oneshot::Receiver<Result<(), PurchaseError>>) {
    let (sender, receiver) = oneshot::channel();
    let completion: Completion = Box::new(move |result| {
        // The caller may have stopped waiting.
        let _ = sender.send(result);
    });
    (completion, receiver)
}

fn fire(callback: Option<Completion>, result: Result<(), PurchaseError>) {
    if let Some(callback) = callback {
        callback(result);
    }
}

/// Facade over a platform store with a persisted ownership cache.
///
/// The manager is single-owner: store outcomes queue up on an internal channel
/// and are applied only when the host pumps them through
/// [`PurchaseManager::handle_event`], [`PurchaseManager::dispatch_pending`] or
/// [`PurchaseManager::dispatch_next`].
pub struct PurchaseManager {
    initial_ids: Vec<ProductId>,
    catalog: Vec<Product>,
    cached: Option<Vec<Product>>,
    cache: CatalogCache,
    store: Box<dyn StoreBinding>,
    events: StoreEvents,
    receiver: mpsc::UnboundedReceiver<StoreEvent>,
    pending_purchase: Option<Completion>,
    pending_consume: Option<Completion>,
    pending_loads: HashMap<RequestId, Option<Completion>>,
    next_request: u64,
    initialized: bool,
}

impl PurchaseManager {
    pub fn new(
        ids: impl IntoIterator<Item = ProductId>,
        store: Box<dyn StoreBinding>,
        cache: CatalogCache,
    ) -> Self {
        let mut initial_ids: Vec<ProductId> = Vec::new();
        for id in ids {
            if !initial_ids.contains(&id) {
                initial_ids.push(id);
            }
        }

        let (events, receiver) = StoreEvents::channel();
        Self {
            initial_ids,
            catalog: Vec::new(),
            cached: None,
            cache,
            store,
            events,
            receiver,
            pending_purchase: None,
            pending_consume: None,
            pending_loads: HashMap::new(),
            next_request: 0,
            initialized: false,
        }
    }

    /// Builds a manager for the configured platform, product ids and cache
    /// location.
    pub fn from_config(config: &AppConfig, native: Option<NativeClient>) -> Self {
        let ids = config.store.product_ids.iter().map(|id| ProductId::new(id.as_str()));
        let store = binding_for(config.store.platform.resolve(), native);
        Self::new(ids, store, CatalogCache::from_config(&config.cache))
    }

    pub fn init(&mut self) -> Result<(), ManagerError> {
        if self.initialized {
            return Err(ManagerError::AlreadyInitialized);
        }
        self.initialized = true;

        self.catalog = self.initial_ids.iter().cloned().map(Product::new).collect();
        self.cached = self.read_cache();

        if let Err(error) = self.store.init(self.events.clone()) {
            warn!(
                event_name = "iap.store.init_failed",
                platform = self.store.platform().as_str(),
                error = %error,
                "store binding failed to start; store operations are disabled"
            );
            self.store = Box::new(NoopStore);
        }

        info!(
            event_name = "iap.manager.init",
            platform = self.store.platform().as_str(),
            products = self.catalog.len(),
            cached = self.cached.as_ref().map_or(0, Vec::len),
            "purchase manager initialized"
        );

        self.load_products(None, None);
        Ok(())
    }

    fn read_cache(&self) -> Option<Vec<Product>> {
        match self.cache.load() {
            Ok(products) if !products.is_empty() => Some(products),
            Ok(_) => {
                debug!(path = %self.cache.path().display(), "cached catalog is empty");
                None
            }
            Err(error) if error.is_missing() => {
                debug!(path = %self.cache.path().display(), "no cached catalog yet");
                None
            }
            Err(error) => {
                warn!(
                    event_name = "iap.cache.load_failed",
                    path = %self.cache.path().display(),
                    error = %error,
                    "ignoring unreadable cached catalog"
                );
                None
            }
        }
    }

    /// Queries store metadata. `None` or an empty slice means the initial
    /// identifiers.
    pub fn load_products(&mut self, ids: Option<&[ProductId]>, callback: Option<Completion>) {
        if !self.initialized {
            fire(callback, Err(PurchaseError::NotInitialized));
            return;
        }

        let ids = match ids {
            Some(ids) if !ids.is_empty() => ids.to_vec(),
            _ => self.initial_ids.clone(),
        };

        self.next_request += 1;
        let request = RequestId(self.next_request);
        self.pending_loads.insert(request, callback);
        self.store.load_products(request, &ids);
    }

    pub fn purchase(&mut self, id: &ProductId, callback: Option<Completion>) {
        if let Err(error) = self.check_known(id) {
            fire(callback, Err(error));
            return;
        }

        if std::mem::replace(&mut self.pending_purchase, callback).is_some() {
            debug!(product_id = %id, "replacing pending purchase callback");
        }
        self.store.purchase(id);
    }

    pub fn consume(&mut self, id: &ProductId, callback: Option<Completion>) {
        if let Err(error) = self.check_known(id) {
            fire(callback, Err(error));
            return;
        }

        if !self.store.supports_consumption() {
            self.pending_consume = None;
            fire(callback, Err(PurchaseError::ConsumptionUnsupported));
            return;
        }

        if std::mem::replace(&mut self.pending_consume, callback).is_some() {
            debug!(product_id = %id, "replacing pending consume callback");
        }
        self.store.consume_purchase(id);
    }

    pub fn restore(&mut self) {
        if self.initialized {
            self.store.restore();
        }
    }

    fn check_known(&self, id: &ProductId) -> Result<(), PurchaseError> {
        if !self.initialized {
            return Err(PurchaseError::NotInitialized);
        }
        if self.product(id).is_none() {
            return Err(PurchaseError::UnknownProduct(id.0.clone()));
        }
        Ok(())
    }

    pub fn handle_event(&mut self, event: StoreEvent) {
        match event {
            StoreEvent::ProductsLoaded { request, products } => {
                self.apply_products(request, &products);
            }
            StoreEvent::ProductsFailed { request, error } => {
                warn!(
                    event_name = "iap.products.failed",
                    request = request.0,
                    error = %error,
                    "store rejected product query"
                );
                let callback = self.pending_loads.remove(&request).flatten();
                fire(callback, Err(PurchaseError::Store(error)));
            }
            StoreEvent::Transaction(transaction) => self.apply_transaction(transaction),
        }
    }

    /// Applies every queued event without waiting; returns how many ran.
    pub fn dispatch_pending(&mut self) -> usize {
        let mut dispatched = 0;
        while let Ok(event) = self.receiver.try_recv() {
            self.handle_event(event);
            dispatched += 1;
        }
        dispatched
    }

    /// Waits for the next store event and applies it.
    ///
    /// The manager holds a sender of its own, so this only returns `false` if
    /// the channel is closed from the outside, which cannot happen today.
    pub async fn dispatch_next(&mut self) -> bool {
        match self.receiver.recv().await {
            Some(event) => {
                self.handle_event(event);
                true
            }
            None => false,
        }
    }

    fn apply_products(&mut self, request: RequestId, products: &[StoreProduct]) {
        let callback = self.pending_loads.remove(&request).flatten();

        for metadata in products {
            match self
                .catalog
                .iter_mut()
                .find(|product| product.identifier == metadata.identifier)
            {
                Some(product) => product.apply_metadata(metadata),
                None => debug!(product_id = %metadata.identifier, "store returned a product outside the catalog"),
            }
        }
        info!(
            event_name = "iap.products.loaded",
            request = request.0,
            returned = products.len(),
            catalog = self.catalog.len(),
            "product metadata applied"
        );

        let Some(mut cached) = self.cached.take() else {
            self.implicit_restore("no cached catalog");
            fire(callback, Ok(()));
            return;
        };

        let cached_len = cached.len();
        for product in &mut self.catalog {
            let owned = cached
                .iter()
                .find(|entry| entry.identifier == product.identifier)
                .map(|entry| entry.is_owned);
            match owned {
                Some(owned) => product.is_owned = owned,
                None => cached.push(product.clone()),
            }
        }

        if self.catalog.len() > cached_len {
            self.cached = Some(cached);
            self.implicit_restore("new products detected");
        } else {
            self.persist(cached);
        }
        fire(callback, Ok(()));
    }

    fn implicit_restore(&mut self, reason: &'static str) {
        info!(event_name = "iap.restore.implicit", reason, "restoring purchases");
        self.store.restore();
    }

    fn apply_transaction(&mut self, transaction: Transaction) {
        let state = transaction.state;

        if state.is_failure() {
            let message = transaction.failure_message();
            warn!(
                event_name = "iap.transaction.failed",
                product_id = %transaction.product_id,
                state = state.as_str(),
                error = %message,
                "store transaction did not complete"
            );
            fire(self.pending_purchase.take(), Err(PurchaseError::Store(message.clone())));
            fire(self.pending_consume.take(), Err(PurchaseError::Store(message)));
        } else {
            match self
                .catalog
                .iter_mut()
                .find(|product| product.identifier == transaction.product_id)
            {
                Some(product) => product.is_owned = state.grants_ownership(),
                None => debug!(product_id = %transaction.product_id, "transaction for a product outside the catalog"),
            }
            info!(
                event_name = "iap.transaction.applied",
                product_id = %transaction.product_id,
                state = state.as_str(),
                transaction_id = transaction.transaction_id.as_deref().unwrap_or("-"),
                "store transaction applied"
            );
            fire(self.pending_purchase.take(), Ok(()));
            fire(self.pending_consume.take(), Ok(()));
        }

        self.persist(self.catalog.clone());

        if self.store.requires_finish() {
            self.store.finish_transaction(&transaction);
        }
    }

    fn persist(&mut self, products: Vec<Product>) {
        if let Err(error) = self.cache.store(&products) {
            warn!(
                event_name = "iap.cache.write_failed",
                path = %self.cache.path().display(),
                error = %error,
                "could not persist catalog"
            );
        }
        self.cached = Some(products);
    }

    pub fn products(&self) -> &[Product] {
        &self.catalog
    }

    pub fn product(&self, id: &ProductId) -> Option<&Product> {
        self.catalog.iter().find(|product| &product.identifier == id)
    }

    pub fn is_owned(&self, id: &ProductId) -> bool {
        self.product(id).is_some_and(|product| product.is_owned)
    }

    pub fn platform(&self) -> Platform {
        self.store.platform()
    }

    /// Last-known persisted catalog, if any.
    pub fn cached_catalog(&self) -> Option<&[Product]> {
        self.cached.as_deref()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

impl std::fmt::Debug for PurchaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PurchaseManager")
            .field("platform", &self.store.platform())
            .field("catalog", &self.catalog)
            .field("cache", &self.cache)
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}
