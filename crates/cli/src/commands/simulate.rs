use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use purchasekit_core::cache::CatalogCache;
use purchasekit_core::config::{AppConfig, LoadOptions, PlatformSetting};
use purchasekit_core::domain::product::{Product, ProductId, StoreProduct};
use purchasekit_core::errors::PurchaseError;
use purchasekit_core::manager::{completion_channel, PurchaseManager};
use purchasekit_core::platform::Platform;
use purchasekit_core::store::SimulatedStore;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::info;

use crate::commands::CommandResult;

const COMMAND: &str = "simulate";
const SIMULATED_PRICE_MICROS: i64 = 990_000;

#[derive(Debug, Clone, Default, Args)]
pub struct SimulateArgs {
    #[arg(long, value_name = "ID", help = "Product the sandbox store already reports as owned")]
    pub own: Vec<String>,
    #[arg(long, value_name = "ID", help = "Purchase a product (repeatable, runs in order)")]
    pub purchase: Vec<String>,
    #[arg(long, value_name = "ID", help = "Consume a product (repeatable, runs after purchases)")]
    pub consume: Vec<String>,
    #[arg(long, value_name = "ID:MESSAGE", help = "Make store calls for ID fail with MESSAGE")]
    pub fail: Vec<String>,
    #[arg(long, value_name = "PLATFORM", help = "android|ios|none; defaults to the configured platform")]
    pub platform: Option<String>,
}

#[derive(Debug, Serialize)]
struct OperationReport {
    operation: &'static str,
    product_id: String,
    status: &'static str,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    command: &'static str,
    status: &'static str,
    platform: &'static str,
    cache_path: String,
    operations: Vec<OperationReport>,
    catalog: Vec<Product>,
}

pub fn run(options: &LoadOptions, args: &SimulateArgs) -> CommandResult {
    let config = match AppConfig::load(options.clone()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(COMMAND, "config_validation", error.to_string(), 2)
        }
    };

    match simulate(&config, args) {
        Ok(report) => CommandResult::report(COMMAND, &report),
        Err(error) => CommandResult::failure(COMMAND, "simulation", format!("{error:#}"), 1),
    }
}

fn simulate(config: &AppConfig, args: &SimulateArgs) -> Result<SimulationReport> {
    let platform = match &args.platform {
        Some(raw) => raw.parse::<PlatformSetting>().context("invalid --platform")?.resolve(),
        None => config.store.platform.resolve(),
    };
    if config.store.product_ids.is_empty() {
        bail!("no product ids configured; set store.product_ids or PURCHASEKIT_STORE_PRODUCT_IDS");
    }

    let store = build_store(platform, config, args)?;
    let cache = CatalogCache::from_config(&config.cache);
    let ids = config.store.product_ids.iter().map(|id| ProductId::new(id.as_str()));
    let mut manager = PurchaseManager::new(ids, Box::new(store), cache.clone());

    manager.init().context("could not start purchase manager")?;
    settle(&mut manager);

    let mut operations = Vec::new();
    for id in &args.purchase {
        let (callback, receiver) = completion_channel();
        manager.purchase(&ProductId::new(id.as_str()), Some(callback));
        settle(&mut manager);
        operations.push(outcome("purchase", id, receiver));
    }
    for id in &args.consume {
        let (callback, receiver) = completion_channel();
        manager.consume(&ProductId::new(id.as_str()), Some(callback));
        settle(&mut manager);
        operations.push(outcome("consume", id, receiver));
    }

    info!(
        event_name = "iap.simulate.finished",
        platform = platform.as_str(),
        operations = operations.len(),
        "simulation finished"
    );

    Ok(SimulationReport {
        command: COMMAND,
        status: "ok",
        platform: manager.platform().as_str(),
        cache_path: cache.path().display().to_string(),
        operations,
        catalog: manager.products().to_vec(),
    })
}

fn build_store(platform: Platform, config: &AppConfig, args: &SimulateArgs) -> Result<SimulatedStore> {
    let mut store = SimulatedStore::new(platform);
    for id in &config.store.product_ids {
        store = store.with_product(StoreProduct {
            title: Some(id.replace('_', " ")),
            localized_price: Some("$0.99".to_string()),
            price_amount_micros: Some(SIMULATED_PRICE_MICROS),
            price_currency_code: Some("USD".to_string()),
            ..StoreProduct::new(id.as_str())
        });
    }
    for id in &args.own {
        store = store.with_owned(ProductId::new(id.as_str()));
    }
    for entry in &args.fail {
        let (id, message) = entry
            .split_once(':')
            .ok_or_else(|| anyhow!("--fail expects ID:MESSAGE, got `{entry}`"))?;
        store = store.with_failure(ProductId::new(id.trim()), message.trim());
    }
    Ok(store)
}

fn settle(manager: &mut PurchaseManager) {
    while manager.dispatch_pending() > 0 {}
}

fn outcome(
    operation: &'static str,
    id: &str,
    mut receiver: oneshot::Receiver<Result<(), PurchaseError>>,
) -> OperationReport {
    let (status, error) = match receiver.try_recv() {
        Ok(Ok(())) => ("ok", None),
        Ok(Err(error)) => ("error", Some(error.to_string())),
        Err(_) => ("pending", None),
    };
    OperationReport { operation, product_id: id.to_string(), status, error }
}
