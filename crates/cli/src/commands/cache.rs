use purchasekit_core::cache::CatalogCache;
use purchasekit_core::config::{AppConfig, LoadOptions};
use purchasekit_core::domain::product::Product;
use serde::Serialize;

use crate::commands::CommandResult;

#[derive(Debug, Serialize)]
struct CacheReport<'a> {
    command: &'static str,
    status: &'static str,
    path: String,
    products: &'a [Product],
}

pub fn show(options: &LoadOptions, json_output: bool) -> CommandResult {
    let cache = match open(options, "cache show") {
        Ok(cache) => cache,
        Err(result) => return result,
    };

    let products = match cache.load() {
        Ok(products) => products,
        Err(error) if error.is_missing() => Vec::new(),
        Err(error) => return CommandResult::failure("cache show", "cache_unreadable", error.to_string(), 3),
    };

    if json_output {
        return CommandResult::report(
            "cache show",
            &CacheReport {
                command: "cache show",
                status: "ok",
                path: cache.path().display().to_string(),
                products: &products,
            },
        );
    }

    CommandResult { exit_code: 0, output: render_human(&cache, &products) }
}

pub fn clear(options: &LoadOptions) -> CommandResult {
    let cache = match open(options, "cache clear") {
        Ok(cache) => cache,
        Err(result) => return result,
    };

    match cache.clear() {
        Ok(true) => CommandResult::success(
            "cache clear",
            format!("removed {}", cache.path().display()),
        ),
        Ok(false) => CommandResult::success(
            "cache clear",
            format!("no cache file at {}", cache.path().display()),
        ),
        Err(error) => CommandResult::failure("cache clear", "cache_io", error.to_string(), 3),
    }
}

fn open(options: &LoadOptions, command: &str) -> Result<CatalogCache, CommandResult> {
    AppConfig::load(options.clone())
        .map(|config| CatalogCache::from_config(&config.cache))
        .map_err(|error| CommandResult::failure(command, "config_validation", error.to_string(), 2))
}

fn render_human(cache: &CatalogCache, products: &[Product]) -> String {
    let mut lines = vec![format!("cache file: {}", cache.path().display())];
    if products.is_empty() {
        lines.push("no cached products".to_string());
        return lines.join("\n");
    }

    for product in products {
        let marker = if product.is_owned { "owned" } else { "not owned" };
        let price = product.localized_price.as_deref().unwrap_or("-");
        lines.push(format!("- {} [{marker}] {price}", product.identifier));
    }
    lines.join("\n")
}
