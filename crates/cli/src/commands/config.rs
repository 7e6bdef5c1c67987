use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use purchasekit_core::cache::CatalogCache;
use purchasekit_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

pub fn run(options: &LoadOptions) -> String {
    let config = match AppConfig::load(options.clone()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path(options.config_path.as_deref());
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str, env_keys: &[&str]| {
        field_source(key_path, env_keys, config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];

    lines.push(render_line(
        "store.platform",
        &format!("{:?} (resolves to {})", config.store.platform, config.store.platform.resolve().as_str()),
        source("store.platform", &["PURCHASEKIT_STORE_PLATFORM"]),
    ));
    let product_ids = if config.store.product_ids.is_empty() {
        "<none>".to_string()
    } else {
        config.store.product_ids.join(",")
    };
    lines.push(render_line(
        "store.product_ids",
        &product_ids,
        source("store.product_ids", &["PURCHASEKIT_STORE_PRODUCT_IDS"]),
    ));

    let directory = config
        .cache
        .directory
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "<platform cache dir>".to_string());
    lines.push(render_line(
        "cache.directory",
        &directory,
        source("cache.directory", &["PURCHASEKIT_CACHE_DIR"]),
    ));
    lines.push(render_line(
        "cache.file_name",
        &config.cache.file_name,
        source("cache.file_name", &["PURCHASEKIT_CACHE_FILE_NAME"]),
    ));
    lines.push(render_line(
        "cache.signing_key",
        &redact_key(config.cache.signing_key.as_ref().map(|key| key.expose_secret())),
        source("cache.signing_key", &["PURCHASEKIT_CACHE_SIGNING_KEY"]),
    ));
    lines.push(format!(
        "- cache.path = {} (resolved)",
        CatalogCache::from_config(&config.cache).path().display()
    ));

    lines.push(render_line(
        "logging.level",
        &config.logging.level,
        source("logging.level", &["PURCHASEKIT_LOGGING_LEVEL", "PURCHASEKIT_LOG_LEVEL"]),
    ));
    lines.push(render_line(
        "logging.format",
        &format!("{:?}", config.logging.format),
        source("logging.format", &["PURCHASEKIT_LOGGING_FORMAT", "PURCHASEKIT_LOG_FORMAT"]),
    ));

    lines.join("\n")
}

fn detect_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }

    let root = PathBuf::from("purchasekit.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/purchasekit.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact_key(key: Option<&str>) -> String {
    match key.map(str::trim) {
        None => "<unset>".to_string(),
        Some("") => "<empty>".to_string(),
        Some(_) => "<redacted>".to_string(),
    }
}
