use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::platform::Platform;

pub const DEFAULT_CACHE_FILE_NAME: &str = "iap_products.cache";
const MIN_SIGNING_KEY_LEN: usize = 16;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub platform: PlatformSetting,
    pub product_ids: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub directory: Option<PathBuf>,
    pub file_name: String,
    pub signing_key: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformSetting {
    Auto,
    Android,
    Ios,
    None,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub platform: Option<PlatformSetting>,
    pub product_ids: Option<Vec<String>>,
    pub cache_directory: Option<PathBuf>,
    pub cache_file_name: Option<String>,
    pub cache_signing_key: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig { platform: PlatformSetting::Auto, product_ids: Vec::new() },
            cache: CacheConfig {
                directory: None,
                file_name: DEFAULT_CACHE_FILE_NAME.to_string(),
                signing_key: None,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl PlatformSetting {
    pub fn resolve(self) -> Platform {
        match self {
            Self::Auto => Platform::current(),
            Self::Android => Platform::Android,
            Self::Ios => Platform::Ios,
            Self::None => Platform::Unsupported,
        }
    }
}

impl std::str::FromStr for PlatformSetting {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "android" => Ok(Self::Android),
            "ios" => Ok(Self::Ios),
            "none" => Ok(Self::None),
            other => Err(ConfigError::Validation(format!(
                "unsupported store platform `{other}` (expected auto|android|ios|none)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from("purchasekit.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(store) = patch.store {
            if let Some(platform) = store.platform {
                self.store.platform = platform;
            }
            if let Some(product_ids) = store.product_ids {
                self.store.product_ids = product_ids;
            }
        }

        if let Some(cache) = patch.cache {
            if let Some(directory) = cache.directory {
                self.cache.directory = Some(directory);
            }
            if let Some(file_name) = cache.file_name {
                self.cache.file_name = file_name;
            }
            if let Some(signing_key) = cache.signing_key {
                self.cache.signing_key = Some(secret_value(signing_key));
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("PURCHASEKIT_STORE_PLATFORM") {
            self.store.platform = value.parse()?;
        }
        if let Some(value) = read_env("PURCHASEKIT_STORE_PRODUCT_IDS") {
            self.store.product_ids = split_list(&value);
        }

        if let Some(value) = read_env("PURCHASEKIT_CACHE_DIR") {
            self.cache.directory = Some(PathBuf::from(value));
        }
        if let Some(value) = read_env("PURCHASEKIT_CACHE_FILE_NAME") {
            self.cache.file_name = value;
        }
        if let Some(value) = read_env("PURCHASEKIT_CACHE_SIGNING_KEY") {
            self.cache.signing_key = Some(secret_value(value));
        }

        let log_level =
            read_env("PURCHASEKIT_LOGGING_LEVEL").or_else(|| read_env("PURCHASEKIT_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("PURCHASEKIT_LOGGING_FORMAT").or_else(|| read_env("PURCHASEKIT_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(platform) = overrides.platform {
            self.store.platform = platform;
        }
        if let Some(product_ids) = overrides.product_ids {
            self.store.product_ids = product_ids;
        }
        if let Some(directory) = overrides.cache_directory {
            self.cache.directory = Some(directory);
        }
        if let Some(file_name) = overrides.cache_file_name {
            self.cache.file_name = file_name;
        }
        if let Some(signing_key) = overrides.cache_signing_key {
            self.cache.signing_key = Some(secret_value(signing_key));
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_store(&self.store)?;
        validate_cache(&self.cache)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("purchasekit.toml"), PathBuf::from("config/purchasekit.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_store(store: &StoreConfig) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for id in &store.product_ids {
        if id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "store.product_ids must not contain blank identifiers".to_string(),
            ));
        }
        if !seen.insert(id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "store.product_ids contains duplicate identifier `{id}`"
            )));
        }
    }

    Ok(())
}

fn validate_cache(cache: &CacheConfig) -> Result<(), ConfigError> {
    let file_name = cache.file_name.trim();
    if file_name.is_empty() {
        return Err(ConfigError::Validation("cache.file_name must not be empty".to_string()));
    }
    if file_name.contains('/') || file_name.contains('\\') {
        return Err(ConfigError::Validation(
            "cache.file_name must be a bare file name; use cache.directory for the location"
                .to_string(),
        ));
    }

    if let Some(signing_key) = &cache.signing_key {
        if signing_key.expose_secret().len() < MIN_SIGNING_KEY_LEN {
            return Err(ConfigError::Validation(format!(
                "cache.signing_key must be at least {MIN_SIGNING_KEY_LEN} bytes"
            )));
        }
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    store: Option<StorePatch>,
    cache: Option<CachePatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct StorePatch {
    platform: Option<PlatformSetting>,
    product_ids: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct CachePatch {
    directory: Option<PathBuf>,
    file_name: Option<String>,
    signing_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
