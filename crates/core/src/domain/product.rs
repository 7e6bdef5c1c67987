use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(pub String);

impl ProductId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProductId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProductId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Metadata the store returns for an identifier it recognizes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreProduct {
    pub identifier: ProductId,
    pub title: Option<String>,
    pub description: Option<String>,
    pub localized_price: Option<String>,
    pub price_amount_micros: Option<i64>,
    pub price_currency_code: Option<String>,
}

impl StoreProduct {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self { identifier: ProductId(identifier.into()), ..Self::default() }
    }
}

/// Catalog entry: store metadata plus the locally tracked ownership flag.
///
/// This is also the shape of each element in the persisted cache file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub identifier: ProductId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub localized_price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_amount_micros: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_currency_code: Option<String>,
    #[serde(default, deserialize_with = "truthy")]
    pub is_owned: bool,
}

impl Product {
    pub fn new(identifier: ProductId) -> Self {
        Self {
            identifier,
            title: None,
            description: None,
            localized_price: None,
            price_amount_micros: None,
            price_currency_code: None,
            is_owned: false,
        }
    }

    /// Overlays store metadata. Metadata says nothing about ownership, so the
    /// flag is reset and left for reconciliation to restore.
    pub fn apply_metadata(&mut self, metadata: &StoreProduct) {
        self.title = metadata.title.clone();
        self.description = metadata.description.clone();
        self.localized_price = metadata.localized_price.clone();
        self.price_amount_micros = metadata.price_amount_micros;
        self.price_currency_code = metadata.price_currency_code.clone();
        self.is_owned = false;
    }
}

// Older cache files were written by loosely typed hosts; accept whatever was
// stored and coerce it.
fn truthy<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => flag,
        Some(Value::Number(number)) => number.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Some(Value::String(text)) => !text.is_empty() && text != "false" && text != "0",
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    })
}
