use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::product::ProductId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Purchased,
    Restored,
    Consumed,
    Failed,
    Cancelled,
}

impl TransactionState {
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }

    pub fn grants_ownership(self) -> bool {
        matches!(self, Self::Purchased | Self::Restored)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Purchased => "purchased",
            Self::Restored => "restored",
            Self::Consumed => "consumed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A store-reported change of state for one product.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub product_id: ProductId,
    pub state: TransactionState,
    pub transaction_id: Option<String>,
    pub error: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn new(product_id: ProductId, state: TransactionState) -> Self {
        Self { product_id, state, transaction_id: None, error: None, occurred_at: None }
    }

    pub fn failed(product_id: ProductId, error: impl Into<String>) -> Self {
        Self { error: Some(error.into()), ..Self::new(product_id, TransactionState::Failed) }
    }

    pub fn cancelled(product_id: ProductId, error: Option<String>) -> Self {
        Self { error, ..Self::new(product_id, TransactionState::Cancelled) }
    }

    pub fn with_transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(occurred_at);
        self
    }

    /// Message handed to callbacks when this transaction did not succeed.
    pub fn failure_message(&self) -> String {
        match (&self.error, self.state) {
            (Some(error), _) if !error.trim().is_empty() => error.clone(),
            (_, TransactionState::Cancelled) => "transaction cancelled".to_string(),
            _ => "transaction failed".to_string(),
        }
    }
}
