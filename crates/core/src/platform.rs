use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// Play-Billing-style store.
    Android,
    /// StoreKit-style store.
    Ios,
    Unsupported,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "android") {
            Self::Android
        } else if cfg!(target_os = "ios") {
            Self::Ios
        } else {
            Self::Unsupported
        }
    }

    pub fn supports_consumption(self) -> bool {
        matches!(self, Self::Android)
    }

    pub fn requires_transaction_finish(self) -> bool {
        matches!(self, Self::Ios)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Android => "android",
            Self::Ios => "ios",
            Self::Unsupported => "unsupported",
        }
    }
}
