use std::fmt::Display;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

pub mod pool;
pub use pool::PoolState;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Address {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for Address {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Balance and last consumed counter of an implicit account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountState {
    pub balance: BigUint,
    pub counter: u64,
}

impl AccountState {
    /// First counter the next operation group may use.
    pub fn next_counter(&self) -> u64 {
        self.counter + 1
    }
}
