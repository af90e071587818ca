use std::fmt::Display;

use color_eyre::eyre::{self, bail, eyre};
use num_bigint::BigUint;
use num_traits::Zero as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    micheline::{self, int_lit, left, pair, right, string_lit},
    operation::Operation,
    state::Address,
};

/// How a token authorizes a pool to move the owner's balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Standard {
    /// The chain's native coin, no approvals.
    Coin,
    /// Single-asset ledger with `approve(spender, amount)`.
    Tzip7,
    /// Multi-asset ledger with operator updates for one token id.
    Tzip12 { index: u64 },
}

/// An on-chain view call answering a token query.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenView {
    pub contract: Address,
    pub entrypoint: &'static str,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub symbol: String,
    pub address: Address,
    pub decimals: u32,
    pub standard: Standard,
}

impl Token {
    pub fn is_native(&self) -> bool {
        matches!(self.standard, Standard::Coin)
    }

    pub fn index(&self) -> Option<u64> {
        match self.standard {
            Standard::Tzip12 { index } => Some(index),
            _ => None,
        }
    }

    /// One whole token in its smallest unit.
    pub fn unit(&self) -> BigUint {
        BigUint::from(10u32).pow(self.decimals)
    }

    /// Lets `spender` move up to `amount` of `owner`'s balance. Operator-style tokens cannot
    /// express an amount, any nonzero value adds the operator and zero removes it.
    pub fn construct_approval_operation(
        &self,
        owner: &Address,
        spender: &Address,
        amount: &BigUint,
    ) -> eyre::Result<Operation> {
        let (entrypoint, value) = match self.standard {
            Standard::Coin => bail!("{} is the native coin and takes no approvals", self.symbol),
            Standard::Tzip7 => ("approve", pair([string_lit(spender), int_lit(amount)])),
            Standard::Tzip12 { index } => {
                let update = pair([
                    string_lit(owner),
                    pair([string_lit(spender), int_lit(index)]),
                ]);
                let update = if amount.is_zero() {
                    right(update)
                } else {
                    left(update)
                };
                ("update_operators", serde_json::Value::Array(vec![update]))
            }
        };

        Ok(Operation::transaction(
            owner,
            &self.address,
            BigUint::zero(),
            entrypoint,
            value,
        ))
    }

    /// View reporting `owner`'s balance.
    pub fn balance_view(&self, owner: &Address) -> eyre::Result<TokenView> {
        let (entrypoint, input) = match self.standard {
            Standard::Coin => bail!("{} balances live in the account, not a view", self.symbol),
            Standard::Tzip7 => ("getBalance", string_lit(owner)),
            Standard::Tzip12 { index } => (
                "balance_of",
                Value::Array(vec![pair([string_lit(owner), int_lit(index)])]),
            ),
        };
        Ok(TokenView {
            contract: self.address.clone(),
            entrypoint,
            input,
        })
    }

    /// View reporting how much `spender` may move from `owner`. Operator-style tokens have no
    /// amounts to report.
    pub fn allowance_view(&self, owner: &Address, spender: &Address) -> eyre::Result<TokenView> {
        match self.standard {
            Standard::Tzip7 => Ok(TokenView {
                contract: self.address.clone(),
                entrypoint: "getAllowance",
                input: pair([string_lit(owner), string_lit(spender)]),
            }),
            _ => bail!("{} has no allowance view", self.symbol),
        }
    }

    /// Reads the amount out of the data a balance or allowance view returned.
    pub fn read_view(&self, data: &Value) -> eyre::Result<BigUint> {
        let pointer = match self.standard {
            // a single response `Pair (Pair owner id) balance`
            Standard::Tzip12 { .. } => "/0/args/1/int",
            _ => "/int",
        };
        micheline::int(data, pointer)
            .ok_or_else(|| eyre!("{} view returned no amount: {data}", self.symbol))
    }

    pub fn match_approve_operation(&self, operation: &Operation) -> bool {
        match self.standard {
            Standard::Coin => false,
            Standard::Tzip7 => operation.is_call_to(&self.address, "approve"),
            Standard::Tzip12 { .. } => operation.is_call_to(&self.address, "update_operators"),
        }
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol)
    }
}
