use std::time::SystemTime;

use num_bigint::BigUint;
use num_traits::Zero as _;

use super::Market;
use crate::{
    matcher::{BuyCall, SellCall},
    micheline::{self, int_lit, pair, string_lit},
    operation::Operation,
    state::Address,
};

const BUY: &str = "xtzToToken";
const SELL: &str = "tokenToXtz";

fn deadline(expiration: SystemTime) -> serde_json::Value {
    string_lit(humantime::format_rfc3339_seconds(expiration))
}

pub(super) fn buy(
    market: &Market,
    owner: &Address,
    size: &BigUint,
    notional: &BigUint,
    expiration: SystemTime,
) -> Operation {
    Operation::transaction(
        owner,
        &market.pool,
        notional.clone(),
        BUY,
        pair([string_lit(owner), int_lit(size), deadline(expiration)]),
    )
}

pub(super) fn sell(
    market: &Market,
    owner: &Address,
    size: &BigUint,
    notional: &BigUint,
    expiration: SystemTime,
) -> Operation {
    Operation::transaction(
        owner,
        &market.pool,
        BigUint::zero(),
        SELL,
        pair([
            string_lit(owner),
            int_lit(size),
            int_lit(notional),
            deadline(expiration),
        ]),
    )
}

// Wallets send either the flat pair or its right comb.
pub(super) fn decode_buy(operation: &Operation) -> Option<BuyCall> {
    let parameters = operation.parameters.as_ref()?;
    if parameters.entrypoint != BUY {
        return None;
    }

    let value = &parameters.value;
    let token_minimum = micheline::int(value, "/args/1/int")
        .or_else(|| micheline::int(value, "/args/1/args/0/int"))?;

    Some(BuyCall {
        coin_balance: operation.amount.clone(),
        token_minimum,
    })
}

pub(super) fn decode_sell(operation: &Operation) -> Option<SellCall> {
    let parameters = operation.parameters.as_ref()?;
    if parameters.entrypoint != SELL {
        return None;
    }

    let value = &parameters.value;
    if let (Some(token_balance), Some(coin_minimum)) = (
        micheline::int(value, "/args/1/int"),
        micheline::int(value, "/args/2/int"),
    ) {
        return Some(SellCall {
            token_balance,
            coin_minimum,
        });
    }

    Some(SellCall {
        token_balance: micheline::int(value, "/args/1/args/0/int")?,
        coin_minimum: micheline::int(value, "/args/1/args/1/args/0/int")?,
    })
}
