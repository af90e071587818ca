use num_bigint::BigUint;
use num_traits::Zero as _;
use serde_json::Value;

use super::Market;
use crate::{
    matcher::{BuyCall, SellCall},
    micheline::{self, int_lit, pair, string_lit},
    operation::Operation,
    state::Address,
    token::Token,
};

const SWAP: &str = "Swap";

/// `Pair(Pair(min_out, recipient), Pair(out_token, Pair(out_index, amount_in)))`
fn swap(
    market: &Market,
    owner: &Address,
    out: &Token,
    minimum_out: &BigUint,
    amount_in: &BigUint,
) -> Operation {
    Operation::transaction(
        owner,
        &market.pool,
        BigUint::zero(),
        SWAP,
        pair([
            pair([int_lit(minimum_out), string_lit(owner)]),
            pair([
                string_lit(&out.address),
                pair([int_lit(out.index().unwrap_or(0)), int_lit(amount_in)]),
            ]),
        ]),
    )
}

pub(super) fn buy(market: &Market, owner: &Address, size: &BigUint, notional: &BigUint) -> Operation {
    swap(market, owner, &market.asset, size, notional)
}

pub(super) fn sell(market: &Market, owner: &Address, size: &BigUint, notional: &BigUint) -> Operation {
    swap(market, owner, &market.cash, notional, size)
}

/// Both directions share the entrypoint, the requested output token tells them apart.
fn swap_out_of<'a>(operation: &'a Operation, out: &Token) -> Option<&'a Value> {
    let parameters = operation.parameters.as_ref()?;
    if parameters.entrypoint != SWAP {
        return None;
    }

    let value = &parameters.value;
    if micheline::string(value, "/args/1/args/0/string")? != out.address.as_str() {
        return None;
    }
    if let Some(index) = out.index() {
        if micheline::int(value, "/args/1/args/1/args/0/int")? != BigUint::from(index) {
            return None;
        }
    }
    Some(value)
}

pub(super) fn decode_buy(market: &Market, operation: &Operation) -> Option<BuyCall> {
    let value = swap_out_of(operation, &market.asset)?;
    Some(BuyCall {
        coin_balance: micheline::int(value, "/args/1/args/1/args/1/int")?,
        token_minimum: micheline::int(value, "/args/0/args/0/int")?,
    })
}

pub(super) fn decode_sell(market: &Market, operation: &Operation) -> Option<SellCall> {
    let value = swap_out_of(operation, &market.cash)?;
    Some(SellCall {
        token_balance: micheline::int(value, "/args/1/args/1/args/1/int")?,
        coin_minimum: micheline::int(value, "/args/0/args/0/int")?,
    })
}
