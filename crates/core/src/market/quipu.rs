use num_bigint::BigUint;
use num_traits::Zero as _;

use super::Market;
use crate::{
    matcher::{BuyCall, SellCall},
    micheline::{self, int_lit, pair, string_lit},
    operation::Operation,
    state::Address,
};

const BUY: &str = "tezToTokenPayment";
const SELL: &str = "tokenToTezPayment";
/// Dispatching entrypoint of the newer pool versions.
const USE: &str = "use";

pub(super) fn buy(market: &Market, owner: &Address, size: &BigUint, notional: &BigUint) -> Operation {
    Operation::transaction(
        owner,
        &market.pool,
        notional.clone(),
        BUY,
        pair([int_lit(size), string_lit(owner)]),
    )
}

pub(super) fn sell(market: &Market, owner: &Address, size: &BigUint, notional: &BigUint) -> Operation {
    Operation::transaction(
        owner,
        &market.pool,
        BigUint::zero(),
        SELL,
        pair([pair([int_lit(size), int_lit(notional)]), string_lit(owner)]),
    )
}

pub(super) fn decode_buy(operation: &Operation) -> Option<BuyCall> {
    let parameters = operation.parameters.as_ref()?;
    let value = &parameters.value;

    let token_minimum = match parameters.entrypoint.as_str() {
        BUY => micheline::int(value, "/args/0/int"),
        USE if micheline::follows_branches(value, &["Left", "Right", "Right"]) => {
            micheline::int(value, "/args/0/args/0/args/0/args/0/int")
        }
        _ => None,
    }?;

    Some(BuyCall {
        coin_balance: operation.amount.clone(),
        token_minimum,
    })
}

pub(super) fn decode_sell(operation: &Operation) -> Option<SellCall> {
    let parameters = operation.parameters.as_ref()?;
    let value = &parameters.value;

    let prefix = match parameters.entrypoint.as_str() {
        SELL => "/args/0",
        USE if micheline::follows_branches(value, &["Right", "Left", "Left"]) => {
            "/args/0/args/0/args/0/args/0"
        }
        _ => return None,
    };

    Some(SellCall {
        token_balance: micheline::int(value, &format!("{prefix}/args/0/int"))?,
        coin_minimum: micheline::int(value, &format!("{prefix}/args/1/int"))?,
    })
}
