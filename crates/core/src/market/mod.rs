use std::{fmt::Display, time::SystemTime};

use color_eyre::eyre::{self, OptionExt as _, WrapErr as _};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    matcher::{self, BuyCall, OperationMatch, SellCall},
    micheline,
    operation::Operation,
    pricing::{self, Quote},
    state::{Address, PoolState},
    token::Token,
};

mod plenty;
mod quipu;
mod vertex;

/// Calling convention of the pool contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Native-cash pools with `tezToTokenPayment`/`tokenToTezPayment`.
    Quipu,
    /// Token-to-token pools with a single `Swap` entrypoint.
    Plenty,
    /// Native-cash pools with deadlines, `xtzToToken`/`tokenToXtz`.
    Vertex,
}

/// JSON pointers into the pool contract's storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePaths {
    pub coin_balance: String,
    pub token_balance: String,
    #[serde(default)]
    pub liquidity_balance: Option<String>,
}

/// Whether buy and sell groups carry their own approval step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Approvals {
    PerTrade,
    /// The pool already holds a standing allowance over the account's tokens.
    Standing,
}

#[derive(Debug, Clone)]
pub struct Market {
    pub name: String,
    pub protocol: Protocol,
    pub pool: Address,
    pub asset: Token,
    pub cash: Token,
    pub multiplier: u64,
    pub storage: StoragePaths,
    /// Pools whose presence in a group marks it as someone else's arbitrage.
    pub siblings: Vec<Address>,
}

impl Market {
    pub fn cash_to_token(&self, cash_in: &BigUint, state: &PoolState) -> eyre::Result<Quote> {
        pricing::cash_to_token(cash_in, state, self.multiplier, self.asset.decimals)
            .wrap_err_with(|| format!("failed to price {cash_in} {} on {self}", self.cash))
    }

    pub fn token_to_cash(&self, token_in: &BigUint, state: &PoolState) -> eyre::Result<Quote> {
        pricing::token_to_cash(token_in, state, self.multiplier, self.cash.decimals)
            .wrap_err_with(|| format!("failed to price {token_in} {} on {self}", self.asset))
    }

    pub fn cash_for_token_out(
        &self,
        token_out: &BigUint,
        state: &PoolState,
    ) -> eyre::Result<BigUint> {
        pricing::cash_for_token_out(token_out, state, self.multiplier)
            .wrap_err_with(|| format!("failed to price {token_out} {} on {self}", self.asset))
    }

    /// Reads the reserves out of the pool contract's storage.
    pub fn pool_state(&self, storage: &Value) -> eyre::Result<PoolState> {
        let read = |pointer: &str| {
            micheline::int(storage, pointer)
                .ok_or_eyre(format!("{self} storage has no integer at {pointer}"))
        };

        Ok(PoolState {
            coin_balance: read(&self.storage.coin_balance)?,
            token_balance: read(&self.storage.token_balance)?,
            liquidity_balance: match &self.storage.liquidity_balance {
                Some(pointer) => read(pointer)?,
                None => BigUint::default(),
            },
        })
    }

    /// Buys at least `size` tokens for `notional` cash.
    pub fn construct_buy_operation(
        &self,
        owner: &Address,
        size: &BigUint,
        notional: &BigUint,
        expiration: SystemTime,
    ) -> Operation {
        match self.protocol {
            Protocol::Quipu => quipu::buy(self, owner, size, notional),
            Protocol::Plenty => plenty::buy(self, owner, size, notional),
            Protocol::Vertex => vertex::buy(self, owner, size, notional, expiration),
        }
    }

    /// Sells `size` tokens for at least `notional` cash.
    pub fn construct_sell_operation(
        &self,
        owner: &Address,
        size: &BigUint,
        notional: &BigUint,
        expiration: SystemTime,
    ) -> Operation {
        match self.protocol {
            Protocol::Quipu => quipu::sell(self, owner, size, notional),
            Protocol::Plenty => plenty::sell(self, owner, size, notional),
            Protocol::Vertex => vertex::sell(self, owner, size, notional, expiration),
        }
    }

    pub fn construct_buy_group(
        &self,
        owner: &Address,
        size: &BigUint,
        notional: &BigUint,
        expiration: SystemTime,
        approvals: Approvals,
    ) -> eyre::Result<Vec<Operation>> {
        let mut group = Vec::with_capacity(2);
        if approvals == Approvals::PerTrade && !self.cash.is_native() {
            group.push(
                self.cash
                    .construct_approval_operation(owner, &self.pool, notional)?,
            );
        }
        group.push(self.construct_buy_operation(owner, size, notional, expiration));
        Ok(group)
    }

    pub fn construct_sell_group(
        &self,
        owner: &Address,
        size: &BigUint,
        notional: &BigUint,
        expiration: SystemTime,
        approvals: Approvals,
    ) -> eyre::Result<Vec<Operation>> {
        let mut group = Vec::with_capacity(2);
        if approvals == Approvals::PerTrade && !self.asset.is_native() {
            group.push(
                self.asset
                    .construct_approval_operation(owner, &self.pool, size)?,
            );
        }
        group.push(self.construct_sell_operation(owner, size, notional, expiration));
        Ok(group)
    }

    pub fn match_buy_operation(&self, group: &[Operation]) -> OperationMatch {
        matcher::match_buy(
            group,
            &self.siblings,
            &[&self.asset, &self.cash],
            |operation| self.decode_buy(operation),
        )
    }

    pub fn match_sell_operation(&self, group: &[Operation]) -> OperationMatch {
        matcher::match_sell(
            group,
            &self.siblings,
            &[&self.asset, &self.cash],
            |operation| self.decode_sell(operation),
        )
    }

    fn decode_buy(&self, operation: &Operation) -> Option<BuyCall> {
        if operation.destination.as_ref() != Some(&self.pool) {
            return None;
        }
        match self.protocol {
            Protocol::Quipu => quipu::decode_buy(operation),
            Protocol::Plenty => plenty::decode_buy(self, operation),
            Protocol::Vertex => vertex::decode_buy(operation),
        }
    }

    fn decode_sell(&self, operation: &Operation) -> Option<SellCall> {
        if operation.destination.as_ref() != Some(&self.pool) {
            return None;
        }
        match self.protocol {
            Protocol::Quipu => quipu::decode_sell(operation),
            Protocol::Plenty => plenty::decode_sell(self, operation),
            Protocol::Vertex => vertex::decode_sell(operation),
        }
    }
}

impl Display for Market {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.name, self.asset, self.cash)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use serde_json::json;

    use super::*;
    use crate::{
        matcher::MatchKind,
        micheline::{int_lit, left, pair, right, string_lit},
        token::tests::{make_coin, make_tzip7, make_tzip12},
    };

    pub(crate) fn make_market(name: &str, protocol: Protocol, pool: &str, asset: Token, cash: Token) -> Market {
        Market {
            name: name.to_string(),
            protocol,
            pool: Address::from(pool),
            asset,
            cash,
            multiplier: 997,
            storage: StoragePaths {
                coin_balance: "/args/1/args/0/int".to_string(),
                token_balance: "/args/1/args/1/int".to_string(),
                liquidity_balance: None,
            },
            siblings: vec![Address::from("KT1sibling")],
        }
    }

    pub(crate) fn make_quipu(pool: &str) -> Market {
        make_market("Quipu", Protocol::Quipu, pool, make_tzip7("kUSD", "KT1kusd", 18), make_coin())
    }

    pub(crate) fn make_vertex(pool: &str) -> Market {
        make_market("Vertex", Protocol::Vertex, pool, make_tzip7("kUSD", "KT1kusd", 18), make_coin())
    }

    pub(crate) fn make_plenty(pool: &str) -> Market {
        make_market(
            "Plenty",
            Protocol::Plenty,
            pool,
            make_tzip12("wUSDC", "KT1wrap", 17),
            make_tzip7("PLENTY", "KT1plenty", 18),
        )
    }

    pub(crate) fn expiration() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    fn owner() -> Address {
        Address::from("tz1owner")
    }

    fn with_fees(mut operation: Operation, fee: u64, gas: u64) -> Operation {
        operation.fee = fee;
        operation.gas_limit = gas;
        operation
    }

    fn sibling_call() -> Operation {
        with_fees(
            Operation::transaction(
                &Address::from("tz1rival"),
                &Address::from("KT1sibling"),
                BigUint::default(),
                "tokenToTezPayment",
                json!({ "int": "1" }),
            ),
            100,
            1_000,
        )
    }

    fn reveal() -> Operation {
        Operation {
            kind: "reveal".to_string(),
            source: Address::from("tz1rival"),
            fee: 300,
            counter: 1,
            gas_limit: 1_000,
            storage_limit: 0,
            amount: BigUint::default(),
            destination: None,
            parameters: None,
        }
    }

    fn big(n: u64) -> BigUint {
        BigUint::from(n)
    }

    #[test]
    fn buy_matches_with_group_totals() {
        for market in [make_quipu("KT1pool"), make_vertex("KT1pool"), make_plenty("KT1pool")] {
            let buy = market.construct_buy_operation(&owner(), &big(900), &big(1_000), expiration());
            let group = vec![reveal(), with_fees(buy, 2_000, 20_000)];

            let OperationMatch::Buy(found) = market.match_buy_operation(&group) else {
                panic!("{market} did not match its own buy");
            };
            assert_eq!(found.call.coin_balance, big(1_000), "{market}");
            assert_eq!(found.call.token_minimum, big(900), "{market}");
            assert_eq!(found.fee, 2_300);
            assert_eq!(found.gas, 21_000);
        }
    }

    #[test]
    fn sell_group_matches_and_skips_approval() {
        for market in [make_quipu("KT1pool"), make_vertex("KT1pool"), make_plenty("KT1pool")] {
            let group = market
                .construct_sell_group(&owner(), &big(900), &big(1_000), expiration(), Approvals::PerTrade)
                .unwrap();
            assert_eq!(group.len(), 2, "{market}");
            assert!(market.asset.match_approve_operation(&group[0]));

            let OperationMatch::Sell(found) = market.match_sell_operation(&group) else {
                panic!("{market} did not match its own sale");
            };
            assert_eq!(found.call.token_balance, big(900), "{market}");
            assert_eq!(found.call.coin_minimum, big(1_000), "{market}");
        }
    }

    #[test]
    fn sides_do_not_cross() {
        for market in [make_quipu("KT1pool"), make_vertex("KT1pool"), make_plenty("KT1pool")] {
            let buy = market.construct_buy_operation(&owner(), &big(900), &big(1_000), expiration());
            let sell = market.construct_sell_operation(&owner(), &big(900), &big(1_000), expiration());

            assert_eq!(market.match_sell_operation(&[buy]).kind(), MatchKind::NoSell, "{market}");
            assert_eq!(market.match_buy_operation(&[sell]).kind(), MatchKind::NoBuy, "{market}");
        }
    }

    #[test]
    fn other_pools_are_ignored() {
        let market = make_quipu("KT1pool");
        let elsewhere = make_quipu("KT1elsewhere");
        let buy = elsewhere.construct_buy_operation(&owner(), &big(900), &big(1_000), expiration());

        assert_eq!(market.match_buy_operation(&[buy]), OperationMatch::NoBuy);
    }

    #[test]
    fn buy_followed_by_sibling_is_rival_arbitrage() {
        let market = make_quipu("KT1pool");
        let buy = market.construct_buy_operation(&owner(), &big(900), &big(1_000), expiration());

        let group = vec![buy.clone(), sibling_call()];
        assert_eq!(market.match_buy_operation(&group), OperationMatch::BuyArb);

        let group = vec![sibling_call(), buy];
        assert!(market.match_buy_operation(&group).is_match());
    }

    #[test]
    fn sell_sharing_group_with_sibling_is_rival_arbitrage() {
        let market = make_quipu("KT1pool");
        let sell = market.construct_sell_operation(&owner(), &big(900), &big(1_000), expiration());

        let group = vec![sell.clone(), sibling_call()];
        assert_eq!(market.match_sell_operation(&group).kind(), MatchKind::SellArb);

        let group = vec![sibling_call(), sell];
        assert_eq!(market.match_sell_operation(&group).kind(), MatchKind::SellArb);
    }

    #[test]
    fn matching_is_idempotent() {
        let market = make_plenty("KT1pool");
        let group = market
            .construct_buy_group(&owner(), &big(900), &big(1_000), expiration(), Approvals::PerTrade)
            .unwrap();

        let first = market.match_buy_operation(&group);
        let second = market.match_buy_operation(&group);
        assert_eq!(first, second);
        assert!(first.is_match());
    }

    #[test]
    fn quipu_use_entrypoint() {
        let market = make_quipu("KT1pool");
        let call = |value| {
            let mut operation = Operation::transaction(
                &Address::from("tz1rival"),
                &market.pool,
                big(5_000),
                "use",
                value,
            );
            operation.gas_limit = 10;
            operation
        };

        let buy = call(left(right(right(pair([int_lit(77), string_lit("tz1rival")])))));
        let OperationMatch::Buy(found) = market.match_buy_operation(&[buy]) else {
            panic!("use-encoded buy not matched");
        };
        assert_eq!(found.call.token_minimum, big(77));
        assert_eq!(found.call.coin_balance, big(5_000));

        let sell = call(right(left(left(pair([
            pair([int_lit(300), int_lit(12)]),
            string_lit("tz1rival"),
        ])))));
        let OperationMatch::Sell(found) = market.match_sell_operation(&[sell.clone()]) else {
            panic!("use-encoded sale not matched");
        };
        assert_eq!(found.call.token_balance, big(300));
        assert_eq!(found.call.coin_minimum, big(12));
        assert_eq!(market.match_buy_operation(&[sell]), OperationMatch::NoBuy);
    }

    #[test]
    fn plenty_checks_token_and_index() {
        let market = make_plenty("KT1pool");
        let mut other_index = make_plenty("KT1pool");
        other_index.asset = make_tzip12("wWBTC", "KT1wrap", 19);

        let buy = other_index.construct_buy_operation(&owner(), &big(900), &big(1_000), expiration());
        assert_eq!(market.match_buy_operation(&[buy]), OperationMatch::NoBuy);

        let mut other_token = make_plenty("KT1pool");
        other_token.asset = make_tzip12("uUSD", "KT1youves", 17);
        let buy = other_token.construct_buy_operation(&owner(), &big(900), &big(1_000), expiration());
        assert_eq!(market.match_buy_operation(&[buy]), OperationMatch::NoBuy);
    }

    #[test]
    fn plenty_buy_group_approves_cash() {
        let market = make_plenty("KT1pool");
        let group = market
            .construct_buy_group(&owner(), &big(900), &big(1_000), expiration(), Approvals::PerTrade)
            .unwrap();

        assert_eq!(group.len(), 2);
        assert!(market.cash.match_approve_operation(&group[0]));

        let standing = market
            .construct_buy_group(&owner(), &big(900), &big(1_000), expiration(), Approvals::Standing)
            .unwrap();
        assert_eq!(standing.len(), 1);
    }

    #[test]
    fn vertex_reads_nested_minimum() {
        let market = make_vertex("KT1pool");
        let buy = Operation::transaction(
            &Address::from("tz1rival"),
            &market.pool,
            big(2_500),
            "xtzToToken",
            pair([
                string_lit("tz1rival"),
                pair([int_lit(41), string_lit("2023-11-14T22:13:20Z")]),
            ]),
        );

        let OperationMatch::Buy(found) = market.match_buy_operation(&[buy]) else {
            panic!("nested vertex buy not matched");
        };
        assert_eq!(found.call.token_minimum, big(41));
    }

    #[test]
    fn vertex_carries_deadline() {
        let market = make_vertex("KT1pool");
        let sell = market.construct_sell_operation(&owner(), &big(900), &big(1_000), expiration());

        assert_eq!(
            sell.parameters.unwrap().value["args"][3],
            json!({ "string": "2023-11-14T22:13:20Z" })
        );
    }

    #[test]
    fn reads_pool_state_from_storage() {
        let market = make_quipu("KT1pool");
        let storage = pair([string_lit("admin"), pair([int_lit(1_000_000), int_lit(5_000_000)])]);

        let state = market.pool_state(&storage).unwrap();
        assert_eq!(state, PoolState::new(1_000_000u64, 5_000_000u64));

        assert!(market.pool_state(&json!({ "prim": "Unit" })).is_err());
    }
}
