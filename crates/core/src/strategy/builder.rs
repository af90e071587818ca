use color_eyre::eyre::{self, bail, ensure};

use crate::{
    market::Market,
    search::Convert,
    state::Address,
    strategy::{CashExchange, Settings, Strategy},
};

pub struct Builder {
    pub owner: Address,
    pub source: Market,
    pub target: Market,
    pub cash_exchange: Option<Market>,
    pub settings: Settings,
}

impl Builder {
    pub fn build(self) -> eyre::Result<Strategy> {
        let Self {
            owner,
            mut source,
            mut target,
            cash_exchange,
            settings,
        } = self;

        ensure!(
            settings.rate_tolerance >= 1,
            "rate tolerance must be at least 1, got {}",
            settings.rate_tolerance
        );
        ensure!(
            source.pool != target.pool,
            "source and target are the same pool {}",
            source.pool
        );
        ensure!(
            source.asset == target.asset,
            "{source} and {target} trade different assets"
        );

        let cash_exchange = match cash_exchange {
            None => {
                ensure!(
                    source.cash == target.cash,
                    "{source} and {target} settle in different cash and no exchange is configured"
                );
                None
            }
            Some(market) => {
                let convert = Convert::for_source(&source);
                // exchange asset is the non-native leg, its cash the native one
                let (bought, paid) = match convert {
                    Convert::Input => (&source.cash, &target.cash),
                    Convert::Output => (&target.cash, &source.cash),
                };
                if market.asset != *bought || market.cash != *paid {
                    bail!(
                        "{market} cannot convert between {} and {}",
                        source.cash,
                        target.cash
                    );
                }
                Some(CashExchange { market, convert })
            }
        };

        // a rival call into the counterpart pool marks its group as an arbitrage
        add_sibling(&mut source, &target.pool);
        add_sibling(&mut target, &source.pool);

        Ok(Strategy {
            owner,
            source,
            target,
            cash_exchange,
            settings,
        })
    }
}

fn add_sibling(market: &mut Market, pool: &Address) {
    if !market.siblings.contains(pool) {
        market.siblings.push(pool.clone());
    }
}

#[cfg(test)]
mod tests {
    use num_bigint::BigUint;

    use super::*;
    use crate::{
        market::tests::{expiration, make_market, make_plenty, make_quipu},
        market::Protocol,
        matcher::MatchKind,
        strategy::tests::{balanced_snapshot, make_calibration, make_settings},
        token::tests::{make_coin, make_tzip7},
    };

    fn builder(source: Market, target: Market, cash_exchange: Option<Market>) -> Builder {
        Builder {
            owner: Address::from("tz1owner"),
            source,
            target,
            cash_exchange,
            settings: make_settings(),
        }
    }

    #[test]
    fn direct_pair_builds() {
        let strategy = builder(make_quipu("KT1a"), make_quipu("KT1b"), None)
            .build()
            .unwrap();
        assert!(strategy.cash_exchange.is_none());
        assert_eq!(strategy.targets().len(), 2);
    }

    #[test]
    fn mismatched_assets_are_rejected() {
        let err = builder(make_quipu("KT1a"), make_plenty("KT1b"), None)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("different assets"));
    }

    #[test]
    fn zero_tolerance_is_rejected() {
        let mut builder = builder(make_quipu("KT1a"), make_quipu("KT1b"), None);
        builder.settings.rate_tolerance = 0;
        assert!(builder.build().is_err());
    }

    #[test]
    fn exchange_resolves_conversion_side() {
        let kusd = make_tzip7("kUSD", "KT1kusd", 18);
        let usdt = make_tzip7("USDt", "KT1usdt", 6);
        let source = make_quipu("KT1a");
        let target = make_market("Plenty", Protocol::Plenty, "KT1b", kusd.clone(), usdt.clone());
        let exchange = make_market("Quipu", Protocol::Quipu, "KT1x", usdt.clone(), make_coin());

        let strategy = builder(source.clone(), target.clone(), Some(exchange))
            .build()
            .unwrap();
        let exchange = strategy.cash_exchange.as_ref().unwrap();
        assert_eq!(exchange.convert, Convert::Output);
        assert_eq!(strategy.notional_token(), &make_coin());

        let wrong = make_market("Quipu", Protocol::Quipu, "KT1x", kusd, make_coin());
        assert!(builder(source, target, Some(wrong)).build().is_err());
    }

    #[test]
    fn legs_list_each_other_as_siblings() {
        let mut target = make_quipu("KT1b");
        target.siblings.push(Address::from("KT1a"));

        let strategy = builder(make_quipu("KT1a"), target, None).build().unwrap();
        assert_eq!(
            strategy.source.siblings,
            vec![Address::from("KT1sibling"), Address::from("KT1b")]
        );
        assert_eq!(
            strategy.target.siblings,
            vec![Address::from("KT1sibling"), Address::from("KT1a")]
        );
    }

    #[test]
    fn rival_arbitrage_through_both_pools_is_left_alone() {
        let strategy = builder(make_quipu("KT1a"), make_quipu("KT1b"), None)
            .build()
            .unwrap();
        let rival = Address::from("tz1rival");
        let buy = strategy.target.construct_buy_operation(
            &rival,
            &BigUint::from(1u32),
            &BigUint::from(5_000_000_000u64),
            expiration(),
        );
        let sell = strategy.source.construct_sell_operation(
            &rival,
            &BigUint::from(5_000_000_000u64),
            &BigUint::from(1u32),
            expiration(),
        );
        let group = vec![buy.clone(), sell];

        assert_eq!(strategy.target.match_buy_operation(&group).kind(), MatchKind::BuyArb);
        assert_eq!(strategy.source.match_sell_operation(&group).kind(), MatchKind::SellArb);
        assert_eq!(
            strategy
                .evaluate(&group, &balanced_snapshot(), &make_calibration())
                .unwrap(),
            None
        );

        // alone, the same buy is worth backrunning
        assert!(
            strategy
                .evaluate(&[buy], &balanced_snapshot(), &make_calibration())
                .unwrap()
                .is_some()
        );
    }
}
