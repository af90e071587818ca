use std::{
    fmt::Display,
    time::{Duration, SystemTime},
};

use color_eyre::eyre::{self, WrapErr as _, bail};
use num_bigint::{BigInt, BigUint};
use num_traits::{ToPrimitive as _, Zero as _};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::{
    chain::GroupEstimate,
    fees::{
        self, FeeDerivation, FeeSplit, GasDirection, GasWalk, OperationFee, RatioParameters,
        apply_fee_split, calc_fee_ratio, calc_gas_adjusted_ratio, price_by_ratio,
    },
    market::{Approvals, Market},
    matcher::{BuyMatch, OperationMatch, SellMatch},
    operation::{self, Operation},
    search::{self, ArbParameters, Convert, NotionalLadder, Venue},
    state::{Address, PoolState},
    token::Token,
};

mod builder;
pub use builder::Builder;

/// Asset balance always kept back from a liquidation.
pub const DUST_RESERVE: u64 = 10_000;

/// Surplus over the minimum profit above which trades use a tighter tolerance.
const WIDE_SURPLUS: u64 = 1_000_000;
const WIDE_SURPLUS_TOLERANCE: u64 = 10;

/// Whole notional units traded by the baseline estimate.
const PROBE_UNITS: u32 = 10;

/// Gas walk used against a rival's group.
const RIVAL_WALK_DECIMALS: u32 = 11;
const RIVAL_WALK_INCREMENT: u64 = 1;
const RIVAL_WALK_OFFSET: u128 = 15;
const MINIMUM_RATIO_DECIMALS: u32 = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// React to pending groups only.
    #[default]
    Dynamic,
    /// Trade on the current pool states only.
    Standing,
    Combined,
}

impl Mode {
    pub fn watches_mempool(self) -> bool {
        matches!(self, Self::Dynamic | Self::Combined)
    }

    pub fn checks_standing(self) -> bool {
        matches!(self, Self::Standing | Self::Combined)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub minimum_arb: u64,
    /// Slippage denominator, `20` accepts 5% less than quoted.
    pub rate_tolerance: u64,
    pub split_fee: FeeSplit,
    pub fee_derivation: FeeDerivation,
    pub mode: Mode,
    pub expiration_padding: Duration,
    pub fee_override: u64,
    pub approvals: Approvals,
    pub standing_allowance: Option<BigUint>,
}

/// Third pool converting between the source's and the target's cash.
#[derive(Debug, Clone)]
pub struct CashExchange {
    pub market: Market,
    pub convert: Convert,
}

/// Pool states read in one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub source: PoolState,
    pub target: PoolState,
    pub cash_exchange: Option<PoolState>,
}

/// Fees of the strategy's own group as estimated at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaselineFees {
    pub group: Vec<OperationFee>,
    pub fee_floor: u64,
    pub gas_floor: u64,
}

impl BaselineFees {
    /// Pads the estimated gas and storage of every operation and spreads the estimated fee plus
    /// `fee_padding` over the group.
    pub fn from_estimate(
        estimate: &GroupEstimate,
        fee_padding: u64,
        gas_extra: u64,
        storage_extra: u64,
        split: FeeSplit,
    ) -> eyre::Result<Self> {
        let group: Vec<_> = estimate
            .resources
            .iter()
            .map(|resources| OperationFee {
                fee: 0,
                gas: resources.gas + gas_extra,
                storage: resources.storage + storage_extra,
            })
            .collect();
        let group = apply_fee_split(&group, split, estimate.estimated_fee + fee_padding)
            .wrap_err("failed to spread estimated fee")?;

        Ok(Self {
            fee_floor: fees::total_fee(&group),
            gas_floor: fees::total_gas(&group),
            group,
        })
    }
}

/// Start-up state every cycle is evaluated against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Calibration {
    pub ladder: NotionalLadder,
    pub baseline: BaselineFees,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// A pending buy on the target.
    Buy,
    /// A pending sale on the source.
    Sell,
    /// No pending trigger, the pools are apart on their own.
    Standing,
}

impl Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let side = match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
            Self::Standing => "standing",
        };
        write!(f, "{side}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bid {
    /// Priced per gas against a rival group.
    Ratio(RatioParameters),
    /// A total fee spread by the configured split.
    Fee(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opportunity {
    pub side: Side,
    pub arb: ArbParameters,
    pub bid: Bid,
    pub tolerance: u64,
}

enum RivalPricing {
    Trade(Opportunity),
    Miss,
    /// Outbidding the rival eats the profit, nothing else in the group is worth pricing.
    Unprofitable,
}

/// Random fee padding in `[fee_extra, 2 * fee_extra)`.
pub fn randomize_padding(fee_extra: u64, rng: &mut impl Rng) -> u64 {
    if fee_extra == 0 {
        return 0;
    }
    rng.gen_range(fee_extra..fee_extra.saturating_mul(2))
}

/// Arbitrage of one asset between a source pool, where it is bought, and a target pool, where
/// it is sold.
#[derive(Debug, Clone)]
pub struct Strategy {
    pub owner: Address,
    pub source: Market,
    pub target: Market,
    pub cash_exchange: Option<CashExchange>,
    pub settings: Settings,
}

impl Strategy {
    /// Pools whose pending calls the strategy reacts to.
    pub fn targets(&self) -> Vec<Address> {
        vec![self.source.pool.clone(), self.target.pool.clone()]
    }

    /// Token the trade notional is paid in.
    pub fn notional_token(&self) -> &Token {
        match &self.cash_exchange {
            Some(exchange) => &exchange.market.cash,
            None => &self.source.cash,
        }
    }

    pub fn markets(&self) -> impl Iterator<Item = &Market> {
        [&self.source, &self.target]
            .into_iter()
            .chain(self.cash_exchange.as_ref().map(|exchange| &exchange.market))
    }

    fn venues<'a>(
        &'a self,
        snapshot: &'a Snapshot,
    ) -> eyre::Result<(Venue<'a>, Venue<'a>, Option<(Convert, Venue<'a>)>)> {
        let source = Venue::new(&self.source, &snapshot.source);
        let target = Venue::new(&self.target, &snapshot.target);
        let exchange = match (&self.cash_exchange, &snapshot.cash_exchange) {
            (None, _) => None,
            (Some(exchange), Some(state)) => {
                Some((exchange.convert, Venue::new(&exchange.market, state)))
            }
            (Some(exchange), None) => bail!("snapshot has no state for {}", exchange.market),
        };
        Ok((source, target, exchange))
    }

    pub fn search(&self, snapshot: &Snapshot, ladder: &NotionalLadder) -> eyre::Result<ArbParameters> {
        match self.venues(snapshot)? {
            (source, target, None) => search::calc_best_arb(ladder, source, target),
            (source, target, Some((convert, exchange))) => {
                search::calc_best_indirect_arb(ladder, convert, source, target, exchange)
            }
        }
    }

    fn discount(amount: &BigUint, tolerance: u64) -> BigUint {
        amount - amount / tolerance
    }

    /// Looks for a counter-trade to a pending group, priced against the pools as they will be
    /// once the group lands.
    #[instrument(skip_all, fields(source = %self.source, target = %self.target))]
    pub fn evaluate(
        &self,
        group: &[Operation],
        snapshot: &Snapshot,
        calibration: &Calibration,
    ) -> eyre::Result<Option<Opportunity>> {
        let buy = self.target.match_buy_operation(group);
        if let OperationMatch::Buy(found) = &buy {
            debug!(
                coin_balance = %found.call.coin_balance,
                token_minimum = %found.call.token_minimum,
                fee = found.fee,
                gas = found.gas,
                "observed buy on target"
            );
            match self.price_against_buy(found, snapshot, calibration) {
                Ok(RivalPricing::Trade(opportunity)) => return Ok(Some(opportunity)),
                Ok(RivalPricing::Unprofitable) => return Ok(None),
                Ok(RivalPricing::Miss) => {}
                Err(e) => warn!(error = ?e, "failed to price against observed buy"),
            }
        }

        let sell = self.source.match_sell_operation(group);
        if let OperationMatch::Sell(found) = &sell {
            debug!(
                token_balance = %found.call.token_balance,
                coin_minimum = %found.call.coin_minimum,
                fee = found.fee,
                gas = found.gas,
                "observed sale on source"
            );
            match self
                .price_against_sale(found, snapshot, calibration)
                .wrap_err("failed to price against observed sale")?
            {
                RivalPricing::Trade(opportunity) => return Ok(Some(opportunity)),
                RivalPricing::Unprofitable | RivalPricing::Miss => {}
            }
        }

        if !buy.is_match() && !sell.is_match() {
            debug!(buy = %buy.kind(), sell = %sell.kind(), "ignored pending group");
        }
        Ok(None)
    }

    fn price_against_buy(
        &self,
        found: &BuyMatch,
        snapshot: &Snapshot,
        calibration: &Calibration,
    ) -> eyre::Result<RivalPricing> {
        let estimate = self
            .target
            .cash_to_token(&found.call.coin_balance, &snapshot.target)?
            .amount;
        let projected = Snapshot {
            target: snapshot.target.after_buy(
                &found.call.coin_balance,
                &Self::discount(&estimate, self.settings.rate_tolerance),
            )?,
            ..snapshot.clone()
        };

        self.price_against_rival(Side::Buy, found.fee, found.gas, &projected, calibration)
    }

    fn price_against_sale(
        &self,
        found: &SellMatch,
        snapshot: &Snapshot,
        calibration: &Calibration,
    ) -> eyre::Result<RivalPricing> {
        let estimate = self
            .source
            .token_to_cash(&found.call.token_balance, &snapshot.source)?
            .amount;
        let projected = Snapshot {
            source: snapshot.source.after_sell(
                &found.call.token_balance,
                &Self::discount(&estimate, self.settings.rate_tolerance),
            )?,
            ..snapshot.clone()
        };

        self.price_against_rival(Side::Sell, found.fee, found.gas, &projected, calibration)
    }

    fn price_against_rival(
        &self,
        side: Side,
        fee: u64,
        gas: u64,
        projected: &Snapshot,
        calibration: &Calibration,
    ) -> eyre::Result<RivalPricing> {
        let arb = self.search(projected, &calibration.ladder)?;
        let minimum = BigInt::from(self.settings.minimum_arb);

        if arb.arb <= &minimum + fee {
            debug!(%side, %arb, rival.fee = fee, rival.gas = gas, "arb miss");
            return Ok(RivalPricing::Miss);
        }

        let Some(bid) = self.derive_bid(fee, gas, &arb.arb, calibration.baseline.gas_floor) else {
            debug!(%side, %arb, rival.fee = fee, rival.gas = gas, "no fee clears the rival below the profit cap");
            return Ok(RivalPricing::Miss);
        };

        if arb.arb < &minimum + bid.fee {
            debug!(%side, %arb, bid.fee, "repriced trade unprofitable");
            return Ok(RivalPricing::Unprofitable);
        }

        let tolerance = if &arb.arb - &minimum - fee > BigInt::from(WIDE_SURPLUS) {
            WIDE_SURPLUS_TOLERANCE
        } else {
            self.settings.rate_tolerance
        };

        Ok(RivalPricing::Trade(Opportunity {
            side,
            arb,
            bid: Bid::Ratio(bid),
            tolerance,
        }))
    }

    /// Ratio bid against a rival paying `fee` for `gas`, giving up at most half the profit.
    pub fn derive_bid(&self, fee: u64, gas: u64, arb: &BigInt, gas_floor: u64) -> Option<RatioParameters> {
        let direction = match self.settings.fee_derivation {
            FeeDerivation::Minimum => {
                return calc_fee_ratio(fee, gas, gas_floor, MINIMUM_RATIO_DECIMALS);
            }
            FeeDerivation::GasAscending => GasDirection::Ascending,
            FeeDerivation::GasDescending => GasDirection::Descending,
        };

        // positive here, a half beyond u64 caps nothing
        let boundary_fee = (arb / 2u32).to_u64().unwrap_or(u64::MAX);
        calc_gas_adjusted_ratio(
            fee,
            gas,
            boundary_fee,
            gas_floor,
            &GasWalk {
                decimals: RIVAL_WALK_DECIMALS,
                gas_increment: RIVAL_WALK_INCREMENT,
                ratio_offset: RIVAL_WALK_OFFSET,
                direction,
            },
        )
    }

    /// Trade on the unprojected pools when they are apart by more than the fee floor.
    #[instrument(skip_all, fields(source = %self.source, target = %self.target))]
    pub fn standing_check(
        &self,
        snapshot: &Snapshot,
        calibration: &Calibration,
    ) -> eyre::Result<Option<Opportunity>> {
        let arb = self.search(snapshot, &calibration.ladder)?;
        let fee_floor = calibration.baseline.fee_floor;

        if arb.arb <= BigInt::from(self.settings.minimum_arb) + fee_floor {
            debug!(%arb, fee_floor, "standing miss");
            return Ok(None);
        }

        Ok(Some(Opportunity {
            side: Side::Standing,
            arb,
            bid: Bid::Fee(fee_floor.max(self.settings.fee_override)),
            tolerance: self.settings.rate_tolerance,
        }))
    }

    /// Operations of the trade in execution order, without counters or fees.
    pub fn construct_operations(
        &self,
        arb: &ArbParameters,
        tolerance: u64,
        expiration: SystemTime,
    ) -> eyre::Result<Vec<Operation>> {
        if tolerance == 0 {
            bail!("trade tolerance must be positive");
        }

        let owner = &self.owner;
        let approvals = self.settings.approvals;
        let minimum_tokens = Self::discount(&arb.source_token_amount, tolerance);
        let intermediate = || {
            arb.intermediate_cash_amount
                .as_ref()
                .ok_or_else(|| eyre::eyre!("indirect arbitrage without an intermediate amount"))
        };

        let mut operations = Vec::new();
        match &self.cash_exchange {
            None => {
                operations.extend(self.source.construct_buy_group(
                    owner,
                    &minimum_tokens,
                    &arb.trade_notional,
                    expiration,
                    approvals,
                )?);
                operations.extend(self.target.construct_sell_group(
                    owner,
                    &arb.source_token_amount,
                    &arb.trade_notional,
                    expiration,
                    approvals,
                )?);
            }
            Some(CashExchange {
                market,
                convert: Convert::Output,
            }) => {
                operations.extend(self.source.construct_buy_group(
                    owner,
                    &minimum_tokens,
                    &arb.trade_notional,
                    expiration,
                    approvals,
                )?);
                operations.extend(self.target.construct_sell_group(
                    owner,
                    &arb.source_token_amount,
                    &arb.target_cash_amount,
                    expiration,
                    approvals,
                )?);
                operations.extend(market.construct_sell_group(
                    owner,
                    &arb.target_cash_amount,
                    &arb.trade_notional,
                    expiration,
                    approvals,
                )?);
            }
            Some(CashExchange {
                market,
                convert: Convert::Input,
            }) => {
                let intermediate = intermediate()?;
                operations.extend(market.construct_buy_group(
                    owner,
                    intermediate,
                    &arb.trade_notional,
                    expiration,
                    approvals,
                )?);
                operations.extend(self.source.construct_buy_group(
                    owner,
                    &minimum_tokens,
                    intermediate,
                    expiration,
                    approvals,
                )?);
                operations.extend(self.target.construct_sell_group(
                    owner,
                    &arb.source_token_amount,
                    &arb.trade_notional,
                    expiration,
                    approvals,
                )?);
            }
        }
        Ok(operations)
    }

    /// The signed-ready group for an opportunity, numbered from `counter` and priced from the
    /// baseline.
    ///
    /// # Errors
    /// Fails when the bid cannot price the baseline group, for example below the network's
    /// minimum fee per gas.
    pub fn build_arbitrage_group(
        &self,
        opportunity: &Opportunity,
        baseline: &BaselineFees,
        counter: u64,
        now: SystemTime,
    ) -> eyre::Result<Vec<Operation>> {
        let mut operations = self.construct_operations(
            &opportunity.arb,
            opportunity.tolerance,
            now + self.settings.expiration_padding,
        )?;
        operation::renumber(&mut operations, counter);

        let fees = match &opportunity.bid {
            Bid::Ratio(bid) => price_by_ratio(&baseline.group, bid)
                .wrap_err_with(|| format!("failed to price group at ratio {}", bid.ratio))?,
            Bid::Fee(fee) => apply_fee_split(&baseline.group, self.settings.split_fee, *fee)?,
        };
        operation::overlay_fees(&mut operations, &fees)
            .wrap_err("baseline does not match the trade group")?;
        Ok(operations)
    }

    /// A small trade of the same shape as every arbitrage group, for fee estimation.
    pub fn baseline_probe(
        &self,
        snapshot: &Snapshot,
        counter: u64,
        now: SystemTime,
    ) -> eyre::Result<Vec<Operation>> {
        let notional = self.notional_token().unit() * PROBE_UNITS;
        let arb = match self.venues(snapshot)? {
            (source, target, None) => search::calc_arbitrage(&notional, source, target),
            (source, target, Some((convert, exchange))) => {
                search::calc_indirect_arbitrage(&notional, convert, source, target, exchange)
            }
        }
        .wrap_err("failed to price the baseline trade")?;

        let mut operations = self.construct_operations(
            &arb,
            self.settings.rate_tolerance,
            now + self.settings.expiration_padding,
        )?;
        operation::renumber(&mut operations, counter);
        Ok(operations)
    }

    /// Sells the asset held above [`DUST_RESERVE`] on the pool paying more for it. Unless
    /// `force`d, only a sale on the target is planned.
    pub fn plan_liquidation(
        &self,
        balance: &BigUint,
        snapshot: &Snapshot,
        force: bool,
        counter: u64,
        now: SystemTime,
    ) -> eyre::Result<Option<Vec<Operation>>> {
        let reserve = BigUint::from(DUST_RESERVE);
        if *balance <= reserve {
            return Ok(None);
        }
        let size = balance - reserve;

        let on_target = self.target.token_to_cash(&size, &snapshot.target)?.amount;
        let on_source = self.source.token_to_cash(&size, &snapshot.source)?.amount;
        let (market, proceeds) = if on_target > on_source {
            (&self.target, on_target)
        } else if force {
            (&self.source, on_source)
        } else {
            debug!(%on_target, %on_source, "target pays less, not liquidating");
            return Ok(None);
        };

        let minimum = Self::discount(&proceeds, self.settings.rate_tolerance);
        debug!(%size, %minimum, market = %market, "planned liquidation");

        let mut operations = market.construct_sell_group(
            &self.owner,
            &size,
            &minimum,
            now + self.settings.expiration_padding,
            Approvals::PerTrade,
        )?;
        operation::renumber(&mut operations, counter);
        Ok(Some(operations))
    }

    /// Clears the target's allowance over the asset, then sets it to `allowance`.
    pub fn allowance_group(&self, allowance: &BigUint, counter: u64) -> eyre::Result<Vec<Operation>> {
        let asset = &self.target.asset;
        let mut operations = vec![asset.construct_approval_operation(
            &self.owner,
            &self.target.pool,
            &BigUint::zero(),
        )?];
        if !allowance.is_zero() {
            operations.push(asset.construct_approval_operation(
                &self.owner,
                &self.target.pool,
                allowance,
            )?);
        }
        operation::renumber(&mut operations, counter);
        Ok(operations)
    }
}

impl Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.source, self.target)?;
        if let Some(exchange) = &self.cash_exchange {
            write!(f, " via {}", exchange.market)?;
        }
        Ok(())
    }
}
