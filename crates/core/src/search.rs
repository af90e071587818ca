//! Trade sizing: a ladder scan over candidate notionals followed by a fixed-step hill-climb.
//!
//! Profit is assumed unimodal over the ladder. The scan stops at the first step that loses
//! profit, so a curve with a second, higher peak further up is never reached.

use std::fmt::Display;

use color_eyre::eyre::{self, OptionExt as _, WrapErr as _, bail};
use num_bigint::{BigInt, BigUint};
use num_traits::{ToPrimitive as _, Zero as _};
use tracing::trace;

use crate::{
    market::Market,
    pricing::{self, ceil_div},
    state::PoolState,
};

/// A pool and the state it is priced at.
#[derive(Debug, Clone, Copy)]
pub struct Venue<'a> {
    pub market: &'a Market,
    pub state: &'a PoolState,
}

impl<'a> Venue<'a> {
    pub fn new(market: &'a Market, state: &'a PoolState) -> Self {
        Self { market, state }
    }
}

/// Where an indirect arbitrage converts between the two cash tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convert {
    /// Native cash is converted into the source's cash before the buy.
    Input,
    /// The target's cash is converted back into native cash after the sale.
    Output,
}

impl Convert {
    pub fn for_source(source: &Market) -> Self {
        if source.cash.is_native() {
            Self::Output
        } else {
            Self::Input
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArbParameters {
    /// Cash out minus `trade_notional`, negative when unprofitable.
    pub arb: BigInt,
    pub trade_notional: BigUint,
    pub source_token_amount: BigUint,
    pub target_cash_amount: BigUint,
    pub source_coin_amount: BigUint,
    pub target_token_amount: BigUint,
    pub intermediate_cash_amount: Option<BigUint>,
}

impl Display for ArbParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "arb {} on {} notional, {} tokens sold for {}",
            self.arb, self.trade_notional, self.source_token_amount, self.target_cash_amount
        )?;
        if let Some(intermediate) = &self.intermediate_cash_amount {
            write!(f, ", {intermediate} converted")?;
        }
        Ok(())
    }
}

fn profit(cash_out: &BigUint, notional: &BigUint) -> BigInt {
    BigInt::from(cash_out.clone()) - BigInt::from(notional.clone())
}

/// Buys on `source` with `notional` cash and sells the tokens on `target`.
pub fn calc_arbitrage(
    notional: &BigUint,
    source: Venue<'_>,
    target: Venue<'_>,
) -> eyre::Result<ArbParameters> {
    let source_token_amount = source.market.cash_to_token(notional, source.state)?.amount;
    let target_cash_amount = target
        .market
        .token_to_cash(&source_token_amount, target.state)?
        .amount;
    let target_token_amount = target.market.cash_to_token(notional, target.state)?.amount;
    let source_coin_amount = source
        .market
        .token_to_cash(&target_token_amount, source.state)?
        .amount;

    Ok(ArbParameters {
        arb: profit(&target_cash_amount, notional),
        trade_notional: notional.clone(),
        source_token_amount,
        target_cash_amount,
        source_coin_amount,
        target_token_amount,
        intermediate_cash_amount: None,
    })
}

/// Like [`calc_arbitrage`] with a conversion through `exchange`, whose asset is the
/// non-native cash token and whose cash is the native coin.
pub fn calc_indirect_arbitrage(
    notional: &BigUint,
    convert: Convert,
    source: Venue<'_>,
    target: Venue<'_>,
    exchange: Venue<'_>,
) -> eyre::Result<ArbParameters> {
    match convert {
        Convert::Output => {
            let source_token_amount = source.market.cash_to_token(notional, source.state)?.amount;
            let target_cash_amount = target
                .market
                .token_to_cash(&source_token_amount, target.state)?
                .amount;
            let intermediate_cash_amount = exchange
                .market
                .token_to_cash(&target_cash_amount, exchange.state)?
                .amount;
            let target_token_amount = target
                .market
                .cash_to_token(&target_cash_amount, target.state)?
                .amount;
            let source_coin_amount = source
                .market
                .token_to_cash(&target_token_amount, source.state)?
                .amount;

            Ok(ArbParameters {
                arb: profit(&intermediate_cash_amount, notional),
                trade_notional: notional.clone(),
                source_token_amount,
                target_cash_amount,
                source_coin_amount,
                target_token_amount,
                intermediate_cash_amount: Some(intermediate_cash_amount),
            })
        }
        Convert::Input => {
            let intermediate_cash_amount = exchange
                .market
                .cash_to_token(notional, exchange.state)?
                .amount;
            let source_token_amount = source
                .market
                .cash_to_token(&intermediate_cash_amount, source.state)?
                .amount;
            let target_cash_amount = target
                .market
                .token_to_cash(&source_token_amount, target.state)?
                .amount;
            let target_token_amount = target.market.cash_to_token(notional, target.state)?.amount;
            let source_coin_amount = source
                .market
                .token_to_cash(&source_token_amount, source.state)?
                .amount;

            Ok(ArbParameters {
                arb: profit(&target_cash_amount, notional),
                trade_notional: notional.clone(),
                source_token_amount,
                target_cash_amount,
                source_coin_amount,
                target_token_amount,
                intermediate_cash_amount: Some(intermediate_cash_amount),
            })
        }
    }
}

/// Candidate trade sizes, ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotionalLadder(Vec<BigUint>);

impl NotionalLadder {
    const BASE: [u32; 5] = [10, 25, 50, 75, 100];

    pub fn new(steps: Vec<BigUint>) -> eyre::Result<Self> {
        let Some(first) = steps.first() else {
            bail!("notional ladder is empty");
        };
        if first.is_zero() {
            bail!("notional ladder starts at zero");
        }
        if steps.windows(2).any(|pair| pair[0] >= pair[1]) {
            bail!("notional ladder is not strictly ascending");
        }
        Ok(Self(steps))
    }

    /// `10, 25, 50, 75, 100` units.
    pub fn base(unit: &BigUint) -> Self {
        Self(Self::BASE.iter().map(|step| unit * *step).collect())
    }

    /// The base ladder extended in 50 unit steps up to 300 units, then 100 unit steps, for
    /// as long as the balance above `reserve_units` covers them.
    pub fn for_balance(unit: &BigUint, balance: &BigUint, reserve_units: u64) -> Self {
        let mut ladder = Self::base(unit);

        let reserve = unit * reserve_units;
        let spare_units = if *balance > reserve && !unit.is_zero() {
            (balance - &reserve) / unit
        } else {
            BigUint::zero()
        };
        let extensions = (spare_units / 50u32).to_u64().unwrap_or(u64::MAX);

        let mut i = 3u64;
        while i <= extensions {
            if i < 6 {
                ladder.0.push(unit * (i * 50));
                i += 1;
            } else {
                ladder.0.push(unit * (i / 2 * 100));
                i += 2;
            }
        }
        ladder
    }

    pub fn steps(&self) -> &[BigUint] {
        &self.0
    }

    pub fn max(&self) -> &BigUint {
        // never empty, see constructors
        &self.0[self.0.len() - 1]
    }
}

impl Display for NotionalLadder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let steps: Vec<_> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "[{}]", steps.join(", "))
    }
}

/// Rounding of the next notional in a 3% hill-climb step. Direct searches round up, indirect
/// ones down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepRounding {
    Ceil,
    Floor,
}

impl StepRounding {
    fn scale(self, notional: &BigUint, percent: u32) -> BigUint {
        let scaled = notional * percent;
        let hundred = BigUint::from(100u32);
        match self {
            Self::Ceil => ceil_div(&scaled, &hundred),
            Self::Floor => scaled / hundred,
        }
    }

    fn up(self, notional: &BigUint) -> BigUint {
        self.scale(notional, 103)
    }

    fn down(self, notional: &BigUint) -> BigUint {
        self.scale(notional, 97)
    }
}

fn climb(
    mut best: ArbParameters,
    step: impl Fn(&BigUint) -> BigUint,
    evaluate: &mut impl FnMut(&BigUint) -> eyre::Result<ArbParameters>,
) -> eyre::Result<ArbParameters> {
    loop {
        let next = evaluate(&step(&best.trade_notional))?;
        trace!(notional = %next.trade_notional, arb = %next.arb, "climb step");
        if next.arb <= best.arb {
            return Ok(best);
        }
        best = next;
    }
}

/// Scans the ladder until profit drops, then hill-climbs in 3% steps from the best point.
///
/// Any failing evaluation aborts the search.
pub fn optimize(
    ladder: &NotionalLadder,
    rounding: StepRounding,
    mut evaluate: impl FnMut(&BigUint) -> eyre::Result<ArbParameters>,
) -> eyre::Result<ArbParameters> {
    let mut evaluate = |notional: &BigUint| {
        evaluate(notional).wrap_err_with(|| format!("failed to evaluate notional {notional}"))
    };

    let mut steps = ladder.steps().iter();
    let first = steps.next().ok_or_eyre("notional ladder is empty")?;
    let mut best = evaluate(first)?;
    trace!(notional = %first, arb = %best.arb, "ladder step");

    for notional in steps {
        let candidate = evaluate(notional)?;
        trace!(%notional, arb = %candidate.arb, "ladder step");
        if candidate.arb < best.arb {
            break;
        }
        best = candidate;
    }

    if best.trade_notional >= *ladder.max() {
        return Ok(best);
    }

    let up = evaluate(&rounding.up(&best.trade_notional))?;
    if up.arb > best.arb {
        return climb(up, |n| rounding.up(n), &mut evaluate);
    }

    let down = evaluate(&rounding.down(&best.trade_notional))?;
    if down.arb > best.arb {
        return climb(down, |n| rounding.down(n), &mut evaluate);
    }

    Ok(best)
}

pub fn calc_best_arb(
    ladder: &NotionalLadder,
    source: Venue<'_>,
    target: Venue<'_>,
) -> eyre::Result<ArbParameters> {
    optimize(ladder, StepRounding::Ceil, |notional| {
        calc_arbitrage(notional, source, target)
    })
}

pub fn calc_best_indirect_arb(
    ladder: &NotionalLadder,
    convert: Convert,
    source: Venue<'_>,
    target: Venue<'_>,
    exchange: Venue<'_>,
) -> eyre::Result<ArbParameters> {
    optimize(ladder, StepRounding::Floor, |notional| {
        calc_indirect_arbitrage(notional, convert, source, target, exchange)
    })
}

/// Prices the closed-form size, a starting estimate rather than the optimum.
pub fn calc_exact_arb(source: Venue<'_>, target: Venue<'_>) -> eyre::Result<ArbParameters> {
    let tokens = pricing::exact_arbitrage_tokens(
        source.state,
        source.market.multiplier,
        target.state,
        target.market.multiplier,
    )?;
    let notional = source.market.token_to_cash(&tokens, source.state)?.amount;
    calc_arbitrage(&notional, source, target)
}
