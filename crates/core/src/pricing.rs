//! Constant-product pricing.
//!
//! Every amount is an arbitrary-precision integer and every division truncates, so a quote is
//! exactly what the pool contract will pay out. Rates are produced for logs only and never fed
//! back into amounts.

use std::fmt::Display;

use color_eyre::eyre::{self, bail};
use num_bigint::BigUint;
use num_traits::{One as _, Zero as _};

use crate::state::PoolState;

/// Denominator of every pool fee multiplier, `997` is a 0.3% fee.
pub const FEE_DENOMINATOR: u64 = 1000;

/// Scale applied to both sides of the closed-form arbitrage size.
const EXACT_SCALE: u64 = FEE_DENOMINATOR * FEE_DENOMINATOR;

/// Effective exchange rate of a quote, `whole.fraction` with `decimals` fractional digits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rate {
    whole: BigUint,
    fraction: BigUint,
    decimals: u32,
}

impl Rate {
    fn of(output: &BigUint, input: &BigUint, decimals: u32) -> Self {
        if input.is_zero() {
            return Self {
                whole: BigUint::zero(),
                fraction: BigUint::zero(),
                decimals,
            };
        }

        Self {
            whole: output / input,
            fraction: (output % input) * BigUint::from(10u32).pow(decimals) / input,
            decimals,
        }
    }
}

impl Display for Rate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.decimals == 0 {
            return write!(f, "{}", self.whole);
        }
        write!(
            f,
            "{}.{:0>width$}",
            self.whole,
            self.fraction.to_string(),
            width = self.decimals as usize
        )
    }
}

/// Output of a swap and the rate it was filled at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub amount: BigUint,
    pub rate: Rate,
}

fn swap_output(
    amount_in: &BigUint,
    reserve_in: &BigUint,
    reserve_out: &BigUint,
    multiplier: u64,
) -> eyre::Result<BigUint> {
    if reserve_in.is_zero() || reserve_out.is_zero() {
        bail!("degenerate reserves: {reserve_in} in, {reserve_out} out");
    }
    if multiplier == 0 || multiplier > FEE_DENOMINATOR {
        bail!("fee multiplier {multiplier} outside (0, {FEE_DENOMINATOR}]");
    }

    let scaled_in = amount_in * multiplier;
    let denominator = reserve_in * FEE_DENOMINATOR + &scaled_in;
    Ok(scaled_in * reserve_out / denominator)
}

/// Tokens received for paying `cash_in` into the pool.
///
/// `floor(cash_in * token_balance * m / (cash_balance * 1000 + cash_in * m))`
pub fn cash_to_token(
    cash_in: &BigUint,
    state: &PoolState,
    multiplier: u64,
    token_decimals: u32,
) -> eyre::Result<Quote> {
    let amount = swap_output(
        cash_in,
        &state.coin_balance,
        &state.token_balance,
        multiplier,
    )?;
    let rate = Rate::of(&amount, cash_in, token_decimals);
    Ok(Quote { amount, rate })
}

/// Cash received for paying `token_in` into the pool.
pub fn token_to_cash(
    token_in: &BigUint,
    state: &PoolState,
    multiplier: u64,
    cash_decimals: u32,
) -> eyre::Result<Quote> {
    let amount = swap_output(
        token_in,
        &state.token_balance,
        &state.coin_balance,
        multiplier,
    )?;
    let rate = Rate::of(&amount, token_in, cash_decimals);
    Ok(Quote { amount, rate })
}

/// Smallest cash payment that receives at least `token_out` tokens.
pub fn cash_for_token_out(
    token_out: &BigUint,
    state: &PoolState,
    multiplier: u64,
) -> eyre::Result<BigUint> {
    if state.coin_balance.is_zero() || *token_out >= state.token_balance {
        bail!(
            "pool with {} cannot pay out {token_out} tokens",
            state.token_balance
        );
    }
    if multiplier == 0 || multiplier > FEE_DENOMINATOR {
        bail!("fee multiplier {multiplier} outside (0, {FEE_DENOMINATOR}]");
    }

    let numerator = token_out * &state.coin_balance * FEE_DENOMINATOR;
    let denominator = (&state.token_balance - token_out) * multiplier;
    Ok(ceil_div(&numerator, &denominator))
}

/// Closed-form token amount that brings both pools to the same marginal price.
///
/// A starting estimate only, integer rounding means the neighbourhood can still beat it.
pub fn exact_arbitrage_tokens(
    source: &PoolState,
    source_multiplier: u64,
    target: &PoolState,
    target_multiplier: u64,
) -> eyre::Result<BigUint> {
    let a = &target.token_balance * &source.coin_balance * EXACT_SCALE;
    let b = &source.token_balance
        * &target.coin_balance
        * source_multiplier
        * target_multiplier;
    if b <= a {
        bail!("target does not price the token above the source");
    }

    let d = &source.coin_balance * EXACT_SCALE
        + &target.coin_balance * target_multiplier * FEE_DENOMINATOR;
    if d.is_zero() {
        bail!("degenerate reserves in both pools");
    }

    Ok((b - a) / d / 2u32)
}

pub(crate) fn ceil_div(numerator: &BigUint, denominator: &BigUint) -> BigUint {
    let quotient = numerator / denominator;
    if (&quotient * denominator) == *numerator {
        quotient
    } else {
        quotient + BigUint::one()
    }
}
