//! Fee bidding for operation groups.
//!
//! A group is priced in one of two ways. Split mode spreads a total fee over the operations.
//! Ratio mode prices every operation at a fee per gas unit derived from a rival's fee and gas,
//! capped by the profit the trade can give up.

use std::fmt::Display;

use color_eyre::eyre::{self, OptionExt as _, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Hard gas limit of one operation group.
pub const MAX_GROUP_GAS: u64 = 1_040_000;

/// Network minimum of one fee unit per ten gas units.
const MIN_GAS_PER_FEE: u64 = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationFee {
    pub fee: u64,
    pub gas: u64,
    pub storage: u64,
}

pub fn total_fee(group: &[OperationFee]) -> u64 {
    group.iter().map(|o| o.fee).sum()
}

pub fn total_gas(group: &[OperationFee]) -> u64 {
    group.iter().map(|o| o.gas).sum()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeSplit {
    /// Everything on the first operation.
    First,
    /// Equal shares, rounded up.
    Split,
    /// Shares by gas, rounded down.
    #[default]
    Proportion,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeDerivation {
    /// Trail the rival's ratio at the group's own gas.
    Minimum,
    GasAscending,
    #[default]
    GasDescending,
}

/// Fee per gas unit, held as an integer scaled by `10^decimals`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeRatio {
    scaled: u128,
    decimals: u32,
}

impl FeeRatio {
    pub fn new(scaled: u128, decimals: u32) -> Self {
        Self { scaled, decimals }
    }

    /// Truncated `fee / gas`, `None` for zero gas.
    pub fn of(fee: u64, gas: u64, decimals: u32) -> Option<Self> {
        let scaled = u128::from(fee) * scale(decimals);
        scaled
            .checked_div(u128::from(gas))
            .map(|scaled| Self { scaled, decimals })
    }

    pub fn scaled(&self) -> u128 {
        self.scaled
    }

    /// Fee for `gas` units at this ratio, rounded down.
    pub fn fee_for(&self, gas: u64) -> u64 {
        let fee = self.scaled * u128::from(gas) / scale(self.decimals);
        u64::try_from(fee).unwrap_or(u64::MAX)
    }

    fn fee_for_ceil(&self, gas: u64) -> u64 {
        let fee = (self.scaled * u128::from(gas)).div_ceil(scale(self.decimals));
        u64::try_from(fee).unwrap_or(u64::MAX)
    }
}

impl Display for FeeRatio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scale = scale(self.decimals);
        write!(
            f,
            "{}.{:0>width$}",
            self.scaled / scale,
            self.scaled % scale,
            width = self.decimals as usize
        )
    }
}

fn scale(decimals: u32) -> u128 {
    10u128.pow(decimals)
}

/// A ratio bid together with the gas and fee it was derived at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatioParameters {
    pub ratio: FeeRatio,
    pub gas: u64,
    pub fee: u64,
}

/// Spreads `fee` over the group according to `split`, keeping gas and storage.
pub fn apply_fee_split(
    group: &[OperationFee],
    split: FeeSplit,
    fee: u64,
) -> eyre::Result<Vec<OperationFee>> {
    if group.is_empty() {
        bail!("cannot split a fee over an empty group");
    }

    let fees: Vec<u64> = match split {
        FeeSplit::First => std::iter::once(fee)
            .chain(std::iter::repeat_n(0, group.len() - 1))
            .collect(),
        FeeSplit::Split => {
            let share = fee.div_ceil(group.len() as u64);
            vec![share; group.len()]
        }
        FeeSplit::Proportion => {
            let gas = total_gas(group);
            if gas == 0 {
                bail!("cannot split a fee by gas over a group without gas");
            }
            group
                .iter()
                .map(|o| {
                    let share = u128::from(o.gas) * u128::from(fee) / u128::from(gas);
                    u64::try_from(share).unwrap_or(u64::MAX)
                })
                .collect()
        }
    };

    Ok(group
        .iter()
        .zip(fees)
        .map(|(o, fee)| OperationFee { fee, ..o.clone() })
        .collect())
}

/// Prices every operation at `ratio` of its gas.
///
/// # Errors
/// Fails when an operation would pay less than the network minimum for its gas.
pub fn apply_fee_ratio(group: &[OperationFee], ratio: FeeRatio) -> eyre::Result<Vec<OperationFee>> {
    group
        .iter()
        .map(|o| {
            let fee = ratio.fee_for(o.gas);
            if o.gas > fee.saturating_mul(MIN_GAS_PER_FEE) {
                bail!(
                    "fee {fee} at ratio {ratio} is below the minimum for {} gas",
                    o.gas
                );
            }
            Ok(OperationFee { fee, ..o.clone() })
        })
        .collect()
}

/// Prices a group from a ratio bid.
///
/// When the bid carries a gas target, the first operation absorbs the difference so the group
/// totals that gas. A group that prices below the bid's fee has the shortfall added to its first
/// operation.
pub fn price_by_ratio(
    group: &[OperationFee],
    bid: &RatioParameters,
) -> eyre::Result<Vec<OperationFee>> {
    let mut group = group.to_vec();
    let (first, rest) = group
        .split_first_mut()
        .ok_or_eyre("cannot price an empty group")?;

    if bid.gas > 0 {
        let rest_gas = total_gas(rest);
        first.gas = bid.gas.checked_sub(rest_gas).ok_or_else(|| {
            eyre::eyre!("bid gas {} is below the {rest_gas} the group already needs", bid.gas)
        })?;
    }

    let mut priced = apply_fee_ratio(&group, bid.ratio)?;
    let proposed = total_fee(&priced);
    if proposed < bid.fee {
        let shortfall = bid.fee - proposed;
        priced[0].fee += shortfall;
        debug!(shortfall, "bumped ratio-priced fee");
    }
    Ok(priced)
}

/// Largest ratio, truncated to `decimals`, whose fee at `expected_gas` lands strictly below the
/// fee the rival's own ratio would pay there.
///
/// Returns `None` when no such ratio exists.
pub fn calc_fee_ratio(
    fee: u64,
    gas: u64,
    expected_gas: u64,
    decimals: u32,
) -> Option<RatioParameters> {
    let rival = FeeRatio::of(fee, gas, decimals)?;
    let boundary = rival.fee_for_ceil(expected_gas);
    if boundary == 0 || expected_gas == 0 {
        return None;
    }

    // largest r with ceil(r * expected_gas / scale) <= boundary - 1
    let scaled = u128::from(boundary - 1) * scale(decimals) / u128::from(expected_gas);
    let ratio = FeeRatio::new(scaled, decimals);

    Some(RatioParameters {
        ratio,
        gas: expected_gas,
        fee: ratio.fee_for_ceil(expected_gas),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasDirection {
    Ascending,
    Descending,
}

/// Search parameters of [`calc_gas_adjusted_ratio`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasWalk {
    pub decimals: u32,
    pub gas_increment: u64,
    pub ratio_offset: u128,
    pub direction: GasDirection,
}

impl Default for GasWalk {
    fn default() -> Self {
        Self {
            decimals: 10,
            gas_increment: 2,
            ratio_offset: 3,
            direction: GasDirection::Ascending,
        }
    }
}

/// Walks gas away from `expected_gas` (up from it, or down from the group gas limit) looking for
/// a gas amount at which the rival's truncated ratio yields a fee whose own ratio sits within
/// `ratio_offset` units of the rival's.
///
/// Returns `None` when the walk cannot stay below `boundary_fee`, so the returned fee is always
/// strictly below it.
pub fn calc_gas_adjusted_ratio(
    fee: u64,
    gas: u64,
    boundary_fee: u64,
    expected_gas: u64,
    walk: &GasWalk,
) -> Option<RatioParameters> {
    let GasWalk {
        decimals,
        gas_increment,
        ratio_offset,
        direction,
    } = *walk;

    let rival = FeeRatio::of(fee, gas, decimals)?;
    let target = rival.scaled as i128 - ratio_offset as i128;
    let ratio_at = |fee: u64, gas: u64| FeeRatio::of(fee, gas, decimals);

    let mut alt_gas = match direction {
        GasDirection::Ascending => expected_gas,
        GasDirection::Descending => MAX_GROUP_GAS,
    };
    let mut alt_fee = 0;
    let mut stepped = false;

    loop {
        let within = match direction {
            GasDirection::Ascending => alt_gas < MAX_GROUP_GAS,
            GasDirection::Descending => alt_gas > expected_gas,
        };
        if alt_fee >= boundary_fee || !within {
            break;
        }

        alt_gas = match direction {
            GasDirection::Ascending => alt_gas.saturating_add(gas_increment),
            GasDirection::Descending => alt_gas.saturating_sub(gas_increment),
        };
        alt_fee = rival.fee_for(alt_gas);
        stepped = true;

        match ratio_at(alt_fee, alt_gas) {
            Some(alt) if alt.scaled as i128 > target => break,
            Some(_) => {}
            None => break,
        }
    }

    if !stepped || alt_fee >= boundary_fee {
        return None;
    }

    Some(RatioParameters {
        ratio: ratio_at(alt_fee, alt_gas)?,
        gas: alt_gas,
        fee: alt_fee,
    })
}
