use std::fmt::Display;

use color_eyre::eyre::{self, OptionExt as _};
use num_bigint::BigUint;
use num_traits::CheckedSub as _;

/// Snapshot of a constant-product pool's reserves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolState {
    pub coin_balance: BigUint,
    pub token_balance: BigUint,
    pub liquidity_balance: BigUint,
}

impl PoolState {
    pub fn new(coin_balance: impl Into<BigUint>, token_balance: impl Into<BigUint>) -> Self {
        Self {
            coin_balance: coin_balance.into(),
            token_balance: token_balance.into(),
            liquidity_balance: BigUint::default(),
        }
    }

    /// Reserves after a pending buy pays `coin_in` into the pool and takes `token_out`.
    pub fn after_buy(&self, coin_in: &BigUint, token_out: &BigUint) -> eyre::Result<Self> {
        let token_balance = self
            .token_balance
            .checked_sub(token_out)
            .ok_or_eyre("projected buy drains more tokens than the pool holds")?;

        Ok(Self {
            coin_balance: &self.coin_balance + coin_in,
            token_balance,
            liquidity_balance: self.liquidity_balance.clone(),
        })
    }

    /// Reserves after a pending sell pays `token_in` into the pool and takes `coin_out`.
    pub fn after_sell(&self, token_in: &BigUint, coin_out: &BigUint) -> eyre::Result<Self> {
        let coin_balance = self
            .coin_balance
            .checked_sub(coin_out)
            .ok_or_eyre("projected sell drains more cash than the pool holds")?;

        Ok(Self {
            coin_balance,
            token_balance: &self.token_balance + token_in,
            liquidity_balance: self.liquidity_balance.clone(),
        })
    }
}

impl Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} cash / {} token",
            self.coin_balance, self.token_balance
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projections_do_not_touch_the_snapshot() {
        let state = PoolState::new(1_000u64, 5_000u64);

        let bought = state
            .after_buy(&BigUint::from(100u64), &BigUint::from(400u64))
            .unwrap();
        let sold = state
            .after_sell(&BigUint::from(400u64), &BigUint::from(100u64))
            .unwrap();

        assert_eq!(bought, PoolState::new(1_100u64, 4_600u64));
        assert_eq!(sold, PoolState::new(900u64, 5_400u64));
        assert_eq!(state, PoolState::new(1_000u64, 5_000u64));
    }

    #[test]
    fn overdrawn_projection_is_an_error() {
        let state = PoolState::new(10u64, 10u64);
        assert!(state
            .after_buy(&BigUint::from(1u64), &BigUint::from(11u64))
            .is_err());
        assert!(state
            .after_sell(&BigUint::from(1u64), &BigUint::from(11u64))
            .is_err());
    }
}
