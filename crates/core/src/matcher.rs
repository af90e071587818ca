//! Classification of pending operation groups against one market.
//!
//! Decoding a call is protocol specific and lives with each market. The scan around it is
//! shared: fees and gas accumulate over the whole group, approvals are skipped, and calls into
//! sibling pools mark the group as a rival arbitrage.

use std::fmt::Display;

use num_bigint::BigUint;

use crate::{operation::Operation, state::Address, token::Token};

/// A pending buy of the asset, as decoded from the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuyCall {
    pub coin_balance: BigUint,
    pub token_minimum: BigUint,
}

/// A pending sale of the asset, as decoded from the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SellCall {
    pub token_balance: BigUint,
    pub coin_minimum: BigUint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuyMatch {
    pub call: BuyCall,
    /// Fee paid by the whole group.
    pub fee: u64,
    /// Gas limit of the whole group.
    pub gas: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SellMatch {
    pub call: SellCall,
    pub fee: u64,
    pub gas: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationMatch {
    Buy(BuyMatch),
    Sell(SellMatch),
    NoBuy,
    NoSell,
    /// The buy is followed by a call into a sibling pool.
    BuyArb,
    /// The sale shares its group with a call into a sibling pool.
    SellArb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Buy,
    Sell,
    NoBuy,
    NoSell,
    BuyArb,
    SellArb,
}

impl OperationMatch {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Buy(_) | Self::Sell(_))
    }

    pub fn kind(&self) -> MatchKind {
        match self {
            Self::Buy(_) => MatchKind::Buy,
            Self::Sell(_) => MatchKind::Sell,
            Self::NoBuy => MatchKind::NoBuy,
            Self::NoSell => MatchKind::NoSell,
            Self::BuyArb => MatchKind::BuyArb,
            Self::SellArb => MatchKind::SellArb,
        }
    }
}

impl Display for MatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
            Self::NoBuy => "no_buy",
            Self::NoSell => "no_sell",
            Self::BuyArb => "buy_arb",
            Self::SellArb => "sell_arb",
        };
        write!(f, "{kind}")
    }
}

struct Scan<T> {
    /// Last decoded call and its position.
    call: Option<(usize, T)>,
    last_sibling: Option<usize>,
    fee: u64,
    gas: u64,
}

fn scan<T>(
    group: &[Operation],
    siblings: &[Address],
    approvals: &[&Token],
    decode: impl Fn(&Operation) -> Option<T>,
) -> Scan<T> {
    let mut scan = Scan {
        call: None,
        last_sibling: None,
        fee: 0,
        gas: 0,
    };

    for (i, operation) in group.iter().enumerate() {
        scan.fee = scan.fee.saturating_add(operation.fee);
        scan.gas = scan.gas.saturating_add(operation.gas_limit);

        if operation.parameters.is_none() {
            continue;
        }

        if operation
            .destination
            .as_ref()
            .is_some_and(|destination| siblings.contains(destination))
        {
            scan.last_sibling = Some(i);
            continue;
        }

        if approvals.iter().any(|t| t.match_approve_operation(operation)) {
            continue;
        }

        if let Some(call) = decode(operation) {
            scan.call = Some((i, call));
        }
    }

    scan
}

pub(crate) fn match_buy(
    group: &[Operation],
    siblings: &[Address],
    approvals: &[&Token],
    decode: impl Fn(&Operation) -> Option<BuyCall>,
) -> OperationMatch {
    let scan = scan(group, siblings, approvals, decode);
    let Some((position, call)) = scan.call else {
        return OperationMatch::NoBuy;
    };

    if scan.last_sibling.is_some_and(|sibling| sibling > position) {
        return OperationMatch::BuyArb;
    }

    OperationMatch::Buy(BuyMatch {
        call,
        fee: scan.fee,
        gas: scan.gas,
    })
}

pub(crate) fn match_sell(
    group: &[Operation],
    siblings: &[Address],
    approvals: &[&Token],
    decode: impl Fn(&Operation) -> Option<SellCall>,
) -> OperationMatch {
    let scan = scan(group, siblings, approvals, decode);
    let Some((_, call)) = scan.call else {
        return OperationMatch::NoSell;
    };

    // a sibling on either side means the sale is one leg of a rival's arbitrage
    if scan.last_sibling.is_some() {
        return OperationMatch::SellArb;
    }

    OperationMatch::Sell(SellMatch {
        call,
        fee: scan.fee,
        gas: scan.gas,
    })
}
