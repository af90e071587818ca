use std::{collections::HashMap, time::Duration};

use color_eyre::eyre::{self, WrapErr as _, ensure};
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::{
    chain::Endpoints,
    fees::{FeeDerivation, FeeSplit},
    market::{Approvals, Market, Protocol, StoragePaths},
    state::Address,
    strategy::{self, Mode, Settings, Strategy},
    token::{Standard, Token},
};

pub const DEFAULT_CONFIG_PATH: &str = "mantis.yaml";
pub const CONFIG_PATH_VAR: &str = "MANTIS_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,

    /// Account every strategy trades from
    pub account: AccountConfig,

    /// Tokens by symbol
    pub tokens: HashMap<String, TokenConfig>,

    /// Markets by name
    pub markets: HashMap<String, MarketConfig>,

    pub strategies: Vec<StrategyConfig>,

    #[serde(default)]
    pub trading: TradingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// RPC endpoint reads and submissions default to
    pub primary: String,

    /// Endpoints read from on odd seconds
    #[serde(default)]
    pub alternates: Vec<String>,

    /// Remote signer URL
    pub signer: String,

    #[serde(default)]
    pub submit_to_alternates: bool,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub address: Address,
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub address: Address,
    pub decimals: u32,
    pub standard: Standard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    pub protocol: Protocol,
    pub pool: Address,

    /// Symbol of the traded token
    pub asset: String,

    /// Symbol of the token the asset is priced in
    pub cash: String,

    /// Fee multiplier out of 1000
    #[serde(default = "default_multiplier")]
    pub multiplier: u64,

    pub storage: StoragePaths,

    #[serde(default)]
    pub siblings: Vec<Address>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub source: String,
    pub target: String,

    /// Market converting between the source's and the target's cash
    #[serde(default)]
    pub cash_exchange: Option<String>,

    /// Also trade from target to source
    #[serde(default)]
    pub bidirectional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub minimum_arb: u64,
    pub market_refresh_interval_secs: u64,
    pub cooldown_secs: u64,
    pub submission_timeout_secs: u64,
    pub fee_extra: u64,
    pub gas_extra: u64,
    pub storage_extra: u64,
    pub rate_tolerance: u64,
    pub split_fee: FeeSplit,
    pub fee_derivation: FeeDerivation,
    pub mode: Mode,
    pub expiration_padding_secs: u64,

    /// Whole notional units held back when sizing the ladder from the balance
    pub ladder_reserve: u64,

    /// Allowance kept on the target pools as a decimal string, trades carry their own
    /// approvals when unset
    pub standing_allowance: Option<String>,

    pub liquidate_on_start: bool,
    /// Lets start-up liquidation sell on the source when the target pays less
    pub force_liquidation: bool,
    pub counter_hold_secs: u64,
    pub fee_override: u64,

    /// Other accounts run by this operator, their pending groups are never traded against
    pub sibling_addresses: Vec<Address>,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            minimum_arb: 500_000,
            market_refresh_interval_secs: 10,
            cooldown_secs: 15,
            submission_timeout_secs: 30,
            fee_extra: 2_000,
            gas_extra: 100,
            storage_extra: 30,
            rate_tolerance: 20,
            split_fee: FeeSplit::Proportion,
            fee_derivation: FeeDerivation::GasDescending,
            mode: Mode::Dynamic,
            expiration_padding_secs: 300,
            ladder_reserve: 5,
            standing_allowance: None,
            liquidate_on_start: false,
            force_liquidation: false,
            counter_hold_secs: 60,
            fee_override: 0,
            sibling_addresses: Vec::new(),
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_multiplier() -> u64 {
    997
}

impl NodeConfig {
    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            primary: self.primary.clone(),
            alternates: self.alternates.clone(),
            submit_to_alternates: self.submit_to_alternates,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl TradingConfig {
    pub fn market_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.market_refresh_interval_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn submission_timeout(&self) -> Duration {
        Duration::from_secs(self.submission_timeout_secs)
    }

    pub fn expiration_padding(&self) -> Duration {
        Duration::from_secs(self.expiration_padding_secs)
    }

    pub fn counter_hold(&self) -> Duration {
        Duration::from_secs(self.counter_hold_secs)
    }

    pub fn settings(&self) -> eyre::Result<Settings> {
        let standing_allowance = self
            .standing_allowance
            .as_deref()
            .map(|allowance| {
                allowance
                    .parse::<BigUint>()
                    .wrap_err_with(|| format!("invalid standing allowance `{allowance}`"))
            })
            .transpose()?;
        Ok(Settings {
            minimum_arb: self.minimum_arb,
            rate_tolerance: self.rate_tolerance,
            split_fee: self.split_fee,
            fee_derivation: self.fee_derivation,
            mode: self.mode,
            expiration_padding: self.expiration_padding(),
            fee_override: self.fee_override,
            approvals: if standing_allowance.is_some() {
                Approvals::Standing
            } else {
                Approvals::PerTrade
            },
            standing_allowance,
        })
    }
}

impl Config {
    /// `mantis.yaml`, or the file named by `MANTIS_CONFIG`, overridden by `MANTIS_` variables
    /// with `__` separating nested keys.
    pub fn figment() -> Figment {
        let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("MANTIS_").ignore(&["CONFIG"]).split("__"))
    }

    pub fn load() -> Result<Self, figment::Error> {
        Self::figment().extract()
    }

    pub fn resolve_tokens(&self) -> HashMap<String, Token> {
        self.tokens
            .iter()
            .map(|(symbol, config)| {
                let token = Token {
                    symbol: symbol.clone(),
                    address: config.address.clone(),
                    decimals: config.decimals,
                    standard: config.standard.clone(),
                };
                (symbol.clone(), token)
            })
            .collect()
    }

    pub fn resolve_market(&self, name: &str, tokens: &HashMap<String, Token>) -> eyre::Result<Market> {
        let config = self
            .markets
            .get(name)
            .ok_or_else(|| eyre::eyre!("market `{name}` is not configured"))?;
        let token = |symbol: &str| {
            tokens
                .get(symbol)
                .cloned()
                .ok_or_else(|| eyre::eyre!("token `{symbol}` of market `{name}` is not configured"))
        };

        Ok(Market {
            name: name.to_string(),
            protocol: config.protocol,
            pool: config.pool.clone(),
            asset: token(&config.asset)?,
            cash: token(&config.cash)?,
            multiplier: config.multiplier,
            storage: config.storage.clone(),
            siblings: config.siblings.clone(),
        })
    }

    /// One strategy per direction, bidirectional entries expand to both.
    pub fn build_strategies(&self) -> eyre::Result<Vec<Strategy>> {
        let tokens = self.resolve_tokens();
        let settings = self.trading.settings()?;

        let mut strategies = Vec::new();
        for config in &self.strategies {
            let mut directions = vec![(&config.source, &config.target)];
            if config.bidirectional {
                directions.push((&config.target, &config.source));
            }

            for (source, target) in directions {
                let cash_exchange = config
                    .cash_exchange
                    .as_deref()
                    .map(|name| self.resolve_market(name, &tokens))
                    .transpose()?;
                let strategy = strategy::Builder {
                    owner: self.account.address.clone(),
                    source: self.resolve_market(source, &tokens)?,
                    target: self.resolve_market(target, &tokens)?,
                    cash_exchange,
                    settings: settings.clone(),
                }
                .build()
                .wrap_err_with(|| format!("invalid strategy {source} -> {target}"))?;
                strategies.push(strategy);
            }
        }

        ensure!(!strategies.is_empty(), "no strategies configured");
        Ok(strategies)
    }
}
