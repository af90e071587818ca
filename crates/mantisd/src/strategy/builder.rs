use std::{sync::Arc, time::Duration};

use color_eyre::eyre;
use tokio_util::sync::CancellationToken;

use mantis_core::{
    chain::{ChainClient, CounterAllocator, Endpoints},
    state::Address,
    strategy::Strategy,
};

use super::{Handle, Worker};

/// Loop timing and start-up behavior shared by every strategy.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub poll_interval: Duration,
    pub cooldown: Duration,
    pub submission_timeout: Duration,
    pub fee_extra: u64,
    pub gas_extra: u64,
    pub storage_extra: u64,
    pub ladder_reserve: u64,
    pub liquidate_on_start: bool,
    pub force_liquidation: bool,
    /// Operator accounts whose pending groups are not rivals
    pub sibling_accounts: Vec<Address>,
}

pub struct Builder {
    pub strategy: Strategy,
    pub chain: Arc<dyn ChainClient>,
    pub endpoints: Endpoints,
    pub allocator: Arc<CounterAllocator>,
    pub settings: LoopSettings,
    pub shutdown_token: CancellationToken,
}

impl Builder {
    pub fn build(self) -> eyre::Result<Handle> {
        let Self {
            strategy,
            chain,
            endpoints,
            allocator,
            settings,
            shutdown_token,
        } = self;

        let name = strategy.to_string();
        let worker = Worker {
            strategy,
            chain,
            endpoints,
            allocator,
            settings,
            shutdown_token: shutdown_token.clone(),
        };

        let worker_handle = tokio::task::spawn(async move { worker.run().await });

        Ok(Handle {
            name,
            shutdown_token,
            worker_handle: Some(worker_handle),
        })
    }
}
