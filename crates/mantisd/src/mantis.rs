use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
    time::Duration,
};

use color_eyre::eyre::{self, WrapErr as _, eyre};
use futures::{FutureExt as _, future};
use tokio::{select, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use mantis_core::{
    chain::{ChainClient, CounterAllocator},
    config::Config,
};

use crate::{node, strategy};

/// Handle to the running service: one supervisor over every strategy loop of the account.
pub struct Mantis {
    shutdown_token: CancellationToken,
    strategies: Vec<String>,
    task: Option<JoinHandle<eyre::Result<()>>>,
}

impl Mantis {
    /// Starts a loop per configured strategy direction.
    ///
    /// # Errors
    /// Returns an error if the strategies or the node client cannot be built.
    pub fn spawn(cfg: Config) -> eyre::Result<Self> {
        let shutdown_token = CancellationToken::new();
        let supervisor = Supervisor::new(cfg, shutdown_token.child_token())?;
        let strategies = supervisor
            .strategy_handles
            .iter()
            .map(|handle| handle.name().to_string())
            .collect();
        let task = tokio::spawn(supervisor.run());

        Ok(Self {
            shutdown_token,
            strategies,
            task: Some(task),
        })
    }

    /// Names of the strategy loops started at spawn.
    pub fn strategies(&self) -> &[String] {
        &self.strategies
    }

    /// Cancels every strategy loop and waits for the supervisor to wind them down.
    ///
    /// # Errors
    /// Returns an error if the supervisor failed or panicked.
    pub async fn shutdown(mut self) -> eyre::Result<()> {
        self.shutdown_token.cancel();
        match self.task.take() {
            Some(task) => crate::flatten_join_result(task.await),
            None => Ok(()),
        }
    }
}

impl Future for Mantis {
    type Output = eyre::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let task = self
            .task
            .as_mut()
            .expect("mantis must not be polled after completion");

        let result = ready!(task.poll_unpin(cx));
        self.task = None;
        Poll::Ready(crate::flatten_join_result(result))
    }
}

struct Supervisor {
    shutdown_token: CancellationToken,
    client: Arc<node::Client>,
    public_key: String,
    strategy_handles: Vec<strategy::Handle>,
}

impl Supervisor {
    fn new(cfg: Config, shutdown_token: CancellationToken) -> eyre::Result<Self> {
        let strategies = cfg.build_strategies().wrap_err("failed to build strategies")?;
        info!(count = strategies.len(), "parsed strategies from config");

        let client = Arc::new(
            node::Client::new(
                &cfg.node.primary,
                &cfg.node.signer,
                cfg.account.address.clone(),
                cfg.node.request_timeout(),
            )
            .wrap_err("failed to set up node client")?,
        );

        // every loop trades from the same account
        let allocator = Arc::new(CounterAllocator::new(cfg.trading.counter_hold()));
        let trading = &cfg.trading;
        let settings = strategy::LoopSettings {
            poll_interval: trading.market_refresh_interval(),
            cooldown: trading.cooldown(),
            submission_timeout: trading.submission_timeout(),
            fee_extra: trading.fee_extra,
            gas_extra: trading.gas_extra,
            storage_extra: trading.storage_extra,
            ladder_reserve: trading.ladder_reserve,
            liquidate_on_start: trading.liquidate_on_start,
            force_liquidation: trading.force_liquidation,
            sibling_accounts: trading.sibling_addresses.clone(),
        };

        let strategy_handles = strategies
            .into_iter()
            .map(|strategy| {
                info!(%strategy, mode = ?strategy.settings.mode, "starting strategy loop");
                strategy::Builder {
                    strategy,
                    chain: client.clone() as Arc<dyn ChainClient>,
                    endpoints: cfg.node.endpoints(),
                    allocator: allocator.clone(),
                    settings: settings.clone(),
                    shutdown_token: shutdown_token.child_token(),
                }
                .build()
                .wrap_err("failed to start strategy loop")
            })
            .collect::<eyre::Result<Vec<_>>>()?;

        Ok(Self {
            shutdown_token,
            client,
            public_key: cfg.account.public_key,
            strategy_handles,
        })
    }

    async fn run(mut self) -> eyre::Result<()> {
        let reason = match self.client.signer().check_key(&self.public_key).await {
            Ok(()) => self.watch().await,
            Err(e) => Err(e).wrap_err("signer check failed"),
        };

        self.shutdown(reason).await
    }

    /// Runs until shutdown or until every strategy loop has exited.
    async fn watch(&mut self) -> eyre::Result<&'static str> {
        loop {
            if self.strategy_handles.is_empty() {
                break Err(eyre!("every strategy loop exited"));
            }

            let (result, index, _) = select! {
                biased;

                () = self.shutdown_token.cancelled() => break Ok("received shutdown signal"),

                finished = future::select_all(self.strategy_handles.iter_mut()) => finished,
            };

            let handle = self.strategy_handles.swap_remove(index);
            match result {
                Ok(()) => warn!(strategy = handle.name(), "strategy loop exited"),
                Err(e) => error!(strategy = handle.name(), error = ?e, "strategy loop failed"),
            }
        }
    }

    /// Winds down the remaining loops, the service fails if it stopped for any reason other
    /// than a shutdown request.
    #[instrument(skip_all)]
    async fn shutdown(mut self, reason: eyre::Result<&'static str>) -> eyre::Result<()> {
        const WAIT_BEFORE_ABORT: Duration = Duration::from_secs(25);

        // trigger the shutdown token in case it wasn't triggered yet
        self.shutdown_token.cancel();

        let message = format!(
            "waiting {} for all strategy loops to shutdown before aborting",
            humantime::format_duration(WAIT_BEFORE_ABORT)
        );
        match &reason {
            Ok(reason) => info!(%reason, message),
            Err(reason) => error!(?reason, message),
        };

        let shutdowns = future::join_all(self.strategy_handles.iter_mut().map(|handle| async move {
            if let Err(e) = handle.shutdown().await {
                error!(strategy = handle.name(), error = ?e, "strategy loop failed during shutdown");
            }
        }));
        if tokio::time::timeout(WAIT_BEFORE_ABORT, shutdowns).await.is_err() {
            warn!("strategy loops did not shut down in time, abandoning them");
        }

        reason.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn config() -> Config {
        let storage = json!({
            "coin_balance": "/args/1/args/0/int",
            "token_balance": "/args/1/args/1/int",
        });
        serde_json::from_value(json!({
            "node": {
                "primary": "http://127.0.0.1:1",
                "signer": "http://127.0.0.1:1",
                "request_timeout_secs": 1,
            },
            "account": { "address": "tz1owner", "public_key": "edpkowner" },
            "tokens": {
                "XTZ": { "address": "xtz", "decimals": 6, "standard": { "kind": "coin" } },
                "kUSD": { "address": "KT1kusd", "decimals": 18, "standard": { "kind": "tzip7" } },
            },
            "markets": {
                "quipu": {
                    "protocol": "quipu", "pool": "KT1quipu", "asset": "kUSD", "cash": "XTZ",
                    "storage": storage,
                },
                "vertex": {
                    "protocol": "vertex", "pool": "KT1vertex", "asset": "kUSD", "cash": "XTZ",
                    "storage": storage,
                },
            },
            "strategies": [{ "source": "quipu", "target": "vertex", "bidirectional": true }],
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn unreachable_signer_stops_the_service() {
        crate::telemetry::init_test_subscriber();

        let mantis = Mantis::spawn(config()).unwrap();
        assert_eq!(
            mantis.strategies(),
            ["quipu kUSD/XTZ -> vertex kUSD/XTZ", "vertex kUSD/XTZ -> quipu kUSD/XTZ"]
        );

        let err = mantis.await.unwrap_err();
        assert!(format!("{err:?}").contains("signer check failed"));
    }

    #[tokio::test]
    async fn missing_market_fails_spawn() {
        let mut cfg = config();
        cfg.strategies[0].target = "plenty".to_string();

        assert!(Mantis::spawn(cfg).is_err());
    }
}
