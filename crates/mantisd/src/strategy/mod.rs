//! Strategy loops: poll the pools and the mempool, counter-trade what pays, cool down after
//! every submission.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
    time::SystemTime,
};

use color_eyre::eyre::{self, WrapErr as _};
use futures::FutureExt as _;
use num_bigint::BigUint;
use num_traits::Zero as _;
use tokio::{select, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use mantis_core::{
    chain::{ChainClient, CounterAllocator, CounterLease, Endpoints, Injection},
    operation::{self, Operation},
    search::NotionalLadder,
    state::Address,
    strategy::{self, BaselineFees, Calibration, Opportunity, Snapshot, Strategy},
    token::Standard,
};

pub use builder::{Builder, LoopSettings};
mod builder;

pub struct Handle {
    name: String,
    shutdown_token: CancellationToken,
    worker_handle: Option<JoinHandle<eyre::Result<()>>>,
}

impl Handle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn shutdown(&mut self) -> eyre::Result<()> {
        self.shutdown_token.cancel();
        match self.worker_handle.take() {
            Some(task) => crate::flatten_join_result(task.await),
            // already completed through the future
            None => Ok(()),
        }
    }
}

// Awaiting the handle deals with the Worker's result
impl Future for Handle {
    type Output = eyre::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let task = self
            .worker_handle
            .as_mut()
            .expect("strategy handle must not be polled after completion");

        let result = ready!(task.poll_unpin(cx));
        self.worker_handle = None;
        Poll::Ready(crate::flatten_join_result(result))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Idle,
    Submitted,
    CounterInUse,
    TimedOut,
}

struct Worker {
    strategy: Strategy,
    chain: Arc<dyn ChainClient>,
    endpoints: Endpoints,
    allocator: Arc<CounterAllocator>,
    settings: LoopSettings,
    shutdown_token: CancellationToken,
}

impl Worker {
    #[instrument(name = "strategy_worker", skip_all, fields(strategy = %self.strategy))]
    async fn run(self) -> eyre::Result<()> {
        info!("starting strategy worker");

        let calibration = select! {
            biased;

            () = self.shutdown_token.cancelled() => return Ok(()),

            calibration = self.init() => calibration.wrap_err("failed to initialize strategy")?,
        };

        loop {
            let outcome = select! {
                biased;

                () = self.shutdown_token.cancelled() => break,

                outcome = self.cycle(&calibration) => outcome,
            };

            let pause = match outcome {
                Ok(Outcome::Idle) => self.settings.poll_interval,
                Ok(outcome) => {
                    debug!(?outcome, "cooling down after submission");
                    self.settings.cooldown
                }
                Err(e) => {
                    warn!(error = ?e, "strategy cycle failed");
                    self.settings.poll_interval
                }
            };

            select! {
                biased;

                () = self.shutdown_token.cancelled() => break,

                () = tokio::time::sleep(pause) => {}
            }
        }

        info!("strategy worker received shutdown signal");
        Ok(())
    }

    async fn snapshot(&self) -> eyre::Result<Snapshot> {
        let cash_exchange = async {
            match &self.strategy.cash_exchange {
                Some(exchange) => self.chain.pool_state(&exchange.market).await.map(Some),
                None => Ok(None),
            }
        };

        let (source, target, cash_exchange) = tokio::try_join!(
            self.chain.pool_state(&self.strategy.source),
            self.chain.pool_state(&self.strategy.target),
            cash_exchange,
        )
        .wrap_err("failed to read pool states")?;

        Ok(Snapshot {
            source,
            target,
            cash_exchange,
        })
    }

    #[instrument(skip_all)]
    async fn init(&self) -> eyre::Result<Calibration> {
        let owner = &self.strategy.owner;
        let account = self
            .chain
            .account_state(owner)
            .await
            .wrap_err("failed to read account state")?;

        let notional = self.strategy.notional_token();
        let balance = if notional.is_native() {
            account.balance.clone()
        } else {
            match self.chain.token_balance(notional, owner).await {
                Ok(balance) => balance,
                Err(e) => {
                    warn!(error = %e, token = %notional, "failed to read notional balance, using the base ladder");
                    BigUint::zero()
                }
            }
        };
        let ladder = NotionalLadder::for_balance(&notional.unit(), &balance, self.settings.ladder_reserve);
        let padding = strategy::randomize_padding(self.settings.fee_extra, &mut rand::thread_rng());

        let snapshot = self.snapshot().await?;
        let probe = self
            .strategy
            .baseline_probe(&snapshot, account.next_counter(), SystemTime::now())?;
        let estimate = self
            .chain
            .estimate(&probe)
            .await
            .wrap_err("failed to estimate baseline group")?;
        let baseline = BaselineFees::from_estimate(
            &estimate,
            padding,
            self.settings.gas_extra,
            self.settings.storage_extra,
            self.strategy.settings.split_fee,
        )?;

        info!(
            %ladder,
            padding,
            fee_floor = baseline.fee_floor,
            gas_floor = baseline.gas_floor,
            "calibrated strategy"
        );

        if self.settings.liquidate_on_start {
            if let Err(e) = self.liquidate(&snapshot, account.next_counter()).await {
                warn!(error = ?e, "skipped liquidation");
            }
        }

        Ok(Calibration { ladder, baseline })
    }

    #[instrument(skip_all)]
    async fn cycle(&self, calibration: &Calibration) -> eyre::Result<Outcome> {
        let owner = &self.strategy.owner;
        let node = self.endpoints.query_node(SystemTime::now());
        let targets = self.strategy.targets();
        let mode = self.strategy.settings.mode;

        let ignore_sources: Vec<Address> = std::iter::once(owner.clone())
            .chain(self.settings.sibling_accounts.iter().cloned())
            .collect();
        let pending = async {
            if mode.watches_mempool() {
                self.chain
                    .pending_operations(node, &targets, &ignore_sources)
                    .await
            } else {
                Ok(Vec::new())
            }
        };
        let (account, snapshot, pending) =
            tokio::try_join!(self.chain.account_state(owner), self.snapshot(), pending)?;

        for group in &pending {
            match self.strategy.evaluate(group, &snapshot, calibration) {
                Ok(Some(opportunity)) => {
                    return self.trade(&opportunity, calibration, account.next_counter()).await;
                }
                Ok(None) => {}
                Err(e) => warn!(error = ?e, "failed to evaluate pending group"),
            }
        }

        if mode.checks_standing() {
            if let Some(opportunity) = self.strategy.standing_check(&snapshot, calibration)? {
                return self.trade(&opportunity, calibration, account.next_counter()).await;
            }
        }

        self.maintain_allowance(account.next_counter()).await
    }

    async fn trade(
        &self,
        opportunity: &Opportunity,
        calibration: &Calibration,
        observed_next: u64,
    ) -> eyre::Result<Outcome> {
        let lease = self.allocator.lease(observed_next).await;
        let group = self.strategy.build_arbitrage_group(
            opportunity,
            &calibration.baseline,
            lease.start(),
            SystemTime::now(),
        )?;

        info!(
            side = %opportunity.side,
            arb = %opportunity.arb,
            counter = lease.start(),
            "submitting arbitrage"
        );
        self.inject(lease, &group).await
    }

    async fn inject(&self, lease: CounterLease<'_>, group: &[Operation]) -> eyre::Result<Outcome> {
        let node = self.endpoints.submit_node(SystemTime::now());
        let submission = tokio::time::timeout(
            self.settings.submission_timeout,
            self.chain.submit(node, group),
        );

        let Ok(injection) = submission.await else {
            warn!(
                node,
                timeout = %humantime::format_duration(self.settings.submission_timeout),
                "submission timed out"
            );
            return Ok(Outcome::TimedOut);
        };

        match injection? {
            Injection::Accepted(hash) => {
                lease.commit(group.len() as u64);
                info!(%hash, node, "submitted operation group");
                Ok(Outcome::Submitted)
            }
            Injection::CounterInUse => {
                debug!(counter = lease.start(), "counter already used");
                Ok(Outcome::CounterInUse)
            }
        }
    }

    /// Fees from a fresh estimate, for groups other than the arbitrage itself.
    async fn price(&self, mut group: Vec<Operation>) -> eyre::Result<Vec<Operation>> {
        let estimate = self.chain.estimate(&group).await?;
        let fees = BaselineFees::from_estimate(
            &estimate,
            self.settings.fee_extra,
            self.settings.gas_extra,
            self.settings.storage_extra,
            self.strategy.settings.split_fee,
        )?;
        operation::overlay_fees(&mut group, &fees.group)?;
        Ok(group)
    }

    async fn maintain_allowance(&self, observed_next: u64) -> eyre::Result<Outcome> {
        let Some(wanted) = &self.strategy.settings.standing_allowance else {
            return Ok(Outcome::Idle);
        };
        let target = &self.strategy.target;
        // operator grants carry no amount to drift
        if !matches!(target.asset.standard, Standard::Tzip7) {
            return Ok(Outcome::Idle);
        }

        let current = match self
            .chain
            .token_allowance(&target.asset, &self.strategy.owner, &target.pool)
            .await
        {
            Ok(current) => current,
            Err(e) => {
                warn!(error = %e, "failed to read allowance, skipping maintenance");
                return Ok(Outcome::Idle);
            }
        };
        if current == *wanted {
            return Ok(Outcome::Idle);
        }

        info!(%current, %wanted, pool = %target.pool, "restoring standing allowance");
        let lease = self.allocator.lease(observed_next).await;
        let group = self
            .price(self.strategy.allowance_group(wanted, lease.start())?)
            .await
            .wrap_err("failed to price allowance group")?;
        self.inject(lease, &group).await
    }

    async fn liquidate(&self, snapshot: &Snapshot, observed_next: u64) -> eyre::Result<()> {
        let asset = &self.strategy.source.asset;
        let balance = self
            .chain
            .token_balance(asset, &self.strategy.owner)
            .await
            .wrap_err("failed to read asset balance")?;

        let lease = self.allocator.lease(observed_next).await;
        let Some(group) = self.strategy.plan_liquidation(
            &balance,
            snapshot,
            self.settings.force_liquidation,
            lease.start(),
            SystemTime::now(),
        )?
        else {
            debug!(%balance, "nothing to liquidate");
            return Ok(());
        };
        let group = self
            .price(group)
            .await
            .wrap_err("failed to price liquidation")?;

        info!(%balance, %asset, "liquidating asset balance");
        let outcome = self.inject(lease, &group).await?;
        debug!(?outcome, "liquidation finished");
        Ok(())
    }
}
