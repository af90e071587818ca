//! The chain as the engine sees it: a client for reads and submissions, node selection and
//! per-account counter allocation.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use color_eyre::eyre;
use num_bigint::BigUint;
use tokio::{
    sync::{Mutex, MutexGuard},
    time::Instant,
};
use tracing::debug;

use crate::{
    market::Market,
    operation::{Operation, OperationGroup},
    state::{AccountState, Address, PoolState},
    token::Token,
};

/// Gas and storage one operation consumed in simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResources {
    pub gas: u64,
    pub storage: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEstimate {
    /// Fee the node would charge for the whole group.
    pub estimated_fee: u64,
    pub resources: Vec<OperationResources>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Injection {
    /// Operation hash of the injected group.
    Accepted(String),
    /// The group's first counter was consumed by another submission.
    CounterInUse,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn pool_state(&self, market: &Market) -> eyre::Result<PoolState>;

    /// Groups pending on `node` that call any of `targets`, excluding groups sent by
    /// `ignore_sources`.
    async fn pending_operations(
        &self,
        node: &str,
        targets: &[Address],
        ignore_sources: &[Address],
    ) -> eyre::Result<Vec<OperationGroup>>;

    async fn account_state(&self, address: &Address) -> eyre::Result<AccountState>;

    async fn estimate(&self, group: &[Operation]) -> eyre::Result<GroupEstimate>;

    async fn submit(&self, node: &str, group: &[Operation]) -> eyre::Result<Injection>;

    async fn token_balance(&self, token: &Token, owner: &Address) -> eyre::Result<BigUint>;

    async fn token_allowance(
        &self,
        token: &Token,
        owner: &Address,
        spender: &Address,
    ) -> eyre::Result<BigUint>;
}

/// Node URLs a strategy reads from and submits to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub primary: String,
    pub alternates: Vec<String>,
    pub submit_to_alternates: bool,
}

impl Endpoints {
    fn rotate(&self, now: SystemTime) -> &str {
        let second = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if second % 2 == 0 || self.alternates.is_empty() {
            return &self.primary;
        }
        let index = (second % self.alternates.len() as u64) as usize;
        &self.alternates[index]
    }

    /// Even seconds read from the primary, odd seconds from an alternate.
    pub fn query_node(&self, now: SystemTime) -> &str {
        self.rotate(now)
    }

    pub fn submit_node(&self, now: SystemTime) -> &str {
        if self.submit_to_alternates {
            self.rotate(now)
        } else {
            &self.primary
        }
    }
}

#[derive(Debug)]
struct Committed {
    end: u64,
    at: Instant,
}

/// Hands out counters for one account to every loop trading from it.
///
/// A committed range is honored for `hold` after its submission, after that the counter
/// observed on chain is trusted again.
#[derive(Debug)]
pub struct CounterAllocator {
    hold: Duration,
    last: Mutex<Option<Committed>>,
}

impl CounterAllocator {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            last: Mutex::new(None),
        }
    }

    /// Waits for exclusive use of the account's counter.
    pub async fn lease(&self, observed_next: u64) -> CounterLease<'_> {
        let guard = self.last.lock().await;
        let start = match guard.as_ref() {
            Some(committed) if committed.at.elapsed() < self.hold => {
                observed_next.max(committed.end)
            }
            _ => observed_next,
        };
        if start != observed_next {
            debug!(observed_next, start, "skipping counters of a recent submission");
        }
        CounterLease { guard, start }
    }
}

/// Exclusive claim on the counters from [`CounterLease::start`], released on drop.
#[derive(Debug)]
pub struct CounterLease<'a> {
    guard: MutexGuard<'a, Option<Committed>>,
    start: u64,
}

impl CounterLease<'_> {
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Records that `len` counters were consumed by an accepted submission.
    pub fn commit(mut self, len: u64) {
        *self.guard = Some(Committed {
            end: self.start + len,
            at: Instant::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn endpoints(submit_to_alternates: bool) -> Endpoints {
        Endpoints {
            primary: "http://primary".to_string(),
            alternates: vec!["http://a".to_string(), "http://b".to_string(), "http://c".to_string()],
            submit_to_alternates,
        }
    }

    fn at(second: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(second)
    }

    #[test]
    fn query_node_alternates_by_parity() {
        let endpoints = endpoints(false);

        assert_eq!(endpoints.query_node(at(10)), "http://primary");
        assert_eq!(endpoints.query_node(at(11)), "http://c");
        assert_eq!(endpoints.query_node(at(13)), "http://b");
        assert_eq!(endpoints.submit_node(at(13)), "http://primary");
        assert_eq!(self::endpoints(true).submit_node(at(13)), "http://b");
    }

    #[test]
    fn no_alternates_always_primary() {
        let endpoints = Endpoints {
            primary: "http://primary".to_string(),
            alternates: vec![],
            submit_to_alternates: true,
        };

        assert_eq!(endpoints.query_node(at(11)), "http://primary");
        assert_eq!(endpoints.submit_node(at(11)), "http://primary");
    }

    #[tokio::test(start_paused = true)]
    async fn committed_range_is_skipped_within_hold() {
        let allocator = CounterAllocator::new(Duration::from_secs(60));

        let lease = allocator.lease(10).await;
        assert_eq!(lease.start(), 10);
        lease.commit(3);

        // chain has not caught up yet
        assert_eq!(allocator.lease(10).await.start(), 13);
        // chain is ahead of the last commit
        assert_eq!(allocator.lease(20).await.start(), 20);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(allocator.lease(10).await.start(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_lease_does_not_advance() {
        let allocator = CounterAllocator::new(Duration::from_secs(60));

        drop(allocator.lease(10).await);
        assert_eq!(allocator.lease(10).await.start(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_leases_never_overlap() {
        let allocator = Arc::new(CounterAllocator::new(Duration::from_secs(60)));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let allocator = allocator.clone();
                tokio::spawn(async move {
                    let lease = allocator.lease(100).await;
                    let start = lease.start();
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    lease.commit(2);
                    start
                })
            })
            .collect();

        let mut starts = Vec::new();
        for task in tasks {
            starts.push(task.await.unwrap());
        }
        starts.sort_unstable();
        assert_eq!(starts, vec![100, 102, 104, 106]);
    }
}
