//! [`ChainClient`] over a node's JSON RPC.

use std::time::Duration;

use async_trait::async_trait;
use color_eyre::eyre::{self, OptionExt as _, WrapErr as _, bail};
use num_bigint::BigUint;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use mantis_core::{
    chain::{ChainClient, GroupEstimate, Injection, OperationResources},
    fees::MAX_GROUP_GAS,
    market::Market,
    operation::{Operation, OperationGroup},
    state::{AccountState, Address, PoolState},
    token::{Token, TokenView},
};

pub use signer::RemoteSigner;
mod signer;

/// Accepted by `run_operation`, which does not check signatures.
const DUMMY_SIGNATURE: &str =
    "edsigtXomBKi5CTRf5cjATJWSyaRvhfYNHqSUGrn4SdbYRcGwQrUGjzEfQDTuqHhuA8b2d8NarZjz8TRf65WkpQmo423BtomS8Q";
const ESTIMATE_STORAGE_LIMIT: u64 = 60_000;

const BASE_FEE: u64 = 100;
const SIGNATURE_BYTES: u64 = 64;

pub struct Client {
    http: reqwest::Client,
    primary: String,
    signer: RemoteSigner,
}

impl Client {
    pub fn new(
        primary: &str,
        signer_url: &str,
        owner: Address,
        request_timeout: Duration,
    ) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .wrap_err("failed to build http client")?;

        Ok(Self {
            signer: RemoteSigner::new(http.clone(), signer_url, owner),
            primary: primary.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn signer(&self) -> &RemoteSigner {
        &self.signer
    }

    async fn get<T: DeserializeOwned>(&self, node: &str, path: &str) -> eyre::Result<T> {
        let url = format!("{}{path}", node.trim_end_matches('/'));
        self.http
            .get(&url)
            .send()
            .await
            .wrap_err_with(|| format!("request to {url} failed"))?
            .error_for_status()?
            .json()
            .await
            .wrap_err_with(|| format!("failed to decode response of {url}"))
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        node: &str,
        path: &str,
        body: &B,
    ) -> eyre::Result<T> {
        let url = format!("{}{path}", node.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .wrap_err_with(|| format!("request to {url} failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("{url} returned {status}: {body}");
        }
        response
            .json()
            .await
            .wrap_err_with(|| format!("failed to decode response of {url}"))
    }

    async fn head_hash(&self, node: &str) -> eyre::Result<String> {
        self.get(node, "/chains/main/blocks/head/hash").await
    }

    async fn forge(&self, node: &str, branch: &str, group: &[Operation]) -> eyre::Result<String> {
        self.post(
            node,
            "/chains/main/blocks/head/helpers/forge/operations",
            &json!({ "branch": branch, "contents": group }),
        )
        .await
        .wrap_err("failed to forge operations")
    }

    #[instrument(skip_all, fields(contract = %view.contract, entrypoint = view.entrypoint))]
    async fn run_view(&self, view: TokenView, source: &Address) -> eyre::Result<Value> {
        let node = &self.primary;
        let chain_id: String = self.get(node, "/chains/main/chain_id").await?;
        let result: Value = self
            .post(
                node,
                "/chains/main/blocks/head/helpers/scripts/run_view",
                &json!({
                    "contract": view.contract,
                    "entrypoint": view.entrypoint,
                    "input": view.input,
                    "chain_id": chain_id,
                    "source": source,
                    "payer": source,
                    "unparsing_mode": "Readable",
                }),
            )
            .await
            .wrap_err("failed to run token view")?;

        result
            .get("data")
            .cloned()
            .ok_or_eyre("view result has no data")
    }
}

#[async_trait]
impl ChainClient for Client {
    async fn pool_state(&self, market: &Market) -> eyre::Result<PoolState> {
        let storage: Value = self
            .get(
                &self.primary,
                &format!("/chains/main/blocks/head/context/contracts/{}/storage", market.pool),
            )
            .await?;
        market.pool_state(&storage)
    }

    async fn pending_operations(
        &self,
        node: &str,
        targets: &[Address],
        ignore_sources: &[Address],
    ) -> eyre::Result<Vec<OperationGroup>> {
        let pending: Value = self.get(node, "/chains/main/mempool/pending_operations").await?;
        Ok(select_groups(&pending, targets, ignore_sources))
    }

    async fn account_state(&self, address: &Address) -> eyre::Result<AccountState> {
        let path = format!("/chains/main/blocks/head/context/contracts/{address}");
        let balance: String = self.get(&self.primary, &format!("{path}/balance")).await?;
        let counter: String = self.get(&self.primary, &format!("{path}/counter")).await?;

        Ok(AccountState {
            balance: balance
                .parse()
                .wrap_err_with(|| format!("invalid balance `{balance}`"))?,
            counter: counter
                .parse()
                .wrap_err_with(|| format!("invalid counter `{counter}`"))?,
        })
    }

    #[instrument(skip_all, fields(operations = group.len()))]
    async fn estimate(&self, group: &[Operation]) -> eyre::Result<GroupEstimate> {
        let node = &self.primary;
        let (branch, chain_id) = tokio::try_join!(
            self.head_hash(node),
            self.get::<String>(node, "/chains/main/chain_id"),
        )?;

        let gas_limit = MAX_GROUP_GAS / (group.len().max(1) as u64);
        let contents: Vec<Operation> = group
            .iter()
            .map(|operation| Operation {
                fee: 0,
                gas_limit,
                storage_limit: ESTIMATE_STORAGE_LIMIT,
                ..operation.clone()
            })
            .collect();

        let result: Value = self
            .post(
                node,
                "/chains/main/blocks/head/helpers/scripts/run_operation",
                &json!({
                    "operation": {
                        "branch": branch,
                        "contents": contents,
                        "signature": DUMMY_SIGNATURE,
                    },
                    "chain_id": chain_id,
                }),
            )
            .await
            .wrap_err("failed to simulate operations")?;
        let resources = parse_resources(&result)?;

        let forged = self.forge(node, &branch, &contents).await?;
        let gas = resources.iter().map(|r| r.gas).sum();
        let estimated_fee = minimum_fee(gas, forged.len() as u64 / 2);
        debug!(gas, estimated_fee, "estimated group");

        Ok(GroupEstimate {
            estimated_fee,
            resources,
        })
    }

    #[instrument(skip_all, fields(node = %node, operations = group.len()))]
    async fn submit(&self, node: &str, group: &[Operation]) -> eyre::Result<Injection> {
        let branch = self.head_hash(node).await?;
        let forged = self.forge(node, &branch, group).await?;
        let signature = self.signer.sign(&forged).await.wrap_err("failed to sign operations")?;
        let signed = format!("{forged}{}", hex::encode(signature));

        let url = format!("{}/injection/operation", node.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(&signed)
            .send()
            .await
            .wrap_err("failed to send injection")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if counter_in_use(&body) {
                return Ok(Injection::CounterInUse);
            }
            bail!("injection rejected with {status}: {body}");
        }

        let hash: String = response.json().await.wrap_err("failed to decode operation hash")?;
        Ok(Injection::Accepted(hash))
    }

    async fn token_balance(&self, token: &Token, owner: &Address) -> eyre::Result<BigUint> {
        let data = self.run_view(token.balance_view(owner)?, owner).await?;
        token.read_view(&data)
    }

    async fn token_allowance(
        &self,
        token: &Token,
        owner: &Address,
        spender: &Address,
    ) -> eyre::Result<BigUint> {
        let data = self.run_view(token.allowance_view(owner, spender)?, owner).await?;
        token.read_view(&data)
    }
}

/// Applied mempool groups with a call into `targets` from a source outside `ignore_sources`.
fn select_groups(pending: &Value, targets: &[Address], ignore_sources: &[Address]) -> Vec<OperationGroup> {
    let Some(applied) = pending.get("applied").and_then(Value::as_array) else {
        return Vec::new();
    };

    applied
        .iter()
        .filter_map(|entry| entry.get("contents").and_then(Value::as_array))
        .filter(|contents| {
            contents.iter().any(|operation| {
                let field = |name: &str| operation.get(name).and_then(Value::as_str);
                field("destination").is_some_and(|d| targets.iter().any(|t| t.as_str() == d))
                    && !field("source").is_some_and(|s| ignore_sources.iter().any(|i| i.as_str() == s))
            })
        })
        .map(|contents| {
            // consensus and other non-manager operations do not decode and carry no fees
            contents
                .iter()
                .filter_map(|operation| serde_json::from_value(operation.clone()).ok())
                .collect()
        })
        .collect()
}

fn parse_resources(result: &Value) -> eyre::Result<Vec<OperationResources>> {
    let contents = result
        .get("contents")
        .and_then(Value::as_array)
        .ok_or_eyre("simulation result has no contents")?;

    contents
        .iter()
        .enumerate()
        .map(|(i, operation)| {
            let metadata = operation
                .get("metadata")
                .ok_or_else(|| eyre::eyre!("operation {i} has no metadata"))?;
            let outcome = &metadata["operation_result"];
            if outcome["status"] != "applied" {
                bail!(
                    "operation {i} would fail with {}: {}",
                    outcome["status"],
                    outcome["errors"]
                );
            }

            let internal = metadata["internal_operation_results"]
                .as_array()
                .map(Vec::as_slice)
                .unwrap_or_default();
            let results = std::iter::once(outcome).chain(internal.iter().map(|r| &r["result"]));

            let (mut milligas, mut storage) = (0u64, 0u64);
            for result in results {
                milligas += numeric(&result["consumed_milligas"])?;
                storage += numeric(&result["paid_storage_size_diff"])?;
            }

            Ok(OperationResources {
                gas: milligas.div_ceil(1_000),
                storage,
            })
        })
        .collect()
}

/// Absent counts as zero, the node omits zero diffs.
fn numeric(value: &Value) -> eyre::Result<u64> {
    match value {
        Value::Null => Ok(0),
        Value::String(s) => s.parse().wrap_err_with(|| format!("invalid number `{s}`")),
        other => bail!("expected a numeric string, got {other}"),
    }
}

fn minimum_fee(gas: u64, forged_bytes: u64) -> u64 {
    BASE_FEE + gas.div_ceil(10) + forged_bytes + SIGNATURE_BYTES
}

fn counter_in_use(body: &str) -> bool {
    body.contains("counter_in_the_past") || body.contains("already used")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transaction(source: &str, destination: &str) -> Value {
        json!({
            "kind": "transaction",
            "source": source,
            "fee": "2950",
            "counter": "12",
            "gas_limit": "26000",
            "storage_limit": "100",
            "amount": "0",
            "destination": destination,
        })
    }

    #[test]
    fn selects_groups_touching_targets() {
        let pending = json!({
            "applied": [
                { "hash": "op1", "contents": [transaction("tz1rival", "KT1target")] },
                { "hash": "op2", "contents": [transaction("tz1rival", "KT1elsewhere")] },
                { "hash": "op3", "contents": [transaction("tz1owner", "KT1target")] },
                {
                    "hash": "op4",
                    "contents": [
                        { "kind": "reveal", "source": "tz1new", "fee": "300", "counter": "1",
                          "gas_limit": "1000", "storage_limit": "0", "public_key": "edpk" },
                        transaction("tz1new", "KT1target"),
                    ],
                },
                { "hash": "op5", "contents": [{ "kind": "attestation", "slot": 1 }] },
            ],
            "refused": [{ "hash": "op6", "contents": [transaction("tz1rival", "KT1target")] }],
        });

        let groups = select_groups(
            &pending,
            &[Address::from("KT1target")],
            &[Address::from("tz1owner")],
        );
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0][0].fee, 2_950);
        assert_eq!(groups[1].len(), 2);
        assert_eq!(groups[1][0].kind, "reveal");
    }

    #[test]
    fn missing_applied_is_empty() {
        assert!(select_groups(&json!({}), &[Address::from("KT1target")], &[]).is_empty());
    }

    #[test]
    fn resources_include_internal_results() {
        let result = json!({
            "contents": [
                { "metadata": { "operation_result": {
                    "status": "applied", "consumed_milligas": "1000001"
                } } },
                { "metadata": {
                    "operation_result": {
                        "status": "applied",
                        "consumed_milligas": "5200000",
                        "paid_storage_size_diff": "67"
                    },
                    "internal_operation_results": [
                        { "result": { "status": "applied", "consumed_milligas": "2100500" } },
                        { "result": { "status": "applied", "consumed_milligas": "100",
                                      "paid_storage_size_diff": "3" } }
                    ]
                } }
            ]
        });

        let resources = parse_resources(&result).unwrap();
        assert_eq!(
            resources,
            vec![
                OperationResources {
                    gas: 1_001,
                    storage: 0
                },
                OperationResources {
                    gas: 7_301,
                    storage: 70
                },
            ]
        );
    }

    #[test]
    fn failed_simulation_is_an_error() {
        let result = json!({
            "contents": [{ "metadata": { "operation_result": {
                "status": "failed",
                "errors": [{ "id": "proto.script_rejected" }]
            } } }]
        });

        let err = parse_resources(&result).unwrap_err();
        assert!(err.to_string().contains("script_rejected"));
    }

    #[test]
    fn fee_covers_gas_bytes_and_signature() {
        assert_eq!(minimum_fee(26_000, 200), 100 + 2_600 + 200 + 64);
        assert_eq!(minimum_fee(26_001, 200), 100 + 2_601 + 200 + 64);
    }

    #[test]
    fn recognizes_counter_races() {
        assert!(counter_in_use(
            r#"[{"kind":"temporary","id":"proto.018-Proxford.contract.counter_in_the_past"}]"#
        ));
        assert!(counter_in_use("counter 12 already used for contract tz1owner"));
        assert!(!counter_in_use(r#"[{"id":"proto.balance_too_low"}]"#));
    }
}
