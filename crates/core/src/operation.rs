//! Manager operations as the node encodes them in JSON.

use color_eyre::eyre::{self, bail};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{fees::OperationFee, state::Address};

/// One ordered, jointly signed list of operations.
pub type OperationGroup = Vec<Operation>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameters {
    pub entrypoint: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: String,
    pub source: Address,
    #[serde(with = "string_u64")]
    pub fee: u64,
    #[serde(with = "string_u64")]
    pub counter: u64,
    #[serde(with = "string_u64")]
    pub gas_limit: u64,
    #[serde(with = "string_u64")]
    pub storage_limit: u64,
    #[serde(default, with = "string_biguint")]
    pub amount: BigUint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,
}

impl Operation {
    /// Contract call with unset counter and fees, both are filled in right before submission.
    pub fn transaction(
        source: &Address,
        destination: &Address,
        amount: BigUint,
        entrypoint: &str,
        value: Value,
    ) -> Self {
        Self {
            kind: "transaction".to_string(),
            source: source.clone(),
            fee: 0,
            counter: 0,
            gas_limit: 0,
            storage_limit: 0,
            amount,
            destination: Some(destination.clone()),
            parameters: Some(Parameters {
                entrypoint: entrypoint.to_string(),
                value,
            }),
        }
    }

    pub fn is_call_to(&self, address: &Address, entrypoint: &str) -> bool {
        self.destination.as_ref() == Some(address)
            && self
                .parameters
                .as_ref()
                .is_some_and(|p| p.entrypoint == entrypoint)
    }
}

/// Numbers the operations sequentially starting at `counter`.
pub fn renumber(operations: &mut [Operation], counter: u64) {
    for (operation, counter) in operations.iter_mut().zip(counter..) {
        operation.counter = counter;
    }
}

/// Copies fee, gas and storage limits onto the operations index by index.
pub fn overlay_fees(operations: &mut [Operation], fees: &[OperationFee]) -> eyre::Result<()> {
    if operations.len() != fees.len() {
        bail!(
            "fee schedule for {} operations applied to a group of {}",
            fees.len(),
            operations.len()
        );
    }

    for (operation, fee) in operations.iter_mut().zip(fees) {
        operation.fee = fee.fee;
        operation.gas_limit = fee.gas;
        operation.storage_limit = fee.storage;
    }
    Ok(())
}

mod string_u64 {
    use serde::{Deserialize as _, Deserializer, Serializer, de::Error as _};

    pub(super) fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(D::Error::custom)
    }
}

mod string_biguint {
    use num_bigint::BigUint;
    use serde::{Deserialize as _, Deserializer, Serializer, de::Error as _};

    pub(super) fn serialize<S: Serializer>(
        value: &BigUint,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BigUint, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn make_call(counter: u64) -> Operation {
        let mut operation = Operation::transaction(
            &Address::from("tz1owner"),
            &Address::from("KT1pool"),
            BigUint::from(5u32),
            "default",
            json!({ "prim": "Unit" }),
        );
        operation.counter = counter;
        operation
    }

    #[test]
    fn decodes_node_json() {
        let raw = json!({
            "kind": "transaction",
            "source": "tz1rival",
            "fee": "2950",
            "counter": "1001",
            "gas_limit": "26000",
            "storage_limit": "257",
            "amount": "1000000",
            "destination": "KT1pool",
            "parameters": { "entrypoint": "tezToTokenPayment", "value": { "int": "1" } }
        });

        let operation: Operation = serde_json::from_value(raw).unwrap();
        assert_eq!(operation.fee, 2950);
        assert_eq!(operation.gas_limit, 26_000);
        assert_eq!(operation.amount, BigUint::from(1_000_000u32));
        assert!(operation.is_call_to(&Address::from("KT1pool"), "tezToTokenPayment"));
    }

    #[test]
    fn reveal_without_call_fields_decodes() {
        let raw = json!({
            "kind": "reveal",
            "source": "tz1rival",
            "fee": "374",
            "counter": "1000",
            "gas_limit": "1100",
            "storage_limit": "0",
            "public_key": "edpk..."
        });

        let operation: Operation = serde_json::from_value(raw).unwrap();
        assert!(operation.parameters.is_none());
        assert!(operation.destination.is_none());
    }

    #[test]
    fn encodes_numbers_as_strings() {
        let encoded = serde_json::to_value(make_call(7)).unwrap();
        assert_eq!(encoded["counter"], json!("7"));
        assert_eq!(encoded["amount"], json!("5"));
    }

    #[test]
    fn renumbers_from_counter() {
        let mut group = vec![make_call(0), make_call(0), make_call(0)];
        renumber(&mut group, 41);

        let counters: Vec<_> = group.iter().map(|o| o.counter).collect();
        assert_eq!(counters, vec![41, 42, 43]);
    }

    #[test]
    fn overlay_requires_matching_length() {
        let mut group = vec![make_call(1), make_call(2)];
        let fees = [OperationFee {
            fee: 1,
            gas: 2,
            storage: 3,
        }];
        assert!(overlay_fees(&mut group, &fees).is_err());

        let fees = [fees[0].clone(), fees[0].clone()];
        overlay_fees(&mut group, &fees).unwrap();
        assert!(group.iter().all(|o| o.fee == 1 && o.gas_limit == 2 && o.storage_limit == 3));
    }
}
