//! Helpers for reading and building Micheline JSON call parameters.

use std::fmt::Display;

use num_bigint::BigUint;
use serde_json::{Value, json};

/// Reads an `{"int": "..."}` leaf at a JSON pointer such as `/args/0/args/1/int`.
pub fn int(value: &Value, pointer: &str) -> Option<BigUint> {
    value.pointer(pointer)?.as_str()?.parse().ok()
}

/// Reads a `{"string": "..."}` leaf at a JSON pointer.
pub fn string<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer)?.as_str()
}

/// Whether `value` starts with the given chain of `Left`/`Right` constructors, each nested in
/// the first argument of the previous one.
pub fn follows_branches(value: &Value, branches: &[&str]) -> bool {
    let mut node = value;
    for (depth, branch) in branches.iter().enumerate() {
        if node.get("prim").and_then(Value::as_str) != Some(*branch) {
            return false;
        }
        if depth + 1 < branches.len() {
            match node.pointer("/args/0") {
                Some(next) => node = next,
                None => return false,
            }
        }
    }
    true
}

pub fn pair(args: impl IntoIterator<Item = Value>) -> Value {
    json!({ "prim": "Pair", "args": args.into_iter().collect::<Vec<_>>() })
}

pub fn left(arg: Value) -> Value {
    json!({ "prim": "Left", "args": [arg] })
}

pub fn right(arg: Value) -> Value {
    json!({ "prim": "Right", "args": [arg] })
}

pub fn int_lit(n: impl Display) -> Value {
    json!({ "int": n.to_string() })
}

pub fn string_lit(s: impl Display) -> Value {
    json!({ "string": s.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_nested_leaves() {
        let value = pair([
            pair([int_lit(7), string_lit("tz1abc")]),
            int_lit(42),
        ]);

        assert_eq!(int(&value, "/args/0/args/0/int"), Some(BigUint::from(7u32)));
        assert_eq!(string(&value, "/args/0/args/1/string"), Some("tz1abc"));
        assert_eq!(int(&value, "/args/1/int"), Some(BigUint::from(42u32)));
        assert_eq!(int(&value, "/args/2/int"), None);
        assert_eq!(int(&value, "/args/0/args/1/string"), None);
    }

    #[test]
    fn branch_shapes() {
        let value = left(right(right(pair([int_lit(1), int_lit(2)]))));

        assert!(follows_branches(&value, &["Left", "Right", "Right"]));
        assert!(follows_branches(&value, &["Left", "Right"]));
        assert!(!follows_branches(&value, &["Right", "Left", "Left"]));
        assert!(!follows_branches(&value, &["Left", "Right", "Right", "Left"]));
    }
}
