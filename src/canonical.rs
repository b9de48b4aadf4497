//! Canonical JSON encoding and receipt content hashing.
//!
//! The receipt hash backs idempotent emission: re-sending the same receipt
//! produces the same hash and dedupes against the unique `(tenant, hash)`
//! constraint. The encoding must therefore be deterministic: object keys
//! sorted, no insignificant whitespace, serde_json's number and string
//! escaping rules throughout. The sorted `parents` list is part of the hash
//! input; two discharges with identical bodies against different obligations
//! must not collide.

use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{Principal, ReceiptType};

/// Serialize a JSON value with recursively sorted object keys and compact
/// separators.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // serde_json::to_string on a str cannot fail
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar).unwrap_or_default()),
    }
}

fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    format!("{:x}", hasher.finalize())
}

/// Compute the content hash of a receipt from its identifying fields.
///
/// Input fields: receipt type, task and lease ids, from/to principals, the
/// sorted parents list, and a digest of the canonically encoded body. Full
/// 64-character hex SHA-256, no truncation.
pub fn receipt_hash(
    receipt_type: ReceiptType,
    task_id: Option<Uuid>,
    from: &Principal,
    to: &Principal,
    lease_id: Option<Uuid>,
    parents: &[Uuid],
    body: &Value,
) -> String {
    let body_canonical = canonical_json(body);
    let body_hash = sha256_hex(body_canonical.as_bytes());

    let mut sorted_parents: Vec<String> = parents.iter().map(|p| p.to_string()).collect();
    sorted_parents.sort();

    let data = serde_json::json!({
        "receipt_type": receipt_type.to_string(),
        "task_id": task_id.map(|id| id.to_string()),
        "from_kind": from.kind.to_string(),
        "from_id": from.id,
        "to_kind": to.kind.to_string(),
        "to_id": to.id,
        "lease_id": lease_id.map(|id| id.to_string()),
        "parents": sorted_parents,
        "body_hash": body_hash,
    });

    sha256_hex(canonical_json(&data).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let value = json!({"b": 1, "a": {"z": true, "m": [3, 1]}});
        assert_eq!(canonical_json(&value), r#"{"a":{"m":[3,1],"z":true},"b":1}"#);
    }

    #[test]
    fn canonical_json_is_key_order_independent() {
        let a: Value = serde_json::from_str(r#"{"x": 1, "y": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y": 2, "x": 1}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn canonical_json_has_no_insignificant_whitespace() {
        let value = json!({"k": [1, 2], "s": "a b"});
        assert_eq!(canonical_json(&value), r#"{"k":[1,2],"s":"a b"}"#);
    }

    #[test]
    fn hash_is_stable_for_identical_inputs() {
        let from = Principal::worker("w1");
        let to = Principal::agent("a1");
        let task_id = Uuid::new_v4();
        let body = json!({"result": {"ok": true}});

        let h1 = receipt_hash(ReceiptType::TaskCompleted, Some(task_id), &from, &to, None, &[], &body);
        let h2 = receipt_hash(ReceiptType::TaskCompleted, Some(task_id), &from, &to, None, &[], &body);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn hash_differs_when_only_parents_differ() {
        let from = Principal::worker("w1");
        let to = Principal::agent("a1");
        let task_id = Uuid::new_v4();
        let body = json!({"result": {}});

        let parent_a = Uuid::new_v4();
        let parent_b = Uuid::new_v4();
        let h_a = receipt_hash(
            ReceiptType::TaskCompleted,
            Some(task_id),
            &from,
            &to,
            None,
            &[parent_a],
            &body,
        );
        let h_b = receipt_hash(
            ReceiptType::TaskCompleted,
            Some(task_id),
            &from,
            &to,
            None,
            &[parent_b],
            &body,
        );
        assert_ne!(h_a, h_b);
    }

    #[test]
    fn hash_ignores_parent_ordering() {
        let from = Principal::worker("w1");
        let to = Principal::agent("a1");
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let body = json!({});

        let h_fwd = receipt_hash(ReceiptType::TaskFailed, None, &from, &to, None, &[p1, p2], &body);
        let h_rev = receipt_hash(ReceiptType::TaskFailed, None, &from, &to, None, &[p2, p1], &body);
        assert_eq!(h_fwd, h_rev);
    }

    #[test]
    fn hash_differs_across_receipt_types() {
        let from = Principal::worker("w1");
        let to = Principal::agent("a1");
        let body = json!({});
        let h1 = receipt_hash(ReceiptType::TaskProgress, None, &from, &to, None, &[], &body);
        let h2 = receipt_hash(ReceiptType::TaskResultReady, None, &from, &to, None, &[], &body);
        assert_ne!(h1, h2);
    }
}
