//! Content hashing for bundles and objects.
//!
//! Hashes are SHA-256 over canonical JSON: object keys sorted, compact
//! separators, server-assigned and status fields removed, and kiln's own
//! hash annotations dropped so stamping does not change the result.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::bundle::{Bundle, Manifest};
use crate::labels::{FINGERPRINT_ANNOTATION, OBJECT_HASH_ANNOTATION};

const SERVER_METADATA: [&str; 6] = [
    "creationTimestamp",
    "resourceVersion",
    "uid",
    "generation",
    "managedFields",
    "selfLink",
];

/// Revision fingerprint of a whole bundle. Independent of map key order.
pub fn bundle_fingerprint(bundle: &Bundle) -> String {
    let mut hasher = Sha256::new();
    for manifest in bundle.iter() {
        hasher.update(manifest.object_ref().to_string().as_bytes());
        hasher.update(b"\n");
        hasher.update(canonical_json(&semantic_body(&manifest.body)).as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Hash of one object's semantic content.
pub fn object_hash(manifest: &Manifest) -> String {
    let canonical = canonical_json(&semantic_body(&manifest.body));
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Copy of `body` without status, server-assigned metadata or kiln hash
/// annotations.
pub fn semantic_body(body: &Value) -> Value {
    let mut value = body.clone();
    let Some(root) = value.as_object_mut() else {
        return value;
    };
    root.remove("status");

    if let Some(metadata) = root.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in SERVER_METADATA {
            metadata.remove(field);
        }
        let empty = match metadata.get_mut("annotations").and_then(Value::as_object_mut) {
            Some(annotations) => {
                annotations.remove(FINGERPRINT_ANNOTATION);
                annotations.remove(OBJECT_HASH_ANNOTATION);
                annotations.is_empty()
            }
            None => false,
        };
        if empty {
            metadata.remove("annotations");
        }
    }
    value
}

/// Compact JSON with object keys in sorted order.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&normalize(value)).unwrap_or_default()
}

fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut normalized = Map::new();
            for key in keys {
                if let Some(child) = map.get(key) {
                    normalized.insert(key.clone(), normalize(child));
                }
            }
            Value::Object(normalized)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Kind;
    use serde_json::json;

    fn manifest(body: Value) -> Manifest {
        Manifest::from_value(body).expect("valid manifest")
    }

    #[test]
    fn key_order_does_not_matter() {
        let a = manifest(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "x", "namespace": "default"},
            "data": {"A": "1", "B": "2"}
        }));
        let b = manifest(json!({
            "kind": "ConfigMap", "apiVersion": "v1",
            "data": {"B": "2", "A": "1"},
            "metadata": {"namespace": "default", "name": "x"}
        }));
        assert_eq!(object_hash(&a), object_hash(&b));
    }

    #[test]
    fn status_and_server_fields_are_ignored() {
        let rendered = manifest(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "default"},
            "spec": {"replicas": 2}
        }));
        let live = manifest(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {
                "name": "web", "namespace": "default",
                "resourceVersion": "42", "uid": "abc", "generation": 3,
                "creationTimestamp": "2024-01-01T00:00:00Z",
                "annotations": {"kiln.dev/fingerprint": "f", "kiln.dev/object-hash": "h"}
            },
            "spec": {"replicas": 2},
            "status": {"readyReplicas": 2}
        }));
        assert_eq!(rendered.kind, Kind::Deployment);
        assert_eq!(object_hash(&rendered), object_hash(&live));
    }

    #[test]
    fn content_change_changes_hash() {
        let a = manifest(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "x"}, "data": {"A": "1"}
        }));
        let b = manifest(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "x"}, "data": {"A": "2"}
        }));
        assert_ne!(object_hash(&a), object_hash(&b));
    }

    #[test]
    fn canonical_json_is_compact_and_sorted() {
        let value = json!({"b": [{"z": 1, "a": 2}], "a": null});
        assert_eq!(canonical_json(&value), r#"{"a":null,"b":[{"a":2,"z":1}]}"#);
    }
}
