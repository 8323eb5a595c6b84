//! Human-readable summaries of what changed between two bundles.

use serde_json::Value;

use crate::bundle::Bundle;
use crate::bundle::fingerprint::semantic_body;

/// Changed paths listed per object before collapsing into a count.
const MAX_PATHS: usize = 3;

/// One line per differing object: `added`, `removed` or `changed ... field <path>`.
pub fn summarize(previous: Option<&Bundle>, current: &Bundle) -> String {
    let Some(previous) = previous else {
        return format!("initial release ({} objects)", current.len());
    };

    let mut lines = Vec::new();
    let mut refs = previous.refs();
    refs.extend(current.refs());

    for key in refs {
        match (previous.get(&key), current.get(&key)) {
            (None, Some(_)) => lines.push(format!("added {}", key)),
            (Some(_), None) => lines.push(format!("removed {}", key)),
            (Some(before), Some(after)) => {
                let mut paths = Vec::new();
                diff_paths(
                    &semantic_body(&before.body),
                    &semantic_body(&after.body),
                    String::new(),
                    &mut paths,
                );
                if paths.is_empty() {
                    continue;
                }
                let noun = if paths.len() == 1 { "field" } else { "fields" };
                let shown: Vec<&str> = paths.iter().take(MAX_PATHS).map(String::as_str).collect();
                let mut line = format!("changed {} {} {}", key, noun, shown.join(", "));
                if paths.len() > MAX_PATHS {
                    line.push_str(&format!(" (+{} more)", paths.len() - MAX_PATHS));
                }
                lines.push(line);
            }
            (None, None) => {}
        }
    }

    if lines.is_empty() {
        "no changes".to_string()
    } else {
        lines.join("\n")
    }
}

/// Collect dotted paths of leaves that differ between `a` and `b`.
fn diff_paths(a: &Value, b: &Value, path: String, out: &mut Vec<String>) {
    match (a, b) {
        (Value::Object(left), Value::Object(right)) => {
            let mut keys: Vec<&String> = left.keys().chain(right.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                match (left.get(key), right.get(key)) {
                    (Some(l), Some(r)) => diff_paths(l, r, child, out),
                    _ => out.push(child),
                }
            }
        }
        (Value::Array(left), Value::Array(right)) if left.len() == right.len() => {
            for (i, (l, r)) in left.iter().zip(right).enumerate() {
                diff_paths(l, r, format!("{}[{}]", path, i), out);
            }
        }
        _ if a != b => out.push(path),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{Kind, Manifest};
    use crate::labels::base_labels;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn deployment(image: &str, replicas: u32) -> Manifest {
        Manifest::new(Kind::Deployment, "default", "web", &base_labels("web"), &BTreeMap::new())
            .with_field(
                "spec",
                json!({
                    "replicas": replicas,
                    "template": {"spec": {"containers": [{"name": "web", "image": image}]}}
                }),
            )
    }

    fn bundle(objects: Vec<Manifest>) -> Bundle {
        let mut bundle = Bundle::new("web");
        for object in objects {
            bundle.insert(object).expect("insert");
        }
        bundle.seal();
        bundle
    }

    #[test]
    fn first_release_counts_objects() {
        let current = bundle(vec![deployment("web:1", 1)]);
        assert_eq!(summarize(None, &current), "initial release (1 objects)");
    }

    #[test]
    fn reports_changed_leaf_paths() {
        let before = bundle(vec![deployment("web:1", 1)]);
        let after = bundle(vec![deployment("web:2", 1)]);
        assert_eq!(
            summarize(Some(&before), &after),
            "changed Deployment/web field spec.template.spec.containers[0].image"
        );
    }

    #[test]
    fn reports_added_and_removed() {
        let config = Manifest::new(
            Kind::ConfigMap,
            "default",
            "web-config",
            &base_labels("web"),
            &BTreeMap::new(),
        );
        let before = bundle(vec![deployment("web:1", 1), config]);
        let after = bundle(vec![deployment("web:1", 3)]);
        let summary = summarize(Some(&before), &after);
        assert_eq!(
            summary,
            "removed ConfigMap/web-config\nchanged Deployment/web field spec.replicas"
        );
    }

    #[test]
    fn identical_bundles_have_no_changes() {
        let a = bundle(vec![deployment("web:1", 1)]);
        assert_eq!(summarize(Some(&a), &a.clone()), "no changes");
    }

    #[test]
    fn long_change_lists_are_capped() {
        let mut paths = Vec::new();
        diff_paths(
            &json!({"a": 1, "b": 1, "c": 1, "d": 1, "e": 1}),
            &json!({"a": 2, "b": 2, "c": 2, "d": 2, "e": 2}),
            String::new(),
            &mut paths,
        );
        assert_eq!(paths.len(), 5);

        let mut before = deployment("web:1", 1);
        before.body["spec"]["x"] = json!({"a": 1, "b": 1, "c": 1, "d": 1});
        let mut after = deployment("web:1", 1);
        after.body["spec"]["x"] = json!({"a": 2, "b": 2, "c": 2, "d": 2});
        let summary = summarize(Some(&bundle(vec![before])), &bundle(vec![after]));
        assert!(summary.ends_with("(+1 more)"), "got {summary}");
    }
}
