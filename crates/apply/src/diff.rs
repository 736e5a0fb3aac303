//! Structural diffs between a rendered object and its live counterpart.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.adds == 0 && self.updates == 0 && self.removes == 0
    }
}

/// Drop server-populated fields that never appear in a rendered object.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        for k in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "selfLink"] {
            meta.remove(k);
        }
        if meta.get("annotations").and_then(Json::as_object).is_some_and(|a| a.is_empty()) {
            meta.remove("annotations");
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Count what applying `target` would change relative to `live`. Only fields
/// present in `target` are compared: server defaults on the live side are
/// not reported as removals.
pub fn diff_summary(target: &Json, live: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
            }
            (Json::Array(aa), Json::Array(bb)) => {
                for (x, y) in aa.iter().zip(bb) {
                    if x != y {
                        s.updates += 1;
                    }
                }
                if aa.len() > bb.len() {
                    s.adds += aa.len() - bb.len();
                }
                if bb.len() > aa.len() {
                    s.removes += bb.len() - aa.len();
                }
            }
            (Json::Null, _) => {}
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    match live {
        Json::Null => {
            if let Some(o) = target.as_object() {
                s.adds = o.len();
            }
        }
        _ => walk(target, live, &mut s),
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strip_noisy_prunes_server_fields() {
        let v = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "namespace": "ns",
                "managedFields": [ {"foo": "bar"} ],
                "resourceVersion": "123",
                "generation": 5,
                "uid": "abc",
                "creationTimestamp": "2020-01-01T00:00:00Z",
                "annotations": {}
            },
            "status": { "obs": true },
            "data": { "k": "v" }
        });
        let pruned = strip_noisy(v);
        let meta = pruned["metadata"].as_object().unwrap();
        assert_eq!(meta.len(), 2);
        assert!(!pruned.as_object().unwrap().contains_key("status"));
        assert_eq!(pruned["data"]["k"], "v");
    }

    #[test]
    fn counts_adds_updates_and_array_shrink() {
        let live = json!({ "a": 1, "b": { "x": 1, "defaulted": true }, "c": [1, 2, 3] });
        let target = json!({ "a": 2, "b": { "x": 1, "y": 2 }, "c": [1, 9], "d": true });
        let s = diff_summary(&target, &live);
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 1 });
    }

    #[test]
    fn missing_live_object_is_all_adds() {
        let target = json!({ "apiVersion": "v1", "kind": "ConfigMap", "data": {} });
        assert_eq!(diff_summary(&target, &Json::Null).adds, 3);
        assert!(diff_summary(&target, &target).is_empty());
    }
}
