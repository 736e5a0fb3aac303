use serde_json::Value as Json;

fn int(v: &Json, path: &[&str]) -> Option<i64> {
    path.iter().try_fold(v, |cur, k| cur.get(*k)).and_then(Json::as_i64)
}

fn has_condition(obj: &Json, kind: &str) -> bool {
    obj.pointer("/status/conditions")
        .and_then(Json::as_array)
        .map(|cs| cs.iter().any(|c| c["type"] == kind && c["status"] == "True"))
        .unwrap_or(false)
}

/// Kind-specific readiness of a live object. `None` for kinds without one.
pub fn readiness(kind: &str, obj: &Json) -> Option<bool> {
    let observed = || {
        let generation = int(obj, &["metadata", "generation"]).unwrap_or(0);
        int(obj, &["status", "observedGeneration"]).unwrap_or(generation) >= generation
    };
    match kind {
        "Deployment" | "StatefulSet" => {
            let want = int(obj, &["spec", "replicas"]).unwrap_or(1);
            let ready = int(obj, &["status", "readyReplicas"]).unwrap_or(0);
            Some(observed() && ready >= want)
        }
        "DaemonSet" => {
            let want = int(obj, &["status", "desiredNumberScheduled"]).unwrap_or(0);
            let ready = int(obj, &["status", "numberReady"]).unwrap_or(0);
            Some(observed() && ready >= want)
        }
        "Job" => Some(has_condition(obj, "Complete")),
        "PersistentVolumeClaim" => Some(obj.pointer("/status/phase").and_then(Json::as_str) == Some("Bound")),
        _ => None,
    }
}
