//! Creation-priority weights. Lower applies first; pruning walks the reverse.

/// Weight assigned to kinds not listed below (custom resources, mostly).
pub const DEFAULT_WEIGHT: i32 = 1000;

pub fn creation_weight(group: &str, kind: &str) -> i32 {
    match (group, kind) {
        ("apiextensions.k8s.io", "CustomResourceDefinition") => -100,
        ("", "Namespace") => 0,
        ("", "ResourceQuota") | ("", "LimitRange") => 5,
        ("", "ServiceAccount") => 10,
        ("rbac.authorization.k8s.io", "ClusterRole") => 20,
        ("rbac.authorization.k8s.io", "ClusterRoleBinding") => 21,
        ("rbac.authorization.k8s.io", "Role") => 22,
        ("rbac.authorization.k8s.io", "RoleBinding") => 23,
        ("", "Secret") => 30,
        ("", "ConfigMap") => 31,
        ("storage.k8s.io", "StorageClass") => 40,
        ("", "PersistentVolume") => 41,
        ("", "PersistentVolumeClaim") => 42,
        ("", "Service") => 50,
        ("apps", "DaemonSet") => 100,
        ("apps", "Deployment") => 101,
        ("apps", "StatefulSet") => 102,
        ("batch", "Job") => 110,
        ("batch", "CronJob") => 111,
        ("networking.k8s.io", "Ingress") => 150,
        ("networking.k8s.io", "NetworkPolicy") => 151,
        ("autoscaling", "HorizontalPodAutoscaler") => 160,
        ("policy", "PodDisruptionBudget") => 161,
        ("admissionregistration.k8s.io", "ValidatingWebhookConfiguration") => 500,
        ("admissionregistration.k8s.io", "MutatingWebhookConfiguration") => 501,
        _ => DEFAULT_WEIGHT,
    }
}

/// Kinds that never carry a namespace.
pub fn is_cluster_scoped(kind: &str) -> bool {
    matches!(
        kind,
        "Namespace"
            | "CustomResourceDefinition"
            | "ClusterRole"
            | "ClusterRoleBinding"
            | "PersistentVolume"
            | "StorageClass"
            | "PriorityClass"
            | "IngressClass"
            | "ValidatingWebhookConfiguration"
            | "MutatingWebhookConfiguration"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definitions_first_workloads_after_config() {
        let crd = creation_weight("apiextensions.k8s.io", "CustomResourceDefinition");
        let ns = creation_weight("", "Namespace");
        let cm = creation_weight("", "ConfigMap");
        let deploy = creation_weight("apps", "Deployment");
        let custom = creation_weight("example.com", "Widget");
        assert!(crd < ns && ns < cm && cm < deploy && deploy < custom);
    }

    #[test]
    fn kind_match_is_group_sensitive() {
        assert_eq!(creation_weight("example.com", "Deployment"), DEFAULT_WEIGHT);
    }
}
