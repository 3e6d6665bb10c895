use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    /// Seconds to sleep between the end of one reconcile tick and the next.
    pub loop_sleep_seconds: u64,
    /// Seconds past a member's last received heartbeat before an unhealthy
    /// member is removed from the replica set.
    pub unhealthy_seconds: i64,
    pub mongo_port: u16,
    /// Admin database used to dispatch replica set commands.
    pub mongo_database: String,
    /// Headless service fronting the MongoDB pods. When set, members are
    /// addressed by their stable DNS names instead of pod IPs.
    pub k8s_mongo_service_name: Option<String>,
    pub k8s_cluster_domain: String,
    /// Namespace to list pods in. Defaults to the pod's own namespace.
    pub k8s_namespace: Option<String>,
    pub k8s_pod_label_selector: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            loop_sleep_seconds: from_env_default("LOOP_SLEEP_SECONDS", "5")
                .parse()
                .unwrap_or(5),
            unhealthy_seconds: from_env_default("UNHEALTHY_SECONDS", "15")
                .parse()
                .unwrap_or(15),
            mongo_port: from_env_default("MONGO_PORT", "27017").parse().unwrap_or(27017),
            mongo_database: from_env_default("MONGO_DATABASE", "admin"),
            k8s_mongo_service_name: non_empty(env::var("K8S_MONGO_SERVICE_NAME").ok()),
            k8s_cluster_domain: from_env_default("K8S_CLUSTER_DOMAIN", "cluster.local"),
            k8s_namespace: non_empty(env::var("K8S_NAMESPACE").ok()),
            k8s_pod_label_selector: from_env_default("K8S_POD_LABEL_SELECTOR", "role=mongo"),
        }
    }
}

/// source a variable from environment - use default if not exists
fn from_env_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
