use crate::{config::Config, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::{api::ListParams, Api, Client};
use tracing::debug;

const POD_PHASE_RUNNING: &str = "Running";

/// List the pods of the MongoDB workload in the configured namespace, matching
/// the configured label selector. No caching - every tick re-reads the cluster.
pub async fn list_mongo_pods(client: &Client, config: &Config) -> Result<Vec<Pod>> {
    let namespace = config
        .k8s_namespace
        .clone()
        .unwrap_or_else(|| client.default_namespace().to_string());
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let params = ListParams::default().labels(&config.k8s_pod_label_selector);
    let pod_list = pods.list(&params).await?;
    debug!(
        "found {} pods in {} matching {}",
        pod_list.items.len(),
        namespace,
        config.k8s_pod_label_selector
    );
    Ok(pod_list.items)
}

/// Only Running pods with an assigned IP participate in reconciliation.
pub fn running_pods(pods: &[Pod]) -> Vec<Pod> {
    pods.iter().filter(|p| is_running(p)).cloned().collect()
}

pub fn is_running(pod: &Pod) -> bool {
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    phase == Some(POD_PHASE_RUNNING) && pod_ip(pod).is_some()
}

pub fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.pod_ip.as_deref())
}
