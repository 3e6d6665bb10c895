use crate::pods;
use k8s_openapi::api::core::v1::Pod;
use std::net::Ipv4Addr;

/// Every sidecar replica observes the same pod set and sorts it identically,
/// so at steady state exactly one replica considers itself elected. The sort
/// key is the 32-bit integer value of the pod IP; a textual sort would order
/// "10.0.0.10" before "10.0.0.9".
pub fn elected_pod(pods: &[Pod]) -> Option<&Pod> {
    pods.iter()
        .filter_map(|pod| parsed_pod_ip(pod).map(|ip| (u32::from(ip), pod)))
        .min_by_key(|(key, _)| *key)
        .map(|(_, pod)| pod)
}

/// True iff this instance owns the lowest pod IP among the given pods.
pub fn is_elected(pods: &[Pod], self_ip: Ipv4Addr) -> bool {
    elected_pod(pods).and_then(parsed_pod_ip) == Some(self_ip)
}

fn parsed_pod_ip(pod: &Pod) -> Option<Ipv4Addr> {
    pods::pod_ip(pod).and_then(|ip| ip.parse().ok())
}
