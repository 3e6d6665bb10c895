use crate::{config::Config, mongo::ReplSetMember, pods};
use k8s_openapi::api::core::v1::Pod;

/// The preferred member address for a pod: the stable DNS name when a headless
/// service is configured, the bare `ip:port` otherwise.
pub fn canonical_address(pod: &Pod, config: &Config) -> Option<String> {
    match &config.k8s_mongo_service_name {
        Some(service) => stable_dns_address(pod, service, config),
        None => pod_ip_address(pod, config),
    }
}

/// `{host}.{service}.{namespace}.svc.{clusterDomain}:{port}`, where host is
/// the pod's spec hostname when the spec subdomain matches the service, and
/// the pod name otherwise.
fn stable_dns_address(pod: &Pod, service: &str, config: &Config) -> Option<String> {
    let spec = pod.spec.as_ref();
    let hostname = spec.and_then(|s| s.hostname.as_deref());
    let subdomain = spec.and_then(|s| s.subdomain.as_deref());
    let host = match (hostname, subdomain) {
        (Some(hostname), Some(subdomain)) if subdomain == service => hostname,
        _ => pod.metadata.name.as_deref()?,
    };
    let namespace = pod
        .metadata
        .namespace
        .as_deref()
        .or(config.k8s_namespace.as_deref())?;
    Some(format!(
        "{host}.{service}.{namespace}.svc.{domain}:{port}",
        domain = config.k8s_cluster_domain,
        port = config.mongo_port
    ))
}

pub fn pod_ip_address(pod: &Pod, config: &Config) -> Option<String> {
    pods::pod_ip(pod).map(|ip| format!("{ip}:{port}", port = config.mongo_port))
}

/// A pod counts as already present in the replica set when the member is
/// recorded under either address form, or when the member's IP matches the
/// pod's. The last rule keeps a recycled pod IP from being added a second time
/// while the stale member is still aging out.
pub fn member_matches_pod(member: &ReplSetMember, pod: &Pod, config: &Config) -> bool {
    if member.ip.is_some() && member.ip.as_deref() == pods::pod_ip(pod) {
        return true;
    }
    if canonical_address(pod, config).is_some_and(|addr| addr == member.name) {
        return true;
    }
    pod_ip_address(pod, config).is_some_and(|addr| addr == member.name)
}
