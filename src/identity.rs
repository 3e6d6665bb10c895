use crate::{Error, Result};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::OnceLock;

/// The identity of the pod this sidecar runs in, established once at startup.
/// Every reconcile tick reads it; a tick before initialization is a programming
/// error and panics.
#[derive(Clone, Debug)]
pub struct HostIdentity {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl HostIdentity {
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

static HOST_IDENTITY: OnceLock<HostIdentity> = OnceLock::new();

/// Resolve the pod's own IP from its hostname and record it for the lifetime
/// of the process. The kubelet sets HOSTNAME in every pod and publishes the
/// pod IP for it through /etc/hosts.
pub async fn init(mongo_port: u16) -> Result<&'static HostIdentity> {
    let hostname = std::env::var("HOSTNAME")
        .map_err(|_| Error::IdentityError("HOSTNAME is not set".to_string()))?;
    let addrs = tokio::net::lookup_host((hostname.as_str(), mongo_port))
        .await
        .map_err(|e| Error::IdentityError(format!("could not resolve {hostname}: {e}")))?;
    let ip = addrs
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| Error::IdentityError(format!("no IPv4 address for {hostname}")))?;

    let identity = HostIdentity {
        ip,
        port: mongo_port,
    };
    HOST_IDENTITY
        .set(identity)
        .map_err(|_| Error::IdentityError("host identity already initialized".to_string()))?;
    Ok(host_identity())
}

pub fn host_identity() -> &'static HostIdentity {
    HOST_IDENTITY
        .get()
        .expect("host identity read before initialization")
}
