use crate::{
    address,
    config::Config,
    election,
    identity::{self, HostIdentity},
    mongo::{self, MongoAdmin, ReplSetMember, ReplicaSetAdmin, StatusOutcome},
    pods, Error, Result,
};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use tracing::{debug, info, warn};

/// One reconcile pass: observe the pod set and the local server's view of the
/// replica set, classify, and drive membership toward the pod set. Errors are
/// returned to the loop driver, which logs them and schedules the next tick.
pub async fn reconcile_tick(client: &Client, config: &Config) -> Result<()> {
    let identity = identity::host_identity();
    let all_pods = pods::list_mongo_pods(client, config).await?;
    let running = pods::running_pods(&all_pods);
    if running.is_empty() {
        info!(
            "no running pods matched selector {}, skipping tick",
            config.k8s_pod_label_selector
        );
        return Ok(());
    }
    let admin = MongoAdmin::connect_local(config).await?;
    let outcome = run_state_machine(&admin, &running, config, identity).await;
    admin.shutdown().await;
    outcome
}

async fn run_state_machine(
    admin: &impl ReplicaSetAdmin,
    running: &[Pod],
    config: &Config,
    identity: &HostIdentity,
) -> Result<()> {
    match admin.get_status().await? {
        StatusOutcome::InReplSet(status) => {
            match status
                .members
                .iter()
                .find(|m| m.state == mongo::MEMBER_STATE_PRIMARY)
            {
                Some(primary) if primary.is_self => {
                    debug!("in replica set as primary");
                    primary_work(admin, running, &status.members, config, false).await
                }
                Some(primary) => {
                    debug!("in replica set, primary is {}", primary.name);
                    Ok(())
                }
                None => {
                    if election::is_elected(running, identity.ip) {
                        warn!("replica set has no primary, reconfiguring as elected member");
                        primary_work(admin, running, &status.members, config, true).await
                    } else {
                        debug!("replica set has no primary, awaiting the elected member");
                        Ok(())
                    }
                }
            }
        }
        StatusOutcome::NotYetInitialized => initialize(admin, running, config, identity).await,
        StatusOutcome::InvalidConfig => {
            // The server no longer reports members, so the diff runs against
            // an empty set and re-adds every running pod. This can lose data;
            // availability wins here, and only for the elected member.
            if election::is_elected(running, identity.ip) {
                warn!("replica set config is invalid, force reconfiguring as elected member");
                primary_work(admin, running, &[], config, true).await
            } else {
                debug!("replica set config is invalid, awaiting the elected member");
                Ok(())
            }
        }
    }
}

/// Add missing pods and drop members that have been unhealthy for longer than
/// the configured threshold, in one reconfigure call.
async fn primary_work(
    admin: &impl ReplicaSetAdmin,
    running: &[Pod],
    members: &[ReplSetMember],
    config: &Config,
    force: bool,
) -> Result<()> {
    let changes = membership_changes(running, members, config, Utc::now());
    if changes.is_empty() {
        debug!("replica set membership matches the pod set");
        return Ok(());
    }
    info!(
        "reconfiguring replica set, additions: {:?}, removals: {:?}, force: {}",
        changes.additions, changes.removals, force
    );
    admin
        .reconfigure(&changes.additions, &changes.removals, force)
        .await
}

/// No replica set exists on this server yet. Probe every running pod first:
/// any peer already in a set means a reconcile is underway elsewhere and this
/// pod will be absorbed through the add path. Otherwise the elected member
/// initiates with itself as the only member.
async fn initialize(
    admin: &impl ReplicaSetAdmin,
    running: &[Pod],
    config: &Config,
    identity: &HostIdentity,
) -> Result<()> {
    let peer_addresses: Vec<String> = running
        .iter()
        .filter_map(|pod| address::pod_ip_address(pod, config))
        .collect();
    let probes = peer_addresses
        .iter()
        .map(|addr| mongo::is_in_repl_set(addr, config));
    let peers_in_set = try_join_all(probes).await?;
    let elected = election::is_elected(running, identity.ip);
    if !should_initiate(&peers_in_set, elected) {
        if peers_in_set.contains(&true) {
            info!("a peer already belongs to a replica set, waiting to be added");
        } else {
            debug!("replica set not initialized, awaiting the elected member");
        }
        return Ok(());
    }
    let winner = election::elected_pod(running)
        .ok_or_else(|| Error::PodError("no pod with an IPv4 address to elect".to_string()))?;
    let primary_address =
        address::canonical_address(winner, config).unwrap_or_else(|| identity.address());
    info!("initiating replica set with primary {}", primary_address);
    admin.initiate(&primary_address).await
}

/// Initiation is safe only when no probed peer reports membership and this
/// instance won the election; anything else defers to another tick.
fn should_initiate(peers_in_set: &[bool], elected: bool) -> bool {
    !peers_in_set.contains(&true) && elected
}

#[derive(Debug, Default, PartialEq)]
struct MembershipChanges {
    additions: Vec<String>,
    removals: Vec<String>,
}

impl MembershipChanges {
    fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }
}

/// Diff the desired membership (running pods) against the reported members.
/// Removal applies only to unhealthy members whose last heartbeat is strictly
/// older than the threshold, under whichever name the server records them.
fn membership_changes(
    running: &[Pod],
    members: &[ReplSetMember],
    config: &Config,
    now: DateTime<Utc>,
) -> MembershipChanges {
    let mut changes = MembershipChanges::default();
    for pod in running {
        if members
            .iter()
            .any(|member| address::member_matches_pod(member, pod, config))
        {
            continue;
        }
        if let Some(addr) = address::canonical_address(pod, config) {
            changes.additions.push(addr);
        }
    }
    for member in members {
        if member.health != 0.0 {
            continue;
        }
        let Some(last_heartbeat) = member.last_heartbeat_recv else {
            continue;
        };
        let stale_for = (now - last_heartbeat.to_chrono()).num_seconds();
        if stale_for > config.unhealthy_seconds {
            changes.removals.push(member.name.clone());
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration;
    use mongodb::bson;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records reconfigure calls instead of talking to a server.
    struct FakeAdmin {
        reconfigures: Mutex<Vec<(Vec<String>, Vec<String>, bool)>>,
    }

    impl FakeAdmin {
        fn new() -> Self {
            Self {
                reconfigures: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ReplicaSetAdmin for FakeAdmin {
        async fn get_status(&self) -> crate::Result<StatusOutcome> {
            unreachable!("primary work never reads status");
        }

        async fn initiate(&self, _primary_address: &str) -> crate::Result<()> {
            unreachable!("primary work never initiates");
        }

        async fn reconfigure(
            &self,
            additions: &[String],
            removals: &[String],
            force: bool,
        ) -> crate::Result<()> {
            self.reconfigures
                .lock()
                .unwrap()
                .push((additions.to_vec(), removals.to_vec(), force));
            Ok(())
        }
    }

    fn config(service_name: Option<&str>) -> Config {
        Config {
            loop_sleep_seconds: 5,
            unhealthy_seconds: 30,
            mongo_port: 27017,
            mongo_database: "admin".to_string(),
            k8s_mongo_service_name: service_name.map(str::to_string),
            k8s_cluster_domain: "cluster.local".to_string(),
            k8s_namespace: None,
            k8s_pod_label_selector: "role=mongo".to_string(),
        }
    }

    fn pod(name: &str, ip: &str) -> Pod {
        serde_json::from_value(json!({
            "metadata": { "name": name, "namespace": "db" },
            "spec": { "hostname": name, "subdomain": "mongo", "containers": [] },
            "status": { "phase": "Running", "podIP": ip },
        }))
        .unwrap()
    }

    fn member(name: &str, ip: Option<&str>) -> ReplSetMember {
        ReplSetMember {
            id: 0,
            name: name.to_string(),
            state: 2,
            is_self: false,
            health: 1.0,
            last_heartbeat_recv: None,
            ip: ip.map(str::to_string),
        }
    }

    fn unhealthy_member(name: &str, stale_seconds: i64, now: DateTime<Utc>) -> ReplSetMember {
        ReplSetMember {
            health: 0.0,
            last_heartbeat_recv: Some(bson::DateTime::from_chrono(
                now - Duration::seconds(stale_seconds),
            )),
            ..member(name, None)
        }
    }

    #[test]
    fn test_no_changes_when_membership_matches() {
        let cfg = config(Some("mongo"));
        let running = vec![pod("mongo-0", "10.0.0.2"), pod("mongo-1", "10.0.0.3")];
        let members = vec![
            member("mongo-0.mongo.db.svc.cluster.local:27017", None),
            member("mongo-1.mongo.db.svc.cluster.local:27017", None),
        ];
        let changes = membership_changes(&running, &members, &cfg, Utc::now());
        assert!(changes.is_empty());
    }

    #[test]
    fn test_new_pod_added_under_stable_name() {
        let cfg = config(Some("mongo"));
        let running = vec![pod("mongo-0", "10.0.0.2"), pod("mongo-3", "10.0.0.5")];
        let members = vec![member("mongo-0.mongo.db.svc.cluster.local:27017", None)];
        let changes = membership_changes(&running, &members, &cfg, Utc::now());
        assert_eq!(
            changes.additions,
            vec!["mongo-3.mongo.db.svc.cluster.local:27017".to_string()]
        );
        assert!(changes.removals.is_empty());
    }

    #[test]
    fn test_unhealthy_member_removed_past_threshold() {
        let cfg = config(Some("mongo"));
        let now = Utc::now();
        let running = vec![pod("mongo-0", "10.0.0.2")];
        let members = vec![
            member("mongo-0.mongo.db.svc.cluster.local:27017", None),
            unhealthy_member("mongo-1.mongo.db.svc.cluster.local:27017", 40, now),
        ];
        let changes = membership_changes(&running, &members, &cfg, now);
        assert!(changes.additions.is_empty());
        assert_eq!(
            changes.removals,
            vec!["mongo-1.mongo.db.svc.cluster.local:27017".to_string()]
        );
    }

    #[test]
    fn test_removal_threshold_is_strict() {
        let cfg = config(Some("mongo"));
        let now = Utc::now();
        let running = vec![pod("mongo-0", "10.0.0.2")];
        let exactly_at = unhealthy_member("mongo-1.mongo.db.svc.cluster.local:27017", 30, now);
        let members = vec![
            member("mongo-0.mongo.db.svc.cluster.local:27017", None),
            exactly_at,
        ];
        let changes = membership_changes(&running, &members, &cfg, now);
        assert!(changes.removals.is_empty());
    }

    #[test]
    fn test_healthy_member_never_removed() {
        let cfg = config(Some("mongo"));
        let now = Utc::now();
        let running = vec![pod("mongo-0", "10.0.0.2")];
        let mut gone = member("mongo-9.mongo.db.svc.cluster.local:27017", None);
        gone.last_heartbeat_recv = Some(bson::DateTime::from_chrono(
            now - Duration::seconds(3600),
        ));
        let members = vec![member("mongo-0.mongo.db.svc.cluster.local:27017", None), gone];
        let changes = membership_changes(&running, &members, &cfg, now);
        assert!(changes.removals.is_empty());
    }

    #[test]
    fn test_recycled_ip_not_readded_while_stale_member_fresh() {
        // A new pod reuses the IP of a member that has not aged out yet. The
        // member.ip match suppresses the addition, and the member survives
        // until its heartbeat is past the threshold.
        let cfg = config(None);
        let now = Utc::now();
        let running = vec![pod("mongo-1", "10.0.0.4")];
        let mut stale = unhealthy_member("old-name:27017", 10, now);
        stale.ip = Some("10.0.0.4".to_string());
        let changes = membership_changes(&running, &[stale], &cfg, now);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_no_initiation_when_any_peer_in_set() {
        assert!(!should_initiate(&[false, true, false], true));
        assert!(!should_initiate(&[true], true));
    }

    #[test]
    fn test_initiation_requires_election_win() {
        assert!(should_initiate(&[false, false, false], true));
        assert!(!should_initiate(&[false, false, false], false));
    }

    #[tokio::test]
    async fn test_primary_work_performs_no_rpc_when_membership_matches() {
        let cfg = config(Some("mongo"));
        let running = vec![pod("mongo-0", "10.0.0.2")];
        let members = vec![member("mongo-0.mongo.db.svc.cluster.local:27017", None)];
        let admin = FakeAdmin::new();
        primary_work(&admin, &running, &members, &cfg, false)
            .await
            .unwrap();
        assert!(admin.reconfigures.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_primary_work_submits_one_reconfigure_with_both_sets() {
        let cfg = config(Some("mongo"));
        let now = Utc::now();
        let running = vec![pod("mongo-0", "10.0.0.2"), pod("mongo-2", "10.0.0.4")];
        let members = vec![
            member("mongo-0.mongo.db.svc.cluster.local:27017", None),
            unhealthy_member("mongo-1.mongo.db.svc.cluster.local:27017", 60, now),
        ];
        let admin = FakeAdmin::new();
        primary_work(&admin, &running, &members, &cfg, true)
            .await
            .unwrap();
        let calls = admin.reconfigures.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (additions, removals, force) = &calls[0];
        assert_eq!(
            additions,
            &vec!["mongo-2.mongo.db.svc.cluster.local:27017".to_string()]
        );
        assert_eq!(
            removals,
            &vec!["mongo-1.mongo.db.svc.cluster.local:27017".to_string()]
        );
        assert!(*force);
    }

    #[test]
    fn test_invalid_config_diff_readds_all_running_pods() {
        let cfg = config(Some("mongo"));
        let running = vec![pod("mongo-0", "10.0.0.2"), pod("mongo-1", "10.0.0.3")];
        let changes = membership_changes(&running, &[], &cfg, Utc::now());
        assert_eq!(
            changes.additions,
            vec![
                "mongo-0.mongo.db.svc.cluster.local:27017".to_string(),
                "mongo-1.mongo.db.svc.cluster.local:27017".to_string(),
            ]
        );
        assert!(changes.removals.is_empty());
    }
}
