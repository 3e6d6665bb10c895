use crate::{config::Config, Error, Result};
use async_trait::async_trait;
use mongodb::{
    bson,
    bson::{doc, Bson, Document},
    error::ErrorKind,
    options::ClientOptions,
    Client as MongoClient, Database,
};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

/// Member state code reported by replSetGetStatus for the primary.
pub const MEMBER_STATE_PRIMARY: i32 = 1;

/// This instance has no replica set configuration.
const CODE_NOT_YET_INITIALIZED: i32 = 94;
/// Configuration present but unrecoverable from the server's point of view.
const CODE_INVALID_REPLICA_SET_CONFIG: i32 = 93;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// One member of the replica set as reported by replSetGetStatus.
#[derive(Clone, Debug, Deserialize)]
pub struct ReplSetMember {
    #[serde(rename = "_id")]
    pub id: i32,
    pub name: String,
    pub state: i32,
    #[serde(rename = "self", default)]
    pub is_self: bool,
    #[serde(default = "full_health")]
    pub health: f64,
    #[serde(rename = "lastHeartbeatRecv", default)]
    pub last_heartbeat_recv: Option<bson::DateTime>,
    #[serde(default)]
    pub ip: Option<String>,
}

fn full_health() -> f64 {
    1.0
}

#[derive(Clone, Debug, Deserialize)]
pub struct ReplSetStatus {
    #[serde(default)]
    pub members: Vec<ReplSetMember>,
}

/// How the local server answered replSetGetStatus. Codes 93 and 94 are state
/// machine inputs, not errors; anything else surfaces as Err.
#[derive(Debug)]
pub enum StatusOutcome {
    InReplSet(ReplSetStatus),
    NotYetInitialized,
    InvalidConfig,
}

/// The replica set operations the reconciler drives. MongoAdmin is the live
/// implementation; tests substitute a fake.
#[async_trait]
pub trait ReplicaSetAdmin {
    async fn get_status(&self) -> Result<StatusOutcome>;
    async fn initiate(&self, primary_address: &str) -> Result<()>;
    async fn reconfigure(
        &self,
        additions: &[String],
        removals: &[String],
        force: bool,
    ) -> Result<()>;
}

/// Admin connection to the MongoDB server in this pod.
pub struct MongoAdmin {
    client: MongoClient,
    database: Database,
}

impl MongoAdmin {
    pub async fn connect_local(config: &Config) -> Result<Self> {
        let uri = format!("mongodb://127.0.0.1:{}", config.mongo_port);
        let client = direct_client(&uri).await?;
        let database = client.database(&config.mongo_database);
        Ok(Self { client, database })
    }

    /// Release the connection. Called on every tick exit path.
    pub async fn shutdown(self) {
        self.client.shutdown().await;
    }
}

#[async_trait]
impl ReplicaSetAdmin for MongoAdmin {
    async fn get_status(&self) -> Result<StatusOutcome> {
        match self.database.run_command(doc! { "replSetGetStatus": 1 }).await {
            Ok(reply) => {
                let status: ReplSetStatus = bson::from_document(reply)?;
                Ok(StatusOutcome::InReplSet(status))
            }
            Err(e) => match command_error_code(&e) {
                Some(CODE_NOT_YET_INITIALIZED) => Ok(StatusOutcome::NotYetInitialized),
                Some(CODE_INVALID_REPLICA_SET_CONFIG) => Ok(StatusOutcome::InvalidConfig),
                _ => Err(e.into()),
            },
        }
    }

    /// Initiate the replica set with a single member. The set name comes from
    /// the server's own command line; a mongod that was not started with
    /// --replSet cannot form a set at all.
    async fn initiate(&self, primary_address: &str) -> Result<()> {
        let reply = self.database.run_command(doc! { "getCmdLineOpts": 1 }).await?;
        let set_name = reply
            .get_document("parsed")
            .and_then(|parsed| parsed.get_document("replication"))
            .and_then(|replication| replication.get_str("replSetName"))
            .map_err(|_| {
                Error::ReplSetError("mongod was not started with --replSet".to_string())
            })?
            .to_string();
        let rs_config = doc! {
            "_id": set_name,
            "members": [{ "_id": 0, "host": primary_address }],
        };
        info!("initiating replica set: {}", rs_config);
        self.database
            .run_command(doc! { "replSetInitiate": rs_config })
            .await?;
        Ok(())
    }

    /// Apply additions and removals to the stored replica set config in a
    /// single replSetReconfig call. Splitting them could transiently drop
    /// quorum.
    async fn reconfigure(
        &self,
        additions: &[String],
        removals: &[String],
        force: bool,
    ) -> Result<()> {
        let reply = self.database.run_command(doc! { "replSetGetConfig": 1 }).await?;
        let current = reply
            .get_document("config")
            .map_err(|_| {
                Error::ReplSetError("replSetGetConfig reply carried no config".to_string())
            })?
            .clone();
        let updated = apply_membership_update(current, additions, removals);
        debug!("submitting replica set config: {}", updated);
        self.database
            .run_command(doc! { "replSetReconfig": updated, "force": force })
            .await?;
        Ok(())
    }
}

/// Rewrite the members array of a replica set config document: drop members
/// named in `removals`, append one member per addition with a fresh id above
/// every id ever used, and bump the config version. Hosts already present are
/// not appended twice.
fn apply_membership_update(
    mut config: Document,
    additions: &[String],
    removals: &[String],
) -> Document {
    let members = config.get_array("members").ok().cloned().unwrap_or_default();
    let mut kept = Vec::with_capacity(members.len() + additions.len());
    let mut hosts: HashSet<String> = HashSet::new();
    let mut max_id: i32 = -1;
    for member in members {
        let Bson::Document(member) = member else {
            continue;
        };
        if let Ok(id) = member.get_i32("_id") {
            max_id = max_id.max(id);
        }
        let host = member.get_str("host").unwrap_or_default().to_string();
        if removals.contains(&host) {
            continue;
        }
        hosts.insert(host);
        kept.push(Bson::Document(member));
    }
    let mut next_id = max_id + 1;
    for host in additions {
        if !hosts.insert(host.clone()) {
            continue;
        }
        kept.push(Bson::Document(doc! { "_id": next_id, "host": host.as_str() }));
        next_id += 1;
    }
    let version = config.get_i32("version").unwrap_or(0) + 1;
    config.insert("version", version);
    config.insert("members", kept);
    config
}

/// Ask a remote server whether it belongs to a replica set. Opens a
/// short-lived direct connection; NotYetInitialized means no, any other
/// failure propagates.
pub async fn is_in_repl_set(address: &str, config: &Config) -> Result<bool> {
    let client = direct_client(&format!("mongodb://{address}")).await?;
    let result = client
        .database(&config.mongo_database)
        .run_command(doc! { "replSetGetStatus": 1 })
        .await;
    client.shutdown().await;
    match result {
        Ok(_) => Ok(true),
        Err(e) if command_error_code(&e) == Some(CODE_NOT_YET_INITIALIZED) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn direct_client(uri: &str) -> Result<MongoClient> {
    let mut options = ClientOptions::parse(uri).await?;
    options.direct_connection = Some(true);
    options.connect_timeout = Some(CONNECT_TIMEOUT);
    options.server_selection_timeout = Some(CONNECT_TIMEOUT);
    Ok(MongoClient::with_options(options)?)
}

fn command_error_code(error: &mongodb::error::Error) -> Option<i32> {
    match *error.kind {
        ErrorKind::Command(ref command_error) => Some(command_error.code),
        _ => None,
    }
}
