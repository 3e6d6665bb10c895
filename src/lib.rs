/// Expose all sidecar components used by main
pub mod address;
pub mod config;
pub mod controller;
pub mod election;
pub mod identity;
pub mod mongo;
pub mod pods;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("MongoDB Error: {0}")]
    MongoError(#[from] mongodb::error::Error),

    #[error("MongoDB Reply Error: {0}")]
    ReplyError(#[from] mongodb::bson::de::Error),

    #[error("Replica Set Error: {0}")]
    ReplSetError(String),

    #[error("Pod Error: {0}")]
    PodError(String),

    #[error("Host Identity Error: {0}")]
    IdentityError(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
