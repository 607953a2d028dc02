use std::net::IpAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("bgp engine is not running")]
    NotRunning,

    #[error("bgp engine is already running")]
    AlreadyRunning,

    #[error("peer {0} already configured")]
    PeerExists(IpAddr),

    #[error("defined set {0:?} already exists")]
    DefinedSetExists(String),

    #[error("unknown defined set {0:?}")]
    UnknownDefinedSet(String),

    #[error("policy {0:?} already exists")]
    PolicyExists(String),

    #[error("unknown policy {0:?}")]
    UnknownPolicy(String),

    #[error("failed to bind listener: {0}")]
    Bind(String),

    #[error("engine request channel closed")]
    ChannelClosed,
}
