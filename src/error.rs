use std::net::IpAddr;

use thiserror::Error;

use crate::engine;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Engine(#[from] engine::Error),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status code: {0}")]
    ProbeStatus(u16),

    #[error(transparent)]
    Netlink(#[from] rtnetlink::Error),

    #[error("unexpected number of default routes: {0}")]
    UnexpectedDefaultRoutes(usize),

    #[error("gateway is not ipv4: {0}")]
    GatewayNotIpv4(IpAddr),

    #[error("rpc server error: {0}")]
    Rpc(String),

    #[error("task panicked: {0}")]
    TaskPanic(String),
}
