//! Management endpoint: read-only JSON-RPC introspection over the
//! engine handle, bound to localhost. Operators query it with any
//! JSON-RPC client; the speaker itself never calls it.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::server::{ServerBuilder, ServerHandle};
use serde::{Deserialize, Serialize};

use crate::engine::{BgpServer, PeerSummary};
use crate::error::Error;

/// Where the management surface listens.
pub const LISTEN_ADDR: &str = "127.0.0.1:6061";

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RouteSummary {
    pub prefix: String,
    pub next_hop: IpAddr,
    pub origin: String,
    pub as_path: Vec<u32>,
    pub source: String,
}

#[rpc(server)]
pub trait Management {
    #[method(name = "show_peers")]
    async fn show_peers(&self) -> RpcResult<Vec<PeerSummary>>;

    #[method(name = "show_routes")]
    async fn show_routes(&self) -> RpcResult<Vec<RouteSummary>>;
}

struct Handler {
    server: BgpServer,
}

#[async_trait]
impl ManagementServer for Handler {
    async fn show_peers(&self) -> RpcResult<Vec<PeerSummary>> {
        self.server.list_peers().await.map_err(to_rpc_error)
    }

    async fn show_routes(&self) -> RpcResult<Vec<RouteSummary>> {
        let destinations = self.server.list_path(None).await.map_err(to_rpc_error)?;
        Ok(destinations
            .into_iter()
            .flat_map(|destination| {
                let prefix = destination.prefix;
                destination.paths.into_iter().map(move |path| RouteSummary {
                    prefix: prefix.to_string(),
                    next_hop: path.next_hop,
                    origin: path.origin.to_string(),
                    as_path: path.as_path,
                    source: path.source.to_string(),
                })
            })
            .collect())
    }
}

fn to_rpc_error(err: crate::engine::Error) -> jsonrpsee::core::Error {
    jsonrpsee::core::Error::Custom(err.to_string())
}

/// Start the management server. The handle keeps it alive.
pub async fn serve(server: BgpServer) -> Result<ServerHandle, Error> {
    let addr: SocketAddr = LISTEN_ADDR
        .parse()
        .map_err(|_| Error::Rpc(format!("invalid listen address {}", LISTEN_ADDR)))?;
    let rpc_server = ServerBuilder::default()
        .build(addr)
        .await
        .map_err(|err| Error::Rpc(err.to_string()))?;
    rpc_server
        .start(Handler { server }.into_rpc())
        .map_err(|err| Error::Rpc(err.to_string()))
}
