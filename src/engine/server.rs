use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::error::Error;
use super::logger::Logger;
use super::policy::{
    DefinedSet, Policy, PolicyAssignment, PolicyDirection, PolicyTable, RouteAction, RouteMeta,
};
use super::rib::{Destination, Path, PathSource, Rib};
use super::session::{
    PeerCommand, PeerRunner, SessionConfig, SessionEvent, SessionState, DEFAULT_HOLD_TIME,
};

/// Global engine parameters supplied on start.
#[derive(Clone, Debug)]
pub struct RouterConfig {
    pub asn: u32,
    pub router_id: Ipv4Addr,
    /// None disables inbound sessions entirely.
    pub listen_port: Option<u16>,
}

/// A configured peering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerSpec {
    pub address: IpAddr,
    pub remote_asn: u32,
}

/// Read-only view of one peering.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PeerSummary {
    pub address: IpAddr,
    pub remote_asn: u32,
    pub state: String,
    pub uptime_seconds: Option<i64>,
    pub prefixes_received: u64,
}

type Responder<T> = oneshot::Sender<Result<T, Error>>;

enum Request {
    Start(RouterConfig, Responder<()>),
    Stop(Responder<()>),
    AddPeer(PeerSpec, Responder<()>),
    AddDefinedSet(DefinedSet, Responder<()>),
    AddPolicy(Policy, Responder<()>),
    AddPolicyAssignment(PolicyAssignment, Responder<()>),
    AddPath(Path, Responder<()>),
    DeletePath(Path, Responder<()>),
    ListPath(Option<Ipv4Network>, Responder<Vec<Destination>>),
    ListPeers(Responder<Vec<PeerSummary>>),
}

/// Clonable async handle to the engine service. All engine interaction
/// goes through this type.
#[derive(Clone)]
pub struct BgpServer {
    requests: mpsc::UnboundedSender<Request>,
}

impl BgpServer {
    /// Create the handle and its backing service. The service must be
    /// spawned before the handle is used.
    pub fn new(logger: Arc<dyn Logger>) -> (BgpServer, BgpService) {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let server = BgpServer {
            requests: requests_tx,
        };
        let service = BgpService {
            requests: requests_rx,
            events_tx,
            events: events_rx,
            logger,
            state: None,
        };
        (server, service)
    }

    async fn call<T>(&self, build: impl FnOnce(Responder<T>) -> Request) -> Result<T, Error> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(build(tx))
            .map_err(|_| Error::ChannelClosed)?;
        rx.await.map_err(|_| Error::ChannelClosed)?
    }

    pub async fn start(&self, config: RouterConfig) -> Result<(), Error> {
        self.call(|tx| Request::Start(config, tx)).await
    }

    pub async fn stop(&self) -> Result<(), Error> {
        self.call(Request::Stop).await
    }

    pub async fn add_peer(&self, peer: PeerSpec) -> Result<(), Error> {
        self.call(|tx| Request::AddPeer(peer, tx)).await
    }

    pub async fn add_defined_set(&self, set: DefinedSet) -> Result<(), Error> {
        self.call(|tx| Request::AddDefinedSet(set, tx)).await
    }

    pub async fn add_policy(&self, policy: Policy) -> Result<(), Error> {
        self.call(|tx| Request::AddPolicy(policy, tx)).await
    }

    pub async fn add_policy_assignment(&self, assignment: PolicyAssignment) -> Result<(), Error> {
        self.call(|tx| Request::AddPolicyAssignment(assignment, tx))
            .await
    }

    /// Install a locally originated path. Idempotent for equal paths.
    pub async fn add_path(&self, path: Path) -> Result<(), Error> {
        self.call(|tx| Request::AddPath(path, tx)).await
    }

    /// Remove a locally originated path. Idempotent.
    pub async fn delete_path(&self, path: Path) -> Result<(), Error> {
        self.call(|tx| Request::DeletePath(path, tx)).await
    }

    /// Destinations from the global RIB, optionally narrowed to a prefix.
    pub async fn list_path(&self, filter: Option<Ipv4Network>) -> Result<Vec<Destination>, Error> {
        self.call(|tx| Request::ListPath(filter, tx)).await
    }

    pub async fn list_peers(&self) -> Result<Vec<PeerSummary>, Error> {
        self.call(Request::ListPeers).await
    }
}

struct Peer {
    spec: PeerSpec,
    commands: mpsc::UnboundedSender<PeerCommand>,
    state: SessionState,
    established_at: Option<DateTime<Utc>>,
    prefixes_received: u64,
}

struct Running {
    config: RouterConfig,
    rib: Rib,
    policy: PolicyTable,
    peers: HashMap<IpAddr, Peer>,
    token: CancellationToken,
}

impl Running {
    /// Push the current advertisement set to every peer task.
    fn sync_peers(&self) {
        for (addr, peer) in &self.peers {
            let desired = self.compute_exports(*addr);
            let _ = peer.commands.send(PeerCommand::Sync(desired));
        }
    }

    /// Paths `peer` should advertise: per prefix, the preferred path not
    /// learned from that peer, subject to export policy.
    fn compute_exports(&self, peer: IpAddr) -> Vec<Path> {
        let mut exports = Vec::new();
        for destination in self.rib.destinations(None) {
            let mut candidates: Vec<&Path> = destination
                .paths
                .iter()
                .filter(|path| path.source != PathSource::Peer(peer))
                .collect();
            if candidates.is_empty() {
                continue;
            }
            candidates.sort_by_key(|path| match path.source {
                PathSource::Local => 0,
                PathSource::Peer(_) => 1,
            });
            let candidate = candidates[0];
            let meta = RouteMeta {
                prefix: destination.prefix,
                neighbor: Some(peer),
                source: candidate.source,
            };
            if self.policy.evaluate(PolicyDirection::Export, &meta) == RouteAction::Accept {
                exports.push(candidate.clone());
            }
        }
        exports
    }
}

/// The engine service task: owns the RIB, policy table and peer
/// registry, and serializes every request against them.
pub struct BgpService {
    requests: mpsc::UnboundedReceiver<Request>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    logger: Arc<dyn Logger>,
    state: Option<Running>,
}

impl BgpService {
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    None => break,
                    Some(request) => {
                        if self.handle_request(request).await {
                            break;
                        }
                    }
                },
                Some(event) = self.events.recv() => self.handle_event(event),
            }
        }
        if let Some(running) = &self.state {
            running.token.cancel();
        }
        self.logger.info("bgp engine stopped", &[]);
    }

    // Returns true once the engine should shut down.
    async fn handle_request(&mut self, request: Request) -> bool {
        match request {
            Request::Start(config, tx) => {
                let _ = tx.send(self.start(config).await);
            }
            Request::Stop(tx) => {
                let result = match self.state.take() {
                    Some(running) => {
                        running.token.cancel();
                        Ok(())
                    }
                    None => Err(Error::NotRunning),
                };
                let stopped = result.is_ok();
                let _ = tx.send(result);
                return stopped;
            }
            Request::AddPeer(spec, tx) => {
                let _ = tx.send(self.add_peer(spec));
            }
            Request::AddDefinedSet(set, tx) => {
                let result = self
                    .running_mut()
                    .and_then(|running| running.policy.add_defined_set(set));
                let _ = tx.send(result);
            }
            Request::AddPolicy(policy, tx) => {
                let result = self
                    .running_mut()
                    .and_then(|running| running.policy.add_policy(policy));
                let _ = tx.send(result);
            }
            Request::AddPolicyAssignment(assignment, tx) => {
                let result = self
                    .running_mut()
                    .and_then(|running| running.policy.add_assignment(assignment));
                let _ = tx.send(result);
            }
            Request::AddPath(path, tx) => {
                let _ = tx.send(self.add_path(path));
            }
            Request::DeletePath(path, tx) => {
                let _ = tx.send(self.delete_path(path));
            }
            Request::ListPath(filter, tx) => {
                let result = self
                    .running_mut()
                    .map(|running| running.rib.destinations(filter));
                let _ = tx.send(result);
            }
            Request::ListPeers(tx) => {
                let result = self.running_mut().map(|running| {
                    let mut summaries: Vec<PeerSummary> = running
                        .peers
                        .values()
                        .map(|peer| PeerSummary {
                            address: peer.spec.address,
                            remote_asn: peer.spec.remote_asn,
                            state: peer.state.to_string(),
                            uptime_seconds: peer
                                .established_at
                                .map(|at| (Utc::now() - at).num_seconds()),
                            prefixes_received: peer.prefixes_received,
                        })
                        .collect();
                    summaries.sort_by_key(|summary| summary.address);
                    summaries
                });
                let _ = tx.send(result);
            }
        }
        false
    }

    fn running_mut(&mut self) -> Result<&mut Running, Error> {
        self.state.as_mut().ok_or(Error::NotRunning)
    }

    async fn start(&mut self, config: RouterConfig) -> Result<(), Error> {
        if self.state.is_some() {
            return Err(Error::AlreadyRunning);
        }
        let token = CancellationToken::new();
        if let Some(port) = config.listen_port {
            let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
                .await
                .map_err(|err| Error::Bind(err.to_string()))?;
            tokio::spawn(accept_loop(
                listener,
                self.events_tx.clone(),
                token.child_token(),
                self.logger.clone(),
            ));
        }
        self.logger.info(
            "bgp engine started",
            &[
                ("asn", config.asn.to_string()),
                ("router-id", config.router_id.to_string()),
            ],
        );
        self.state = Some(Running {
            config,
            rib: Rib::new(),
            policy: PolicyTable::default(),
            peers: HashMap::new(),
            token,
        });
        Ok(())
    }

    fn add_peer(&mut self, spec: PeerSpec) -> Result<(), Error> {
        let events = self.events_tx.clone();
        let logger = self.logger.clone();
        let running = self.running_mut()?;
        if running.peers.contains_key(&spec.address) {
            return Err(Error::PeerExists(spec.address));
        }
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let session_config = SessionConfig {
            peer: spec.address,
            remote_asn: spec.remote_asn,
            local_asn: running.config.asn,
            router_id: running.config.router_id,
            hold_time: DEFAULT_HOLD_TIME,
        };
        let runner = PeerRunner::new(
            session_config,
            events,
            commands_rx,
            running.token.child_token(),
            logger,
        );
        tokio::spawn(runner.run());
        // Seed the task with the current advertisement set.
        let desired = running.compute_exports(spec.address);
        let _ = commands_tx.send(PeerCommand::Sync(desired));
        running.peers.insert(
            spec.address,
            Peer {
                spec: spec.clone(),
                commands: commands_tx,
                state: SessionState::Idle,
                established_at: None,
                prefixes_received: 0,
            },
        );
        self.logger.info(
            "peer added",
            &[
                ("peer", spec.address.to_string()),
                ("asn", spec.remote_asn.to_string()),
            ],
        );
        Ok(())
    }

    fn add_path(&mut self, mut path: Path) -> Result<(), Error> {
        let running = self.running_mut()?;
        path.source = PathSource::Local;
        let meta = RouteMeta {
            prefix: path.prefix,
            neighbor: None,
            source: path.source,
        };
        if running.policy.evaluate(PolicyDirection::Import, &meta) == RouteAction::Reject {
            self.logger.debug(
                "local path rejected by import policy",
                &[("prefix", path.prefix.to_string())],
            );
            return Ok(());
        }
        let prefix = path.prefix;
        if running.rib.insert(path) {
            running.sync_peers();
            self.logger
                .info("local path installed", &[("prefix", prefix.to_string())]);
        }
        Ok(())
    }

    fn delete_path(&mut self, mut path: Path) -> Result<(), Error> {
        let running = self.running_mut()?;
        path.source = PathSource::Local;
        if running.rib.remove(path.prefix, PathSource::Local) {
            running.sync_peers();
            self.logger
                .info("local path removed", &[("prefix", path.prefix.to_string())]);
        }
        Ok(())
    }

    fn handle_event(&mut self, event: SessionEvent) {
        let Some(running) = self.state.as_mut() else {
            return;
        };
        match event {
            SessionEvent::State { peer, state } => {
                if let Some(entry) = running.peers.get_mut(&peer) {
                    if state == SessionState::Established {
                        if entry.state != SessionState::Established {
                            entry.established_at = Some(Utc::now());
                        }
                    } else {
                        entry.established_at = None;
                    }
                    entry.state = state;
                }
            }
            SessionEvent::Learned {
                peer,
                announced,
                withdrawn,
            } => {
                if let Some(entry) = running.peers.get_mut(&peer) {
                    entry.prefixes_received += announced.len() as u64;
                }
                let mut changed = false;
                for prefix in withdrawn {
                    changed |= running.rib.remove(prefix, PathSource::Peer(peer));
                }
                for path in announced {
                    let meta = RouteMeta {
                        prefix: path.prefix,
                        neighbor: Some(peer),
                        source: path.source,
                    };
                    match running.policy.evaluate(PolicyDirection::Import, &meta) {
                        RouteAction::Accept => changed |= running.rib.insert(path),
                        RouteAction::Reject => self.logger.debug(
                            "path rejected by import policy",
                            &[
                                ("peer", peer.to_string()),
                                ("prefix", meta.prefix.to_string()),
                            ],
                        ),
                    }
                }
                if changed {
                    running.sync_peers();
                }
            }
            SessionEvent::Closed { peer, reason } => {
                self.logger.warn(
                    "session closed",
                    &[("peer", peer.to_string()), ("reason", reason)],
                );
                if let Some(entry) = running.peers.get_mut(&peer) {
                    entry.state = SessionState::Idle;
                    entry.established_at = None;
                }
                if running.rib.remove_peer(peer) {
                    running.sync_peers();
                }
            }
            SessionEvent::Inbound { peer, stream } => match running.peers.get(&peer) {
                Some(entry) => {
                    let _ = entry.commands.send(PeerCommand::Incoming(stream));
                }
                None => self.logger.warn(
                    "connection from unconfigured peer",
                    &[("peer", peer.to_string())],
                ),
            },
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    events: mpsc::UnboundedSender<SessionEvent>,
    token: CancellationToken,
    logger: Arc<dyn Logger>,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let _ = events.send(SessionEvent::Inbound {
                        peer: addr.ip(),
                        stream,
                    });
                }
                Err(err) => logger.warn("accept failed", &[("error", err.to_string())]),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::policy::{Conditions, PrefixMatch, Statement};
    use crate::engine::rib::PathOrigin;

    struct NullLogger;
    impl Logger for NullLogger {
        fn panic(&self, _: &str, _: &[(&str, String)]) {}
        fn fatal(&self, _: &str, _: &[(&str, String)]) {}
        fn error(&self, _: &str, _: &[(&str, String)]) {}
        fn warn(&self, _: &str, _: &[(&str, String)]) {}
        fn info(&self, _: &str, _: &[(&str, String)]) {}
        fn debug(&self, _: &str, _: &[(&str, String)]) {}
    }

    fn spawn_engine() -> BgpServer {
        let (server, service) = BgpServer::new(Arc::new(NullLogger));
        tokio::spawn(service.run());
        server
    }

    fn anycast_path() -> Path {
        Path {
            prefix: "10.0.0.1/32".parse().unwrap(),
            next_hop: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            origin: PathOrigin::Igp,
            as_path: vec![],
            med: None,
            local_pref: None,
            source: PathSource::Local,
        }
    }

    fn router_config() -> RouterConfig {
        RouterConfig {
            asn: 65001,
            router_id: Ipv4Addr::new(10, 0, 0, 1),
            listen_port: None,
        }
    }

    #[tokio::test]
    async fn test_requests_require_start() {
        let server = spawn_engine();
        assert!(matches!(
            server.add_path(anycast_path()).await,
            Err(Error::NotRunning)
        ));
        server.start(router_config()).await.unwrap();
        assert!(matches!(
            server.start(router_config()).await,
            Err(Error::AlreadyRunning)
        ));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_and_delete_path_are_idempotent() {
        let server = spawn_engine();
        server.start(router_config()).await.unwrap();

        server.add_path(anycast_path()).await.unwrap();
        server.add_path(anycast_path()).await.unwrap();
        let destinations = server.list_path(None).await.unwrap();
        assert_eq!(destinations.len(), 1);
        assert_eq!(destinations[0].paths.len(), 1);

        server.delete_path(anycast_path()).await.unwrap();
        server.delete_path(anycast_path()).await.unwrap();
        assert!(server.list_path(None).await.unwrap().is_empty());
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_list_path_filter() {
        let server = spawn_engine();
        server.start(router_config()).await.unwrap();
        server.add_path(anycast_path()).await.unwrap();

        let anycast: Ipv4Network = "10.0.0.1/32".parse().unwrap();
        let default: Ipv4Network = "0.0.0.0/0".parse().unwrap();
        assert_eq!(server.list_path(Some(anycast)).await.unwrap().len(), 1);
        assert!(server.list_path(Some(default)).await.unwrap().is_empty());
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_default_reject_import_blocks_unmatched_local_path() {
        let server = spawn_engine();
        server.start(router_config()).await.unwrap();
        server
            .add_defined_set(DefinedSet::Prefix {
                name: "anycast-ip".into(),
                prefixes: vec![PrefixMatch::exact("10.0.0.1/32".parse().unwrap())],
            })
            .await
            .unwrap();
        server
            .add_policy(Policy {
                name: "only-anycast-ip-import".into(),
                statements: vec![Statement {
                    name: "allow-anycast-ip-local".into(),
                    conditions: Conditions {
                        prefix_set: Some("anycast-ip".into()),
                        neighbor_set: None,
                        route_type: Some(crate::engine::policy::RouteType::Local),
                    },
                    action: RouteAction::Accept,
                }],
            })
            .await
            .unwrap();
        server
            .add_policy_assignment(PolicyAssignment {
                direction: PolicyDirection::Import,
                policies: vec!["only-anycast-ip-import".into()],
                default_action: RouteAction::Reject,
            })
            .await
            .unwrap();

        // The anycast /32 passes policy; any other prefix is dropped.
        server.add_path(anycast_path()).await.unwrap();
        let mut other = anycast_path();
        other.prefix = "192.0.2.0/24".parse().unwrap();
        server.add_path(other).await.unwrap();

        let destinations = server.list_path(None).await.unwrap();
        assert_eq!(destinations.len(), 1);
        assert_eq!(
            destinations[0].prefix,
            "10.0.0.1/32".parse::<Ipv4Network>().unwrap()
        );
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_peer_rejected() {
        let server = spawn_engine();
        server.start(router_config()).await.unwrap();
        let spec = PeerSpec {
            // Nothing listens here; the runner will just retry dialing.
            address: IpAddr::from([127, 0, 0, 1]),
            remote_asn: 65000,
        };
        server.add_peer(spec.clone()).await.unwrap();
        assert!(matches!(
            server.add_peer(spec).await,
            Err(Error::PeerExists(_))
        ));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_rejects_requests_afterwards() {
        let server = spawn_engine();
        server.start(router_config()).await.unwrap();
        server.stop().await.unwrap();
        assert!(matches!(
            server.list_path(None).await,
            Err(Error::ChannelClosed | Error::NotRunning)
        ));
    }
}
