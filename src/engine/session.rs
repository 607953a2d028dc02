use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bgp_rs::{
    ASPath, Identifier, Message, NLRIEncoding, Notification, Open, OpenCapability, OpenParameter,
    PathAttribute, Prefix, Segment, Update, AFI, SAFI,
};
use futures::{SinkExt, StreamExt};
use ipnetwork::Ipv4Network;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use super::codec::MessageCodec;
use super::hold_timer::{HoldAction, HoldTimer};
use super::logger::Logger;
use super::rib::{Path, PathOrigin, PathSource};

pub(crate) const BGP_PORT: u16 = 179;
pub(crate) const DEFAULT_HOLD_TIME: u16 = 90;
// RFC 6793: 2-byte stand-in for a 4-byte local ASN
const AS_TRANS: u16 = 23456;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// RFC 4271 session states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connect,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            SessionState::Idle => "Idle",
            SessionState::Connect => "Connect",
            SessionState::Active => "Active",
            SessionState::OpenSent => "OpenSent",
            SessionState::OpenConfirm => "OpenConfirm",
            SessionState::Established => "Established",
        };
        write!(f, "{}", word)
    }
}

/// Why a session ended.
#[derive(Debug, thiserror::Error)]
pub(crate) enum SessionError {
    #[error("open ASN mismatch (received={received}, expected={expected})")]
    AsnMismatch { received: u32, expected: u32 },
    #[error("hold time expired after {0} seconds")]
    HoldTimeExpired(u16),
    #[error("unexpected {message} in state {state}")]
    UnexpectedMessage {
        message: &'static str,
        state: SessionState,
    },
    #[error("connection closed by peer")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SessionError {
    // NOTIFICATION error codes to send the peer on the way out, if any.
    fn notification(&self) -> Option<(u8, u8)> {
        match self {
            SessionError::AsnMismatch { .. } => Some((2, 2)),
            SessionError::HoldTimeExpired(_) => Some((4, 0)),
            SessionError::UnexpectedMessage { state, .. } => {
                let minor = match state {
                    SessionState::OpenSent => 1,
                    SessionState::OpenConfirm => 2,
                    SessionState::Established => 3,
                    _ => 0,
                };
                Some((5, minor))
            }
            SessionError::Closed | SessionError::Io(_) => None,
        }
    }
}

/// Commands from the engine service to a peer task.
pub(crate) enum PeerCommand {
    /// Full set of paths this peer should be advertising.
    Sync(Vec<Path>),
    /// Connection accepted by the engine listener.
    Incoming(TcpStream),
}

/// Events from peer tasks (and the listener) to the engine service.
pub(crate) enum SessionEvent {
    State {
        peer: IpAddr,
        state: SessionState,
    },
    Learned {
        peer: IpAddr,
        announced: Vec<Path>,
        withdrawn: Vec<Ipv4Network>,
    },
    Closed {
        peer: IpAddr,
        reason: String,
    },
    Inbound {
        peer: IpAddr,
        stream: TcpStream,
    },
}

/// Per-peer parameters fixed at configuration time.
#[derive(Clone, Debug)]
pub(crate) struct SessionConfig {
    pub peer: IpAddr,
    pub remote_asn: u32,
    pub local_asn: u32,
    pub router_id: Ipv4Addr,
    pub hold_time: u16,
}

impl SessionConfig {
    fn is_ebgp(&self) -> bool {
        self.remote_asn != self.local_asn
    }
}

enum Turn {
    Cancelled,
    Command(Option<PeerCommand>),
    Hold(HoldAction),
    Message(Option<Result<Message, std::io::Error>>),
}

/// One live connection to a peer: drives the handshake, keepalives,
/// learned updates and sync-driven advertisement until the connection
/// ends or the engine shuts down.
pub(crate) struct Session<S> {
    config: SessionConfig,
    protocol: Framed<S, MessageCodec>,
    state: SessionState,
    hold_timer: HoldTimer,
    desired: Vec<Path>,
    advertised: HashMap<Ipv4Network, Path>,
    events: mpsc::UnboundedSender<SessionEvent>,
    logger: Arc<dyn Logger>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    pub(crate) fn new(
        config: SessionConfig,
        stream: S,
        desired: Vec<Path>,
        events: mpsc::UnboundedSender<SessionEvent>,
        logger: Arc<dyn Logger>,
    ) -> Session<S> {
        let hold_time = config.hold_time;
        Session {
            config,
            protocol: Framed::new(stream, MessageCodec::new()),
            state: SessionState::Idle,
            hold_timer: HoldTimer::new(hold_time),
            desired,
            advertised: HashMap::new(),
            events,
            logger,
        }
    }

    /// Paths the engine most recently asked this peer to advertise.
    pub(crate) fn take_desired(&mut self) -> Vec<Path> {
        std::mem::take(&mut self.desired)
    }

    /// Drive the connection. `outbound` is true when we dialed the peer.
    /// Returns Ok on cancellation or engine shutdown, Err when the
    /// session failed and should be retried.
    pub(crate) async fn run(
        &mut self,
        token: &CancellationToken,
        commands: &mut mpsc::UnboundedReceiver<PeerCommand>,
        outbound: bool,
    ) -> Result<(), SessionError> {
        if outbound {
            let open = self.create_open();
            self.send_message(Message::Open(open)).await?;
            self.transition(SessionState::OpenSent);
        } else {
            self.transition(SessionState::Connect);
        }
        loop {
            let turn = tokio::select! {
                _ = token.cancelled() => Turn::Cancelled,
                command = commands.recv() => Turn::Command(command),
                action = self.hold_timer.poll() => Turn::Hold(action),
                message = self.protocol.next() => Turn::Message(message),
            };
            match turn {
                Turn::Cancelled => {
                    // Administrative shutdown: tell the peer we cease.
                    let _ = self.send_message(Message::Notification(notification(6, 2))).await;
                    return Ok(());
                }
                Turn::Command(None) => return Ok(()),
                Turn::Command(Some(PeerCommand::Sync(paths))) => {
                    self.desired = paths;
                    if self.state == SessionState::Established {
                        self.flush().await?;
                    }
                }
                Turn::Command(Some(PeerCommand::Incoming(_))) => {
                    self.logger.warn(
                        "dropping duplicate inbound connection",
                        &[("peer", self.config.peer.to_string())],
                    );
                }
                Turn::Hold(HoldAction::SendKeepalive) => {
                    self.send_message(Message::KeepAlive).await?;
                }
                Turn::Hold(HoldAction::Expired) => {
                    let err = SessionError::HoldTimeExpired(self.hold_timer.hold_time);
                    self.send_exit_notification(&err).await;
                    return Err(err);
                }
                Turn::Message(None) => return Err(SessionError::Closed),
                Turn::Message(Some(Err(err))) => return Err(err.into()),
                Turn::Message(Some(Ok(message))) => {
                    self.hold_timer.received();
                    if let Err(err) = self.handle_message(message).await {
                        self.send_exit_notification(&err).await;
                        return Err(err);
                    }
                }
            }
        }
    }

    async fn send_exit_notification(&mut self, err: &SessionError) {
        if let Some((major, minor)) = err.notification() {
            let _ = self
                .send_message(Message::Notification(notification(major, minor)))
                .await;
        }
    }

    async fn handle_message(&mut self, message: Message) -> Result<(), SessionError> {
        match message {
            Message::Open(open) => {
                let hold_time = self.open_received(&open)?;
                self.hold_timer = HoldTimer::new(hold_time);
                match self.state {
                    // Peer initiated; reply with our OPEN
                    SessionState::Connect => {
                        let open = self.create_open();
                        self.send_message(Message::Open(open)).await?;
                        self.send_message(Message::KeepAlive).await?;
                        self.transition(SessionState::OpenConfirm);
                    }
                    SessionState::OpenSent => {
                        self.send_message(Message::KeepAlive).await?;
                        self.transition(SessionState::OpenConfirm);
                    }
                    state => {
                        return Err(SessionError::UnexpectedMessage {
                            message: "OPEN",
                            state,
                        });
                    }
                }
            }
            Message::KeepAlive => {
                if self.state == SessionState::OpenConfirm {
                    self.transition(SessionState::Established);
                    self.flush().await?;
                }
            }
            Message::Update(update) => {
                let (announced, withdrawn) = parse_update(update, self.config.peer);
                let _ = self.events.send(SessionEvent::Learned {
                    peer: self.config.peer,
                    announced,
                    withdrawn,
                });
            }
            Message::Notification(notification) => {
                self.logger.warn(
                    "received NOTIFICATION",
                    &[
                        ("peer", self.config.peer.to_string()),
                        ("notification", notification.to_string()),
                    ],
                );
            }
            Message::RouteRefresh(_) => {}
        }
        Ok(())
    }

    fn transition(&mut self, state: SessionState) {
        self.logger.debug(
            "session state changed",
            &[
                ("peer", self.config.peer.to_string()),
                ("from", self.state.to_string()),
                ("to", state.to_string()),
            ],
        );
        self.state = state;
        let _ = self.events.send(SessionEvent::State {
            peer: self.config.peer,
            state,
        });
    }

    async fn send_message(&mut self, message: Message) -> Result<(), SessionError> {
        self.protocol.send(message).await?;
        self.hold_timer.sent();
        Ok(())
    }

    /// Verify the peer's OPEN and return the negotiated hold time.
    fn open_received(&self, open: &Open) -> Result<u16, SessionError> {
        let remote_asn = asn_from_open(open);
        if remote_asn != self.config.remote_asn {
            return Err(SessionError::AsnMismatch {
                received: remote_asn,
                expected: self.config.remote_asn,
            });
        }
        Ok(std::cmp::min(open.hold_timer, self.config.hold_time))
    }

    fn create_open(&self) -> Open {
        let capabilities = vec![
            OpenCapability::MultiProtocol((AFI::IPV4, SAFI::Unicast)),
            OpenCapability::FourByteASN(self.config.local_asn),
        ];
        let peer_asn = u16::try_from(self.config.local_asn).unwrap_or(AS_TRANS);
        Open {
            version: 4,
            peer_asn,
            hold_timer: self.config.hold_time,
            identifier: u32::from_be_bytes(self.config.router_id.octets()),
            parameters: vec![OpenParameter::Capabilities(capabilities)],
        }
    }

    /// Bring the peer up to date with the desired advertisement set:
    /// withdraw what is stale, announce what is new or changed.
    async fn flush(&mut self) -> Result<(), SessionError> {
        let desired: HashMap<Ipv4Network, Path> = self
            .desired
            .iter()
            .map(|path| (path.prefix, path.clone()))
            .collect();
        let stale: Vec<Ipv4Network> = self
            .advertised
            .keys()
            .filter(|prefix| !desired.contains_key(prefix))
            .copied()
            .collect();
        if !stale.is_empty() {
            self.send_message(Message::Update(withdraw_update(&stale)))
                .await?;
            for prefix in &stale {
                self.advertised.remove(prefix);
            }
        }
        for (prefix, path) in desired {
            if self.advertised.get(&prefix) == Some(&path) {
                continue;
            }
            let update = self.create_update(&path);
            self.send_message(Message::Update(update)).await?;
            self.logger.info(
                "announced path",
                &[
                    ("peer", self.config.peer.to_string()),
                    ("prefix", prefix.to_string()),
                ],
            );
            self.advertised.insert(prefix, path);
        }
        Ok(())
    }

    fn create_update(&self, path: &Path) -> Update {
        let mut attributes = vec![PathAttribute::ORIGIN(path.origin.to_wire())];
        let mut as_path = path.as_path.clone();
        if self.config.is_ebgp() {
            as_path.insert(0, self.config.local_asn);
        }
        let segments = if as_path.is_empty() {
            vec![]
        } else {
            vec![Segment::AS_SEQUENCE(as_path)]
        };
        attributes.push(PathAttribute::AS_PATH(ASPath { segments }));
        attributes.push(PathAttribute::NEXT_HOP(path.next_hop));
        if !self.config.is_ebgp() {
            if let Some(local_pref) = path.local_pref {
                attributes.push(PathAttribute::LOCAL_PREF(local_pref));
            }
        }
        if let Some(med) = path.med {
            attributes.push(PathAttribute::MULTI_EXIT_DISC(med));
        }
        Update {
            withdrawn_routes: vec![],
            attributes,
            announced_routes: vec![NLRIEncoding::IP(to_nlri(path.prefix))],
        }
    }
}

fn notification(major_err_code: u8, minor_err_code: u8) -> Notification {
    Notification {
        major_err_code,
        minor_err_code,
        data: vec![],
    }
}

fn withdraw_update(prefixes: &[Ipv4Network]) -> Update {
    Update {
        withdrawn_routes: prefixes
            .iter()
            .map(|prefix| NLRIEncoding::IP(to_nlri(*prefix)))
            .collect(),
        attributes: vec![],
        announced_routes: vec![],
    }
}

fn to_nlri(prefix: Ipv4Network) -> Prefix {
    Prefix {
        protocol: AFI::IPV4,
        length: prefix.prefix(),
        prefix: prefix.network().octets().to_vec(),
    }
}

fn nlri_to_network(nlri: &NLRIEncoding) -> Option<Ipv4Network> {
    match nlri {
        NLRIEncoding::IP(prefix) if prefix.protocol == AFI::IPV4 && prefix.length <= 32 => {
            match IpAddr::from(prefix) {
                IpAddr::V4(addr) => Ipv4Network::new(addr, prefix.length).ok(),
                IpAddr::V6(_) => None,
            }
        }
        _ => None,
    }
}

/// Check 4-byte ASN capability first, fall back to the 2-byte header field.
fn asn_from_open(open: &Open) -> u32 {
    open.parameters
        .iter()
        .flat_map(|parameter| match parameter {
            OpenParameter::Capabilities(capabilities) => capabilities.clone(),
            _ => vec![],
        })
        .find_map(|capability| match capability {
            OpenCapability::FourByteASN(asn) => Some(asn),
            _ => None,
        })
        .unwrap_or_else(|| u32::from(open.peer_asn))
}

/// Split a received UPDATE into learned IPv4 unicast paths and withdrawn
/// prefixes. Announcements without a NEXT_HOP are dropped.
fn parse_update(update: Update, peer: IpAddr) -> (Vec<Path>, Vec<Ipv4Network>) {
    let withdrawn: Vec<Ipv4Network> = update.withdrawn_routes.iter().filter_map(nlri_to_network).collect();
    let next_hop = update.get(Identifier::NEXT_HOP).and_then(|attr| match attr {
        PathAttribute::NEXT_HOP(next_hop) => Some(*next_hop),
        _ => None,
    });
    let origin = update
        .get(Identifier::ORIGIN)
        .map(|attr| match attr {
            PathAttribute::ORIGIN(origin) => PathOrigin::from_wire(origin),
            _ => PathOrigin::Incomplete,
        })
        .unwrap_or(PathOrigin::Incomplete);
    let as_path: Vec<u32> = update
        .get(Identifier::AS_PATH)
        .map(|attr| match attr {
            PathAttribute::AS_PATH(as_path) => as_path
                .segments
                .iter()
                .flat_map(|segment| match segment {
                    Segment::AS_SEQUENCE(asns) | Segment::AS_SET(asns) => asns.clone(),
                })
                .collect(),
            _ => vec![],
        })
        .unwrap_or_default();
    let med = update.get(Identifier::MULTI_EXIT_DISC).and_then(|attr| match attr {
        PathAttribute::MULTI_EXIT_DISC(med) => Some(*med),
        _ => None,
    });
    let local_pref = update.get(Identifier::LOCAL_PREF).and_then(|attr| match attr {
        PathAttribute::LOCAL_PREF(local_pref) => Some(*local_pref),
        _ => None,
    });
    let announced = match next_hop {
        Some(next_hop) => update
            .announced_routes
            .iter()
            .filter_map(nlri_to_network)
            .map(|prefix| Path {
                prefix,
                next_hop,
                origin,
                as_path: as_path.clone(),
                med,
                local_pref,
                source: PathSource::Peer(peer),
            })
            .collect(),
        None => vec![],
    };
    (announced, withdrawn)
}

enum Acquired {
    Stream(TcpStream, bool),
    Shutdown,
}

/// Owns one configured peering for the life of the engine: dials (or
/// accepts) connections, runs sessions, reports failures and retries.
pub(crate) struct PeerRunner {
    config: SessionConfig,
    events: mpsc::UnboundedSender<SessionEvent>,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
    token: CancellationToken,
    logger: Arc<dyn Logger>,
    desired: Vec<Path>,
}

impl PeerRunner {
    pub(crate) fn new(
        config: SessionConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
        commands: mpsc::UnboundedReceiver<PeerCommand>,
        token: CancellationToken,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            config,
            events,
            commands,
            token,
            logger,
            desired: vec![],
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            if self.token.is_cancelled() {
                return;
            }
            let (stream, outbound) = match self.acquire_stream().await {
                Acquired::Stream(stream, outbound) => (stream, outbound),
                Acquired::Shutdown => return,
            };
            self.logger.info(
                "session connected",
                &[("peer", self.config.peer.to_string())],
            );
            let mut session = Session::new(
                self.config.clone(),
                stream,
                self.desired.clone(),
                self.events.clone(),
                self.logger.clone(),
            );
            let result = session.run(&self.token, &mut self.commands, outbound).await;
            self.desired = session.take_desired();
            match result {
                // Cancelled or the engine went away
                Ok(()) => return,
                Err(err) => {
                    let _ = self.events.send(SessionEvent::Closed {
                        peer: self.config.peer,
                        reason: err.to_string(),
                    });
                    if self.wait_retry().await {
                        return;
                    }
                }
            }
        }
    }

    /// Dial the peer, retrying until a connection or an inbound stream
    /// arrives, while staying responsive to sync commands and shutdown.
    async fn acquire_stream(&mut self) -> Acquired {
        loop {
            let dial = timeout(
                CONNECT_TIMEOUT,
                TcpStream::connect(SocketAddr::new(self.config.peer, BGP_PORT)),
            );
            tokio::select! {
                _ = self.token.cancelled() => return Acquired::Shutdown,
                command = self.commands.recv() => match command {
                    None => return Acquired::Shutdown,
                    Some(command) => {
                        if let Some(stream) = self.apply(command) {
                            return Acquired::Stream(stream, false);
                        }
                        continue;
                    }
                },
                result = dial => match result {
                    Ok(Ok(stream)) => return Acquired::Stream(stream, true),
                    Ok(Err(err)) => self.logger.debug(
                        "connect failed",
                        &[
                            ("peer", self.config.peer.to_string()),
                            ("error", err.to_string()),
                        ],
                    ),
                    Err(_) => self.logger.debug(
                        "connect timed out",
                        &[("peer", self.config.peer.to_string())],
                    ),
                },
            }
            if self.wait_retry().await {
                return Acquired::Shutdown;
            }
        }
    }

    /// Sleep out the retry interval; true means shut down instead.
    async fn wait_retry(&mut self) -> bool {
        let delay = sleep(RETRY_INTERVAL);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return true,
                _ = &mut delay => return false,
                command = self.commands.recv() => match command {
                    None => return true,
                    // A connection mid-wait would race the retry dial;
                    // drop it and let the next dial settle things.
                    Some(command) => {
                        self.apply(command);
                    }
                },
            }
        }
    }

    fn apply(&mut self, command: PeerCommand) -> Option<TcpStream> {
        match command {
            PeerCommand::Sync(paths) => {
                self.desired = paths;
                None
            }
            PeerCommand::Incoming(stream) => Some(stream),
        }
    }
}
