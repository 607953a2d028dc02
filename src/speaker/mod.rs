//! The speaker: BGP controller, health gate, FIB reconciler and the
//! supervisor that runs them.

mod fib;
mod health;
mod policy;

pub use fib::FibUpdater;
pub use health::{Gate, HealthCheck, Status};

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use log::{error, info, log, Level};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::api;
use crate::config::Config;
use crate::engine::{
    self, BgpServer, Destination, Path, PathOrigin, PathSource, PeerSpec, RouterConfig,
};
use crate::error::Error;

const STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Adapts the process logger to the engine's logging contract.
struct EngineLog;

impl EngineLog {
    fn write(&self, level: Level, msg: &str, fields: &[(&str, String)]) {
        if fields.is_empty() {
            log!(target: "bgp", level, "{}", msg);
        } else {
            let rendered: Vec<String> = fields
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect();
            log!(target: "bgp", level, "{} [{}]", msg, rendered.join(" "));
        }
    }
}

impl engine::Logger for EngineLog {
    fn panic(&self, msg: &str, fields: &[(&str, String)]) {
        self.write(Level::Error, msg, fields);
        panic!("{}", msg);
    }
    fn fatal(&self, msg: &str, fields: &[(&str, String)]) {
        self.write(Level::Error, msg, fields);
    }
    fn error(&self, msg: &str, fields: &[(&str, String)]) {
        self.write(Level::Error, msg, fields);
    }
    fn warn(&self, msg: &str, fields: &[(&str, String)]) {
        self.write(Level::Warn, msg, fields);
    }
    fn info(&self, msg: &str, fields: &[(&str, String)]) {
        self.write(Level::Info, msg, fields);
    }
    fn debug(&self, msg: &str, fields: &[(&str, String)]) {
        self.write(Level::Debug, msg, fields);
    }
}

/// Drives the embedded BGP engine: brings up peerings, installs policy,
/// and toggles the anycast advertisement.
#[derive(Clone)]
pub struct Controller {
    config: Arc<Config>,
    server: BgpServer,
    anycast: Path,
    default_route: Ipv4Network,
}

impl Controller {
    pub fn new(config: Arc<Config>, server: BgpServer) -> Result<Self, Error> {
        let prefix = Ipv4Network::new(config.anycast_ip, 32)
            .map_err(|err| Error::Config(err.to_string()))?;
        let default_route = Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0)
            .map_err(|err| Error::Config(err.to_string()))?;
        let anycast = Path {
            prefix,
            // Locally originated: the engine exports it as-is, the same
            // next hop a plain `rib add` would carry.
            next_hop: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            origin: PathOrigin::Igp,
            as_path: vec![],
            med: None,
            local_pref: None,
            source: PathSource::Local,
        };
        Ok(Self {
            config,
            server,
            anycast,
            default_route,
        })
    }

    /// Strictly ordered startup: engine, policy, peers, then the
    /// unconditional advertisement when no health gate is configured.
    pub async fn setup(&self) -> Result<(), Error> {
        self.start_bgp().await?;
        self.install_policies().await?;
        self.add_neighbors().await?;
        if self.config.health_check_url.is_none() {
            self.advertise().await?;
        }
        Ok(())
    }

    async fn start_bgp(&self) -> Result<(), Error> {
        Ok(self
            .server
            .start(RouterConfig {
                asn: self.config.asn,
                router_id: self.config.anycast_ip,
                // Outbound peerings only
                listen_port: None,
            })
            .await?)
    }

    async fn install_policies(&self) -> Result<(), Error> {
        for set in policy::defined_sets(&self.config)? {
            self.server.add_defined_set(set).await?;
        }
        for item in policy::policies() {
            self.server.add_policy(item).await?;
        }
        for assignment in policy::assignments() {
            self.server.add_policy_assignment(assignment).await?;
        }
        Ok(())
    }

    async fn add_neighbors(&self) -> Result<(), Error> {
        for neighbor in &self.config.neighbors {
            self.server
                .add_peer(PeerSpec {
                    address: IpAddr::V4(neighbor.address),
                    remote_asn: neighbor.asn,
                })
                .await?;
        }
        Ok(())
    }

    pub async fn advertise(&self) -> Result<(), Error> {
        info!("advertising anycast route {}", self.anycast.prefix);
        Ok(self.server.add_path(self.anycast.clone()).await?)
    }

    pub async fn withdraw(&self) -> Result<(), Error> {
        info!("withdrawing anycast route {}", self.anycast.prefix);
        Ok(self.server.delete_path(self.anycast.clone()).await?)
    }

    /// Default-route destinations currently in the BGP global table.
    pub async fn list_default_paths(&self) -> Result<Vec<Destination>, Error> {
        let destinations = self.server.list_path(None).await?;
        Ok(destinations
            .into_iter()
            .filter(|destination| destination.prefix == self.default_route)
            .collect())
    }
}

#[async_trait]
impl Gate for Controller {
    async fn on_healthy(&self) -> Result<(), Error> {
        self.advertise().await
    }
    async fn on_unhealthy(&self) -> Result<(), Error> {
        self.withdraw().await
    }
}

/// Owns the process lifecycle: engine startup, the health/FIB task
/// group, and coordinated shutdown on signal or first error.
pub struct Speaker {
    config: Config,
}

impl Speaker {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<(), Error> {
        let token = CancellationToken::new();
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::spawn({
            let token = token.clone();
            async move {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = sigint.recv() => {}
                }
                info!("shutdown signal received");
                token.cancel();
            }
        });

        let (server, service) = BgpServer::new(Arc::new(EngineLog));
        let engine_task = tokio::spawn(service.run());

        let result = run_speaker(token, server.clone(), Arc::new(self.config)).await;
        if let Err(err) = &result {
            error!("speaker completed with error: {}", err);
        }

        info!("shutting down bgp");
        match timeout(STOP_TIMEOUT, server.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!("failed to stop bgp server: {}", err),
            Err(_) => error!("failed to stop bgp server: timed out"),
        }
        engine_task.abort();

        result
    }
}

async fn run_speaker(
    token: CancellationToken,
    server: BgpServer,
    config: Arc<Config>,
) -> Result<(), Error> {
    let controller = Controller::new(config.clone(), server.clone())?;
    controller.setup().await?;

    // Operator introspection; losing it is not worth dying for.
    let _api_handle = match api::serve(server.clone()).await {
        Ok(handle) => Some(handle),
        Err(err) => {
            error!("management endpoint unavailable: {}", err);
            None
        }
    };

    let health = HealthCheck::new(controller.clone(), config.health_check_url.as_deref())?;

    // First task error cancels the group; the supervisor keeps the first
    // error and drains the rest.
    let group = token.child_token();
    let mut tasks: JoinSet<Result<(), Error>> = JoinSet::new();
    {
        let group = group.clone();
        tasks.spawn(async move { health.run(group).await });
    }
    if let Some(metric) = config.update_fib_metric {
        let updater = FibUpdater::new(controller.clone(), metric);
        let group = group.clone();
        tasks.spawn(async move { updater.run(group).await });
    }

    let mut first_error: Option<Error> = None;
    while let Some(joined) = tasks.join_next().await {
        let result = match joined {
            Ok(result) => result,
            Err(err) => Err(Error::TaskPanic(err.to_string())),
        };
        if let Err(err) = result {
            error!("task completed with error: {}", err);
            if first_error.is_none() {
                first_error = Some(err);
            }
            group.cancel();
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
