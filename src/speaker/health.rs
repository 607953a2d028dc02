//! Health-check driven advertisement gate.
//!
//! Probes a local HTTP endpoint once a second and flips the anycast
//! advertisement with asymmetric hysteresis: three consecutive
//! successes to advertise, a single failure to withdraw.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use reqwest::{Client, StatusCode, Url};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

pub(crate) const HEALTHY_THRESHOLD: u32 = 3;
const PROBE_INTERVAL: Duration = Duration::from_secs(1);
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Receiver of health transitions. A failed callback suppresses the
/// state flip so the next tick retries it.
#[async_trait]
pub trait Gate: Send + Sync {
    async fn on_healthy(&self) -> Result<(), Error>;
    async fn on_unhealthy(&self) -> Result<(), Error>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Unhealthy,
    Healthy,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Status::Unhealthy => write!(f, "Unhealthy"),
            Status::Healthy => write!(f, "Healthy"),
        }
    }
}

pub struct HealthCheck<G> {
    status: Status,
    ok_counter: u32,
    url: Option<Url>,
    client: Client,
    gate: G,
}

impl<G: Gate> HealthCheck<G> {
    pub fn new(gate: G, url: Option<&str>) -> Result<Self, Error> {
        let url = match url {
            None | Some("") => None,
            Some(raw) => Some(
                Url::parse(raw)
                    .map_err(|err| Error::Config(format!("health check url: {}", err)))?,
            ),
        };
        let client = Client::builder().timeout(PROBE_TIMEOUT).build()?;
        Ok(Self {
            status: Status::Unhealthy,
            ok_counter: 0,
            url,
            client,
            gate,
        })
    }

    /// Probe until cancelled. With no URL configured there is nothing to
    /// gate on; park until shutdown.
    pub async fn run(mut self, token: CancellationToken) -> Result<(), Error> {
        let Some(url) = self.url.clone() else {
            warn!("health check url is empty, advertisement is not gated");
            token.cancelled().await;
            return Ok(());
        };
        let mut ticker = interval_at(Instant::now() + PROBE_INTERVAL, PROBE_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("health check exiting");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    debug!("health check status={} ok_count={}", self.status, self.ok_counter);
                    let probe = self.probe(&url).await;
                    self.observe(probe).await;
                }
            }
        }
    }

    async fn probe(&self, url: &Url) -> Result<(), Error> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        // Drain the body before judging the status
        response.bytes().await?;
        if status != StatusCode::OK {
            return Err(Error::ProbeStatus(status.as_u16()));
        }
        Ok(())
    }

    /// Feed one probe outcome through the state machine.
    async fn observe(&mut self, probe: Result<(), Error>) {
        match probe {
            Err(err) if self.status == Status::Healthy => {
                debug!("health probe failed: {}", err);
                match self.gate.on_unhealthy().await {
                    Ok(()) => {
                        self.status = Status::Unhealthy;
                        self.ok_counter = 0;
                        warn!("health status changed to {}", self.status);
                    }
                    Err(err) => error!("health callback failed, status not changed: {}", err),
                }
            }
            Err(err) => debug!("health probe failed: {}", err),
            Ok(()) if self.status == Status::Unhealthy => {
                self.ok_counter += 1;
                if self.ok_counter >= HEALTHY_THRESHOLD {
                    match self.gate.on_healthy().await {
                        Ok(()) => {
                            self.status = Status::Healthy;
                            info!("health status changed to {}", self.status);
                        }
                        Err(err) => error!("health callback failed, status not changed: {}", err),
                    }
                }
            }
            Ok(()) => {}
        }
    }
}
