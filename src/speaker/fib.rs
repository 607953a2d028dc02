//! RIB→FIB reconciler.
//!
//! Once a second, reads the default route from the BGP global table and
//! idempotently mirrors it into the kernel main table, switching between
//! single-path and multipath forms as the path set changes. The one route
//! it manages is deleted on shutdown.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use log::{error, info};
use netlink_packet_route::route::RouteMessage;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use super::Controller;
use crate::engine::Destination;
use crate::error::Error;
use crate::netlink::{self, RouteClient};

const UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// What one reconcile pass decided to do with the kernel route.
#[derive(Clone, Debug, PartialEq, Eq)]
enum RoutePlan {
    Keep,
    ReplaceSingle(Ipv4Addr),
    ReplaceMultipath(Vec<Ipv4Addr>),
}

pub struct FibUpdater {
    controller: Controller,
    metric: u32,
}

impl FibUpdater {
    pub fn new(controller: Controller, metric: u32) -> Self {
        Self { controller, metric }
    }

    pub async fn run(self, token: CancellationToken) -> Result<(), Error> {
        let client = RouteClient::connect()?;
        let mut ticker = interval_at(Instant::now() + UPDATE_INTERVAL, UPDATE_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("stop updating FIB");
                    return self.cleanup(&client).await;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.reconcile(&client).await {
                        error!("error setting default route: {}", err);
                    }
                }
            }
        }
    }

    async fn reconcile(&self, client: &RouteClient) -> Result<(), Error> {
        let destinations = self.controller.list_default_paths().await?;
        if destinations.is_empty() {
            // No default learned yet; leave whatever is installed alone.
            return Ok(());
        }
        if destinations.len() > 1 {
            return Err(Error::UnexpectedDefaultRoutes(destinations.len()));
        }
        let current = client.bgp_default_route(self.metric).await?;
        match plan_default_route(current.as_ref(), &destinations[0])? {
            RoutePlan::Keep => Ok(()),
            RoutePlan::ReplaceSingle(gateway) => {
                info!("setting single path default route via {}", gateway);
                client.replace_default_route(&[gateway], self.metric).await
            }
            RoutePlan::ReplaceMultipath(gateways) => {
                info!("setting multipath default route via {:?}", gateways);
                client.replace_default_route(&gateways, self.metric).await
            }
        }
    }

    async fn cleanup(&self, client: &RouteClient) -> Result<(), Error> {
        if client.bgp_default_route(self.metric).await?.is_some() {
            client.delete_default_route(self.metric).await?;
        }
        Ok(())
    }
}

/// Decide what the kernel route should become. Multipath comparison is
/// set-based and unordered; a cardinality mismatch or a change between
/// single-path and multipath form always rewrites.
fn plan_default_route(
    current: Option<&RouteMessage>,
    destination: &Destination,
) -> Result<RoutePlan, Error> {
    match destination.paths.len() {
        0 => Ok(RoutePlan::Keep),
        1 => {
            let next_hop = destination.paths[0].next_hop;
            if current.and_then(netlink::gateway) == Some(next_hop) {
                return Ok(RoutePlan::Keep);
            }
            match next_hop {
                IpAddr::V4(gateway) => Ok(RoutePlan::ReplaceSingle(gateway)),
                other => Err(Error::GatewayNotIpv4(other)),
            }
        }
        _ => {
            let next_hops: BTreeSet<IpAddr> =
                destination.paths.iter().map(|path| path.next_hop).collect();
            if let Some(existing) = current.and_then(netlink::multipath_gateways) {
                if existing.len() == next_hops.len()
                    && existing.iter().all(|gateway| next_hops.contains(gateway))
                {
                    return Ok(RoutePlan::Keep);
                }
            }
            let mut gateways = Vec::with_capacity(next_hops.len());
            for next_hop in next_hops {
                match next_hop {
                    IpAddr::V4(gateway) => gateways.push(gateway),
                    other => return Err(Error::GatewayNotIpv4(other)),
                }
            }
            Ok(RoutePlan::ReplaceMultipath(gateways))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Path, PathOrigin, PathSource};
    use crate::netlink::{multi_path_route, single_path_route};
    use ipnetwork::Ipv4Network;

    fn default_destination(next_hops: &[[u8; 4]]) -> Destination {
        let prefix: Ipv4Network = "0.0.0.0/0".parse().unwrap();
        Destination {
            prefix,
            paths: next_hops
                .iter()
                .map(|hop| Path {
                    prefix,
                    next_hop: IpAddr::from(*hop),
                    origin: PathOrigin::Igp,
                    as_path: vec![65000],
                    med: None,
                    local_pref: None,
                    source: PathSource::Peer(IpAddr::from(*hop)),
                })
                .collect(),
        }
    }

    #[test]
    fn test_single_path_noop_when_gateway_matches() {
        let destination = default_destination(&[[10, 1, 0, 1]]);
        let current = single_path_route(Ipv4Addr::new(10, 1, 0, 1), 170);
        let plan = plan_default_route(Some(&current), &destination).unwrap();
        assert_eq!(plan, RoutePlan::Keep);
    }

    #[test]
    fn test_single_path_replaces_on_change() {
        let destination = default_destination(&[[10, 9, 0, 1]]);
        let current = single_path_route(Ipv4Addr::new(10, 1, 0, 1), 170);
        let plan = plan_default_route(Some(&current), &destination).unwrap();
        assert_eq!(plan, RoutePlan::ReplaceSingle(Ipv4Addr::new(10, 9, 0, 1)));
    }

    #[test]
    fn test_single_path_installs_when_absent() {
        let destination = default_destination(&[[10, 1, 0, 1]]);
        let plan = plan_default_route(None, &destination).unwrap();
        assert_eq!(plan, RoutePlan::ReplaceSingle(Ipv4Addr::new(10, 1, 0, 1)));
    }

    #[test]
    fn test_multipath_noop_is_order_insensitive() {
        let destination = default_destination(&[[10, 1, 0, 1], [10, 2, 0, 1]]);
        let current = multi_path_route(
            &[Ipv4Addr::new(10, 2, 0, 1), Ipv4Addr::new(10, 1, 0, 1)],
            170,
        );
        let plan = plan_default_route(Some(&current), &destination).unwrap();
        assert_eq!(plan, RoutePlan::Keep);
    }

    #[test]
    fn test_multipath_cardinality_forces_rewrite() {
        let destination = default_destination(&[[10, 1, 0, 1], [10, 2, 0, 1]]);
        let current = multi_path_route(&[Ipv4Addr::new(10, 1, 0, 1)], 170);
        let plan = plan_default_route(Some(&current), &destination).unwrap();
        assert_eq!(
            plan,
            RoutePlan::ReplaceMultipath(vec![
                Ipv4Addr::new(10, 1, 0, 1),
                Ipv4Addr::new(10, 2, 0, 1),
            ])
        );
    }

    #[test]
    fn test_shape_change_single_to_multi_rewrites() {
        let destination = default_destination(&[[10, 1, 0, 1], [10, 2, 0, 1]]);
        let current = single_path_route(Ipv4Addr::new(10, 1, 0, 1), 170);
        let plan = plan_default_route(Some(&current), &destination).unwrap();
        assert!(matches!(plan, RoutePlan::ReplaceMultipath(_)));
    }

    #[test]
    fn test_shape_change_multi_to_single_rewrites() {
        let destination = default_destination(&[[10, 1, 0, 1]]);
        let current = multi_path_route(
            &[Ipv4Addr::new(10, 1, 0, 1), Ipv4Addr::new(10, 2, 0, 1)],
            170,
        );
        let plan = plan_default_route(Some(&current), &destination).unwrap();
        assert_eq!(plan, RoutePlan::ReplaceSingle(Ipv4Addr::new(10, 1, 0, 1)));
    }

    #[test]
    fn test_duplicate_next_hops_deduplicate() {
        let destination = default_destination(&[[10, 1, 0, 1], [10, 1, 0, 1]]);
        let plan = plan_default_route(None, &destination).unwrap();
        assert_eq!(
            plan,
            RoutePlan::ReplaceMultipath(vec![Ipv4Addr::new(10, 1, 0, 1)])
        );
    }

    #[test]
    fn test_non_ipv4_gateway_rejected() {
        let prefix: Ipv4Network = "0.0.0.0/0".parse().unwrap();
        let destination = Destination {
            prefix,
            paths: vec![Path {
                prefix,
                next_hop: "2001:db8::1".parse().unwrap(),
                origin: PathOrigin::Igp,
                as_path: vec![],
                med: None,
                local_pref: None,
                source: PathSource::Local,
            }],
        };
        assert!(matches!(
            plan_default_route(None, &destination),
            Err(Error::GatewayNotIpv4(_))
        ));
    }

    #[test]
    fn test_empty_destination_keeps_route() {
        let destination = default_destination(&[]);
        let plan = plan_default_route(None, &destination).unwrap();
        assert_eq!(plan, RoutePlan::Keep);
    }
}
