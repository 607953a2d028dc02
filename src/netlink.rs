//! Kernel FIB plumbing.
//!
//! Uses the raw rtnetlink request path so the route messages carry
//! exactly the tuple this speaker owns: IPv4, main table, protocol BGP
//! (186), unicast, global scope, operator-chosen metric.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

use futures::stream::{StreamExt, TryStreamExt};
use netlink_packet_core::{
    NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_REPLACE,
    NLM_F_REQUEST,
};
use netlink_packet_route::link::LinkAttribute;
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteHeader, RouteMessage, RouteNextHop, RouteProtocol,
    RouteScope, RouteType,
};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use rtnetlink::{new_connection, Handle};

use crate::error::Error;

const REPLACE_FLAGS: u16 = NLM_F_REQUEST | NLM_F_CREATE | NLM_F_REPLACE | NLM_F_ACK;
const DELETE_FLAGS: u16 = NLM_F_REQUEST | NLM_F_ACK;
const DUMP_FLAGS: u16 = NLM_F_REQUEST | NLM_F_DUMP;

/// Metric used by the operator-aid commands unless overridden.
pub const DEFAULT_CLI_METRIC: u32 = 50;

/// One netlink route socket. The reconciler opens its own; the CLI
/// helpers open one per invocation.
pub struct RouteClient {
    handle: Handle,
}

impl RouteClient {
    pub fn connect() -> Result<Self, Error> {
        let (connection, handle, _) = new_connection()?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    async fn execute(
        &self,
        message: RouteNetlinkMessage,
        flags: u16,
    ) -> Result<Vec<RouteMessage>, Error> {
        let mut request = NetlinkMessage::from(message);
        request.header.flags = flags;
        let mut handle = self.handle.clone();
        let mut responses = handle.request(request)?;
        let mut routes = Vec::new();
        while let Some(response) = responses.next().await {
            match response.payload {
                NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewRoute(route)) => {
                    routes.push(route)
                }
                NetlinkPayload::Error(err) if err.code.is_some() => {
                    return Err(rtnetlink::Error::NetlinkError(err).into());
                }
                _ => {}
            }
        }
        Ok(routes)
    }

    /// Dump the kernel routing table.
    pub async fn routes(&self) -> Result<Vec<RouteMessage>, Error> {
        self.execute(
            RouteNetlinkMessage::GetRoute(RouteMessage::default()),
            DUMP_FLAGS,
        )
        .await
    }

    /// Find the default route this speaker owns, if installed.
    pub async fn bgp_default_route(&self, metric: u32) -> Result<Option<RouteMessage>, Error> {
        Ok(self
            .routes()
            .await?
            .into_iter()
            .find(|route| is_bgp_default_route(route, metric)))
    }

    /// Install or replace the owned default route.
    pub async fn replace_default_route(
        &self,
        gateways: &[Ipv4Addr],
        metric: u32,
    ) -> Result<(), Error> {
        let message = match gateways {
            [gateway] => single_path_route(*gateway, metric),
            _ => multi_path_route(gateways, metric),
        };
        self.execute(RouteNetlinkMessage::NewRoute(message), REPLACE_FLAGS)
            .await
            .map(|_| ())
    }

    /// Delete the owned default route. The kernel matches it on the
    /// header tuple plus the metric.
    pub async fn delete_default_route(&self, metric: u32) -> Result<(), Error> {
        self.execute(
            RouteNetlinkMessage::DelRoute(bgp_route_message(metric)),
            DELETE_FLAGS,
        )
        .await
        .map(|_| ())
    }

    /// Interface index to name mapping.
    pub async fn link_names(&self) -> Result<HashMap<u32, String>, Error> {
        let mut links = self.handle.link().get().execute();
        let mut names = HashMap::new();
        while let Some(link) = links.try_next().await? {
            let name = link.attributes.iter().find_map(|attribute| match attribute {
                LinkAttribute::IfName(name) => Some(name.clone()),
                _ => None,
            });
            if let Some(name) = name {
                names.insert(link.header.index, name);
            }
        }
        Ok(names)
    }
}

/// Base message for the speaker-owned IPv4 default route.
pub fn bgp_route_message(metric: u32) -> RouteMessage {
    let mut message = RouteMessage::default();
    message.header.address_family = AddressFamily::Inet;
    message.header.table = RouteHeader::RT_TABLE_MAIN;
    message.header.protocol = RouteProtocol::Bgp;
    message.header.kind = RouteType::Unicast;
    message.header.scope = RouteScope::Universe;
    message.attributes.push(RouteAttribute::Priority(metric));
    message
}

pub fn single_path_route(gateway: Ipv4Addr, metric: u32) -> RouteMessage {
    let mut message = bgp_route_message(metric);
    message
        .attributes
        .push(RouteAttribute::Gateway(RouteAddress::Inet(gateway)));
    message
}

pub fn multi_path_route(gateways: &[Ipv4Addr], metric: u32) -> RouteMessage {
    let mut message = bgp_route_message(metric);
    let next_hops = gateways
        .iter()
        .map(|gateway| {
            let mut hop = RouteNextHop::default();
            hop.attributes
                .push(RouteAttribute::Gateway(RouteAddress::Inet(*gateway)));
            hop
        })
        .collect();
    message.attributes.push(RouteAttribute::MultiPath(next_hops));
    message
}

/// True when `route` is the default route this speaker manages.
///
/// Ownership is a convention: protocol BGP plus the configured metric.
/// Another agent writing routes with the same tuple would collide; the
/// metric is operator-controlled precisely to avoid that.
pub fn is_bgp_default_route(route: &RouteMessage, metric: u32) -> bool {
    route.header.protocol == RouteProtocol::Bgp
        && route.header.destination_prefix_length == 0
        && route.header.table == RouteHeader::RT_TABLE_MAIN
        && route.header.address_family == AddressFamily::Inet
        && route.header.kind == RouteType::Unicast
        && route.header.scope == RouteScope::Universe
        && priority(route) == Some(metric)
}

pub fn priority(route: &RouteMessage) -> Option<u32> {
    route.attributes.iter().find_map(|attribute| match attribute {
        RouteAttribute::Priority(priority) => Some(*priority),
        _ => None,
    })
}

pub fn gateway(route: &RouteMessage) -> Option<IpAddr> {
    route.attributes.iter().find_map(|attribute| match attribute {
        RouteAttribute::Gateway(address) => route_address_to_ip(address),
        _ => None,
    })
}

/// Gateways of the route's multipath attribute, if it has one.
pub fn multipath_gateways(route: &RouteMessage) -> Option<Vec<IpAddr>> {
    route.attributes.iter().find_map(|attribute| match attribute {
        RouteAttribute::MultiPath(hops) => Some(
            hops.iter()
                .filter_map(|hop| {
                    hop.attributes.iter().find_map(|a| match a {
                        RouteAttribute::Gateway(address) => route_address_to_ip(address),
                        _ => None,
                    })
                })
                .collect(),
        ),
        _ => None,
    })
}

fn destination(route: &RouteMessage) -> Option<IpAddr> {
    route.attributes.iter().find_map(|attribute| match attribute {
        RouteAttribute::Destination(address) => route_address_to_ip(address),
        _ => None,
    })
}

fn out_interface(route: &RouteMessage) -> Option<u32> {
    route.attributes.iter().find_map(|attribute| match attribute {
        RouteAttribute::Oif(index) => Some(*index),
        _ => None,
    })
}

fn route_address_to_ip(address: &RouteAddress) -> Option<IpAddr> {
    match address {
        RouteAddress::Inet(addr) => Some(IpAddr::V4(*addr)),
        RouteAddress::Inet6(addr) => Some(IpAddr::V6(*addr)),
        _ => None,
    }
}

/// Print the kernel routing table, one route per line (operator aid).
pub async fn print_routes() -> Result<(), Error> {
    let client = RouteClient::connect()?;
    let links = client.link_names().await?;
    for (i, route) in client.routes().await?.iter().enumerate() {
        let dst = match destination(route) {
            Some(ip) => format!("{}/{}", ip, route.header.destination_prefix_length),
            None => "default".to_string(),
        };
        let via = match gateway(route) {
            Some(ip) => format!("via {} ", ip),
            None => match multipath_gateways(route) {
                Some(hops) => {
                    let rendered: Vec<String> = hops.iter().map(|ip| ip.to_string()).collect();
                    format!("via [{}] ", rendered.join(", "))
                }
                None => String::new(),
            },
        };
        let device = out_interface(route)
            .and_then(|index| links.get(&index).cloned())
            .unwrap_or_else(|| "?".to_string());
        println!(
            "{:02}. {} {}dev {} table id {}",
            i, dst, via, device, route.header.table
        );
    }
    Ok(())
}

/// Install or replace the default route (operator aid).
pub async fn set_default_route(gateways: &[Ipv4Addr], metric: u32) -> Result<(), Error> {
    let client = RouteClient::connect()?;
    client.replace_default_route(gateways, metric).await
}

/// Delete the speaker-managed default route (operator aid).
pub async fn delete_default_route(metric: u32) -> Result<(), Error> {
    let client = RouteClient::connect()?;
    client.delete_default_route(metric).await
}
