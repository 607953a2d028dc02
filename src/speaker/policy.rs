//! Builds the policy objects the speaker installs at startup.
//!
//! Default-reject in both directions, with three narrow openings: accept
//! the default route from the uplinks, let our own anycast /32 into the
//! global table, and export nothing but that /32 back to the uplinks.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use crate::config::Config;
use crate::engine::{
    Conditions, DefinedSet, Policy, PolicyAssignment, PolicyDirection, PrefixMatch, RouteAction,
    RouteType, Statement,
};
use crate::error::Error;

pub(crate) const DEFAULT_ROUTE_SET: &str = "default-route";
pub(crate) const ANYCAST_IP_SET: &str = "anycast-ip";
pub(crate) const UPLINKS_SET: &str = "uplinks";
pub(crate) const ONLY_DEFAULT_ROUTE: &str = "only-default-route";
pub(crate) const ONLY_ANYCAST_IP_IMPORT: &str = "only-anycast-ip-import";
pub(crate) const ONLY_ANYCAST_IP_EXPORT: &str = "only-anycast-ip-export";

pub(crate) fn defined_sets(config: &Config) -> Result<Vec<DefinedSet>, Error> {
    let default_route = Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0)
        .map_err(|err| Error::Config(err.to_string()))?;
    let anycast = Ipv4Network::new(config.anycast_ip, 32)
        .map_err(|err| Error::Config(err.to_string()))?;
    let mut uplinks = Vec::with_capacity(config.neighbors.len());
    for neighbor in &config.neighbors {
        uplinks.push(
            Ipv4Network::new(neighbor.address, 32)
                .map_err(|err| Error::Config(err.to_string()))?,
        );
    }
    Ok(vec![
        DefinedSet::Prefix {
            name: DEFAULT_ROUTE_SET.to_string(),
            prefixes: vec![PrefixMatch::exact(default_route)],
        },
        DefinedSet::Prefix {
            name: ANYCAST_IP_SET.to_string(),
            prefixes: vec![PrefixMatch::exact(anycast)],
        },
        DefinedSet::Neighbor {
            name: UPLINKS_SET.to_string(),
            addresses: uplinks,
        },
    ])
}

pub(crate) fn policies() -> Vec<Policy> {
    vec![
        Policy {
            name: ONLY_DEFAULT_ROUTE.to_string(),
            statements: vec![Statement {
                name: "allow-default-route".to_string(),
                conditions: Conditions {
                    prefix_set: Some(DEFAULT_ROUTE_SET.to_string()),
                    neighbor_set: Some(UPLINKS_SET.to_string()),
                    route_type: None,
                },
                action: RouteAction::Accept,
            }],
        },
        Policy {
            name: ONLY_ANYCAST_IP_IMPORT.to_string(),
            statements: vec![Statement {
                name: "allow-anycast-ip-local".to_string(),
                conditions: Conditions {
                    prefix_set: Some(ANYCAST_IP_SET.to_string()),
                    neighbor_set: None,
                    route_type: Some(RouteType::Local),
                },
                action: RouteAction::Accept,
            }],
        },
        Policy {
            name: ONLY_ANYCAST_IP_EXPORT.to_string(),
            statements: vec![Statement {
                name: "allow-anycast-ip".to_string(),
                conditions: Conditions {
                    prefix_set: Some(ANYCAST_IP_SET.to_string()),
                    neighbor_set: Some(UPLINKS_SET.to_string()),
                    route_type: None,
                },
                action: RouteAction::Accept,
            }],
        },
    ]
}

pub(crate) fn assignments() -> [PolicyAssignment; 2] {
    [
        PolicyAssignment {
            direction: PolicyDirection::Import,
            policies: vec![
                ONLY_DEFAULT_ROUTE.to_string(),
                ONLY_ANYCAST_IP_IMPORT.to_string(),
            ],
            default_action: RouteAction::Reject,
        },
        PolicyAssignment {
            direction: PolicyDirection::Export,
            policies: vec![ONLY_ANYCAST_IP_EXPORT.to_string()],
            default_action: RouteAction::Reject,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Neighbor;

    fn test_config() -> Config {
        Config {
            anycast_ip: Ipv4Addr::new(10, 0, 0, 1),
            asn: 65001,
            neighbors: vec![
                Neighbor {
                    address: Ipv4Addr::new(10, 1, 0, 1),
                    asn: 65000,
                },
                Neighbor {
                    address: Ipv4Addr::new(10, 2, 0, 1),
                    asn: 65000,
                },
            ],
            health_check_url: None,
            update_fib_metric: None,
        }
    }

    #[test]
    fn test_defined_sets_from_config() {
        let sets = defined_sets(&test_config()).unwrap();
        assert_eq!(sets.len(), 3);

        match &sets[0] {
            DefinedSet::Prefix { name, prefixes } => {
                assert_eq!(name, DEFAULT_ROUTE_SET);
                assert_eq!(
                    prefixes,
                    &vec![PrefixMatch::exact("0.0.0.0/0".parse().unwrap())]
                );
            }
            other => panic!("expected prefix set, got {:?}", other),
        }
        match &sets[1] {
            DefinedSet::Prefix { name, prefixes } => {
                assert_eq!(name, ANYCAST_IP_SET);
                assert_eq!(
                    prefixes,
                    &vec![PrefixMatch::exact("10.0.0.1/32".parse().unwrap())]
                );
            }
            other => panic!("expected prefix set, got {:?}", other),
        }
        match &sets[2] {
            DefinedSet::Neighbor { name, addresses } => {
                assert_eq!(name, UPLINKS_SET);
                assert_eq!(
                    addresses,
                    &vec![
                        "10.1.0.1/32".parse().unwrap(),
                        "10.2.0.1/32".parse().unwrap()
                    ]
                );
            }
            other => panic!("expected neighbor set, got {:?}", other),
        }
    }

    #[test]
    fn test_assignments_default_reject() {
        let [import, export] = assignments();
        assert_eq!(import.direction, PolicyDirection::Import);
        assert_eq!(import.default_action, RouteAction::Reject);
        assert_eq!(
            import.policies,
            vec![
                ONLY_DEFAULT_ROUTE.to_string(),
                ONLY_ANYCAST_IP_IMPORT.to_string()
            ]
        );
        assert_eq!(export.direction, PolicyDirection::Export);
        assert_eq!(export.default_action, RouteAction::Reject);
        assert_eq!(export.policies, vec![ONLY_ANYCAST_IP_EXPORT.to_string()]);
    }
}
