//! Route policy: named match sets, policies built from statements, and
//! per-direction assignments with a default action.

use std::collections::HashMap;
use std::net::IpAddr;

use ipnetwork::Ipv4Network;

use super::error::Error;
use super::rib::PathSource;

/// One entry of a prefix set: base prefix plus the accepted mask range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrefixMatch {
    pub prefix: Ipv4Network,
    pub min_length: u8,
    pub max_length: u8,
}

impl PrefixMatch {
    /// Match exactly this prefix, nothing longer or shorter.
    pub fn exact(prefix: Ipv4Network) -> Self {
        Self {
            prefix,
            min_length: prefix.prefix(),
            max_length: prefix.prefix(),
        }
    }

    fn matches(&self, candidate: Ipv4Network) -> bool {
        self.prefix.contains(candidate.network())
            && candidate.prefix() >= self.prefix.prefix()
            && (self.min_length..=self.max_length).contains(&candidate.prefix())
    }
}

/// Named set referenced from policy statements.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DefinedSet {
    Prefix {
        name: String,
        prefixes: Vec<PrefixMatch>,
    },
    Neighbor {
        name: String,
        addresses: Vec<Ipv4Network>,
    },
}

impl DefinedSet {
    pub fn name(&self) -> &str {
        match self {
            DefinedSet::Prefix { name, .. } => name,
            DefinedSet::Neighbor { name, .. } => name,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteAction {
    Accept,
    Reject,
}

/// How the route entered the table, as seen by policy conditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteType {
    /// Originated by this speaker.
    Local,
    /// Learned from a peer.
    External,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyDirection {
    Import,
    Export,
}

/// Statement conditions; every condition present must match.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Conditions {
    pub prefix_set: Option<String>,
    pub neighbor_set: Option<String>,
    pub route_type: Option<RouteType>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Statement {
    pub name: String,
    pub conditions: Conditions,
    pub action: RouteAction,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Policy {
    pub name: String,
    pub statements: Vec<Statement>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyAssignment {
    pub direction: PolicyDirection,
    pub policies: Vec<String>,
    pub default_action: RouteAction,
}

/// A route under evaluation. On import the neighbor is where the route
/// came from; on export it is the peer the route would be sent to.
#[derive(Clone, Copy, Debug)]
pub struct RouteMeta {
    pub prefix: Ipv4Network,
    pub neighbor: Option<IpAddr>,
    pub source: PathSource,
}

#[derive(Debug, Default)]
struct Assignment {
    policies: Vec<String>,
    default_action: Option<RouteAction>,
}

/// All installed policy state plus the evaluator.
#[derive(Debug, Default)]
pub struct PolicyTable {
    defined_sets: HashMap<String, DefinedSet>,
    policies: HashMap<String, Policy>,
    import: Assignment,
    export: Assignment,
}

impl PolicyTable {
    pub fn add_defined_set(&mut self, set: DefinedSet) -> Result<(), Error> {
        let name = set.name().to_string();
        if self.defined_sets.contains_key(&name) {
            return Err(Error::DefinedSetExists(name));
        }
        self.defined_sets.insert(name, set);
        Ok(())
    }

    pub fn add_policy(&mut self, policy: Policy) -> Result<(), Error> {
        if self.policies.contains_key(&policy.name) {
            return Err(Error::PolicyExists(policy.name));
        }
        for statement in &policy.statements {
            for set in [&statement.conditions.prefix_set, &statement.conditions.neighbor_set]
                .into_iter()
                .flatten()
            {
                if !self.defined_sets.contains_key(set) {
                    return Err(Error::UnknownDefinedSet(set.clone()));
                }
            }
        }
        self.policies.insert(policy.name.clone(), policy);
        Ok(())
    }

    /// Append policies to a direction and (re)set its default action.
    pub fn add_assignment(&mut self, assignment: PolicyAssignment) -> Result<(), Error> {
        for name in &assignment.policies {
            if !self.policies.contains_key(name) {
                return Err(Error::UnknownPolicy(name.clone()));
            }
        }
        let slot = match assignment.direction {
            PolicyDirection::Import => &mut self.import,
            PolicyDirection::Export => &mut self.export,
        };
        slot.policies.extend(assignment.policies);
        slot.default_action = Some(assignment.default_action);
        Ok(())
    }

    /// First matching statement wins; the direction's default action
    /// applies otherwise. A direction with no assignment accepts.
    pub fn evaluate(&self, direction: PolicyDirection, route: &RouteMeta) -> RouteAction {
        let assignment = match direction {
            PolicyDirection::Import => &self.import,
            PolicyDirection::Export => &self.export,
        };
        let Some(default_action) = assignment.default_action else {
            return RouteAction::Accept;
        };
        for name in &assignment.policies {
            let Some(policy) = self.policies.get(name) else {
                continue;
            };
            for statement in &policy.statements {
                if self.statement_matches(statement, route) {
                    return statement.action;
                }
            }
        }
        default_action
    }

    fn statement_matches(&self, statement: &Statement, route: &RouteMeta) -> bool {
        let conditions = &statement.conditions;
        if let Some(set_name) = &conditions.prefix_set {
            match self.defined_sets.get(set_name) {
                Some(DefinedSet::Prefix { prefixes, .. }) => {
                    if !prefixes.iter().any(|p| p.matches(route.prefix)) {
                        return false;
                    }
                }
                _ => return false,
            }
        }
        if let Some(set_name) = &conditions.neighbor_set {
            let Some(IpAddr::V4(neighbor)) = route.neighbor else {
                return false;
            };
            match self.defined_sets.get(set_name) {
                Some(DefinedSet::Neighbor { addresses, .. }) => {
                    if !addresses.iter().any(|net| net.contains(neighbor)) {
                        return false;
                    }
                }
                _ => return false,
            }
        }
        if let Some(route_type) = conditions.route_type {
            let actual = match route.source {
                PathSource::Local => RouteType::Local,
                PathSource::Peer(_) => RouteType::External,
            };
            if actual != route_type {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speaker_table() -> PolicyTable {
        let mut table = PolicyTable::default();
        table
            .add_defined_set(DefinedSet::Prefix {
                name: "default-route".into(),
                prefixes: vec![PrefixMatch::exact("0.0.0.0/0".parse().unwrap())],
            })
            .unwrap();
        table
            .add_defined_set(DefinedSet::Prefix {
                name: "anycast-ip".into(),
                prefixes: vec![PrefixMatch::exact("10.0.0.1/32".parse().unwrap())],
            })
            .unwrap();
        table
            .add_defined_set(DefinedSet::Neighbor {
                name: "uplinks".into(),
                addresses: vec!["10.1.0.1/32".parse().unwrap(), "10.2.0.1/32".parse().unwrap()],
            })
            .unwrap();
        table
            .add_policy(Policy {
                name: "only-default-route".into(),
                statements: vec![Statement {
                    name: "allow-default-route".into(),
                    conditions: Conditions {
                        prefix_set: Some("default-route".into()),
                        neighbor_set: Some("uplinks".into()),
                        route_type: None,
                    },
                    action: RouteAction::Accept,
                }],
            })
            .unwrap();
        table
            .add_policy(Policy {
                name: "only-anycast-ip-import".into(),
                statements: vec![Statement {
                    name: "allow-anycast-ip-local".into(),
                    conditions: Conditions {
                        prefix_set: Some("anycast-ip".into()),
                        neighbor_set: None,
                        route_type: Some(RouteType::Local),
                    },
                    action: RouteAction::Accept,
                }],
            })
            .unwrap();
        table
            .add_policy(Policy {
                name: "only-anycast-ip-export".into(),
                statements: vec![Statement {
                    name: "allow-anycast-ip".into(),
                    conditions: Conditions {
                        prefix_set: Some("anycast-ip".into()),
                        neighbor_set: Some("uplinks".into()),
                        route_type: None,
                    },
                    action: RouteAction::Accept,
                }],
            })
            .unwrap();
        table
            .add_assignment(PolicyAssignment {
                direction: PolicyDirection::Import,
                policies: vec!["only-default-route".into(), "only-anycast-ip-import".into()],
                default_action: RouteAction::Reject,
            })
            .unwrap();
        table
            .add_assignment(PolicyAssignment {
                direction: PolicyDirection::Export,
                policies: vec!["only-anycast-ip-export".into()],
                default_action: RouteAction::Reject,
            })
            .unwrap();
        table
    }

    fn meta(prefix: &str, neighbor: Option<[u8; 4]>, source: PathSource) -> RouteMeta {
        RouteMeta {
            prefix: prefix.parse().unwrap(),
            neighbor: neighbor.map(IpAddr::from),
            source,
        }
    }

    #[test]
    fn test_import_accepts_default_from_uplink() {
        let table = speaker_table();
        let peer = IpAddr::from([10, 1, 0, 1]);
        let route = meta("0.0.0.0/0", Some([10, 1, 0, 1]), PathSource::Peer(peer));
        assert_eq!(
            table.evaluate(PolicyDirection::Import, &route),
            RouteAction::Accept
        );
    }

    #[test]
    fn test_import_rejects_other_prefixes() {
        let table = speaker_table();
        let peer = IpAddr::from([10, 1, 0, 1]);
        let route = meta("10.5.0.0/16", Some([10, 1, 0, 1]), PathSource::Peer(peer));
        assert_eq!(
            table.evaluate(PolicyDirection::Import, &route),
            RouteAction::Reject
        );
    }

    #[test]
    fn test_import_rejects_default_from_stranger() {
        let table = speaker_table();
        let peer = IpAddr::from([192, 0, 2, 7]);
        let route = meta("0.0.0.0/0", Some([192, 0, 2, 7]), PathSource::Peer(peer));
        assert_eq!(
            table.evaluate(PolicyDirection::Import, &route),
            RouteAction::Reject
        );
    }

    #[test]
    fn test_import_accepts_local_anycast() {
        let table = speaker_table();
        let route = meta("10.0.0.1/32", None, PathSource::Local);
        assert_eq!(
            table.evaluate(PolicyDirection::Import, &route),
            RouteAction::Accept
        );
    }

    #[test]
    fn test_export_allows_only_anycast_to_uplinks() {
        let table = speaker_table();
        let anycast = meta("10.0.0.1/32", Some([10, 2, 0, 1]), PathSource::Local);
        assert_eq!(
            table.evaluate(PolicyDirection::Export, &anycast),
            RouteAction::Accept
        );
        // Learned default must never leak back out.
        let default = meta(
            "0.0.0.0/0",
            Some([10, 2, 0, 1]),
            PathSource::Peer(IpAddr::from([10, 1, 0, 1])),
        );
        assert_eq!(
            table.evaluate(PolicyDirection::Export, &default),
            RouteAction::Reject
        );
    }

    #[test]
    fn test_no_assignment_accepts() {
        let table = PolicyTable::default();
        let route = meta("0.0.0.0/0", None, PathSource::Local);
        assert_eq!(
            table.evaluate(PolicyDirection::Import, &route),
            RouteAction::Accept
        );
    }

    #[test]
    fn test_duplicate_defined_set_rejected() {
        let mut table = PolicyTable::default();
        let set = DefinedSet::Neighbor {
            name: "uplinks".into(),
            addresses: vec![],
        };
        table.add_defined_set(set.clone()).unwrap();
        assert!(matches!(
            table.add_defined_set(set),
            Err(Error::DefinedSetExists(_))
        ));
    }

    #[test]
    fn test_policy_requires_known_sets() {
        let mut table = PolicyTable::default();
        let policy = Policy {
            name: "broken".into(),
            statements: vec![Statement {
                name: "s".into(),
                conditions: Conditions {
                    prefix_set: Some("missing".into()),
                    ..Conditions::default()
                },
                action: RouteAction::Accept,
            }],
        };
        assert!(matches!(
            table.add_policy(policy),
            Err(Error::UnknownDefinedSet(_))
        ));
    }

    #[test]
    fn test_prefix_match_ranges() {
        let exact = PrefixMatch::exact("0.0.0.0/0".parse().unwrap());
        assert!(exact.matches("0.0.0.0/0".parse().unwrap()));
        assert!(!exact.matches("10.0.0.0/8".parse().unwrap()));

        let range = PrefixMatch {
            prefix: "10.0.0.0/8".parse().unwrap(),
            min_length: 16,
            max_length: 24,
        };
        assert!(range.matches("10.5.0.0/16".parse().unwrap()));
        assert!(!range.matches("10.0.0.0/8".parse().unwrap()));
        assert!(!range.matches("10.5.1.0/28".parse().unwrap()));
        assert!(!range.matches("192.168.0.0/16".parse().unwrap()));
    }
}
