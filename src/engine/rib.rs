use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use bgp_rs::Origin;
use ipnetwork::Ipv4Network;

/// Where a path entered the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathSource {
    /// Originated by this speaker.
    Local,
    /// Learned from the session with this peer.
    Peer(IpAddr),
}

impl fmt::Display for PathSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PathSource::Local => write!(f, "local"),
            PathSource::Peer(addr) => write!(f, "{}", addr),
        }
    }
}

/// BGP ORIGIN attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathOrigin {
    Igp,
    Egp,
    Incomplete,
}

impl PathOrigin {
    pub(crate) fn to_wire(self) -> Origin {
        match self {
            PathOrigin::Igp => Origin::IGP,
            PathOrigin::Egp => Origin::EGP,
            PathOrigin::Incomplete => Origin::INCOMPLETE,
        }
    }

    pub(crate) fn from_wire(origin: &Origin) -> Self {
        match origin {
            Origin::IGP => PathOrigin::Igp,
            Origin::EGP => PathOrigin::Egp,
            Origin::INCOMPLETE => PathOrigin::Incomplete,
        }
    }
}

impl fmt::Display for PathOrigin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            PathOrigin::Igp => "IGP",
            PathOrigin::Egp => "EGP",
            PathOrigin::Incomplete => "Incomplete",
        };
        write!(f, "{}", word)
    }
}

/// One route: a prefix plus the attributes this engine tracks.
/// Equality is structural.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Path {
    pub prefix: Ipv4Network,
    pub next_hop: IpAddr,
    pub origin: PathOrigin,
    pub as_path: Vec<u32>,
    pub med: Option<u32>,
    pub local_pref: Option<u32>,
    pub source: PathSource,
}

/// All paths known for one prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Destination {
    pub prefix: Ipv4Network,
    pub paths: Vec<Path>,
}

/// Global routing table: locally originated and learned paths.
///
/// Holds at most one path per (prefix, source); a re-announcement from
/// the same source replaces the previous path (implicit withdraw).
#[derive(Debug, Default)]
pub struct Rib {
    destinations: HashMap<Ipv4Network, Vec<Path>>,
}

impl Rib {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the path for (prefix, source).
    /// Returns false when an identical path was already present.
    pub fn insert(&mut self, path: Path) -> bool {
        let paths = self.destinations.entry(path.prefix).or_default();
        match paths.iter_mut().find(|p| p.source == path.source) {
            Some(existing) if *existing == path => false,
            Some(existing) => {
                *existing = path;
                true
            }
            None => {
                paths.push(path);
                true
            }
        }
    }

    /// Remove the path for (prefix, source), if any.
    pub fn remove(&mut self, prefix: Ipv4Network, source: PathSource) -> bool {
        let Some(paths) = self.destinations.get_mut(&prefix) else {
            return false;
        };
        let before = paths.len();
        paths.retain(|p| p.source != source);
        let removed = paths.len() != before;
        if paths.is_empty() {
            self.destinations.remove(&prefix);
        }
        removed
    }

    /// Drop every path learned from `peer`. Returns true if anything changed.
    pub fn remove_peer(&mut self, peer: IpAddr) -> bool {
        let mut removed = false;
        self.destinations.retain(|_, paths| {
            let before = paths.len();
            paths.retain(|p| p.source != PathSource::Peer(peer));
            removed |= paths.len() != before;
            !paths.is_empty()
        });
        removed
    }

    /// Destinations, optionally narrowed to one prefix, in prefix order.
    pub fn destinations(&self, filter: Option<Ipv4Network>) -> Vec<Destination> {
        let mut destinations: Vec<Destination> = self
            .destinations
            .iter()
            .filter(|(prefix, _)| filter.map_or(true, |f| **prefix == f))
            .map(|(prefix, paths)| Destination {
                prefix: *prefix,
                paths: paths.clone(),
            })
            .collect();
        destinations.sort_by_key(|d| (u32::from(d.prefix.network()), d.prefix.prefix()));
        destinations
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn path(prefix: &str, next_hop: [u8; 4], source: PathSource) -> Path {
        Path {
            prefix: prefix.parse().unwrap(),
            next_hop: IpAddr::from(next_hop),
            origin: PathOrigin::Igp,
            as_path: vec![],
            med: None,
            local_pref: None,
            source,
        }
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut rib = Rib::new();
        let p = path("10.0.0.1/32", [0, 0, 0, 0], PathSource::Local);
        assert!(rib.insert(p.clone()));
        assert!(!rib.insert(p));
        assert_eq!(rib.len(), 1);
    }

    #[test]
    fn test_same_source_replaces() {
        let mut rib = Rib::new();
        let peer = IpAddr::from([10, 1, 0, 1]);
        assert!(rib.insert(path("0.0.0.0/0", [10, 1, 0, 1], PathSource::Peer(peer))));
        assert!(rib.insert(path("0.0.0.0/0", [10, 1, 0, 2], PathSource::Peer(peer))));
        let destinations = rib.destinations(None);
        assert_eq!(destinations.len(), 1);
        assert_eq!(destinations[0].paths.len(), 1);
        assert_eq!(destinations[0].paths[0].next_hop, IpAddr::from([10, 1, 0, 2]));
    }

    #[test]
    fn test_distinct_sources_accumulate() {
        let mut rib = Rib::new();
        rib.insert(path(
            "0.0.0.0/0",
            [10, 1, 0, 1],
            PathSource::Peer(IpAddr::from([10, 1, 0, 1])),
        ));
        rib.insert(path(
            "0.0.0.0/0",
            [10, 2, 0, 1],
            PathSource::Peer(IpAddr::from([10, 2, 0, 1])),
        ));
        let destinations = rib.destinations(None);
        assert_eq!(destinations.len(), 1);
        assert_eq!(destinations[0].paths.len(), 2);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut rib = Rib::new();
        let p = path("10.0.0.1/32", [0, 0, 0, 0], PathSource::Local);
        rib.insert(p.clone());
        assert!(rib.remove(p.prefix, PathSource::Local));
        assert!(!rib.remove(p.prefix, PathSource::Local));
        assert!(rib.is_empty());
    }

    #[test]
    fn test_remove_peer_drops_only_their_paths() {
        let mut rib = Rib::new();
        let gone = IpAddr::from([10, 1, 0, 1]);
        let kept = IpAddr::from([10, 2, 0, 1]);
        rib.insert(path("0.0.0.0/0", [10, 1, 0, 1], PathSource::Peer(gone)));
        rib.insert(path("0.0.0.0/0", [10, 2, 0, 1], PathSource::Peer(kept)));
        rib.insert(path("10.0.0.1/32", [0, 0, 0, 0], PathSource::Local));
        assert!(rib.remove_peer(gone));
        assert!(!rib.remove_peer(gone));
        let destinations = rib.destinations(None);
        assert_eq!(destinations.len(), 2);
        let default = destinations
            .iter()
            .find(|d| d.prefix.prefix() == 0)
            .unwrap();
        assert_eq!(default.paths.len(), 1);
        assert_eq!(default.paths[0].source, PathSource::Peer(kept));
    }

    #[test]
    fn test_destinations_filter() {
        let mut rib = Rib::new();
        rib.insert(path("10.0.0.1/32", [0, 0, 0, 0], PathSource::Local));
        rib.insert(path(
            "0.0.0.0/0",
            [10, 1, 0, 1],
            PathSource::Peer(IpAddr::from([10, 1, 0, 1])),
        ));
        let default: Ipv4Network = Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0).unwrap();
        let destinations = rib.destinations(Some(default));
        assert_eq!(destinations.len(), 1);
        assert_eq!(destinations[0].prefix, default);
    }
}
