//! Link factory
//!
//! Owns every veth pair and network namespace created for a project.
//! Creation is idempotent per interface name; namespaces are reference
//! counted so simultaneous multi-link teardown does not churn them.
//! Bookkeeping entries are updated before the daemon request (insert
//! then request, remove then release), keeping the tables authoritative
//! over what the kernel may hold.

use crate::daemon::DaemonClient;
use crate::error::Result;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Suffix of the derived peer interface name
const PEER_SUFFIX: &str = ".int0";

/// Derive the fixed peer name for a wire
pub fn peer_name(ifname: &str) -> String {
    format!("{}{}", ifname, PEER_SUFFIX)
}

#[derive(Debug, Clone)]
struct LinkRecord {
    peer: String,
    netns: Option<String>,
}

/// Factory for veth pairs and their target namespaces
pub struct LinkFactory {
    daemon: DaemonClient,
    links: HashMap<String, LinkRecord>,
    namespaces: HashSet<String>,
}

impl LinkFactory {
    pub fn new(daemon: DaemonClient) -> Self {
        Self {
            daemon,
            links: HashMap::new(),
            namespaces: HashSet::new(),
        }
    }

    /// Create a veth pair for `ifname`, attaching the peer end into
    /// `netns` when given. Returns the peer interface name.
    ///
    /// Calling twice with the same name is a no-op returning the same
    /// peer name.
    pub fn create(&mut self, ifname: &str, netns: Option<&str>) -> Result<String> {
        if let Some(record) = self.links.get(ifname) {
            warn!("Link {} already exists", ifname);
            return Ok(record.peer.clone());
        }

        let peer = peer_name(ifname);
        self.links.insert(
            ifname.to_string(),
            LinkRecord {
                peer: peer.clone(),
                netns: netns.map(str::to_string),
            },
        );
        if let Err(e) = self.daemon.link_create(ifname, &peer) {
            self.links.remove(ifname);
            return Err(e);
        }

        if let Some(ns) = netns {
            if !self.namespaces.contains(ns) {
                debug!("Create netns {} for link {}", ns, ifname);
                self.namespaces.insert(ns.to_string());
                if let Err(e) = self.daemon.netns_create(ns) {
                    self.namespaces.remove(ns);
                    return Err(e);
                }
            }
            self.daemon.link_netns(&peer, ns)?;
        }

        Ok(peer)
    }

    /// Delete a wire. The associated namespace is removed only when no
    /// remaining link references it.
    pub fn delete(&mut self, ifname: &str) -> Result<()> {
        let Some(record) = self.links.remove(ifname) else {
            return Ok(());
        };
        self.daemon.link_delete(ifname)?;

        if let Some(ns) = record.netns
            && !self.is_netns_used(&ns)
            && self.namespaces.remove(&ns)
        {
            debug!("Release netns {}", ns);
            self.daemon.netns_delete(&ns)?;
        }
        Ok(())
    }

    /// Tear down every remaining link and namespace, logging failures
    pub fn clear(&mut self) {
        for ifname in self.links.keys() {
            if let Err(e) = self.daemon.link_delete(ifname) {
                warn!("clear: {}", e);
            }
        }
        for ns in &self.namespaces {
            if let Err(e) = self.daemon.netns_delete(ns) {
                warn!("clear: {}", e);
            }
        }
        self.links.clear();
        self.namespaces.clear();
    }

    pub fn link_exists(&self, ifname: &str) -> bool {
        self.links.contains_key(ifname)
    }

    pub fn netns_exists(&self, netns: &str) -> bool {
        self.namespaces.contains(netns)
    }

    fn is_netns_used(&self, netns: &str) -> bool {
        self.links
            .values()
            .any(|record| record.netns.as_deref() == Some(netns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeDaemon;

    fn factory(daemon: &FakeDaemon) -> LinkFactory {
        LinkFactory::new(daemon.client())
    }

    #[test]
    fn test_create_is_idempotent() {
        let daemon = FakeDaemon::spawn();
        let mut links = factory(&daemon);

        let peer = links.create("nl1.R1.S1", None).unwrap();
        assert_eq!(peer, "nl1.R1.S1.int0");
        let again = links.create("nl1.R1.S1", None).unwrap();
        assert_eq!(again, peer);

        // only one creation reached the daemon
        let creates = daemon
            .commands()
            .iter()
            .filter(|c| c.starts_with("link_create"))
            .count();
        assert_eq!(creates, 1);
    }

    #[test]
    fn test_netns_reference_counting() {
        let daemon = FakeDaemon::spawn();
        let mut links = factory(&daemon);

        links.create("nl1.R1.S1", Some("4242")).unwrap();
        links.create("nl1.R1.S2", Some("4242")).unwrap();
        assert!(links.netns_exists("4242"));

        links.delete("nl1.R1.S1").unwrap();
        assert!(links.netns_exists("4242"), "namespace released too early");

        links.delete("nl1.R1.S2").unwrap();
        assert!(!links.netns_exists("4242"));

        let ns_deletes = daemon
            .commands()
            .iter()
            .filter(|c| c.starts_with("netns_delete"))
            .count();
        assert_eq!(ns_deletes, 1);
    }

    #[test]
    fn test_namespace_created_once() {
        let daemon = FakeDaemon::spawn();
        let mut links = factory(&daemon);

        links.create("nl1.R1.S1", Some("4242")).unwrap();
        links.create("nl1.R1.S2", Some("4242")).unwrap();

        let ns_creates = daemon
            .commands()
            .iter()
            .filter(|c| c.starts_with("netns_create"))
            .count();
        assert_eq!(ns_creates, 1);
    }

    #[test]
    fn test_delete_unknown_link_is_noop() {
        let daemon = FakeDaemon::spawn();
        let mut links = factory(&daemon);
        links.delete("nl1.zz").unwrap();
        assert!(daemon.commands().is_empty());
    }

    #[test]
    fn test_clear_releases_everything() {
        let daemon = FakeDaemon::spawn();
        let mut links = factory(&daemon);
        links.create("nl1.a", Some("100")).unwrap();
        links.create("nl1.b", Some("200")).unwrap();
        links.clear();
        assert!(!links.link_exists("nl1.a"));
        assert!(!links.netns_exists("100"));
    }
}
