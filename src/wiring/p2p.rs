//! Point-to-point virtual switch
//!
//! Node-to-node wires share a single OVS bridge instead of one dedicated
//! bridge per pair. Each wire is isolated by a VLAN tag; both ends of a
//! logical connection resolve to the same tag through a reverse-ifname
//! lookup, so the pair sees each other and nothing else.

use crate::daemon::DaemonClient;
use crate::error::Result;
use tracing::debug;

/// Suffix of the shared bridge name
pub const P2P_NAME: &str = "p2p";

/// First VLAN tag handed out
const TAG_BASE: u16 = 10;

#[derive(Debug, Clone)]
struct Connection {
    ifname: String,
    tag: u16,
}

/// One shared bridge per running project
pub struct P2PSwitch {
    daemon: DaemonClient,
    prj_id: String,
    sw_name: String,
    connections: Vec<Connection>,
}

impl P2PSwitch {
    /// Create the shared bridge for a project
    pub fn new(daemon: DaemonClient, prj_id: &str) -> Result<Self> {
        let sw_name = format!("{}.{}", prj_id, P2P_NAME);
        daemon.ovs_create(&sw_name)?;
        Ok(Self {
            daemon,
            prj_id: prj_id.to_string(),
            sw_name,
            connections: Vec::new(),
        })
    }

    /// Plug one end of a node-to-node wire into the shared bridge
    pub fn add_connection(&mut self, ifname: &str) -> Result<u16> {
        let tag = self.get_tag(ifname);
        debug!("p2p: connect {} with tag {}", ifname, tag);
        self.connections.push(Connection {
            ifname: ifname.to_string(),
            tag,
        });
        self.daemon.ovs_add_port(&self.sw_name, ifname)?;
        self.daemon.ovs_port_vlan(ifname, tag)?;
        Ok(tag)
    }

    /// Unplug a wire; unknown wires are a no-op
    pub fn delete_connection(&mut self, ifname: &str) -> Result<()> {
        let Some(pos) = self.connections.iter().position(|c| c.ifname == ifname) else {
            return Ok(());
        };
        self.connections.remove(pos);
        self.daemon.ovs_del_port(&self.sw_name, ifname)
    }

    /// Resolve the tag for a wire: the already-connected far end's tag if
    /// present, otherwise a fresh allocation
    pub fn get_tag(&self, ifname: &str) -> u16 {
        let inverse = self.inverse_ifname(ifname);
        for connection in &self.connections {
            if connection.ifname == inverse {
                return connection.tag;
            }
        }
        TAG_BASE + self.connections.len() as u16
    }

    pub fn has_connection(&self, ifname: &str) -> bool {
        self.connections.iter().any(|c| c.ifname == ifname)
    }

    /// Delete the shared bridge
    pub fn close(&mut self) -> Result<()> {
        self.connections.clear();
        self.daemon.ovs_delete(&self.sw_name)
    }

    /// Swap the two endpoint components of a wire name:
    /// `<prj><a>.<b>` becomes `<prj><b>.<a>`
    fn inverse_ifname(&self, ifname: &str) -> String {
        let stripped = ifname.replace(&self.prj_id, "");
        match stripped.split_once('.') {
            Some((left, right)) => format!("{}{}.{}", self.prj_id, right, left),
            None => ifname.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeDaemon;
    use crate::wiring::wire_name;

    #[test]
    fn test_symmetric_tags() {
        let daemon = FakeDaemon::spawn();
        let mut p2p = P2PSwitch::new(daemon.client(), "nl1").unwrap();

        let left = wire_name("nl1", "R1-0", "R2-1");
        let right = wire_name("nl1", "R2-1", "R1-0");

        let tag = p2p.add_connection(&left).unwrap();
        assert_eq!(tag, 10);
        // queried from the far end, the same tag comes back
        assert_eq!(p2p.get_tag(&right), tag);
        assert_eq!(p2p.add_connection(&right).unwrap(), tag);
    }

    #[test]
    fn test_independent_pairs_get_distinct_tags() {
        let daemon = FakeDaemon::spawn();
        let mut p2p = P2PSwitch::new(daemon.client(), "nl1").unwrap();

        let a = p2p
            .add_connection(&wire_name("nl1", "R1-0", "R2-0"))
            .unwrap();
        p2p.add_connection(&wire_name("nl1", "R2-0", "R1-0"))
            .unwrap();
        let b = p2p
            .add_connection(&wire_name("nl1", "H1-0", "H2-0"))
            .unwrap();
        p2p.add_connection(&wire_name("nl1", "H2-0", "H1-0"))
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_delete_connection() {
        let daemon = FakeDaemon::spawn();
        let mut p2p = P2PSwitch::new(daemon.client(), "nl1").unwrap();

        let left = wire_name("nl1", "R1-0", "R2-1");
        p2p.add_connection(&left).unwrap();
        assert!(p2p.has_connection(&left));

        p2p.delete_connection(&left).unwrap();
        assert!(!p2p.has_connection(&left));
        // deleting again is a no-op
        p2p.delete_connection(&left).unwrap();
    }

    #[test]
    fn test_bridge_lifecycle_commands() {
        let daemon = FakeDaemon::spawn();
        let mut p2p = P2PSwitch::new(daemon.client(), "nl1").unwrap();
        p2p.close().unwrap();

        let commands = daemon.commands();
        assert_eq!(commands[0], "ovs_create nl1.p2p");
        assert_eq!(commands[1], "ovs_delete nl1.p2p");
    }
}
