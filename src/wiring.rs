//! Resource wiring layer
//!
//! Allocates and tears down the kernel resources backing logical wires:
//! the link factory owns veth pairs and network namespaces, the P2P
//! switch multiplexes node-to-node wires over one shared OVS bridge.
//! Both are constructed per project and passed down to node instances.

pub mod link;
pub mod p2p;

pub use link::LinkFactory;
pub use p2p::P2PSwitch;

/// Build the host-side wire name for a connection endpoint.
///
/// Endpoint components use `-` internally (`R1-0`) so the project/peer
/// separator dot stays unambiguous.
pub fn wire_name(prj_id: &str, local: &str, peer: &str) -> String {
    format!("{}{}.{}", prj_id, local, peer)
}
