//! Topology document model
//!
//! A topology is declared in `network.toml` inside a project archive:
//! a `[config]` section plus one table per node, switch and bridge.
//! Parsing happens in two steps: a raw pass that only enforces document
//! structure, and a typed pass (`Topology::from_raw`) run after the
//! checker chain has validated the raw document.

use crate::error::{Error, Result};
use ipnet::Ipv4Net;
use nom::{
    Parser,
    branch::alt,
    bytes::complete::tag,
    character::complete::digit1,
    combinator::{eof, map, map_res},
    sequence::{preceded, terminated},
};
use std::collections::BTreeMap;
use std::fmt;

/// Marker for an unattached interface
pub const NULL_PEER: &str = "__null__";

/// One end of a logical wire, as declared in the topology document.
///
/// Peer instances are always looked up by name at wiring time, never held
/// as owning references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Interface left unattached
    Null,
    /// Attached to a switch (`sw.<id>`)
    Switch(String),
    /// Attached to a host bridge (`br.<id>`)
    Bridge(String),
    /// Attached to another node's interface (`<node>.<if#>`)
    Node { name: String, ifindex: usize },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Null => write!(f, "{}", NULL_PEER),
            Endpoint::Switch(name) => write!(f, "sw.{}", name),
            Endpoint::Bridge(name) => write!(f, "br.{}", name),
            Endpoint::Node { name, ifindex } => write!(f, "{}.{}", name, ifindex),
        }
    }
}

fn ident1(input: &str) -> nom::IResult<&str, &str> {
    nom::bytes::complete::take_while1(|c: char| c.is_alphanumeric() || c == '_').parse(input)
}

fn parse_null(input: &str) -> nom::IResult<&str, Endpoint> {
    map(terminated(tag(NULL_PEER), eof), |_| Endpoint::Null).parse(input)
}

fn parse_switch(input: &str) -> nom::IResult<&str, Endpoint> {
    map(
        terminated(preceded(tag("sw."), ident1), eof),
        |name: &str| Endpoint::Switch(name.to_string()),
    )
    .parse(input)
}

fn parse_bridge(input: &str) -> nom::IResult<&str, Endpoint> {
    map(
        terminated(preceded(tag("br."), ident1), eof),
        |name: &str| Endpoint::Bridge(name.to_string()),
    )
    .parse(input)
}

fn parse_node_peer(input: &str) -> nom::IResult<&str, Endpoint> {
    let (input, name) = ident1(input)?;
    let (input, ifindex) =
        terminated(preceded(tag("."), map_res(digit1, str::parse::<usize>)), eof).parse(input)?;
    Ok((
        input,
        Endpoint::Node {
            name: name.to_string(),
            ifindex,
        },
    ))
}

/// Parse a peer descriptor string.
///
/// Malformed syntax is an error, never a runtime guess.
pub fn parse_endpoint(input: &str) -> Result<Endpoint> {
    // sw/br prefixes are reserved entity namespaces, so try them before
    // the generic node.if form
    alt((parse_null, parse_switch, parse_bridge, parse_node_peer))
        .parse(input)
        .map(|(_, ep)| ep)
        .map_err(|_| Error::TopologyParse(format!("invalid peer descriptor '{}'", input)))
}

/// A VRRP interface declaration for router nodes: `<if>|<vrid>|<addr>/<plen>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrrpSpec {
    pub interface: String,
    pub vrid: u8,
    pub address: Ipv4Net,
}

impl VrrpSpec {
    pub fn parse(entry: &str) -> Result<Self> {
        let mut parts = entry.split('|');
        let err = || Error::TopologyParse(format!("invalid vrrp entry '{}'", entry));
        let interface = parts.next().ok_or_else(err)?.to_string();
        let vrid = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
        let address = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(Self {
            interface,
            vrid,
            address,
        })
    }

    /// Parse a `;`-separated list of VRRP entries
    pub fn parse_list(value: &str) -> Result<Vec<Self>> {
        value.split(';').map(Self::parse).collect()
    }
}

/// Declared attributes of a node
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub name: String,
    /// Full type tag, e.g. `docker.frr` or `qemu.debian`
    pub type_tag: String,
    /// Declared peer per interface index; length equals `if_numbers`
    pub peers: Vec<Endpoint>,
    /// Telnet console port (qemu/junos nodes)
    pub console: Option<u16>,
    /// Guest memory override in MiB (qemu/junos nodes)
    pub memory: Option<u32>,
    /// Docker image override
    pub image: Option<String>,
    pub ipv6: bool,
    pub mpls: bool,
    pub vrfs: Vec<String>,
    pub vrrps: Vec<VrrpSpec>,
    /// Persist guest configuration on `save`
    pub save_state: bool,
}

impl NodeSpec {
    pub fn if_count(&self) -> usize {
        self.peers.len()
    }
}

/// Switch backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchKind {
    Ovs,
    Vde,
}

impl SwitchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchKind::Ovs => "ovs",
            SwitchKind::Vde => "vde",
        }
    }
}

/// Declared attributes of a switch
#[derive(Debug, Clone)]
pub struct SwitchSpec {
    pub name: String,
    pub kind: SwitchKind,
    /// Create a host TAP plugged into the switch (vde capture support)
    pub tap: bool,
}

/// Declared attributes of a host bridge
#[derive(Debug, Clone)]
pub struct BridgeSpec {
    pub name: String,
    pub host_if: String,
}

/// Raw topology document: structure enforced, values untyped.
///
/// The checker chain operates on this form so that schema violations are
/// reported as an aggregated validation report instead of parse failures.
#[derive(Debug, Clone, Default)]
pub struct RawTopology {
    pub config: toml::Table,
    pub nodes: BTreeMap<String, toml::Table>,
    pub switches: BTreeMap<String, toml::Table>,
    pub bridges: BTreeMap<String, toml::Table>,
}

fn section_tables(
    root: &toml::Table,
    section: &str,
) -> Result<BTreeMap<String, toml::Table>> {
    let mut out = BTreeMap::new();
    match root.get(section) {
        None => {}
        Some(toml::Value::Table(entries)) => {
            for (name, value) in entries {
                match value {
                    toml::Value::Table(table) => {
                        out.insert(name.clone(), table.clone());
                    }
                    _ => {
                        return Err(Error::TopologyParse(format!(
                            "[{}.{}] is not a table",
                            section, name
                        )));
                    }
                }
            }
        }
        Some(_) => {
            return Err(Error::TopologyParse(format!(
                "[{}] is not a table",
                section
            )));
        }
    }
    Ok(out)
}

impl RawTopology {
    /// Parse a topology document, enforcing only structural shape
    pub fn parse(content: &str) -> Result<Self> {
        let root: toml::Table = toml::from_str(content)
            .map_err(|e| Error::TopologyParse(e.to_string()))?;

        let config = match root.get("config") {
            Some(toml::Value::Table(table)) => table.clone(),
            Some(_) => {
                return Err(Error::TopologyParse("[config] is not a table".into()));
            }
            None => toml::Table::new(),
        };

        Ok(Self {
            config,
            nodes: section_tables(&root, "nodes")?,
            switches: section_tables(&root, "switches")?,
            bridges: section_tables(&root, "bridges")?,
        })
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }
}

/// Helpers to read typed values out of a raw entity table
pub fn table_str<'a>(table: &'a toml::Table, key: &str) -> Option<&'a str> {
    table.get(key).and_then(|v| v.as_str())
}

pub fn table_int(table: &toml::Table, key: &str) -> Option<i64> {
    table.get(key).and_then(|v| v.as_integer())
}

pub fn table_bool(table: &toml::Table, key: &str) -> Option<bool> {
    table.get(key).and_then(|v| v.as_bool())
}

/// Fully typed topology, built from a checked raw document
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub image_dir: String,
    pub config_dir: String,
    pub nodes: Vec<NodeSpec>,
    pub switches: Vec<SwitchSpec>,
    pub bridges: Vec<BridgeSpec>,
}

impl Topology {
    /// Build the typed model. Callers must run the checker chain first;
    /// violations that slip through still fail here, as parse errors.
    pub fn from_raw(raw: &RawTopology) -> Result<Self> {
        let image_dir = raw.config_str("image_dir").unwrap_or("images").to_string();
        let config_dir = raw
            .config_str("config_dir")
            .unwrap_or("configs")
            .to_string();

        let mut switches = Vec::new();
        for (name, table) in &raw.switches {
            let kind = match table_str(table, "type") {
                Some("ovs") => SwitchKind::Ovs,
                Some("vde") => SwitchKind::Vde,
                other => {
                    return Err(Error::TopologyParse(format!(
                        "switch {}: invalid type {:?}",
                        name, other
                    )));
                }
            };
            switches.push(SwitchSpec {
                name: name.clone(),
                kind,
                tap: table_bool(table, "tap").unwrap_or(false),
            });
        }

        let mut bridges = Vec::new();
        for (name, table) in &raw.bridges {
            let host_if = table_str(table, "host_if")
                .ok_or_else(|| {
                    Error::TopologyParse(format!("bridge {}: host_if is missing", name))
                })?
                .to_string();
            bridges.push(BridgeSpec {
                name: name.clone(),
                host_if,
            });
        }

        let mut nodes = Vec::new();
        for (name, table) in &raw.nodes {
            let type_tag = table_str(table, "type")
                .ok_or_else(|| Error::TopologyParse(format!("node {}: type is missing", name)))?
                .to_string();
            let if_count = table_int(table, "if_numbers").ok_or_else(|| {
                Error::TopologyParse(format!("node {}: if_numbers is missing", name))
            })? as usize;

            let mut peers = Vec::with_capacity(if_count);
            for index in 0..if_count {
                let key = format!("if{}", index);
                let value = table_str(table, &key).ok_or_else(|| {
                    Error::TopologyParse(format!("node {}: {} is not present", name, key))
                })?;
                peers.push(parse_endpoint(value)?);
            }

            let vrrps = match table_str(table, "vrrps") {
                Some(value) => VrrpSpec::parse_list(value)?,
                None => Vec::new(),
            };
            let vrfs = table_str(table, "vrfs")
                .map(|v| v.split(';').map(str::to_string).collect())
                .unwrap_or_default();

            nodes.push(NodeSpec {
                name: name.clone(),
                type_tag,
                peers,
                console: table_int(table, "console").map(|v| v as u16),
                memory: table_int(table, "memory").map(|v| v as u32),
                image: table_str(table, "image").map(str::to_string),
                ipv6: table_bool(table, "ipv6").unwrap_or(false),
                mpls: table_bool(table, "mpls").unwrap_or(false),
                vrfs,
                vrrps,
                save_state: table_bool(table, "save_state").unwrap_or(false),
            });
        }

        Ok(Self {
            image_dir,
            config_dir,
            nodes,
            switches,
            bridges,
        })
    }

    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn switch(&self, name: &str) -> Option<&SwitchSpec> {
        self.switches.iter().find(|s| s.name == name)
    }

    pub fn bridge(&self, name: &str) -> Option<&BridgeSpec> {
        self.bridges.iter().find(|b| b.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint_forms() {
        assert_eq!(parse_endpoint("__null__").unwrap(), Endpoint::Null);
        assert_eq!(
            parse_endpoint("sw.S1").unwrap(),
            Endpoint::Switch("S1".to_string())
        );
        assert_eq!(
            parse_endpoint("br.lan0").unwrap(),
            Endpoint::Bridge("lan0".to_string())
        );
        assert_eq!(
            parse_endpoint("R2.1").unwrap(),
            Endpoint::Node {
                name: "R2".to_string(),
                ifindex: 1
            }
        );
    }

    #[test]
    fn test_parse_endpoint_rejects_malformed() {
        assert!(parse_endpoint("").is_err());
        assert!(parse_endpoint("R2").is_err());
        assert!(parse_endpoint("R2.x").is_err());
        assert!(parse_endpoint("sw.").is_err());
        assert!(parse_endpoint("R2.1.2").is_err());
        assert!(parse_endpoint("R 2.1").is_err());
    }

    #[test]
    fn test_endpoint_display_round_trip() {
        for descriptor in ["__null__", "sw.S1", "br.b0", "H1.0"] {
            let ep = parse_endpoint(descriptor).unwrap();
            assert_eq!(ep.to_string(), descriptor);
        }
    }

    #[test]
    fn test_vrrp_parse() {
        let spec = VrrpSpec::parse("eth0|10|10.0.0.1/24").unwrap();
        assert_eq!(spec.interface, "eth0");
        assert_eq!(spec.vrid, 10);
        assert_eq!(spec.address.to_string(), "10.0.0.1/24");

        let list = VrrpSpec::parse_list("eth0|10|10.0.0.1/24;eth1|11|10.0.1.1/24").unwrap();
        assert_eq!(list.len(), 2);

        assert!(VrrpSpec::parse("eth0|10").is_err());
        assert!(VrrpSpec::parse("eth0|10|not-an-addr").is_err());
    }

    const SAMPLE: &str = r#"
[config]
image_dir = "images"
config_dir = "configs"

[nodes.R1]
type = "docker.frr"
if_numbers = 2
if0 = "sw.S1"
if1 = "H1.0"
mpls = true
vrfs = "red;blue"
save_state = true

[nodes.H1]
type = "docker.host"
if_numbers = 1
if0 = "R1.1"

[switches.S1]
type = "ovs"

[bridges.b0]
host_if = "eth0"
"#;

    #[test]
    fn test_typed_build() {
        let raw = RawTopology::parse(SAMPLE).unwrap();
        let topology = Topology::from_raw(&raw).unwrap();

        assert_eq!(topology.nodes.len(), 2);
        assert_eq!(topology.switches.len(), 1);
        assert_eq!(topology.bridges.len(), 1);

        let r1 = topology.node("R1").unwrap();
        assert_eq!(r1.type_tag, "docker.frr");
        assert_eq!(r1.if_count(), 2);
        assert_eq!(r1.peers[0], Endpoint::Switch("S1".to_string()));
        assert!(r1.mpls);
        assert!(r1.save_state);
        assert_eq!(r1.vrfs, vec!["red".to_string(), "blue".to_string()]);

        let h1 = topology.node("H1").unwrap();
        assert!(!h1.save_state);
        assert_eq!(
            h1.peers[0],
            Endpoint::Node {
                name: "R1".to_string(),
                ifindex: 1
            }
        );
    }

    #[test]
    fn test_missing_interface_key() {
        let raw = RawTopology::parse(
            r#"
[nodes.R1]
type = "docker.host"
if_numbers = 2
if0 = "__null__"
"#,
        )
        .unwrap();
        assert!(Topology::from_raw(&raw).is_err());
    }
}
