//! Node instances
//!
//! Polymorphic emulated nodes behind a uniform lifecycle contract. A
//! factory keyed by the declared type tag builds the concrete variant:
//! docker-backed hosts/servers/routers, qemu guests and junos guests.

pub mod docker;
pub mod junos;
pub mod qemu;
pub mod state;

use crate::config::EmulatorConfig;
use crate::daemon::DaemonClient;
use crate::error::{Error, Result};
use crate::hostbridge::HostBridge;
use crate::switch::SwitchInstance;
use crate::topology::{Endpoint, NodeSpec};
use crate::wiring::{LinkFactory, P2PSwitch};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

pub use state::{Lifecycle, NodeState};

/// Administrative state of an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfState {
    Up,
    Down,
}

impl IfState {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "up" => Ok(IfState::Up),
            "down" => Ok(IfState::Down),
            _ => Err(Error::Protocol(format!("invalid if state '{}'", value))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IfState::Up => "up",
            IfState::Down => "down",
        }
    }
}

/// One registered interface of a node.
///
/// The index doubles as the in-guest device name (`eth<index>`); the
/// wire field holds the host-side kernel interface name while the node
/// runs.
#[derive(Debug, Clone)]
pub struct InterfaceBinding {
    pub index: usize,
    pub peer: Endpoint,
    pub wire: Option<String>,
    pub state: IfState,
}

impl InterfaceBinding {
    pub fn new(index: usize, peer: Endpoint) -> Self {
        Self {
            index,
            peer,
            wire: None,
            state: IfState::Down,
        }
    }

    /// In-guest device name
    pub fn device(&self) -> String {
        format!("eth{}", self.index)
    }
}

/// Per-interface status entry for `status` answers
#[derive(Debug, Clone, serde::Serialize)]
pub struct InterfaceStatus {
    pub name: String,
    #[serde(rename = "isUp")]
    pub is_up: bool,
}

/// Per-node status entry for `status` answers
#[derive(Debug, Clone, serde::Serialize)]
pub struct NodeStatus {
    pub name: String,
    #[serde(rename = "isRunning")]
    pub is_running: bool,
    pub interfaces: Vec<InterfaceStatus>,
}

/// Death notification emitted by a liveness watcher
#[derive(Debug)]
pub enum NodeEvent {
    Exited {
        name: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Shared wiring infrastructure handed to nodes on start/stop.
///
/// Peer switches and bridges are looked up by name here, never held by
/// the node.
pub struct WiringCtx<'a> {
    pub links: &'a mut LinkFactory,
    pub p2p: &'a mut P2PSwitch,
    pub switches: &'a mut [SwitchInstance],
    pub bridges: &'a mut [HostBridge],
}

impl<'a> WiringCtx<'a> {
    pub fn switch_mut(&mut self, name: &str) -> Result<&mut SwitchInstance> {
        self.switches
            .iter_mut()
            .find(|sw| sw.name() == name)
            .ok_or_else(|| Error::InstanceNotFound(name.to_string()))
    }

    pub fn bridge_mut(&mut self, name: &str) -> Result<&mut HostBridge> {
        self.bridges
            .iter_mut()
            .find(|br| br.name() == name)
            .ok_or_else(|| Error::InstanceNotFound(name.to_string()))
    }
}

/// Construction environment shared by every node of a project
#[derive(Clone)]
pub struct NodeEnv {
    pub prj_id: String,
    pub config: EmulatorConfig,
    pub daemon: DaemonClient,
    /// Project-local directory holding per-node disk overlays
    pub image_dir: PathBuf,
    /// Project-local directory holding saved guest configurations
    pub conf_dir: PathBuf,
    pub events: mpsc::Sender<NodeEvent>,
}

/// Uniform capability set of every node variant
pub trait NodeInstance: Send {
    fn name(&self) -> &str;

    /// Full declared type tag, e.g. `docker.frr`
    fn node_type(&self) -> &str;

    fn state(&self) -> NodeState;

    fn is_running(&self) -> bool {
        self.state() == NodeState::Running
    }

    fn bindings(&self) -> &[InterfaceBinding];

    fn start(&mut self, ctx: &mut WiringCtx) -> Result<()>;

    fn stop(&mut self, ctx: &mut WiringCtx) -> Result<()>;

    /// Idempotent teardown of persistent backing resources
    fn clean(&mut self, ctx: &mut WiringCtx) -> Result<()>;

    /// Persist guest configuration under `conf_dir`
    fn save(&mut self, conf_dir: &Path) -> Result<()>;

    fn open_shell(&mut self, debug: bool) -> Result<()>;

    fn capture(&mut self, ctx: &mut WiringCtx, if_index: usize) -> Result<()>;

    fn set_if_state(
        &mut self,
        ctx: &mut WiringCtx,
        if_index: usize,
        state: IfState,
    ) -> Result<()>;

    /// Whether `save` should persist this node's configuration
    fn wants_save_state(&self) -> bool;

    /// Container name for copy operations; None for VM-backed nodes
    fn container_ref(&self) -> Option<String> {
        None
    }

    fn get_status(&self) -> NodeStatus {
        NodeStatus {
            name: self.name().to_string(),
            is_running: self.is_running(),
            interfaces: self
                .bindings()
                .iter()
                .map(|binding| InterfaceStatus {
                    name: binding.device(),
                    is_up: binding.state == IfState::Up,
                })
                .collect(),
        }
    }
}

/// Build a node instance from its declaration
pub fn build(spec: &NodeSpec, env: &NodeEnv) -> Result<Box<dyn NodeInstance>> {
    let (family, kind) = spec
        .type_tag
        .split_once('.')
        .ok_or_else(|| Error::TopologyParse(format!("node {} has wrong type", spec.name)))?;
    match family {
        "docker" => Ok(Box::new(docker::DockerNode::new(spec, kind, env)?)),
        "qemu" => Ok(Box::new(qemu::QemuNode::new(spec, kind, env)?)),
        "junos" => Ok(Box::new(junos::JunosNode::new(spec, kind, env)?)),
        _ => Err(Error::TopologyParse(format!(
            "node {} has wrong type",
            spec.name
        ))),
    }
}

/// Identifier of a connection endpoint inside wire names
pub fn endpoint_id(node: &str, if_index: usize) -> String {
    format!("{}-{}", node, if_index)
}

/// User owning created TAP devices
pub fn current_user() -> String {
    std::env::var("LOGNAME").unwrap_or_else(|_| "root".to_string())
}

/// X11 addressing for graphical helpers (terminal windows, wireshark)
pub fn x11_env() -> (String, String) {
    let display = std::env::var("DISPLAY").unwrap_or_else(|_| ":0.0".to_string());
    let xauth = std::env::var("XAUTHORITY").unwrap_or_else(|_| "null".to_string());
    (display, xauth)
}

/// Map a state machine rejection onto a node error
pub fn lifecycle_err(name: &str, err: state_machines::DynamicError) -> Error {
    Error::Lifecycle(name.to_string(), format!("{:?}", err))
}

/// Fail fast when an operation requires a running node
pub fn require_running(name: &str, state: NodeState) -> Result<()> {
    if state != NodeState::Running {
        return Err(Error::State {
            node: name.to_string(),
            expected: "Running",
            found: state.as_str(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_device_name() {
        let binding = InterfaceBinding::new(2, Endpoint::Null);
        assert_eq!(binding.device(), "eth2");
        assert_eq!(binding.state, IfState::Down);
    }

    #[test]
    fn test_if_state_parse() {
        assert_eq!(IfState::parse("up").unwrap(), IfState::Up);
        assert_eq!(IfState::parse("down").unwrap(), IfState::Down);
        assert!(IfState::parse("UP").is_err());
    }

    #[test]
    fn test_endpoint_id() {
        assert_eq!(endpoint_id("R1", 0), "R1-0");
    }

    #[test]
    fn test_require_running() {
        assert!(require_running("R1", NodeState::Running).is_ok());
        let err = require_running("R1", NodeState::Stopped).unwrap_err();
        assert!(matches!(err, Error::State { .. }));
    }
}
