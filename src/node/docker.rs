//! Docker-backed nodes
//!
//! One container per node, created at instantiation and started on
//! demand. Wires are veth pairs whose peer end is moved into the
//! container's network namespace (addressed by cached PID) and renamed
//! to its `eth<N>` device. Three kinds share the implementation: plain
//! hosts, servers and FRR routers with MPLS/VRF/VRRP setup.

use crate::daemon::DaemonClient;
use crate::error::{Error, Result};
use crate::node::{
    IfState, InterfaceBinding, Lifecycle, NodeEnv, NodeInstance, NodeState, WiringCtx,
    endpoint_id, lifecycle_err, require_running, x11_env,
};
use crate::topology::{Endpoint, NodeSpec, VrrpSpec};
use crate::wiring::wire_name;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Docker node kind, from the second component of the type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockerKind {
    Host,
    Server,
    Frr,
}

impl DockerKind {
    fn from_tag(kind: &str) -> Option<Self> {
        match kind {
            "host" => Some(DockerKind::Host),
            "server" => Some(DockerKind::Server),
            "frr" => Some(DockerKind::Frr),
            _ => None,
        }
    }

    fn shell(&self) -> &'static str {
        match self {
            DockerKind::Frr => "/usr/bin/vtysh",
            _ => "/bin/bash",
        }
    }

    /// Component of the persisted configuration file name
    fn conf_kind(&self) -> &'static str {
        match self {
            DockerKind::Frr => "frr",
            _ => "net",
        }
    }
}

/// In-guest location of the pushed network configuration
const NET_CONF_FILE: &str = "/tmp/custom.net.conf";
/// In-guest location of the FRR configuration
const FRR_CONF_FILE: &str = "/etc/frr/frr.conf";

pub struct DockerNode {
    name: String,
    type_tag: String,
    kind: DockerKind,
    daemon: DaemonClient,
    lifecycle: Lifecycle,
    prj_id: String,
    container_name: String,
    conf_dir: PathBuf,
    terminal: String,
    bindings: Vec<InterfaceBinding>,
    pid: Option<String>,
    ipv6: bool,
    mpls: bool,
    vrfs: Vec<String>,
    vrrps: Vec<VrrpSpec>,
    save_state: bool,
}

impl DockerNode {
    pub fn new(spec: &NodeSpec, kind: &str, env: &NodeEnv) -> Result<Self> {
        let kind = DockerKind::from_tag(kind).ok_or_else(|| {
            Error::TopologyParse(format!("{}: docker type {} is not valid", spec.name, kind))
        })?;
        let image = match &spec.image {
            Some(image) => image.clone(),
            None => env
                .config
                .docker_image(kind_tag(kind))
                .expect("kind tag is known")
                .to_string(),
        };

        let container_name = format!("{}.{}", env.prj_id, spec.name);
        debug!("Create docker container {}", container_name);
        env.daemon
            .docker_create(&spec.name, &container_name, &image)?;

        let bindings = spec
            .peers
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, peer)| InterfaceBinding::new(index, peer))
            .collect();

        let mut lifecycle = Lifecycle::new();
        lifecycle
            .ready()
            .map_err(|e| lifecycle_err(&spec.name, e))?;

        Ok(Self {
            name: spec.name.clone(),
            type_tag: spec.type_tag.clone(),
            kind,
            daemon: env.daemon.clone(),
            lifecycle,
            prj_id: env.prj_id.clone(),
            container_name,
            conf_dir: env.conf_dir.clone(),
            terminal: env.config.general.terminal.clone(),
            bindings,
            pid: None,
            ipv6: spec.ipv6,
            mpls: spec.mpls,
            vrfs: spec.vrfs.clone(),
            vrrps: spec.vrrps.clone(),
            save_state: spec.save_state,
        })
    }

    fn conf_path(&self, conf_dir: &Path) -> PathBuf {
        conf_dir.join(format!("{}.{}.conf", self.name, self.kind.conf_kind()))
    }

    /// Realize one interface: veth pair, peer end into the container,
    /// renamed to its target device
    fn wire_interface(&self, ctx: &mut WiringCtx, index: usize) -> Result<Option<String>> {
        let pid = self.pid.as_deref().expect("pid cached before wiring");
        let local = endpoint_id(&self.name, index);
        let binding = &self.bindings[index];

        let wire = match &binding.peer {
            Endpoint::Null => return Ok(None),
            Endpoint::Switch(sw_name) => {
                let wire = format!("{}.{}.{}", self.prj_id, local, sw_name);
                let peer_if = ctx.links.create(&wire, Some(pid))?;
                ctx.switch_mut(sw_name)?.attach_interface(&wire)?;
                self.daemon.docker_attach_interface(
                    &self.container_name,
                    &peer_if,
                    &binding.device(),
                )?;
                wire
            }
            Endpoint::Bridge(br_name) => {
                let wire = format!("{}.{}.{}", self.prj_id, local, br_name);
                let peer_if = ctx.links.create(&wire, Some(pid))?;
                ctx.bridge_mut(br_name)?.attach_interface(&wire)?;
                self.daemon.docker_attach_interface(
                    &self.container_name,
                    &peer_if,
                    &binding.device(),
                )?;
                wire
            }
            Endpoint::Node { name, ifindex } => {
                let wire = wire_name(&self.prj_id, &local, &endpoint_id(name, *ifindex));
                let peer_if = ctx.links.create(&wire, Some(pid))?;
                ctx.p2p.add_connection(&wire)?;
                self.daemon.docker_attach_interface(
                    &self.container_name,
                    &peer_if,
                    &binding.device(),
                )?;
                wire
            }
        };
        Ok(Some(wire))
    }

    /// Release one interface, continuing past errors
    fn unwire_interface(&self, ctx: &mut WiringCtx, index: usize) {
        let binding = &self.bindings[index];
        let Some(wire) = binding.wire.as_deref() else {
            return;
        };
        let detached = match &binding.peer {
            Endpoint::Null => Ok(()),
            Endpoint::Switch(sw_name) => ctx
                .switch_mut(sw_name)
                .and_then(|sw| sw.detach_interface(wire)),
            Endpoint::Bridge(br_name) => ctx
                .bridge_mut(br_name)
                .and_then(|br| br.detach_interface(wire)),
            Endpoint::Node { .. } => ctx.p2p.delete_connection(wire),
        };
        if let Err(e) = detached {
            warn!("{}: detach {}: {}", self.name, wire, e);
        }
        if let Err(e) = ctx.links.delete(wire) {
            warn!("{}: delete wire {}: {}", self.name, wire, e);
        }
    }

    fn exec(&self, cmd: &str) -> Result<()> {
        self.daemon.docker_exec(&self.container_name, cmd)
    }

    /// Router plumbing: sysctls and extra links before the daemons see
    /// the interfaces
    fn setup_routing(&self) -> Result<()> {
        if self.ipv6 {
            self.exec("sysctl -w net.ipv6.conf.all.disable_ipv6=0")?;
            if self.kind == DockerKind::Frr {
                self.exec("sysctl -w net.ipv6.conf.all.forwarding=1")?;
            }
        }
        if self.mpls {
            self.exec("sysctl -w net.mpls.platform_labels=100000")?;
            for binding in &self.bindings {
                if binding.peer != Endpoint::Null {
                    self.exec(&format!(
                        "sysctl -w net.mpls.conf.{}.input=1",
                        binding.device()
                    ))?;
                }
            }
        }
        for (index, vrf) in self.vrfs.iter().enumerate() {
            self.exec(&format!(
                "ip link add {} type vrf table {}",
                vrf,
                10 + index
            ))?;
            self.exec(&format!("ip link set {} up", vrf))?;
        }
        for vrrp in &self.vrrps {
            let device = format!("vrrp{}", vrrp.vrid);
            self.exec(&format!(
                "ip link add {} link {} type macvlan mode bridge",
                device, vrrp.interface
            ))?;
            self.exec(&format!("ip addr add {} dev {}", vrrp.address, device))?;
            self.exec(&format!("ip link set {} up", device))?;
        }
        Ok(())
    }

    /// Push saved configuration into the guest, when one exists
    fn load_configuration(&self) -> Result<()> {
        let conf_path = self.conf_path(&self.conf_dir);
        match self.kind {
            DockerKind::Host | DockerKind::Server => {
                if conf_path.is_file() {
                    let dest = format!("{}:{}", self.container_name, NET_CONF_FILE);
                    self.daemon
                        .docker_cp(&conf_path.display().to_string(), &dest)?;
                    self.exec(&format!("network-config.py -l {}", NET_CONF_FILE))?;
                }
            }
            DockerKind::Frr => {
                if conf_path.is_file() {
                    let dest = format!("{}:{}", self.container_name, FRR_CONF_FILE);
                    self.daemon
                        .docker_cp(&conf_path.display().to_string(), &dest)?;
                }
                self.exec("/usr/lib/frr/frrinit.sh restart")?;
            }
        }
        Ok(())
    }
}

fn kind_tag(kind: DockerKind) -> &'static str {
    match kind {
        DockerKind::Host => "host",
        DockerKind::Server => "server",
        DockerKind::Frr => "frr",
    }
}

impl NodeInstance for DockerNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn node_type(&self) -> &str {
        &self.type_tag
    }

    fn state(&self) -> NodeState {
        self.lifecycle.state()
    }

    fn bindings(&self) -> &[InterfaceBinding] {
        &self.bindings
    }

    fn start(&mut self, ctx: &mut WiringCtx) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        debug!("Start docker container {}", self.container_name);
        self.daemon.docker_start(&self.container_name)?;
        self.pid = Some(self.daemon.docker_pid(&self.container_name)?);

        for index in 0..self.bindings.len() {
            if let Some(wire) = self.wire_interface(ctx, index)? {
                self.bindings[index].wire = Some(wire);
                self.bindings[index].state = IfState::Up;
            }
        }

        self.setup_routing()?;
        self.load_configuration()?;
        self.lifecycle
            .start()
            .map_err(|e| lifecycle_err(&self.name, e))
    }

    fn stop(&mut self, ctx: &mut WiringCtx) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        debug!("Stop docker container {}", self.container_name);

        for index in 0..self.bindings.len() {
            self.unwire_interface(ctx, index);
            self.bindings[index].wire = None;
            self.bindings[index].state = IfState::Down;
        }

        self.daemon.docker_stop(&self.container_name)?;
        self.pid = None;
        self.lifecycle
            .stop()
            .map_err(|e| lifecycle_err(&self.name, e))
    }

    fn clean(&mut self, ctx: &mut WiringCtx) -> Result<()> {
        if self.state() == NodeState::Cleaned {
            return Ok(());
        }
        if self.is_running()
            && let Err(e) = self.stop(ctx)
        {
            warn!("{}: stop before clean: {}", self.name, e);
        }
        self.daemon.docker_rm(&self.container_name)?;
        self.lifecycle
            .clean()
            .map_err(|e| lifecycle_err(&self.name, e))
    }

    fn save(&mut self, conf_dir: &Path) -> Result<()> {
        require_running(&self.name, self.state())?;
        let conf_path = self.conf_path(conf_dir);
        match self.kind {
            DockerKind::Host | DockerKind::Server => {
                self.exec(&format!("network-config.py -s {}", NET_CONF_FILE))?;
                let source = format!("{}:{}", self.container_name, NET_CONF_FILE);
                self.daemon
                    .docker_cp(&source, &conf_path.display().to_string())
            }
            DockerKind::Frr => {
                self.exec("vtysh -w")?;
                let source = format!("{}:{}", self.container_name, FRR_CONF_FILE);
                self.daemon
                    .docker_cp(&source, &conf_path.display().to_string())
            }
        }
    }

    fn open_shell(&mut self, debug: bool) -> Result<()> {
        require_running(&self.name, self.state())?;
        let shell = if debug { "/bin/bash" } else { self.kind.shell() };
        let (display, xauth) = x11_env();
        self.daemon.docker_shell(
            &self.container_name,
            &self.name,
            shell,
            &display,
            &xauth,
            &self.terminal,
        )
    }

    fn capture(&mut self, _ctx: &mut WiringCtx, if_index: usize) -> Result<()> {
        require_running(&self.name, self.state())?;
        let binding = self
            .bindings
            .get(if_index)
            .ok_or_else(|| Error::InterfaceNotFound {
                node: self.name.clone(),
                index: if_index,
            })?;
        if binding.wire.is_none() {
            return Err(Error::resource(
                format!("capture {}.{}", self.name, if_index),
                "interface is not plugged".to_string(),
            ));
        }
        let (display, xauth) = x11_env();
        self.daemon
            .docker_capture(&display, &xauth, &self.container_name, &binding.device())
    }

    fn set_if_state(
        &mut self,
        _ctx: &mut WiringCtx,
        if_index: usize,
        state: IfState,
    ) -> Result<()> {
        require_running(&self.name, self.state())?;
        let device = self
            .bindings
            .get(if_index)
            .map(InterfaceBinding::device)
            .ok_or_else(|| Error::InterfaceNotFound {
                node: self.name.clone(),
                index: if_index,
            })?;
        self.exec(&format!("ip link set {} {}", device, state.as_str()))?;
        self.bindings[if_index].state = state;
        Ok(())
    }

    fn wants_save_state(&self) -> bool {
        self.save_state
    }

    fn container_ref(&self) -> Option<String> {
        Some(self.container_name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeDaemon;
    use crate::topology::parse_endpoint;
    use tokio::sync::mpsc;

    fn env(daemon: &FakeDaemon) -> NodeEnv {
        let (events, _rx) = mpsc::channel(8);
        NodeEnv {
            prj_id: "nl1".to_string(),
            config: crate::config::EmulatorConfig::default(),
            daemon: daemon.client(),
            image_dir: PathBuf::from("/tmp/images"),
            conf_dir: PathBuf::from("/tmp/configs"),
            events,
        }
    }

    fn spec(name: &str, kind: &str, peers: &[&str]) -> NodeSpec {
        NodeSpec {
            name: name.to_string(),
            type_tag: format!("docker.{}", kind),
            peers: peers.iter().map(|p| parse_endpoint(p).unwrap()).collect(),
            console: None,
            memory: None,
            image: None,
            ipv6: false,
            mpls: false,
            vrfs: Vec::new(),
            vrrps: Vec::new(),
            save_state: false,
        }
    }

    #[test]
    fn test_container_created_at_instantiation() {
        let daemon = FakeDaemon::spawn();
        let node = DockerNode::new(&spec("H1", "host", &["__null__"]), "host", &env(&daemon))
            .unwrap();
        assert_eq!(node.state(), NodeState::Stopped);
        assert_eq!(
            daemon.commands(),
            vec!["docker_create H1 nl1.H1 netloom/host".to_string()]
        );
    }

    #[test]
    fn test_invalid_kind_rejected() {
        let daemon = FakeDaemon::spawn();
        let result = DockerNode::new(&spec("H1", "xorp", &[]), "xorp", &env(&daemon));
        assert!(result.is_err());
    }

    #[test]
    fn test_shell_requires_running() {
        let daemon = FakeDaemon::spawn();
        let mut node =
            DockerNode::new(&spec("H1", "host", &["__null__"]), "host", &env(&daemon)).unwrap();
        assert!(matches!(
            node.open_shell(false),
            Err(Error::State { .. })
        ));
    }

    #[test]
    fn test_status_reports_interfaces() {
        let daemon = FakeDaemon::spawn();
        let node = DockerNode::new(
            &spec("H1", "host", &["__null__", "__null__"]),
            "host",
            &env(&daemon),
        )
        .unwrap();
        let status = node.get_status();
        assert_eq!(status.name, "H1");
        assert!(!status.is_running);
        assert_eq!(status.interfaces.len(), 2);
        assert_eq!(status.interfaces[1].name, "eth1");
        assert!(!status.interfaces[1].is_up);
    }
}
