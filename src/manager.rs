//! Topology manager
//!
//! Turns a validated topology document into live instances and drives
//! their lifecycle. Loading is a two-pass build: switches and bridges
//! first (so interface targets exist), then node instantiation with
//! interface registration, then a second pass resolving every peer and
//! starting the nodes. Node-to-node peers may reference constructed but
//! not yet running instances, which is exactly why the passes are split.

use crate::check::check_topology;
use crate::config::EmulatorConfig;
use crate::daemon::DaemonClient;
use crate::error::{Error, Result};
use crate::hostbridge::HostBridge;
use crate::node::{
    self, IfState, NodeEnv, NodeEvent, NodeInstance, NodeStatus, WiringCtx,
};
use crate::rpc::messages::RpcSignal;
use crate::switch::SwitchInstance;
use crate::topology::{Endpoint, RawTopology, Topology, parse_endpoint};
use crate::wiring::{LinkFactory, P2PSwitch};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

pub struct TopologyManager {
    prj_id: String,
    config: EmulatorConfig,
    daemon: DaemonClient,
    topology_file: PathBuf,
    project_dir: PathBuf,
    conf_dir: PathBuf,
    nodes: Vec<Box<dyn NodeInstance>>,
    switches: Vec<SwitchInstance>,
    bridges: Vec<HostBridge>,
    links: LinkFactory,
    p2p: Option<P2PSwitch>,
    loaded: bool,
    events_tx: mpsc::Sender<NodeEvent>,
    events_rx: Option<mpsc::Receiver<NodeEvent>>,
    interrupt: Arc<AtomicBool>,
    signals: Option<broadcast::Sender<RpcSignal>>,
}

impl TopologyManager {
    pub fn new(
        daemon: DaemonClient,
        config: EmulatorConfig,
        prj_id: &str,
        topology_file: PathBuf,
        project_dir: PathBuf,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(100);
        Self {
            prj_id: prj_id.to_string(),
            config,
            links: LinkFactory::new(daemon.clone()),
            daemon,
            topology_file,
            conf_dir: project_dir.clone(),
            project_dir,
            nodes: Vec::new(),
            switches: Vec::new(),
            bridges: Vec::new(),
            p2p: None,
            loaded: false,
            events_tx,
            events_rx: Some(events_rx),
            interrupt: Arc::new(AtomicBool::new(false)),
            signals: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn topology_file(&self) -> &Path {
        &self.topology_file
    }

    /// Receiver for watcher death notifications; taken once by the server
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<NodeEvent>> {
        self.events_rx.take()
    }

    /// Cooperative cancellation flag observed during long operations
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    pub fn set_signal_sender(&mut self, sender: broadcast::Sender<RpcSignal>) {
        self.signals = Some(sender);
    }

    fn emit(&self, name: &str, attrs: serde_json::Value) {
        if let Some(sender) = &self.signals {
            let _ = sender.send(RpcSignal::new(name, attrs));
        }
    }

    fn check_interrupted(&self) -> Result<()> {
        if self.interrupt.swap(false, Ordering::SeqCst) {
            return Err(Error::Interrupted);
        }
        Ok(())
    }

    /// Parse and validate the topology document. Any validation error
    /// blocks activation entirely.
    pub fn check(&self) -> Result<Topology> {
        let content = std::fs::read_to_string(&self.topology_file)?;
        let raw = RawTopology::parse(&content)?;
        let report = check_topology(&raw);
        if !report.is_empty() {
            return Err(Error::Validation(report));
        }
        Topology::from_raw(&raw)
    }

    /// Build and start the whole topology
    pub fn load(&mut self) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        debug!("Start to load topology {}", self.topology_file.display());
        self.check_interrupted()?;
        let topology = self.check()?;

        self.conf_dir = self.project_dir.join(&topology.config_dir);
        let image_dir = self.project_dir.join(&topology.image_dir);
        std::fs::create_dir_all(&self.conf_dir)?;
        std::fs::create_dir_all(&image_dir)?;

        self.p2p = Some(P2PSwitch::new(self.daemon.clone(), &self.prj_id)?);

        // switches and bridges first so interface targets exist
        for spec in &topology.bridges {
            self.emit("loading", json!({"kind": "bridge", "name": &spec.name}));
            let mut bridge = HostBridge::new(self.daemon.clone(), &self.prj_id, spec);
            bridge.start()?;
            self.bridges.push(bridge);
        }
        for spec in &topology.switches {
            self.emit("loading", json!({"kind": "switch", "name": &spec.name}));
            let mut switch = SwitchInstance::build(spec, self.daemon.clone(), &self.prj_id);
            switch.start()?;
            self.switches.push(switch);
        }

        // first node pass: instantiate and register interfaces
        let env = NodeEnv {
            prj_id: self.prj_id.clone(),
            config: self.config.clone(),
            daemon: self.daemon.clone(),
            image_dir,
            conf_dir: self.conf_dir.clone(),
            events: self.events_tx.clone(),
        };
        for spec in &topology.nodes {
            self.check_interrupted()?;
            self.emit("loading", json!({"kind": "node", "name": &spec.name}));
            debug!("Create node instance {}", spec.name);
            self.nodes.push(node::build(spec, &env)?);
        }

        // second pass: resolve peers and start; a failing node is
        // reported but does not roll back already-started peers
        let mut failures = Vec::new();
        for index in 0..self.nodes.len() {
            self.check_interrupted()?;
            let name = self.nodes[index].name().to_string();
            self.emit("loading", json!({"kind": "start", "name": &name}));
            if let Err(e) = self.start_node_at(index) {
                error!("Unable to start node {}: {}", name, e);
                failures.push(format!("{}: {}", name, e));
            }
        }

        self.loaded = true;
        info!("Topology {} loaded", self.topology_file.display());
        if !failures.is_empty() {
            return Err(Error::resource("load", failures.join("; ")));
        }
        Ok(())
    }

    /// Tear the running topology down and rebuild it from the (possibly
    /// edited) working document
    pub fn reload(&mut self) -> Result<()> {
        self.close_instances();
        self.load()
    }

    fn resolve_node_at(&self, index: usize) -> Result<()> {
        for binding in self.nodes[index].bindings() {
            let found = match &binding.peer {
                Endpoint::Null => true,
                Endpoint::Switch(name) => self.switches.iter().any(|sw| sw.name() == name),
                Endpoint::Bridge(name) => self.bridges.iter().any(|br| br.name() == name),
                Endpoint::Node { name, .. } => self.nodes.iter().any(|n| n.name() == name),
            };
            if !found {
                return Err(Error::InstanceNotFound(binding.peer.to_string()));
            }
        }
        Ok(())
    }

    fn start_node_at(&mut self, index: usize) -> Result<()> {
        self.resolve_node_at(index)?;
        let Self {
            nodes,
            switches,
            bridges,
            links,
            p2p,
            ..
        } = self;
        let mut ctx = WiringCtx {
            links,
            p2p: p2p
                .as_mut()
                .ok_or_else(|| Error::Protocol("topology is not loaded".to_string()))?,
            switches,
            bridges,
        };
        nodes[index].start(&mut ctx)
    }

    fn stop_node_at(&mut self, index: usize) -> Result<()> {
        let Self {
            nodes,
            switches,
            bridges,
            links,
            p2p,
            ..
        } = self;
        let Some(p2p) = p2p.as_mut() else {
            return Ok(());
        };
        let mut ctx = WiringCtx {
            links,
            p2p,
            switches,
            bridges,
        };
        nodes[index].stop(&mut ctx)
    }

    fn node_index(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|node| node.name() == name)
    }

    /// Start one node, switch or bridge by name; a no-op when already
    /// running
    pub fn start(&mut self, name: &str) -> Result<()> {
        if let Some(index) = self.node_index(name) {
            return self.start_node_at(index);
        }
        if let Some(switch) = self.switches.iter_mut().find(|sw| sw.name() == name) {
            return switch.start();
        }
        if let Some(bridge) = self.bridges.iter_mut().find(|br| br.name() == name) {
            return bridge.start();
        }
        Err(Error::InstanceNotFound(name.to_string()))
    }

    /// Stop one node, switch or bridge by name; a no-op when already
    /// stopped
    pub fn stop(&mut self, name: &str) -> Result<()> {
        if let Some(index) = self.node_index(name) {
            return self.stop_node_at(index);
        }
        if let Some(switch) = self.switches.iter_mut().find(|sw| sw.name() == name) {
            return switch.stop();
        }
        if let Some(bridge) = self.bridges.iter_mut().find(|br| br.name() == name) {
            return bridge.stop();
        }
        Err(Error::InstanceNotFound(name.to_string()))
    }

    pub fn restart(&mut self, name: &str) -> Result<()> {
        self.stop(name)?;
        self.start(name)
    }

    /// Stop everything in reverse dependency order and release the P2P
    /// switch. Teardown continues past errors.
    pub fn stopall(&mut self) {
        for index in 0..self.nodes.len() {
            if let Err(e) = self.stop_node_at(index) {
                warn!("stopall: {}", e);
            }
        }
        for switch in &mut self.switches {
            if let Err(e) = switch.stop() {
                warn!("stopall: {}", e);
            }
        }
        for bridge in &mut self.bridges {
            if let Err(e) = bridge.stop() {
                warn!("stopall: {}", e);
            }
        }
        self.links.clear();
        if let Some(mut p2p) = self.p2p.take()
            && let Err(e) = p2p.close()
        {
            warn!("stopall: {}", e);
        }
        self.loaded = false;
    }

    /// Stop and clean every instance, dropping them all
    pub fn close_instances(&mut self) {
        for index in 0..self.nodes.len() {
            if let Err(e) = self.stop_node_at(index) {
                warn!("close: {}", e);
            }
        }
        for index in 0..self.nodes.len() {
            let Self {
                nodes,
                switches,
                bridges,
                links,
                p2p,
                ..
            } = self;
            if let Some(p2p) = p2p.as_mut() {
                let mut ctx = WiringCtx {
                    links,
                    p2p,
                    switches,
                    bridges,
                };
                if let Err(e) = nodes[index].clean(&mut ctx) {
                    warn!("close: {}", e);
                }
            }
        }
        for switch in &mut self.switches {
            if let Err(e) = switch.stop() {
                warn!("close: {}", e);
            }
        }
        for bridge in &mut self.bridges {
            if let Err(e) = bridge.stop() {
                warn!("close: {}", e);
            }
        }
        self.links.clear();
        if let Some(mut p2p) = self.p2p.take()
            && let Err(e) = p2p.close()
        {
            warn!("close: {}", e);
        }
        self.nodes.clear();
        self.switches.clear();
        self.bridges.clear();
        self.loaded = false;
    }

    /// Persist guest configuration for nodes flagged `save_state`
    pub fn save(&mut self, conf_path: Option<&Path>) -> Result<()> {
        let dir = conf_path.unwrap_or(&self.conf_dir).to_path_buf();
        std::fs::create_dir_all(&dir)?;
        for node in &mut self.nodes {
            if node.wants_save_state() && node.is_running() {
                debug!("Save state of node {}", node.name());
                node.save(&dir)?;
            }
        }
        Ok(())
    }

    pub fn nodes_status(&self) -> Vec<NodeStatus> {
        self.nodes.iter().map(|node| node.get_status()).collect()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes.iter().map(|node| node.name().to_string()).collect()
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.node_index(name).is_some()
    }

    /// Parse an `<node>.<if#>` reference
    fn parse_if_ref(&self, if_ref: &str) -> Result<(usize, usize)> {
        match parse_endpoint(if_ref) {
            Ok(Endpoint::Node { name, ifindex }) => {
                let index = self
                    .node_index(&name)
                    .ok_or_else(|| Error::NodeNotFound(name))?;
                Ok((index, ifindex))
            }
            _ => Err(Error::Protocol(format!(
                "invalid interface reference '{}'",
                if_ref
            ))),
        }
    }

    pub fn set_if_state(&mut self, if_ref: &str, state: IfState) -> Result<()> {
        let (index, ifindex) = self.parse_if_ref(if_ref)?;
        let Self {
            nodes,
            switches,
            bridges,
            links,
            p2p,
            ..
        } = self;
        let p2p = p2p
            .as_mut()
            .ok_or_else(|| Error::Protocol("topology is not loaded".to_string()))?;
        let mut ctx = WiringCtx {
            links,
            p2p,
            switches,
            bridges,
        };
        nodes[index].set_if_state(&mut ctx, ifindex, state)
    }

    pub fn capture(&mut self, if_ref: &str) -> Result<()> {
        let (index, ifindex) = self.parse_if_ref(if_ref)?;
        let Self {
            nodes,
            switches,
            bridges,
            links,
            p2p,
            ..
        } = self;
        let p2p = p2p
            .as_mut()
            .ok_or_else(|| Error::Protocol("topology is not loaded".to_string()))?;
        let mut ctx = WiringCtx {
            links,
            p2p,
            switches,
            bridges,
        };
        nodes[index].capture(&mut ctx, ifindex)
    }

    pub fn open_shell(&mut self, name: &str, debug: bool) -> Result<()> {
        let index = self
            .node_index(name)
            .ok_or_else(|| Error::NodeNotFound(name.to_string()))?;
        self.nodes[index].open_shell(debug)
    }

    /// Copy a file between the host and a container node; exactly one
    /// side carries a `<node>:` prefix
    pub fn copy(&mut self, source: &str, dest: &str) -> Result<()> {
        let resolve = |side: &str| -> Result<Option<(String, String)>> {
            match side.split_once(':') {
                Some((node, path)) => {
                    let index = self
                        .node_index(node)
                        .ok_or_else(|| Error::NodeNotFound(node.to_string()))?;
                    let container = self.nodes[index].container_ref().ok_or_else(|| {
                        Error::resource(
                            format!("copy {}", side),
                            "copy is only supported for container nodes".to_string(),
                        )
                    })?;
                    Ok(Some((container, path.to_string())))
                }
                None => Ok(None),
            }
        };

        match (resolve(source)?, resolve(dest)?) {
            (Some((container, path)), None) => self
                .daemon
                .docker_cp(&format!("{}:{}", container, path), dest),
            (None, Some((container, path))) => self
                .daemon
                .docker_cp(source, &format!("{}:{}", container, path)),
            _ => Err(Error::Protocol(
                "exactly one copy side must be prefixed with <node>:".to_string(),
            )),
        }
    }

    /// Watcher-reported death: converge the node to the stopped state
    /// and tell every console
    pub fn handle_node_exit(&mut self, name: &str, code: Option<i32>, stderr: &str) {
        warn!("node {} died (code {:?})", name, code);
        if let Err(e) = self.stop(name) {
            warn!("cleanup after {} died: {}", name, e);
        }
        let mut reason = stderr.trim().to_string();
        reason.truncate(200);
        self.emit(
            "node_state",
            json!({"name": name, "state": "stopped", "reason": reason}),
        );
    }
}
