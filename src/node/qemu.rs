//! QEMU-backed nodes
//!
//! Each node runs a qemu process with a qcow2 overlay on a shared base
//! image and a serial console exposed on a telnet port. Interfaces are
//! TAPs plugged into OVS switches, host bridges or the P2P switch; vde
//! switches are reached through their management socket instead. A
//! dedicated watcher thread polls process liveness and reports an
//! unexpected exit over the node event channel, so a crashed guest
//! converges to the same state `stop()` would produce.

use crate::daemon::DaemonClient;
use crate::error::{Error, Result};
use crate::node::{
    IfState, InterfaceBinding, Lifecycle, NodeEnv, NodeEvent, NodeInstance, NodeState,
    WiringCtx, current_user, endpoint_id, lifecycle_err, require_running, x11_env,
};
use crate::topology::{Endpoint, NodeSpec, SwitchKind};
use crate::wiring::wire_name;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

const QEMU_BIN: &str = "qemu-system-x86_64";
const QEMU_IMG: &str = "qemu-img";

/// Counter for generating unique guest MAC addresses
static MAC_COUNTER: AtomicU32 = AtomicU32::new(1);

fn next_mac() -> String {
    let n = MAC_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("00:aa:00:60:{:02x}:{:02x}", (n >> 8) & 0xff, n & 0xff)
}

/// Liveness watcher handle: a thread owning the qemu child process
struct Watcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

fn spawn_watcher(name: String, mut child: Child, events: mpsc::Sender<NodeEvent>) -> Watcher {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    let handle = std::thread::spawn(move || {
        loop {
            if flag.load(Ordering::SeqCst) {
                // orchestrated stop: reap quietly
                let _ = child.wait();
                return;
            }
            match child.try_wait() {
                Ok(Some(status)) => {
                    if flag.load(Ordering::SeqCst) {
                        return;
                    }
                    let mut stderr = String::new();
                    if let Some(mut pipe) = child.stderr.take() {
                        let _ = pipe.read_to_string(&mut stderr);
                    }
                    error!(
                        "qemu node {} exited unexpectedly: {}",
                        name,
                        stderr.trim()
                    );
                    let _ = events.blocking_send(NodeEvent::Exited {
                        name,
                        code: status.code(),
                        stderr,
                    });
                    return;
                }
                Ok(None) => std::thread::sleep(Duration::from_secs(1)),
                Err(_) => return,
            }
        }
    });
    Watcher {
        stop,
        handle: Some(handle),
    }
}

pub struct QemuNode {
    name: String,
    type_tag: String,
    img_type: String,
    daemon: DaemonClient,
    lifecycle: Lifecycle,
    prj_id: String,
    overlay: PathBuf,
    base_image_dir: PathBuf,
    memory: u32,
    enable_kvm: bool,
    telnet_port: u16,
    terminal: String,
    bindings: Vec<InterfaceBinding>,
    events: mpsc::Sender<NodeEvent>,
    pid: Option<i32>,
    watcher: Option<Watcher>,
    shell_process: Option<Child>,
    capture_processes: HashMap<usize, Child>,
    save_state: bool,
}

impl QemuNode {
    pub fn new(spec: &NodeSpec, img_type: &str, env: &NodeEnv) -> Result<Self> {
        let overlay = env.image_dir.join(format!("{}.img", spec.name));
        let mut node = Self::with_overlay(spec, img_type, env, overlay)?;
        if !node.overlay.is_file() {
            node.create_overlay()?;
        }
        Ok(node)
    }

    /// Build a node around a caller-chosen overlay path without creating
    /// the disk; used by variants that rebuild it on every start.
    pub fn with_overlay(
        spec: &NodeSpec,
        img_type: &str,
        env: &NodeEnv,
        overlay: PathBuf,
    ) -> Result<Self> {
        let mut lifecycle = Lifecycle::new();
        lifecycle
            .ready()
            .map_err(|e| lifecycle_err(&spec.name, e))?;

        let bindings = spec
            .peers
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, peer)| InterfaceBinding::new(index, peer))
            .collect();

        Ok(Self {
            name: spec.name.clone(),
            type_tag: spec.type_tag.clone(),
            img_type: img_type.to_string(),
            daemon: env.daemon.clone(),
            lifecycle,
            prj_id: env.prj_id.clone(),
            overlay,
            base_image_dir: env.config.general.image_dir.clone(),
            memory: spec.memory.unwrap_or(env.config.qemu.memory),
            enable_kvm: env.config.qemu.enable_kvm,
            telnet_port: spec.console.ok_or_else(|| {
                Error::TopologyParse(format!("{}: key console is mandatory", spec.name))
            })?,
            terminal: env.config.general.terminal.clone(),
            bindings,
            events: env.events.clone(),
            pid: None,
            watcher: None,
            shell_process: None,
            capture_processes: HashMap::new(),
            save_state: spec.save_state,
        })
    }

    pub fn telnet_port(&self) -> u16 {
        self.telnet_port
    }

    pub fn overlay_path(&self) -> &Path {
        &self.overlay
    }

    /// Create the qcow2 overlay on top of the shared base image
    pub fn create_overlay(&self) -> Result<()> {
        let base = self
            .base_image_dir
            .join(format!("{}.img", self.img_type));
        let rendered = format!(
            "{} create -f qcow2 -b {} {}",
            QEMU_IMG,
            base.display(),
            self.overlay.display()
        );
        let output = Command::new(QEMU_IMG)
            .args(["create", "-f", "qcow2", "-b"])
            .arg(&base)
            .arg(&self.overlay)
            .output()
            .map_err(|e| Error::resource(rendered.clone(), e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::resource(rendered, stderr));
        }
        Ok(())
    }

    /// Wire one interface, returning the qemu arguments for its NIC
    fn wire_interface(&self, ctx: &mut WiringCtx, index: usize) -> Result<Option<NicArgs>> {
        let local = endpoint_id(&self.name, index);
        let binding = &self.bindings[index];

        match &binding.peer {
            Endpoint::Null => Ok(None),
            Endpoint::Switch(sw_name) => {
                let switch = ctx.switch_mut(sw_name)?;
                if switch.kind() == SwitchKind::Vde {
                    let sock = switch
                        .vde_sock()
                        .expect("vde switch has a socket")
                        .display()
                        .to_string();
                    switch.attach_interface(&local)?;
                    return Ok(Some(NicArgs::vde(index, &sock)));
                }
                let tap = format!("{}.{}.{}", self.prj_id, local, sw_name);
                self.daemon.tap_create(&tap, &current_user())?;
                ctx.switch_mut(sw_name)?.attach_interface(&tap)?;
                Ok(Some(NicArgs::tap(index, &tap)))
            }
            Endpoint::Bridge(br_name) => {
                let tap = format!("{}.{}.{}", self.prj_id, local, br_name);
                self.daemon.tap_create(&tap, &current_user())?;
                ctx.bridge_mut(br_name)?.attach_interface(&tap)?;
                Ok(Some(NicArgs::tap(index, &tap)))
            }
            Endpoint::Node { name, ifindex } => {
                let tap = wire_name(&self.prj_id, &local, &endpoint_id(name, *ifindex));
                self.daemon.tap_create(&tap, &current_user())?;
                ctx.p2p.add_connection(&tap)?;
                Ok(Some(NicArgs::tap(index, &tap)))
            }
        }
    }

    fn unwire_interface(&self, ctx: &mut WiringCtx, index: usize) {
        let binding = &self.bindings[index];
        let Some(tap) = binding.wire.as_deref() else {
            // vde wires have no host interface; drop the switch-side entry
            if let Endpoint::Switch(sw_name) = &binding.peer
                && let Ok(switch) = ctx.switch_mut(sw_name)
            {
                let _ = switch.detach_interface(&endpoint_id(&self.name, index));
            }
            return;
        };
        let detached = match &binding.peer {
            Endpoint::Null => Ok(()),
            Endpoint::Switch(sw_name) => ctx
                .switch_mut(sw_name)
                .and_then(|sw| sw.detach_interface(tap)),
            Endpoint::Bridge(br_name) => ctx
                .bridge_mut(br_name)
                .and_then(|br| br.detach_interface(tap)),
            Endpoint::Node { .. } => ctx.p2p.delete_connection(tap),
        };
        if let Err(e) = detached {
            warn!("{}: detach {}: {}", self.name, tap, e);
        }
        if let Err(e) = self.daemon.tap_delete(tap) {
            warn!("{}: delete tap {}: {}", self.name, tap, e);
        }
    }

    fn build_args(&self, nics: &[NicArgs]) -> Vec<String> {
        let mut args = Vec::new();
        if self.enable_kvm {
            args.push("-enable-kvm".to_string());
        }
        args.push("-hda".to_string());
        args.push(self.overlay.display().to_string());
        args.push("-m".to_string());
        args.push(self.memory.to_string());
        args.push("-nographic".to_string());
        args.push("-serial".to_string());
        args.push(format!(
            "telnet::{},server,nowait",
            self.telnet_port
        ));
        for nic in nics {
            args.extend(nic.args.iter().cloned());
        }
        args
    }
}

/// NIC argument pair for one interface
struct NicArgs {
    args: Vec<String>,
}

impl NicArgs {
    fn tap(index: usize, ifname: &str) -> Self {
        Self {
            args: vec![
                "-netdev".to_string(),
                format!(
                    "tap,id=net{},ifname={},script=no,downscript=no",
                    index, ifname
                ),
                "-device".to_string(),
                format!("e1000,netdev=net{},mac={}", index, next_mac()),
            ],
        }
    }

    fn vde(index: usize, sock: &str) -> Self {
        Self {
            args: vec![
                "-netdev".to_string(),
                format!("vde,id=net{},sock={}", index, sock),
                "-device".to_string(),
                format!("e1000,netdev=net{},mac={}", index, next_mac()),
            ],
        }
    }

    /// Host-side interface name, when this NIC is tap-backed
    fn tap_name(&self) -> Option<&str> {
        self.args
            .get(1)
            .filter(|arg| arg.starts_with("tap,"))
            .and_then(|arg| {
                arg.split(',')
                    .find_map(|part| part.strip_prefix("ifname="))
            })
    }
}

impl NodeInstance for QemuNode {
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
        debug!("Start qemu node {}", self.name);

        let mut nics = Vec::new();
        let mut wires: Vec<Option<String>> = vec![None; self.bindings.len()];
        for index in 0..self.bindings.len() {
            if let Some(nic) = self.wire_interface(ctx, index)? {
                if let Some(ifname) = nic.tap_name() {
                    wires[index] = Some(ifname.to_string());
                }
                nics.push(nic);
            }
        }

        let args = self.build_args(&nics);
        let rendered = format!("{} {}", QEMU_BIN, args.join(" "));
        let child = Command::new(QEMU_BIN)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::resource(rendered, e.to_string()))?;
        self.pid = Some(child.id() as i32);
        self.watcher = Some(spawn_watcher(
            self.name.clone(),
            child,
            self.events.clone(),
        ));

        for (index, wire) in wires.into_iter().enumerate() {
            let attached = wire.is_some()
                || !matches!(self.bindings[index].peer, Endpoint::Null);
            self.bindings[index].wire = wire;
            self.bindings[index].state = if attached { IfState::Up } else { IfState::Down };
        }

        self.lifecycle
            .start()
            .map_err(|e| lifecycle_err(&self.name, e))
    }

    fn stop(&mut self, ctx: &mut WiringCtx) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        debug!("Stop qemu node {}", self.name);

        if let Some(watcher) = self.watcher.as_mut() {
            watcher.stop.store(true, Ordering::SeqCst);
        }
        if let Some(pid) = self.pid.take() {
            // the process may already be gone after a watcher report
            let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
        }
        if let Some(mut watcher) = self.watcher.take()
            && let Some(handle) = watcher.handle.take()
        {
            let _ = handle.join();
        }

        for (_, mut process) in self.capture_processes.drain() {
            let _ = process.kill();
            let _ = process.wait();
        }
        if let Some(mut shell) = self.shell_process.take() {
            let _ = shell.kill();
            let _ = shell.wait();
        }

        for index in 0..self.bindings.len() {
            self.unwire_interface(ctx, index);
            self.bindings[index].wire = None;
            self.bindings[index].state = IfState::Down;
        }

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
        if self.overlay.is_file() {
            std::fs::remove_file(&self.overlay)?;
        }
        self.lifecycle
            .clean()
            .map_err(|e| lifecycle_err(&self.name, e))
    }

    fn save(&mut self, _conf_dir: &Path) -> Result<()> {
        // guest state lives in the overlay image, nothing to pull
        Ok(())
    }

    fn open_shell(&mut self, _debug: bool) -> Result<()> {
        require_running(&self.name, self.state())?;
        if let Some(shell) = self.shell_process.as_mut()
            && shell.try_wait()?.is_none()
        {
            return Err(Error::resource(
                format!("console {}", self.name),
                "The console is already opened".to_string(),
            ));
        }
        let rendered = self.terminal.replace("{title}", &self.name).replace(
            "{cmd}",
            &format!("telnet localhost {}", self.telnet_port),
        );
        let mut parts = rendered.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::Protocol("empty terminal command".to_string()))?
            .to_string();
        let child = Command::new(&program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::resource(rendered, e.to_string()))?;
        self.shell_process = Some(child);
        Ok(())
    }

    fn capture(&mut self, ctx: &mut WiringCtx, if_index: usize) -> Result<()> {
        require_running(&self.name, self.state())?;
        let binding = self
            .bindings
            .get(if_index)
            .cloned()
            .ok_or_else(|| Error::InterfaceNotFound {
                node: self.name.clone(),
                index: if_index,
            })?;
        if let Some(process) = self.capture_processes.get_mut(&if_index)
            && process.try_wait()?.is_none()
        {
            return Err(Error::resource(
                format!("capture {}.{}", self.name, if_index),
                "Capture process is already running".to_string(),
            ));
        }

        // vde wires have no host interface of their own; fall back to the
        // switch's capture tap
        let if_name = match binding.wire.clone() {
            Some(tap) => tap,
            None => match &binding.peer {
                Endpoint::Switch(sw_name) => ctx
                    .switch_mut(sw_name)?
                    .tap_name()
                    .map(str::to_string)
                    .ok_or_else(|| {
                        Error::resource(
                            format!("capture {}.{}", self.name, if_index),
                            "Unable to launch capture, no tap if exists on this switch"
                                .to_string(),
                        )
                    })?,
                _ => {
                    return Err(Error::resource(
                        format!("capture {}.{}", self.name, if_index),
                        "interface is not plugged".to_string(),
                    ));
                }
            },
        };

        let (display, xauth) = x11_env();
        let mut command = Command::new("wireshark");
        command.args(["-k", "-i", &if_name]).env("DISPLAY", display);
        if xauth != "null" {
            command.env("XAUTHORITY", xauth);
        }
        let child = command
            .spawn()
            .map_err(|e| Error::resource(format!("wireshark -k -i {}", if_name), e.to_string()))?;
        self.capture_processes.insert(if_index, child);
        Ok(())
    }

    fn set_if_state(
        &mut self,
        _ctx: &mut WiringCtx,
        if_index: usize,
        state: IfState,
    ) -> Result<()> {
        require_running(&self.name, self.state())?;
        let tap = self
            .bindings
            .get(if_index)
            .ok_or_else(|| Error::InterfaceNotFound {
                node: self.name.clone(),
                index: if_index,
            })?
            .wire
            .clone()
            .ok_or_else(|| {
                Error::resource(
                    format!("ifstate {}.{}", self.name, if_index),
                    "interface is not plugged".to_string(),
                )
            })?;
        match state {
            IfState::Up => self.daemon.ifup(&tap)?,
            IfState::Down => self.daemon.ifdown(&tap)?,
        }
        self.bindings[if_index].state = state;
        Ok(())
    }

    fn wants_save_state(&self) -> bool {
        self.save_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_addresses_are_unique() {
        let a = next_mac();
        let b = next_mac();
        assert_ne!(a, b);
        assert!(a.starts_with("00:aa:00:60:"));
    }

    #[test]
    fn test_nic_args_tap() {
        let nic = NicArgs::tap(0, "nl1.R1-0.S1");
        assert_eq!(nic.args[0], "-netdev");
        assert!(nic.args[1].contains("ifname=nl1.R1-0.S1"));
        assert!(nic.args[1].contains("script=no"));
        assert_eq!(nic.tap_name(), Some("nl1.R1-0.S1"));
    }

    #[test]
    fn test_nic_args_vde() {
        let nic = NicArgs::vde(1, "/tmp/nl1.S2.ctl");
        assert!(nic.args[1].contains("sock=/tmp/nl1.S2.ctl"));
        assert_eq!(nic.tap_name(), None);
    }

    #[test]
    fn test_watcher_reports_unexpected_exit() {
        let (tx, mut rx) = mpsc::channel(1);
        let child = Command::new("false")
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let mut watcher = spawn_watcher("R1".to_string(), child, tx);
        watcher.handle.take().unwrap().join().unwrap();

        match rx.try_recv().unwrap() {
            NodeEvent::Exited { name, code, .. } => {
                assert_eq!(name, "R1");
                assert_eq!(code, Some(1));
            }
        }
    }

    #[test]
    fn test_watcher_is_silent_on_orchestrated_stop() {
        let (tx, mut rx) = mpsc::channel(1);
        let child = Command::new("sleep")
            .arg("30")
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let pid = child.id() as i32;
        let mut watcher = spawn_watcher("R1".to_string(), child, tx);

        watcher.stop.store(true, Ordering::SeqCst);
        kill(Pid::from_raw(pid), Signal::SIGTERM).unwrap();
        watcher.handle.take().unwrap().join().unwrap();
        assert!(rx.try_recv().is_err());
    }
}
