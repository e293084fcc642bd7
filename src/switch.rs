//! Switch instances
//!
//! Two backends realize a declared switch: an OVS bridge managed through
//! the privileged daemon, and a vde_switch process owned by the
//! orchestrator. Both track the set of attached wires so attach/detach
//! stay idempotent.

pub mod ovs;
pub mod vde;

use crate::daemon::DaemonClient;
use crate::error::Result;
use crate::topology::{SwitchKind, SwitchSpec};
pub use ovs::OvsSwitch;
pub use vde::VdeSwitch;

/// A running (or stopped) switch of either backend
pub enum SwitchInstance {
    Ovs(OvsSwitch),
    Vde(VdeSwitch),
}

impl SwitchInstance {
    /// Build an instance from its declaration
    pub fn build(spec: &SwitchSpec, daemon: DaemonClient, prj_id: &str) -> Self {
        match spec.kind {
            SwitchKind::Ovs => SwitchInstance::Ovs(OvsSwitch::new(daemon, prj_id, spec)),
            SwitchKind::Vde => SwitchInstance::Vde(VdeSwitch::new(daemon, prj_id, spec)),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            SwitchInstance::Ovs(sw) => sw.name(),
            SwitchInstance::Vde(sw) => sw.name(),
        }
    }

    pub fn kind(&self) -> SwitchKind {
        match self {
            SwitchInstance::Ovs(_) => SwitchKind::Ovs,
            SwitchInstance::Vde(_) => SwitchKind::Vde,
        }
    }

    pub fn is_running(&self) -> bool {
        match self {
            SwitchInstance::Ovs(sw) => sw.is_running(),
            SwitchInstance::Vde(sw) => sw.is_running(),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        match self {
            SwitchInstance::Ovs(sw) => sw.start(),
            SwitchInstance::Vde(sw) => sw.start(),
        }
    }

    pub fn stop(&mut self) -> Result<()> {
        match self {
            SwitchInstance::Ovs(sw) => sw.stop(),
            SwitchInstance::Vde(sw) => sw.stop(),
        }
    }

    pub fn attach_interface(&mut self, if_name: &str) -> Result<()> {
        match self {
            SwitchInstance::Ovs(sw) => sw.attach_interface(if_name),
            SwitchInstance::Vde(sw) => sw.attach_interface(if_name),
        }
    }

    pub fn detach_interface(&mut self, if_name: &str) -> Result<()> {
        match self {
            SwitchInstance::Ovs(sw) => sw.detach_interface(if_name),
            SwitchInstance::Vde(sw) => sw.detach_interface(if_name),
        }
    }

    pub fn has_interface(&self, if_name: &str) -> bool {
        match self {
            SwitchInstance::Ovs(sw) => sw.has_interface(if_name),
            SwitchInstance::Vde(sw) => sw.has_interface(if_name),
        }
    }

    /// Host TAP plugged into the switch, when one was requested
    pub fn tap_name(&self) -> Option<&str> {
        match self {
            SwitchInstance::Ovs(sw) => sw.tap_name(),
            SwitchInstance::Vde(sw) => sw.tap_name(),
        }
    }

    /// Management socket path for qemu wiring (vde only)
    pub fn vde_sock(&self) -> Option<&std::path::Path> {
        match self {
            SwitchInstance::Ovs(_) => None,
            SwitchInstance::Vde(sw) => Some(sw.sock_path()),
        }
    }

    pub fn get_status(&self) -> &'static str {
        if self.is_running() { "Started" } else { "Stopped" }
    }
}
