//! VDE-backed switch instance
//!
//! Runs an unprivileged `vde_switch` process per declared switch; qemu
//! guests plug into its management socket directly. An optional host TAP
//! (created through the daemon) gives capture tools a window into the
//! switch traffic.

use crate::daemon::DaemonClient;
use crate::error::{Error, Result};
use crate::topology::SwitchSpec;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use tracing::{debug, warn};

/// A switch backed by a vde_switch process
pub struct VdeSwitch {
    daemon: DaemonClient,
    name: String,
    sw_name: String,
    sock_path: PathBuf,
    need_tap: bool,
    tap: Option<String>,
    interfaces: Vec<String>,
    process: Option<Child>,
}

impl VdeSwitch {
    pub fn new(daemon: DaemonClient, prj_id: &str, spec: &SwitchSpec) -> Self {
        let sw_name = format!("{}.{}", prj_id, spec.name);
        Self {
            daemon,
            name: spec.name.clone(),
            sock_path: PathBuf::from(format!("/tmp/{}.ctl", sw_name)),
            sw_name,
            need_tap: spec.tap,
            tap: None,
            interfaces: Vec::new(),
            process: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sock_path(&self) -> &Path {
        &self.sock_path
    }

    pub fn tap_name(&self) -> Option<&str> {
        self.tap.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }

    pub fn start(&mut self) -> Result<()> {
        if self.process.is_some() {
            return Ok(());
        }
        debug!("Start vde switch {}", self.sw_name);

        let mut args = vec![
            "-sock".to_string(),
            self.sock_path.display().to_string(),
        ];
        if self.need_tap {
            let tap = format!("{}.tap0", self.sw_name);
            self.daemon.tap_create(&tap, &crate::node::current_user())?;
            args.push("-tap".to_string());
            args.push(tap.clone());
            self.tap = Some(tap);
        }

        let rendered = format!("vde_switch {}", args.join(" "));
        let child = Command::new("vde_switch")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::resource(rendered, e.to_string()))?;
        self.process = Some(child);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.process.take() else {
            return Ok(());
        };
        debug!("Stop vde switch {}", self.sw_name);
        if let Err(e) = child.kill() {
            warn!("Unable to stop vde switch {}: {}", self.sw_name, e);
        }
        let _ = child.wait();

        if self.sock_path.exists() {
            let _ = std::fs::remove_dir_all(&self.sock_path);
        }
        if let Some(tap) = self.tap.take() {
            self.daemon.tap_delete(&tap)?;
        }
        self.interfaces.clear();
        Ok(())
    }

    /// The wire set is tracked for status only; qemu guests connect to
    /// the management socket themselves.
    pub fn attach_interface(&mut self, if_name: &str) -> Result<()> {
        if self.is_running() && !self.has_interface(if_name) {
            self.interfaces.push(if_name.to_string());
        }
        Ok(())
    }

    pub fn detach_interface(&mut self, if_name: &str) -> Result<()> {
        self.interfaces.retain(|name| name != if_name);
        Ok(())
    }

    pub fn has_interface(&self, if_name: &str) -> bool {
        self.interfaces.iter().any(|name| name == if_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeDaemon;
    use crate::topology::SwitchKind;

    #[test]
    fn test_sock_path_is_project_scoped() {
        let daemon = FakeDaemon::spawn();
        let spec = SwitchSpec {
            name: "S2".to_string(),
            kind: SwitchKind::Vde,
            tap: false,
        };
        let sw = VdeSwitch::new(daemon.client(), "nl1", &spec);
        assert_eq!(sw.sock_path(), Path::new("/tmp/nl1.S2.ctl"));
        assert!(!sw.is_running());
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let daemon = FakeDaemon::spawn();
        let spec = SwitchSpec {
            name: "S2".to_string(),
            kind: SwitchKind::Vde,
            tap: true,
        };
        let mut sw = VdeSwitch::new(daemon.client(), "nl1", &spec);
        sw.stop().unwrap();
        assert!(daemon.commands().is_empty());
    }
}
