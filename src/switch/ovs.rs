//! OVS-backed switch instance

use crate::daemon::{DaemonClient, EXIST};
use crate::error::Result;
use crate::topology::SwitchSpec;
use tracing::{debug, warn};

/// A project-scoped OVS bridge
pub struct OvsSwitch {
    daemon: DaemonClient,
    name: String,
    sw_name: String,
    need_tap: bool,
    tap: Option<String>,
    interfaces: Vec<String>,
    started: bool,
}

impl OvsSwitch {
    pub fn new(daemon: DaemonClient, prj_id: &str, spec: &SwitchSpec) -> Self {
        Self {
            daemon,
            name: spec.name.clone(),
            sw_name: format!("{}.{}", prj_id, spec.name),
            need_tap: spec.tap,
            tap: None,
            interfaces: Vec::new(),
            started: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.started
    }

    pub fn tap_name(&self) -> Option<&str> {
        self.tap.as_deref()
    }

    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        debug!("Start ovswitch {}", self.sw_name);
        if self.daemon.ovs_create(&self.sw_name)? == EXIST {
            warn!("The switch {} already exists.", self.sw_name);
        }
        if self.need_tap {
            let tap = format!("{}.tap0", self.sw_name);
            self.daemon.tap_create(&tap, &crate::node::current_user())?;
            self.daemon.ovs_add_port(&self.sw_name, &tap)?;
            self.tap = Some(tap);
        }
        self.started = true;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        debug!("Stop ovswitch {}", self.sw_name);
        for if_name in &self.interfaces {
            self.daemon.ovs_del_port(&self.sw_name, if_name)?;
        }
        if let Some(tap) = self.tap.take() {
            self.daemon.ovs_del_port(&self.sw_name, &tap)?;
            self.daemon.tap_delete(&tap)?;
        }
        self.daemon.ovs_delete(&self.sw_name)?;
        self.started = false;
        self.interfaces.clear();
        Ok(())
    }

    pub fn attach_interface(&mut self, if_name: &str) -> Result<()> {
        if self.started && !self.has_interface(if_name) {
            self.daemon.ovs_add_port(&self.sw_name, if_name)?;
            self.interfaces.push(if_name.to_string());
        }
        Ok(())
    }

    pub fn detach_interface(&mut self, if_name: &str) -> Result<()> {
        if self.started
            && let Some(pos) = self.interfaces.iter().position(|name| name == if_name)
        {
            self.daemon.ovs_del_port(&self.sw_name, if_name)?;
            self.interfaces.remove(pos);
        }
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

    fn spec(name: &str) -> SwitchSpec {
        SwitchSpec {
            name: name.to_string(),
            kind: SwitchKind::Ovs,
            tap: false,
        }
    }

    #[test]
    fn test_start_is_idempotent() {
        let daemon = FakeDaemon::spawn();
        let mut sw = OvsSwitch::new(daemon.client(), "nl1", &spec("S1"));
        sw.start().unwrap();
        sw.start().unwrap();

        let creates = daemon
            .commands()
            .iter()
            .filter(|c| c.starts_with("ovs_create"))
            .count();
        assert_eq!(creates, 1);
    }

    #[test]
    fn test_existing_bridge_is_tolerated() {
        let daemon = FakeDaemon::spawn();
        daemon.set_reply("ovs_create", "OK EXIST");
        let mut sw = OvsSwitch::new(daemon.client(), "nl1", &spec("S1"));
        sw.start().unwrap();
        assert!(sw.is_running());
    }

    #[test]
    fn test_attach_detach_idempotent() {
        let daemon = FakeDaemon::spawn();
        let mut sw = OvsSwitch::new(daemon.client(), "nl1", &spec("S1"));
        sw.start().unwrap();

        sw.attach_interface("nl1.R1-0.S1").unwrap();
        sw.attach_interface("nl1.R1-0.S1").unwrap();
        assert!(sw.has_interface("nl1.R1-0.S1"));

        let adds = daemon
            .commands()
            .iter()
            .filter(|c| c.starts_with("ovs_add_port"))
            .count();
        assert_eq!(adds, 1);

        sw.detach_interface("nl1.R1-0.S1").unwrap();
        sw.detach_interface("nl1.R1-0.S1").unwrap();
        assert!(!sw.has_interface("nl1.R1-0.S1"));
    }

    #[test]
    fn test_attach_before_start_is_ignored() {
        let daemon = FakeDaemon::spawn();
        let mut sw = OvsSwitch::new(daemon.client(), "nl1", &spec("S1"));
        sw.attach_interface("nl1.R1-0.S1").unwrap();
        assert!(daemon.commands().is_empty());
    }

    #[test]
    fn test_stop_releases_ports() {
        let daemon = FakeDaemon::spawn();
        let mut sw = OvsSwitch::new(daemon.client(), "nl1", &spec("S1"));
        sw.start().unwrap();
        sw.attach_interface("nl1.H1-0.S1").unwrap();
        sw.stop().unwrap();

        let commands = daemon.commands();
        assert!(commands.contains(&"ovs_del_port nl1.S1 nl1.H1-0.S1".to_string()));
        assert!(commands.contains(&"ovs_delete nl1.S1".to_string()));
        assert!(!sw.is_running());
    }
}
