//! Host bridge instance
//!
//! A Linux bridge enslaving a physical host interface, giving emulated
//! nodes a path to the outside world.

use crate::daemon::{DaemonClient, EXIST};
use crate::error::Result;
use crate::topology::BridgeSpec;
use tracing::{debug, warn};

pub struct HostBridge {
    daemon: DaemonClient,
    name: String,
    br_name: String,
    host_if: String,
    interfaces: Vec<String>,
    started: bool,
}

impl HostBridge {
    pub fn new(daemon: DaemonClient, prj_id: &str, spec: &BridgeSpec) -> Self {
        Self {
            daemon,
            name: spec.name.clone(),
            br_name: format!("{}.{}", prj_id, spec.name),
            host_if: spec.host_if.clone(),
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

    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        debug!("Start bridge {}", self.br_name);
        if self.daemon.br_create(&self.br_name)? == EXIST {
            warn!("The bridge {} already exists.", self.br_name);
        }
        self.daemon.ifup(&self.host_if)?;
        self.daemon.br_addif(&self.br_name, &self.host_if)?;
        self.started = true;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        debug!("Stop bridge {}", self.br_name);
        for if_name in &self.interfaces {
            self.daemon.br_delif(&self.br_name, if_name)?;
        }
        self.daemon.br_delif(&self.br_name, &self.host_if)?;
        self.daemon.br_delete(&self.br_name)?;
        self.started = false;
        self.interfaces.clear();
        Ok(())
    }

    pub fn attach_interface(&mut self, if_name: &str) -> Result<()> {
        if self.started && !self.has_interface(if_name) {
            self.daemon.br_addif(&self.br_name, if_name)?;
            self.interfaces.push(if_name.to_string());
        }
        Ok(())
    }

    pub fn detach_interface(&mut self, if_name: &str) -> Result<()> {
        if self.started
            && let Some(pos) = self.interfaces.iter().position(|name| name == if_name)
        {
            self.daemon.br_delif(&self.br_name, if_name)?;
            self.interfaces.remove(pos);
        }
        Ok(())
    }

    pub fn has_interface(&self, if_name: &str) -> bool {
        self.interfaces.iter().any(|name| name == if_name)
    }

    pub fn get_status(&self) -> &'static str {
        if self.started { "Started" } else { "Stopped" }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeDaemon;

    fn spec() -> BridgeSpec {
        BridgeSpec {
            name: "b0".to_string(),
            host_if: "eth0".to_string(),
        }
    }

    #[test]
    fn test_start_enslaves_host_if() {
        let daemon = FakeDaemon::spawn();
        let mut bridge = HostBridge::new(daemon.client(), "nl1", &spec());
        bridge.start().unwrap();

        let commands = daemon.commands();
        assert_eq!(commands[0], "br_create nl1.b0");
        assert_eq!(commands[1], "ifup eth0");
        assert_eq!(commands[2], "br_addif nl1.b0 eth0");
    }

    #[test]
    fn test_existing_bridge_is_tolerated() {
        let daemon = FakeDaemon::spawn();
        daemon.set_reply("br_create", "OK EXIST");
        let mut bridge = HostBridge::new(daemon.client(), "nl1", &spec());
        bridge.start().unwrap();
        assert!(bridge.is_running());
    }

    #[test]
    fn test_attach_detach() {
        let daemon = FakeDaemon::spawn();
        let mut bridge = HostBridge::new(daemon.client(), "nl1", &spec());
        bridge.start().unwrap();

        bridge.attach_interface("nl1.H1-0.b0").unwrap();
        bridge.attach_interface("nl1.H1-0.b0").unwrap();
        assert!(bridge.has_interface("nl1.H1-0.b0"));

        let adds = daemon
            .commands()
            .iter()
            .filter(|c| c.starts_with("br_addif nl1.b0 nl1."))
            .count();
        assert_eq!(adds, 1);

        bridge.stop().unwrap();
        assert!(!bridge.has_interface("nl1.H1-0.b0"));
    }
}
