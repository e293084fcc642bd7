//! Daemon client
//!
//! One method per daemon verb. Command lines are validated against the
//! shared verb table before any socket traffic, so an argument that
//! would be rejected by the daemon never leaves the process.

use crate::daemon::commands::CommandTable;
use crate::error::{Error, Result};
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Client side of the privileged operation protocol
#[derive(Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
    table: Arc<CommandTable>,
}

impl DaemonClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            table: Arc::new(CommandTable::new()),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send one validated command line, returning the `OK` payload
    fn command(&self, line: &str) -> Result<String> {
        self.table.parse(line)?;
        debug!("Call daemon command: {}", line);

        let mut stream =
            UnixStream::connect(&self.socket_path).map_err(Error::DaemonUnreachable)?;
        stream.write_all(line.as_bytes())?;
        stream.shutdown(Shutdown::Write)?;

        let mut answer = String::new();
        stream.read_to_string(&mut answer)?;
        let answer = answer.trim();
        match answer.strip_prefix("OK") {
            Some(payload) => Ok(payload.trim().to_string()),
            None => Err(Error::Daemon(
                answer.trim_start_matches("ERROR: ").to_string(),
            )),
        }
    }

    pub fn version(&self) -> Result<String> {
        self.command("version")
    }

    pub fn tap_create(&self, name: &str, user: &str) -> Result<()> {
        self.command(&format!("tap_create {} {}", name, user))?;
        Ok(())
    }

    pub fn tap_delete(&self, name: &str) -> Result<()> {
        self.command(&format!("tap_delete {}", name))?;
        Ok(())
    }

    pub fn netns_create(&self, name: &str) -> Result<()> {
        self.command(&format!("netns_create {}", name))?;
        Ok(())
    }

    pub fn netns_delete(&self, name: &str) -> Result<()> {
        self.command(&format!("netns_delete {}", name))?;
        Ok(())
    }

    pub fn link_create(&self, l_ifname: &str, r_ifname: &str) -> Result<()> {
        self.command(&format!("link_create {} {}", l_ifname, r_ifname))?;
        Ok(())
    }

    pub fn link_delete(&self, ifname: &str) -> Result<()> {
        self.command(&format!("link_delete {}", ifname))?;
        Ok(())
    }

    pub fn link_netns(&self, ifname: &str, netns: &str) -> Result<()> {
        self.command(&format!("link_netns {} {}", ifname, netns))?;
        Ok(())
    }

    /// Create a Linux bridge; returns the `EXIST` sentinel when it was
    /// already there
    pub fn br_create(&self, name: &str) -> Result<String> {
        self.command(&format!("br_create {}", name))
    }

    pub fn br_delete(&self, name: &str) -> Result<()> {
        self.command(&format!("br_delete {}", name))?;
        Ok(())
    }

    pub fn br_addif(&self, name: &str, ifname: &str) -> Result<()> {
        self.command(&format!("br_addif {} {}", name, ifname))?;
        Ok(())
    }

    pub fn br_delif(&self, name: &str, ifname: &str) -> Result<()> {
        self.command(&format!("br_delif {} {}", name, ifname))?;
        Ok(())
    }

    pub fn ifup(&self, ifname: &str) -> Result<()> {
        self.command(&format!("ifup {}", ifname))?;
        Ok(())
    }

    pub fn ifdown(&self, ifname: &str) -> Result<()> {
        self.command(&format!("ifdown {}", ifname))?;
        Ok(())
    }

    /// Create an OVS bridge; returns the `EXIST` sentinel when it was
    /// already there
    pub fn ovs_create(&self, sw_name: &str) -> Result<String> {
        self.command(&format!("ovs_create {}", sw_name))
    }

    pub fn ovs_delete(&self, sw_name: &str) -> Result<()> {
        self.command(&format!("ovs_delete {}", sw_name))?;
        Ok(())
    }

    pub fn ovs_add_port(&self, sw_name: &str, p_name: &str) -> Result<()> {
        self.command(&format!("ovs_add_port {} {}", sw_name, p_name))?;
        Ok(())
    }

    pub fn ovs_del_port(&self, sw_name: &str, p_name: &str) -> Result<()> {
        self.command(&format!("ovs_del_port {} {}", sw_name, p_name))?;
        Ok(())
    }

    pub fn ovs_port_vlan(&self, p_name: &str, tag: u16) -> Result<()> {
        self.command(&format!("ovs_port_vlan {} {}", p_name, tag))?;
        Ok(())
    }

    pub fn docker_create(&self, name: &str, container: &str, image: &str) -> Result<()> {
        self.command(&format!("docker_create {} {} {}", name, container, image))?;
        Ok(())
    }

    pub fn docker_start(&self, container: &str) -> Result<()> {
        self.command(&format!("docker_start {}", container))?;
        Ok(())
    }

    pub fn docker_stop(&self, container: &str) -> Result<()> {
        self.command(&format!("docker_stop {}", container))?;
        Ok(())
    }

    pub fn docker_rm(&self, container: &str) -> Result<()> {
        self.command(&format!("docker_rm {}", container))?;
        Ok(())
    }

    pub fn docker_pid(&self, container: &str) -> Result<String> {
        self.command(&format!("docker_pid {}", container))
    }

    pub fn docker_cp(&self, source: &str, dest: &str) -> Result<()> {
        self.command(&format!("docker_cp {} {}", source, dest))?;
        Ok(())
    }

    pub fn docker_exec(&self, container: &str, cmd: &str) -> Result<()> {
        self.command(&format!("docker_exec {} {}", container, cmd))?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn docker_shell(
        &self,
        container: &str,
        name: &str,
        shell: &str,
        display: &str,
        xauth: &str,
        term_cmd: &str,
    ) -> Result<()> {
        self.command(&format!(
            "docker_shell {} {} {} {} {} {}",
            container, name, shell, display, xauth, term_cmd
        ))?;
        Ok(())
    }

    pub fn docker_capture(
        &self,
        display: &str,
        xauth: &str,
        container: &str,
        if_name: &str,
    ) -> Result<()> {
        self.command(&format!(
            "docker_capture {} {} {} {}",
            display, xauth, container, if_name
        ))?;
        Ok(())
    }

    pub fn docker_attach_interface(
        &self,
        container: &str,
        if_name: &str,
        target_name: &str,
    ) -> Result<()> {
        self.command(&format!(
            "docker_attach_interface {} {} {}",
            container, if_name, target_name
        ))?;
        Ok(())
    }

    pub fn clean(&self, prj_id: &str) -> Result<()> {
        self.command(&format!("clean {}", prj_id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_args_rejected_before_send() {
        // no daemon is listening here; validation must fail first
        let client = DaemonClient::new("/nonexistent/netloom.sock");
        assert!(matches!(
            client.link_delete("a b"),
            Err(Error::WrongArgCount(_))
        ));
        assert!(matches!(
            client.ovs_port_vlan("p0 extra", 10),
            Err(Error::WrongArgCount(_))
        ));
    }

    #[test]
    fn test_valid_args_reach_the_socket_step() {
        let client = DaemonClient::new("/nonexistent/netloom.sock");
        assert!(matches!(
            client.link_delete("nl1.R1.S1"),
            Err(Error::DaemonUnreachable(_))
        ));
    }
}
