//! Junos-backed nodes
//!
//! A qemu variant whose overlay lives in /tmp and is rebuilt on every
//! start, plus a scripted login sequence over the serial telnet console
//! to load and save the router configuration.

use crate::error::{Error, Result};
use crate::node::{
    IfState, InterfaceBinding, NodeEnv, NodeInstance, NodeState, WiringCtx, qemu::QemuNode,
};
use crate::topology::NodeSpec;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const USERNAME: &str = "root";
const PASSWORD: &str = "Juniper";
const FACTORY_HOSTNAME: &str = "generic";
/// In-guest staging path for a pushed configuration
const GUEST_CONF: &str = "/tmp/netloom.conf";
/// Settle delay before the first console contact and between the
/// connection retry
const SETTLE_DELAY: Duration = Duration::from_secs(3);
const READ_DEADLINE: Duration = Duration::from_secs(60);

pub struct JunosNode {
    qemu: QemuNode,
    conf_dir: PathBuf,
}

impl JunosNode {
    pub fn new(spec: &NodeSpec, img_type: &str, env: &NodeEnv) -> Result<Self> {
        let overlay = PathBuf::from(format!("/tmp/{}-{}.img", env.prj_id, spec.name));
        let qemu = QemuNode::with_overlay(spec, &format!("junos-{}", img_type), env, overlay)?;
        Ok(Self {
            qemu,
            conf_dir: env.conf_dir.clone(),
        })
    }

    fn conf_path(&self, conf_dir: &Path) -> PathBuf {
        conf_dir.join(format!("{}.junos.conf", self.qemu.name()))
    }

    fn console(&self) -> ConsoleClient {
        ConsoleClient {
            name: self.qemu.name().to_string(),
            port: self.qemu.telnet_port(),
        }
    }
}

impl NodeInstance for JunosNode {
    fn name(&self) -> &str {
        self.qemu.name()
    }

    fn node_type(&self) -> &str {
        self.qemu.node_type()
    }

    fn state(&self) -> NodeState {
        self.qemu.state()
    }

    fn bindings(&self) -> &[InterfaceBinding] {
        self.qemu.bindings()
    }

    fn start(&mut self, ctx: &mut WiringCtx) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        self.qemu.create_overlay()?;
        self.qemu.start(ctx)?;

        let conf_path = self.conf_path(&self.conf_dir);
        if let Err(e) = self.console().load(&conf_path) {
            warn!("{}: unable to load configuration: {}", self.name(), e);
        }
        Ok(())
    }

    fn stop(&mut self, ctx: &mut WiringCtx) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        self.qemu.stop(ctx)?;
        let overlay = self.qemu.overlay_path().to_path_buf();
        if overlay.is_file() {
            std::fs::remove_file(&overlay)?;
        }
        Ok(())
    }

    fn clean(&mut self, ctx: &mut WiringCtx) -> Result<()> {
        self.qemu.clean(ctx)
    }

    fn save(&mut self, conf_dir: &Path) -> Result<()> {
        crate::node::require_running(self.name(), self.state())?;
        self.console().save(&self.conf_path(conf_dir))
    }

    fn open_shell(&mut self, debug: bool) -> Result<()> {
        self.qemu.open_shell(debug)
    }

    fn capture(&mut self, ctx: &mut WiringCtx, if_index: usize) -> Result<()> {
        self.qemu.capture(ctx, if_index)
    }

    fn set_if_state(
        &mut self,
        ctx: &mut WiringCtx,
        if_index: usize,
        state: IfState,
    ) -> Result<()> {
        self.qemu.set_if_state(ctx, if_index, state)
    }

    fn wants_save_state(&self) -> bool {
        self.qemu.wants_save_state()
    }
}

/// Scripted client driving the router login sequence over its serial
/// telnet console
struct ConsoleClient {
    name: String,
    port: u16,
}

impl ConsoleClient {
    /// Connect to the console, retrying once on connection refusal after
    /// a fixed settle delay
    fn connect(&self) -> Result<TcpStream> {
        std::thread::sleep(SETTLE_DELAY);
        let addr = ("127.0.0.1", self.port);
        let stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                std::thread::sleep(SETTLE_DELAY);
                TcpStream::connect(addr).map_err(|e| {
                    Error::resource(
                        format!("console {}", self.name),
                        format!("Unable to connect to {} router: {}", self.name, e),
                    )
                })?
            }
            Err(e) => {
                return Err(Error::resource(
                    format!("console {}", self.name),
                    e.to_string(),
                ));
            }
        };
        stream.set_read_timeout(Some(Duration::from_millis(500)))?;
        Ok(stream)
    }

    /// Load a saved configuration, or just set the hostname when none
    /// exists yet
    fn load(&self, conf_path: &Path) -> Result<()> {
        debug!("{}: load configuration over console", self.name);
        let mut stream = self.connect()?;

        write_line(&mut stream, "")?;
        read_until(&mut stream, "login: ", READ_DEADLINE)?;

        if conf_path.is_file() {
            self.login(&mut stream, FACTORY_HOSTNAME, false)?;
            let content = std::fs::read_to_string(conf_path)?;
            let prompt = format!("{}@{}", USERNAME, FACTORY_HOSTNAME);
            for line in content.lines() {
                write_line(
                    &mut stream,
                    &format!("echo {} >> {}", shell_quote(line), GUEST_CONF),
                )?;
                read_until(&mut stream, &prompt, READ_DEADLINE)?;
            }
            write_line(&mut stream, "cli")?;
            write_line(&mut stream, "configure")?;
            write_line(&mut stream, &format!("load override {}", GUEST_CONF))?;
        } else {
            self.login(&mut stream, FACTORY_HOSTNAME, true)?;
            write_line(&mut stream, "configure")?;
            write_line(
                &mut stream,
                &format!("set system host-name {}", self.name),
            )?;
        }
        write_line(&mut stream, "commit")?;
        self.logout(&mut stream)?;
        Ok(())
    }

    /// Pull the running configuration into a file
    fn save(&self, conf_path: &Path) -> Result<()> {
        debug!("{}: save configuration over console", self.name);
        let mut stream = self.connect()?;

        self.logout(&mut stream)?;
        self.login(&mut stream, &self.name, true)?;
        write_line(&mut stream, "configure")?;
        write_line(&mut stream, "save terminal")?;
        let data = read_until(&mut stream, "Wrote", READ_DEADLINE)?;
        std::fs::write(conf_path, extract_config(&data))?;
        Ok(())
    }

    fn login(&self, stream: &mut TcpStream, hostname: &str, cli: bool) -> Result<()> {
        write_line(stream, USERNAME)?;
        read_until(stream, "Password:", READ_DEADLINE)?;
        write_line(stream, PASSWORD)?;
        read_until(stream, &format!("{}@{}", USERNAME, hostname), READ_DEADLINE)?;
        if cli {
            write_line(stream, "cli")?;
        }
        Ok(())
    }

    /// Back out of any shell/cli level until the login prompt shows
    fn logout(&self, stream: &mut TcpStream) -> Result<()> {
        for _ in 0..10 {
            write_line(stream, "")?;
            if let Ok(data) = read_until(stream, "login: ", Duration::from_millis(800))
                && data.ends_with("login: ")
            {
                return Ok(());
            }
            write_line(stream, "exit")?;
        }
        Err(Error::resource(
            format!("console {}", self.name),
            "unable to reach the login prompt".to_string(),
        ))
    }
}

fn write_line(stream: &mut TcpStream, line: &str) -> Result<()> {
    stream.write_all(line.as_bytes())?;
    stream.write_all(b"\n")?;
    Ok(())
}

/// Accumulate console output until `needle` appears or the deadline
/// passes; returns whatever was read
fn read_until(stream: &mut TcpStream, needle: &str, deadline: Duration) -> Result<String> {
    let started = Instant::now();
    let mut data = String::new();
    let mut chunk = [0u8; 1024];
    while started.elapsed() < deadline {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                data.push_str(&String::from_utf8_lossy(&chunk[..n]));
                if data.contains(needle) {
                    return Ok(data);
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(data)
}

/// Single-quote a configuration line for the guest shell
fn shell_quote(line: &str) -> String {
    format!("'{}'", line.replace('\'', r"'\''"))
}

/// Keep the lines between the leading `##` banner and the `Wrote` marker
fn extract_config(data: &str) -> String {
    let mut lines = Vec::new();
    let mut started = false;
    for line in data.lines() {
        if line.starts_with("##") {
            started = true;
        } else if line.starts_with("Wrote") {
            started = false;
        }
        if started {
            lines.push(line);
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("set system"), "'set system'");
        assert_eq!(
            shell_quote("description 'lan'"),
            r"'description '\''lan'\'''"
        );
    }

    #[test]
    fn test_extract_config() {
        let data = "garbage\n## Last changed: now\nsystem {\n}\nWrote 3 lines\nprompt>";
        let config = extract_config(data);
        assert!(config.starts_with("## Last changed"));
        assert!(config.contains("system {"));
        assert!(!config.contains("Wrote"));
        assert!(!config.contains("garbage"));
    }
}
