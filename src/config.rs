//! Emulator configuration
//!
//! Parses `/etc/netloom/netloom.toml` using serde. Every field has a
//! default so a missing file yields a usable configuration.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Default location of the emulator configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/netloom/netloom.toml";

/// Load configuration from a file, falling back to defaults if absent
pub fn load(path: &Path) -> Result<EmulatorConfig> {
    if !path.exists() {
        return Ok(EmulatorConfig::default());
    }
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    let config: EmulatorConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EmulatorConfig {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// QEMU node settings
    #[serde(default)]
    pub qemu: QemuConfig,

    /// Docker node settings
    #[serde(default)]
    pub docker: DockerConfig,
}

/// General settings
#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Privileged daemon socket path
    #[serde(default = "default_daemon_socket")]
    pub daemon_socket: PathBuf,

    /// Directory holding base VM images
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,

    /// Terminal emulator command; `{title}` and `{cmd}` are substituted
    #[serde(default = "default_terminal")]
    pub terminal: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            daemon_socket: default_daemon_socket(),
            image_dir: default_image_dir(),
            terminal: default_terminal(),
        }
    }
}

/// QEMU node settings
#[derive(Debug, Clone, Deserialize)]
pub struct QemuConfig {
    /// Default guest memory in MiB, overridable per node
    #[serde(default = "default_memory")]
    pub memory: u32,

    /// Pass -enable-kvm to the emulator
    #[serde(default = "default_true")]
    pub enable_kvm: bool,
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            enable_kvm: true,
        }
    }
}

/// Docker node settings: image name per node kind
#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfig {
    #[serde(default = "default_host_image")]
    pub host_image: String,

    #[serde(default = "default_server_image")]
    pub server_image: String,

    #[serde(default = "default_frr_image")]
    pub frr_image: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host_image: default_host_image(),
            server_image: default_server_image(),
            frr_image: default_frr_image(),
        }
    }
}

impl EmulatorConfig {
    /// Resolve the docker image for a node kind tag (`host`, `server`, `frr`)
    pub fn docker_image(&self, kind: &str) -> Option<&str> {
        match kind {
            "host" => Some(&self.docker.host_image),
            "server" => Some(&self.docker.server_image),
            "frr" => Some(&self.docker.frr_image),
            _ => None,
        }
    }

}

fn default_daemon_socket() -> PathBuf {
    PathBuf::from("/var/run/netloom.sock")
}

fn default_image_dir() -> PathBuf {
    PathBuf::from("/var/lib/netloom/images")
}

fn default_terminal() -> String {
    "xterm -T {title} -e {cmd}".to_string()
}

fn default_memory() -> u32 {
    256
}

fn default_true() -> bool {
    true
}

fn default_host_image() -> String {
    "netloom/host".to_string()
}

fn default_server_image() -> String {
    "netloom/server".to_string()
}

fn default_frr_image() -> String {
    "netloom/frr".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EmulatorConfig::default();
        assert_eq!(config.qemu.memory, 256);
        assert!(config.qemu.enable_kvm);
        assert_eq!(config.general.daemon_socket, default_daemon_socket());
    }

    #[test]
    fn test_parse_partial() {
        let config: EmulatorConfig = toml::from_str(
            r#"
[qemu]
memory = 512

[docker]
frr_image = "local/frr"
"#,
        )
        .unwrap();
        assert_eq!(config.qemu.memory, 512);
        assert_eq!(config.docker.frr_image, "local/frr");
        assert_eq!(config.docker.host_image, "netloom/host");
    }

    #[test]
    fn test_docker_image_lookup() {
        let config = EmulatorConfig::default();
        assert_eq!(config.docker_image("frr"), Some("netloom/frr"));
        assert_eq!(config.docker_image("xorp"), None);
    }
}
