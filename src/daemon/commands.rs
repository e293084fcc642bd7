//! Daemon verb table and command execution
//!
//! Every verb is declared with a regular expression describing its exact
//! argument shape. An incoming line that does not match is rejected
//! before dispatch, so handlers never see malformed or short commands.

use crate::daemon::EXIST;
use crate::error::{Error, Result};
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, error, warn};

/// Verb registry: name and full-line argument pattern
pub const VERBS: &[(&str, &str)] = &[
    ("version", r"^version$"),
    ("tap_create", r"^tap_create (\S+) (\S+)$"),
    ("tap_delete", r"^tap_delete (\S+)$"),
    ("netns_create", r"^netns_create (\S+)$"),
    ("netns_delete", r"^netns_delete (\S+)$"),
    ("link_create", r"^link_create (\S+) (\S+)$"),
    ("link_delete", r"^link_delete (\S+)$"),
    ("link_netns", r"^link_netns (\S+) (\S+)$"),
    ("br_create", r"^br_create (\S+)$"),
    ("br_delete", r"^br_delete (\S+)$"),
    ("br_addif", r"^br_addif (\S+) (\S+)$"),
    ("br_delif", r"^br_delif (\S+) (\S+)$"),
    ("ifup", r"^ifup (\S+)$"),
    ("ifdown", r"^ifdown (\S+)$"),
    ("ovs_create", r"^ovs_create (\S+)$"),
    ("ovs_delete", r"^ovs_delete (\S+)$"),
    ("ovs_add_port", r"^ovs_add_port (\S+) (\S+)$"),
    ("ovs_del_port", r"^ovs_del_port (\S+) (\S+)$"),
    ("ovs_port_vlan", r"^ovs_port_vlan (\S+) ([0-9]+)$"),
    ("docker_create", r"^docker_create (\S+) (\S+) (\S+)$"),
    ("docker_start", r"^docker_start (\S+)$"),
    ("docker_stop", r"^docker_stop (\S+)$"),
    ("docker_rm", r"^docker_rm (\S+)$"),
    ("docker_pid", r"^docker_pid (\S+)$"),
    ("docker_cp", r"^docker_cp (\S+) (\S+)$"),
    ("docker_exec", r"^docker_exec (\S+) (.+)$"),
    ("docker_shell", r"^docker_shell (\S+) (\S+) (\S+) (\S+) (\S+) (.+)$"),
    ("docker_capture", r"^docker_capture (\S+) (\S+) (\S+) (\S+)$"),
    (
        "docker_attach_interface",
        r"^docker_attach_interface (\S+) (\S+) (\S+)$",
    ),
    ("clean", r"^clean (\S+)$"),
];

/// Compiled verb table, built once at startup
pub struct CommandTable {
    entries: Vec<(&'static str, Regex)>,
}

impl CommandTable {
    pub fn new() -> Self {
        let entries = VERBS
            .iter()
            .map(|(verb, pattern)| {
                (*verb, Regex::new(pattern).expect("verb pattern is valid"))
            })
            .collect();
        Self { entries }
    }

    /// Number of capture groups (arguments) a verb expects
    pub fn arg_count(&self, verb: &str) -> Option<usize> {
        self.entries
            .iter()
            .find(|(name, _)| *name == verb)
            .map(|(_, re)| re.captures_len() - 1)
    }

    /// Validate a raw command line, returning the verb and its arguments
    pub fn parse<'a>(&self, line: &'a str) -> Result<(&'static str, Vec<&'a str>)> {
        let verb = line
            .split_whitespace()
            .next()
            .ok_or_else(|| Error::Protocol("The sent command is empty".to_string()))?;
        let (name, pattern) = self
            .entries
            .iter()
            .find(|(name, _)| *name == verb)
            .ok_or_else(|| Error::Protocol(format!("Unknown command {}", line)))?;
        let captures = pattern
            .captures(line)
            .ok_or_else(|| Error::WrongArgCount(verb.to_string()))?;
        let args = captures
            .iter()
            .skip(1)
            .map(|m| m.map(|m| m.as_str()).unwrap_or(""))
            .collect();
        Ok((name, args))
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Run an external command, discarding output
fn run(program: &str, args: &[&str]) -> Result<()> {
    let rendered = format!("{} {}", program, args.join(" "));
    debug!("exec: {}", rendered);
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::resource(rendered.clone(), e.to_string()))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(Error::resource(rendered, stderr));
    }
    Ok(())
}

/// Run an external command, returning trimmed stdout
fn run_output(program: &str, args: &[&str]) -> Result<String> {
    let rendered = format!("{} {}", program, args.join(" "));
    debug!("exec: {}", rendered);
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::resource(rendered.clone(), e.to_string()))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(Error::resource(rendered, stderr));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn interface_exists(name: &str) -> bool {
    Path::new("/sys/class/net").join(name).exists()
}

fn is_pid(value: &str) -> bool {
    value.parse::<u32>().is_ok()
}

fn ovs_bridge_exists(name: &str) -> bool {
    // br-exists answers through its exit code: 2 means "no such bridge"
    Command::new("ovs-vsctl")
        .args(["br-exists", name])
        .status()
        .map(|status| status.code() != Some(2))
        .unwrap_or(false)
}

/// Executes validated verbs as external commands.
///
/// Project prefixes seen on resource creation are remembered so the
/// daemon can run a best-effort per-project cleanup on shutdown.
pub struct Executor {
    prefixes: HashSet<String>,
}

impl Executor {
    pub fn new() -> Self {
        Self {
            prefixes: HashSet::new(),
        }
    }

    fn record_prefix(&mut self, name: &str) {
        if let Some((prefix, _)) = name.split_once('.') {
            self.prefixes.insert(prefix.to_string());
        }
    }

    /// Dispatch a validated verb. Returns an optional payload.
    pub fn execute(&mut self, verb: &str, args: &[&str]) -> Result<Option<String>> {
        match verb {
            "version" => Ok(Some(env!("CARGO_PKG_VERSION").to_string())),
            "tap_create" => {
                debug!("Create tap {}", args[0]);
                run("tunctl", &["-u", args[1], "-t", args[0]])?;
                run("ip", &["link", "set", args[0], "up"])?;
                Ok(None)
            }
            "tap_delete" => {
                debug!("Delete tap {}", args[0]);
                if interface_exists(args[0]) {
                    run("tunctl", &["-d", args[0]])?;
                }
                Ok(None)
            }
            "netns_create" => self.netns_create(args[0]),
            "netns_delete" => self.netns_delete(args[0]),
            "link_create" => {
                debug!("Create link {}<-->{}", args[0], args[1]);
                run(
                    "ip",
                    &["link", "add", args[0], "type", "veth", "peer", "name", args[1]],
                )?;
                self.record_prefix(args[0]);
                Ok(None)
            }
            "link_delete" => {
                debug!("Delete link {}", args[0]);
                if interface_exists(args[0]) {
                    run("ip", &["link", "del", args[0]])?;
                }
                Ok(None)
            }
            "link_netns" => {
                debug!("Attach link {} to namespace {}", args[0], args[1]);
                run("ip", &["link", "set", args[0], "netns", args[1]])?;
                Ok(None)
            }
            "br_create" => {
                debug!("Create bridge {}", args[0]);
                if interface_exists(args[0]) {
                    return Ok(Some(EXIST.to_string()));
                }
                run("brctl", &["addbr", args[0]])?;
                run("ip", &["link", "set", args[0], "up"])?;
                self.record_prefix(args[0]);
                Ok(None)
            }
            "br_delete" => {
                debug!("Delete bridge {}", args[0]);
                if interface_exists(args[0]) {
                    run("ip", &["link", "set", args[0], "down"])?;
                    run("brctl", &["delbr", args[0]])?;
                }
                Ok(None)
            }
            "br_addif" => {
                run("brctl", &["addif", args[0], args[1]])?;
                Ok(None)
            }
            "br_delif" => {
                if interface_exists(args[1]) {
                    run("brctl", &["delif", args[0], args[1]])?;
                }
                Ok(None)
            }
            "ifup" => {
                run("ip", &["link", "set", args[0], "up"])?;
                Ok(None)
            }
            "ifdown" => {
                run("ip", &["link", "set", args[0], "down"])?;
                Ok(None)
            }
            "ovs_create" => {
                debug!("Create switch {}", args[0]);
                if ovs_bridge_exists(args[0]) {
                    return Ok(Some(EXIST.to_string()));
                }
                run("ovs-vsctl", &["add-br", args[0]])?;
                self.record_prefix(args[0]);
                Ok(None)
            }
            "ovs_delete" => {
                debug!("Delete switch {}", args[0]);
                if ovs_bridge_exists(args[0]) {
                    run("ovs-vsctl", &["del-br", args[0]])?;
                }
                Ok(None)
            }
            "ovs_add_port" => {
                debug!("Add port {} to switch {}", args[1], args[0]);
                run("ovs-vsctl", &["add-port", args[0], args[1]])?;
                run("ip", &["link", "set", args[1], "up"])?;
                Ok(None)
            }
            "ovs_del_port" => {
                debug!("Delete port {} from switch {}", args[1], args[0]);
                run("ovs-vsctl", &["del-port", args[0], args[1]])?;
                Ok(None)
            }
            "ovs_port_vlan" => {
                debug!("Set port {} to belong to vlan {}", args[0], args[1]);
                run(
                    "ovs-vsctl",
                    &["set", "port", args[0], &format!("tag={}", args[1])],
                )?;
                Ok(None)
            }
            "docker_create" => {
                debug!("Create docker container {}", args[1]);
                run(
                    "docker",
                    &[
                        "create",
                        "--privileged",
                        "--cap-add=ALL",
                        "--net=none",
                        "-h",
                        args[0],
                        "--name",
                        args[1],
                        args[2],
                    ],
                )?;
                self.record_prefix(args[1]);
                Ok(None)
            }
            "docker_start" => {
                debug!("Start docker container {}", args[0]);
                run("docker", &["start", args[0]])?;
                Ok(None)
            }
            "docker_stop" => {
                debug!("Stop docker container {}", args[0]);
                run("docker", &["stop", args[0]])?;
                Ok(None)
            }
            "docker_rm" => {
                debug!("Delete docker container {}", args[0]);
                run("docker", &["rm", args[0]])?;
                Ok(None)
            }
            "docker_pid" => {
                let pid = run_output(
                    "docker",
                    &["inspect", "--format", "{{.State.Pid}}", args[0]],
                )?;
                Ok(Some(pid.trim_matches('\'').to_string()))
            }
            "docker_cp" => {
                debug!("Docker cp from {} to {}", args[0], args[1]);
                run("docker", &["cp", args[0], args[1]])?;
                Ok(None)
            }
            "docker_exec" => {
                debug!("Docker {} : exec {}", args[0], args[1]);
                let mut cmd_args = vec!["exec", args[0]];
                cmd_args.extend(args[1].split_whitespace());
                run("docker", &cmd_args)?;
                Ok(None)
            }
            "docker_shell" => self.docker_shell(args),
            "docker_capture" => self.docker_capture(args),
            "docker_attach_interface" => {
                debug!("Docker : attach if {} to container {}", args[1], args[0]);
                run(
                    "docker",
                    &["exec", args[0], "ip", "link", "set", args[1], "name", args[2]],
                )?;
                run("docker", &["exec", args[0], "ip", "link", "set", args[2], "up"])?;
                Ok(None)
            }
            "clean" => {
                self.clean(args[0]);
                Ok(None)
            }
            _ => Err(Error::Protocol(format!("Unknown command {}", verb))),
        }
    }

    fn netns_create(&mut self, name: &str) -> Result<Option<String>> {
        debug!("Create netns {}", name);
        if is_pid(name) {
            // expose an existing process namespace under the named set
            std::fs::create_dir_all("/var/run/netns")?;
            let target = format!("/proc/{}/ns/net", name);
            let link = format!("/var/run/netns/{}", name);
            if !Path::new(&link).exists() {
                std::os::unix::fs::symlink(&target, &link)?;
            }
        } else {
            run("ip", &["netns", "add", name])?;
        }
        Ok(None)
    }

    fn netns_delete(&self, name: &str) -> Result<Option<String>> {
        debug!("Delete netns {}", name);
        let path = format!("/var/run/netns/{}", name);
        if !Path::new(&path).exists() {
            return Ok(None);
        }
        if is_pid(name) {
            std::fs::remove_file(&path)?;
        } else {
            run("ip", &["netns", "del", name])?;
        }
        Ok(None)
    }

    fn docker_shell(&self, args: &[&str]) -> Result<Option<String>> {
        let (container, name, shell, display, xauth, term_cmd) =
            (args[0], args[1], args[2], args[3], args[4], args[5]);
        debug!("Docker open shell for container {}", container);
        let rendered = term_cmd
            .replace("{title}", name)
            .replace("{cmd}", &format!("docker exec -it {} {}", container, shell));
        let mut parts = rendered.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::Protocol("empty terminal command".to_string()))?;
        let mut command = Command::new(program);
        command
            .args(parts)
            .env("DISPLAY", display)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if xauth != "null" {
            command.env("XAUTHORITY", xauth);
        }
        command
            .spawn()
            .map_err(|e| Error::resource(rendered, e.to_string()))?;
        Ok(None)
    }

    fn docker_capture(&self, args: &[&str]) -> Result<Option<String>> {
        let (display, xauth, container, if_name) = (args[0], args[1], args[2], args[3]);
        debug!("Docker launch capture on if {}:{}", container, if_name);
        let pretty = container.split_once('.').map(|(_, n)| n).unwrap_or(container);
        let script = format!(
            "docker exec {0} tcpdump -s 0 -U -w - -i {1} 2>/dev/null | \
             wireshark -o gui.window_title:{1}@{2} -k -i - &",
            container, if_name, pretty
        );
        let mut command = Command::new("/bin/sh");
        command.args(["-c", &script]).env("DISPLAY", display);
        if xauth != "null" {
            command.env("XAUTHORITY", xauth);
        }
        command
            .spawn()
            .map_err(|e| Error::resource(script, e.to_string()))?;
        Ok(None)
    }

    /// Best-effort removal of every resource owned by a project.
    ///
    /// Errors are logged and skipped: a leaked kernel resource is worse
    /// than an incomplete teardown report.
    pub fn clean(&self, prj_id: &str) {
        debug!("Clean project {}", prj_id);
        let prefix = format!("{}.", prj_id);

        match run_output(
            "docker",
            &["container", "list", "--format", "{{.Names}}", "--all"],
        ) {
            Ok(listing) => {
                for container in listing.lines().map(str::trim) {
                    if container.starts_with(&prefix) || container.starts_with(prj_id) {
                        if let Err(e) = run("docker", &["stop", container]) {
                            warn!("clean: {}", e);
                        }
                        if let Err(e) = run("docker", &["rm", container]) {
                            warn!("clean: {}", e);
                        }
                    }
                }
            }
            Err(e) => error!("clean: unable to list containers: {}", e),
        }

        match run_output("ovs-vsctl", &["list-br"]) {
            Ok(listing) => {
                for sw_name in listing.lines().map(str::trim) {
                    if sw_name.starts_with(prj_id)
                        && let Err(e) = run("ovs-vsctl", &["del-br", sw_name])
                    {
                        warn!("clean: {}", e);
                    }
                }
            }
            Err(e) => error!("clean: unable to list ovs bridges: {}", e),
        }

        // leftover veth/tap interfaces carrying the project prefix
        if let Ok(entries) = std::fs::read_dir("/sys/class/net") {
            for entry in entries.flatten() {
                let if_name = entry.file_name().to_string_lossy().to_string();
                if if_name.starts_with(prj_id)
                    && let Err(e) = run("ip", &["link", "del", &if_name])
                {
                    warn!("clean: {}", e);
                }
            }
        }
    }

    /// Shutdown hook: clean every project prefix seen in this run
    pub fn clean_all(&self) {
        for prefix in &self.prefixes {
            self.clean(prefix);
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_line() {
        let table = CommandTable::new();
        let (verb, args) = table.parse("link_create nl1.a nl1.b").unwrap();
        assert_eq!(verb, "link_create");
        assert_eq!(args, vec!["nl1.a", "nl1.b"]);
    }

    #[test]
    fn test_parse_rejects_unknown_verb() {
        let table = CommandTable::new();
        assert!(matches!(
            table.parse("frobnicate x"),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_rejects_short_command() {
        let table = CommandTable::new();
        assert!(matches!(
            table.parse("link_create onlyone"),
            Err(Error::WrongArgCount(_))
        ));
        assert!(matches!(table.parse(""), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_parse_rejects_extra_args() {
        let table = CommandTable::new();
        assert!(table.parse("tap_delete a b").is_err());
    }

    #[test]
    fn test_vlan_arg_must_be_numeric() {
        let table = CommandTable::new();
        assert!(table.parse("ovs_port_vlan p0 12").is_ok());
        assert!(table.parse("ovs_port_vlan p0 twelve").is_err());
    }

    #[test]
    fn test_arg_count() {
        let table = CommandTable::new();
        assert_eq!(table.arg_count("version"), Some(0));
        assert_eq!(table.arg_count("link_create"), Some(2));
        assert_eq!(table.arg_count("docker_shell"), Some(6));
        assert_eq!(table.arg_count("nope"), None);
    }

    #[test]
    fn test_trailing_args_captured_whole() {
        let table = CommandTable::new();
        let (_, args) = table
            .parse("docker_exec nl1.R1 ip link set eth0 down")
            .unwrap();
        assert_eq!(args[1], "ip link set eth0 down");
    }
}
