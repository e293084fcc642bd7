//! Interface peer resolution checks
//!
//! Verifies that every declared interface key exists, that peer
//! descriptors parse, that referenced entities exist, and that
//! node-to-node links are reciprocal.

use crate::check::{Checker, declared_if_count, declared_type};
use crate::topology::{Endpoint, RawTopology, parse_endpoint, table_str};

pub struct ConnectivityCheck;

impl ConnectivityCheck {
    fn check_node_peer(
        &self,
        raw: &RawTopology,
        n_name: &str,
        if_index: usize,
        peer_name: &str,
        peer_if: usize,
        errors: &mut Vec<String>,
    ) {
        let Some(peer) = raw.nodes.get(peer_name) else {
            errors.push(format!(
                "{}: peer node {} does not exist",
                n_name, peer_name
            ));
            return;
        };

        let peer_if_count = declared_if_count(peer).unwrap_or(0);
        if peer_if >= peer_if_count {
            errors.push(format!(
                "{}: peer interface {}.{} does not exist",
                n_name, peer_name, peer_if
            ));
            return;
        }

        // the peer's interface must point back at ours
        let back = table_str(peer, &format!("if{}", peer_if))
            .and_then(|value| parse_endpoint(value).ok());
        let reciprocal = matches!(
            back,
            Some(Endpoint::Node { ref name, ifindex })
                if name == n_name && ifindex == if_index
        );
        if !reciprocal {
            errors.push(format!(
                "{}: link to {}.{} is not reciprocal",
                n_name, peer_name, peer_if
            ));
        }
    }
}

impl Checker for ConnectivityCheck {
    fn name(&self) -> &'static str {
        "connectivity"
    }

    fn check(&self, raw: &RawTopology, errors: &mut Vec<String>) {
        for (n_name, table) in &raw.nodes {
            let Some(if_count) = declared_if_count(table) else {
                // missing or mistyped if_numbers is reported by the node checker
                continue;
            };
            let is_docker = declared_type(table)
                .map(|t| t.starts_with("docker."))
                .unwrap_or(false);

            for if_index in 0..if_count {
                let key = format!("if{}", if_index);
                let Some(value) = table_str(table, &key) else {
                    errors.push(format!("{}: {} is not present", n_name, key));
                    continue;
                };

                let endpoint = match parse_endpoint(value) {
                    Ok(endpoint) => endpoint,
                    Err(_) => {
                        errors.push(format!(
                            "{}: {} has an invalid peer descriptor '{}'",
                            n_name, key, value
                        ));
                        continue;
                    }
                };

                match endpoint {
                    Endpoint::Null => {}
                    Endpoint::Switch(sw_name) => match raw.switches.get(&sw_name) {
                        None => {
                            errors.push(format!(
                                "{}: switch {} does not exist",
                                n_name, sw_name
                            ));
                        }
                        Some(sw) => {
                            // vde has no way to plug a container veth
                            if is_docker && table_str(sw, "type") == Some("vde") {
                                errors.push(format!(
                                    "{}:{} -> docker node can only connect with ovs switch",
                                    n_name, key
                                ));
                            }
                        }
                    },
                    Endpoint::Bridge(br_name) => {
                        if !raw.bridges.contains_key(&br_name) {
                            errors.push(format!(
                                "{}: bridge {} does not exist",
                                n_name, br_name
                            ));
                        }
                    }
                    Endpoint::Node { name, ifindex } => {
                        self.check_node_peer(raw, n_name, if_index, &name, ifindex, errors);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::RawTopology;

    fn run(content: &str) -> Vec<String> {
        let raw = RawTopology::parse(content).unwrap();
        let mut errors = Vec::new();
        ConnectivityCheck.check(&raw, &mut errors);
        errors
    }

    #[test]
    fn test_valid_links() {
        let errors = run(
            r#"
[nodes.R1]
type = "docker.frr"
if_numbers = 2
if0 = "sw.S1"
if1 = "H1.0"

[nodes.H1]
type = "docker.host"
if_numbers = 1
if0 = "R1.1"

[switches.S1]
type = "ovs"
"#,
        );
        assert!(errors.is_empty(), "{:?}", errors);
    }

    #[test]
    fn test_invalid_peer_syntax() {
        let errors = run(
            r#"
[nodes.R1]
type = "docker.host"
if_numbers = 1
if0 = "switch:S1"
"#,
        );
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("invalid peer descriptor"));
    }

    #[test]
    fn test_missing_switch() {
        let errors = run(
            r#"
[nodes.R1]
type = "docker.host"
if_numbers = 1
if0 = "sw.S9"
"#,
        );
        assert_eq!(errors, vec!["R1: switch S9 does not exist".to_string()]);
    }

    #[test]
    fn test_non_reciprocal_link() {
        let errors = run(
            r#"
[nodes.R1]
type = "docker.host"
if_numbers = 1
if0 = "H1.0"

[nodes.H1]
type = "docker.host"
if_numbers = 1
if0 = "__null__"
"#,
        );
        assert_eq!(
            errors,
            vec!["R1: link to H1.0 is not reciprocal".to_string()]
        );
    }

    #[test]
    fn test_peer_interface_out_of_range() {
        let errors = run(
            r#"
[nodes.R1]
type = "docker.host"
if_numbers = 1
if0 = "H1.3"

[nodes.H1]
type = "docker.host"
if_numbers = 1
if0 = "R1.0"
"#,
        );
        assert_eq!(
            errors,
            vec!["R1: peer interface H1.3 does not exist".to_string()]
        );
    }

    #[test]
    fn test_docker_on_vde_switch() {
        let errors = run(
            r#"
[nodes.H1]
type = "docker.host"
if_numbers = 1
if0 = "sw.S1"

[switches.S1]
type = "vde"
"#,
        );
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("ovs switch"));
    }

    #[test]
    fn test_missing_interface_key() {
        let errors = run(
            r#"
[nodes.H1]
type = "docker.host"
if_numbers = 2
if0 = "__null__"
"#,
        );
        assert_eq!(errors, vec!["H1: if1 is not present".to_string()]);
    }
}
