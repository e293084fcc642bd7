//! Per-node-type argument schemas

use crate::check::{ArgSpec, ArgType, Checker, check_args, declared_type};
use crate::topology::RawTopology;

const VRRPS_PATTERN: &str =
    r"^(eth\d+\|\d+\|\d+\.\d+\.\d+\.\d+/\d+)(;eth\d+\|\d+\|\d+\.\d+\.\d+\.\d+/\d+)*$";
const VRFS_PATTERN: &str = r"^(\w+)(;\w+)*$";

pub struct NodeCheck;

impl Checker for NodeCheck {
    fn name(&self) -> &'static str {
        "node"
    }

    fn check(&self, raw: &RawTopology, errors: &mut Vec<String>) {
        for (name, table) in &raw.nodes {
            let Some(type_tag) = declared_type(table) else {
                // reported by the common checker
                continue;
            };

            check_args(
                name,
                table,
                &[
                    ArgSpec::new("if_numbers", ArgType::Int, true),
                    ArgSpec::new("save_state", ArgType::Bool, false),
                ],
                errors,
            );

            let (family, kind) = match type_tag.split_once('.') {
                Some(parts) => parts,
                None => continue,
            };
            match family {
                "docker" => {
                    if !matches!(kind, "host" | "server" | "frr") {
                        errors.push(format!("{}: docker type {} is not valid", name, kind));
                        continue;
                    }
                    check_args(
                        name,
                        table,
                        &[
                            ArgSpec::new("ipv6", ArgType::Bool, false),
                            ArgSpec::new("image", ArgType::Str, false),
                        ],
                        errors,
                    );
                    if kind == "frr" {
                        check_args(
                            name,
                            table,
                            &[
                                ArgSpec::new("mpls", ArgType::Bool, false),
                                ArgSpec::new("vrrps", ArgType::Re(VRRPS_PATTERN), false),
                                ArgSpec::new("vrfs", ArgType::Re(VRFS_PATTERN), false),
                            ],
                            errors,
                        );
                    }
                }
                "qemu" | "junos" => {
                    check_args(
                        name,
                        table,
                        &[
                            ArgSpec::new("console", ArgType::Int, true),
                            ArgSpec::new("memory", ArgType::Int, false),
                        ],
                        errors,
                    );
                }
                _ => {
                    // reported by the common checker
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
        NodeCheck.check(&raw, &mut errors);
        errors
    }

    #[test]
    fn test_qemu_requires_console() {
        let errors = run(
            r#"
[nodes.R1]
type = "qemu.debian"
if_numbers = 1
"#,
        );
        assert_eq!(errors, vec!["R1: key console is mandatory".to_string()]);
    }

    #[test]
    fn test_invalid_docker_kind() {
        let errors = run(
            r#"
[nodes.R1]
type = "docker.xorp"
if_numbers = 1
"#,
        );
        assert_eq!(errors, vec!["R1: docker type xorp is not valid".to_string()]);
    }

    #[test]
    fn test_frr_arg_patterns() {
        let errors = run(
            r#"
[nodes.R1]
type = "docker.frr"
if_numbers = 1
vrrps = "eth0|10|10.0.0.1/24"
vrfs = "red;blue"
mpls = true
"#,
        );
        assert!(errors.is_empty(), "{:?}", errors);

        let errors = run(
            r#"
[nodes.R1]
type = "docker.frr"
if_numbers = 1
vrrps = "eth0;10;10.0.0.1/24"
"#,
        );
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("vrrps"));
    }

    #[test]
    fn test_wrong_if_numbers_type() {
        let errors = run(
            r#"
[nodes.H1]
type = "docker.host"
if_numbers = "many"
"#,
        );
        assert_eq!(errors, vec!["H1: arg if_numbers is not an integer".to_string()]);
    }
}
