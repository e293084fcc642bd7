//! Global document checks: config keys, identifier syntax, type tags

use crate::check::{Checker, declared_type};
use crate::topology::RawTopology;
use regex::Regex;

const NAME_PATTERN: &str = r"^\w+$";
const NODE_TYPE_PATTERN: &str = r"^(docker|qemu|junos)\.\w+$";

pub struct CommonCheck;

impl Checker for CommonCheck {
    fn name(&self) -> &'static str {
        "common"
    }

    fn check(&self, raw: &RawTopology, errors: &mut Vec<String>) {
        let name_re = Regex::new(NAME_PATTERN).expect("name pattern is valid");
        let type_re = Regex::new(NODE_TYPE_PATTERN).expect("type pattern is valid");

        for key in ["image_dir", "config_dir"] {
            if !raw.config.contains_key(key) {
                errors.push(format!("key {} is mandatory in the config part", key));
            }
        }

        for (name, table) in &raw.nodes {
            if !name_re.is_match(name) {
                errors.push(format!(
                    "The node name {} is not compliant: it has to respect the regexp '{}'",
                    name, NAME_PATTERN
                ));
            } else if let Some(type_tag) = declared_type(table) {
                if !type_re.is_match(type_tag) {
                    errors.push(format!("Node {} has wrong type", name));
                }
            } else {
                errors.push(format!("You do not specify type for node {}", name));
            }
        }

        for (name, _) in &raw.switches {
            if !name_re.is_match(name) {
                errors.push(format!(
                    "The switch name {} is not compliant: it has to respect the regexp '{}'",
                    name, NAME_PATTERN
                ));
            }
        }

        for (name, _) in &raw.bridges {
            if !name_re.is_match(name) {
                errors.push(format!(
                    "The bridge name {} is not compliant: it has to respect the regexp '{}'",
                    name, NAME_PATTERN
                ));
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
        CommonCheck.check(&raw, &mut errors);
        errors
    }

    #[test]
    fn test_missing_config_keys() {
        let errors = run("[nodes]\n");
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_bad_node_name() {
        let errors = run(
            r#"
[config]
image_dir = "images"
config_dir = "configs"

[nodes."R-1"]
type = "docker.host"
"#,
        );
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("R-1"));
    }

    #[test]
    fn test_bad_node_type() {
        let errors = run(
            r#"
[config]
image_dir = "images"
config_dir = "configs"

[nodes.R1]
type = "lxc.host"
"#,
        );
        assert_eq!(errors, vec!["Node R1 has wrong type".to_string()]);
    }
}
