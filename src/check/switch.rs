//! Switch argument checks

use crate::check::{ArgSpec, ArgType, Checker, check_args, declared_type};
use crate::topology::RawTopology;

pub struct SwitchCheck;

impl Checker for SwitchCheck {
    fn name(&self) -> &'static str {
        "switch"
    }

    fn check(&self, raw: &RawTopology, errors: &mut Vec<String>) {
        for (name, table) in &raw.switches {
            match declared_type(table) {
                Some("ovs") | Some("vde") => {}
                Some(other) => {
                    errors.push(format!("Switch {} has wrong type {}", name, other));
                }
                None => {
                    errors.push(format!("You do not specify type for switch {}", name));
                }
            }
            check_args(
                name,
                table,
                &[ArgSpec::new("tap", ArgType::Bool, false)],
                errors,
            );
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
        SwitchCheck.check(&raw, &mut errors);
        errors
    }

    #[test]
    fn test_valid_switches() {
        let errors = run(
            r#"
[switches.S1]
type = "ovs"

[switches.S2]
type = "vde"
tap = true
"#,
        );
        assert!(errors.is_empty());
    }

    #[test]
    fn test_wrong_type() {
        let errors = run(
            r#"
[switches.S1]
type = "linux"
"#,
        );
        assert_eq!(errors, vec!["Switch S1 has wrong type linux".to_string()]);
    }

    #[test]
    fn test_missing_type() {
        let errors = run(
            r#"
[switches.S1]
tap = false
"#,
        );
        assert_eq!(errors.len(), 1);
    }
}
