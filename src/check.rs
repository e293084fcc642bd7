//! Topology validation
//!
//! A chain of checkers runs over the raw topology document before any
//! activation. Errors are aggregated into a report grouped by checker, so
//! a user sees every fault at once instead of fixing them one by one.

pub mod bridge;
pub mod common;
pub mod connectivity;
pub mod node;
pub mod switch;

use crate::topology::{RawTopology, table_str};
use regex::Regex;
use std::fmt;

/// A validation module inspecting one aspect of the document
pub trait Checker {
    /// Group name used in the aggregated report
    fn name(&self) -> &'static str;

    /// Append every fault found to `errors`
    fn check(&self, raw: &RawTopology, errors: &mut Vec<String>);
}

/// Aggregated validation report, grouped by checker
#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    groups: Vec<(&'static str, Vec<String>)>,
}

impl CheckReport {
    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|(_, errors)| errors.is_empty())
    }

    pub fn error_count(&self) -> usize {
        self.groups.iter().map(|(_, errors)| errors.len()).sum()
    }

    pub fn groups(&self) -> &[(&'static str, Vec<String>)] {
        &self.groups
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, errors) in &self.groups {
            if errors.is_empty() {
                continue;
            }
            writeln!(f, "{}:", name)?;
            for error in errors {
                writeln!(f, "  - {}", error)?;
            }
        }
        Ok(())
    }
}

/// Run the full checker chain over a raw topology document
pub fn check_topology(raw: &RawTopology) -> CheckReport {
    let checkers: Vec<Box<dyn Checker>> = vec![
        Box::new(common::CommonCheck),
        Box::new(node::NodeCheck),
        Box::new(switch::SwitchCheck),
        Box::new(bridge::BridgeCheck),
        Box::new(connectivity::ConnectivityCheck),
    ];

    let mut report = CheckReport::default();
    for checker in checkers {
        let mut errors = Vec::new();
        checker.check(raw, &mut errors);
        report.groups.push((checker.name(), errors));
    }
    report
}

/// Expected type of a declared argument
pub enum ArgType {
    Int,
    Bool,
    Str,
    Re(&'static str),
}

/// Schema entry for one entity argument
pub struct ArgSpec {
    pub key: &'static str,
    pub kind: ArgType,
    pub mandatory: bool,
}

impl ArgSpec {
    pub const fn new(key: &'static str, kind: ArgType, mandatory: bool) -> Self {
        Self {
            key,
            kind,
            mandatory,
        }
    }
}

/// Validate an entity table against an argument schema
pub fn check_args(
    name: &str,
    table: &toml::Table,
    specs: &[ArgSpec],
    errors: &mut Vec<String>,
) {
    for spec in specs {
        let Some(value) = table.get(spec.key) else {
            if spec.mandatory {
                errors.push(format!("{}: key {} is mandatory", name, spec.key));
            }
            continue;
        };
        match spec.kind {
            ArgType::Int => {
                if !value.is_integer() {
                    errors.push(format!("{}: arg {} is not an integer", name, spec.key));
                }
            }
            ArgType::Bool => {
                if !value.is_bool() {
                    errors.push(format!("{}: arg {} is not a boolean", name, spec.key));
                }
            }
            ArgType::Str => {
                if !value.is_str() {
                    errors.push(format!("{}: arg {} is not a string", name, spec.key));
                }
            }
            ArgType::Re(pattern) => match value.as_str() {
                Some(text) => {
                    let re = Regex::new(pattern).expect("argument pattern is valid");
                    if !re.is_match(text) {
                        errors.push(format!(
                            "{}: arg {} does not match '{}'",
                            name, spec.key, pattern
                        ));
                    }
                }
                None => {
                    errors.push(format!("{}: arg {} is not a string", name, spec.key));
                }
            },
        }
    }
}

/// Read the declared interface count, if present and well typed
pub(crate) fn declared_if_count(table: &toml::Table) -> Option<usize> {
    table
        .get("if_numbers")
        .and_then(|v| v.as_integer())
        .and_then(|v| usize::try_from(v).ok())
}

/// Read the declared type tag
pub(crate) fn declared_type<'a>(table: &'a toml::Table) -> Option<&'a str> {
    table_str(table, "type")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::RawTopology;

    const VALID: &str = r#"
[config]
image_dir = "images"
config_dir = "configs"

[nodes.R1]
type = "docker.frr"
if_numbers = 1
if0 = "sw.S1"

[nodes.H1]
type = "docker.host"
if_numbers = 1
if0 = "sw.S1"

[switches.S1]
type = "ovs"
"#;

    #[test]
    fn test_valid_topology_has_no_errors() {
        let raw = RawTopology::parse(VALID).unwrap();
        let report = check_topology(&raw);
        assert!(report.is_empty(), "unexpected errors: {}", report);
    }

    #[test]
    fn test_report_groups_by_checker() {
        let raw = RawTopology::parse(
            r#"
[config]
image_dir = "images"
config_dir = "configs"

[nodes.R1]
type = "docker.frr"
if_numbers = 1
if0 = "sw.S2"

[switches.S1]
type = "ovs"
"#,
        )
        .unwrap();
        let report = check_topology(&raw);
        assert_eq!(report.error_count(), 1);
        let group = report
            .groups()
            .iter()
            .find(|(_, errors)| !errors.is_empty())
            .unwrap();
        assert_eq!(group.0, "connectivity");
    }

    #[test]
    fn test_check_args_types() {
        let table: toml::Table = toml::from_str(
            r#"
if_numbers = "two"
ipv6 = 1
"#,
        )
        .unwrap();
        let mut errors = Vec::new();
        check_args(
            "R1",
            &table,
            &[
                ArgSpec::new("if_numbers", ArgType::Int, true),
                ArgSpec::new("ipv6", ArgType::Bool, false),
                ArgSpec::new("console", ArgType::Int, true),
            ],
            &mut errors,
        );
        assert_eq!(errors.len(), 3);
    }
}
