//! Host bridge argument checks

use crate::check::{ArgSpec, ArgType, Checker, check_args};
use crate::topology::RawTopology;

pub struct BridgeCheck;

impl Checker for BridgeCheck {
    fn name(&self) -> &'static str {
        "bridge"
    }

    fn check(&self, raw: &RawTopology, errors: &mut Vec<String>) {
        for (name, table) in &raw.bridges {
            check_args(
                name,
                table,
                &[ArgSpec::new("host_if", ArgType::Str, true)],
                errors,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::RawTopology;

    #[test]
    fn test_host_if_mandatory() {
        let raw = RawTopology::parse("[bridges.b0]\n").unwrap();
        let mut errors = Vec::new();
        BridgeCheck.check(&raw, &mut errors);
        assert_eq!(errors, vec!["b0: key host_if is mandatory".to_string()]);
    }

    #[test]
    fn test_valid_bridge() {
        let raw = RawTopology::parse("[bridges.b0]\nhost_if = \"eth0\"\n").unwrap();
        let mut errors = Vec::new();
        BridgeCheck.check(&raw, &mut errors);
        assert!(errors.is_empty());
    }
}
