//! Node lifecycle state machine
//!
//! Type-safe lifecycle management using the state-machines crate in
//! dynamic dispatch mode. `Cleaned` is terminal: a cleaned node has lost
//! its persistent backing resources and cannot be restarted.

use state_machines::state_machine;

state_machine! {
    name: NodeMachine,
    dynamic: true,  // runtime dispatch, events come from the manager and the watcher
    initial: Created,
    states: [Created, Stopped, Running, Cleaned],
    events {
        ready {
            transition: { from: Created, to: Stopped }
        }
        start {
            transition: { from: Stopped, to: Running }
        }
        stop {
            transition: { from: Running, to: Stopped }
        }
        clean {
            transition: { from: [Created, Stopped], to: Cleaned }
        }
    }
}

/// Simple state enum for external use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Stopped,
    Running,
    Cleaned,
}

impl NodeState {
    pub fn from_str(s: &str) -> Self {
        match s {
            "Created" => NodeState::Created,
            "Stopped" => NodeState::Stopped,
            "Running" => NodeState::Running,
            "Cleaned" => NodeState::Cleaned,
            _ => NodeState::Created, // Fallback
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Created => "Created",
            NodeState::Stopped => "Stopped",
            NodeState::Running => "Running",
            NodeState::Cleaned => "Cleaned",
        }
    }
}

/// Lifecycle tracker embedded in every node instance
pub struct Lifecycle {
    machine: DynamicNodeMachine<()>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            machine: NodeMachine::new(()).into_dynamic(),
        }
    }

    pub fn state(&self) -> NodeState {
        NodeState::from_str(self.machine.current_state())
    }

    pub fn is_running(&self) -> bool {
        self.machine.current_state() == "Running"
    }

    pub fn ready(&mut self) -> Result<(), state_machines::DynamicError> {
        self.machine.handle(NodeMachineEvent::Ready)
    }

    pub fn start(&mut self) -> Result<(), state_machines::DynamicError> {
        self.machine.handle(NodeMachineEvent::Start)
    }

    pub fn stop(&mut self) -> Result<(), state_machines::DynamicError> {
        self.machine.handle(NodeMachineEvent::Stop)
    }

    pub fn clean(&mut self) -> Result<(), state_machines::DynamicError> {
        self.machine.handle(NodeMachineEvent::Clean)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), NodeState::Created);
    }

    #[test]
    fn test_full_lifecycle() {
        let mut lifecycle = Lifecycle::new();

        lifecycle.ready().unwrap();
        assert_eq!(lifecycle.state(), NodeState::Stopped);

        lifecycle.start().unwrap();
        assert!(lifecycle.is_running());

        lifecycle.stop().unwrap();
        assert_eq!(lifecycle.state(), NodeState::Stopped);

        lifecycle.clean().unwrap();
        assert_eq!(lifecycle.state(), NodeState::Cleaned);
    }

    #[test]
    fn test_cannot_start_before_ready() {
        let mut lifecycle = Lifecycle::new();
        assert!(lifecycle.start().is_err());
    }

    #[test]
    fn test_cannot_clean_while_running() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.ready().unwrap();
        lifecycle.start().unwrap();
        assert!(lifecycle.clean().is_err());
    }

    #[test]
    fn test_cleaned_is_terminal() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.ready().unwrap();
        lifecycle.clean().unwrap();
        assert!(lifecycle.start().is_err());
        assert!(lifecycle.stop().is_err());
    }
}
