use serde::{Deserialize, Serialize};
use std::fmt;

/// Health of a cluster member as seen by the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    Alive = 0,
    Suspect = 1,
    Dead = 2,
    Left = 3,
}

impl NodeState {
    /// Check if the state is considered active (Alive or Suspect)
    pub fn is_active(&self) -> bool {
        matches!(self, NodeState::Alive | NodeState::Suspect)
    }

    /// Dead or gracefully departed.
    pub fn is_gone(&self) -> bool {
        matches!(self, NodeState::Dead | NodeState::Left)
    }

    /// Tie breaker between two updates that carry the same incarnation:
    /// the more severe one wins, so a stale refutation can never resurrect
    /// a node that was declared dead at the same incarnation.
    pub(crate) fn severity(&self) -> u8 {
        *self as u8
    }
}

impl Default for NodeState {
    fn default() -> Self {
        NodeState::Alive
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Alive => write!(f, "Alive"),
            NodeState::Suspect => write!(f, "Suspect"),
            NodeState::Dead => write!(f, "Dead"),
            NodeState::Left => write!(f, "Left"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_active() {
        assert!(NodeState::Alive.is_active());
        assert!(NodeState::Suspect.is_active());
        assert!(!NodeState::Dead.is_active());
        assert!(!NodeState::Left.is_active());
    }

    #[test]
    fn test_severity_order() {
        assert!(NodeState::Alive.severity() < NodeState::Suspect.severity());
        assert!(NodeState::Suspect.severity() < NodeState::Dead.severity());
        assert!(NodeState::Dead.severity() < NodeState::Left.severity());
    }
}
