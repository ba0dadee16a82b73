use crate::frame::Bit;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of an error flag in bits
pub const ERROR_FLAG_BITS: usize = 6;

/// Fault-confinement state of a bus node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Normal operation, signals errors with dominant flags
    ErrorActive,
    /// Elevated error counters, signals errors with recessive flags
    ErrorPassive,
    /// Disconnected from the bus until recovery
    BusOff,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::ErrorActive => "ERROR-ACTIVE",
            NodeState::ErrorPassive => "ERROR-PASSIVE",
            NodeState::BusOff => "BUS-OFF",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Active flags are dominant and destroy whatever else is on the wire;
/// passive flags are recessive and can be overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorFlagKind {
    Active,
    Passive,
}

/// Error flag emitted by a node that detected a bit error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFlag {
    pub kind: ErrorFlagKind,
}

impl ErrorFlag {
    pub fn for_state(state: NodeState) -> Option<Self> {
        match state {
            NodeState::ErrorActive => Some(Self { kind: ErrorFlagKind::Active }),
            NodeState::ErrorPassive => Some(Self { kind: ErrorFlagKind::Passive }),
            NodeState::BusOff => None,
        }
    }

    pub fn bits(&self) -> [Bit; ERROR_FLAG_BITS] {
        match self.kind {
            ErrorFlagKind::Active => [Bit::Dominant; ERROR_FLAG_BITS],
            ErrorFlagKind::Passive => [Bit::Recessive; ERROR_FLAG_BITS],
        }
    }
}

/// What happened to a submitted frame, as reported back to the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOutcome {
    /// Frame completed and was delivered to the other nodes
    Delivered,
    /// Transmission was corrupted (collision or injected bit error)
    BitError,
    /// Sender was bus-off; the frame never reached the wire
    Rejected,
}

/// Why a node's counters were reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryTrigger {
    /// Explicit recovery call (standard bus-off recovery)
    Manual,
    /// Early recovery fired by the F1+F2 countermeasure while error-passive
    Countermeasure,
}

/// Point-in-time view of one node's fault-confinement counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node_id: String,
    pub priority_id: u16,
    pub tec: u32,
    pub rec: u32,
    pub state: NodeState,
    pub consecutive_error_frames: u32,
    pub last_observed_flag: Option<ErrorFlagKind>,
    pub inject_error: bool,
}

impl fmt::Display for NodeSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] TEC: {} | REC: {} | State: {}",
            self.node_id, self.tec, self.rec, self.state
        )
    }
}
