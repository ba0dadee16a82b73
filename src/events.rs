/// Simulation Events
///
/// Typed record of everything observable on the bus. The core only emits
/// events; printing, plotting and persistence are handled by sinks.
use crate::attack_controller::{AttackPhase, StopReason};
use crate::types::{ErrorFlagKind, NodeState, RecoveryTrigger};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

/// Per-node counter sample taken after every attack round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub round: u64,
    pub node_id: String,
    pub tec: u32,
    pub rec: u32,
    pub state: NodeState,
}

/// Observable simulation events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum SimEvent {
    /// Node attached to the bus
    NodeRegistered {
        node_id: String,
        priority_id: u16,
        defense_enabled: bool,
    },

    /// Frame won arbitration and reached every other node
    FrameDelivered {
        logical_time: u64,
        frame_id: u16,
        sender: String,
        receivers: usize,
    },

    /// Several nodes transmitted the same identifier at once
    Collision {
        logical_time: u64,
        frame_id: u16,
        contenders: Vec<String>,
        survivor: Option<String>,
    },

    /// Bus-off node tried to transmit
    SendRejected { node_id: String, frame_id: u16 },

    /// Node signalled an error
    ErrorFlagRaised {
        node_id: String,
        kind: ErrorFlagKind,
        tec: u32,
    },

    /// Fault-confinement state changed
    StateChanged {
        node_id: String,
        from: NodeState,
        to: NodeState,
        tec: u32,
        rec: u32,
    },

    /// Countermeasure identified an externally forced bus-off attempt
    AttackDetected {
        node_id: String,
        frame_id: u16,
        suspected_sender: String,
        consecutive_errors: u32,
    },

    /// Counters reset
    Recovered {
        node_id: String,
        trigger: RecoveryTrigger,
    },

    /// Attack engagement moved to another phase
    PhaseChanged {
        round: u64,
        victim: String,
        attacker: String,
        from: AttackPhase,
        to: AttackPhase,
    },

    /// Attacker stopped injecting after its victim's counters were reset
    InjectionPaused {
        round: u64,
        victim: String,
        attacker: String,
        rounds: u64,
    },

    /// Attacker injects again after a cooldown
    InjectionResumed {
        round: u64,
        victim: String,
        attacker: String,
    },

    /// Counter sample
    Telemetry(TelemetrySample),

    /// Attack controller stopped scheduling rounds
    Terminated { round: u64, reason: StopReason },
}

impl SimEvent {
    /// Node the event is about, if any
    pub fn node_id(&self) -> Option<&str> {
        match self {
            SimEvent::NodeRegistered { node_id, .. }
            | SimEvent::SendRejected { node_id, .. }
            | SimEvent::ErrorFlagRaised { node_id, .. }
            | SimEvent::StateChanged { node_id, .. }
            | SimEvent::AttackDetected { node_id, .. }
            | SimEvent::Recovered { node_id, .. } => Some(node_id),
            SimEvent::FrameDelivered { sender, .. } => Some(sender),
            SimEvent::Telemetry(sample) => Some(&sample.node_id),
            _ => None,
        }
    }
}

/// Consumer of simulation events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SimEvent);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: SimEvent) {}
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct EventRecorder {
    events: Mutex<Vec<SimEvent>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all events recorded so far
    pub fn events(&self) -> Vec<SimEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of events satisfying `predicate`
    pub fn count(&self, predicate: impl Fn(&SimEvent) -> bool) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| predicate(e))
            .count()
    }

    /// Telemetry samples in emission order
    pub fn telemetry(&self) -> Vec<TelemetrySample> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|e| match e {
                SimEvent::Telemetry(sample) => Some(sample.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl EventSink for EventRecorder {
    fn emit(&self, event: SimEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}

/// Publishes events on a tokio broadcast channel.
///
/// Slow subscribers lag and lose the oldest events; the simulation itself
/// never blocks on them.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<SimEvent>,
}

impl BroadcastSink {
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _rx) = broadcast::channel(buffer_size);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SimEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: SimEvent) {
        // No subscriber is not an error
        let _ = self.tx.send(event);
    }
}

/// Forwards each event to several sinks in order
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: SimEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}
