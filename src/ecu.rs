use crate::can_bus::CanBus;
use crate::error::{Result, SimError};
use crate::error_gate::BitErrorGate;
use crate::events::{EventSink, SimEvent};
use crate::fault_confinement::{FaultConfinement, StateTransition};
use crate::frame::{Frame, FrameKind, MAX_STANDARD_ID};
use crate::types::{ErrorFlag, ErrorFlagKind, NodeSnapshot, NodeState, RecoveryTrigger, TxOutcome};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Static configuration of one bus node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcuConfig {
    /// Unique name on the bus
    pub id: String,
    /// Identifier used for this node's regular data frames
    pub priority_id: u16,
    /// Enables the F1+F2 early-recovery countermeasure
    pub defense_enabled: bool,
    /// Identifier this node overwrites with dominant bits while injection is on
    pub attack_target: Option<u16>,
}

impl EcuConfig {
    pub fn new(id: impl Into<String>, priority_id: u16) -> Self {
        Self {
            id: id.into(),
            priority_id,
            defense_enabled: false,
            attack_target: None,
        }
    }

    pub fn with_defense(mut self) -> Self {
        self.defense_enabled = true;
        self
    }

    pub fn targeting(mut self, frame_id: u16) -> Self {
        self.attack_target = Some(frame_id);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(SimError::InvalidConfig("node id must not be empty".to_string()));
        }
        if self.priority_id > MAX_STANDARD_ID {
            return Err(SimError::InvalidConfig(format!(
                "node {} priority id 0x{:X} exceeds 11 bits",
                self.id, self.priority_id
            )));
        }
        if let Some(target) = self.attack_target {
            if target > MAX_STANDARD_ID {
                return Err(SimError::InvalidConfig(format!(
                    "node {} attack target 0x{:X} exceeds 11 bits",
                    self.id, target
                )));
            }
        }
        Ok(())
    }
}

struct NodeCore {
    counters: FaultConfinement,
    gate: BitErrorGate,
    /// Polarity of the last foreign error flag seen since the last reset
    last_observed_flag: Option<ErrorFlagKind>,
}

/// Simulated ECU attached to a `CanBus`.
///
/// The node lock is never held while calling into the bus or another node,
/// so error-flag fan-out can re-enter any node on the bus safely.
pub struct Ecu {
    config: EcuConfig,
    bus: Weak<CanBus>,
    sink: Arc<dyn EventSink>,
    core: Mutex<NodeCore>,
    inject_error: AtomicBool,
}

impl Ecu {
    /// Create a node and register it on `bus`
    pub fn attach(config: EcuConfig, gate: BitErrorGate, bus: &Arc<CanBus>) -> Result<Arc<Self>> {
        config.validate()?;

        let node = Arc::new(Self {
            config,
            bus: Arc::downgrade(bus),
            sink: bus.sink(),
            core: Mutex::new(NodeCore {
                counters: FaultConfinement::new(),
                gate,
                last_observed_flag: None,
            }),
            inject_error: AtomicBool::new(false),
        });
        bus.register(Arc::clone(&node));
        Ok(node)
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn priority_id(&self) -> u16 {
        self.config.priority_id
    }

    pub fn config(&self) -> &EcuConfig {
        &self.config
    }

    pub fn defense_enabled(&self) -> bool {
        self.config.defense_enabled
    }

    pub fn attack_target(&self) -> Option<u16> {
        self.config.attack_target
    }

    /// Identifier this node puts on the wire for a frame of `kind`
    pub fn frame_id(&self, kind: FrameKind) -> u16 {
        match kind {
            FrameKind::Data => self.config.priority_id,
            FrameKind::Preceding => self.config.priority_id.saturating_sub(1),
        }
    }

    pub fn is_attached_to(&self, bus: &Arc<CanBus>) -> bool {
        std::ptr::eq(self.bus.as_ptr(), Arc::as_ptr(bus))
    }

    pub fn tec(&self) -> u32 {
        self.lock_core().counters.tec()
    }

    pub fn rec(&self) -> u32 {
        self.lock_core().counters.rec()
    }

    pub fn state(&self) -> NodeState {
        self.lock_core().counters.state()
    }

    pub fn is_bus_off(&self) -> bool {
        self.lock_core().counters.is_bus_off()
    }

    pub fn consecutive_error_frames(&self) -> u32 {
        self.lock_core().counters.consecutive_error_frames()
    }

    pub fn last_failed_id(&self) -> Option<u16> {
        self.lock_core().counters.last_failed_id()
    }

    /// Active flags come from error-active senders, passive ones from
    /// error-passive senders
    pub fn last_observed_flag(&self) -> Option<ErrorFlagKind> {
        self.lock_core().last_observed_flag
    }

    pub fn inject_error(&self) -> bool {
        self.inject_error.load(Ordering::SeqCst)
    }

    pub fn set_inject_error(&self, enabled: bool) {
        self.inject_error.store(enabled, Ordering::SeqCst);
    }

    /// True when this node will overwrite a frame with `frame_id`
    pub fn injects_on(&self, frame_id: u16) -> bool {
        self.inject_error() && self.config.attack_target == Some(frame_id)
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let core = self.lock_core();
        NodeSnapshot {
            node_id: self.config.id.clone(),
            priority_id: self.config.priority_id,
            tec: core.counters.tec(),
            rec: core.counters.rec(),
            state: core.counters.state(),
            consecutive_error_frames: core.counters.consecutive_error_frames(),
            last_observed_flag: core.last_observed_flag,
            inject_error: self.inject_error(),
        }
    }

    /// Transmit a data frame on this node's priority id
    pub fn send(self: &Arc<Self>, payload: Vec<u8>) -> Result<TxOutcome> {
        self.send_kind(FrameKind::Data, payload)
    }

    /// Transmit the frame one identifier below this node's priority id
    pub fn send_preceding(self: &Arc<Self>, payload: Vec<u8>) -> Result<TxOutcome> {
        self.send_kind(FrameKind::Preceding, payload)
    }

    pub fn send_kind(self: &Arc<Self>, kind: FrameKind, payload: Vec<u8>) -> Result<TxOutcome> {
        let bus = self.bus()?;
        let frame = Frame::new(self.frame_id(kind), payload)?;
        Ok(bus.send(frame, self))
    }

    /// Frame delivered by the bus. Returns false when bus-off (ignored).
    pub fn receive(&self, frame: &Frame) -> bool {
        let mut core = self.lock_core();
        if core.counters.is_bus_off() {
            return false;
        }

        if core.gate.trip() {
            let transition = core.counters.record_rx_error();
            core.counters.record_detected_error(frame.id());
            let (tec, rec) = (core.counters.tec(), core.counters.rec());
            drop(core);

            self.emit_transition(transition, tec, rec);
            self.send_error_flag();
        } else {
            let transition = core.counters.record_rx_success();
            let (tec, rec) = (core.counters.tec(), core.counters.rec());
            drop(core);

            self.emit_transition(transition, tec, rec);
        }
        true
    }

    /// Own transmission of `frame_id` was corrupted
    pub fn report_bit_error(&self, frame_id: u16) {
        self.lock_core().counters.record_detected_error(frame_id);
        self.send_error_flag();
    }

    /// Signal an error on the bus.
    ///
    /// Pays the TEC penalty, broadcasts the flag to every other node, then
    /// runs the countermeasure check against the post-flag state.
    pub fn send_error_flag(&self) {
        let mut core = self.lock_core();
        let Some((flag, transition)) = core.counters.raise_error_flag() else {
            return;
        };
        let (tec, rec) = (core.counters.tec(), core.counters.rec());
        let suspect = if self.config.defense_enabled {
            core.counters
                .suspected_attack_id()
                .map(|frame_id| (frame_id, core.counters.consecutive_error_frames()))
        } else {
            None
        };
        drop(core);

        self.sink.emit(SimEvent::ErrorFlagRaised {
            node_id: self.config.id.clone(),
            kind: flag.kind,
            tec,
        });
        self.emit_transition(transition, tec, rec);

        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        bus.send_error_flag(flag, self);

        if let Some((frame_id, consecutive_errors)) = suspect {
            self.check_forced_bus_off(&bus, frame_id, consecutive_errors);
        }
    }

    /// Another node's error flag reached this node
    pub fn on_error_detected(&self, flag: ErrorFlag) {
        let mut core = self.lock_core();
        if core.counters.is_bus_off() {
            return;
        }
        core.last_observed_flag = Some(flag.kind);
        let transition = core.counters.observe_error_flag();
        let (tec, rec) = (core.counters.tec(), core.counters.rec());
        drop(core);

        self.emit_transition(transition, tec, rec);
    }

    /// Reset counters and return to ERROR-ACTIVE. Returns false (and emits
    /// nothing) when the node is already pristine.
    pub fn recover(&self) -> bool {
        self.recover_with(RecoveryTrigger::Manual)
    }

    pub(crate) fn handle_tx_success(&self) {
        let mut core = self.lock_core();
        let transition = core.counters.record_tx_success();
        let (tec, rec) = (core.counters.tec(), core.counters.rec());
        drop(core);

        self.emit_transition(transition, tec, rec);
    }

    pub(crate) fn transmit_gate_trips(&self) -> bool {
        self.lock_core().gate.trip()
    }

    /// F2: the failing identifier was last completed by a different node,
    /// so someone else is transmitting our id.
    fn check_forced_bus_off(&self, bus: &CanBus, frame_id: u16, consecutive_errors: u32) {
        let Some(sender) = bus.recent_sender(frame_id) else {
            return;
        };
        if sender == self.config.id {
            return;
        }

        self.sink.emit(SimEvent::AttackDetected {
            node_id: self.config.id.clone(),
            frame_id,
            suspected_sender: sender,
            consecutive_errors,
        });
        self.recover_with(RecoveryTrigger::Countermeasure);
    }

    fn recover_with(&self, trigger: RecoveryTrigger) -> bool {
        let mut core = self.lock_core();
        let before = core.counters.state();
        if !core.counters.recover() {
            return false;
        }
        core.last_observed_flag = None;
        let (tec, rec) = (core.counters.tec(), core.counters.rec());
        drop(core);

        if before != NodeState::ErrorActive {
            self.emit_transition(
                Some(StateTransition {
                    from: before,
                    to: NodeState::ErrorActive,
                }),
                tec,
                rec,
            );
        }
        self.sink.emit(SimEvent::Recovered {
            node_id: self.config.id.clone(),
            trigger,
        });
        true
    }

    fn emit_transition(&self, transition: Option<StateTransition>, tec: u32, rec: u32) {
        if let Some(t) = transition {
            self.sink.emit(SimEvent::StateChanged {
                node_id: self.config.id.clone(),
                from: t.from,
                to: t.to,
                tec,
                rec,
            });
        }
    }

    fn bus(&self) -> Result<Arc<CanBus>> {
        self.bus
            .upgrade()
            .ok_or_else(|| SimError::BusDetached(self.config.id.clone()))
    }

    fn lock_core(&self) -> MutexGuard<'_, NodeCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Ecu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ecu")
            .field("config", &self.config)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
