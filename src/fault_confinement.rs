/// Fault Confinement State Machine
///
/// Transmit/receive error counters and the ERROR-ACTIVE / ERROR-PASSIVE /
/// BUS-OFF state derived from them. This type holds no locks and knows
/// nothing about the bus; `Ecu` wraps it and performs the side effects
/// (error flag broadcast, events) that a counter change calls for.
use crate::types::{ErrorFlag, NodeState};
use serde::{Deserialize, Serialize};

/// TEC or REC at or above this value makes a node error-passive
pub const ERROR_PASSIVE_THRESHOLD: u32 = 128;

/// TEC at or above this value takes a node off the bus
pub const BUS_OFF_THRESHOLD: u32 = 256;

/// TEC penalty for every error flag a node emits (active or passive)
pub const ERROR_FLAG_PENALTY: u32 = 8;

/// REC penalty when a node detects a bit error in a received frame
pub const RECEIVE_ERROR_PENALTY: u32 = 8;

/// REC increment when a node observes another node's error flag
pub const ERROR_FLAG_OBSERVED_STEP: u32 = 1;

/// Consecutive error frames before the countermeasure considers an attack (F1)
pub const ATTACK_DETECTION_THRESHOLD: u32 = 16;

/// State as a pure function of the counters
pub fn derive_state(tec: u32, rec: u32) -> NodeState {
    if tec >= BUS_OFF_THRESHOLD {
        NodeState::BusOff
    } else if tec >= ERROR_PASSIVE_THRESHOLD || rec >= ERROR_PASSIVE_THRESHOLD {
        NodeState::ErrorPassive
    } else {
        NodeState::ErrorActive
    }
}

/// State change produced by a counter mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: NodeState,
    pub to: NodeState,
}

/// Counters and derived state of one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultConfinement {
    tec: u32,
    rec: u32,
    state: NodeState,
    consecutive_error_frames: u32,
    last_failed_id: Option<u16>,
}

impl FaultConfinement {
    pub fn new() -> Self {
        Self {
            tec: 0,
            rec: 0,
            state: NodeState::ErrorActive,
            consecutive_error_frames: 0,
            last_failed_id: None,
        }
    }

    pub fn tec(&self) -> u32 {
        self.tec
    }

    pub fn rec(&self) -> u32 {
        self.rec
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn consecutive_error_frames(&self) -> u32 {
        self.consecutive_error_frames
    }

    pub fn last_failed_id(&self) -> Option<u16> {
        self.last_failed_id
    }

    pub fn is_bus_off(&self) -> bool {
        self.state == NodeState::BusOff
    }

    /// Own frame completed without a flagged error
    pub fn record_tx_success(&mut self) -> Option<StateTransition> {
        self.tec = self.tec.saturating_sub(1);
        self.consecutive_error_frames = 0;
        self.reevaluate()
    }

    /// Foreign frame received cleanly
    pub fn record_rx_success(&mut self) -> Option<StateTransition> {
        self.rec = self.rec.saturating_sub(1);
        self.reevaluate()
    }

    /// Bit error detected on a received frame
    pub fn record_rx_error(&mut self) -> Option<StateTransition> {
        self.rec += RECEIVE_ERROR_PENALTY;
        self.reevaluate()
    }

    /// Bookkeeping for the countermeasure; the caller raises the flag next
    pub fn record_detected_error(&mut self, frame_id: u16) {
        self.consecutive_error_frames += 1;
        self.last_failed_id = Some(frame_id);
    }

    /// Emit an error flag matching the current state and pay the TEC penalty.
    ///
    /// Returns `None` when bus-off: no flag is sent and nothing changes.
    pub fn raise_error_flag(&mut self) -> Option<(ErrorFlag, Option<StateTransition>)> {
        let flag = ErrorFlag::for_state(self.state)?;
        self.tec += ERROR_FLAG_PENALTY;
        Some((flag, self.reevaluate()))
    }

    /// Another node's error flag was seen on the bus
    pub fn observe_error_flag(&mut self) -> Option<StateTransition> {
        self.rec += ERROR_FLAG_OBSERVED_STEP;
        self.reevaluate()
    }

    /// F1 half of the countermeasure: sustained consecutive error frames
    /// while error-passive. Yields the identifier whose sender must be
    /// cross-checked (F2).
    pub fn suspected_attack_id(&self) -> Option<u16> {
        if self.state == NodeState::ErrorPassive
            && self.consecutive_error_frames >= ATTACK_DETECTION_THRESHOLD
        {
            self.last_failed_id
        } else {
            None
        }
    }

    /// Reset counters and return to ERROR-ACTIVE.
    ///
    /// Returns false when there was nothing to reset.
    pub fn recover(&mut self) -> bool {
        if self.tec == 0
            && self.rec == 0
            && self.consecutive_error_frames == 0
            && self.state == NodeState::ErrorActive
        {
            return false;
        }

        self.tec = 0;
        self.rec = 0;
        self.consecutive_error_frames = 0;
        self.state = NodeState::ErrorActive;
        true
    }

    fn reevaluate(&mut self) -> Option<StateTransition> {
        let next = derive_state(self.tec, self.rec);
        if next == self.state {
            return None;
        }

        let transition = StateTransition { from: self.state, to: next };
        self.state = next;
        Some(transition)
    }
}

impl Default for FaultConfinement {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorFlagKind;

    fn with_flags(count: u32) -> FaultConfinement {
        let mut fc = FaultConfinement::new();
        for _ in 0..count {
            fc.raise_error_flag();
        }
        fc
    }

    #[test]
    fn test_threshold_boundaries() {
        assert_eq!(derive_state(127, 0), NodeState::ErrorActive);
        assert_eq!(derive_state(128, 0), NodeState::ErrorPassive);
        assert_eq!(derive_state(255, 0), NodeState::ErrorPassive);
        assert_eq!(derive_state(256, 0), NodeState::BusOff);
        assert_eq!(derive_state(0, 127), NodeState::ErrorActive);
        assert_eq!(derive_state(0, 128), NodeState::ErrorPassive);
        // REC alone never takes a node off the bus
        assert_eq!(derive_state(0, 1000), NodeState::ErrorPassive);
    }

    #[test]
    fn test_state_always_matches_counters() {
        let mut fc = FaultConfinement::new();
        for step in 0..400u32 {
            match step % 5 {
                0 | 1 => {
                    fc.raise_error_flag();
                }
                2 => {
                    fc.record_tx_success();
                }
                3 => {
                    fc.observe_error_flag();
                }
                _ => {
                    fc.record_rx_success();
                }
            }
            assert_eq!(fc.state(), derive_state(fc.tec(), fc.rec()));
        }
    }

    #[test]
    fn test_counters_floor_at_zero() {
        let mut fc = FaultConfinement::new();
        for _ in 0..10 {
            fc.record_tx_success();
            fc.record_rx_success();
        }
        assert_eq!(fc.tec(), 0);
        assert_eq!(fc.rec(), 0);
    }

    #[test]
    fn test_active_flag_then_passive_flag() {
        let mut fc = with_flags(15);
        assert_eq!(fc.tec(), 120);

        let (flag, transition) = fc.raise_error_flag().unwrap();
        assert_eq!(flag.kind, ErrorFlagKind::Active);
        assert_eq!(
            transition,
            Some(StateTransition { from: NodeState::ErrorActive, to: NodeState::ErrorPassive })
        );

        // Passive flags carry the same penalty
        let (flag, transition) = fc.raise_error_flag().unwrap();
        assert_eq!(flag.kind, ErrorFlagKind::Passive);
        assert_eq!(transition, None);
        assert_eq!(fc.tec(), 136);
    }

    #[test]
    fn test_bus_off_after_32_flags() {
        let mut fc = with_flags(31);
        assert_eq!(fc.tec(), 248);
        assert_eq!(fc.state(), NodeState::ErrorPassive);

        let (_, transition) = fc.raise_error_flag().unwrap();
        assert_eq!(transition.unwrap().to, NodeState::BusOff);

        // No flag once bus-off
        assert!(fc.raise_error_flag().is_none());
        assert_eq!(fc.tec(), 256);
    }

    #[test]
    fn test_tx_success_resets_consecutive_errors() {
        let mut fc = FaultConfinement::new();
        fc.record_detected_error(0x555);
        fc.record_detected_error(0x555);
        assert_eq!(fc.consecutive_error_frames(), 2);

        fc.record_tx_success();
        assert_eq!(fc.consecutive_error_frames(), 0);
        assert_eq!(fc.last_failed_id(), Some(0x555));
    }

    #[test]
    fn test_suspected_attack_requires_passive_and_sixteen_errors() {
        let mut fc = FaultConfinement::new();
        for _ in 0..16 {
            fc.record_detected_error(0x555);
        }
        // Still error-active
        assert_eq!(fc.suspected_attack_id(), None);

        for _ in 0..16 {
            fc.raise_error_flag();
        }
        assert_eq!(fc.state(), NodeState::ErrorPassive);
        assert_eq!(fc.suspected_attack_id(), Some(0x555));
    }

    #[test]
    fn test_recover_resets_counters() {
        let mut fc = with_flags(32);
        fc.observe_error_flag();
        assert!(fc.is_bus_off());

        assert!(fc.recover());
        assert_eq!(fc.tec(), 0);
        assert_eq!(fc.rec(), 0);
        assert_eq!(fc.state(), NodeState::ErrorActive);
    }

    #[test]
    fn test_recover_is_idempotent() {
        let mut fc = FaultConfinement::new();
        let before = fc.clone();
        assert!(!fc.recover());
        assert_eq!(fc, before);
    }

    #[test]
    fn test_rx_error_penalty() {
        let mut fc = FaultConfinement::new();
        for _ in 0..15 {
            fc.record_rx_error();
        }
        assert_eq!(fc.rec(), 120);
        let transition = fc.record_rx_error();
        assert_eq!(transition.unwrap().to, NodeState::ErrorPassive);
    }
}
