/// Bus-Off Attack Controller
///
/// Drives one or more attacker/victim engagements round by round. Each round
/// the participating nodes submit concurrently while the wire is held, so
/// all of them contend in the same arbitration; the phase machine then looks
/// at the resulting counters.
use crate::can_bus::{BusHold, CanBus};
use crate::ecu::Ecu;
use crate::error::{Result, SimError};
use crate::events::{EventSink, SimEvent, TelemetrySample};
use crate::fault_confinement::ERROR_PASSIVE_THRESHOLD;
use crate::frame::{FrameKind, MAX_PAYLOAD_LEN};
use crate::types::TxOutcome;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::thread;

/// Payload of the synchronization frame sent just below a contested id
pub const PRECEDING_PAYLOAD: [u8; 1] = [0xAA];

/// Which side of an engagement ended up off the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    VictimBusOff,
    AttackerBusOff,
}

/// Attack phase of one engagement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttackPhase {
    /// Attacker injects on every contested frame; both counters climb
    Phase1,
    /// Injection paused until the attacker is back to error-active
    Phase1To2,
    /// Injection resumed against an error-passive victim
    Phase2,
    Terminal(Termination),
}

impl AttackPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttackPhase::Terminal(_))
    }
}

impl fmt::Display for AttackPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttackPhase::Phase1 => write!(f, "PHASE1"),
            AttackPhase::Phase1To2 => write!(f, "PHASE1to2"),
            AttackPhase::Phase2 => write!(f, "PHASE2"),
            AttackPhase::Terminal(Termination::VictimBusOff) => write!(f, "TERMINAL(victim bus-off)"),
            AttackPhase::Terminal(Termination::AttackerBusOff) => write!(f, "TERMINAL(attacker bus-off)"),
        }
    }
}

/// Why the controller stopped scheduling rounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    Terminal(Termination),
    RoundLimit,
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Terminal(Termination::VictimBusOff) => write!(f, "victim bus-off"),
            StopReason::Terminal(Termination::AttackerBusOff) => write!(f, "attacker bus-off"),
            StopReason::RoundLimit => write!(f, "round limit reached"),
            StopReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of a single `step`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStatus {
    Continue,
    Stopped(StopReason),
}

/// One attacker targeting one victim on a contested identifier
#[derive(Debug, Clone)]
pub struct Engagement {
    victim: Arc<Ecu>,
    attacker: Arc<Ecu>,
    contested_id: u16,
    victim_kind: FrameKind,
    phase: AttackPhase,
    cooldown_remaining: u64,
}

/// Injection change made during Phase2 without a phase transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pacing {
    Paused(u64),
    Resumed,
}

impl Engagement {
    /// The attacker's `attack_target` is the contested id; the victim must
    /// transmit that id either as data or as its preceding frame.
    pub fn new(victim: Arc<Ecu>, attacker: Arc<Ecu>) -> Result<Self> {
        if Arc::ptr_eq(&victim, &attacker) {
            return Err(SimError::InvalidConfig(format!(
                "{} cannot attack itself",
                attacker.id()
            )));
        }
        let contested_id = attacker.attack_target().ok_or_else(|| {
            SimError::InvalidConfig(format!("attacker {} has no attack target", attacker.id()))
        })?;

        let victim_kind = [FrameKind::Data, FrameKind::Preceding]
            .into_iter()
            .find(|kind| victim.frame_id(*kind) == contested_id)
            .ok_or_else(|| {
                SimError::InvalidConfig(format!(
                    "victim {} never transmits contested id 0x{:03X}",
                    victim.id(),
                    contested_id
                ))
            })?;

        Ok(Self {
            victim,
            attacker,
            contested_id,
            victim_kind,
            phase: AttackPhase::Phase1,
            cooldown_remaining: 0,
        })
    }

    pub fn victim(&self) -> &Arc<Ecu> {
        &self.victim
    }

    pub fn attacker(&self) -> &Arc<Ecu> {
        &self.attacker
    }

    pub fn contested_id(&self) -> u16 {
        self.contested_id
    }

    pub fn phase(&self) -> AttackPhase {
        self.phase
    }

    /// Rounds left before a paused attacker injects again
    pub fn cooldown_remaining(&self) -> u64 {
        self.cooldown_remaining
    }

    /// Move to the next phase if the counters call for it.
    /// Terminal checks come first, in every phase.
    fn advance(&mut self) -> Option<(AttackPhase, AttackPhase)> {
        let from = self.phase;
        let next = match from {
            AttackPhase::Terminal(_) => return None,
            _ if self.victim.is_bus_off() => AttackPhase::Terminal(Termination::VictimBusOff),
            _ if self.attacker.is_bus_off() => AttackPhase::Terminal(Termination::AttackerBusOff),
            AttackPhase::Phase1
                if self.victim.tec() >= ERROR_PASSIVE_THRESHOLD
                    && self.attacker.tec() >= ERROR_PASSIVE_THRESHOLD =>
            {
                self.attacker.set_inject_error(false);
                AttackPhase::Phase1To2
            }
            AttackPhase::Phase1To2 if self.attacker.tec() < ERROR_PASSIVE_THRESHOLD => {
                self.attacker.set_inject_error(true);
                AttackPhase::Phase2
            }
            _ => return None,
        };

        self.phase = next;
        Some((from, next))
    }

    /// Phase2 back-off: once the victim's TEC is back at 0 the attacker
    /// stops injecting for `cooldown_rounds` rounds, then re-arms.
    fn pace(&mut self, cooldown_rounds: u64) -> Option<Pacing> {
        if self.phase != AttackPhase::Phase2 {
            return None;
        }

        if self.cooldown_remaining > 0 {
            self.cooldown_remaining -= 1;
            if self.cooldown_remaining > 0 {
                return None;
            }
            self.attacker.set_inject_error(true);
            return Some(Pacing::Resumed);
        }

        if cooldown_rounds == 0 || self.victim.tec() != 0 {
            return None;
        }
        self.attacker.set_inject_error(false);
        self.cooldown_remaining = cooldown_rounds;
        Some(Pacing::Paused(cooldown_rounds))
    }
}

/// Round parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Attacker sends a frame one id below each contested id first
    pub preceding_frames: bool,
    /// Rounds before giving up with `StopReason::RoundLimit`
    pub max_rounds: u64,
    /// Phase2 rounds the attacker holds off after the victim's TEC resets
    /// to 0. Zero keeps it injecting.
    pub cooldown_rounds: u64,
    /// Payload of the contested data frames
    pub payload: Vec<u8>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            preceding_frames: false,
            max_rounds: 1000,
            cooldown_rounds: 3,
            payload: vec![0xCA, 0xFE],
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(SimError::InvalidConfig(format!(
                "payload of {} bytes exceeds {}",
                self.payload.len(),
                MAX_PAYLOAD_LEN
            )));
        }
        if self.max_rounds == 0 {
            return Err(SimError::InvalidConfig("max_rounds must be at least 1".to_string()));
        }
        Ok(())
    }
}

struct Submission {
    node: Arc<Ecu>,
    kind: FrameKind,
    payload: Vec<u8>,
}

/// Round-based attack driver.
///
/// The first engagement is the primary one: its terminal phase stops the
/// whole simulation. Further engagements (e.g. a guardian node attacking
/// the attacker) run alongside it until they terminate on their own.
pub struct AttackController {
    bus: Arc<CanBus>,
    engagements: Vec<Engagement>,
    config: ControllerConfig,
    sink: Arc<dyn EventSink>,
    round: u64,
    stopped: Option<StopReason>,
}

impl AttackController {
    pub fn new(bus: Arc<CanBus>, primary: Engagement, config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        let sink = bus.sink();
        let mut controller = Self {
            bus,
            engagements: Vec::new(),
            config,
            sink,
            round: 0,
            stopped: None,
        };
        controller.add_engagement(primary)?;
        Ok(controller)
    }

    /// Add an engagement and arm its attacker
    pub fn add_engagement(&mut self, engagement: Engagement) -> Result<()> {
        for node in [&engagement.victim, &engagement.attacker] {
            if !node.is_attached_to(&self.bus) {
                return Err(SimError::InvalidConfig(format!(
                    "node {} is attached to a different bus",
                    node.id()
                )));
            }
        }

        engagement.attacker.set_inject_error(true);
        self.engagements.push(engagement);
        Ok(())
    }

    pub fn bus(&self) -> &Arc<CanBus> {
        &self.bus
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn engagements(&self) -> &[Engagement] {
        &self.engagements
    }

    /// Completed rounds
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Phase of the primary engagement
    pub fn phase(&self) -> AttackPhase {
        self.engagements
            .first()
            .map(|e| e.phase)
            .unwrap_or(AttackPhase::Phase1)
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stopped
    }

    pub fn is_finished(&self) -> bool {
        self.stopped.is_some()
    }

    /// Stop scheduling. Has no effect once already stopped.
    pub fn cancel(&mut self) {
        if self.stopped.is_none() {
            self.stop(StopReason::Cancelled);
        }
    }

    /// Run a single round
    pub fn step(&mut self) -> Result<RoundStatus> {
        if let Some(reason) = self.stopped {
            return Ok(RoundStatus::Stopped(reason));
        }
        if self.round >= self.config.max_rounds {
            self.stop(StopReason::RoundLimit);
            return Ok(RoundStatus::Stopped(StopReason::RoundLimit));
        }

        self.round += 1;
        let submissions = self.plan_round();
        self.execute(&submissions)?;
        self.emit_telemetry();

        let round = self.round;
        let cooldown_rounds = self.config.cooldown_rounds;
        let mut changes = Vec::new();
        for engagement in &mut self.engagements {
            let victim = engagement.victim.id().to_string();
            let attacker = engagement.attacker.id().to_string();
            if let Some((from, to)) = engagement.advance() {
                changes.push(SimEvent::PhaseChanged {
                    round,
                    victim,
                    attacker,
                    from,
                    to,
                });
                continue;
            }
            match engagement.pace(cooldown_rounds) {
                Some(Pacing::Paused(rounds)) => changes.push(SimEvent::InjectionPaused {
                    round,
                    victim,
                    attacker,
                    rounds,
                }),
                Some(Pacing::Resumed) => changes.push(SimEvent::InjectionResumed {
                    round,
                    victim,
                    attacker,
                }),
                None => {}
            }
        }
        for change in changes {
            self.sink.emit(change);
        }

        if let AttackPhase::Terminal(termination) = self.phase() {
            self.stop(StopReason::Terminal(termination));
            return Ok(RoundStatus::Stopped(StopReason::Terminal(termination)));
        }
        Ok(RoundStatus::Continue)
    }

    /// Step until a terminal phase, the round limit or cancellation
    pub fn run_to_completion(&mut self) -> Result<StopReason> {
        loop {
            if let RoundStatus::Stopped(reason) = self.step()? {
                return Ok(reason);
            }
        }
    }

    fn stop(&mut self, reason: StopReason) {
        self.stopped = Some(reason);
        self.sink.emit(SimEvent::Terminated {
            round: self.round,
            reason,
        });
    }

    /// Frames for this round, one per (node, frame kind)
    fn plan_round(&self) -> Vec<Submission> {
        let mut plan: Vec<Submission> = Vec::new();
        let mut push = |node: &Arc<Ecu>, kind: FrameKind, payload: &[u8]| {
            if plan.iter().any(|s| Arc::ptr_eq(&s.node, node) && s.kind == kind) {
                return;
            }
            plan.push(Submission {
                node: Arc::clone(node),
                kind,
                payload: payload.to_vec(),
            });
        };

        for engagement in self.engagements.iter().filter(|e| !e.phase.is_terminal()) {
            if self.config.preceding_frames {
                push(&engagement.attacker, FrameKind::Preceding, &PRECEDING_PAYLOAD);
            }
            let victim_payload: &[u8] = match engagement.victim_kind {
                FrameKind::Data => &self.config.payload,
                FrameKind::Preceding => &PRECEDING_PAYLOAD,
            };
            push(&engagement.victim, engagement.victim_kind, victim_payload);
            push(&engagement.attacker, FrameKind::Data, &self.config.payload);
        }
        plan
    }

    /// Submit every planned frame from its own thread while the wire is
    /// held, then let them all contend at once.
    ///
    /// Each sender is queued before the next one starts, so FIFO ties (and
    /// with them the order of seeded error-gate draws) follow the plan.
    fn execute(&self, submissions: &[Submission]) -> Result<Vec<TxOutcome>> {
        let hold: BusHold<'_> = self.bus.hold();

        let results: Vec<Result<TxOutcome>> = thread::scope(|s| {
            let mut handles = Vec::with_capacity(submissions.len());
            for (queued, sub) in submissions.iter().enumerate() {
                handles.push(s.spawn(move || sub.node.send_kind(sub.kind, sub.payload.clone())));
                hold.wait_for_submissions(queued as u64 + 1);
            }

            hold.release();

            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });

        results.into_iter().collect()
    }

    fn emit_telemetry(&self) {
        for snapshot in self.bus.snapshots() {
            self.sink.emit(SimEvent::Telemetry(TelemetrySample {
                round: self.round,
                node_id: snapshot.node_id,
                tec: snapshot.tec,
                rec: snapshot.rec,
                state: snapshot.state,
            }));
        }
    }
}

impl fmt::Debug for AttackController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttackController")
            .field("round", &self.round)
            .field("phase", &self.phase())
            .field("engagements", &self.engagements.len())
            .field("stopped", &self.stopped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can_bus::BusConfig;
    use crate::ecu::EcuConfig;
    use crate::error_gate::BitErrorGate;
    use crate::events::EventRecorder;
    use crate::types::NodeState;

    struct Fixture {
        recorder: Arc<EventRecorder>,
        victim: Arc<Ecu>,
        attacker: Arc<Ecu>,
        controller: AttackController,
    }

    fn fixture(victim_config: EcuConfig, config: ControllerConfig) -> Fixture {
        let recorder = Arc::new(EventRecorder::new());
        let bus = CanBus::new(BusConfig::default(), recorder.clone());
        let victim = Ecu::attach(victim_config, BitErrorGate::disabled(), &bus).unwrap();
        let attacker = Ecu::attach(
            EcuConfig::new("Attacker", 0x555).targeting(0x555),
            BitErrorGate::disabled(),
            &bus,
        )
        .unwrap();
        let engagement = Engagement::new(victim.clone(), attacker.clone()).unwrap();
        let controller = AttackController::new(bus, engagement, config).unwrap();
        Fixture {
            recorder,
            victim,
            attacker,
            controller,
        }
    }

    fn step_n(controller: &mut AttackController, n: u64) {
        for _ in 0..n {
            assert_eq!(controller.step().unwrap(), RoundStatus::Continue);
        }
    }

    #[test]
    fn test_engagement_requires_target() {
        let bus = CanBus::with_defaults();
        let victim = Ecu::attach(EcuConfig::new("Victim", 0x555), BitErrorGate::disabled(), &bus).unwrap();
        let attacker = Ecu::attach(EcuConfig::new("Attacker", 0x555), BitErrorGate::disabled(), &bus).unwrap();

        assert!(Engagement::new(victim.clone(), attacker).is_err());
        assert!(Engagement::new(victim.clone(), victim).is_err());
    }

    #[test]
    fn test_engagement_rejects_unrelated_victim() {
        let bus = CanBus::with_defaults();
        let victim = Ecu::attach(EcuConfig::new("Victim", 0x300), BitErrorGate::disabled(), &bus).unwrap();
        let attacker = Ecu::attach(
            EcuConfig::new("Attacker", 0x555).targeting(0x555),
            BitErrorGate::disabled(),
            &bus,
        )
        .unwrap();

        assert!(Engagement::new(victim, attacker).is_err());
    }

    #[test]
    fn test_phase1_raises_both_counters() {
        let mut f = fixture(EcuConfig::new("Victim", 0x555), ControllerConfig::default());
        assert!(f.attacker.inject_error());

        step_n(&mut f.controller, 15);
        assert_eq!(f.victim.tec(), 120);
        assert_eq!(f.attacker.tec(), 120);
        assert_eq!(f.controller.phase(), AttackPhase::Phase1);

        step_n(&mut f.controller, 1);
        assert_eq!(f.victim.state(), NodeState::ErrorPassive);
        assert_eq!(f.attacker.state(), NodeState::ErrorPassive);
        assert_eq!(f.controller.phase(), AttackPhase::Phase1To2);
        assert!(!f.attacker.inject_error());
    }

    #[test]
    fn test_phase2_resumes_injection() {
        let mut f = fixture(EcuConfig::new("Victim", 0x555), ControllerConfig::default());
        step_n(&mut f.controller, 17);

        assert_eq!(f.attacker.tec(), 127);
        assert_eq!(f.victim.tec(), 127);
        assert_eq!(f.controller.phase(), AttackPhase::Phase2);
        assert!(f.attacker.inject_error());

        let phases: Vec<(AttackPhase, AttackPhase)> = f
            .recorder
            .events()
            .into_iter()
            .filter_map(|e| match e {
                SimEvent::PhaseChanged { from, to, .. } => Some((from, to)),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![
                (AttackPhase::Phase1, AttackPhase::Phase1To2),
                (AttackPhase::Phase1To2, AttackPhase::Phase2),
            ]
        );
    }

    #[test]
    fn test_attack_drives_victim_bus_off() {
        let mut f = fixture(EcuConfig::new("Victim", 0x555), ControllerConfig::default());

        let reason = f.controller.run_to_completion().unwrap();

        assert_eq!(reason, StopReason::Terminal(Termination::VictimBusOff));
        assert_eq!(f.controller.round(), 34);
        assert_eq!(f.victim.tec(), 263);
        assert_eq!(f.attacker.tec(), 119);
        assert_eq!(f.attacker.state(), NodeState::ErrorActive);
    }

    #[test]
    fn test_terminal_is_sticky() {
        let mut f = fixture(EcuConfig::new("Victim", 0x555), ControllerConfig::default());
        f.controller.run_to_completion().unwrap();
        let victim = f.victim.snapshot();
        let attacker = f.attacker.snapshot();

        let status = f.controller.step().unwrap();

        assert_eq!(status, RoundStatus::Stopped(StopReason::Terminal(Termination::VictimBusOff)));
        assert_eq!(f.controller.round(), 34);
        assert_eq!(f.victim.snapshot(), victim);
        assert_eq!(f.attacker.snapshot(), attacker);
        assert_eq!(
            f.recorder.count(|e| matches!(e, SimEvent::Terminated { .. })),
            1
        );
    }

    #[test]
    fn test_round_limit() {
        let config = ControllerConfig {
            max_rounds: 5,
            ..ControllerConfig::default()
        };
        let mut f = fixture(EcuConfig::new("Victim", 0x555), config);

        assert_eq!(f.controller.run_to_completion().unwrap(), StopReason::RoundLimit);
        assert_eq!(f.controller.round(), 5);
    }

    #[test]
    fn test_cancel_stops_scheduling() {
        let mut f = fixture(EcuConfig::new("Victim", 0x555), ControllerConfig::default());
        step_n(&mut f.controller, 3);

        f.controller.cancel();
        f.controller.cancel();

        assert_eq!(f.controller.step().unwrap(), RoundStatus::Stopped(StopReason::Cancelled));
        assert_eq!(f.victim.tec(), 24);
        assert_eq!(
            f.recorder.count(|e| matches!(e, SimEvent::Terminated { .. })),
            1
        );
    }

    #[test]
    fn test_telemetry_per_node_per_round() {
        let mut f = fixture(EcuConfig::new("Victim", 0x555), ControllerConfig::default());
        step_n(&mut f.controller, 4);

        let samples = f.recorder.telemetry();
        assert_eq!(samples.len(), 8);
        let last = samples.last().unwrap();
        assert_eq!(last.round, 4);
        assert_eq!(last.node_id, "Attacker");
        assert_eq!(last.tec, 32);
    }

    #[test]
    fn test_invalid_payload_rejected() {
        let bus = CanBus::with_defaults();
        let victim = Ecu::attach(EcuConfig::new("Victim", 0x555), BitErrorGate::disabled(), &bus).unwrap();
        let attacker = Ecu::attach(
            EcuConfig::new("Attacker", 0x555).targeting(0x555),
            BitErrorGate::disabled(),
            &bus,
        )
        .unwrap();
        let engagement = Engagement::new(victim, attacker).unwrap();
        let config = ControllerConfig {
            payload: vec![0; 9],
            ..ControllerConfig::default()
        };

        assert!(AttackController::new(bus, engagement, config).is_err());
    }

    #[test]
    fn test_nodes_on_other_bus_rejected() {
        let bus = CanBus::with_defaults();
        let other = CanBus::with_defaults();
        let victim = Ecu::attach(EcuConfig::new("Victim", 0x555), BitErrorGate::disabled(), &other).unwrap();
        let attacker = Ecu::attach(
            EcuConfig::new("Attacker", 0x555).targeting(0x555),
            BitErrorGate::disabled(),
            &other,
        )
        .unwrap();
        let engagement = Engagement::new(victim, attacker).unwrap();

        assert!(AttackController::new(bus, engagement, ControllerConfig::default()).is_err());
    }
}
