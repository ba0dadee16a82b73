/// Scenario Wiring
///
/// Builds the bus, nodes and attack controller for each experiment the
/// simulator supports.
use crate::attack_controller::{AttackController, Engagement, StopReason};
use crate::can_bus::CanBus;
use crate::config::SimConfig;
use crate::ecu::{Ecu, EcuConfig};
use crate::error::{Result, SimError};
use crate::events::{EventRecorder, EventSink, FanoutSink, SimEvent};
use crate::types::TxOutcome;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;

pub const VICTIM_ID: &str = "Victim";
pub const ATTACKER_ID: &str = "Attacker";
pub const GUARDIAN_ID: &str = "GuardianECU";

/// Nodes of the baseline arbitration run: (name, priority id, payload)
pub const ARBITRATION_NODES: [(&str, u16, &[u8]); 4] = [
    ("ECU1", 0x100, &[0x11, 0x22]),
    ("ECU2", 0x080, &[0x33, 0x44]),
    ("ECU3", 0x200, &[0x55, 0x66, 0x77]),
    ("ECU4", 0x050, &[0xAA]),
];

/// Result of `plain_arbitration`
#[derive(Debug)]
pub struct ArbitrationRun {
    pub bus: Arc<CanBus>,
    pub nodes: Vec<Arc<Ecu>>,
    pub outcomes: Vec<(String, TxOutcome)>,
    /// (sender, frame id) in wire order
    pub delivery_order: Vec<(String, u16)>,
}

/// Four nodes submit at the same instant; the lowest identifier goes first.
pub fn plain_arbitration(config: &SimConfig, sink: Arc<dyn EventSink>) -> Result<ArbitrationRun> {
    config.validate()?;
    let recorder = Arc::new(EventRecorder::new());
    let bus = CanBus::new(config.bus_config(), Arc::new(FanoutSink::new().with(sink).with(recorder.clone())));

    let mut nodes = Vec::with_capacity(ARBITRATION_NODES.len());
    for (index, (name, priority_id, _)) in ARBITRATION_NODES.iter().enumerate() {
        let gate = config.error_gate(index as u64)?;
        nodes.push(Ecu::attach(EcuConfig::new(*name, *priority_id), gate, &bus)?);
    }

    let hold = bus.hold();
    let results: Vec<Result<TxOutcome>> = thread::scope(|s| {
        let handles: Vec<_> = nodes
            .iter()
            .zip(ARBITRATION_NODES.iter())
            .map(|(node, (_, _, payload))| s.spawn(move || node.send(payload.to_vec())))
            .collect();
        hold.release_after(nodes.len() as u64);
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect()
    });

    let mut outcomes = Vec::with_capacity(nodes.len());
    for (node, result) in nodes.iter().zip(results) {
        outcomes.push((node.id().to_string(), result?));
    }

    let delivery_order = recorder
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SimEvent::FrameDelivered { sender, frame_id, .. } => Some((sender, frame_id)),
            _ => None,
        })
        .collect();

    Ok(ArbitrationRun {
        bus,
        nodes,
        outcomes,
        delivery_order,
    })
}

/// Attack experiments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scenario {
    /// Attacker against an undefended victim
    PlainAttack,
    /// Victim runs the consecutive-error countermeasure
    SelfDefense,
    /// Extra node attacks the attacker's preceding frame
    GuardianNode,
}

impl Scenario {
    pub const ALL: [Scenario; 3] = [Scenario::PlainAttack, Scenario::SelfDefense, Scenario::GuardianNode];

    pub fn name(&self) -> &'static str {
        match self {
            Scenario::PlainAttack => "attack",
            Scenario::SelfDefense => "self-defense",
            Scenario::GuardianNode => "guardian",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Scenario::PlainAttack => "bus-off attack against an undefended victim",
            Scenario::SelfDefense => "victim recovers early when it detects a forced bus-off",
            Scenario::GuardianNode => "guardian node drives the attacker bus-off through its preceding frame",
        }
    }

    /// Wire up nodes and controller for this scenario
    pub fn build(&self, config: &SimConfig, sink: Arc<dyn EventSink>) -> Result<Simulation> {
        config.validate()?;
        let bus = CanBus::new(config.bus_config(), sink);
        let contested = config.contested_id;

        let mut victim_config = EcuConfig::new(VICTIM_ID, contested);
        if *self == Scenario::SelfDefense {
            victim_config = victim_config.with_defense();
        }
        let victim = Ecu::attach(victim_config, config.error_gate(0)?, &bus)?;
        let attacker = Ecu::attach(
            EcuConfig::new(ATTACKER_ID, contested).targeting(contested),
            config.error_gate(1)?,
            &bus,
        )?;

        let mut controller_config = config.controller_config();
        let guardian = if *self == Scenario::GuardianNode {
            // Guardian attacks the attacker's preceding frame
            let guardian_id = contested - 1;
            let guardian = Ecu::attach(
                EcuConfig::new(GUARDIAN_ID, guardian_id).targeting(guardian_id),
                config.error_gate(2)?,
                &bus,
            )?;
            controller_config.preceding_frames = true;
            Some(guardian)
        } else {
            None
        };

        let primary = Engagement::new(Arc::clone(&victim), Arc::clone(&attacker))?;
        let mut controller = AttackController::new(Arc::clone(&bus), primary, controller_config)?;
        if let Some(guardian) = &guardian {
            controller.add_engagement(Engagement::new(Arc::clone(&attacker), Arc::clone(guardian))?)?;
        }

        Ok(Simulation {
            scenario: *self,
            bus,
            victim,
            attacker,
            guardian,
            controller,
        })
    }

    /// Build and run to completion without pacing
    pub fn run(&self, config: &SimConfig, sink: Arc<dyn EventSink>) -> Result<Simulation> {
        let mut simulation = self.build(config, sink)?;
        simulation.run()?;
        Ok(simulation)
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Scenario {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "attack" | "plain" | "plain-attack" => Ok(Scenario::PlainAttack),
            "self-defense" | "defense" | "cm1" => Ok(Scenario::SelfDefense),
            "guardian" | "cm2" => Ok(Scenario::GuardianNode),
            other => Err(SimError::InvalidConfig(format!("unknown scenario '{}'", other))),
        }
    }
}

/// A wired-up attack experiment
#[derive(Debug)]
pub struct Simulation {
    pub scenario: Scenario,
    pub bus: Arc<CanBus>,
    pub victim: Arc<Ecu>,
    pub attacker: Arc<Ecu>,
    pub guardian: Option<Arc<Ecu>>,
    pub controller: AttackController,
}

impl Simulation {
    pub fn run(&mut self) -> Result<StopReason> {
        self.controller.run_to_completion()
    }

    /// Hand the controller to a scheduler
    pub fn into_parts(self) -> (AttackController, Arc<CanBus>) {
        (self.controller, self.bus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;

    #[test]
    fn test_scenario_names_round_trip() {
        for scenario in Scenario::ALL {
            assert_eq!(scenario.name().parse::<Scenario>().unwrap(), scenario);
        }
        assert!("nonsense".parse::<Scenario>().is_err());
    }

    #[test]
    fn test_guardian_wiring() {
        let sim = Scenario::GuardianNode
            .build(&SimConfig::deterministic(), Arc::new(NullSink))
            .unwrap();

        let guardian = sim.guardian.as_ref().unwrap();
        assert_eq!(guardian.priority_id(), 0x554);
        assert_eq!(guardian.attack_target(), Some(0x554));
        assert!(guardian.inject_error());
        assert_eq!(sim.controller.engagements().len(), 2);
        assert_eq!(sim.controller.engagements()[1].contested_id(), 0x554);
        assert!(sim.controller.config().preceding_frames);
        assert_eq!(sim.bus.nodes().len(), 3);
    }

    #[test]
    fn test_self_defense_enables_victim_defense() {
        let sim = Scenario::SelfDefense
            .build(&SimConfig::deterministic(), Arc::new(NullSink))
            .unwrap();
        assert!(sim.victim.defense_enabled());
        assert!(!sim.attacker.defense_enabled());
        assert!(sim.guardian.is_none());
    }

    #[test]
    fn test_plain_arbitration_order() {
        let run = plain_arbitration(&SimConfig::deterministic(), Arc::new(NullSink)).unwrap();

        let ids: Vec<u16> = run.delivery_order.iter().map(|(_, id)| *id).collect();
        assert_eq!(ids, vec![0x050, 0x080, 0x100, 0x200]);
        assert!(run.outcomes.iter().all(|(_, o)| *o == TxOutcome::Delivered));
    }
}
