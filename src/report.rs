/// Simulation Reporting
///
/// Aggregates a finished run into a `SimulationReport` and renders it as
/// text. `ConsoleReporter` prints events live for the command-line tool.
use crate::attack_controller::{AttackController, AttackPhase, StopReason};
use crate::can_bus::BusStats;
use crate::events::{EventRecorder, EventSink, SimEvent};
use crate::types::{NodeSnapshot, NodeState, RecoveryTrigger};
use chrono::{DateTime, Utc};
use colored::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Summary of one attack run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationReport {
    pub scenario: String,
    pub generated_at: DateTime<Utc>,
    /// SHA-256 of the configuration used, if known
    pub config_fingerprint: Option<String>,
    pub rounds: u64,
    pub stop_reason: Option<StopReason>,
    pub final_phase: AttackPhase,
    pub nodes: Vec<NodeSnapshot>,
    pub bus: BusStats,
    pub error_flags: usize,
    pub state_changes: usize,
    pub phase_changes: usize,
    pub attacks_detected: usize,
    pub countermeasure_recoveries: usize,
    pub attacker_cooldowns: usize,
    /// Highest TEC seen in telemetry, per node
    pub peak_tec: BTreeMap<String, u32>,
}

impl SimulationReport {
    pub fn from_run(scenario: &str, controller: &AttackController, recorder: &EventRecorder) -> Self {
        let events = recorder.events();
        let count = |pred: fn(&SimEvent) -> bool| events.iter().filter(|e| pred(e)).count();

        let mut peak_tec = BTreeMap::new();
        for sample in recorder.telemetry() {
            let peak = peak_tec.entry(sample.node_id).or_insert(0);
            *peak = sample.tec.max(*peak);
        }

        Self {
            scenario: scenario.to_string(),
            generated_at: Utc::now(),
            config_fingerprint: None,
            rounds: controller.round(),
            stop_reason: controller.stop_reason(),
            final_phase: controller.phase(),
            nodes: controller.bus().snapshots(),
            bus: controller.bus().stats(),
            error_flags: count(|e| matches!(e, SimEvent::ErrorFlagRaised { .. })),
            state_changes: count(|e| matches!(e, SimEvent::StateChanged { .. })),
            phase_changes: count(|e| matches!(e, SimEvent::PhaseChanged { .. })),
            attacks_detected: count(|e| matches!(e, SimEvent::AttackDetected { .. })),
            countermeasure_recoveries: count(|e| {
                matches!(
                    e,
                    SimEvent::Recovered {
                        trigger: RecoveryTrigger::Countermeasure,
                        ..
                    }
                )
            }),
            attacker_cooldowns: count(|e| matches!(e, SimEvent::InjectionPaused { .. })),
            peak_tec,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: String) -> Self {
        self.config_fingerprint = Some(fingerprint);
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn generate_report(&self) -> String {
        let mut report = String::new();

        report.push('\n');
        report.push_str("╔══════════════════════════════════════════════════════════════╗\n");
        report.push_str("║                BUS-OFF ATTACK SIMULATION REPORT              ║\n");
        report.push_str("╚══════════════════════════════════════════════════════════════╝\n");
        report.push('\n');

        report.push_str("RUN\n");
        report.push_str("---\n");
        report.push_str(&format!("Scenario:                  {}\n", self.scenario));
        report.push_str(&format!(
            "Generated:                 {}\n",
            self.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        if let Some(fingerprint) = &self.config_fingerprint {
            report.push_str(&format!("Config fingerprint:        {}\n", &fingerprint[..16.min(fingerprint.len())]));
        }
        report.push_str(&format!("Rounds:                    {}\n", self.rounds));
        report.push_str(&format!("Final phase:               {}\n", self.final_phase));
        match self.stop_reason {
            Some(reason) => report.push_str(&format!("Outcome:                   {}\n", reason)),
            None => report.push_str("Outcome:                   still running\n"),
        }
        report.push('\n');

        report.push_str("BUS\n");
        report.push_str("---\n");
        report.push_str(&format!("Wire rounds:               {}\n", self.bus.logical_time));
        report.push_str(&format!("Frames delivered:          {}\n", self.bus.frames_delivered));
        report.push_str(&format!("Collisions:                {}\n", self.bus.collisions));
        report.push_str(&format!("Bit errors:                {}\n", self.bus.bit_errors));
        report.push_str(&format!("Rejected sends:            {}\n", self.bus.rejected_sends));
        report.push_str(&format!(
            "Max concurrent deliveries: {}\n",
            self.bus.max_concurrent_deliveries
        ));
        report.push('\n');

        report.push_str("FAULT CONFINEMENT\n");
        report.push_str("-----------------\n");
        report.push_str(&format!("Error flags raised:        {}\n", self.error_flags));
        report.push_str(&format!("State changes:             {}\n", self.state_changes));
        report.push_str(&format!("Phase changes:             {}\n", self.phase_changes));
        report.push_str(&format!("Attacks detected:          {}\n", self.attacks_detected));
        report.push_str(&format!(
            "Countermeasure recoveries: {}\n",
            self.countermeasure_recoveries
        ));
        report.push_str(&format!("Attacker cooldowns:        {}\n", self.attacker_cooldowns));
        report.push('\n');

        report.push_str("NODES\n");
        report.push_str("-----\n");
        for node in &self.nodes {
            let peak = self.peak_tec.get(&node.node_id).copied().unwrap_or(node.tec);
            report.push_str(&format!(
                "  {:14} id 0x{:03X}  TEC {:>3} (peak {:>3})  REC {:>3}  {}\n",
                node.node_id, node.priority_id, node.tec, peak, node.rec, node.state
            ));
        }
        report.push('\n');
        report.push_str("══════════════════════════════════════════════════════════════\n");

        report
    }
}

fn paint_state(state: NodeState) -> ColoredString {
    match state {
        NodeState::ErrorActive => state.as_str().green(),
        NodeState::ErrorPassive => state.as_str().yellow(),
        NodeState::BusOff => state.as_str().red().bold(),
    }
}

/// Prints events to stdout as they happen.
///
/// Per-frame and telemetry lines are only shown in verbose mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleReporter {
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    /// Rendered line for `event`, or None if it is not shown
    pub fn render(&self, event: &SimEvent) -> Option<String> {
        let line = match event {
            SimEvent::NodeRegistered {
                node_id,
                priority_id,
                defense_enabled,
            } => format!(
                "{} {} joined the bus (id 0x{:03X}{})",
                "→".green(),
                node_id.bright_cyan(),
                priority_id,
                if *defense_enabled { ", defense on" } else { "" }
            ),
            SimEvent::FrameDelivered {
                logical_time,
                frame_id,
                sender,
                receivers,
            } if self.verbose => format!(
                "{} t={:<5} {} sent {} to {} node(s)",
                "BUS:".cyan().bold(),
                logical_time,
                sender,
                format!("0x{:03X}", frame_id).yellow(),
                receivers
            ),
            SimEvent::Collision {
                logical_time,
                frame_id,
                contenders,
                survivor,
            } if self.verbose => format!(
                "{} t={:<5} {} on {} ({})",
                "BUS:".cyan().bold(),
                logical_time,
                "collision".red(),
                format!("0x{:03X}", frame_id).yellow(),
                match survivor {
                    Some(winner) => format!("{} survives", winner),
                    None => format!("{} destroyed", contenders.join(" + ")),
                }
            ),
            SimEvent::SendRejected { node_id, frame_id } if self.verbose => format!(
                "{} {} is bus-off, 0x{:03X} not sent",
                "✗".red(),
                node_id,
                frame_id
            ),
            SimEvent::StateChanged {
                node_id,
                from,
                to,
                tec,
                rec,
            } => format!(
                "{} {} {} → {} (TEC {}, REC {})",
                "STATE:".magenta().bold(),
                node_id.bright_cyan(),
                paint_state(*from),
                paint_state(*to),
                tec,
                rec
            ),
            SimEvent::AttackDetected {
                node_id,
                frame_id,
                suspected_sender,
                consecutive_errors,
            } => format!(
                "{} {} detected a bus-off attack on 0x{:03X} ({} consecutive errors, last sender {})",
                "⚠".red().bold(),
                node_id.bright_cyan(),
                frame_id,
                consecutive_errors,
                suspected_sender.red()
            ),
            SimEvent::Recovered { node_id, trigger } => format!(
                "{} {} recovered ({:?})",
                "✓".green().bold(),
                node_id.bright_cyan(),
                trigger
            ),
            SimEvent::PhaseChanged {
                round,
                attacker,
                from,
                to,
                ..
            } => format!(
                "{} round {}: {} {} → {}",
                "ATTACK:".red().bold(),
                round,
                attacker,
                from,
                to.to_string().bold()
            ),
            SimEvent::InjectionPaused {
                round,
                attacker,
                rounds,
                ..
            } => format!(
                "{} round {}: {} holds off for {} round(s) after victim reset",
                "ATTACK:".red().bold(),
                round,
                attacker,
                rounds
            ),
            SimEvent::InjectionResumed { round, attacker, .. } => format!(
                "{} round {}: {} resumes injection",
                "ATTACK:".red().bold(),
                round,
                attacker
            ),
            SimEvent::Telemetry(sample) if self.verbose => format!(
                "[Round {:>4}] {:14} TEC: {:>3} | REC: {:>3} | {}",
                sample.round,
                sample.node_id,
                sample.tec,
                sample.rec,
                paint_state(sample.state)
            ),
            SimEvent::Terminated { round, reason } => format!(
                "{} simulation stopped after {} rounds: {}",
                "■".yellow().bold(),
                round,
                reason.to_string().bold()
            ),
            _ => return None,
        };
        Some(line)
    }
}

impl EventSink for ConsoleReporter {
    fn emit(&self, event: SimEvent) {
        if let Some(line) = self.render(&event) {
            println!("{}", line);
        }
    }
}
