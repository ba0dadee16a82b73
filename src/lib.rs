pub mod attack_controller;
pub mod can_bus;
pub mod config;
pub mod ecu;
pub mod error;
pub mod error_gate;
pub mod events;
pub mod fault_confinement;
pub mod frame;
pub mod report;
pub mod scenario;
pub mod scheduler;
pub mod sim_log;
pub mod types;

pub use attack_controller::{
    AttackController, AttackPhase, ControllerConfig, Engagement, RoundStatus, StopReason, Termination,
};
pub use can_bus::{ArbitrationKey, BusConfig, BusHold, BusStats, CanBus};
pub use config::SimConfig;
pub use ecu::{Ecu, EcuConfig};
pub use error::{Result, SimError};
pub use error_gate::BitErrorGate;
pub use events::{BroadcastSink, EventRecorder, EventSink, FanoutSink, NullSink, SimEvent, TelemetrySample};
pub use fault_confinement::FaultConfinement;
pub use frame::{Frame, FrameError, FrameKind};
pub use report::{ConsoleReporter, SimulationReport};
pub use scenario::{plain_arbitration, ArbitrationRun, Scenario, Simulation};
pub use scheduler::{RoundScheduler, SchedulerHandle};
pub use sim_log::{verify_log_file, SimulationLog};
pub use types::{ErrorFlag, ErrorFlagKind, NodeSnapshot, NodeState, RecoveryTrigger, TxOutcome};
