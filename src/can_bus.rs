use crate::ecu::Ecu;
use crate::events::{EventSink, NullSink, SimEvent};
use crate::frame::{Frame, MAX_STANDARD_ID};
use crate::types::{ErrorFlag, NodeSnapshot, NodeState, TxOutcome};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};

/// Ordering key used to pick an arbitration winner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ArbitrationKey {
    /// Lowest frame identifier wins (physical CAN behaviour)
    #[default]
    FrameId,
    /// Lowest static priority id of the sending node wins
    NodePriority,
}

/// Bus configuration. Ties are always broken by enqueue order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    pub arbitration_key: ArbitrationKey,
}

/// Bus counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    /// Completed wire rounds (single transmissions and collisions)
    pub logical_time: u64,
    pub frames_delivered: u64,
    pub collisions: u64,
    pub bit_errors: u64,
    pub rejected_sends: u64,
    /// Highest number of simultaneous delivery fan-outs ever observed
    pub max_concurrent_deliveries: usize,
}

struct PendingTx {
    seq: u64,
    frame: Frame,
    node: Arc<Ecu>,
}

/// Collision member with the state it had when arbitration ran
struct Contender {
    tx: PendingTx,
    state: NodeState,
    injects: bool,
}

enum WireRound {
    Single(PendingTx),
    Collision(Vec<Contender>),
}

struct WireState {
    pending: VecDeque<PendingTx>,
    idle: bool,
    next_seq: u64,
    /// Every send call, queued or rejected. `BusHold` waits on this.
    submissions: u64,
    completed: HashMap<u64, TxOutcome>,
    logical_time: u64,
}

/// Last node that completed a frame, per identifier.
///
/// One slot per 11-bit id, allocated once.
struct RecentSenders {
    slots: Vec<Option<String>>,
}

impl RecentSenders {
    fn new() -> Self {
        Self {
            slots: vec![None; MAX_STANDARD_ID as usize + 1],
        }
    }

    fn record(&mut self, frame_id: u16, node_id: &str) {
        if let Some(slot) = self.slots.get_mut(frame_id as usize) {
            *slot = Some(node_id.to_string());
        }
    }

    fn get(&self, frame_id: u16) -> Option<String> {
        self.slots.get(frame_id as usize).cloned().flatten()
    }
}

/// Shared transmission medium.
///
/// `send` blocks the caller until its frame has been through arbitration.
/// Whichever blocked sender finds the wire idle runs arbitration rounds
/// until the queue is empty; every other sender sleeps on the condition
/// variable and re-checks for its own result on wake-up.
pub struct CanBus {
    config: BusConfig,
    nodes: RwLock<Vec<Arc<Ecu>>>,
    wire: Mutex<WireState>,
    wire_changed: Condvar,
    recent_senders: Mutex<RecentSenders>,
    sink: Arc<dyn EventSink>,
    active_deliveries: AtomicUsize,
    max_concurrent_deliveries: AtomicUsize,
    frames_delivered: AtomicU64,
    collisions: AtomicU64,
    bit_errors: AtomicU64,
    rejected_sends: AtomicU64,
}

impl CanBus {
    pub fn new(config: BusConfig, sink: Arc<dyn EventSink>) -> Arc<Self> {
        Arc::new(Self {
            config,
            nodes: RwLock::new(Vec::new()),
            wire: Mutex::new(WireState {
                pending: VecDeque::new(),
                idle: true,
                next_seq: 0,
                submissions: 0,
                completed: HashMap::new(),
                logical_time: 0,
            }),
            wire_changed: Condvar::new(),
            recent_senders: Mutex::new(RecentSenders::new()),
            sink,
            active_deliveries: AtomicUsize::new(0),
            max_concurrent_deliveries: AtomicUsize::new(0),
            frames_delivered: AtomicU64::new(0),
            collisions: AtomicU64::new(0),
            bit_errors: AtomicU64::new(0),
            rejected_sends: AtomicU64::new(0),
        })
    }

    /// Frame-id arbitration, events discarded
    pub fn with_defaults() -> Arc<Self> {
        Self::new(BusConfig::default(), Arc::new(NullSink))
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn sink(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.sink)
    }

    /// Add a node to the delivery set. Registering the same node twice is
    /// a no-op; returns whether the node was added.
    pub fn register(&self, node: Arc<Ecu>) -> bool {
        {
            let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
            if nodes.iter().any(|n| Arc::ptr_eq(n, &node)) {
                return false;
            }
            nodes.push(Arc::clone(&node));
        }

        self.sink.emit(SimEvent::NodeRegistered {
            node_id: node.id().to_string(),
            priority_id: node.priority_id(),
            defense_enabled: node.defense_enabled(),
        });
        true
    }

    /// Registered nodes in registration order
    pub fn nodes(&self) -> Vec<Arc<Ecu>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn snapshots(&self) -> Vec<NodeSnapshot> {
        self.nodes().iter().map(|n| n.snapshot()).collect()
    }

    /// Queue `frame` for arbitration and block until it has been on the wire.
    ///
    /// A bus-off sender is rejected without queuing anything.
    pub fn send(&self, frame: Frame, node: &Arc<Ecu>) -> TxOutcome {
        let mut wire = self.lock_wire();
        wire.submissions += 1;

        if node.is_bus_off() {
            self.wire_changed.notify_all();
            drop(wire);
            self.reject(node.id(), frame.id());
            return TxOutcome::Rejected;
        }

        let seq = wire.next_seq;
        wire.next_seq += 1;
        wire.pending.push_back(PendingTx {
            seq,
            frame,
            node: Arc::clone(node),
        });
        self.wire_changed.notify_all();

        loop {
            if let Some(outcome) = wire.completed.remove(&seq) {
                return outcome;
            }
            if wire.idle && !wire.pending.is_empty() {
                wire = self.run_arbitration(wire);
                continue;
            }
            wire = self
                .wire_changed
                .wait(wire)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Broadcast an error flag raised by `from` to every other node
    pub fn send_error_flag(&self, flag: ErrorFlag, from: &Ecu) {
        for node in self.nodes().iter().filter(|n| !std::ptr::eq(Arc::as_ptr(n), from)) {
            node.on_error_detected(flag);
        }
    }

    /// Node that last completed a frame with this identifier
    pub fn recent_sender(&self, frame_id: u16) -> Option<String> {
        self.recent_senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(frame_id)
    }

    /// Occupy the wire so that concurrent sends queue up and contend in a
    /// single arbitration once the hold is released.
    pub fn hold(&self) -> BusHold<'_> {
        let mut wire = self.lock_wire();
        while !wire.idle {
            wire = self
                .wire_changed
                .wait(wire)
                .unwrap_or_else(PoisonError::into_inner);
        }
        wire.idle = false;

        BusHold {
            bus: self,
            base: wire.submissions,
            released: false,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.lock_wire().idle
    }

    pub fn pending_len(&self) -> usize {
        self.lock_wire().pending.len()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            logical_time: self.lock_wire().logical_time,
            frames_delivered: self.frames_delivered.load(Ordering::SeqCst),
            collisions: self.collisions.load(Ordering::SeqCst),
            bit_errors: self.bit_errors.load(Ordering::SeqCst),
            rejected_sends: self.rejected_sends.load(Ordering::SeqCst),
            max_concurrent_deliveries: self.max_concurrent_deliveries.load(Ordering::SeqCst),
        }
    }

    fn lock_wire(&self) -> MutexGuard<'_, WireState> {
        self.wire.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drain the queue one wire round at a time. Selection happens under
    /// the wire lock; delivery happens outside it with `idle == false`.
    fn run_arbitration<'a>(&'a self, mut wire: MutexGuard<'a, WireState>) -> MutexGuard<'a, WireState> {
        loop {
            let stale = Self::take_bus_off_entries(&mut wire);
            let round = self.select_round(&mut wire);
            if stale.is_empty() && round.is_none() {
                wire.idle = true;
                return wire;
            }

            wire.idle = false;
            let logical_time = wire.logical_time;
            drop(wire);

            for tx in &stale {
                self.reject(tx.node.id(), tx.frame.id());
            }
            let outcomes = round.map(|round| self.transmit(round, logical_time));

            wire = self.lock_wire();
            for tx in stale {
                wire.completed.insert(tx.seq, TxOutcome::Rejected);
            }
            if let Some(outcomes) = outcomes {
                wire.logical_time += 1;
                for (seq, outcome) in outcomes {
                    let previous = wire.completed.insert(seq, outcome);
                    assert!(previous.is_none(), "frame #{} selected twice", seq);
                }
            }
            wire.idle = true;
            self.wire_changed.notify_all();
        }
    }

    /// Queued frames whose sender went bus-off earlier in the same drain
    fn take_bus_off_entries(wire: &mut WireState) -> Vec<PendingTx> {
        let mut stale = Vec::new();
        let mut idx = 0;
        while idx < wire.pending.len() {
            if wire.pending[idx].node.is_bus_off() {
                if let Some(tx) = wire.pending.remove(idx) {
                    stale.push(tx);
                }
            } else {
                idx += 1;
            }
        }
        stale
    }

    fn reject(&self, node_id: &str, frame_id: u16) {
        self.rejected_sends.fetch_add(1, Ordering::SeqCst);
        self.sink.emit(SimEvent::SendRejected {
            node_id: node_id.to_string(),
            frame_id,
        });
    }

    fn arbitration_key(&self, tx: &PendingTx) -> u16 {
        match self.config.arbitration_key {
            ArbitrationKey::FrameId => tx.frame.id(),
            ArbitrationKey::NodePriority => tx.node.priority_id(),
        }
    }

    /// Pick the next wire round: the lowest key wins, FIFO among equals.
    /// If another node queued the winning identifier and some participant
    /// has injection armed for it, all same-id entries go out together.
    fn select_round(&self, wire: &mut WireState) -> Option<WireRound> {
        let winner_idx = wire
            .pending
            .iter()
            .enumerate()
            .min_by_key(|(_, tx)| (self.arbitration_key(tx), tx.seq))
            .map(|(idx, _)| idx)?;
        let winner = wire.pending.remove(winner_idx)?;
        let contested = winner.frame.id();

        let mut members: Vec<&Arc<Ecu>> = vec![&winner.node];
        let mut same_id = Vec::new();
        for (idx, tx) in wire.pending.iter().enumerate() {
            if tx.frame.id() == contested && !members.iter().any(|m| Arc::ptr_eq(m, &tx.node)) {
                members.push(&tx.node);
                same_id.push(idx);
            }
        }

        let armed = members.iter().any(|m| m.injects_on(contested));
        if same_id.is_empty() || !armed {
            return Some(WireRound::Single(winner));
        }

        let mut group = vec![winner];
        for idx in same_id.into_iter().rev() {
            if let Some(tx) = wire.pending.remove(idx) {
                group.push(tx);
            }
        }

        let order = self.nodes();
        group.sort_by_key(|tx| order.iter().position(|n| Arc::ptr_eq(n, &tx.node)).unwrap_or(usize::MAX));

        let contenders = group
            .into_iter()
            .map(|tx| Contender {
                state: tx.node.state(),
                injects: tx.node.injects_on(contested),
                tx,
            })
            .collect();
        Some(WireRound::Collision(contenders))
    }

    fn transmit(&self, round: WireRound, logical_time: u64) -> Vec<(u64, TxOutcome)> {
        let in_flight = self.active_deliveries.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_deliveries.fetch_max(in_flight, Ordering::SeqCst);
        assert_eq!(in_flight, 1, "two frames on the wire at once");

        let outcomes = match round {
            WireRound::Single(tx) => vec![self.transmit_single(tx, logical_time)],
            WireRound::Collision(contenders) => self.transmit_collision(contenders, logical_time),
        };

        self.active_deliveries.fetch_sub(1, Ordering::SeqCst);
        outcomes
    }

    fn transmit_single(&self, tx: PendingTx, logical_time: u64) -> (u64, TxOutcome) {
        if tx.node.transmit_gate_trips() {
            self.bit_errors.fetch_add(1, Ordering::SeqCst);
            tx.node.report_bit_error(tx.frame.id());
            return (tx.seq, TxOutcome::BitError);
        }

        let receivers = self.deliver(&tx.frame, &[&tx.node]);
        self.complete(&tx, receivers, logical_time);
        (tx.seq, TxOutcome::Delivered)
    }

    /// Injected dominant bits corrupt every non-injecting contender. An
    /// injector survives only if no corrupted contender is error-active,
    /// since an active (dominant) error flag destroys the frame on the wire.
    fn transmit_collision(&self, contenders: Vec<Contender>, logical_time: u64) -> Vec<(u64, TxOutcome)> {
        self.collisions.fetch_add(1, Ordering::SeqCst);
        let frame_id = contenders[0].tx.frame.id();
        let active_victim = contenders
            .iter()
            .any(|c| !c.injects && c.state == NodeState::ErrorActive);

        let survivor = contenders
            .iter()
            .find(|c| c.injects && !active_victim)
            .map(|c| c.tx.node.id().to_string());
        self.sink.emit(SimEvent::Collision {
            logical_time,
            frame_id,
            contenders: contenders.iter().map(|c| c.tx.node.id().to_string()).collect(),
            survivor,
        });

        let mut outcomes = Vec::with_capacity(contenders.len());
        let mut survivors = Vec::new();
        for contender in contenders.iter().filter(|c| !c.injects) {
            self.bit_errors.fetch_add(1, Ordering::SeqCst);
            contender.tx.node.report_bit_error(frame_id);
            outcomes.push((contender.tx.seq, TxOutcome::BitError));
        }
        for contender in contenders.iter().filter(|c| c.injects) {
            if active_victim {
                self.bit_errors.fetch_add(1, Ordering::SeqCst);
                contender.tx.node.report_bit_error(frame_id);
                outcomes.push((contender.tx.seq, TxOutcome::BitError));
            } else {
                survivors.push(contender);
            }
        }

        if let Some(first) = survivors.first() {
            let group: Vec<&Arc<Ecu>> = contenders.iter().map(|c| &c.tx.node).collect();
            let receivers = self.deliver(&first.tx.frame, &group);
            self.complete(&first.tx, receivers, logical_time);
            outcomes.push((first.tx.seq, TxOutcome::Delivered));

            // Identical injected frames ride along with the first one
            for other in &survivors[1..] {
                other.tx.node.handle_tx_success();
                outcomes.push((other.tx.seq, TxOutcome::Delivered));
            }
        }

        outcomes
    }

    /// Hand `frame` to every registered node not in `exclude`, in
    /// registration order. Returns how many nodes accepted it.
    fn deliver(&self, frame: &Frame, exclude: &[&Arc<Ecu>]) -> usize {
        self.nodes()
            .iter()
            .filter(|n| !exclude.iter().any(|e| Arc::ptr_eq(n, e)))
            .filter(|n| n.receive(frame))
            .count()
    }

    fn complete(&self, tx: &PendingTx, receivers: usize, logical_time: u64) {
        self.recent_senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(tx.frame.id(), tx.node.id());
        self.frames_delivered.fetch_add(1, Ordering::SeqCst);
        tx.node.handle_tx_success();

        self.sink.emit(SimEvent::FrameDelivered {
            logical_time,
            frame_id: tx.frame.id(),
            sender: tx.node.id().to_string(),
            receivers,
        });
    }
}

impl fmt::Debug for CanBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nodes: Vec<String> = self.nodes().iter().map(|n| n.id().to_string()).collect();
        f.debug_struct("CanBus")
            .field("config", &self.config)
            .field("nodes", &nodes)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Wire occupied by the holder (the logical "frame already in progress").
///
/// Dropping the hold frees the wire as well.
pub struct BusHold<'a> {
    bus: &'a CanBus,
    base: u64,
    released: bool,
}

impl BusHold<'_> {
    /// Block until `count` send calls arrived since the hold was taken
    pub fn wait_for_submissions(&self, count: u64) {
        let mut wire = self.bus.lock_wire();
        while wire.submissions < self.base + count {
            wire = self
                .bus
                .wire_changed
                .wait(wire)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn release(mut self) {
        self.release_wire();
    }

    pub fn release_after(self, count: u64) {
        self.wait_for_submissions(count);
        self.release();
    }

    fn release_wire(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut wire = self.bus.lock_wire();
        wire.idle = true;
        self.bus.wire_changed.notify_all();
    }
}

impl Drop for BusHold<'_> {
    fn drop(&mut self) {
        self.release_wire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecu::EcuConfig;
    use crate::error_gate::BitErrorGate;
    use crate::events::EventRecorder;
    use std::thread;

    fn attach(bus: &Arc<CanBus>, id: &str, priority_id: u16) -> Arc<Ecu> {
        Ecu::attach(EcuConfig::new(id, priority_id), BitErrorGate::disabled(), bus).unwrap()
    }

    fn delivered_ids(recorder: &EventRecorder) -> Vec<u16> {
        recorder
            .events()
            .iter()
            .filter_map(|e| match e {
                SimEvent::FrameDelivered { frame_id, .. } => Some(*frame_id),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_single_send_delivers_to_others() {
        let recorder = Arc::new(EventRecorder::new());
        let bus = CanBus::new(BusConfig::default(), recorder.clone());
        let a = attach(&bus, "A", 0x100);
        let b = attach(&bus, "B", 0x200);
        let c = attach(&bus, "C", 0x300);

        let outcome = a.send(vec![0x11]).unwrap();

        assert_eq!(outcome, TxOutcome::Delivered);
        assert_eq!(bus.recent_sender(0x100), Some("A".to_string()));
        assert_eq!(bus.stats().frames_delivered, 1);
        assert!(bus.is_idle());
        assert_eq!(b.rec(), 0);
        assert_eq!(c.rec(), 0);
        assert!(recorder.events().contains(&SimEvent::FrameDelivered {
            logical_time: 0,
            frame_id: 0x100,
            sender: "A".to_string(),
            receivers: 2,
        }));
    }

    #[test]
    fn test_register_is_idempotent() {
        let bus = CanBus::with_defaults();
        let a = attach(&bus, "A", 0x100);

        assert!(!bus.register(a.clone()));
        assert_eq!(bus.nodes().len(), 1);
    }

    #[test]
    fn test_held_sends_arbitrate_by_lowest_id() {
        let recorder = Arc::new(EventRecorder::new());
        let bus = CanBus::new(BusConfig::default(), recorder.clone());
        let nodes = vec![
            attach(&bus, "ECU1", 0x100),
            attach(&bus, "ECU2", 0x080),
            attach(&bus, "ECU3", 0x200),
            attach(&bus, "ECU4", 0x050),
        ];

        let hold = bus.hold();
        thread::scope(|s| {
            for node in &nodes {
                s.spawn(move || node.send(vec![0xAA]).unwrap());
            }
            hold.release_after(nodes.len() as u64);
        });

        assert_eq!(delivered_ids(&recorder), vec![0x050, 0x080, 0x100, 0x200]);
        assert_eq!(bus.stats().max_concurrent_deliveries, 1);
        assert_eq!(bus.pending_len(), 0);
    }

    #[test]
    fn test_node_priority_key() {
        let recorder = Arc::new(EventRecorder::new());
        let config = BusConfig {
            arbitration_key: ArbitrationKey::NodePriority,
        };
        let bus = CanBus::new(config, recorder.clone());
        let low = attach(&bus, "LOW", 0x011);
        let high = attach(&bus, "HIGH", 0x010);

        // Both put 0x010 on the wire; LOW queues first but HIGH has the
        // better node priority.
        let hold = bus.hold();
        thread::scope(|s| {
            let (low, high) = (&low, &high);
            s.spawn(move || low.send_preceding(vec![]).unwrap());
            hold.wait_for_submissions(1);
            s.spawn(move || high.send(vec![]).unwrap());
            hold.release_after(2);
        });

        let senders: Vec<String> = recorder
            .events()
            .into_iter()
            .filter_map(|e| match e {
                SimEvent::FrameDelivered { sender, .. } => Some(sender),
                _ => None,
            })
            .collect();
        assert_eq!(senders, vec!["HIGH".to_string(), "LOW".to_string()]);
        assert_eq!(delivered_ids(&recorder), vec![0x010, 0x010]);
    }

    #[test]
    fn test_same_id_without_injection_is_serialized() {
        let recorder = Arc::new(EventRecorder::new());
        let bus = CanBus::new(BusConfig::default(), recorder.clone());
        let a = attach(&bus, "A", 0x555);
        let b = attach(&bus, "B", 0x555);

        let hold = bus.hold();
        thread::scope(|s| {
            let (a, b) = (&a, &b);
            s.spawn(move || assert_eq!(a.send(vec![1]).unwrap(), TxOutcome::Delivered));
            s.spawn(move || assert_eq!(b.send(vec![1]).unwrap(), TxOutcome::Delivered));
            hold.release_after(2);
        });

        assert_eq!(bus.stats().collisions, 0);
        assert_eq!(bus.stats().frames_delivered, 2);
    }

    #[test]
    fn test_collision_against_active_victim_destroys_both() {
        let bus = CanBus::with_defaults();
        let victim = attach(&bus, "Victim", 0x555);
        let attacker = Ecu::attach(
            EcuConfig::new("Attacker", 0x555).targeting(0x555),
            BitErrorGate::disabled(),
            &bus,
        )
        .unwrap();
        attacker.set_inject_error(true);

        let hold = bus.hold();
        thread::scope(|s| {
            let (v, a) = (&victim, &attacker);
            s.spawn(move || assert_eq!(v.send(vec![0xCA]).unwrap(), TxOutcome::BitError));
            s.spawn(move || assert_eq!(a.send(vec![0xCA]).unwrap(), TxOutcome::BitError));
            hold.release_after(2);
        });

        assert_eq!(victim.tec(), 8);
        assert_eq!(attacker.tec(), 8);
        // Each saw the other's flag
        assert_eq!(victim.rec(), 1);
        assert_eq!(attacker.rec(), 1);
        assert_eq!(bus.stats().collisions, 1);
        assert_eq!(bus.recent_sender(0x555), None);
    }

    #[test]
    fn test_bus_off_sender_is_rejected() {
        let recorder = Arc::new(EventRecorder::new());
        let bus = CanBus::new(BusConfig::default(), recorder.clone());
        let node = attach(&bus, "A", 0x100);
        for _ in 0..32 {
            node.send_error_flag();
        }
        assert!(node.is_bus_off());

        assert_eq!(node.send(vec![1]).unwrap(), TxOutcome::Rejected);
        assert_eq!(bus.stats().rejected_sends, 1);
        assert_eq!(bus.pending_len(), 0);
        assert_eq!(
            recorder.count(|e| matches!(e, SimEvent::SendRejected { .. })),
            1
        );
    }

    #[test]
    fn test_frame_queued_before_bus_off_never_transmits() {
        let recorder = Arc::new(EventRecorder::new());
        let bus = CanBus::new(BusConfig::default(), recorder.clone());
        let gate = BitErrorGate::new(1.0, Some(7)).unwrap();
        let node = Ecu::attach(EcuConfig::new("A", 0x100), gate, &bus).unwrap();
        let _listener = attach(&bus, "B", 0x200);
        for _ in 0..31 {
            node.send_error_flag();
        }
        assert_eq!(node.tec(), 248);

        let hold = bus.hold();
        let (preceding, data) = thread::scope(|s| {
            let preceding = s.spawn(|| node.send_preceding(vec![0xAA]).unwrap());
            let data = s.spawn(|| node.send(vec![0x01]).unwrap());
            hold.release_after(2);
            (preceding.join().unwrap(), data.join().unwrap())
        });

        // 0x0FF goes first and its bit error takes the node bus-off
        assert_eq!(preceding, TxOutcome::BitError);
        assert_eq!(data, TxOutcome::Rejected);
        assert!(node.is_bus_off());
        let stats = bus.stats();
        assert_eq!(stats.bit_errors, 1);
        assert_eq!(stats.rejected_sends, 1);
        assert_eq!(stats.frames_delivered, 0);
        assert!(delivered_ids(&recorder).is_empty());
    }

    #[test]
    fn test_error_flag_reaches_every_other_node() {
        let bus = CanBus::with_defaults();
        let a = attach(&bus, "A", 0x100);
        let b = attach(&bus, "B", 0x200);
        let c = attach(&bus, "C", 0x300);

        a.send_error_flag();

        assert_eq!(a.tec(), 8);
        assert_eq!(a.rec(), 0);
        assert_eq!(b.rec(), 1);
        assert_eq!(c.rec(), 1);
    }

    #[test]
    fn test_many_concurrent_senders_never_overlap() {
        let bus = CanBus::with_defaults();
        let nodes: Vec<_> = (0..8u16)
            .map(|i| attach(&bus, &format!("N{}", i), 0x100 + i))
            .collect();

        thread::scope(|s| {
            for node in &nodes {
                s.spawn(move || {
                    for _ in 0..25 {
                        assert_eq!(node.send(vec![0x01]).unwrap(), TxOutcome::Delivered);
                    }
                });
            }
        });

        let stats = bus.stats();
        assert_eq!(stats.frames_delivered, 200);
        assert_eq!(stats.logical_time, 200);
        assert_eq!(stats.max_concurrent_deliveries, 1);
    }

    #[test]
    fn test_recent_senders_bounded_by_id_space() {
        let senders = RecentSenders::new();
        assert_eq!(senders.slots.len(), 0x800);
        assert_eq!(senders.get(0x7FF), None);
    }
}
