//! Simulation Engine
//!
//! Owns the node array, the overlay and the worker pool, and drives the tick
//! loop:
//!
//! 1. hand the feeder a tick slot and dispatch its tasks to the pool as they
//!    arrive (entry node picked by the placement policy)
//! 2. wait for every task of the tick (phase barrier)
//! 3. replay every periodic family that came due, one barrier per iteration
//! 4. check node invariants and report node state to the metrics sink
//! 5. advance the clock; persist the metrics window every K ticks, and once
//!    more after the last tick if a partial window is left
//!
//! The node array and overlay are read-only once initialized. The only shared
//! mutable state is each node's discovery lock, the master's view table and
//! the deployment ledger; no code path holds two of them at once.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use crate::sd_config::{PeriodicConfig, Placement, SimulationConfig};
use crate::sd_discovery::{ClusterNodeView, Offer, RemoteClient, SwarmDiscovery};
use crate::sd_error::{Result, SimError};
use crate::sd_feeder::{Feeder, FeederContext, RequestTask, TaskKind, TickSlot};
use crate::sd_interface::{Guid, NodeAddress, NodeIndex, RequestId, SimTime};
use crate::sd_metrics::{MetricsSink, NodeState};
use crate::sd_overlay::RingOverlay;
use crate::sd_pool::WorkerPool;
use crate::sd_resources::Resources;

// ============================================================================
// Clock
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimClock {
    now: SimTime,
    step: SimTime,
    ticks: u64,
}

impl SimClock {
    pub fn new(step: SimTime) -> Self {
        Self {
            now: 0,
            step,
            ticks: 0,
        }
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn advance(&mut self) {
        self.now += self.step;
        self.ticks += 1;
    }
}

// ============================================================================
// Nodes and Cluster
// ============================================================================

pub struct SimNode {
    pub index: NodeIndex,
    pub guid: Guid,
    pub address: NodeAddress,
    pub discovery: SwarmDiscovery,
    messages: AtomicU64,
}

impl SimNode {
    pub fn messages_received(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    fn receive(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    fn state(&self) -> NodeState {
        let snapshot = self.discovery.snapshot();
        let views = self.discovery.known_peers() * std::mem::size_of::<ClusterNodeView>();
        NodeState {
            maximum: snapshot.maximum,
            free: snapshot.free,
            used: snapshot.used,
            running: snapshot.running,
            messages: self.messages_received(),
            memory_bytes: (std::mem::size_of::<SimNode>() + views) as u64,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Deployment {
    node: NodeIndex,
    resources: Resources,
}

/// Ledger entry; an id is reserved before placement starts
#[derive(Debug, Clone, Copy)]
enum LedgerSlot {
    Placing,
    Placed(Deployment),
}

#[derive(Default)]
struct ClusterCounters {
    tasks_executed: AtomicU64,
    requests_submitted: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    stops_applied: AtomicU64,
    messages: AtomicU64,
}

/// Node array plus overlay; doubles as the remote-client mock that delivers
/// messages between nodes.
pub struct Cluster {
    overlay: RingOverlay,
    nodes: Vec<SimNode>,
    master_guid: Guid,
    metrics: Arc<dyn MetricsSink>,
    /// request -> where it runs; locked only between node operations
    deployments: Mutex<HashMap<RequestId, LedgerSlot>>,
    counters: ClusterCounters,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn overlay(&self) -> &RingOverlay {
        &self.overlay
    }

    pub fn node(&self, index: NodeIndex) -> Option<&SimNode> {
        self.nodes.get(index)
    }

    pub fn nodes(&self) -> &[SimNode] {
        &self.nodes
    }

    pub fn node_by_address(&self, address: &str) -> Option<(&SimNode, NodeIndex)> {
        let index = self.overlay.index_by_address(address)?;
        Some((&self.nodes[index], index))
    }

    pub fn node_by_guid_str(&self, guid: &str) -> Option<(&SimNode, NodeIndex)> {
        let index = self.overlay.index_by_guid_str(guid)?;
        Some((&self.nodes[index], index))
    }

    fn deployments(&self) -> MutexGuard<'_, HashMap<RequestId, LedgerSlot>> {
        self.deployments.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver one message to `address`
    fn deliver(&self, address: &str) -> Option<&SimNode> {
        self.counters.messages.fetch_add(1, Ordering::Relaxed);
        match self.node_by_address(address) {
            Some((node, _)) => {
                node.receive();
                Some(node)
            }
            None => {
                warn!("message to unknown address {}", address);
                None
            }
        }
    }

    /// Run one feeder task on `entry`
    pub fn execute(&self, entry: NodeIndex, task: RequestTask, now: SimTime) {
        self.counters.tasks_executed.fetch_add(1, Ordering::Relaxed);
        match task.kind {
            TaskKind::Run { resources } => {
                self.counters.requests_submitted.fetch_add(1, Ordering::Relaxed);
                self.run_request(entry, task.request_id, resources, now)
            }
            TaskKind::Stop => self.stop_request(task.request_id, now),
        }
    }

    fn run_request(&self, entry: NodeIndex, request_id: RequestId, resources: Resources, now: SimTime) {
        let node = &self.nodes[entry];
        let mut messages = 0u64;

        // check and reserve under one lock so concurrent duplicates cannot both place
        let reserved = match self.deployments().entry(request_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(LedgerSlot::Placing);
                true
            }
        };
        if !reserved {
            // the live request keeps its metrics record
            warn!("request {} is already running, ignoring duplicate", request_id);
            self.counters.requests_failed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let Some(master) = node.discovery.master_address(self) else {
            warn!("{}: cannot reach master for request {}", node.address, request_id);
            self.fail_request(request_id, messages, now);
            return;
        };

        messages += 1;
        let offers = self.find_offers(&master, &resources);

        for offer in offers {
            messages += 1;
            let Some(target) = self.deliver(&offer.address) else {
                continue;
            };
            if target.discovery.obtain_resources(self, &resources) {
                self.deployments().insert(
                    request_id,
                    LedgerSlot::Placed(Deployment {
                        node: target.index,
                        resources,
                    }),
                );
                self.counters.requests_succeeded.fetch_add(1, Ordering::Relaxed);
                self.metrics.incr_messages_traded_request(request_id, messages);
                self.metrics.run_request_succeeded(request_id, target.index, now);
                debug!("request {} {} placed on {}", request_id, resources, target.address);
                return;
            }
        }

        debug!("request {} {} not satisfied", request_id, resources);
        self.fail_request(request_id, messages, now);
    }

    fn fail_request(&self, request_id: RequestId, messages: u64, now: SimTime) {
        self.deployments().remove(&request_id);
        self.counters.requests_failed.fetch_add(1, Ordering::Relaxed);
        self.metrics.incr_messages_traded_request(request_id, messages);
        self.metrics.archive_run_request(request_id, now);
    }

    fn stop_request(&self, request_id: RequestId, now: SimTime) {
        let deployment = {
            let mut ledger = self.deployments();
            // a request still being placed is not running yet
            if matches!(ledger.get(&request_id), Some(LedgerSlot::Placed(_))) {
                match ledger.remove(&request_id) {
                    Some(LedgerSlot::Placed(deployment)) => Some(deployment),
                    _ => None,
                }
            } else {
                None
            }
        };
        let Some(deployment) = deployment else {
            debug!("stop for request {} which is not running", request_id);
            return;
        };
        let node = &self.nodes[deployment.node];
        node.receive();
        node.discovery.return_resources(self, &deployment.resources);
        self.counters.stops_applied.fetch_add(1, Ordering::Relaxed);
        self.metrics.archive_run_request(request_id, now);
    }

    pub fn check_invariants(&self) -> Result<()> {
        for node in &self.nodes {
            node.discovery.check_invariant(node.index)?;
        }
        Ok(())
    }

    fn report(&self) {
        for node in &self.nodes {
            let state = node.state();
            self.metrics.set_available_node_resources(node.index, &state.free);
            self.metrics.set_node_state(node.index, &state);
        }
    }

    pub fn running_requests(&self) -> usize {
        self.deployments()
            .values()
            .filter(|slot| matches!(slot, LedgerSlot::Placed(_)))
            .count()
    }
}

impl RemoteClient for Cluster {
    fn locate_master(&self, from: &str) -> Option<NodeAddress> {
        let start = self.overlay.index_by_address(from)?;
        let (owner, hops) = self.overlay.route(start, self.master_guid, self.overlay.len())?;
        self.counters.messages.fetch_add(hops as u64, Ordering::Relaxed);

        let owner = &self.nodes[owner];
        if owner.guid != self.master_guid {
            warn!("no node holds master identifier {}", self.master_guid);
            return None;
        }
        Some(owner.address.clone())
    }

    fn create_offer(&self, master: &str, offer: &Offer) {
        if let Some(node) = self.deliver(master) {
            node.discovery.create_offer(offer);
        }
    }

    fn update_offer(&self, master: &str, offer: &Offer) {
        if let Some(node) = self.deliver(master) {
            node.discovery.update_offer(offer);
        }
    }

    fn find_offers(&self, master: &str, target: &Resources) -> Vec<ClusterNodeView> {
        self.deliver(master)
            .map(|node| node.discovery.find_offers(target))
            .unwrap_or_default()
    }
}

// ============================================================================
// Periodic Actions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodicKind {
    OfferRefresh,
    OfferSpread,
}

struct PeriodicFamily {
    kind: PeriodicKind,
    interval: SimTime,
    partitions: usize,
    last_fired: SimTime,
    cursor: usize,
}

impl PeriodicFamily {
    fn new(kind: PeriodicKind, config: PeriodicConfig) -> Self {
        Self {
            kind,
            interval: config.interval_ms,
            partitions: config.partitions,
            last_fired: 0,
            cursor: 0,
        }
    }

    /// How many times the family came due since it last fired
    fn take_due(&mut self, now: SimTime) -> u64 {
        let due = now.saturating_sub(self.last_fired) / self.interval;
        self.last_fired += due * self.interval;
        due
    }

    fn next_partition(&mut self, num_nodes: usize) -> Vec<NodeIndex> {
        let partition = self.cursor;
        self.cursor = (self.cursor + 1) % self.partitions;
        (0..num_nodes).filter(|i| i % self.partitions == partition).collect()
    }
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Initialized,
    Running,
    Drained,
}

impl EngineState {
    pub fn name(&self) -> &'static str {
        match self {
            EngineState::Uninitialized => "uninitialized",
            EngineState::Initialized => "initialized",
            EngineState::Running => "running",
            EngineState::Drained => "drained",
        }
    }
}

/// Outcome of a complete run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub seed: u64,
    pub num_nodes: usize,
    pub workers: usize,
    pub ticks: u64,
    pub final_time: SimTime,
    pub tasks_dispatched: u64,
    pub tasks_executed: u64,
    pub requests_submitted: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub stops_applied: u64,
    pub still_running: usize,
    pub messages: u64,
}

pub struct Engine {
    config: SimulationConfig,
    state: EngineState,
    seed: u64,
    metrics: Arc<dyn MetricsSink>,
    feeder: Option<Box<dyn Feeder>>,
    cluster: Option<Cluster>,
    pool: Option<WorkerPool>,
    clock: SimClock,
    rng: StdRng,
    families: Vec<PeriodicFamily>,
    tasks_dispatched: u64,
}

impl Engine {
    /// Engine with the feeder named in the configuration
    pub fn new(config: SimulationConfig, metrics: Arc<dyn MetricsSink>) -> Result<Self> {
        config.validate()?;
        let feeder = config.feeder.build()?;
        Self::with_feeder(config, feeder, metrics)
    }

    pub fn with_feeder(
        config: SimulationConfig,
        feeder: Box<dyn Feeder>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;
        let seed = config.resolve_seed();
        Ok(Self {
            clock: SimClock::new(config.tick_interval_ms),
            families: vec![
                PeriodicFamily::new(PeriodicKind::OfferRefresh, config.refresh),
                PeriodicFamily::new(PeriodicKind::OfferSpread, config.spread),
            ],
            config,
            state: EngineState::Uninitialized,
            seed,
            metrics,
            feeder: Some(feeder),
            cluster: None,
            pool: None,
            rng: StdRng::seed_from_u64(seed),
            tasks_dispatched: 0,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn clock(&self) -> SimClock {
        self.clock
    }

    pub fn cluster(&self) -> Option<&Cluster> {
        self.cluster.as_ref()
    }

    pub fn node_by_address(&self, address: &str) -> Option<(&SimNode, NodeIndex)> {
        self.cluster.as_ref()?.node_by_address(address)
    }

    pub fn node_by_guid_str(&self, guid: &str) -> Option<(&SimNode, NodeIndex)> {
        self.cluster.as_ref()?.node_by_guid_str(guid)
    }

    fn expect_state(&self, expected: EngineState) -> Result<()> {
        if self.state != expected {
            return Err(SimError::IllegalState {
                expected: expected.name(),
                actual: self.state.name(),
            });
        }
        Ok(())
    }

    /// Build the ring, the nodes and the pool, and let every peer announce
    /// itself to the master.
    pub fn initialize(&mut self) -> Result<()> {
        self.expect_state(EngineState::Uninitialized)?;

        let space = self.config.id_space()?;
        let overlay = RingOverlay::random(
            space,
            self.config.num_nodes,
            &[self.config.master_guid],
            &mut self.rng,
        )?;

        let mut generator = self.config.generator.build(self.seed)?;
        let nodes: Vec<SimNode> = overlay
            .nodes()
            .iter()
            .enumerate()
            .map(|(index, ring_node)| SimNode {
                index,
                guid: ring_node.guid,
                address: ring_node.address.clone(),
                discovery: SwarmDiscovery::new(
                    ring_node.guid,
                    ring_node.address.clone(),
                    generator.generate(),
                    self.config.master_guid,
                    self.config.class_policy,
                ),
                messages: AtomicU64::new(0),
            })
            .collect();

        let cluster = Cluster {
            overlay,
            nodes,
            master_guid: self.config.master_guid,
            metrics: Arc::clone(&self.metrics),
            deployments: Mutex::new(HashMap::new()),
            counters: ClusterCounters::default(),
        };

        let pool = WorkerPool::new(WorkerPool::resolve_size(
            self.config.workers,
            self.config.worker_multiplier,
        ))?;

        let all: Vec<NodeIndex> = (0..cluster.len()).collect();
        pool.for_each_index(&all, |i| cluster.nodes[i].discovery.start(&cluster));

        let feeder = self
            .feeder
            .as_mut()
            .ok_or_else(|| SimError::Feeder("feeder already consumed".into()))?;
        feeder.init(
            Arc::clone(&self.metrics),
            FeederContext {
                generator: self.config.generator.build(self.seed.wrapping_add(1))?,
                seed: self.seed.wrapping_add(2),
            },
        );

        self.metrics.init_new_simulation(cluster.len(), self.clock.now());

        info!(
            "initialized {} nodes on a {}-bit ring, master {} registered {} peers, {} workers, seed {}",
            cluster.len(),
            space.bits(),
            self.config.master_guid,
            cluster
                .overlay
                .index_by_guid(self.config.master_guid)
                .map(|i| cluster.nodes[i].discovery.known_peers())
                .unwrap_or(0),
            pool.size(),
            self.seed
        );

        self.cluster = Some(cluster);
        self.pool = Some(pool);
        self.state = EngineState::Initialized;
        Ok(())
    }

    /// Run every configured tick, then drain
    pub fn start(&mut self) -> Result<RunReport> {
        self.expect_state(EngineState::Initialized)?;
        self.state = EngineState::Running;

        let mut feeder = self
            .feeder
            .take()
            .ok_or_else(|| SimError::Feeder("feeder already consumed".into()))?;

        let (slot_tx, slot_rx) = bounded::<TickSlot>(1);
        let handle = thread::Builder::new()
            .name("feeder".into())
            .spawn(move || feeder.start(slot_rx))?;

        let outcome = self.run_ticks(&slot_tx);

        // closing the slot channel stops the feeder
        drop(slot_tx);
        let joined = handle
            .join()
            .map_err(|_| SimError::Feeder("feeder thread panicked".into()));

        let report = self.build_report();
        self.metrics.end_simulation(self.clock.now());

        self.cluster = None;
        self.pool = None;
        self.state = EngineState::Drained;

        outcome?;
        joined?;

        info!(
            "drained after {} ticks: {} tasks, {} placed, {} failed, {} stopped",
            report.ticks,
            report.tasks_executed,
            report.requests_succeeded,
            report.requests_failed,
            report.stops_applied
        );
        Ok(report)
    }

    fn run_ticks(&mut self, slot_tx: &Sender<TickSlot>) -> Result<()> {
        let Engine {
            config,
            metrics,
            cluster,
            pool,
            clock,
            rng,
            families,
            tasks_dispatched,
            ..
        } = self;
        let cluster = cluster.as_ref().ok_or(SimError::IllegalState {
            expected: "initialized",
            actual: "drained",
        })?;
        let pool = pool.as_ref().ok_or(SimError::IllegalState {
            expected: "initialized",
            actual: "drained",
        })?;

        for tick in 0..config.ticks {
            let now = clock.now();

            // 1-2: workload, then barrier
            let (task_tx, task_rx) = unbounded();
            slot_tx
                .send(TickSlot {
                    tick,
                    time: now,
                    tasks: task_tx,
                })
                .map_err(|_| SimError::Feeder("feeder stopped before the run ended".into()))?;
            let dispatched = dispatch_tasks(cluster, pool, &task_rx, config.placement, rng, now);
            *tasks_dispatched += dispatched;

            // 3: periodic families
            for family in families.iter_mut() {
                let due = family.take_due(now);
                for _ in 0..due {
                    let partition = family.next_partition(cluster.len());
                    let kind = family.kind;
                    pool.for_each_index(&partition, |i| {
                        let node = &cluster.nodes[i];
                        match kind {
                            PeriodicKind::OfferRefresh => node.discovery.refresh_offer(cluster),
                            PeriodicKind::OfferSpread => node.discovery.spread_offer(cluster),
                        }
                    });
                }
                if due > 0 {
                    debug!("tick {}: {:?} fired {} time(s)", tick, family.kind, due);
                }
            }

            // 4: integrity and reporting
            cluster.check_invariants()?;
            cluster.report();

            // 5: time moves on
            clock.advance();
            if config.persist_every_ticks > 0 && clock.ticks() % config.persist_every_ticks == 0 {
                metrics.persist(clock.now())?;
            }

            debug!("tick {} done: {} tasks dispatched", tick, dispatched);
        }

        // ticks since the last rotation still sit in the window
        if config.persist_every_ticks > 0 && clock.ticks() % config.persist_every_ticks != 0 {
            metrics.persist(clock.now())?;
        }
        Ok(())
    }

    fn build_report(&self) -> RunReport {
        let mut report = RunReport {
            seed: self.seed,
            ticks: self.clock.ticks(),
            final_time: self.clock.now(),
            tasks_dispatched: self.tasks_dispatched,
            ..Default::default()
        };
        if let Some(pool) = &self.pool {
            report.workers = pool.size();
        }
        if let Some(cluster) = &self.cluster {
            let counters = &cluster.counters;
            report.num_nodes = cluster.len();
            report.tasks_executed = counters.tasks_executed.load(Ordering::Relaxed);
            report.requests_submitted = counters.requests_submitted.load(Ordering::Relaxed);
            report.requests_succeeded = counters.requests_succeeded.load(Ordering::Relaxed);
            report.requests_failed = counters.requests_failed.load(Ordering::Relaxed);
            report.stops_applied = counters.stops_applied.load(Ordering::Relaxed);
            report.still_running = cluster.running_requests();
            report.messages = counters.messages.load(Ordering::Relaxed);
        }
        report
    }
}

/// Read the tick's batch until the feeder closes it, spawning one job per task
fn dispatch_tasks(
    cluster: &Cluster,
    pool: &WorkerPool,
    tasks: &Receiver<RequestTask>,
    placement: Placement,
    rng: &mut StdRng,
    now: SimTime,
) -> u64 {
    let mut dispatched = 0u64;
    pool.phase(|s| {
        for task in tasks.iter() {
            let entry = match placement {
                Placement::NodeZero => 0,
                Placement::Random => rng.gen_range(0..cluster.len()),
            };
            dispatched += 1;
            s.spawn(move |_| cluster.execute(entry, task, now));
        }
    });
    dispatched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sd_feeder::{FeederConfig, FixedFeeder, TraceAction, TraceEvent, TraceFeeder};
    use crate::sd_generator::GeneratorConfig;
    use crate::sd_metrics::{MetricsCollector, NoOpSink};
    use crate::sd_resources::CpuClass;

    fn low(cpus: u32, ram: u32) -> Resources {
        Resources::new(CpuClass::Low, cpus, ram)
    }

    fn config(ticks: u64, num_nodes: usize) -> SimulationConfig {
        SimulationConfig {
            ticks,
            num_nodes,
            tick_interval_ms: 100,
            id_bits: 16,
            seed: Some(1234),
            persist_every_ticks: 0,
            feeder: FeederConfig::Fixed { per_tick: 2 },
            generator: GeneratorConfig::Fixed {
                node: low(4, 4096),
                request: low(1, 512),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_scenario_five_ticks_two_tasks() {
        let mut engine = Engine::new(config(5, 8), Arc::new(NoOpSink)).unwrap();
        engine.initialize().unwrap();
        let report = engine.start().unwrap();

        assert_eq!(report.tasks_dispatched, 10);
        assert_eq!(report.tasks_executed, 10);
        assert_eq!(report.ticks, 5);
        assert_eq!(report.final_time, 5 * 100);
        assert_eq!(engine.clock().now(), 500);
        assert_eq!(engine.state(), EngineState::Drained);
    }

    #[test]
    fn test_lifecycle_is_enforced() {
        let mut engine = Engine::new(config(1, 4), Arc::new(NoOpSink)).unwrap();
        assert!(matches!(engine.start(), Err(SimError::IllegalState { .. })));

        engine.initialize().unwrap();
        assert!(matches!(engine.initialize(), Err(SimError::IllegalState { .. })));

        engine.start().unwrap();
        assert!(matches!(
            engine.start(),
            Err(SimError::IllegalState {
                expected: "initialized",
                actual: "drained"
            })
        ));
        assert!(engine.cluster().is_none(), "drain releases the node array");
    }

    #[test]
    fn test_peers_register_with_master() {
        let mut engine = Engine::new(config(1, 16), Arc::new(NoOpSink)).unwrap();
        engine.initialize().unwrap();

        let (master, index) = engine.node_by_guid_str("0").expect("master is on the ring");
        assert_eq!(index, 0);
        assert!(master.discovery.is_master());
        assert_eq!(master.discovery.known_peers(), 15);

        let peer_address = engine.cluster().unwrap().node(5).unwrap().address.clone();
        let (peer, peer_index) = engine.node_by_address(&peer_address).unwrap();
        assert_eq!(peer_index, 5);
        assert!(!peer.discovery.is_master());
        assert_eq!(master.discovery.view_of(&peer_address).unwrap().free, low(4, 4096));
    }

    #[test]
    fn test_capacity_exhaustion_and_conservation() {
        // 3 peers with 4 cpus each fit 12 one-cpu requests; the rest fail
        let mut cfg = config(10, 4);
        cfg.workers = 4;
        let collector = Arc::new(MetricsCollector::new(None));
        let mut engine = Engine::new(cfg, collector.clone()).unwrap();
        engine.initialize().unwrap();
        let report = engine.start().unwrap();

        assert_eq!(report.tasks_executed, 20);
        assert_eq!(report.requests_submitted, 20);
        assert_eq!(report.requests_succeeded, 12);
        assert_eq!(report.requests_failed, 8);
        assert_eq!(report.still_running, 12);

        for index in 1..4 {
            let state = collector.node_state(index).expect("node reported");
            let mut total = state.free;
            total.add(&state.used);
            assert_eq!(total, state.maximum);
            assert_eq!(state.free, low(0, 4096 - 4 * 512));
            assert_eq!(state.running, 4);
        }
        assert_eq!(collector.totals().requests_succeeded, 12);
    }

    #[test]
    fn test_stop_returns_capacity() {
        let events = vec![
            TraceEvent {
                at_ms: 0,
                id: 1,
                action: TraceAction::Run,
                resources: Some(low(2, 1024)),
            },
            TraceEvent {
                at_ms: 0,
                id: 2,
                action: TraceAction::Run,
                resources: Some(low(2, 1024)),
            },
            TraceEvent {
                at_ms: 200,
                id: 1,
                action: TraceAction::Stop,
                resources: None,
            },
            TraceEvent {
                at_ms: 200,
                id: 42,
                action: TraceAction::Stop,
                resources: None,
            },
        ];
        let collector = Arc::new(MetricsCollector::new(None));
        let mut engine = Engine::with_feeder(
            config(4, 3),
            Box::new(TraceFeeder::from_events(events)),
            collector.clone(),
        )
        .unwrap();
        engine.initialize().unwrap();
        let report = engine.start().unwrap();

        assert_eq!(report.requests_succeeded, 2);
        assert_eq!(report.stops_applied, 1, "unknown request ids are ignored");
        assert_eq!(report.still_running, 1);

        let used: u32 = (1..3).map(|i| collector.node_state(i).unwrap().used.cpus).sum();
        assert_eq!(used, 2);
        assert_eq!(collector.totals().requests_archived, 1);
    }

    #[test]
    fn test_random_placement_reaches_master_from_any_node() {
        let mut cfg = config(20, 32);
        cfg.placement = Placement::Random;
        cfg.workers = 3;
        cfg.feeder = FeederConfig::Simple {
            min_per_tick: 0,
            max_per_tick: 6,
            stop_probability: 0.3,
        };
        let mut engine = Engine::new(cfg, Arc::new(NoOpSink)).unwrap();
        engine.initialize().unwrap();
        let report = engine.start().unwrap();

        assert_eq!(report.tasks_dispatched, report.tasks_executed);
        assert!(report.requests_submitted <= report.tasks_executed);
        assert_eq!(
            report.requests_succeeded + report.requests_failed,
            report.requests_submitted
        );
        // 31 peers * 4 cpus can hold every one-cpu request issued
        assert_eq!(report.requests_failed, 0);
        assert!(report.messages > 0);
    }

    #[test]
    fn test_periodic_families_fire_per_elapsed_interval() {
        let mut family = PeriodicFamily::new(
            PeriodicKind::OfferRefresh,
            PeriodicConfig {
                interval_ms: 250,
                partitions: 3,
            },
        );

        assert_eq!(family.take_due(100), 0);
        assert_eq!(family.take_due(500), 2);
        assert_eq!(family.take_due(600), 0);
        assert_eq!(family.take_due(750), 1);

        assert_eq!(family.next_partition(7), vec![0, 3, 6]);
        assert_eq!(family.next_partition(7), vec![1, 4]);
        assert_eq!(family.next_partition(7), vec![2, 5]);
        assert_eq!(family.next_partition(7), vec![0, 3, 6]);
    }

    #[test]
    fn test_refresh_fires_once_per_interval() {
        let run = |interval_ms| {
            let mut cfg = config(3, 5);
            cfg.refresh = PeriodicConfig {
                interval_ms,
                partitions: 1,
            };
            let mut engine =
                Engine::with_feeder(cfg, Box::new(FixedFeeder::new(0)), Arc::new(NoOpSink)).unwrap();
            engine.initialize().unwrap();
            engine.start().unwrap()
        };

        let baseline = run(10_000);
        let report = run(100);

        // fires at t=100 and t=200, one update per peer each time
        assert_eq!(report.tasks_executed, 0);
        assert_eq!(report.messages - baseline.messages, 2 * 4);
    }

    #[test]
    fn test_concurrent_duplicate_runs_place_once() {
        let mut cfg = config(1, 6);
        cfg.workers = 8;
        let mut engine = Engine::with_feeder(cfg, Box::new(FixedFeeder::new(0)), Arc::new(NoOpSink)).unwrap();
        engine.initialize().unwrap();
        let cluster = engine.cluster().unwrap();

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let task = RequestTask {
                        request_id: 9,
                        submitted_at: 0,
                        kind: TaskKind::Run {
                            resources: low(1, 512),
                        },
                    };
                    cluster.execute(0, task, 0);
                });
            }
        });

        assert_eq!(cluster.running_requests(), 1);
        let used: u32 = cluster.nodes().iter().map(|n| n.discovery.snapshot().used.cpus).sum();
        assert_eq!(used, 1, "only one duplicate may hold capacity");

        cluster.execute(
            0,
            RequestTask {
                request_id: 9,
                submitted_at: 100,
                kind: TaskKind::Stop,
            },
            100,
        );
        assert_eq!(cluster.running_requests(), 0);
        assert!(cluster
            .nodes()
            .iter()
            .all(|n| n.discovery.available() == n.discovery.maximum()));
    }

    #[test]
    fn test_duplicate_run_ids_in_one_tick() {
        let mut events: Vec<TraceEvent> = (0..8)
            .map(|_| TraceEvent {
                at_ms: 0,
                id: 5,
                action: TraceAction::Run,
                resources: Some(low(1, 512)),
            })
            .collect();
        events.push(TraceEvent {
            at_ms: 100,
            id: 5,
            action: TraceAction::Stop,
            resources: None,
        });

        let mut cfg = config(3, 6);
        cfg.workers = 8;
        let collector = Arc::new(MetricsCollector::new(None));
        let mut engine =
            Engine::with_feeder(cfg, Box::new(TraceFeeder::from_events(events)), collector.clone()).unwrap();
        engine.initialize().unwrap();
        let report = engine.start().unwrap();

        assert_eq!(report.requests_submitted, 8);
        assert_eq!(report.requests_succeeded, 1);
        assert_eq!(report.requests_failed, 7);
        assert_eq!(report.stops_applied, 1);
        assert_eq!(report.still_running, 0);
        for index in 0..6 {
            let state = collector.node_state(index).unwrap();
            assert_eq!(state.free, state.maximum, "node {} leaked capacity", index);
        }
    }

    #[test]
    fn test_final_partial_window_is_persisted() {
        let dir = std::env::temp_dir().join(format!("sd_sim_engine_persist_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let mut cfg = config(3, 8);
        cfg.persist_every_ticks = 2;
        let collector = Arc::new(MetricsCollector::new(Some(dir.clone())));
        let mut engine = Engine::new(cfg, collector.clone()).unwrap();
        engine.initialize().unwrap();
        engine.start().unwrap();

        let mut files: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        files.sort();
        assert_eq!(
            files,
            vec!["snapshot_000000000000.json", "snapshot_000000000200.json"]
        );
        assert_eq!(collector.totals().snapshots_persisted, 2);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_whole_windows_are_not_persisted_twice() {
        let mut cfg = config(4, 4);
        cfg.persist_every_ticks = 2;
        let collector = Arc::new(MetricsCollector::new(None));
        let mut engine = Engine::new(cfg, collector.clone()).unwrap();
        engine.initialize().unwrap();
        engine.start().unwrap();
        assert_eq!(collector.totals().snapshots_persisted, 2);
    }

    #[test]
    fn test_clock_advances_by_fixed_step() {
        let mut clock = SimClock::new(250);
        for _ in 0..4 {
            clock.advance();
        }
        assert_eq!(clock.now(), 1000);
        assert_eq!(clock.ticks(), 4);
    }
}
