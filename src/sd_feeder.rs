//! Workload Feeder
//!
//! The engine hands the feeder one `TickSlot` per tick over a bounded channel.
//! The feeder writes that tick's tasks into the slot's sender and drops it,
//! which the engine sees as end-of-batch. Closing the slot channel stops the
//! feeder for good.
//!
//! Tasks within one batch run in any order. The trace feeder therefore never
//! puts a Stop in the same batch as the Run it cancels; the Stop and every
//! later event move to the next tick.

use crossbeam_channel::{Receiver, Sender};
use hashbrown::HashSet;
use log::{debug, error, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::sd_error::{Result, SimError};
use crate::sd_generator::ResourceGenerator;
use crate::sd_interface::{RequestId, SimTime};
use crate::sd_metrics::MetricsSink;
use crate::sd_resources::Resources;

// ============================================================================
// Tasks and Handoff
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Place a workload of this size somewhere in the cluster
    Run { resources: Resources },
    /// Release the workload placed for `request_id`
    Stop,
}

/// One unit of work, executed at most once on the node the engine picks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTask {
    pub request_id: RequestId,
    pub submitted_at: SimTime,
    pub kind: TaskKind,
}

/// Per-tick handoff from engine to feeder
pub struct TickSlot {
    pub tick: u64,
    pub time: SimTime,
    pub tasks: Sender<RequestTask>,
}

/// What a feeder receives at init time
pub struct FeederContext {
    pub generator: Box<dyn ResourceGenerator>,
    pub seed: u64,
}

pub trait Feeder: Send {
    fn init(&mut self, metrics: Arc<dyn MetricsSink>, context: FeederContext);

    /// Write this tick's tasks into `out`. Returns false if the engine stopped
    /// listening.
    fn feed_tick(&mut self, tick: u64, time: SimTime, out: &Sender<RequestTask>) -> bool;

    /// Serve tick slots until the engine closes the channel
    fn start(&mut self, ticks: Receiver<TickSlot>) {
        let mut served = 0u64;
        for slot in ticks.iter() {
            if !self.feed_tick(slot.tick, slot.time, &slot.tasks) {
                debug!("feeder: engine dropped tick {} early", slot.tick);
            }
            served += 1;
            // slot dropped here, closing the batch
        }
        info!("feeder stopped after {} ticks", served);
    }
}

/// State shared by the built-in feeders
struct FeederCore {
    metrics: Arc<dyn MetricsSink>,
    generator: Box<dyn ResourceGenerator>,
    rng: StdRng,
    next_request_id: RequestId,
}

impl FeederCore {
    fn new(metrics: Arc<dyn MetricsSink>, context: FeederContext) -> Self {
        Self {
            metrics,
            generator: context.generator,
            rng: StdRng::seed_from_u64(context.seed),
            next_request_id: 1,
        }
    }

    fn run_task(&mut self, time: SimTime, resources: Option<Resources>) -> RequestTask {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.run_task_with_id(request_id, time, resources)
    }

    fn run_task_with_id(&mut self, request_id: RequestId, time: SimTime, resources: Option<Resources>) -> RequestTask {
        let resources = resources.unwrap_or_else(|| self.generator.generate_request());
        self.metrics.create_run_request(request_id, &resources, time);
        RequestTask {
            request_id,
            submitted_at: time,
            kind: TaskKind::Run { resources },
        }
    }
}

fn uninitialized(name: &str) -> bool {
    error!("{} feeder used before init, emitting nothing", name);
    true
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeederConfig {
    /// Exactly `per_tick` run requests every tick
    Fixed { per_tick: usize },

    /// Uniform number of run requests per tick, and a per-tick chance for each
    /// earlier request to be stopped
    Simple {
        min_per_tick: usize,
        max_per_tick: usize,
        #[serde(default)]
        stop_probability: f64,
    },

    /// Replay of a YAML trace of timed run/stop events
    Trace { path: PathBuf },
}

impl Default for FeederConfig {
    fn default() -> Self {
        FeederConfig::Simple {
            min_per_tick: 1,
            max_per_tick: 5,
            stop_probability: 0.05,
        }
    }
}

impl FeederConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            FeederConfig::Fixed { .. } => Ok(()),
            FeederConfig::Simple {
                min_per_tick,
                max_per_tick,
                stop_probability,
            } => {
                if min_per_tick > max_per_tick {
                    return Err(SimError::Config(format!(
                        "feeder min_per_tick {} exceeds max_per_tick {}",
                        min_per_tick, max_per_tick
                    )));
                }
                if !(0.0..=1.0).contains(stop_probability) {
                    return Err(SimError::Config(format!(
                        "stop_probability {} outside [0, 1]",
                        stop_probability
                    )));
                }
                Ok(())
            }
            FeederConfig::Trace { path } => {
                if path.as_os_str().is_empty() {
                    return Err(SimError::Config("trace feeder needs a path".into()));
                }
                Ok(())
            }
        }
    }

    pub fn build(&self) -> Result<Box<dyn Feeder>> {
        self.validate()?;
        Ok(match self {
            FeederConfig::Fixed { per_tick } => Box::new(FixedFeeder::new(*per_tick)),
            FeederConfig::Simple {
                min_per_tick,
                max_per_tick,
                stop_probability,
            } => Box::new(SimpleFeeder::new(*min_per_tick, *max_per_tick, *stop_probability)),
            FeederConfig::Trace { path } => Box::new(TraceFeeder::from_file(path)?),
        })
    }
}

// ============================================================================
// Built-in Feeders
// ============================================================================

pub struct FixedFeeder {
    per_tick: usize,
    core: Option<FeederCore>,
}

impl FixedFeeder {
    pub fn new(per_tick: usize) -> Self {
        Self { per_tick, core: None }
    }
}

impl Feeder for FixedFeeder {
    fn init(&mut self, metrics: Arc<dyn MetricsSink>, context: FeederContext) {
        self.core = Some(FeederCore::new(metrics, context));
    }

    fn feed_tick(&mut self, _tick: u64, time: SimTime, out: &Sender<RequestTask>) -> bool {
        let Some(core) = self.core.as_mut() else {
            return uninitialized("fixed");
        };
        for _ in 0..self.per_tick {
            if out.send(core.run_task(time, None)).is_err() {
                return false;
            }
        }
        true
    }
}

pub struct SimpleFeeder {
    min_per_tick: usize,
    max_per_tick: usize,
    stop_probability: f64,
    /// Requests emitted in earlier ticks that have not been stopped yet
    outstanding: Vec<RequestId>,
    core: Option<FeederCore>,
}

impl SimpleFeeder {
    pub fn new(min_per_tick: usize, max_per_tick: usize, stop_probability: f64) -> Self {
        Self {
            min_per_tick,
            max_per_tick,
            stop_probability,
            outstanding: Vec::new(),
            core: None,
        }
    }
}

impl Feeder for SimpleFeeder {
    fn init(&mut self, metrics: Arc<dyn MetricsSink>, context: FeederContext) {
        self.core = Some(FeederCore::new(metrics, context));
    }

    fn feed_tick(&mut self, _tick: u64, time: SimTime, out: &Sender<RequestTask>) -> bool {
        let Some(core) = self.core.as_mut() else {
            return uninitialized("simple");
        };

        let mut stops = Vec::new();
        let stop_probability = self.stop_probability;
        self.outstanding.retain(|&request_id| {
            if core.rng.gen_bool(stop_probability) {
                stops.push(request_id);
                false
            } else {
                true
            }
        });

        for request_id in stops {
            let task = RequestTask {
                request_id,
                submitted_at: time,
                kind: TaskKind::Stop,
            };
            if out.send(task).is_err() {
                return false;
            }
        }

        let count = core.rng.gen_range(self.min_per_tick..=self.max_per_tick);
        for _ in 0..count {
            let task = core.run_task(time, None);
            self.outstanding.push(task.request_id);
            if out.send(task).is_err() {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceAction {
    Run,
    Stop,
}

/// One line of a workload trace
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TraceEvent {
    pub at_ms: SimTime,
    pub id: RequestId,
    pub action: TraceAction,
    /// Run events without resources draw a size from the generator
    #[serde(default)]
    pub resources: Option<Resources>,
}

pub struct TraceFeeder {
    /// Sorted by `at_ms`, stable for equal times
    events: Vec<TraceEvent>,
    cursor: usize,
    core: Option<FeederCore>,
}

impl TraceFeeder {
    pub fn from_events(mut events: Vec<TraceEvent>) -> Self {
        events.sort_by_key(|e| e.at_ms);
        Self {
            events,
            cursor: 0,
            core: None,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let events: Vec<TraceEvent> = serde_yaml::from_str(&content)?;
        info!("loaded {} trace events from {}", events.len(), path.display());
        Ok(Self::from_events(events))
    }

    pub fn remaining(&self) -> usize {
        self.events.len() - self.cursor
    }
}

impl Feeder for TraceFeeder {
    fn init(&mut self, metrics: Arc<dyn MetricsSink>, context: FeederContext) {
        self.core = Some(FeederCore::new(metrics, context));
    }

    /// Emits every event due at or before `time`, stopping early at a Stop
    /// whose Run is already in this batch
    fn feed_tick(&mut self, _tick: u64, time: SimTime, out: &Sender<RequestTask>) -> bool {
        let Some(core) = self.core.as_mut() else {
            return uninitialized("trace");
        };

        let mut started: HashSet<RequestId> = HashSet::new();
        while let Some(event) = self.events.get(self.cursor) {
            if event.at_ms > time {
                break;
            }
            if event.action == TraceAction::Stop && started.contains(&event.id) {
                debug!("trace: stop for request {} deferred to the next tick", event.id);
                break;
            }
            if event.action == TraceAction::Run {
                started.insert(event.id);
            }
            let task = match event.action {
                TraceAction::Run => core.run_task_with_id(event.id, time, event.resources),
                TraceAction::Stop => RequestTask {
                    request_id: event.id,
                    submitted_at: time,
                    kind: TaskKind::Stop,
                },
            };
            self.cursor += 1;
            if out.send(task).is_err() {
                return false;
            }
        }
        true
    }
}
