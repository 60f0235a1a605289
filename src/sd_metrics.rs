//! Metrics Sink
//!
//! The engine, the feeders and the cluster client report through
//! `MetricsSink`. Every call is fire-and-forget; only `persist` can fail, and
//! the engine aborts the run when it does.
//!
//! Snapshots are eventually consistent with protocol state: a node state
//! reported while workers are still running may be partially updated.

use hashbrown::HashMap;
use log::{debug, info};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::sd_error::Result;
use crate::sd_interface::{NodeIndex, RequestId, SimTime};
use crate::sd_resources::Resources;

/// Per-node state reported at the end of every tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct NodeState {
    pub maximum: Resources,
    pub free: Resources,
    pub used: Resources,
    pub running: u32,
    /// Messages received by the node so far (bandwidth proxy)
    pub messages: u64,
    /// Rough in-memory footprint of the node's protocol state
    pub memory_bytes: u64,
}

pub trait MetricsSink: Send + Sync {
    fn init_new_simulation(&self, _num_nodes: usize, _start: SimTime) {}

    fn create_run_request(&self, _request_id: RequestId, _resources: &Resources, _time: SimTime) {}

    fn incr_messages_traded_request(&self, _request_id: RequestId, _count: u64) {}

    fn run_request_succeeded(&self, _request_id: RequestId, _node: NodeIndex, _time: SimTime) {}

    /// Request finished: stopped after running, or failed to place
    fn archive_run_request(&self, _request_id: RequestId, _time: SimTime) {}

    fn set_available_node_resources(&self, _node: NodeIndex, _free: &Resources) {}

    fn set_node_state(&self, _node: NodeIndex, _state: &NodeState) {}

    /// Write the current window out and start a new one at `time`
    fn persist(&self, _time: SimTime) -> Result<()> {
        Ok(())
    }

    fn end_simulation(&self, _time: SimTime) {}
}

/// Sink that drops everything
pub struct NoOpSink;

impl MetricsSink for NoOpSink {}

// ============================================================================
// Collector
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestRecord {
    pub request_id: RequestId,
    pub resources: Resources,
    pub submitted_at: SimTime,
    pub placed_on: Option<NodeIndex>,
    pub placed_at: Option<SimTime>,
    pub messages: u64,
    pub archived_at: Option<SimTime>,
}

/// One persistence window
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub start_time: SimTime,
    pub end_time: SimTime,
    pub num_nodes: usize,
    /// Requests archived during this window
    pub requests: Vec<RequestRecord>,
    /// Latest reported state per node
    pub nodes: BTreeMap<NodeIndex, NodeState>,
}

/// Cumulative counters over the whole run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsTotals {
    pub requests_created: u64,
    pub requests_succeeded: u64,
    pub requests_archived: u64,
    pub messages_traded: u64,
    pub snapshots_persisted: u64,
    pub ended_at: Option<SimTime>,
}

#[derive(Default)]
struct CollectorState {
    window: Snapshot,
    /// Requests created but not yet archived, carried across windows
    live: HashMap<RequestId, RequestRecord>,
    totals: MetricsTotals,
}

/// In-memory sink with optional JSON persistence
pub struct MetricsCollector {
    output_dir: Option<PathBuf>,
    state: Mutex<CollectorState>,
}

impl MetricsCollector {
    pub fn new(output_dir: Option<PathBuf>) -> Self {
        Self {
            output_dir,
            state: Mutex::new(CollectorState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn totals(&self) -> MetricsTotals {
        self.state().totals
    }

    /// Copy of the current, not yet persisted, window
    pub fn current_window(&self) -> Snapshot {
        self.state().window.clone()
    }

    pub fn node_state(&self, node: NodeIndex) -> Option<NodeState> {
        self.state().window.nodes.get(&node).copied()
    }

    pub fn live_requests(&self) -> usize {
        self.state().live.len()
    }
}

impl MetricsSink for MetricsCollector {
    fn init_new_simulation(&self, num_nodes: usize, start: SimTime) {
        let mut state = self.state();
        *state = CollectorState::default();
        state.window.num_nodes = num_nodes;
        state.window.start_time = start;
    }

    fn create_run_request(&self, request_id: RequestId, resources: &Resources, time: SimTime) {
        let mut state = self.state();
        state.totals.requests_created += 1;
        state.live.insert(
            request_id,
            RequestRecord {
                request_id,
                resources: *resources,
                submitted_at: time,
                placed_on: None,
                placed_at: None,
                messages: 0,
                archived_at: None,
            },
        );
    }

    fn incr_messages_traded_request(&self, request_id: RequestId, count: u64) {
        let mut state = self.state();
        state.totals.messages_traded += count;
        if let Some(record) = state.live.get_mut(&request_id) {
            record.messages += count;
        }
    }

    fn run_request_succeeded(&self, request_id: RequestId, node: NodeIndex, time: SimTime) {
        let mut state = self.state();
        state.totals.requests_succeeded += 1;
        if let Some(record) = state.live.get_mut(&request_id) {
            record.placed_on = Some(node);
            record.placed_at = Some(time);
        }
    }

    fn archive_run_request(&self, request_id: RequestId, time: SimTime) {
        let mut state = self.state();
        if let Some(mut record) = state.live.remove(&request_id) {
            record.archived_at = Some(time);
            state.totals.requests_archived += 1;
            state.window.requests.push(record);
        }
    }

    fn set_available_node_resources(&self, node: NodeIndex, free: &Resources) {
        self.state().window.nodes.entry(node).or_default().free = *free;
    }

    fn set_node_state(&self, node: NodeIndex, node_state: &NodeState) {
        self.state().window.nodes.insert(node, *node_state);
    }

    fn persist(&self, time: SimTime) -> Result<()> {
        let mut state = self.state();
        state.window.end_time = time;

        if let Some(dir) = &self.output_dir {
            fs::create_dir_all(dir)?;
            let path = dir.join(format!("snapshot_{:012}.json", state.window.start_time));
            let json = serde_json::to_string_pretty(&state.window)?;
            fs::write(&path, json)?;
            debug!("persisted snapshot to {}", path.display());
        }

        state.totals.snapshots_persisted += 1;

        // node states are re-reported every tick, archived requests are not
        let num_nodes = state.window.num_nodes;
        state.window = Snapshot {
            start_time: time,
            end_time: time,
            num_nodes,
            requests: Vec::new(),
            nodes: BTreeMap::new(),
        };
        Ok(())
    }

    fn end_simulation(&self, time: SimTime) {
        let mut state = self.state();
        state.totals.ended_at = Some(time);
        info!(
            "simulation ended at {} ms: {} requests, {} placed, {} messages",
            time,
            state.totals.requests_created,
            state.totals.requests_succeeded,
            state.totals.messages_traded
        );
    }
}
