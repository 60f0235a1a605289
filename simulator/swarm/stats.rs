// Swarm Discovery Simulator Statistics

use sd_sim::sd_metrics::MetricsTotals;
use sd_sim::RunReport;
use std::time::Duration;

/// Outcome of one scenario
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    pub name: String,

    /// Engine-side counters
    pub report: RunReport,

    /// Sink-side counters
    pub totals: MetricsTotals,

    /// Wall-clock time of the run
    pub elapsed: Duration,
}

impl ScenarioResult {
    pub fn placement_rate(&self) -> Option<f64> {
        let attempts = self.report.requests_succeeded + self.report.requests_failed;
        if attempts == 0 {
            return None;
        }
        Some(self.report.requests_succeeded as f64 / attempts as f64 * 100.0)
    }

    pub fn messages_per_request(&self) -> Option<f64> {
        if self.totals.requests_created == 0 {
            return None;
        }
        Some(self.totals.messages_traded as f64 / self.totals.requests_created as f64)
    }

    pub fn print_summary(&self) {
        let report = &self.report;

        println!("\n╔════════════════════════════════════════════════════════╗");
        println!("║    SWARM DISCOVERY SIMULATION RESULTS                  ║");
        println!("╚════════════════════════════════════════════════════════╝\n");

        println!("Scenario: {}", self.name);
        println!("Seed: {}", report.seed);
        println!("Nodes: {}, Workers: {}", report.num_nodes, report.workers);
        println!("Ticks: {} ({} ms simulated)", report.ticks, report.final_time);
        println!();

        println!("═══ Workload ═══");
        println!("  Tasks: {} dispatched, {} executed", report.tasks_dispatched, report.tasks_executed);
        println!("  Requests Created: {}", self.totals.requests_created);
        println!("  Placed: {}", report.requests_succeeded);
        println!("  Failed: {}", report.requests_failed);
        println!("  Stopped: {}", report.stops_applied);
        println!("  Still Running: {}", report.still_running);
        if let Some(rate) = self.placement_rate() {
            println!("  Placement Rate: {:.1}%", rate);
        }
        println!();

        println!("═══ Messages ═══");
        println!("  Total: {}", report.messages);
        println!("  Traded for Requests: {}", self.totals.messages_traded);
        if let Some(avg) = self.messages_per_request() {
            println!("  Per Request: {:.2}", avg);
        }
        println!();

        println!("═══ Run ═══");
        println!("  Snapshots Persisted: {}", self.totals.snapshots_persisted);
        println!("  Wall Time: {:.2?}", self.elapsed);
    }
}
