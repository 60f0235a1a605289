// Scenario Runner - Load and execute swarm discovery scenarios
//
// Usage:
//   cargo run --bin scenario_runner scenarios/steady_state.yaml
//   cargo run --bin scenario_runner scenarios/  (runs all .yaml files in directory)
//   cargo run --bin scenario_runner scenarios/steady_state.yaml --seed 0x1234

mod swarm;

use log::error;
use sd_sim::{Engine, MetricsCollector, Placement};
use simple_logger::SimpleLogger;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use swarm::{ScenarioFile, ScenarioResult};

fn main() {
    SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .env()
        .init()
        .unwrap();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <scenario.yaml | directory/> [--seed SEED]", args[0]);
        eprintln!("\nExamples:");
        eprintln!("  {} scenarios/steady_state.yaml", args[0]);
        eprintln!("  {} scenarios/", args[0]);
        eprintln!("  {} scenarios/steady_state.yaml --seed 0x1234", args[0]);
        std::process::exit(1);
    }

    let path = Path::new(&args[1]);

    // Parse optional seed
    let seed: Option<u64> = if args.len() >= 4 && args[2] == "--seed" {
        Some(parse_seed(&args[3]))
    } else {
        None
    };

    if path.is_file() {
        run_scenario_file(path, seed);
    } else if path.is_dir() {
        run_scenario_directory(path, seed);
    } else {
        eprintln!("Error: Path does not exist: {}", path.display());
        std::process::exit(1);
    }
}

fn run_scenario_directory(dir: &Path, seed: Option<u64>) {
    let mut scenarios = Vec::new();

    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let ext = path.extension().and_then(|s| s.to_str());
            if path.is_file() && (ext == Some("yaml") || ext == Some("yml")) {
                scenarios.push(path);
            }
        }
    }

    scenarios.sort();

    if scenarios.is_empty() {
        eprintln!("No .yaml files found in {}", dir.display());
        std::process::exit(1);
    }

    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  SCENARIO RUNNER - Multiple Scenarios                  ║");
    println!("╚════════════════════════════════════════════════════════╝\n");
    println!("Found {} scenario(s) to run\n", scenarios.len());

    for (i, scenario_path) in scenarios.iter().enumerate() {
        println!("\n{}/{} Running: {}\n", i + 1, scenarios.len(), scenario_path.display());
        run_scenario_file(scenario_path, seed);
    }

    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  All scenarios complete!                               ║");
    println!("╚════════════════════════════════════════════════════════╝\n");
}

fn run_scenario_file(path: &Path, seed: Option<u64>) {
    println!("Loading scenario from: {}", path.display());

    let scenario = ScenarioFile::load(path).unwrap_or_else(|e| {
        eprintln!("Failed to load {}: {}", path.display(), e);
        std::process::exit(1);
    });
    let name = scenario.display_name(path);

    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  {}{}║", name, " ".repeat(54_usize.saturating_sub(name.len())));
    println!("╚════════════════════════════════════════════════════════╝\n");

    if let Some(ref desc) = scenario.meta.description {
        println!("{}\n", desc);
    }

    if let Some(ref hypothesis) = scenario.meta.hypothesis {
        println!("Hypothesis:");
        println!("  {}\n", hypothesis);
    }

    let mut config = scenario.config;
    if seed.is_some() {
        config.seed = seed;
    }

    println!("Configuration:");
    println!("  Ticks: {} x {} ms", config.ticks, config.tick_interval_ms);
    println!("  Nodes: {} on a {}-bit ring", config.num_nodes, config.id_bits);
    println!("  Master GUID: {}", config.master_guid);
    println!(
        "  Placement: {}",
        match config.placement {
            Placement::NodeZero => "node zero",
            Placement::Random => "random",
        }
    );
    println!("  Feeder: {:?}", config.feeder);
    println!("  Refresh: every {} ms over {} partition(s)", config.refresh.interval_ms, config.refresh.partitions);
    println!("  Spread: every {} ms over {} partition(s)", config.spread.interval_ms, config.spread.partitions);
    println!("\nStarting simulation...\n");

    let metrics = Arc::new(MetricsCollector::new(config.output_dir.clone()));
    let started = Instant::now();

    let outcome = Engine::new(config, metrics.clone()).and_then(|mut engine| {
        engine.initialize()?;
        engine.start()
    });

    let report = outcome.unwrap_or_else(|e| {
        error!("{} aborted: {}", name, e);
        eprintln!("Scenario {} failed: {}", name, e);
        std::process::exit(1);
    });

    let result = ScenarioResult {
        name,
        report,
        totals: metrics.totals(),
        elapsed: started.elapsed(),
    };
    result.print_summary();

    println!("\n✓ Scenario complete!\n");
}

/// Decimal, or hex with a `0x` prefix
fn parse_seed(text: &str) -> u64 {
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.unwrap_or_else(|e| {
        eprintln!("Invalid seed {}: {}", text, e);
        std::process::exit(1);
    })
}
