// Swarm Discovery Simulator Module

pub mod scenario;
pub mod stats;

// Re-export commonly used types
pub use scenario::ScenarioFile;
pub use stats::ScenarioResult;
