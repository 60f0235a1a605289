// Scenario file format

use sd_sim::{FeederConfig, SimulationConfig};
use std::fs;
use std::path::Path;

/// One scenario: metadata plus a full simulation configuration
#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioFile {
    #[serde(default)]
    pub meta: ScenarioMeta,

    /// Anything left out keeps its default
    #[serde(default)]
    pub config: SimulationConfig,
}

#[derive(Debug, Default, serde::Deserialize)]
pub struct ScenarioMeta {
    pub name: Option<String>,
    pub description: Option<String>,
    pub hypothesis: Option<String>,
}

impl ScenarioFile {
    pub fn from_yaml_str(yaml: &str) -> sd_sim::Result<Self> {
        let scenario: ScenarioFile = serde_yaml::from_str(yaml)?;
        scenario.config.validate()?;
        Ok(scenario)
    }

    /// Load a scenario; trace and output paths are relative to the file
    pub fn load(path: &Path) -> sd_sim::Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut scenario = Self::from_yaml_str(&content)?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        if let FeederConfig::Trace { path: trace } = &mut scenario.config.feeder {
            if trace.is_relative() {
                *trace = base.join(&*trace);
            }
        }
        if let Some(dir) = &mut scenario.config.output_dir {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
        Ok(scenario)
    }

    pub fn display_name(&self, path: &Path) -> String {
        self.meta.name.clone().unwrap_or_else(|| {
            path.file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("scenario")
                .to_string()
        })
    }
}
