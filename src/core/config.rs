//! Simulation configuration, loaded from JSON.
//!
//! Every field has a default, so a config file only needs to name what it
//! changes:
//!
//! ```json
//! { "run": { "run": 2, "runs": 3 }, "log": { "test": ["Epoch", "Trial"] } }
//! ```

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::prng::Seeds;
use crate::time::Level;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network name; prefixes log file names.
    pub name: String,
    pub title: String,
    /// Log the loop structure at startup.
    pub debug: bool,
    pub params: ParamConfig,
    pub run: RunConfig,
    pub log: LogConfig,
    pub stats: StatsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamConfig {
    /// Extra parameter sheet applied on top of the base sheet.
    pub sheet: String,
    /// Extra tag for the run name.
    pub tag: String,
    /// Free-form note printed at startup.
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Starting run index.
    pub run: usize,
    /// Number of runs.
    pub runs: usize,
    /// Cycles per trial.
    pub cycles: usize,
    /// Capacity of the per-run seed table.
    pub seed_cap: usize,
    pub base_seed: u64,
    /// Present table rows in order rather than permuted.
    pub sequential: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub dir: PathBuf,
    /// Test-mode levels that get a log file.
    pub test: Vec<Level>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Run the Step phase at the Cycle level. When false, cycle-level stats
    /// are only ever reset, never accumulated.
    pub step_cycle: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "Faces".to_string(),
            title: "Face categorization".to_string(),
            debug: false,
            params: ParamConfig::default(),
            run: RunConfig::default(),
            log: LogConfig::default(),
            stats: StatsConfig::default(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run: 0,
            runs: 1,
            cycles: 20,
            seed_cap: 100,
            base_seed: Seeds::DEFAULT_BASE,
            sequential: true,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            test: Vec::new(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self { step_cycle: true }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let file = File::open(path)?;
        let cfg: Config = serde_json::from_reader(BufReader::new(file))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.run.runs == 0 {
            return Err(SimError::Configuration("run.runs must be positive".into()));
        }
        if self.run.cycles == 0 {
            return Err(SimError::Configuration("run.cycles must be positive".into()));
        }
        if self.run.seed_cap == 0 {
            return Err(SimError::Configuration("run.seed_cap must be positive".into()));
        }
        Ok(())
    }
}
