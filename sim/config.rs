//! Run configuration loaded from TOML.
//!
//! Every field is optional; the command line fills in or overrides whatever the file leaves
//! out. Scenario parameters never live here, only in the design table, except for the
//! `[[grid]]` blocks that build a design table from scratch.
//!
//! ```toml
//! family = "progression"
//! what = "both"
//! cutoffs = [12, 24]
//! milestones = [12]
//! seed = 20240101
//! replicates = 100
//!
//! [[grid]]
//! name = "hazard_trt"
//! values = [0.01, 0.015, 0.02]
//! ```

use crate::design::DesignGrid;
use crate::scenarios::ScenarioFamily;
use crate::truth::{EndpointSelection, TruthOptions};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
}

/// One factor of a design grid.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GridParameter {
    pub name: String,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub family: Option<ScenarioFamily>,
    pub what: Option<EndpointSelection>,
    #[serde(default)]
    pub cutoffs: Vec<f64>,
    #[serde(default)]
    pub milestones: Vec<f64>,
    pub strict: Option<bool>,
    pub seed: Option<u64>,
    pub replicates: Option<usize>,
    pub discrete: Option<bool>,
    pub alpha: Option<f64>,
    /// Event count triggering the analysis of generated data.
    pub target_events: Option<usize>,
    #[serde(default)]
    pub grid: Vec<GridParameter>,
}

impl RunConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Truth options from the file alone; the CLI layers its flags on top.
    pub fn truth_options(&self) -> TruthOptions {
        TruthOptions {
            cutoffs: self.cutoffs.clone(),
            milestones: self.milestones.clone(),
            endpoints: self.what.unwrap_or_default(),
            strict: self.strict.unwrap_or(false),
        }
    }

    pub fn design_grid(&self) -> DesignGrid {
        self.grid
            .iter()
            .fold(DesignGrid::new(), |grid, p| grid.parameter(&p.name, &p.values))
    }
}
