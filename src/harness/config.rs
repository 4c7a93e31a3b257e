use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::core::scenarios::{self, ArtifactSpec, Scenario};
use crate::engine::artifacts::RetryPolicy;
use crate::engine::evaluator::ExecutionStrategy;
use crate::engine::reference::ReferenceModel;
use crate::error::{HarnessError, Result};

/// Which evaluator implementation drives the matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Lammps,
    Reference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LammpsSettings {
    pub executable: PathBuf,
    /// Adds `-k on -sf kk` to every invocation.
    pub kokkos: bool,
}

impl Default for LammpsSettings {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("lmp"),
            kokkos: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSettings {
    pub max_attempts: usize,
    pub backoff_ms: u64,
    pub timeout_secs: u64,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 500,
            timeout_secs: 300,
        }
    }
}

impl DownloadSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Run settings, loadable from JSON and overridden by command-line flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub backend: Backend,
    pub lammps: LammpsSettings,
    /// Parameter file for the reference backend; the bundled model when absent.
    pub model: Option<PathBuf>,
    pub cache_dir: PathBuf,
    /// Worker threads for matrix cells.
    pub threads: usize,
    /// Scenario names; empty selects the whole catalogue.
    pub scenarios: Vec<String>,
    pub strategies: Vec<ExecutionStrategy>,
    /// Re-run every cell from a fresh evaluator and compare energies.
    pub determinism: bool,
    pub download: DownloadSettings,
    pub report_csv: Option<PathBuf>,
    pub report_json: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Lammps,
            lammps: LammpsSettings::default(),
            model: None,
            cache_dir: PathBuf::from(".mlpot-cache"),
            threads: 4,
            scenarios: Vec::new(),
            strategies: ExecutionStrategy::ALL.to_vec(),
            determinism: true,
            download: DownloadSettings::default(),
            report_csv: None,
            report_json: None,
            log_file: None,
        }
    }
}

impl HarnessConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: HarnessConfig =
            serde_json::from_str(&text).map_err(|source| HarnessError::ConfigParsing {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(HarnessError::InvalidConfiguration(
                "threads must be at least 1".to_string(),
            ));
        }
        if self.strategies.is_empty() {
            return Err(HarnessError::InvalidConfiguration(
                "at least one execution strategy must be selected".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolves the selected scenarios.
    ///
    /// On the reference backend every scenario is rebound to the reference
    /// parameter file, which drops the recorded energies of the MACE models.
    pub fn select_scenarios(&self) -> Result<Vec<Scenario>> {
        let catalogue = scenarios::catalogue()?;
        let mut selected = if self.scenarios.is_empty() {
            catalogue
        } else {
            let mut picked = Vec::with_capacity(self.scenarios.len());
            for name in &self.scenarios {
                let scenario = catalogue
                    .iter()
                    .find(|s| &s.name == name)
                    .cloned()
                    .ok_or_else(|| {
                        HarnessError::InvalidConfiguration(format!("unknown scenario '{}'", name))
                    })?;
                picked.push(scenario);
            }
            picked
        };

        if self.backend == Backend::Reference {
            let artifact = self.reference_artifact()?;
            selected = selected
                .into_iter()
                .map(|s| s.with_artifact(artifact.clone()))
                .collect();
        }
        Ok(selected)
    }

    fn reference_artifact(&self) -> Result<ArtifactSpec> {
        let path = match &self.model {
            Some(path) => path.clone(),
            None => ReferenceModel::install_bundled(&self.cache_dir)?,
        };
        Ok(ArtifactSpec::local(path))
    }
}
