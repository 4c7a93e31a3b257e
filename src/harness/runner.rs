use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::scenarios::Scenario;
use crate::core::tolerances::Tolerance;
use crate::engine::driver::{EvaluatorDriver, EvaluatorSession};
use crate::engine::evaluator::{EvaluationResult, ExecutionStrategy};
use crate::error::{ErrorClass, HarnessError, Result};
use crate::harness::checker::{Check, CheckSet, Quantity};
use crate::harness::oracle;
use crate::harness::{CellStats, HarnessEvent};

/// How a cell ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CellStatus {
    Passed,
    /// At least one check failed.
    Failed,
    /// The cell could not produce outputs.
    Errored { class: String, message: String },
}

/// Outcome of one (scenario, strategy) cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellOutcome {
    pub scenario: String,
    pub strategy: ExecutionStrategy,
    pub session: Option<Uuid>,
    pub status: CellStatus,
    pub checks: CheckSet,
    /// Outputs of the primary evaluation, kept for the cross-strategy checks.
    pub result: Option<EvaluationResult>,
    pub elapsed_ms: u128,
}

impl CellOutcome {
    pub fn passed(&self) -> bool {
        self.status == CellStatus::Passed
    }

    fn stats(&self) -> CellStats {
        let error = match &self.status {
            CellStatus::Errored { message, .. } => Some(message.clone()),
            _ => None,
        };
        CellStats {
            scenario: self.scenario.clone(),
            strategy: self.strategy,
            passed: self.passed(),
            checks_passed: self.checks.passed_count(),
            checks_total: self.checks.total_count(),
            error,
            elapsed_ms: self.elapsed_ms,
        }
    }
}

/// Per-scenario aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioVerdict {
    pub name: String,
    /// Every strategy cell passed and the strategies agree.
    pub consistent: bool,
    /// Strategy the invariance checks compare against.
    pub baseline: Option<ExecutionStrategy>,
    pub invariance: CheckSet,
}

/// One CSV row per check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckRow {
    pub run_id: Uuid,
    pub scenario: String,
    pub strategy: String,
    pub quantity: Quantity,
    pub label: String,
    pub observed: f64,
    pub expected: f64,
    pub tolerance: String,
    pub passed: bool,
    pub worst_atom: Option<usize>,
    pub worst_axis: Option<usize>,
}

impl CheckRow {
    fn new(run_id: Uuid, scenario: &str, strategy: &str, check: &Check) -> Self {
        Self {
            run_id,
            scenario: scenario.to_string(),
            strategy: strategy.to_string(),
            quantity: check.quantity,
            label: check.label.clone(),
            observed: check.observed,
            expected: check.expected,
            tolerance: check.tolerance.map(|t| t.to_string()).unwrap_or_default(),
            passed: check.passed,
            worst_atom: check.worst_index.map(|(a, _)| a),
            worst_axis: check.worst_index.map(|(_, x)| x),
        }
    }
}

/// Everything a matrix run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixReport {
    pub run_id: Uuid,
    pub backend: String,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub cells: Vec<CellOutcome>,
    pub scenarios: Vec<ScenarioVerdict>,
}

impl MatrixReport {
    /// True iff every scenario is consistent.
    pub fn all_consistent(&self) -> bool {
        !self.scenarios.is_empty() && self.scenarios.iter().all(|s| s.consistent)
    }

    pub fn cell(&self, scenario: &str, strategy: ExecutionStrategy) -> Option<&CellOutcome> {
        self.cells
            .iter()
            .find(|c| c.scenario == scenario && c.strategy == strategy)
    }

    pub fn verdict(&self, scenario: &str) -> Option<&ScenarioVerdict> {
        self.scenarios.iter().find(|s| s.name == scenario)
    }

    pub fn rows(&self) -> Vec<CheckRow> {
        let mut rows = Vec::new();
        for cell in &self.cells {
            for check in &cell.checks.checks {
                rows.push(CheckRow::new(self.run_id, &cell.scenario, cell.strategy.as_str(), check));
            }
        }
        for verdict in &self.scenarios {
            for check in &verdict.invariance.checks {
                rows.push(CheckRow::new(self.run_id, &verdict.name, "*", check));
            }
        }
        rows
    }

    pub fn write_csv(&self, path: &Path) -> anyhow::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for row in self.rows() {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }
}

/// Matrix execution settings.
#[derive(Debug, Clone, Copy)]
pub struct RunSettings {
    pub threads: usize,
    pub determinism: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            threads: 4,
            determinism: true,
        }
    }
}

/// Runs the scenario × strategy matrix.
pub struct MatrixRunner {
    driver: Arc<EvaluatorDriver>,
    settings: RunSettings,
    events: Option<Sender<HarnessEvent>>,
}

impl MatrixRunner {
    pub fn new(driver: Arc<EvaluatorDriver>, settings: RunSettings) -> Self {
        Self {
            driver,
            settings,
            events: None,
        }
    }

    pub fn with_events(mut self, tx: Sender<HarnessEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    fn emit(&self, event: HarnessEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    pub fn run(
        &self,
        scenarios: &[Scenario],
        strategies: &[ExecutionStrategy],
    ) -> Result<MatrixReport> {
        let run_id = Uuid::new_v4();
        let started = Utc::now();
        info!(
            "Run {}: {} scenarios x {} strategies on {}",
            run_id,
            scenarios.len(),
            strategies.len(),
            self.driver.backend_name()
        );

        // 1. Cells
        let cells: Vec<(&Scenario, ExecutionStrategy)> = scenarios
            .iter()
            .flat_map(|s| strategies.iter().map(move |&st| (s, st)))
            .collect();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.threads.max(1))
            .build()
            .map_err(|e| HarnessError::InvalidConfiguration(format!("thread pool: {}", e)))?;
        let outcomes: Vec<CellOutcome> = pool.install(|| {
            cells
                .par_iter()
                .map(|(scenario, strategy)| self.run_cell(scenario, *strategy))
                .collect()
        });

        // 2. Cross-strategy aggregation
        let verdicts: Vec<ScenarioVerdict> = scenarios
            .iter()
            .map(|s| {
                let cells: Vec<&CellOutcome> =
                    outcomes.iter().filter(|c| c.scenario == s.name).collect();
                aggregate(&s.name, &cells)
            })
            .collect();

        let report = MatrixReport {
            run_id,
            backend: self.driver.backend_name().to_string(),
            started,
            finished: Utc::now(),
            cells: outcomes,
            scenarios: verdicts,
        };

        for verdict in &report.scenarios {
            let line = format!(
                "Scenario {}: {}",
                verdict.name,
                if verdict.consistent { "consistent" } else { "INCONSISTENT" }
            );
            if verdict.consistent {
                info!("{}", line);
            } else {
                warn!("{}", line);
            }
            self.emit(HarnessEvent::Log(line));
        }
        self.emit(HarnessEvent::Finished {
            consistent: report.all_consistent(),
        });
        Ok(report)
    }

    /// Runs one cell; errors are captured in the outcome, never propagated.
    pub fn run_cell(&self, scenario: &Scenario, strategy: ExecutionStrategy) -> CellOutcome {
        let start = Instant::now();
        self.emit(HarnessEvent::CellStarted {
            scenario: scenario.name.clone(),
            strategy,
        });

        let mut checks = CheckSet::new();
        let mut session_id = None;
        let result = self.evaluate_cell(scenario, strategy, &mut checks, &mut session_id);

        let (status, result) = match result {
            Ok(r) if checks.all_passed() => (CellStatus::Passed, Some(r)),
            Ok(r) => (CellStatus::Failed, Some(r)),
            Err(e) => {
                let class = match e.class() {
                    ErrorClass::Setup => "setup",
                    ErrorClass::Transient => "transient",
                    ErrorClass::Evaluation => "evaluation",
                };
                warn!("Cell {}/{} errored: {}", scenario.name, strategy, e);
                (
                    CellStatus::Errored {
                        class: class.to_string(),
                        message: e.to_string(),
                    },
                    None,
                )
            }
        };

        for failure in checks.failures() {
            warn!("{}/{}: {}", scenario.name, strategy, failure);
        }

        let outcome = CellOutcome {
            scenario: scenario.name.clone(),
            strategy,
            session: session_id,
            status,
            checks,
            result,
            elapsed_ms: start.elapsed().as_millis(),
        };
        self.emit(HarnessEvent::CellFinished(outcome.stats()));
        outcome
    }

    fn evaluate_cell(
        &self,
        scenario: &Scenario,
        strategy: ExecutionStrategy,
        checks: &mut CheckSet,
        session_id: &mut Option<Uuid>,
    ) -> Result<EvaluationResult> {
        let expectations = &scenario.expectations;
        let mut session = self.driver.open(scenario, strategy)?;
        *session_id = Some(session.id());

        // A. Evaluation or short dynamics
        let energy = primary_run(scenario, &mut session)?;

        // B. Reference energy
        if let Some(reference) = &expectations.energy {
            checks.check_energy(energy, reference);
        }

        // C. Energy decomposition
        if expectations.per_atom_sum {
            let per_atom = session.per_atom_energy()?;
            checks.check_per_atom_sum(session.energy()?, &per_atom);
        }
        let result = session.snapshot()?;

        // D. Force oracle
        if let Some(force_check) = &expectations.forces {
            let report = oracle::finite_difference_forces(&mut session, force_check.step)?;
            checks.check_oracle(&result.forces, &report, force_check.tolerance);
        }
        drop(session);

        // E. Fresh re-run
        if self.settings.determinism {
            let mut fresh = self.driver.open(scenario, strategy)?;
            let repeat = primary_run(scenario, &mut fresh)?;
            checks.check_scalar(
                "energy of a fresh re-run",
                Quantity::Determinism,
                repeat,
                result.energy,
                Tolerance::determinism(),
            );
        }

        Ok(result)
    }
}

fn primary_run(scenario: &Scenario, session: &mut EvaluatorSession) -> Result<f64> {
    match scenario.dynamics {
        Some(dynamics) => session.advance(dynamics.steps)?,
        None => session.evaluate()?,
    }
    session.energy()
}

/// Compares every strategy against the first passing one, or the first with outputs.
fn aggregate(name: &str, cells: &[&CellOutcome]) -> ScenarioVerdict {
    let mut invariance = CheckSet::new();
    let baseline = cells
        .iter()
        .find(|c| c.passed())
        .or_else(|| cells.iter().find(|c| c.result.is_some()));

    if let Some(base) = baseline {
        if let Some(base_result) = &base.result {
            for cell in cells.iter().filter(|c| c.strategy != base.strategy) {
                if let Some(result) = &cell.result {
                    invariance.check_scalar(
                        &format!("energy {} vs {}", cell.strategy, base.strategy),
                        Quantity::StrategyEnergy,
                        result.energy,
                        base_result.energy,
                        Tolerance::strategy_invariance(),
                    );
                    invariance.check_forces(
                        &format!("forces {} vs {}", cell.strategy, base.strategy),
                        Quantity::StrategyForces,
                        &result.forces,
                        &base_result.forces,
                        Tolerance::strategy_invariance(),
                    );
                }
            }
        }
    }

    let consistent = !cells.is_empty() && cells.iter().all(|c| c.passed()) && invariance.all_passed();
    ScenarioVerdict {
        name: name.to_string(),
        consistent,
        baseline: baseline.map(|c| c.strategy),
        invariance,
    }
}
