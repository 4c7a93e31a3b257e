#![allow(dead_code)]

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nalgebra::{Point3, Vector3};

use mlpot_parity::core::domain::SimulationBox;
use mlpot_parity::core::scenarios::{self, ArtifactSpec, Scenario};
use mlpot_parity::engine::artifacts::{ArtifactCache, FetchError, Fetcher, RetryPolicy};
use mlpot_parity::engine::driver::EvaluatorDriver;
use mlpot_parity::engine::evaluator::{
    AccumulatorId, Evaluator, EvaluatorFactory, ExecutionStrategy, HostState, Integrator,
    PotentialSelection,
};
use mlpot_parity::engine::reference::{PairEvaluatorFactory, ReferenceModel};
use mlpot_parity::error::Result;

// --- Mock Evaluator ---

/// Deliberate defects the harness must detect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fault {
    None,
    /// Reported forces are scaled by this factor.
    ForceScale(f64),
    /// Energy (and its decomposition) shifted by a constant under one strategy.
    StrategyOffset(ExecutionStrategy, f64),
    /// Per-atom energies do not add up to the total.
    PerAtomLeak(f64),
    /// Every fresh instance adds a growing offset to the energy.
    Drift(f64),
}

/// Harmonic wells `E = sum k/2 |x_i - c|^2` around the box centre.
///
/// Quadratic, so central differences reproduce its forces to rounding.
pub struct MockEvaluator {
    state: HostState,
    stiffness: f64,
    fault: Fault,
    instance: usize,
    resets: Arc<AtomicUsize>,
}

impl MockEvaluator {
    fn centre(&self) -> Result<Point3<f64>> {
        let cell = self.state.simulation_box()?;
        Ok(nalgebra::center(&cell.lo, &cell.hi))
    }
}

impl Evaluator for MockEvaluator {
    fn name(&self) -> &str {
        "Mock Evaluator"
    }

    fn reset(&mut self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.state = HostState::default();
        Ok(())
    }

    fn declare(&mut self, n_types: usize, simulation_box: &SimulationBox) -> Result<()> {
        self.state.declare(n_types, simulation_box)
    }

    fn create_atom(&mut self, type_id: usize, position: Point3<f64>) -> Result<()> {
        self.state.create_atom(type_id, position)
    }

    fn set_mass(&mut self, type_id: usize, mass: f64) -> Result<()> {
        self.state.set_mass(type_id, mass)
    }

    fn select_potential(&mut self, selection: &PotentialSelection) -> Result<()> {
        self.state.select_potential(selection)
    }

    fn set_integrator(&mut self, integrator: Option<Integrator>) -> Result<()> {
        self.state.integrator = integrator;
        Ok(())
    }

    fn run(&mut self, _steps: usize) -> Result<()> {
        self.state.ready()?;
        let c = self.centre()?;
        let strategy = self.state.potential()?.strategy;

        let mut per_atom = Vec::with_capacity(self.state.positions.len());
        let mut forces = Vec::with_capacity(self.state.positions.len());
        for p in &self.state.positions {
            let d = *p - c;
            per_atom.push(0.5 * self.stiffness * d.norm_squared());
            forces.push(-d * self.stiffness);
        }
        let mut energy: f64 = per_atom.iter().sum();

        match self.fault {
            Fault::None => {}
            Fault::ForceScale(s) => forces.iter_mut().for_each(|f| *f *= s),
            Fault::StrategyOffset(target, offset) if target == strategy => {
                energy += offset;
                per_atom[0] += offset;
            }
            Fault::StrategyOffset(..) => {}
            Fault::PerAtomLeak(leak) => per_atom[0] += leak,
            Fault::Drift(step) => energy += step * self.instance as f64,
        }

        let per_atom = self.state.has_accumulators().then_some(per_atom);
        self.state.record(energy, forces, per_atom);
        Ok(())
    }

    fn potential_energy(&self) -> Result<f64> {
        self.state.energy()
    }

    fn register_per_atom_energy(&mut self) -> Result<AccumulatorId> {
        Ok(self.state.register_accumulator())
    }

    fn read_per_atom_energy(&self, id: AccumulatorId, range: Range<usize>) -> Result<Vec<f64>> {
        self.state.read_accumulator(id, range)
    }

    fn positions(&self) -> Result<Vec<Point3<f64>>> {
        Ok(self.state.positions.clone())
    }

    fn set_positions(&mut self, positions: &[Point3<f64>]) -> Result<()> {
        self.state.set_positions(positions)
    }

    fn forces(&self) -> Result<Vec<Vector3<f64>>> {
        self.state.forces()
    }
}

pub struct MockFactory {
    pub fault: Fault,
    pub created: AtomicUsize,
    pub resets: Arc<AtomicUsize>,
}

impl MockFactory {
    pub fn new(fault: Fault) -> Self {
        Self {
            fault,
            created: AtomicUsize::new(0),
            resets: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl EvaluatorFactory for MockFactory {
    fn name(&self) -> &str {
        "mock"
    }

    fn create(&self) -> Result<Box<dyn Evaluator>> {
        let instance = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockEvaluator {
            state: HostState::default(),
            stiffness: 2.5,
            fault: self.fault,
            instance,
            resets: self.resets.clone(),
        }))
    }
}

// --- Fake Fetchers ---

/// Fails transiently `failures` times, then serves `body`.
pub struct FlakyFetcher {
    pub failures: usize,
    pub body: Vec<u8>,
    pub calls: AtomicUsize,
    pub delay: Duration,
}

impl FlakyFetcher {
    pub fn new(failures: usize, body: &[u8]) -> Self {
        Self {
            failures,
            body: body.to_vec(),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Fetcher for FlakyFetcher {
    fn fetch(&self, url: &str) -> std::result::Result<Vec<u8>, FetchError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if n < self.failures {
            return Err(FetchError::Transient(format!("connection reset fetching {}", url)));
        }
        Ok(self.body.clone())
    }
}

/// Always answers 404.
pub struct MissingFetcher {
    pub calls: AtomicUsize,
}

impl Fetcher for MissingFetcher {
    fn fetch(&self, _url: &str) -> std::result::Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(FetchError::Permanent("HTTP 404 Not Found".to_string()))
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backoff: Duration::from_millis(1),
    }
}

// --- Setup Helpers ---

/// Cache that must never reach the network.
pub fn offline_cache(dir: &Path) -> Arc<ArtifactCache> {
    Arc::new(ArtifactCache::new(
        dir,
        Arc::new(MissingFetcher {
            calls: AtomicUsize::new(0),
        }),
        fast_retry(),
    ))
}

/// Bundled reference model installed in `dir`.
pub fn reference_model(dir: &Path) -> PathBuf {
    ReferenceModel::install_bundled(dir).unwrap()
}

pub fn reference_driver(dir: &Path) -> Arc<EvaluatorDriver> {
    Arc::new(EvaluatorDriver::new(
        Arc::new(PairEvaluatorFactory),
        offline_cache(dir),
    ))
}

pub fn mock_driver(dir: &Path, factory: Arc<MockFactory>) -> Arc<EvaluatorDriver> {
    Arc::new(EvaluatorDriver::new(factory, offline_cache(dir)))
}

/// Catalogue scenario rebound to a local model file.
pub fn local_scenario(name: &str, model: &Path) -> Scenario {
    scenarios::by_name(name)
        .unwrap()
        .unwrap()
        .with_artifact(ArtifactSpec::local(model))
}

/// Any existing file works as the artifact for the mock backend.
pub fn placeholder_artifact(dir: &Path) -> PathBuf {
    let path = dir.join("placeholder.json");
    std::fs::write(&path, b"{}").unwrap();
    path
}
