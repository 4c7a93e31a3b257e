use std::fmt;
use std::ops::Range;
use std::path::PathBuf;
use std::str::FromStr;

use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::core::domain::SimulationBox;
use crate::error::{HarnessError, Result};

// --- Strategy ---

/// The evaluator's selectable computation/communication paths.
/// All variants must produce the same physics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    Default,
    NoDomainDecomposition,
    MpiMessagePassing,
    NoMpiMessagePassing,
}

impl ExecutionStrategy {
    pub const ALL: [ExecutionStrategy; 4] = [
        ExecutionStrategy::Default,
        ExecutionStrategy::NoDomainDecomposition,
        ExecutionStrategy::MpiMessagePassing,
        ExecutionStrategy::NoMpiMessagePassing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::NoDomainDecomposition => "no_domain_decomposition",
            Self::MpiMessagePassing => "mpi_message_passing",
            Self::NoMpiMessagePassing => "no_mpi_message_passing",
        }
    }
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStrategy {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|v| v.as_str() == wanted)
            .ok_or_else(|| {
                HarnessError::InvalidConfiguration(format!("unknown execution strategy '{}'", s))
            })
    }
}

// --- Control Surface Types ---

/// Everything `select_potential` needs.
#[derive(Debug, Clone, PartialEq)]
pub struct PotentialSelection {
    pub strategy: ExecutionStrategy,
    pub artifact_path: PathBuf,
    /// Element symbol for each declared type, in type-id order.
    pub type_names: Vec<String>,
    pub short_range_repulsion: bool,
}

/// Time integration applied by `run(steps)` when `steps > 0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Integrator {
    /// Velocity-Verlet in the microcanonical ensemble; timestep in ps.
    Nve { timestep: f64 },
}

/// Handle returned by `register_per_atom_energy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccumulatorId(pub usize);

/// The outputs of one evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// The potential energy (eV).
    pub energy: f64,
    /// Per-atom decomposition, when an accumulator was registered.
    pub per_atom_energy: Option<Vec<f64>>,
    /// eV/Å, one row per atom.
    pub forces: Vec<Vector3<f64>>,
}

/// The narrow control surface of a host engine running a potential.
///
/// Implementations hold process-wide state, so they are driven from one
/// thread at a time (`Send`, not `Sync`).
pub trait Evaluator: Send {
    /// Returns the name of the engine (e.g., "LAMMPS (Pipe)").
    fn name(&self) -> &str;

    /// Clears all prior state.
    fn reset(&mut self) -> Result<()>;

    /// Sets up the simulation space with `n_types` atom types.
    fn declare(&mut self, n_types: usize, simulation_box: &SimulationBox) -> Result<()>;

    fn create_atom(&mut self, type_id: usize, position: Point3<f64>) -> Result<()>;

    fn set_mass(&mut self, type_id: usize, mass: f64) -> Result<()>;

    fn select_potential(&mut self, selection: &PotentialSelection) -> Result<()>;

    fn set_integrator(&mut self, integrator: Option<Integrator>) -> Result<()>;

    /// Advances `steps` steps; `0` is a single static evaluation.
    fn run(&mut self, steps: usize) -> Result<()>;

    /// Total potential energy of the last run.
    fn potential_energy(&self) -> Result<f64>;

    /// Must be called before the run whose energy is decomposed.
    fn register_per_atom_energy(&mut self) -> Result<AccumulatorId>;

    fn read_per_atom_energy(&self, id: AccumulatorId, range: Range<usize>) -> Result<Vec<f64>>;

    fn positions(&self) -> Result<Vec<Point3<f64>>>;

    fn set_positions(&mut self, positions: &[Point3<f64>]) -> Result<()>;

    /// Forces of the last run.
    fn forces(&self) -> Result<Vec<Vector3<f64>>>;
}

/// Creates fresh evaluator instances; shared across matrix cells.
pub trait EvaluatorFactory: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self) -> Result<Box<dyn Evaluator>>;
}

// --- Shared Bookkeeping ---

#[derive(Debug, Clone, Default)]
struct AccumulatorSlot {
    values: Option<Vec<f64>>,
}

/// Staged host-engine state shared by the evaluator backends.
///
/// Enforces the ordering rules of the control surface: `declare` before
/// atoms and masses, type ids within the declared arity, and per-atom
/// accumulators that only become readable after a run.
#[derive(Debug, Clone, Default)]
pub struct HostState {
    pub n_types: usize,
    pub simulation_box: Option<SimulationBox>,
    pub type_ids: Vec<usize>,
    pub positions: Vec<Point3<f64>>,
    pub velocities: Vec<Vector3<f64>>,
    pub masses: Vec<Option<f64>>,
    pub potential: Option<PotentialSelection>,
    pub integrator: Option<Integrator>,
    pub energy: Option<f64>,
    pub forces: Option<Vec<Vector3<f64>>>,
    accumulators: Vec<AccumulatorSlot>,
}

impl HostState {
    pub fn declare(&mut self, n_types: usize, simulation_box: &SimulationBox) -> Result<()> {
        if self.simulation_box.is_some() {
            return Err(HarnessError::EvaluatorInit(
                "simulation box already declared; reset first".to_string(),
            ));
        }
        if n_types == 0 {
            return Err(HarnessError::InvalidConfiguration(
                "at least one atom type must be declared".to_string(),
            ));
        }
        self.n_types = n_types;
        self.simulation_box = Some(simulation_box.clone());
        self.masses = vec![None; n_types];
        Ok(())
    }

    pub fn check_type(&self, type_id: usize) -> Result<()> {
        if self.simulation_box.is_none() {
            return Err(HarnessError::EvaluatorInit(
                "atoms or masses set before the box was declared".to_string(),
            ));
        }
        if type_id == 0 || type_id > self.n_types {
            return Err(HarnessError::ArityMismatch {
                declared: self.n_types,
                found: type_id,
                context: "type id".to_string(),
            });
        }
        Ok(())
    }

    pub fn create_atom(&mut self, type_id: usize, position: Point3<f64>) -> Result<()> {
        self.check_type(type_id)?;
        self.type_ids.push(type_id);
        self.positions.push(position);
        self.velocities.push(Vector3::zeros());
        Ok(())
    }

    pub fn set_mass(&mut self, type_id: usize, mass: f64) -> Result<()> {
        self.check_type(type_id)?;
        if !(mass > 0.0) {
            return Err(HarnessError::InvalidConfiguration(format!(
                "mass of type {} must be positive, got {}",
                type_id, mass
            )));
        }
        self.masses[type_id - 1] = Some(mass);
        Ok(())
    }

    pub fn select_potential(&mut self, selection: &PotentialSelection) -> Result<()> {
        if self.simulation_box.is_none() {
            return Err(HarnessError::EvaluatorInit(
                "potential selected before the box was declared".to_string(),
            ));
        }
        if selection.type_names.len() != self.n_types {
            return Err(HarnessError::ArityMismatch {
                declared: self.n_types,
                found: selection.type_names.len(),
                context: "type-name mapping".to_string(),
            });
        }
        self.potential = Some(selection.clone());
        Ok(())
    }

    pub fn potential(&self) -> Result<&PotentialSelection> {
        self.potential
            .as_ref()
            .ok_or_else(|| HarnessError::EvaluatorInit("no potential selected".to_string()))
    }

    pub fn simulation_box(&self) -> Result<&SimulationBox> {
        self.simulation_box
            .as_ref()
            .ok_or_else(|| HarnessError::EvaluatorInit("no simulation box declared".to_string()))
    }

    /// Mass per atom; every declared type must have one.
    pub fn atom_masses(&self) -> Result<Vec<f64>> {
        self.type_ids
            .iter()
            .map(|&t| {
                self.masses[t - 1].ok_or_else(|| {
                    HarnessError::EvaluatorInit(format!("no mass set for type {}", t))
                })
            })
            .collect()
    }

    /// Checks the state is complete enough to run.
    pub fn ready(&self) -> Result<()> {
        self.simulation_box()?;
        self.potential()?;
        if self.type_ids.is_empty() {
            return Err(HarnessError::EvaluatorInit("no atoms created".to_string()));
        }
        Ok(())
    }

    pub fn set_positions(&mut self, positions: &[Point3<f64>]) -> Result<()> {
        if positions.len() != self.positions.len() {
            return Err(HarnessError::ArityMismatch {
                declared: self.positions.len(),
                found: positions.len(),
                context: "position array length".to_string(),
            });
        }
        self.positions.copy_from_slice(positions);
        Ok(())
    }

    pub fn register_accumulator(&mut self) -> AccumulatorId {
        self.accumulators.push(AccumulatorSlot::default());
        AccumulatorId(self.accumulators.len() - 1)
    }

    pub fn has_accumulators(&self) -> bool {
        !self.accumulators.is_empty()
    }

    /// Stores the outputs of a completed run and refreshes every accumulator.
    pub fn record(&mut self, energy: f64, forces: Vec<Vector3<f64>>, per_atom: Option<Vec<f64>>) {
        self.energy = Some(energy);
        self.forces = Some(forces);
        if let Some(values) = per_atom {
            for slot in &mut self.accumulators {
                slot.values = Some(values.clone());
            }
        }
    }

    pub fn energy(&self) -> Result<f64> {
        self.energy
            .ok_or_else(|| HarnessError::Evaluation("potential energy read before any run".to_string()))
    }

    pub fn forces(&self) -> Result<Vec<Vector3<f64>>> {
        self.forces
            .clone()
            .ok_or_else(|| HarnessError::Evaluation("forces read before any run".to_string()))
    }

    pub fn read_accumulator(&self, id: AccumulatorId, range: Range<usize>) -> Result<Vec<f64>> {
        let slot = self.accumulators.get(id.0).ok_or_else(|| {
            HarnessError::Evaluation(format!("no per-atom accumulator with id {}", id.0))
        })?;
        let values = slot
            .values
            .as_ref()
            .ok_or(HarnessError::StaleAccumulator { id: id.0 })?;
        values
            .get(range.clone())
            .map(|v| v.to_vec())
            .ok_or_else(|| {
                HarnessError::Evaluation(format!(
                    "component range {:?} outside {} atoms",
                    range,
                    values.len()
                ))
            })
    }
}
