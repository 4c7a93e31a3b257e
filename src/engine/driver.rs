use std::sync::Arc;

use log::{debug, warn};
use nalgebra::{Point3, Vector3};
use uuid::Uuid;

use crate::core::scenarios::Scenario;
use crate::engine::artifacts::ArtifactCache;
use crate::engine::evaluator::{
    AccumulatorId, EvaluationResult, Evaluator, EvaluatorFactory, ExecutionStrategy, Integrator,
    PotentialSelection,
};
use crate::error::{HarnessError, Result};

/// Pushes scenarios into fresh evaluator instances.
pub struct EvaluatorDriver {
    factory: Arc<dyn EvaluatorFactory>,
    artifacts: Arc<ArtifactCache>,
}

impl EvaluatorDriver {
    pub fn new(factory: Arc<dyn EvaluatorFactory>, artifacts: Arc<ArtifactCache>) -> Self {
        Self { factory, artifacts }
    }

    pub fn backend_name(&self) -> &str {
        self.factory.name()
    }

    /// Sets up a clean evaluator for one (scenario, strategy) cell.
    ///
    /// The artifact is resolved first so a missing model fails before any
    /// evaluator is created.
    pub fn open(&self, scenario: &Scenario, strategy: ExecutionStrategy) -> Result<EvaluatorSession> {
        let config = &scenario.configuration;
        config.validate()?;

        let artifact_path = self.artifacts.ensure(&scenario.artifact)?;
        let evaluator = self.factory.create()?;
        let mut session = EvaluatorSession {
            id: Uuid::new_v4(),
            evaluator,
            n_atoms: config.n_atoms(),
            per_atom: None,
        };
        debug!(
            "Session {} opening {} / {} on {}",
            session.id,
            scenario.name,
            strategy,
            session.evaluator.name()
        );

        // 1. Clean slate
        let ev = session.evaluator.as_mut();
        ev.reset()?;

        // 2. Simulation space
        ev.declare(config.n_types(), &config.simulation_box)?;
        for atom in &config.atoms {
            ev.create_atom(atom.type_id, atom.position)?;
        }
        for (i, species) in config.species.iter().enumerate() {
            ev.set_mass(i + 1, species.mass)?;
        }

        // 3. Potential
        ev.select_potential(&PotentialSelection {
            strategy,
            artifact_path,
            type_names: config.type_names(),
            short_range_repulsion: config.short_range_repulsion,
        })?;

        // 4. Integrator
        let integrator = scenario
            .dynamics
            .map(|d| Integrator::Nve { timestep: d.timestep });
        ev.set_integrator(integrator)?;

        Ok(session)
    }
}

/// Scoped handle on one evaluator instance.
///
/// Dropping the session resets the evaluator on every exit path, so no state
/// leaks into the next cell.
pub struct EvaluatorSession {
    id: Uuid,
    evaluator: Box<dyn Evaluator>,
    n_atoms: usize,
    per_atom: Option<AccumulatorId>,
}

impl EvaluatorSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn n_atoms(&self) -> usize {
        self.n_atoms
    }

    /// Single static evaluation.
    pub fn evaluate(&mut self) -> Result<()> {
        self.evaluator.run(0)
    }

    /// Runs `steps` steps of the configured integrator.
    pub fn advance(&mut self, steps: usize) -> Result<()> {
        self.evaluator.run(steps)
    }

    pub fn energy(&self) -> Result<f64> {
        self.evaluator.potential_energy()
    }

    pub fn forces(&self) -> Result<Vec<Vector3<f64>>> {
        let forces = self.evaluator.forces()?;
        if forces.len() != self.n_atoms {
            return Err(HarnessError::ArityMismatch {
                declared: self.n_atoms,
                found: forces.len(),
                context: "force rows".to_string(),
            });
        }
        Ok(forces)
    }

    pub fn positions(&self) -> Result<Vec<Point3<f64>>> {
        self.evaluator.positions()
    }

    /// Registers the per-atom accumulator (once), evaluates, and reads it back.
    pub fn per_atom_energy(&mut self) -> Result<Vec<f64>> {
        let id = match self.per_atom {
            Some(id) => id,
            None => {
                let id = self.evaluator.register_per_atom_energy()?;
                self.per_atom = Some(id);
                id
            }
        };
        // Accumulator must see a run issued after its registration.
        self.evaluator.run(0)?;
        self.evaluator.read_per_atom_energy(id, 0..self.n_atoms)
    }

    /// Adds `delta` to one coordinate in place.
    pub fn displace(&mut self, atom: usize, axis: usize, delta: f64) -> Result<f64> {
        if atom >= self.n_atoms || axis >= 3 {
            return Err(HarnessError::InvalidConfiguration(format!(
                "coordinate ({}, {}) outside {} atoms x 3 axes",
                atom, axis, self.n_atoms
            )));
        }
        let mut positions = self.evaluator.positions()?;
        positions[atom][axis] += delta;
        let updated = positions[atom][axis];
        self.evaluator.set_positions(&positions)?;
        Ok(updated)
    }

    /// Energy, forces and (when registered) per-atom energies of the last run.
    pub fn snapshot(&self) -> Result<EvaluationResult> {
        let per_atom_energy = match self.per_atom {
            Some(id) => Some(self.evaluator.read_per_atom_energy(id, 0..self.n_atoms)?),
            None => None,
        };
        Ok(EvaluationResult {
            energy: self.energy()?,
            per_atom_energy,
            forces: self.forces()?,
        })
    }
}

impl Drop for EvaluatorSession {
    fn drop(&mut self) {
        if let Err(e) = self.evaluator.reset() {
            warn!("Session {} teardown failed: {}", self.id, e);
        }
    }
}
