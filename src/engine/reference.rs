//! In-process reference evaluator.
//!
//! A smoothly cut-off Morse pair model with an optional screened-Coulomb
//! short-range repulsion and per-species isolated-atom energies, read from a
//! JSON parameter artifact. Every execution strategy runs a different
//! summation path over the same physics:
//!
//! | Strategy | Neighbour list | Scheduling |
//! |----------|----------------|------------|
//! | `Default` | full | serial |
//! | `NoDomainDecomposition` | half, Newton's third law | serial |
//! | `MpiMessagePassing` | half, per-rank buffers reduced in rank order | parallel |
//! | `NoMpiMessagePassing` | full, every atom independent | parallel |

use std::collections::HashMap;
use std::f64::consts::PI;
use std::fs;
use std::io::Write;
use std::ops::Range;
use std::path::{Path, PathBuf};

use log::debug;
use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::chemistry::{MorseParams, PairTable};
use crate::core::domain::SimulationBox;
use crate::core::spatial;
use crate::engine::evaluator::{
    AccumulatorId, Evaluator, EvaluatorFactory, ExecutionStrategy, HostState, Integrator,
    PotentialSelection,
};
use crate::error::{HarnessError, Result};

/// Force-to-velocity conversion for metal units: (eV/Å)/(g/mol) -> Å/ps².
pub const FTM2V: f64 = 1.0 / 1.0364269e-4;

/// Parameter file shipped with the crate, used when no model is given.
pub const BUNDLED_MODEL: &str = include_str!("../../data/reference_pair.json");

/// Cache file name of [`BUNDLED_MODEL`].
pub const BUNDLED_MODEL_NAME: &str = "reference_pair.json";

/// Number of simulated ranks in the message-passing strategy.
const RANKS: usize = 4;

/// Closer than this (Å) two atoms are treated as coincident.
const MIN_SEPARATION: f64 = 1e-8;

// --- Model File ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairEntry {
    pub a: String,
    pub b: String,
    #[serde(flatten)]
    pub params: MorseParams,
}

/// Screened-Coulomb repulsion `A exp(-kappa r) / r`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Repulsion {
    pub prefactor: f64,
    pub kappa: f64,
}

/// Serialized form of the reference model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceModel {
    pub cutoff: f64,
    pub atomic_energies: HashMap<String, f64>,
    pub pairs: Vec<PairEntry>,
    #[serde(default)]
    pub repulsion: Option<Repulsion>,
}

impl ReferenceModel {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text, path)
    }

    fn parse(text: &str, origin: &Path) -> Result<Self> {
        let model: ReferenceModel =
            serde_json::from_str(text).map_err(|source| HarnessError::ModelParsing {
                path: origin.to_path_buf(),
                source,
            })?;
        if !(model.cutoff > 0.0) {
            return Err(HarnessError::EvaluatorInit(format!(
                "model cutoff must be positive, got {}",
                model.cutoff
            )));
        }
        Ok(model)
    }

    pub fn bundled() -> Result<Self> {
        Self::parse(BUNDLED_MODEL, Path::new(BUNDLED_MODEL_NAME))
    }

    /// Writes the bundled parameters into `dir` unless already present.
    pub fn install_bundled(dir: &Path) -> Result<PathBuf> {
        let target = dir.join(BUNDLED_MODEL_NAME);
        if !target.is_file() {
            fs::create_dir_all(dir)?;
            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            tmp.write_all(BUNDLED_MODEL.as_bytes())?;
            tmp.persist(&target).map_err(|e| HarnessError::Io(e.error))?;
        }
        Ok(target)
    }

    /// Binds symbols to type indices for the given type-name mapping.
    fn bind(&self, type_names: &[String], repulsion_enabled: bool) -> Result<BoundModel> {
        let mut atomic_energy = Vec::with_capacity(type_names.len());
        for name in type_names {
            let e0 = self.atomic_energies.get(name).ok_or_else(|| {
                HarnessError::EvaluatorInit(format!("model has no species '{}'", name))
            })?;
            atomic_energy.push(*e0);
        }

        let index_of = |symbol: &str| type_names.iter().position(|n| n == symbol);
        let mut table = PairTable::new(type_names.len());
        for entry in &self.pairs {
            if let (Some(i), Some(j)) = (index_of(&entry.a), index_of(&entry.b)) {
                table.set(i, j, entry.params);
            }
        }
        if let Some((i, j)) = table.missing_pairs().first() {
            return Err(HarnessError::EvaluatorInit(format!(
                "model has no pair parameters for {}-{}",
                type_names[*i], type_names[*j]
            )));
        }

        let repulsion = if repulsion_enabled {
            Some(self.repulsion.ok_or_else(|| {
                HarnessError::EvaluatorInit(
                    "short-range repulsion requested but the model defines none".to_string(),
                )
            })?)
        } else {
            None
        };

        Ok(BoundModel {
            cutoff: self.cutoff,
            table,
            atomic_energy,
            repulsion,
        })
    }
}

// --- Kernel ---

#[derive(Debug, Clone)]
struct BoundModel {
    cutoff: f64,
    table: PairTable,
    atomic_energy: Vec<f64>,
    repulsion: Option<Repulsion>,
}

impl BoundModel {
    /// Pair energy and its radial derivative at separation `r`.
    #[inline]
    fn pair(&self, ti: usize, tj: usize, r: f64) -> (f64, f64) {
        let (mut u, mut du) = (0.0, 0.0);
        if let Some(p) = self.table.get(ti, tj) {
            let e = (-p.alpha * (r - p.r0)).exp();
            u += p.depth * (e * e - 2.0 * e);
            du += 2.0 * p.alpha * p.depth * (e - e * e);
        }
        if let Some(rep) = self.repulsion {
            let screening = (-rep.kappa * r).exp();
            u += rep.prefactor * screening / r;
            du -= rep.prefactor * screening * (1.0 + rep.kappa * r) / (r * r);
        }

        let x = PI * r / self.cutoff;
        let fc = 0.5 * (x.cos() + 1.0);
        let dfc = -0.5 * PI / self.cutoff * x.sin();
        (u * fc, du * fc + u * dfc)
    }
}

/// Raw outputs of one force/energy pass.
#[derive(Debug, Clone)]
struct Pass {
    energy: f64,
    per_atom: Vec<f64>,
    forces: Vec<Vector3<f64>>,
}

impl Pass {
    fn zeros(n: usize) -> Self {
        Self {
            energy: 0.0,
            per_atom: vec![0.0; n],
            forces: vec![Vector3::zeros(); n],
        }
    }

    fn absorb(&mut self, other: &Pass) {
        self.energy += other.energy;
        for (a, b) in self.per_atom.iter_mut().zip(&other.per_atom) {
            *a += b;
        }
        for (a, b) in self.forces.iter_mut().zip(&other.forces) {
            *a += b;
        }
    }
}

struct System<'a> {
    model: &'a BoundModel,
    /// Wrapped into the primary cell so the image shifts reach every neighbour.
    positions: Vec<Point3<f64>>,
    types: &'a [usize],
    shifts: Vec<Vector3<f64>>,
}

impl<'a> System<'a> {
    fn new(
        model: &'a BoundModel,
        cell: &SimulationBox,
        positions: &[Point3<f64>],
        types: &'a [usize],
    ) -> Self {
        Self {
            model,
            positions: positions.iter().map(|p| spatial::wrap(cell, p)).collect(),
            types,
            shifts: spatial::image_shifts(cell, model.cutoff),
        }
    }

    fn n(&self) -> usize {
        self.positions.len()
    }

    /// Separation vector, distance, pair energy and derivative, or None outside the cutoff.
    #[inline]
    fn term(
        &self,
        i: usize,
        j: usize,
        shift: &Vector3<f64>,
    ) -> Result<Option<(Vector3<f64>, f64, f64, f64)>> {
        let d = (self.positions[j] + *shift) - self.positions[i];
        let r2 = d.norm_squared();
        let rc = self.model.cutoff;
        if r2 >= rc * rc {
            return Ok(None);
        }
        let r = r2.sqrt();
        if r < MIN_SEPARATION {
            return Err(HarnessError::Evaluation(format!(
                "atoms {} and {} coincide",
                i, j
            )));
        }
        let (phi, dphi) = self.model.pair(self.types[i], self.types[j], r);
        Ok(Some((d, r, phi, dphi)))
    }

    /// Energy and force of atom `i` from a full neighbour list.
    fn full_row(&self, i: usize) -> Result<(f64, Vector3<f64>)> {
        let mut e = self.model.atomic_energy[self.types[i]];
        let mut f = Vector3::zeros();
        for j in 0..self.n() {
            for (k, shift) in self.shifts.iter().enumerate() {
                if i == j && k == 0 {
                    continue;
                }
                if let Some((d, r, phi, dphi)) = self.term(i, j, shift)? {
                    e += 0.5 * phi;
                    if i != j {
                        f += d * (dphi / r);
                    }
                }
            }
        }
        Ok((e, f))
    }

    /// Half-list contributions of the pairs owned by atoms in `owned`.
    fn half_rows(&self, owned: Range<usize>) -> Result<Pass> {
        let n = self.n();
        let mut pass = Pass::zeros(n);
        for i in owned {
            let e0 = self.model.atomic_energy[self.types[i]];
            pass.energy += e0;
            pass.per_atom[i] += e0;

            for j in i..n {
                for (k, shift) in self.shifts.iter().enumerate() {
                    if i == j && (k == 0 || !spatial::is_upper_shift(shift)) {
                        continue;
                    }
                    if let Some((d, r, phi, dphi)) = self.term(i, j, shift)? {
                        pass.energy += phi;
                        pass.per_atom[i] += 0.5 * phi;
                        pass.per_atom[j] += 0.5 * phi;
                        if i != j {
                            let fij = d * (dphi / r);
                            pass.forces[i] += fij;
                            pass.forces[j] -= fij;
                        }
                    }
                }
            }
        }
        Ok(pass)
    }

    fn compute(&self, strategy: ExecutionStrategy) -> Result<Pass> {
        let n = self.n();
        match strategy {
            ExecutionStrategy::Default => {
                let mut pass = Pass::zeros(n);
                for i in 0..n {
                    let (e, f) = self.full_row(i)?;
                    pass.per_atom[i] = e;
                    pass.forces[i] = f;
                }
                pass.energy = pass.per_atom.iter().sum();
                Ok(pass)
            }
            ExecutionStrategy::NoDomainDecomposition => self.half_rows(0..n),
            ExecutionStrategy::MpiMessagePassing => {
                let chunk = (n + RANKS - 1) / RANKS;
                let ranks: Vec<Range<usize>> = (0..RANKS)
                    .map(|r| (r * chunk).min(n)..((r + 1) * chunk).min(n))
                    .collect();
                let partials = ranks
                    .into_par_iter()
                    .map(|owned| self.half_rows(owned))
                    .collect::<Result<Vec<_>>>()?;

                // Reduce ghost contributions in rank order.
                let mut pass = Pass::zeros(n);
                for partial in &partials {
                    pass.absorb(partial);
                }
                Ok(pass)
            }
            ExecutionStrategy::NoMpiMessagePassing => {
                let rows = (0..n)
                    .into_par_iter()
                    .map(|i| self.full_row(i))
                    .collect::<Result<Vec<_>>>()?;
                let mut pass = Pass::zeros(n);
                for (i, (e, f)) in rows.into_iter().enumerate() {
                    pass.per_atom[i] = e;
                    pass.forces[i] = f;
                }
                pass.energy = pass.per_atom.iter().sum();
                Ok(pass)
            }
        }
    }
}

// --- Evaluator ---

/// Reference pair-model evaluator driven through the standard control surface.
#[derive(Default)]
pub struct PairEvaluator {
    state: HostState,
    model: Option<BoundModel>,
}

impl PairEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    fn pass(&self, positions: &[Point3<f64>]) -> Result<Pass> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| HarnessError::EvaluatorInit("no potential selected".to_string()))?;
        let strategy = self.state.potential()?.strategy;
        let types: Vec<usize> = self.state.type_ids.iter().map(|t| t - 1).collect();
        let system = System::new(model, self.state.simulation_box()?, positions, &types);
        system.compute(strategy)
    }

    fn integrate(&mut self, steps: usize, timestep: f64) -> Result<Pass> {
        let masses = self.state.atom_masses()?;
        let mut positions = self.state.positions.clone();
        let mut velocities = self.state.velocities.clone();
        let mut pass = self.pass(&positions)?;

        for _ in 0..steps {
            for i in 0..positions.len() {
                velocities[i] += pass.forces[i] * (0.5 * timestep * FTM2V / masses[i]);
                positions[i] += velocities[i] * timestep;
            }
            pass = self.pass(&positions)?;
            for i in 0..positions.len() {
                velocities[i] += pass.forces[i] * (0.5 * timestep * FTM2V / masses[i]);
            }
        }

        self.state.positions = positions;
        self.state.velocities = velocities;
        Ok(pass)
    }
}

impl Evaluator for PairEvaluator {
    fn name(&self) -> &str {
        "Reference pair model"
    }

    fn reset(&mut self) -> Result<()> {
        self.state = HostState::default();
        self.model = None;
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
        self.state.select_potential(selection)?;
        let model = ReferenceModel::load(&selection.artifact_path)?;
        self.model = Some(model.bind(&selection.type_names, selection.short_range_repulsion)?);
        debug!(
            "Reference model bound for {:?} ({})",
            selection.type_names, selection.strategy
        );
        Ok(())
    }

    fn set_integrator(&mut self, integrator: Option<Integrator>) -> Result<()> {
        self.state.integrator = integrator;
        Ok(())
    }

    fn run(&mut self, steps: usize) -> Result<()> {
        self.state.ready()?;
        let pass = if steps == 0 {
            let positions = self.state.positions.clone();
            self.pass(&positions)?
        } else {
            match self.state.integrator {
                Some(Integrator::Nve { timestep }) => self.integrate(steps, timestep)?,
                None => {
                    return Err(HarnessError::EvaluatorInit(format!(
                        "run({}) requested without an integrator",
                        steps
                    )))
                }
            }
        };

        let per_atom = self.state.has_accumulators().then(|| pass.per_atom.clone());
        self.state.record(pass.energy, pass.forces, per_atom);
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

/// Creates [`PairEvaluator`] instances.
#[derive(Debug, Default, Clone, Copy)]
pub struct PairEvaluatorFactory;

impl EvaluatorFactory for PairEvaluatorFactory {
    fn name(&self) -> &str {
        "reference"
    }

    fn create(&self) -> Result<Box<dyn Evaluator>> {
        Ok(Box::new(PairEvaluator::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> BoundModel {
        let mut table = PairTable::new(1);
        table.set(0, 0, MorseParams { depth: 1.0, alpha: 2.0, r0: 1.0 });
        BoundModel {
            cutoff: 4.0,
            table,
            atomic_energy: vec![-1.0],
            repulsion: Some(Repulsion { prefactor: 2.0, kappa: 1.5 }),
        }
    }

    #[test]
    fn pair_derivative_matches_difference_quotient() {
        let m = model();
        let h = 1e-6;
        for &r in &[0.6, 1.0, 1.7, 3.2, 3.9] {
            let (_, d) = m.pair(0, 0, r);
            let numeric = (m.pair(0, 0, r + h).0 - m.pair(0, 0, r - h).0) / (2.0 * h);
            assert!((d - numeric).abs() < 1e-6, "r={} analytic={} numeric={}", r, d, numeric);
        }
    }

    #[test]
    fn pair_vanishes_at_cutoff() {
        let m = model();
        let (phi, dphi) = m.pair(0, 0, 4.0);
        assert!(phi.abs() < 1e-12);
        assert!(dphi.abs() < 1e-12);
    }

    #[test]
    fn strategies_agree_on_a_periodic_dimer() {
        let m = model();
        let cell = SimulationBox::cube(5.0);
        let positions = vec![Point3::new(0.5, 0.5, 0.5), Point3::new(1.6, 0.7, 0.4)];
        let types = vec![0, 0];
        let system = System::new(&m, &cell, &positions, &types);

        let reference = system.compute(ExecutionStrategy::Default).unwrap();
        for strategy in ExecutionStrategy::ALL {
            let pass = system.compute(strategy).unwrap();
            assert!((pass.energy - reference.energy).abs() < 1e-10, "{}", strategy);
            for (a, b) in pass.forces.iter().zip(&reference.forces) {
                assert!((a - b).norm() < 1e-10, "{}", strategy);
            }
            let sum: f64 = pass.per_atom.iter().sum();
            assert!((sum - pass.energy).abs() < 1e-10);
        }
        // Newton's third law holds for a pair potential.
        let net = reference.forces[0] + reference.forces[1];
        assert!(net.norm() < 1e-10);
    }

    #[test]
    fn bundled_model_covers_water() {
        let model = ReferenceModel::bundled().unwrap();
        let names = vec!["H".to_string(), "O".to_string()];
        let bound = model.bind(&names, true).unwrap();
        assert_eq!(bound.atomic_energy.len(), 2);
        assert!(bound.repulsion.is_some());
        assert!(model.bind(&["N".to_string()], false).is_err());
    }

    #[test]
    fn coincident_atoms_are_an_evaluation_error() {
        let m = model();
        let cell = SimulationBox::cube(10.0);
        let positions = vec![Point3::new(1.0, 1.0, 1.0), Point3::new(1.0, 1.0, 1.0)];
        let types = vec![0, 0];
        let system = System::new(&m, &cell, &positions, &types);
        assert!(matches!(
            system.compute(ExecutionStrategy::Default),
            Err(HarnessError::Evaluation(_))
        ));
    }
}
