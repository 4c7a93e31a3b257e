use nalgebra::{Point3, Vector3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::core::spatial;
use crate::error::{HarnessError, Result};

/// Squared separation (Å²) below which two atoms count as coincident.
const MIN_SEPARATION_SQ: f64 = 1e-16;

// --- Physics Types ---

/// A declared atom type: chemical symbol and mass (g/mol).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Species {
    pub symbol: String,
    pub mass: f64,
}

impl Species {
    pub fn new(symbol: &str, mass: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            mass,
        }
    }
}

/// A single atom instance in a configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    /// 1-based type id, matching the evaluator's type numbering.
    pub type_id: usize,
    pub position: Point3<f64>,
}

/// Orthorhombic simulation cell with per-axis periodicity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationBox {
    pub lo: Point3<f64>,
    pub hi: Point3<f64>,
    pub periodic: [bool; 3],
}

impl SimulationBox {
    /// Fully periodic block spanning `[lo, hi]` on every axis.
    pub fn block(lo: f64, hi: f64) -> Self {
        Self {
            lo: Point3::new(lo, lo, lo),
            hi: Point3::new(hi, hi, hi),
            periodic: [true; 3],
        }
    }

    /// Fully periodic cube with one corner at the origin.
    pub fn cube(side: f64) -> Self {
        Self::block(0.0, side)
    }

    pub fn lengths(&self) -> Vector3<f64> {
        self.hi - self.lo
    }

    /// LAMMPS `boundary` letters, e.g. `p p f`.
    pub fn boundary_letters(&self) -> String {
        self.periodic
            .iter()
            .map(|&p| if p { "p" } else { "f" })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// --- The Core Entity ---

/// A fully specified atomic configuration, ready to be pushed into an evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    pub simulation_box: SimulationBox,
    /// Index `i` declares type id `i + 1`.
    pub species: Vec<Species>,
    pub atoms: Vec<Atom>,
    pub short_range_repulsion: bool,
}

impl Configuration {
    pub fn n_types(&self) -> usize {
        self.species.len()
    }

    pub fn n_atoms(&self) -> usize {
        self.atoms.len()
    }

    pub fn type_names(&self) -> Vec<String> {
        self.species.iter().map(|s| s.symbol.clone()).collect()
    }

    pub fn mass_of(&self, type_id: usize) -> Option<f64> {
        type_id
            .checked_sub(1)
            .and_then(|i| self.species.get(i))
            .map(|s| s.mass)
    }

    pub fn positions(&self) -> Vec<Point3<f64>> {
        self.atoms.iter().map(|a| a.position).collect()
    }

    /// Checks that every atom refers to a declared type, every coordinate is
    /// finite and no two atoms coincide.
    pub fn validate(&self) -> Result<()> {
        if self.species.is_empty() {
            return Err(HarnessError::InvalidConfiguration(
                "no atom types declared".to_string(),
            ));
        }
        if self.atoms.is_empty() {
            return Err(HarnessError::InvalidConfiguration(
                "configuration has no atoms".to_string(),
            ));
        }
        let lengths = self.simulation_box.lengths();
        if lengths.iter().any(|&l| !(l > 0.0)) {
            return Err(HarnessError::InvalidConfiguration(format!(
                "degenerate box with lengths {:?}",
                lengths.as_slice()
            )));
        }
        for (i, atom) in self.atoms.iter().enumerate() {
            if atom.type_id == 0 || atom.type_id > self.species.len() {
                return Err(HarnessError::ArityMismatch {
                    declared: self.species.len(),
                    found: atom.type_id,
                    context: format!("type id of atom {}", i),
                });
            }
            if atom.position.coords.iter().any(|c| !c.is_finite()) {
                return Err(HarnessError::InvalidConfiguration(format!(
                    "atom {} has a non-finite coordinate",
                    i
                )));
            }
        }
        let positions = self.positions();
        for i in 0..positions.len() {
            for j in (i + 1)..positions.len() {
                if spatial::distance_sq(&positions[i], &positions[j], &self.simulation_box)
                    < MIN_SEPARATION_SQ
                {
                    return Err(HarnessError::InvalidConfiguration(format!(
                        "atoms {} and {} coincide",
                        i, j
                    )));
                }
            }
        }
        for s in &self.species {
            if !(s.mass > 0.0) {
                return Err(HarnessError::InvalidConfiguration(format!(
                    "species {} has non-positive mass {}",
                    s.symbol, s.mass
                )));
            }
        }
        Ok(())
    }
}

// --- Builder ---

/// Composable configuration builder.
#[derive(Debug, Clone)]
pub struct ConfigurationBuilder {
    simulation_box: SimulationBox,
    species: Vec<Species>,
    atoms: Vec<Atom>,
    short_range_repulsion: bool,
    rattle: Option<(f64, u64)>,
}

impl ConfigurationBuilder {
    pub fn new(simulation_box: SimulationBox) -> Self {
        Self {
            simulation_box,
            species: Vec::new(),
            atoms: Vec::new(),
            short_range_repulsion: false,
            rattle: None,
        }
    }

    /// Declares the next atom type. The first call declares type 1.
    pub fn species(mut self, symbol: &str, mass: f64) -> Self {
        self.species.push(Species::new(symbol, mass));
        self
    }

    pub fn atom(mut self, type_id: usize, xyz: [f64; 3]) -> Self {
        self.atoms.push(Atom {
            type_id,
            position: Point3::new(xyz[0], xyz[1], xyz[2]),
        });
        self
    }

    pub fn periodic(mut self, periodic: [bool; 3]) -> Self {
        self.simulation_box.periodic = periodic;
        self
    }

    pub fn short_range_repulsion(mut self, enabled: bool) -> Self {
        self.short_range_repulsion = enabled;
        self
    }

    /// Displaces every atom uniformly within `[-amplitude, amplitude)` per axis.
    /// The same seed always gives the same displacements.
    pub fn rattle(mut self, amplitude: f64, seed: u64) -> Self {
        self.rattle = Some((amplitude, seed));
        self
    }

    pub fn build(self) -> Result<Configuration> {
        let mut atoms = self.atoms;

        if let Some((amplitude, seed)) = self.rattle {
            if !(amplitude > 0.0) || !amplitude.is_finite() {
                return Err(HarnessError::InvalidConfiguration(format!(
                    "rattle amplitude must be positive, got {}",
                    amplitude
                )));
            }
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            for atom in &mut atoms {
                atom.position.x += rng.gen_range(-amplitude..amplitude);
                atom.position.y += rng.gen_range(-amplitude..amplitude);
                atom.position.z += rng.gen_range(-amplitude..amplitude);
            }
        }

        let config = Configuration {
            simulation_box: self.simulation_box,
            species: self.species,
            atoms,
            short_range_repulsion: self.short_range_repulsion,
        };
        config.validate()?;
        Ok(config)
    }
}
