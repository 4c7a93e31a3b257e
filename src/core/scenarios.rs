use std::path::PathBuf;
use serde::{Deserialize, Serialize};

use crate::core::domain::{Configuration, ConfigurationBuilder, SimulationBox};
use crate::core::tolerances::{Tolerance, FD_STEP};
use crate::error::Result;

// --- Constants ---

pub const MACE_OFF23_SMALL: &str = "MACE-OFF23_small-1-8.json";
pub const MACE_OFF23_SMALL_URL: &str = "https://www.dropbox.com/scl/fi/zbg122s1zeeb1j6ogheok/MACE-OFF23_small-1-8.json?rlkey=mqb7cje9y3l0smwf75cfoahr7&st=iabk9093&dl=1";

pub const MACE_MP_0B3_MEDIUM: &str = "mace-mp-0b3-medium-1-8.json";
pub const MACE_MP_0B3_MEDIUM_URL: &str = "https://www.dropbox.com/scl/fi/ymzotmy9nw2lp7pvv2awc/mace-mp-0b3-medium-1-8.json?rlkey=3y2y42ieo79ekjwpt8zbfjgoe&st=91o13eux&dl=1";

/// Side of the 24-atom water cell (Å).
pub const WATER_BOX_SIDE: f64 = 6.2085633514918648;

// --- Artifact Descriptor ---

/// Where a parameter artifact comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSource {
    /// Downloaded on first use into the cache directory.
    Remote(String),
    /// Already on disk; never fetched.
    Local(PathBuf),
}

/// A named, opaque parameter file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    /// Cache key; also the file name inside the cache directory.
    pub file_name: String,
    pub source: ArtifactSource,
}

impl ArtifactSpec {
    pub fn remote(file_name: &str, url: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            source: ArtifactSource::Remote(url.to_string()),
        }
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self {
            file_name,
            source: ArtifactSource::Local(path),
        }
    }
}

// --- Scenario ---

/// Short NVE run performed before the outputs are read.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dynamics {
    pub steps: usize,
    /// Picoseconds.
    pub timestep: f64,
}

/// Reference energy recorded for a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnergyReference {
    pub value: f64,
    pub tolerance: Tolerance,
}

/// Finite-difference force check settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForceCheck {
    pub step: f64,
    pub tolerance: Tolerance,
}

/// What a scenario asserts once its outputs are available.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Expectations {
    pub energy: Option<EnergyReference>,
    pub per_atom_sum: bool,
    pub forces: Option<ForceCheck>,
}

/// A configuration plus the reference outputs it is checked against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub configuration: Configuration,
    pub artifact: ArtifactSpec,
    pub dynamics: Option<Dynamics>,
    pub expectations: Expectations,
}

impl Scenario {
    /// Rebinds the scenario to another parameter artifact.
    ///
    /// Recorded energies belong to the catalogue model, so they are dropped.
    pub fn with_artifact(mut self, artifact: ArtifactSpec) -> Self {
        if artifact != self.artifact {
            self.expectations.energy = None;
        }
        self.artifact = artifact;
        self
    }

    pub fn type_names(&self) -> Vec<String> {
        self.configuration.type_names()
    }
}

// --- Catalogue ---

/// Two hydrogens and one oxygen, isolated in a large periodic box.
pub fn h2o_triplet() -> Result<Scenario> {
    let configuration = ConfigurationBuilder::new(SimulationBox::block(-10.0, 10.0))
        .species("H", 1.008)
        .species("O", 15.999)
        .atom(1, [1.0, 0.0, 0.0])
        .atom(1, [0.0, 1.0, 0.0])
        .atom(2, [0.0, -2.0, 0.0])
        .build()?;

    Ok(Scenario {
        name: "h2o_triplet".to_string(),
        configuration,
        artifact: ArtifactSpec::remote(MACE_OFF23_SMALL, MACE_OFF23_SMALL_URL),
        dynamics: None,
        expectations: Expectations {
            energy: Some(EnergyReference {
                value: -2071.839005822318,
                tolerance: Tolerance::approx_rel_abs(1e-4, 1e-6),
            }),
            per_atom_sum: true,
            forces: Some(ForceCheck {
                step: FD_STEP,
                tolerance: Tolerance::allclose_atol(1e-5),
            }),
        },
    })
}

/// Compressed triplet probing the short-range repulsive correction.
pub fn h2o_zbl_triplet() -> Result<Scenario> {
    let configuration = ConfigurationBuilder::new(SimulationBox::block(-10.0, 10.0))
        .species("H", 1.008)
        .species("O", 15.999)
        .atom(1, [0.5, 0.0, 0.0])
        .atom(1, [0.0, 0.5, 0.0])
        .atom(2, [0.0, -0.5, 0.0])
        .short_range_repulsion(true)
        .build()?;

    Ok(Scenario {
        name: "h2o_zbl_triplet".to_string(),
        configuration,
        artifact: ArtifactSpec::remote(MACE_MP_0B3_MEDIUM, MACE_MP_0B3_MEDIUM_URL),
        dynamics: None,
        expectations: Expectations {
            energy: Some(EnergyReference {
                value: -5.003106904473648,
                tolerance: Tolerance::approx_abs(1e-3),
            }),
            per_atom_sum: true,
            forces: Some(ForceCheck {
                step: FD_STEP,
                tolerance: Tolerance::allclose(1e-4, 1e-6),
            }),
        },
    })
}

/// Builds the 8-molecule water lattice (24 atoms) used by [`water_box`].
pub fn water_lattice(builder: ConfigurationBuilder) -> ConfigurationBuilder {
    // O, H, H per molecule; molecules sit on a 2x2x2 grid with 3 Å spacing.
    const ORIGINS: [[f64; 3]; 8] = [
        [1.0, 1.0, 1.0],
        [4.0, 1.0, 1.0],
        [1.0, 4.0, 1.0],
        [1.0, 1.0, 4.0],
        [4.0, 4.0, 1.0],
        [4.0, 1.0, 4.0],
        [1.0, 4.0, 4.0],
        [4.0, 4.0, 4.0],
    ];
    let mut b = builder;
    for [x, y, z] in ORIGINS {
        b = b
            .atom(2, [x, y, z])
            .atom(1, [x + 1.0, y, z])
            .atom(1, [x, y + 1.0, z]);
    }
    b
}

/// Dense periodic water, advanced 10 NVE steps before checking.
pub fn water_box() -> Result<Scenario> {
    let builder = ConfigurationBuilder::new(SimulationBox::cube(WATER_BOX_SIDE))
        .species("H", 1.0079999997406976)
        .species("O", 15.998999995884349);
    let configuration = water_lattice(builder).build()?;

    Ok(Scenario {
        name: "water_box".to_string(),
        configuration,
        artifact: ArtifactSpec::remote(MACE_OFF23_SMALL, MACE_OFF23_SMALL_URL),
        dynamics: Some(Dynamics {
            steps: 10,
            timestep: 0.0001,
        }),
        expectations: Expectations {
            energy: Some(EnergyReference {
                value: -16649.98869252188,
                tolerance: Tolerance::approx_abs(1e-6),
            }),
            per_atom_sum: true,
            forces: None,
        },
    })
}

/// Seed and amplitude (Å) of the displacement applied by [`water_box_rattled`].
pub const WATER_RATTLE_SEED: u64 = 2024;
pub const WATER_RATTLE_AMPLITUDE: f64 = 0.05;

/// The water lattice pushed off its symmetric start, evaluated statically.
///
/// No energy was recorded for this geometry; it exercises the decomposition
/// and cross-strategy agreement on a configuration without lattice symmetry.
pub fn water_box_rattled() -> Result<Scenario> {
    let builder = ConfigurationBuilder::new(SimulationBox::cube(WATER_BOX_SIDE))
        .species("H", 1.0079999997406976)
        .species("O", 15.998999995884349);
    let configuration = water_lattice(builder)
        .rattle(WATER_RATTLE_AMPLITUDE, WATER_RATTLE_SEED)
        .build()?;

    Ok(Scenario {
        name: "water_box_rattled".to_string(),
        configuration,
        artifact: ArtifactSpec::remote(MACE_OFF23_SMALL, MACE_OFF23_SMALL_URL),
        dynamics: None,
        expectations: Expectations {
            energy: None,
            per_atom_sum: true,
            forces: None,
        },
    })
}

/// Every built-in scenario, in a stable order.
pub fn catalogue() -> Result<Vec<Scenario>> {
    Ok(vec![
        h2o_triplet()?,
        h2o_zbl_triplet()?,
        water_box()?,
        water_box_rattled()?,
    ])
}

/// Looks a built-in scenario up by name.
pub fn by_name(name: &str) -> Result<Option<Scenario>> {
    Ok(catalogue()?.into_iter().find(|s| s.name == name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_scenarios_are_valid() {
        let all = catalogue().unwrap();
        assert_eq!(all.len(), 4);
        for s in &all {
            s.configuration.validate().unwrap();
            assert_eq!(s.type_names(), vec!["H".to_string(), "O".to_string()]);
        }
    }

    #[test]
    fn water_box_has_eight_molecules() {
        let s = water_box().unwrap();
        let c = &s.configuration;
        assert_eq!(c.n_atoms(), 24);
        assert_eq!(c.atoms.iter().filter(|a| a.type_id == 2).count(), 8);
        assert_eq!(s.dynamics.map(|d| d.steps), Some(10));
        let side = c.simulation_box.lengths().x;
        assert!(c.atoms.iter().all(|a| a.position.coords.iter().all(|&x| x > 0.0 && x < side)));
    }

    #[test]
    fn rattled_water_leaves_the_lattice_but_stays_in_the_cell() {
        let plain = water_box().unwrap().configuration.positions();
        let rattled = water_box_rattled().unwrap().configuration.positions();
        assert_eq!(plain.len(), rattled.len());
        for (p, r) in plain.iter().zip(&rattled) {
            let d = *r - p;
            assert!(d.norm() > 0.0);
            assert!(d.iter().all(|x| x.abs() < WATER_RATTLE_AMPLITUDE));
        }
        assert_eq!(rattled, water_box_rattled().unwrap().configuration.positions());
    }

    #[test]
    fn every_scenario_checks_the_energy_decomposition() {
        assert!(catalogue().unwrap().iter().all(|s| s.expectations.per_atom_sum));
    }

    #[test]
    fn rebinding_the_artifact_drops_the_recorded_energy() {
        let s = h2o_triplet().unwrap().with_artifact(ArtifactSpec::local("/tmp/other.json"));
        assert!(s.expectations.energy.is_none());
        assert!(s.expectations.forces.is_some());
        assert_eq!(s.artifact.file_name, "other.json");
    }
}
