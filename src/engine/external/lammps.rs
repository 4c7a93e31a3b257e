use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::ops::Range;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::{anyhow, bail, Context};
use log::{debug, trace};
use nalgebra::{Point3, Vector3};
use regex::Regex;
use tempfile::TempDir;

use crate::core::domain::SimulationBox;
use crate::engine::evaluator::{
    AccumulatorId, Evaluator, EvaluatorFactory, ExecutionStrategy, HostState, Integrator,
    PotentialSelection,
};
use crate::error::{HarnessError, Result};

const PAIR_STYLE: &str = "symmetrix/mace";
const DUMP_FILE: &str = "state.dump";
const ENERGY_TAG: &str = "@@PE";

/// Pair-style suffix selecting each execution strategy.
pub fn pair_style(strategy: ExecutionStrategy) -> String {
    match strategy {
        ExecutionStrategy::Default => PAIR_STYLE.to_string(),
        other => format!("{} {}", PAIR_STYLE, other.as_str()),
    }
}

/// Per-atom state parsed back from a LAMMPS dump.
#[derive(Debug, Clone)]
struct DumpFrame {
    positions: Vec<Point3<f64>>,
    velocities: Vec<Vector3<f64>>,
    forces: Vec<Vector3<f64>>,
    per_atom_energy: Option<Vec<f64>>,
}

/// Wrapper around a LAMMPS executable built with the symmetrix pair style.
///
/// State is staged on the host side; every `run` replays it into a fresh
/// LAMMPS process through stdin and reads the results back from the screen
/// output and a dump file in a private scratch directory.
pub struct LammpsEvaluator {
    executable: PathBuf,
    kokkos: bool,
    scratch: TempDir,
    state: HostState,
    energy_pattern: Regex,
}

impl LammpsEvaluator {
    /// Creates a new evaluator.
    ///
    /// # Arguments
    /// * `executable` - Path to the LAMMPS binary (e.g., "lmp").
    /// * `kokkos` - Run with `-k on -sf kk`.
    pub fn new(executable: impl Into<PathBuf>, kokkos: bool) -> Result<Self> {
        let scratch = tempfile::Builder::new().prefix("mlpot-lammps-").tempdir()?;
        let energy_pattern = Regex::new(&format!(r"(?m)^{}\s+(\S+)\s*$", ENERGY_TAG))
            .map_err(|e| HarnessError::EvaluatorInit(e.to_string()))?;
        Ok(Self {
            executable: executable.into(),
            kokkos,
            scratch,
            state: HostState::default(),
            energy_pattern,
        })
    }

    fn dump_path(&self) -> PathBuf {
        self.scratch.path().join(DUMP_FILE)
    }

    /// Constructs the LAMMPS input script for one run.
    fn generate_input(&self, steps: usize) -> anyhow::Result<String> {
        let cell = self.state.simulation_box()?;
        let potential = self.state.potential()?;
        let mut s = String::with_capacity(4096);

        // 1. Units & Box
        writeln!(s, "units metal")?;
        writeln!(s, "atom_style atomic")?;
        writeln!(s, "atom_modify map yes sort 0 0")?;
        writeln!(s, "boundary {}", cell.boundary_letters())?;
        writeln!(
            s,
            "region cell block {:.17e} {:.17e} {:.17e} {:.17e} {:.17e} {:.17e} units box",
            cell.lo.x, cell.hi.x, cell.lo.y, cell.hi.y, cell.lo.z, cell.hi.z
        )?;
        writeln!(s, "create_box {} cell", self.state.n_types)?;

        // 2. Atoms
        for (type_id, p) in self.state.type_ids.iter().zip(&self.state.positions) {
            writeln!(
                s,
                "create_atoms {} single {:.17e} {:.17e} {:.17e} units box remap yes",
                type_id, p.x, p.y, p.z
            )?;
        }
        for (i, mass) in self.state.masses.iter().enumerate() {
            if let Some(m) = mass {
                writeln!(s, "mass {} {:.17e}", i + 1, m)?;
            }
        }
        for (i, v) in self.state.velocities.iter().enumerate() {
            if v.norm_squared() > 0.0 {
                writeln!(
                    s,
                    "set atom {} vx {:.17e} vy {:.17e} vz {:.17e}",
                    i + 1,
                    v.x,
                    v.y,
                    v.z
                )?;
            }
        }

        // 3. Potential
        writeln!(s, "pair_style {}", pair_style(potential.strategy))?;
        writeln!(
            s,
            "pair_coeff * * {} {}",
            potential.artifact_path.display(),
            potential.type_names.join(" ")
        )?;

        // 4. Outputs
        let per_atom = self.state.has_accumulators();
        let mut columns = String::from("id type xu yu zu vx vy vz fx fy fz");
        if per_atom {
            writeln!(s, "compute peratom all pe/atom")?;
            columns.push_str(" c_peratom");
        }
        writeln!(
            s,
            "dump state all custom 1 {} {}",
            self.dump_path().display(),
            columns
        )?;
        writeln!(s, "dump_modify state sort id format float %.17g")?;
        writeln!(s, "thermo_style custom step pe")?;

        // 5. Integration
        if steps > 0 {
            match self.state.integrator {
                Some(Integrator::Nve { timestep }) => {
                    writeln!(s, "timestep {:.17e}", timestep)?;
                    writeln!(s, "fix integrate all nve")?;
                }
                None => bail!("run({}) requested without an integrator", steps),
            }
        }
        writeln!(s, "run {}", steps)?;
        writeln!(s, "print \"{} $(pe:%.17g)\"", ENERGY_TAG)?;

        Ok(s)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.executable);
        cmd.arg("-log").arg("none");
        if self.kokkos {
            cmd.args(["-k", "on", "-sf", "kk"]);
        }
        cmd.current_dir(self.scratch.path());
        cmd
    }

    /// Executes LAMMPS via stdin/stdout piping.
    fn run_process(&self, input_data: &str) -> anyhow::Result<String> {
        let mut child = self
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.executable.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input_data.as_bytes())
                .context("Failed to write to LAMMPS stdin")?;
        }

        let output = child
            .wait_with_output()
            .context("Failed to read LAMMPS output")?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();

        if !output.status.success() {
            let tail: Vec<&str> = stdout.lines().rev().take(5).collect();
            bail!(
                "LAMMPS exited with {}: {} {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim(),
                tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
            );
        }
        Ok(stdout)
    }

    fn parse_energy(&self, output: &str) -> anyhow::Result<f64> {
        let captures = self
            .energy_pattern
            .captures_iter(output)
            .last()
            .ok_or_else(|| anyhow!("Could not find {} line in LAMMPS output", ENERGY_TAG))?;
        captures[1]
            .parse::<f64>()
            .with_context(|| format!("Failed to parse energy '{}'", &captures[1]))
    }

    fn run_inner(&mut self, steps: usize) -> anyhow::Result<()> {
        let input = self.generate_input(steps)?;
        trace!("LAMMPS input:\n{}", input);
        let stdout = self.run_process(&input)?;
        let energy = self.parse_energy(&stdout)?;

        let dump = fs::read_to_string(self.dump_path()).context("Failed to read LAMMPS dump")?;
        let per_atom = self.state.has_accumulators();
        let frame = parse_last_frame(&dump, self.state.type_ids.len(), per_atom)?;

        self.state.positions = frame.positions;
        self.state.velocities = frame.velocities;
        self.state.record(energy, frame.forces, frame.per_atom_energy);
        debug!("LAMMPS run({}) finished, pe = {}", steps, energy);
        Ok(())
    }
}

/// Reads the final `ITEM: ATOMS` block of a custom dump sorted by id.
fn parse_last_frame(dump: &str, n_atoms: usize, per_atom: bool) -> anyhow::Result<DumpFrame> {
    let lines: Vec<&str> = dump.lines().collect();
    let header = lines
        .iter()
        .rposition(|l| l.starts_with("ITEM: ATOMS"))
        .ok_or_else(|| anyhow!("Dump file has no ATOMS section"))?;
    let columns: Vec<&str> = lines[header]
        .trim_start_matches("ITEM: ATOMS")
        .split_whitespace()
        .collect();
    let col = |name: &str| {
        columns
            .iter()
            .position(|c| *c == name)
            .ok_or_else(|| anyhow!("Dump is missing column '{}'", name))
    };

    let pos = [col("xu")?, col("yu")?, col("zu")?];
    let vel = [col("vx")?, col("vy")?, col("vz")?];
    let frc = [col("fx")?, col("fy")?, col("fz")?];
    let pe = if per_atom { Some(col("c_peratom")?) } else { None };

    let rows = &lines[header + 1..];
    if rows.len() < n_atoms {
        bail!("Dump has {} atom rows, expected {}", rows.len(), n_atoms);
    }

    let mut frame = DumpFrame {
        positions: Vec::with_capacity(n_atoms),
        velocities: Vec::with_capacity(n_atoms),
        forces: Vec::with_capacity(n_atoms),
        per_atom_energy: pe.map(|_| Vec::with_capacity(n_atoms)),
    };
    for (row, line) in rows.iter().take(n_atoms).enumerate() {
        let values: Vec<f64> = line
            .split_whitespace()
            .map(|t| t.parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .with_context(|| format!("Malformed dump row {}: '{}'", row, line))?;
        if values.len() != columns.len() {
            bail!("Dump row {} has {} fields, expected {}", row, values.len(), columns.len());
        }
        frame.positions.push(Point3::new(values[pos[0]], values[pos[1]], values[pos[2]]));
        frame.velocities.push(Vector3::new(values[vel[0]], values[vel[1]], values[vel[2]]));
        frame.forces.push(Vector3::new(values[frc[0]], values[frc[1]], values[frc[2]]));
        if let (Some(c), Some(out)) = (pe, frame.per_atom_energy.as_mut()) {
            out.push(values[c]);
        }
    }
    Ok(frame)
}

impl Evaluator for LammpsEvaluator {
    fn name(&self) -> &str {
        "LAMMPS (Pipe)"
    }

    fn reset(&mut self) -> Result<()> {
        self.state = HostState::default();
        let dump = self.dump_path();
        if dump.exists() {
            fs::remove_file(dump)?;
        }
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
        if !selection.artifact_path.is_file() {
            return Err(HarnessError::ArtifactUnavailable {
                name: selection.artifact_path.display().to_string(),
                reason: "model file missing at selection time".to_string(),
            });
        }
        self.state.select_potential(selection)
    }

    fn set_integrator(&mut self, integrator: Option<Integrator>) -> Result<()> {
        self.state.integrator = integrator;
        Ok(())
    }

    fn run(&mut self, steps: usize) -> Result<()> {
        self.state.ready()?;
        self.run_inner(steps)
            .map_err(|e| HarnessError::Evaluation(format!("{:#}", e)))
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

/// Creates [`LammpsEvaluator`] instances, each with its own scratch directory.
#[derive(Debug, Clone)]
pub struct LammpsEvaluatorFactory {
    executable: PathBuf,
    kokkos: bool,
}

impl LammpsEvaluatorFactory {
    pub fn new(executable: impl Into<PathBuf>, kokkos: bool) -> Self {
        Self {
            executable: executable.into(),
            kokkos,
        }
    }
}

impl EvaluatorFactory for LammpsEvaluatorFactory {
    fn name(&self) -> &str {
        "lammps"
    }

    fn create(&self) -> Result<Box<dyn Evaluator>> {
        Ok(Box::new(LammpsEvaluator::new(&self.executable, self.kokkos)?))
    }
}
