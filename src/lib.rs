//! Differential consistency harness for machine-learned interatomic potentials.
//!
//! - [`core`]: configurations, scenario catalogue and tolerance semantics.
//! - [`engine`]: the evaluator control surface, its backends (LAMMPS process
//!   wrapper and an in-process reference pair model) and the artifact cache.
//! - [`harness`]: finite-difference oracle, consistency checks and the
//!   scenario × strategy matrix runner.

pub mod core;
pub mod engine;
pub mod error;
pub mod harness;
