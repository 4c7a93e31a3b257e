use std::fmt;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::core::scenarios::EnergyReference;
use crate::core::tolerances::Tolerance;
use crate::harness::oracle::OracleReport;

/// What a check compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    Energy,
    PerAtomSum,
    Forces,
    RestoreResidual,
    StrategyEnergy,
    StrategyForces,
    Determinism,
}

impl Quantity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Energy => "energy",
            Self::PerAtomSum => "per_atom_sum",
            Self::Forces => "forces",
            Self::RestoreResidual => "restore_residual",
            Self::StrategyEnergy => "strategy_energy",
            Self::StrategyForces => "strategy_forces",
            Self::Determinism => "determinism",
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single consistency check with result tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Check {
    /// Human-readable label
    pub label: String,
    pub quantity: Quantity,
    /// Observed value (worst component for matrices)
    pub observed: f64,
    /// Expected value (worst component for matrices)
    pub expected: f64,
    /// Tolerance used; `None` for exact bounds
    pub tolerance: Option<Tolerance>,
    pub passed: bool,
    /// (atom, axis) of the worst component for matrix checks
    pub worst_index: Option<(usize, usize)>,
}

/// Accumulates checks for one cell or one scenario.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[must_use]
pub struct CheckSet {
    pub checks: Vec<Check>,
}

impl CheckSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scalar comparison under `tolerance`.
    pub fn check_scalar(
        &mut self,
        label: &str,
        quantity: Quantity,
        observed: f64,
        expected: f64,
        tolerance: Tolerance,
    ) -> bool {
        let passed = tolerance.accepts(observed, expected);
        self.checks.push(Check {
            label: label.to_string(),
            quantity,
            observed,
            expected,
            tolerance: Some(tolerance),
            passed,
            worst_index: None,
        });
        passed
    }

    /// Total energy against the scenario's recorded reference.
    pub fn check_energy(&mut self, observed: f64, reference: &EnergyReference) -> bool {
        self.check_scalar(
            "total energy vs reference",
            Quantity::Energy,
            observed,
            reference.value,
            reference.tolerance,
        )
    }

    /// Total energy against the sum of the per-atom decomposition.
    pub fn check_per_atom_sum(&mut self, total: f64, per_atom: &[f64]) -> bool {
        let sum: f64 = per_atom.iter().sum();
        self.check_scalar(
            "total energy vs sum of per-atom energies",
            Quantity::PerAtomSum,
            total,
            sum,
            Tolerance::approx(),
        )
    }

    /// Element-wise comparison of two force matrices; records the worst component.
    pub fn check_forces(
        &mut self,
        label: &str,
        quantity: Quantity,
        observed: &[Vector3<f64>],
        expected: &[Vector3<f64>],
        tolerance: Tolerance,
    ) -> bool {
        if observed.len() != expected.len() {
            self.checks.push(Check {
                label: format!("{} (row count {} vs {})", label, observed.len(), expected.len()),
                quantity,
                observed: observed.len() as f64,
                expected: expected.len() as f64,
                tolerance: None,
                passed: false,
                worst_index: None,
            });
            return false;
        }

        let mut passed = true;
        let mut worst = (0, 0);
        let mut worst_excess = f64::NEG_INFINITY;
        for (i, (o, e)) in observed.iter().zip(expected).enumerate() {
            for axis in 0..3 {
                passed &= tolerance.accepts(o[axis], e[axis]);
                let mut excess = tolerance.excess(o[axis], e[axis]);
                if excess.is_nan() {
                    excess = f64::INFINITY;
                }
                if excess > worst_excess {
                    worst_excess = excess;
                    worst = (i, axis);
                }
            }
        }

        let (observed_worst, expected_worst) = if observed.is_empty() {
            (0.0, 0.0)
        } else {
            (observed[worst.0][worst.1], expected[worst.0][worst.1])
        };
        self.checks.push(Check {
            label: label.to_string(),
            quantity,
            observed: observed_worst,
            expected: expected_worst,
            tolerance: Some(tolerance),
            passed,
            worst_index: (!observed.is_empty()).then_some(worst),
        });
        passed
    }

    /// Analytic forces against the finite-difference oracle.
    pub fn check_oracle(
        &mut self,
        analytic: &[Vector3<f64>],
        oracle: &OracleReport,
        tolerance: Tolerance,
    ) -> bool {
        let forces = self.check_forces(
            "analytic vs finite-difference forces",
            Quantity::Forces,
            analytic,
            &oracle.forces,
            tolerance,
        );

        let restored = oracle.restore_violations == 0;
        self.checks.push(Check {
            label: format!(
                "probe restore residual ({} coordinates beyond rounding)",
                oracle.restore_violations
            ),
            quantity: Quantity::RestoreResidual,
            observed: oracle.max_restore_residual,
            expected: 0.0,
            tolerance: None,
            passed: restored,
            worst_index: None,
        });
        forces && restored
    }

    /// Number of checks that passed.
    pub fn passed_count(&self) -> usize {
        self.checks.iter().filter(|c| c.passed).count()
    }

    pub fn total_count(&self) -> usize {
        self.checks.len()
    }

    /// Whether all checks passed.
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let icon = if self.passed { "PASS" } else { "FAIL" };
        write!(
            f,
            "[{}] {}: observed={:.12e} expected={:.12e}",
            icon, self.label, self.observed, self.expected
        )?;
        if let Some(tol) = &self.tolerance {
            write!(f, " {}", tol)?;
        }
        if let Some((atom, axis)) = self.worst_index {
            write!(f, " worst=(atom {}, axis {})", atom, axis)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_atom_sum_uses_default_approx() {
        let mut set = CheckSet::new();
        assert!(set.check_per_atom_sum(-3.0, &[-1.0, -1.0, -1.0]));
        assert!(!set.check_per_atom_sum(-3.0, &[-1.0, -1.0, -1.1]));
        assert_eq!(set.passed_count(), 1);
        assert_eq!(set.total_count(), 2);
    }

    #[test]
    fn force_check_reports_worst_component() {
        let analytic = vec![Vector3::new(1.0, 2.0, 3.0), Vector3::new(-1.0, 0.0, 0.5)];
        let mut oracle = analytic.clone();
        oracle[1].z += 1e-3;

        let mut set = CheckSet::new();
        let ok = set.check_forces(
            "forces",
            Quantity::Forces,
            &analytic,
            &oracle,
            Tolerance::allclose_atol(1e-5),
        );
        assert!(!ok);
        assert_eq!(set.checks[0].worst_index, Some((1, 2)));
        assert_eq!(set.checks[0].observed, 0.5);
    }

    #[test]
    fn worst_index_is_reported_for_passing_matrices_too() {
        let a = vec![Vector3::new(1.0, 1.0, 1.0)];
        let mut b = a.clone();
        b[0].y += 1e-9;
        let mut set = CheckSet::new();
        assert!(set.check_forces("f", Quantity::Forces, &a, &b, Tolerance::allclose_atol(1e-5)));
        assert_eq!(set.checks[0].worst_index, Some((0, 1)));
    }

    #[test]
    fn mismatched_row_counts_fail() {
        let a = vec![Vector3::zeros(); 2];
        let b = vec![Vector3::zeros(); 3];
        let mut set = CheckSet::new();
        assert!(!set.check_forces("f", Quantity::Forces, &a, &b, Tolerance::approx()));
    }
}
