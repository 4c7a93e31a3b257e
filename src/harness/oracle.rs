//! Central-difference force oracle.
//!
//! For every coordinate the probe sequence is `+h`, `-2h`, `+h`, each followed
//! by a zero-step evaluation. The restore is the arithmetic inverse of the
//! probe, so the coordinate returns to its original value up to rounding,
//! and the trailing evaluation leaves the evaluator consistent with it.

use log::debug;
use nalgebra::Vector3;

use crate::engine::driver::EvaluatorSession;
use crate::error::{HarnessError, Result};

/// Numerical forces and restore bookkeeping from one sweep.
#[derive(Debug, Clone)]
pub struct OracleReport {
    /// `-dE/dx` per atom, eV/Å.
    pub forces: Vec<Vector3<f64>>,
    /// Largest `|x_restored - x_original|` seen in the sweep.
    pub max_restore_residual: f64,
    /// Coordinates whose restore drifted beyond [`rounding_bound`].
    pub restore_violations: usize,
    /// Zero-step evaluations issued.
    pub evaluations: usize,
}

/// Applies `+h`, `-2h`, `+h` to `x` exactly as the oracle does.
pub fn round_trip(x: f64, h: f64) -> f64 {
    let mut y = x;
    y += h;
    y -= 2.0 * h;
    y += h;
    y
}

/// Admissible restore residual for coordinate `x` probed with step `h`.
///
/// Three roundings, each at most half an ulp of a value no larger than `|x| + 2h`.
pub fn rounding_bound(x: f64, h: f64) -> f64 {
    2.0 * f64::EPSILON * (x.abs() + 2.0 * h)
}

fn validate_step(h: f64) -> Result<()> {
    if !h.is_finite() || h <= 0.0 {
        return Err(HarnessError::InvalidConfiguration(format!(
            "finite-difference step must be positive and finite, got {}",
            h
        )));
    }
    Ok(())
}

/// Estimates forces by central differences of the total energy.
///
/// Calls are strictly sequential: each probe is applied, evaluated and undone
/// before the next coordinate is touched.
pub fn finite_difference_forces(session: &mut EvaluatorSession, h: f64) -> Result<OracleReport> {
    validate_step(h)?;
    let original = session.positions()?;
    let n = session.n_atoms();

    let mut report = OracleReport {
        forces: vec![Vector3::zeros(); n],
        max_restore_residual: 0.0,
        restore_violations: 0,
        evaluations: 0,
    };

    for i in 0..n {
        for axis in 0..3 {
            let x0 = original[i][axis];

            session.displace(i, axis, h)?;
            session.evaluate()?;
            let e_plus = session.energy()?;

            session.displace(i, axis, -2.0 * h)?;
            session.evaluate()?;
            let e_minus = session.energy()?;

            let restored = session.displace(i, axis, h)?;
            session.evaluate()?;
            report.evaluations += 3;

            let residual = (restored - x0).abs();
            report.max_restore_residual = report.max_restore_residual.max(residual);
            if residual > rounding_bound(x0, h) {
                report.restore_violations += 1;
            }

            report.forces[i][axis] = -(e_plus - e_minus) / (2.0 * h);
        }
    }

    debug!(
        "Oracle swept {} coordinates ({} evaluations), max restore residual {:e}",
        3 * n,
        report.evaluations,
        report.max_restore_residual
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_stays_within_rounding() {
        for &x in &[0.0, 1.0, -2.0, 6.208_563_351_491_865, 1e-3, -9.999_9] {
            for &h in &[1e-4, 1e-3, 0.1] {
                let y = round_trip(x, h);
                assert!((y - x).abs() <= rounding_bound(x, h), "x={} h={} y={}", x, h, y);
            }
        }
    }

    #[test]
    fn round_trip_is_exact_for_representable_steps() {
        assert_eq!(round_trip(1.0, 0.5), 1.0);
        assert_eq!(round_trip(-2.0, 0.25), -2.0);
    }

    #[test]
    fn rejects_non_positive_steps() {
        assert!(validate_step(0.0).is_err());
        assert!(validate_step(-1e-4).is_err());
        assert!(validate_step(f64::NAN).is_err());
        assert!(validate_step(1e-4).is_ok());
    }
}
