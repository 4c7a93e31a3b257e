//! Comparison tolerances and the calibrated values used by the scenario catalogue.
//!
//! Two acceptance rules are in use, and they are not interchangeable:
//!
//! | Mode | Passes when | Used for |
//! |------|-------------|----------|
//! | `Approx` | `|obs - exp| <= max(rel * |exp|, abs)` | scalar energies |
//! | `AllClose` | `|obs - exp| <= atol + rtol * |exp|` | force matrices |
//!
//! The catalogue values were calibrated empirically against the reference
//! models and are kept verbatim.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default relative bound of the `Approx` rule.
pub const APPROX_DEFAULT_REL: f64 = 1e-6;
/// Default absolute bound of the `Approx` rule.
pub const APPROX_DEFAULT_ABS: f64 = 1e-12;
/// Default relative bound of the `AllClose` rule.
pub const ALLCLOSE_DEFAULT_RTOL: f64 = 1e-5;
/// Default absolute bound of the `AllClose` rule.
pub const ALLCLOSE_DEFAULT_ATOL: f64 = 1e-8;

/// Finite-difference step (Å) balancing truncation against cancellation error.
pub const FD_STEP: f64 = 1e-4;

/// Cross-strategy agreement for energies and force components.
pub const STRATEGY_INVARIANCE_REL: f64 = 1e-4;
pub const STRATEGY_INVARIANCE_ABS: f64 = 1e-6;

/// Fresh re-runs of one cell must reproduce the energy to this level.
pub const DETERMINISM_REL: f64 = 1e-12;
pub const DETERMINISM_ABS: f64 = 1e-12;

/// How a tolerance is applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Tolerance {
    /// Larger of the relative and absolute bound. `rel: None` ignores the relative term.
    Approx { rel: Option<f64>, abs: f64 },
    /// Sum of absolute and relative bound.
    AllClose { rtol: f64, atol: f64 },
}

impl Default for Tolerance {
    fn default() -> Self {
        Self::approx()
    }
}

impl Tolerance {
    /// `Approx` with default bounds.
    pub const fn approx() -> Self {
        Self::Approx {
            rel: Some(APPROX_DEFAULT_REL),
            abs: APPROX_DEFAULT_ABS,
        }
    }

    pub const fn approx_rel_abs(rel: f64, abs: f64) -> Self {
        Self::Approx { rel: Some(rel), abs }
    }

    /// Absolute-only `Approx`: the relative term is not considered at all.
    pub const fn approx_abs(abs: f64) -> Self {
        Self::Approx { rel: None, abs }
    }

    pub const fn allclose(rtol: f64, atol: f64) -> Self {
        Self::AllClose { rtol, atol }
    }

    /// `AllClose` with the default relative bound.
    pub const fn allclose_atol(atol: f64) -> Self {
        Self::AllClose {
            rtol: ALLCLOSE_DEFAULT_RTOL,
            atol,
        }
    }

    pub const fn strategy_invariance() -> Self {
        Self::approx_rel_abs(STRATEGY_INVARIANCE_REL, STRATEGY_INVARIANCE_ABS)
    }

    pub const fn determinism() -> Self {
        Self::approx_rel_abs(DETERMINISM_REL, DETERMINISM_ABS)
    }

    /// Largest admissible deviation from `expected`.
    pub fn bound(&self, expected: f64) -> f64 {
        match *self {
            Self::Approx { rel, abs } => {
                let rel_bound = rel.map(|r| r * expected.abs()).unwrap_or(0.0);
                rel_bound.max(abs)
            }
            Self::AllClose { rtol, atol } => atol + rtol * expected.abs(),
        }
    }

    /// Non-finite values never pass.
    pub fn accepts(&self, observed: f64, expected: f64) -> bool {
        if !observed.is_finite() || !expected.is_finite() {
            return false;
        }
        (observed - expected).abs() <= self.bound(expected)
    }

    /// Ratio of the deviation to its bound; `<= 1.0` means accepted.
    pub fn excess(&self, observed: f64, expected: f64) -> f64 {
        let bound = self.bound(expected);
        let dev = (observed - expected).abs();
        if bound > 0.0 {
            dev / bound
        } else if dev == 0.0 {
            0.0
        } else {
            f64::INFINITY
        }
    }
}

impl fmt::Display for Tolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approx { rel: Some(r), abs } => write!(f, "approx(rel={:e}, abs={:e})", r, abs),
            Self::Approx { rel: None, abs } => write!(f, "approx(abs={:e})", abs),
            Self::AllClose { rtol, atol } => write!(f, "allclose(rtol={:e}, atol={:e})", rtol, atol),
        }
    }
}
