use nalgebra::{Point3, Vector3};
use crate::core::domain::SimulationBox;

/// Cartesian lattice translations whose images can fall within `cutoff` of the home cell.
///
/// Non-periodic axes contribute only the zero translation. The zero shift is
/// always first, which lets callers skip the self-interaction cheaply.
pub fn image_shifts(cell: &SimulationBox, cutoff: f64) -> Vec<Vector3<f64>> {
    let lengths = cell.lengths();
    let mut reach = [0i64; 3];
    for axis in 0..3 {
        if cell.periodic[axis] {
            // +1 covers atoms sitting anywhere inside the cell, not only at the origin.
            reach[axis] = (cutoff / lengths[axis]).ceil() as i64 + 1;
        }
    }

    let mut shifts = vec![Vector3::zeros()];
    for nx in -reach[0]..=reach[0] {
        for ny in -reach[1]..=reach[1] {
            for nz in -reach[2]..=reach[2] {
                if nx == 0 && ny == 0 && nz == 0 {
                    continue;
                }
                shifts.push(Vector3::new(
                    nx as f64 * lengths.x,
                    ny as f64 * lengths.y,
                    nz as f64 * lengths.z,
                ));
            }
        }
    }
    shifts
}

/// True when `shift` lies in the "upper" half-space (lexicographic order).
///
/// Used by half neighbour lists to count each self-image pair exactly once.
#[inline]
pub fn is_upper_shift(shift: &Vector3<f64>) -> bool {
    if shift.x != 0.0 {
        return shift.x > 0.0;
    }
    if shift.y != 0.0 {
        return shift.y > 0.0;
    }
    shift.z > 0.0
}

/// Moves a point into the primary cell along periodic axes.
///
/// **Invariant**: non-periodic axes are left untouched.
pub fn wrap(cell: &SimulationBox, p: &Point3<f64>) -> Point3<f64> {
    let lengths = cell.lengths();
    let mut out = *p;
    for axis in 0..3 {
        if cell.periodic[axis] {
            let offset = (p[axis] - cell.lo[axis]).rem_euclid(lengths[axis]);
            out[axis] = cell.lo[axis] + offset;
        }
    }
    out
}

/// Squared separation under the Minimum Image Convention.
#[inline]
pub fn distance_sq(p1: &Point3<f64>, p2: &Point3<f64>, cell: &SimulationBox) -> f64 {
    let lengths = cell.lengths();
    let mut d = p2 - p1;
    for axis in 0..3 {
        if cell.periodic[axis] {
            d[axis] -= lengths[axis] * (d[axis] / lengths[axis]).round();
        }
    }
    d.norm_squared()
}
