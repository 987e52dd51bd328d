//! Triclinic geometry for the decomposition grid
//!
//! The box is a lower-triangular matrix whose row `d` is box vector `d`.
//! For every decomposed dimension we derive two things from the off-diagonal
//! elements:
//!
//! - **Skew factor**: the scalar that converts the thickness of a slab
//!   perpendicular to dimension `d` into real distance. Computed by
//!   Gram-Schmidt over the normalized higher box vectors; the components
//!   lost along `d` reduce the factor below 1.
//! - **Correction matrix** `tcm`: projects a point onto dimension `d`'s
//!   axis as `p[d] + Σ_{k>d} p[k]·tcm[(k, d)]`, which turns cell-boundary
//!   comparisons in triclinic space into plain interval tests.
//!
//! Periodic wrapping of a charge group shifts its center and every member
//! atom by whole box vectors; the helpers here operate on one box row.

use thiserror::Error;

use crate::{BoxMatrix, IVec, Rvec, DIM};

/// Axis letter for diagnostics.
#[inline]
pub fn dim_char(d: usize) -> char {
    match d {
        0 => 'X',
        1 => 'Y',
        2 => 'Z',
        _ => '?',
    }
}

/// Box vector `d` as a coordinate vector.
#[inline]
pub fn box_row(boxm: &BoxMatrix, d: usize) -> Rvec {
    Rvec::new(boxm[(d, 0)], boxm[(d, 1)], boxm[(d, 2)])
}

/// Errors raised while analysing the box against the grid.
#[derive(Debug, Error)]
pub enum GeometryError {
    /// A box vector has an off-diagonal component in a direction that is
    /// decomposed while its own direction is not; the engine cannot wrap
    /// groups consistently in that configuration.
    #[error(
        "domain decomposition is not supported for box vectors with non-zero components in \
         directions that do not use domain decomposition: ncells = {nc:?}, box vector[{j}] = \
         {bv:?}"
    )]
    TriclinicUnsupported {
        /// Cell counts per Cartesian dimension.
        nc: IVec,
        /// Index of the offending box vector.
        j: usize,
        /// The offending box vector.
        bv: [f64; DIM],
    },
}

/// Per-dimension triclinic data derived from the current box.
#[derive(Clone, Debug)]
pub struct TricSetup {
    /// Whether dimension `d` has off-diagonal contributions from above.
    pub tric_dir: [bool; DIM],
    /// Slab-thickness conversion factor per dimension (1 when rectangular).
    pub skew_fac: [f64; DIM],
    /// Orthogonalized unit-diagonal box vectors per dimension; for
    /// dimension `d` only entries `d+1..DIM` are meaningful.
    pub v: [[Rvec; DIM]; DIM],
}

/// Analyse the box: triclinic directions, skew factors and the orthogonal
/// basis vectors used in halo distance checks.
pub fn set_tric_dir(nc: &IVec, boxm: &BoxMatrix) -> Result<TricSetup, GeometryError> {
    let mut setup = TricSetup {
        tric_dir: [false; DIM],
        skew_fac: [1.0; DIM],
        v: [[Rvec::zeros(); DIM]; DIM],
    };

    for d in 0..DIM {
        for j in d + 1..DIM {
            if boxm[(j, d)] != 0.0 {
                setup.tric_dir[d] = true;
                if nc[j] > 1 && nc[d] == 1 {
                    let bv = [boxm[(j, 0)], boxm[(j, 1)], boxm[(j, 2)]];
                    return Err(GeometryError::TriclinicUnsupported { nc: *nc, j, bv });
                }
            }
        }

        // Convert box vectors to orthogonal vectors for this dimension and
        // set the skewing factor that translates the thickness of a slab
        // perpendicular to this dimension into real distance.
        if setup.tric_dir[d] {
            let mut skew_fac2 = 1.0;
            let v = &mut setup.v[d];
            if d < 2 {
                // Normalize such that the "diagonal" is 1.
                v[d + 1] = box_row(boxm, d + 1) / boxm[(d + 1, d + 1)];
                for i in 0..d {
                    v[d + 1][i] = 0.0;
                }
                skew_fac2 -= v[d + 1][d] * v[d + 1][d];
                if d == 0 {
                    v[d + 2] = box_row(boxm, d + 2) / boxm[(d + 2, d + 2)];
                    for i in 0..d {
                        v[d + 2][i] = 0.0;
                    }
                    // Make vector d+2 perpendicular to vector d+1; this
                    // does not affect the normalization.
                    let dep = v[d + 1].dot(&v[d + 2]) / v[d + 1].norm_squared();
                    let v1 = v[d + 1];
                    v[d + 2] -= dep * v1;
                    skew_fac2 -= v[d + 2][d] * v[d + 2][d];
                }
            }
            setup.skew_fac[d] = skew_fac2.sqrt();
        }
    }

    Ok(setup)
}

/// The triclinic correction matrix, recomputed once per box change.
pub fn tric_corr_matrix(boxm: &BoxMatrix) -> BoxMatrix {
    let mut tcm = BoxMatrix::zeros();
    tcm[(1, 0)] = -boxm[(1, 0)] / boxm[(1, 1)];
    if boxm[(2, 2)] > 0.0 {
        tcm[(2, 0)] = -(boxm[(2, 1)] * tcm[(1, 0)] + boxm[(2, 0)]) / boxm[(2, 2)];
        tcm[(2, 1)] = -boxm[(2, 1)] / boxm[(2, 2)];
    }
    tcm
}

/// Project `p` onto dimension `d`'s axis using the correction matrix.
#[inline]
pub fn projected_coord(p: &Rvec, d: usize, tcm: &BoxMatrix) -> f64 {
    let mut pos = p[d];
    for k in d + 1..DIM {
        pos += p[k] * tcm[(k, d)];
    }
    pos
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxm(rows: [[f64; 3]; 3]) -> BoxMatrix {
        BoxMatrix::from_fn(|r, c| rows[r][c])
    }

    #[test]
    fn rectangular_box_is_trivial() {
        let b = boxm([[10.0, 0.0, 0.0], [0.0, 8.0, 0.0], [0.0, 0.0, 6.0]]);
        let t = set_tric_dir(&[2, 2, 1], &b).unwrap();
        assert_eq!(t.tric_dir, [false; 3]);
        assert_eq!(t.skew_fac, [1.0; 3]);
        assert_eq!(tric_corr_matrix(&b), BoxMatrix::zeros());
    }

    #[test]
    fn skew_factor_from_yx_component() {
        // box vector y has an x component: x slabs are skewed.
        let b = boxm([[10.0, 0.0, 0.0], [2.0, 10.0, 0.0], [0.0, 0.0, 10.0]]);
        let t = set_tric_dir(&[3, 1, 1], &b).unwrap();
        assert!(t.tric_dir[0] && !t.tric_dir[1]);
        let expect = (1.0f64 - 0.04).sqrt();
        assert!((t.skew_fac[0] - expect).abs() < 1e-12);
        // The orthogonal vector for dimension x is the normalized y row.
        assert!((t.v[0][1] - Rvec::new(0.2, 1.0, 0.0)).norm() < 1e-12);

        let tcm = tric_corr_matrix(&b);
        assert!((tcm[(1, 0)] + 0.2).abs() < 1e-12);
        // A point on the skewed cell wall projects onto the wall coordinate.
        let p = Rvec::new(5.0 + 0.2 * 3.0, 3.0, 0.0);
        assert!((projected_coord(&p, 0, &tcm) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn decomposed_direction_under_skew_is_rejected() {
        // y has an x component while x is not decomposed but y is.
        let b = boxm([[10.0, 0.0, 0.0], [2.0, 10.0, 0.0], [0.0, 0.0, 10.0]]);
        let err = set_tric_dir(&[1, 2, 1], &b).unwrap_err();
        match err {
            GeometryError::TriclinicUnsupported { j, .. } => assert_eq!(j, 1),
        }
    }

    #[test]
    fn gram_schmidt_keeps_z_perpendicular() {
        let b = boxm([[10.0, 0.0, 0.0], [3.0, 9.0, 0.0], [2.0, 4.0, 8.0]]);
        let t = set_tric_dir(&[2, 2, 2], &b).unwrap();
        // v[0][2] must be orthogonal to v[0][1] after the projection step.
        let dot = t.v[0][1].dot(&t.v[0][2]);
        assert!(dot.abs() < 1e-12);
        assert!(t.skew_fac[0] < 1.0 && t.skew_fac[1] < 1.0);
        assert_eq!(t.skew_fac[2], 1.0);
    }
}
