//! Cell boundaries: static sizing and the dynamic load-balancing controller
//!
//! Static sizing (SLB) places boundaries uniformly or from user-supplied
//! relative fractions and derives the number of communication *pulses* per
//! dimension: the smallest pulse count whose combined cell span covers the
//! cut-off. Dynamic sizing (DLB) runs on the *row root* of each decomposed
//! dimension in outer→inner order: it proposes new cell sizes from the
//! measured load with under-relaxation, enforces the geometric minimum by
//! iterated rescaling with pinning, constrains boundaries against the
//! staggered neighbor rows, and broadcasts the resulting fraction row.
//!
//! The broadcast row layout is `[cell_f[0..=nc] | f0,f1 pairs of the lower
//! dimensions | pme max-shift]`; every row member reads its own slice plus
//! the lower-dimension snapshots from the trailing region.
//!
//! A boundary that moves more than half a cell between two redistributions
//! would let charge groups skip a rank; [`DomDec::check_grid_jump`] turns
//! that into a hard error rather than corrupt a trajectory.

use thiserror::Error;
use tracing::{debug, warn};

use crate::comm::Direction;
use crate::geometry::{dim_char, set_tric_dir};
use crate::grid::SetupError;
use crate::partition::DomDec;
use crate::{IVec, BoxMatrix, CELL_MARGIN, CELL_MARGIN2, DIM, PRES_SCALE_MARGIN};

/// Geometric sizing errors. All of these abort the run: silently continuing
/// with an infeasible grid would corrupt the trajectory.
#[derive(Debug, Error)]
pub enum CellSizeError {
    /// The box cannot hold the requested cells at the minimum size.
    #[error(
        "the {dim}-size of the box ({box_len}) times the triclinic skew factor ({skew}) is \
         smaller than the number of decomposition cells ({nc}) times the smallest allowed cell \
         size ({limit})"
    )]
    BoxTooSmall {
        /// Axis letter.
        dim: char,
        /// Box length along the axis.
        box_len: f64,
        /// Triclinic skew factor of the axis.
        skew: f64,
        /// Requested cell count along the axis.
        nc: usize,
        /// Smallest allowed cell size.
        limit: f64,
    },
    /// A cell would receive its own groups back over the periodic
    /// boundary.
    #[error(
        "the box size in direction {dim} ({box_len}) times the triclinic skew factor ({skew}) is \
         too small for a cut-off of {cutoff} with {nc} decomposition cells, use 1 or more than \
         {nc} cells or increase the box size in this direction"
    )]
    CutoffTooLarge {
        /// Axis letter.
        dim: char,
        /// Box length along the axis.
        box_len: f64,
        /// Triclinic skew factor of the axis.
        skew: f64,
        /// The pair cut-off in effect.
        cutoff: f64,
        /// Requested cell count along the axis.
        nc: usize,
    },
    /// The minimum cell sizes of a row do not fit into the box.
    #[error(
        "step {step}: the dynamic load balancing could not balance dimension {dim}: box size \
         {box_len}, triclinic skew factor {skew}, #cells {nc}, minimum cell size {min_size}"
    )]
    CannotBalance {
        /// Step at which balancing failed.
        step: i64,
        /// Axis letter.
        dim: char,
        /// Box length along the axis.
        box_len: f64,
        /// Triclinic skew factor of the axis.
        skew: f64,
        /// Cell count of the row.
        nc: usize,
        /// Minimum cell size in effect.
        min_size: f64,
    },
    /// A boundary moved more than the jump limit between redistributions.
    #[error(
        "step {step}: the domain decomposition grid has shifted too much in the {dim}-direction \
         around cell {ci:?}"
    )]
    GridJump {
        /// Step at which the shift was detected.
        step: i64,
        /// Axis letter.
        dim: char,
        /// Grid coordinate of the offending cell.
        ci: IVec,
    },
    /// A balanced cell ended up below the smallest allowed size.
    #[error(
        "step {step}: the {dim}-size ({size}) times the triclinic skew factor ({skew}) is smaller \
         than the smallest allowed cell size ({min_size}) for decomposition grid cell {ci:?}"
    )]
    CellTooSmall {
        /// Step at which the cell was sized.
        step: i64,
        /// Axis letter.
        dim: char,
        /// The offending cell size.
        size: f64,
        /// Triclinic skew factor of the axis.
        skew: f64,
        /// Smallest allowed cell size.
        min_size: f64,
        /// Grid coordinate of the offending cell.
        ci: IVec,
    },
    /// Box analysis failed.
    #[error(transparent)]
    Geometry(#[from] crate::geometry::GeometryError),
}

// ============================================================================
// Row-root balancing state
// ============================================================================

/// Dynamic-balancing state held by the root rank of one dimension row.
#[derive(Clone, Debug)]
pub struct RowRoot {
    /// Normalized boundaries, plus the trailing broadcast region.
    pub cell_f: Vec<f64>,
    /// Boundaries before the current update, for the halfway constraint.
    pub old_cell_f: Vec<f64>,
    /// Per-cell target sizes carried between updates.
    pub cell_size: Vec<f64>,
    /// Cells pinned at the minimum size during rescaling.
    pub cell_min: Vec<bool>,
    /// Per-cell upper staggering extremes gathered with the load.
    pub cell_f_max0: Vec<f64>,
    /// Per-cell lower staggering extremes gathered with the load.
    pub cell_f_min1: Vec<f64>,
    /// Lower boundary limits derived from the neighbor rows.
    pub bound_min: Vec<f64>,
    /// Upper boundary limits derived from the neighbor rows.
    pub bound_max: Vec<f64>,
    /// Whether the last update hit a geometric limit.
    pub limited: bool,
}

impl RowRoot {
    /// Fresh state for a row of `nc` cells whose broadcast region holds
    /// `row_len` values; boundaries start uniform.
    pub fn new(nc: usize, row_len: usize) -> Self {
        let mut cell_f = vec![0.0; row_len];
        for (i, f) in cell_f.iter_mut().enumerate().take(nc + 1) {
            *f = i as f64 / nc as f64;
        }
        Self {
            cell_f,
            old_cell_f: vec![0.0; nc + 1],
            cell_size: vec![1.0 / nc as f64; nc],
            cell_min: vec![false; nc],
            cell_f_max0: vec![0.0; nc],
            cell_f_min1: vec![0.0; nc],
            bound_min: vec![0.0; nc],
            bound_max: vec![0.0; nc],
            limited: false,
        }
    }
}

/// Scalar inputs of one row update.
#[derive(Clone, Debug)]
pub struct RowBalance<'a> {
    /// Number of cells in the row.
    pub nc: usize,
    /// Reset towards uniform sizes instead of following the load.
    pub uniform: bool,
    /// Measured per-cell loads; empty when no load has been recorded
    /// since the last update.
    pub loads: &'a [f64],
    /// Row average of `loads`.
    pub load_aver: f64,
    /// Fractional minimum cell size (margin and skew applied).
    pub cellsize_limit_f: f64,
    /// Fractional minimum boundary separation against neighbor rows.
    pub dist_min_f: f64,
    /// Apply the staggering constraints (inner dimensions only).
    pub stagger: bool,
    /// Step number, for diagnostics.
    pub step: i64,
    /// Cartesian dimension of the row, for diagnostics.
    pub dim: usize,
    /// Box length along the dimension.
    pub box_len: f64,
    /// Triclinic skew factor of the dimension.
    pub skew: f64,
    /// Minimum cell size in real distance, for diagnostics.
    pub cellsize_min: f64,
}

/// One dynamic-balancing update of a boundary row. Mutates `root` in place;
/// on success the boundaries are strictly monotone with exact endpoints.
pub fn balance_row(root: &mut RowRoot, p: &RowBalance<'_>) -> Result<(), CellSizeError> {
    const CHANGE_MAX: f64 = 0.05;
    const RELAX: f64 = 0.5;
    let nc = p.nc;

    root.old_cell_f[..nc + 1].copy_from_slice(&root.cell_f[..nc + 1]);

    if p.uniform {
        for s in root.cell_size.iter_mut() {
            *s = 1.0 / nc as f64;
        }
    } else if !p.loads.is_empty() {
        for i in 0..nc {
            // Relative imbalance of cell i, applied with under-relaxation
            // and a cap on the per-step change.
            let imbalance = (p.loads[i] - p.load_aver) / p.load_aver;
            let change = (-RELAX * imbalance).clamp(-CHANGE_MAX, CHANGE_MAX);
            root.cell_size[i] *= 1.0 + change;
        }
    }

    if p.stagger && !p.uniform {
        // Keep each boundary between the staggering extremes of the rows it
        // separates, with half the remaining space as slack.
        for i in 1..nc {
            root.bound_min[i] = root.cell_f_max0[i - 1] + p.dist_min_f;
            let space = root.cell_f[i] - (root.cell_f_max0[i - 1] + p.dist_min_f);
            if space > 0.0 {
                root.bound_min[i] += 0.5 * space;
            }
            root.bound_max[i] = root.cell_f_min1[i] - p.dist_min_f;
            let space = root.cell_f[i] - (root.cell_f_min1[i] - p.dist_min_f);
            if space < 0.0 {
                root.bound_max[i] += 0.5 * space;
            }
            debug!(
                dim = p.dim,
                boundary = i,
                low = root.bound_min[i],
                f = root.cell_f[i],
                high = root.bound_max[i],
                "staggering bounds"
            );
        }
    }

    // Enforce the minimum size: rescale the free cells so the total stays 1,
    // pinning every cell that falls below the minimum, until stable.
    for m in root.cell_min.iter_mut() {
        *m = false;
    }
    let mut nmin = 0;
    loop {
        let nmin_old = nmin;
        let mut free = 0.0;
        for i in 0..nc {
            if !root.cell_min[i] {
                free += root.cell_size[i];
            }
        }
        let fac = (1.0 - nmin as f64 * p.cellsize_limit_f) / free;
        root.cell_f[0] = 0.0;
        for i in 0..nc {
            if !root.cell_min[i] {
                root.cell_size[i] *= fac;
                if root.cell_size[i] < p.cellsize_limit_f {
                    root.cell_min[i] = true;
                    root.cell_size[i] = p.cellsize_limit_f;
                    nmin += 1;
                }
            }
            root.cell_f[i + 1] = root.cell_f[i] + root.cell_size[i];
        }
        if nmin == nmin_old {
            break;
        }
    }

    // Absorb the rounding into the last cell and pin the upper endpoint.
    let last = nc - 1;
    root.cell_f[nc] = 1.0;
    root.cell_size[last] = root.cell_f[nc] - root.cell_f[last];
    // A slightly smaller factor than the pinning margin, since rounding
    // could have taken the last cell just below the limit.
    if root.cell_size[last] < p.cellsize_limit_f * CELL_MARGIN2 / CELL_MARGIN {
        return Err(CellSizeError::CannotBalance {
            step: p.step,
            dim: dim_char(p.dim),
            box_len: p.box_len,
            skew: p.skew,
            nc,
            min_size: p.cellsize_min,
        });
    }

    root.limited = nmin > 0;

    if !p.uniform {
        // No boundary may pass the halfway point of either cell it bounds;
        // propagate any correction outward, respecting the minimum size.
        for i in 1..nc {
            let halfway = 0.5 * (root.old_cell_f[i] + root.old_cell_f[i - 1]);
            if root.cell_f[i] < halfway {
                root.cell_f[i] = halfway;
                for j in i + 1..nc {
                    if root.cell_f[j] < root.cell_f[j - 1] + p.cellsize_limit_f {
                        root.cell_f[j] = root.cell_f[j - 1] + p.cellsize_limit_f;
                    }
                }
            }
            let halfway = 0.5 * (root.old_cell_f[i] + root.old_cell_f[i + 1]);
            if root.cell_f[i] > halfway {
                root.cell_f[i] = halfway;
                for j in (1..i).rev() {
                    if root.cell_f[j] > root.cell_f[j + 1] - p.cellsize_limit_f {
                        root.cell_f[j] = root.cell_f[j + 1] - p.cellsize_limit_f;
                    }
                }
            }
        }
    }

    if p.stagger {
        if p.uniform {
            for i in 0..nc {
                root.cell_f_max0[i] = root.cell_f[i];
                root.cell_f_min1[i] = root.cell_f[i + 1];
            }
        } else {
            for i in 1..nc {
                let lim_lo = root.cell_f[i] < root.bound_min[i];
                let lim_hi = root.cell_f[i] > root.bound_max[i];
                if lim_lo && lim_hi {
                    // Both limits violated, take the best compromise.
                    root.cell_f[i] = 0.5 * (root.bound_min[i] + root.bound_max[i]);
                } else if lim_lo {
                    root.cell_f[i] = root.bound_min[i];
                } else if lim_hi {
                    root.cell_f[i] = root.bound_max[i];
                }
                if lim_lo || lim_hi {
                    root.limited = true;
                }
            }
        }
    }

    // The cells should obey the cut-off restrictions now, but it does not
    // hurt to check.
    for i in 0..nc {
        if root.cell_f[i + 1] - root.cell_f[i] < p.cellsize_limit_f / CELL_MARGIN {
            warn!(
                step = p.step,
                dim = %dim_char(p.dim),
                cell = i,
                size = (root.cell_f[i + 1] - root.cell_f[i]) * p.box_len * p.skew,
                "cell below the minimum size after balancing"
            );
        }
    }

    Ok(())
}

// ============================================================================
// Static cell sizes and pulse counts
// ============================================================================

/// Parse user-supplied relative cell sizes for one direction and normalize
/// them to 1.
pub fn get_slb_frac(dir: usize, nc: usize, sizes: Option<&str>) -> Result<Option<Vec<f64>>, SetupError> {
    let Some(s) = sizes else { return Ok(None) };
    if nc <= 1 {
        return Ok(None);
    }
    let mut frac = Vec::with_capacity(nc);
    let mut it = s.split_whitespace();
    for _ in 0..nc {
        let val: f64 = it
            .next()
            .and_then(|tok| tok.parse().ok())
            .filter(|&v| v > 0.0)
            .ok_or_else(|| SetupError::SlbFracParse { dir: dim_char(dir), value: s.to_string() })?;
        frac.push(val);
    }
    let tot: f64 = frac.iter().sum();
    for f in frac.iter_mut() {
        *f /= tot;
    }
    debug!(dir = %dim_char(dir), fractions = ?frac, "relative cell sizes");
    Ok(Some(frac))
}

impl DomDec {
    /// Length of the broadcast fraction row for dimension index `d`.
    #[inline]
    pub(crate) fn cell_f_size(&self, d: usize) -> usize {
        self.nc[self.dims[d]] + 1 + d * 2 + 1
    }

    /// Neighbor pair `(send_to, recv_from)` for a paired exchange along
    /// dimension index `d`.
    #[inline]
    pub(crate) fn neighbor_pair(&self, d: usize, dir: Direction) -> (usize, usize) {
        match dir {
            Direction::Forward => (self.neighbor[d][0], self.neighbor[d][1]),
            Direction::Backward => (self.neighbor[d][1], self.neighbor[d][0]),
        }
    }

    /// The minimum distance between staggered cell boundaries: bounded by
    /// the cut-off per pulse and the multi-body bonded cut-off, so groups
    /// only ever shift by one cell at redistribution.
    pub(crate) fn grid_jump_limit(&self, dim_ind: usize) -> f64 {
        self.cutoff_mbody.max(self.cutoff / self.cd[dim_ind].np as f64)
    }

    /// Fail when the box cannot hold the requested cells at the minimum
    /// cell size.
    pub(crate) fn check_box_size(&self, boxm: &BoxMatrix) -> Result<(), CellSizeError> {
        for d in 0..self.ndim {
            let dim = self.dims[d];
            if boxm[(dim, dim)] * self.tric.skew_fac[dim]
                < self.nc[dim] as f64 * self.cellsize_limit * CELL_MARGIN
            {
                return Err(CellSizeError::BoxTooSmall {
                    dim: dim_char(dim),
                    box_len: boxm[(dim, dim)],
                    skew: self.tric.skew_fac[dim],
                    nc: self.nc[dim],
                    limit: self.cellsize_limit,
                });
            }
        }
        Ok(())
    }

    /// Static cell boundaries (uniform or user fractions). Returns the
    /// pulse count per Cartesian dimension. With `master` set the whole
    /// boundary table is (re)built on the master for binning.
    pub(crate) fn set_cell_sizes_slb(
        &mut self,
        boxm: &BoxMatrix,
        master: bool,
    ) -> Result<[usize; DIM], CellSizeError> {
        let mut cellsize_min = [0.0; DIM];
        let mut np = [1usize; DIM];

        for d in 0..DIM {
            cellsize_min[d] = boxm[(d, d)] * self.tric.skew_fac[d];
            np[d] = 1;
            if self.nc[d] == 1 || self.slb_frac[d].is_none() {
                // Uniform grid.
                let cell_dx = boxm[(d, d)] / self.nc[d] as f64;
                if master {
                    let ma = self.ma.as_mut().expect("master rank holds the master state");
                    ma.cell_x[d] = (0..=self.nc[d]).map(|j| j as f64 * cell_dx).collect();
                } else {
                    self.cell_x0[d] = self.ci[d] as f64 * cell_dx;
                    self.cell_x1[d] = (self.ci[d] + 1) as f64 * cell_dx;
                }
                let cellsize = cell_dx * self.tric.skew_fac[d];
                while cellsize * (np[d] as f64) < self.cutoff {
                    np[d] += 1;
                }
                cellsize_min[d] = cellsize;
            } else {
                // Statically load-balanced grid. All boundaries are built
                // even off-master, to obtain values identical to the master
                // distribution and to determine the pulse count.
                let frac = self.slb_frac[d].clone().expect("checked above");
                let mut cell_x = vec![0.0; self.nc[d] + 1];
                for j in 0..self.nc[d] {
                    let cell_dx = boxm[(d, d)] * frac[j];
                    cell_x[j + 1] = cell_x[j] + cell_dx;
                    let cellsize = cell_dx * self.tric.skew_fac[d];
                    while cellsize * (np[d] as f64) < self.cutoff {
                        np[d] += 1;
                    }
                    cellsize_min[d] = cellsize_min[d].min(cellsize);
                }
                if master {
                    let ma = self.ma.as_mut().expect("master rank holds the master state");
                    ma.cell_x[d] = cell_x;
                } else {
                    self.cell_x0[d] = cell_x[self.ci[d]];
                    self.cell_x1[d] = cell_x[self.ci[d] + 1];
                }
            }
            // A cell must never receive its own home groups back over the
            // periodic boundary; duplicate groups break the global indices.
            if self.nc[d] > 1 && np[d] >= self.nc[d] {
                return Err(CellSizeError::CutoffTooLarge {
                    dim: dim_char(d),
                    box_len: boxm[(d, d)],
                    skew: self.tric.skew_fac[d],
                    cutoff: self.cutoff,
                    nc: self.nc[d],
                });
            }
        }

        if !self.dlb {
            self.cellsize_min = cellsize_min;
        }

        if self.pme.npmenodes > 0 {
            let uniform = self.slb_frac[0].is_none();
            let dim_f = self.pme.slb_dim_f.clone();
            self.set_pme_maxshift(uniform, boxm, dim_f.as_deref());
        }
        Ok(np)
    }

    /// Fraction table of the x boundaries used for the PME max-shift with
    /// static sizing; only meaningful when x is the outer dimension.
    pub(crate) fn set_slb_pme_dim_f(&mut self) {
        if self.dims[0] != 0 {
            self.pme.slb_dim_f = None;
            return;
        }
        let nc = self.nc[0];
        let mut f = vec![0.0; nc + 1];
        for i in 1..nc {
            f[i] = match &self.slb_frac[0] {
                Some(frac) => f[i - 1] + frac[i - 1],
                None => i as f64 / nc as f64,
            };
        }
        f[nc] = 1.0;
        self.pme.slb_dim_f = Some(f);
    }

    /// Per-slab x extents of the particle grid, for the PME shift bound.
    pub(crate) fn set_pme_x_limits(&mut self) {
        let nslab = self.pme.npmenodes;
        self.pme.xmin = vec![self.nc[0] - 1; nslab];
        self.pme.xmax = vec![0; nslab];
        for i in 0..self.nnodes {
            let slab = crate::grid::ddindex2pmeslab(self.nnodes, nslab, i);
            let xyz = crate::grid::ddindex2xyz(&self.nc, i);
            self.pme.xmin[slab] = self.pme.xmin[slab].min(xyz[0]);
            self.pme.xmax[slab] = self.pme.xmax[slab].max(xyz[0]);
        }
    }

    /// The maximum number of x slabs any PME rank may have to exchange
    /// coordinates with, given the current boundaries.
    pub(crate) fn set_pme_maxshift(&mut self, uniform: bool, boxm: &BoxMatrix, cell_f: Option<&[f64]>) {
        let ns = self.pme.npmenodes;
        let nc = self.nc[0];

        let sh: i32;
        if self.dims[0] != 0 {
            // The outer decomposition is not along x: the worst case.
            sh = (ns / 2) as i32;
        } else if ns <= 3 || (uniform && ns == nc) {
            // The optimal situation.
            sh = 1;
        } else {
            let cell_f = cell_f.expect("x fraction table required for the shift bound");
            let xmin = &self.pme.xmin;
            let xmax = &self.pme.xmax;
            // Atoms can be at most half the cell size or the cut-off
            // outside their cell.
            let mut range = 0.5 * self.cellsize_min[0].min(self.cutoff) / self.tric.skew_fac[0];
            range /= boxm[(0, 0)];
            // Avoid unlucky rounding at exactly one half.
            range *= 0.999;

            let mut shift = 1usize;
            for s in 0..ns {
                let limit = cell_f[xmin[s]] - range;
                loop {
                    let t = s as i64 - (shift as i64 + 1);
                    let crosses = if t >= 0 {
                        cell_f[xmax[t as usize] + 1] > limit
                    } else {
                        cell_f[xmax[(t + ns as i64) as usize] + 1] - 1.0 > limit
                    };
                    if shift + 1 < ns && crosses {
                        shift += 1;
                    } else {
                        break;
                    }
                }
                let limit = cell_f[xmax[s] + 1] + range;
                loop {
                    let t = s + shift + 1;
                    let crosses = if t < ns {
                        cell_f[xmin[t]] < limit
                    } else {
                        cell_f[xmin[t - ns]] + 1.0 < limit
                    };
                    if shift + 1 < ns && crosses {
                        shift += 1;
                    } else {
                        break;
                    }
                }
            }
            sh = shift as i32;
        }

        self.pme.maxshift = sh;
        debug!(maxshift = sh, "PME slab communication range");
    }

    /// Resize the pulse tables to the given per-dimension pulse counts.
    pub(crate) fn realloc_comm_ind(&mut self, np: [usize; DIM]) {
        for d in 0..self.ndim {
            let n = np[self.dims[d]];
            let cd = &mut self.cd[d];
            if n > cd.ind.len() {
                debug!(dim = %dim_char(self.dims[d]), pulses = n, "growing the pulse table");
                cd.ind.resize_with(n, Default::default);
            }
            cd.np = n;
        }
    }

    // ------------------------------------------------------------------ DLB

    /// Dynamic boundary update for all decomposed dimensions, outer→inner.
    /// Row roots balance and everyone reads back their slice of the
    /// broadcast fraction row.
    pub(crate) fn set_cell_sizes_dlb(
        &mut self,
        boxm: &BoxMatrix,
        dynamic_box: bool,
        uniform: bool,
        step: i64,
    ) -> Result<(), CellSizeError> {
        for d in 0..self.ndim {
            let dim = self.dims[d];
            let mut row_member = true;
            let mut row_root = true;
            for d1 in d..self.ndim {
                if self.ci[self.dims[d1]] > 0 {
                    if d1 > d {
                        row_member = false;
                    }
                    row_root = false;
                }
            }
            let row_len = self.cell_f_size(d);

            if row_root {
                let nc = self.nc[dim];
                let (loads, load_aver) = if !uniform && self.load.count() > 0 {
                    let dl = &self.load.dim_load[d];
                    let loads: Vec<f64> = (0..nc).map(|i| dl.load[i * dl.nload + 2]).collect();
                    (loads, dl.sum_m / nc as f64)
                } else {
                    (Vec::new(), 0.0)
                };

                let mut cellsize_limit_f = self.cellsize_min[dim] / boxm[(dim, dim)];
                cellsize_limit_f *= CELL_MARGIN;
                let mut dist_min_f = self.grid_jump_limit(d) / boxm[(dim, dim)];
                dist_min_f *= CELL_MARGIN;
                if self.tric.tric_dir[dim] {
                    cellsize_limit_f /= self.tric.skew_fac[dim];
                    dist_min_f /= self.tric.skew_fac[dim];
                }
                if dynamic_box && d > 0 {
                    dist_min_f *= PRES_SCALE_MARGIN;
                }

                let lower_pairs: Vec<(f64, f64)> =
                    (0..d).map(|d1| (self.cell_f0[d1], self.cell_f1[d1])).collect();

                let params = RowBalance {
                    nc,
                    uniform,
                    loads: &loads,
                    load_aver,
                    cellsize_limit_f,
                    dist_min_f,
                    stagger: d > 0,
                    step,
                    dim,
                    box_len: boxm[(dim, dim)],
                    skew: self.tric.skew_fac[dim],
                    cellsize_min: self.cellsize_min[dim],
                };
                {
                    let root = self.root[d].as_mut().expect("row root holds balancing state");
                    balance_row(root, &params)?;
                    // Store the boundaries of the lower dimensions in the
                    // trailing region.
                    let mut pos = nc + 1;
                    for (f0, f1) in &lower_pairs {
                        root.cell_f[pos] = *f0;
                        pos += 1;
                        root.cell_f[pos] = *f1;
                        pos += 1;
                    }
                }
                if d == 0 && self.pme.npmenodes > 0 {
                    // The master bounds the coordinate shifts between the
                    // separate PME ranks.
                    let cf: Vec<f64> =
                        self.root[d].as_ref().expect("just used").cell_f[..nc + 1].to_vec();
                    self.set_pme_maxshift(uniform, boxm, Some(&cf));
                }
                let maxshift = self.pme.maxshift as f64;
                let root = self.root[d].as_mut().expect("row root holds balancing state");
                root.cell_f[row_len - 1] = maxshift;
            }

            if row_member {
                // Each rank only needs two fractions, but broadcasting the
                // whole row is cheaper than splitting it up.
                let rc = self.row_comm[d].clone().expect("row member has a row communicator");
                let mut row: Vec<f64> = if row_root {
                    self.root[d].as_ref().expect("row root holds balancing state").cell_f
                        [..row_len]
                        .to_vec()
                } else {
                    vec![0.0; row_len]
                };
                self.comm.row_bcast_reals(&rc, &mut row);
                if !row_root {
                    crate::system::ensure_len(&mut self.cell_f_row, row_len);
                    self.cell_f_row[..row_len].copy_from_slice(&row);
                }
                self.cell_f0[d] = row[self.ci[dim]];
                self.cell_f1[d] = row[self.ci[dim] + 1];
                let mut pos = self.nc[dim] + 1;
                for d1 in 0..=d {
                    if d1 < d {
                        self.cell_f0[d1] = row[pos];
                        pos += 1;
                        self.cell_f1[d1] = row[pos];
                        pos += 1;
                    }
                    let dim1 = self.dims[d1];
                    self.cell_x0[dim1] = self.cell_f0[d1] * boxm[(dim1, dim1)];
                    self.cell_x1[dim1] = self.cell_f1[d1] * boxm[(dim1, dim1)];
                }
                self.pme.maxshift = (row[pos] + 0.5) as i32;
            }
        }

        for dim in 0..DIM {
            if self.nc[dim] == 1 {
                self.cell_x0[dim] = 0.0;
                self.cell_x1[dim] = boxm[(dim, dim)];
            }
        }
        Ok(())
    }

    /// Update the cell boundaries for this partitioning: snapshot the old
    /// boundaries for the displacement check, refresh the triclinic data,
    /// and run the static or dynamic sizer.
    pub(crate) fn set_cell_sizes(
        &mut self,
        boxm: &BoxMatrix,
        dynamic_box: bool,
        uniform: bool,
        master: bool,
        step: i64,
    ) -> Result<(), CellSizeError> {
        self.old_cell_x0 = self.cell_x0;
        self.old_cell_x1 = self.cell_x1;

        self.tric = set_tric_dir(&self.nc, boxm)?;

        if self.dlb {
            if self.comm.is_master() {
                self.check_box_size(boxm)?;
            }
            if master {
                // Master-state distribution: the boundary table is rebuilt
                // statically; the pulse counts stay as fixed at init.
                self.set_cell_sizes_slb(boxm, true)?;
            } else {
                self.set_cell_sizes_dlb(boxm, dynamic_box, uniform, step)?;
            }
        } else {
            let np = self.set_cell_sizes_slb(boxm, master)?;
            self.realloc_comm_ind(np);
        }
        Ok(())
    }

    /// Derive the neighbor-search extents from the cell boundaries; with
    /// staggered grids this widens them with the neighbor rows' extremes.
    pub(crate) fn set_ns_cell_sizes(&mut self, boxm: &BoxMatrix, step: i64) -> Result<(), CellSizeError> {
        for d in 0..self.ndim {
            let dim = self.dims[d];
            if self.dlb
                && (self.cell_x1[dim] - self.cell_x0[dim]) * self.tric.skew_fac[dim]
                    < self.cellsize_min[dim]
            {
                return Err(CellSizeError::CellTooSmall {
                    step,
                    dim: dim_char(dim),
                    size: self.cell_x1[dim] - self.cell_x0[dim],
                    skew: self.tric.skew_fac[dim],
                    min_size: self.cellsize_min[dim],
                    ci: self.ci,
                });
            }
        }

        self.cell_ns_x0 = self.cell_x0;
        self.cell_ns_x1 = self.cell_x1;

        if self.grid_jump && self.ndim > 1 {
            self.move_cellx(boxm);
            self.check_grid_jump(step, boxm)?;
        }
        Ok(())
    }

    /// Exchange the staggered boundaries and their extremes with the
    /// neighbor rows, walking the dimensions inner→outer so the extremes
    /// accumulate towards the outer rows.
    pub(crate) fn move_cellx(&mut self, boxm: &BoxMatrix) {
        if self.ndim < 2 {
            return;
        }

        self.cell_d1[0][0] = self.cell_f0[1];
        self.cell_d1[0][1] = self.cell_f1[1];
        if self.ndim >= 3 {
            self.cell_d2[0][0][0] = self.cell_f0[2];
            self.cell_d2[0][0][1] = self.cell_f1[2];
        }

        // One linear buffer of boundary pairs: sends go out of the filled
        // prefix, receptions append, and the consumers below walk the
        // received region. Entries received in an inner dimension are
        // forwarded as-is in the outer one.
        let mut buf = [[0.0f64; 2]; 16];
        let mut pos = 0usize;
        let mut extr_s = [[0.0f64; 2]; 2];

        for d in (0..=self.ndim - 2).rev() {
            let dim = self.dims[d];

            buf[pos] = [self.cell_f0[d + 1], self.cell_f1[d + 1]];
            pos += 1;
            extr_s[d] = [self.cell_f0[d + 1], self.cell_f1[d + 1]];

            if d == 0 && self.ndim >= 3 {
                buf[pos] = extr_s[1];
                pos += 1;
            }

            if self.nc[dim] > 2 {
                // Only the extremes need to travel the forward direction.
                let n = self.ndim - d - 1;
                let send: Vec<f64> = extr_s[d..d + n].iter().flatten().copied().collect();
                let (rs, rr) = self.neighbor_pair(d, Direction::Forward);
                let recv = self.comm.sendrecv_reals(rs, &send, rr, send.len());
                for d1 in d..self.ndim - 1 {
                    extr_s[d1][0] = extr_s[d1][0].max(recv[2 * (d1 - d)]);
                    extr_s[d1][1] = extr_s[d1][1].min(recv[2 * (d1 - d) + 1]);
                }
            }

            let send: Vec<f64> = buf[..pos].iter().flatten().copied().collect();
            let (rs, rr) = self.neighbor_pair(d, Direction::Backward);
            let recv = self.comm.sendrecv_reals(rs, &send, rr, send.len());
            for (k, pair) in recv.chunks_exact(2).enumerate() {
                buf[pos + k] = [pair[0], pair[1]];
            }

            if d == 1 || (d == 0 && self.ndim == 3) {
                for i in d..2 {
                    self.cell_d2[1 - d][i] = buf[pos];
                    pos += 1;
                    extr_s[1][0] = extr_s[1][0].max(self.cell_d2[1 - d][i][0]);
                    extr_s[1][1] = extr_s[1][1].min(self.cell_d2[1 - d][i][1]);
                }
            }
            if d == 0 {
                self.cell_d1[1] = buf[pos];
                pos += 1;
                extr_s[0][0] = extr_s[0][0].max(self.cell_d1[1][0]);
                extr_s[0][1] = extr_s[0][1].min(self.cell_d1[1][1]);
            }
            if d == 0 && self.ndim >= 3 {
                extr_s[1][0] = extr_s[1][0].max(buf[pos][0]);
                extr_s[1][1] = extr_s[1][1].min(buf[pos][1]);
                pos += 1;
            }
        }

        if self.ndim >= 2 {
            let dim = self.dims[1];
            let len = boxm[(dim, dim)];
            for i in 0..2 {
                for k in 0..2 {
                    self.cell_d1[i][k] *= len;
                }
                self.cell_ns_x0[dim] = self.cell_ns_x0[dim].min(self.cell_d1[i][0]);
                self.cell_ns_x1[dim] = self.cell_ns_x1[dim].max(self.cell_d1[i][1]);
            }
        }
        if self.ndim >= 3 {
            let dim = self.dims[2];
            let len = boxm[(dim, dim)];
            for i in 0..2 {
                for j in 0..2 {
                    for k in 0..2 {
                        self.cell_d2[i][j][k] *= len;
                    }
                    self.cell_ns_x0[dim] = self.cell_ns_x0[dim].min(self.cell_d2[i][j][0]);
                    self.cell_ns_x1[dim] = self.cell_ns_x1[dim].max(self.cell_d2[i][j][1]);
                }
            }
        }
        for d in 1..self.ndim {
            self.cell_f_max0[d] = extr_s[d - 1][0];
            self.cell_f_min1[d] = extr_s[d - 1][1];
        }
    }

    /// Abort when a staggered boundary moved more than the jump limit
    /// between two redistributions.
    pub(crate) fn check_grid_jump(&self, step: i64, boxm: &BoxMatrix) -> Result<(), CellSizeError> {
        for d in 1..self.ndim {
            let dim = self.dims[d];
            let limit = self.grid_jump_limit(d);
            let mut bfac = boxm[(dim, dim)];
            if self.tric.tric_dir[dim] {
                bfac *= self.tric.skew_fac[dim];
            }
            if (self.cell_f1[d] - self.cell_f_max0[d]) * bfac < limit
                || (self.cell_f0[d] - self.cell_f_min1[d]) * bfac > -limit
            {
                return Err(CellSizeError::GridJump { step, dim: dim_char(dim), ci: self.ci });
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn row(nc: usize) -> RowRoot {
        RowRoot::new(nc, nc + 2)
    }

    fn params<'a>(nc: usize, loads: &'a [f64], uniform: bool) -> RowBalance<'a> {
        let aver = if loads.is_empty() { 0.0 } else { loads.iter().sum::<f64>() / nc as f64 };
        RowBalance {
            nc,
            uniform,
            loads,
            load_aver: aver,
            cellsize_limit_f: 0.05,
            dist_min_f: 0.05,
            stagger: false,
            step: 0,
            dim: 0,
            box_len: 10.0,
            skew: 1.0,
            cellsize_min: 0.5,
        }
    }

    #[test]
    fn uniform_balancing_is_idempotent() {
        let nc = 4;
        let mut r = row(nc);
        balance_row(&mut r, &params(nc, &[], true)).unwrap();
        for i in 0..=nc {
            assert!((r.cell_f[i] - i as f64 / nc as f64).abs() < 1e-6);
        }
        // A second application must leave the boundaries unchanged.
        let snapshot = r.cell_f.clone();
        balance_row(&mut r, &params(nc, &[], true)).unwrap();
        for i in 0..=nc {
            assert!((r.cell_f[i] - snapshot[i]).abs() < 1e-6);
        }
    }

    #[test]
    fn overloaded_cell_shrinks_under_load() {
        let nc = 4;
        let mut r = row(nc);
        // Cell 0 carries twice the cycles of the others.
        let loads = [2.0, 1.0, 1.0, 1.0];
        balance_row(&mut r, &params(nc, &loads, false)).unwrap();
        assert!(r.cell_size[0] < 0.25);
        for i in 1..nc {
            assert!(r.cell_size[i] > 0.25);
        }
        // Monotone boundaries with exact endpoints and no cell below the
        // minimum.
        assert_eq!(r.cell_f[0], 0.0);
        assert_eq!(r.cell_f[nc], 1.0);
        for i in 0..nc {
            assert!(r.cell_f[i + 1] > r.cell_f[i]);
            assert!(r.cell_f[i + 1] - r.cell_f[i] >= 0.05 / CELL_MARGIN);
        }
        assert!(!r.limited);
    }

    #[test]
    fn minimum_size_pins_cells() {
        let nc = 3;
        let mut r = row(nc);
        let mut p = params(nc, &[], false);
        p.cellsize_limit_f = 0.3;
        // Skew the targets hard; two cells must pin at the minimum.
        r.cell_size = vec![0.9, 0.05, 0.05];
        balance_row(&mut r, &p).unwrap();
        assert!(r.limited);
        assert!(r.cell_min[1] && r.cell_min[2]);
        assert!((r.cell_f[nc] - 1.0).abs() < 1e-12);
        for i in 0..nc {
            assert!(r.cell_f[i + 1] - r.cell_f[i] >= 0.3 / CELL_MARGIN);
        }
    }

    #[test]
    fn balance_fails_when_minimum_does_not_fit() {
        let nc = 4;
        let mut r = row(nc);
        let mut p = params(nc, &[], true);
        // Four cells of at least 0.3 cannot sum to 1.
        p.cellsize_limit_f = 0.3;
        assert!(matches!(
            balance_row(&mut r, &p),
            Err(CellSizeError::CannotBalance { .. })
        ));
    }

    #[test]
    fn halfway_constraint_limits_boundary_travel() {
        let nc = 2;
        let mut r = row(nc);
        let mut p = params(nc, &[], false);
        p.cellsize_limit_f = 0.01;
        // An extreme size proposal would move the middle boundary from 0.5
        // towards 0.9; the halfway rule caps it at 0.75.
        r.cell_size = vec![0.9, 0.1];
        balance_row(&mut r, &p).unwrap();
        assert!(r.cell_f[1] <= 0.75 + 1e-12);
    }

    #[test]
    fn stagger_bounds_clamp_and_mark_limited() {
        let nc = 2;
        let mut r = row(nc);
        let mut p = params(nc, &[], false);
        p.stagger = true;
        p.cellsize_limit_f = 0.01;
        p.dist_min_f = 0.0;
        // The neighbor rows pin the boundary near 0.5 from both sides.
        r.cell_f_max0 = vec![0.48, 0.9];
        r.cell_f_min1 = vec![0.52, 1.0];
        r.cell_size = vec![0.30, 0.70];
        balance_row(&mut r, &p).unwrap();
        assert!(r.limited);
        assert!(r.cell_f[1] >= 0.48 && r.cell_f[1] <= 0.52 + 1e-12);
    }

    #[test]
    fn slb_fraction_parsing() {
        let frac = get_slb_frac(0, 3, Some("1 2 1")).unwrap().unwrap();
        assert_eq!(frac, vec![0.25, 0.5, 0.25]);
        assert!(get_slb_frac(0, 3, None).unwrap().is_none());
        assert!(get_slb_frac(0, 3, Some("1 nope 1")).is_err());
        assert!(get_slb_frac(1, 4, Some("1 2 1")).is_err());
    }
}
