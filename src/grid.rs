//! Decomposition topology: grid choice, rank maps and the PP/PME split
//!
//! The rank grid is x-major: `idx = ((ci.x·ny)+ci.y)·nz + ci.z`, so that the
//! reciprocal-space x-slab decomposition sees contiguous runs of particle
//! ranks. When the caller does not request cell counts, [`optimize_ncells`]
//! factorizes the particle rank count into primes and scores every factor
//! assignment with a communication-volume model.
//!
//! Separate reciprocal-space (PME) ranks can be laid out three ways,
//! captured by [`RankTopology`]: appended after all particle ranks,
//! interleaved between runs of equal PME slab, or as an extra slab of a
//! Cartesian grid. Neighbor lookup and the PP/PME correspondences are
//! methods on that value. The in-process transport places ranks linearly,
//! so Cartesian reordering is the identity here; the reorder switch is
//! still recognized for interface completeness.

use thiserror::Error;
use tracing::{debug, info};

use crate::geometry::TricSetup;
use crate::{BoxMatrix, IVec, DIM};

/// Configuration errors raised during initialization.
#[derive(Debug, Error)]
pub enum SetupError {
    /// No factor assignment of the particle ranks fits the box.
    #[error(
        "there is no domain decomposition for {npp} ranks that is compatible with the given box \
         and a minimum cell size of {limit} nm"
    )]
    NoCompatibleGrid {
        /// Number of particle ranks to place.
        npp: usize,
        /// Minimum cell size the search had to respect.
        limit: f64,
    },
    /// No PME rank count divides the fourier grid.
    #[error(
        "could not find an appropriate number of separate PME ranks that is a multiple of the \
         fourier grid x ({nkx}) and y ({nky}) components"
    )]
    PmeGridMismatch {
        /// Fourier grid x extent.
        nkx: usize,
        /// Fourier grid y extent.
        nky: usize,
    },
    /// Requested cell counts do not multiply to the particle rank count.
    #[error(
        "the size of the domain decomposition grid ({ncells}) does not match the number of \
         particle-particle ranks ({npp}); the total number of ranks is {ntot}"
    )]
    GridSizeMismatch {
        /// Product of the requested cell counts.
        ncells: usize,
        /// Available particle ranks.
        npp: usize,
        /// Total simulation ranks.
        ntot: usize,
    },
    /// More PME ranks requested than particle ranks exist.
    #[error("the number of separate PME ranks ({npme}) is larger than the number of particle-particle ranks ({npp})")]
    TooManyPmeRanks {
        /// Requested PME rank count.
        npme: usize,
        /// Available particle ranks.
        npp: usize,
    },
    /// The dynamic-balancing shrink factor must stay below 1.
    #[error("the allowed cell shrink factor should be smaller than 1 (got {0})")]
    InvalidDlbScale(f64),
    /// The engine requires a periodic system.
    #[error("periodic boundary type 'none' is not supported with domain decomposition")]
    PbcNone,
    /// z cannot be decomposed with xy periodicity and fewer than two walls.
    #[error("cannot decompose the z direction with xy periodic boundaries and fewer than two walls")]
    PbcZForbidden,
    /// A user cell-size string did not parse to enough positive entries.
    #[error("incorrect or not enough cell size entries for direction {dir}: '{value}'")]
    SlbFracParse {
        /// Axis letter of the offending direction.
        dir: char,
        /// The string as supplied.
        value: String,
    },
    /// Box analysis failed.
    #[error(transparent)]
    Geometry(#[from] crate::geometry::GeometryError),
}

/// Periodic boundary kind. The engine requires periodicity; a fully open
/// system is rejected at init.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PbcKind {
    /// Periodic in all three directions.
    Xyz,
    /// Periodic in x and y only.
    Xy,
}

// ============================================================================
// Rank-coordinate maps
// ============================================================================

/// X-major rank index of a grid coordinate.
#[inline]
pub fn dd_index(nc: &IVec, ci: &IVec) -> usize {
    (ci[0] * nc[1] + ci[1]) * nc[2] + ci[2]
}

/// Inverse of [`dd_index`].
#[inline]
pub fn ddindex2xyz(nc: &IVec, ind: usize) -> IVec {
    [ind / (nc[1] * nc[2]), (ind / nc[2]) % nc[1], ind % nc[2]]
}

/// Forward and backward neighbor ranks along decomposition dimension
/// `dims[d]`, with periodic wrap-around.
pub fn neighbor_ranks(nc: &IVec, ci: &IVec, dim: usize) -> (usize, usize) {
    let mut fwd = *ci;
    fwd[dim] = (ci[dim] + 1) % nc[dim];
    let mut bwd = *ci;
    bwd[dim] = (ci[dim] + nc[dim] - 1) % nc[dim];
    (dd_index(nc, &fwd), dd_index(nc, &bwd))
}

// ============================================================================
// Zones and interaction zones
// ============================================================================

/// Maximum number of zones (home plus the forward halo octants).
pub const MAX_ZONES: usize = 8;
/// Maximum number of interaction-zone entries.
pub const MAX_IZONES: usize = 4;

/// The fixed zone order over the forward octant.
pub const ZONE_ORDER: [[usize; 3]; MAX_ZONES] = [
    [0, 0, 0],
    [1, 0, 0],
    [1, 1, 0],
    [0, 1, 0],
    [0, 1, 1],
    [0, 0, 1],
    [1, 0, 1],
    [1, 1, 1],
];

/// Zone permutation applied per decomposed dimension when walking pulse-0
/// sources, chosen so charge groups end up consecutive for neighbor
/// searching.
pub const ZONE_PERM: [[usize; 4]; 3] = [[0, 0, 0, 0], [1, 0, 0, 0], [3, 0, 1, 2]];

/// Interaction-zone pair ranges `(i, j0, j1)` per dimensionality.
const IZONES_3D: [[usize; 3]; 4] = [[0, 0, 8], [1, 3, 6], [2, 5, 6], [3, 5, 7]];
const IZONES_2D: [[usize; 3]; 2] = [[0, 0, 4], [1, 3, 4]];
const IZONES_1D: [[usize; 3]; 1] = [[0, 0, 2]];

/// One interaction zone: the `i`-zone interacts with zones `j0..j1`.
#[derive(Copy, Clone, Debug, Default)]
pub struct IZone {
    /// First interacting zone.
    pub j0: usize,
    /// One past the last interacting zone.
    pub j1: usize,
    /// Upper charge-group bound of the i-zone, filled after a halo build.
    pub cg1: usize,
    /// First j-range charge group, filled after a halo build.
    pub jcg0: usize,
    /// One past the last j-range charge group, filled after a halo build.
    pub jcg1: usize,
    /// Lower periodic shift bound per Cartesian dimension.
    pub shift0: [i32; DIM],
    /// Upper periodic shift bound per Cartesian dimension.
    pub shift1: [i32; DIM],
}

/// The zone tables of one rank.
#[derive(Clone, Debug)]
pub struct Zones {
    /// Number of zones (home plus halo octants).
    pub nzone: usize,
    /// Per-zone shift vector in Cartesian dimensions.
    pub shift: [[usize; DIM]; MAX_ZONES],
    /// Number of interaction-zone entries.
    pub nizone: usize,
    /// The interaction zones, first `nizone` entries valid.
    pub izone: [IZone; MAX_IZONES],
}

/// Build the zone and interaction-zone tables for a grid with the given
/// active dimensions.
pub fn setup_zones(nc: &IVec, dims: &[usize], ndim: usize) -> Zones {
    let (nzone, pairs): (usize, &[[usize; 3]]) = match ndim {
        3 => (8, &IZONES_3D),
        2 => (4, &IZONES_2D),
        1 => (2, &IZONES_1D),
        _ => (1, &[]),
    };

    let mut shift = [[0usize; DIM]; MAX_ZONES];
    for (i, sh) in shift.iter_mut().enumerate().take(nzone) {
        for (d, &dim) in dims.iter().enumerate().take(ndim) {
            sh[dim] = ZONE_ORDER[i][d];
        }
    }

    let mut izone = [IZone::default(); MAX_IZONES];
    for (k, p) in pairs.iter().enumerate() {
        assert_eq!(p[0], k, "internal inconsistency in the zone setup");
        let iz = &mut izone[k];
        iz.j0 = p[1];
        iz.j1 = p[2];
        for dim in 0..DIM {
            if nc[dim] == 1 {
                // All shifts should be allowed.
                iz.shift0[dim] = -1;
                iz.shift1[dim] = 1;
            } else {
                // The shifts are not more than one cell.
                iz.shift0[dim] = 1;
                iz.shift1[dim] = -1;
                for j in iz.j0..iz.j1 {
                    let diff = shift[j][dim] as i32 - shift[k][dim] as i32;
                    iz.shift0[dim] = iz.shift0[dim].min(diff);
                    iz.shift1[dim] = iz.shift1[dim].max(diff);
                }
            }
        }
    }

    Zones { nzone, shift, nizone: pairs.len(), izone }
}

// ============================================================================
// Prime factorization and the communication-cost model
// ============================================================================

/// Decompose `n` into distinct primes with multiplicities.
pub fn factorize(mut n: usize) -> (Vec<usize>, Vec<usize>) {
    let mut fac = Vec::new();
    let mut mfac = Vec::new();
    let mut d = 2;
    while n > 1 {
        while n % d == 0 {
            if fac.last() != Some(&d) {
                fac.push(d);
                mfac.push(0);
            }
            *mfac.last_mut().expect("pushed above") += 1;
            n /= d;
        }
        d += 1;
    }
    (fac, mfac)
}

/// Largest common divisor by trial division.
pub fn lcd(n1: usize, n2: usize) -> usize {
    let mut d = 1;
    let mut i = 2;
    while i <= n1 && i <= n2 {
        if n1 % i == 0 && n2 % i == 0 {
            d = i;
        }
        i += 1;
    }
    d
}

/// Static inputs of the grid optimizer.
#[derive(Clone, Debug)]
pub struct GridRequest<'a> {
    /// Total simulation ranks, particle plus PME.
    pub nnodes_tot: usize,
    /// Separate PME rank count.
    pub npme: usize,
    /// PME rank count used by the cost model (all PP ranks when no
    /// separate PME ranks are requested but PME is active; 0 without PME).
    pub npme_for_cost: usize,
    /// Whether dynamic load balancing will run.
    pub dlb: bool,
    /// Allowed fractional cell shrink under dynamic balancing.
    pub dlb_scale: f64,
    /// The pair cut-off the halo must cover.
    pub cutoff: f64,
    /// The multi-body bonded cut-off.
    pub cutoff_mbody: f64,
    /// Lower bound on the cell size from constraints and bondeds.
    pub cellsize_limit: f64,
    /// Whether bonded interactions cross charge-group boundaries.
    pub inter_cg_bondeds: bool,
    /// Whether multi-body bonded interactions cross group boundaries.
    pub inter_cg_multibody: bool,
    /// Average number of periodic distance corrections per atom for bonded
    /// interactions, estimated by the caller.
    pub pbcdxr: f64,
    /// Periodic boundary kind.
    pub pbc: PbcKind,
    /// Number of confining walls.
    pub nwall: usize,
    /// Whether the box changes under pressure coupling.
    pub pressure_coupling: bool,
    /// The simulation box.
    pub boxm: &'a BoxMatrix,
    /// Triclinic data of the box.
    pub tric: &'a TricSetup,
}

/// Estimated communication cost of decomposing into `nc` cells, or `None`
/// when `nc` is geometrically infeasible.
pub fn comm_cost_est(req: &GridRequest<'_>, limit: f64, nc: &IVec) -> Option<f64> {
    // The cost of a periodic distance correction relative to communicating
    // one atom's coordinate and force. Machine dependent; these factors are
    // for commodity clusters.
    const PBCDX_RECT_FAC: f64 = 0.1;
    const PBCDX_TRIC_FAC: f64 = 0.2;

    // Check the triclinic requirements.
    for i in 0..DIM {
        for j in i + 1..DIM {
            if req.boxm[(j, i)] != 0.0 && nc[j] > 1 && nc[i] == 1 {
                return None;
            }
        }
    }

    let mut bt = [0.0; DIM];
    let mut nw = [0.0; DIM];
    for i in 0..DIM {
        bt[i] = req.boxm[(i, i)] * req.tric.skew_fac[i];
        nw[i] = nc[i] as f64 * req.cutoff / bt[i];
        if bt[i] < nc[i] as f64 * limit {
            return None;
        }
    }

    // When two box lengths are (nearly) equal, put more cells on the lower
    // index so the choice does not flip on rounding of the box elements.
    for i in 0..DIM {
        if req.npme_for_cost == 0 || i != 0 {
            for j in i + 1..DIM {
                if (bt[j] - bt[i]).abs() < 0.01 * bt[i] && nc[j] > nc[i] {
                    return None;
                }
            }
        }
    }

    let mut npp = 1usize;
    let mut comm_vol = 0.0;
    for i in 0..DIM {
        if nc[i] > 1 {
            npp *= nc[i];
            comm_vol += nw[i];
            for j in i + 1..DIM {
                if nc[j] > 1 {
                    comm_vol += nw[i] * nw[j] * std::f64::consts::PI / 4.0;
                    for k in j + 1..DIM {
                        if nc[k] > 1 {
                            comm_vol += nw[i] * nw[j] * nw[k] * std::f64::consts::PI / 6.0;
                        }
                    }
                }
            }
        }
    }
    comm_vol /= npp as f64;

    // The largest fraction a PME-only rank has to communicate beyond its
    // own slab when the x cell count does not divide evenly.
    let mut comm_vol_pme = 0.0;
    if req.npme_for_cost > 0 && nc[0] % req.npme_for_cost != 0 {
        comm_vol_pme = if nc[0] > req.npme_for_cost {
            if req.npme_for_cost == 2 {
                1.0 / 3.0
            } else {
                0.5
            }
        } else {
            1.0 - lcd(nc[0], req.npme_for_cost) as f64 / req.npme_for_cost as f64
        };
        comm_vol_pme /= req.npme_for_cost as f64;
    }

    // Cost of periodic distance corrections for bonded interactions.
    let mut cost_pbcdx = 0.0;
    if (nc[0] == 1 || nc[1] == 1) || (nc[2] == 1 && req.pbc != PbcKind::Xy) {
        cost_pbcdx = if (req.tric.tric_dir[0] && nc[0] == 1) || (req.tric.tric_dir[1] && nc[1] == 1)
        {
            req.pbcdxr * PBCDX_TRIC_FAC / npp as f64
        } else {
            req.pbcdxr * PBCDX_RECT_FAC / npp as f64
        };
    }

    debug!(
        nc = ?nc,
        vol_pp = comm_vol,
        pbcdx = cost_pbcdx,
        pme = comm_vol_pme,
        "grid candidate cost"
    );

    Some(comm_vol + cost_pbcdx + comm_vol_pme)
}

fn assign_factors(
    req: &GridRequest<'_>,
    limit: f64,
    fac: &[usize],
    mfac: &[usize],
    trial: &mut IVec,
    opt: &mut IVec,
    opt_cost: &mut Option<f64>,
) {
    if fac.is_empty() {
        if let Some(ce) = comm_cost_est(req, limit, trial) {
            if opt_cost.map_or(true, |best| ce < best) {
                *opt = *trial;
                *opt_cost = Some(ce);
            }
        }
        return;
    }

    let m = mfac[0];
    for x in (0..=m).rev() {
        for _ in 0..x {
            trial[0] *= fac[0];
        }
        for y in (0..=m - x).rev() {
            // With xy periodicity and no confining walls the z direction
            // cannot be decomposed, so all factors must land in x and y.
            if !(req.pbc == PbcKind::Xy && req.nwall < 2 && x + y != m) {
                for _ in 0..y {
                    trial[1] *= fac[0];
                }
                for _ in 0..m - x - y {
                    trial[2] *= fac[0];
                }
                assign_factors(req, limit, &fac[1..], &mfac[1..], trial, opt, opt_cost);
                for _ in 0..m - x - y {
                    trial[2] /= fac[0];
                }
                for _ in 0..y {
                    trial[1] /= fac[0];
                }
            }
        }
        for _ in 0..x {
            trial[0] /= fac[0];
        }
    }
}

/// Choose cell counts for the particle ranks by exhaustive search over the
/// prime-factor assignments, scored by [`comm_cost_est`].
pub fn optimize_ncells(req: &GridRequest<'_>) -> Result<IVec, SetupError> {
    let npp = req.nnodes_tot - req.npme;

    let mut limit = req.cutoff_mbody;
    if req.inter_cg_bondeds {
        if req.inter_cg_multibody && limit <= 0.0 {
            // Without an explicit bonded limit, keep multi-body partners
            // within half the cut-off of each other.
            limit = req.cutoff / 2.0;
        }
        limit = limit.max(req.cellsize_limit);
    }

    if req.dlb {
        if req.dlb_scale >= 1.0 {
            return Err(SetupError::InvalidDlbScale(req.dlb_scale));
        }
        info!(scale = req.dlb_scale, "scaling the initial minimum cell size for load balancing");
        limit /= req.dlb_scale;
    } else if req.pressure_coupling {
        info!(
            factor = crate::GRID_MARGIN_PRES_SCALE,
            "scaling the initial minimum cell size for pressure scaling"
        );
        limit *= crate::GRID_MARGIN_PRES_SCALE;
    }

    info!(npp, limit, "optimizing the decomposition grid");

    let (fac, mfac) = factorize(npp);
    let mut trial = [1usize; DIM];
    let mut opt = [0usize; DIM];
    let mut opt_cost = None;
    assign_factors(req, limit, &fac, &mfac, &mut trial, &mut opt, &mut opt_cost);

    if opt[0] == 0 {
        return Err(SetupError::NoCompatibleGrid { npp, limit });
    }
    Ok(opt)
}

// ============================================================================
// Guessing the PME rank count
// ============================================================================

/// Guess a separate PME rank count from the estimated relative PME load.
///
/// Prefers a divisor of `nnodes` up to a third of the ranks; failing that,
/// accepts any count whose particle remainder has no large prime factor.
pub fn guess_npme(nkx: usize, nky: usize, pme_load_ratio: f64, nnodes: usize) -> Result<usize, SetupError> {
    let ratio = pme_load_ratio;
    info!(ratio, "guess for relative PME load");

    // The optimal rank ratio is assumed close to the load ratio; the
    // communication load hopefully balances out between PP and PME.
    let mut npme = 1;
    while npme <= nnodes / 3 {
        if nkx % npme == 0
            && nky % npme == 0
            && nnodes % npme == 0
            && npme as f64 / nnodes as f64 > 0.95 * ratio
        {
            break;
        }
        npme += 1;
    }
    if npme > nnodes / 3 {
        // Try any possible count.
        npme = 1;
        while npme <= nnodes / 2 {
            if nkx % npme == 0 && nky % npme == 0 && npme as f64 / nnodes as f64 > 0.95 * ratio {
                let (fac, _) = factorize(nnodes - npme);
                let ldiv = *fac.last().expect("nnodes - npme > 0");
                // Reject counts whose remainder has a large prime factor.
                if ldiv <= 3 + ((nnodes - npme) as f64).powf(1.0 / 3.0).round() as usize {
                    break;
                }
            }
            npme += 1;
        }
    }
    if npme > nnodes / 2 {
        if nkx % nnodes != 0 || nky % nnodes != 0 {
            return Err(SetupError::PmeGridMismatch { nkx, nky });
        }
        Ok(0)
    } else {
        info!(npp = nnodes - npme, npme, "guessed rank split");
        Ok(npme)
    }
}

// ============================================================================
// PP/PME rank topology
// ============================================================================

/// How PME-only ranks are placed among the simulation ranks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RankOrder {
    /// PME ranks spread between runs of particle ranks with equal slab.
    Interleave,
    /// All particle ranks first, all PME ranks last.
    PpPme,
    /// Cartesian grid extended by an extra slab of PME ranks.
    Cartesian,
}

/// Duty of one simulation rank.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Duty {
    /// Particle-particle work: this rank runs the decomposition engine.
    Pp,
    /// Reciprocal-space work only.
    Pme,
}

/// PME slab of a decomposition index, spread evenly.
#[inline]
pub fn ddindex2pmeslab(ndd: usize, npme: usize, ddindex: usize) -> usize {
    // Adding npme/2 gives an even distribution.
    (ddindex * npme + npme / 2) / ndd
}

/// The resolved PP/PME rank layout (the 3-variant split of the design
/// notes). Neighbor and correspondence lookups dispatch on the variant.
#[derive(Clone, Debug)]
pub struct RankTopology {
    /// Particle cell counts per Cartesian dimension.
    pub nc: IVec,
    /// Number of particle ranks.
    pub nnodes_dd: usize,
    /// Number of separate PME ranks.
    pub npme: usize,
    /// Requested placement of the PME ranks.
    pub order: RankOrder,
    /// Whether the PME ranks form an extra slab of a Cartesian grid.
    pub cartesian_pp_pme: bool,
    /// Extended grid including the PME slab, Cartesian PP+PME only.
    pub ntot: IVec,
    /// Dimension carrying the PME slab, Cartesian PP+PME only.
    pub cartpmedim: usize,
    /// Simulation ranks of the PME-only ranks, interleaved order only.
    pub pme_ranks: Option<Vec<usize>>,
}

impl RankTopology {
    /// Resolve the layout for `nc` particle cells and `npme` PME ranks.
    pub fn new(nc: IVec, npme: usize, order: RankOrder) -> Self {
        let nnodes_dd = nc[0] * nc[1] * nc[2];
        let mut topo = Self {
            nc,
            nnodes_dd,
            npme,
            order,
            cartesian_pp_pme: false,
            ntot: nc,
            cartpmedim: 1,
            pme_ranks: None,
        };
        if npme == 0 {
            return topo;
        }
        match order {
            RankOrder::Cartesian => {
                let div_y = (npme * nc[1]) % nnodes_dd == 0;
                let div_z = (npme * nc[2]) % nnodes_dd == 0;
                if div_y || div_z {
                    topo.cartesian_pp_pme = true;
                    // Choose the direction with the thinnest PME-only slab,
                    // which disturbs the PP communication least.
                    topo.cartpmedim = if div_y && (!div_z || nc[1] <= nc[2]) { 1 } else { 2 };
                    topo.ntot[topo.cartpmedim] += npme * nc[topo.cartpmedim] / nnodes_dd;
                } else {
                    info!(
                        npme,
                        nx = nc[0],
                        ny = nc[1],
                        nz = nc[2],
                        "PME rank count does not divide a grid slab, not using a Cartesian PP/PME layout"
                    );
                }
            }
            RankOrder::Interleave => {
                topo.pme_ranks = Some(Self::interleaved_pme_ranks(nnodes_dd, npme));
            }
            RankOrder::PpPme => {}
        }
        topo
    }

    fn interleaved_pme_ranks(ndd: usize, npme: usize) -> Vec<usize> {
        let mut ranks = Vec::with_capacity(npme);
        let mut n = 0;
        for i in 0..ndd {
            let p0 = ddindex2pmeslab(ndd, npme, i);
            let p1 = ddindex2pmeslab(ndd, npme, i + 1);
            if i + 1 == ndd || p1 > p0 {
                ranks.push(i + 1 + n);
                n += 1;
            }
        }
        ranks
    }

    /// Total simulation ranks.
    #[inline]
    pub fn nnodes_sim(&self) -> usize {
        self.nnodes_dd + self.npme
    }

    /// PME coordinate served by a PP coordinate, Cartesian PP+PME only.
    pub fn cart_coord2pmecoord(&self, coord: &IVec) -> IVec {
        let dim = self.cartpmedim;
        let nc = self.nc[dim];
        let ntot = self.ntot[dim];
        let mut out = *coord;
        out[dim] = nc + (coord[dim] * (ntot - nc) + (ntot - nc) / 2) / nc;
        out
    }

    /// Duty of a simulation rank.
    pub fn duty(&self, sim_rank: usize) -> Duty {
        if self.npme == 0 {
            return Duty::Pp;
        }
        if self.cartesian_pp_pme {
            let coord = ddindex2xyz(&self.ntot, sim_rank);
            if coord[self.cartpmedim] < self.nc[self.cartpmedim] {
                Duty::Pp
            } else {
                Duty::Pme
            }
        } else if let Some(pme_ranks) = &self.pme_ranks {
            if pme_ranks.contains(&sim_rank) {
                Duty::Pme
            } else {
                Duty::Pp
            }
        } else if sim_rank < self.nnodes_dd {
            Duty::Pp
        } else {
            Duty::Pme
        }
    }

    /// Simulation ranks with particle duty, in decomposition-index order.
    pub fn pp_group(&self) -> Vec<usize> {
        (0..self.nnodes_sim()).filter(|&r| self.duty(r) == Duty::Pp).collect()
    }

    /// Simulation ranks with PME duty, in slab order.
    pub fn pme_group(&self) -> Vec<usize> {
        (0..self.nnodes_sim()).filter(|&r| self.duty(r) == Duty::Pme).collect()
    }

    /// Decomposition index of a particle simulation rank.
    pub fn ddindex_of_sim(&self, sim_rank: usize) -> usize {
        if self.cartesian_pp_pme {
            let coord = ddindex2xyz(&self.ntot, sim_rank);
            dd_index(&self.nc, &coord)
        } else {
            self.pp_group()
                .iter()
                .position(|&r| r == sim_rank)
                .expect("internal inconsistency: rank has no decomposition index")
        }
    }

    /// The PME simulation rank serving a particle simulation rank, or
    /// `None` when `sim_rank` itself has PME duty.
    pub fn pme_rank_of(&self, sim_rank: usize) -> Option<usize> {
        if self.npme == 0 {
            return None;
        }
        if self.cartesian_pp_pme {
            let coord = ddindex2xyz(&self.ntot, sim_rank);
            if coord[self.cartpmedim] < self.nc[self.cartpmedim] {
                let pme = self.cart_coord2pmecoord(&coord);
                Some(dd_index(&self.ntot, &pme))
            } else {
                None
            }
        } else if let Some(pme_ranks) = &self.pme_ranks {
            if pme_ranks.contains(&sim_rank) {
                None
            } else {
                let mut i = 0;
                while sim_rank > pme_ranks[i] {
                    i += 1;
                }
                Some(pme_ranks[i])
            }
        } else if sim_rank < self.nnodes_dd {
            Some(self.nnodes_dd + ddindex2pmeslab(self.nnodes_dd, self.npme, sim_rank))
        } else {
            None
        }
    }

    /// Whether a simulation rank is PME-only.
    pub fn pme_only_node(&self, sim_rank: usize) -> bool {
        self.npme > 0 && self.pme_rank_of(sim_rank).is_none()
    }

    /// The particle simulation ranks whose slab maps onto PME rank
    /// `pmenodeid` (an index into the PME group), and the peer rank that
    /// reports the virial/energy.
    pub fn pp_ranks_of_pme(&self, pmenodeid: usize) -> (Vec<usize>, usize) {
        let pme_group = self.pme_group();
        let my_pme_sim = pme_group[pmenodeid];
        let mut ranks = Vec::new();
        for x in 0..self.nc[0] {
            for y in 0..self.nc[1] {
                for z in 0..self.nc[2] {
                    let coord = [x, y, z];
                    let sim = self.sim_rank_of_coord(&coord);
                    if self.pme_rank_of(sim) == Some(my_pme_sim) {
                        ranks.push(sim);
                    }
                }
            }
        }
        // The last particle rank of the slab is the peer.
        let peer = *ranks.last().expect("every PME rank serves at least one particle rank");
        (ranks, peer)
    }

    /// Simulation rank of a particle grid coordinate.
    pub fn sim_rank_of_coord(&self, coord: &IVec) -> usize {
        if self.cartesian_pp_pme {
            dd_index(&self.ntot, coord)
        } else {
            let ddindex = dd_index(&self.nc, coord);
            if let Some(_pme_ranks) = &self.pme_ranks {
                ddindex + ddindex2pmeslab(self.nnodes_dd, self.npme, ddindex)
            } else {
                ddindex
            }
        }
    }

    /// Whether this particle rank reports the virial and energy to its PME
    /// rank: only the last particle rank of each slab does.
    pub fn receive_vir_ener(&self, sim_rank: usize) -> bool {
        if self.npme >= self.nnodes_dd {
            return true;
        }
        let pmenode = self.pme_rank_of(sim_rank);
        if self.cartesian_pp_pme {
            let mut coord = ddindex2xyz(&self.ntot, sim_rank);
            coord[self.cartpmedim] += 1;
            if coord[self.cartpmedim] < self.nc[self.cartpmedim] {
                let next = dd_index(&self.ntot, &coord);
                if self.pme_rank_of(next) == pmenode {
                    return false;
                }
            }
            true
        } else {
            sim_rank + 1 >= self.nnodes_sim() || self.pme_rank_of(sim_rank + 1) != pmenode
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::set_tric_dir;

    fn cube(len: f64) -> BoxMatrix {
        BoxMatrix::from_fn(|r, c| if r == c { len } else { 0.0 })
    }

    #[test]
    fn dd_index_roundtrip_is_x_major() {
        let nc = [4, 3, 2];
        // x-major: incrementing z changes the index by 1.
        assert_eq!(dd_index(&nc, &[0, 0, 1]), 1);
        assert_eq!(dd_index(&nc, &[1, 0, 0]), 6);
        for idx in 0..24 {
            assert_eq!(dd_index(&nc, &ddindex2xyz(&nc, idx)), idx);
        }
    }

    #[test]
    fn neighbors_wrap_periodically() {
        let nc = [4, 1, 1];
        let (fwd, bwd) = neighbor_ranks(&nc, &[3, 0, 0], 0);
        assert_eq!((fwd, bwd), (0, 2));
        let (fwd, bwd) = neighbor_ranks(&nc, &[0, 0, 0], 0);
        assert_eq!((fwd, bwd), (1, 3));
    }

    #[test]
    fn factorize_and_lcd() {
        assert_eq!(factorize(12), (vec![2, 3], vec![2, 1]));
        assert_eq!(factorize(7), (vec![7], vec![1]));
        assert_eq!(lcd(12, 18), 6);
        assert_eq!(lcd(7, 5), 1);
    }

    #[test]
    fn zones_1d_and_3d() {
        let z1 = setup_zones(&[4, 1, 1], &[0], 1);
        assert_eq!(z1.nzone, 2);
        assert_eq!(z1.nizone, 1);
        assert_eq!((z1.izone[0].j0, z1.izone[0].j1), (0, 2));
        assert_eq!(z1.shift[1], [1, 0, 0]);
        // Undecomposed dimensions allow all shifts.
        assert_eq!((z1.izone[0].shift0[1], z1.izone[0].shift1[1]), (-1, 1));

        let z3 = setup_zones(&[2, 2, 2], &[0, 1, 2], 3);
        assert_eq!(z3.nzone, 8);
        assert_eq!(z3.nizone, 4);
        assert_eq!(z3.shift[4], [0, 1, 1]);
        assert_eq!((z3.izone[2].j0, z3.izone[2].j1), (5, 6));
        // Zone 0 interacts forward only.
        assert_eq!((z3.izone[0].shift0[0], z3.izone[0].shift1[0]), (0, 1));
    }

    #[test]
    fn optimizer_prefers_long_axis() {
        let boxm = BoxMatrix::from_fn(|r, c| match (r, c) {
            (0, 0) => 20.0,
            (1, 1) => 10.0,
            (2, 2) => 10.0,
            _ => 0.0,
        });
        let tric = set_tric_dir(&[1, 1, 1], &boxm).unwrap();
        let req = GridRequest {
            nnodes_tot: 4,
            npme: 0,
            npme_for_cost: 0,
            dlb: false,
            dlb_scale: 0.8,
            cutoff: 2.0,
            cutoff_mbody: 0.0,
            cellsize_limit: 0.0,
            inter_cg_bondeds: false,
            inter_cg_multibody: false,
            pbcdxr: 0.0,
            pbc: PbcKind::Xyz,
            nwall: 0,
            pressure_coupling: false,
            boxm: &boxm,
            tric: &tric,
        };
        let nc = optimize_ncells(&req).unwrap();
        // Communication volume favors slicing the 20 nm axis.
        assert_eq!(nc, [4, 1, 1]);
    }

    #[test]
    fn optimizer_rejects_infeasible_minimum() {
        let boxm = cube(4.0);
        let tric = set_tric_dir(&[1, 1, 1], &boxm).unwrap();
        let req = GridRequest {
            nnodes_tot: 64,
            npme: 0,
            npme_for_cost: 0,
            dlb: false,
            dlb_scale: 0.8,
            cutoff: 2.0,
            cutoff_mbody: 2.0,
            cellsize_limit: 2.0,
            inter_cg_bondeds: true,
            inter_cg_multibody: false,
            pbcdxr: 0.1,
            pbc: PbcKind::Xyz,
            nwall: 0,
            pressure_coupling: false,
            boxm: &boxm,
            tric: &tric,
        };
        assert!(matches!(optimize_ncells(&req), Err(SetupError::NoCompatibleGrid { .. })));
    }

    #[test]
    fn guess_npme_divisor_path() {
        // 12 ranks, fourier grid 24x24: npme=4 is the smallest divisor
        // above 0.95 * ratio for ratio 1/3.
        let npme = guess_npme(24, 24, 1.0 / 3.0, 12).unwrap();
        assert_eq!(npme, 4);
    }

    #[test]
    fn guess_npme_rejects_unmatchable_grid() {
        // A prime fourier grid cannot be divided by any candidate.
        assert!(matches!(
            guess_npme(17, 17, 0.9, 8),
            Err(SetupError::PmeGridMismatch { .. })
        ));
    }

    #[test]
    fn pme_slab_spread_is_even() {
        let slabs: Vec<usize> = (0..8).map(|i| ddindex2pmeslab(8, 4, i)).collect();
        assert_eq!(slabs, vec![0, 0, 1, 1, 2, 2, 3, 3]);
    }

    #[test]
    fn interleaved_topology_places_pme_between_runs() {
        let topo = RankTopology::new([4, 1, 1], 2, RankOrder::Interleave);
        let pme = topo.pme_ranks.clone().unwrap();
        assert_eq!(pme, vec![2, 5]);
        assert_eq!(topo.duty(0), Duty::Pp);
        assert_eq!(topo.duty(2), Duty::Pme);
        assert_eq!(topo.pme_rank_of(0), Some(2));
        assert_eq!(topo.pme_rank_of(1), Some(2));
        assert_eq!(topo.pme_rank_of(3), Some(5));
        assert_eq!(topo.pp_group(), vec![0, 1, 3, 4]);
        // Only the last rank of each slab reports the virial.
        assert!(topo.receive_vir_ener(1));
        assert!(!topo.receive_vir_ener(0));
    }

    #[test]
    fn pp_pme_topology_appends_pme_ranks() {
        let topo = RankTopology::new([2, 2, 1], 2, RankOrder::PpPme);
        assert_eq!(topo.pp_group(), vec![0, 1, 2, 3]);
        assert_eq!(topo.pme_group(), vec![4, 5]);
        assert_eq!(topo.pme_rank_of(0), Some(4));
        assert_eq!(topo.pme_rank_of(3), Some(5));
        let (pp, peer) = topo.pp_ranks_of_pme(0);
        assert_eq!(pp, vec![0, 1]);
        assert_eq!(peer, 1);
    }

    #[test]
    fn cartesian_topology_extends_thinnest_slab() {
        let topo = RankTopology::new([2, 2, 1], 2, RankOrder::Cartesian);
        assert!(topo.cartesian_pp_pme);
        assert_eq!(topo.cartpmedim, 1);
        assert_eq!(topo.ntot, [2, 3, 1]);
        // PP coords have y < 2; the appended y row is PME.
        assert_eq!(topo.duty(dd_index(&topo.ntot, &[0, 2, 0])), Duty::Pme);
        assert_eq!(topo.duty(dd_index(&topo.ntot, &[1, 1, 0])), Duty::Pp);
        let pme = topo.pme_rank_of(dd_index(&topo.ntot, &[1, 0, 0])).unwrap();
        assert_eq!(ddindex2xyz(&topo.ntot, pme), [1, 2, 0]);
    }
}
