//! The decomposition engine: construction and the partition orchestration
//!
//! [`DomDec`] owns everything one particle rank needs: the grid topology
//! and neighbor table, the zone tables, the local charge-group and atom
//! indices, the cell boundaries and balancing state, the halo pulse lists,
//! the communication handle and the load counters.
//!
//! [`DomDec::partition`] runs one full (re)partitioning: collect the load,
//! resize the cells, redistribute the drifted groups, optionally sort the
//! home set, rebuild the halo and the local indices, extend the atom ranges
//! through the collaborator seams, and hand the shift bound to the
//! reciprocal-space side. Between partitionings the cheap per-step calls
//! are [`DomDec::move_x`] and [`DomDec::move_f`].

use thiserror::Error;
use tracing::{debug, info};

use crate::cells::{CellSizeError, RowRoot};
use crate::comm::{DdComm, RowComm};
use crate::distribute::MasterState;
use crate::env::DdEnv;
use crate::geometry::{set_tric_dir, TricSetup};
use crate::grid::{
    dd_index, ddindex2xyz, neighbor_ranks, optimize_ncells, setup_zones, GridRequest, IZone,
    PbcKind, RankOrder, RankTopology, SetupError, Zones, MAX_ZONES,
};
use crate::halo::CommDim;
use crate::load::{DimLoad, LoadTracker};
use crate::redistribute::CgMoveError;
use crate::sort::SortBuffers;
use crate::system::{
    ensure_len, AtomRole, GlobalAtomMap, GlobalCg, GlobalCgs, State, ROLE_COUNT,
};
use crate::{BoxMatrix, IVec, Rvec, DIM};

/// Errors surfaced by a (re)partitioning.
#[derive(Debug, Error)]
pub enum PartitionError {
    /// Cell sizing or a geometric consistency check failed.
    #[error(transparent)]
    CellSize(#[from] CellSizeError),
    /// A charge group moved farther than one cell.
    #[error(transparent)]
    CgMove(#[from] CgMoveError),
    /// A configuration error from initialization.
    #[error(transparent)]
    Setup(#[from] SetupError),
    /// The state was written by an older partitioning generation.
    #[error(
        "the state belongs to partitioning generation {state_count}, the engine is at {dd_count}"
    )]
    StaleState {
        /// Generation recorded in the state.
        state_count: u64,
        /// Current generation of the engine.
        dd_count: u64,
    },
    /// The state claims a newer generation than the engine has produced.
    #[error(
        "internal inconsistency: state generation {state_count} is ahead of the engine's {dd_count}"
    )]
    StateAhead {
        /// Generation recorded in the state.
        state_count: u64,
        /// Current generation of the engine.
        dd_count: u64,
    },
    /// The checkpointed ownership list belongs to another generation than
    /// the state carrying it.
    #[error(
        "internal inconsistency: checkpointed group list generation {cg_gl_count} does not match \
         the state generation {state_count}"
    )]
    CheckpointMismatch {
        /// Generation at which the group list was written.
        cg_gl_count: u64,
        /// Generation recorded in the state.
        state_count: u64,
    },
}

// ============================================================================
// Collaborator seams
// ============================================================================

/// The neighbor-search grid, owned by the search collaborator.
pub trait NeighborSearchGrid {
    /// Rebuild the grid for a new home set over the given cell extents.
    fn grid_first(&mut self, boxm: &BoxMatrix, x0: &Rvec, x1: &Rvec, cutoff: f64, ncg: usize);
    /// Current grid dimensions.
    fn dims(&self) -> IVec;
    /// Total number of grid cells.
    fn ncells(&self) -> usize;
    /// Assign search cells to home groups `cg0..cg1` from their centers.
    /// Groups whose entry carries the moved mark get `4 * ncells`.
    fn fill_grid(&mut self, cg0: usize, cg1: usize, cg_cm: &[Rvec]);
    /// Per-group search cell indices.
    fn cell_index_mut(&mut self) -> &mut [i32];
    /// Record the new home group count.
    fn set_ncg(&mut self, ncg: usize);
}

/// Virtual-site or constraint collaborators extend the local atom range
/// with the extra atoms they need.
pub trait SpecialAtomsBuilder {
    /// Build the local data starting at atom `at_start`; returns the new
    /// upper bound of the local atom range.
    fn make_local(&mut self, dd: &DomDec, at_start: usize) -> usize;
    /// Drop the local indices of the previous partitioning.
    fn clear_local_indices(&mut self);
}

/// The reciprocal-space side consumes the charges and the slab shift bound
/// after every repartitioning.
pub trait PmeSink {
    /// Deliver the local charges and the coordinate shift bound.
    fn send_charges(&mut self, charges: &[f64], maxshift: i32);
}

/// The collaborator bundle passed into [`DomDec::partition`].
#[derive(Default)]
pub struct Collaborators<'a> {
    /// The neighbor-search grid; sorting is skipped without it.
    pub ns_grid: Option<&'a mut dyn NeighborSearchGrid>,
    /// The virtual-site constructor.
    pub vsites: Option<&'a mut dyn SpecialAtomsBuilder>,
    /// The constraint solver.
    pub constraints: Option<&'a mut dyn SpecialAtomsBuilder>,
    /// The reciprocal-space rank serving this rank.
    pub pme: Option<&'a mut dyn PmeSink>,
    /// Local charges handed through to the reciprocal-space side.
    pub charges: &'a [f64],
}

/// Per-group force-side arrays, resized on demand by the engine.
#[derive(Clone, Debug, Default)]
pub struct ForceRec {
    /// Charge-group centers of geometry, local index.
    pub cg_cm: Vec<Rvec>,
    /// Per-local-group interaction info.
    pub cginfo: Vec<i64>,
    /// Per-global-group interaction info.
    pub cginfo_global: Vec<i64>,
}

impl ForceRec {
    /// Arrays for a system of `ncg_global` charge groups.
    pub fn new(ncg_global: usize) -> Self {
        Self { cg_cm: Vec::new(), cginfo: Vec::new(), cginfo_global: vec![0; ncg_global] }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Reciprocal-space inputs used for rank-count guessing and the slab maps.
#[derive(Clone, Debug)]
pub struct PmeParams {
    /// Fourier grid x extent.
    pub nkx: usize,
    /// Fourier grid y extent.
    pub nky: usize,
    /// Estimated fraction of the total load spent in reciprocal space.
    pub load_estimate: f64,
}

/// Immutable description of the simulated system.
#[derive(Clone, Debug)]
pub struct SystemInfo {
    /// The global charge-group division.
    pub cgs: GlobalCgs,
    /// Number of molecules; bonded interactions cross group boundaries
    /// whenever there are more groups than molecules.
    pub nmol: usize,
    /// Number of bonded interactions involving more than two atoms.
    pub multi_body_bonded_count: usize,
    /// Number of constrained bonds.
    pub constraint_count: usize,
    /// Estimated maximum atom distance required by the constraint solver.
    pub constraint_r_max: f64,
    /// Average periodic distance corrections per atom for bonded terms.
    pub bonded_pbcdx_ratio: f64,
    /// Periodic boundary kind.
    pub pbc: PbcKind,
    /// Number of confining walls.
    pub nwall: usize,
    /// Whether the box changes during the run.
    pub dynamic_box: bool,
    /// Whether pressure coupling scales the box.
    pub pressure_coupling: bool,
    /// Reciprocal-space parameters, when PME electrostatics is active.
    pub pme: Option<PmeParams>,
    /// Pair-list cut-off.
    pub rlist: f64,
    /// Coulomb cut-off.
    pub rcoulomb: f64,
    /// Van der Waals cut-off.
    pub rvdw: f64,
}

impl SystemInfo {
    /// The pair cut-off the decomposition has to cover.
    pub fn rlist_long(&self) -> f64 {
        self.rlist.max(self.rcoulomb).max(self.rvdw)
    }
}

/// User-facing decomposition options.
#[derive(Clone, Debug)]
pub struct DdOptions {
    /// Requested cell counts; `None` lets the engine optimize them.
    pub nc: Option<IVec>,
    /// Requested separate PME rank count; `None` lets the engine guess.
    pub npme: Option<usize>,
    /// Placement of the PME ranks among the simulation ranks.
    pub rank_order: RankOrder,
    /// Minimum distance between atoms in bonded interactions on different
    /// ranks.
    pub comm_distance_min: f64,
    /// Distance limit from constrained-bond couplings; non-positive uses
    /// the system estimate.
    pub rconstr: f64,
    /// Enable dynamic load balancing.
    pub dlb: bool,
    /// Allowed fractional shrink of cells under dynamic balancing.
    pub dlb_scale: f64,
    /// User cell fractions for x, whitespace separated.
    pub sizex: Option<String>,
    /// User cell fractions for y, whitespace separated.
    pub sizey: Option<String>,
    /// User cell fractions for z, whitespace separated.
    pub sizez: Option<String>,
}

impl Default for DdOptions {
    fn default() -> Self {
        Self {
            nc: None,
            npme: None,
            rank_order: RankOrder::Interleave,
            comm_distance_min: 0.0,
            rconstr: 0.0,
            dlb: false,
            dlb_scale: 0.8,
            sizex: None,
            sizey: None,
            sizez: None,
        }
    }
}

/// Decide the decomposition grid and the PP/PME rank split. Deterministic
/// in its inputs, so every rank derives the same layout without a
/// broadcast.
pub fn choose_decomposition(
    opts: &DdOptions,
    sys: &SystemInfo,
    boxm: &BoxMatrix,
    nnodes_sim: usize,
) -> Result<RankTopology, SetupError> {
    let inter_cg_bondeds = sys.cgs.ncg() > sys.nmol;

    let mut npme = opts.npme.unwrap_or(0);
    if opts.npme.is_none() {
        if let Some(pme) = &sys.pme {
            // Assign separate PME ranks on larger runs, or whenever the
            // fourier grid does not match the rank count.
            if nnodes_sim >= 12 || pme.nkx % nnodes_sim != 0 || pme.nky % nnodes_sim != 0 {
                npme = crate::grid::guess_npme(pme.nkx, pme.nky, pme.load_estimate, nnodes_sim)?;
            }
        }
    }
    let npp = nnodes_sim - npme;

    let cutoff_mbody = opts.comm_distance_min;
    let mut cellsize_limit = cutoff_mbody;
    if sys.constraint_count > 0 && inter_cg_bondeds {
        let rconstr = if opts.rconstr > 0.0 { opts.rconstr } else { sys.constraint_r_max };
        cellsize_limit = cellsize_limit.max(rconstr);
    }

    let nc = match opts.nc {
        Some(nc) => nc,
        None => {
            let cutoff = sys.rlist_long().max(cutoff_mbody);
            let tric = set_tric_dir(&[1, 1, 1], boxm)?;
            let npme_for_cost = if sys.pme.is_some() {
                if npme > 0 {
                    npme
                } else {
                    npp
                }
            } else {
                0
            };
            let req = GridRequest {
                nnodes_tot: nnodes_sim,
                npme,
                npme_for_cost,
                dlb: opts.dlb,
                dlb_scale: opts.dlb_scale,
                cutoff,
                cutoff_mbody,
                cellsize_limit,
                inter_cg_bondeds,
                inter_cg_multibody: inter_cg_bondeds && sys.multi_body_bonded_count > 0,
                pbcdxr: if inter_cg_bondeds { sys.bonded_pbcdx_ratio } else { 0.0 },
                pbc: sys.pbc,
                nwall: sys.nwall,
                pressure_coupling: sys.pressure_coupling,
                boxm,
                tric: &tric,
            };
            optimize_ncells(&req)?
        }
    };

    let ncells = nc[0] * nc[1] * nc[2];
    if ncells != npp {
        return Err(SetupError::GridSizeMismatch { ncells, npp, ntot: nnodes_sim });
    }
    if npme > ncells {
        return Err(SetupError::TooManyPmeRanks { npme, npp: ncells });
    }

    Ok(RankTopology::new(nc, npme, opts.rank_order))
}

// ============================================================================
// The engine
// ============================================================================

/// Reciprocal-space coordination state of one particle rank.
#[derive(Clone, Debug, Default)]
pub struct PmeInfo {
    /// PME rank count used for the slab maps (all particle ranks when no
    /// separate PME ranks exist but PME is active).
    pub npmenodes: usize,
    /// The simulation rank of the PME rank serving this rank.
    pub pme_nodeid: Option<usize>,
    /// Whether this rank reports the virial/energy for its slab.
    pub receive_vir_ener: bool,
    /// Bound on the slab shift of the coordinate exchange.
    pub maxshift: i32,
    /// Per-slab lower x-coordinate extents of the particle grid.
    pub xmin: Vec<usize>,
    /// Per-slab upper x-coordinate extents of the particle grid.
    pub xmax: Vec<usize>,
    /// Static x boundary fractions for the shift bound.
    pub slb_dim_f: Option<Vec<f64>>,
    /// The resolved rank layout, for PP/PME correspondence queries.
    pub topology: Option<RankTopology>,
}

/// The spatial domain decomposition engine of one particle rank.
#[derive(Debug)]
pub struct DomDec {
    // Topology, immutable after construction.
    /// The particle-rank communicator.
    pub comm: DdComm,
    /// The environment snapshot taken at initialization.
    pub env: DdEnv,
    /// Cell counts per Cartesian dimension.
    pub nc: IVec,
    /// Number of particle ranks.
    pub nnodes: usize,
    /// This rank's grid coordinate.
    pub ci: IVec,
    /// Grid coordinate of the decomposition master.
    pub master_ci: IVec,
    /// Number of decomposed dimensions.
    pub ndim: usize,
    /// The decomposed Cartesian dimensions, outer first.
    pub dims: [usize; DIM],
    /// Forward/backward neighbor ranks per decomposed dimension.
    pub neighbor: [[usize; 2]; DIM],
    /// Zone and interaction-zone tables.
    pub zones: Zones,
    /// The global charge-group division.
    pub gcgs: GlobalCgs,
    /// Reciprocal-space coordination state.
    pub pme: PmeInfo,

    // Cut-offs and sizing limits.
    /// The pair cut-off the halo covers.
    pub cutoff: f64,
    /// The multi-body bonded cut-off.
    pub cutoff_mbody: f64,
    /// Minimum cell size per Cartesian dimension, in real distance.
    pub cellsize_min: [f64; DIM],
    /// Lower limit for the cell size under dynamic balancing.
    pub cellsize_limit: f64,
    /// Whether dynamic load balancing is active.
    pub dlb: bool,
    /// Whether the grid is staggered (boundaries differ per row).
    pub grid_jump: bool,
    /// Allowed fractional cell shrink under dynamic balancing.
    pub dlb_scale: f64,
    /// Whether the box changes during the run.
    pub dynamic_box: bool,
    /// Whether bonded interactions cross charge-group boundaries.
    pub inter_cg_bondeds: bool,
    /// Whether multi-body bonded interactions cross group boundaries.
    pub inter_cg_multibody: bool,
    /// User cell fractions per Cartesian dimension, static sizing only.
    pub slb_frac: [Option<Vec<f64>>; DIM],

    // Geometry of this rank's cell.
    /// Triclinic data of the current box.
    pub tric: TricSetup,
    /// Lower cell boundaries, Cartesian index.
    pub cell_x0: Rvec,
    /// Upper cell boundaries, Cartesian index.
    pub cell_x1: Rvec,
    /// Lower neighbor-search extents, widened on staggered grids.
    pub cell_ns_x0: Rvec,
    /// Upper neighbor-search extents, widened on staggered grids.
    pub cell_ns_x1: Rvec,
    /// Lower boundaries at the previous redistribution.
    pub old_cell_x0: Rvec,
    /// Upper boundaries at the previous redistribution.
    pub old_cell_x1: Rvec,

    // Local charge groups and atoms.
    /// Number of home charge groups.
    pub ncg_home: usize,
    /// Number of home atoms.
    pub nat_home: usize,
    /// Number of local charge groups, home plus halo.
    pub ncg_tot: usize,
    /// Number of local atoms, home plus halo.
    pub nat_tot: usize,
    /// Local→global charge-group index.
    pub index_gl: Vec<usize>,
    /// Local charge-group → local atom prefix index.
    pub cgindex: Vec<usize>,
    /// Local→global atom index.
    pub gatindex: Vec<usize>,
    /// Global→local atom lookup.
    pub ga2la: GlobalAtomMap,
    /// Upper atom bound per role, monotone.
    pub nat: [usize; ROLE_COUNT],
    /// Charge-group range bounds per zone.
    pub ncg_zone: [usize; MAX_ZONES + 1],
    /// Groups received from the direct neighbor per zone.
    pub zone_ncg1: [usize; MAX_ZONES],

    // Dynamic balancing state.
    /// Row communicator per decomposed dimension, where this rank
    /// participates.
    pub row_comm: [Option<RowComm>; DIM],
    /// Balancing state per decomposed dimension, row roots only.
    pub root: [Option<RowRoot>; DIM],
    /// Receive buffer for the broadcast fraction row.
    pub cell_f_row: Vec<f64>,
    /// Lower boundary fraction per decomposed dimension.
    pub cell_f0: [f64; DIM],
    /// Upper boundary fraction per decomposed dimension.
    pub cell_f1: [f64; DIM],
    /// Upper staggering extreme per decomposed dimension.
    pub cell_f_max0: [f64; DIM],
    /// Lower staggering extreme per decomposed dimension.
    pub cell_f_min1: [f64; DIM],
    /// Boundaries of the neighbor rows one dimension in.
    pub cell_d1: [[f64; 2]; 2],
    /// Boundaries of the neighbor rows two dimensions in.
    pub cell_d2: [[[f64; 2]; 2]; 2],

    // Halo state.
    /// Halo pulse state per decomposed dimension.
    pub cd: [CommDim; DIM],
    /// Largest pulse count over the dimensions.
    pub maxpulse: usize,

    // Redistribution scratch.
    pub(crate) move_buf: Vec<i32>,
    pub(crate) cggl_flag: Vec<Vec<i64>>,
    pub(crate) cgcm_state: Vec<Vec<Rvec>>,

    // Sorting scratch.
    pub(crate) sort: SortBuffers,
    /// Whether the search grid was filled this partitioning.
    pub filled_nsgrid_home: bool,

    /// Load counters and run statistics.
    pub load: LoadTracker,

    // Master bookkeeping.
    /// Whole-system ownership tables, master rank only.
    pub ma: Option<MasterState>,
    /// Whether the master's ownership picture is current.
    pub master_has_all_cg: bool,
    /// Monotone count of partitioning events.
    pub ddp_count: u64,
}

impl DomDec {
    /// Construct the engine for one particle rank. `comm` is the particle
    /// communicator; the rank layout comes from [`choose_decomposition`].
    pub fn init(
        comm: DdComm,
        env: DdEnv,
        opts: &DdOptions,
        sys: &SystemInfo,
        topology: &RankTopology,
        boxm: &BoxMatrix,
    ) -> Result<Self, SetupError> {
        let nc = topology.nc;
        let nnodes = topology.nnodes_dd;
        let npme = topology.npme;

        info!(nx = nc[0], ny = nc[1], nz = nc[2], npme, "initializing the domain decomposition");

        if nnodes != comm.nranks() {
            return Err(SetupError::GridSizeMismatch {
                ncells: nnodes,
                npp: comm.nranks(),
                ntot: comm.nranks() + npme,
            });
        }
        if sys.pbc == PbcKind::Xy && sys.nwall < 2 && nc[2] > 1 {
            return Err(SetupError::PbcZForbidden);
        }

        let inter_cg_bondeds = sys.cgs.ncg() > sys.nmol;
        let inter_cg_multibody = inter_cg_bondeds && sys.multi_body_bonded_count > 0;

        // Load recording is always available in-process; flop mode only
        // changes the metric.
        let record_load = true;
        let dlb = opts.dlb && record_load;
        let grid_jump = dlb;

        let mut cutoff_mbody = opts.comm_distance_min;
        let mut cellsize_limit = cutoff_mbody;
        if sys.constraint_count > 0 && inter_cg_bondeds {
            let rconstr = if opts.rconstr > 0.0 { opts.rconstr } else { sys.constraint_r_max };
            debug!(rconstr, "constraint distance limits the cell size");
            cellsize_limit = cellsize_limit.max(rconstr);
        }

        let rank = comm.rank;
        let ci = ddindex2xyz(&nc, rank);

        // Decomposition dimension order.
        let mut dims = [0usize; DIM];
        let mut ndim = 0;
        if env.order_zyx {
            for dim in (0..DIM).rev() {
                if nc[dim] > 1 {
                    dims[ndim] = dim;
                    ndim += 1;
                }
            }
        } else {
            for dim in 0..DIM {
                if nc[dim] > 1 {
                    dims[ndim] = dim;
                    ndim += 1;
                }
            }
        }

        let mut slb_frac: [Option<Vec<f64>>; DIM] = Default::default();
        if !dlb {
            slb_frac[0] = crate::cells::get_slb_frac(0, nc[0], opts.sizex.as_deref())?;
            slb_frac[1] = crate::cells::get_slb_frac(1, nc[1], opts.sizey.as_deref())?;
            slb_frac[2] = crate::cells::get_slb_frac(2, nc[2], opts.sizez.as_deref())?;
        }

        let tric = set_tric_dir(&nc, boxm)?;

        let mut neighbor = [[0usize; 2]; DIM];
        for d in 0..ndim {
            let (fwd, bwd) = neighbor_ranks(&nc, &ci, dims[d]);
            neighbor[d] = [fwd, bwd];
            debug!(dim = dims[d], fwd, bwd, "neighbor ranks");
        }

        let zones = setup_zones(&nc, &dims, ndim);

        // Row communicators: a rank participates in the row of dimension d
        // only when it sits at coordinate zero of every deeper dimension,
        // so the reductions can cascade inner row → outer row → master.
        let mut row_comm: [Option<RowComm>; DIM] = Default::default();
        let mut root: [Option<RowRoot>; DIM] = Default::default();
        for d in 0..ndim {
            let dim = dims[d];
            let in_row = (d + 1..ndim).all(|d1| ci[dims[d1]] == 0);
            if in_row {
                let members: Vec<usize> = (0..nc[dim])
                    .map(|k| {
                        let mut c = ci;
                        c[dim] = k;
                        dd_index(&nc, &c)
                    })
                    .collect();
                let rc = RowComm { members, my_pos: ci[dim] };
                if grid_jump && rc.is_root() {
                    let row_len = nc[dim] + 1 + d * 2 + 1;
                    root[d] = Some(RowRoot::new(nc[dim], row_len));
                }
                row_comm[d] = Some(rc);
            }
        }

        // The decomposition cut-off and, under dynamic balancing, the
        // pulse counts and the derived minimum cell sizes.
        let cutoff = sys.rlist_long().max(cutoff_mbody);
        debug!(cutoff, "decomposition cut-off");

        let mut cd: [CommDim; DIM] = Default::default();
        let mut maxpulse = 1;
        let mut cellsize_min = [0.0; DIM];
        for d in 0..DIM {
            cellsize_min[d] = boxm[(d, d)] * tric.skew_fac[d];
        }
        if dlb {
            cellsize_limit = cellsize_limit.max(cutoff_mbody);

            // The maximum required number of pulses, rounded down slightly
            // to avoid the latency of an extra pulse when the cut-off is
            // only just above the cell size.
            let mut npulse = if cellsize_limit >= cutoff {
                1
            } else if cellsize_limit > 0.0 {
                (0.96 + cutoff / cellsize_limit) as usize
            } else {
                zones.nzone
            };
            if npulse > 1 {
                // See if fewer pulses suffice given the allowed shrink.
                let mut npulse_d_max = 0;
                for d in 0..ndim {
                    let dim = dims[d];
                    let npulse_d = 1
                        + (nc[dim] as f64 * cutoff
                            / (boxm[(dim, dim)] * tric.skew_fac[dim] * opts.dlb_scale))
                            as usize;
                    npulse_d_max = npulse_d_max.max(npulse_d);
                }
                npulse = npulse.min(npulse_d_max);
            }
            if env.npulse > 0 {
                npulse = env.npulse as usize;
            }

            maxpulse = 1;
            for d in 0..ndim {
                let np = npulse.min(nc[dims[d]] - 1);
                cd[d].np = np;
                cd[d].ind = vec![Default::default(); np];
                maxpulse = maxpulse.max(np);
            }

            cellsize_limit = cellsize_limit.max(cutoff / maxpulse as f64);
            cellsize_limit = cellsize_limit.max(cutoff_mbody);
            for d in 0..ndim {
                let np = cd[d].np;
                cellsize_min[dims[d]] = if np as f64 * cellsize_limit >= cutoff {
                    cellsize_limit
                } else {
                    cutoff / np as f64
                };
            }
            if cutoff_mbody <= 0.0 {
                cutoff_mbody = cellsize_limit;
            }
            info!(
                pulses = ?(0..ndim).map(|d| cd[d].np).collect::<Vec<_>>(),
                min_cell = cellsize_limit,
                "dynamic load balancing limits"
            );
        }

        let sim_rank = comm.group[comm.rank];
        let mut pme = PmeInfo {
            topology: Some(topology.clone()),
            ..Default::default()
        };
        if sys.pme.is_some() {
            pme.npmenodes = if npme > 0 { npme } else { nnodes };
            if npme > 0 {
                pme.pme_nodeid = topology.pme_rank_of(sim_rank);
                pme.receive_vir_ener = topology.receive_vir_ener(sim_rank);
            }
        }

        let natoms_global = sys.cgs.natoms();
        let ncg_global = sys.cgs.ncg();

        let mut load = LoadTracker::new(record_load, env.eflop, rank);
        load.dim_load = vec![DimLoad::default(); ndim.max(1)];

        let mut comm = comm;
        comm.ordered_two_phase = env.sendrecv2;

        let dd = Self {
            ma: if rank == 0 { Some(MasterState::new(nnodes, ncg_global)) } else { None },
            comm,
            env,
            nc,
            nnodes,
            ci,
            master_ci: [0; DIM],
            ndim,
            dims,
            neighbor,
            zones,
            gcgs: sys.cgs.clone(),
            pme,
            cutoff,
            cutoff_mbody,
            cellsize_min,
            cellsize_limit,
            dlb,
            grid_jump,
            dlb_scale: opts.dlb_scale,
            dynamic_box: sys.dynamic_box,
            inter_cg_bondeds,
            inter_cg_multibody,
            slb_frac,
            tric,
            cell_x0: Rvec::zeros(),
            cell_x1: Rvec::zeros(),
            cell_ns_x0: Rvec::zeros(),
            cell_ns_x1: Rvec::zeros(),
            old_cell_x0: Rvec::zeros(),
            old_cell_x1: Rvec::zeros(),
            ncg_home: 0,
            nat_home: 0,
            ncg_tot: 0,
            nat_tot: 0,
            index_gl: Vec::new(),
            cgindex: vec![0],
            gatindex: Vec::new(),
            ga2la: GlobalAtomMap::new(natoms_global),
            nat: [0; ROLE_COUNT],
            ncg_zone: [0; MAX_ZONES + 1],
            zone_ncg1: [0; MAX_ZONES],
            row_comm,
            root,
            cell_f_row: Vec::new(),
            cell_f0: [0.0; DIM],
            cell_f1: [0.0; DIM],
            cell_f_max0: [0.0; DIM],
            cell_f_min1: [0.0; DIM],
            cell_d1: [[0.0; 2]; 2],
            cell_d2: [[[0.0; 2]; 2]; 2],
            cd,
            maxpulse,
            move_buf: Vec::new(),
            cggl_flag: vec![Vec::new(); DIM * 2],
            cgcm_state: vec![Vec::new(); DIM * 2],
            sort: SortBuffers::default(),
            filled_nsgrid_home: false,
            load,
            master_has_all_cg: false,
            ddp_count: 0,
        };

        let mut dd = dd;
        if sys.pme.is_some() {
            dd.set_pme_x_limits();
            dd.set_slb_pme_dim_f();
        }

        Ok(dd)
    }

    /// The pair cut-off covered by the halo.
    pub fn cutoff(&self) -> f64 {
        self.cutoff
    }

    /// The multi-body bonded cut-off covered by the halo.
    pub fn cutoff_mbody(&self) -> f64 {
        self.cutoff_mbody
    }

    /// The current bound on the PME slab shift.
    pub fn pme_maxshift(&self) -> i32 {
        self.pme.maxshift
    }

    /// Upper atom bound of the virtual-site role.
    pub fn natoms_vsite(&self) -> usize {
        self.nat[AtomRole::Vsite as usize]
    }

    /// Atom range of the constraint role.
    pub fn constraint_range(&self) -> (usize, usize) {
        (self.nat[AtomRole::Con as usize - 1], self.nat[AtomRole::Con as usize])
    }

    /// Global atom number (1-based, as reported to users) of a local atom.
    pub fn glatnr(&self, i: usize) -> usize {
        assert!(
            i < self.nat[ROLE_COUNT - 1],
            "local atom {i} is beyond the local range {}",
            self.nat[ROLE_COUNT - 1]
        );
        self.gatindex[i] + 1
    }

    /// Whether the search grid was filled with the home groups this
    /// partitioning.
    pub fn filled_nsgrid_home(&self) -> bool {
        self.filled_nsgrid_home
    }

    /// Charge-group pair-search ranges of the interaction zone containing
    /// `icg`: the j-range plus the allowed shift bounds per dimension.
    pub fn get_ns_ranges(&self, icg: usize) -> (usize, usize, [i32; DIM], [i32; DIM]) {
        let mut izone = 0;
        while icg >= self.zones.izone[izone].cg1 {
            izone += 1;
            assert!(izone < self.zones.nizone, "group {icg} is outside the interaction zones");
        }
        let iz: &IZone = &self.zones.izone[izone];
        let jcg0 = if izone == 0 { icg } else { iz.jcg0 };
        let jcg1 = iz.jcg1;

        let mut shift0 = iz.shift0;
        let mut shift1 = iz.shift1;
        for d in 0..self.ndim {
            let dim = self.dims[d];
            if self.tric.tric_dir[dim] || (self.grid_jump && d > 0) {
                // A conservative approach, this can be optimized.
                shift0[dim] -= 1;
                shift1[dim] += 1;
            }
        }
        (jcg0, jcg1, shift0, shift1)
    }

    /// Rebuild the local→global and global→local atom tables from zone
    /// group `cg_start` onwards.
    pub(crate) fn make_dd_indices(&mut self, cg_start: usize, fr: &mut ForceRec) {
        ensure_len(&mut self.gatindex, self.nat_tot);
        ensure_len(&mut fr.cginfo, self.ncg_tot.max(1));

        let nzone = self.zones.nzone;
        let mut a = self.cgindex[cg_start];
        for zone in 0..nzone {
            let cg0 = if zone == 0 { cg_start } else { self.ncg_zone[zone] };
            for cg in cg0..self.ncg_zone[zone + 1] {
                let mut zone1 = zone as i32;
                if cg - cg0 >= self.zone_ncg1[zone] {
                    // This group came from more than one cell away.
                    zone1 += nzone as i32;
                }
                let cg_gl = self.index_gl[cg];
                for a_gl in self.gcgs.atom_range(GlobalCg(cg_gl)) {
                    self.gatindex[a] = a_gl;
                    self.ga2la.set(a_gl, zone1, a);
                    a += 1;
                }
                fr.cginfo[cg] = fr.cginfo_global[cg_gl];
            }
        }
    }

    /// Clear the global→local entries from local atom `a_start` on,
    /// without touching the rest of the system.
    pub(crate) fn clear_dd_indices(&mut self, a_start: usize) {
        for i in a_start..self.nat_tot.min(self.gatindex.len()) {
            self.ga2la.clear(self.gatindex[i]);
        }
    }

    /// Fill the per-izone charge-group boundaries after a halo build.
    fn set_cg_boundaries(&mut self) {
        for c in 0..self.zones.nizone {
            let (j0, j1) = (self.zones.izone[c].j0, self.zones.izone[c].j1);
            self.zones.izone[c].cg1 = self.ncg_zone[c + 1];
            self.zones.izone[c].jcg0 = self.ncg_zone[j0];
            self.zones.izone[c].jcg1 = self.ncg_zone[j1];
        }
    }

    /// Recompute the home charge-group centers from the positions.
    fn calc_cg_centers(&self, x: &[Rvec], fr: &mut ForceRec) {
        ensure_len(&mut fr.cg_cm, self.ncg_home.max(1));
        for cg in 0..self.ncg_home {
            let r = self.cgindex[cg]..self.cgindex[cg + 1];
            let n = r.len();
            fr.cg_cm[cg] = if n == 1 {
                x[r.start]
            } else {
                let mut cm = Rvec::zeros();
                for k in r {
                    cm += x[k];
                }
                cm / n as f64
            };
        }
    }

    /// One full (re)partitioning of the system.
    ///
    /// With `master_state` set the ownership is rebuilt from the global
    /// state on the master; otherwise the home groups are redistributed
    /// incrementally (restoring from a checkpointed local state first when
    /// its generation lags).
    pub fn partition(
        &mut self,
        step: i64,
        master_state: bool,
        mut state_global: Option<&mut State>,
        state_local: &mut State,
        fr: &mut ForceRec,
        collab: &mut Collaborators<'_>,
    ) -> Result<(), PartitionError> {
        // Report the load when we have measurements.
        if self.load.record && self.load.count() > 0 {
            self.get_load_distribution();
            if self.comm.is_master() {
                self.print_load(step - 1);
            }
            self.load.first_printed = true;
        }

        let mut redist = false;
        let mut cg0 = 0usize;
        if master_state {
            if self.comm.is_master() {
                let sg = state_global.as_deref_mut().expect("the master provides the global state");
                let boxm = sg.boxm;
                self.get_cg_distribution(step, &boxm, Some(&mut sg.x))?;
            } else {
                let boxm = state_local.boxm;
                self.get_cg_distribution(step, &boxm, None)?;
            }
            self.distribute_state(state_global.as_deref(), state_local);
            self.calc_cg_centers(&state_local.x, fr);
        } else if state_local.ddp_count != self.ddp_count {
            if state_local.ddp_count > self.ddp_count {
                return Err(PartitionError::StateAhead {
                    state_count: state_local.ddp_count,
                    dd_count: self.ddp_count,
                });
            }
            if state_local.ddp_count_cg_gl != state_local.ddp_count {
                return Err(PartitionError::CheckpointMismatch {
                    cg_gl_count: state_local.ddp_count_cg_gl,
                    state_count: state_local.ddp_count,
                });
            }

            // Restore the partition from the checkpointed ownership.
            self.clear_dd_indices(0);
            self.rebuild_cgindex(state_local);
            self.ncg_zone[0] = 0;
            for i in 1..=self.zones.nzone {
                self.ncg_zone[i] = self.ncg_home;
            }
            self.zone_ncg1[0] = self.ncg_home;
            self.ncg_tot = self.ncg_home;
            self.nat_tot = self.nat_home;
            self.make_dd_indices(0, fr);
            self.calc_cg_centers(&state_local.x, fr);

            redist = self.dlb;
        } else {
            // The local state is current, only the groups moved.
            redist = true;
        }

        let boxm = state_local.boxm;
        self.set_cell_sizes(&boxm, self.dynamic_box, master_state, false, step)?;
        if self.env.nst_dump_grid > 0 && step % self.env.nst_dump_grid as i64 == 0 {
            debug!(step, x0 = ?self.cell_x0, x1 = ?self.cell_x1, "cell boundary dump");
        }

        self.set_ns_cell_sizes(&boxm, step)?;

        let sort_interval = self.env.nst_sort_cg;
        let mut sort_cg = if sort_interval > 0 {
            master_state || (redist && step % sort_interval as i64 == 0)
        } else {
            false
        };
        // Sorting needs the search grid.
        sort_cg &= collab.ns_grid.is_some();
        self.filled_nsgrid_home = sort_cg;

        let mut ncg_home_old = None;
        if sort_cg {
            let grid = collab.ns_grid.as_deref_mut().expect("checked above");
            let ncells_old = grid.dims();
            grid.grid_first(&boxm, &self.cell_ns_x0, &self.cell_ns_x1, self.cutoff, self.ncg_home);
            if !master_state && grid.dims() == ncells_old {
                // The old order and cell indices let us sort cheaply.
                ncg_home_old = Some(self.ncg_home);
            }
        }

        if redist {
            let cell_marks = if sort_cg {
                let grid = collab.ns_grid.as_deref_mut().expect("checked above");
                Some((grid.cell_index_mut(), -1))
            } else {
                None
            };
            cg0 = self.redistribute_cg(step, state_local, fr, cell_marks, !sort_cg)?;
            if let Some(grid) = collab.ns_grid.as_deref_mut() {
                grid.set_ncg(self.ncg_home);
            }
        }

        if sort_cg {
            // Sort the state on group search cell; this gives exact
            // restarts and more local pair-search access.
            let grid = collab.ns_grid.as_deref_mut().expect("checked above");
            self.ncg_zone[0] = 0;
            for i in 1..=self.zones.nzone {
                self.ncg_zone[i] = self.ncg_home;
            }
            grid.fill_grid(0, self.ncg_home, &fr.cg_cm);
            let sentinel = 4 * grid.ncells() as i32;
            debug!(step, ncg = self.ncg_home, "sorting the home charge groups");
            self.sort_state(fr, state_local, grid.cell_index_mut(), sentinel, ncg_home_old);
            cg0 = 0;
        }

        // Build the halo and the local indices.
        self.setup_halo(&boxm, fr);
        self.make_dd_indices(cg0, fr);
        self.set_cg_boundaries();

        // Extend the atom range through the special-atom collaborators.
        if let Some(vs) = collab.vsites.as_deref_mut() {
            vs.clear_local_indices();
        }
        if let Some(cs) = collab.constraints.as_deref_mut() {
            cs.clear_local_indices();
        }
        let mut n = self.nat[AtomRole::Zone as usize];
        for role in AtomRole::Vsite as usize..ROLE_COUNT {
            if role == AtomRole::Vsite as usize {
                if let Some(vs) = collab.vsites.as_deref_mut() {
                    n = vs.make_local(self, n);
                }
            } else if let Some(cs) = collab.constraints.as_deref_mut() {
                n = cs.make_local(self, n);
            }
            self.nat[role] = n;
        }

        // Room for the extra construction and constraint atoms.
        let natoms_local = self.nat[ROLE_COUNT - 1];
        if natoms_local > state_local.x.len() {
            state_local.realloc(natoms_local);
        }
        state_local.natoms = natoms_local;

        // Hand the charges and the shift bound to the reciprocal side.
        if self.pme.pme_nodeid.is_some() {
            if let Some(pme) = collab.pme.as_deref_mut() {
                pme.send_charges(collab.charges, self.pme.maxshift);
            }
        }

        self.add_statistics();
        // Only count the cycles of the coming interval.
        self.load.clear_counts();

        if self.env.nst_dump > 0 && step % self.env.nst_dump as i64 == 0 {
            self.move_x(&boxm, &mut state_local.x);
            debug!(
                step,
                nat_home = self.nat_home,
                nat_tot = self.nat_tot,
                "home and halo coordinate dump"
            );
        }

        self.ddp_count += 1;
        state_local.ddp_count = self.ddp_count;

        Ok(())
    }
}

// ============================================================================
// Multi-rank scenario tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::Network;
    use crate::system::STATE_HAS_V;
    use std::sync::Arc;
    use std::thread;

    const L: f64 = 10.0;
    const CUTOFF: f64 = 2.5;

    /// Install the test log subscriber once; `RUST_LOG` filters as usual.
    fn trace_init() {
        use std::sync::Once;
        static ONCE: Once = Once::new();
        ONCE.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }

    fn cube(len: f64) -> BoxMatrix {
        BoxMatrix::from_fn(|r, c| if r == c { len } else { 0.0 })
    }

    fn sys_info(natoms: usize, cutoff: f64) -> SystemInfo {
        SystemInfo {
            cgs: GlobalCgs::single_atom_groups(natoms),
            nmol: natoms,
            multi_body_bonded_count: 0,
            constraint_count: 0,
            constraint_r_max: 0.0,
            bonded_pbcdx_ratio: 0.0,
            pbc: PbcKind::Xyz,
            nwall: 0,
            dynamic_box: false,
            pressure_coupling: false,
            pme: None,
            rlist: cutoff,
            rcoulomb: cutoff,
            rvdw: cutoff,
        }
    }

    fn run_ranks<T, F>(n: usize, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(usize, DdComm) -> T + Send + Sync + 'static,
    {
        let boxes = Network::new(n);
        let f = Arc::new(f);
        let handles: Vec<_> = boxes
            .into_iter()
            .enumerate()
            .map(|(rank, mb)| {
                let f = f.clone();
                thread::spawn(move || f(rank, DdComm::all(mb, n)))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    /// Positions of the standard 8-atom lattice along x.
    fn lattice() -> Vec<Rvec> {
        (0..8).map(|k| Rvec::new(0.625 + 1.25 * k as f64, 1.0, 1.0)).collect()
    }

    fn init_two_ranks(comm: DdComm) -> (DomDec, ForceRec, State, Option<State>) {
        let sys = sys_info(8, CUTOFF);
        let opts = DdOptions { nc: Some([2, 1, 1]), npme: Some(0), ..Default::default() };
        let boxm = cube(L);
        let topo = choose_decomposition(&opts, &sys, &boxm, 2).unwrap();
        let rank = comm.rank;
        let dd = DomDec::init(comm, DdEnv::default(), &opts, &sys, &topo, &boxm).unwrap();
        let fr = ForceRec::new(8);
        let state_local = State::new(0, STATE_HAS_V);
        let state_global = (rank == 0).then(|| {
            let mut sg = State::new(8, STATE_HAS_V);
            sg.boxm = boxm;
            for (i, p) in lattice().into_iter().enumerate() {
                sg.x[i] = p;
                sg.v[i] = Rvec::new(i as f64, -1.0, 0.0);
            }
            sg
        });
        (dd, fr, state_local, state_global)
    }

    #[derive(Debug)]
    struct RankReport {
        home: Vec<usize>,
        zone: Vec<usize>,
        zone_x: Vec<Rvec>,
        nat: [usize; ROLE_COUNT],
        roundtrip_ok: bool,
        move_x_stable: bool,
        force_sum_before: f64,
        force_sum_home_after: f64,
        checkpoint: Vec<usize>,
        stale_rejected: bool,
    }

    #[test]
    fn two_rank_partition_halo_and_state_roundtrip() {
        trace_init();
        let out = run_ranks(2, |_rank, comm| {
            let (mut dd, mut fr, mut state_local, mut state_global) = init_two_ranks(comm);
            let mut collab = Collaborators::default();
            dd.partition(0, true, state_global.as_mut(), &mut state_local, &mut fr, &mut collab)
                .unwrap();

            let home: Vec<usize> = dd.index_gl[..dd.ncg_home].to_vec();
            let zone: Vec<usize> = dd.index_gl[dd.ncg_home..dd.ncg_tot].to_vec();

            // Push the coordinates twice; the halo must be bit-stable.
            let boxm = state_local.boxm;
            dd.move_x(&boxm, &mut state_local.x);
            let first: Vec<Rvec> = state_local.x[dd.nat_home..dd.nat_tot].to_vec();
            dd.move_x(&boxm, &mut state_local.x);
            let move_x_stable = state_local.x[dd.nat_home..dd.nat_tot] == first[..];

            // Pull forces back; the global sum must be conserved.
            let mut f: Vec<Rvec> = (0..dd.nat_tot)
                .map(|i| Rvec::new((dd.gatindex[i] + 1) as f64, 0.0, 0.0))
                .collect();
            let force_sum_before: f64 = f.iter().map(|v| v.x).sum();
            let mut fshift = vec![Rvec::zeros(); crate::halo::SHIFTS];
            dd.move_f(&mut f, Some(&mut fshift));
            let force_sum_home_after: f64 = f[..dd.nat_home].iter().map(|v| v.x).sum();

            // Master gather / scatter round trip.
            let mut collected = State::new(if dd.comm.is_master() { 8 } else { 0 }, STATE_HAS_V);
            dd.collect_state(&state_local, &mut collected);
            let mut redistributed = State::new(0, STATE_HAS_V);
            redistributed.flags = STATE_HAS_V;
            dd.distribute_state(
                dd.comm.is_master().then_some(&collected),
                &mut redistributed,
            );
            let roundtrip_ok = redistributed.x[..dd.nat_home] == state_local.x[..dd.nat_home]
                && redistributed.v[..dd.nat_home] == state_local.v[..dd.nat_home];

            // Checkpoint snapshot and the stale-generation check.
            dd.store_state(&mut state_local).unwrap();
            let checkpoint = state_local.cg_gl.clone();
            state_local.ddp_count += 1;
            let stale_rejected =
                matches!(dd.store_state(&mut state_local), Err(PartitionError::StaleState { .. }));
            state_local.ddp_count -= 1;

            RankReport {
                home,
                zone,
                zone_x: first,
                nat: dd.nat,
                roundtrip_ok,
                move_x_stable,
                force_sum_before,
                force_sum_home_after,
                checkpoint,
                stale_rejected,
            }
        });

        // Ownership: disjoint, complete, split at x = 5.
        assert_eq!(out[0].home, vec![0, 1, 2, 3]);
        assert_eq!(out[1].home, vec![4, 5, 6, 7]);

        // Halo contents: the groups within the cut-off of the boundary the
        // rank serves. Rank 1 receives rank 0's groups over the periodic
        // edge, shifted by +L.
        assert_eq!(out[0].zone, vec![4, 5]);
        assert_eq!(out[1].zone, vec![0, 1]);
        assert_eq!(out[1].zone_x[0], Rvec::new(0.625 + L, 1.0, 1.0));
        assert_eq!(out[1].zone_x[1], Rvec::new(1.875 + L, 1.0, 1.0));

        for r in &out {
            // Role ranges are monotone and zone-closed.
            assert!(r.nat[0] <= r.nat[1] && r.nat[1] <= r.nat[2] && r.nat[2] <= r.nat[3]);
            assert_eq!(r.nat[0], 4);
            assert_eq!(r.nat[1], 6);
            assert!(r.move_x_stable);
            assert!(r.roundtrip_ok);
            assert_eq!(r.checkpoint, r.home);
            assert!(r.stale_rejected);
        }

        // Halo completeness: every pair within the cut-off under periodic
        // boundaries must be visible on at least one of the two owners
        // (the halo covers the forward octant only, so each pair appears
        // exactly once).
        let x = lattice();
        for a in 0..8 {
            for b in a + 1..8 {
                let mut dx = (x[a].x - x[b].x).abs();
                dx = dx.min(L - dx);
                if dx < CUTOFF {
                    let sees = |r: &RankReport, g: usize| r.home.contains(&g) || r.zone.contains(&g);
                    let owner_a = out.iter().find(|r| r.home.contains(&a)).unwrap();
                    let owner_b = out.iter().find(|r| r.home.contains(&b)).unwrap();
                    assert!(
                        sees(owner_a, b) || sees(owner_b, a),
                        "pair ({a},{b}) missing from both owners' halos"
                    );
                }
            }
        }

        // Force conservation across the pull.
        let total_before: f64 = out.iter().map(|r| r.force_sum_before).sum();
        let total_after: f64 = out.iter().map(|r| r.force_sum_home_after).sum();
        assert!((total_before - total_after).abs() < 1e-9);
    }

    // ------------------------------------------------------------------

    /// A one-cell search grid: good enough to drive the sorting path.
    struct TestGrid {
        cells: Vec<i32>,
    }

    impl NeighborSearchGrid for TestGrid {
        fn grid_first(&mut self, _b: &BoxMatrix, _x0: &Rvec, _x1: &Rvec, _c: f64, ncg: usize) {
            self.cells.resize(ncg, 0);
        }
        fn dims(&self) -> IVec {
            [1, 1, 1]
        }
        fn ncells(&self) -> usize {
            1
        }
        fn fill_grid(&mut self, cg0: usize, cg1: usize, _cg_cm: &[Rvec]) {
            if self.cells.len() < cg1 {
                self.cells.resize(cg1, 0);
            }
            for c in &mut self.cells[cg0..cg1] {
                *c = if *c == -1 { 4 } else { 0 };
            }
        }
        fn cell_index_mut(&mut self) -> &mut [i32] {
            &mut self.cells
        }
        fn set_ncg(&mut self, ncg: usize) {
            self.cells.resize(ncg, 0);
        }
    }

    #[test]
    fn redistribution_wraps_group_over_the_periodic_edge() {
        // Three cells along x; the group at the far edge drifts out of the
        // box and must re-enter at rank 0, wrapped by one box vector.
        let out = run_ranks(3, |_rank, comm| {
            let natoms = 6;
            let sys = sys_info(natoms, 1.0);
            let opts = DdOptions { nc: Some([3, 1, 1]), npme: Some(0), ..Default::default() };
            let boxm = cube(9.0);
            let topo = choose_decomposition(&opts, &sys, &boxm, 3).unwrap();
            let rank = comm.rank;
            let mut dd = DomDec::init(comm, DdEnv::default(), &opts, &sys, &topo, &boxm).unwrap();
            let mut fr = ForceRec::new(natoms);
            let mut state_local = State::new(0, 0);
            let mut state_global = (rank == 0).then(|| {
                let mut sg = State::new(natoms, 0);
                sg.boxm = boxm;
                // Two atoms per cell, the last one close to the upper edge.
                let xs = [0.8, 2.2, 3.8, 5.2, 6.8, 8.8];
                for (i, &xi) in xs.iter().enumerate() {
                    sg.x[i] = Rvec::new(xi, 0.5, 0.5);
                }
                sg
            });
            let mut grid = TestGrid { cells: Vec::new() };
            let mut collab = Collaborators { ns_grid: Some(&mut grid), ..Default::default() };
            dd.partition(0, true, state_global.as_mut(), &mut state_local, &mut fr, &mut collab)
                .unwrap();

            // Integrate: the edge atom leaves the box.
            for cg in 0..dd.ncg_home {
                if dd.index_gl[cg] == 5 {
                    state_local.x[dd.cgindex[cg]].x = 9.3;
                }
            }
            dd.partition(1, false, None, &mut state_local, &mut fr, &mut collab).unwrap();

            let home: Vec<usize> = dd.index_gl[..dd.ncg_home].to_vec();
            let pos5 = home
                .iter()
                .position(|&g| g == 5)
                .map(|cg| state_local.x[dd.cgindex[cg]].x);
            (home, pos5)
        });

        // The wandering group landed on rank 0, wrapped into the box.
        assert!(out[0].0.contains(&5));
        assert!(!out[2].0.contains(&5));
        let x5 = out[0].1.unwrap();
        assert!((x5 - 0.3).abs() < 1e-9, "got {x5}");
        // Ownership is still a disjoint cover, and sorted per rank by the
        // global index (the one-cell grid sorts on the tie-break).
        let mut all: Vec<usize> = out.iter().flat_map(|(h, _)| h.iter().copied()).collect();
        for (h, _) in &out {
            assert!(h.windows(2).all(|w| w[0] < w[1]));
        }
        all.sort_unstable();
        assert_eq!(all, (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn group_moving_too_far_is_a_fatal_error() {
        let out = run_ranks(2, |_rank, comm| {
            let (mut dd, mut fr, mut state_local, mut state_global) = init_two_ranks(comm);
            let mut collab = Collaborators::default();
            dd.partition(0, true, state_global.as_mut(), &mut state_local, &mut fr, &mut collab)
                .unwrap();
            // Teleport every rank's first atom well past the allowed
            // displacement, so all ranks fail before any exchange.
            state_local.x[0].x += 2.0 * L;
            let err = dd
                .partition(1, false, None, &mut state_local, &mut fr, &mut collab)
                .unwrap_err();
            matches!(err, PartitionError::CgMove(_))
        });
        assert!(out.iter().all(|&e| e));
    }

    #[test]
    fn two_pulses_reach_the_second_neighbor() {
        // Four thin cells with a cut-off wider than one cell: the halo
        // needs two pulses, and the second pulse forwards groups received
        // in the first.
        let out = run_ranks(4, |_rank, comm| {
            let natoms = 4;
            let mut sys = sys_info(natoms, 3.0);
            sys.pme = Some(PmeParams { nkx: 16, nky: 16, load_estimate: 0.0 });
            let opts = DdOptions { nc: Some([4, 1, 1]), npme: Some(0), ..Default::default() };
            let boxm = cube(8.0);
            let topo = choose_decomposition(&opts, &sys, &boxm, 4).unwrap();
            let rank = comm.rank;
            let mut dd = DomDec::init(comm, DdEnv::default(), &opts, &sys, &topo, &boxm).unwrap();
            let mut fr = ForceRec::new(natoms);
            let mut state_local = State::new(0, 0);
            let mut state_global = (rank == 0).then(|| {
                let mut sg = State::new(natoms, 0);
                sg.boxm = boxm;
                for i in 0..natoms {
                    sg.x[i] = Rvec::new(0.9 + 2.0 * i as f64, 1.0, 1.0);
                }
                sg
            });
            let mut collab = Collaborators::default();
            dd.partition(0, true, state_global.as_mut(), &mut state_local, &mut fr, &mut collab)
                .unwrap();
            let zone: Vec<usize> = dd.index_gl[dd.ncg_home..dd.ncg_tot].to_vec();
            (dd.cd[0].np, zone, dd.pme_maxshift())
        });

        for (np, zone, maxshift) in &out {
            assert_eq!(*np, 2);
            assert_eq!(zone.len(), 2);
            // Uniform grid with one slab per cell keeps the shift minimal.
            assert_eq!(*maxshift, 1);
        }
        // Rank 0 sees its first and second forward neighbors.
        assert_eq!(out[0].1, vec![1, 2]);
    }

    #[test]
    fn uniform_load_leaves_dynamic_boundaries_fixed() {
        let out = run_ranks(2, |_rank, comm| {
            let sys = sys_info(8, CUTOFF);
            let opts = DdOptions {
                nc: Some([2, 1, 1]),
                npme: Some(0),
                dlb: true,
                ..Default::default()
            };
            let boxm = cube(L);
            let topo = choose_decomposition(&opts, &sys, &boxm, 2).unwrap();
            let rank = comm.rank;
            let mut dd = DomDec::init(comm, DdEnv::default(), &opts, &sys, &topo, &boxm).unwrap();
            let mut fr = ForceRec::new(8);
            let mut state_local = State::new(0, 0);
            let mut state_global = (rank == 0).then(|| {
                let mut sg = State::new(8, 0);
                sg.boxm = boxm;
                for (i, p) in lattice().into_iter().enumerate() {
                    sg.x[i] = p;
                }
                sg
            });
            let mut collab = Collaborators::default();
            dd.partition(0, true, state_global.as_mut(), &mut state_local, &mut fr, &mut collab)
                .unwrap();

            // Equal measured loads: the balanced boundaries must not move.
            dd.load.cycles_add(crate::load::DdCycle::Force, 100.0);
            dd.partition(1, false, None, &mut state_local, &mut fr, &mut collab).unwrap();
            let balanced = (dd.cell_x1[0], dd.cell_x0[0]);

            // Now rank 0 reports double the cycles: its cell must shrink,
            // and no cell may drop below the minimum.
            dd.load.cycles_add(
                crate::load::DdCycle::Force,
                if dd.comm.rank == 0 { 200.0 } else { 100.0 },
            );
            dd.partition(2, false, None, &mut state_local, &mut fr, &mut collab).unwrap();
            let shrunk = (dd.cell_x1[0], dd.cell_x0[0]);
            let min_cell = dd.cellsize_limit;
            (balanced, shrunk, min_cell)
        });

        // Uniform load: boundaries within tolerance of the uniform split.
        assert!((out[0].0 .0 - 5.0).abs() < 1e-6);
        assert!((out[1].0 .1 - 5.0).abs() < 1e-6);
        // Imbalanced load: the boundary moved towards the loaded cell.
        assert!(out[0].1 .0 < 5.0 - 1e-6);
        assert!((out[0].1 .0 - out[1].1 .1).abs() < 1e-9);
        // Neither cell below the minimum size.
        assert!(out[0].1 .0 >= out[0].2);
        assert!(L - out[1].1 .1 >= out[1].2);
    }

    #[test]
    fn grid_jump_aborts_with_axis_and_cell() {
        // A 2x2 grid on one constructed rank; the staggering state is set
        // to an impossible shift directly.
        let mut boxes = Network::new(4);
        let mb = boxes.remove(0);
        let comm = DdComm::new(mb, (0..4).collect());
        let sys = sys_info(8, CUTOFF);
        let opts = DdOptions { nc: Some([2, 2, 1]), npme: Some(0), ..Default::default() };
        let boxm = cube(L);
        let topo = choose_decomposition(&opts, &sys, &boxm, 4).unwrap();
        let mut dd = DomDec::init(comm, DdEnv::default(), &opts, &sys, &topo, &boxm).unwrap();
        dd.cd[0].np = 1;
        dd.cd[1].np = 1;
        dd.tric = set_tric_dir(&dd.nc, &boxm).unwrap();
        dd.cell_f0 = [0.0, 0.0, 0.0];
        dd.cell_f1 = [0.5, 0.5, 0.0];
        // The neighbor row's upper extreme overlaps far into this cell.
        dd.cell_f_max0[1] = 0.9;
        dd.cell_f_min1[1] = 0.95;
        let err = dd.check_grid_jump(7, &boxm).unwrap_err();
        match err {
            CellSizeError::GridJump { step, dim, ci } => {
                assert_eq!(step, 7);
                assert_eq!(dim, 'Y');
                assert_eq!(ci, [0, 0, 0]);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn checkpoint_restore_rebuilds_the_same_partition() {
        let out = run_ranks(2, |_rank, comm| {
            let (mut dd, mut fr, mut state_local, mut state_global) = init_two_ranks(comm);
            let mut collab = Collaborators::default();
            dd.partition(0, true, state_global.as_mut(), &mut state_local, &mut fr, &mut collab)
                .unwrap();
            dd.store_state(&mut state_local).unwrap();
            let home_before: Vec<usize> = dd.index_gl[..dd.ncg_home].to_vec();

            // Pretend the engine was rebuilt: the local state lags the
            // engine's generation and carries the checkpointed ownership.
            dd.ddp_count += 1;
            dd.partition(2, false, None, &mut state_local, &mut fr, &mut collab).unwrap();
            let home_after: Vec<usize> = dd.index_gl[..dd.ncg_home].to_vec();
            home_before == home_after
        });
        assert!(out.iter().all(|&ok| ok));
    }
}
