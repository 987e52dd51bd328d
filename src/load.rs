//! Load measurement, row-wise collection and run statistics
//!
//! Once per balancing interval every rank contributes a short vector of
//! floats (force cycles, maxima, staggering extremes, PME cycles, a flag
//! word) to a gather along its row communicator, walking the dimensions
//! inner→outer so each row root folds its row into a single record that the
//! next-outer row carries further. The outermost record lands on the
//! decomposition master, which accumulates the run statistics.
//!
//! The load metric is the measured force cycle count by default; a flop
//! estimate can be selected instead, optionally with a few percent of random
//! perturbation for exercising the balancing logic.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::geometry::dim_char;
use crate::partition::DomDec;
use crate::system::ROLE_COUNT;
use crate::DIM;

/// Cycle-counter buckets.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DdCycle {
    /// Whole MD step.
    Step = 0,
    /// Particle work overlapping the reciprocal-space wait.
    PpDuringPme = 1,
    /// Force computation.
    Force = 2,
    /// Reciprocal-space wait.
    Pme = 3,
}

/// Number of cycle buckets.
pub const CYCL_NR: usize = 4;

/// Maximum number of floats one cell contributes to a load row.
pub const NLOAD_MAX: usize = 9;

/// Reduced load record of one dimension row.
#[derive(Clone, Debug, Default)]
pub struct DimLoad {
    /// Number of floats each cell contributed in the last collection.
    pub nload: usize,
    /// Raw row gather buffer, stride `nload` (row root only).
    pub load: Vec<f64>,
    /// Total load of the row.
    pub sum: f64,
    /// Largest per-cell load of the row.
    pub max: f64,
    /// Sum used for balancing; switches to a scaled maximum when the row
    /// hit a size limit.
    pub sum_m: f64,
    /// Smallest relative cell volume in the row.
    pub cvol_min: f64,
    /// Largest particle-force cycle count in the row.
    pub mdf: f64,
    /// Largest reciprocal-space cycle count in the row.
    pub pme: f64,
    /// Per-dimension limit flags.
    pub flags: i32,
}

/// Cycle/flop counters plus the per-dimension and whole-run accumulators.
#[derive(Debug)]
pub struct LoadTracker {
    /// Whether load recording is available at all.
    pub record: bool,
    /// 0: cycles; 1: flops; >1: flops with `(eflop-1)*5%` perturbation.
    pub eflop: u32,
    /// Accumulated flop count of the current interval.
    pub flop: f64,
    /// Number of flop samples in the current interval.
    pub flop_n: u32,
    /// Accumulated cycles per bucket for the current interval.
    pub cycl: [f64; CYCL_NR],
    /// Number of cycle samples per bucket.
    pub cycl_n: [u32; CYCL_NR],
    /// Reduced row records, one per decomposed dimension.
    pub dim_load: Vec<DimLoad>,
    /// Whether a load line has been reported at least once.
    pub first_printed: bool,

    /// Load samples accumulated over the run (master rank only).
    pub nload: u64,
    /// Accumulated step cycles over the run.
    pub load_step: f64,
    /// Accumulated total force load over the run.
    pub load_sum: f64,
    /// Accumulated maximum force load over the run.
    pub load_max: f64,
    /// Per-dimension count of size-limited balancing steps.
    pub load_lim: [u64; DIM],
    /// Accumulated particle-force cycles next to separate PME ranks.
    pub load_mdf: f64,
    /// Accumulated reciprocal-space cycles.
    pub load_pme: f64,
    /// Accumulated communicated-atom counts per non-home role.
    pub sum_nat: [f64; ROLE_COUNT - 1],
    /// Number of partitionings accumulated into `sum_nat`.
    pub ndecomp: u64,

    rng: StdRng,
}

impl LoadTracker {
    /// Tracker for one rank; the perturbation stream is seeded per rank so
    /// ranks decorrelate.
    pub fn new(record: bool, eflop: u32, rank: usize) -> Self {
        Self {
            record,
            eflop,
            flop: 0.0,
            flop_n: 0,
            cycl: [0.0; CYCL_NR],
            cycl_n: [0; CYCL_NR],
            dim_load: Vec::new(),
            first_printed: false,
            nload: 0,
            load_step: 0.0,
            load_sum: 0.0,
            load_max: 0.0,
            load_lim: [0; DIM],
            load_mdf: 0.0,
            load_pme: 0.0,
            sum_nat: [0.0; ROLE_COUNT - 1],
            ndecomp: 0,
            rng: StdRng::seed_from_u64(1 + rank as u64),
        }
    }

    /// Number of samples since the last collection.
    #[inline]
    pub fn count(&self) -> u32 {
        if self.eflop > 0 {
            self.flop_n
        } else {
            self.cycl_n[DdCycle::Force as usize]
        }
    }

    /// The per-step force load in the configured metric.
    pub fn force_load(&mut self) -> f64 {
        if self.eflop > 0 {
            let mut load = self.flop;
            if self.eflop > 1 {
                let r: f64 = self.rng.gen();
                load *= 1.0 + (self.eflop - 1) as f64 * (0.1 * r - 0.05);
            }
            load
        } else {
            self.cycl[DdCycle::Force as usize]
        }
    }

    /// Add a cycle measurement to a bucket.
    #[inline]
    pub fn cycles_add(&mut self, bucket: DdCycle, cycles: f64) {
        self.cycl[bucket as usize] += cycles;
        self.cycl_n[bucket as usize] += 1;
    }

    /// Start of a force evaluation in flop mode: remember the baseline.
    pub fn flop_start(&mut self, flop_count: f64) {
        if self.eflop > 0 {
            self.flop -= flop_count;
        }
    }

    /// End of a force evaluation in flop mode.
    pub fn flop_stop(&mut self, flop_count: f64) {
        if self.eflop > 0 {
            self.flop += flop_count;
            self.flop_n += 1;
        }
    }

    /// Reset the counters so only the coming interval is measured.
    pub fn clear_counts(&mut self) {
        self.cycl = [0.0; CYCL_NR];
        self.cycl_n = [0; CYCL_NR];
        self.flop = 0.0;
        self.flop_n = 0;
    }
}

impl DomDec {
    /// Collect the per-dimension load rows, inner→outer, and accumulate the
    /// run statistics on the master.
    pub fn get_load_distribution(&mut self) {
        debug!("collecting the load distribution");
        let sep_pme = self.pme.pme_nodeid.is_some();

        for d in (0..self.ndim).rev() {
            let dim = self.dims[d];
            // Only ranks at coordinate zero of every deeper dimension
            // participate in this row.
            let participates = d == self.ndim - 1
                || (self.ci[self.dims[d + 1]] == 0 && self.ci[self.dims[self.ndim - 1]] == 0);
            if !participates {
                continue;
            }

            let cell_frac =
                if self.grid_jump { self.cell_f1[d] - self.cell_f0[d] } else { 0.0 };

            let mut sbuf = [0.0f64; NLOAD_MAX];
            let mut pos = 0;
            if d == self.ndim - 1 {
                let fl = self.load.force_load();
                sbuf[pos] = fl;
                pos += 1;
                sbuf[pos] = fl;
                pos += 1;
                if self.grid_jump {
                    sbuf[pos] = fl;
                    pos += 1;
                    sbuf[pos] = cell_frac;
                    pos += 1;
                    if d > 0 {
                        sbuf[pos] = self.cell_f_max0[d];
                        pos += 1;
                        sbuf[pos] = self.cell_f_min1[d];
                        pos += 1;
                    }
                }
                if sep_pme {
                    sbuf[pos] = self.load.cycl[DdCycle::PpDuringPme as usize];
                    pos += 1;
                    sbuf[pos] = self.load.cycl[DdCycle::Pme as usize];
                    pos += 1;
                }
            } else {
                let inner = &self.load.dim_load[d + 1];
                sbuf[pos] = inner.sum;
                pos += 1;
                sbuf[pos] = inner.max;
                pos += 1;
                if self.grid_jump {
                    sbuf[pos] = inner.sum_m;
                    pos += 1;
                    sbuf[pos] = inner.cvol_min * cell_frac;
                    pos += 1;
                    sbuf[pos] = inner.flags as f64;
                    pos += 1;
                    if d > 0 {
                        sbuf[pos] = self.cell_f_max0[d];
                        pos += 1;
                        sbuf[pos] = self.cell_f_min1[d];
                        pos += 1;
                    }
                }
                if sep_pme {
                    sbuf[pos] = inner.mdf;
                    pos += 1;
                    sbuf[pos] = inner.pme;
                    pos += 1;
                }
            }

            let rc = self.row_comm[d].clone().expect("participating rank is a row member");
            let gathered = self.comm.row_gather_reals(&rc, &sbuf[..pos]);

            if rc.is_root() {
                // We are the row root, fold the row into one record.
                let root_limited =
                    self.dlb && self.root[d].as_ref().map_or(false, |r| r.limited);
                let nc = self.nc[dim];
                let grid_jump = self.grid_jump;
                let inner_dim = d < self.ndim - 1;
                let stagger = d > 0;

                let mut new_max0 = Vec::new();
                let mut new_min1 = Vec::new();

                let dl = &mut self.load.dim_load[d];
                dl.nload = pos;
                dl.load = gathered.expect("row root receives the gather");
                dl.sum = 0.0;
                dl.max = 0.0;
                dl.sum_m = 0.0;
                dl.cvol_min = 1.0;
                dl.flags = 0;
                dl.mdf = 0.0;
                dl.pme = 0.0;
                let mut p = 0;
                for _i in 0..nc {
                    dl.sum += dl.load[p];
                    p += 1;
                    dl.max = dl.max.max(dl.load[p]);
                    p += 1;
                    if grid_jump {
                        if root_limited {
                            // This direction could not be balanced, use the
                            // maximum instead of the average load.
                            dl.sum_m = dl.sum_m.max(dl.load[p]);
                        } else {
                            dl.sum_m += dl.load[p];
                        }
                        p += 1;
                        dl.cvol_min = dl.cvol_min.min(dl.load[p]);
                        p += 1;
                        if inner_dim {
                            dl.flags |= (dl.load[p] + 0.5) as i32;
                            p += 1;
                        }
                        if stagger {
                            new_max0.push(dl.load[p]);
                            p += 1;
                            new_min1.push(dl.load[p]);
                            p += 1;
                        }
                    }
                    if sep_pme {
                        dl.mdf = dl.mdf.max(dl.load[p]);
                        p += 1;
                        dl.pme = dl.pme.max(dl.load[p]);
                        p += 1;
                    }
                }
                if self.dlb && root_limited {
                    dl.sum_m *= nc as f64;
                    dl.flags |= 1 << d;
                }
                if stagger {
                    if let Some(root) = self.root[d].as_mut() {
                        root.cell_f_max0.copy_from_slice(&new_max0);
                        root.cell_f_min1.copy_from_slice(&new_min1);
                    }
                }
            }
        }

        if self.comm.is_master() {
            let count = self.load.count() as u64;
            self.load.nload += count;
            self.load.load_step += self.load.cycl[DdCycle::Step as usize];
            self.load.load_sum += self.load.dim_load[0].sum;
            self.load.load_max += self.load.dim_load[0].max;
            if self.dlb {
                for d in 0..self.ndim {
                    if self.load.dim_load[0].flags & (1 << d) != 0 {
                        self.load.load_lim[d] += 1;
                    }
                }
            }
            if sep_pme {
                self.load.load_mdf += self.load.dim_load[0].mdf;
                self.load.load_pme += self.load.dim_load[0].pme;
            }
        }
        debug!("finished collecting the load distribution");
    }

    /// Relative force-load imbalance of the last collection.
    pub fn f_imbalance(&self) -> f64 {
        let dl = &self.load.dim_load[0];
        dl.max * self.nnodes as f64 / dl.sum - 1.0
    }

    /// Smallest cell volume relative to a uniform grid.
    pub fn vol_min(&self) -> f64 {
        self.load.dim_load[0].cvol_min * self.nnodes as f64
    }

    /// Per-dimension limit flags of the last collection.
    pub fn load_flags(&self) -> i32 {
        self.load.dim_load[0].flags
    }

    /// Ratio of reciprocal-space to particle force cycles.
    pub fn pme_f_ratio(&self) -> f64 {
        self.load.dim_load[0].pme / self.load.dim_load[0].mdf
    }

    /// Log the load of one collection interval.
    pub fn print_load(&self, step: i64) {
        let flags = self.load_flags();
        if flags != 0 {
            let dims: String = (0..self.ndim)
                .filter(|d| flags & (1 << d) != 0)
                .map(|d| dim_char(self.dims[d]))
                .collect();
            info!(dims = %dims, "load balancing is limited by the minimum cell size");
        }
        if self.dlb {
            info!(
                step,
                vol_min_aver = self.vol_min(),
                limited = flags != 0,
                imbalance_pct = self.f_imbalance() * 100.0,
                "decomposition load"
            );
        } else {
            info!(step, imbalance_pct = self.f_imbalance() * 100.0, "decomposition load");
        }
        if self.load.cycl_n[DdCycle::Pme as usize] > 0 {
            info!(pme_mesh_force = self.pme_f_ratio(), "reciprocal/particle load ratio");
        }
    }

    /// Accumulate the per-role communicated-atom statistics.
    pub(crate) fn add_statistics(&mut self) {
        for role in 1..ROLE_COUNT {
            self.load.sum_nat[role - 1] += (self.nat[role] - self.nat[role - 1]) as f64;
        }
        self.load.ndecomp += 1;
    }

    /// Log the whole-run load averages on the master.
    pub fn print_load_average(&self) {
        if !self.comm.is_master() || self.load.nload == 0 {
            return;
        }
        let npp = self.nnodes as f64;
        let npme = if self.pme.pme_nodeid.is_some() { self.pme.npmenodes as f64 } else { 0.0 };
        let nnodes = npp + npme;
        let imbal = self.load.load_max * npp / self.load.load_sum - 1.0;
        let lossf = (self.load.load_max * npp - self.load.load_sum)
            / (self.load.load_step * nnodes);
        info!(imbalance_pct = imbal * 100.0, "average load imbalance");
        info!(lost_pct = lossf * 100.0, "run time lost waiting on load imbalance");
        let mut limited = false;
        if self.dlb {
            for d in 0..self.ndim {
                let limp = (200 * self.load.load_lim[d] + 1) / (2 * self.load.nload);
                info!(
                    dim = %dim_char(self.dims[d]),
                    limited_pct = limp,
                    "steps with balancing limited by the minimum cell size"
                );
                if limp >= 50 {
                    limited = true;
                }
            }
        }
        if npme > 0.0 {
            let pme_f_ratio = self.load.load_pme / self.load.load_mdf;
            let mut lossp = (self.load.load_pme - self.load.load_mdf) / self.load.load_step;
            if lossp <= 0.0 {
                lossp *= npme / nnodes;
            } else {
                lossp *= npp / nnodes;
            }
            info!(ratio = pme_f_ratio, "average reciprocal/particle load");
            info!(lost_pct = lossp.abs() * 100.0, "run time lost to the PP/PME imbalance");
            if lossp.abs() >= 0.05 {
                warn!(
                    lost_pct = lossp.abs() * 100.0,
                    pme_underloaded = lossp < 0.0,
                    "consider changing the number of PME ranks or the cut-off and grid spacing"
                );
            }
        }
        if lossf * 100.0 >= 5.0 {
            if !self.dlb {
                warn!(
                    lost_pct = lossf * 100.0,
                    "performance lost to load imbalance; consider dynamic load balancing"
                );
            } else if limited {
                warn!(
                    lost_pct = lossf * 100.0,
                    "performance lost to load imbalance; consider lowering the minimum cell size limits"
                );
            }
        }
    }

    /// Log the per-role average atom counts communicated per step.
    pub fn print_statistics(&self) {
        if self.load.ndecomp == 0 {
            return;
        }
        let labels = ["force halo", "virtual sites", "constraints"];
        for role in 1..ROLE_COUNT {
            let av = self.load.sum_nat[role - 1] / self.load.ndecomp as f64;
            info!(kind = labels[role - 1], atoms_per_step = av, "average communicated atoms");
        }
        if self.load.record {
            self.print_load_average();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_metric_is_default() {
        let mut t = LoadTracker::new(true, 0, 0);
        t.cycles_add(DdCycle::Force, 100.0);
        t.cycles_add(DdCycle::Force, 50.0);
        assert_eq!(t.count(), 2);
        assert_eq!(t.force_load(), 150.0);
        t.clear_counts();
        assert_eq!(t.count(), 0);
    }

    #[test]
    fn flop_metric_counts_evaluations() {
        let mut t = LoadTracker::new(true, 1, 0);
        t.flop_start(1000.0);
        t.flop_stop(1800.0);
        assert_eq!(t.count(), 1);
        assert_eq!(t.force_load(), 800.0);
    }

    #[test]
    fn flop_jitter_stays_within_bounds() {
        let mut t = LoadTracker::new(true, 2, 3);
        t.flop_start(0.0);
        t.flop_stop(1000.0);
        for _ in 0..100 {
            let l = t.force_load();
            // One extra flop level adds at most +-5%.
            assert!(l >= 950.0 - 1e-9 && l <= 1050.0 + 1e-9);
        }
    }

    #[test]
    fn jitter_streams_differ_between_ranks() {
        let mut a = LoadTracker::new(true, 3, 0);
        let mut b = LoadTracker::new(true, 3, 1);
        a.flop_stop(1000.0);
        b.flop_stop(1000.0);
        let la: Vec<f64> = (0..4).map(|_| a.force_load()).collect();
        let lb: Vec<f64> = (0..4).map(|_| b.force_load()).collect();
        assert_ne!(la, lb);
    }
}
