//! Master-driven distribution and whole-system state gather/scatter
//!
//! At startup (and on every repartition from a master state) the master
//! rank bins all charge-group centers over the static cell boundaries and
//! scatters each rank its list of global group indices; every rank then
//! derives its local atom index from the global group sizes.
//!
//! The reverse path gathers the local state vectors group-by-group into the
//! whole-system layout on the master. The master's picture of who owns what
//! is rebuilt lazily: any redistribution invalidates it, and the next
//! gather re-collects the ownership lists first.

use tracing::{debug, info};

use crate::comm::TAG_STATE_BASE;
use crate::geometry::{box_row, tric_corr_matrix};
use crate::grid::dd_index;
use crate::partition::{DomDec, PartitionError};
use crate::system::{ensure_len, GlobalCg, State, STATE_HAS_CGP, STATE_HAS_SDX, STATE_HAS_V};
use crate::{BoxMatrix, Rvec, DIM};

/// Whole-system bookkeeping held by the master rank only.
#[derive(Clone, Debug, Default)]
pub struct MasterState {
    /// Home group count per rank.
    pub ncg: Vec<usize>,
    /// Prefix index over `cg`, length ranks + 1.
    pub index: Vec<usize>,
    /// Global group indices, concatenated in rank order.
    pub cg: Vec<usize>,
    /// Home atom count per rank.
    pub nat: Vec<usize>,
    /// The full static boundary table per Cartesian dimension.
    pub cell_x: [Vec<f64>; DIM],
}

impl MasterState {
    /// Empty bookkeeping for `nnodes` ranks and `ncg_total` groups.
    pub fn new(nnodes: usize, ncg_total: usize) -> Self {
        Self {
            ncg: vec![0; nnodes],
            index: vec![0; nnodes + 1],
            cg: Vec::with_capacity(ncg_total),
            nat: vec![0; nnodes],
            cell_x: Default::default(),
        }
    }
}

fn mat_to_reals(m: &BoxMatrix) -> Vec<f64> {
    (0..DIM).flat_map(|r| (0..DIM).map(move |c| (r, c))).map(|(r, c)| m[(r, c)]).collect()
}

fn reals_to_mat(v: &[f64]) -> BoxMatrix {
    BoxMatrix::from_fn(|r, c| v[r * DIM + c])
}

impl DomDec {
    /// Bin every charge group over the master's boundary table, wrapping
    /// centers and atoms into the box. Master rank only.
    fn distribute_cg(
        &mut self,
        step: i64,
        boxm: &BoxMatrix,
        x: &mut [Rvec],
    ) -> Result<(), PartitionError> {
        // The binning runs over the statically sized boundaries.
        self.set_cell_sizes(boxm, false, true, true, step)?;

        let mut ma = self.ma.take().expect("master rank holds the master state");
        for n in ma.ncg.iter_mut() {
            *n = 0;
        }
        for n in ma.nat.iter_mut() {
            *n = 0;
        }

        let tcm = tric_corr_matrix(boxm);
        let mut tmp_ind: Vec<Vec<usize>> = vec![Vec::new(); self.nnodes];

        for icg in 0..self.gcgs.ncg() {
            let range = self.gcgs.atom_range(GlobalCg(icg));
            let nrcg = range.len();
            let mut cg_cm = if nrcg == 1 {
                x[range.start]
            } else {
                let mut cm = Rvec::zeros();
                for k in range.clone() {
                    cm += x[k];
                }
                cm / nrcg as f64
            };

            // Put the group in the box and find its cell.
            let mut ind = [0usize; DIM];
            for d in (0..DIM).rev() {
                let mut pos_d = cg_cm[d];
                if self.tric.tric_dir[d] && self.nc[d] > 1 {
                    // Use triclinic coordinates for this dimension.
                    for j in d + 1..DIM {
                        pos_d += cg_cm[j] * tcm[(j, d)];
                    }
                }
                while pos_d >= boxm[(d, d)] {
                    pos_d -= boxm[(d, d)];
                    let sh = box_row(boxm, d);
                    cg_cm -= sh;
                    for k in range.clone() {
                        x[k] -= sh;
                    }
                }
                while pos_d < 0.0 {
                    pos_d += boxm[(d, d)];
                    let sh = box_row(boxm, d);
                    cg_cm += sh;
                    for k in range.clone() {
                        x[k] += sh;
                    }
                }
                // A linear walk is fine here, the boundary count is small.
                while ind[d] + 1 < self.nc[d] && pos_d >= ma.cell_x[d][ind[d] + 1] {
                    ind[d] += 1;
                }
            }
            let i = dd_index(&self.nc, &ind);
            tmp_ind[i].push(icg);
            ma.ncg[i] += 1;
            ma.nat[i] += nrcg;
        }

        ma.cg.clear();
        let mut k1 = 0;
        for i in 0..self.nnodes {
            ma.index[i] = k1;
            ma.cg.extend_from_slice(&tmp_ind[i]);
            k1 += tmp_ind[i].len();
        }
        ma.index[self.nnodes] = k1;

        info!(step, distribution = ?ma.ncg, "charge group distribution");

        self.ma = Some(ma);
        Ok(())
    }

    /// Distribute the charge-group ownership from the master: scatter each
    /// rank its counts and global index list, then derive the local atom
    /// index.
    pub(crate) fn get_cg_distribution(
        &mut self,
        step: i64,
        boxm: &BoxMatrix,
        x_global: Option<&mut [Rvec]>,
    ) -> Result<(), PartitionError> {
        self.clear_dd_indices(0);

        let mut ibuf: Vec<i64> = Vec::new();
        if self.comm.is_master() {
            let x = x_global.expect("the master provides the global coordinates");
            self.distribute_cg(step, boxm, x)?;
            let ma = self.ma.as_ref().expect("master rank holds the master state");
            for i in 0..self.nnodes {
                ibuf.push(ma.ncg[i] as i64);
                ibuf.push(ma.nat[i] as i64);
            }
        }
        let counts = self.comm.scatter_ints(self.comm.is_master().then_some(&ibuf[..]), 2);
        self.ncg_home = counts[0] as usize;
        self.nat_home = counts[1] as usize;

        ensure_len(&mut self.index_gl, self.ncg_home);
        ensure_len(&mut self.cgindex, self.ncg_home + 1);

        let src = if self.comm.is_master() {
            let ma = self.ma.as_ref().expect("master rank holds the master state");
            Some((ma.cg.iter().map(|&c| c as i64).collect::<Vec<i64>>(), ma.ncg.clone()))
        } else {
            None
        };
        let mine = self
            .comm
            .scatterv_ints(src.as_ref().map(|(cg, counts)| (&cg[..], &counts[..])), self.ncg_home);
        for (i, &cg) in mine.iter().enumerate() {
            self.index_gl[i] = cg as usize;
        }

        // Determine the home group sizes.
        self.cgindex[0] = 0;
        for i in 0..self.ncg_home {
            self.cgindex[i + 1] = self.cgindex[i] + self.gcgs.size(GlobalCg(self.index_gl[i]));
        }
        debug!(ncg = self.ncg_home, nat = self.nat_home, "received home charge groups");

        self.master_has_all_cg = true;
        Ok(())
    }

    /// Re-collect the ownership lists on the master after redistributions
    /// invalidated them.
    pub(crate) fn collect_cg(&mut self) {
        let counts = [self.ncg_home as i64, self.nat_home as i64];
        let gathered = self.comm.gather_ints(&counts);
        let rcounts = if self.comm.is_master() {
            let all = gathered.expect("master receives the gather");
            let mut ma = self.ma.take().expect("master rank holds the master state");
            ma.index[0] = 0;
            for i in 0..self.nnodes {
                ma.ncg[i] = all[2 * i] as usize;
                ma.nat[i] = all[2 * i + 1] as usize;
                ma.index[i + 1] = ma.index[i] + ma.ncg[i];
            }
            debug!(distribution = ?ma.ncg, "collected charge group distribution");
            let rcounts = ma.ncg.clone();
            self.ma = Some(ma);
            Some(rcounts)
        } else {
            None
        };

        let mine: Vec<i64> = self.index_gl[..self.ncg_home].iter().map(|&g| g as i64).collect();
        let all = self.comm.gatherv_ints(&mine, rcounts.as_deref());
        if self.comm.is_master() {
            let ma = self.ma.as_mut().expect("master rank holds the master state");
            ma.cg = all.expect("master receives the gather").iter().map(|&g| g as usize).collect();
        }

        self.master_has_all_cg = true;
    }

    /// Gather one local per-atom vector into the whole-system layout on
    /// the master.
    pub fn collect_vec(&mut self, lv: &[Rvec], v: &mut [Rvec]) {
        if !self.master_has_all_cg {
            self.collect_cg();
        }

        if !self.comm.is_master() {
            self.comm.send_vecs(
                self.comm.masterrank,
                TAG_STATE_BASE + self.comm.rank as u32,
                &lv[..self.nat_home],
            );
        } else {
            let ma = self.ma.take().expect("master rank holds the master state");
            // Copy the master's own block straight into the global array.
            let me = self.comm.rank;
            let mut a = 0;
            for i in ma.index[me]..ma.index[me + 1] {
                for c in self.gcgs.atom_range(GlobalCg(ma.cg[i])) {
                    v[c] = lv[a];
                    a += 1;
                }
            }
            for n in 0..self.nnodes {
                if n == me {
                    continue;
                }
                let buf = self.comm.recv_vecs(n, TAG_STATE_BASE + n as u32);
                let mut a = 0;
                for i in ma.index[n]..ma.index[n + 1] {
                    for c in self.gcgs.atom_range(GlobalCg(ma.cg[i])) {
                        v[c] = buf[a];
                        a += 1;
                    }
                }
            }
            self.ma = Some(ma);
        }
    }

    /// Gather the whole dynamical state onto the master.
    pub fn collect_state(&mut self, state_local: &State, state: &mut State) {
        if self.comm.is_master() {
            state.lambda = state_local.lambda;
            state.boxm = state_local.boxm;
            state.boxv = state_local.boxv;
            state.box_rel = state_local.box_rel;
            state.nosehoover_xi.clone_from(&state_local.nosehoover_xi);
        }
        self.collect_vec(&state_local.x, &mut state.x);
        if state_local.flags & STATE_HAS_V != 0 {
            self.collect_vec(&state_local.v, &mut state.v);
        }
        if state_local.flags & STATE_HAS_SDX != 0 {
            self.collect_vec(&state_local.sd_x, &mut state.sd_x);
        }
        if state_local.flags & STATE_HAS_CGP != 0 {
            self.collect_vec(&state_local.cg_p, &mut state.cg_p);
        }
    }

    /// Scatter one whole-system per-atom vector into the local layouts.
    pub fn distribute_vec(&mut self, v: Option<&[Rvec]>, lv: &mut [Rvec]) {
        if self.comm.is_master() {
            let v = v.expect("the master provides the global vector");
            let ma = self.ma.take().expect("master rank holds the master state");
            let me = self.comm.rank;
            for n in 0..self.nnodes {
                if n == me {
                    continue;
                }
                let mut buf = Vec::with_capacity(ma.nat[n]);
                for i in ma.index[n]..ma.index[n + 1] {
                    for c in self.gcgs.atom_range(GlobalCg(ma.cg[i])) {
                        buf.push(v[c]);
                    }
                }
                assert_eq!(
                    buf.len(),
                    ma.nat[n],
                    "internal inconsistency: master distribution disagrees with the atom counts"
                );
                self.comm.send_vecs(n, TAG_STATE_BASE + n as u32, &buf);
            }
            let mut a = 0;
            for i in ma.index[me]..ma.index[me + 1] {
                for c in self.gcgs.atom_range(GlobalCg(ma.cg[i])) {
                    lv[a] = v[c];
                    a += 1;
                }
            }
            self.ma = Some(ma);
        } else {
            let buf = self.comm.recv_vecs(self.comm.masterrank, TAG_STATE_BASE + self.comm.rank as u32);
            lv[..buf.len()].copy_from_slice(&buf);
        }
    }

    /// Scatter the whole dynamical state from the master into the local
    /// states: broadcast the scalars, then scatter each vector.
    pub fn distribute_state(&mut self, state: Option<&State>, state_local: &mut State) {
        if self.comm.is_master() {
            let state = state.expect("the master provides the global state");
            state_local.lambda = state.lambda;
            state_local.boxm = state.boxm;
            state_local.box_rel = state.box_rel;
            state_local.boxv = state.boxv;
            state_local.nosehoover_xi.clone_from(&state.nosehoover_xi);
        }

        let mut scalars = vec![state_local.lambda];
        self.comm.bcast_reals(&mut scalars);
        state_local.lambda = scalars[0];
        for mat in [&mut state_local.boxm, &mut state_local.box_rel, &mut state_local.boxv] {
            let mut v = mat_to_reals(mat);
            self.comm.bcast_reals(&mut v);
            *mat = reals_to_mat(&v);
        }
        let mut xi = state_local.nosehoover_xi.clone();
        self.comm.bcast_reals(&mut xi);
        state_local.nosehoover_xi = xi;

        if self.nat_home > state_local.x.len() {
            state_local.realloc(self.nat_home);
        }
        let flags = state_local.flags;
        self.distribute_vec(state.map(|s| &s.x[..]), &mut state_local.x);
        if flags & STATE_HAS_V != 0 {
            self.distribute_vec(state.map(|s| &s.v[..]), &mut state_local.v);
        }
        if flags & STATE_HAS_SDX != 0 {
            self.distribute_vec(state.map(|s| &s.sd_x[..]), &mut state_local.sd_x);
        }
        if flags & STATE_HAS_CGP != 0 {
            self.distribute_vec(state.map(|s| &s.cg_p[..]), &mut state_local.cg_p);
        }
    }

    /// Restore a partition from a checkpointed local state: rebuild the
    /// local group and atom indices from the owned global list.
    pub(crate) fn rebuild_cgindex(&mut self, state: &State) {
        ensure_len(&mut self.index_gl, state.ncg_gl);
        ensure_len(&mut self.cgindex, state.ncg_gl + 1);
        let mut nat = 0;
        for (i, &cg_gl) in state.cg_gl.iter().take(state.ncg_gl).enumerate() {
            self.cgindex[i] = nat;
            self.index_gl[i] = cg_gl;
            nat += self.gcgs.size(GlobalCg(cg_gl));
        }
        self.cgindex[state.ncg_gl] = nat;

        self.ncg_home = state.ncg_gl;
        self.nat_home = nat;
        self.master_has_all_cg = false;
    }

    /// The persisted ownership snapshot of this rank: the owned global
    /// group list plus the partitioning generation it belongs to.
    pub fn checkpoint(&self) -> crate::system::Checkpoint {
        crate::system::Checkpoint {
            ddp_count: self.ddp_count,
            cg_gl: self.index_gl[..self.ncg_home].to_vec(),
        }
    }

    /// Record the owner's global group list into the state for
    /// checkpointing. Fails when the state belongs to another partitioning
    /// generation.
    pub fn store_state(&self, state: &mut State) -> Result<(), PartitionError> {
        if state.ddp_count != self.ddp_count {
            return Err(PartitionError::StaleState {
                state_count: state.ddp_count,
                dd_count: self.ddp_count,
            });
        }
        state.ncg_gl = self.ncg_home;
        state.cg_gl.clear();
        state.cg_gl.extend_from_slice(&self.index_gl[..self.ncg_home]);
        state.ddp_count_cg_gl = self.ddp_count;
        Ok(())
    }
}
