//! Per-step redistribution of charge groups between neighbor ranks
//!
//! After an integration step some home charge groups have drifted out of
//! this rank's cell. Each group may move **at most one cell** per
//! redistribution in every decomposed dimension; anything farther is a hard
//! error with full diagnostics, because it means the integration or the
//! balancing produced an impossible displacement.
//!
//! The move decision is encoded in one flag word per group: the low 16 bits
//! carry the atom count, and two bits per decomposition dimension mark a
//! forward or backward crossing. Groups travel the dimensions outer→inner;
//! a receiver re-examines the remaining dimensions because with staggered
//! grids the deeper cell boundaries differ per row, so a group may need a
//! second hop to reach its final owner.

use thiserror::Error;
use tracing::debug;

use crate::comm::Direction;
use crate::geometry::{box_row, dim_char, tric_corr_matrix};
use crate::partition::{DomDec, ForceRec};
use crate::system::{ensure_len, State, STATE_HAS_CGP, STATE_HAS_SDX, STATE_HAS_V};
use crate::{Rvec, BoxMatrix, DIM};

/// Ints carried per moved charge group: global index plus the flag word.
pub const CG_IBS: usize = 2;

/// Low bits of the flag word holding the atom count.
pub const FLAG_NRCG: i64 = 0xFFFF;

/// Forward-crossing flag for decomposition dimension index `d`.
#[inline]
pub fn flag_fw(d: usize) -> i64 {
    1 << (16 + d * 2)
}

/// Backward-crossing flag for decomposition dimension index `d`.
#[inline]
pub fn flag_bw(d: usize) -> i64 {
    1 << (16 + d * 2 + 1)
}

/// A charge group moved farther than one cell between redistributions.
#[derive(Debug, Error)]
#[error(
    "step {step}: the charge group starting at atom {atom_gl} moved more than the distance \
     allowed by the domain decomposition ({limit}) in direction {dim}\n\
     distance out of cell: {distance}\n\
     old coordinates: {cm_old:?}\nnew coordinates: {cm_new:?}\n\
     old cell boundaries in direction {dim}: {old_x0} {old_x1}\n\
     new cell boundaries in direction {dim}: {new_x0} {new_x1}"
)]
pub struct CgMoveError {
    /// Step at which the displacement was detected.
    pub step: i64,
    /// First global atom of the group (1-based, as reported to users).
    pub atom_gl: usize,
    /// Maximum allowed displacement out of the old cell.
    pub limit: f64,
    /// Axis letter of the crossing.
    pub dim: char,
    /// How far the center ended up outside the cell.
    pub distance: f64,
    /// Center of geometry before the step.
    pub cm_old: [f64; DIM],
    /// Center of geometry after the step.
    pub cm_new: [f64; DIM],
    /// Lower cell boundary at the previous redistribution.
    pub old_x0: f64,
    /// Upper cell boundary at the previous redistribution.
    pub old_x1: f64,
    /// Current lower cell boundary.
    pub new_x0: f64,
    /// Current upper cell boundary.
    pub new_x1: f64,
}

// ============================================================================
// Compaction helpers
// ============================================================================

/// Pack one state vector into the per-destination buffers and (optionally)
/// compact the staying entries in place. The buffer layout per moved group
/// is `[center, vec0 atoms, vec1 atoms, ...]`; this writes slot `vec`.
pub(crate) fn compact_and_copy_vec_at(
    ncg: usize,
    mv: &[i32],
    cgindex: &[usize],
    nvec: usize,
    vec: usize,
    src: &mut [Rvec],
    buffers: &mut [Vec<Rvec>],
    compact: bool,
) -> usize {
    let mut home_pos = 0;
    let mut pos_vec = [0usize; DIM * 2];

    let mut i0 = 0;
    for icg in 0..ncg {
        let i1 = cgindex[icg + 1];
        let m = mv[icg];
        if m == -1 {
            if compact {
                for i in i0..i1 {
                    src[home_pos] = src[i];
                    home_pos += 1;
                }
            }
        } else {
            let m = m as usize;
            let nrcg = i1 - i0;
            // Skip the center slot and the earlier vectors of this group.
            pos_vec[m] += 1 + vec * nrcg;
            for i in i0..i1 {
                buffers[m][pos_vec[m]] = src[i];
                pos_vec[m] += 1;
            }
            pos_vec[m] += (nvec - vec - 1) * nrcg;
        }
        if !compact {
            home_pos += i1 - i0;
        }
        i0 = i1;
    }

    home_pos
}

/// Pack the group centers into slot 0 of the per-destination buffers.
pub(crate) fn compact_and_copy_vec_cg(
    ncg: usize,
    mv: &[i32],
    cgindex: &[usize],
    nvec: usize,
    src: &mut [Rvec],
    buffers: &mut [Vec<Rvec>],
    compact: bool,
) -> usize {
    let mut home_pos = 0;
    let mut pos_vec = [0usize; DIM * 2];

    let mut i0 = 0;
    for icg in 0..ncg {
        let i1 = cgindex[icg + 1];
        let m = mv[icg];
        if m == -1 {
            if compact {
                src[home_pos] = src[icg];
                home_pos += 1;
            }
        } else {
            let m = m as usize;
            let nrcg = i1 - i0;
            buffers[m][pos_vec[m]] = src[icg];
            pos_vec[m] += 1 + nrcg * nvec;
        }
        i0 = i1;
    }
    if !compact {
        home_pos = ncg;
    }

    home_pos
}

impl DomDec {
    /// Compact the home index tables in place, dropping the moved groups
    /// and clearing their global entries. Returns the new home group count.
    fn compact_ind(&mut self, ncg: usize, mv: &[i32], cginfo: &mut [i64]) -> usize {
        let mut home_pos = 0;
        let mut nat = 0;
        for cg in 0..ncg {
            let a0 = self.cgindex[cg];
            let a1 = self.cgindex[cg + 1];
            if mv[cg] == -1 {
                // Compact the home arrays in place; anything that can be
                // done here avoids access to the global arrays.
                self.cgindex[home_pos] = nat;
                for a in a0..a1 {
                    let a_gl = self.gatindex[a];
                    self.gatindex[nat] = a_gl;
                    // The zone stays 0, so only the local index changes.
                    self.ga2la.set(a_gl, 0, nat);
                    nat += 1;
                }
                self.index_gl[home_pos] = self.index_gl[cg];
                cginfo[home_pos] = cginfo[cg];
                home_pos += 1;
            } else {
                // Clear the global indices.
                for a in a0..a1 {
                    self.ga2la.clear(self.gatindex[a]);
                }
            }
        }
        self.cgindex[home_pos] = nat;

        home_pos
    }

    /// Without compaction, clear the global entries of moved groups and
    /// mark them in the neighbor-search cell index so the sorter drops
    /// them.
    fn clear_and_mark(&mut self, ncg: usize, mv: &[i32], cell_index: &mut [i32], moved_mark: i32) {
        for cg in 0..ncg {
            if mv[cg] >= 0 {
                for a in self.cgindex[cg]..self.cgindex[cg + 1] {
                    self.ga2la.clear(self.gatindex[a]);
                }
                cell_index[cg] = moved_mark;
            }
        }
    }

    /// Redistribute the home charge groups after an integration step.
    ///
    /// Returns the number of groups that stayed home (the rebuild start for
    /// the local indices). With `compact` unset the home arrays keep their
    /// order and moved groups are only marked in `cell_index`.
    pub(crate) fn redistribute_cg(
        &mut self,
        step: i64,
        state: &mut State,
        fr: &mut ForceRec,
        cell_index: Option<(&mut [i32], i32)>,
        compact: bool,
    ) -> Result<usize, CgMoveError> {
        let b_v = state.flags & STATE_HAS_V != 0;
        let b_sdx = state.flags & STATE_HAS_SDX != 0;
        let b_cgp = state.flags & STATE_HAS_CGP != 0;

        let mut mv = std::mem::take(&mut self.move_buf);
        mv.clear();
        mv.resize(self.ncg_home, -1);

        let mut ncg = [0usize; DIM * 2];
        let mut nat = [0usize; DIM * 2];

        let mut limitd = [0.0; DIM];
        let mut cell_x0 = [0.0; DIM];
        let mut cell_x1 = [0.0; DIM];
        let mut limit0 = [0.0; DIM];
        let mut limit1 = [0.0; DIM];
        let mut tric_dir = [false; DIM];
        for d in 0..DIM {
            limitd[d] = self.cellsize_min[d];
            cell_x0[d] = self.cell_x0[d];
            cell_x1[d] = self.cell_x1[d];
            limit0[d] = self.old_cell_x0[d] - limitd[d];
            limit1[d] = self.old_cell_x1[d] + limitd[d];
            tric_dir[d] = self.tric.tric_dir[d] && self.nc[d] > 1;
        }

        let tcm = tric_corr_matrix(&state.boxm);
        let boxm: BoxMatrix = state.boxm;

        // Compute the center of geometry of every home group, wrap it into
        // the box and decide where it should go.
        for cg in 0..self.ncg_home {
            let k0 = self.cgindex[cg];
            let k1 = self.cgindex[cg + 1];
            let nrcg = k1 - k0;
            let mut cm_new = if nrcg == 1 {
                state.x[k0]
            } else {
                let mut cm = Rvec::zeros();
                for k in k0..k1 {
                    cm += state.x[k];
                }
                cm / nrcg as f64
            };

            let mut dev = [0i32; DIM];
            for d in (0..DIM).rev() {
                if self.nc[d] > 1 {
                    // Position of this group in lattice coordinates.
                    let mut pos_d = cm_new[d];
                    if tric_dir[d] {
                        for d2 in d + 1..DIM {
                            pos_d += cm_new[d2] * tcm[(d2, d)];
                        }
                    }
                    if pos_d >= cell_x1[d] {
                        if pos_d >= limit1[d] {
                            return Err(self.cg_move_error(
                                step, cg, d, 1, limitd[d], &fr.cg_cm[cg], &cm_new, pos_d,
                            ));
                        }
                        dev[d] = 1;
                        if self.ci[d] == self.nc[d] - 1 {
                            let shift = box_row(&boxm, d);
                            cm_new -= shift;
                            for k in k0..k1 {
                                state.x[k] -= shift;
                            }
                        }
                    } else if pos_d < cell_x0[d] {
                        if pos_d < limit0[d] {
                            return Err(self.cg_move_error(
                                step, cg, d, -1, limitd[d], &fr.cg_cm[cg], &cm_new, pos_d,
                            ));
                        }
                        dev[d] = -1;
                        if self.ci[d] == 0 {
                            let shift = box_row(&boxm, d);
                            cm_new += shift;
                            for k in k0..k1 {
                                state.x[k] += shift;
                            }
                        }
                    }
                } else {
                    // Put the group in the rectangular unit cell.
                    while cm_new[d] >= boxm[(d, d)] {
                        let shift = box_row(&boxm, d);
                        cm_new -= shift;
                        for k in k0..k1 {
                            state.x[k] -= shift;
                        }
                    }
                    while cm_new[d] < 0.0 {
                        let shift = box_row(&boxm, d);
                        cm_new += shift;
                        for k in k0..k1 {
                            state.x[k] += shift;
                        }
                    }
                }
            }

            fr.cg_cm[cg] = cm_new;

            // Encode the destination: the first crossing dimension wins;
            // with two cells per dimension both directions share a bucket
            // because the exchange is symmetric.
            let mut flag: i64 = 0;
            let mut mc: i32 = -1;
            for d in 0..self.ndim {
                let dim = self.dims[d];
                if dev[dim] == 1 {
                    flag |= flag_fw(d);
                    if mc == -1 {
                        mc = (d * 2) as i32;
                    }
                } else if dev[dim] == -1 {
                    flag |= flag_bw(d);
                    if mc == -1 {
                        mc = if self.nc[dim] > 2 { (d * 2 + 1) as i32 } else { (d * 2) as i32 };
                    }
                }
            }
            mv[cg] = mc;
            if mc >= 0 {
                let mc = mc as usize;
                let fl = &mut self.cggl_flag[mc];
                fl.truncate(ncg[mc] * CG_IBS);
                fl.push(self.index_gl[cg] as i64);
                // The group size lives in the low bits and the destination
                // flags above; this keeps the communication volume down.
                fl.push(nrcg as i64 | flag);
                ncg[mc] += 1;
                nat[mc] += nrcg;
            }
        }

        let nvec = state.nvec();

        // Size the per-destination state buffers.
        for mc in 0..self.ndim * 2 {
            let nvr = ncg[mc] + nat[mc] * nvec;
            ensure_len(&mut self.cgcm_state[mc], nvr);
        }

        // Packing the centers from the stored values might be cheaper to
        // recompute, but communicated values avoid rounding drift.
        let home_pos_cg = compact_and_copy_vec_cg(
            self.ncg_home,
            &mv,
            &self.cgindex,
            nvec,
            &mut fr.cg_cm,
            &mut self.cgcm_state,
            compact,
        );
        let mut vec = 0;
        let mut home_pos_at = compact_and_copy_vec_at(
            self.ncg_home,
            &mv,
            &self.cgindex,
            nvec,
            vec,
            &mut state.x,
            &mut self.cgcm_state,
            compact,
        );
        vec += 1;
        if b_v {
            compact_and_copy_vec_at(
                self.ncg_home,
                &mv,
                &self.cgindex,
                nvec,
                vec,
                &mut state.v,
                &mut self.cgcm_state,
                compact,
            );
            vec += 1;
        }
        if b_sdx {
            compact_and_copy_vec_at(
                self.ncg_home,
                &mv,
                &self.cgindex,
                nvec,
                vec,
                &mut state.sd_x,
                &mut self.cgcm_state,
                compact,
            );
            vec += 1;
        }
        if b_cgp {
            compact_and_copy_vec_at(
                self.ncg_home,
                &mv,
                &self.cgindex,
                nvec,
                vec,
                &mut state.cg_p,
                &mut self.cgcm_state,
                compact,
            );
        }

        let mut home_pos_cg = if compact {
            self.compact_ind(self.ncg_home, &mv, &mut fr.cginfo)
        } else {
            let (cell_index, moved_mark) =
                cell_index.expect("the sorter provides the cell index when not compacting");
            self.clear_and_mark(self.ncg_home, &mv, cell_index, moved_mark);
            home_pos_cg
        };

        let ncg_stay_home = home_pos_cg;

        for d in 0..self.ndim {
            let dim = self.dims[d];
            let ndir = if self.nc[dim] == 2 { 1 } else { 2 };
            let mut recv_flags: Vec<i64> = Vec::new();
            let mut recv_vr: Vec<Rvec> = Vec::new();
            let mut ncg_recv = 0usize;
            for dir in 0..ndir {
                let cdd = d * 2 + dir;
                let direction = if dir == 0 { Direction::Forward } else { Direction::Backward };
                let (rank_s, rank_r) = self.neighbor_pair(d, direction);

                // Exchange the group and atom counts.
                let sbuf = [ncg[cdd] as i64, nat[cdd] as i64];
                debug!(dim = d, dir, ncg = ncg[cdd], nat = nat[cdd], "sending moved groups");
                let rbuf = self.comm.sendrecv_ints(rank_s, &sbuf, rank_r, 2);
                let (r_ncg, r_nat) = (rbuf[0] as usize, rbuf[1] as usize);

                // Exchange the indices, sizes and flags.
                let flags = self.comm.sendrecv_ints(
                    rank_s,
                    &self.cggl_flag[cdd][..ncg[cdd] * CG_IBS],
                    rank_r,
                    r_ncg * CG_IBS,
                );
                recv_flags.extend(flags);

                // Exchange the centers and the state vectors.
                let nvs = ncg[cdd] + nat[cdd] * nvec;
                let nvr = r_ncg + r_nat * nvec;
                let vr = self.comm.sendrecv_vecs(
                    rank_s,
                    &self.cgcm_state[cdd][..nvs],
                    rank_r,
                    nvr,
                );
                recv_vr.extend(vr);
                ncg_recv += r_ncg;
            }

            // Process the received groups: either they are home here, or
            // with staggered grids they may need another hop in a deeper
            // dimension.
            let mut buf_pos = 0usize;
            for cg in 0..ncg_recv {
                let mut flag = recv_flags[cg * CG_IBS + 1];
                let mut mc: i32 = -1;
                if d < self.ndim - 1 {
                    let mut d2 = d + 1;
                    while d2 < self.ndim && mc == -1 {
                        if self.grid_jump {
                            // The deeper cell boundaries differ per row, so
                            // re-derive where this group should go. A group
                            // that crosses the box boundary keeps its
                            // communicated flag, which avoids periodicity
                            // headaches here.
                            let dim2 = self.dims[d2];
                            if !((self.ci[dim2] == self.nc[dim2] - 1 && flag & flag_fw(d2) != 0)
                                || (self.ci[dim2] == 0 && flag & flag_bw(d2) != 0))
                            {
                                flag &= !(flag_fw(d2) | flag_bw(d2));
                                let mut pos_d = recv_vr[buf_pos][dim2];
                                if tric_dir[dim2] {
                                    for d3 in dim2 + 1..DIM {
                                        pos_d += recv_vr[buf_pos][d3] * tcm[(d3, dim2)];
                                    }
                                }
                                if pos_d >= cell_x1[dim2] {
                                    flag |= flag_fw(d2);
                                } else if pos_d < cell_x0[dim2] {
                                    flag |= flag_bw(d2);
                                }
                            }
                        }
                        if flag & flag_fw(d2) != 0 {
                            mc = (d2 * 2) as i32;
                        } else if flag & flag_bw(d2) != 0 {
                            mc = if self.nc[self.dims[d2]] > 2 {
                                (d2 * 2 + 1) as i32
                            } else {
                                (d2 * 2) as i32
                            };
                        }
                        d2 += 1;
                    }
                }

                let nrcg = (flag & FLAG_NRCG) as usize;
                if mc == -1 {
                    // This group is home on this rank.
                    ensure_len(&mut self.index_gl, home_pos_cg + 1);
                    ensure_len(&mut self.cgindex, home_pos_cg + 2);
                    self.index_gl[home_pos_cg] = recv_flags[cg * CG_IBS] as usize;
                    self.cgindex[home_pos_cg + 1] = self.cgindex[home_pos_cg] + nrcg;
                    ensure_len(&mut fr.cg_cm, home_pos_cg + 1);
                    ensure_len(&mut fr.cginfo, home_pos_cg + 1);
                    fr.cg_cm[home_pos_cg] = recv_vr[buf_pos];
                    buf_pos += 1;
                    if home_pos_at + nrcg > state.x.len() {
                        state.realloc(home_pos_at + nrcg);
                    }
                    for i in 0..nrcg {
                        state.x[home_pos_at + i] = recv_vr[buf_pos];
                        buf_pos += 1;
                    }
                    if b_v {
                        for i in 0..nrcg {
                            state.v[home_pos_at + i] = recv_vr[buf_pos];
                            buf_pos += 1;
                        }
                    }
                    if b_sdx {
                        for i in 0..nrcg {
                            state.sd_x[home_pos_at + i] = recv_vr[buf_pos];
                            buf_pos += 1;
                        }
                    }
                    if b_cgp {
                        for i in 0..nrcg {
                            state.cg_p[home_pos_at + i] = recv_vr[buf_pos];
                            buf_pos += 1;
                        }
                    }
                    home_pos_cg += 1;
                    home_pos_at += nrcg;
                } else {
                    // Forward to the next dimension's send buffers.
                    let mc = mc as usize;
                    let fl = &mut self.cggl_flag[mc];
                    fl.truncate(ncg[mc] * CG_IBS);
                    fl.push(recv_flags[cg * CG_IBS]);
                    fl.push(flag);
                    let nvr = ncg[mc] + nat[mc] * nvec;
                    ensure_len(&mut self.cgcm_state[mc], nvr + 1 + nrcg * nvec);
                    for i in 0..1 + nrcg * nvec {
                        self.cgcm_state[mc][nvr + i] = recv_vr[buf_pos + i];
                    }
                    buf_pos += 1 + nrcg * nvec;
                    ncg[mc] += 1;
                    nat[mc] += nrcg;
                }
            }
        }

        // Clear the halo indices; the home entries were already updated
        // during compaction.
        self.clear_dd_indices(self.nat_home);

        self.ncg_home = home_pos_cg;
        self.nat_home = home_pos_at;
        self.master_has_all_cg = false;

        self.move_buf = mv;

        debug!(ncg_home = self.ncg_home, nat_home = self.nat_home, "finished redistributing");

        Ok(ncg_stay_home)
    }

    fn cg_move_error(
        &self,
        step: i64,
        cg: usize,
        dim: usize,
        dir: i32,
        limit: f64,
        cm_old: &Rvec,
        cm_new: &Rvec,
        pos_d: f64,
    ) -> CgMoveError {
        CgMoveError {
            step,
            atom_gl: self.gatindex[self.cgindex[cg]] + 1,
            limit,
            dim: dim_char(dim),
            distance: if dir == 1 {
                pos_d - self.cell_x1[dim]
            } else {
                pos_d - self.cell_x0[dim]
            },
            cm_old: [cm_old[0], cm_old[1], cm_old[2]],
            cm_new: [cm_new[0], cm_new[1], cm_new[2]],
            old_x0: self.old_cell_x0[dim],
            old_x1: self.old_cell_x1[dim],
            new_x0: self.cell_x0[dim],
            new_x1: self.cell_x1[dim],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bits_do_not_overlap() {
        let mut seen = FLAG_NRCG;
        for d in 0..DIM {
            for f in [flag_fw(d), flag_bw(d)] {
                assert_eq!(seen & f, 0);
                seen |= f;
            }
        }
        // A maximal group size still fits below the direction bits.
        assert_eq!(0xFFFF & flag_fw(0), 0);
    }

    #[test]
    fn vec_packing_layout_keeps_vectors_separated() {
        // Two groups, sizes 2 and 1; group 0 stays, group 1 moves to
        // destination 0. Two vectors (x and v).
        let cgindex = vec![0usize, 2, 3];
        let mv = vec![-1, 0];
        let nvec = 2;
        let mut buffers: Vec<Vec<Rvec>> = vec![vec![Rvec::zeros(); 16]; 2];

        let mut cg_cm = vec![
            Rvec::new(0.5, 0.0, 0.0),
            Rvec::new(9.5, 0.0, 0.0),
        ];
        let home =
            compact_and_copy_vec_cg(2, &mv, &cgindex, nvec, &mut cg_cm, &mut buffers, true);
        assert_eq!(home, 1);
        assert_eq!(buffers[0][0], Rvec::new(9.5, 0.0, 0.0));

        let mut x = vec![
            Rvec::new(1.0, 0.0, 0.0),
            Rvec::new(2.0, 0.0, 0.0),
            Rvec::new(3.0, 0.0, 0.0),
        ];
        let home_at =
            compact_and_copy_vec_at(2, &mv, &cgindex, nvec, 0, &mut x, &mut buffers, true);
        assert_eq!(home_at, 2);
        // Positions land right after the center slot.
        assert_eq!(buffers[0][1], Rvec::new(3.0, 0.0, 0.0));

        let mut v = vec![
            Rvec::new(-1.0, 0.0, 0.0),
            Rvec::new(-2.0, 0.0, 0.0),
            Rvec::new(-3.0, 0.0, 0.0),
        ];
        compact_and_copy_vec_at(2, &mv, &cgindex, nvec, 1, &mut v, &mut buffers, true);
        // Velocities land after the position block of the same group.
        assert_eq!(buffers[0][2], Rvec::new(-3.0, 0.0, 0.0));
        // The staying group was compacted to the front.
        assert_eq!(x[0], Rvec::new(1.0, 0.0, 0.0));
        assert_eq!(x[1], Rvec::new(2.0, 0.0, 0.0));
    }
}
