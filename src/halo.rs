//! Halo selection and the per-step coordinate/force exchanges
//!
//! For every decomposed dimension, in outer→inner order, and every pulse
//! within it, this picks the charge groups whose center lies within the
//! cut-off of the *corner* separating this rank's zone from the zone being
//! served, and ships their global indices and centers to the backward
//! neighbor. Distances are measured against per-zone corners; with
//! staggered grids the corners widen to the extremes of the neighbor rows,
//! and with multi-body bonded interactions a second, shorter cut-off is
//! tested against its own corner set.
//!
//! Reception is *in place* (appended directly to the local tails) whenever
//! only the last zone of the previous pulse received anything; otherwise
//! the incoming groups go through scratch buffers and are merged so groups
//! from the same zone stay contiguous across pulses.
//!
//! [`DomDec::move_x`] re-walks the saved selection lists to push home
//! coordinates out each step, applying the periodic box shift on ranks at
//! the lower boundary; [`DomDec::move_f`] walks the exact reverse order,
//! pulling halo forces back and accumulating them (and the corresponding
//! virial shift forces) onto the home atoms.

use tracing::debug;

use crate::comm::Direction;
use crate::geometry::box_row;
use crate::grid::{MAX_ZONES, ZONE_PERM};
use crate::partition::{DomDec, ForceRec};
use crate::system::{ensure_len, AtomRole, GlobalCg, ROLE_COUNT};
use crate::{BoxMatrix, Rvec, DIM};

/// Number of periodic shift vectors.
pub const SHIFTS: usize = 27;
/// Index of the central (zero) shift vector.
pub const CENTRAL_SHIFT: usize = 13;

/// Linear index of a unit shift vector.
#[inline]
pub fn ivec2is(v: [i32; DIM]) -> usize {
    (((v[2] + 1) * 3 + (v[1] + 1)) * 3 + (v[0] + 1)) as usize
}

/// Selection lists of one halo pulse.
#[derive(Clone, Debug, Default)]
pub struct PulseInd {
    /// Groups sent per zone; `[nzone]` holds the group total and
    /// `[nzone + 1]` the atom total.
    pub nsend: [usize; MAX_ZONES + 2],
    /// Same layout for the received side.
    pub nrecv: [usize; MAX_ZONES + 2],
    /// Local indices of the groups to send.
    pub index: Vec<usize>,
    /// Start of the received atom range per zone, for scratch reception.
    pub cell2at0: [usize; MAX_ZONES],
    /// End of the received atom range per zone, for scratch reception.
    pub cell2at1: [usize; MAX_ZONES],
}

/// Halo communication state of one decomposed dimension.
#[derive(Clone, Debug, Default)]
pub struct CommDim {
    /// Number of pulses.
    pub np: usize,
    /// Per-pulse selections, length `np`.
    pub ind: Vec<PulseInd>,
    /// Whether reception can append directly to the local tails.
    pub in_place: bool,
}

// ============================================================================
// Pulse merging
// ============================================================================

/// Merge scratch-received groups of one pulse into the zone-contiguous
/// local layout: shift the tails of earlier pulses right, patch their
/// stored send indices, then interleave the new groups per zone.
#[allow(clippy::too_many_arguments)]
fn merge_cg_buffers(
    nzone: usize,
    cd: &mut CommDim,
    pulse: usize,
    ncg_zone: &mut [usize],
    index_gl: &mut Vec<usize>,
    recv_i: &[usize],
    cg_cm: &mut Vec<Rvec>,
    recv_vr: &[Rvec],
    gcgs_index: &[usize],
    cgindex: &mut Vec<usize>,
) {
    // First shift the data that is already stored.
    let mut shift = cd.ind[pulse].nrecv[nzone];
    for zone in (0..nzone).rev() {
        shift -= cd.ind[pulse].nrecv[zone];
        if shift > 0 {
            // Move the groups present from previous pulses.
            let cg0 = ncg_zone[nzone + zone];
            let cg1 = ncg_zone[nzone + zone + 1];
            cgindex[cg1 + shift] = cgindex[cg1];
            for cg in (cg0..cg1).rev() {
                index_gl[cg + shift] = index_gl[cg];
                cg_cm[cg + shift] = cg_cm[cg];
                cgindex[cg + shift] = cgindex[cg];
            }
            // Correct the already stored send indices for the shift.
            for p in 1..=pulse {
                let ind_p = &mut cd.ind[p];
                let mut cg0 = 0;
                for c in 0..zone {
                    cg0 += ind_p.nsend[c];
                }
                let cg1 = cg0 + ind_p.nsend[zone];
                for cg in cg0..cg1 {
                    ind_p.index[cg] += shift;
                }
            }
        }
    }

    // Merge in the communicated buffers.
    let ind = &cd.ind[pulse];
    let mut shift = 0;
    let mut shift_at = 0;
    let mut cg0 = 0;
    for zone in 0..nzone {
        let mut cg1 = ncg_zone[nzone + zone + 1] + shift;
        if shift_at > 0 {
            // Correct the old atom offsets.
            for cg in ncg_zone[nzone + zone]..cg1 {
                cgindex[cg + 1] += shift_at;
            }
        }
        for _ in 0..ind.nrecv[zone] {
            // Copy this group from the scratch buffer.
            index_gl[cg1] = recv_i[cg0];
            cg_cm[cg1] = recv_vr[cg0];
            let cg_gl = index_gl[cg1];
            let nat = gcgs_index[cg_gl + 1] - gcgs_index[cg_gl];
            cgindex[cg1 + 1] = cgindex[cg1] + nat;
            cg0 += 1;
            cg1 += 1;
            shift_at += nat;
        }
        shift += ind.nrecv[zone];
        ncg_zone[nzone + zone + 1] = cg1;
    }
}

/// Record the atom ranges of the received groups per zone and pulse, used
/// for scratch-buffer packing in the per-step exchanges.
fn make_cell2at_index(cd: &mut CommDim, nzone: usize, cg_start: usize, cgindex: &[usize]) {
    let mut cg = cg_start;
    for zone in 0..nzone {
        for p in 0..cd.np {
            let ind = &mut cd.ind[p];
            ind.cell2at0[zone] = cgindex[cg];
            cg += ind.nrecv[zone];
            ind.cell2at1[zone] = cgindex[cg];
        }
    }
}

impl DomDec {
    /// Paired integer exchange along decomposition dimension `dim_ind`,
    /// for callers shipping their own halo payloads (constraint and
    /// virtual-site data).
    pub fn sendrecv_ints(
        &mut self,
        dim_ind: usize,
        dir: Direction,
        buf_s: &[i64],
        n_r: usize,
    ) -> Vec<i64> {
        let (rank_s, rank_r) = self.neighbor_pair(dim_ind, dir);
        self.comm.sendrecv_ints(rank_s, buf_s, rank_r, n_r)
    }

    /// Paired coordinate exchange along decomposition dimension `dim_ind`.
    pub fn sendrecv_vecs(
        &mut self,
        dim_ind: usize,
        dir: Direction,
        buf_s: &[Rvec],
        n_r: usize,
    ) -> Vec<Rvec> {
        let (rank_s, rank_r) = self.neighbor_pair(dim_ind, dir);
        self.comm.sendrecv_vecs(rank_s, buf_s, rank_r, n_r)
    }

    /// Build the halo: select, exchange and index the zone charge groups
    /// for all dimensions and pulses.
    pub(crate) fn setup_halo(&mut self, boxm: &BoxMatrix, fr: &mut ForceRec) {
        debug!("setting up the halo exchange");

        // Triclinic distances are needed once any dimension up to this one
        // is skewed.
        let mut tric_dist = [false; DIM];
        for dim_ind in 0..self.ndim {
            for i in 0..=dim_ind {
                if self.tric.tric_dir[self.dims[i]] {
                    tric_dist[dim_ind] = true;
                }
            }
        }

        let two_cut = self.grid_jump
            && self.inter_cg_multibody
            && self.ndim > 1
            && self.cutoff_mbody < self.cutoff;

        let dim0 = self.dims[0];
        let mut dim1 = usize::MAX;

        // Corner per dimension and zone; a second set for the multi-body
        // cut-off.
        let mut corner = [[0.0f64; 4]; DIM];
        let mut bcorner = [[0.0f64; 4]; DIM];
        let mut corner_round_0 = 0.0f64;
        let mut corner_round_1 = [0.0f64; 4];
        let mut bcorner_round_1 = [0.0f64; 4];

        // The first dimension is equal for all zones.
        corner[0][0] = self.cell_x0[dim0];
        if two_cut {
            bcorner[0][0] = corner[0][0];
        }
        if self.ndim >= 2 {
            dim1 = self.dims[1];
            // This row is only seen from the first row.
            corner[1][0] = self.cell_x0[dim1];
            // All rows can see this row.
            corner[1][1] = self.cell_x0[dim1];
            if self.grid_jump {
                corner[1][1] = self.cell_x0[dim1].max(self.cell_d1[1][0]);
                if self.inter_cg_multibody {
                    // The bonded distance needs the maximum.
                    if two_cut {
                        bcorner[1][0] = corner[1][1];
                        bcorner[1][1] = corner[1][1];
                    } else {
                        corner[1][0] = corner[1][1];
                    }
                }
            }
            // The upper-right corner for distance rounding.
            corner_round_0 = self.cell_x1[dim0];

            if self.ndim >= 3 {
                let dim2 = self.dims[2];
                for j in 0..4 {
                    corner[2][j] = self.cell_x0[dim2];
                }
                if self.grid_jump {
                    // Use the maximum over the i-zones that see a j-zone.
                    for i in 0..self.zones.nizone {
                        for j in self.zones.izone[i].j0..self.zones.izone[i].j1 {
                            if j >= 4 {
                                let sh0 = self.zones.shift[i][dim0];
                                let sh1 = self.zones.shift[i][dim1];
                                corner[2][j - 4] =
                                    corner[2][j - 4].max(self.cell_d2[sh0][sh1][0]);
                            }
                        }
                    }
                    if self.inter_cg_multibody {
                        // The bonded distance needs the maximum.
                        for j in 0..4 {
                            if two_cut {
                                bcorner[2][j] = corner[2][1];
                            } else {
                                corner[2][j] = corner[2][1];
                            }
                        }
                    }
                }

                // Rounding corners: zones (0,0,0) and (1,0,0) see zone
                // (0,1,1), only (0,0,0) sees (1,1,1).
                corner_round_1[0] = self.cell_x1[dim1];
                corner_round_1[3] = self.cell_x1[dim1];
                if self.grid_jump {
                    corner_round_1[0] = self.cell_x1[dim1].max(self.cell_d1[1][1]);
                    if self.inter_cg_multibody {
                        if two_cut {
                            bcorner_round_1[0] = corner_round_1[0];
                            bcorner_round_1[3] = corner_round_1[0];
                        } else {
                            corner_round_1[3] = corner_round_1[0];
                        }
                    }
                }
            }
        }

        let r_comm2 = self.cutoff * self.cutoff;
        let r_bcomm2 = self.cutoff_mbody * self.cutoff_mbody;

        let skew_fac2_0 = self.tric.skew_fac[dim0] * self.tric.skew_fac[dim0];
        let skew_fac2_1 = if self.ndim >= 3 {
            self.tric.skew_fac[dim1] * self.tric.skew_fac[dim1]
        } else {
            0.0
        };

        self.ncg_zone[0] = 0;
        self.ncg_zone[1] = self.ncg_home;
        self.zone_ncg1[0] = self.ncg_home;
        let mut pos_cg = self.ncg_home;

        let mut nat_tot = self.nat_home;
        let mut nzone = 1;
        for dim_ind in 0..self.ndim {
            let dim = self.dims[dim_ind];
            let np = self.cd[dim_ind].np;
            let v_d = self.tric.v[dim];
            let skew_fac2_d = self.tric.skew_fac[dim] * self.tric.skew_fac[dim];
            let at_pbc_edge = self.ci[dim] == 0;

            self.cd[dim_ind].in_place = true;
            for p in 0..np {
                let mut send_idx: Vec<usize> = Vec::new();
                let mut send_gl: Vec<i64> = Vec::new();
                let mut send_cm: Vec<Rvec> = Vec::new();
                let mut nsend_zone = [0usize; MAX_ZONES + 2];
                let mut nsend = 0usize;
                let mut nat = 0usize;

                for zone in 0..nzone {
                    let zonei = ZONE_PERM[dim_ind][zone];
                    let (cg0, cg1) = if p == 0 {
                        // Walk the zones in permuted order so the selected
                        // groups come out consecutive for neighbor search.
                        (self.ncg_zone[zonei], self.ncg_zone[zonei + 1])
                    } else {
                        // Only the groups received in the previous pulse.
                        let cg1 = self.ncg_zone[nzone + zone + 1];
                        (cg1 - self.cd[dim_ind].ind[p - 1].nrecv[zone], cg1)
                    };
                    for cg in cg0..cg1 {
                        let cm = fr.cg_cm[cg];
                        let mut r2 = 0.0;
                        let mut rb2 = 0.0;
                        if !tric_dist[dim_ind] {
                            // Rectangular direction, easy.
                            let r = cm[dim] - corner[dim_ind][zone];
                            if r > 0.0 {
                                r2 += r * r;
                            }
                            if two_cut {
                                let r = cm[dim] - bcorner[dim_ind][zone];
                                if r > 0.0 {
                                    rb2 += r * r;
                                }
                            }
                            // Rounding trims up to a sixth of the
                            // communicated groups.
                            if dim_ind >= 1 && (zonei == 1 || zonei == 2) {
                                let r = cm[dim0] - corner_round_0;
                                // First dimension, always r >= 0.
                                r2 += r * r;
                                if two_cut {
                                    rb2 += r * r;
                                }
                            }
                            if dim_ind == 2 && (zonei == 2 || zonei == 3) {
                                let r = cm[dim1] - corner_round_1[zone];
                                if r > 0.0 {
                                    r2 += r * r;
                                }
                                if two_cut {
                                    let r = cm[dim1] - bcorner_round_1[zone];
                                    if r > 0.0 {
                                        rb2 += r * r;
                                    }
                                }
                            }
                        } else {
                            // Triclinic direction: project out the skewed
                            // components first.
                            let mut tric_sh = 0.0;
                            for i in dim + 1..DIM {
                                tric_sh -= cm[i] * v_d[i][dim];
                            }
                            let r = cm[dim] - corner[dim_ind][zone] + tric_sh;
                            if r > 0.0 {
                                r2 += r * r * skew_fac2_d;
                            }
                            if two_cut {
                                let r = cm[dim] - bcorner[dim_ind][zone] + tric_sh;
                                if r > 0.0 {
                                    rb2 += r * r * skew_fac2_d;
                                }
                            }
                            // Rounding, conservative: the skew factor
                            // slightly underestimates the distance.
                            if dim_ind >= 1 && (zonei == 1 || zonei == 2) {
                                let mut r = cm[dim0] - corner_round_0;
                                for i in dim0 + 1..DIM {
                                    r -= cm[i] * self.tric.v[dim0][i][dim0];
                                }
                                r2 += r * r * skew_fac2_0;
                                if two_cut {
                                    rb2 += r * r * skew_fac2_0;
                                }
                            }
                            if dim_ind == 2 && (zonei == 2 || zonei == 3) {
                                let mut tric_sh = 0.0;
                                for i in dim1 + 1..DIM {
                                    tric_sh -= cm[i] * self.tric.v[dim1][i][dim1];
                                }
                                let r = cm[dim1] - corner_round_1[zone] + tric_sh;
                                if r > 0.0 {
                                    r2 += r * r * skew_fac2_1;
                                }
                                if two_cut {
                                    let r = cm[dim1] - bcorner_round_1[zone] + tric_sh;
                                    if r > 0.0 {
                                        rb2 += r * r * skew_fac2_1;
                                    }
                                }
                            }
                        }

                        if r2 < r_comm2 || (two_cut && rb2 < r_bcomm2) {
                            send_idx.push(cg);
                            send_gl.push(self.index_gl[cg] as i64);
                            nsend_zone[zone] += 1;
                            if at_pbc_edge {
                                // Correct the center for periodicity.
                                send_cm.push(cm + box_row(boxm, dim));
                            } else {
                                send_cm.push(cm);
                            }
                            nsend += 1;
                            nat += self.cgindex[cg + 1] - self.cgindex[cg];
                        }
                    }
                }
                nsend_zone[nzone] = nsend;
                nsend_zone[nzone + 1] = nat;

                // Exchange the group and atom counts to receive.
                let (rank_s, rank_r) = self.neighbor_pair(dim_ind, Direction::Backward);
                let counts: Vec<i64> = nsend_zone[..nzone + 2].iter().map(|&n| n as i64).collect();
                let rcounts = self.comm.sendrecv_ints(rank_s, &counts, rank_r, nzone + 2);
                let mut nrecv_zone = [0usize; MAX_ZONES + 2];
                for (dst, src) in nrecv_zone[..nzone + 2].iter_mut().zip(&rcounts) {
                    *dst = *src as usize;
                }

                if p > 0 {
                    // Reception stays in place only while every zone but
                    // the last receives nothing.
                    for zone in 0..nzone - 1 {
                        if nrecv_zone[zone] > 0 {
                            self.cd[dim_ind].in_place = false;
                        }
                    }
                }
                let in_place = self.cd[dim_ind].in_place;

                // Exchange the global group indices.
                let recv_gl =
                    self.comm.sendrecv_ints(rank_s, &send_gl, rank_r, nrecv_zone[nzone]);
                // Exchange the centers.
                let recv_cm =
                    self.comm.sendrecv_vecs(rank_s, &send_cm, rank_r, nrecv_zone[nzone]);

                ensure_len(&mut self.index_gl, pos_cg + nrecv_zone[nzone]);
                ensure_len(&mut self.cgindex, pos_cg + nrecv_zone[nzone] + 1);
                ensure_len(&mut fr.cg_cm, pos_cg + nrecv_zone[nzone]);

                {
                    let ind = &mut self.cd[dim_ind].ind[p];
                    ind.nsend = nsend_zone;
                    ind.nrecv = nrecv_zone;
                    ind.index = send_idx;
                }

                if in_place {
                    for (i, (&gl, &cmv)) in recv_gl.iter().zip(&recv_cm).enumerate() {
                        self.index_gl[pos_cg + i] = gl as usize;
                        fr.cg_cm[pos_cg + i] = cmv;
                    }
                    // Extend the atom index over the appended groups.
                    let mut zone = if p == 0 { 0 } else { nzone - 1 };
                    while zone < nzone {
                        for _ in 0..nrecv_zone[zone] {
                            let cg_gl = GlobalCg(self.index_gl[pos_cg]);
                            let nrcg = self.gcgs.size(cg_gl);
                            self.cgindex[pos_cg + 1] = self.cgindex[pos_cg] + nrcg;
                            pos_cg += 1;
                        }
                        if p == 0 {
                            self.zone_ncg1[nzone + zone] = nrecv_zone[zone];
                        }
                        zone += 1;
                        self.ncg_zone[nzone + zone] = pos_cg;
                    }
                } else {
                    let recv_i: Vec<usize> = recv_gl.iter().map(|&g| g as usize).collect();
                    let mut ncg_zone = self.ncg_zone;
                    merge_cg_buffers(
                        nzone,
                        &mut self.cd[dim_ind],
                        p,
                        &mut ncg_zone,
                        &mut self.index_gl,
                        &recv_i,
                        &mut fr.cg_cm,
                        &recv_cm,
                        &self.gcgs.index,
                        &mut self.cgindex,
                    );
                    self.ncg_zone = ncg_zone;
                    pos_cg += nrecv_zone[nzone];
                }
                nat_tot += nrecv_zone[nzone + 1];
            }
            if !self.cd[dim_ind].in_place {
                // Record the per-zone atom blocks for scratch packing.
                let cg_start = self.ncg_zone[nzone];
                let cgindex = std::mem::take(&mut self.cgindex);
                make_cell2at_index(&mut self.cd[dim_ind], nzone, cg_start, &cgindex);
                self.cgindex = cgindex;
            }
            nzone += nzone;
        }

        self.ncg_tot = self.ncg_zone[self.zones.nzone];
        self.nat_tot = nat_tot;
        self.nat[AtomRole::Home as usize] = self.nat_home;
        for role in AtomRole::Zone as usize..ROLE_COUNT {
            self.nat[role] = self.nat_tot;
        }

        debug!(
            ncg_tot = self.ncg_tot,
            nat_tot = self.nat_tot,
            "finished setting up the halo exchange"
        );
    }

    /// Push the home coordinates into the halo zones of the neighbor
    /// ranks, dimension by dimension, pulse by pulse.
    pub fn move_x(&mut self, boxm: &BoxMatrix, x: &mut [Rvec]) {
        let mut nzone = 1;
        let mut nat_tot = self.nat_home;
        for d in 0..self.ndim {
            let dim = self.dims[d];
            let shift = if self.ci[dim] == 0 { Some(box_row(boxm, dim)) } else { None };
            for p in 0..self.cd[d].np {
                let index = std::mem::take(&mut self.cd[d].ind[p].index);
                let nsend = self.cd[d].ind[p].nsend;
                let nrecv = self.cd[d].ind[p].nrecv;
                let in_place = self.cd[d].in_place;
                let cell2at0 = self.cd[d].ind[p].cell2at0;
                let cell2at1 = self.cd[d].ind[p].cell2at1;

                let mut sbuf: Vec<Rvec> = Vec::with_capacity(nsend[nzone + 1]);
                for &icg in index.iter().take(nsend[nzone]) {
                    for j in self.cgindex[icg]..self.cgindex[icg + 1] {
                        match shift {
                            // Shift the coordinates over the periodic edge.
                            Some(s) => sbuf.push(x[j] + s),
                            None => sbuf.push(x[j]),
                        }
                    }
                }

                // Send the coordinates backward, against the halo flow.
                let (rank_s, rank_r) = self.neighbor_pair(d, Direction::Backward);
                let rbuf =
                    self.comm.sendrecv_vecs(rank_s, &sbuf, rank_r, nrecv[nzone + 1]);
                if in_place {
                    x[nat_tot..nat_tot + rbuf.len()].copy_from_slice(&rbuf);
                } else {
                    let mut j = 0;
                    for zone in 0..nzone {
                        for i in cell2at0[zone]..cell2at1[zone] {
                            x[i] = rbuf[j];
                            j += 1;
                        }
                    }
                }
                nat_tot += nrecv[nzone + 1];

                self.cd[d].ind[p].index = index;
            }
            nzone += nzone;
        }
    }

    /// Pull the halo forces back onto the home atoms, walking the exact
    /// reverse of [`DomDec::move_x`]. When `fshift` is given, forces that
    /// crossed the periodic boundary also accumulate into the virial
    /// shift-force bucket of that boundary.
    pub fn move_f(&mut self, f: &mut [Rvec], mut fshift: Option<&mut [Rvec]>) {
        let mut nzone = self.zones.nzone / 2;
        let mut nat_tot = self.nat_tot;
        for d in (0..self.ndim).rev() {
            let dim = self.dims[d];
            for p in (0..self.cd[d].np).rev() {
                let index = std::mem::take(&mut self.cd[d].ind[p].index);
                let nsend = self.cd[d].ind[p].nsend;
                let nrecv = self.cd[d].ind[p].nrecv;
                let in_place = self.cd[d].in_place;
                let cell2at0 = self.cd[d].ind[p].cell2at0;
                let cell2at1 = self.cd[d].ind[p].cell2at1;

                nat_tot -= nrecv[nzone + 1];
                let sbuf: Vec<Rvec> = if in_place {
                    f[nat_tot..nat_tot + nrecv[nzone + 1]].to_vec()
                } else {
                    let mut buf = Vec::with_capacity(nrecv[nzone + 1]);
                    for zone in 0..nzone {
                        for i in cell2at0[zone]..cell2at1[zone] {
                            buf.push(f[i]);
                        }
                    }
                    buf
                };

                // The forces travel forward, back to their home ranks.
                let (rank_s, rank_r) = self.neighbor_pair(d, Direction::Forward);
                let rbuf = self.comm.sendrecv_vecs(rank_s, &sbuf, rank_r, nsend[nzone + 1]);

                // Add the received forces.
                let mut n = 0;
                let at_edge = self.ci[dim] == 0;
                for &icg in index.iter().take(nsend[nzone]) {
                    if at_edge && fshift.is_some() {
                        let mut vis = [0i32; DIM];
                        vis[dim] = 1;
                        let is = ivec2is(vis);
                        for j in self.cgindex[icg]..self.cgindex[icg + 1] {
                            f[j] += rbuf[n];
                            // This force also moved over the boundary.
                            if let Some(fs) = fshift.as_deref_mut() {
                                fs[is] += rbuf[n];
                            }
                            n += 1;
                        }
                    } else {
                        for j in self.cgindex[icg]..self.cgindex[icg + 1] {
                            f[j] += rbuf[n];
                            n += 1;
                        }
                    }
                }

                self.cd[d].ind[p].index = index;
            }
            nzone /= 2;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shift_indices_are_distinct_and_centered() {
        assert_eq!(ivec2is([0, 0, 0]), CENTRAL_SHIFT);
        let mut seen = std::collections::HashSet::new();
        for z in -1..=1 {
            for y in -1..=1 {
                for x in -1..=1 {
                    assert!(seen.insert(ivec2is([x, y, z])));
                }
            }
        }
        assert_eq!(seen.len(), SHIFTS);
    }

    #[test]
    fn cell2at_blocks_follow_pulse_order() {
        let mut cd = CommDim { np: 2, ind: vec![PulseInd::default(); 2], in_place: false };
        cd.ind[0].nrecv[0] = 2;
        cd.ind[1].nrecv[0] = 1;
        // Three received single-atom groups starting at local group 4.
        let cgindex: Vec<usize> = (0..8).collect();
        make_cell2at_index(&mut cd, 1, 4, &cgindex);
        assert_eq!((cd.ind[0].cell2at0[0], cd.ind[0].cell2at1[0]), (4, 6));
        assert_eq!((cd.ind[1].cell2at0[0], cd.ind[1].cell2at1[0]), (6, 7));
    }
}
