//! Reordering the home charge groups by neighbor-search cell
//!
//! Sorting the home groups on their neighbor-search cell index (with the
//! global index as tie-break) keeps pair-search memory access local and
//! makes restarts reproducible. When the search grid kept its dimensions
//! since the previous partitioning, the groups that stayed in their cell
//! are already in order; only the movers are comparison-sorted and the two
//! sequences merged. Otherwise the whole home set is sorted.
//!
//! The resulting permutation is applied to every state vector, the group
//! centers, the global-index table and the cell-index array; the local atom
//! index is rebuilt from the per-group sizes.

use tracing::debug;

use crate::partition::{DomDec, ForceRec};
use crate::system::{ensure_len, State, STATE_HAS_CGP, STATE_HAS_SDX, STATE_HAS_V};
use crate::Rvec;

/// One sort key: neighbor-search cell, global index, old local index.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CgSort {
    /// Neighbor-search cell index, the primary key.
    pub nsc: i32,
    /// Global charge-group index, the tie-break.
    pub ind_gl: usize,
    /// Local index before sorting.
    pub ind: usize,
}

#[inline]
fn cgsort_cmp(a: &CgSort, b: &CgSort) -> std::cmp::Ordering {
    a.nsc.cmp(&b.nsc).then(a.ind_gl.cmp(&b.ind_gl))
}

/// Reusable sorting workspace.
#[derive(Clone, Debug, Default)]
pub struct SortBuffers {
    /// The final sorted keys, kept across partitionings.
    pub sort1: Vec<CgSort>,
    /// Keys of the groups that stayed in their search cell.
    pub sort2: Vec<CgSort>,
    /// Keys of the groups that moved or are new on this rank.
    pub sort_new: Vec<CgSort>,
    /// Scratch for permuting coordinate vectors.
    pub vbuf: Vec<Rvec>,
    /// Scratch for permuting index arrays.
    pub ibuf: Vec<usize>,
}

/// Merge the already-ordered stationary keys with the freshly sorted
/// movers into `out`.
pub(crate) fn ordered_sort(sort2: &[CgSort], sort_new: &mut [CgSort], out: &mut Vec<CgSort>) {
    // The moved keys arrive in no particular order.
    sort_new.sort_unstable_by(cgsort_cmp);

    out.clear();
    let mut i2 = 0;
    let mut i_new = 0;
    while i2 < sort2.len() || i_new < sort_new.len() {
        if i2 == sort2.len() {
            out.push(sort_new[i_new]);
            i_new += 1;
        } else if i_new == sort_new.len() {
            out.push(sort2[i2]);
            i2 += 1;
        } else if cgsort_cmp(&sort2[i2], &sort_new[i_new]) == std::cmp::Ordering::Less {
            out.push(sort2[i2]);
            i2 += 1;
        } else {
            out.push(sort_new[i_new]);
            i_new += 1;
        }
    }
}

/// Apply the permutation to a per-atom vector through the scratch buffer.
fn order_vec_atom(ncg: usize, cgindex: &[usize], sort: &[CgSort], v: &mut [Rvec], buf: &mut Vec<Rvec>) {
    buf.clear();
    for s in sort.iter().take(ncg) {
        for i in cgindex[s.ind]..cgindex[s.ind + 1] {
            buf.push(v[i]);
        }
    }
    v[..buf.len()].copy_from_slice(buf);
}

/// Apply the permutation to a per-group vector through the scratch buffer.
fn order_vec_cg(ncg: usize, sort: &[CgSort], v: &mut [Rvec], buf: &mut Vec<Rvec>) {
    buf.clear();
    for s in sort.iter().take(ncg) {
        buf.push(v[s.ind]);
    }
    v[..ncg].copy_from_slice(buf);
}

/// Apply the permutation to a per-group index array.
fn order_int_cg(ncg: usize, sort: &[CgSort], a: &mut [usize], buf: &mut Vec<usize>) {
    buf.clear();
    for s in sort.iter().take(ncg) {
        buf.push(a[s.ind]);
    }
    a[..ncg].copy_from_slice(buf);
}

impl DomDec {
    /// Sort the home state on charge-group search cell. `ncg_home_old` is
    /// the previous home count when the search grid kept its dimensions
    /// (enabling the stationary/moved split), or `None` for a full sort.
    /// Entries equal to `moved_sentinel` left by the redistribution are
    /// dropped from the home set.
    pub(crate) fn sort_state(
        &mut self,
        fr: &mut ForceRec,
        state: &mut State,
        cell_index: &mut [i32],
        moved_sentinel: i32,
        ncg_home_old: Option<usize>,
    ) {
        let mut sort = std::mem::take(&mut self.sort);

        let ncg_new;
        if let Some(ncg_old) = ncg_home_old {
            // The groups that stayed in their search cell are completely
            // ordered, so only the movers need sorting.
            sort.sort2.clear();
            sort.sort_new.clear();
            ncg_new = {
                let mut ncg_new = 0;
                for i in 0..self.ncg_home {
                    let nsc = cell_index[i];
                    if nsc == moved_sentinel {
                        // Moved to another rank at redistribution.
                        continue;
                    }
                    let entry = CgSort { nsc, ind_gl: self.index_gl[i], ind: i };
                    if i >= ncg_old || sort.sort1.get(i).map(|s| s.nsc) != Some(nsc) {
                        // New on this rank or moved search cell.
                        sort.sort_new.push(entry);
                    } else {
                        sort.sort2.push(entry);
                    }
                    ncg_new += 1;
                }
                ncg_new
            };
            debug!(
                stationary = sort.sort2.len(),
                moved = sort.sort_new.len(),
                "ordered sort of home charge groups"
            );
            let (sort2, sort_new, sort1) = (&sort.sort2, &mut sort.sort_new, &mut sort.sort1);
            ordered_sort(sort2, sort_new, sort1);
        } else {
            sort.sort1.clear();
            let mut n = 0;
            for i in 0..self.ncg_home {
                let nsc = cell_index[i];
                if nsc != moved_sentinel {
                    n += 1;
                }
                sort.sort1.push(CgSort { nsc, ind_gl: self.index_gl[i], ind: i });
            }
            ncg_new = n;
            debug!(ncg = self.ncg_home, staying = ncg_new, "full sort of home charge groups");
            sort.sort1.sort_unstable_by(cgsort_cmp);
        }

        // Drop the groups that are no longer home here; the moved sentinel
        // sorts behind every real cell.
        self.ncg_home = ncg_new;

        // Reorder the state vectors; the atom index is still the old one.
        order_vec_atom(self.ncg_home, &self.cgindex, &sort.sort1, &mut state.x, &mut sort.vbuf);
        if state.flags & STATE_HAS_V != 0 {
            order_vec_atom(self.ncg_home, &self.cgindex, &sort.sort1, &mut state.v, &mut sort.vbuf);
        }
        if state.flags & STATE_HAS_SDX != 0 {
            order_vec_atom(
                self.ncg_home,
                &self.cgindex,
                &sort.sort1,
                &mut state.sd_x,
                &mut sort.vbuf,
            );
        }
        if state.flags & STATE_HAS_CGP != 0 {
            order_vec_atom(
                self.ncg_home,
                &self.cgindex,
                &sort.sort1,
                &mut state.cg_p,
                &mut sort.vbuf,
            );
        }
        order_vec_cg(self.ncg_home, &sort.sort1, &mut fr.cg_cm, &mut sort.vbuf);

        // Reorder the global group index and rebuild the local atom index.
        order_int_cg(self.ncg_home, &sort.sort1, &mut self.index_gl, &mut sort.ibuf);
        ensure_len(&mut sort.ibuf, self.ncg_home + 1);
        sort.ibuf[0] = 0;
        for i in 0..self.ncg_home {
            let size = self.cgindex[sort.sort1[i].ind + 1] - self.cgindex[sort.sort1[i].ind];
            sort.ibuf[i + 1] = sort.ibuf[i] + size;
        }
        self.cgindex[..self.ncg_home + 1].copy_from_slice(&sort.ibuf[..self.ncg_home + 1]);
        self.nat_home = self.cgindex[self.ncg_home];

        // Hand the sorted search-cell indices back to the search grid.
        for i in 0..self.ncg_home {
            cell_index[i] = sort.sort1[i].nsc;
        }

        self.master_has_all_cg = false;

        self.sort = sort;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(nsc: i32, ind_gl: usize, ind: usize) -> CgSort {
        CgSort { nsc, ind_gl, ind }
    }

    #[test]
    fn merge_matches_full_sort() {
        let sort2 = vec![key(0, 3, 0), key(1, 1, 2), key(2, 9, 4)];
        let mut sort_new = vec![key(1, 0, 5), key(0, 8, 1), key(2, 2, 3)];
        let mut merged = Vec::new();
        ordered_sort(&sort2, &mut sort_new, &mut merged);

        let mut full: Vec<CgSort> = sort2.iter().chain(sort_new.iter()).copied().collect();
        full.sort_unstable_by(cgsort_cmp);
        assert_eq!(merged, full);
        // Primary key first, global index breaks ties.
        assert!(merged.windows(2).all(|w| cgsort_cmp(&w[0], &w[1]) != std::cmp::Ordering::Greater));
    }

    #[test]
    fn atom_vectors_follow_group_permutation() {
        // Two groups of sizes 2 and 1, swapped by the permutation.
        let cgindex = vec![0usize, 2, 3];
        let sort = vec![key(0, 1, 1), key(1, 0, 0)];
        let mut v = vec![
            Rvec::new(1.0, 0.0, 0.0),
            Rvec::new(2.0, 0.0, 0.0),
            Rvec::new(3.0, 0.0, 0.0),
        ];
        let mut buf = Vec::new();
        order_vec_atom(2, &cgindex, &sort, &mut v, &mut buf);
        assert_eq!(v[0], Rvec::new(3.0, 0.0, 0.0));
        assert_eq!(v[1], Rvec::new(1.0, 0.0, 0.0));
        assert_eq!(v[2], Rvec::new(2.0, 0.0, 0.0));
    }
}
