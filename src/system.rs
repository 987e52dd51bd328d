//! Data model: charge groups, local state vectors, atom roles
//!
//! A *charge group* is an indivisible cluster of atoms with a single center
//! of geometry; spatial binning and periodic-image decisions act on the
//! center, never on individual atoms. The global charge-group table is
//! immutable for the duration of a run; per-rank ownership of groups and the
//! layout of the local atom array change every (re)partitioning.
//!
//! The local atom array is partitioned by [`AtomRole`] in a fixed order.
//! Each role occupies one contiguous range `[nat[r-1], nat[r])`, so a single
//! monotone array of four counters describes the whole layout.
//!
//! Buffers owned by the engine grow geometrically (see [`over_alloc_small`]
//! and friends) so that the steady state after a short warm-up performs no
//! per-step allocation.

use serde::{Deserialize, Serialize};

use crate::Rvec;

/// Index of a charge group in the global topology.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlobalCg(pub usize);
impl GlobalCg {
    /// Access the underlying index.
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// Role of a local atom. Home and zone must come first and second; the
/// remaining roles extend the array in this order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AtomRole {
    /// Owned atoms, from charge groups whose center lies in this rank's cell.
    Home = 0,
    /// Halo atoms received for pair interactions.
    Zone = 1,
    /// Extra atoms needed to construct virtual sites.
    Vsite = 2,
    /// Extra atoms needed to satisfy constraints.
    Con = 3,
}

/// Number of atom roles.
pub const ROLE_COUNT: usize = 4;

// ============================================================================
// Global charge-group table
// ============================================================================

/// The global charge-group division of the system: `index[g]..index[g+1]` is
/// the contiguous global atom range of group `g`. Immutable after startup.
#[derive(Clone, Debug)]
pub struct GlobalCgs {
    /// Prefix index of length `ncg + 1`; `index[ncg]` is the atom total.
    pub index: Vec<usize>,
}

impl GlobalCgs {
    /// Build the table from per-group sizes.
    pub fn from_sizes(sizes: &[usize]) -> Self {
        let mut index = Vec::with_capacity(sizes.len() + 1);
        let mut at = 0;
        index.push(0);
        for &s in sizes {
            at += s;
            index.push(at);
        }
        Self { index }
    }

    /// One single-atom group per atom, the common all-atom case.
    pub fn single_atom_groups(natoms: usize) -> Self {
        Self { index: (0..=natoms).collect() }
    }

    /// Number of charge groups in the system.
    #[inline]
    pub fn ncg(&self) -> usize {
        self.index.len() - 1
    }

    /// Number of atoms in the system.
    #[inline]
    pub fn natoms(&self) -> usize {
        *self.index.last().expect("charge group table is never empty")
    }

    /// Number of atoms in group `cg`.
    #[inline]
    pub fn size(&self, cg: GlobalCg) -> usize {
        self.index[cg.0 + 1] - self.index[cg.0]
    }

    /// Global atom range of group `cg`.
    #[inline]
    pub fn atom_range(&self, cg: GlobalCg) -> std::ops::Range<usize> {
        self.index[cg.0]..self.index[cg.0 + 1]
    }
}

// ============================================================================
// Over-allocation policy
// ============================================================================

/// Growth factor for communication and state buffers.
const OVER_ALLOC_FAC: f64 = 1.19;

/// Geometric overshoot for small per-rank buffers.
#[inline]
pub fn over_alloc_small(n: usize) -> usize {
    (OVER_ALLOC_FAC * n as f64) as usize + 10
}

/// Geometric overshoot for buffers that scale with the system size.
#[inline]
pub fn over_alloc_large(n: usize) -> usize {
    (OVER_ALLOC_FAC * n as f64) as usize + 100
}

/// Overshoot used for the decomposition's own index and state buffers.
#[inline]
pub fn over_alloc_dd(n: usize) -> usize {
    over_alloc_large(n)
}

/// Grow `v` so that indices `0..needed` are valid, over-allocating to avoid
/// frequent reallocation. Never shrinks.
#[inline]
pub fn ensure_len<T: Clone + Default>(v: &mut Vec<T>, needed: usize) {
    if v.len() < needed {
        v.resize(over_alloc_dd(needed), T::default());
    }
}

// ============================================================================
// Local and global state
// ============================================================================

/// The local state carries velocities.
pub const STATE_HAS_V: u32 = 1 << 0;
/// The local state carries stochastic-dynamics history positions.
pub const STATE_HAS_SDX: u32 = 1 << 1;
/// The local state carries conjugate-gradient search vectors.
pub const STATE_HAS_CGP: u32 = 1 << 2;

/// Per-rank (or, for the master copy, whole-system) dynamical state.
///
/// The optional vectors are driven by a single `flags` word; everything that
/// walks the state (redistribution packing, sorting, gather/scatter) iterates
/// a fixed, flag-driven list of vector buffers rather than pointer arrays.
#[derive(Clone, Debug)]
pub struct State {
    /// Which optional vectors are present (`STATE_HAS_*`).
    pub flags: u32,
    /// Simulation box, lower-triangular rows.
    pub boxm: crate::BoxMatrix,
    /// Box at the reference pressure, for box-shape preservation.
    pub box_rel: crate::BoxMatrix,
    /// Box velocities under pressure coupling.
    pub boxv: crate::BoxMatrix,
    /// Free-energy coupling parameter.
    pub lambda: f64,
    /// Thermostat integral per temperature group.
    pub nosehoover_xi: Vec<f64>,
    /// Positions.
    pub x: Vec<Rvec>,
    /// Velocities (present iff `STATE_HAS_V`).
    pub v: Vec<Rvec>,
    /// Stochastic-dynamics history (present iff `STATE_HAS_SDX`).
    pub sd_x: Vec<Rvec>,
    /// Conjugate-gradient vectors (present iff `STATE_HAS_CGP`).
    pub cg_p: Vec<Rvec>,
    /// Number of atoms the vectors describe.
    pub natoms: usize,

    /// Partitioning generation this state belongs to.
    pub ddp_count: u64,
    /// Generation at which `cg_gl` was written.
    pub ddp_count_cg_gl: u64,
    /// Number of owned charge groups recorded in `cg_gl`.
    pub ncg_gl: usize,
    /// Owned global charge-group indices, for checkpointing.
    pub cg_gl: Vec<usize>,
}

impl State {
    /// A state with `natoms` zeroed positions and the given optional vectors.
    pub fn new(natoms: usize, flags: u32) -> Self {
        let zero = Rvec::zeros();
        Self {
            flags,
            boxm: crate::BoxMatrix::zeros(),
            box_rel: crate::BoxMatrix::zeros(),
            boxv: crate::BoxMatrix::zeros(),
            lambda: 0.0,
            nosehoover_xi: Vec::new(),
            x: vec![zero; natoms],
            v: if flags & STATE_HAS_V != 0 { vec![zero; natoms] } else { Vec::new() },
            sd_x: if flags & STATE_HAS_SDX != 0 { vec![zero; natoms] } else { Vec::new() },
            cg_p: if flags & STATE_HAS_CGP != 0 { vec![zero; natoms] } else { Vec::new() },
            natoms,
            ddp_count: 0,
            ddp_count_cg_gl: 0,
            ncg_gl: 0,
            cg_gl: Vec::new(),
        }
    }

    /// Number of vector buffers present, including positions.
    #[inline]
    pub fn nvec(&self) -> usize {
        let mut n = 1;
        if self.flags & STATE_HAS_V != 0 {
            n += 1;
        }
        if self.flags & STATE_HAS_SDX != 0 {
            n += 1;
        }
        if self.flags & STATE_HAS_CGP != 0 {
            n += 1;
        }
        n
    }

    /// Grow all present vectors to hold at least `natoms` entries.
    pub fn realloc(&mut self, natoms: usize) {
        ensure_len(&mut self.x, natoms);
        if self.flags & STATE_HAS_V != 0 {
            ensure_len(&mut self.v, natoms);
        }
        if self.flags & STATE_HAS_SDX != 0 {
            ensure_len(&mut self.sd_x, natoms);
        }
        if self.flags & STATE_HAS_CGP != 0 {
            ensure_len(&mut self.cg_p, natoms);
        }
        self.natoms = natoms;
    }

    /// The present vector buffers in their fixed order, mutably.
    pub fn vectors_mut(&mut self) -> Vec<&mut Vec<Rvec>> {
        let mut out: Vec<&mut Vec<Rvec>> = vec![&mut self.x];
        if self.flags & STATE_HAS_V != 0 {
            out.push(&mut self.v);
        }
        if self.flags & STATE_HAS_SDX != 0 {
            out.push(&mut self.sd_x);
        }
        if self.flags & STATE_HAS_CGP != 0 {
            out.push(&mut self.cg_p);
        }
        out
    }
}

// ============================================================================
// Global <-> local atom map
// ============================================================================

/// Entry of the global-to-local atom table.
#[derive(Copy, Clone, Debug)]
pub struct Ga2La {
    /// Zone the atom lives in, or `-1` when not present locally. Values
    /// `>= nzone` signal a zone atom received from more than one cell away.
    pub zone: i32,
    /// Local atom index, valid only when `zone >= 0`.
    pub la: usize,
}

impl Default for Ga2La {
    fn default() -> Self {
        Self { zone: -1, la: 0 }
    }
}

/// Global-to-local atom lookup, sized to the whole system once at startup.
#[derive(Clone, Debug, Default)]
pub struct GlobalAtomMap {
    entries: Vec<Ga2La>,
}

impl GlobalAtomMap {
    /// An all-absent table for a system of `natoms_global` atoms.
    pub fn new(natoms_global: usize) -> Self {
        Self { entries: vec![Ga2La::default(); natoms_global] }
    }

    /// Record global atom `a_gl` as local atom `la` in `zone`.
    #[inline]
    pub fn set(&mut self, a_gl: usize, zone: i32, la: usize) {
        self.entries[a_gl] = Ga2La { zone, la };
    }

    /// Mark global atom `a_gl` as not present on this rank.
    #[inline]
    pub fn clear(&mut self, a_gl: usize) {
        self.entries[a_gl].zone = -1;
    }

    /// Local index of `a_gl`, if present on this rank.
    #[inline]
    pub fn get(&self, a_gl: usize) -> Option<Ga2La> {
        let e = self.entries[a_gl];
        if e.zone >= 0 {
            Some(e)
        } else {
            None
        }
    }
}

// ============================================================================
// Persisted ownership snapshot
// ============================================================================

/// The owner's charge-group list as persisted on checkpoint, together with
/// the partitioning generation it belongs to. A mismatch between the
/// generation here and the one in the live engine is a consistency error.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    /// Partitioning generation the list belongs to.
    pub ddp_count: u64,
    /// The owned global charge-group indices.
    pub cg_gl: Vec<usize>,
}

impl Checkpoint {
    /// Serialize to the on-disk representation.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("checkpoint serialization cannot fail")
    }

    /// Parse the on-disk representation.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cg_table_sizes_and_ranges() {
        let cgs = GlobalCgs::from_sizes(&[3, 1, 2]);
        assert_eq!(cgs.ncg(), 3);
        assert_eq!(cgs.natoms(), 6);
        assert_eq!(cgs.size(GlobalCg(0)), 3);
        assert_eq!(cgs.atom_range(GlobalCg(1)), 3..4);
        assert_eq!(cgs.atom_range(GlobalCg(2)), 4..6);

        let single = GlobalCgs::single_atom_groups(4);
        assert_eq!(single.ncg(), 4);
        assert_eq!(single.size(GlobalCg(3)), 1);
    }

    #[test]
    fn over_alloc_overshoots_monotonically() {
        assert!(over_alloc_small(0) >= 10);
        assert!(over_alloc_large(100) >= 219);
        let mut v: Vec<u32> = Vec::new();
        ensure_len(&mut v, 7);
        let cap = v.len();
        assert!(cap >= 7);
        // Growing below the overshoot must not reallocate.
        ensure_len(&mut v, cap);
        assert_eq!(v.len(), cap);
    }

    #[test]
    fn state_vector_list_follows_flags() {
        let mut s = State::new(5, STATE_HAS_V | STATE_HAS_CGP);
        assert_eq!(s.nvec(), 3);
        assert_eq!(s.vectors_mut().len(), 3);
        assert!(s.sd_x.is_empty());
        s.realloc(40);
        assert!(s.x.len() >= 40 && s.v.len() >= 40 && s.cg_p.len() >= 40);
    }

    #[test]
    fn atom_map_roundtrip_and_clear() {
        let mut map = GlobalAtomMap::new(10);
        assert!(map.get(3).is_none());
        map.set(3, 0, 7);
        let e = map.get(3).unwrap();
        assert_eq!((e.zone, e.la), (0, 7));
        map.clear(3);
        assert!(map.get(3).is_none());
    }

    #[test]
    fn checkpoint_json_roundtrip() {
        let ck = Checkpoint { ddp_count: 12, cg_gl: vec![4, 1, 9] };
        let back = Checkpoint::from_json(&ck.to_json()).unwrap();
        assert_eq!(back, ck);
    }
}
