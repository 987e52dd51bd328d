//! Crate root: public surface, core aliases, and engine-wide invariants
//!
//! This module is the **single canonical entry-point** for downstream users of
//! the library. It centralizes the coordinate aliases, the small index
//! newtypes, shared error categories, and re-exports the main submodules that
//! implement the spatial domain decomposition engine.
//!
//! ## Invariants
//!
//! - **Ownership.** Every charge group is owned by exactly one rank at any
//!   instant; its center of geometry lies inside that rank's cell (up to the
//!   rounding margin [`CELL_MARGIN`]). The multisets of owned global indices
//!   across ranks are pairwise disjoint and together cover the system.
//!
//! - **Atom layout.** The local atom array is partitioned by role in the
//!   fixed order home, zone, vsite, constraint; each role occupies one
//!   contiguous range and the range ends are monotone.
//!
//! - **Cell boundaries.** Normalized boundaries per decomposed dimension are
//!   strictly monotone with exact endpoints 0 and 1, and every interval stays
//!   above the minimum cell size derived from the cut-off and pulse count.
//!
//! - **Communication order.** Within a step the sequence redistribute →
//!   sort → halo build → coordinate push → force pull is total-ordered per
//!   rank; halo assembly proceeds strictly outer→inner over the decomposed
//!   dimensions and the force pull walks the exact reverse.
//!
//! If any invariant is violated at runtime, the failure mode is a **precise
//! error** (never silent continuation): geometric and consistency checks
//! abort the step with a diagnostic naming the step, axis and cell.

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

/// Message passing: paired exchanges, two-way exchanges, collectives,
/// row communicators, and the in-process network used for tests.
pub mod comm;
/// Triclinic geometry: skew factors, orthogonal basis vectors, the
/// triclinic correction matrix and periodic wrapping.
pub mod geometry;
/// Decomposition topology: grid choice, rank maps, PP/PME split, zones.
pub mod grid;
/// Cell sizers: static boundaries, the dynamic load-balancing controller,
/// staggered-boundary exchange and the grid-jump check.
pub mod cells;
/// Master-driven initial distribution and state gather/scatter.
pub mod distribute;
/// Per-step redistribution of charge groups between neighbor ranks.
pub mod redistribute;
/// Halo construction and the per-step coordinate/force exchanges.
pub mod halo;
/// Periodic reordering of home charge groups by neighbor-search cell.
pub mod sort;
/// Load monitoring along row communicators and run statistics.
pub mod load;
/// Recognized environment variables, parsed once at startup.
pub mod env;
/// Data model: global charge-group table, local state, atom roles.
pub mod system;
/// The engine object, initialization and the partition orchestration.
pub mod partition;

// ============================================================================
// Canonical aliases and root-level re-exports (centralization)
// ============================================================================

/// Number of spatial dimensions.
pub const DIM: usize = 3;

/// Coordinate vector used across the crate.
pub type Rvec = nalgebra::Vector3<f64>;

/// Simulation box: a lower-triangular matrix whose row `d` is box vector `d`
/// (`boxm[(j, i)] == 0` for `i > j`).
pub type BoxMatrix = nalgebra::Matrix3<f64>;

/// Integer grid vector (cell counts, cell coordinates).
pub type IVec = [usize; DIM];

/// Margin tolerance applied to minimum cell sizes to absorb rounding.
pub const CELL_MARGIN: f64 = 1.00001;
/// Slightly tighter margin used when re-checking after rescaling.
pub const CELL_MARGIN2: f64 = 1.000005;
/// Extra slack on boundary limits when the box is scaled by pressure coupling.
pub const PRES_SCALE_MARGIN: f64 = 1.02;
/// Extra slack on the minimum cell size when choosing the grid under
/// pressure coupling.
pub const GRID_MARGIN_PRES_SCALE: f64 = 1.05;

/// Centralized index newtypes used across the crate.
///
/// These are re-exported from `system` to keep a single definition site.
/// Downstream code should import them from the crate root.
pub use crate::system::{AtomRole, GlobalCg, ROLE_COUNT};

/// Shared error categories, unified at the crate root.
pub use crate::cells::CellSizeError;
pub use crate::grid::SetupError;
pub use crate::partition::PartitionError;
pub use crate::redistribute::CgMoveError;

// ============================================================================
// Public orchestrators
// ============================================================================

/// Re-export the engine handle and its initialization entry points.
pub use crate::partition::{Collaborators, DdOptions, DomDec, SystemInfo};

/// Re-export the communicator surface used by callers doing custom halo data.
pub use crate::comm::{DdComm, Direction, Network};
