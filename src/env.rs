//! Environment switches recognized by the engine
//!
//! All switches are optional positive integers; an unparseable value is
//! treated as 1 with a logged warning and the run continues. The snapshot is
//! taken once at initialization so later changes to the process environment
//! cannot desynchronize ranks.

use tracing::{info, warn};

/// Parsed environment configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DdEnv {
    /// Use two ordered paired exchanges instead of the simultaneous
    /// two-way exchange (`GMX_DD_SENDRECV2`).
    pub sendrecv2: bool,
    /// Load metric: 0 = measured cycles, 1 = flop count, >1 = flop count
    /// with `(value-1)*5%` random perturbation (`GMX_DLB_FLOP`).
    pub eflop: u32,
    /// Charge-group sort interval in partitionings, 0 disables
    /// (`GMX_DD_SORT`).
    pub nst_sort_cg: u32,
    /// Dump interval for home+halo contents, 0 disables (`GMX_DD_DUMP`).
    pub nst_dump: u32,
    /// Dump interval for the cell boundaries, 0 disables
    /// (`GMX_DD_DUMP_GRID`).
    pub nst_dump_grid: u32,
    /// Override for the automatically chosen pulse count, 0 keeps the
    /// automatic value (`GMX_DD_NPULSE`).
    pub npulse: u32,
    /// Assign decomposition dimensions in z, y, x order
    /// (`GMX_DD_ORDER_ZYX`).
    pub order_zyx: bool,
    /// Keep the caller's rank numbering in Cartesian layouts
    /// (`GMX_NO_CART_REORDER`).
    pub no_cart_reorder: bool,
}

impl Default for DdEnv {
    fn default() -> Self {
        Self {
            sendrecv2: false,
            eflop: 0,
            nst_sort_cg: 1,
            nst_dump: 0,
            nst_dump_grid: 0,
            npulse: 0,
            order_zyx: false,
            no_cart_reorder: false,
        }
    }
}

impl DdEnv {
    /// Snapshot from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Snapshot through an explicit lookup, for tests and embedding.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let def = Self::default();
        Self {
            sendrecv2: parse_interval(&lookup, "GMX_DD_SENDRECV2", 0) != 0,
            eflop: parse_interval(&lookup, "GMX_DLB_FLOP", 0),
            nst_sort_cg: parse_interval(&lookup, "GMX_DD_SORT", def.nst_sort_cg),
            nst_dump: parse_interval(&lookup, "GMX_DD_DUMP", 0),
            nst_dump_grid: parse_interval(&lookup, "GMX_DD_DUMP_GRID", 0),
            npulse: parse_interval(&lookup, "GMX_DD_NPULSE", 0),
            order_zyx: lookup("GMX_DD_ORDER_ZYX").is_some(),
            no_cart_reorder: lookup("GMX_NO_CART_REORDER").is_some(),
        }
    }
}

/// Parse an interval-style variable. Present-but-unparseable values fall
/// back to 1 so that setting the variable at all enables the feature.
fn parse_interval(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: u32) -> u32 {
    match lookup(name) {
        None => default,
        Some(val) => {
            let nst = match val.trim().parse::<u32>() {
                Ok(n) => n,
                Err(_) => {
                    warn!(var = name, value = %val, "unparseable environment value, using 1");
                    1
                }
            };
            info!(var = name, value = nst, "found environment variable");
            nst
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn defaults_without_environment() {
        let env = DdEnv::from_lookup(|_| None);
        assert_eq!(env, DdEnv::default());
        assert_eq!(env.nst_sort_cg, 1);
    }

    #[test]
    fn parses_intervals_and_switches() {
        let env = DdEnv::from_lookup(lookup_from(&[
            ("GMX_DD_SORT", "5"),
            ("GMX_DLB_FLOP", "2"),
            ("GMX_DD_SENDRECV2", "1"),
            ("GMX_DD_ORDER_ZYX", ""),
        ]));
        assert_eq!(env.nst_sort_cg, 5);
        assert_eq!(env.eflop, 2);
        assert!(env.sendrecv2);
        assert!(env.order_zyx);
        assert!(!env.no_cart_reorder);
    }

    #[test]
    fn unparseable_value_falls_back_to_one() {
        let env = DdEnv::from_lookup(lookup_from(&[("GMX_DD_DUMP", "often")]));
        assert_eq!(env.nst_dump, 1);
    }
}
