//! CPU placement for the listener and dispatch threads.
//!
//! The two threads spin through their drain phases and hand messages across
//! a shared ring, so they want separate physical cores that share a last
//! level cache. When only one physical core with SMT is available they go on
//! the two hardware threads of that core; otherwise they are left to the OS.
//!
//! Core counts come from `num_cpus`; pinning goes through `core_affinity`.
//! On most systems ids `0..physical` name distinct physical cores before
//! SMT siblings are enumerated, and the placement relies on that ordering.

use core_affinity::CoreId;

/// CPU topology detected at runtime.
#[derive(Debug, Clone)]
pub struct CpuTopology {
    pub logical_cores: usize,
    pub physical_cores: usize,
    pub has_smt: bool,
    /// Core ids this process may pin to.
    pub available_cores: Vec<usize>,
}

impl CpuTopology {
    #[must_use]
    pub fn detect() -> Self {
        let logical_cores = num_cpus::get();
        let physical_cores = num_cpus::get_physical();

        let available_cores = core_affinity::get_core_ids()
            .map(|ids| ids.into_iter().map(|id| id.id).collect())
            .unwrap_or_else(|| (0..logical_cores).collect());

        Self {
            logical_cores,
            physical_cores,
            has_smt: logical_cores > physical_cores,
            available_cores,
        }
    }

    /// Chooses cores for the two threads.
    #[must_use]
    pub fn select_placement(&self) -> ThreadPlacement {
        let strategy = if self.physical_cores >= 2 && self.available_cores.len() >= 2 {
            PlacementStrategy::Dedicated
        } else if self.has_smt && self.available_cores.len() >= 2 {
            PlacementStrategy::SmtSiblings
        } else {
            PlacementStrategy::NoPin
        };

        let (listener_core, dispatch_core) = match strategy {
            PlacementStrategy::Dedicated | PlacementStrategy::SmtSiblings => (
                self.available_cores.first().copied(),
                self.available_cores.get(1).copied(),
            ),
            PlacementStrategy::NoPin | PlacementStrategy::Manual => (None, None),
        };

        ThreadPlacement {
            listener_core,
            dispatch_core,
            strategy,
        }
    }
}

/// Where the listener and dispatch threads should run.
#[derive(Debug, Clone)]
pub struct ThreadPlacement {
    /// `None` leaves the listener thread unpinned.
    pub listener_core: Option<usize>,
    /// `None` leaves the dispatch thread unpinned.
    pub dispatch_core: Option<usize>,
    pub strategy: PlacementStrategy,
}

impl ThreadPlacement {
    #[must_use]
    pub fn unpinned() -> Self {
        Self {
            listener_core: None,
            dispatch_core: None,
            strategy: PlacementStrategy::NoPin,
        }
    }

    #[must_use]
    pub fn manual(listener_core: Option<usize>, dispatch_core: Option<usize>) -> Self {
        Self {
            listener_core,
            dispatch_core,
            strategy: PlacementStrategy::Manual,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementStrategy {
    /// Two physical cores, one per thread.
    Dedicated,
    /// One physical core: the threads share it through SMT.
    SmtSiblings,
    /// Leave placement to the OS.
    NoPin,
    /// Cores chosen by the caller.
    Manual,
}

impl std::fmt::Display for PlacementStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dedicated => write!(f, "dedicated"),
            Self::SmtSiblings => write!(f, "smt-siblings"),
            Self::NoPin => write!(f, "no-pin"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// How thread placement is decided.
#[derive(Debug, Clone, Default)]
pub enum CpuConfig {
    /// Detect the topology and pick a placement.
    #[default]
    Auto,
    Manual {
        listener_core: Option<usize>,
        dispatch_core: Option<usize>,
    },
    /// Never pin.
    Disabled,
}

impl CpuConfig {
    #[must_use]
    pub fn resolve(&self) -> ThreadPlacement {
        match self {
            Self::Auto => CpuTopology::detect().select_placement(),
            Self::Manual {
                listener_core,
                dispatch_core,
            } => ThreadPlacement::manual(*listener_core, *dispatch_core),
            Self::Disabled => ThreadPlacement::unpinned(),
        }
    }
}

/// Pins the calling thread to `core_id`; `false` if the OS refused.
pub fn pin_to_core(core_id: usize) -> bool {
    core_affinity::set_for_current(CoreId { id: core_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology(physical: usize, logical: usize) -> CpuTopology {
        CpuTopology {
            logical_cores: logical,
            physical_cores: physical,
            has_smt: logical > physical,
            available_cores: (0..logical).collect(),
        }
    }

    #[test]
    fn detected_counts_are_consistent() {
        let topo = CpuTopology::detect();

        assert!(topo.logical_cores > 0);
        assert!(topo.physical_cores > 0);
        assert!(topo.logical_cores >= topo.physical_cores);
        assert!(!topo.available_cores.is_empty());
    }

    #[test]
    fn two_physical_cores_get_dedicated_placement() {
        let placement = topology(4, 8).select_placement();

        assert_eq!(placement.strategy, PlacementStrategy::Dedicated);
        assert_eq!(placement.listener_core, Some(0));
        assert_eq!(placement.dispatch_core, Some(1));
    }

    #[test]
    fn single_smt_core_uses_siblings() {
        let placement = topology(1, 2).select_placement();

        assert_eq!(placement.strategy, PlacementStrategy::SmtSiblings);
        assert_ne!(placement.listener_core, placement.dispatch_core);
    }

    #[test]
    fn single_core_without_smt_is_unpinned() {
        let placement = topology(1, 1).select_placement();

        assert_eq!(placement.strategy, PlacementStrategy::NoPin);
        assert!(placement.listener_core.is_none());
        assert!(placement.dispatch_core.is_none());
    }

    #[test]
    fn auto_placement_stays_within_available_cores() {
        let topo = CpuTopology::detect();
        let placement = CpuConfig::Auto.resolve();

        assert_ne!(placement.strategy, PlacementStrategy::Manual);
        for core in [placement.listener_core, placement.dispatch_core]
            .into_iter()
            .flatten()
        {
            assert!(topo.available_cores.contains(&core));
        }
    }

    #[test]
    fn manual_and_disabled_configs_resolve_as_given() {
        let manual = CpuConfig::Manual {
            listener_core: Some(3),
            dispatch_core: None,
        }
        .resolve();
        assert_eq!(manual.listener_core, Some(3));
        assert_eq!(manual.dispatch_core, None);
        assert_eq!(manual.strategy, PlacementStrategy::Manual);

        let disabled = CpuConfig::Disabled.resolve();
        assert_eq!(disabled.strategy, PlacementStrategy::NoPin);
        assert!(disabled.listener_core.is_none());
    }
}
