//! Load-balancing selection over a candidate set of machines.

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::models::Machine;

#[derive(Debug, Error)]
#[error("unknown selection strategy: {0}")]
pub struct UnknownStrategyError(String);

/// Strategy used to pick one machine out of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    RoundRobin,
    #[default]
    LeastLoad,
}

impl FromStr for SelectionStrategy {
    type Err = UnknownStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(SelectionStrategy::RoundRobin),
            "least-load" => Ok(SelectionStrategy::LeastLoad),
            other => Err(UnknownStrategyError(other.to_string())),
        }
    }
}

/// Picks a machine from a candidate set.
///
/// Selection is advisory: the dispatcher must still admit the chosen
/// machine, which can fail under contention. The round-robin cursor is
/// process-local and not persisted across restarts.
pub struct MachineSelector {
    cursor: AtomicUsize,
}

impl MachineSelector {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }

    /// Pick an eligible machine, or None when no candidate is eligible.
    pub fn select<'a>(
        &self,
        candidates: &'a [Machine],
        strategy: SelectionStrategy,
    ) -> Option<&'a Machine> {
        let eligible: Vec<&Machine> = candidates.iter().filter(|m| m.is_eligible()).collect();
        if eligible.is_empty() {
            return None;
        }

        match strategy {
            SelectionStrategy::RoundRobin => {
                let index = self.cursor.fetch_add(1, Ordering::Relaxed) % eligible.len();
                Some(eligible[index])
            }
            SelectionStrategy::LeastLoad => {
                // First-encounter order breaks ties.
                let mut best = eligible[0];
                for machine in &eligible[1..] {
                    if machine.current_queue < best.current_queue {
                        best = machine;
                    }
                }
                Some(best)
            }
        }
    }
}

impl Default for MachineSelector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::machines::models::{MachineKind, MachineStatus};

    fn machine(name: &str, current_queue: i32, capacity: i32) -> Machine {
        Machine::builder()
            .name(name)
            .kind(MachineKind::Classic)
            .endpoint(format!("http://{}:8188", name))
            .current_queue(current_queue)
            .capacity(capacity)
            .build()
    }

    #[test]
    fn least_load_picks_smallest_queue() {
        let candidates = vec![machine("a", 2, 5), machine("b", 0, 5)];
        let selector = MachineSelector::new();
        let chosen = selector
            .select(&candidates, SelectionStrategy::LeastLoad)
            .unwrap();
        assert_eq!(chosen.name, "b");
    }

    #[test]
    fn least_load_breaks_ties_by_first_encounter() {
        let candidates = vec![machine("a", 1, 5), machine("b", 1, 5)];
        let selector = MachineSelector::new();
        let chosen = selector
            .select(&candidates, SelectionStrategy::LeastLoad)
            .unwrap();
        assert_eq!(chosen.name, "a");
    }

    #[test]
    fn round_robin_cycles_through_candidates() {
        let candidates = vec![machine("a", 0, 5), machine("b", 0, 5), machine("c", 0, 5)];
        let selector = MachineSelector::new();

        let names: Vec<&str> = (0..4)
            .map(|_| {
                selector
                    .select(&candidates, SelectionStrategy::RoundRobin)
                    .unwrap()
                    .name
                    .as_str()
            })
            .collect();

        assert_eq!(names, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn ineligible_candidates_are_filtered_out() {
        let mut full = machine("a", 5, 5);
        full.status = MachineStatus::Ready;
        let mut disabled = machine("b", 0, 5);
        disabled.disabled = true;

        let selector = MachineSelector::new();
        assert!(selector
            .select(&[full, disabled], SelectionStrategy::LeastLoad)
            .is_none());
    }

    #[test]
    fn strategy_parses_from_config_values() {
        assert_eq!(
            "round-robin".parse::<SelectionStrategy>().unwrap(),
            SelectionStrategy::RoundRobin
        );
        assert_eq!(
            "least-load".parse::<SelectionStrategy>().unwrap(),
            SelectionStrategy::LeastLoad
        );
        assert!("random".parse::<SelectionStrategy>().is_err());
    }
}
