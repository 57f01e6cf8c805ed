// Phased, weighted random selection.
//
// Candidates are added as `(phase, id, quantity)`. A pick looks at phases in
// ascending order and draws from the first one holding any positive
// quantity, weighting each candidate by its quantity (think of marbles of
// different colors in numbered bags: empty the lowest-numbered bag first).
// Every "prefer A, else B, else anything" policy in the craft stages is a bag
// with A in phase 1, B in phase 2 and the catch-all last.
//
// A phase whose candidates all have quantity 0 still yields a result: its
// first-inserted id. Only a bag with no candidates at all is an error.
//
// **Critical constraint: determinism.** Candidates keep insertion order within
// a phase and phases are a `BTreeMap`, so the same adds and the same
// `FabRng` state always give the same pick.

use crate::error::{FabricationError, Result};
use fabrica_prng::FabRng;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone)]
pub struct SelectionBag<T> {
    phases: BTreeMap<u32, Vec<(T, u64)>>,
}

impl<T> Default for SelectionBag<T> {
    fn default() -> Self {
        SelectionBag {
            phases: BTreeMap::new(),
        }
    }
}

impl<T: Copy + PartialEq> SelectionBag<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `quantity` marbles of `id` to `phase`. Repeat adds accumulate.
    pub fn add(&mut self, phase: u32, id: T, quantity: u64) {
        let entries = self.phases.entry(phase).or_default();
        match entries.iter_mut().find(|(existing, _)| *existing == id) {
            Some((_, q)) => *q += quantity,
            None => entries.push((id, quantity)),
        }
    }

    pub fn add_all(&mut self, phase: u32, ids: impl IntoIterator<Item = T>, quantity: u64) {
        for id in ids {
            self.add(phase, id, quantity);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.phases.values().all(|entries| entries.is_empty())
    }

    /// Number of distinct candidates across all phases.
    pub fn size(&self) -> usize {
        self.phases.values().map(Vec::len).sum()
    }

    pub fn pick(&self, rng: &mut FabRng) -> Result<T> {
        for entries in self.phases.values() {
            let total: u64 = entries.iter().map(|(_, q)| q).sum();
            if total == 0 {
                continue;
            }
            let mut marble = rng.range_u64(0, total);
            for (id, quantity) in entries {
                if marble < *quantity {
                    return Ok(*id);
                }
                marble -= quantity;
            }
        }
        self.phases
            .values()
            .find_map(|entries| entries.first())
            .map(|(id, _)| *id)
            .ok_or(FabricationError::EmptyBag)
    }
}

impl<T: fmt::Debug> fmt::Debug for SelectionBag<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for (phase, entries) in &self.phases {
            for (id, quantity) in entries {
                list.entry(&format_args!("{phase}:{id:?}x{quantity}"));
            }
        }
        list.finish()
    }
}
