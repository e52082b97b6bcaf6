/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 2024 Tendsin Mende
 */

//! Named counters of a single optimizer run.

use std::collections::BTreeMap;

///Everything the passes count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Counter {
    CanonicalizedNodes,
    ///Nodes that were skipped, because they were revisited too often.
    CanonicalizerRevisitLimit,
    SimplifiedNodes,
    DeadNodesRemoved,
    AllocationRemoved,
    AllocationFieldsRemoved,
    StoreRemoved,
    LoadRemoved,
    LockRemoved,
    OtherRemoved,
    EscapeInlineAttempts,
    FloatingReadsCreated,
    MemoryPhisCreated,
    ReadsEliminated,
    ValuePhisCreated,
}

///Statistics sink owned by the [Optimizer](crate::Optimizer). Passes get it by reference, there is no global state.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Statistics {
    counters: BTreeMap<Counter, u64>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&mut self, counter: Counter, value: u64) {
        if value > 0 {
            *self.counters.entry(counter).or_insert(0) += value;
        }
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters.get(&counter).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Counter, u64)> + '_ {
        self.counters.iter().map(|(c, v)| (*c, *v))
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    ///Reports all counters and resets them. Returns the state before the reset.
    pub fn flush(&mut self) -> Statistics {
        #[cfg(feature = "log")]
        for (counter, value) in self.counters.iter() {
            log::info!("{counter:?}: {value}");
        }
        std::mem::take(self)
    }
}
