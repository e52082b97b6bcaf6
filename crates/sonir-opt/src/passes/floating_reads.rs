/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 2024 Tendsin Mende
 */

//! Turns fixed loads into [FloatingRead](NodeKind::FloatingRead)s.
//!
//! While walking the blocks in reverse post order, we track the last node that wrote each location. A load of
//! location `L` then depends on the last write to `L`, or on the last checkpoint if `L` was not written since.
//! Where control flow joins, differing writers are combined by memory phis.

use std::collections::BTreeMap;

use sonir::{
    cfg::{walk_blocks, ControlFlowGraph, LoopRef, MergeableState},
    nodes::{LocationIdentity, MemoryAccess, NodeKind, PhiKind, ReadAccess},
    Graph, NodeRef,
};

use crate::{stats::Counter, OptError, Optimizer};

const PASS: &str = "floating-reads";

///Last writer of each location. Always contains [Any](LocationIdentity::Any).
#[derive(Debug, Clone)]
struct MemoryMap {
    last: BTreeMap<LocationIdentity, NodeRef>,
}

impl MemoryMap {
    fn new(start: NodeRef) -> Self {
        let mut last = BTreeMap::new();
        last.insert(LocationIdentity::Any, start);
        MemoryMap { last }
    }

    ///The node a read of `location` depends on.
    fn last_write(&self, location: &LocationIdentity) -> Option<NodeRef> {
        self.last
            .get(location)
            .or_else(|| self.last.get(&LocationIdentity::Any))
            .copied()
    }
}

fn missing_wildcard(node: NodeRef) -> OptError {
    OptError::invariant(PASS, node, "memory map lost its wildcard entry")
}

impl MergeableState for MemoryMap {
    type Error = OptError;

    fn merge(graph: &mut Graph, merge: NodeRef, states: Vec<Self>) -> Result<Self, OptError> {
        let Some(first) = states.first() else {
            return Err(OptError::invariant(PASS, merge, "merge without incoming memory state"));
        };
        if states.len() == 1 {
            return Ok(first.clone());
        }

        let mut locations: Vec<LocationIdentity> = Vec::new();
        for state in states.iter() {
            for location in state.last.keys() {
                if !locations.contains(location) {
                    locations.push(*location);
                }
            }
        }
        locations.sort();

        let mut merged = BTreeMap::new();
        for location in locations {
            let mut inputs = Vec::with_capacity(states.len());
            for state in states.iter() {
                inputs.push(state.last_write(&location).ok_or(missing_wildcard(merge))?);
            }
            let value = if inputs.iter().all(|i| *i == inputs[0]) {
                inputs[0]
            } else {
                graph.add_phi(merge, PhiKind::Memory(location), &inputs)?
            };
            merged.insert(location, value);
        }
        Ok(MemoryMap { last: merged })
    }

    fn loop_begin(
        &mut self,
        graph: &mut Graph,
        cfg: &ControlFlowGraph,
        loop_begin: NodeRef,
        lp: LoopRef,
    ) -> Result<(), OptError> {
        let modified = cfg.locations_modified_in_loop(graph, lp);
        let mut locations: Vec<LocationIdentity> = modified.iter().copied().collect();
        if modified.contains(&LocationIdentity::Any) {
            //Everything might change, including locations only written inside the loop.
            for location in self.last.keys() {
                if !modified.contains(location) {
                    locations.push(*location);
                }
            }
        }
        locations.sort();

        for location in locations {
            let entry = self
                .last_write(&location)
                .ok_or(missing_wildcard(loop_begin))?;
            let phi = graph.add_phi(loop_begin, PhiKind::Memory(location), &[entry])?;
            self.last.insert(location, phi);
        }
        Ok(())
    }

    fn loop_ends(
        graph: &mut Graph,
        loop_begin: NodeRef,
        header_state: &Self,
        end_states: Vec<Self>,
    ) -> Result<(), OptError> {
        let phis: Vec<(LocationIdentity, NodeRef)> = header_state
            .last
            .iter()
            .filter(|(_, node)| {
                graph.kind(**node).is_memory_phi() && graph.phi_merge(**node) == Ok(loop_begin)
            })
            .map(|(location, node)| (*location, *node))
            .collect();

        if end_states.is_empty() {
            for (_, phi) in phis {
                graph.close_phi(phi)?;
            }
            return Ok(());
        }
        for end in end_states {
            for (location, phi) in phis.iter() {
                let value = end
                    .last_write(location)
                    .ok_or(missing_wildcard(loop_begin))?;
                graph.add_phi_input(*phi, value)?;
            }
        }
        Ok(())
    }
}

fn memory_phi_count(graph: &Graph) -> usize {
    graph
        .nodes()
        .filter(|n| graph.kind(*n).is_memory_phi())
        .count()
}

impl Optimizer {
    ///Replaces every fixed field and array load by a floating read that depends on the load's last writer.
    pub fn floating_reads(&mut self) -> Result<(), OptError> {
        let cfg = ControlFlowGraph::compute(&self.graph)?;
        let phis_before = memory_phi_count(&self.graph);
        let stats = &mut self.stats;
        let start = self.graph.start();

        walk_blocks(
            &mut self.graph,
            &cfg,
            MemoryMap::new(start),
            |graph, node, map: &mut MemoryMap| {
                let location = match graph.kind(node).memory_access() {
                    MemoryAccess::Checkpoint => {
                        map.last.clear();
                        map.last.insert(LocationIdentity::Any, node);
                        return Ok(());
                    }
                    MemoryAccess::Write(location) => {
                        map.last.insert(location, node);
                        return Ok(());
                    }
                    MemoryAccess::Read(location) if !location.is_any() && graph.is_fixed(node) => {
                        location
                    }
                    _ => return Ok(()),
                };

                let access = match graph.kind(node) {
                    NodeKind::LoadField(f) => ReadAccess::Field(*f),
                    NodeKind::LoadIndexed(k) => ReadAccess::Indexed(*k),
                    other => {
                        return Err(OptError::invariant(
                            PASS,
                            node,
                            format!("{} reads memory, but is no load", other.name()),
                        ))
                    }
                };
                let dependency = map.last_write(&location).ok_or(missing_wildcard(node))?;
                let mut inputs = graph.inputs(node).to_vec();
                inputs.push(dependency);
                let read = graph.add_floating(NodeKind::FloatingRead(access), &inputs)?;

                graph.splice_out(node)?;
                graph.replace_at_usages(node, read)?;
                graph.remove(node)?;
                stats.increment(Counter::FloatingReadsCreated);
                #[cfg(feature = "log")]
                log::trace!("{node:?} -> {read:?} depending on {dependency:?}");
                Ok(())
            },
        )?;

        //Memory phis that no read depends on.
        let removed = self.graph.dead_node_elimination()?;
        self.stats
            .add(Counter::DeadNodesRemoved, removed.len() as u64);
        let created = memory_phi_count(&self.graph).saturating_sub(phis_before);
        self.stats.add(Counter::MemoryPhisCreated, created as u64);

        #[cfg(feature = "log")]
        log::info!(
            "floating reads: {} reads, {} memory phis",
            self.stats.get(Counter::FloatingReadsCreated),
            created
        );

        self.verify_after(PASS)
    }
}
