/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 2024 Tendsin Mende
 */

//! Replaces floating reads by the value that was written last.
//!
//! A read is resolved by following its dependency. A store to the same object (and index) yields the stored value.
//! A memory phi is resolved if all of its inputs resolve, in which case an equivalent value phi is built at the same
//! merge. Reads whose dependency can not be resolved stay as they are.

use ahash::{AHashMap, AHashSet};
use sonir::{
    nodes::{NodeKind, PhiKind, ReadAccess, Stamp},
    Graph, NodeRef,
};

use crate::{stats::Counter, OptError, Optimizer};

const PASS: &str = "read-elimination";

///What a read loads, independent of where it is in memory order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Target {
    access: ReadAccess,
    object: NodeRef,
    index: Option<NodeRef>,
}

impl Target {
    fn of_read(graph: &Graph, read: NodeRef) -> Option<(Target, NodeRef)> {
        let NodeKind::FloatingRead(access) = graph.kind(read) else {
            return None;
        };
        let inputs = graph.inputs(read);
        let (index, dependency) = match access {
            ReadAccess::Field(_) => (None, *inputs.get(1)?),
            ReadAccess::Indexed(_) => (Some(*inputs.get(1)?), *inputs.get(2)?),
        };
        Some((
            Target {
                access: *access,
                object: inputs[0],
                index,
            },
            dependency,
        ))
    }

    ///The stored value, if `node` is a store to exactly this target.
    fn stored_value(&self, graph: &Graph, node: NodeRef) -> Option<NodeRef> {
        let inputs = graph.inputs(node);
        match (graph.kind(node), &self.access) {
            (NodeKind::StoreField(stored), ReadAccess::Field(read)) => {
                if stored.location() == read.location() && inputs[0] == self.object {
                    Some(inputs[1])
                } else {
                    None
                }
            }
            (NodeKind::StoreIndexed(stored), ReadAccess::Indexed(read)) => {
                let same_index = Some(inputs[1]) == self.index;
                if stored == read && inputs[0] == self.object && same_index {
                    Some(inputs[2])
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    ///Collects all memory phis between `dependency` and the stores that feed it. Returns `None` if any path
    /// leads to something other than a store to this target.
    ///
    /// A phi that is reached again counts as consistent. At least one store is needed though, a cycle of phis alone
    /// says nothing about the value.
    fn memory_phis(&self, graph: &Graph, dependency: NodeRef) -> Option<Vec<NodeRef>> {
        let mut phis = Vec::new();
        let mut seen = AHashSet::default();
        let mut stack = vec![dependency];
        let mut found_store = false;
        while let Some(node) = stack.pop() {
            if self.stored_value(graph, node).is_some() {
                found_store = true;
                continue;
            }
            if !graph.kind(node).is_memory_phi() {
                return None;
            }
            if seen.insert(node) {
                phis.push(node);
                stack.extend_from_slice(graph.inputs(node));
            }
        }
        if found_store {
            Some(phis)
        } else {
            None
        }
    }
}

struct ReadEliminator<'a> {
    graph: &'a mut Graph,
    ///Value phi built for a memory phi and a target.
    value_phis: AHashMap<(Target, NodeRef), NodeRef>,
    created: Vec<NodeRef>,
}

impl ReadEliminator<'_> {
    fn value_of(&self, target: &Target, node: NodeRef) -> Result<NodeRef, OptError> {
        if let Some(value) = target.stored_value(&*self.graph, node) {
            return Ok(value);
        }
        self.value_phis
            .get(&(*target, node))
            .copied()
            .ok_or(OptError::invariant(PASS, node, "memory phi was not resolved"))
    }

    ///Returns the value `read` loads, if it is known.
    fn resolve(&mut self, read: NodeRef) -> Result<Option<NodeRef>, OptError> {
        let Some((target, dependency)) = Target::of_read(self.graph, read) else {
            return Ok(None);
        };
        if let Some(value) = target.stored_value(self.graph, dependency) {
            return Ok(Some(value));
        }
        let Some(phis) = target.memory_phis(self.graph, dependency) else {
            return Ok(None);
        };

        //Create all phis first, so cycles can refer to each other.
        let mut fresh = Vec::new();
        for phi in phis.iter() {
            if self.value_phis.contains_key(&(target, *phi)) {
                continue;
            }
            let merge = self.graph.phi_merge(*phi)?;
            let value_phi = self.graph.add_phi(merge, PhiKind::Value, &[])?;
            self.value_phis.insert((target, *phi), value_phi);
            self.created.push(value_phi);
            fresh.push(*phi);
        }
        for phi in fresh {
            let value_phi = self.value_of(&target, phi)?;
            for input in self.graph.inputs(phi).to_vec() {
                let value = self.value_of(&target, input)?;
                self.graph.add_phi_input(value_phi, value)?;
            }
        }

        self.value_of(&target, dependency).map(Some)
    }

    ///Recomputes the stamps of all created phis until nothing changes anymore. Inputs that are not filled yet are ignored.
    fn infer_stamps(&mut self) -> Result<(), OptError> {
        let created: AHashSet<NodeRef> = self.created.iter().copied().collect();
        for phi in self.created.iter() {
            self.graph.set_stamp(*phi, Stamp::Void)?;
        }

        let mut worklist = self.created.clone();
        while let Some(phi) = worklist.pop() {
            if !self.graph.contains(phi) {
                continue;
            }
            let stamp = self
                .graph
                .inputs(phi)
                .iter()
                .filter(|i| **i != phi)
                .map(|i| self.graph.stamp(*i))
                .filter(|s| s.is_value())
                .reduce(|a, b| a.meet(&b))
                .unwrap_or(Stamp::Void);
            if stamp != self.graph.stamp(phi) {
                self.graph.set_stamp(phi, stamp)?;
                for user in self.graph.unique_usages(phi) {
                    if created.contains(&user) {
                        worklist.push(user);
                    }
                }
            }
        }
        Ok(())
    }
}

impl Optimizer {
    ///Replaces floating reads by their value, where it is known. Returns the number of removed reads.
    pub fn eliminate_reads(&mut self) -> Result<usize, OptError> {
        let reads: Vec<NodeRef> = self
            .graph
            .nodes()
            .filter(|n| matches!(self.graph.kind(*n), NodeKind::FloatingRead(_)))
            .collect();

        let mut eliminator = ReadEliminator {
            graph: &mut self.graph,
            value_phis: AHashMap::default(),
            created: Vec::new(),
        };
        let mut replacements = Vec::new();
        for read in reads {
            if let Some(value) = eliminator.resolve(read)? {
                replacements.push((read, value));
            }
        }
        eliminator.infer_stamps()?;
        let created = eliminator.created.len();

        //A stored value might itself be a read that is replaced before.
        let mut forwarded: AHashMap<NodeRef, NodeRef> = AHashMap::default();
        for (read, value) in replacements.iter() {
            let mut value = *value;
            while let Some(next) = forwarded.get(&value) {
                value = *next;
            }
            self.graph.replace_at_usages(*read, value)?;
            self.graph.kill(*read)?;
            forwarded.insert(*read, value);
            #[cfg(feature = "log")]
            log::trace!("{read:?} -> {value:?}");
        }

        self.stats.add(Counter::ReadsEliminated, replacements.len() as u64);
        self.stats.add(Counter::ValuePhisCreated, created as u64);
        #[cfg(feature = "log")]
        log::info!(
            "read elimination: {} reads removed, {} value phis",
            replacements.len(),
            created
        );

        self.verify_after(PASS)?;
        Ok(replacements.len())
    }
}
