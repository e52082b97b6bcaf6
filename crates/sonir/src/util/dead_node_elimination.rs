/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 2024 Tendsin Mende
 */

//! Dead node elimination and removal of dead control-flow.
//!
//! See
//!
//! - [dead_node_elimination](crate::Graph::dead_node_elimination)
//! - [kill_cfg](crate::Graph::kill_cfg)

use ahash::AHashSet;

use crate::{err::GraphError, nodes::Node, nodes::NodeKind, Graph, NodeRef, SmallColl};

impl Graph {
    ///Removes every node that is not reachable from `Start`, either via control edges (fixed nodes) or as an input
    /// of a reachable node (floating nodes). Returns all deleted nodes.
    pub fn dead_node_elimination(&mut self) -> Result<Vec<Node>, GraphError> {
        let live_fixed: AHashSet<NodeRef> = self.fixed_post_order(self.start).into_iter().collect();

        //Ends that are not reachable, but point into a reachable merge
        let mut dead_ends = Vec::new();
        for merge in live_fixed.iter() {
            if !self.nodes[*merge].kind.is_merge() {
                continue;
            }
            for pred in self.nodes[*merge].predecessors.iter() {
                if !live_fixed.contains(pred) {
                    dead_ends.push((*merge, *pred));
                }
            }
        }
        for (merge, end) in dead_ends {
            self.remove_end(merge, end)?;
        }

        let mut live = live_fixed.clone();
        let mut worklist: Vec<NodeRef> = live_fixed
            .iter()
            .flat_map(|n| self.nodes[*n].all_inputs())
            .collect();
        while let Some(n) = worklist.pop() {
            if !self.nodes.contains_key(n) || !live.insert(n) {
                continue;
            }
            worklist.extend(self.nodes[n].all_inputs());
        }

        let dead: Vec<NodeRef> = self.nodes.keys().filter(|n| !live.contains(n)).collect();
        let mut deleted = Vec::with_capacity(dead.len());
        for d in dead {
            if let Some(node) = self.remove_unchecked(d) {
                deleted.push(node);
            }
        }
        //Live nodes might have listed dead nodes as successor or predecessor
        for n in live_fixed.iter() {
            let node = &mut self.nodes[*n];
            node.successors.retain(|s| live.contains(s));
            node.predecessors.retain(|p| live.contains(p));
        }

        #[cfg(feature = "log")]
        if !deleted.is_empty() {
            log::trace!("DNE removed {} nodes", deleted.len());
        }

        Ok(deleted)
    }

    ///Disconnects the forward or loop `end` from `merge`. The matching input of every phi at `merge` is removed.
    pub fn remove_end(&mut self, merge: NodeRef, end: NodeRef) -> Result<(), GraphError> {
        let index = self
            .try_node(merge)?
            .predecessors
            .iter()
            .position(|p| *p == end)
            .ok_or(GraphError::NotConnected(end))?;
        let mut dropped = SmallColl::new();
        for phi in self.phis_of(merge) {
            if let Some(input) = self.remove_phi_input(phi, index)? {
                dropped.push(input);
            }
        }
        self.nodes[merge].predecessors.remove(index);
        if let Some(e) = self.nodes.get_mut(end) {
            e.successors.retain(|s| *s != merge);
        }
        self.kill_unused_floating(&dropped)
    }

    ///Kills the control-flow that starts at `begin`, which must not have a live predecessor anymore.
    ///
    /// Every fixed node dominated by `begin` is removed, as well as all floating nodes that use any of them. Merges that
    /// stay alive lose their dead ends (and the matching phi inputs). A loop whose forward end dies is dead as a whole.
    ///
    /// Returns the live merges that lost at least one end.
    pub fn kill_cfg(&mut self, begin: NodeRef) -> Result<SmallColl<NodeRef>, GraphError> {
        if !self.try_node(begin)?.predecessors.is_empty() && !self.nodes[begin].kind.is_merge() {
            return Err(GraphError::StillConnected(begin));
        }

        //Mark phase, merges are only dead once all of their ends are.
        let mut dead: AHashSet<NodeRef> = AHashSet::default();
        let mut pending_merges: Vec<NodeRef> = Vec::new();
        let mut worklist = vec![begin];
        loop {
            while let Some(n) = worklist.pop() {
                if !dead.insert(n) {
                    continue;
                }
                let is_forward_end = self.nodes[n].kind == NodeKind::End;
                for s in self.nodes[n].successors.iter() {
                    match self.nodes[*s].kind {
                        NodeKind::Merge => pending_merges.push(*s),
                        NodeKind::LoopBegin if is_forward_end => worklist.push(*s),
                        NodeKind::LoopBegin => pending_merges.push(*s),
                        _ => worklist.push(*s),
                    }
                }
            }

            let mut changed = false;
            for m in pending_merges.iter() {
                if dead.contains(m) || self.nodes[*m].kind != NodeKind::Merge {
                    continue;
                }
                if self.nodes[*m]
                    .predecessors
                    .iter()
                    .all(|p| dead.contains(p))
                {
                    worklist.push(*m);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        //Detach dead ends from live merges.
        let mut touched = SmallColl::new();
        for m in pending_merges {
            if dead.contains(&m) || touched.contains(&m) {
                continue;
            }
            let dead_ends: SmallColl<NodeRef> = self.nodes[m]
                .predecessors
                .iter()
                .filter(|p| dead.contains(p))
                .copied()
                .collect();
            for end in dead_ends {
                self.remove_end(m, end)?;
            }
            touched.push(m);
        }

        //Everything floating that uses a dead node dies as well.
        let mut kill_set = dead.clone();
        let mut worklist: Vec<NodeRef> = dead.iter().copied().collect();
        while let Some(n) = worklist.pop() {
            for user in self.nodes[n].usages.iter() {
                if kill_set.contains(user) {
                    continue;
                }
                if self.nodes[*user].kind.is_floating() {
                    kill_set.insert(*user);
                    worklist.push(*user);
                } else {
                    return Err(GraphError::LiveUsageOfDeadNode {
                        user: *user,
                        dead: n,
                    });
                }
            }
        }

        //Sweep
        let mut live_inputs: SmallColl<NodeRef> = SmallColl::new();
        for n in kill_set.iter() {
            for input in self.nodes[*n].all_inputs() {
                if !kill_set.contains(&input) && !live_inputs.contains(&input) {
                    live_inputs.push(input);
                }
            }
        }
        for n in kill_set.iter() {
            self.remove_unchecked(*n);
        }
        self.kill_unused_floating(&live_inputs)?;

        #[cfg(feature = "log")]
        log::trace!(
            "killed {} nodes of dead branch {begin:?}, {} merges lost ends",
            kill_set.len(),
            touched.len()
        );

        Ok(touched)
    }
}

#[cfg(test)]
mod test {
    use crate::{
        nodes::{NodeKind, PhiKind},
        Graph,
    };

    #[test]
    fn unreachable_floating_is_removed() {
        let mut graph = Graph::new();
        let a = graph.int(1);
        let ret = graph.add(NodeKind::Return, &[a]);
        graph.set_next(graph.start(), ret).unwrap();
        let unused = graph.int(3);
        let deleted = graph.dead_node_elimination().unwrap();
        assert!(deleted.len() == 1);
        assert!(!graph.contains(unused));
        assert!(graph.contains(a));
    }

    #[test]
    fn kill_branch_prunes_phi() {
        let mut graph = Graph::new();
        let cond = graph.parameter(0, crate::nodes::ValueKind::Bool);
        let split = graph.add(NodeKind::If, &[cond]);
        graph.set_next(graph.start(), split).unwrap();
        let tb = graph.add(NodeKind::Begin, &[]);
        let fb = graph.add(NodeKind::Begin, &[]);
        graph.set_successors(split, &[tb, fb]).unwrap();
        let te = graph.add(NodeKind::End, &[]);
        let fe = graph.add(NodeKind::End, &[]);
        graph.set_next(tb, te).unwrap();
        graph.set_next(fb, fe).unwrap();
        let merge = graph.add(NodeKind::Merge, &[]);
        graph.add_end(merge, te).unwrap();
        graph.add_end(merge, fe).unwrap();
        let one = graph.int(1);
        let two = graph.int(2);
        let phi = graph.add_phi(merge, PhiKind::Value, &[one, two]).unwrap();
        let ret = graph.add(NodeKind::Return, &[phi]);
        graph.set_next(merge, ret).unwrap();

        graph.remove_split(split, tb).unwrap();
        let touched = graph.kill_cfg(fb).unwrap();
        assert!(touched.as_slice() == [merge]);
        assert!(graph.inputs(phi) == [one]);
        assert!(!graph.contains(two));
        assert!(graph.predecessors(merge) == [te]);
    }
}
