/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 2024 Tendsin Mende
 */

//! Implements well-formedness checks on the graph.

use ahash::{AHashMap, AHashSet};

use crate::{
    err::GraphError,
    nodes::{NodeKind, PhiState},
    Graph, NodeRef,
};

fn fail(node: NodeRef, reason: impl Into<String>) -> GraphError {
    GraphError::Verification {
        node,
        reason: reason.into(),
    }
}

impl Graph {
    ///Checks that
    ///
    /// - inputs and usages, as well as predecessors and successors are symmetric,
    /// - no edge points to a removed node,
    /// - every fixed node is connected, and has the number of successors its kind requires,
    /// - phis match the arity of their merge according to their state,
    /// - floating nodes do not form a cycle that is not broken by a phi.
    pub fn verify(&self) -> Result<(), GraphError> {
        for (nref, node) in self.nodes.iter() {
            //Data edges
            let mut edge_count: AHashMap<NodeRef, usize> = AHashMap::default();
            for input in node.all_inputs() {
                if !self.nodes.contains_key(input) {
                    return Err(GraphError::LiveUsageOfDeadNode {
                        user: nref,
                        dead: input,
                    });
                }
                *edge_count.entry(input).or_insert(0) += 1;
            }
            for (input, count) in edge_count {
                let listed = self.nodes[input]
                    .usages
                    .iter()
                    .filter(|u| **u == nref)
                    .count();
                if listed != count {
                    return Err(fail(
                        nref,
                        format!("uses {input:?} {count} times, but is listed {listed} times as usage"),
                    ));
                }
            }
            for user in node.usages.iter() {
                let Some(unode) = self.nodes.get(*user) else {
                    return Err(fail(nref, format!("usage {user:?} does not exist")));
                };
                if !unode.all_inputs().any(|i| i == nref) {
                    return Err(fail(nref, format!("{user:?} is listed as usage, but has no such input")));
                }
            }

            //Control edges
            for s in node.successors.iter() {
                let Some(snode) = self.nodes.get(*s) else {
                    return Err(fail(nref, format!("successor {s:?} does not exist")));
                };
                if !snode.predecessors.contains(&nref) {
                    return Err(fail(nref, format!("successor {s:?} does not list node as predecessor")));
                }
            }
            for p in node.predecessors.iter() {
                let Some(pnode) = self.nodes.get(*p) else {
                    return Err(fail(nref, format!("predecessor {p:?} does not exist")));
                };
                if !pnode.successors.contains(&nref) {
                    return Err(fail(nref, format!("predecessor {p:?} does not list node as successor")));
                }
            }

            self.verify_shape(nref)?;
        }

        self.verify_floating_acyclic()
    }

    fn verify_shape(&self, nref: NodeRef) -> Result<(), GraphError> {
        let node = &self.nodes[nref];
        if node.kind.is_floating() {
            if !node.predecessors.is_empty() || !node.successors.is_empty() {
                return Err(fail(nref, "floating node has control edges"));
            }
        } else if nref != self.start && node.predecessors.is_empty() {
            return Err(fail(nref, "fixed node is not connected"));
        }

        let expected_successors = match &node.kind {
            NodeKind::If => Some(2),
            NodeKind::Return => Some(0),
            k if k.is_fixed() => Some(1),
            _ => None,
        };
        if let Some(expected) = expected_successors {
            if node.successors.len() != expected {
                return Err(fail(
                    nref,
                    format!(
                        "{} has {} successors, expected {expected}",
                        node.kind.name(),
                        node.successors.len()
                    ),
                ));
            }
        }

        match &node.kind {
            NodeKind::Merge => {
                if node
                    .predecessors
                    .iter()
                    .any(|p| self.nodes[*p].kind != NodeKind::End)
                {
                    return Err(fail(nref, "merge predecessor is not an End"));
                }
            }
            NodeKind::LoopBegin => {
                for (idx, p) in node.predecessors.iter().enumerate() {
                    let expected = if idx == 0 {
                        NodeKind::End
                    } else {
                        NodeKind::LoopEnd
                    };
                    if self.nodes[*p].kind != expected {
                        return Err(fail(nref, format!("loop predecessor {idx} is not a {}", expected.name())));
                    }
                }
            }
            k if k.is_fixed_with_next() || k.is_block_end() => {
                if node.predecessors.len() > 1 {
                    return Err(fail(nref, "non-merge node has multiple predecessors"));
                }
            }
            NodeKind::Phi(phi) => {
                let Some(merge) = node.anchor else {
                    return Err(fail(nref, "phi without merge"));
                };
                let mnode = &self.nodes[merge];
                if !mnode.kind.is_merge() {
                    return Err(fail(nref, "phi anchored at non-merge"));
                }
                let predecessors = mnode.predecessors.len();
                let ok = match phi.state {
                    PhiState::Closed => node.inputs.len() == predecessors,
                    PhiState::Open => node.inputs.len() <= predecessors,
                    PhiState::ReceivingBackEdges => {
                        mnode.kind == NodeKind::LoopBegin && node.inputs.len() <= predecessors
                    }
                };
                if !ok {
                    return Err(GraphError::PhiArityMismatch {
                        phi: nref,
                        merge,
                        inputs: node.inputs.len(),
                        predecessors,
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    ///Depth-first search over floating inputs, where phis terminate the search.
    fn verify_floating_acyclic(&self) -> Result<(), GraphError> {
        let mut done: AHashSet<NodeRef> = AHashSet::default();
        let mut on_stack: AHashSet<NodeRef> = AHashSet::default();
        for root in self.nodes.keys() {
            if done.contains(&root) || !self.is_cycle_candidate(root) {
                continue;
            }
            let mut stack = vec![(root, 0usize)];
            on_stack.insert(root);
            while let Some((n, idx)) = stack.pop() {
                let inputs = &self.nodes[n].inputs;
                if idx < inputs.len() {
                    stack.push((n, idx + 1));
                    let i = inputs[idx];
                    if !self.is_cycle_candidate(i) || done.contains(&i) {
                        continue;
                    }
                    if !on_stack.insert(i) {
                        return Err(fail(i, "floating nodes form a cycle that is not broken by a phi"));
                    }
                    stack.push((i, 0));
                } else {
                    on_stack.remove(&n);
                    done.insert(n);
                }
            }
        }
        Ok(())
    }

    fn is_cycle_candidate(&self, node: NodeRef) -> bool {
        self.nodes
            .get(node)
            .map(|n| n.kind.is_floating() && !n.kind.is_phi())
            .unwrap_or(false)
    }
}
