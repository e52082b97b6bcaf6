/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 2024 Tendsin Mende
 */

//! Replaces a non-escaping allocation by a [VirtualObject](NodeKind::VirtualObject).
//!
//! The field values are tracked while walking the control-flow graph in program order. Loads are replaced by the
//! current value, stores only update it. Merges and loop headers get value phis for every field that differs.
//! Frame states that capture the object also capture its current field values through a
//! [VirtualObjectState](NodeKind::VirtualObjectState).

use sonir::{
    cfg::{walk_blocks, ControlFlowGraph, LoopRef, MergeableState},
    nodes::{NodeKind, PhiKind, VirtualShape},
    Graph, NodeRef,
};

use crate::{
    stats::{Counter, Statistics},
    OptError,
};

use super::{constant_index, PASS};

///Current value of each field of the virtual object. `None` where the allocation was not executed yet.
#[derive(Debug, Clone, Default)]
struct FieldState {
    values: Option<Vec<NodeRef>>,
}

impl MergeableState for FieldState {
    type Error = OptError;

    fn merge(graph: &mut Graph, merge: NodeRef, states: Vec<Self>) -> Result<Self, OptError> {
        let mut incoming = Vec::with_capacity(states.len());
        for state in states {
            match state.values {
                Some(values) => incoming.push(values),
                //Not all paths allocated the object, so nothing after the merge can use it.
                None => return Ok(FieldState::default()),
            }
        }
        let Some(first) = incoming.first() else {
            return Ok(FieldState::default());
        };

        let mut merged = Vec::with_capacity(first.len());
        for idx in 0..first.len() {
            let inputs: Vec<NodeRef> = incoming.iter().map(|values| values[idx]).collect();
            if inputs.iter().all(|i| *i == inputs[0]) {
                merged.push(inputs[0]);
            } else {
                merged.push(graph.add_phi(merge, PhiKind::Value, &inputs)?);
            }
        }
        Ok(FieldState {
            values: Some(merged),
        })
    }

    fn loop_begin(
        &mut self,
        graph: &mut Graph,
        _cfg: &ControlFlowGraph,
        loop_begin: NodeRef,
        _lp: LoopRef,
    ) -> Result<(), OptError> {
        if let Some(values) = self.values.as_mut() {
            for value in values.iter_mut() {
                *value = graph.add_phi(loop_begin, PhiKind::Value, &[*value])?;
            }
        }
        Ok(())
    }

    fn loop_ends(
        graph: &mut Graph,
        loop_begin: NodeRef,
        header_state: &Self,
        end_states: Vec<Self>,
    ) -> Result<(), OptError> {
        let Some(phis) = &header_state.values else {
            return Ok(());
        };
        if end_states.is_empty() {
            for phi in phis {
                graph.close_phi(*phi)?;
            }
            return Ok(());
        }
        for end in end_states {
            let values = end.values.ok_or(OptError::invariant(
                PASS,
                loop_begin,
                "virtual object is unknown at a loop end",
            ))?;
            for (phi, value) in phis.iter().zip(values) {
                graph.add_phi_input(*phi, value)?;
            }
        }
        Ok(())
    }
}

///Replaces `alloc` with a virtual object of `shape`. Returns the virtual object.
pub(super) fn eliminate(
    graph: &mut Graph,
    stats: &mut Statistics,
    alloc: NodeRef,
    shape: VirtualShape,
) -> Result<NodeRef, OptError> {
    let cfg = ControlFlowGraph::compute(graph)?;
    let vobj = graph.add_floating(NodeKind::VirtualObject(shape.clone()), &[])?;
    graph.replace_at_usages(alloc, vobj)?;

    //Type checks are decided right away.
    for user in graph.unique_usages(vobj) {
        let folded = match graph.kind(user) {
            NodeKind::IsNull => graph.bool(false),
            NodeKind::InstanceOf(class) => {
                let is = shape.class() == Some(*class);
                graph.bool(is)
            }
            _ => continue,
        };
        graph.replace_at_usages(user, folded)?;
        graph.kill(user)?;
        stats.increment(Counter::OtherRemoved);
    }

    //Values that were only kept alive by removed stores.
    let mut dropped = Vec::new();
    walk_blocks(
        graph,
        &cfg,
        FieldState::default(),
        |graph, node, state: &mut FieldState| {
            if node == alloc {
                let defaults: Vec<NodeRef> = (0..shape.entry_count())
                    .map(|i| graph.constant(shape.entry_kind(i).default_constant()))
                    .collect();
                dropped.extend_from_slice(&defaults);
                state.values = Some(defaults);
                graph.splice_out(alloc)?;
                graph.remove(alloc)?;
                return Ok(());
            }
            let Some(values) = state.values.as_mut() else {
                return Ok(());
            };
            let kind = graph.kind(node).clone();
            let inputs = graph.inputs(node).to_vec();
            if let NodeKind::FrameState { .. } = kind {
                if inputs.contains(&vobj) {
                    let mut captured = Vec::with_capacity(values.len() + 1);
                    captured.push(vobj);
                    captured.extend_from_slice(values);
                    let object_state = graph.add_floating(NodeKind::VirtualObjectState, &captured)?;
                    graph.add_input(node, object_state)?;
                }
                return Ok(());
            }
            if inputs.first() != Some(&vobj) {
                return Ok(());
            }

            let entry = |index: Option<usize>| {
                index.ok_or(OptError::invariant(
                    PASS,
                    node,
                    "access to an untracked entry of a virtual object",
                ))
            };
            match kind {
                NodeKind::StoreField(f) => {
                    let idx = entry(shape_field(&shape, f.id))?;
                    dropped.push(values[idx]);
                    values[idx] = inputs[1];
                    stats.increment(Counter::StoreRemoved);
                }
                NodeKind::StoreIndexed(_) => {
                    let idx = entry(constant_index(graph, &shape, inputs[1]))?;
                    dropped.push(values[idx]);
                    values[idx] = inputs[2];
                    stats.increment(Counter::StoreRemoved);
                }
                NodeKind::LoadField(f) => {
                    let idx = entry(shape_field(&shape, f.id))?;
                    graph.replace_at_usages(node, values[idx])?;
                    stats.increment(Counter::LoadRemoved);
                }
                NodeKind::LoadIndexed(_) => {
                    let idx = entry(constant_index(graph, &shape, inputs[1]))?;
                    graph.replace_at_usages(node, values[idx])?;
                    stats.increment(Counter::LoadRemoved);
                }
                NodeKind::ArrayLength => {
                    let length = graph.int(shape.entry_count() as i64);
                    graph.replace_at_usages(node, length)?;
                    stats.increment(Counter::OtherRemoved);
                }
                NodeKind::NullCheck => stats.increment(Counter::OtherRemoved),
                NodeKind::MonitorEnter | NodeKind::MonitorExit => {
                    stats.increment(Counter::LockRemoved)
                }
                other => {
                    return Err(OptError::invariant(
                        PASS,
                        node,
                        format!("{} can not consume a virtual object", other.name()),
                    ))
                }
            }

            //Inputs of the removed node are alive through `values`, or collected by `dropped`.
            graph.splice_out(node)?;
            graph.remove(node)?;
            dropped.extend(inputs);
            Ok(())
        },
    )?;

    dropped.push(vobj);
    graph.kill_unused_floating(&dropped)?;
    //Loop phis of fields that are never read again only use each other.
    let removed = graph.dead_node_elimination()?;
    stats.add(Counter::DeadNodesRemoved, removed.len() as u64);

    stats.increment(Counter::AllocationRemoved);
    stats.add(Counter::AllocationFieldsRemoved, shape.entry_count() as u64);
    Ok(vobj)
}

fn shape_field(shape: &VirtualShape, id: sonir::nodes::FieldId) -> Option<usize> {
    match shape {
        VirtualShape::Instance(s) => s.field_index(id),
        VirtualShape::Array { .. } => None,
    }
}
