/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 2024 Tendsin Mende
 */

//! Forward data-flow walk over the blocks of a [ControlFlowGraph].
//!
//! The walker visits blocks in reverse post order. Each block starts with the exit state of its predecessor. At merges
//! the exit states of all predecessors are combined via [MergeableState::merge]. At loop headers the forward state is
//! prepared via [MergeableState::loop_begin] before the body is visited. Once the exit state of every loop end is known,
//! [MergeableState::loop_ends] is called to complete whatever `loop_begin` prepared (usually back-edge phi inputs).

use ahash::AHashMap;

use crate::{err::GraphError, nodes::NodeKind, Graph, NodeRef};

use super::{BlockRef, ControlFlowGraph, LoopRef};

pub trait MergeableState: Clone {
    type Error: From<GraphError>;

    ///Combines the exit states of the predecessors of `merge`. `states` is in the order of the merge's ends.
    fn merge(graph: &mut Graph, merge: NodeRef, states: Vec<Self>) -> Result<Self, Self::Error>;

    ///Prepares the forward state at the header of `lp`, before any block of the loop is visited.
    fn loop_begin(
        &mut self,
        graph: &mut Graph,
        cfg: &ControlFlowGraph,
        loop_begin: NodeRef,
        lp: LoopRef,
    ) -> Result<(), Self::Error>;

    ///Called once with the state that [loop_begin](MergeableState::loop_begin) produced and the exit states of all loop ends,
    /// in the order of the header's loop ends. `end_states` is empty for a loop without back-edges.
    fn loop_ends(
        graph: &mut Graph,
        loop_begin: NodeRef,
        header_state: &Self,
        end_states: Vec<Self>,
    ) -> Result<(), Self::Error>;
}

///Walks all blocks of `cfg`, calling `visit` for every node that is still alive in `graph`.
pub fn walk_blocks<S, F>(
    graph: &mut Graph,
    cfg: &ControlFlowGraph,
    initial: S,
    mut visit: F,
) -> Result<(), S::Error>
where
    S: MergeableState,
    F: FnMut(&mut Graph, NodeRef, &mut S) -> Result<(), S::Error>,
{
    let mut exit_states: AHashMap<BlockRef, S> = AHashMap::default();
    let mut header_states: AHashMap<BlockRef, S> = AHashMap::default();
    let mut pending_ends: AHashMap<BlockRef, Vec<Option<S>>> = AHashMap::default();

    let predecessor_state = |exit_states: &AHashMap<BlockRef, S>, pred: BlockRef, node: NodeRef| {
        exit_states
            .get(&pred)
            .cloned()
            .ok_or(GraphError::MalformedControlFlow {
                node,
                reason: "predecessor block was not visited before its successor".to_owned(),
            })
    };

    for &block in cfg.blocks_rpo() {
        let b = cfg.block(block);
        let begin = b.begin();
        let mut state = match graph.kind(begin) {
            NodeKind::Start => initial.clone(),
            NodeKind::Merge => {
                let mut states = Vec::with_capacity(b.predecessors.len());
                for p in b.predecessors.iter() {
                    states.push(predecessor_state(&exit_states, *p, begin)?);
                }
                S::merge(graph, begin, states)?
            }
            NodeKind::LoopBegin => {
                let forward = *b.predecessors.first().ok_or(GraphError::MalformedControlFlow {
                    node: begin,
                    reason: "loop header without forward end".to_owned(),
                })?;
                let mut state = predecessor_state(&exit_states, forward, begin)?;
                let lp = cfg
                    .loop_of_header(block)
                    .ok_or(GraphError::MalformedControlFlow {
                        node: begin,
                        reason: "loop header without loop".to_owned(),
                    })?;
                state.loop_begin(graph, cfg, begin, lp)?;
                if b.predecessors.len() > 1 {
                    header_states.insert(block, state.clone());
                    pending_ends.insert(block, vec![None; b.predecessors.len() - 1]);
                } else {
                    //Loop without back-edges, nothing will ever flow back.
                    S::loop_ends(graph, begin, &state, Vec::new())?;
                }
                state
            }
            _ => {
                let pred = *b.predecessors.first().ok_or(GraphError::MalformedControlFlow {
                    node: begin,
                    reason: "block without predecessor".to_owned(),
                })?;
                predecessor_state(&exit_states, pred, begin)?
            }
        };

        for node in b.nodes.iter() {
            if graph.contains(*node) {
                visit(graph, *node, &mut state)?;
            }
        }

        let end = b.end();
        if graph.contains(end) && graph.kind(end) == &NodeKind::LoopEnd {
            let header = *b.successors.first().ok_or(GraphError::MalformedControlFlow {
                node: end,
                reason: "loop end without header".to_owned(),
            })?;
            let slot = cfg
                .block(header)
                .predecessors
                .iter()
                .skip(1)
                .position(|p| *p == block)
                .ok_or(GraphError::MalformedControlFlow {
                    node: end,
                    reason: "loop end is not a predecessor of its header".to_owned(),
                })?;
            let complete = if let Some(pending) = pending_ends.get_mut(&header) {
                pending[slot] = Some(state.clone());
                pending.iter().all(|s| s.is_some())
            } else {
                false
            };
            if complete {
                let end_states: Vec<S> = pending_ends
                    .remove(&header)
                    .unwrap_or_default()
                    .into_iter()
                    .flatten()
                    .collect();
                let header_state =
                    header_states
                        .get(&header)
                        .ok_or(GraphError::MalformedControlFlow {
                            node: end,
                            reason: "loop end visited before its header".to_owned(),
                        })?;
                S::loop_ends(graph, cfg.block(header).begin(), header_state, end_states)?;
            }
        }

        exit_states.insert(block, state);
    }

    Ok(())
}
