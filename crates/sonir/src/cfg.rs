/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 2024 Tendsin Mende
 */

//! Control-flow and loop information derived from the fixed nodes of a [Graph].
//!
//! A basic block starts at `Start`, a merge (`Merge` / `LoopBegin`), or at a `Begin` that follows a control split. It
//! ends at `If`, `End`, `LoopEnd` or `Return`. The [ControlFlowGraph] is a snapshot. It must be recomputed after passes
//! that change the control sequence in a way the caller cares about. Passes that only remove or replace nodes _inside_
//! blocks can keep using it, as long as they skip nodes that are not alive anymore.

use ahash::{AHashMap, AHashSet};
use slotmap::{new_key_type, SlotMap};

use crate::{
    err::GraphError,
    nodes::{LocationIdentity, MemoryAccess, NodeKind},
    Graph, NodeRef, SmallColl,
};

mod dominators;
mod walker;

pub use walker::{walk_blocks, MergeableState};

new_key_type! {
    pub struct BlockRef;
    pub struct LoopRef;
}

#[derive(Debug, Clone)]
pub struct Block {
    ///The nodes, in order of execution. The first node is the block's begin, the last one its end.
    pub nodes: Vec<NodeRef>,
    ///Predecessors in the order of the begin's control predecessors. For merges that is the order of the ends.
    pub predecessors: SmallColl<BlockRef>,
    pub successors: SmallColl<BlockRef>,
    pub dominator: Option<BlockRef>,
    pub post_dominator: Option<BlockRef>,
    ///Innermost loop that contains this block.
    pub loop_ref: Option<LoopRef>,
    ///Position in reverse post order.
    pub rpo_index: usize,
}

impl Block {
    pub fn begin(&self) -> NodeRef {
        self.nodes[0]
    }

    pub fn end(&self) -> NodeRef {
        self.nodes[self.nodes.len() - 1]
    }
}

#[derive(Debug, Clone)]
pub struct Loop {
    pub header: BlockRef,
    pub blocks: AHashSet<BlockRef>,
    ///Blocks ending in a `LoopEnd` of this loop, in the order of the header's predecessors.
    pub ends: SmallColl<BlockRef>,
    ///Blocks outside the loop, that have a predecessor inside the loop.
    pub exits: SmallColl<BlockRef>,
    pub parent: Option<LoopRef>,
    pub depth: usize,
}

#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    blocks: SlotMap<BlockRef, Block>,
    rpo: Vec<BlockRef>,
    block_of: AHashMap<NodeRef, BlockRef>,
    loops: SlotMap<LoopRef, Loop>,
    loop_of_header: AHashMap<BlockRef, LoopRef>,
    start: BlockRef,
}

impl ControlFlowGraph {
    ///Computes blocks, dominators, post-dominators and loops of `graph`.
    pub fn compute(graph: &Graph) -> Result<Self, GraphError> {
        let mut blocks: SlotMap<BlockRef, Block> = SlotMap::default();
        let mut block_of = AHashMap::default();
        let mut begin_to_block: AHashMap<NodeRef, BlockRef> = AHashMap::default();

        //Discover blocks
        let mut worklist = vec![graph.start()];
        while let Some(begin) = worklist.pop() {
            if begin_to_block.contains_key(&begin) {
                continue;
            }
            let mut nodes = vec![begin];
            let mut current = begin;
            while !graph.kind(current).is_block_end() {
                let next = *graph
                    .successors(current)
                    .first()
                    .ok_or_else(|| GraphError::MalformedControlFlow {
                        node: current,
                        reason: "fixed node without successor".to_owned(),
                    })?;
                if graph.kind(next).is_merge() {
                    return Err(GraphError::MalformedControlFlow {
                        node: next,
                        reason: "merge must be entered through an end".to_owned(),
                    });
                }
                nodes.push(next);
                current = next;
            }
            for s in graph.successors(current) {
                worklist.push(*s);
            }

            let block = blocks.insert(Block {
                nodes,
                predecessors: SmallColl::new(),
                successors: SmallColl::new(),
                dominator: None,
                post_dominator: None,
                loop_ref: None,
                rpo_index: 0,
            });
            for n in blocks[block].nodes.iter() {
                block_of.insert(*n, block);
            }
            begin_to_block.insert(begin, block);
        }

        //Edges
        let keys: Vec<BlockRef> = blocks.keys().collect();
        for b in keys.iter() {
            let begin = blocks[*b].begin();
            let end = blocks[*b].end();
            let successors: SmallColl<BlockRef> = graph
                .successors(end)
                .iter()
                .map(|s| begin_to_block[s])
                .collect();
            let mut predecessors: SmallColl<BlockRef> = SmallColl::new();
            if graph.kind(begin) != &NodeKind::Start {
                for p in graph.predecessors(begin) {
                    let Some(pred_block) = block_of.get(p) else {
                        return Err(GraphError::MalformedControlFlow {
                            node: *p,
                            reason: "unreachable end flows into a reachable merge".to_owned(),
                        });
                    };
                    predecessors.push(*pred_block);
                }
            }
            blocks[*b].successors = successors;
            blocks[*b].predecessors = predecessors;
        }

        let start = begin_to_block[&graph.start()];
        let mut cfg = ControlFlowGraph {
            blocks,
            rpo: Vec::new(),
            block_of,
            loops: SlotMap::default(),
            loop_of_header: AHashMap::default(),
            start,
        };
        cfg.compute_order_and_dominators();
        cfg.compute_loops(graph)?;
        Ok(cfg)
    }

    fn compute_order_and_dominators(&mut self) {
        let keys: Vec<BlockRef> = self.blocks.keys().collect();
        let index: AHashMap<BlockRef, usize> =
            keys.iter().enumerate().map(|(i, b)| (*b, i)).collect();
        let count = keys.len();
        let succs: Vec<Vec<usize>> = keys
            .iter()
            .map(|b| self.blocks[*b].successors.iter().map(|s| index[s]).collect())
            .collect();
        let preds: Vec<Vec<usize>> = keys
            .iter()
            .map(|b| {
                self.blocks[*b]
                    .predecessors
                    .iter()
                    .map(|p| index[p])
                    .collect()
            })
            .collect();

        let order = dominators::reverse_post_order(index[&self.start], &succs);
        let idom = dominators::immediate_dominators(&order, &preds);
        self.rpo = order.iter().map(|i| keys[*i]).collect();
        for (rpo_index, b) in self.rpo.iter().enumerate() {
            self.blocks[*b].rpo_index = rpo_index;
        }
        for (i, b) in keys.iter().enumerate() {
            self.blocks[*b].dominator = match idom[i] {
                Some(d) if d != i => Some(keys[d]),
                _ => None,
            };
        }

        //Post dominators on the reversed graph, with a virtual exit at `count` that all returning blocks flow into.
        let exit = count;
        let mut rev_succs: Vec<Vec<usize>> = preds.clone();
        rev_succs.push(
            (0..count)
                .filter(|i| succs[*i].is_empty())
                .collect(),
        );
        let mut rev_preds: Vec<Vec<usize>> = succs.clone();
        for p in rev_preds.iter_mut() {
            if p.is_empty() {
                p.push(exit);
            }
        }
        rev_preds.push(Vec::new());
        let rev_order = dominators::reverse_post_order(exit, &rev_succs);
        let ipdom = dominators::immediate_dominators(&rev_order, &rev_preds);
        for (i, b) in keys.iter().enumerate() {
            self.blocks[*b].post_dominator = match ipdom[i] {
                Some(d) if d != exit && d != i => Some(keys[d]),
                _ => None,
            };
        }
    }

    fn compute_loops(&mut self, graph: &Graph) -> Result<(), GraphError> {
        let headers: Vec<BlockRef> = self
            .rpo
            .iter()
            .copied()
            .filter(|b| graph.kind(self.blocks[*b].begin()) == &NodeKind::LoopBegin)
            .collect();

        for header in headers {
            let preds = self.blocks[header].predecessors.clone();
            let mut blocks = AHashSet::default();
            blocks.insert(header);
            let ends: SmallColl<BlockRef> = preds.iter().skip(1).copied().collect();
            let mut worklist: Vec<BlockRef> = ends.iter().copied().collect();
            while let Some(b) = worklist.pop() {
                if !blocks.insert(b) {
                    continue;
                }
                worklist.extend(self.blocks[b].predecessors.iter().copied());
            }
            if let Some(forward) = preds.first() {
                if blocks.contains(forward) {
                    return Err(GraphError::MalformedControlFlow {
                        node: self.blocks[header].begin(),
                        reason: "forward end of loop is part of the loop body".to_owned(),
                    });
                }
            }
            let mut exits = SmallColl::new();
            for b in blocks.iter() {
                for s in self.blocks[*b].successors.iter() {
                    if !blocks.contains(s) && !exits.contains(s) {
                        exits.push(*s);
                    }
                }
            }
            let lp = self.loops.insert(Loop {
                header,
                blocks,
                ends,
                exits,
                parent: None,
                depth: 1,
            });
            self.loop_of_header.insert(header, lp);
        }

        //Nesting: the parent is the smallest other loop that contains the header.
        let loop_keys: Vec<LoopRef> = self.loops.keys().collect();
        for lp in loop_keys.iter() {
            let header = self.loops[*lp].header;
            let parent = loop_keys
                .iter()
                .filter(|other| *other != lp && self.loops[**other].blocks.contains(&header))
                .min_by_key(|other| self.loops[**other].blocks.len())
                .copied();
            self.loops[*lp].parent = parent;
        }
        for lp in loop_keys.iter() {
            let mut depth = 1;
            let mut parent = self.loops[*lp].parent;
            while let Some(p) = parent {
                depth += 1;
                parent = self.loops[p].parent;
            }
            self.loops[*lp].depth = depth;
        }
        let block_keys: Vec<BlockRef> = self.blocks.keys().collect();
        for b in block_keys {
            let innermost = loop_keys
                .iter()
                .filter(|lp| self.loops[**lp].blocks.contains(&b))
                .max_by_key(|lp| self.loops[**lp].depth)
                .copied();
            self.blocks[b].loop_ref = innermost;
        }
        Ok(())
    }

    pub fn start(&self) -> BlockRef {
        self.start
    }

    pub fn block(&self, block: BlockRef) -> &Block {
        &self.blocks[block]
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    ///Blocks in reverse post order. A block's dominator always comes before the block itself.
    pub fn blocks_rpo(&self) -> &[BlockRef] {
        &self.rpo
    }

    ///The block `node` was part of when the graph was analysed. Only fixed nodes have a block.
    pub fn block_of(&self, node: NodeRef) -> Option<BlockRef> {
        self.block_of.get(&node).copied()
    }

    pub fn dominator(&self, block: BlockRef) -> Option<BlockRef> {
        self.blocks[block].dominator
    }

    ///True if `a` dominates `b`. Every block dominates itself.
    pub fn dominates(&self, a: BlockRef, b: BlockRef) -> bool {
        let mut current = Some(b);
        while let Some(c) = current {
            if c == a {
                return true;
            }
            current = self.blocks[c].dominator;
        }
        false
    }

    ///The immediate post-dominator of `block`, i.e. the closest successor that is reached on every path from `block` to the exit.
    pub fn always_reached_successor(&self, block: BlockRef) -> Option<BlockRef> {
        self.blocks[block].post_dominator
    }

    ///Innermost loop containing `block`.
    pub fn loop_of(&self, block: BlockRef) -> Option<LoopRef> {
        self.blocks[block].loop_ref
    }

    ///The loop `block` is the header of.
    pub fn loop_of_header(&self, block: BlockRef) -> Option<LoopRef> {
        self.loop_of_header.get(&block).copied()
    }

    pub fn loops(&self) -> impl Iterator<Item = (LoopRef, &Loop)> {
        self.loops.iter()
    }

    pub fn get_loop(&self, lp: LoopRef) -> &Loop {
        &self.loops[lp]
    }

    ///All location identities written inside the loop. Contains [Any](LocationIdentity::Any) if the loop contains a checkpoint.
    ///
    /// Nodes that were removed since the analysis are ignored.
    pub fn locations_modified_in_loop(&self, graph: &Graph, lp: LoopRef) -> AHashSet<LocationIdentity> {
        let mut modified = AHashSet::default();
        for b in self.loops[lp].blocks.iter() {
            for n in self.blocks[*b].nodes.iter() {
                let Some(node) = graph.get(*n) else {
                    continue;
                };
                match node.kind().memory_access() {
                    MemoryAccess::Write(location) => {
                        modified.insert(location);
                    }
                    MemoryAccess::Checkpoint => {
                        modified.insert(LocationIdentity::Any);
                    }
                    _ => {}
                }
            }
        }
        modified
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        builder::GraphBuilder,
        nodes::{CompareOp, ValueKind},
    };

    #[test]
    fn diamond_blocks() {
        let mut graph = Graph::new();
        let mut builder = GraphBuilder::new(&mut graph);
        let cond = builder.parameter(0, ValueKind::Bool);
        let merged = builder
            .if_else(
                cond,
                |b| Ok(vec![b.int(1)]),
                |b| Ok(vec![b.int(2)]),
            )
            .unwrap();
        builder.ret(Some(merged[0])).unwrap();

        let cfg = ControlFlowGraph::compute(&graph).unwrap();
        assert!(cfg.block_count() == 4);
        let rpo = cfg.blocks_rpo();
        assert!(rpo[0] == cfg.start());
        let merge_block = rpo[3];
        assert!(cfg.block(merge_block).predecessors.len() == 2);
        assert!(cfg.dominator(merge_block) == Some(cfg.start()));
        assert!(cfg.always_reached_successor(cfg.start()) == Some(merge_block));
        assert!(cfg.loops().count() == 0);
    }

    #[test]
    fn loop_detection() {
        let mut graph = Graph::new();
        let mut builder = GraphBuilder::new(&mut graph);
        let n = builder.parameter(0, ValueKind::Int);
        let zero = builder.int(0);
        let result = builder
            .while_loop(
                &[zero],
                |b, vals| Ok(b.floating(NodeKind::Compare(CompareOp::Lt), &[vals[0], n])),
                |b, vals| {
                    let one = b.int(1);
                    Ok(vec![b.floating(
                        NodeKind::Binary(crate::nodes::BinaryOp::Add),
                        &[vals[0], one],
                    )])
                },
            )
            .unwrap();
        builder.ret(Some(result[0])).unwrap();

        let cfg = ControlFlowGraph::compute(&graph).unwrap();
        let loops: Vec<_> = cfg.loops().collect();
        assert!(loops.len() == 1);
        let (lp, info) = loops[0];
        assert!(info.ends.len() == 1);
        assert!(info.exits.len() == 1);
        assert!(info.blocks.len() == 2, "header and body, got {}", info.blocks.len());
        assert!(cfg.loop_of(info.header) == Some(lp));
        assert!(cfg.locations_modified_in_loop(&graph, lp).is_empty());
    }
}
