/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 2024 Tendsin Mende
 */

//! Worklist driven canonicalization.
//!
//! Every node on the worklist is asked for its canonical form, first through an optional [CustomCanonicalizer], then
//! through its own `canonicalize` capability. If it answers with another node (or with nothing) the node is replaced
//! according to the following table:
//!
//! | node            | replacement       | action                                              |
//! |-----------------|-------------------|-----------------------------------------------------|
//! | floating        | none              | remove the node                                     |
//! | floating        | floating / placed | rewire usages                                       |
//! | placed fixed    | none              | splice out of the control sequence                  |
//! | placed fixed    | floating          | splice out, rewire usages                           |
//! | placed fixed    | unplaced fixed    | put the replacement at the node's control position  |
//! | placed fixed    | placed fixed      | rewire usages, splice out                           |
//!
//! Everything else is an [InvariantViolation](OptError::InvariantViolation).
//!
//! Nodes that are still unchanged get a chance to `simplify` their surrounding control flow.

use std::collections::VecDeque;

use ahash::{AHashMap, AHashSet};
use sonir::{
    nodes::{Canonical, SimplifierTool},
    Graph, NodeRef,
};

use crate::{
    stats::{Counter, Statistics},
    OptError, Optimizer,
};

const PASS: &str = "canonicalize";

///Rewrite rules that are consulted before a node's own canonicalization. Returning `Ok(None)` falls back to the
/// node's own rule.
///
/// The `tool` can be used to schedule additional nodes.
pub trait CustomCanonicalizer {
    fn canonical(
        &mut self,
        tool: &mut dyn SimplifierTool,
        node: NodeRef,
    ) -> Result<Option<Canonical>, OptError>;
}

pub(crate) struct Canonicalizer<'a, 'c> {
    graph: &'a mut Graph,
    stats: &'a mut Statistics,
    custom: Option<&'c mut dyn CustomCanonicalizer>,
    max_revisits: usize,
    worklist: VecDeque<NodeRef>,
    queued: AHashSet<NodeRef>,
    visits: AHashMap<NodeRef, usize>,
}

impl SimplifierTool for Canonicalizer<'_, '_> {
    fn graph(&mut self) -> &mut Graph {
        &mut *self.graph
    }

    fn add_to_worklist(&mut self, node: NodeRef) {
        self.push(node);
    }
}

impl<'a, 'c> Canonicalizer<'a, 'c> {
    pub(crate) fn new(
        graph: &'a mut Graph,
        stats: &'a mut Statistics,
        max_revisits: usize,
        custom: Option<&'c mut dyn CustomCanonicalizer>,
    ) -> Self {
        Canonicalizer {
            graph,
            stats,
            custom,
            max_revisits,
            worklist: VecDeque::new(),
            queued: AHashSet::default(),
            visits: AHashMap::default(),
        }
    }

    fn push(&mut self, node: NodeRef) {
        if self.queued.insert(node) {
            self.worklist.push_back(node);
        }
    }

    ///Processes `seed` and everything that is scheduled while doing so. Removes unused floating nodes afterwards.
    pub(crate) fn run(&mut self, seed: impl IntoIterator<Item = NodeRef>) -> Result<(), OptError> {
        for node in seed {
            self.push(node);
        }

        while let Some(node) = self.worklist.pop_front() {
            self.queued.remove(&node);
            if !self.graph.contains(node) {
                continue;
            }
            let visits = self.visits.entry(node).or_insert(0);
            if *visits >= self.max_revisits {
                //Only count the node once, but keep it marked as exhausted.
                if *visits == self.max_revisits {
                    *visits += 1;
                    self.stats.increment(Counter::CanonicalizerRevisitLimit);
                    #[cfg(feature = "log")]
                    log::trace!("{node:?} hit the revisit limit");
                }
                continue;
            }
            *visits += 1;
            self.process(node)?;
        }

        self.cleanup()
    }

    fn process(&mut self, node: NodeRef) -> Result<(), OptError> {
        let mut canonical = None;
        if let Some(custom) = self.custom.take() {
            let result = custom.canonical(self, node);
            self.custom = Some(custom);
            canonical = result?;
        }
        //The custom canonicalizer might have removed it already.
        if !self.graph.contains(node) {
            return Ok(());
        }

        let ops = self.graph.node(node).ops();
        if canonical.is_none() {
            if let Some(canonicalize) = ops.canonicalize {
                canonical = Some(canonicalize(self.graph, node)?);
            }
        }

        match canonical {
            Some(Canonical::Replace(replacement)) if replacement != node => {
                return self.replace(node, Some(replacement));
            }
            Some(Canonical::Delete) => return self.replace(node, None),
            _ => {}
        }

        if let Some(simplify) = ops.simplify {
            let before = self.graph.node_count();
            simplify(self, node)?;
            if !self.graph.contains(node) || self.graph.node_count() != before {
                self.stats.increment(Counter::SimplifiedNodes);
                #[cfg(feature = "log")]
                log::trace!("simplified around {node:?}");
            }
        }
        Ok(())
    }

    fn replace(&mut self, node: NodeRef, replacement: Option<NodeRef>) -> Result<(), OptError> {
        let graph = &mut *self.graph;
        if let Some(r) = replacement {
            if !graph.contains(r) {
                return Err(OptError::invariant(
                    PASS,
                    node,
                    format!("replacement {r:?} is not part of the graph"),
                ));
            }
            if graph.inputs(r).contains(&node) {
                return Err(OptError::invariant(
                    PASS,
                    node,
                    format!("replacement {r:?} uses the node it replaces"),
                ));
            }
        }

        let users = graph.unique_usages(node);
        #[cfg(feature = "log")]
        log::trace!(
            "{} {node:?} -> {}",
            graph.kind(node).name(),
            replacement
                .map(|r| format!("{} {r:?}", graph.kind(r).name()))
                .unwrap_or_else(|| "none".to_owned())
        );

        if !graph.is_fixed(node) {
            match replacement {
                None => {
                    if !users.is_empty() {
                        return Err(OptError::invariant(
                            PASS,
                            node,
                            format!("deleted floating node still has {} users", users.len()),
                        ));
                    }
                }
                Some(r) => {
                    if graph.is_fixed(r) && !graph.is_connected(r) {
                        return Err(OptError::invariant(
                            PASS,
                            node,
                            format!("floating node replaced by unplaced fixed node {r:?}"),
                        ));
                    }
                    graph.replace_at_usages(node, r)?;
                }
            }
            graph.kill(node)?;
        } else {
            if !graph.is_connected(node) || !graph.kind(node).is_fixed_with_next() {
                return Err(OptError::invariant(
                    PASS,
                    node,
                    format!(
                        "only placed single-successor fixed nodes can be replaced, found {}",
                        graph.kind(node).name()
                    ),
                ));
            }
            match replacement {
                None => {
                    if !users.is_empty() {
                        return Err(OptError::invariant(
                            PASS,
                            node,
                            format!("deleted fixed node still has {} users", users.len()),
                        ));
                    }
                    graph.splice_out(node)?;
                }
                Some(r) if !graph.is_fixed(r) => {
                    graph.splice_out(node)?;
                    graph.replace_at_usages(node, r)?;
                }
                Some(r) if !graph.is_connected(r) => {
                    graph.replace_fixed(node, r)?;
                }
                Some(r) => {
                    graph.replace_at_usages(node, r)?;
                    graph.splice_out(node)?;
                }
            }
            graph.kill(node)?;
        }

        self.stats.increment(Counter::CanonicalizedNodes);
        for user in users {
            if self.graph.contains(user) {
                self.push(user);
            }
        }
        if let Some(r) = replacement {
            self.push(r);
        }
        Ok(())
    }

    ///Removes every floating node that is not used anymore.
    fn cleanup(&mut self) -> Result<(), OptError> {
        let before = self.graph.node_count();
        let unused: Vec<NodeRef> = self
            .graph
            .nodes()
            .filter(|n| {
                let node = self.graph.node(*n);
                node.is_floating() && node.usages().is_empty()
            })
            .collect();
        self.graph.kill_unused_floating(&unused)?;
        self.stats.add(
            Counter::DeadNodesRemoved,
            before.saturating_sub(self.graph.node_count()) as u64,
        );
        Ok(())
    }
}

impl Optimizer {
    ///Canonicalizes the whole graph.
    pub fn canonicalize(&mut self) -> Result<(), OptError> {
        self.run_canonicalizer(None, None)
    }

    ///Canonicalizes `nodes` and everything that changes because of them.
    pub fn canonicalize_nodes(&mut self, nodes: &[NodeRef]) -> Result<(), OptError> {
        self.run_canonicalizer(None, Some(nodes))
    }

    ///Canonicalizes with additional rewrite rules. If `nodes` is `None` the whole graph is processed.
    pub fn canonicalize_with(
        &mut self,
        custom: &mut dyn CustomCanonicalizer,
        nodes: Option<&[NodeRef]>,
    ) -> Result<(), OptError> {
        self.run_canonicalizer(Some(custom), nodes)
    }

    fn run_canonicalizer(
        &mut self,
        custom: Option<&mut dyn CustomCanonicalizer>,
        nodes: Option<&[NodeRef]>,
    ) -> Result<(), OptError> {
        let seed: Vec<NodeRef> = match nodes {
            Some(nodes) => nodes.to_vec(),
            None => self.graph.nodes().collect(),
        };
        let replaced_before = self.stats.get(Counter::CanonicalizedNodes);
        let simplified_before = self.stats.get(Counter::SimplifiedNodes);

        Canonicalizer::new(
            &mut self.graph,
            &mut self.stats,
            self.config.canonicalizer_max_revisits,
            custom,
        )
        .run(seed)?;

        #[cfg(feature = "log")]
        log::info!(
            "canonicalizer: {} nodes replaced, {} simplified",
            self.stats.get(Counter::CanonicalizedNodes) - replaced_before,
            self.stats.get(Counter::SimplifiedNodes) - simplified_before
        );
        #[cfg(not(feature = "log"))]
        let _ = (replaced_before, simplified_before);

        self.verify_after(PASS)
    }
}

#[cfg(test)]
mod test {
    use sonir::{
        builder::GraphBuilder,
        interp::{Interpreter, Value},
        nodes::{BinaryOp, FieldDesc, NodeKind, ValueKind},
    };

    use super::*;

    ///Answers `result` for `target`, exactly once.
    struct Force {
        target: NodeRef,
        result: Canonical,
        done: bool,
    }

    impl Force {
        fn new(target: NodeRef, result: Canonical) -> Self {
            Force {
                target,
                result,
                done: false,
            }
        }
    }

    impl CustomCanonicalizer for Force {
        fn canonical(
            &mut self,
            _tool: &mut dyn SimplifierTool,
            node: NodeRef,
        ) -> Result<Option<Canonical>, OptError> {
            if node == self.target && !self.done {
                self.done = true;
                Ok(Some(self.result))
            } else {
                Ok(None)
            }
        }
    }

    ///Keeps rescheduling every parameter.
    struct Restless {
        calls: usize,
    }

    impl CustomCanonicalizer for Restless {
        fn canonical(
            &mut self,
            tool: &mut dyn SimplifierTool,
            node: NodeRef,
        ) -> Result<Option<Canonical>, OptError> {
            if matches!(tool.graph().kind(node), NodeKind::Parameter { .. }) {
                self.calls += 1;
                tool.add_to_worklist(node);
            }
            Ok(None)
        }
    }

    fn int_field() -> FieldDesc {
        FieldDesc::new(0, ValueKind::Int)
    }

    #[test]
    fn floating_to_none() {
        let mut graph = Graph::new();
        let p = graph.parameter(0, ValueKind::Int);
        let unused = graph.add(NodeKind::Binary(BinaryOp::Mul), &[p, p]);
        let mut b = GraphBuilder::new(&mut graph);
        b.ret(Some(p)).unwrap();

        let mut opt = Optimizer::new(graph);
        opt.canonicalize_with(&mut Force::new(unused, Canonical::Delete), None)
            .unwrap();
        assert!(!opt.graph().contains(unused));
        assert!(opt.stats.get(Counter::CanonicalizedNodes) == 1);
    }

    #[test]
    fn floating_to_floating() {
        let mut graph = Graph::new();
        let p = graph.parameter(0, ValueKind::Int);
        let q = graph.parameter(1, ValueKind::Int);
        let add = graph.add(NodeKind::Binary(BinaryOp::Add), &[p, q]);
        let mut b = GraphBuilder::new(&mut graph);
        let ret = b.ret(Some(add)).unwrap();

        let mut opt = Optimizer::new(graph);
        opt.canonicalize_with(&mut Force::new(add, Canonical::Replace(q)), None)
            .unwrap();
        assert!(!opt.graph().contains(add));
        assert!(opt.graph().inputs(ret) == [q]);
    }

    #[test]
    fn placed_fixed_to_none() {
        let mut graph = Graph::new();
        let mut b = GraphBuilder::new(&mut graph);
        let barrier = b.append(NodeKind::MemoryBarrier, &[]).unwrap();
        let ret = b.ret(None).unwrap();
        let start = graph.start();

        let mut opt = Optimizer::new(graph);
        opt.canonicalize_with(&mut Force::new(barrier, Canonical::Delete), None)
            .unwrap();
        assert!(!opt.graph().contains(barrier));
        assert!(opt.graph().next(start) == Some(ret));
    }

    #[test]
    fn placed_fixed_to_floating() {
        let f = int_field();
        let mut graph = Graph::new();
        let obj = graph.parameter(0, ValueKind::Object);
        let mut b = GraphBuilder::new(&mut graph);
        let load = b.load_field(obj, f).unwrap();
        let ret = b.ret(Some(load)).unwrap();
        let seven = graph.int(7);

        let mut opt = Optimizer::new(graph);
        opt.canonicalize_with(&mut Force::new(load, Canonical::Replace(seven)), None)
            .unwrap();
        let graph = opt.graph();
        assert!(!graph.contains(load));
        assert!(graph.inputs(ret) == [seven]);
        assert!(graph.next(graph.start()) == Some(ret));
    }

    #[test]
    fn placed_fixed_to_unplaced_fixed() {
        let mut graph = Graph::new();
        let mut b = GraphBuilder::new(&mut graph);
        let old = b.append(NodeKind::MemoryBarrier, &[]).unwrap();
        let ret = b.ret(None).unwrap();
        let new = graph.add(NodeKind::MemoryBarrier, &[]);

        let mut opt = Optimizer::new(graph);
        opt.canonicalize_with(&mut Force::new(old, Canonical::Replace(new)), None)
            .unwrap();
        let graph = opt.graph();
        assert!(!graph.contains(old));
        assert!(graph.next(graph.start()) == Some(new));
        assert!(graph.next(new) == Some(ret));
    }

    #[test]
    fn placed_fixed_to_placed_fixed() {
        let f = int_field();
        let mut graph = Graph::new();
        let obj = graph.parameter(0, ValueKind::Object);
        let mut b = GraphBuilder::new(&mut graph);
        let first = b.load_field(obj, f).unwrap();
        let second = b.load_field(obj, f).unwrap();
        let sum = b.floating(NodeKind::Binary(BinaryOp::Add), &[first, second]);
        let ret = b.ret(Some(sum)).unwrap();

        let mut opt = Optimizer::new(graph);
        opt.canonicalize_with(&mut Force::new(second, Canonical::Replace(first)), None)
            .unwrap();
        let graph = opt.graph();
        assert!(!graph.contains(second));
        assert!(graph.inputs(sum) == [first, first]);
        assert!(graph.next(first) == Some(ret));
    }

    #[test]
    fn floating_to_unplaced_fixed_is_rejected() {
        let mut graph = Graph::new();
        let p = graph.parameter(0, ValueKind::Int);
        let q = graph.parameter(1, ValueKind::Int);
        let add = graph.add(NodeKind::Binary(BinaryOp::Add), &[p, q]);
        let mut b = GraphBuilder::new(&mut graph);
        b.ret(Some(add)).unwrap();
        let unplaced = graph.add(NodeKind::MemoryBarrier, &[]);

        let mut opt = Optimizer::new(graph);
        let result = opt.canonicalize_with(&mut Force::new(add, Canonical::Replace(unplaced)), None);
        assert!(matches!(
            result,
            Err(OptError::InvariantViolation { node, .. }) if node == add
        ));
        //Nothing was touched.
        assert!(opt.graph().contains(add));
        assert!(opt.graph().usages(add).len() == 1);
    }

    #[test]
    fn revisit_limit_is_counted() {
        let mut graph = Graph::new();
        let p = graph.parameter(0, ValueKind::Int);
        let mut b = GraphBuilder::new(&mut graph);
        b.ret(Some(p)).unwrap();

        let mut opt = Optimizer::new(graph);
        let mut restless = Restless { calls: 0 };
        opt.canonicalize_with(&mut restless, None).unwrap();
        assert!(restless.calls == opt.config.canonicalizer_max_revisits);
        assert!(opt.stats.get(Counter::CanonicalizerRevisitLimit) == 1);
    }

    #[test]
    fn constant_branch_is_folded() {
        let mut graph = Graph::new();
        let mut b = GraphBuilder::new(&mut graph);
        let t = b.bool(true);
        let merged = b
            .if_else(t, |b| Ok(vec![b.int(1)]), |b| Ok(vec![b.int(2)]))
            .unwrap();
        let ret = b.ret(Some(merged[0])).unwrap();

        let mut opt = Optimizer::new(graph);
        opt.canonicalize().unwrap();
        let graph = opt.graph();
        assert!(graph.next(graph.start()) == Some(ret));
        assert!(graph.as_int(graph.inputs(ret)[0]) == Some(1));
        assert!(!graph.nodes().any(|n| graph.kind(n).is_merge()));
        assert!(opt.stats.get(Counter::SimplifiedNodes) > 0);

        let result = Interpreter::new(graph).run(&[]).unwrap();
        assert!(result == Some(Value::Int(1)));
    }

    #[test]
    fn folding_reaches_fixpoint() {
        let mut graph = Graph::new();
        let p = graph.parameter(0, ValueKind::Int);
        let mut b = GraphBuilder::new(&mut graph);
        let zero = b.int(0);
        let two = b.int(2);
        let three = b.int(3);
        let five = b.floating(NodeKind::Binary(BinaryOp::Add), &[two, three]);
        let times = b.floating(NodeKind::Binary(BinaryOp::Mul), &[p, zero]);
        let sum = b.floating(NodeKind::Binary(BinaryOp::Add), &[five, times]);
        let ret = b.ret(Some(sum)).unwrap();

        let mut opt = Optimizer::new(graph);
        opt.canonicalize().unwrap();
        let graph = opt.graph();
        assert!(graph.as_int(graph.inputs(ret)[0]) == Some(5));
        assert!(!graph.contains(p));
        assert!(opt.stats.get(Counter::CanonicalizerRevisitLimit) == 0);
    }
}
