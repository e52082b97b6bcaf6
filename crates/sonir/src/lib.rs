/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 2024 Tendsin Mende
 */

//! # Sonir
//!
//! A sea-of-nodes intermediate representation. The [Graph] owns all [Node](nodes::Node)s in an arena and keeps
//! three kinds of edges consistent:
//!
//! - data edges: `inputs` of a node, mirrored by the `usages` of the input,
//! - control edges: `successors` of a fixed node, mirrored by the `predecessors` of the successor,
//! - anchor edges: a phi's merge. The anchor is counted as a usage of the merge.
//!
//! Every mutation that goes through the [Graph] API keeps those edges symmetric. [Graph::verify] can be used
//! to check that after a pass.
//!
//! Dominance, loops and block order are available through the [ControlFlowGraph](cfg::ControlFlowGraph), which is
//! computed on demand from the fixed nodes.

use std::fmt::Write;

use ahash::AHashMap;
use slotmap::{new_key_type, SlotMap};

pub mod builder;
pub mod cfg;
#[cfg(feature = "dot")]
pub mod dot;
mod err;
pub mod interp;
pub mod nodes;
pub mod util;

pub use err::GraphError;
use nodes::{Constant, Node, NodeKind, PhiKind, PhiNode, PhiState, Stamp, ValueKind};
pub use smallvec;

///Small collection used throughout the graph for inputs, predecessors etc.
pub type SmallColl<T> = smallvec::SmallVec<[T; 3]>;

new_key_type! {
    ///Handle to a node in a [Graph].
    pub struct NodeRef;
}

///The sea-of-nodes graph of a single compilation unit.
#[derive(Debug, Clone)]
pub struct Graph {
    pub(crate) nodes: SlotMap<NodeRef, Node>,
    pub(crate) start: NodeRef,
    ///Uniqued constants
    constants: AHashMap<Constant, NodeRef>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Index<NodeRef> for Graph {
    type Output = Node;
    fn index(&self, index: NodeRef) -> &Self::Output {
        &self.nodes[index]
    }
}

impl Graph {
    ///Creates a graph that only contains the `Start` node.
    pub fn new() -> Self {
        let mut nodes = SlotMap::default();
        let start = nodes.insert(Node::new(NodeKind::Start, Stamp::Control));
        Graph {
            nodes,
            start,
            constants: AHashMap::default(),
        }
    }

    pub fn start(&self) -> NodeRef {
        self.start
    }

    pub fn contains(&self, node: NodeRef) -> bool {
        self.nodes.contains_key(node)
    }

    ///Returns the node. Panics if `node` is not part of the graph. Use [Graph::get] for a checked version.
    pub fn node(&self, node: NodeRef) -> &Node {
        &self.nodes[node]
    }

    pub fn get(&self, node: NodeRef) -> Option<&Node> {
        self.nodes.get(node)
    }

    pub fn try_node(&self, node: NodeRef) -> Result<&Node, GraphError> {
        self.nodes.get(node).ok_or(GraphError::InvalidNode(node))
    }

    pub(crate) fn node_mut(&mut self, node: NodeRef) -> Result<&mut Node, GraphError> {
        self.nodes
            .get_mut(node)
            .ok_or(GraphError::InvalidNode(node))
    }

    pub fn kind(&self, node: NodeRef) -> &NodeKind {
        &self.nodes[node].kind
    }

    pub fn inputs(&self, node: NodeRef) -> &[NodeRef] {
        &self.nodes[node].inputs
    }

    pub fn usages(&self, node: NodeRef) -> &[NodeRef] {
        &self.nodes[node].usages
    }

    pub fn stamp(&self, node: NodeRef) -> Stamp {
        self.nodes[node].stamp
    }

    pub fn set_stamp(&mut self, node: NodeRef, stamp: Stamp) -> Result<(), GraphError> {
        self.node_mut(node)?.stamp = stamp;
        Ok(())
    }

    pub fn set_frequency(&mut self, node: NodeRef, frequency: f64) -> Result<(), GraphError> {
        self.node_mut(node)?.frequency = Some(frequency);
        Ok(())
    }

    ///Number of distinct users of `node`.
    pub fn unique_usages(&self, node: NodeRef) -> SmallColl<NodeRef> {
        let mut users = SmallColl::new();
        for u in self.nodes[node].usages.iter() {
            if !users.contains(u) {
                users.push(*u);
            }
        }
        users
    }

    pub fn successors(&self, node: NodeRef) -> &[NodeRef] {
        &self.nodes[node].successors
    }

    pub fn predecessors(&self, node: NodeRef) -> &[NodeRef] {
        &self.nodes[node].predecessors
    }

    ///Copy of the whole graph, for speculative work that might be thrown away.
    pub fn snapshot(&self) -> Graph {
        self.clone()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    ///Iterates all live node handles.
    pub fn nodes(&self) -> impl Iterator<Item = NodeRef> + '_ {
        self.nodes.keys()
    }

    ///Adds a new node with the given data inputs. Fixed nodes are not connected to the control sequence yet.
    ///
    /// Constants are uniqued, adding a constant that already exists returns the existing node.
    pub fn add(&mut self, kind: NodeKind, inputs: &[NodeRef]) -> NodeRef {
        if let NodeKind::Constant(c) = kind {
            return self.constant(c);
        }
        let stamp = self.initial_stamp(&kind, inputs);
        let mut node = Node::new(kind, stamp);
        node.inputs.extend_from_slice(inputs);
        let new = self.nodes.insert(node);
        for input in inputs {
            self.nodes[*input].usages.push(new);
        }
        new
    }

    ///Like [Graph::add], but fails if `kind` is not a fixed node kind.
    pub fn add_fixed(&mut self, kind: NodeKind, inputs: &[NodeRef]) -> Result<NodeRef, GraphError> {
        if !kind.is_fixed() || kind == NodeKind::Start {
            return Err(GraphError::UnexpectedKind {
                expected: "fixed",
                found: kind.name(),
            });
        }
        Ok(self.add(kind, inputs))
    }

    ///Like [Graph::add], but fails if `kind` is not a floating node kind. Phis must be created via [Graph::add_phi].
    pub fn add_floating(
        &mut self,
        kind: NodeKind,
        inputs: &[NodeRef],
    ) -> Result<NodeRef, GraphError> {
        if !kind.is_floating() || kind.is_phi() {
            return Err(GraphError::UnexpectedKind {
                expected: "floating",
                found: kind.name(),
            });
        }
        Ok(self.add(kind, inputs))
    }

    pub fn constant(&mut self, constant: Constant) -> NodeRef {
        if let Some(existing) = self.constants.get(&constant) {
            if self.nodes.contains_key(*existing) {
                return *existing;
            }
        }
        let node = self.nodes.insert(Node::new(
            NodeKind::Constant(constant),
            Stamp::for_constant(&constant),
        ));
        self.constants.insert(constant, node);
        node
    }

    pub fn int(&mut self, value: i64) -> NodeRef {
        self.constant(Constant::Int(value))
    }

    pub fn bool(&mut self, value: bool) -> NodeRef {
        self.constant(Constant::Bool(value))
    }

    pub fn null(&mut self) -> NodeRef {
        self.constant(Constant::Null)
    }

    pub fn parameter(&mut self, index: u32, kind: ValueKind) -> NodeRef {
        self.add(NodeKind::Parameter { index, kind }, &[])
    }

    pub fn as_constant(&self, node: NodeRef) -> Option<Constant> {
        self.nodes.get(node)?.kind.as_constant().copied()
    }

    pub fn as_int(&self, node: NodeRef) -> Option<i64> {
        if let Some(Constant::Int(i)) = self.as_constant(node) {
            Some(i)
        } else {
            None
        }
    }

    pub fn as_bool(&self, node: NodeRef) -> Option<bool> {
        if let Some(Constant::Bool(b)) = self.as_constant(node) {
            Some(b)
        } else {
            None
        }
    }

    fn initial_stamp(&self, kind: &NodeKind, inputs: &[NodeRef]) -> Stamp {
        match kind {
            NodeKind::Start
            | NodeKind::Begin
            | NodeKind::End
            | NodeKind::Merge
            | NodeKind::LoopBegin
            | NodeKind::LoopEnd
            | NodeKind::If
            | NodeKind::Return => Stamp::Control,
            NodeKind::NewInstance(shape) => Stamp::allocation(Some(shape.class)),
            NodeKind::NewArray { .. } => Stamp::allocation(None),
            NodeKind::LoadField(f) => Stamp::for_kind(f.kind),
            NodeKind::LoadIndexed(k) => Stamp::for_kind(*k),
            NodeKind::ArrayLength => Stamp::Int {
                lower: 0,
                upper: i32::MAX as i64,
            },
            NodeKind::Invoke(target) => target.returns.map(Stamp::for_kind).unwrap_or(Stamp::Void),
            NodeKind::Constant(c) => Stamp::for_constant(c),
            NodeKind::Parameter { kind, .. } => Stamp::for_kind(*kind),
            NodeKind::Binary(_) => Stamp::INT,
            NodeKind::Compare(_) | NodeKind::IsNull | NodeKind::InstanceOf(_) => Stamp::Bool,
            NodeKind::Phi(PhiNode {
                kind: PhiKind::Memory(_),
                ..
            }) => Stamp::Memory,
            NodeKind::Phi(_) => self.meet_stamps(inputs.iter().copied()),
            NodeKind::FloatingRead(access) => Stamp::for_kind(access.kind()),
            NodeKind::VirtualObject(shape) => Stamp::allocation(shape.class()),
            _ => Stamp::Void,
        }
    }

    ///Meet of all stamps in `nodes`. [Void](Stamp::Void) if there is none.
    pub fn meet_stamps(&self, nodes: impl Iterator<Item = NodeRef>) -> Stamp {
        nodes
            .filter_map(|n| self.nodes.get(n).map(|n| n.stamp))
            .reduce(|a, b| a.meet(&b))
            .unwrap_or(Stamp::Void)
    }

    ///Sets input `index` of `node` to `new`.
    pub fn set_input(&mut self, node: NodeRef, index: usize, new: NodeRef) -> Result<(), GraphError> {
        if !self.contains(new) {
            return Err(GraphError::InvalidNode(new));
        }
        let old = *self
            .node_mut(node)?
            .inputs
            .get(index)
            .ok_or(GraphError::InvalidInput { node, index })?;
        if old == new {
            return Ok(());
        }
        if let Some(old) = self.nodes.get_mut(old) {
            old.remove_usage(node);
        }
        self.nodes[node].inputs[index] = new;
        self.nodes[new].usages.push(node);
        Ok(())
    }

    ///Replaces every input edge `old` of `node` with `new`. Returns the number of replaced edges.
    pub fn replace_input(
        &mut self,
        node: NodeRef,
        old: NodeRef,
        new: NodeRef,
    ) -> Result<usize, GraphError> {
        let positions: SmallColl<usize> = self
            .try_node(node)?
            .inputs
            .iter()
            .enumerate()
            .filter_map(|(idx, i)| if *i == old { Some(idx) } else { None })
            .collect();
        for idx in positions.iter() {
            self.set_input(node, *idx, new)?;
        }
        Ok(positions.len())
    }

    ///Appends `value` to the inputs of `node`. Phis must use [Graph::add_phi_input].
    pub fn add_input(&mut self, node: NodeRef, value: NodeRef) -> Result<(), GraphError> {
        if !self.contains(value) {
            return Err(GraphError::InvalidNode(value));
        }
        if self.try_node(node)?.kind.is_phi() {
            return Err(GraphError::ExpectedPhi { node });
        }
        self.nodes[node].inputs.push(value);
        self.nodes[value].usages.push(node);
        Ok(())
    }

    ///Redirects every usage (input and anchor edges) of `old` to `new`. Afterwards `old` has no usages.
    pub fn replace_at_usages(&mut self, old: NodeRef, new: NodeRef) -> Result<(), GraphError> {
        if old == new {
            return Ok(());
        }
        if !self.contains(new) {
            return Err(GraphError::InvalidNode(new));
        }
        let users = self.unique_usages(old);
        self.node_mut(old)?.usages.clear();
        for user in users {
            let user_node = &mut self.nodes[user];
            let mut edges = 0;
            for input in user_node.inputs.iter_mut() {
                if *input == old {
                    *input = new;
                    edges += 1;
                }
            }
            if user_node.anchor == Some(old) {
                user_node.anchor = Some(new);
                edges += 1;
            }
            for _ in 0..edges {
                self.nodes[new].usages.push(user);
            }
        }
        Ok(())
    }

    ///Creates a phi at `merge` with the given initial inputs. Inputs can be appended later via [Graph::add_phi_input].
    pub fn add_phi(
        &mut self,
        merge: NodeRef,
        kind: PhiKind,
        inputs: &[NodeRef],
    ) -> Result<NodeRef, GraphError> {
        let merge_node = self.try_node(merge)?;
        if !merge_node.kind.is_merge() {
            return Err(GraphError::ExpectedMerge { node: merge });
        }
        let is_loop = merge_node.kind == NodeKind::LoopBegin;
        let predecessors = merge_node.predecessors.len();

        let phi = self.add(
            NodeKind::Phi(PhiNode {
                kind,
                state: PhiState::Open,
            }),
            inputs,
        );
        if inputs.len() > predecessors {
            return Err(GraphError::PhiArityMismatch {
                phi,
                merge,
                inputs: inputs.len(),
                predecessors,
            });
        }
        self.nodes[phi].anchor = Some(merge);
        self.nodes[merge].usages.push(phi);
        if let NodeKind::Phi(p) = &mut self.nodes[phi].kind {
            p.advance(inputs.len(), predecessors, is_loop);
        }
        Ok(phi)
    }

    ///Appends the input for the next predecessor of the phi's merge.
    pub fn add_phi_input(&mut self, phi: NodeRef, value: NodeRef) -> Result<(), GraphError> {
        if !self.contains(value) {
            return Err(GraphError::InvalidNode(value));
        }
        let merge = self.phi_merge(phi)?;
        let is_loop = self.nodes[merge].kind == NodeKind::LoopBegin;
        let predecessors = self.nodes[merge].predecessors.len();
        let node = &mut self.nodes[phi];
        if node.is_closed_phi() {
            return Err(GraphError::PhiClosed(phi));
        }
        if node.inputs.len() >= predecessors {
            return Err(GraphError::PhiArityMismatch {
                phi,
                merge,
                inputs: node.inputs.len() + 1,
                predecessors,
            });
        }
        node.inputs.push(value);
        let count = node.inputs.len();
        if let NodeKind::Phi(p) = &mut node.kind {
            p.advance(count, predecessors, is_loop);
        }
        self.nodes[value].usages.push(phi);

        if self.nodes[phi].kind.is_value_phi() {
            let stamp = self.meet_stamps(
                self.nodes[phi]
                    .inputs
                    .iter()
                    .copied()
                    .filter(|i| *i != phi),
            );
            self.nodes[phi].stamp = stamp;
        }
        Ok(())
    }

    ///Closes `phi`. Fails if it does not have one input per predecessor.
    pub fn close_phi(&mut self, phi: NodeRef) -> Result<(), GraphError> {
        let merge = self.phi_merge(phi)?;
        let predecessors = self.nodes[merge].predecessors.len();
        let inputs = self.nodes[phi].inputs.len();
        if inputs != predecessors {
            return Err(GraphError::PhiArityMismatch {
                phi,
                merge,
                inputs,
                predecessors,
            });
        }
        if let NodeKind::Phi(p) = &mut self.nodes[phi].kind {
            p.state = PhiState::Closed;
        }
        Ok(())
    }

    pub fn phi_merge(&self, phi: NodeRef) -> Result<NodeRef, GraphError> {
        let node = self.try_node(phi)?;
        if !node.kind.is_phi() {
            return Err(GraphError::ExpectedPhi { node: phi });
        }
        node.anchor.ok_or(GraphError::ExpectedMerge { node: phi })
    }

    ///All phis anchored at `merge`, in creation order.
    pub fn phis_of(&self, merge: NodeRef) -> SmallColl<NodeRef> {
        let Some(merge_node) = self.nodes.get(merge) else {
            return SmallColl::new();
        };
        let mut phis = SmallColl::new();
        for u in merge_node.usages.iter() {
            if self.nodes[*u].kind.is_phi()
                && self.nodes[*u].anchor == Some(merge)
                && !phis.contains(u)
            {
                phis.push(*u);
            }
        }
        phis
    }

    ///Removes input `index` of a phi. Used when the matching end of its merge is removed.
    pub(crate) fn remove_phi_input(
        &mut self,
        phi: NodeRef,
        index: usize,
    ) -> Result<Option<NodeRef>, GraphError> {
        let node = self.node_mut(phi)?;
        if index >= node.inputs.len() {
            return Ok(None);
        }
        let removed = node.inputs.remove(index);
        if let Some(r) = self.nodes.get_mut(removed) {
            r.remove_usage(phi);
        }
        Ok(Some(removed))
    }

    pub fn is_fixed(&self, node: NodeRef) -> bool {
        self.nodes[node].kind.is_fixed()
    }

    ///True if `node` is fixed and part of the control sequence.
    pub fn is_connected(&self, node: NodeRef) -> bool {
        match self.nodes.get(node) {
            Some(n) => n.kind.is_fixed() && (node == self.start || !n.predecessors.is_empty()),
            None => false,
        }
    }

    ///The single control predecessor of `node`, if there is exactly one.
    pub fn predecessor(&self, node: NodeRef) -> Option<NodeRef> {
        let preds = &self.nodes.get(node)?.predecessors;
        if preds.len() == 1 {
            Some(preds[0])
        } else {
            None
        }
    }

    ///The control successor of a node that is not a control split.
    pub fn next(&self, node: NodeRef) -> Option<NodeRef> {
        let n = self.nodes.get(node)?;
        if n.kind.is_control_split() {
            None
        } else {
            n.successors.first().copied()
        }
    }

    ///Connects `node` to its control successor `next`.
    pub fn set_next(&mut self, node: NodeRef, next: NodeRef) -> Result<(), GraphError> {
        let n = self.try_node(node)?;
        if !n.kind.is_fixed() {
            return Err(GraphError::ExpectedFixed(node));
        }
        if n.kind.is_block_end() || !n.successors.is_empty() {
            return Err(GraphError::AlreadyConnected(node));
        }
        let nx = self.try_node(next)?;
        if !nx.kind.is_fixed() {
            return Err(GraphError::ExpectedFixed(next));
        }
        if !nx.predecessors.is_empty() || nx.kind.is_merge() || next == self.start {
            return Err(GraphError::AlreadyConnected(next));
        }
        self.nodes[node].successors.push(next);
        self.nodes[next].predecessors.push(node);
        Ok(())
    }

    ///Sets the successors of a control split. Each successor must be an unconnected `Begin`.
    pub fn set_successors(&mut self, split: NodeRef, successors: &[NodeRef]) -> Result<(), GraphError> {
        if !self.try_node(split)?.kind.is_control_split() {
            return Err(GraphError::MalformedControlFlow {
                node: split,
                reason: "only control splits can have multiple successors".to_owned(),
            });
        }
        if !self.nodes[split].successors.is_empty() {
            return Err(GraphError::AlreadyConnected(split));
        }
        for s in successors {
            let sn = self.try_node(*s)?;
            if sn.kind != NodeKind::Begin {
                return Err(GraphError::MalformedControlFlow {
                    node: *s,
                    reason: "successor of a control split must be a Begin".to_owned(),
                });
            }
            if !sn.predecessors.is_empty() {
                return Err(GraphError::AlreadyConnected(*s));
            }
        }
        for s in successors {
            self.nodes[split].successors.push(*s);
            self.nodes[*s].predecessors.push(split);
        }
        Ok(())
    }

    ///Appends `end` (an `End` or `LoopEnd`) as next predecessor of `merge`.
    pub fn add_end(&mut self, merge: NodeRef, end: NodeRef) -> Result<(), GraphError> {
        if !self.try_node(merge)?.kind.is_merge() {
            return Err(GraphError::ExpectedMerge { node: merge });
        }
        let e = self.try_node(end)?;
        let valid = match (&self.nodes[merge].kind, &e.kind) {
            (NodeKind::Merge, NodeKind::End) => true,
            (NodeKind::LoopBegin, NodeKind::End) => self.nodes[merge].predecessors.is_empty(),
            (NodeKind::LoopBegin, NodeKind::LoopEnd) => !self.nodes[merge].predecessors.is_empty(),
            _ => false,
        };
        if !valid {
            return Err(GraphError::MalformedControlFlow {
                node: end,
                reason: format!(
                    "{} can not end in {}",
                    e.kind.name(),
                    self.nodes[merge].kind.name()
                ),
            });
        }
        if !e.successors.is_empty() {
            return Err(GraphError::AlreadyConnected(end));
        }
        self.nodes[end].successors.push(merge);
        self.nodes[merge].predecessors.push(end);
        Ok(())
    }

    ///Removes a single-entry, single-exit fixed node from the control sequence by linking its predecessor to its successor.
    /// The node stays in the graph.
    pub fn splice_out(&mut self, node: NodeRef) -> Result<(), GraphError> {
        let n = self.try_node(node)?;
        if !n.kind.is_fixed_with_next() {
            return Err(GraphError::NotSpliceable(node));
        }
        if n.predecessors.len() != 1 || n.successors.len() != 1 {
            return Err(GraphError::NotConnected(node));
        }
        let (pred, succ) = (n.predecessors[0], n.successors[0]);
        self.swap_control_edge(pred, node, succ);
        let n = &mut self.nodes[node];
        n.predecessors.clear();
        n.successors.clear();
        Ok(())
    }

    ///Rewrites `pred -> old` and `old -> succ` into `pred -> succ`.
    fn swap_control_edge(&mut self, pred: NodeRef, old: NodeRef, succ: NodeRef) {
        for s in self.nodes[pred].successors.iter_mut() {
            if *s == old {
                *s = succ;
            }
        }
        for p in self.nodes[succ].predecessors.iter_mut() {
            if *p == old {
                *p = pred;
            }
        }
    }

    ///Puts the unconnected `new` in place of the connected `old` in the control sequence and redirects all usages of `old`
    /// to `new`. `old` stays in the graph, unconnected and unused.
    pub fn replace_fixed(&mut self, old: NodeRef, new: NodeRef) -> Result<(), GraphError> {
        let o = self.try_node(old)?;
        if !o.kind.is_fixed_with_next() {
            return Err(GraphError::NotSpliceable(old));
        }
        if o.predecessors.len() != 1 || o.successors.len() != 1 {
            return Err(GraphError::NotConnected(old));
        }
        let (pred, succ) = (o.predecessors[0], o.successors[0]);
        let n = self.try_node(new)?;
        if !n.kind.is_fixed_with_next() {
            return Err(GraphError::NotSpliceable(new));
        }
        if !n.predecessors.is_empty() || !n.successors.is_empty() {
            return Err(GraphError::AlreadyConnected(new));
        }
        self.swap_control_edge(pred, old, new);
        self.swap_control_edge(new, old, succ);
        let n = &mut self.nodes[new];
        n.predecessors.push(pred);
        n.successors.push(succ);
        let o = &mut self.nodes[old];
        o.predecessors.clear();
        o.successors.clear();
        self.replace_at_usages(old, new)
    }

    ///Inserts the unconnected `new` right before `anchor`.
    pub fn insert_before(&mut self, anchor: NodeRef, new: NodeRef) -> Result<(), GraphError> {
        let Some(pred) = self.predecessor(anchor) else {
            return Err(GraphError::NotConnected(anchor));
        };
        if self.nodes[pred].kind.is_control_split() || self.nodes[anchor].kind.is_merge() {
            return Err(GraphError::NotSpliceable(anchor));
        }
        let n = self.try_node(new)?;
        if !n.kind.is_fixed_with_next() {
            return Err(GraphError::NotSpliceable(new));
        }
        if !n.predecessors.is_empty() || !n.successors.is_empty() {
            return Err(GraphError::AlreadyConnected(new));
        }
        for s in self.nodes[pred].successors.iter_mut() {
            if *s == anchor {
                *s = new;
            }
        }
        self.nodes[new].predecessors.push(pred);
        self.nodes[new].successors.push(anchor);
        self.nodes[anchor].predecessors[0] = new;
        Ok(())
    }

    ///Removes the control split `split`, connecting its predecessor directly to `survivor`. The other successors
    /// are left without predecessor. The caller is responsible for killing them.
    pub fn remove_split(&mut self, split: NodeRef, survivor: NodeRef) -> Result<(), GraphError> {
        let s = self.try_node(split)?;
        if !s.kind.is_control_split() {
            return Err(GraphError::NotSpliceable(split));
        }
        if !s.successors.contains(&survivor) {
            return Err(GraphError::MalformedControlFlow {
                node: survivor,
                reason: "not a successor of the split".to_owned(),
            });
        }
        let pred = self.predecessor(split).ok_or(GraphError::NotConnected(split))?;
        let successors = s.successors.clone();
        for succ in successors {
            self.nodes[succ].predecessors.clear();
        }
        for s in self.nodes[pred].successors.iter_mut() {
            if *s == split {
                *s = survivor;
            }
        }
        self.nodes[survivor].predecessors.push(pred);
        let s = &mut self.nodes[split];
        s.predecessors.clear();
        s.successors.clear();
        self.kill(split)
    }

    ///Removes a merge that has a single end (or a loop header without back-edges). Its phis are replaced by their only input.
    ///
    /// Returns the nodes whose inputs or control neighbours changed.
    pub fn collapse_merge(&mut self, merge: NodeRef) -> Result<SmallColl<NodeRef>, GraphError> {
        let m = self.try_node(merge)?;
        if !m.kind.is_merge() {
            return Err(GraphError::ExpectedMerge { node: merge });
        }
        if m.predecessors.len() != 1 {
            return Err(GraphError::MalformedControlFlow {
                node: merge,
                reason: format!("cannot collapse merge with {} ends", m.predecessors.len()),
            });
        }
        let end = m.predecessors[0];
        let next = *m
            .successors
            .first()
            .ok_or(GraphError::NotConnected(merge))?;
        let end_pred = self.predecessor(end).ok_or(GraphError::NotConnected(end))?;

        let mut touched = SmallColl::new();
        let phis = self.phis_of(merge);
        for phi in phis.iter() {
            let value = *self.nodes[*phi]
                .inputs
                .first()
                .ok_or(GraphError::PhiArityMismatch {
                    phi: *phi,
                    merge,
                    inputs: 0,
                    predecessors: 1,
                })?;
            for u in self.unique_usages(*phi) {
                if u != *phi && !touched.contains(&u) {
                    touched.push(u);
                }
            }
            //A phi whose only input is itself can not be resolved.
            if value == *phi {
                return Err(GraphError::MalformedControlFlow {
                    node: *phi,
                    reason: "phi is its own only input".to_owned(),
                });
            }
            self.replace_at_usages(*phi, value)?;
        }
        for phi in phis {
            //Removes the anchor edge, the inputs stay alive through the redirected usages.
            let inputs = self.nodes[phi].inputs.clone();
            self.remove(phi)?;
            self.kill_unused_floating(&inputs)?;
        }
        touched.retain(|t| self.contains(*t));

        for s in self.nodes[end_pred].successors.iter_mut() {
            if *s == end {
                *s = next;
            }
        }
        self.nodes[next].predecessors.clear();
        self.nodes[next].predecessors.push(end_pred);
        for n in [end, merge] {
            let node = &mut self.nodes[n];
            node.predecessors.clear();
            node.successors.clear();
        }
        self.remove(end)?;
        self.remove(merge)?;
        touched.push(end_pred);
        touched.push(next);
        Ok(touched)
    }

    ///Removes `node` from the graph. Fails if the node still has usages or control edges.
    pub fn remove(&mut self, node: NodeRef) -> Result<Node, GraphError> {
        let n = self.try_node(node)?;
        if !n.usages.is_empty() {
            return Err(GraphError::NodeHasUsages {
                node,
                usages: n.usages.len(),
            });
        }
        if !n.predecessors.is_empty() || !n.successors.is_empty() {
            return Err(GraphError::StillConnected(node));
        }
        let removed = self
            .nodes
            .remove(node)
            .ok_or(GraphError::InvalidNode(node))?;
        for input in removed.all_inputs() {
            if let Some(i) = self.nodes.get_mut(input) {
                i.remove_usage(node);
            }
        }
        if let NodeKind::Constant(c) = &removed.kind {
            if self.constants.get(c) == Some(&node) {
                self.constants.remove(c);
            }
        }
        Ok(removed)
    }

    ///Removes `node` without checking for usages or control edges. Only for bulk removal, where all users are removed as well.
    pub(crate) fn remove_unchecked(&mut self, node: NodeRef) -> Option<Node> {
        let removed = self.nodes.remove(node)?;
        for input in removed.all_inputs() {
            if let Some(i) = self.nodes.get_mut(input) {
                i.remove_usage(node);
            }
        }
        if let NodeKind::Constant(c) = &removed.kind {
            if self.constants.get(c) == Some(&node) {
                self.constants.remove(c);
            }
        }
        Some(removed)
    }

    ///Removes `node` and every floating input that becomes unused by that, transitively.
    pub fn kill(&mut self, node: NodeRef) -> Result<(), GraphError> {
        let removed = self.remove(node)?;
        let inputs: SmallColl<NodeRef> = removed.all_inputs().collect();
        self.kill_unused_floating(&inputs)
    }

    ///Removes every floating node in `candidates` that has no usages, and their inputs that become unused.
    pub fn kill_unused_floating(&mut self, candidates: &[NodeRef]) -> Result<(), GraphError> {
        let mut worklist: Vec<NodeRef> = candidates.to_vec();
        while let Some(n) = worklist.pop() {
            let Some(node) = self.nodes.get(n) else {
                continue;
            };
            if !node.kind.is_floating() || !node.usages.is_empty() {
                continue;
            }
            let removed = self.remove(n)?;
            worklist.extend(removed.all_inputs());
        }
        Ok(())
    }

    ///Fixed nodes reachable from `Start` in reverse post order of the control edges.
    pub fn fixed_nodes(&self) -> Vec<NodeRef> {
        let mut order = self.fixed_post_order(self.start);
        order.reverse();
        order
    }

    ///Post order of the fixed nodes reachable from `entry` via control successors.
    pub fn fixed_post_order(&self, entry: NodeRef) -> Vec<NodeRef> {
        let mut post_order = Vec::with_capacity(self.nodes.len());
        if !self.nodes.contains_key(entry) {
            return post_order;
        }
        let mut visited = ahash::AHashSet::default();
        let mut stack = vec![(entry, 0usize)];
        visited.insert(entry);
        while let Some((node, idx)) = stack.pop() {
            let succs = &self.nodes[node].successors;
            if idx < succs.len() {
                stack.push((node, idx + 1));
                let s = succs[idx];
                if self.nodes.contains_key(s) && visited.insert(s) {
                    stack.push((s, 0));
                }
            } else {
                post_order.push(node);
            }
        }
        post_order
    }

    ///Human readable listing of all nodes.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let write_list = |out: &mut String, name: &str, list: &[NodeRef]| {
            if !list.is_empty() {
                let _ = write!(out, " {name}: {list:?}");
            }
        };
        for (nref, node) in self.nodes.iter() {
            let _ = write!(out, "{nref:?} {node}");
            write_list(&mut out, "in", &node.inputs);
            if let Some(a) = node.anchor {
                let _ = write!(out, " at: {a:?}");
            }
            write_list(&mut out, "pred", &node.predecessors);
            write_list(&mut out, "succ", &node.successors);
            out.push('\n');
        }
        out
    }
}
