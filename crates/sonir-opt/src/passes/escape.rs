/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 2024 Tendsin Mende
 */

//! Escape analysis driver.
//!
//! For each allocation the usages are classified. If none of them lets the object escape, and no call still receives
//! the object, the allocation is replaced by a [VirtualObject](NodeKind::VirtualObject) (see [fixup]). Calls that
//! receive the object are handed to the [Inliner], after which the allocation is classified again.

use std::collections::VecDeque;

use sonir::{
    nodes::{NodeKind, VirtualShape},
    Graph, NodeRef,
};

use crate::{
    inliner::{InlineContext, InlineOutcome, Inliner},
    stats::Counter,
    OptError, Optimizer,
};

mod fixup;

const PASS: &str = "escape-analysis";

///What happened to a single allocation.
#[derive(Debug, Clone, PartialEq)]
pub enum EscapeOutcome {
    ///Replaced by `virtual_object`.
    Eliminated {
        allocation: NodeRef,
        virtual_object: NodeRef,
    },
    ///The allocation escapes through `via`.
    Escapes { allocation: NodeRef, via: NodeRef },
    ///Not worth inlining the calls that receive the allocation.
    TooLight { allocation: NodeRef, weight: f64 },
    RetriesExhausted { allocation: NodeRef },
    ///The allocation was removed while inlining.
    Deleted { allocation: NodeRef },
    InlineDeclined { allocation: NodeRef, call: NodeRef },
}

impl EscapeOutcome {
    pub fn is_eliminated(&self) -> bool {
        matches!(self, EscapeOutcome::Eliminated { .. })
    }
}

///Usages of an allocation, sorted by what they mean for escape analysis.
#[derive(Debug, Default)]
struct Usages {
    ///First usage that lets the allocation escape.
    escaping: Option<NodeRef>,
    ///Calls that receive the allocation.
    candidates: Vec<NodeRef>,
    ///Execution weight of all usages that neither escape nor call.
    weight: f64,
}

fn shape_of(kind: &NodeKind) -> Option<VirtualShape> {
    match kind {
        NodeKind::NewInstance(shape) => Some(VirtualShape::Instance(shape.clone())),
        NodeKind::NewArray { elem, length } => Some(VirtualShape::Array {
            elem: *elem,
            length: *length,
        }),
        _ => None,
    }
}

///Index of the constant, in-bounds element `index` of `shape`.
fn constant_index(graph: &Graph, shape: &VirtualShape, index: NodeRef) -> Option<usize> {
    let VirtualShape::Array { length, .. } = shape else {
        return None;
    };
    let index = usize::try_from(graph.as_int(index)?).ok()?;
    if index < *length {
        Some(index)
    } else {
        None
    }
}

///Decides whether `user` can consume `alloc` without letting it escape.
fn is_benign(graph: &Graph, alloc: NodeRef, shape: &VirtualShape, user: NodeRef) -> bool {
    let inputs = graph.inputs(user);
    let receiver = inputs.first() == Some(&alloc);
    let elem_matches = |k: &sonir::nodes::ValueKind| matches!(shape, VirtualShape::Array { elem, .. } if elem == k);

    match graph.kind(user) {
        NodeKind::NullCheck
        | NodeKind::MonitorEnter
        | NodeKind::MonitorExit
        | NodeKind::IsNull
        | NodeKind::InstanceOf(_)
        | NodeKind::FrameState { .. }
        | NodeKind::VirtualObjectState => true,
        NodeKind::ArrayLength => matches!(shape, VirtualShape::Array { .. }),
        NodeKind::LoadField(f) => {
            receiver
                && matches!(shape, VirtualShape::Instance(s) if s.field_index(f.id).is_some())
        }
        NodeKind::StoreField(f) => {
            receiver
                && inputs[1] != alloc
                && matches!(shape, VirtualShape::Instance(s) if s.field_index(f.id).is_some())
        }
        NodeKind::LoadIndexed(k) => {
            receiver && elem_matches(k) && constant_index(graph, shape, inputs[1]).is_some()
        }
        NodeKind::StoreIndexed(k) => {
            receiver
                && inputs[2] != alloc
                && elem_matches(k)
                && constant_index(graph, shape, inputs[1]).is_some()
        }
        _ => false,
    }
}

fn classify(graph: &Graph, alloc: NodeRef, shape: &VirtualShape) -> Usages {
    let mut usages = Usages::default();
    for user in graph.unique_usages(alloc) {
        if is_benign(graph, alloc, shape, user) {
            let node = graph.node(user);
            usages.weight += if node.is_fixed() {
                node.frequency.unwrap_or(1.0)
            } else {
                1.0
            };
        } else if matches!(graph.kind(user), NodeKind::Invoke(_)) {
            usages.candidates.push(user);
        } else {
            usages.escaping = Some(user);
            break;
        }
    }
    usages
}

impl Optimizer {
    ///Tries to remove every allocation of the graph. Returns what happened to each allocation, in program order. Allocations
    /// added by the inliner are appended.
    pub fn escape_analysis(
        &mut self,
        inliner: &mut dyn Inliner,
    ) -> Result<Vec<EscapeOutcome>, OptError> {
        let mut allocations: VecDeque<NodeRef> = self
            .graph
            .fixed_nodes()
            .into_iter()
            .filter(|n| self.graph.kind(*n).is_allocation())
            .collect();

        let mut outcomes = Vec::with_capacity(allocations.len());
        while let Some(alloc) = allocations.pop_front() {
            let outcome = self.escape_allocation(alloc, inliner, &mut allocations)?;
            #[cfg(feature = "log")]
            log::debug!("escape analysis of {alloc:?}: {outcome:?}");
            outcomes.push(outcome);
        }

        #[cfg(feature = "log")]
        log::info!(
            "escape analysis: {} of {} allocations removed",
            outcomes.iter().filter(|o| o.is_eliminated()).count(),
            outcomes.len()
        );

        self.verify_after(PASS)?;
        Ok(outcomes)
    }

    fn escape_allocation(
        &mut self,
        alloc: NodeRef,
        inliner: &mut dyn Inliner,
        allocations: &mut VecDeque<NodeRef>,
    ) -> Result<EscapeOutcome, OptError> {
        let mut attempt = 0;
        loop {
            //Inlining and dead code elimination might have removed the allocation.
            let Some(shape) = self.graph.get(alloc).and_then(|n| shape_of(n.kind())) else {
                return Ok(EscapeOutcome::Deleted { allocation: alloc });
            };

            let usages = classify(&self.graph, alloc, &shape);
            if let Some(via) = usages.escaping {
                return Ok(EscapeOutcome::Escapes {
                    allocation: alloc,
                    via,
                });
            }
            if usages.candidates.is_empty() {
                let virtual_object = fixup::eliminate(&mut self.graph, &mut self.stats, alloc, shape)?;
                return Ok(EscapeOutcome::Eliminated {
                    allocation: alloc,
                    virtual_object,
                });
            }
            if usages.weight < self.config.escape_min_weight {
                return Ok(EscapeOutcome::TooLight {
                    allocation: alloc,
                    weight: usages.weight,
                });
            }
            if attempt >= self.config.escape_max_retries {
                return Ok(EscapeOutcome::RetriesExhausted { allocation: alloc });
            }
            attempt += 1;

            let context = InlineContext {
                allocation: alloc,
                weight: usages.weight,
                attempt,
            };
            let mut new_nodes = Vec::new();
            let mut declined = None;
            for call in usages.candidates {
                if !self.graph.contains(call) {
                    continue;
                }
                self.stats.increment(Counter::EscapeInlineAttempts);
                match inliner.inline(&mut self.graph, call, &context)? {
                    InlineOutcome::Inlined { new_nodes: added } => new_nodes.extend(added),
                    InlineOutcome::Declined => {
                        declined = Some(call);
                        break;
                    }
                }
            }

            let removed = self.graph.dead_node_elimination()?;
            self.stats
                .add(Counter::DeadNodesRemoved, removed.len() as u64);
            new_nodes.retain(|n| self.graph.contains(*n));
            self.canonicalize_nodes(&new_nodes)?;
            //Allocations of the inlined body are analysed later in the same run.
            for node in new_nodes {
                if self.graph.get(node).is_some_and(|n| n.kind().is_allocation())
                    && !allocations.contains(&node)
                {
                    allocations.push_back(node);
                }
            }

            if let Some(call) = declined {
                return Ok(EscapeOutcome::InlineDeclined {
                    allocation: alloc,
                    call,
                });
            }
        }
    }
}

#[cfg(test)]
mod test {
    use sonir::{
        builder::GraphBuilder,
        nodes::{CallTarget, FieldDesc, ObjectShape, ValueKind},
    };

    use super::*;
    use crate::NoInline;

    fn point() -> (ObjectShape, FieldDesc, FieldDesc) {
        let x = FieldDesc::new(0, ValueKind::Int);
        let y = FieldDesc::new(1, ValueKind::Int);
        (ObjectShape::new(1).with_field(x).with_field(y), x, y)
    }

    #[test]
    fn stored_allocation_escapes() {
        let (shape, x, _y) = point();
        let holder = FieldDesc::new(5, ValueKind::Object);
        let mut graph = Graph::new();
        let other = graph.parameter(0, ValueKind::Object);
        let mut b = GraphBuilder::new(&mut graph);
        let obj = b.new_instance(shape).unwrap();
        let one = b.int(1);
        b.store_field(obj, x, one).unwrap();
        let leak = b.store_field(other, holder, obj).unwrap();
        b.ret(None).unwrap();

        let mut opt = Optimizer::new(graph);
        let outcomes = opt.escape_analysis(&mut NoInline).unwrap();
        assert!(
            outcomes
                == vec![EscapeOutcome::Escapes {
                    allocation: obj,
                    via: leak
                }]
        );
        assert!(opt.graph().contains(obj));
    }

    #[test]
    fn out_of_bounds_index_escapes() {
        let mut graph = Graph::new();
        let mut b = GraphBuilder::new(&mut graph);
        let arr = b.new_array(ValueKind::Int, 2).unwrap();
        let idx = b.int(2);
        let load = b.load_indexed(arr, ValueKind::Int, idx).unwrap();
        b.ret(Some(load)).unwrap();

        let mut opt = Optimizer::new(graph);
        let outcomes = opt.escape_analysis(&mut NoInline).unwrap();
        assert!(matches!(outcomes[0], EscapeOutcome::Escapes { via, .. } if via == load));
    }

    #[test]
    fn light_call_is_not_inlined() {
        let (shape, _x, _y) = point();
        let mut graph = Graph::new();
        let mut b = GraphBuilder::new(&mut graph);
        let obj = b.new_instance(shape).unwrap();
        b.invoke(CallTarget::new("consume", None), &[obj]).unwrap();
        b.ret(None).unwrap();

        let mut opt = Optimizer::new(graph);
        let outcomes = opt.escape_analysis(&mut NoInline).unwrap();
        assert!(matches!(outcomes[0], EscapeOutcome::TooLight { weight, .. } if weight == 0.0));
        assert!(opt.stats.get(Counter::EscapeInlineAttempts) == 0);
    }

    #[test]
    fn array_is_virtualized() {
        let mut graph = Graph::new();
        let mut b = GraphBuilder::new(&mut graph);
        let arr = b.new_array(ValueKind::Int, 3).unwrap();
        let idx = b.int(1);
        let value = b.int(42);
        b.store_indexed(arr, ValueKind::Int, idx, value).unwrap();
        let len = b.append(NodeKind::ArrayLength, &[arr]).unwrap();
        let load = b.load_indexed(arr, ValueKind::Int, idx).unwrap();
        let sum = b.floating(NodeKind::Binary(sonir::nodes::BinaryOp::Add), &[len, load]);
        let ret = b.ret(Some(sum)).unwrap();

        let mut opt = Optimizer::new(graph);
        let outcomes = opt.escape_analysis(&mut NoInline).unwrap();
        assert!(outcomes[0].is_eliminated());
        opt.canonicalize().unwrap();
        let graph = opt.graph();
        assert!(graph.as_int(graph.inputs(ret)[0]) == Some(45));
        assert!(graph.next(graph.start()) == Some(ret));
        assert!(opt.stats.get(Counter::StoreRemoved) == 1);
        assert!(opt.stats.get(Counter::LoadRemoved) == 1);
        assert!(opt.stats.get(Counter::OtherRemoved) == 1);
    }
}
