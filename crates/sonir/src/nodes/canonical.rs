/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 2024 Tendsin Mende
 */

//! Built-in canonicalization and simplification rules of the node kinds.
//!
//! `canonicalize` rules only look at the node and its inputs, and might create new, unconnected nodes.
//! `simplify` rules are allowed to rewrite the control-flow around the node through a [SimplifierTool].

use crate::{err::GraphError, Graph, NodeRef, SmallColl};

use super::{BinaryOp, Canonical, Constant, NodeKind, SimplifierTool, VirtualShape};

pub(crate) fn binary(graph: &mut Graph, node: NodeRef) -> Result<Canonical, GraphError> {
    let NodeKind::Binary(op) = *graph.kind(node) else {
        return Ok(Canonical::Unchanged);
    };
    let (x, y) = (graph.node(node).inputs[0], graph.node(node).inputs[1]);

    let replacement = match (graph.as_int(x), graph.as_int(y)) {
        (Some(a), Some(b)) => graph.int(op.fold(a, b)),
        (_, Some(0)) if matches!(op, BinaryOp::Add | BinaryOp::Sub | BinaryOp::Or | BinaryOp::Xor) => x,
        (Some(0), _) if matches!(op, BinaryOp::Add | BinaryOp::Or | BinaryOp::Xor) => y,
        (_, Some(1)) if op == BinaryOp::Mul => x,
        (Some(1), _) if op == BinaryOp::Mul => y,
        (Some(0), _) | (_, Some(0)) if matches!(op, BinaryOp::Mul | BinaryOp::And) => graph.int(0),
        _ if x == y && matches!(op, BinaryOp::Sub | BinaryOp::Xor) => graph.int(0),
        _ if x == y && matches!(op, BinaryOp::And | BinaryOp::Or) => x,
        _ => return Ok(Canonical::Unchanged),
    };
    Ok(Canonical::Replace(replacement))
}

pub(crate) fn compare(graph: &mut Graph, node: NodeRef) -> Result<Canonical, GraphError> {
    let NodeKind::Compare(op) = *graph.kind(node) else {
        return Ok(Canonical::Unchanged);
    };
    let (x, y) = (graph.node(node).inputs[0], graph.node(node).inputs[1]);
    if x == y {
        return Ok(Canonical::Replace(graph.bool(op.reflexive())));
    }

    let folded = match (
        graph.kind(x).as_constant().copied(),
        graph.kind(y).as_constant().copied(),
    ) {
        (Some(Constant::Int(a)), Some(Constant::Int(b))) => Some(op.fold(a, b)),
        (Some(a), Some(b)) => match op {
            super::CompareOp::Eq => Some(a == b),
            super::CompareOp::Ne => Some(a != b),
            _ => None,
        },
        _ => {
            //Two distinct allocations, or an allocation and null are never equal.
            let x_fresh = is_fresh_object(graph, x);
            let y_fresh = is_fresh_object(graph, y);
            let x_null = graph.kind(x).as_constant() == Some(&Constant::Null);
            let y_null = graph.kind(y).as_constant() == Some(&Constant::Null);
            if (x_fresh && (y_fresh || y_null)) || (y_fresh && x_null) {
                match op {
                    super::CompareOp::Eq => Some(false),
                    super::CompareOp::Ne => Some(true),
                    _ => None,
                }
            } else {
                None
            }
        }
    };

    if let Some(value) = folded {
        Ok(Canonical::Replace(graph.bool(value)))
    } else {
        Ok(Canonical::Unchanged)
    }
}

fn is_fresh_object(graph: &Graph, node: NodeRef) -> bool {
    graph.kind(node).is_allocation() || matches!(graph.kind(node), NodeKind::VirtualObject(_))
}

pub(crate) fn is_null(graph: &mut Graph, node: NodeRef) -> Result<Canonical, GraphError> {
    let obj = graph.node(node).inputs[0];
    let value = if graph.kind(obj).as_constant() == Some(&Constant::Null) {
        true
    } else if is_fresh_object(graph, obj) || graph.node(obj).stamp.is_non_null() {
        false
    } else {
        return Ok(Canonical::Unchanged);
    };
    Ok(Canonical::Replace(graph.bool(value)))
}

pub(crate) fn instance_of(graph: &mut Graph, node: NodeRef) -> Result<Canonical, GraphError> {
    let NodeKind::InstanceOf(class) = *graph.kind(node) else {
        return Ok(Canonical::Unchanged);
    };
    let obj = graph.node(node).inputs[0];
    if graph.kind(obj).as_constant() == Some(&Constant::Null) {
        return Ok(Canonical::Replace(graph.bool(false)));
    }
    let stamp = graph.node(obj).stamp;
    match stamp.exact_class() {
        Some(exact) if stamp.is_non_null() => Ok(Canonical::Replace(graph.bool(exact == class))),
        _ => Ok(Canonical::Unchanged),
    }
}

///A closed phi whose inputs are all the same value (ignoring self references) is that value.
pub(crate) fn phi(graph: &mut Graph, node: NodeRef) -> Result<Canonical, GraphError> {
    if !graph.node(node).is_closed_phi() {
        return Ok(Canonical::Unchanged);
    }
    let mut unique = None;
    for input in graph.node(node).inputs.iter() {
        if *input == node {
            continue;
        }
        match unique {
            None => unique = Some(*input),
            Some(u) if u == *input => {}
            Some(_) => return Ok(Canonical::Unchanged),
        }
    }

    if let Some(value) = unique {
        Ok(Canonical::Replace(value))
    } else {
        Ok(Canonical::Unchanged)
    }
}

pub(crate) fn null_check(graph: &mut Graph, node: NodeRef) -> Result<Canonical, GraphError> {
    let obj = graph.node(node).inputs[0];
    if is_fresh_object(graph, obj) || graph.node(obj).stamp.is_non_null() {
        Ok(Canonical::Delete)
    } else {
        Ok(Canonical::Unchanged)
    }
}

pub(crate) fn array_length(graph: &mut Graph, node: NodeRef) -> Result<Canonical, GraphError> {
    let arr = graph.node(node).inputs[0];
    let length = match graph.kind(arr) {
        NodeKind::NewArray { length, .. } => *length,
        NodeKind::VirtualObject(VirtualShape::Array { length, .. }) => *length,
        _ => return Ok(Canonical::Unchanged),
    };
    Ok(Canonical::Replace(graph.int(length as i64)))
}

///Folds an `If` with a constant condition. The untaken branch is killed.
pub(crate) fn simplify_if(tool: &mut dyn SimplifierTool, node: NodeRef) -> Result<(), GraphError> {
    let graph = tool.graph();
    let cond = graph.node(node).inputs[0];
    let Some(value) = graph.as_bool(cond) else {
        return Ok(());
    };
    let successors = graph.node(node).successors.clone();
    let (taken, dead) = if value {
        (successors[0], successors[1])
    } else {
        (successors[1], successors[0])
    };

    graph.remove_split(node, taken)?;
    tool.delete_branch(dead)?;
    tool.add_to_worklist(taken);
    Ok(())
}

///A `Begin` that is not the successor of a split is redundant.
pub(crate) fn simplify_begin(
    tool: &mut dyn SimplifierTool,
    node: NodeRef,
) -> Result<(), GraphError> {
    let graph = tool.graph();
    let Some(pred) = graph.predecessor(node) else {
        return Ok(());
    };
    if graph.kind(pred).is_control_split() || !graph.node(node).usages.is_empty() {
        return Ok(());
    }
    graph.splice_out(node)?;
    graph.remove(node)?;
    Ok(())
}

///Collapses merges with a single forward end, and loops without back-edges.
pub(crate) fn simplify_merge(
    tool: &mut dyn SimplifierTool,
    node: NodeRef,
) -> Result<(), GraphError> {
    let graph = tool.graph();
    let preds = graph.node(node).predecessors.len();
    match preds {
        0 if node != graph.start() => tool.delete_branch(node),
        1 => {
            let touched: SmallColl<NodeRef> = graph.collapse_merge(node)?;
            for t in touched {
                tool.add_to_worklist(t);
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nodes::{ClassId, CompareOp, ObjectShape, PhiKind};

    #[test]
    fn fold_add() {
        let mut graph = Graph::new();
        let a = graph.int(2);
        let b = graph.int(3);
        let add = graph.add(NodeKind::Binary(BinaryOp::Add), &[a, b]);
        let Canonical::Replace(r) = binary(&mut graph, add).unwrap() else {
            panic!("expected replacement");
        };
        assert!(graph.as_int(r) == Some(5));
    }

    #[test]
    fn add_zero_is_identity() {
        let mut graph = Graph::new();
        let p = graph.parameter(0, crate::nodes::ValueKind::Int);
        let z = graph.int(0);
        let add = graph.add(NodeKind::Binary(BinaryOp::Add), &[p, z]);
        assert!(binary(&mut graph, add).unwrap() == Canonical::Replace(p));
    }

    #[test]
    fn compare_self() {
        let mut graph = Graph::new();
        let p = graph.parameter(0, crate::nodes::ValueKind::Int);
        let lt = graph.add(NodeKind::Compare(CompareOp::Lt), &[p, p]);
        let Canonical::Replace(r) = compare(&mut graph, lt).unwrap() else {
            panic!("expected replacement");
        };
        assert!(graph.as_bool(r) == Some(false));
    }

    #[test]
    fn instance_of_exact_class() {
        let mut graph = Graph::new();
        let obj = graph.add(NodeKind::NewInstance(ObjectShape::new(7)), &[]);
        let test_hit = graph.add(NodeKind::InstanceOf(ClassId(7)), &[obj]);
        let test_miss = graph.add(NodeKind::InstanceOf(ClassId(8)), &[obj]);
        let Canonical::Replace(hit) = instance_of(&mut graph, test_hit).unwrap() else {
            panic!("expected replacement");
        };
        let Canonical::Replace(miss) = instance_of(&mut graph, test_miss).unwrap() else {
            panic!("expected replacement");
        };
        assert!(graph.as_bool(hit) == Some(true));
        assert!(graph.as_bool(miss) == Some(false));
    }

    #[test]
    fn open_phi_is_not_touched() {
        let mut graph = Graph::new();
        let merge = graph.add(NodeKind::Merge, &[]);
        let e0 = graph.add(NodeKind::End, &[]);
        let e1 = graph.add(NodeKind::End, &[]);
        graph.add_end(merge, e0).unwrap();
        graph.add_end(merge, e1).unwrap();
        let v = graph.int(1);
        let phi = graph.add_phi(merge, PhiKind::Value, &[v]).unwrap();
        assert!(super::phi(&mut graph, phi).unwrap() == Canonical::Unchanged);
        graph.add_phi_input(phi, v).unwrap();
        assert!(super::phi(&mut graph, phi).unwrap() == Canonical::Replace(v));
    }
}
