/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 2024 Tendsin Mende
 */

//! Graphviz export. Control edges are drawn red, data edges black and phi anchors as dashed blue edges.

use graphviz_rust::{
    dot_structures::{Attribute, Edge, EdgeTy, Graph as DotGraph, Id, Node, NodeId, Stmt, Vertex},
    printer::{DotPrinter, PrinterContext},
};
use slotmap::Key;

use crate::{Graph, NodeRef};

fn node_id(node: NodeRef) -> NodeId {
    NodeId(Id::Plain(format!("n{}", node.data().as_ffi())), None)
}

fn attrib(key: &str, value: &str) -> Attribute {
    Attribute(Id::Plain(key.to_owned()), Id::Escaped(format!("\"{value}\"")))
}

fn edge(from: NodeRef, to: NodeRef, attributes: Vec<Attribute>) -> Stmt {
    Stmt::Edge(Edge {
        ty: EdgeTy::Pair(Vertex::N(node_id(from)), Vertex::N(node_id(to))),
        attributes,
    })
}

impl Graph {
    ///Builds the graphviz representation of the whole graph.
    pub fn to_dot(&self, name: &str) -> DotGraph {
        let mut stmts = Vec::with_capacity(self.nodes.len() * 2);
        for (nref, node) in self.nodes.iter() {
            let shape = if node.is_fixed() { "box" } else { "ellipse" };
            stmts.push(Stmt::Node(Node {
                id: node_id(nref),
                attributes: vec![
                    attrib("label", &format!("{nref:?}\n{node}")),
                    attrib("shape", shape),
                ],
            }));

            for s in node.successors.iter() {
                stmts.push(edge(nref, *s, vec![attrib("color", "red")]));
            }
            for (idx, input) in node.inputs.iter().enumerate() {
                stmts.push(edge(*input, nref, vec![attrib("label", &idx.to_string())]));
            }
            if let Some(anchor) = node.anchor {
                stmts.push(edge(
                    anchor,
                    nref,
                    vec![attrib("color", "blue"), attrib("style", "dashed")],
                ));
            }
        }

        DotGraph::DiGraph {
            id: Id::Plain(name.to_owned()),
            strict: false,
            stmts,
        }
    }

    ///The graph in dot syntax.
    pub fn to_dot_string(&self, name: &str) -> String {
        self.to_dot(name).print(&mut PrinterContext::default())
    }
}

#[cfg(test)]
mod test {
    use crate::{builder::GraphBuilder, nodes::ValueKind, Graph};

    #[test]
    fn dot_contains_all_nodes() {
        let mut graph = Graph::new();
        let mut builder = GraphBuilder::new(&mut graph);
        let p = builder.parameter(0, ValueKind::Int);
        builder.ret(Some(p)).unwrap();
        let dot = graph.to_dot_string("test");
        assert!(dot.contains("Return"));
        assert!(dot.contains("Param(0)"));
    }
}
