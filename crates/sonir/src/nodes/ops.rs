/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 2024 Tendsin Mende
 */

//! Per-kind operation tables. Each node resolves its table once at creation, so the canonicalizer
//! can ask a node for its capabilities without matching on the kind again.

use crate::{err::GraphError, Graph, NodeRef};

use super::{canonical, NodeKind};

///Result of asking a node for its canonical form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Canonical {
    ///Node is already canonical.
    Unchanged,
    ///Node should be replaced by the given node. Might be the node itself, or a new node that is not yet connected.
    Replace(NodeRef),
    ///Node should be removed without replacement.
    Delete,
}

///Services a node's `simplify` hook can use to rewrite its neighbourhood.
pub trait SimplifierTool {
    fn graph(&mut self) -> &mut Graph;
    ///Schedules `node` to be (re)visited by the canonicalizer.
    fn add_to_worklist(&mut self, node: NodeRef);

    ///Kills the control-flow branch starting at `begin`. Merges that lost an end are revisited.
    fn delete_branch(&mut self, begin: NodeRef) -> Result<(), GraphError> {
        let touched = self.graph().kill_cfg(begin)?;
        for merge in touched {
            self.add_to_worklist(merge);
        }
        Ok(())
    }
}

pub type CanonicalizeFn = fn(&mut Graph, NodeRef) -> Result<Canonical, GraphError>;
pub type SimplifyFn = fn(&mut dyn SimplifierTool, NodeRef) -> Result<(), GraphError>;

///Capability table of a node kind.
pub struct NodeOps {
    pub name: &'static str,
    pub canonicalize: Option<CanonicalizeFn>,
    pub simplify: Option<SimplifyFn>,
}

impl std::fmt::Debug for NodeOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeOps")
            .field("name", &self.name)
            .field("canonicalize", &self.canonicalize.is_some())
            .field("simplify", &self.simplify.is_some())
            .finish()
    }
}

macro_rules! node_ops {
    ($static_name:ident, $name:literal) => {
        static $static_name: NodeOps = NodeOps {
            name: $name,
            canonicalize: None,
            simplify: None,
        };
    };
    ($static_name:ident, $name:literal, canon: $canon:path) => {
        static $static_name: NodeOps = NodeOps {
            name: $name,
            canonicalize: Some($canon),
            simplify: None,
        };
    };
    ($static_name:ident, $name:literal, simplify: $simp:path) => {
        static $static_name: NodeOps = NodeOps {
            name: $name,
            canonicalize: None,
            simplify: Some($simp),
        };
    };
}

node_ops!(START, "Start");
node_ops!(BEGIN, "Begin", simplify: canonical::simplify_begin);
node_ops!(END, "End");
node_ops!(MERGE, "Merge", simplify: canonical::simplify_merge);
node_ops!(LOOP_BEGIN, "LoopBegin", simplify: canonical::simplify_merge);
node_ops!(LOOP_END, "LoopEnd");
node_ops!(IF, "If", simplify: canonical::simplify_if);
node_ops!(RETURN, "Return");
node_ops!(NEW_INSTANCE, "NewInstance");
node_ops!(NEW_ARRAY, "NewArray");
node_ops!(LOAD_FIELD, "LoadField");
node_ops!(STORE_FIELD, "StoreField");
node_ops!(LOAD_INDEXED, "LoadIndexed");
node_ops!(STORE_INDEXED, "StoreIndexed");
node_ops!(ARRAY_LENGTH, "ArrayLength", canon: canonical::array_length);
node_ops!(NULL_CHECK, "NullCheck", canon: canonical::null_check);
node_ops!(MONITOR_ENTER, "MonitorEnter");
node_ops!(MONITOR_EXIT, "MonitorExit");
node_ops!(INVOKE, "Invoke");
node_ops!(MEMORY_BARRIER, "MemoryBarrier");
node_ops!(FRAME_STATE, "FrameState");
node_ops!(CONSTANT, "Constant");
node_ops!(PARAMETER, "Parameter");
node_ops!(BINARY, "Binary", canon: canonical::binary);
node_ops!(COMPARE, "Compare", canon: canonical::compare);
node_ops!(IS_NULL, "IsNull", canon: canonical::is_null);
node_ops!(INSTANCE_OF, "InstanceOf", canon: canonical::instance_of);
node_ops!(PHI, "Phi", canon: canonical::phi);
node_ops!(FLOATING_READ, "FloatingRead");
node_ops!(VIRTUAL_OBJECT, "VirtualObject");
node_ops!(VIRTUAL_OBJECT_STATE, "VirtualObjectState");

pub(crate) fn ops_for(kind: &NodeKind) -> &'static NodeOps {
    match kind {
        NodeKind::Start => &START,
        NodeKind::Begin => &BEGIN,
        NodeKind::End => &END,
        NodeKind::Merge => &MERGE,
        NodeKind::LoopBegin => &LOOP_BEGIN,
        NodeKind::LoopEnd => &LOOP_END,
        NodeKind::If => &IF,
        NodeKind::Return => &RETURN,
        NodeKind::NewInstance(_) => &NEW_INSTANCE,
        NodeKind::NewArray { .. } => &NEW_ARRAY,
        NodeKind::LoadField(_) => &LOAD_FIELD,
        NodeKind::StoreField(_) => &STORE_FIELD,
        NodeKind::LoadIndexed(_) => &LOAD_INDEXED,
        NodeKind::StoreIndexed(_) => &STORE_INDEXED,
        NodeKind::ArrayLength => &ARRAY_LENGTH,
        NodeKind::NullCheck => &NULL_CHECK,
        NodeKind::MonitorEnter => &MONITOR_ENTER,
        NodeKind::MonitorExit => &MONITOR_EXIT,
        NodeKind::Invoke(_) => &INVOKE,
        NodeKind::MemoryBarrier => &MEMORY_BARRIER,
        NodeKind::FrameState { .. } => &FRAME_STATE,
        NodeKind::Constant(_) => &CONSTANT,
        NodeKind::Parameter { .. } => &PARAMETER,
        NodeKind::Binary(_) => &BINARY,
        NodeKind::Compare(_) => &COMPARE,
        NodeKind::IsNull => &IS_NULL,
        NodeKind::InstanceOf(_) => &INSTANCE_OF,
        NodeKind::Phi(_) => &PHI,
        NodeKind::FloatingRead(_) => &FLOATING_READ,
        NodeKind::VirtualObject(_) => &VIRTUAL_OBJECT,
        NodeKind::VirtualObjectState => &VIRTUAL_OBJECT_STATE,
    }
}
