/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 2024 Tendsin Mende
 */

//! Node definitions of the sea-of-nodes graph.
//!
//! Nodes are split into two classes:
//!
//! - _fixed_ nodes live in the control sequence. They have control predecessors and successors.
//! - _floating_ nodes only have data inputs. Their position is implied by those inputs.
//!
//! Control edges and data edges are kept separately on each [Node]. Data inputs are mirrored by the usage
//! list of the input, control edges are mirrored by the predecessor list of the successor.

use std::fmt::Display;

use smallvec::SmallVec;

use crate::{NodeRef, SmallColl};

mod canonical;
mod ops;
mod phi;
mod stamp;

pub use ops::{Canonical, NodeOps, SimplifierTool};
pub use phi::{PhiKind, PhiNode, PhiState};
pub use stamp::Stamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

///Kind of a value that can be stored in a field or array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueKind {
    Int,
    Bool,
    Object,
}

impl ValueKind {
    ///The value a freshly allocated field or array element of this kind holds.
    pub fn default_constant(&self) -> Constant {
        match self {
            ValueKind::Int => Constant::Int(0),
            ValueKind::Bool => Constant::Bool(false),
            ValueKind::Object => Constant::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Constant {
    Int(i64),
    Bool(bool),
    Null,
}

impl Constant {
    pub fn kind(&self) -> ValueKind {
        match self {
            Constant::Int(_) => ValueKind::Int,
            Constant::Bool(_) => ValueKind::Bool,
            Constant::Null => ValueKind::Object,
        }
    }
}

impl Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constant::Int(i) => write!(f, "{i}"),
            Constant::Bool(b) => write!(f, "{b}"),
            Constant::Null => write!(f, "null"),
        }
    }
}

///An abstract memory location class. Two accesses may alias only if their locations are equal, or one of them is [Any](LocationIdentity::Any).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LocationIdentity {
    ///Wildcard, aliases every other location.
    Any,
    ///Locations that are written exactly once, at initialization.
    Final,
    Field(FieldId),
    ArrayElement(ValueKind),
}

impl LocationIdentity {
    pub fn is_any(&self) -> bool {
        *self == LocationIdentity::Any
    }

    ///True if an access to `self` might observe an access to `other`.
    pub fn may_alias(&self, other: &LocationIdentity) -> bool {
        self.is_any() || other.is_any() || self == other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldDesc {
    pub id: FieldId,
    pub kind: ValueKind,
    pub is_final: bool,
}

impl FieldDesc {
    pub fn new(id: u32, kind: ValueKind) -> Self {
        FieldDesc {
            id: FieldId(id),
            kind,
            is_final: false,
        }
    }

    pub fn new_final(id: u32, kind: ValueKind) -> Self {
        FieldDesc {
            id: FieldId(id),
            kind,
            is_final: true,
        }
    }

    pub fn location(&self) -> LocationIdentity {
        if self.is_final {
            LocationIdentity::Final
        } else {
            LocationIdentity::Field(self.id)
        }
    }
}

///Layout of an instance class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectShape {
    pub class: ClassId,
    pub fields: SmallColl<FieldDesc>,
}

impl ObjectShape {
    pub fn new(class: u32) -> Self {
        ObjectShape {
            class: ClassId(class),
            fields: SmallColl::new(),
        }
    }

    pub fn with_field(mut self, field: FieldDesc) -> Self {
        self.fields.push(field);
        self
    }

    pub fn field_index(&self, id: FieldId) -> Option<usize> {
        self.fields.iter().position(|f| f.id == id)
    }
}

///Shape of an allocation after it was replaced by its virtual description.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VirtualShape {
    Instance(ObjectShape),
    Array { elem: ValueKind, length: usize },
}

impl VirtualShape {
    ///Number of tracked entries (fields or elements).
    pub fn entry_count(&self) -> usize {
        match self {
            VirtualShape::Instance(shape) => shape.fields.len(),
            VirtualShape::Array { length, .. } => *length,
        }
    }

    pub fn entry_kind(&self, index: usize) -> ValueKind {
        match self {
            VirtualShape::Instance(shape) => shape.fields[index].kind,
            VirtualShape::Array { elem, .. } => *elem,
        }
    }

    pub fn class(&self) -> Option<ClassId> {
        match self {
            VirtualShape::Instance(shape) => Some(shape.class),
            VirtualShape::Array { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
}

impl BinaryOp {
    pub fn fold(&self, a: i64, b: i64) -> i64 {
        match self {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::And => a & b,
            BinaryOp::Or => a | b,
            BinaryOp::Xor => a ^ b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
}

impl CompareOp {
    pub fn fold(&self, a: i64, b: i64) -> bool {
        match self {
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
            CompareOp::Lt => a < b,
            CompareOp::Le => a <= b,
        }
    }

    ///Result of comparing a value with itself.
    pub fn reflexive(&self) -> bool {
        matches!(self, CompareOp::Eq | CompareOp::Le)
    }
}

///Static description of a call site.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallTarget {
    pub name: String,
    ///Kind of the returned value, if any.
    pub returns: Option<ValueKind>,
}

impl CallTarget {
    pub fn new(name: impl Into<String>, returns: Option<ValueKind>) -> Self {
        CallTarget {
            name: name.into(),
            returns,
        }
    }
}

///What a [FloatingRead](NodeKind::FloatingRead) loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadAccess {
    ///Inputs: `[object, dependency]`
    Field(FieldDesc),
    ///Inputs: `[array, index, dependency]`
    Indexed(ValueKind),
}

impl ReadAccess {
    pub fn kind(&self) -> ValueKind {
        match self {
            ReadAccess::Field(f) => f.kind,
            ReadAccess::Indexed(k) => *k,
        }
    }

    pub fn location(&self) -> LocationIdentity {
        match self {
            ReadAccess::Field(f) => f.location(),
            ReadAccess::Indexed(k) => LocationIdentity::ArrayElement(*k),
        }
    }
}

///How a node interacts with memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAccess {
    None,
    Read(LocationIdentity),
    Write(LocationIdentity),
    ///Kills every location. Acts like a write to [Any](LocationIdentity::Any).
    Checkpoint,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    //  Fixed, control
    ///Entry of the graph. Also the initial memory checkpoint.
    Start,
    ///Successor of a control split.
    Begin,
    ///Forward predecessor of a [Merge](NodeKind::Merge) or [LoopBegin](NodeKind::LoopBegin).
    End,
    Merge,
    LoopBegin,
    ///Back-edge of a loop.
    LoopEnd,
    ///Two-way split. Successors: `[true_begin, false_begin]`, input: `[condition]`.
    If,
    ///Inputs: `[value]` or `[]`.
    Return,

    //  Fixed, with next
    NewInstance(ObjectShape),
    ///Inputs: `[]`. The length is statically known.
    NewArray {
        elem: ValueKind,
        length: usize,
    },
    ///Inputs: `[object]`
    LoadField(FieldDesc),
    ///Inputs: `[object, value]`
    StoreField(FieldDesc),
    ///Inputs: `[array, index]`
    LoadIndexed(ValueKind),
    ///Inputs: `[array, index, value]`
    StoreIndexed(ValueKind),
    ///Inputs: `[array]`
    ArrayLength,
    ///Inputs: `[object]`
    NullCheck,
    ///Inputs: `[object]`
    MonitorEnter,
    ///Inputs: `[object]`
    MonitorExit,
    ///Inputs: arguments
    Invoke(CallTarget),
    MemoryBarrier,
    ///Snapshot of the interpreter state for deoptimization.
    ///Inputs: `[locals.., virtual_object_states..]`
    FrameState {
        bci: u32,
        locals: usize,
    },

    //  Floating
    Constant(Constant),
    Parameter {
        index: u32,
        kind: ValueKind,
    },
    ///Inputs: `[x, y]`
    Binary(BinaryOp),
    ///Inputs: `[x, y]`
    Compare(CompareOp),
    ///Inputs: `[object]`
    IsNull,
    ///Inputs: `[object]`
    InstanceOf(ClassId),
    ///Inputs: one per predecessor of its merge.
    Phi(PhiNode),
    ///Read that floats between its dependency and its usages.
    FloatingRead(ReadAccess),
    ///Replacement of a removed allocation.
    VirtualObject(VirtualShape),
    ///Field values of a virtual object at some frame state.
    ///Inputs: `[virtual_object, values..]`
    VirtualObjectState,
}

impl NodeKind {
    pub fn is_fixed(&self) -> bool {
        !self.is_floating()
    }

    pub fn is_floating(&self) -> bool {
        matches!(
            self,
            NodeKind::Constant(_)
                | NodeKind::Parameter { .. }
                | NodeKind::Binary(_)
                | NodeKind::Compare(_)
                | NodeKind::IsNull
                | NodeKind::InstanceOf(_)
                | NodeKind::Phi(_)
                | NodeKind::FloatingRead(_)
                | NodeKind::VirtualObject(_)
                | NodeKind::VirtualObjectState
        )
    }

    ///Fixed nodes that have exactly one predecessor and one successor.
    pub fn is_fixed_with_next(&self) -> bool {
        matches!(
            self,
            NodeKind::Begin
                | NodeKind::NewInstance(_)
                | NodeKind::NewArray { .. }
                | NodeKind::LoadField(_)
                | NodeKind::StoreField(_)
                | NodeKind::LoadIndexed(_)
                | NodeKind::StoreIndexed(_)
                | NodeKind::ArrayLength
                | NodeKind::NullCheck
                | NodeKind::MonitorEnter
                | NodeKind::MonitorExit
                | NodeKind::Invoke(_)
                | NodeKind::MemoryBarrier
                | NodeKind::FrameState { .. }
        )
    }

    pub fn is_merge(&self) -> bool {
        matches!(self, NodeKind::Merge | NodeKind::LoopBegin)
    }

    pub fn is_control_split(&self) -> bool {
        matches!(self, NodeKind::If)
    }

    pub fn is_end(&self) -> bool {
        matches!(self, NodeKind::End | NodeKind::LoopEnd)
    }

    ///Nodes that terminate a basic block.
    pub fn is_block_end(&self) -> bool {
        matches!(
            self,
            NodeKind::If | NodeKind::End | NodeKind::LoopEnd | NodeKind::Return
        )
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, NodeKind::Phi(_))
    }

    pub fn is_value_phi(&self) -> bool {
        matches!(
            self,
            NodeKind::Phi(PhiNode {
                kind: PhiKind::Value,
                ..
            })
        )
    }

    pub fn is_memory_phi(&self) -> bool {
        matches!(
            self,
            NodeKind::Phi(PhiNode {
                kind: PhiKind::Memory(_),
                ..
            })
        )
    }

    pub fn is_allocation(&self) -> bool {
        matches!(self, NodeKind::NewInstance(_) | NodeKind::NewArray { .. })
    }

    pub fn as_constant(&self) -> Option<&Constant> {
        if let NodeKind::Constant(c) = self {
            Some(c)
        } else {
            None
        }
    }

    pub fn as_phi(&self) -> Option<&PhiNode> {
        if let NodeKind::Phi(p) = self {
            Some(p)
        } else {
            None
        }
    }

    pub fn memory_access(&self) -> MemoryAccess {
        match self {
            NodeKind::Start
            | NodeKind::Invoke(_)
            | NodeKind::MonitorEnter
            | NodeKind::MonitorExit
            | NodeKind::MemoryBarrier => MemoryAccess::Checkpoint,
            NodeKind::LoadField(f) => MemoryAccess::Read(f.location()),
            NodeKind::LoadIndexed(k) => MemoryAccess::Read(LocationIdentity::ArrayElement(*k)),
            NodeKind::StoreField(f) => MemoryAccess::Write(f.location()),
            NodeKind::StoreIndexed(k) => MemoryAccess::Write(LocationIdentity::ArrayElement(*k)),
            NodeKind::FloatingRead(access) => MemoryAccess::Read(access.location()),
            _ => MemoryAccess::None,
        }
    }

    ///The kind's display name.
    pub fn name(&self) -> &'static str {
        self.ops().name
    }

    ///Resolves the per-kind operation table.
    pub fn ops(&self) -> &'static NodeOps {
        ops::ops_for(self)
    }
}

impl Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Constant(c) => write!(f, "Const({c})"),
            NodeKind::Parameter { index, .. } => write!(f, "Param({index})"),
            NodeKind::Binary(op) => write!(f, "{op:?}"),
            NodeKind::Compare(op) => write!(f, "Cmp{op:?}"),
            NodeKind::LoadField(fd) | NodeKind::StoreField(fd) => {
                write!(f, "{}(f{})", self.name(), fd.id.0)
            }
            NodeKind::Phi(phi) => match phi.kind {
                PhiKind::Value => write!(f, "Phi"),
                PhiKind::Memory(loc) => write!(f, "MemPhi({loc:?})"),
            },
            NodeKind::FloatingRead(access) => write!(f, "FloatingRead({:?})", access.location()),
            NodeKind::Invoke(target) => write!(f, "Invoke({})", target.name),
            NodeKind::FrameState { bci, .. } => write!(f, "FrameState(@{bci})"),
            _ => write!(f, "{}", self.name()),
        }
    }
}

///A single node in the [Graph](crate::Graph).
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) kind: NodeKind,
    pub stamp: Stamp,
    ///Relative execution frequency of a fixed node, if profiled.
    pub frequency: Option<f64>,
    pub(crate) inputs: SmallColl<NodeRef>,
    ///The merge of a phi. Counted as a usage of that merge.
    pub(crate) anchor: Option<NodeRef>,
    ///Every node that has this node as input, or anchor. Contains a user once per edge.
    pub(crate) usages: SmallVec<[NodeRef; 4]>,
    pub(crate) predecessors: SmallColl<NodeRef>,
    pub(crate) successors: SmallColl<NodeRef>,
    pub(crate) ops: &'static NodeOps,
}

impl Node {
    pub(crate) fn new(kind: NodeKind, stamp: Stamp) -> Self {
        let ops = kind.ops();
        Node {
            kind,
            stamp,
            frequency: None,
            inputs: SmallColl::new(),
            anchor: None,
            usages: SmallVec::new(),
            predecessors: SmallColl::new(),
            successors: SmallColl::new(),
            ops,
        }
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }
    pub fn inputs(&self) -> &[NodeRef] {
        &self.inputs
    }
    pub fn anchor(&self) -> Option<NodeRef> {
        self.anchor
    }
    pub fn usages(&self) -> &[NodeRef] {
        &self.usages
    }
    pub fn predecessors(&self) -> &[NodeRef] {
        &self.predecessors
    }
    pub fn successors(&self) -> &[NodeRef] {
        &self.successors
    }
    pub fn ops(&self) -> &'static NodeOps {
        self.ops
    }

    pub fn is_fixed(&self) -> bool {
        self.kind.is_fixed()
    }

    pub fn is_floating(&self) -> bool {
        self.kind.is_floating()
    }

    ///Returns true if the phi state is Closed. False for any non-phi
    pub fn is_closed_phi(&self) -> bool {
        self.kind.as_phi().map(|p| p.is_closed()).unwrap_or(false)
    }

    ///Removes a single usage edge of `user`. Returns false if there was none.
    pub(crate) fn remove_usage(&mut self, user: NodeRef) -> bool {
        if let Some(idx) = self.usages.iter().position(|u| *u == user) {
            self.usages.remove(idx);
            true
        } else {
            false
        }
    }

    ///Input and anchor edges.
    pub(crate) fn all_inputs(&self) -> impl Iterator<Item = NodeRef> + '_ {
        self.inputs.iter().copied().chain(self.anchor)
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} : {}", self.kind, self.stamp)
    }
}
