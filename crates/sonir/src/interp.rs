/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 2024 Tendsin Mende
 */

//! Reference interpreter for graphs.
//!
//! Executes the control sequence from `Start` on concrete arguments. Floating nodes are evaluated on demand whenever a
//! fixed node (or a phi assignment) needs them. Phis of a merge are assigned simultaneously when control enters through
//! one of its ends.
//!
//! Memory is modelled as a heap that is snapshotted after every node that orders memory (writes, checkpoints) and at
//! every memory phi. A [FloatingRead](NodeKind::FloatingRead) reads from the snapshot of its last-writer dependency. An object
//! that did not exist yet in that snapshot can only hold its default values, so reading it yields the field's default.
//!
//! Virtual objects have no runtime representation. Evaluating one is a fault, which is exactly what tests use to detect
//! that an eliminated allocation is still used.

use ahash::AHashMap;

use crate::{
    err::GraphError,
    nodes::{ClassId, CompareOp, Constant, FieldId, NodeKind, ReadAccess, ValueKind},
    Graph, NodeRef,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Null,
    ///Index into the [Heap].
    Ref(usize),
}

impl From<Constant> for Value {
    fn from(c: Constant) -> Self {
        match c {
            Constant::Int(i) => Value::Int(i),
            Constant::Bool(b) => Value::Bool(b),
            Constant::Null => Value::Null,
        }
    }
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        if let Value::Int(i) = self {
            Some(*i)
        } else {
            None
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        if let Value::Bool(b) = self {
            Some(*b)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeapObject {
    Instance {
        class: ClassId,
        fields: AHashMap<FieldId, Value>,
    },
    Array {
        elem: ValueKind,
        values: Vec<Value>,
    },
}

///All objects allocated so far. Objects are never freed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Heap {
    objects: Vec<HeapObject>,
}

impl Heap {
    pub fn allocate(&mut self, object: HeapObject) -> Value {
        self.objects.push(object);
        Value::Ref(self.objects.len() - 1)
    }

    pub fn get(&self, reference: Value) -> Option<&HeapObject> {
        if let Value::Ref(r) = reference {
            self.objects.get(r)
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, reference: Value) -> Option<&mut HeapObject> {
        if let Value::Ref(r) = reference {
            self.objects.get_mut(r)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

///Host implementation of a called routine. Gets the evaluated arguments and the current heap.
pub type Callee = Box<dyn Fn(&[Value], &mut Heap) -> Result<Value, String>>;

pub struct Interpreter<'a> {
    graph: &'a Graph,
    callees: AHashMap<String, Callee>,
    fuel: usize,
}

///Mutable state of a single run.
struct Frame<'a> {
    args: &'a [Value],
    heap: Heap,
    ///Results of executed fixed nodes, and current values of value phis.
    values: AHashMap<NodeRef, Value>,
    ///Heap snapshots of memory ordering nodes and memory phis.
    memory: AHashMap<NodeRef, Heap>,
}

fn fault(node: NodeRef, reason: impl Into<String>) -> GraphError {
    GraphError::Interpreter {
        node,
        reason: reason.into(),
    }
}

impl<'a> Interpreter<'a> {
    pub const DEFAULT_FUEL: usize = 100_000;

    pub fn new(graph: &'a Graph) -> Self {
        Interpreter {
            graph,
            callees: AHashMap::default(),
            fuel: Self::DEFAULT_FUEL,
        }
    }

    ///Maximum number of fixed nodes that are executed before the run is aborted.
    pub fn with_fuel(mut self, fuel: usize) -> Self {
        self.fuel = fuel;
        self
    }

    ///Registers the host implementation of the routine `name`.
    pub fn with_callee(
        mut self,
        name: impl Into<String>,
        callee: impl Fn(&[Value], &mut Heap) -> Result<Value, String> + 'static,
    ) -> Self {
        self.callees.insert(name.into(), Box::new(callee));
        self
    }

    ///Runs the graph with `args` as parameters. Returns the returned value, if any.
    pub fn run(&self, args: &[Value]) -> Result<Option<Value>, GraphError> {
        let mut frame = Frame {
            args,
            heap: Heap::default(),
            values: AHashMap::default(),
            memory: AHashMap::default(),
        };
        let start = self.graph.start();
        frame.memory.insert(start, frame.heap.clone());

        let mut current = self
            .graph
            .next(start)
            .ok_or(GraphError::NotConnected(start))?;
        let mut steps = 0;
        loop {
            steps += 1;
            if steps > self.fuel {
                return Err(GraphError::OutOfFuel(self.fuel));
            }
            let node = self.graph.try_node(current)?;
            current = match node.kind() {
                NodeKind::Return => {
                    let value = match node.inputs().first() {
                        Some(v) => Some(self.eval(&frame, *v)?),
                        None => None,
                    };
                    #[cfg(feature = "log")]
                    log::trace!("interpreter returned {value:?} after {steps} steps");
                    return Ok(value);
                }
                NodeKind::If => {
                    let cond = self.eval_bool(&frame, node.inputs()[0])?;
                    let idx = if cond { 0 } else { 1 };
                    *node
                        .successors()
                        .get(idx)
                        .ok_or(GraphError::NotConnected(current))?
                }
                NodeKind::End | NodeKind::LoopEnd => {
                    let merge = *node
                        .successors()
                        .first()
                        .ok_or(GraphError::NotConnected(current))?;
                    self.enter_merge(&mut frame, merge, current)?;
                    self.graph
                        .next(merge)
                        .ok_or(GraphError::NotConnected(merge))?
                }
                _ => {
                    self.execute(&mut frame, current)?;
                    self.graph
                        .next(current)
                        .ok_or(GraphError::NotConnected(current))?
                }
            };
        }
    }

    ///Assigns all phis of `merge` for control arriving through `end`.
    fn enter_merge(&self, frame: &mut Frame, merge: NodeRef, end: NodeRef) -> Result<(), GraphError> {
        let index = self
            .graph
            .predecessors(merge)
            .iter()
            .position(|p| *p == end)
            .ok_or(fault(end, "end is not a predecessor of its merge"))?;

        let phis = self.graph.phis_of(merge);
        let mut new_values = Vec::new();
        let mut new_memory = Vec::new();
        for phi in phis {
            let input = *self
                .graph
                .inputs(phi)
                .get(index)
                .ok_or(fault(phi, format!("phi has no input for end {index}")))?;
            if self.graph.kind(phi).is_memory_phi() {
                let heap = frame
                    .memory
                    .get(&input)
                    .cloned()
                    .ok_or(fault(phi, "memory input was not executed"))?;
                new_memory.push((phi, heap));
            } else {
                new_values.push((phi, self.eval(frame, input)?));
            }
        }
        frame.values.extend(new_values);
        frame.memory.extend(new_memory);
        Ok(())
    }

    fn execute(&self, frame: &mut Frame, current: NodeRef) -> Result<(), GraphError> {
        let node = self.graph.try_node(current)?;
        let inputs = node.inputs();
        match node.kind() {
            NodeKind::Begin | NodeKind::Merge | NodeKind::LoopBegin | NodeKind::FrameState { .. } => {}
            NodeKind::NewInstance(shape) => {
                let fields = shape
                    .fields
                    .iter()
                    .map(|f| (f.id, Value::from(f.kind.default_constant())))
                    .collect();
                let obj = frame.heap.allocate(HeapObject::Instance {
                    class: shape.class,
                    fields,
                });
                frame.values.insert(current, obj);
            }
            NodeKind::NewArray { elem, length } => {
                let obj = frame.heap.allocate(HeapObject::Array {
                    elem: *elem,
                    values: vec![Value::from(elem.default_constant()); *length],
                });
                frame.values.insert(current, obj);
            }
            NodeKind::LoadField(field) => {
                let obj = self.eval_object(frame, inputs[0], current)?;
                let value = read_field(&frame.heap, obj, field.id, field.kind);
                frame.values.insert(current, value);
            }
            NodeKind::StoreField(field) => {
                let obj = self.eval_object(frame, inputs[0], current)?;
                let value = self.eval(frame, inputs[1])?;
                match frame.heap.get_mut(obj) {
                    Some(HeapObject::Instance { fields, .. }) => {
                        fields.insert(field.id, value);
                    }
                    _ => return Err(fault(current, "field store on non-instance")),
                }
                frame.memory.insert(current, frame.heap.clone());
            }
            NodeKind::LoadIndexed(_) => {
                let arr = self.eval_object(frame, inputs[0], current)?;
                let index = self.eval_int(frame, inputs[1])?;
                let value = read_element(&frame.heap, arr, index, current)?;
                frame.values.insert(current, value);
            }
            NodeKind::StoreIndexed(_) => {
                let arr = self.eval_object(frame, inputs[0], current)?;
                let index = self.eval_int(frame, inputs[1])?;
                let value = self.eval(frame, inputs[2])?;
                match frame.heap.get_mut(arr) {
                    Some(HeapObject::Array { values, .. }) => {
                        let slot = usize::try_from(index)
                            .ok()
                            .and_then(|i| values.get_mut(i))
                            .ok_or(fault(current, format!("index {index} out of bounds")))?;
                        *slot = value;
                    }
                    _ => return Err(fault(current, "indexed store on non-array")),
                }
                frame.memory.insert(current, frame.heap.clone());
            }
            NodeKind::ArrayLength => {
                let arr = self.eval_object(frame, inputs[0], current)?;
                let Some(HeapObject::Array { values, .. }) = frame.heap.get(arr) else {
                    return Err(fault(current, "length of non-array"));
                };
                frame.values.insert(current, Value::Int(values.len() as i64));
            }
            NodeKind::NullCheck => {
                self.eval_object(frame, inputs[0], current)?;
            }
            NodeKind::MonitorEnter | NodeKind::MonitorExit => {
                self.eval_object(frame, inputs[0], current)?;
                frame.memory.insert(current, frame.heap.clone());
            }
            NodeKind::MemoryBarrier => {
                frame.memory.insert(current, frame.heap.clone());
            }
            NodeKind::Invoke(target) => {
                let args = inputs
                    .iter()
                    .map(|i| self.eval(frame, *i))
                    .collect::<Result<Vec<_>, _>>()?;
                let callee = self
                    .callees
                    .get(&target.name)
                    .ok_or(fault(current, format!("no callee registered for {}", target.name)))?;
                let result = callee(&args, &mut frame.heap).map_err(|reason| fault(current, reason))?;
                if target.returns.is_some() {
                    frame.values.insert(current, result);
                }
                frame.memory.insert(current, frame.heap.clone());
            }
            other => {
                return Err(fault(
                    current,
                    format!("{} can not be executed as part of the control sequence", other.name()),
                ))
            }
        }
        Ok(())
    }

    ///Evaluates a data input.
    fn eval(&self, frame: &Frame, node: NodeRef) -> Result<Value, GraphError> {
        let n = self.graph.try_node(node)?;
        if n.is_fixed() {
            return frame
                .values
                .get(&node)
                .copied()
                .ok_or(fault(node, "value used before its node was executed"));
        }
        let inputs = n.inputs();
        match n.kind() {
            NodeKind::Constant(c) => Ok(Value::from(*c)),
            NodeKind::Parameter { index, .. } => frame
                .args
                .get(*index as usize)
                .copied()
                .ok_or(fault(node, format!("missing argument {index}"))),
            NodeKind::Binary(op) => {
                let a = self.eval_int(frame, inputs[0])?;
                let b = self.eval_int(frame, inputs[1])?;
                Ok(Value::Int(op.fold(a, b)))
            }
            NodeKind::Compare(op) => {
                let a = self.eval(frame, inputs[0])?;
                let b = self.eval(frame, inputs[1])?;
                match (op, a, b) {
                    (CompareOp::Eq, a, b) => Ok(Value::Bool(a == b)),
                    (CompareOp::Ne, a, b) => Ok(Value::Bool(a != b)),
                    (op, Value::Int(a), Value::Int(b)) => Ok(Value::Bool(op.fold(a, b))),
                    _ => Err(fault(node, "ordered comparison of non-integers")),
                }
            }
            NodeKind::IsNull => Ok(Value::Bool(self.eval(frame, inputs[0])? == Value::Null)),
            NodeKind::InstanceOf(class) => {
                let obj = self.eval(frame, inputs[0])?;
                let is = matches!(
                    frame.heap.get(obj),
                    Some(HeapObject::Instance { class: c, .. }) if c == class
                );
                Ok(Value::Bool(is))
            }
            NodeKind::Phi(_) => frame
                .values
                .get(&node)
                .copied()
                .ok_or(fault(node, "phi evaluated before its merge was entered")),
            NodeKind::FloatingRead(access) => {
                let dependency = *inputs
                    .last()
                    .ok_or(fault(node, "floating read without dependency"))?;
                let snapshot = frame
                    .memory
                    .get(&dependency)
                    .ok_or(fault(node, "dependency of floating read was not executed"))?;
                let obj = self.eval(frame, inputs[0])?;
                if obj == Value::Null {
                    return Err(fault(node, "read through null"));
                }
                match access {
                    ReadAccess::Field(field) => Ok(read_field(snapshot, obj, field.id, field.kind)),
                    ReadAccess::Indexed(kind) => {
                        let index = self.eval_int(frame, inputs[1])?;
                        if snapshot.get(obj).is_none() {
                            Ok(Value::from(kind.default_constant()))
                        } else {
                            read_element(snapshot, obj, index, node)
                        }
                    }
                }
            }
            NodeKind::VirtualObject(_) | NodeKind::VirtualObjectState => {
                Err(fault(node, "virtual objects have no runtime value"))
            }
            other => Err(fault(node, format!("can not evaluate {}", other.name()))),
        }
    }

    fn eval_int(&self, frame: &Frame, node: NodeRef) -> Result<i64, GraphError> {
        self.eval(frame, node)?
            .as_int()
            .ok_or(fault(node, "expected integer"))
    }

    fn eval_bool(&self, frame: &Frame, node: NodeRef) -> Result<bool, GraphError> {
        self.eval(frame, node)?
            .as_bool()
            .ok_or(fault(node, "expected boolean"))
    }

    ///Evaluates a non-null reference used by `user`.
    fn eval_object(&self, frame: &Frame, node: NodeRef, user: NodeRef) -> Result<Value, GraphError> {
        match self.eval(frame, node)? {
            Value::Null => Err(fault(user, "null dereference")),
            r @ Value::Ref(_) => Ok(r),
            _ => Err(fault(user, "expected reference")),
        }
    }
}

fn read_field(heap: &Heap, obj: Value, field: FieldId, kind: ValueKind) -> Value {
    match heap.get(obj) {
        Some(HeapObject::Instance { fields, .. }) => fields
            .get(&field)
            .copied()
            .unwrap_or(Value::from(kind.default_constant())),
        _ => Value::from(kind.default_constant()),
    }
}

fn read_element(heap: &Heap, arr: Value, index: i64, user: NodeRef) -> Result<Value, GraphError> {
    let Some(HeapObject::Array { values, .. }) = heap.get(arr) else {
        return Err(fault(user, "indexed access on non-array"));
    };
    usize::try_from(index)
        .ok()
        .and_then(|i| values.get(i))
        .copied()
        .ok_or(fault(user, format!("index {index} out of bounds")))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        builder::GraphBuilder,
        nodes::{BinaryOp, CompareOp, FieldDesc, ObjectShape},
    };

    #[test]
    fn counting_loop() {
        let mut graph = Graph::new();
        let mut builder = GraphBuilder::new(&mut graph);
        let n = builder.parameter(0, ValueKind::Int);
        let zero = builder.int(0);
        let res = builder
            .while_loop(
                &[zero, zero],
                |b, v| Ok(b.floating(NodeKind::Compare(CompareOp::Lt), &[v[0], n])),
                |b, v| {
                    let one = b.int(1);
                    let i = b.floating(NodeKind::Binary(BinaryOp::Add), &[v[0], one]);
                    let acc = b.floating(NodeKind::Binary(BinaryOp::Add), &[v[1], v[0]]);
                    Ok(vec![i, acc])
                },
            )
            .unwrap();
        builder.ret(Some(res[1])).unwrap();

        let interp = Interpreter::new(&graph);
        assert!(interp.run(&[Value::Int(0)]).unwrap() == Some(Value::Int(0)));
        assert!(interp.run(&[Value::Int(4)]).unwrap() == Some(Value::Int(6)));
    }

    #[test]
    fn field_store_and_load() {
        let mut graph = Graph::new();
        let f = FieldDesc::new(0, ValueKind::Int);
        let mut builder = GraphBuilder::new(&mut graph);
        let obj = builder.new_instance(ObjectShape::new(1).with_field(f)).unwrap();
        let v = builder.parameter(0, ValueKind::Int);
        builder.store_field(obj, f, v).unwrap();
        let load = builder.load_field(obj, f).unwrap();
        builder.ret(Some(load)).unwrap();

        let out = Interpreter::new(&graph).run(&[Value::Int(9)]).unwrap();
        assert!(out == Some(Value::Int(9)));
    }

    #[test]
    fn fuel_is_bounded() {
        let mut graph = Graph::new();
        let mut builder = GraphBuilder::new(&mut graph);
        let t = builder.bool(true);
        let _ = builder
            .while_loop(&[], |_b, _v| Ok(t), |_b, _v| Ok(Vec::new()))
            .unwrap();
        builder.ret(None).unwrap();
        let res = Interpreter::new(&graph).with_fuel(50).run(&[]);
        assert!(matches!(res, Err(GraphError::OutOfFuel(50))));
    }
}
