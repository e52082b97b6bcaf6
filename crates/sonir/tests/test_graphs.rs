#![allow(dead_code)]

use sonir::{
    builder::GraphBuilder,
    interp::{Interpreter, Value},
    nodes::{BinaryOp, CompareOp, FieldDesc, NodeKind, ObjectShape, ValueKind},
    Graph, GraphError, NodeRef,
};

pub fn init_log() {
    let _ = pretty_env_logger::try_init();
}

///Runs `graph` with integer arguments and expects an integer result.
pub fn run_int(graph: &Graph, args: &[i64]) -> i64 {
    let args: Vec<Value> = args.iter().map(|a| Value::Int(*a)).collect();
    match Interpreter::new(graph).run(&args) {
        Ok(Some(Value::Int(i))) => i,
        other => panic!("expected integer result, got {other:?}"),
    }
}

pub fn less_than(b: &mut GraphBuilder, x: NodeRef, y: NodeRef) -> NodeRef {
    b.floating(NodeKind::Compare(CompareOp::Lt), &[x, y])
}

pub fn add(b: &mut GraphBuilder, x: NodeRef, y: NodeRef) -> NodeRef {
    b.floating(NodeKind::Binary(BinaryOp::Add), &[x, y])
}

pub fn increment(b: &mut GraphBuilder, x: NodeRef) -> NodeRef {
    let one = b.int(1);
    add(b, x, one)
}

///```text
/// obj = new {f}
/// for i in 0..p0 {
///     for j in 0..i {
///         obj.f = obj.f + 1
///     }
/// }
/// return obj.f
/// ```
pub fn nested_counter(graph: &mut Graph) -> Result<(), GraphError> {
    let f = FieldDesc::new(0, ValueKind::Int);
    let mut b = GraphBuilder::new(graph);
    let n = b.parameter(0, ValueKind::Int);
    let obj = b.new_instance(ObjectShape::new(1).with_field(f))?;
    let zero = b.int(0);
    b.while_loop(
        &[zero],
        |b, outer| Ok(less_than(b, outer[0], n)),
        |b, outer| {
            let i = outer[0];
            b.while_loop(
                &[zero],
                |b, inner| Ok(less_than(b, inner[0], i)),
                |b, inner| {
                    let old = b.load_field(obj, f)?;
                    let new = increment(b, old);
                    b.store_field(obj, f, new)?;
                    Ok(vec![increment(b, inner[0])])
                },
            )?;
            Ok(vec![increment(b, i)])
        },
    )?;
    let result = b.load_field(obj, f)?;
    b.ret(Some(result))?;
    Ok(())
}

///```text
/// if p0 < p1 {
///     r = p0
/// } else {
///     r = 0
///     while r < p0 { r = r + 1 }
/// }
/// return r + 1
/// ```
pub fn branch_with_loop(graph: &mut Graph) -> Result<(), GraphError> {
    let mut b = GraphBuilder::new(graph);
    let x = b.parameter(0, ValueKind::Int);
    let y = b.parameter(1, ValueKind::Int);
    let cond = less_than(&mut b, x, y);
    let merged = b.if_else(
        cond,
        |_b| Ok(vec![x]),
        |b| {
            let zero = b.int(0);
            b.while_loop(
                &[zero],
                |b, v| Ok(less_than(b, v[0], x)),
                |b, v| Ok(vec![increment(b, v[0])]),
            )
        },
    )?;
    let result = increment(&mut b, merged[0]);
    b.ret(Some(result))?;
    Ok(())
}
