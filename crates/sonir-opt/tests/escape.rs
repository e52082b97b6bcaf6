use sonir::{
    builder::GraphBuilder,
    interp::Value,
    nodes::{NodeKind, ValueKind},
    Graph,
};
use sonir_opt::{Counter, EscapeOutcome, NoInline, OptError, Optimizer};

use test_graphs::{field_a, pair_shape};

fn allocations(graph: &Graph) -> usize {
    test_graphs::count(graph, |k| k.is_allocation())
}

#[test]
fn straight_line_allocation_is_removed() {
    test_graphs::init_log();
    let mut graph = Graph::new();
    let ret = test_graphs::straight_line(&mut graph).unwrap();

    let mut opt = Optimizer::new(graph);
    let outcomes = opt.escape_analysis(&mut NoInline).unwrap();
    assert!(outcomes.len() == 1);
    assert!(outcomes[0].is_eliminated());
    opt.canonicalize().unwrap();

    let graph = opt.graph();
    assert!(graph.as_int(graph.inputs(ret)[0]) == Some(5));
    assert!(allocations(graph) == 0);
    assert!(test_graphs::count(graph, |k| matches!(k, NodeKind::StoreField(_) | NodeKind::LoadField(_))) == 0);
    assert!(test_graphs::run_int(graph, &[]) == 5);
    assert!(opt.stats.get(Counter::AllocationRemoved) == 1);
    assert!(opt.stats.get(Counter::AllocationFieldsRemoved) == 2);
}

#[test]
fn loop_carried_field_becomes_phi() {
    test_graphs::init_log();
    let mut graph = Graph::new();
    test_graphs::loop_counter(&mut graph).unwrap();
    let before = graph.clone();

    let mut opt = Optimizer::new(graph);
    let outcomes = opt.escape_analysis(&mut NoInline).unwrap();
    assert!(outcomes[0].is_eliminated());

    let graph = opt.graph();
    assert!(allocations(graph) == 0);
    for (arg, expected) in [(0, 10), (1, 13), (5, 25)] {
        assert!(test_graphs::run_int(&before, &[arg]) == expected);
        assert!(test_graphs::run_int(graph, &[arg]) == expected);
    }
}

#[test]
fn nested_loops_keep_semantics() {
    let mut graph = Graph::new();
    test_graphs::nested_counter(&mut graph).unwrap();
    let before = graph.clone();

    let mut opt = Optimizer::new(graph);
    assert!(opt.escape_analysis(&mut NoInline).unwrap()[0].is_eliminated());
    opt.canonicalize().unwrap();

    for n in 0..6 {
        let expected = n * (n - 1) / 2;
        assert!(test_graphs::run_int(&before, &[n]) == expected);
        assert!(test_graphs::run_int(opt.graph(), &[n]) == expected);
    }
}

#[test]
fn diamond_merges_field_values() {
    let mut graph = Graph::new();
    let ret = test_graphs::diamond_store(&mut graph).unwrap();
    let before = graph.clone();

    let mut opt = Optimizer::new(graph);
    assert!(opt.escape_analysis(&mut NoInline).unwrap()[0].is_eliminated());
    opt.canonicalize().unwrap();

    let graph = opt.graph();
    let result = graph.inputs(ret)[0];
    assert!(graph.kind(result).is_value_phi());
    let mut merged: Vec<i64> = graph
        .inputs(result)
        .iter()
        .filter_map(|i| graph.as_int(*i))
        .collect();
    merged.sort();
    assert!(merged == [1, 2]);

    for cond in [true, false] {
        let args = [Value::Bool(cond)];
        assert!(test_graphs::run(&before, &args) == test_graphs::run(graph, &args));
    }
}

#[test]
fn frame_state_captures_virtual_fields() {
    let mut graph = Graph::new();
    let mut b = GraphBuilder::new(&mut graph);
    let p = b.parameter(0, ValueKind::Int);
    let obj = b.new_instance(pair_shape()).unwrap();
    b.store_field(obj, field_a(), p).unwrap();
    let fs = b.frame_state(1, &[obj]).unwrap();
    let load = b.load_field(obj, field_a()).unwrap();
    b.ret(Some(load)).unwrap();

    let mut opt = Optimizer::new(graph);
    let outcomes = opt.escape_analysis(&mut NoInline).unwrap();
    let EscapeOutcome::Eliminated { virtual_object, .. } = outcomes[0] else {
        panic!("allocation was not removed: {outcomes:?}");
    };

    let graph = opt.graph();
    let inputs = graph.inputs(fs);
    assert!(inputs.len() == 2);
    assert!(inputs[0] == virtual_object);
    let object_state = inputs[1];
    assert!(graph.kind(object_state) == &NodeKind::VirtualObjectState);
    let captured = graph.inputs(object_state);
    assert!(captured[0] == virtual_object);
    assert!(captured[1] == p);
    assert!(graph.as_int(captured[2]) == Some(0));
    assert!(test_graphs::run_int(graph, &[3]) == 3);
}

#[test]
fn escape_analysis_is_idempotent() {
    let mut graph = Graph::new();
    test_graphs::loop_counter(&mut graph).unwrap();
    let mut opt = Optimizer::new(graph);
    opt.escape_analysis(&mut NoInline).unwrap();
    opt.canonicalize().unwrap();
    let nodes = opt.graph().node_count();

    let outcomes = opt.escape_analysis(&mut NoInline).unwrap();
    assert!(outcomes.is_empty());
    assert!(opt.graph().node_count() == nodes);
}

#[test]
fn hot_call_is_inlined_and_removed() {
    test_graphs::init_log();
    let mut graph = Graph::new();
    let call = test_graphs::hot_call(&mut graph).unwrap();
    let before = graph.clone();
    assert!(test_graphs::run_int(&before, &[4]) == 8);

    let mut inliner = test_graphs::PeekInliner::new();
    let mut opt = Optimizer::new(graph);
    let outcomes = opt.escape_analysis(&mut inliner).unwrap();
    assert!(outcomes[0].is_eliminated());
    assert!(inliner.calls == 1);
    assert!(!opt.graph().contains(call));
    assert!(allocations(opt.graph()) == 0);
    assert!(opt.stats.get(Counter::EscapeInlineAttempts) == 1);

    for arg in [0, 4, -3] {
        assert!(test_graphs::run_int(opt.graph(), &[arg]) == 2 * arg);
    }
}

#[test]
fn declined_call_keeps_allocation() {
    let mut graph = Graph::new();
    let call = test_graphs::hot_call(&mut graph).unwrap();

    let mut inliner = test_graphs::PeekInliner::new();
    inliner.decline = true;
    let mut opt = Optimizer::new(graph);
    let outcomes = opt.escape_analysis(&mut inliner).unwrap();
    assert!(matches!(outcomes[0], EscapeOutcome::InlineDeclined { call: c, .. } if c == call));
    assert!(allocations(opt.graph()) == 1);
    assert!(test_graphs::run_int(opt.graph(), &[4]) == 8);
}

#[test]
fn retries_are_bounded() {
    let mut graph = Graph::new();
    test_graphs::hot_call(&mut graph).unwrap();

    let mut inliner = test_graphs::EndlessInliner { calls: 0 };
    let mut opt = Optimizer::new(graph);
    let max = opt.config.escape_max_retries;
    let outcomes = opt.escape_analysis(&mut inliner).unwrap();
    assert!(matches!(outcomes[0], EscapeOutcome::RetriesExhausted { .. }));
    assert!(inliner.calls == max);
    assert!(allocations(opt.graph()) == 1);
}

#[test]
fn inliner_bailout_is_fatal() {
    let mut graph = Graph::new();
    test_graphs::hot_call(&mut graph).unwrap();

    let mut opt = Optimizer::new(graph);
    let result = opt.escape_analysis(&mut test_graphs::BailingInliner);
    assert!(matches!(result, Err(OptError::Inline(_))));
}

#[test]
fn light_call_keeps_allocation() {
    let mut graph = Graph::new();
    test_graphs::store_call_load(&mut graph, true).unwrap();

    let mut inliner = test_graphs::PeekInliner::new();
    let mut opt = Optimizer::new(graph);
    let outcomes = opt.escape_analysis(&mut inliner).unwrap();
    assert!(matches!(outcomes[0], EscapeOutcome::TooLight { weight, .. } if weight == 2.0));
    assert!(inliner.calls == 0);
    assert!(test_graphs::run_int(opt.graph(), &[1]) == 9);
}

#[test]
fn inlined_allocation_is_analysed() {
    let mut graph = Graph::new();
    let call = test_graphs::hot_call(&mut graph).unwrap();

    let mut inliner = test_graphs::AllocatingInliner { scratch: None };
    let mut opt = Optimizer::new(graph);
    let outcomes = opt.escape_analysis(&mut inliner).unwrap();
    let scratch = inliner.scratch.unwrap();
    assert!(outcomes.len() == 2);
    assert!(outcomes.iter().all(|o| o.is_eliminated()));
    assert!(matches!(outcomes[1], EscapeOutcome::Eliminated { allocation, .. } if allocation == scratch));

    let graph = opt.graph();
    assert!(!graph.contains(call));
    assert!(!graph.contains(scratch));
    assert!(allocations(graph) == 0);
    assert!(test_graphs::run_int(graph, &[5]) == 10);
}
