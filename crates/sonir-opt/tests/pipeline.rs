use sonir::{interp::Value, nodes::NodeKind, Graph};
use sonir_opt::{Counter, NoInline, OptConfig, Optimizer};


fn assert_same_results(before: &Graph, after: &Graph, args: &[i64]) {
    for arg in args {
        let expected = test_graphs::run_int(before, &[*arg]);
        let actual = test_graphs::run_int(after, &[*arg]);
        assert!(expected == actual, "p0 = {arg}: {expected} != {actual}");
    }
}

#[test]
fn pipeline_removes_loop_allocation() {
    test_graphs::init_log();
    let mut graph = Graph::new();
    test_graphs::loop_counter(&mut graph).unwrap();
    let before = graph.clone();

    let mut opt = Optimizer::new(graph);
    let stats = opt.run_pipeline(&mut NoInline).unwrap();
    assert!(stats.get(Counter::AllocationRemoved) == 1);
    assert!(opt.stats.is_empty());

    let after = opt.into_graph();
    after.verify().unwrap();
    assert!(test_graphs::count(&after, |k| k.is_allocation()) == 0);
    assert_same_results(&before, &after, &[0, 1, 2, 5]);
}

#[test]
fn pipeline_with_inlining() {
    let mut graph = Graph::new();
    test_graphs::hot_call(&mut graph).unwrap();
    let before = graph.clone();

    let mut inliner = test_graphs::PeekInliner::new();
    let mut opt = Optimizer::new(graph);
    let stats = opt.run_pipeline(&mut inliner).unwrap();
    assert!(stats.get(Counter::EscapeInlineAttempts) == 1);

    let after = opt.into_graph();
    assert!(test_graphs::count(&after, |k| matches!(k, NodeKind::Invoke(_))) == 0);
    assert_same_results(&before, &after, &[0, 3, -7]);
}

#[test]
fn pipeline_without_escape_analysis() {
    let mut graph = Graph::new();
    test_graphs::loop_counter(&mut graph).unwrap();
    let before = graph.clone();

    let config = OptConfig {
        escape_analysis: false,
        ..OptConfig::default()
    };
    let mut opt = Optimizer::with_config(graph, config);
    let stats = opt.run_pipeline(&mut NoInline).unwrap();
    assert!(stats.get(Counter::AllocationRemoved) == 0);
    assert!(stats.get(Counter::ReadsEliminated) == 2);

    let after = opt.into_graph();
    assert!(test_graphs::count(&after, |k| k.is_allocation()) == 1);
    assert!(test_graphs::count(&after, |k| matches!(k, NodeKind::FloatingRead(_))) == 0);
    assert_same_results(&before, &after, &[0, 1, 4]);
}

#[test]
fn pipeline_keeps_clobbered_field() {
    let mut graph = Graph::new();
    test_graphs::store_call_load(&mut graph, true).unwrap();

    let mut opt = Optimizer::new(graph);
    opt.run_pipeline(&mut NoInline).unwrap();
    let after = opt.into_graph();
    assert!(test_graphs::count(&after, |k| k.is_allocation()) == 1);
    assert!(test_graphs::run(&after, &[Value::Int(2)]) == Some(Value::Int(9)));
}

#[test]
fn pipeline_on_nested_loops() {
    let mut graph = Graph::new();
    test_graphs::nested_counter(&mut graph).unwrap();
    let before = graph.clone();

    let mut opt = Optimizer::new(graph);
    opt.run_pipeline(&mut NoInline).unwrap();
    let after = opt.into_graph();
    after.verify().unwrap();
    assert_same_results(&before, &after, &[0, 1, 2, 3, 6]);
}

#[test]
fn disabled_floating_reads_keep_loads_fixed() {
    let mut graph = Graph::new();
    test_graphs::store_call_load(&mut graph, true).unwrap();

    let config = OptConfig {
        floating_reads: false,
        ..OptConfig::default()
    };
    let mut opt = Optimizer::with_config(graph, config);
    let stats = opt.run_pipeline(&mut NoInline).unwrap();
    assert!(stats.get(Counter::FloatingReadsCreated) == 0);
    let after = opt.into_graph();
    assert!(test_graphs::count(&after, |k| matches!(k, NodeKind::LoadField(_))) == 1);
}
