use sonir::{builder::GraphBuilder, nodes::NodeKind, Graph};
use sonir_opt::{Counter, Optimizer};

use test_graphs::{field_a, pair_shape};

fn floating_reads(graph: &Graph) -> usize {
    test_graphs::count(graph, |k| matches!(k, NodeKind::FloatingRead(_)))
}

fn fixed_loads(graph: &Graph) -> usize {
    test_graphs::count(graph, |k| {
        matches!(k, NodeKind::LoadField(_) | NodeKind::LoadIndexed(_))
    })
}

#[test]
fn store_is_forwarded_to_read() {
    test_graphs::init_log();
    let mut graph = Graph::new();
    let ret = test_graphs::store_call_load(&mut graph, false).unwrap();

    let mut opt = Optimizer::new(graph);
    opt.floating_reads().unwrap();
    assert!(fixed_loads(opt.graph()) == 0);
    assert!(floating_reads(opt.graph()) == 1);

    assert!(opt.eliminate_reads().unwrap() == 1);
    let graph = opt.graph();
    assert!(floating_reads(graph) == 0);
    assert!(matches!(
        graph.kind(graph.inputs(ret)[0]),
        NodeKind::Parameter { index: 0, .. }
    ));
    assert!(test_graphs::run_int(graph, &[7]) == 7);
}

#[test]
fn call_hides_earlier_store() {
    let mut graph = Graph::new();
    let ret = test_graphs::store_call_load(&mut graph, true).unwrap();
    let call = graph
        .nodes()
        .find(|n| matches!(graph.kind(*n), NodeKind::Invoke(_)))
        .unwrap();

    let mut opt = Optimizer::new(graph);
    opt.floating_reads().unwrap();
    let read = opt.graph().inputs(ret)[0];
    assert!(opt.graph().inputs(read).last() == Some(&call));

    assert!(opt.eliminate_reads().unwrap() == 0);
    assert!(opt.graph().inputs(ret)[0] == read);
    assert!(test_graphs::run_int(opt.graph(), &[1]) == 9);
}

#[test]
fn loop_read_resolves_through_memory_phi() {
    let mut graph = Graph::new();
    test_graphs::loop_counter(&mut graph).unwrap();

    let mut opt = Optimizer::new(graph);
    opt.floating_reads().unwrap();
    assert!(opt.stats.get(Counter::FloatingReadsCreated) == 2);
    assert!(opt.stats.get(Counter::MemoryPhisCreated) == 1);

    assert!(opt.eliminate_reads().unwrap() == 2);
    assert!(opt.stats.get(Counter::ValuePhisCreated) == 1);
    let graph = opt.graph();
    assert!(floating_reads(graph) == 0);
    for (arg, expected) in [(0, 10), (1, 13), (5, 25)] {
        assert!(test_graphs::run_int(graph, &[arg]) == expected);
    }
}

#[test]
fn unwritten_field_reads_stay() {
    //The loop state starts at `Start`, nothing can be said about that.
    let mut graph = Graph::new();
    test_graphs::nested_counter(&mut graph).unwrap();
    let before = graph.clone();

    let mut opt = Optimizer::new(graph);
    opt.floating_reads().unwrap();
    let reads = floating_reads(opt.graph());
    assert!(reads == 2);
    assert!(opt.eliminate_reads().unwrap() == 0);
    assert!(floating_reads(opt.graph()) == reads);

    for n in 0..5 {
        assert!(test_graphs::run_int(&before, &[n]) == test_graphs::run_int(opt.graph(), &[n]));
    }
}

#[test]
fn barrier_in_branch_blocks_forwarding() {
    let mut graph = Graph::new();
    let mut b = GraphBuilder::new(&mut graph);
    let cond = b.parameter(0, sonir::nodes::ValueKind::Bool);
    let obj = b.new_instance(pair_shape()).unwrap();
    let one = b.int(1);
    b.store_field(obj, field_a(), one).unwrap();
    b.if_else(
        cond,
        |b| {
            b.append(NodeKind::MemoryBarrier, &[])?;
            Ok(Vec::new())
        },
        |_b| Ok(Vec::new()),
    )
    .unwrap();
    let load = b.load_field(obj, field_a()).unwrap();
    b.ret(Some(load)).unwrap();

    let mut opt = Optimizer::new(graph);
    opt.floating_reads().unwrap();
    assert!(opt.stats.get(Counter::MemoryPhisCreated) == 1);
    assert!(opt.eliminate_reads().unwrap() == 0);
    assert!(floating_reads(opt.graph()) == 1);
}

#[test]
fn merged_writes_become_value_phi() {
    let mut graph = Graph::new();
    let ret = test_graphs::diamond_store(&mut graph).unwrap();

    let mut opt = Optimizer::new(graph);
    opt.floating_reads().unwrap();
    assert!(opt.stats.get(Counter::MemoryPhisCreated) == 1);
    assert!(opt.eliminate_reads().unwrap() == 1);

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
}

#[test]
fn barrier_between_store_and_read() {
    for with_barrier in [false, true] {
        let mut graph = Graph::new();
        let mut b = GraphBuilder::new(&mut graph);
        let p = b.parameter(0, sonir::nodes::ValueKind::Int);
        let obj = b.new_instance(pair_shape()).unwrap();
        b.store_field(obj, field_a(), p).unwrap();
        if with_barrier {
            b.append(NodeKind::MemoryBarrier, &[]).unwrap();
        }
        let load = b.load_field(obj, field_a()).unwrap();
        let ret = b.ret(Some(load)).unwrap();

        let mut opt = Optimizer::new(graph);
        opt.floating_reads().unwrap();
        let eliminated = opt.eliminate_reads().unwrap();
        let graph = opt.graph();
        if with_barrier {
            assert!(eliminated == 0);
            assert!(matches!(graph.kind(graph.inputs(ret)[0]), NodeKind::FloatingRead(_)));
        } else {
            assert!(eliminated == 1);
            assert!(graph.inputs(ret)[0] == p);
        }
        assert!(test_graphs::run_int(graph, &[6]) == 6);
    }
}

#[test]
fn barrier_inside_loop_keeps_later_write_visible() {
    test_graphs::init_log();
    let mut graph = Graph::new();
    test_graphs::loop_with_barrier(&mut graph).unwrap();
    let before = graph.clone();
    for (arg, expected) in [(0, 0), (1, 0), (3, 2)] {
        assert!(test_graphs::run_int(&before, &[arg]) == expected);
    }

    let mut opt = Optimizer::new(graph);
    opt.floating_reads().unwrap();
    for arg in [0, 1, 3] {
        assert!(test_graphs::run_int(&before, &[arg]) == test_graphs::run_int(opt.graph(), &[arg]));
    }

    //Before the loop nothing was written, so the read at the top stays.
    assert!(opt.eliminate_reads().unwrap() == 0);
    assert!(floating_reads(opt.graph()) == 1);
    for arg in [0, 1, 3] {
        assert!(test_graphs::run_int(&before, &[arg]) == test_graphs::run_int(opt.graph(), &[arg]));
    }
}
