use sonir::{nodes::NodeKind, Graph};

mod test_graphs;

#[test]
fn kill_branch_containing_loop() {
    test_graphs::init_log();
    let mut graph = Graph::new();
    test_graphs::branch_with_loop(&mut graph).unwrap();
    assert!(test_graphs::run_int(&graph, &[3, 1]) == 4);

    let split = graph
        .nodes()
        .find(|n| graph.kind(*n) == &NodeKind::If && graph.predecessor(*n) == Some(graph.start()))
        .expect("outer split");
    let successors = graph.successors(split).to_vec();
    graph.remove_split(split, successors[0]).unwrap();
    let touched = graph.kill_cfg(successors[1]).unwrap();
    assert!(touched.len() == 1);
    assert!(!graph.nodes().any(|n| graph.kind(n) == &NodeKind::LoopBegin));
    graph.verify().unwrap();

    //Only the first branch is left.
    assert!(test_graphs::run_int(&graph, &[3, 1]) == 4);
    assert!(test_graphs::run_int(&graph, &[0, 1]) == 1);
}

#[test]
fn dne_keeps_reachable_graph() {
    let mut graph = Graph::new();
    test_graphs::branch_with_loop(&mut graph).unwrap();
    let before = graph.node_count();
    let orphan = graph.add(NodeKind::MemoryBarrier, &[]);
    let removed = graph.dead_node_elimination().unwrap();
    assert!(removed.len() == 1);
    assert!(!graph.contains(orphan));
    assert!(graph.node_count() == before);
    graph.verify().unwrap();
    assert!(test_graphs::run_int(&graph, &[2, 1]) == 3);
}
