use sonir::{cfg::ControlFlowGraph, nodes::LocationIdentity, nodes::FieldId, Graph};

mod test_graphs;

#[test]
fn nested_loop_structure() {
    test_graphs::init_log();
    let mut graph = Graph::new();
    test_graphs::nested_counter(&mut graph).unwrap();
    graph.verify().unwrap();

    let cfg = ControlFlowGraph::compute(&graph).unwrap();
    let loops: Vec<_> = cfg.loops().collect();
    assert!(loops.len() == 2);
    let (inner, inner_info) = *loops
        .iter()
        .find(|(_, l)| l.depth == 2)
        .expect("inner loop");
    let (outer, outer_info) = *loops
        .iter()
        .find(|(_, l)| l.depth == 1)
        .expect("outer loop");
    assert!(inner_info.parent == Some(outer));
    assert!(outer_info.parent.is_none());
    assert!(inner_info.blocks.iter().all(|b| outer_info.blocks.contains(b)));
    assert!(cfg.loop_of(inner_info.header) == Some(inner));
    assert!(cfg.dominates(outer_info.header, inner_info.header));

    let field = LocationIdentity::Field(FieldId(0));
    assert!(cfg.locations_modified_in_loop(&graph, inner).contains(&field));
    assert!(cfg.locations_modified_in_loop(&graph, outer).contains(&field));
}

#[test]
fn nested_loop_executes() {
    let mut graph = Graph::new();
    test_graphs::nested_counter(&mut graph).unwrap();
    assert!(test_graphs::run_int(&graph, &[0]) == 0);
    assert!(test_graphs::run_int(&graph, &[1]) == 0);
    assert!(test_graphs::run_int(&graph, &[4]) == 6);
}

#[test]
fn rpo_respects_dominance() {
    let mut graph = Graph::new();
    test_graphs::nested_counter(&mut graph).unwrap();
    let cfg = ControlFlowGraph::compute(&graph).unwrap();
    for b in cfg.blocks_rpo() {
        if let Some(dom) = cfg.dominator(*b) {
            assert!(cfg.block(dom).rpo_index < cfg.block(*b).rpo_index);
        }
    }
}
