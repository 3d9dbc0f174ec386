//! End-to-end properties of the outline document.

use std::collections::{BTreeSet, HashMap};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use trellis_core::{
    build_pane_rows, DocConfig, EdgeId, IdSource, MirrorOutcome, MirrorTarget, NodeContent, NodeId,
    OutlineDoc, OutlineSnapshot, PaneState, ReconcileScope,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(prefix: &str) -> DocConfig {
    DocConfig {
        id_source: IdSource::Sequential { prefix: prefix.into() },
        ..DocConfig::for_testing()
    }
}

/// Sorted ids, so a seed picks the same items on every run.
fn ids(doc: &mut OutlineDoc) -> (Vec<NodeId>, Vec<EdgeId>) {
    let snapshot = doc.snapshot().unwrap();
    let mut nodes: Vec<NodeId> = snapshot.nodes().map(|n| n.id.clone()).collect();
    let mut edges: Vec<EdgeId> = snapshot.edges().map(|e| e.id.clone()).collect();
    nodes.sort();
    edges.sort();
    (nodes, edges)
}

/// Send each side what the other has not seen since `base`.
fn exchange(left: &mut OutlineDoc, right: &mut OutlineDoc, base: &[u8]) {
    let to_right = left.encode_diff(base).unwrap();
    let to_left = right.encode_diff(base).unwrap();
    right.apply_remote_update(&to_right).unwrap();
    left.apply_remote_update(&to_left).unwrap();
}

fn assert_all_invariants(snapshot: &OutlineSnapshot) {
    assert_index_invariant(snapshot);
    assert_acyclic(snapshot);
    assert_canonical(snapshot);
}

fn assert_index_invariant(snapshot: &OutlineSnapshot) {
    for edge in snapshot.edges() {
        let list = snapshot.list(edge.parent_node_id.as_ref());
        let count = list.iter().filter(|id| *id == &edge.id).count();
        assert_eq!(count, 1, "edge {} listed once", edge.id);
        assert!(snapshot.node(&edge.child_node_id).is_some());
        if let Some(parent) = &edge.parent_node_id {
            assert!(snapshot.node(parent).is_some());
        }
    }
    for (parent, list) in snapshot.lists() {
        let unique: BTreeSet<&EdgeId> = list.iter().collect();
        assert_eq!(unique.len(), list.len(), "no duplicates under {parent:?}");
        for id in list {
            let edge = snapshot.edge(id).expect("listed edge exists");
            assert_eq!(edge.parent_node_id.as_ref(), parent);
        }
    }
}

fn assert_acyclic(snapshot: &OutlineSnapshot) {
    let mut parents: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
    for edge in snapshot.edges() {
        if let Some(parent) = &edge.parent_node_id {
            parents.entry(&edge.child_node_id).or_default().push(parent);
        }
    }
    for start in parents.keys() {
        let mut stack: Vec<&NodeId> = parents[start].clone();
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            assert_ne!(current, *start, "node {start} is its own ancestor");
            if seen.insert(current) {
                stack.extend(parents.get(current).into_iter().flatten().copied());
            }
        }
    }
}

fn assert_canonical(snapshot: &OutlineSnapshot) {
    for edge in snapshot.edges() {
        if edge.is_mirror() {
            let canonical = snapshot.edge(&edge.canonical_edge_id).expect("canonical edge exists");
            assert!(!canonical.is_mirror());
            assert_eq!(canonical.child_node_id, edge.child_node_id);
        } else {
            assert_eq!(edge.canonical_edge_id, edge.id);
        }
    }
}

fn random_walk(doc: &mut OutlineDoc, seed: u64, steps: usize) {
    let mut rng = StdRng::seed_from_u64(seed);
    for step in 0..steps {
        let (nodes, edges) = ids(doc);

        match rng.gen_range(0..6) {
            0 | 1 => {
                let node = doc.create_node(NodeContent::plain(format!("node {step}"))).unwrap();
                let parent =
                    if rng.gen_bool(1.0 / 3.0) { None } else { nodes.choose(&mut rng).cloned() };
                let index = rng.gen_range(0..4);
                doc.add_edge(parent.as_ref(), &node, Some(index)).unwrap();
            }
            2 => {
                let edge = edges.choose(&mut rng).cloned();
                let parent = nodes.choose(&mut rng).cloned();
                if let Some(edge) = edge {
                    doc.move_edge(&edge, parent.as_ref(), None).unwrap();
                }
            }
            3 => {
                if let Some(edge) = edges.choose(&mut rng) {
                    doc.remove_edge(edge).unwrap();
                }
            }
            4 => {
                let source = nodes.choose(&mut rng).cloned();
                let parent = nodes.choose(&mut rng).cloned();
                if let (Some(source), Some(parent)) = (source, parent) {
                    let target = MirrorTarget::Position { parent: Some(parent), index: 0 };
                    doc.create_mirror_edge(&target, &source).unwrap();
                }
            }
            _ => {
                if let Some(edge) = edges.choose(&mut rng) {
                    doc.set_collapsed(edge, rng.gen_bool(0.5)).unwrap();
                }
            }
        }
    }
}

/// Creates and moves only, so two replicas editing the same base keep
/// working on nodes they both know about.
fn structural_walk(doc: &mut OutlineDoc, rng: &mut StdRng, label: &str, steps: usize) {
    for step in 0..steps {
        let (nodes, edges) = ids(doc);
        if rng.gen_bool(0.3) {
            let node = doc.create_node(NodeContent::plain(format!("{label} {step}"))).unwrap();
            let parent = nodes.choose(rng).cloned();
            doc.add_edge(parent.as_ref(), &node, None).unwrap();
        } else if let Some(edge) = edges.choose(rng) {
            let parent = if rng.gen_bool(0.2) { None } else { nodes.choose(rng).cloned() };
            let index = rng.gen_range(0..3);
            doc.move_edge(edge, parent.as_ref(), Some(index)).unwrap();
        }
    }
}

#[test]
fn test_invariants_hold_after_random_edits() {
    init_logger();
    for seed in [7_u64, 42, 1234, 99991] {
        let mut doc = OutlineDoc::new(DocConfig::for_testing());
        random_walk(&mut doc, seed, 150);

        assert_all_invariants(&doc.snapshot().unwrap());
        assert_eq!(doc.reconcile(ReconcileScope::Full).unwrap(), 0);
    }
}

#[test]
fn test_same_operations_give_same_projection() {
    let mut first = OutlineDoc::new(DocConfig::for_testing());
    let mut second = OutlineDoc::new(DocConfig::for_testing());
    random_walk(&mut first, 5, 80);
    random_walk(&mut second, 5, 80);

    let a = first.snapshot().unwrap();
    let b = second.snapshot().unwrap();
    assert_eq!(a.root_edges(), b.root_edges());
    assert_eq!(a.lists(), b.lists());
    let pane = PaneState::default();
    assert_eq!(build_pane_rows(&a, &pane), build_pane_rows(&b, &pane));
}

#[test]
fn test_reparent_scenario() {
    let mut doc = OutlineDoc::new(DocConfig::for_testing());
    let a = doc.create_node(NodeContent::plain("A")).unwrap();
    let b = doc.create_node(NodeContent::plain("B")).unwrap();
    let c = doc.create_node(NodeContent::plain("C")).unwrap();
    let ea = doc.add_edge(None, &a, None).unwrap().applied().unwrap();
    let eb = doc.add_edge(None, &b, None).unwrap().applied().unwrap();
    let ec = doc.add_edge(Some(&a), &c, None).unwrap().applied().unwrap();

    doc.move_edge(&ec, Some(&b), Some(0)).unwrap();

    let snapshot = doc.snapshot().unwrap();
    assert!(snapshot.child_edges(&a).is_empty());
    assert_eq!(snapshot.child_edges(&b), &[ec]);
    assert_eq!(snapshot.root_edges(), &[ea, eb]);
}

#[test]
fn test_convert_mode_scenario() {
    let mut doc = OutlineDoc::new(DocConfig::for_testing());
    let s = doc.create_node(NodeContent::plain("Source")).unwrap();
    let blank = doc.create_node(NodeContent::default()).unwrap();
    doc.add_edge(None, &s, None).unwrap();
    let e = doc.add_edge(None, &blank, None).unwrap().applied().unwrap();

    let outcome = doc.create_mirror_edge(&MirrorTarget::Edge(e.clone()), &s).unwrap();
    assert!(matches!(outcome, MirrorOutcome::Created { .. }));

    let edge = doc.edge(&e).unwrap().unwrap();
    assert_eq!(edge.child_node_id, s);
    assert_eq!(edge.mirror_of_node_id, Some(s.clone()));
    assert!(doc.node(&blank).unwrap().is_none());
    assert_canonical(&doc.snapshot().unwrap());
}

#[test]
fn test_concurrent_inserts_converge() {
    init_logger();
    let mut left = OutlineDoc::new(config("l-"));
    let parent = left.create_node(NodeContent::plain("parent")).unwrap();
    left.add_edge(None, &parent, None).unwrap();

    let mut right = OutlineDoc::load(&left.encode_state(), config("r-")).unwrap();

    let left_sv = left.state_vector();
    let right_sv = right.state_vector();

    let l = left.create_node(NodeContent::plain("from left")).unwrap();
    left.add_edge(Some(&parent), &l, None).unwrap();
    let r = right.create_node(NodeContent::plain("from right")).unwrap();
    right.add_edge(Some(&parent), &r, None).unwrap();

    let to_right = left.encode_diff(&right_sv).unwrap();
    let to_left = right.encode_diff(&left_sv).unwrap();
    right.apply_remote_update(&to_right).unwrap();
    left.apply_remote_update(&to_left).unwrap();

    let left_snapshot = left.snapshot().unwrap();
    let right_snapshot = right.snapshot().unwrap();
    assert_eq!(left_snapshot.child_edges(&parent).len(), 2);
    assert_eq!(left_snapshot.child_edges(&parent), right_snapshot.child_edges(&parent));
    assert_index_invariant(&left_snapshot);
    assert_index_invariant(&right_snapshot);
    assert_eq!(
        build_pane_rows(&left_snapshot, &PaneState::default()),
        build_pane_rows(&right_snapshot, &PaneState::default())
    );
}

#[test]
fn test_concurrent_first_placements_settle_on_one_primary() {
    let mut left = OutlineDoc::new(config("l-"));
    let shared = left.create_node(NodeContent::plain("shared")).unwrap();
    let mut right = OutlineDoc::load(&left.encode_state(), DocConfig::for_testing()).unwrap();
    let base = left.state_vector();

    left.add_edge(None, &shared, None).unwrap();
    right.add_edge(None, &shared, None).unwrap();

    let to_right = left.encode_diff(&base).unwrap();
    let to_left = right.encode_diff(&base).unwrap();
    right.apply_remote_update(&to_right).unwrap();
    left.apply_remote_update(&to_left).unwrap();

    for doc in [&mut left, &mut right] {
        let snapshot = doc.snapshot().unwrap();
        assert_eq!(snapshot.placements(&shared).len(), 2);
        assert_canonical(&snapshot);
        assert_index_invariant(&snapshot);
    }
}

#[test]
fn test_concurrent_cross_moves_leave_no_cycle() {
    init_logger();
    let mut left = OutlineDoc::new(config("l-"));
    let a = left.create_node(NodeContent::plain("A")).unwrap();
    let b = left.create_node(NodeContent::plain("B")).unwrap();
    let ea = left.add_edge(None, &a, None).unwrap().applied().unwrap();
    let eb = left.add_edge(None, &b, None).unwrap().applied().unwrap();
    let mut right = OutlineDoc::load(&left.encode_state(), config("r-")).unwrap();
    let base = left.state_vector();

    // Each move is legal on its own replica; merged they would form A -> B -> A.
    left.move_edge(&ea, Some(&b), None).unwrap();
    right.move_edge(&eb, Some(&a), None).unwrap();
    exchange(&mut left, &mut right, &base);

    for doc in [&mut left, &mut right] {
        let snapshot = doc.snapshot().unwrap();
        assert_all_invariants(&snapshot);
        assert_eq!(snapshot.root_edges().len(), 1);
        assert_eq!(build_pane_rows(&snapshot, &PaneState::default()).len(), 2);
    }

    // Both replicas broke the loop at the same edge.
    let full = left.encode_state();
    right.apply_remote_update(&full).unwrap();
    let full = right.encode_state();
    left.apply_remote_update(&full).unwrap();
    let (l, r) = (left.snapshot().unwrap(), right.snapshot().unwrap());
    assert_eq!(l.root_edges(), r.root_edges());
    assert_eq!(l.lists(), r.lists());
    assert_eq!(left.reconcile(ReconcileScope::Full).unwrap(), 0);
    assert_eq!(right.reconcile(ReconcileScope::Full).unwrap(), 0);
}

#[test]
fn test_concurrent_random_moves_keep_invariants() {
    init_logger();
    for seed in [3_u64, 17, 256, 4096] {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut left = OutlineDoc::new(config("l-"));
        for i in 0..8 {
            let node = left.create_node(NodeContent::plain(format!("base {i}"))).unwrap();
            left.add_edge(None, &node, None).unwrap();
        }
        let mut right = OutlineDoc::load(&left.encode_state(), config("r-")).unwrap();

        for _ in 0..5 {
            let base = left.state_vector();
            let right_base = right.state_vector();
            structural_walk(&mut left, &mut rng, "left", 6);
            structural_walk(&mut right, &mut rng, "right", 6);

            let to_right = left.encode_diff(&right_base).unwrap();
            let to_left = right.encode_diff(&base).unwrap();
            right.apply_remote_update(&to_right).unwrap();
            left.apply_remote_update(&to_left).unwrap();

            for doc in [&mut left, &mut right] {
                assert_all_invariants(&doc.snapshot().unwrap());
            }
        }
    }
}
