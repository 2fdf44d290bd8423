use proptest::prelude::*;
use strom::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Connect(usize, usize),
    Disconnect(usize, usize),
}

fn op() -> impl Strategy<Value = Op> {
    // Node 0 is an oscillator and has no inputs
    prop_oneof![
        (0..6usize, 1..6usize).prop_map(|(s, d)| Op::Connect(s, d)),
        (0..6usize, 1..6usize).prop_map(|(s, d)| Op::Disconnect(s, d)),
    ]
}

fn build() -> (Graph<MemoryBackend>, Vec<NodeKey>) {
    let mut graph = Graph::new(MemoryBackend::new(), GraphSettings::default());
    let mut nodes = vec![graph.push(NodeKind::Oscillator).unwrap()];
    for _ in 0..4 {
        nodes.push(graph.push(NodeKind::Gain).unwrap());
    }
    nodes.push(graph.push(NodeKind::Delay { max_delay_time: 1.0 }).unwrap());
    (graph, nodes)
}

/// Active connections from nodes outside of a cycle are exactly the ones
/// wired on the backend.
fn expected_wires(graph: &Graph<MemoryBackend>, nodes: &[NodeKey]) -> usize {
    nodes
        .iter()
        .filter(|node| !graph.is_part_of_a_cycle(**node))
        .map(|node| {
            graph
                .connections(*node)
                .unwrap()
                .outputs()
                .iter()
                .filter(|c| match c.target {
                    ConnectionTarget::Node { node: destination, input } => graph
                        .connections(destination)
                        .unwrap()
                        .active_inputs(input)
                        .iter()
                        .any(|a| a.source == *node && a.output == c.output),
                    ConnectionTarget::Param(_) => false,
                })
                .count()
        })
        .sum()
}

fn state_is_consistent(graph: &Graph<MemoryBackend>, node: NodeKey) -> bool {
    let record = graph.connections(node).unwrap();
    let fed = record
        .all_active_inputs()
        .any(|(_, c)| graph.node_state(c.source) == Some(NodeState::Active));
    let expected = if graph.node_kind(node).unwrap().is_source() || fed {
        NodeState::Active
    } else {
        NodeState::Passive
    };
    graph.node_state(node) == Some(expected)
}

proptest! {
    #[test]
    fn wiring_and_state_follow_the_connections(ops in proptest::collection::vec(op(), 0..32)) {
        let (mut graph, nodes) = build();
        for op in ops {
            match op {
                Op::Connect(s, d) => {
                    graph.connect(nodes[s], 0, nodes[d], 0).unwrap();
                }
                Op::Disconnect(s, d) => {
                    match graph.disconnect(nodes[s], 0, nodes[d], 0) {
                        Ok(()) | Err(ConnectionError::NotFound) => (),
                        Err(e) => panic!("unexpected error {e}"),
                    }
                }
            }
            prop_assert_eq!(graph.backend().num_wires(), expected_wires(&graph, &nodes));
            for node in &nodes {
                prop_assert!(state_is_consistent(&graph, *node));
            }
            // Loops through the delay are never counted
            prop_assert_eq!(graph.cycle_count(nodes[5]), 0);
        }

        for node in &nodes {
            graph.disconnect_all(*node).unwrap();
        }
        for node in &nodes {
            prop_assert_eq!(graph.cycle_count(*node), 0);
            prop_assert!(graph.connections(*node).unwrap().passive_inputs().is_empty());
        }
        prop_assert_eq!(graph.backend().num_wires(), 0);
        for node in &nodes[1..] {
            prop_assert_eq!(graph.node_state(*node), Some(NodeState::Passive));
        }
    }
}

// osc -> g1 <-> g2 -> g3, the connection back into g1 closes a cycle
const BASELINE: [(usize, usize); 4] = [(0, 1), (1, 2), (2, 1), (2, 3)];

#[derive(Debug, PartialEq)]
struct Snapshot {
    // (source, output, input) per node, sorted
    active: Vec<Vec<(usize, usize, usize)>>,
    passive: Vec<Vec<(usize, usize, usize)>>,
    cycles: Vec<usize>,
    states: Vec<Option<NodeState>>,
    wires: usize,
}

fn snapshot(graph: &Graph<MemoryBackend>, nodes: &[NodeKey]) -> Snapshot {
    let index = |key: NodeKey| nodes.iter().position(|n| *n == key).unwrap();
    let mut snapshot = Snapshot {
        active: Vec::new(),
        passive: Vec::new(),
        cycles: Vec::new(),
        states: Vec::new(),
        wires: graph.backend().num_wires(),
    };
    for node in nodes {
        let record = graph.connections(*node).unwrap();
        let mut active: Vec<_> = record
            .all_active_inputs()
            .map(|(input, c)| (index(c.source), c.output, input))
            .collect();
        active.sort();
        let mut passive = Vec::new();
        for (source, connections) in record.passive_inputs() {
            for c in connections {
                passive.push((index(*source), c.output, c.input));
            }
        }
        passive.sort();
        snapshot.active.push(active);
        snapshot.passive.push(passive);
        snapshot.cycles.push(graph.cycle_count(*node));
        snapshot.states.push(graph.node_state(*node));
    }
    snapshot
}

/// Connections not in the baseline, and the same connections shuffled
fn extra_connections() -> impl Strategy<Value = (Vec<(usize, usize)>, Vec<(usize, usize)>)> {
    proptest::collection::vec((0..6usize, 1..6usize), 0..16).prop_flat_map(|pairs| {
        let mut connections = Vec::new();
        for pair in pairs {
            if !BASELINE.contains(&pair) && !connections.contains(&pair) {
                connections.push(pair);
            }
        }
        let shuffled = Just(connections.clone()).prop_shuffle();
        (Just(connections), shuffled)
    })
}

proptest! {
    #[test]
    fn disconnecting_in_any_order_restores_the_previous_state(
        (connections, shuffled) in extra_connections(),
    ) {
        let (mut graph, nodes) = build();
        for (s, d) in BASELINE {
            graph.connect(nodes[s], 0, nodes[d], 0).unwrap();
        }
        let before = snapshot(&graph, &nodes);
        prop_assert_eq!(&before.cycles, &vec![0, 1, 1, 0, 0, 0]);
        prop_assert_eq!(before.passive[1].clone(), vec![(2, 0, 0)]);

        for (s, d) in &connections {
            graph.connect(nodes[*s], 0, nodes[*d], 0).unwrap();
        }
        for (s, d) in &shuffled {
            graph.disconnect(nodes[*s], 0, nodes[*d], 0).unwrap();
        }
        prop_assert_eq!(snapshot(&graph, &nodes), before);
    }
}
