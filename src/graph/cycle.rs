//! Finding and counting feedback cycles.
//!
//! When a connection from `source` to `destination` is made (or removed),
//! every simple path leading from `destination` back to `source` along the
//! declared outputs forms a cycle together with that connection. Paths
//! through a node that delays its input are not cycles. Each node keeps a
//! counter of how many cycles it is part of, see [`CycleCounters`].

use std::collections::{HashMap, HashSet};

use crate::backend::Backend;
use crate::graph::connection::ConnectionStore;
use crate::graph::NodeKey;

/// The nodes of a cycle, starting with the source of the connection that closed it
pub type Cycle = Vec<NodeKey>;

struct CycleSearch {
    source: NodeKey,
    // Nodes with a path back to `source`, nothing else can be part of a cycle
    leading_to_source: HashSet<NodeKey>,
    chain: Vec<NodeKey>,
    on_chain: HashSet<NodeKey>,
    // (node, index of the next output to follow)
    stack: Vec<(NodeKey, usize)>,
    cycles: Vec<Cycle>,
}

impl CycleSearch {
    fn visit(&mut self, node: NodeKey, introduces_delay: &impl Fn(NodeKey) -> bool) {
        if introduces_delay(node) {
            return;
        }
        if node == self.source {
            self.cycles.push(self.chain.clone());
            return;
        }
        if !self.leading_to_source.contains(&node) || !self.on_chain.insert(node) {
            return;
        }
        self.chain.push(node);
        self.stack.push((node, 0));
    }
}

/// The nodes reachable from `destination` that have a path back to `source`.
///
/// Walks forward from `destination` once, visiting every node at most once,
/// then walks the visited edges backwards from `source`. Empty if `source`
/// can't be reached at all.
fn nodes_leading_to<B: Backend>(
    store: &ConnectionStore<B>,
    source: NodeKey,
    destination: NodeKey,
    introduces_delay: &impl Fn(NodeKey) -> bool,
) -> HashSet<NodeKey> {
    let mut leading = HashSet::new();
    if introduces_delay(destination) {
        return leading;
    }
    let mut predecessors: HashMap<NodeKey, Vec<NodeKey>> = HashMap::new();
    let mut reached = HashSet::from([destination]);
    let mut queue = vec![destination];
    while let Some(node) = queue.pop() {
        if node == source {
            continue;
        }
        let outputs = store.get_connections(node).map(|c| c.outputs()).unwrap_or(&[]);
        for connection in outputs {
            let Some(next) = store.target_node(&connection.target) else {
                continue;
            };
            if introduces_delay(next) {
                continue;
            }
            predecessors.entry(next).or_default().push(node);
            if reached.insert(next) {
                queue.push(next);
            }
        }
    }
    if !reached.contains(&source) {
        return leading;
    }
    leading.insert(source);
    let mut queue = vec![source];
    while let Some(node) = queue.pop() {
        for previous in predecessors.get(&node).into_iter().flatten() {
            if leading.insert(*previous) {
                queue.push(*previous);
            }
        }
    }
    leading
}

/// All cycles closed by a connection from `source` into `destination`.
///
/// Every declared output is followed, active or passive, so that removing a
/// connection finds exactly the cycles that adding it found. Connections into
/// a parameter lead to the node owning it. Only nodes that can reach `source`
/// are searched, so a connection closing no cycle costs a single walk over
/// the nodes reachable from `destination`.
pub fn detect_cycles<B: Backend>(
    store: &ConnectionStore<B>,
    source: NodeKey,
    destination: NodeKey,
    introduces_delay: impl Fn(NodeKey) -> bool,
) -> Vec<Cycle> {
    let leading_to_source = nodes_leading_to(store, source, destination, &introduces_delay);
    if leading_to_source.is_empty() {
        return Vec::new();
    }
    let mut search = CycleSearch {
        source,
        leading_to_source,
        chain: vec![source],
        on_chain: HashSet::new(),
        stack: Vec::new(),
        cycles: Vec::new(),
    };
    search.visit(destination, &introduces_delay);
    while let Some(&(node, index)) = search.stack.last() {
        let outputs = store.get_connections(node).map(|c| c.outputs()).unwrap_or(&[]);
        match outputs.get(index) {
            Some(connection) => {
                if let Some(top) = search.stack.last_mut() {
                    top.1 += 1;
                }
                if let Some(next) = store.target_node(&connection.target) {
                    search.visit(next, &introduces_delay);
                }
            }
            None => {
                search.stack.pop();
                if let Some(done) = search.chain.pop() {
                    search.on_chain.remove(&done);
                }
            }
        }
    }
    search.cycles
}

/// How many of `cycles` each node takes part in, in order of first appearance
pub fn visit_each_node_once(cycles: &[Cycle]) -> Vec<(NodeKey, usize)> {
    let mut counts: Vec<(NodeKey, usize)> = Vec::new();
    let mut index_of: HashMap<NodeKey, usize> = HashMap::new();
    for node in cycles.iter().flatten() {
        match index_of.get(node) {
            Some(&i) => counts[i].1 += 1,
            None => {
                index_of.insert(*node, counts.len());
                counts.push((*node, 1));
            }
        }
    }
    counts
}

/// The number of cycles every node is currently part of.
///
/// A node without an entry is not part of any cycle.
#[derive(Clone, Debug, Default)]
pub struct CycleCounters {
    counters: HashMap<NodeKey, usize>,
}

impl CycleCounters {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn count(&self, node: NodeKey) -> usize {
        self.counters.get(&node).copied().unwrap_or(0)
    }
    pub fn contains(&self, node: NodeKey) -> bool {
        self.counters.contains_key(&node)
    }
    pub fn len(&self) -> usize {
        self.counters.len()
    }
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
    /// Returns true if the node just became part of a cycle
    pub fn increment(&mut self, node: NodeKey, count: usize) -> bool {
        let counter = self.counters.entry(node).or_insert(0);
        let was_zero = *counter == 0;
        *counter += count;
        was_zero && count > 0
    }
    /// Returns true if the node is no longer part of any cycle
    pub fn decrement(&mut self, node: NodeKey, count: usize) -> bool {
        let Some(counter) = self.counters.get_mut(&node) else {
            return false;
        };
        *counter = counter.saturating_sub(count);
        if *counter == 0 {
            self.counters.remove(&node);
            return true;
        }
        false
    }
    pub fn iter(&self) -> impl Iterator<Item = (NodeKey, usize)> + '_ {
        self.counters.iter().map(|(k, v)| (*k, *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn keys(n: usize) -> Vec<NodeKey> {
        let mut map: SlotMap<NodeKey, ()> = SlotMap::with_key();
        (0..n).map(|_| map.insert(())).collect()
    }

    #[test]
    fn nodes_are_counted_across_cycles() {
        let k = keys(3);
        let cycles = vec![vec![k[0], k[1]], vec![k[0], k[2], k[1]]];
        assert_eq!(visit_each_node_once(&cycles), vec![(k[0], 2), (k[1], 2), (k[2], 1)]);
    }

    #[test]
    fn counters_report_transitions() {
        let k = keys(1);
        let mut counters = CycleCounters::new();
        assert!(counters.increment(k[0], 2));
        assert!(!counters.increment(k[0], 1));
        assert_eq!(counters.count(k[0]), 3);
        assert!(!counters.decrement(k[0], 2));
        assert!(counters.decrement(k[0], 1));
        assert!(!counters.contains(k[0]));
        assert!(!counters.decrement(k[0], 1));
    }
}
