//! Connection records and the store that keeps them per node.
//!
//! Every node has a [`NodeConnections`] record with its active inputs (per
//! input index), its passive inputs (grouped by the node they come from) and
//! the outputs it has declared. Parameters have a similar
//! [`ParamConnections`] record, they only have one input.
//!
//! A connection is always recorded twice: once among the outputs of the
//! source and once among the active or passive inputs of the destination.
//! Changing both sides together is the job of [`Graph`](crate::graph::Graph).

use std::collections::BTreeMap;
use std::sync::Arc;

use slotmap::SecondaryMap;

use crate::backend::{Backend, BackendError, Port};
use crate::graph::{NodeKey, NodeState, ParamKey};
use crate::render::RenderDelegate;

/// A callback run when the state of the node at the receiving end of a
/// connection changes between active and passive.
#[derive(Clone)]
pub struct StateListener(Arc<dyn Fn(NodeState) + Send + Sync>);

impl StateListener {
    pub fn new(listener: impl Fn(NodeState) + Send + Sync + 'static) -> Self {
        Self(Arc::new(listener))
    }
    pub(crate) fn notify(&self, state: NodeState) {
        (self.0)(state)
    }
}

impl std::fmt::Debug for StateListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StateListener")
    }
}

/// An active connection as recorded at its destination
#[derive(Clone, Debug)]
pub struct ActiveInputConnection {
    pub source: NodeKey,
    pub output: usize,
    pub listener: Option<StateListener>,
}

/// A passive connection to a node input, recorded under its source
#[derive(Clone, Debug)]
pub struct PassiveInputConnection {
    pub output: usize,
    pub input: usize,
    pub listener: Option<StateListener>,
}

/// A passive connection to a parameter, recorded under its source
#[derive(Clone, Debug)]
pub struct PassiveParamConnection {
    pub output: usize,
    pub listener: Option<StateListener>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionTarget {
    Node { node: NodeKey, input: usize },
    Param(ParamKey),
}

/// A connection as recorded at its source
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct OutputConnection {
    pub output: usize,
    pub target: ConnectionTarget,
}

pub struct NodeConnections<B: Backend> {
    pub(crate) active_inputs: Vec<Vec<ActiveInputConnection>>,
    pub(crate) passive_inputs: BTreeMap<NodeKey, Vec<PassiveInputConnection>>,
    pub(crate) outputs: Vec<OutputConnection>,
    pub(crate) renderer: Option<Arc<dyn RenderDelegate<B>>>,
}

impl<B: Backend> NodeConnections<B> {
    fn new(renderer: Option<Arc<dyn RenderDelegate<B>>>, num_inputs: usize) -> Self {
        Self {
            active_inputs: vec![Vec::new(); num_inputs],
            passive_inputs: BTreeMap::new(),
            outputs: Vec::new(),
            renderer,
        }
    }
    pub fn num_inputs(&self) -> usize {
        self.active_inputs.len()
    }
    pub fn active_inputs(&self, input: usize) -> &[ActiveInputConnection] {
        self.active_inputs.get(input).map_or(&[], |i| i.as_slice())
    }
    /// All active inputs as `(input index, connection)`
    pub fn all_active_inputs(&self) -> impl Iterator<Item = (usize, &ActiveInputConnection)> + '_ {
        self.active_inputs
            .iter()
            .enumerate()
            .flat_map(|(input, connections)| connections.iter().map(move |c| (input, c)))
    }
    pub fn passive_inputs(&self) -> &BTreeMap<NodeKey, Vec<PassiveInputConnection>> {
        &self.passive_inputs
    }
    pub fn outputs(&self) -> &[OutputConnection] {
        &self.outputs
    }
    pub fn renderer(&self) -> Option<&Arc<dyn RenderDelegate<B>>> {
        self.renderer.as_ref()
    }
    pub(crate) fn has_active_input_from(
        &self,
        source: NodeKey,
        output: usize,
        input: usize,
    ) -> bool {
        self.active_inputs(input)
            .iter()
            .any(|c| c.source == source && c.output == output)
    }
}

impl<B: Backend> std::fmt::Debug for NodeConnections<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnections")
            .field("active_inputs", &self.active_inputs)
            .field("passive_inputs", &self.passive_inputs)
            .field("outputs", &self.outputs)
            .field("renderer", &self.renderer.is_some())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct ParamConnections {
    pub(crate) owner: NodeKey,
    pub(crate) active_inputs: Vec<ActiveInputConnection>,
    pub(crate) passive_inputs: BTreeMap<NodeKey, Vec<PassiveParamConnection>>,
}

impl ParamConnections {
    /// The node the parameter belongs to
    pub fn owner(&self) -> NodeKey {
        self.owner
    }
    pub fn active_inputs(&self) -> &[ActiveInputConnection] {
        &self.active_inputs
    }
    pub fn passive_inputs(&self) -> &BTreeMap<NodeKey, Vec<PassiveParamConnection>> {
        &self.passive_inputs
    }
    pub(crate) fn has_active_input_from(&self, source: NodeKey, output: usize) -> bool {
        self.active_inputs
            .iter()
            .any(|c| c.source == source && c.output == output)
    }
}

/// Connection records for every node and parameter of a graph.
pub struct ConnectionStore<B: Backend> {
    nodes: SecondaryMap<NodeKey, NodeConnections<B>>,
    params: SecondaryMap<ParamKey, ParamConnections>,
}

impl<B: Backend> ConnectionStore<B> {
    pub fn new() -> Self {
        Self {
            nodes: SecondaryMap::new(),
            params: SecondaryMap::new(),
        }
    }
    pub fn with_capacity(node_capacity: usize, param_capacity: usize) -> Self {
        Self {
            nodes: SecondaryMap::with_capacity(node_capacity),
            params: SecondaryMap::with_capacity(param_capacity),
        }
    }

    /// Create an empty record for `node`. A node can only be registered once.
    pub fn register_node(
        &mut self,
        node: NodeKey,
        renderer: Option<Arc<dyn RenderDelegate<B>>>,
        num_inputs: usize,
    ) -> Result<(), ConnectionError> {
        if self.nodes.contains_key(node) {
            return Err(ConnectionError::DuplicateNode);
        }
        self.nodes.insert(node, NodeConnections::new(renderer, num_inputs));
        Ok(())
    }
    pub fn register_param(
        &mut self,
        param: ParamKey,
        owner: NodeKey,
    ) -> Result<(), ConnectionError> {
        if self.params.contains_key(param) {
            return Err(ConnectionError::DuplicateParam);
        }
        self.params.insert(
            param,
            ParamConnections {
                owner,
                active_inputs: Vec::new(),
                passive_inputs: BTreeMap::new(),
            },
        );
        Ok(())
    }
    pub fn contains_node(&self, node: NodeKey) -> bool {
        self.nodes.contains_key(node)
    }
    pub fn get_connections(&self, node: NodeKey) -> Result<&NodeConnections<B>, ConnectionError> {
        self.nodes.get(node).ok_or(ConnectionError::MissingNode)
    }
    pub(crate) fn get_connections_mut(
        &mut self,
        node: NodeKey,
    ) -> Result<&mut NodeConnections<B>, ConnectionError> {
        self.nodes.get_mut(node).ok_or(ConnectionError::MissingNode)
    }
    pub fn get_param_connections(
        &self,
        param: ParamKey,
    ) -> Result<&ParamConnections, ConnectionError> {
        self.params.get(param).ok_or(ConnectionError::MissingParam)
    }
    pub(crate) fn get_param_connections_mut(
        &mut self,
        param: ParamKey,
    ) -> Result<&mut ParamConnections, ConnectionError> {
        self.params.get_mut(param).ok_or(ConnectionError::MissingParam)
    }
    /// The node a connection leads into. For a parameter that is its owner.
    pub fn target_node(&self, target: &ConnectionTarget) -> Option<NodeKey> {
        match target {
            ConnectionTarget::Node { node, .. } => Some(*node),
            ConnectionTarget::Param(param) => self.params.get(*param).map(|p| p.owner),
        }
    }
    /// Whether `connection` from `source` is recorded as active at its destination
    pub fn is_active(&self, source: NodeKey, connection: &OutputConnection) -> bool {
        match connection.target {
            ConnectionTarget::Node { node, input } => self
                .nodes
                .get(node)
                .map_or(false, |n| n.has_active_input_from(source, connection.output, input)),
            ConnectionTarget::Param(param) => self
                .params
                .get(param)
                .map_or(false, |p| p.has_active_input_from(source, connection.output)),
        }
    }
}

impl<B: Backend> Default for ConnectionStore<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// Insert `element` unless a similar one is already in `list`.
///
/// Returns `Ok(true)` if the element was inserted. A similar element is an
/// error unless `ignore_duplicates` is set, in which case nothing happens and
/// `Ok(false)` is returned.
pub(crate) fn insert_element<T>(
    list: &mut Vec<T>,
    element: T,
    is_similar: impl Fn(&T) -> bool,
    ignore_duplicates: bool,
) -> Result<bool, ConnectionError> {
    if list.iter().any(|e| is_similar(e)) {
        if ignore_duplicates {
            return Ok(false);
        }
        return Err(ConnectionError::DuplicateConnection);
    }
    list.push(element);
    Ok(true)
}

/// Remove and return the first element matching `predicate`
pub(crate) fn pick_element<T>(list: &mut Vec<T>, predicate: impl Fn(&T) -> bool) -> Option<T> {
    let index = list.iter().position(predicate)?;
    Some(list.remove(index))
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("The node does not exist in this graph.")]
    MissingNode,
    #[error("The parameter does not exist in this graph.")]
    MissingParam,
    #[error("The node has already been registered.")]
    DuplicateNode,
    #[error("The parameter has already been registered.")]
    DuplicateParam,
    #[error("The {port} index {index} is out of range, the node has {count} {port}s.")]
    IndexOutOfRange { port: Port, index: usize, count: usize },
    #[error("The connection you are trying to remove does not exist.")]
    NotFound,
    #[error("The connection is already recorded.")]
    DuplicateConnection,
    #[error("The backend failed to change the wiring: {0}")]
    Backend(#[from] BackendError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use slotmap::SlotMap;

    #[test]
    fn insert_element_rejects_or_ignores_duplicates() {
        let mut list = vec![1, 2];
        assert_eq!(insert_element(&mut list, 3, |e| *e == 3, false), Ok(true));
        assert_eq!(insert_element(&mut list, 3, |e| *e == 3, true), Ok(false));
        assert_eq!(
            insert_element(&mut list, 3, |e| *e == 3, false),
            Err(ConnectionError::DuplicateConnection)
        );
        assert_eq!(list, vec![1, 2, 3]);
        assert_eq!(pick_element(&mut list, |e| *e == 2), Some(2));
        assert_eq!(pick_element(&mut list, |e| *e == 2), None);
    }

    #[test]
    fn nodes_are_registered_once() {
        let mut keys: SlotMap<NodeKey, ()> = SlotMap::with_key();
        let node = keys.insert(());
        let unknown = keys.insert(());
        let mut store: ConnectionStore<MemoryBackend> = ConnectionStore::new();
        store.register_node(node, None, 2).unwrap();
        assert_eq!(store.register_node(node, None, 2), Err(ConnectionError::DuplicateNode));
        let record = store.get_connections(node).unwrap();
        assert_eq!(record.num_inputs(), 2);
        assert!(record.outputs().is_empty());
        assert!(record.renderer().is_none());
        assert!(matches!(store.get_connections(unknown), Err(ConnectionError::MissingNode)));
    }
}
