//! [`Graph`] is the audio graph, the core of Strom.
//!
//! Nodes are pushed onto a graph and connected to each other, to their
//! parameters or to the parameters of other nodes. Every change to the
//! topology goes through the connection methods on [`Graph`], which keep
//! three things in sync:
//!
//! - the connection records, see [`connection`]
//! - the cycle counters, see [`cycle`]
//! - the wiring on the [`Backend`], for a realtime graph
//!
//! ```
//! # use strom::prelude::*;
//! let mut graph = Graph::new(MemoryBackend::new(), GraphSettings::default());
//! let osc = graph.push(NodeKind::Oscillator)?;
//! let delay = graph.push(NodeKind::Delay { max_delay_time: 1.0 })?;
//! let gain = graph.push(NodeKind::Gain)?;
//! graph.connect(osc, 0, gain, 0)?;
//! graph.connect(gain, 0, delay, 0)?;
//! // A loop through a delay is fine and stays wired
//! graph.connect(delay, 0, gain, 0)?;
//! assert!(!graph.is_part_of_a_cycle(gain));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! A loop without a delay in it is recorded, but the connection closing it is
//! kept passive and every node in the loop is cut off from the backend until
//! the loop is broken again.

pub mod connection;
pub mod cycle;
mod node;

pub use connection::{
    ActiveInputConnection, ConnectionError, ConnectionStore, ConnectionTarget, NodeConnections,
    OutputConnection, ParamConnections, PassiveInputConnection, PassiveParamConnection,
    StateListener,
};
pub use node::{NodeKind, NodeState, ParamDescriptor};

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use slotmap::{new_key_type, SlotMap};
use tracing::{debug, trace, warn};

use crate::automation::AutomationEventList;
use crate::backend::{Backend, BackendError, Port};
use crate::offline::{RenderTarget, TargetId};
use crate::render::{KindRenderer, RenderDelegate};
use crate::{Sample, NEXT_GRAPH_ID};
use connection::{insert_element, pick_element};
use cycle::{detect_cycles, visit_each_node_once, Cycle, CycleCounters};

new_key_type! {
    /// Address of a node in a [`Graph`]
    pub struct NodeKey;
    /// Address of an automatable parameter in a [`Graph`]
    pub struct ParamKey;
}

/// Whether changes to a graph are applied to its backend as they happen
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GraphMode {
    /// Connections are wired on the backend immediately and automation is
    /// forwarded as it is scheduled.
    Realtime,
    /// The graph is only bookkeeping until it is rendered. Nodes are created
    /// on the given target.
    Offline(TargetId),
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde-derive", derive(serde::Serialize, serde::Deserialize))]
pub struct GraphSettings {
    pub name: String,
    pub sample_rate: Sample,
    /// The number of nodes to reserve space for
    pub node_capacity: usize,
    /// The number of parameters to reserve space for
    pub param_capacity: usize,
}

impl Default for GraphSettings {
    fn default() -> Self {
        GraphSettings {
            name: String::from(""),
            sample_rate: 44100.,
            node_capacity: 256,
            param_capacity: 512,
        }
    }
}

pub(crate) struct NodeEntry<B: Backend> {
    pub(crate) kind: NodeKind,
    pub(crate) state: NodeState,
    pub(crate) instance: B::Node,
    pub(crate) params: Vec<ParamKey>,
}

pub(crate) struct ParamEntry<B: Backend> {
    pub(crate) owner: NodeKey,
    pub(crate) name: String,
    pub(crate) events: AutomationEventList,
    pub(crate) instance: B::Param,
}

/// A [`Graph`] holds nodes, their parameters and the connections between them.
///
/// # Manipulating the [`Graph`]
/// - [`Graph::push`] creates a node of some [`NodeKind`] and returns its [`NodeKey`]
/// - [`Graph::connect`] and [`Graph::connect_param`] add connections
/// - [`Graph::disconnect`], [`Graph::disconnect_param`],
///   [`Graph::disconnect_output`], [`Graph::disconnect_node`] and
///   [`Graph::disconnect_all`] remove them
/// - the automation methods, like [`Graph::set_value_at_time`], schedule
///   changes to parameters
///
/// Failed connection changes leave the graph as it was.
pub struct Graph<B: Backend> {
    id: u64,
    settings: GraphSettings,
    mode: GraphMode,
    backend: Arc<Mutex<B>>,
    pub(crate) nodes: SlotMap<NodeKey, NodeEntry<B>>,
    pub(crate) params: SlotMap<ParamKey, ParamEntry<B>>,
    pub(crate) connections: ConnectionStore<B>,
    pub(crate) cycle_counters: CycleCounters,
    pub(crate) pending: Vec<NodeKey>,
    pub(crate) current_time: f64,
    default_renderer: Option<Arc<dyn RenderDelegate<B>>>,
}

impl<B: Backend> Graph<B> {
    /// Create a realtime graph driving `backend`
    pub fn new(backend: B, settings: GraphSettings) -> Self {
        Self::with_mode(Arc::new(Mutex::new(backend)), GraphMode::Realtime, None, settings)
    }
    /// Create an offline graph whose nodes live on `target`. Nodes pushed to
    /// it get a [`KindRenderer`] so that the graph can be rendered.
    pub fn new_offline(target: &RenderTarget<B>, settings: GraphSettings) -> Self {
        let renderer: Arc<dyn RenderDelegate<B>> = Arc::new(KindRenderer);
        Self::with_mode(
            target.shared_backend(),
            GraphMode::Offline(target.id()),
            Some(renderer),
            settings,
        )
    }
    fn with_mode(
        backend: Arc<Mutex<B>>,
        mode: GraphMode,
        default_renderer: Option<Arc<dyn RenderDelegate<B>>>,
        settings: GraphSettings,
    ) -> Self {
        let id = NEXT_GRAPH_ID.fetch_add(1, Ordering::SeqCst);
        debug!(graph = id, name = %settings.name, ?mode, "creating graph");
        Self {
            id,
            nodes: SlotMap::with_capacity_and_key(settings.node_capacity),
            params: SlotMap::with_capacity_and_key(settings.param_capacity),
            connections: ConnectionStore::with_capacity(
                settings.node_capacity,
                settings.param_capacity,
            ),
            cycle_counters: CycleCounters::new(),
            pending: Vec::new(),
            current_time: 0.0,
            settings,
            mode,
            backend,
            default_renderer,
        }
    }
    pub fn id(&self) -> u64 {
        self.id
    }
    pub fn settings(&self) -> &GraphSettings {
        &self.settings
    }
    pub fn mode(&self) -> GraphMode {
        self.mode
    }
    pub fn is_realtime(&self) -> bool {
        self.mode == GraphMode::Realtime
    }
    /// Lock the backend. Don't hold on to the guard while changing the graph.
    pub fn backend(&self) -> MutexGuard<'_, B> {
        self.backend.lock()
    }
    pub fn current_time(&self) -> f64 {
        self.current_time
    }
    /// Advance the clock automation is scheduled against. In a realtime
    /// graph, automation that ended before this time is dropped the next time
    /// a parameter is automated.
    pub fn set_current_time(&mut self, time: f64) {
        self.current_time = time;
    }
    /// Set the renderer given to nodes pushed with [`Graph::push`] from now on
    pub fn set_default_renderer(&mut self, renderer: Option<Arc<dyn RenderDelegate<B>>>) {
        self.default_renderer = renderer;
    }

    /// Create a node of the given kind, both in the graph and on the backend.
    pub fn push(&mut self, kind: NodeKind) -> Result<NodeKey, ConnectionError> {
        let renderer = self.default_renderer.clone();
        self.push_with_renderer(kind, renderer)
    }
    /// Like [`Graph::push`], with a specific renderer for offline rendering
    pub fn push_with_renderer(
        &mut self,
        kind: NodeKind,
        renderer: Option<Arc<dyn RenderDelegate<B>>>,
    ) -> Result<NodeKey, ConnectionError> {
        let descriptors = kind.params();
        let (instance, param_instances) = {
            let mut backend = self.backend.lock();
            let instance = backend.create_node(&kind)?;
            let param_instances = descriptors
                .iter()
                .map(|d| backend.param(&instance, &d.name))
                .collect::<Result<Vec<_>, BackendError>>()?;
            (instance, param_instances)
        };
        let state = if kind.is_source() {
            NodeState::Active
        } else {
            NodeState::Passive
        };
        let num_inputs = kind.num_inputs();
        let side_effects = kind.has_side_effects();
        let name = kind.name().to_string();
        let key = self.nodes.insert(NodeEntry {
            kind,
            state,
            instance,
            params: Vec::with_capacity(descriptors.len()),
        });
        self.connections.register_node(key, renderer, num_inputs)?;
        for (descriptor, instance) in descriptors.into_iter().zip(param_instances) {
            let param = self.params.insert(ParamEntry {
                owner: key,
                events: AutomationEventList::new(descriptor.default_value),
                name: descriptor.name,
                instance,
            });
            self.connections.register_param(param, key)?;
            if let Some(entry) = self.nodes.get_mut(key) {
                entry.params.push(param);
            }
        }
        if side_effects && !self.is_realtime() {
            self.pending.push(key);
        }
        debug!(graph = self.id, node = ?key, kind = %name, "pushed node");
        Ok(key)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }
    pub fn node_keys(&self) -> impl Iterator<Item = NodeKey> + '_ {
        self.nodes.keys()
    }
    pub fn contains(&self, node: NodeKey) -> bool {
        self.nodes.contains_key(node)
    }
    pub fn node_kind(&self, node: NodeKey) -> Option<&NodeKind> {
        self.nodes.get(node).map(|n| &n.kind)
    }
    pub fn node_state(&self, node: NodeKey) -> Option<NodeState> {
        self.nodes.get(node).map(|n| n.state)
    }
    /// The backend instance of `node` created when it was pushed
    pub fn instance(&self, node: NodeKey) -> Option<&B::Node> {
        self.nodes.get(node).map(|n| &n.instance)
    }
    /// The connection record of `node`
    pub fn connections(&self, node: NodeKey) -> Result<&NodeConnections<B>, ConnectionError> {
        self.connections.get_connections(node)
    }
    pub fn param_connections(&self, param: ParamKey) -> Result<&ParamConnections, ConnectionError> {
        self.connections.get_param_connections(param)
    }
    /// The number of cycles `node` is currently part of
    pub fn cycle_count(&self, node: NodeKey) -> usize {
        self.cycle_counters.count(node)
    }
    pub fn is_part_of_a_cycle(&self, node: NodeKey) -> bool {
        self.cycle_counters.contains(node)
    }
    /// Nodes that will be rendered offline even if they don't reach the destination
    pub fn pending(&self) -> &[NodeKey] {
        &self.pending
    }
    /// Make sure `node` is rendered by every offline render of this graph
    pub fn mark_pending(&mut self, node: NodeKey) -> Result<(), ConnectionError> {
        self.node(node)?;
        if !self.pending.contains(&node) {
            self.pending.push(node);
        }
        Ok(())
    }

    pub(crate) fn node(&self, node: NodeKey) -> Result<&NodeEntry<B>, ConnectionError> {
        self.nodes.get(node).ok_or(ConnectionError::MissingNode)
    }
    pub(crate) fn param_entry(&self, param: ParamKey) -> Result<&ParamEntry<B>, ConnectionError> {
        self.params.get(param).ok_or(ConnectionError::MissingParam)
    }
    fn check_output(&self, node: NodeKey, output: usize) -> Result<(), ConnectionError> {
        let count = self.node(node)?.kind.num_outputs();
        if output >= count {
            return Err(ConnectionError::IndexOutOfRange {
                port: Port::Output,
                index: output,
                count,
            });
        }
        Ok(())
    }
    fn check_input(&self, node: NodeKey, input: usize) -> Result<(), ConnectionError> {
        let count = self.node(node)?.kind.num_inputs();
        if input >= count {
            return Err(ConnectionError::IndexOutOfRange {
                port: Port::Input,
                index: input,
                count,
            });
        }
        Ok(())
    }

    /// Connect an output of `source` to an input of `destination`.
    ///
    /// Returns true if `destination` went from passive to active because of
    /// the new connection. Making a connection that already exists does
    /// nothing and returns false.
    pub fn connect(
        &mut self,
        source: NodeKey,
        output: usize,
        destination: NodeKey,
        input: usize,
    ) -> Result<bool, ConnectionError> {
        self.connect_node(source, output, destination, input, None)
    }
    /// Like [`Graph::connect`], and `listener` is notified whenever the
    /// state of `source` changes for as long as the connection exists.
    pub fn connect_with_listener(
        &mut self,
        source: NodeKey,
        output: usize,
        destination: NodeKey,
        input: usize,
        listener: StateListener,
    ) -> Result<bool, ConnectionError> {
        self.connect_node(source, output, destination, input, Some(listener))
    }

    fn connect_node(
        &mut self,
        source: NodeKey,
        output: usize,
        destination: NodeKey,
        input: usize,
        listener: Option<StateListener>,
    ) -> Result<bool, ConnectionError> {
        self.check_output(source, output)?;
        self.check_input(destination, input)?;
        let connection = OutputConnection {
            output,
            target: ConnectionTarget::Node {
                node: destination,
                input,
            },
        };
        if self.connections.get_connections(source)?.outputs.contains(&connection) {
            return Ok(false);
        }
        let cycles = self.detect_cycles(source, destination);
        let is_active = cycles.is_empty();
        if is_active && self.should_wire(source) {
            self.set_wiring(source, &connection, true)?;
        }

        let record = self.connections.get_connections_mut(source)?;
        insert_element(&mut record.outputs, connection, |c| *c == connection, true)?;
        let record = self.connections.get_connections_mut(destination)?;
        if is_active {
            let out_of_range = ConnectionError::IndexOutOfRange {
                port: Port::Input,
                index: input,
                count: 0,
            };
            let inputs = record.active_inputs.get_mut(input).ok_or(out_of_range)?;
            insert_element(
                inputs,
                ActiveInputConnection {
                    source,
                    output,
                    listener,
                },
                |c| c.source == source && c.output == output,
                false,
            )?;
        } else {
            let passive = record.passive_inputs.entry(source).or_default();
            insert_element(
                passive,
                PassiveInputConnection {
                    output,
                    input,
                    listener,
                },
                |c| c.output == output && c.input == input,
                false,
            )?;
        }
        trace!(graph = self.id, ?source, output, ?destination, input, is_active, "connected");

        if !cycles.is_empty() {
            debug!(
                graph = self.id,
                ?source,
                ?destination,
                cycles = cycles.len(),
                "connection closes a cycle and stays passive"
            );
            self.increment_cycle_counters(&cycles);
            return Ok(false);
        }
        Ok(self.update_state(destination))
    }

    /// Connect an output of `source` to a parameter. The signal is added to
    /// the automated value of the parameter.
    pub fn connect_param(
        &mut self,
        source: NodeKey,
        output: usize,
        param: ParamKey,
    ) -> Result<(), ConnectionError> {
        self.check_output(source, output)?;
        let owner = self.param_entry(param)?.owner;
        let connection = OutputConnection {
            output,
            target: ConnectionTarget::Param(param),
        };
        if self.connections.get_connections(source)?.outputs.contains(&connection) {
            return Ok(());
        }
        let cycles = self.detect_cycles(source, owner);
        let is_active = cycles.is_empty();
        if is_active && self.should_wire(source) {
            self.set_wiring(source, &connection, true)?;
        }

        let record = self.connections.get_connections_mut(source)?;
        insert_element(&mut record.outputs, connection, |c| *c == connection, true)?;
        let record = self.connections.get_param_connections_mut(param)?;
        if is_active {
            insert_element(
                &mut record.active_inputs,
                ActiveInputConnection {
                    source,
                    output,
                    listener: None,
                },
                |c| c.source == source && c.output == output,
                false,
            )?;
        } else {
            let passive = record.passive_inputs.entry(source).or_default();
            insert_element(
                passive,
                PassiveParamConnection { output, listener: None },
                |c| c.output == output,
                false,
            )?;
        }
        trace!(graph = self.id, ?source, output, ?param, is_active, "connected to parameter");
        if !cycles.is_empty() {
            self.increment_cycle_counters(&cycles);
        }
        Ok(())
    }

    /// Remove the connection from an output of `source` to an input of `destination`.
    pub fn disconnect(
        &mut self,
        source: NodeKey,
        output: usize,
        destination: NodeKey,
        input: usize,
    ) -> Result<(), ConnectionError> {
        self.check_output(source, output)?;
        self.check_input(destination, input)?;
        self.remove_connection(
            source,
            OutputConnection {
                output,
                target: ConnectionTarget::Node {
                    node: destination,
                    input,
                },
            },
        )
    }
    pub fn disconnect_param(
        &mut self,
        source: NodeKey,
        output: usize,
        param: ParamKey,
    ) -> Result<(), ConnectionError> {
        self.check_output(source, output)?;
        self.param_entry(param)?;
        self.remove_connection(
            source,
            OutputConnection {
                output,
                target: ConnectionTarget::Param(param),
            },
        )
    }
    /// Remove every connection leaving `output` of `source`. Returns the
    /// number of connections removed.
    pub fn disconnect_output(
        &mut self,
        source: NodeKey,
        output: usize,
    ) -> Result<usize, ConnectionError> {
        self.check_output(source, output)?;
        self.remove_connections_where(source, |c| c.output == output)
    }
    /// Remove every connection from `source` to `destination` or one of its
    /// parameters. It is an error if there are none.
    pub fn disconnect_node(
        &mut self,
        source: NodeKey,
        destination: NodeKey,
    ) -> Result<usize, ConnectionError> {
        let params = self.node(destination)?.params.clone();
        let removed = self.remove_connections_where(source, |c| match c.target {
            ConnectionTarget::Node { node, .. } => node == destination,
            ConnectionTarget::Param(param) => params.contains(&param),
        })?;
        if removed == 0 {
            return Err(ConnectionError::NotFound);
        }
        Ok(removed)
    }
    /// Remove every connection leaving `source`
    pub fn disconnect_all(&mut self, source: NodeKey) -> Result<usize, ConnectionError> {
        self.remove_connections_where(source, |_| true)
    }

    fn remove_connections_where(
        &mut self,
        source: NodeKey,
        predicate: impl Fn(&OutputConnection) -> bool,
    ) -> Result<usize, ConnectionError> {
        let matching: Vec<OutputConnection> = self
            .connections
            .get_connections(source)?
            .outputs
            .iter()
            .filter(|c| predicate(c))
            .copied()
            .collect();
        for connection in &matching {
            self.remove_connection(source, *connection)?;
        }
        Ok(matching.len())
    }

    fn remove_connection(
        &mut self,
        source: NodeKey,
        connection: OutputConnection,
    ) -> Result<(), ConnectionError> {
        if !self.connections.get_connections(source)?.outputs.contains(&connection) {
            return Err(ConnectionError::NotFound);
        }
        let is_active = self.connections.is_active(source, &connection);
        if is_active && self.should_wire(source) {
            self.set_wiring(source, &connection, false)?;
        }

        let record = self.connections.get_connections_mut(source)?;
        pick_element(&mut record.outputs, |c| *c == connection);
        match connection.target {
            ConnectionTarget::Node { node, input } => {
                let record = self.connections.get_connections_mut(node)?;
                if is_active {
                    if let Some(inputs) = record.active_inputs.get_mut(input) {
                        pick_element(inputs, |c| {
                            c.source == source && c.output == connection.output
                        });
                    }
                } else if let Some(passive) = record.passive_inputs.get_mut(&source) {
                    pick_element(passive, |c| c.output == connection.output && c.input == input);
                    if passive.is_empty() {
                        record.passive_inputs.remove(&source);
                    }
                }
            }
            ConnectionTarget::Param(param) => {
                let record = self.connections.get_param_connections_mut(param)?;
                if is_active {
                    pick_element(&mut record.active_inputs, |c| {
                        c.source == source && c.output == connection.output
                    });
                } else if let Some(passive) = record.passive_inputs.get_mut(&source) {
                    pick_element(passive, |c| c.output == connection.output);
                    if passive.is_empty() {
                        record.passive_inputs.remove(&source);
                    }
                }
            }
        }
        trace!(graph = self.id, ?source, ?connection, is_active, "disconnected");

        if let Some(destination) = self.connections.target_node(&connection.target) {
            let cycles = self.detect_cycles(source, destination);
            self.decrement_cycle_counters(&cycles);
        }
        if let ConnectionTarget::Node { node, .. } = connection.target {
            self.update_state(node);
        }
        Ok(())
    }

    fn detect_cycles(&self, source: NodeKey, destination: NodeKey) -> Vec<Cycle> {
        let nodes = &self.nodes;
        detect_cycles(&self.connections, source, destination, |node| {
            nodes.get(node).map_or(false, |n| n.kind.introduces_delay())
        })
    }

    /// Connections from `source` only exist on the backend if the graph is
    /// realtime and `source` is not part of a cycle.
    fn should_wire(&self, source: NodeKey) -> bool {
        self.is_realtime() && !self.cycle_counters.contains(source)
    }

    fn set_wiring(
        &self,
        source: NodeKey,
        connection: &OutputConnection,
        wired: bool,
    ) -> Result<(), ConnectionError> {
        let source_instance = &self.node(source)?.instance;
        match connection.target {
            ConnectionTarget::Node { node, input } => {
                let destination_instance = &self.node(node)?.instance;
                let mut backend = self.backend.lock();
                if wired {
                    backend.wire(source_instance, connection.output, destination_instance, input)?;
                } else {
                    backend.unwire(
                        source_instance,
                        connection.output,
                        destination_instance,
                        input,
                    )?;
                }
            }
            ConnectionTarget::Param(param) => {
                let param_instance = &self.param_entry(param)?.instance;
                let mut backend = self.backend.lock();
                if wired {
                    backend.wire_param(source_instance, connection.output, param_instance)?;
                } else {
                    backend.unwire_param(source_instance, connection.output, param_instance)?;
                }
            }
        }
        Ok(())
    }

    fn increment_cycle_counters(&mut self, cycles: &[Cycle]) {
        for (node, count) in visit_each_node_once(cycles) {
            if self.cycle_counters.increment(node, count) {
                debug!(graph = self.id, ?node, "node became part of a cycle");
                if self.is_realtime() {
                    self.set_outputs_wired(node, false);
                }
            }
        }
    }

    fn decrement_cycle_counters(&mut self, cycles: &[Cycle]) {
        for (node, count) in visit_each_node_once(cycles) {
            if self.cycle_counters.decrement(node, count) {
                debug!(graph = self.id, ?node, "node is no longer part of a cycle");
                self.release_from_cycle(node);
            }
        }
    }

    /// Wire or unwire every active connection leaving `node`. The connection
    /// records are already consistent at this point, so a backend failure is
    /// only logged.
    fn set_outputs_wired(&self, node: NodeKey, wired: bool) {
        let Ok(record) = self.connections.get_connections(node) else {
            return;
        };
        for connection in record.outputs.iter().filter(|c| self.connections.is_active(node, c)) {
            if let Err(error) = self.set_wiring(node, connection, wired) {
                warn!(
                    graph = self.id,
                    ?node,
                    ?connection,
                    wired,
                    %error,
                    "failed to update backend wiring"
                );
            }
        }
    }

    /// Promote the passive connections leaving `node` and wire its outputs.
    fn release_from_cycle(&mut self, node: NodeKey) {
        let outputs = match self.connections.get_connections(node) {
            Ok(record) => record.outputs.clone(),
            Err(_) => return,
        };
        let mut promoted = Vec::new();
        for connection in outputs {
            match connection.target {
                ConnectionTarget::Node {
                    node: destination,
                    input,
                } => {
                    let Ok(record) = self.connections.get_connections_mut(destination) else {
                        continue;
                    };
                    let Some(passive) = record.passive_inputs.get_mut(&node) else {
                        continue;
                    };
                    let picked = pick_element(passive, |c| {
                        c.output == connection.output && c.input == input
                    });
                    if passive.is_empty() {
                        record.passive_inputs.remove(&node);
                    }
                    if let (Some(picked), Some(inputs)) =
                        (picked, record.active_inputs.get_mut(input))
                    {
                        inputs.push(ActiveInputConnection {
                            source: node,
                            output: picked.output,
                            listener: picked.listener,
                        });
                        promoted.push(destination);
                    }
                }
                ConnectionTarget::Param(param) => {
                    let Ok(record) = self.connections.get_param_connections_mut(param) else {
                        continue;
                    };
                    let Some(passive) = record.passive_inputs.get_mut(&node) else {
                        continue;
                    };
                    let picked = pick_element(passive, |c| c.output == connection.output);
                    if passive.is_empty() {
                        record.passive_inputs.remove(&node);
                    }
                    if let Some(picked) = picked {
                        record.active_inputs.push(ActiveInputConnection {
                            source: node,
                            output: picked.output,
                            listener: picked.listener,
                        });
                    }
                }
            }
        }
        if self.is_realtime() {
            self.set_outputs_wired(node, true);
        }
        for destination in promoted {
            self.update_state(destination);
        }
    }

    fn has_active_upstream(&self, node: NodeKey) -> bool {
        let Ok(record) = self.connections.get_connections(node) else {
            return false;
        };
        record.all_active_inputs().any(|(_, c)| {
            self.nodes
                .get(c.source)
                .map_or(false, |source| source.state == NodeState::Active)
        })
    }

    /// Recompute the state of `node` and everything downstream of it along
    /// active connections. Returns true if `node` itself became active.
    fn update_state(&mut self, node: NodeKey) -> bool {
        let mut became_active = false;
        let mut queue = vec![node];
        while let Some(current) = queue.pop() {
            let Some(entry) = self.nodes.get(current) else {
                continue;
            };
            let state = if entry.kind.is_source() || self.has_active_upstream(current) {
                NodeState::Active
            } else {
                NodeState::Passive
            };
            if state == entry.state {
                continue;
            }
            if let Some(entry) = self.nodes.get_mut(current) {
                entry.state = state;
            }
            if current == node && state == NodeState::Active {
                became_active = true;
            }
            trace!(graph = self.id, node = ?current, ?state, "node changed state");
            self.notify_listeners(current, state);
            if let Ok(record) = self.connections.get_connections(current) {
                for connection in &record.outputs {
                    if let ConnectionTarget::Node { node: destination, .. } = connection.target {
                        if self.connections.is_active(current, connection) {
                            queue.push(destination);
                        }
                    }
                }
            }
        }
        became_active
    }

    fn notify_listeners(&self, source: NodeKey, state: NodeState) {
        let Ok(record) = self.connections.get_connections(source) else {
            return;
        };
        let mut listeners: Vec<StateListener> = Vec::new();
        for connection in &record.outputs {
            let output = connection.output;
            match connection.target {
                ConnectionTarget::Node { node, input } => {
                    let Ok(destination) = self.connections.get_connections(node) else {
                        continue;
                    };
                    listeners.extend(
                        destination
                            .active_inputs(input)
                            .iter()
                            .filter(|c| c.source == source && c.output == output)
                            .filter_map(|c| c.listener.clone()),
                    );
                    if let Some(passive) = destination.passive_inputs.get(&source) {
                        listeners.extend(
                            passive
                                .iter()
                                .filter(|c| c.output == output && c.input == input)
                                .filter_map(|c| c.listener.clone()),
                        );
                    }
                }
                ConnectionTarget::Param(param) => {
                    let Ok(destination) = self.connections.get_param_connections(param) else {
                        continue;
                    };
                    listeners.extend(
                        destination
                            .active_inputs
                            .iter()
                            .filter(|c| c.source == source && c.output == output)
                            .filter_map(|c| c.listener.clone()),
                    );
                }
            }
        }
        for listener in listeners {
            listener.notify(state);
        }
    }
}
