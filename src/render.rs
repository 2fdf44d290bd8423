//! Offline rendering.
//!
//! Rendering turns the nodes of a [`Graph`] into instances on a
//! [`RenderTarget`]. A [`RenderSession`] starts at a destination node and
//! walks the active connections upstream. Every node is materialized exactly
//! once per session, even if many nodes depend on it and request it
//! concurrently: the first request starts materializing it and everyone
//! else waits for the same shared future.
//!
//! For each node the session
//! 1. renders every node feeding one of its inputs or parameters,
//! 2. asks the node's [`RenderDelegate`] for an instance on the target,
//! 3. wires the upstream instances into it and replays the automation of its
//!    parameters. Inputs coming from a node that is part of a cycle are
//!    rendered, but not wired.
//!
//! A node that delays its input is the exception. It is materialized without
//! waiting for its inputs, which are rendered and wired once the rest of the
//! graph is done. That is what makes a feedback loop through a delay
//! renderable.
//!
//! The session snapshots the graph when it is created, later changes to the
//! graph don't affect it.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::automation::AutomationEventList;
use crate::backend::{Backend, BackendError};
use crate::graph::{Graph, GraphMode, NodeKey, NodeKind};
use crate::offline::{RenderTarget, RenderedOutput, TargetId};
use crate::NEXT_SESSION_ID;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    #[error("The node {0:?} is not part of the rendered graph.")]
    MissingNode(NodeKey),
    #[error("The node {0:?} has no renderer and can not be rendered offline.")]
    MissingRenderer(NodeKey),
    #[error("The render target has already been rendered into.")]
    TargetClaimed,
    #[error("The renderer failed: {0}")]
    Delegate(String),
    #[error("The backend failed during rendering: {0}")]
    Backend(#[from] BackendError),
}

/// Identifies a [`RenderSession`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

/// Everything a [`RenderDelegate`] gets to know about the node it materializes
pub struct MaterializeContext<B: Backend> {
    node: NodeKey,
    kind: NodeKind,
    existing: Option<B::Node>,
    backend: Arc<Mutex<B>>,
    session: SessionId,
}

impl<B: Backend> MaterializeContext<B> {
    pub fn node(&self) -> NodeKey {
        self.node
    }
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }
    pub fn session(&self) -> SessionId {
        self.session
    }
    /// The instance the node already has on the render target, if it was
    /// created there by an offline graph.
    pub fn existing_instance(&self) -> Option<&B::Node> {
        self.existing.as_ref()
    }
    /// Create a new instance of the node's kind on the render target
    pub fn create_instance(&self) -> Result<B::Node, RenderError> {
        Ok(self.backend.lock().create_node(&self.kind)?)
    }
    /// Run `f` with the render target's backend locked
    pub fn with_backend<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        f(&mut self.backend.lock())
    }
}

/// Produces the backend instance of a node during offline rendering.
///
/// The session has already rendered the node's upstream when this is called
/// and takes care of wiring and automation afterwards.
#[async_trait]
pub trait RenderDelegate<B: Backend>: Send + Sync {
    async fn materialize(&self, context: MaterializeContext<B>) -> Result<B::Node, RenderError>;
}

/// The default renderer: reuse the instance the node already has on the
/// target, or create one from its kind.
#[derive(Clone, Copy, Debug, Default)]
pub struct KindRenderer;

#[async_trait]
impl<B: Backend> RenderDelegate<B> for KindRenderer {
    async fn materialize(&self, context: MaterializeContext<B>) -> Result<B::Node, RenderError> {
        match context.existing_instance() {
            Some(instance) => Ok(instance.clone()),
            None => context.create_instance(),
        }
    }
}

struct PlannedInput {
    source: NodeKey,
    output: usize,
    input: usize,
    // False if the source is part of a cycle
    wire: bool,
}

struct PlannedParamInput {
    source: NodeKey,
    output: usize,
    wire: bool,
}

struct PlannedParam {
    name: String,
    events: AutomationEventList,
    inputs: Vec<PlannedParamInput>,
}

struct PlannedNode<B: Backend> {
    kind: NodeKind,
    renderer: Option<Arc<dyn RenderDelegate<B>>>,
    instance: B::Node,
    inputs: Vec<PlannedInput>,
    params: Vec<PlannedParam>,
}

impl<B: Backend> PlannedNode<B> {
    fn upstream(&self) -> impl Iterator<Item = NodeKey> + '_ {
        self.inputs
            .iter()
            .map(|i| i.source)
            .chain(self.params.iter().flat_map(|p| p.inputs.iter().map(|i| i.source)))
    }
}

/// What a session renders: the graph as it was when the session started
struct RenderPlan<B: Backend> {
    graph_target: Option<TargetId>,
    nodes: HashMap<NodeKey, PlannedNode<B>>,
    pending: Vec<NodeKey>,
}

impl<B: Backend> Graph<B> {
    fn render_plan(&self) -> RenderPlan<B> {
        let mut nodes = HashMap::with_capacity(self.nodes.len());
        for (key, entry) in &self.nodes {
            let Ok(record) = self.connections.get_connections(key) else {
                continue;
            };
            let inputs = record
                .all_active_inputs()
                .map(|(input, c)| PlannedInput {
                    source: c.source,
                    output: c.output,
                    input,
                    wire: !self.is_part_of_a_cycle(c.source),
                })
                .collect();
            let params = entry
                .params
                .iter()
                .filter_map(|param| {
                    let param_entry = self.params.get(*param)?;
                    let inputs = self
                        .connections
                        .get_param_connections(*param)
                        .ok()?
                        .active_inputs()
                        .iter()
                        .map(|c| PlannedParamInput {
                            source: c.source,
                            output: c.output,
                            wire: !self.is_part_of_a_cycle(c.source),
                        })
                        .collect();
                    Some(PlannedParam {
                        name: param_entry.name.clone(),
                        events: param_entry.events.clone(),
                        inputs,
                    })
                })
                .collect();
            nodes.insert(
                key,
                PlannedNode {
                    kind: entry.kind.clone(),
                    renderer: record.renderer().cloned(),
                    instance: entry.instance.clone(),
                    inputs,
                    params,
                },
            );
        }
        RenderPlan {
            graph_target: match self.mode() {
                GraphMode::Offline(target) => Some(target),
                GraphMode::Realtime => None,
            },
            nodes,
            pending: self.pending.clone(),
        }
    }

    /// Start a session rendering this graph into `target`.
    pub fn render_session(
        &self,
        target: &RenderTarget<B>,
    ) -> Result<RenderSession<B>, RenderError> {
        if !target.claim() {
            return Err(RenderError::TargetClaimed);
        }
        Ok(RenderSession::new(self.render_plan(), target.clone()))
    }

    /// Render everything feeding `destination`, and every pending node, into
    /// `target`.
    pub fn render_to_completion(
        &self,
        destination: NodeKey,
        target: &RenderTarget<B>,
    ) -> impl std::future::Future<Output = Result<RenderedOutput<B>, RenderError>> + 'static {
        let session = self.render_session(target);
        async move { session?.render_to_completion(destination).await }
    }
}

type RenderFuture<T> = Shared<BoxFuture<'static, Result<T, RenderError>>>;

enum MemoEntry<B: Backend> {
    Rendering(RenderFuture<B::Node>),
    Done(B::Node),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RenderState {
    NotStarted,
    Rendering,
    Done,
}

struct SessionInner<B: Backend> {
    id: SessionId,
    plan: RenderPlan<B>,
    target: RenderTarget<B>,
    memo: Mutex<HashMap<NodeKey, MemoEntry<B>>>,
    materialized: Mutex<Vec<NodeKey>>,
    // Delay nodes whose inputs are yet to be connected
    deferred: Mutex<Vec<NodeKey>>,
}

/// One offline render of a graph into a [`RenderTarget`].
///
/// Cloning a session gives another handle to the same session.
pub struct RenderSession<B: Backend> {
    inner: Arc<SessionInner<B>>,
}

impl<B: Backend> Clone for RenderSession<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Backend> RenderSession<B> {
    fn new(plan: RenderPlan<B>, target: RenderTarget<B>) -> Self {
        let id = SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst));
        debug!(session = id.0, nodes = plan.nodes.len(), "starting render session");
        Self {
            inner: Arc::new(SessionInner {
                id,
                plan,
                target,
                memo: Mutex::new(HashMap::new()),
                materialized: Mutex::new(Vec::new()),
                deferred: Mutex::new(Vec::new()),
            }),
        }
    }
    pub fn id(&self) -> SessionId {
        self.inner.id
    }
    pub fn target(&self) -> &RenderTarget<B> {
        &self.inner.target
    }
    pub fn state(&self, node: NodeKey) -> RenderState {
        match self.inner.memo.lock().get(&node) {
            None => RenderState::NotStarted,
            Some(MemoEntry::Rendering(_)) => RenderState::Rendering,
            Some(MemoEntry::Done(_)) => RenderState::Done,
        }
    }
    /// The instance `node` was materialized as, if it is done
    pub fn instance(&self, node: NodeKey) -> Option<B::Node> {
        match self.inner.memo.lock().get(&node) {
            Some(MemoEntry::Done(instance)) => Some(instance.clone()),
            _ => None,
        }
    }
    /// Nodes in the order they were materialized
    pub fn materialized(&self) -> Vec<NodeKey> {
        self.inner.materialized.lock().clone()
    }

    /// Render `node` and everything upstream of it.
    ///
    /// Concurrent and repeated requests for the same node share one
    /// materialization, including its error if it fails. Inputs of delay
    /// nodes are only connected by [`RenderSession::render_to_completion`].
    pub fn render(&self, node: NodeKey) -> BoxFuture<'static, Result<B::Node, RenderError>> {
        let mut memo = self.inner.memo.lock();
        match memo.get(&node) {
            Some(MemoEntry::Done(instance)) => return future::ready(Ok(instance.clone())).boxed(),
            Some(MemoEntry::Rendering(shared)) => return shared.clone().boxed(),
            None => (),
        }
        let shared = self.clone().materialize(node).boxed().shared();
        memo.insert(node, MemoEntry::Rendering(shared.clone()));
        shared.boxed()
    }

    async fn materialize(self, node: NodeKey) -> Result<B::Node, RenderError> {
        let inner = self.inner.clone();
        let planned = inner.plan.nodes.get(&node).ok_or(RenderError::MissingNode(node))?;
        let renderer = planned.renderer.clone().ok_or(RenderError::MissingRenderer(node))?;
        let delayed = planned.kind.introduces_delay();
        let upstream = if delayed {
            Vec::new()
        } else {
            self.render_upstream(planned).await?
        };

        let existing = if inner.plan.graph_target == Some(inner.target.id()) {
            Some(planned.instance.clone())
        } else {
            None
        };
        let context = MaterializeContext {
            node,
            kind: planned.kind.clone(),
            existing,
            backend: inner.target.shared_backend(),
            session: inner.id,
        };
        let instance = renderer.materialize(context).await?;

        if !delayed {
            self.connect_upstream(planned, &instance, upstream)?;
        }
        self.replay_automation(planned, &instance)?;
        inner.materialized.lock().push(node);
        inner.memo.lock().insert(node, MemoEntry::Done(instance.clone()));
        if delayed {
            inner.deferred.lock().push(node);
        }
        trace!(session = inner.id.0, ?node, kind = planned.kind.name(), "materialized node");
        Ok(instance)
    }

    /// Render every node feeding `planned`, in the order of [`PlannedNode::upstream`]
    async fn render_upstream(&self, planned: &PlannedNode<B>) -> Result<Vec<B::Node>, RenderError> {
        let requests: Vec<_> = planned.upstream().map(|source| self.render(source)).collect();
        future::try_join_all(requests).await
    }

    fn connect_upstream(
        &self,
        planned: &PlannedNode<B>,
        instance: &B::Node,
        upstream: Vec<B::Node>,
    ) -> Result<(), RenderError> {
        let mut upstream = upstream.into_iter();
        let mut backend = self.inner.target.backend();
        for input in &planned.inputs {
            match upstream.next() {
                Some(source) if input.wire => {
                    backend.wire(&source, input.output, instance, input.input)?
                }
                _ => (),
            }
        }
        for param in planned.params.iter().filter(|p| !p.inputs.is_empty()) {
            let handle = backend.param(instance, &param.name)?;
            for input in &param.inputs {
                match upstream.next() {
                    Some(source) if input.wire => {
                        backend.wire_param(&source, input.output, &handle)?
                    }
                    _ => (),
                }
            }
        }
        Ok(())
    }

    fn replay_automation(
        &self,
        planned: &PlannedNode<B>,
        instance: &B::Node,
    ) -> Result<(), RenderError> {
        let mut backend = self.inner.target.backend();
        for param in planned.params.iter().filter(|p| !p.events.is_empty()) {
            let handle = backend.param(instance, &param.name)?;
            param.events.replay(&mut *backend, &handle)?;
        }
        Ok(())
    }

    async fn connect_deferred(&self, node: NodeKey) -> Result<(), RenderError> {
        let inner = self.inner.clone();
        let planned = inner.plan.nodes.get(&node).ok_or(RenderError::MissingNode(node))?;
        let instance = self.instance(node).ok_or(RenderError::MissingNode(node))?;
        let upstream = self.render_upstream(planned).await?;
        self.connect_upstream(planned, &instance, upstream)
    }

    /// Render `destination`, every pending node and the inputs of every delay
    /// node reached, then let the backend produce the output.
    pub async fn render_to_completion(
        self,
        destination: NodeKey,
    ) -> Result<RenderedOutput<B>, RenderError> {
        debug!(session = self.inner.id.0, ?destination, "rendering to completion");
        let destination_instance = self.render(destination).await?;
        let pending: Vec<_> = self
            .inner
            .plan
            .pending
            .iter()
            .filter(|node| **node != destination)
            .map(|node| self.render(*node))
            .collect();
        future::try_join_all(pending).await?;
        loop {
            let next = self.inner.deferred.lock().pop();
            let Some(node) = next else {
                break;
            };
            self.connect_deferred(node).await?;
        }

        let buffer = {
            let settings = *self.inner.target.settings();
            let mut backend = self.inner.target.backend();
            backend.finalize(&destination_instance, &settings)?
        };
        let instances = self
            .inner
            .memo
            .lock()
            .iter()
            .filter_map(|(node, entry)| match entry {
                MemoEntry::Done(instance) => Some((*node, instance.clone())),
                MemoEntry::Rendering(_) => None,
            })
            .collect();
        let materialized = self.materialized();
        debug!(
            session = self.inner.id.0,
            nodes = materialized.len(),
            "render session finished"
        );
        Ok(RenderedOutput {
            buffer,
            materialized,
            instances,
        })
    }
}
