use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use strom::prelude::*;

fn target() -> RenderTarget<MemoryBackend> {
    RenderTarget::new(MemoryBackend::new(), RenderSettings::default())
}

fn count_kind(target: &RenderTarget<MemoryBackend>, name: &str) -> usize {
    target.backend().created_nodes().filter(|(_, kind)| kind.name() == name).count()
}

fn position(output: &RenderedOutput<MemoryBackend>, node: NodeKey) -> usize {
    output
        .materialized()
        .iter()
        .position(|n| *n == node)
        .expect("node was not materialized")
}

#[tokio::test]
async fn chain_is_materialized_upstream_first() -> Result<()> {
    let target = target();
    let mut graph = Graph::new_offline(&target, GraphSettings::default());
    let source = graph.push(NodeKind::ConstantSource)?;
    let gain = graph.push(NodeKind::Gain)?;
    let destination = graph.push(NodeKind::Destination)?;
    graph.connect(source, 0, gain, 0)?;
    graph.connect(gain, 0, destination, 0)?;

    let output = graph.render_to_completion(destination, &target).await?;
    assert_eq!(output.materialized(), &[source, gain, destination]);
    // The instances created when the nodes were pushed are reused
    assert_eq!(target.backend().num_nodes(), 3);
    assert_eq!(output.instance(gain), graph.instance(gain));
    let backend = target.backend();
    let (s, g, d) = (
        *output.instance(source).unwrap(),
        *output.instance(gain).unwrap(),
        *output.instance(destination).unwrap(),
    );
    assert!(backend.is_wired(s, 0, g, 0));
    assert!(backend.is_wired(g, 0, d, 0));
    assert_eq!(backend.calls().last(), Some(&BackendCall::Finalize { destination: d }));
    assert_eq!(output.buffer().length(), RenderSettings::default().length);
    Ok(())
}

#[tokio::test]
async fn shared_upstream_is_materialized_once() -> Result<()> {
    let own = target();
    let mut graph = Graph::new_offline(&own, GraphSettings::default());
    let osc = graph.push(NodeKind::Oscillator)?;
    let left = graph.push(NodeKind::Gain)?;
    let right = graph.push(NodeKind::Gain)?;
    let merger = graph.push(NodeKind::ChannelMerger { num_inputs: 2 })?;
    let destination = graph.push(NodeKind::Destination)?;
    graph.connect(osc, 0, left, 0)?;
    graph.connect(osc, 0, right, 0)?;
    graph.connect(left, 0, merger, 0)?;
    graph.connect(right, 0, merger, 1)?;
    graph.connect(merger, 0, destination, 0)?;

    let other = target();
    let output = graph.render_to_completion(destination, &other).await?;
    assert_eq!(count_kind(&other, "Oscillator"), 1);
    assert_eq!(other.backend().num_nodes(), 5);
    assert_eq!(output.materialized().len(), 5);
    assert_eq!(position(&output, osc), 0);
    assert!(position(&output, merger) > position(&output, left));
    assert!(position(&output, merger) > position(&output, right));
    assert_eq!(position(&output, destination), 4);
    Ok(())
}

#[tokio::test]
async fn sessions_are_isolated() -> Result<()> {
    let own = target();
    let mut graph = Graph::new_offline(&own, GraphSettings::default());
    let source = graph.push(NodeKind::Oscillator)?;
    let gain = graph.push(NodeKind::Gain)?;
    let destination = graph.push(NodeKind::Destination)?;
    graph.connect(source, 0, gain, 0)?;
    graph.connect(gain, 0, destination, 0)?;

    let first = target();
    let second = target();
    let (a, b) = futures::join!(
        graph.render_to_completion(destination, &first),
        graph.render_to_completion(destination, &second)
    );
    assert_eq!(a?.num_instances(), 3);
    assert_eq!(b?.num_instances(), 3);
    assert_eq!(first.backend().num_nodes(), 3);
    assert_eq!(second.backend().num_nodes(), 3);
    assert_eq!(first.backend().num_wires(), 2);
    assert_eq!(second.backend().num_wires(), 2);
    // The graph's own target is untouched
    assert_eq!(own.backend().num_wires(), 0);
    Ok(())
}

#[tokio::test]
async fn a_target_is_rendered_into_once() -> Result<()> {
    let target = target();
    let mut graph = Graph::new_offline(&target, GraphSettings::default());
    let destination = graph.push(NodeKind::Destination)?;
    graph.render_to_completion(destination, &target).await?;
    let again = graph.render_to_completion(destination, &target).await;
    assert_eq!(again.unwrap_err(), RenderError::TargetClaimed);
    Ok(())
}

#[tokio::test]
async fn realtime_nodes_have_no_renderer() -> Result<()> {
    let mut graph = Graph::new(MemoryBackend::new(), GraphSettings::default());
    let destination = graph.push(NodeKind::Destination)?;
    let result = graph.render_to_completion(destination, &target()).await;
    assert_eq!(result.unwrap_err(), RenderError::MissingRenderer(destination));
    Ok(())
}

struct Failing {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl RenderDelegate<MemoryBackend> for Failing {
    async fn materialize(
        &self,
        _context: MaterializeContext<MemoryBackend>,
    ) -> Result<MemoryNode, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(RenderError::Delegate("no instances left".into()))
    }
}

#[tokio::test]
async fn errors_reach_every_requester() -> Result<()> {
    let own = target();
    let mut graph = Graph::new_offline(&own, GraphSettings::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let broken = graph.push_with_renderer(
        NodeKind::Oscillator,
        Some(Arc::new(Failing { calls: calls.clone() })),
    )?;
    let left = graph.push(NodeKind::Gain)?;
    let right = graph.push(NodeKind::Gain)?;
    graph.connect(broken, 0, left, 0)?;
    graph.connect(broken, 0, right, 0)?;

    let other = target();
    let session = graph.render_session(&other)?;
    let (l, r) = futures::join!(session.render(left), session.render(right));
    let expected = RenderError::Delegate("no instances left".into());
    assert_eq!(l.unwrap_err(), expected);
    assert_eq!(r.unwrap_err(), expected);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(session.state(left), RenderState::Rendering);
    assert!(session.instance(left).is_none());
    assert!(session.materialized().is_empty());
    Ok(())
}

struct Counting {
    created: Arc<AtomicUsize>,
}

#[async_trait]
impl RenderDelegate<MemoryBackend> for Counting {
    async fn materialize(
        &self,
        context: MaterializeContext<MemoryBackend>,
    ) -> Result<MemoryNode, RenderError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        assert!(context.existing_instance().is_none());
        context.create_instance()
    }
}

#[tokio::test]
async fn repeated_requests_share_one_materialization() -> Result<()> {
    let own = target();
    let mut graph = Graph::new_offline(&own, GraphSettings::default());
    let created = Arc::new(AtomicUsize::new(0));
    let node = graph.push_with_renderer(
        NodeKind::Gain,
        Some(Arc::new(Counting {
            created: created.clone(),
        })),
    )?;
    let other = target();
    let session = graph.render_session(&other)?;
    assert_eq!(session.state(node), RenderState::NotStarted);
    let first = session.render(node);
    let second = session.render(node);
    assert_eq!(session.state(node), RenderState::Rendering);
    let (first, second) = futures::join!(first, second);
    assert_eq!(first?, second?);
    assert_eq!(session.render(node).await?, session.instance(node).unwrap());
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(session.state(node), RenderState::Done);
    Ok(())
}

#[tokio::test]
async fn pending_nodes_are_rendered() -> Result<()> {
    let target = target();
    let mut graph = Graph::new_offline(&target, GraphSettings::default());
    let osc = graph.push(NodeKind::Oscillator)?;
    let analyser = graph.push(NodeKind::Analyser)?;
    let unused = graph.push(NodeKind::Gain)?;
    let destination = graph.push(NodeKind::Destination)?;
    graph.connect(osc, 0, analyser, 0)?;
    graph.connect(osc, 0, destination, 0)?;

    let output = graph.render_to_completion(destination, &target).await?;
    assert!(output.materialized().contains(&analyser));
    assert!(output.instance(unused).is_none());
    assert_eq!(output.materialized().len(), 3);
    let backend = target.backend();
    assert!(backend.is_wired(
        *output.instance(osc).unwrap(),
        0,
        *output.instance(analyser).unwrap(),
        0
    ));
    Ok(())
}

#[tokio::test]
async fn automation_is_replayed_in_order() -> Result<()> {
    let own = target();
    let mut graph = Graph::new_offline(&own, GraphSettings::default());
    let source = graph.push(NodeKind::ConstantSource)?;
    let gain = graph.push(NodeKind::Gain)?;
    let destination = graph.push(NodeKind::Destination)?;
    graph.connect(source, 0, gain, 0)?;
    graph.connect(gain, 0, destination, 0)?;
    let level = graph.param(gain, "gain").unwrap();
    graph.set_value_at_time(level, 0.0, 0.0)?;
    graph.linear_ramp_to_value_at_time(level, 1.0, 0.5)?;
    graph.set_target_at_time(level, 0.2, 0.75, 0.1)?;
    let expected: Vec<AutomationEvent> = graph.automation_events(level)?.iter().cloned().collect();

    let other = target();
    let output = graph.render_to_completion(destination, &other).await?;
    let gain_instance = *output.instance(gain).unwrap();
    let mut backend = other.backend();
    let param = backend.param(&gain_instance, "gain")?;
    let replayed: Vec<AutomationEvent> =
        backend.automation_of(param).into_iter().cloned().collect();
    assert_eq!(replayed, expected);
    Ok(())
}

#[tokio::test]
async fn nodes_in_a_cycle_are_rendered_but_not_wired() -> Result<()> {
    let own = target();
    let mut graph = Graph::new_offline(&own, GraphSettings::default());
    let osc = graph.push(NodeKind::Oscillator)?;
    let a = graph.push(NodeKind::Gain)?;
    let b = graph.push(NodeKind::Gain)?;
    let destination = graph.push(NodeKind::Destination)?;
    graph.connect(osc, 0, a, 0)?;
    graph.connect(a, 0, b, 0)?;
    graph.connect(b, 0, a, 0)?;
    graph.connect(b, 0, destination, 0)?;
    assert!(graph.is_part_of_a_cycle(a) && graph.is_part_of_a_cycle(b));

    let other = target();
    let output = graph.render_to_completion(destination, &other).await?;
    assert_eq!(output.materialized(), &[osc, a, b, destination]);
    assert_eq!(other.backend().num_nodes(), 4);
    let backend = other.backend();
    let instance = |node: NodeKey| *output.instance(node).unwrap();
    // Only the oscillator is outside of the cycle
    assert!(backend.is_wired(instance(osc), 0, instance(a), 0));
    assert!(!backend.is_wired(instance(a), 0, instance(b), 0));
    assert!(!backend.is_wired(instance(b), 0, instance(a), 0));
    assert!(!backend.is_wired(instance(b), 0, instance(destination), 0));
    assert_eq!(backend.num_wires(), 1);
    Ok(())
}

#[tokio::test]
async fn loops_through_a_delay_render() -> Result<()> {
    let target = target();
    let mut graph = Graph::new_offline(&target, GraphSettings::default());
    let osc = graph.push(NodeKind::Oscillator)?;
    let gain = graph.push(NodeKind::Gain)?;
    let delay = graph.push(NodeKind::Delay { max_delay_time: 0.5 })?;
    let destination = graph.push(NodeKind::Destination)?;
    graph.connect(osc, 0, gain, 0)?;
    graph.connect(gain, 0, delay, 0)?;
    graph.connect(delay, 0, gain, 0)?;
    graph.connect(gain, 0, destination, 0)?;

    let output = graph.render_to_completion(destination, &target).await?;
    assert_eq!(output.materialized().len(), 4);
    assert!(position(&output, gain) > position(&output, osc));
    assert_eq!(position(&output, destination), 3);
    let backend = target.backend();
    let (g, d) = (*output.instance(gain).unwrap(), *output.instance(delay).unwrap());
    assert!(backend.is_wired(g, 0, d, 0));
    assert!(backend.is_wired(d, 0, g, 0));
    assert_eq!(backend.num_wires(), 4);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn renders_on_a_spawned_task() -> Result<()> {
    let target = target();
    let mut graph = Graph::new_offline(&target, GraphSettings::default());
    let source = graph.push(NodeKind::BufferSource)?;
    let destination = graph.push(NodeKind::Destination)?;
    graph.connect(source, 0, destination, 0)?;
    let render = graph.render_to_completion(destination, &target);
    let output = tokio::spawn(render).await??;
    assert_eq!(output.materialized(), &[source, destination]);
    Ok(())
}
