//! Targets and results of offline rendering.
//!
//! A [`RenderTarget`] is a backend set aside for rendering a graph offline,
//! together with the [`RenderSettings`] for that render. An offline
//! [`Graph`] is bound to one target when it is created and creates its node
//! instances there. Rendering into the graph's own target reuses those
//! instances, rendering into any other target materializes the graph anew.
//!
//! A target can only be rendered into once, just like an offline audio
//! context can only be started once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

#[allow(unused)]
use crate::graph::Graph;
use crate::{backend::Backend, graph::NodeKey, Sample, NEXT_TARGET_ID};

/// Identifies a [`RenderTarget`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TargetId(pub(crate) u64);

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde-derive", derive(serde::Serialize, serde::Deserialize))]
pub struct RenderSettings {
    /// Length of the rendered output in frames
    pub length: usize,
    pub sample_rate: Sample,
    pub num_channels: usize,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            length: 44100,
            sample_rate: 44100.,
            num_channels: 2,
        }
    }
}

/// Rendered audio, one `Vec` per channel.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioBuffer {
    sample_rate: Sample,
    channels: Vec<Vec<Sample>>,
}

impl AudioBuffer {
    pub fn new(sample_rate: Sample, channels: Vec<Vec<Sample>>) -> Self {
        Self { sample_rate, channels }
    }
    /// A buffer of the size given by `settings` containing only zeroes
    pub fn silent(settings: &RenderSettings) -> Self {
        Self {
            sample_rate: settings.sample_rate,
            channels: vec![vec![0.0; settings.length]; settings.num_channels],
        }
    }
    pub fn sample_rate(&self) -> Sample {
        self.sample_rate
    }
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }
    /// Number of frames
    pub fn length(&self) -> usize {
        self.channels.first().map_or(0, |c| c.len())
    }
    pub fn duration(&self) -> f64 {
        self.length() as f64 / self.sample_rate as f64
    }
    pub fn channel(&self, index: usize) -> Option<&[Sample]> {
        self.channels.get(index).map(|c| c.as_slice())
    }
}

/// A backend dedicated to one offline render.
///
/// Cloning a `RenderTarget` gives another handle to the same backend.
pub struct RenderTarget<B: Backend> {
    id: TargetId,
    backend: Arc<Mutex<B>>,
    settings: RenderSettings,
    claimed: Arc<AtomicBool>,
}

impl<B: Backend> Clone for RenderTarget<B> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            backend: self.backend.clone(),
            settings: self.settings,
            claimed: self.claimed.clone(),
        }
    }
}

impl<B: Backend> RenderTarget<B> {
    pub fn new(backend: B, settings: RenderSettings) -> Self {
        Self {
            id: TargetId(NEXT_TARGET_ID.fetch_add(1, Ordering::SeqCst)),
            backend: Arc::new(Mutex::new(backend)),
            settings,
            claimed: Arc::new(AtomicBool::new(false)),
        }
    }
    pub fn id(&self) -> TargetId {
        self.id
    }
    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }
    /// Lock the backend for inspection. Don't hold on to the guard while a
    /// render is in progress.
    pub fn backend(&self) -> MutexGuard<'_, B> {
        self.backend.lock()
    }
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }
    pub(crate) fn shared_backend(&self) -> Arc<Mutex<B>> {
        self.backend.clone()
    }
    /// Returns true the first time it is called for a target
    pub(crate) fn claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::SeqCst)
    }
}

/// The result of
/// [`RenderSession::render_to_completion`](crate::render::RenderSession::render_to_completion)
pub struct RenderedOutput<B: Backend> {
    pub(crate) buffer: AudioBuffer,
    pub(crate) materialized: Vec<NodeKey>,
    pub(crate) instances: HashMap<NodeKey, B::Node>,
}

impl<B: Backend> std::fmt::Debug for RenderedOutput<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderedOutput")
            .field("buffer", &self.buffer)
            .field("materialized", &self.materialized)
            .field("instances", &self.instances)
            .finish()
    }
}

impl<B: Backend> RenderedOutput<B> {
    pub fn buffer(&self) -> &AudioBuffer {
        &self.buffer
    }
    pub fn into_buffer(self) -> AudioBuffer {
        self.buffer
    }
    /// The nodes of the graph in the order their instances were materialized
    pub fn materialized(&self) -> &[NodeKey] {
        &self.materialized
    }
    /// The backend instance `node` was materialized as
    pub fn instance(&self, node: NodeKey) -> Option<&B::Node> {
        self.instances.get(&node)
    }
    pub fn num_instances(&self) -> usize {
        self.instances.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[test]
    fn silent_buffer_has_requested_shape() {
        let settings = RenderSettings {
            length: 128,
            sample_rate: 48000.,
            num_channels: 1,
        };
        let buffer = AudioBuffer::silent(&settings);
        assert_eq!(buffer.length(), 128);
        assert_eq!(buffer.num_channels(), 1);
        assert!(buffer.channel(0).unwrap().iter().all(|s| *s == 0.0));
        assert!(buffer.channel(1).is_none());
    }

    #[test]
    fn targets_are_claimed_once() {
        let target = RenderTarget::new(MemoryBackend::new(), RenderSettings::default());
        let other_handle = target.clone();
        assert!(!target.is_claimed());
        assert!(other_handle.claim());
        assert!(!target.claim());
        assert!(target.is_claimed());
        let other = RenderTarget::new(MemoryBackend::new(), RenderSettings::default());
        assert_ne!(target.id(), other.id());
    }
}
