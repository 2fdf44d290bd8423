//! # Strom - connection tracking and offline rendering for audio graphs
//!
//! Strom keeps the books for a mutable, possibly cyclic graph of audio nodes
//! and turns that graph into concrete processing units on some audio
//! [`Backend`]. It does two things:
//!
//! - It tracks which connections are _active_ (safe to wire into a
//!   synchronous audio backend) and which are only _passive_ (declared, but
//!   kept out of the backend because they would close a feedback loop).
//!   Feedback loops are detected when they are formed and counted per node so
//!   that they can be released again when the loop is broken.
//! - It renders a graph offline: starting from a destination node it
//!   materializes every node feeding it exactly once per
//!   [`RenderSession`](render::RenderSession), wires the materialized
//!   instances together and replays the automation of every parameter.
//!
//! The DSP itself is out of scope. Everything that actually makes sound lives
//! behind the [`Backend`] trait. [`MemoryBackend`] is a backend that only
//! records what it is asked to do, which is useful for tests and tooling.
//!
//! ## Architecture
//!
//! The core is the [`Graph`] struct. Nodes are pushed onto a [`Graph`] and
//! addressed by [`NodeKey`]s, automatable parameters by [`ParamKey`]s.
//! Connections are changed through [`Graph::connect`] and
//! [`Graph::disconnect`] and their variants, which are the only way to
//! change the topology.
//!
//! ```
//! # use strom::prelude::*;
//! let mut graph = Graph::new(MemoryBackend::new(), GraphSettings::default());
//! let osc = graph.push(NodeKind::Oscillator)?;
//! let gain = graph.push(NodeKind::Gain)?;
//! // The oscillator is a source, so the gain becomes active by this connection
//! assert!(graph.connect(osc, 0, gain, 0)?);
//! // A connection back to the oscillator would have no input to go to, but
//! // one from the gain to itself closes a loop and is kept passive.
//! graph.connect(gain, 0, gain, 0)?;
//! assert!(graph.is_part_of_a_cycle(gain));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Offline rendering happens through a [`RenderTarget`]:
//!
//! ```
//! # use strom::prelude::*;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let target = RenderTarget::new(MemoryBackend::new(), RenderSettings::default());
//! let mut graph = Graph::new_offline(&target, GraphSettings::default());
//! let source = graph.push(NodeKind::ConstantSource)?;
//! let destination = graph.push(NodeKind::Destination)?;
//! graph.connect(source, 0, destination, 0)?;
//! let output = futures::executor::block_on(graph.render_to_completion(destination, &target))?;
//! assert_eq!(output.materialized(), &[source, destination]);
//! # Ok(())
//! # }
//! ```

#![deny(rustdoc::broken_intra_doc_links)] // error if there are broken intra-doc links

use std::sync::atomic::AtomicU64;

pub mod automation;
pub mod backend;
pub mod graph;
pub mod offline;
pub mod param;
pub mod prelude;
pub mod render;

// Import these for docs
#[allow(unused_imports)]
use backend::{Backend, MemoryBackend};
#[allow(unused_imports)]
use graph::{Graph, NodeKey, ParamKey};
#[allow(unused_imports)]
use offline::RenderTarget;

pub type Sample = f32;

/// Get a unique id for a Graph from this by using `fetch_add`
pub(crate) static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(0);
pub(crate) static NEXT_TARGET_ID: AtomicU64 = AtomicU64::new(0);
pub(crate) static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(0);

#[derive(thiserror::Error, Debug)]
pub enum StromError {
    #[error("There was an error adding or removing connections between nodes: {0}")]
    ConnectionError(#[from] graph::connection::ConnectionError),
    #[error("There was an error scheduling automation: {0}")]
    AutomationError(#[from] param::AutomationError),
    #[error("The backend refused an operation: {0}")]
    BackendError(#[from] backend::BackendError),
    #[error("Offline rendering failed: {0}")]
    RenderError(#[from] render::RenderError),
}
