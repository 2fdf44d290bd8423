use crate::Sample;

/// Whether a node is currently producing (or passing on) sound.
///
/// Source nodes are always [`NodeState::Active`]. Any other node is active
/// exactly when at least one active connection reaches it from an active
/// node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-derive", derive(serde::Serialize, serde::Deserialize))]
pub enum NodeState {
    Active,
    Passive,
}

/// Describes one automatable parameter of a [`NodeKind`]
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-derive", derive(serde::Serialize, serde::Deserialize))]
pub struct ParamDescriptor {
    pub name: String,
    pub default_value: Sample,
}

impl ParamDescriptor {
    pub fn new(name: impl Into<String>, default_value: Sample) -> Self {
        Self {
            name: name.into(),
            default_value,
        }
    }
}

/// The kinds of node a [`Graph`](crate::graph::Graph) knows about.
///
/// The kind decides the number of inputs and outputs, the parameters, and
/// the few properties the graph cares about: whether the node produces sound
/// by itself, whether it delays its input (which makes a feedback loop
/// through it legal) and whether it has to be rendered even if nothing is
/// connected to its output.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-derive", derive(serde::Serialize, serde::Deserialize))]
pub enum NodeKind {
    /// Where a graph ends up. One input, no outputs.
    Destination,
    Gain,
    Delay {
        max_delay_time: f64,
    },
    Oscillator,
    ConstantSource,
    BufferSource,
    BiquadFilter,
    StereoPanner,
    DynamicsCompressor,
    WaveShaper,
    Convolver,
    /// Passes audio through unchanged while inspecting it
    Analyser,
    ChannelMerger {
        num_inputs: usize,
    },
    ChannelSplitter {
        num_outputs: usize,
    },
    /// A user defined processor
    Worklet {
        name: String,
        num_inputs: usize,
        num_outputs: usize,
        params: Vec<ParamDescriptor>,
    },
}

impl NodeKind {
    pub fn name(&self) -> &str {
        match self {
            NodeKind::Destination => "Destination",
            NodeKind::Gain => "Gain",
            NodeKind::Delay { .. } => "Delay",
            NodeKind::Oscillator => "Oscillator",
            NodeKind::ConstantSource => "ConstantSource",
            NodeKind::BufferSource => "BufferSource",
            NodeKind::BiquadFilter => "BiquadFilter",
            NodeKind::StereoPanner => "StereoPanner",
            NodeKind::DynamicsCompressor => "DynamicsCompressor",
            NodeKind::WaveShaper => "WaveShaper",
            NodeKind::Convolver => "Convolver",
            NodeKind::Analyser => "Analyser",
            NodeKind::ChannelMerger { .. } => "ChannelMerger",
            NodeKind::ChannelSplitter { .. } => "ChannelSplitter",
            NodeKind::Worklet { name, .. } => name,
        }
    }
    pub fn num_inputs(&self) -> usize {
        match self {
            NodeKind::Oscillator | NodeKind::ConstantSource | NodeKind::BufferSource => 0,
            NodeKind::ChannelMerger { num_inputs } => *num_inputs,
            NodeKind::Worklet { num_inputs, .. } => *num_inputs,
            _ => 1,
        }
    }
    pub fn num_outputs(&self) -> usize {
        match self {
            NodeKind::Destination => 0,
            NodeKind::ChannelSplitter { num_outputs } => *num_outputs,
            NodeKind::Worklet { num_outputs, .. } => *num_outputs,
            _ => 1,
        }
    }
    /// Source nodes produce sound without any input and are always active.
    pub fn is_source(&self) -> bool {
        matches!(
            self,
            NodeKind::Oscillator
                | NodeKind::ConstantSource
                | NodeKind::BufferSource
                | NodeKind::Worklet { .. }
        )
    }
    /// A loop through a node that delays its input is not a cycle as far as
    /// the graph is concerned.
    pub fn introduces_delay(&self) -> bool {
        matches!(self, NodeKind::Delay { .. })
    }
    /// Nodes with side effects are rendered offline even if their output
    /// doesn't reach the destination.
    pub fn has_side_effects(&self) -> bool {
        matches!(self, NodeKind::Analyser | NodeKind::Worklet { .. })
    }
    pub fn params(&self) -> Vec<ParamDescriptor> {
        let p = ParamDescriptor::new;
        match self {
            NodeKind::Gain => vec![p("gain", 1.0)],
            NodeKind::Delay { .. } => vec![p("delayTime", 0.0)],
            NodeKind::Oscillator => vec![p("frequency", 440.0), p("detune", 0.0)],
            NodeKind::ConstantSource => vec![p("offset", 1.0)],
            NodeKind::BufferSource => vec![p("playbackRate", 1.0), p("detune", 0.0)],
            NodeKind::BiquadFilter => vec![
                p("frequency", 350.0),
                p("detune", 0.0),
                p("Q", 1.0),
                p("gain", 0.0),
            ],
            NodeKind::StereoPanner => vec![p("pan", 0.0)],
            NodeKind::DynamicsCompressor => vec![
                p("threshold", -24.0),
                p("knee", 30.0),
                p("ratio", 12.0),
                p("attack", 0.003),
                p("release", 0.25),
            ],
            NodeKind::Worklet { params, .. } => params.clone(),
            NodeKind::Destination
            | NodeKind::WaveShaper
            | NodeKind::Convolver
            | NodeKind::Analyser
            | NodeKind::ChannelMerger { .. }
            | NodeKind::ChannelSplitter { .. } => vec![],
        }
    }
}
