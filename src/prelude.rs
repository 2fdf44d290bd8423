//! Exports the most often used parts of Strom

pub use crate::automation::{AutomationEvent, AutomationEventList};
pub use crate::backend::{
    Backend, BackendCall, BackendError, MemoryBackend, MemoryNode, MemoryParam, Port,
};
pub use crate::graph::{
    ConnectionError, ConnectionTarget, Graph, GraphMode, GraphSettings, NodeKey, NodeKind,
    NodeState, ParamDescriptor, ParamKey, StateListener,
};
pub use crate::offline::{AudioBuffer, RenderSettings, RenderTarget, RenderedOutput};
pub use crate::param::AutomationError;
pub use crate::render::{
    KindRenderer, MaterializeContext, RenderDelegate, RenderError, RenderSession, RenderState,
};
pub use crate::{Sample, StromError};
