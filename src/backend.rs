//! Backends are what actually process audio.
//!
//! A [`Graph`] never touches audio itself. It tells a [`Backend`] which
//! processing units to create, how to wire them together and which automation
//! to apply to their parameters. In a realtime [`Graph`] this happens as the
//! topology changes, for offline rendering it happens once per
//! [`RenderSession`].
//!
//! [`MemoryBackend`] implements the trait without making any sound. It keeps
//! track of what is wired to what and records every call, which makes it
//! useful for tests and for inspecting what a graph would do.

#[allow(unused)]
use crate::{graph::Graph, render::RenderSession};

use crate::automation::AutomationEvent;
use crate::graph::NodeKind;
use crate::offline::{AudioBuffer, RenderSettings};
use crate::Sample;

pub use memory_backend::{BackendCall, MemoryBackend, MemoryNode, MemoryParam};

/// Which side of a node a port index refers to
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-derive", derive(serde::Serialize, serde::Deserialize))]
pub enum Port {
    Input,
    Output,
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Port::Input => write!(f, "input"),
            Port::Output => write!(f, "output"),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("The {port} index {index} is out of range, the node has {count} {port}s")]
    PortRange { port: Port, index: usize, count: usize },
    #[error("The backend does not support nodes of kind `{0}`")]
    UnsupportedKind(String),
    #[error("The backend has no node with that handle")]
    UnknownNode,
    #[error("The node has no parameter called `{0}`")]
    UnknownParam(String),
    #[error("The two nodes are not wired together")]
    NotConnected,
    #[error("The backend rejected the operation: {0}")]
    Rejected(String),
}

/// The operations the graph needs from an audio engine.
///
/// Implementations are shared between the graph and concurrently rendering
/// nodes behind a lock, so they have to be `Send`. Node and parameter
/// handles are cloned freely and should be cheap to clone.
pub trait Backend: Send + 'static {
    /// Handle to a processing unit living on this backend
    type Node: Clone + std::fmt::Debug + PartialEq + Send + Sync + 'static;
    /// Handle to an automatable parameter of a [`Backend::Node`]
    type Param: Clone + std::fmt::Debug + Send + Sync + 'static;

    fn create_node(&mut self, kind: &NodeKind) -> Result<Self::Node, BackendError>;
    /// Look up the parameter called `name` on `node`
    fn param(&mut self, node: &Self::Node, name: &str) -> Result<Self::Param, BackendError>;

    fn wire(
        &mut self,
        source: &Self::Node,
        output: usize,
        destination: &Self::Node,
        input: usize,
    ) -> Result<(), BackendError>;
    fn unwire(
        &mut self,
        source: &Self::Node,
        output: usize,
        destination: &Self::Node,
        input: usize,
    ) -> Result<(), BackendError>;
    fn wire_param(
        &mut self,
        source: &Self::Node,
        output: usize,
        param: &Self::Param,
    ) -> Result<(), BackendError>;
    fn unwire_param(&mut self, source: &Self::Node, output: usize, param: &Self::Param)
        -> Result<(), BackendError>;

    fn set_value_at_time(
        &mut self,
        param: &Self::Param,
        value: Sample,
        start_time: f64,
    ) -> Result<(), BackendError>;
    fn linear_ramp_to_value_at_time(
        &mut self,
        param: &Self::Param,
        value: Sample,
        end_time: f64,
    ) -> Result<(), BackendError>;
    fn exponential_ramp_to_value_at_time(
        &mut self,
        param: &Self::Param,
        value: Sample,
        end_time: f64,
    ) -> Result<(), BackendError>;
    fn set_target_at_time(
        &mut self,
        param: &Self::Param,
        target: Sample,
        start_time: f64,
        time_constant: f64,
    ) -> Result<(), BackendError>;
    fn set_value_curve_at_time(
        &mut self,
        param: &Self::Param,
        values: &[Sample],
        start_time: f64,
        duration: f64,
    ) -> Result<(), BackendError>;
    fn cancel_scheduled_values(
        &mut self,
        param: &Self::Param,
        cancel_time: f64,
    ) -> Result<(), BackendError>;
    fn cancel_and_hold_at_time(
        &mut self,
        param: &Self::Param,
        cancel_time: f64,
    ) -> Result<(), BackendError>;

    /// Forward an [`AutomationEvent`] to the matching automation method.
    fn apply_automation_event(
        &mut self,
        param: &Self::Param,
        event: &AutomationEvent,
    ) -> Result<(), BackendError> {
        match event {
            AutomationEvent::SetValue { value, start_time } => {
                self.set_value_at_time(param, *value, *start_time)
            }
            AutomationEvent::LinearRampToValue { value, end_time } => {
                self.linear_ramp_to_value_at_time(param, *value, *end_time)
            }
            AutomationEvent::ExponentialRampToValue { value, end_time } => {
                self.exponential_ramp_to_value_at_time(param, *value, *end_time)
            }
            AutomationEvent::SetTarget {
                target,
                start_time,
                time_constant,
            } => self.set_target_at_time(param, *target, *start_time, *time_constant),
            AutomationEvent::SetValueCurve {
                values,
                start_time,
                duration,
            } => self.set_value_curve_at_time(param, values, *start_time, *duration),
            AutomationEvent::CancelScheduledValues { cancel_time } => {
                self.cancel_scheduled_values(param, *cancel_time)
            }
            AutomationEvent::CancelAndHold { cancel_time } => {
                self.cancel_and_hold_at_time(param, *cancel_time)
            }
        }
    }

    /// Produce the output of an offline render from the materialized destination.
    fn finalize(
        &mut self,
        destination: &Self::Node,
        settings: &RenderSettings,
    ) -> Result<AudioBuffer, BackendError>;
}

mod memory_backend {
    use std::collections::HashSet;

    use crate::automation::AutomationEvent;
    use crate::backend::{Backend, BackendError, Port};
    use crate::graph::NodeKind;
    use crate::offline::{AudioBuffer, RenderSettings};
    use crate::Sample;

    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct MemoryNode(pub usize);

    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct MemoryParam {
        pub node: MemoryNode,
        pub index: usize,
    }

    /// Everything a [`MemoryBackend`] has been asked to do, in order
    #[derive(Clone, Debug, PartialEq)]
    pub enum BackendCall {
        CreateNode {
            node: MemoryNode,
            kind: NodeKind,
        },
        Wire {
            source: MemoryNode,
            output: usize,
            destination: MemoryNode,
            input: usize,
        },
        Unwire {
            source: MemoryNode,
            output: usize,
            destination: MemoryNode,
            input: usize,
        },
        WireParam {
            source: MemoryNode,
            output: usize,
            param: MemoryParam,
        },
        UnwireParam {
            source: MemoryNode,
            output: usize,
            param: MemoryParam,
        },
        Automation {
            param: MemoryParam,
            event: AutomationEvent,
        },
        Finalize {
            destination: MemoryNode,
        },
    }

    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    enum Wire {
        Node {
            source: MemoryNode,
            output: usize,
            destination: MemoryNode,
            input: usize,
        },
        Param {
            source: MemoryNode,
            output: usize,
            param: MemoryParam,
        },
    }

    /// A [`Backend`] that keeps the wiring in memory and logs every call.
    #[derive(Debug, Default)]
    pub struct MemoryBackend {
        nodes: Vec<NodeKind>,
        wires: HashSet<Wire>,
        calls: Vec<BackendCall>,
        unsupported: Vec<String>,
        automation_rejected: bool,
    }

    impl MemoryBackend {
        pub fn new() -> Self {
            Self::default()
        }
        /// Make [`Backend::create_node`] fail for nodes of the named kind
        pub fn reject_kind(mut self, kind: impl Into<String>) -> Self {
            self.unsupported.push(kind.into());
            self
        }
        /// Make every automation method fail while `rejected` is set
        pub fn set_automation_rejected(&mut self, rejected: bool) {
            self.automation_rejected = rejected;
        }
        pub fn calls(&self) -> &[BackendCall] {
            &self.calls
        }
        pub fn clear_calls(&mut self) {
            self.calls.clear();
        }
        pub fn num_nodes(&self) -> usize {
            self.nodes.len()
        }
        pub fn kind(&self, node: MemoryNode) -> Option<&NodeKind> {
            self.nodes.get(node.0)
        }
        /// All nodes created so far together with their kinds
        pub fn created_nodes(&self) -> impl Iterator<Item = (MemoryNode, &NodeKind)> + '_ {
            self.nodes.iter().enumerate().map(|(i, kind)| (MemoryNode(i), kind))
        }
        pub fn is_wired(
            &self,
            source: MemoryNode,
            output: usize,
            destination: MemoryNode,
            input: usize,
        ) -> bool {
            self.wires.contains(&Wire::Node {
                source,
                output,
                destination,
                input,
            })
        }
        pub fn is_param_wired(
            &self,
            source: MemoryNode,
            output: usize,
            param: MemoryParam,
        ) -> bool {
            self.wires.contains(&Wire::Param { source, output, param })
        }
        pub fn num_wires(&self) -> usize {
            self.wires.len()
        }
        /// The automation events applied to `param`, in the order they arrived
        pub fn automation_of(&self, param: MemoryParam) -> Vec<&AutomationEvent> {
            self.calls
                .iter()
                .filter_map(|call| match call {
                    BackendCall::Automation { param: p, event } if *p == param => Some(event),
                    _ => None,
                })
                .collect()
        }

        fn node_kind(&self, node: &MemoryNode) -> Result<&NodeKind, BackendError> {
            self.nodes.get(node.0).ok_or(BackendError::UnknownNode)
        }
        fn check_output(&self, node: &MemoryNode, output: usize) -> Result<(), BackendError> {
            let count = self.node_kind(node)?.num_outputs();
            if output >= count {
                return Err(BackendError::PortRange {
                    port: Port::Output,
                    index: output,
                    count,
                });
            }
            Ok(())
        }
        fn check_input(&self, node: &MemoryNode, input: usize) -> Result<(), BackendError> {
            let count = self.node_kind(node)?.num_inputs();
            if input >= count {
                return Err(BackendError::PortRange {
                    port: Port::Input,
                    index: input,
                    count,
                });
            }
            Ok(())
        }
        fn check_param(&self, param: &MemoryParam) -> Result<(), BackendError> {
            if param.index >= self.node_kind(&param.node)?.params().len() {
                return Err(BackendError::UnknownParam(format!("#{}", param.index)));
            }
            Ok(())
        }
        fn automate(
            &mut self,
            param: &MemoryParam,
            event: AutomationEvent,
        ) -> Result<(), BackendError> {
            self.check_param(param)?;
            if self.automation_rejected {
                return Err(BackendError::Rejected(format!("automation of {param:?}")));
            }
            self.calls.push(BackendCall::Automation { param: *param, event });
            Ok(())
        }
    }

    impl Backend for MemoryBackend {
        type Node = MemoryNode;
        type Param = MemoryParam;

        fn create_node(&mut self, kind: &NodeKind) -> Result<MemoryNode, BackendError> {
            if self.unsupported.iter().any(|k| k == kind.name()) {
                return Err(BackendError::UnsupportedKind(kind.name().to_string()));
            }
            let node = MemoryNode(self.nodes.len());
            self.nodes.push(kind.clone());
            self.calls.push(BackendCall::CreateNode {
                node,
                kind: kind.clone(),
            });
            Ok(node)
        }

        fn param(&mut self, node: &MemoryNode, name: &str) -> Result<MemoryParam, BackendError> {
            let index = self
                .node_kind(node)?
                .params()
                .iter()
                .position(|p| p.name == name)
                .ok_or_else(|| BackendError::UnknownParam(name.to_string()))?;
            Ok(MemoryParam { node: *node, index })
        }

        fn wire(
            &mut self,
            source: &MemoryNode,
            output: usize,
            destination: &MemoryNode,
            input: usize,
        ) -> Result<(), BackendError> {
            self.check_output(source, output)?;
            self.check_input(destination, input)?;
            self.wires.insert(Wire::Node {
                source: *source,
                output,
                destination: *destination,
                input,
            });
            self.calls.push(BackendCall::Wire {
                source: *source,
                output,
                destination: *destination,
                input,
            });
            Ok(())
        }

        fn unwire(
            &mut self,
            source: &MemoryNode,
            output: usize,
            destination: &MemoryNode,
            input: usize,
        ) -> Result<(), BackendError> {
            self.check_output(source, output)?;
            self.check_input(destination, input)?;
            let wire = Wire::Node {
                source: *source,
                output,
                destination: *destination,
                input,
            };
            if !self.wires.remove(&wire) {
                return Err(BackendError::NotConnected);
            }
            self.calls.push(BackendCall::Unwire {
                source: *source,
                output,
                destination: *destination,
                input,
            });
            Ok(())
        }

        fn wire_param(
            &mut self,
            source: &MemoryNode,
            output: usize,
            param: &MemoryParam,
        ) -> Result<(), BackendError> {
            self.check_output(source, output)?;
            self.check_param(param)?;
            self.wires.insert(Wire::Param {
                source: *source,
                output,
                param: *param,
            });
            self.calls.push(BackendCall::WireParam {
                source: *source,
                output,
                param: *param,
            });
            Ok(())
        }

        fn unwire_param(
            &mut self,
            source: &MemoryNode,
            output: usize,
            param: &MemoryParam,
        ) -> Result<(), BackendError> {
            self.check_output(source, output)?;
            self.check_param(param)?;
            if !self.wires.remove(&Wire::Param {
                source: *source,
                output,
                param: *param,
            }) {
                return Err(BackendError::NotConnected);
            }
            self.calls.push(BackendCall::UnwireParam {
                source: *source,
                output,
                param: *param,
            });
            Ok(())
        }

        fn set_value_at_time(
            &mut self,
            param: &MemoryParam,
            value: Sample,
            start_time: f64,
        ) -> Result<(), BackendError> {
            self.automate(param, AutomationEvent::SetValue { value, start_time })
        }
        fn linear_ramp_to_value_at_time(
            &mut self,
            param: &MemoryParam,
            value: Sample,
            end_time: f64,
        ) -> Result<(), BackendError> {
            self.automate(param, AutomationEvent::LinearRampToValue { value, end_time })
        }
        fn exponential_ramp_to_value_at_time(
            &mut self,
            param: &MemoryParam,
            value: Sample,
            end_time: f64,
        ) -> Result<(), BackendError> {
            self.automate(param, AutomationEvent::ExponentialRampToValue { value, end_time })
        }
        fn set_target_at_time(
            &mut self,
            param: &MemoryParam,
            target: Sample,
            start_time: f64,
            time_constant: f64,
        ) -> Result<(), BackendError> {
            self.automate(
                param,
                AutomationEvent::SetTarget {
                    target,
                    start_time,
                    time_constant,
                },
            )
        }
        fn set_value_curve_at_time(
            &mut self,
            param: &MemoryParam,
            values: &[Sample],
            start_time: f64,
            duration: f64,
        ) -> Result<(), BackendError> {
            self.automate(
                param,
                AutomationEvent::SetValueCurve {
                    values: values.to_vec(),
                    start_time,
                    duration,
                },
            )
        }
        fn cancel_scheduled_values(
            &mut self,
            param: &MemoryParam,
            cancel_time: f64,
        ) -> Result<(), BackendError> {
            self.automate(param, AutomationEvent::CancelScheduledValues { cancel_time })
        }
        fn cancel_and_hold_at_time(
            &mut self,
            param: &MemoryParam,
            cancel_time: f64,
        ) -> Result<(), BackendError> {
            self.automate(param, AutomationEvent::CancelAndHold { cancel_time })
        }

        fn finalize(
            &mut self,
            destination: &MemoryNode,
            settings: &RenderSettings,
        ) -> Result<AudioBuffer, BackendError> {
            self.node_kind(destination)?;
            self.calls.push(BackendCall::Finalize {
                destination: *destination,
            });
            Ok(AudioBuffer::silent(settings))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn wiring_checks_ports() {
            let mut backend = MemoryBackend::new();
            let osc = backend.create_node(&NodeKind::Oscillator).unwrap();
            let gain = backend.create_node(&NodeKind::Gain).unwrap();
            assert_eq!(
                backend.wire(&gain, 0, &osc, 0),
                Err(BackendError::PortRange {
                    port: Port::Input,
                    index: 0,
                    count: 0
                })
            );
            backend.wire(&osc, 0, &gain, 0).unwrap();
            assert!(backend.is_wired(osc, 0, gain, 0));
            backend.unwire(&osc, 0, &gain, 0).unwrap();
            assert_eq!(backend.unwire(&osc, 0, &gain, 0), Err(BackendError::NotConnected));
        }

        #[test]
        fn rejected_kinds_fail_to_create() {
            let mut backend = MemoryBackend::new().reject_kind("Analyser");
            assert!(matches!(
                backend.create_node(&NodeKind::Analyser),
                Err(BackendError::UnsupportedKind(_))
            ));
            assert_eq!(backend.num_nodes(), 0);
        }

        #[test]
        fn automation_events_dispatch_to_methods() {
            let mut backend = MemoryBackend::new();
            let gain = backend.create_node(&NodeKind::Gain).unwrap();
            let param = backend.param(&gain, "gain").unwrap();
            let event = AutomationEvent::SetTarget {
                target: 0.0,
                start_time: 1.0,
                time_constant: 0.1,
            };
            backend.apply_automation_event(&param, &event).unwrap();
            assert_eq!(backend.automation_of(param), vec![&event]);
            assert!(backend.param(&gain, "frequency").is_err());
        }
    }
}
