//! Automatable parameters.
//!
//! Every parameter of a node is addressed by a [`ParamKey`] and keeps its own
//! [`AutomationEventList`]. Scheduling automation validates the arguments,
//! records the event and, in a realtime graph, forwards it to the backend
//! parameter straight away. Offline graphs only record; the events are
//! replayed onto the rendered instances.
//!
//! ```
//! # use strom::prelude::*;
//! let mut graph = Graph::new(MemoryBackend::new(), GraphSettings::default());
//! let gain = graph.push(NodeKind::Gain)?;
//! let level = graph.param(gain, "gain").unwrap();
//! graph.set_value_at_time(level, 0.0, 0.0)?;
//! graph.linear_ramp_to_value_at_time(level, 1.0, 2.0)?;
//! assert_eq!(graph.param_value_at(level, 1.0)?, 0.5);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use tracing::trace;

use crate::automation::{AutomationEvent, AutomationEventList};
use crate::backend::{Backend, BackendError};
use crate::graph::{Graph, NodeKey, ParamKey};
use crate::Sample;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum AutomationError {
    #[error("The parameter does not exist in this graph.")]
    MissingParam,
    #[error("{0}")]
    Range(String),
    #[error("The automation event overlaps with a value curve.")]
    CurveOverlap,
    #[error("Can not cancel and hold a ramp that follows a SetTarget event.")]
    HoldAfterTarget,
    #[error("The backend failed to apply the automation: {0}")]
    Backend(#[from] BackendError),
}

fn check_time(name: &str, time: f64) -> Result<(), AutomationError> {
    if !time.is_finite() || time < 0.0 {
        return Err(AutomationError::Range(format!(
            "The {name} must be a finite, non-negative number, got {time}."
        )));
    }
    Ok(())
}

fn check_value(value: Sample) -> Result<(), AutomationError> {
    if !value.is_finite() {
        return Err(AutomationError::Range(format!("The value {value} is not finite.")));
    }
    Ok(())
}

impl<B: Backend> Graph<B> {
    /// Find the parameter of `node` called `name`
    pub fn param(&self, node: NodeKey, name: &str) -> Option<ParamKey> {
        let entry = self.nodes.get(node)?;
        entry
            .params
            .iter()
            .copied()
            .find(|p| self.params.get(*p).map_or(false, |p| p.name == name))
    }
    pub fn params_of(&self, node: NodeKey) -> &[ParamKey] {
        self.nodes.get(node).map_or(&[], |n| n.params.as_slice())
    }
    pub fn param_name(&self, param: ParamKey) -> Option<&str> {
        self.params.get(param).map(|p| p.name.as_str())
    }
    pub fn param_owner(&self, param: ParamKey) -> Option<NodeKey> {
        self.params.get(param).map(|p| p.owner)
    }
    /// The backend handle of a parameter
    pub fn param_instance(&self, param: ParamKey) -> Option<&B::Param> {
        self.params.get(param).map(|p| &p.instance)
    }
    pub fn automation_events(
        &self,
        param: ParamKey,
    ) -> Result<&AutomationEventList, AutomationError> {
        self.params
            .get(param)
            .map(|p| &p.events)
            .ok_or(AutomationError::MissingParam)
    }
    /// The value of the parameter at the current time
    pub fn param_value(&self, param: ParamKey) -> Result<Sample, AutomationError> {
        self.param_value_at(param, self.current_time)
    }
    pub fn param_value_at(&self, param: ParamKey, time: f64) -> Result<Sample, AutomationError> {
        Ok(self.automation_events(param)?.value_at(time))
    }

    /// Set the value of a parameter from the current time on
    pub fn set_value(&mut self, param: ParamKey, value: Sample) -> Result<(), AutomationError> {
        let now = self.current_time;
        self.set_value_at_time(param, value, now)
    }
    pub fn set_value_at_time(
        &mut self,
        param: ParamKey,
        value: Sample,
        start_time: f64,
    ) -> Result<(), AutomationError> {
        check_value(value)?;
        check_time("start time", start_time)?;
        self.schedule(param, AutomationEvent::SetValue { value, start_time })
    }
    pub fn linear_ramp_to_value_at_time(
        &mut self,
        param: ParamKey,
        value: Sample,
        end_time: f64,
    ) -> Result<(), AutomationError> {
        check_value(value)?;
        check_time("end time", end_time)?;
        self.hold_default_value(param)?;
        self.schedule(param, AutomationEvent::LinearRampToValue { value, end_time })
    }
    /// Ramp exponentially towards `value`, which can not be zero.
    pub fn exponential_ramp_to_value_at_time(
        &mut self,
        param: ParamKey,
        value: Sample,
        end_time: f64,
    ) -> Result<(), AutomationError> {
        check_value(value)?;
        if value == 0.0 {
            return Err(AutomationError::Range(
                "The value for an exponential ramp can not be zero.".to_string(),
            ));
        }
        check_time("end time", end_time)?;
        self.hold_default_value(param)?;
        self.schedule(param, AutomationEvent::ExponentialRampToValue { value, end_time })
    }
    pub fn set_target_at_time(
        &mut self,
        param: ParamKey,
        target: Sample,
        start_time: f64,
        time_constant: f64,
    ) -> Result<(), AutomationError> {
        check_value(target)?;
        check_time("start time", start_time)?;
        check_time("time constant", time_constant)?;
        self.schedule(
            param,
            AutomationEvent::SetTarget {
                target,
                start_time,
                time_constant,
            },
        )
    }
    /// Follow `values`, spread evenly over `duration` seconds. The curve needs
    /// at least two values.
    pub fn set_value_curve_at_time(
        &mut self,
        param: ParamKey,
        values: &[Sample],
        start_time: f64,
        duration: f64,
    ) -> Result<(), AutomationError> {
        if values.len() < 2 {
            return Err(AutomationError::Range(format!(
                "A value curve needs at least two values, got {}.",
                values.len()
            )));
        }
        for value in values {
            check_value(*value)?;
        }
        check_time("start time", start_time)?;
        if !duration.is_finite() || duration <= 0.0 {
            return Err(AutomationError::Range(format!(
                "The duration must be a finite, positive number, got {duration}."
            )));
        }
        self.schedule(
            param,
            AutomationEvent::SetValueCurve {
                values: values.to_vec(),
                start_time,
                duration,
            },
        )
    }
    pub fn cancel_scheduled_values(
        &mut self,
        param: ParamKey,
        cancel_time: f64,
    ) -> Result<(), AutomationError> {
        check_time("cancel time", cancel_time)?;
        self.schedule(param, AutomationEvent::CancelScheduledValues { cancel_time })
    }
    pub fn cancel_and_hold_at_time(
        &mut self,
        param: ParamKey,
        cancel_time: f64,
    ) -> Result<(), AutomationError> {
        check_time("cancel time", cancel_time)?;
        self.schedule(param, AutomationEvent::CancelAndHold { cancel_time })
    }

    /// A ramp on a parameter without automation starts from the default value
    /// at the current time.
    fn hold_default_value(&mut self, param: ParamKey) -> Result<(), AutomationError> {
        let events = self.automation_events(param)?;
        if events.is_empty() {
            let value = events.default_value();
            let start_time = self.current_time;
            self.schedule(param, AutomationEvent::SetValue { value, start_time })?;
        }
        Ok(())
    }

    /// Record `event` and, in a realtime graph, forward it to the backend.
    /// Nothing is recorded if the backend fails.
    fn schedule(&mut self, param: ParamKey, event: AutomationEvent) -> Result<(), AutomationError> {
        let realtime = self.is_realtime();
        let entry = self.params.get(param).ok_or(AutomationError::MissingParam)?;
        let mut events = entry.events.clone();
        if realtime {
            events.flush(self.current_time);
        }
        if !events.add(event.clone()) {
            return Err(match event {
                AutomationEvent::CancelAndHold { .. } => AutomationError::HoldAfterTarget,
                _ => AutomationError::CurveOverlap,
            });
        }
        if realtime {
            let instance = entry.instance.clone();
            self.backend().apply_automation_event(&instance, &event)?;
        }
        if let Some(entry) = self.params.get_mut(param) {
            entry.events = events;
        }
        trace!(?param, event = event.name(), time = event.time(), "scheduled automation");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    fn gain_graph() -> (Graph<MemoryBackend>, ParamKey) {
        let mut graph = Graph::new(MemoryBackend::new(), GraphSettings::default());
        let gain = graph.push(NodeKind::Gain).unwrap();
        let param = graph.param(gain, "gain").unwrap();
        (graph, param)
    }

    #[test]
    fn params_are_found_by_name() {
        let mut graph = Graph::new(MemoryBackend::new(), GraphSettings::default());
        let filter = graph.push(NodeKind::BiquadFilter).unwrap();
        assert_eq!(graph.params_of(filter).len(), 4);
        let q = graph.param(filter, "Q").unwrap();
        assert_eq!(graph.param_name(q), Some("Q"));
        assert_eq!(graph.param_owner(q), Some(filter));
        assert_eq!(graph.param_value(q).unwrap(), 1.0);
        assert!(graph.param(filter, "pan").is_none());
    }

    #[test]
    fn invalid_arguments_are_range_errors() {
        let (mut graph, param) = gain_graph();
        assert!(matches!(
            graph.exponential_ramp_to_value_at_time(param, 0.0, 1.0),
            Err(AutomationError::Range(_))
        ));
        assert!(matches!(
            graph.set_value_at_time(param, 1.0, -1.0),
            Err(AutomationError::Range(_))
        ));
        assert!(matches!(
            graph.linear_ramp_to_value_at_time(param, 1.0, f64::INFINITY),
            Err(AutomationError::Range(_))
        ));
        assert!(matches!(
            graph.set_value_curve_at_time(param, &[1.0], 0.0, 1.0),
            Err(AutomationError::Range(_))
        ));
        assert!(graph.automation_events(param).unwrap().is_empty());
        assert!(graph
            .backend()
            .calls()
            .iter()
            .all(|c| !matches!(c, BackendCall::Automation { .. })));
    }

    #[test]
    fn ramps_start_from_the_default_value() {
        let (mut graph, param) = gain_graph();
        graph.linear_ramp_to_value_at_time(param, 0.0, 2.0).unwrap();
        let events: Vec<_> = graph.automation_events(param).unwrap().iter().cloned().collect();
        assert_eq!(
            events,
            vec![
                AutomationEvent::SetValue {
                    value: 1.0,
                    start_time: 0.0
                },
                AutomationEvent::LinearRampToValue {
                    value: 0.0,
                    end_time: 2.0
                },
            ]
        );
        assert_eq!(graph.param_value_at(param, 1.0).unwrap(), 0.5);
    }

    #[test]
    fn realtime_automation_is_forwarded() {
        let (mut graph, param) = gain_graph();
        graph.set_target_at_time(param, 0.0, 1.0, 0.5).unwrap();
        let instance = *graph.param_instance(param).unwrap();
        assert_eq!(
            graph.backend().automation_of(instance),
            vec![&AutomationEvent::SetTarget {
                target: 0.0,
                start_time: 1.0,
                time_constant: 0.5
            }]
        );
    }

    #[test]
    fn overlapping_curves_are_rejected() {
        let (mut graph, param) = gain_graph();
        graph.set_value_curve_at_time(param, &[0.0, 1.0, 0.5], 1.0, 2.0).unwrap();
        assert_eq!(
            graph.set_value_at_time(param, 0.2, 2.0),
            Err(AutomationError::CurveOverlap)
        );
    }

    #[test]
    fn backend_failures_are_not_recorded() {
        let (mut graph, param) = gain_graph();
        graph.set_value_at_time(param, 0.5, 1.0).unwrap();
        graph.backend().set_automation_rejected(true);
        assert!(matches!(
            graph.set_value_at_time(param, 0.2, 2.0),
            Err(AutomationError::Backend(BackendError::Rejected(_)))
        ));
        assert_eq!(graph.automation_events(param).unwrap().len(), 1);
        assert_eq!(graph.param_value_at(param, 3.0).unwrap(), 0.5);
        graph.backend().set_automation_rejected(false);
        graph.set_value_at_time(param, 0.2, 2.0).unwrap();
        assert_eq!(graph.automation_events(param).unwrap().len(), 2);
    }

    #[test]
    fn holding_a_ramp_after_set_target_is_rejected() {
        let (mut graph, param) = gain_graph();
        graph.set_target_at_time(param, 0.0, 0.0, 0.5).unwrap();
        graph.linear_ramp_to_value_at_time(param, 1.0, 2.0).unwrap();
        assert_eq!(
            graph.cancel_and_hold_at_time(param, 1.0),
            Err(AutomationError::HoldAfterTarget)
        );
        assert_eq!(graph.automation_events(param).unwrap().len(), 2);
        let instance = *graph.param_instance(param).unwrap();
        assert_eq!(graph.backend().automation_of(instance).len(), 2);
    }

    #[test]
    fn realtime_lists_are_flushed() {
        let (mut graph, param) = gain_graph();
        graph.set_value_at_time(param, 0.1, 1.0).unwrap();
        graph.set_value_at_time(param, 0.2, 2.0).unwrap();
        graph.set_value_at_time(param, 0.3, 3.0).unwrap();
        graph.set_current_time(2.5);
        graph.set_value_at_time(param, 0.4, 4.0).unwrap();
        assert_eq!(graph.automation_events(param).unwrap().len(), 3);
        assert_eq!(graph.param_value(param).unwrap(), 0.2);
    }
}
