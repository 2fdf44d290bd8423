//! Automation events and the time ordered list they are kept in.
//!
//! An [`AutomationEventList`] holds the automation history of a single
//! parameter. It is the bookkeeping side only: it can answer what value the
//! parameter has at any time and can [replay](AutomationEventList::replay)
//! itself onto a backend parameter, but it never touches audio itself.

use crate::backend::{Backend, BackendError};
use crate::Sample;

/// A single automation instruction for an audio parameter.
///
/// Times are in seconds on the timeline of the graph the parameter belongs to.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-derive", derive(serde::Serialize, serde::Deserialize))]
pub enum AutomationEvent {
    SetValue {
        value: Sample,
        start_time: f64,
    },
    LinearRampToValue {
        value: Sample,
        end_time: f64,
    },
    ExponentialRampToValue {
        value: Sample,
        end_time: f64,
    },
    /// Approach `target` exponentially, starting at `start_time`
    SetTarget {
        target: Sample,
        start_time: f64,
        time_constant: f64,
    },
    SetValueCurve {
        values: Vec<Sample>,
        start_time: f64,
        duration: f64,
    },
    /// Remove every event at or after `cancel_time`
    CancelScheduledValues {
        cancel_time: f64,
    },
    /// Like [`AutomationEvent::CancelScheduledValues`], but hold the value the
    /// parameter would have had at `cancel_time`
    CancelAndHold {
        cancel_time: f64,
    },
}

impl AutomationEvent {
    /// The time this event is sorted by.
    pub fn time(&self) -> f64 {
        match self {
            AutomationEvent::SetValue { start_time, .. }
            | AutomationEvent::SetTarget { start_time, .. }
            | AutomationEvent::SetValueCurve { start_time, .. } => *start_time,
            AutomationEvent::LinearRampToValue { end_time, .. }
            | AutomationEvent::ExponentialRampToValue { end_time, .. } => *end_time,
            AutomationEvent::CancelScheduledValues { cancel_time }
            | AutomationEvent::CancelAndHold { cancel_time } => *cancel_time,
        }
    }
    pub fn is_ramp(&self) -> bool {
        matches!(
            self,
            AutomationEvent::LinearRampToValue { .. }
                | AutomationEvent::ExponentialRampToValue { .. }
        )
    }
    pub fn is_cancel(&self) -> bool {
        matches!(
            self,
            AutomationEvent::CancelScheduledValues { .. } | AutomationEvent::CancelAndHold { .. }
        )
    }
    /// The name of the corresponding Web Audio method, for logging
    pub fn name(&self) -> &'static str {
        match self {
            AutomationEvent::SetValue { .. } => "setValueAtTime",
            AutomationEvent::LinearRampToValue { .. } => "linearRampToValueAtTime",
            AutomationEvent::ExponentialRampToValue { .. } => "exponentialRampToValueAtTime",
            AutomationEvent::SetTarget { .. } => "setTargetAtTime",
            AutomationEvent::SetValueCurve { .. } => "setValueCurveAtTime",
            AutomationEvent::CancelScheduledValues { .. } => "cancelScheduledValues",
            AutomationEvent::CancelAndHold { .. } => "cancelAndHoldAtTime",
        }
    }
}

/// An event as it is stored in the list. Ramps remember when they were
/// inserted since a ramp following a `SetTarget` starts at its insertion.
#[derive(Clone, Debug, PartialEq)]
struct ScheduledEvent {
    event: AutomationEvent,
    insert_time: f64,
}

/// The ordered automation history of one parameter.
///
/// Events are kept sorted by [`AutomationEvent::time`], events with equal
/// times stay in insertion order. Cancel events are never stored, they
/// truncate the list when added.
#[derive(Clone, Debug, PartialEq)]
pub struct AutomationEventList {
    events: Vec<ScheduledEvent>,
    current_time: f64,
    default_value: Sample,
}

impl AutomationEventList {
    pub fn new(default_value: Sample) -> Self {
        Self {
            events: Vec::new(),
            current_time: 0.0,
            default_value,
        }
    }
    pub fn default_value(&self) -> Sample {
        self.default_value
    }
    pub fn len(&self) -> usize {
        self.events.len()
    }
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
    pub fn iter(&self) -> impl Iterator<Item = &AutomationEvent> + '_ {
        self.events.iter().map(|e| &e.event)
    }

    /// Add an event to the list. Returns false if the event was rejected
    /// because it would overlap with a value curve, in which case the list is
    /// unchanged.
    pub fn add(&mut self, event: AutomationEvent) -> bool {
        let event_time = event.time();
        match event {
            AutomationEvent::CancelScheduledValues { .. }
            | AutomationEvent::CancelAndHold { .. } => {
                let cancel_scheduled =
                    matches!(event, AutomationEvent::CancelScheduledValues { .. });
                let index = self.events.iter().position(|scheduled| match &scheduled.event {
                    AutomationEvent::SetValueCurve {
                        start_time,
                        duration,
                        ..
                    } if cancel_scheduled => start_time + duration >= event_time,
                    other => other.time() >= event_time,
                });
                if cancel_scheduled {
                    if let Some(index) = index {
                        self.events.truncate(index);
                    }
                    return true;
                }
                self.cancel_and_hold(index, event_time)
            }
            event => {
                let index = self.events.iter().position(|e| e.event.time() > event_time);
                let previous = match index {
                    None => self.events.last(),
                    Some(index) => index.checked_sub(1).and_then(|i| self.events.get(i)),
                };
                if let Some(AutomationEvent::SetValueCurve {
                    start_time, duration, ..
                }) = previous.map(|p| &p.event)
                {
                    if start_time + duration > event_time {
                        return false;
                    }
                }
                if let (AutomationEvent::SetValueCurve { duration, .. }, Some(index)) =
                    (&event, index)
                {
                    if event_time + duration > self.events[index].event.time() {
                        return false;
                    }
                }
                let scheduled = ScheduledEvent {
                    event,
                    insert_time: self.current_time,
                };
                match index {
                    Some(index) => self.events.insert(index, scheduled),
                    None => self.events.push(scheduled),
                }
                true
            }
        }
    }

    fn cancel_and_hold(&mut self, index: Option<usize>, cancel_time: f64) -> bool {
        let keep = index.unwrap_or(self.events.len());
        let removed = index.map(|i| self.events[i].clone());
        let last = keep.checked_sub(1).map(|i| self.events[i].event.clone());
        let interrupted_ramp = removed.filter(|r| r.event.is_ramp());
        // A ramp scheduled after a SetTarget has no defined start value to
        // truncate from.
        if interrupted_ramp.is_some() && matches!(last, Some(AutomationEvent::SetTarget { .. })) {
            return false;
        }
        let held_value = if matches!(last, Some(AutomationEvent::SetTarget { .. })) {
            Some(self.value_at(cancel_time))
        } else {
            None
        };
        self.events.truncate(keep);

        // Shorten a curve that is still running at the cancel time
        if let Some(AutomationEvent::SetValueCurve {
            values,
            start_time,
            duration,
        }) = &last
        {
            if start_time + duration > cancel_time && values.len() >= 2 {
                let new_duration = cancel_time - start_time;
                let ratio = (values.len() - 1) as f64 / duration;
                let length =
                    ((1.0 + (new_duration * ratio).ceil()) as usize).clamp(2, values.len());
                let fraction = new_duration / (length - 1) as f64 * ratio;
                let mut shortened = values[..length].to_vec();
                if fraction < 1.0 {
                    for i in 1..length {
                        let factor = ((fraction * i as f64) % 1.0) as Sample;
                        shortened[i] = values[i - 1] * (1.0 - factor) + values[i] * factor;
                    }
                }
                if let Some(curve) = self.events.last_mut() {
                    curve.event = AutomationEvent::SetValueCurve {
                        values: shortened,
                        start_time: *start_time,
                        duration: new_duration,
                    };
                }
            }
        }

        if let Some(ramp) = interrupted_ramp {
            let (start_time, start_value) = match &last {
                None => (ramp.insert_time, self.default_value as f64),
                Some(AutomationEvent::SetValueCurve {
                    values,
                    start_time,
                    duration,
                }) => (
                    start_time + duration,
                    values.last().copied().unwrap_or(self.default_value) as f64,
                ),
                Some(other) => (
                    other.time(),
                    stored_value(other).unwrap_or(self.default_value) as f64,
                ),
            };
            let truncated = match ramp.event {
                AutomationEvent::ExponentialRampToValue { value, end_time } => {
                    AutomationEvent::ExponentialRampToValue {
                        value: exponential_ramp_value_at(
                            cancel_time,
                            start_time,
                            start_value,
                            value as f64,
                            end_time,
                        ) as Sample,
                        end_time: cancel_time,
                    }
                }
                AutomationEvent::LinearRampToValue { value, end_time } => {
                    AutomationEvent::LinearRampToValue {
                        value: linear_ramp_value_at(
                            cancel_time,
                            start_time,
                            start_value,
                            value as f64,
                            end_time,
                        ) as Sample,
                        end_time: cancel_time,
                    }
                }
                _ => return true,
            };
            self.events.push(ScheduledEvent {
                event: truncated,
                insert_time: self.current_time,
            });
        }
        if let Some(value) = held_value {
            self.events.push(ScheduledEvent {
                event: AutomationEvent::SetValue {
                    value,
                    start_time: cancel_time,
                },
                insert_time: self.current_time,
            });
        }
        true
    }

    /// Drop events that can no longer influence the value at or after `time`.
    ///
    /// The event in effect at `time` is kept. A `SetTarget` that becomes the
    /// first event gets a `SetValue` in front of it to preserve its start value.
    pub fn flush(&mut self, time: f64) {
        self.current_time = time;
        let index = self
            .events
            .iter()
            .position(|e| e.event.time() > time)
            .unwrap_or(self.events.len());
        if index > 1 {
            let mut remaining = self.events.split_off(index - 1);
            if let AutomationEvent::SetTarget { start_time, .. } = remaining[0].event {
                let value = value_of_event_at_index_at_time(
                    &self.events,
                    Some(index - 2),
                    start_time,
                    self.default_value as f64,
                );
                remaining.insert(
                    0,
                    ScheduledEvent {
                        event: AutomationEvent::SetValue {
                            value: value as Sample,
                            start_time,
                        },
                        insert_time: time,
                    },
                );
            }
            self.events = remaining;
        }
    }

    /// The value of the parameter at `time` according to the list.
    pub fn value_at(&self, time: f64) -> Sample {
        let default = self.default_value as f64;
        if self.events.is_empty() {
            return self.default_value;
        }
        let index_of_next = self.events.iter().position(|e| e.event.time() > time);
        let next = index_of_next.map(|i| &self.events[i]);
        let index_of_current = index_of_next.unwrap_or(self.events.len()).checked_sub(1);
        let current = index_of_current.map(|i| &self.events[i]);
        let next_is_ramp = next.map_or(false, |n| n.event.is_ramp());

        if let Some(current) = current {
            match &current.event {
                AutomationEvent::SetTarget {
                    target,
                    start_time,
                    time_constant,
                } if !next_is_ramp || next.map_or(false, |n| n.insert_time > time) => {
                    let start_value = value_of_event_at_index_at_time(
                        &self.events,
                        index_of_current.and_then(|i| i.checked_sub(1)),
                        *start_time,
                        default,
                    );
                    return target_value_at(
                        time,
                        start_value,
                        *target as f64,
                        *start_time,
                        *time_constant,
                    ) as Sample;
                }
                AutomationEvent::SetValue { value, .. } if !next_is_ramp => return *value,
                AutomationEvent::SetValueCurve {
                    values,
                    start_time,
                    duration,
                } if !next_is_ramp || start_time + duration > time => {
                    if time < start_time + duration {
                        return value_curve_value_at(time, values, *start_time, *duration) as Sample;
                    }
                    return values.last().copied().unwrap_or(self.default_value);
                }
                AutomationEvent::LinearRampToValue { value, .. }
                | AutomationEvent::ExponentialRampToValue { value, .. }
                    if !next_is_ramp =>
                {
                    return *value
                }
                _ => (),
            }
        }

        if let Some(next) = next {
            match next.event {
                AutomationEvent::ExponentialRampToValue { value, end_time } => {
                    let (start_time, start_value) = end_time_and_value_of_previous(
                        &self.events,
                        index_of_current,
                        next,
                        default,
                    );
                    return exponential_ramp_value_at(
                        time,
                        start_time,
                        start_value,
                        value as f64,
                        end_time,
                    ) as Sample;
                }
                AutomationEvent::LinearRampToValue { value, end_time } => {
                    let (start_time, start_value) = end_time_and_value_of_previous(
                        &self.events,
                        index_of_current,
                        next,
                        default,
                    );
                    return linear_ramp_value_at(
                        time,
                        start_time,
                        start_value,
                        value as f64,
                        end_time,
                    ) as Sample;
                }
                _ => (),
            }
        }
        self.default_value
    }

    /// Apply every stored event, in order, to `param` on `backend`.
    pub fn replay<B: Backend>(
        &self,
        backend: &mut B,
        param: &B::Param,
    ) -> Result<(), BackendError> {
        for event in self.iter() {
            backend.apply_automation_event(param, event)?;
        }
        Ok(())
    }
}

/// The value an event leaves the parameter at, if the event stores one directly
fn stored_value(event: &AutomationEvent) -> Option<Sample> {
    match event {
        AutomationEvent::SetValue { value, .. }
        | AutomationEvent::LinearRampToValue { value, .. }
        | AutomationEvent::ExponentialRampToValue { value, .. } => Some(*value),
        AutomationEvent::SetValueCurve { values, .. } => values.last().copied(),
        _ => None,
    }
}

fn value_of_event_at_index_at_time(
    events: &[ScheduledEvent],
    index: Option<usize>,
    time: f64,
    default: f64,
) -> f64 {
    let Some(scheduled) = index.and_then(|i| events.get(i)) else {
        return default;
    };
    match &scheduled.event {
        AutomationEvent::SetTarget {
            target,
            start_time,
            time_constant,
        } => {
            let start_value = value_of_event_at_index_at_time(
                events,
                index.and_then(|i| i.checked_sub(1)),
                *start_time,
                default,
            );
            target_value_at(time, start_value, *target as f64, *start_time, *time_constant)
        }
        other => stored_value(other).map_or(default, |v| v as f64),
    }
}

/// Where a ramp that is about to run starts from: the end of the event before it.
fn end_time_and_value_of_previous(
    events: &[ScheduledEvent],
    index_of_current: Option<usize>,
    next: &ScheduledEvent,
    default: f64,
) -> (f64, f64) {
    let Some(current) = index_of_current.and_then(|i| events.get(i)) else {
        return (next.insert_time, default);
    };
    match &current.event {
        AutomationEvent::LinearRampToValue { value, end_time }
        | AutomationEvent::ExponentialRampToValue { value, end_time } => (*end_time, *value as f64),
        AutomationEvent::SetValue { value, start_time } => (*start_time, *value as f64),
        AutomationEvent::SetValueCurve {
            values,
            start_time,
            duration,
        } => (
            start_time + duration,
            values.last().map_or(default, |v| *v as f64),
        ),
        AutomationEvent::SetTarget {
            target,
            start_time,
            time_constant,
        } => {
            let start_value = value_of_event_at_index_at_time(
                events,
                index_of_current.and_then(|i| i.checked_sub(1)),
                *start_time,
                default,
            );
            (
                next.insert_time,
                target_value_at(
                    next.insert_time,
                    start_value,
                    *target as f64,
                    *start_time,
                    *time_constant,
                ),
            )
        }
        AutomationEvent::CancelScheduledValues { .. } | AutomationEvent::CancelAndHold { .. } => {
            (next.insert_time, default)
        }
    }
}

pub fn linear_ramp_value_at(
    time: f64,
    start_time: f64,
    start_value: f64,
    value: f64,
    end_time: f64,
) -> f64 {
    if end_time <= start_time {
        return value;
    }
    start_value + (value - start_value) * ((time - start_time) / (end_time - start_time))
}

pub fn exponential_ramp_value_at(
    time: f64,
    start_time: f64,
    start_value: f64,
    value: f64,
    end_time: f64,
) -> f64 {
    if end_time <= start_time {
        return value;
    }
    start_value * (value / start_value).powf((time - start_time) / (end_time - start_time))
}

pub fn target_value_at(
    time: f64,
    start_value: f64,
    target: f64,
    start_time: f64,
    time_constant: f64,
) -> f64 {
    if time_constant <= 0.0 {
        return target;
    }
    target + (start_value - target) * ((start_time - time) / time_constant).exp()
}

/// Linear interpolation between the points of a value curve
pub fn value_curve_value_at(time: f64, values: &[Sample], start_time: f64, duration: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let position = (time - start_time) / duration * (values.len() - 1) as f64;
    let position = position.clamp(0.0, (values.len() - 1) as f64);
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    if lower == upper {
        return values[lower] as f64;
    }
    let fraction = position - lower as f64;
    values[lower] as f64 * (1.0 - fraction) + values[upper] as f64 * fraction
}
