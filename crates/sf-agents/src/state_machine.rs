use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use sf_core::error::FleetError;
use sf_core::types::InstanceStatus;

/// Transitions retained per instance.
const MAX_HISTORY: usize = 64;

// ---------------------------------------------------------------------------
// InstanceEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceEvent {
    Start,
    Connected,
    ProbePassed,
    ProbeFailed,
    Fault,
    Restart,
    Disable,
    Stop,
}

impl fmt::Display for InstanceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            InstanceEvent::Start => "Start",
            InstanceEvent::Connected => "Connected",
            InstanceEvent::ProbePassed => "ProbePassed",
            InstanceEvent::ProbeFailed => "ProbeFailed",
            InstanceEvent::Fault => "Fault",
            InstanceEvent::Restart => "Restart",
            InstanceEvent::Disable => "Disable",
            InstanceEvent::Stop => "Stop",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition: cannot apply {event} in state {state}")]
    InvalidTransition {
        state: InstanceStatus,
        event: InstanceEvent,
    },
}

impl From<StateMachineError> for FleetError {
    fn from(err: StateMachineError) -> Self {
        FleetError::InvalidState(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// InstanceStateMachine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: InstanceStatus,
    pub event: InstanceEvent,
    pub to: InstanceStatus,
}

#[derive(Debug, Clone)]
pub struct InstanceStateMachine {
    current: InstanceStatus,
    history: VecDeque<Transition>,
}

impl InstanceStateMachine {
    /// Create a new state machine starting in `Registered`.
    pub fn new() -> Self {
        Self::resume(InstanceStatus::Registered)
    }

    /// Continue from a persisted status.
    pub fn resume(status: InstanceStatus) -> Self {
        Self {
            current: status,
            history: VecDeque::new(),
        }
    }

    pub fn state(&self) -> InstanceStatus {
        self.current
    }

    /// Most recent transitions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Transition> {
        self.history.iter()
    }

    /// Attempt a state transition driven by `event`.
    ///
    /// Valid transitions:
    /// - Registered | Stopped                        + Start       -> Starting
    /// - Starting | Restarting                       + Connected   -> Online
    /// - Online | Healthy | Unhealthy                + ProbePassed -> Healthy
    /// - Online | Healthy | Unhealthy                + ProbeFailed -> Unhealthy
    /// - Starting | Restarting | Online | Healthy |
    ///   Unhealthy                                   + Fault       -> Unhealthy
    /// - any but Disabled                            + Restart     -> Restarting
    /// - any but Disabled                            + Disable     -> Disabled
    /// - any but Disabled | Stopped                  + Stop        -> Stopped
    pub fn transition(&mut self, event: InstanceEvent) -> Result<InstanceStatus, StateMachineError> {
        let next = next_state(self.current, event).ok_or(StateMachineError::InvalidTransition {
            state: self.current,
            event,
        })?;

        let from = self.current;
        self.current = next;
        if self.history.len() == MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(Transition {
            from,
            event,
            to: next,
        });
        tracing::debug!(from = %from, event = %event, to = %next, "instance state transition");
        Ok(next)
    }

    /// Returns `true` if the given event is valid in the current state.
    pub fn can_transition(&self, event: InstanceEvent) -> bool {
        next_state(self.current, event).is_some()
    }
}

impl Default for InstanceStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

fn next_state(current: InstanceStatus, event: InstanceEvent) -> Option<InstanceStatus> {
    use InstanceEvent as E;
    use InstanceStatus as S;

    let next = match (current, event) {
        (S::Disabled, _) => return None,
        (S::Registered | S::Stopped, E::Start) => S::Starting,
        (S::Starting | S::Restarting, E::Connected) => S::Online,
        (S::Online | S::Healthy | S::Unhealthy, E::ProbePassed) => S::Healthy,
        (S::Online | S::Healthy | S::Unhealthy, E::ProbeFailed) => S::Unhealthy,
        (S::Starting | S::Restarting | S::Online | S::Healthy | S::Unhealthy, E::Fault) => {
            S::Unhealthy
        }
        (_, E::Restart) => S::Restarting,
        (_, E::Disable) => S::Disabled,
        (S::Stopped, E::Stop) => return None,
        (_, E::Stop) => S::Stopped,
        _ => return None,
    };
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_bounded() {
        let mut sm = InstanceStateMachine::resume(InstanceStatus::Online);
        for _ in 0..(MAX_HISTORY + 10) {
            sm.transition(InstanceEvent::ProbePassed).unwrap();
        }
        assert_eq!(sm.history().count(), MAX_HISTORY);
    }

    #[test]
    fn invalid_transition_maps_to_invalid_state() {
        let mut sm = InstanceStateMachine::new();
        let err: FleetError = sm.transition(InstanceEvent::Connected).unwrap_err().into();
        assert!(matches!(err, FleetError::InvalidState(_)));
    }
}
