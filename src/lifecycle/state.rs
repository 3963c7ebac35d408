// SPDX-License-Identifier: MIT
//! Agent state machine.
//!
//! ```text
//! created      --INITIALIZE-->   initializing
//! initializing --READY-->        ready
//! initializing --FAIL-->         error
//! ready        --START-->        running
//! running      --COMPLETE-->     ready
//! ready/running--PAUSE-->        paused
//! paused       --RESUME-->       ready
//! *            --FAIL-->         error       (from all non-terminal, non-error)
//! error        --RECOVER-->      ready
//! *            --TERMINATE-->    terminated
//! ```
//!
//! Any other (state, event) pair is not a transition; callers turn that into
//! a negative acknowledgement. `terminated` is absorbing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Created,
    Initializing,
    Ready,
    Running,
    Paused,
    Error,
    Terminated,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Created => "created",
            AgentState::Initializing => "initializing",
            AgentState::Ready => "ready",
            AgentState::Running => "running",
            AgentState::Paused => "paused",
            AgentState::Error => "error",
            AgentState::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "created" => AgentState::Created,
            "initializing" => AgentState::Initializing,
            "ready" => AgentState::Ready,
            "running" => AgentState::Running,
            "paused" => AgentState::Paused,
            "error" => AgentState::Error,
            "terminated" => AgentState::Terminated,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Terminated)
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    Initialize,
    Ready,
    Start,
    Complete,
    Pause,
    Resume,
    Fail,
    Recover,
    Terminate,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::Initialize => "initialize",
            LifecycleEvent::Ready => "ready",
            LifecycleEvent::Start => "start",
            LifecycleEvent::Complete => "complete",
            LifecycleEvent::Pause => "pause",
            LifecycleEvent::Resume => "resume",
            LifecycleEvent::Fail => "fail",
            LifecycleEvent::Recover => "recover",
            LifecycleEvent::Terminate => "terminate",
        }
    }
}

/// The resulting state for a (state, event) pair, or `None` when the event
/// is not a realizable transition from that state.
pub fn next_state(state: AgentState, event: LifecycleEvent) -> Option<AgentState> {
    use AgentState::*;
    use LifecycleEvent::{Complete, Fail, Initialize, Pause, Recover, Resume, Start, Terminate};
    match (state, event) {
        (Created, Initialize) => Some(Initializing),
        (Initializing, LifecycleEvent::Ready) => Some(AgentState::Ready),
        (AgentState::Ready, Start) => Some(Running),
        (Running, Complete) => Some(AgentState::Ready),
        (AgentState::Ready | Running, Pause) => Some(Paused),
        (Paused, Resume) => Some(AgentState::Ready),
        (Created | Initializing | AgentState::Ready | Running | Paused, Fail) => Some(Error),
        (Error, Recover) => Some(AgentState::Ready),
        (Terminated, _) => None,
        (_, Terminate) => Some(Terminated),
        _ => None,
    }
}

/// One realized transition in an agent's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: AgentState,
    pub to: AgentState,
    pub event: LifecycleEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn happy_path() {
        use AgentState::*;
        use LifecycleEvent::*;
        let mut state = Created;
        for (event, expected) in [
            (Initialize, Initializing),
            (LifecycleEvent::Ready, AgentState::Ready),
            (Start, Running),
            (Complete, AgentState::Ready),
            (Pause, Paused),
            (Resume, AgentState::Ready),
            (Fail, Error),
            (Recover, AgentState::Ready),
            (Terminate, Terminated),
        ] {
            state = next_state(state, event).expect("transition should exist");
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn invalid_pairs_are_rejected() {
        use AgentState::*;
        use LifecycleEvent::*;
        assert_eq!(next_state(Created, Start), None);
        assert_eq!(next_state(AgentState::Ready, Complete), None);
        assert_eq!(next_state(Running, Resume), None);
        assert_eq!(next_state(Paused, Start), None);
        assert_eq!(next_state(Error, Start), None);
        assert_eq!(next_state(Error, Fail), None);
    }

    #[test]
    fn terminated_is_absorbing() {
        use LifecycleEvent::*;
        for event in [
            Initialize, Ready, Start, Complete, Pause, Resume, Fail, Recover, Terminate,
        ] {
            assert_eq!(next_state(AgentState::Terminated, event), None);
        }
    }

    #[test]
    fn terminate_reaches_terminated_from_every_live_state() {
        use AgentState::*;
        for state in [Created, Initializing, Ready, Running, Paused, Error] {
            assert_eq!(
                next_state(state, LifecycleEvent::Terminate),
                Some(Terminated)
            );
        }
    }

    fn arb_event() -> impl Strategy<Value = LifecycleEvent> {
        use LifecycleEvent::*;
        prop_oneof![
            Just(Initialize),
            Just(Ready),
            Just(Start),
            Just(Complete),
            Just(Pause),
            Just(Resume),
            Just(Fail),
            Just(Recover),
            Just(Terminate),
        ]
    }

    proptest! {
        /// Any event sequence walks edges of the graph only, and once the
        /// agent terminates no further transition is realized.
        #[test]
        fn random_walks_stay_on_the_graph(events in proptest::collection::vec(arb_event(), 0..64)) {
            let mut state = AgentState::Created;
            let mut terminated_at = None;
            for (i, event) in events.iter().enumerate() {
                if let Some(next) = next_state(state, *event) {
                    prop_assert!(terminated_at.is_none(), "transition realized after terminate");
                    prop_assert_ne!(state, AgentState::Terminated);
                    state = next;
                    if state == AgentState::Terminated {
                        terminated_at = Some(i);
                    }
                }
            }
        }
    }
}
