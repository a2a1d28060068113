//! Seam to the agent state machine.
//!
//! The host never classifies agent output. Classifiers elsewhere request a
//! transition (an event plus the trigger that produced it and a confidence);
//! the registry hands the request to an [`AgentStateMachine`] and records
//! whatever it decides.

use serde::{Deserialize, Serialize};

use crate::session::AgentState;

/// What caused a transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StateTrigger {
    Input,
    Output,
    Heuristic,
    AiClassification,
    Timeout,
    Exit,
}

/// The event a classifier observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentEvent {
    Input,
    Busy,
    Prompt,
    Waiting,
    Completion,
    Error,
    Exit,
}

/// A recorded state change.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTransition {
    pub previous: AgentState,
    pub state: AgentState,
    pub trigger: StateTrigger,
    pub confidence: f64,
    pub timestamp: i64,
}

pub trait AgentStateMachine: Send {
    /// Decide the next state, or `None` to reject the request.
    fn transition(
        &mut self,
        id: &str,
        current: AgentState,
        event: AgentEvent,
        trigger: StateTrigger,
        confidence: f64,
    ) -> Option<AgentState>;
}

/// Table-driven machine used when no external one is plugged in.
///
/// Each event names a target state; a request is accepted when its
/// confidence is in `[min_confidence, 1]` and the target differs from the
/// current state.
#[derive(Debug, Clone)]
pub struct DefaultStateMachine {
    min_confidence: f64,
}

impl DefaultStateMachine {
    pub fn new(min_confidence: f64) -> Self {
        Self { min_confidence }
    }

    fn target(current: AgentState, event: AgentEvent) -> AgentState {
        match event {
            AgentEvent::Input | AgentEvent::Busy => AgentState::Busy,
            AgentEvent::Prompt => AgentState::Idle,
            AgentEvent::Waiting => AgentState::Waiting,
            AgentEvent::Completion => AgentState::Completed,
            AgentEvent::Error => AgentState::Failed,
            AgentEvent::Exit if current == AgentState::Failed => AgentState::Failed,
            AgentEvent::Exit => AgentState::Completed,
        }
    }
}

impl Default for DefaultStateMachine {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl AgentStateMachine for DefaultStateMachine {
    fn transition(
        &mut self,
        _id: &str,
        current: AgentState,
        event: AgentEvent,
        _trigger: StateTrigger,
        confidence: f64,
    ) -> Option<AgentState> {
        if !confidence.is_finite() || confidence < self.min_confidence || confidence > 1.0 {
            return None;
        }
        let next = Self::target(current, event);
        (next != current).then_some(next)
    }
}
