//! Host ↔ analysis-worker wire protocol.
//!
//! Requests flow host → worker over a channel; events flow back tagged with
//! the generation of the worker that produced them so late messages from a
//! terminated worker can be discarded. `WorkerEvent` serialises with the same
//! `type` tags and camelCase payload fields the renderer side consumes.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::ring_buffer::SharedRingBuffer;

/// Inferred lifecycle state of an agent running inside a terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Working,
    Running,
    Waiting,
    Failed,
    Completed,
}

impl AgentState {
    pub const ALL: [AgentState; 6] = [
        AgentState::Idle,
        AgentState::Working,
        AgentState::Running,
        AgentState::Waiting,
        AgentState::Failed,
        AgentState::Completed,
    ];

    /// Ready states accept automation input without buffering.
    pub fn is_ready(self) -> bool {
        matches!(self, AgentState::Idle | AgentState::Waiting)
    }

    pub fn is_busy(self) -> bool {
        matches!(self, AgentState::Working | AgentState::Running)
    }

    /// Failed and completed only leave through a respawn back to idle.
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentState::Failed | AgentState::Completed)
    }

    pub fn can_transition_to(self, next: AgentState) -> bool {
        use AgentState::*;

        if self == next {
            return false;
        }
        match self {
            Idle => matches!(next, Working | Running | Waiting),
            Working | Running => true,
            Waiting => matches!(next, Idle | Working | Running | Failed | Completed),
            Failed | Completed => next == Idle,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Working => "working",
            AgentState::Running => "running",
            AgentState::Waiting => "waiting",
            AgentState::Failed => "failed",
            AgentState::Completed => "completed",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAgentState(pub String);

impl fmt::Display for UnknownAgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown agent state '{}'", self.0)
    }
}

impl std::error::Error for UnknownAgentState {}

impl FromStr for AgentState {
    type Err = UnknownAgentState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownAgentState(s.to_string()))
    }
}

/// What caused a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateTrigger {
    Output,
    Prompt,
    Busy,
    ToolRun,
    Failure,
    Completion,
    Quiet,
    Respawn,
}

impl StateTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            StateTrigger::Output => "output",
            StateTrigger::Prompt => "prompt",
            StateTrigger::Busy => "busy",
            StateTrigger::ToolRun => "tool_run",
            StateTrigger::Failure => "failure",
            StateTrigger::Completion => "completion",
            StateTrigger::Quiet => "quiet",
            StateTrigger::Respawn => "respawn",
        }
    }
}

impl fmt::Display for StateTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Url,
    DevServer,
    FileReference,
}

/// Structured object lifted out of raw terminal output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

/// Metadata the worker keeps per analysed terminal. The host caches the same
/// record so it can replay registrations into a restarted worker.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalRegistration {
    pub terminal_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<AgentState>,
}

impl TerminalRegistration {
    pub fn new(terminal_id: impl Into<String>) -> Self {
        Self {
            terminal_id: terminal_id.into(),
            ..Self::default()
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_worktree(mut self, worktree_id: Option<String>) -> Self {
        self.worktree_id = worktree_id;
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_initial_state(mut self, state: AgentState) -> Self {
        self.initial_state = Some(state);
        self
    }
}

/// Partial metadata update; `None` fields keep their current value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TerminalUpdate {
    pub terminal_id: String,
    pub agent_id: Option<String>,
    /// `Some(None)` moves the terminal to the global scope.
    pub worktree_id: Option<Option<String>>,
    pub trace_id: Option<String>,
}

/// Host → worker messages.
#[derive(Debug, Clone)]
pub enum WorkerRequest {
    InitBuffer(SharedRingBuffer),
    RegisterTerminal(TerminalRegistration),
    UpdateTerminal(TerminalUpdate),
    UnregisterTerminal { terminal_id: String },
    Reset,
    Ping,
}

impl WorkerRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerRequest::InitBuffer(_) => "INIT_BUFFER",
            WorkerRequest::RegisterTerminal(_) => "REGISTER_TERMINAL",
            WorkerRequest::UpdateTerminal(_) => "UPDATE_TERMINAL",
            WorkerRequest::UnregisterTerminal { .. } => "UNREGISTER_TERMINAL",
            WorkerRequest::Reset => "RESET",
            WorkerRequest::Ping => "PING",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub terminal_id: String,
    pub agent_id: String,
    pub state: AgentState,
    pub previous_state: AgentState,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub trigger: StateTrigger,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactBatch {
    pub terminal_id: String,
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerFailure {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Worker → host messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerEvent {
    Ready,
    Pong,
    ArtifactDetected(ArtifactBatch),
    StateChanged(StateChange),
    Error(WorkerFailure),
}

/// Everything a worker can send back, including the crash signal that the
/// host treats like a runtime error of the worker itself.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutput {
    Event(WorkerEvent),
    Crashed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEnvelope {
    pub generation: u64,
    pub output: WorkerOutput,
}

impl WorkerEnvelope {
    pub fn event(generation: u64, event: WorkerEvent) -> Self {
        Self {
            generation,
            output: WorkerOutput::Event(event),
        }
    }

    pub fn crashed(generation: u64, reason: impl Into<String>) -> Self {
        Self {
            generation,
            output: WorkerOutput::Crashed(reason.into()),
        }
    }
}
