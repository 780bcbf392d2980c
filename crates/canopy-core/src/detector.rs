//! Agent lifecycle inference from ANSI-stripped output lines.

use std::time::Duration;
use std::time::Instant;

use crate::patterns;
use crate::protocol::AgentState;
use crate::protocol::StateTrigger;

/// Default quiet period after which a busy agent is assumed idle.
pub const DEFAULT_QUIET_IDLE: Duration = Duration::from_secs(3);

/// A transition the detector decided to make.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub state: AgentState,
    pub previous: AgentState,
    pub trigger: StateTrigger,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Signal {
    state: AgentState,
    trigger: StateTrigger,
    confidence: f32,
}

impl Signal {
    const fn new(state: AgentState, trigger: StateTrigger, confidence: f32) -> Self {
        Self {
            state,
            trigger,
            confidence,
        }
    }
}

fn classify(line: &str) -> Option<Signal> {
    if line.trim().is_empty() {
        return None;
    }
    if patterns::is_failure(line) {
        return Some(Signal::new(AgentState::Failed, StateTrigger::Failure, 0.85));
    }
    if patterns::is_completion(line) {
        return Some(Signal::new(
            AgentState::Completed,
            StateTrigger::Completion,
            0.8,
        ));
    }
    if patterns::is_input_prompt(line) {
        return Some(Signal::new(AgentState::Waiting, StateTrigger::Prompt, 0.9));
    }
    if patterns::is_tool_run(line) {
        return Some(Signal::new(AgentState::Running, StateTrigger::ToolRun, 0.75));
    }
    if patterns::is_busy_indicator(line) {
        return Some(Signal::new(AgentState::Working, StateTrigger::Busy, 0.8));
    }
    None
}

/// Per-terminal state machine. Only transitions allowed by
/// [`AgentState::can_transition_to`] are ever reported; `respawn` is the one
/// exception and forces the state.
#[derive(Debug, Clone)]
pub struct AgentStateDetector {
    state: AgentState,
    last_output: Option<Instant>,
    quiet_idle: Duration,
}

impl AgentStateDetector {
    pub fn new(initial: AgentState, quiet_idle: Duration) -> Self {
        Self {
            state: initial,
            last_output: None,
            quiet_idle,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Feed one batch of lines. The last line carrying a signal wins; plain
    /// output only wakes an idle agent.
    pub fn observe<S: AsRef<str>>(&mut self, lines: &[S], now: Instant) -> Option<Detection> {
        let mut saw_output = false;
        let mut signal = None;
        for line in lines {
            let line = line.as_ref();
            if line.trim().is_empty() {
                continue;
            }
            saw_output = true;
            if let Some(found) = classify(line) {
                signal = Some(found);
            }
        }

        if !saw_output {
            return None;
        }
        self.last_output = Some(now);

        if self.state.is_terminal() {
            return None;
        }

        match signal {
            Some(signal) => self.apply(signal),
            None if self.state == AgentState::Idle => self.apply(Signal::new(
                AgentState::Working,
                StateTrigger::Output,
                0.5,
            )),
            None => None,
        }
    }

    /// Quiet fallback: a busy agent that printed nothing for `quiet_idle`
    /// goes back to idle.
    pub fn tick(&mut self, now: Instant) -> Option<Detection> {
        if !self.state.is_busy() {
            return None;
        }
        let last = self.last_output?;
        if now.saturating_duration_since(last) < self.quiet_idle {
            return None;
        }
        self.apply(Signal::new(AgentState::Idle, StateTrigger::Quiet, 0.6))
    }

    pub fn respawn(&mut self, state: AgentState) -> Option<Detection> {
        self.last_output = None;
        if self.state == state {
            return None;
        }
        let previous = std::mem::replace(&mut self.state, state);
        Some(Detection {
            state,
            previous,
            trigger: StateTrigger::Respawn,
            confidence: 1.0,
        })
    }

    fn apply(&mut self, signal: Signal) -> Option<Detection> {
        if !self.state.can_transition_to(signal.state) {
            return None;
        }
        let previous = std::mem::replace(&mut self.state, signal.state);
        Some(Detection {
            state: signal.state,
            previous,
            trigger: signal.trigger,
            confidence: signal.confidence,
        })
    }
}

impl Default for AgentStateDetector {
    fn default() -> Self {
        Self::new(AgentState::Idle, DEFAULT_QUIET_IDLE)
    }
}
