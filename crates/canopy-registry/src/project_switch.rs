//! Phased teardown and rehydration when the active project changes.
//!
//! `IDLE → BEGIN_SWITCH → PERSIST_OLD_STATE → TEARDOWN_RENDERER →
//! SWITCH_IN_MAIN → HYDRATE_NEW_STATE → END_SWITCH → IDLE`. A failing step
//! parks the machine in `ERROR` until [`ProjectSwitchTransaction::reset`].

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

use canopy_common::mutex_lock_or_recover;
use tracing::error;
use tracing::info;
use tracing::info_span;

use crate::error::RegistryError;
use crate::error::SwitchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwitchPhase {
    Idle,
    BeginSwitch,
    PersistOldState,
    TeardownRenderer,
    SwitchInMain,
    HydrateNewState,
    EndSwitch,
    Error,
}

impl SwitchPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SwitchPhase::Idle => "IDLE",
            SwitchPhase::BeginSwitch => "BEGIN_SWITCH",
            SwitchPhase::PersistOldState => "PERSIST_OLD_STATE",
            SwitchPhase::TeardownRenderer => "TEARDOWN_RENDERER",
            SwitchPhase::SwitchInMain => "SWITCH_IN_MAIN",
            SwitchPhase::HydrateNewState => "HYDRATE_NEW_STATE",
            SwitchPhase::EndSwitch => "END_SWITCH",
            SwitchPhase::Error => "ERROR",
        }
    }
}

impl fmt::Display for SwitchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The work done in each phase.
pub trait SwitchSteps: Send + Sync {
    fn persist_old_state(&self) -> Result<(), RegistryError>;
    fn teardown_renderer(&self) -> Result<(), RegistryError>;
    fn switch_in_main(&self, project_id: &str) -> Result<(), RegistryError>;
    fn hydrate_new_state(&self, project_id: &str) -> Result<(), RegistryError>;
}

type ErrorCallback = Arc<dyn Fn(&SwitchError, SwitchPhase) + Send + Sync>;

struct SwitchState {
    phase: SwitchPhase,
    current_project: Option<String>,
}

pub struct ProjectSwitchTransaction {
    steps: Arc<dyn SwitchSteps>,
    state: Mutex<SwitchState>,
    on_error: Mutex<Vec<ErrorCallback>>,
}

impl ProjectSwitchTransaction {
    pub fn new(steps: Arc<dyn SwitchSteps>) -> Self {
        Self {
            steps,
            state: Mutex::new(SwitchState {
                phase: SwitchPhase::Idle,
                current_project: None,
            }),
            on_error: Mutex::new(Vec::new()),
        }
    }

    pub fn phase(&self) -> SwitchPhase {
        mutex_lock_or_recover(&self.state).phase
    }

    pub fn current_project(&self) -> Option<String> {
        mutex_lock_or_recover(&self.state).current_project.clone()
    }

    /// Called with the error and the phase it happened in.
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&SwitchError, SwitchPhase) + Send + Sync + 'static,
    {
        mutex_lock_or_recover(&self.on_error).push(Arc::new(callback));
    }

    fn enter(&self, phase: SwitchPhase) {
        mutex_lock_or_recover(&self.state).phase = phase;
    }

    pub fn switch(&self, project_id: &str) -> Result<(), SwitchError> {
        {
            let mut state = mutex_lock_or_recover(&self.state);
            match state.phase {
                SwitchPhase::Idle => state.phase = SwitchPhase::BeginSwitch,
                SwitchPhase::Error => return Err(SwitchError::NeedsReset),
                busy => return Err(SwitchError::AlreadyInProgress(busy)),
            }
        }

        let span = info_span!("project_switch", project_id);
        let _enter = span.enter();
        info!("Project switch started");

        self.run_step(SwitchPhase::PersistOldState, || self.steps.persist_old_state())?;
        self.run_step(SwitchPhase::TeardownRenderer, || self.steps.teardown_renderer())?;
        self.run_step(SwitchPhase::SwitchInMain, || {
            self.steps.switch_in_main(project_id)
        })?;
        self.run_step(SwitchPhase::HydrateNewState, || {
            self.steps.hydrate_new_state(project_id)
        })?;

        self.enter(SwitchPhase::EndSwitch);
        {
            let mut state = mutex_lock_or_recover(&self.state);
            state.current_project = Some(project_id.to_string());
            state.phase = SwitchPhase::Idle;
        }
        info!("Project switch finished");
        Ok(())
    }

    fn run_step<F>(&self, phase: SwitchPhase, step: F) -> Result<(), SwitchError>
    where
        F: FnOnce() -> Result<(), RegistryError>,
    {
        self.enter(phase);
        step().map_err(|e| self.fail(phase, e))
    }

    fn fail(&self, phase: SwitchPhase, cause: RegistryError) -> SwitchError {
        self.enter(SwitchPhase::Error);
        let err = SwitchError::Phase {
            phase,
            reason: cause.to_string(),
        };
        error!(phase = %phase, error = %cause, "Project switch failed");
        let callbacks: Vec<ErrorCallback> = mutex_lock_or_recover(&self.on_error).clone();
        for callback in callbacks {
            callback(&err, phase);
        }
        err
    }

    /// Leave `ERROR` so a new switch can start.
    pub fn reset(&self) -> Result<(), SwitchError> {
        let mut state = mutex_lock_or_recover(&self.state);
        match state.phase {
            SwitchPhase::Error | SwitchPhase::Idle => {
                state.phase = SwitchPhase::Idle;
                Ok(())
            }
            busy => Err(SwitchError::NotResettable(busy)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[derive(Default)]
    struct RecordingSteps {
        calls: Mutex<Vec<String>>,
        fail_in: Mutex<Option<SwitchPhase>>,
        gate: Mutex<Option<Arc<Barrier>>>,
    }

    impl RecordingSteps {
        fn step(&self, phase: SwitchPhase, label: String) -> Result<(), RegistryError> {
            self.calls.lock().unwrap().push(label);
            let gate = self.gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                if phase == SwitchPhase::PersistOldState {
                    gate.wait();
                    gate.wait();
                }
            }
            if *self.fail_in.lock().unwrap() == Some(phase) {
                return Err(RegistryError::persistence("save", "disk full"));
            }
            Ok(())
        }
    }

    impl SwitchSteps for RecordingSteps {
        fn persist_old_state(&self) -> Result<(), RegistryError> {
            self.step(SwitchPhase::PersistOldState, "persist".to_string())
        }

        fn teardown_renderer(&self) -> Result<(), RegistryError> {
            self.step(SwitchPhase::TeardownRenderer, "teardown".to_string())
        }

        fn switch_in_main(&self, project_id: &str) -> Result<(), RegistryError> {
            self.step(SwitchPhase::SwitchInMain, format!("switch:{project_id}"))
        }

        fn hydrate_new_state(&self, project_id: &str) -> Result<(), RegistryError> {
            self.step(SwitchPhase::HydrateNewState, format!("hydrate:{project_id}"))
        }
    }

    #[test]
    fn test_phases_run_in_order() {
        let steps = Arc::new(RecordingSteps::default());
        let tx = ProjectSwitchTransaction::new(steps.clone());

        tx.switch("proj-b").unwrap();

        assert_eq!(
            *steps.calls.lock().unwrap(),
            vec!["persist", "teardown", "switch:proj-b", "hydrate:proj-b"]
        );
        assert_eq!(tx.phase(), SwitchPhase::Idle);
        assert_eq!(tx.current_project().as_deref(), Some("proj-b"));
    }

    #[test]
    fn test_failure_parks_in_error_until_reset() {
        let steps = Arc::new(RecordingSteps::default());
        *steps.fail_in.lock().unwrap() = Some(SwitchPhase::SwitchInMain);
        let tx = ProjectSwitchTransaction::new(steps.clone());
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        tx.on_error(move |_, phase| sink.lock().unwrap().push(phase));

        let err = tx.switch("proj-b").unwrap_err();
        assert_eq!(err.phase(), Some(SwitchPhase::SwitchInMain));
        assert_eq!(tx.phase(), SwitchPhase::Error);
        assert_eq!(*reported.lock().unwrap(), vec![SwitchPhase::SwitchInMain]);
        assert!(tx.current_project().is_none());

        assert_eq!(tx.switch("proj-c"), Err(SwitchError::NeedsReset));

        *steps.fail_in.lock().unwrap() = None;
        tx.reset().unwrap();
        tx.switch("proj-c").unwrap();
        assert_eq!(tx.current_project().as_deref(), Some("proj-c"));
    }

    #[test]
    fn test_second_switch_is_rejected_while_running() {
        let steps = Arc::new(RecordingSteps::default());
        let gate = Arc::new(Barrier::new(2));
        *steps.gate.lock().unwrap() = Some(Arc::clone(&gate));
        let tx = Arc::new(ProjectSwitchTransaction::new(steps.clone()));

        let runner = {
            let tx = Arc::clone(&tx);
            thread::spawn(move || tx.switch("proj-b"))
        };
        gate.wait();

        assert_eq!(
            tx.switch("proj-c"),
            Err(SwitchError::AlreadyInProgress(SwitchPhase::PersistOldState))
        );
        assert_eq!(
            tx.reset(),
            Err(SwitchError::NotResettable(SwitchPhase::PersistOldState))
        );

        gate.wait();
        assert_eq!(runner.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(SwitchPhase::HydrateNewState.to_string(), "HYDRATE_NEW_STATE");
        assert_eq!(SwitchPhase::Idle.to_string(), "IDLE");
    }
}
