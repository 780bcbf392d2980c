//! Composition root: builds every service once and wires their events.

use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use canopy_core::TerminalRegistration;
use canopy_core::TerminalUpdate;
use canopy_core::WorkerFactory;
use tracing::debug;
use tracing::warn;

use crate::command_queue::CommandQueue;
use crate::config::RegistryConfig;
use crate::error::AnalysisError;
use crate::error::RegistryError;
use crate::events::RegistryEvent;
use crate::focus::FocusTracker;
use crate::ports::Clock;
use crate::ports::RendererPolicy;
use crate::ports::Scheduler;
use crate::ports::SharedBufferSource;
use crate::ports::StateStore;
use crate::ports::TerminalBridge;
use crate::project_switch::ProjectSwitchTransaction;
use crate::project_switch::SwitchSteps;
use crate::registry::HydrationReport;
use crate::registry::RegistryPorts;
use crate::registry::TerminalRegistry;
use crate::semantic_service::AnalysisEvent;
use crate::semantic_service::SemanticAnalysisService;

#[derive(Clone)]
pub struct ServiceDeps {
    pub bridge: Arc<dyn TerminalBridge>,
    pub buffers: Arc<dyn SharedBufferSource>,
    pub store: Arc<dyn StateStore>,
    pub renderer: Arc<dyn RendererPolicy>,
    pub scheduler: Arc<dyn Scheduler>,
    pub clock: Arc<dyn Clock>,
    pub workers: Arc<dyn WorkerFactory>,
}

pub struct ServiceContainer {
    pub registry: Arc<TerminalRegistry>,
    pub commands: Arc<CommandQueue>,
    pub analysis: SemanticAnalysisService,
    pub focus: Arc<FocusTracker>,
    pub switcher: Arc<ProjectSwitchTransaction>,
    deps: ServiceDeps,
}

impl ServiceContainer {
    pub fn new(deps: ServiceDeps, config: RegistryConfig) -> Self {
        let registry = Arc::new(TerminalRegistry::new(
            RegistryPorts {
                bridge: Arc::clone(&deps.bridge),
                store: Arc::clone(&deps.store),
                renderer: Arc::clone(&deps.renderer),
                scheduler: Arc::clone(&deps.scheduler),
                clock: Arc::clone(&deps.clock),
            },
            config,
        ));
        let commands = Arc::new(CommandQueue::new(
            Arc::clone(&registry),
            Arc::clone(&deps.clock),
        ));
        let analysis = SemanticAnalysisService::new(
            Arc::clone(&deps.workers),
            Arc::clone(&deps.buffers),
            Arc::clone(&deps.scheduler),
            Arc::clone(&deps.clock),
        );
        let focus = Arc::new(FocusTracker::new());
        let switcher = Arc::new(ProjectSwitchTransaction::new(Arc::new(ContainerSwitchSteps {
            registry: Arc::downgrade(&registry),
            analysis: analysis.clone(),
            bridge: Arc::clone(&deps.bridge),
            store: Arc::clone(&deps.store),
            renderer: Arc::clone(&deps.renderer),
        })));

        wire_analysis_to_registry(&analysis, Arc::downgrade(&registry));
        wire_registry_events(
            &registry,
            Arc::downgrade(&registry),
            Arc::downgrade(&commands),
            analysis.clone(),
            Arc::clone(&focus),
        );

        Self {
            registry,
            commands,
            analysis,
            focus,
            switcher,
            deps,
        }
    }

    /// Start background analysis. Failure leaves the registry fully usable
    /// and `initialize` can be called again.
    pub fn initialize(&self) -> Result<(), AnalysisError> {
        self.analysis.initialize()
    }

    /// Rebuild the registry for its current project from the store.
    pub fn restore_session(&self) -> Result<HydrationReport, RegistryError> {
        let project_id = self.registry.project_id();
        let state = self.deps.store.load(project_id.as_deref())?;
        let live = match &project_id {
            Some(project_id) => self.deps.bridge.get_for_project(project_id)?,
            None => Vec::new(),
        };
        Ok(self.registry.hydrate(state, &live))
    }

    /// Deliver pending analysis output.
    pub fn pump(&self) -> usize {
        self.analysis.pump()
    }

    pub fn pump_timeout(&self, timeout: Duration) -> usize {
        self.analysis.pump_timeout(timeout)
    }

    /// Hard-remove trashed terminals whose countdown ran out.
    pub fn purge_expired_trash(&self) -> Vec<String> {
        self.registry.purge_expired_trash(self.deps.clock.now())
    }

    pub fn dispose(&self) {
        self.analysis.dispose();
        if let Err(e) = self.registry.persist_all() {
            warn!(error = %e, "Failed to persist state on shutdown");
        }
    }
}

fn wire_analysis_to_registry(analysis: &SemanticAnalysisService, registry: Weak<TerminalRegistry>) {
    analysis.events().subscribe(move |event: &AnalysisEvent| {
        let Some(registry) = registry.upgrade() else {
            return;
        };
        match event {
            AnalysisEvent::StateChanged(change) => {
                registry.update_agent_state(
                    &change.terminal_id,
                    change.state,
                    change.trigger,
                    change.confidence,
                );
            }
            AnalysisEvent::Error { error, context } => {
                warn!(error = %error, context = ?context, "Semantic analysis error");
            }
            _ => {}
        }
    });
}

fn wire_registry_events(
    source: &TerminalRegistry,
    registry: Weak<TerminalRegistry>,
    commands: Weak<CommandQueue>,
    analysis: SemanticAnalysisService,
    focus: Arc<FocusTracker>,
) {
    source.events().subscribe(move |event: &RegistryEvent| {
        focus.on_registry_event(event);
        match event {
            RegistryEvent::TerminalAdded { id } => {
                let Some(instance) = registry.upgrade().and_then(|r| r.get(id)) else {
                    return;
                };
                let mut registration =
                    TerminalRegistration::new(id.clone()).with_worktree(instance.worktree_id);
                if let Some(agent_id) = instance.agent_id {
                    registration = registration.with_agent(agent_id);
                }
                if let Err(e) = analysis.register_terminal(registration) {
                    warn!(terminal_id = %id, error = %e, "Failed to register terminal for analysis");
                }
            }
            RegistryEvent::TerminalRemoved { id, .. } => {
                if let Some(commands) = commands.upgrade() {
                    commands.clear_queue(id);
                }
                if let Err(e) = analysis.unregister_terminal(id) {
                    debug!(terminal_id = %id, error = %e, "Unregister from analysis failed");
                }
            }
            RegistryEvent::TerminalMoved { id, worktree_id, .. } => {
                let update = TerminalUpdate {
                    terminal_id: id.clone(),
                    worktree_id: Some(worktree_id.clone()),
                    ..TerminalUpdate::default()
                };
                if let Err(e) = analysis.update_terminal(update) {
                    debug!(terminal_id = %id, error = %e, "Analysis update failed");
                }
            }
            RegistryEvent::AgentStateChanged { id, state, .. } if state.is_ready() => {
                let Some(commands) = commands.upgrade() else {
                    return;
                };
                if let Err(e) = commands.process_queue(id) {
                    warn!(terminal_id = %id, error = %e, "Failed to flush queued command");
                }
            }
            _ => {}
        }
    });
}

struct ContainerSwitchSteps {
    registry: Weak<TerminalRegistry>,
    analysis: SemanticAnalysisService,
    bridge: Arc<dyn TerminalBridge>,
    store: Arc<dyn StateStore>,
    renderer: Arc<dyn RendererPolicy>,
}

impl ContainerSwitchSteps {
    fn registry(&self) -> Result<Arc<TerminalRegistry>, RegistryError> {
        self.registry
            .upgrade()
            .ok_or_else(|| RegistryError::persistence("switch", "registry dropped"))
    }
}

impl SwitchSteps for ContainerSwitchSteps {
    fn persist_old_state(&self) -> Result<(), RegistryError> {
        self.registry()?.persist_all()
    }

    /// Drops renderer resources and forgets the old project's terminals;
    /// their processes keep running for a later reconnect.
    fn teardown_renderer(&self) -> Result<(), RegistryError> {
        let registry = self.registry()?;
        for terminal in registry.snapshot().iter() {
            self.renderer.dispose(&terminal.id);
        }
        if let Err(e) = self.analysis.reset() {
            debug!(error = %e, "Analysis reset skipped");
        }
        registry.detach_all();
        Ok(())
    }

    fn switch_in_main(&self, project_id: &str) -> Result<(), RegistryError> {
        self.bridge.set_active_project(project_id)?;
        self.registry()?.set_project(Some(project_id.to_string()));
        Ok(())
    }

    fn hydrate_new_state(&self, project_id: &str) -> Result<(), RegistryError> {
        let registry = self.registry()?;
        let state = self.store.load(Some(project_id))?;
        let live = self.bridge.get_for_project(project_id)?;
        let report = registry.hydrate(state, &live);
        for (id, e) in &report.failed {
            warn!(terminal_id = %id, error = %e, "Terminal could not be restored");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CommandOrigin;
    use crate::domain::PanelKind;
    use crate::domain::PanelLocation;
    use crate::domain::PersistedState;
    use crate::domain::PersistedTerminal;
    use crate::project_switch::SwitchPhase;
    use crate::registry::AddTerminalOptions;
    use crate::test_support::FakeWorkerFactory;
    use crate::test_support::FixedClock;
    use crate::test_support::ManualScheduler;
    use crate::test_support::MockRendererPolicy;
    use crate::test_support::MockStateStore;
    use crate::test_support::MockTerminalBridge;
    use crate::test_support::StaticBufferSource;
    use crate::test_support::test_config;
    use canopy_core::AgentState;
    use canopy_core::StateChange;
    use canopy_core::StateTrigger;
    use canopy_core::WorkerEvent;

    struct Fixture {
        container: ServiceContainer,
        bridge: Arc<MockTerminalBridge>,
        store: Arc<MockStateStore>,
        workers: FakeWorkerFactory,
    }

    fn fixture() -> Fixture {
        let bridge = Arc::new(MockTerminalBridge::new());
        let store = Arc::new(MockStateStore::new());
        let workers = FakeWorkerFactory::new();
        let deps = ServiceDeps {
            bridge: bridge.clone(),
            buffers: Arc::new(StaticBufferSource::available(4096)),
            store: store.clone(),
            renderer: Arc::new(MockRendererPolicy::new()),
            scheduler: Arc::new(ManualScheduler::new()),
            clock: Arc::new(FixedClock::new()),
            workers: Arc::new(workers.clone()),
        };
        Fixture {
            container: ServiceContainer::new(deps, test_config()),
            bridge,
            store,
            workers,
        }
    }

    fn add_agent(f: &Fixture, id: &str) {
        f.container
            .registry
            .add_terminal(
                AddTerminalOptions::new(PanelKind::Agent)
                    .with_id(id)
                    .with_agent("claude"),
            )
            .unwrap();
    }

    fn change(id: &str, state: AgentState, previous: AgentState) -> StateChange {
        StateChange {
            terminal_id: id.to_string(),
            agent_id: "claude".to_string(),
            state,
            previous_state: previous,
            timestamp: 0,
            trigger: StateTrigger::Prompt,
            confidence: 0.9,
            worktree_id: None,
            trace_id: None,
        }
    }

    #[test]
    fn test_added_terminals_are_registered_for_analysis() {
        let f = fixture();
        add_agent(&f, "t1");
        f.container.initialize().unwrap();

        let registrations = f.container.analysis.registrations();
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].agent_id.as_deref(), Some("claude"));
        assert_eq!(f.workers.registered_ids(0), vec!["t1"]);
    }

    #[test]
    fn test_move_to_global_scope_clears_analysis_worktree() {
        let f = fixture();
        f.container.initialize().unwrap();
        f.container
            .registry
            .add_terminal(
                AddTerminalOptions::new(PanelKind::Agent)
                    .with_id("t1")
                    .with_agent("claude")
                    .with_worktree(Some("wt-a".to_string())),
            )
            .unwrap();

        assert!(f
            .container
            .registry
            .move_terminal_to_worktree("t1", None)
            .unwrap());

        assert_eq!(f.container.analysis.registrations()[0].worktree_id, None);
        assert_eq!(
            f.workers.request_kinds(0),
            vec!["INIT_BUFFER", "REGISTER_TERMINAL", "UPDATE_TERMINAL"]
        );
    }

    #[test]
    fn test_worker_state_flows_into_registry_and_releases_queue() {
        let f = fixture();
        f.container.initialize().unwrap();
        add_agent(&f, "t1");
        f.container.registry.update_agent_state(
            "t1",
            AgentState::Working,
            StateTrigger::Busy,
            0.8,
        );
        f.container
            .commands
            .queue_command("t1", "continue\n", "resume", CommandOrigin::Automation)
            .unwrap();
        assert!(f.bridge.written_to("t1").is_empty());

        f.workers.emit(
            0,
            WorkerEvent::StateChanged(change("t1", AgentState::Waiting, AgentState::Working)),
        );
        f.container.pump();

        let instance = f.container.registry.get("t1").unwrap();
        assert_eq!(instance.agent_state, Some(AgentState::Waiting));
        assert_eq!(f.bridge.written_to("t1"), vec!["continue\n"]);
        assert_eq!(f.container.commands.queue_len("t1"), 0);
    }

    #[test]
    fn test_state_change_for_removed_terminal_is_ignored() {
        let f = fixture();
        f.container.initialize().unwrap();
        f.workers.emit(
            0,
            WorkerEvent::StateChanged(change("gone", AgentState::Waiting, AgentState::Idle)),
        );
        f.container.pump();
        assert!(f.container.registry.is_empty());
    }

    #[test]
    fn test_removal_clears_queue_registration_and_focus() {
        let f = fixture();
        add_agent(&f, "t1");
        add_agent(&f, "t2");
        f.container.focus.focus(Some("t1"));
        f.container.registry.update_agent_state(
            "t1",
            AgentState::Running,
            StateTrigger::ToolRun,
            0.75,
        );
        f.container
            .commands
            .queue_command("t1", "x", "d", CommandOrigin::Automation)
            .unwrap();

        f.container.registry.remove_terminal("t1").unwrap();

        assert_eq!(f.container.commands.queue_len("t1"), 0);
        let ids: Vec<_> = f
            .container
            .analysis
            .registrations()
            .into_iter()
            .map(|r| r.terminal_id)
            .collect();
        assert_eq!(ids, vec!["t2"]);
        assert_eq!(f.container.focus.focused().as_deref(), Some("t2"));
    }

    #[test]
    fn test_project_switch_persists_then_hydrates_new_project() {
        let f = fixture();
        add_agent(&f, "old");
        f.store.set_state(
            Some("proj-b"),
            PersistedState {
                terminals: vec![PersistedTerminal {
                    id: "new".to_string(),
                    kind: PanelKind::Terminal,
                    title: "shell".to_string(),
                    cwd: None,
                    worktree_id: None,
                    location: PanelLocation::Grid,
                    command: Some("bash".to_string()),
                    agent_id: None,
                }],
                tab_groups: Vec::new(),
            },
        );
        f.bridge.set_live("proj-b", &["new"]);

        f.container.switcher.switch("proj-b").unwrap();

        assert_eq!(f.container.switcher.phase(), SwitchPhase::Idle);
        assert_eq!(f.bridge.active_projects(), vec!["proj-b"]);
        assert_eq!(f.bridge.reconnected(), vec!["new"]);
        assert!(f.bridge.killed().is_empty());
        let ids: Vec<_> = f
            .container
            .registry
            .snapshot()
            .iter()
            .map(|t| t.id.clone())
            .collect();
        assert_eq!(ids, vec!["new"]);
        assert_eq!(f.store.last_terminals().unwrap()[0].id, "old");
        assert_eq!(f.container.registry.project_id().as_deref(), Some("proj-b"));
    }

    #[test]
    fn test_failed_switch_surfaces_phase() {
        let f = fixture();
        f.bridge.fail_operation("set_active_project");

        let err = f.container.switcher.switch("proj-b").unwrap_err();
        assert_eq!(err.phase(), Some(SwitchPhase::SwitchInMain));
        assert_eq!(f.container.switcher.phase(), SwitchPhase::Error);
    }

    #[test]
    fn test_restore_session_hydrates_default_project() {
        let f = fixture();
        f.store.set_state(
            None,
            PersistedState {
                terminals: vec![PersistedTerminal {
                    id: "t1".to_string(),
                    kind: PanelKind::Terminal,
                    title: "shell".to_string(),
                    cwd: None,
                    worktree_id: None,
                    location: PanelLocation::Dock,
                    command: Some("bash".to_string()),
                    agent_id: None,
                }],
                tab_groups: Vec::new(),
            },
        );

        let report = f.container.restore_session().unwrap();
        assert_eq!(report.respawned, vec!["t1"]);
        assert_eq!(
            f.container.registry.get("t1").unwrap().location,
            PanelLocation::Dock
        );
    }
}
