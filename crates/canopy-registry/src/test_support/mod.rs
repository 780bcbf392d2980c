//! Test doubles for every port, plus a harness wiring them to a registry.

mod bridge;
mod store;
mod timing;
mod worker;

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

pub use bridge::MockTerminalBridge;
pub use bridge::StaticBufferSource;
pub use store::MockRendererPolicy;
pub use store::MockStateStore;
pub use timing::FixedClock;
pub use timing::ManualScheduler;
pub use worker::FakeWorkerFactory;

use crate::config::DEFAULT_MAX_GRID_TERMINALS;
use crate::config::RegistryConfig;
use crate::domain::PanelKind;
use crate::domain::PanelLocation;
use crate::events::RegistryEvent;
use crate::registry::AddTerminalOptions;
use crate::registry::RegistryPorts;
use crate::registry::TerminalRegistry;

/// Config with fixed values so tests do not depend on the environment.
pub fn test_config() -> RegistryConfig {
    RegistryConfig::from_env()
        .with_max_grid_terminals(DEFAULT_MAX_GRID_TERMINALS)
        .with_trash_ttl(Duration::from_secs(120))
        .with_flush_settle(Duration::from_millis(100))
        .with_replay_history_lines(500)
        .with_state_file(std::env::temp_dir().join("canopy-test-state.json"))
}

pub struct TestHarness {
    pub registry: Arc<TerminalRegistry>,
    pub bridge: Arc<MockTerminalBridge>,
    pub store: Arc<MockStateStore>,
    pub renderer: Arc<MockRendererPolicy>,
    pub scheduler: Arc<ManualScheduler>,
    pub clock: Arc<FixedClock>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_max_grid(max: usize) -> Self {
        Self::with_config(test_config().with_max_grid_terminals(max))
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        let bridge = Arc::new(MockTerminalBridge::new());
        let store = Arc::new(MockStateStore::new());
        let renderer = Arc::new(MockRendererPolicy::new());
        let scheduler = Arc::new(ManualScheduler::new());
        let clock = Arc::new(FixedClock::new());
        let ports = RegistryPorts {
            bridge: bridge.clone(),
            store: store.clone(),
            renderer: renderer.clone(),
            scheduler: scheduler.clone(),
            clock: clock.clone(),
        };
        Self {
            registry: Arc::new(TerminalRegistry::new(ports, config)),
            bridge,
            store,
            renderer,
            scheduler,
            clock,
        }
    }

    pub fn ports(&self) -> RegistryPorts {
        RegistryPorts {
            bridge: self.bridge.clone(),
            store: self.store.clone(),
            renderer: self.renderer.clone(),
            scheduler: self.scheduler.clone(),
            clock: self.clock.clone(),
        }
    }

    fn add_with(&self, options: AddTerminalOptions) -> String {
        match self.registry.add_terminal(options) {
            Ok(id) => id,
            Err(e) => panic!("add_terminal failed in test harness: {e}"),
        }
    }

    /// Plain terminal, requested in the grid.
    pub fn add(&self, id: &str, worktree: Option<&str>) -> String {
        self.add_with(
            AddTerminalOptions::default()
                .with_id(id)
                .with_worktree(worktree.map(str::to_string)),
        )
    }

    pub fn add_docked(&self, id: &str, worktree: Option<&str>) -> String {
        self.add_with(
            AddTerminalOptions::default()
                .with_id(id)
                .with_worktree(worktree.map(str::to_string))
                .with_location(PanelLocation::Dock),
        )
    }

    /// Agent terminal; starts idle.
    pub fn add_agent(&self, id: &str, worktree: Option<&str>) -> String {
        self.add_with(
            AddTerminalOptions::new(PanelKind::Agent)
                .with_id(id)
                .with_agent("claude")
                .with_worktree(worktree.map(str::to_string)),
        )
    }

    /// Collect every registry event published from now on.
    pub fn record_events(&self) -> Arc<Mutex<Vec<RegistryEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        self.registry.events().subscribe(move |event: &RegistryEvent| {
            canopy_common::mutex_lock_or_recover(&sink).push(event.clone());
        });
        events
    }
}
