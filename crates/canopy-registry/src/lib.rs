//! Terminal lifecycle and placement for canopy.
//!
//! [`TerminalRegistry`] owns the list of terminal instances and their tab
//! groups. [`CommandQueue`] gates automation input on agent readiness,
//! [`SemanticAnalysisService`] hosts the analysis worker and
//! [`ProjectSwitchTransaction`] swaps the whole registry between projects.
//! [`ServiceContainer`] builds and wires all of them over the [`ports`].

#![deny(clippy::all)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod command_queue;
pub mod config;
pub mod container;
pub mod domain;
pub mod error;
pub mod events;
pub mod focus;
pub mod persistence;
pub mod ports;
pub mod project_switch;
pub mod registry;
pub mod semantic_service;
pub mod sleeper;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use command_queue::CommandQueue;
pub use command_queue::QueueOutcome;
pub use config::AnalysisConfig;
pub use config::DEFAULT_MAX_GRID_TERMINALS;
pub use config::RegistryConfig;
pub use container::ServiceContainer;
pub use container::ServiceDeps;
pub use domain::CommandOrigin;
pub use domain::PanelKind;
pub use domain::PanelLocation;
pub use domain::TabGroup;
pub use domain::TerminalInstance;
pub use error::AnalysisError;
pub use error::BridgeError;
pub use error::QueueError;
pub use error::RegistryError;
pub use error::SwitchError;
pub use events::EventBus;
pub use events::RegistryEvent;
pub use focus::FocusTracker;
pub use persistence::JsonStateStore;
pub use project_switch::ProjectSwitchTransaction;
pub use project_switch::SwitchPhase;
pub use registry::AddTerminalOptions;
pub use registry::HydrationReport;
pub use registry::TerminalRegistry;
pub use semantic_service::AnalysisEvent;
pub use semantic_service::SemanticAnalysisService;
