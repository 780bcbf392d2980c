mod persisted;
mod types;

pub use persisted::PersistedState;
pub use persisted::PersistedTabGroup;
pub use persisted::PersistedTerminal;
pub use types::Activity;
pub use types::CommandOrigin;
pub use types::PanelKind;
pub use types::PanelLocation;
pub use types::QueuedCommand;
pub use types::TabGroup;
pub use types::TerminalInstance;
pub use types::TrashedTerminal;
