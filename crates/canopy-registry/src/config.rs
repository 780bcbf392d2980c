use std::env;
use std::path::PathBuf;
use std::time::Duration;

use canopy_core::DEFAULT_RING_CAPACITY;
use canopy_core::WorkerSettings;
use canopy_core::artifacts::DEFAULT_DEDUP_WINDOW;

pub const DEFAULT_MAX_GRID_TERMINALS: usize = 16;
const DEFAULT_TRASH_TTL_SECS: u64 = 120;
const DEFAULT_FLUSH_SETTLE_MS: u64 = 100;
const DEFAULT_REPLAY_HISTORY_LINES: usize = 500;
const DEFAULT_POLL_INTERVAL_MS: u64 = 10;
const DEFAULT_QUIET_IDLE_MS: u64 = 3000;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn default_state_file() -> PathBuf {
    let home = env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"));
    home.join(".canopy").join("state.json")
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Grid slots per worktree scope.
    pub max_grid_terminals: usize,
    /// Time a trashed terminal lingers before it is hard-removed.
    pub trash_ttl: Duration,
    /// Delay between leaving buffered mode and flushing, so the renderer can
    /// subscribe first.
    pub flush_settle: Duration,
    pub replay_history_lines: usize,
    pub state_file: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RegistryConfig {
    pub fn from_env() -> Self {
        Self {
            max_grid_terminals: env_parse("CANOPY_MAX_GRID_TERMINALS")
                .filter(|max| *max > 0)
                .unwrap_or(DEFAULT_MAX_GRID_TERMINALS),
            trash_ttl: Duration::from_secs(
                env_parse("CANOPY_TRASH_TTL_SECS").unwrap_or(DEFAULT_TRASH_TTL_SECS),
            ),
            flush_settle: Duration::from_millis(
                env_parse("CANOPY_FLUSH_SETTLE_MS").unwrap_or(DEFAULT_FLUSH_SETTLE_MS),
            ),
            replay_history_lines: env_parse("CANOPY_REPLAY_HISTORY_LINES")
                .unwrap_or(DEFAULT_REPLAY_HISTORY_LINES),
            state_file: env::var("CANOPY_STATE_FILE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(default_state_file),
        }
    }

    pub fn with_max_grid_terminals(mut self, max: usize) -> Self {
        self.max_grid_terminals = max;
        self
    }

    pub fn with_trash_ttl(mut self, ttl: Duration) -> Self {
        self.trash_ttl = ttl;
        self
    }

    pub fn with_flush_settle(mut self, settle: Duration) -> Self {
        self.flush_settle = settle;
        self
    }

    pub fn with_replay_history_lines(mut self, lines: usize) -> Self {
        self.replay_history_lines = lines;
        self
    }

    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = path.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub ring_capacity: usize,
    pub poll_interval: Duration,
    pub quiet_idle: Duration,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl AnalysisConfig {
    pub fn from_env() -> Self {
        Self {
            ring_capacity: env_parse("CANOPY_RING_CAPACITY").unwrap_or(DEFAULT_RING_CAPACITY),
            poll_interval: Duration::from_millis(
                env_parse("CANOPY_POLL_INTERVAL_MS")
                    .filter(|ms| *ms > 0)
                    .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            quiet_idle: Duration::from_millis(
                env_parse("CANOPY_QUIET_IDLE_MS").unwrap_or(DEFAULT_QUIET_IDLE_MS),
            ),
        }
    }

    pub fn with_ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_quiet_idle(mut self, quiet: Duration) -> Self {
        self.quiet_idle = quiet;
        self
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            poll_interval: self.poll_interval,
            quiet_idle: self.quiet_idle,
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}
