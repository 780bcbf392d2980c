//! JSON file store for per-project registry state.
//!
//! The file maps project ids (`"default"` for none) to their terminals and
//! tab groups. Writers hold an advisory `flock` on a sibling lock file, write
//! a temp file and rename it over the original.

use std::collections::BTreeMap;
use std::fs;
use std::fs::File;
use std::io::BufReader;
use std::io::BufWriter;
use std::path::Path;
use std::path::PathBuf;

use tracing::warn;

use crate::domain::PersistedState;
use crate::domain::PersistedTabGroup;
use crate::domain::PersistedTerminal;
use crate::error::RegistryError;
use crate::ports::StateStore;

const DEFAULT_PROJECT_KEY: &str = "default";

type StateFile = BTreeMap<String, PersistedState>;

fn project_key(project_id: Option<&str>) -> String {
    project_id.unwrap_or(DEFAULT_PROJECT_KEY).to_string()
}

fn io_error(operation: &str, path: &Path, e: std::io::Error) -> RegistryError {
    RegistryError::persistence(operation, format!("{}: {}", path.display(), e))
}

pub struct JsonStateStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("json.lock");
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_dir(&self) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error("create_dir", parent, e))?;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn acquire_lock(&self) -> Result<File, RegistryError> {
        use std::fs::OpenOptions;
        use std::os::unix::io::AsRawFd;
        use std::time::Duration;
        use std::time::Instant;

        const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

        self.ensure_dir()?;
        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| io_error("open_lock", &self.lock_path, e))?;

        let fd = lock_file.as_raw_fd();
        let start = Instant::now();
        let mut backoff = Duration::from_millis(1);

        loop {
            // SAFETY: `fd` is a valid descriptor owned by `lock_file`.
            let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
            if result == 0 {
                return Ok(lock_file);
            }

            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EWOULDBLOCK)
                && err.raw_os_error() != Some(libc::EAGAIN)
            {
                return Err(io_error("flock", &self.lock_path, err));
            }
            if start.elapsed() > LOCK_TIMEOUT {
                return Err(RegistryError::persistence(
                    "acquire_lock",
                    "lock acquisition timed out after 5 seconds",
                ));
            }

            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(Duration::from_millis(100));
        }
    }

    #[cfg(not(unix))]
    fn acquire_lock(&self) -> Result<(), RegistryError> {
        self.ensure_dir()
    }

    /// A missing or unreadable file reads as empty.
    fn load_unlocked(&self) -> StateFile {
        if !self.path.exists() {
            return StateFile::new();
        }
        match File::open(&self.path) {
            Ok(file) => match serde_json::from_reader(BufReader::new(file)) {
                Ok(state) => state,
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        error = %e,
                        "State file corrupted, starting with empty state"
                    );
                    StateFile::new()
                }
            },
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to open state file");
                StateFile::new()
            }
        }
    }

    fn save_unlocked(&self, state: &StateFile) -> Result<(), RegistryError> {
        let temp_path = self.path.with_extension("json.tmp");
        let file = File::create(&temp_path).map_err(|e| io_error("create_temp", &temp_path, e))?;
        serde_json::to_writer_pretty(BufWriter::new(file), state)
            .map_err(|e| RegistryError::persistence("write_json", e))?;
        fs::rename(&temp_path, &self.path).map_err(|e| io_error("rename", &self.path, e))
    }

    fn update<F>(&self, project_id: Option<&str>, apply: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut PersistedState),
    {
        let _lock = self.acquire_lock()?;
        let mut file = self.load_unlocked();
        apply(file.entry(project_key(project_id)).or_default());
        self.save_unlocked(&file)
    }
}

impl StateStore for JsonStateStore {
    fn save_terminals(
        &self,
        project_id: Option<&str>,
        terminals: &[PersistedTerminal],
    ) -> Result<(), RegistryError> {
        self.update(project_id, |state| state.terminals = terminals.to_vec())
    }

    fn save_tab_groups(
        &self,
        project_id: Option<&str>,
        groups: &[PersistedTabGroup],
    ) -> Result<(), RegistryError> {
        self.update(project_id, |state| state.tab_groups = groups.to_vec())
    }

    fn load(&self, project_id: Option<&str>) -> Result<PersistedState, RegistryError> {
        let file = match self.acquire_lock() {
            Ok(_lock) => self.load_unlocked(),
            Err(e) => {
                warn!(error = %e, "Failed to acquire lock for loading state");
                self.load_unlocked()
            }
        };
        Ok(file
            .get(&project_key(project_id))
            .cloned()
            .unwrap_or_default())
    }
}
