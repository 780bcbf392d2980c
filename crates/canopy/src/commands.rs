use clap::Args;
use clap::Parser;
use clap::Subcommand;
pub use clap_complete::Shell;

const LONG_ABOUT: &str = r#"canopy hosts terminals scoped to git worktrees and infers the state of
coding agents running inside them.

`canopy run` starts one tracked terminal, streams its output to stdout and
logs agent state changes and detected artifacts (URLs, file references) to
stderr until the process exits or canopy receives SIGINT/SIGTERM.

EXAMPLES:
    canopy run -- cargo test
    canopy run --worktree feature-x --agent claude -- claude
    RUST_LOG=debug canopy run -- npm run dev

ENVIRONMENT:
    CANOPY_MAX_GRID_TERMINALS   grid capacity per worktree (default 16)
    CANOPY_STATE_FILE           persisted layout (default ~/.canopy/state.json)
    CANOPY_QUIET_IDLE_MS        quiet period before a busy agent reads idle
    CANOPY_LOG                  append logs to this file instead of stderr"#;

#[derive(Parser, Debug)]
#[command(name = "canopy")]
#[command(author, version)]
#[command(about = "Headless host for worktree-scoped terminals with agent state tracking")]
#[command(long_about = LONG_ABOUT)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a command in a tracked terminal
    Run(RunArgs),

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct RunArgs {
    /// Worktree the terminal belongs to
    #[arg(long)]
    pub worktree: Option<String>,

    /// Agent id; marks the terminal as an agent panel
    #[arg(long)]
    pub agent: Option<String>,

    /// Project the terminal is recorded under
    #[arg(long, env = "CANOPY_PROJECT")]
    pub project: Option<String>,

    /// Working directory for the command
    #[arg(long)]
    pub cwd: Option<String>,

    #[arg(long, default_value_t = 120)]
    pub cols: u16,

    #[arg(long, default_value_t = 40)]
    pub rows: u16,

    /// Command and arguments, after `--`
    #[arg(last = true, required = true, num_args = 1..)]
    pub command: Vec<String>,
}

impl RunArgs {
    /// The command as one shell line.
    pub fn command_line(&self) -> String {
        shell_join(&self.command)
    }
}

/// Join words into a POSIX shell line, quoting where needed.
pub fn shell_join(words: &[String]) -> String {
    words
        .iter()
        .map(|w| shell_quote(w))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
