//! Composition root for the `canopy` binary.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use canopy_common::init_tracing;
use canopy_core::ThreadWorkerFactory;
use canopy_registry::AddTerminalOptions;
use canopy_registry::AnalysisConfig;
use canopy_registry::AnalysisEvent;
use canopy_registry::JsonStateStore;
use canopy_registry::PanelKind;
use canopy_registry::RegistryConfig;
use canopy_registry::ServiceContainer;
use canopy_registry::ServiceDeps;
use canopy_registry::ports::HeadlessRenderer;
use canopy_registry::ports::SystemClock;
use canopy_registry::ports::TerminalBridge;
use canopy_registry::ports::ThreadScheduler;
use canopy_terminal::OutputSink;
use canopy_terminal::PtyBridge;
use clap::CommandFactory;
use clap::Parser;
use clap_complete::generate;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::commands::Cli;
use crate::commands::Commands;
use crate::commands::RunArgs;

const PROGRAM_NAME: &str = "canopy";
const PUMP_INTERVAL: Duration = Duration::from_millis(100);

pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _telemetry = init_tracing(if cli.verbose { "debug" } else { "info" });
    debug!(command = ?cli.command, "CLI command parsed");

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, PROGRAM_NAME, &mut std::io::stdout());
            Ok(())
        }
        Commands::Run(args) => run_session(&args),
    }
}

/// Process output goes straight to our stdout.
fn stdout_sink() -> OutputSink {
    Arc::new(|_id: &str, data: &[u8]| {
        let mut out = std::io::stdout().lock();
        if out.write_all(data).and_then(|()| out.flush()).is_err() {
            debug!("stdout closed; dropping terminal output");
        }
    })
}

fn log_analysis_event(event: &AnalysisEvent) {
    match event {
        AnalysisEvent::Ready => debug!("Analysis worker ready"),
        AnalysisEvent::Pong => {}
        AnalysisEvent::StateChanged(change) => info!(
            terminal_id = %change.terminal_id,
            agent_id = %change.agent_id,
            state = %change.state,
            previous = %change.previous_state,
            trigger = ?change.trigger,
            confidence = change.confidence,
            "Agent state changed"
        ),
        AnalysisEvent::ArtifactsDetected(batch) => {
            for artifact in &batch.artifacts {
                info!(
                    terminal_id = %batch.terminal_id,
                    kind = ?artifact.kind,
                    value = %artifact.value,
                    line = ?artifact.line,
                    "Artifact detected"
                );
            }
        }
        AnalysisEvent::Error { error, context } => {
            warn!(error = %error, context = ?context, "Analysis error");
        }
    }
}

fn terminal_options(args: &RunArgs) -> AddTerminalOptions {
    let kind = if args.agent.is_some() {
        PanelKind::Agent
    } else {
        PanelKind::Terminal
    };
    let mut options = AddTerminalOptions::new(kind)
        .with_title(args.command_line())
        .with_command(args.command_line())
        .with_size(args.cols, args.rows)
        .with_worktree(args.worktree.clone());
    if let Some(agent) = &args.agent {
        options = options.with_agent(agent.clone());
    }
    if let Some(cwd) = &args.cwd {
        options = options.with_cwd(cwd.clone());
    }
    options
}

fn run_session(args: &RunArgs) -> anyhow::Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    #[cfg(unix)]
    let _signals = crate::signal_handler::SignalHandler::setup(Arc::clone(&shutdown))?;

    let registry_config = RegistryConfig::from_env();
    let analysis_config = AnalysisConfig::from_env();
    let bridge = Arc::new(PtyBridge::new(analysis_config.ring_capacity, stdout_sink()));

    let deps = ServiceDeps {
        bridge: bridge.clone(),
        buffers: bridge.clone(),
        store: Arc::new(JsonStateStore::new(registry_config.state_file.clone())),
        renderer: Arc::new(HeadlessRenderer),
        scheduler: Arc::new(ThreadScheduler::default()),
        clock: Arc::new(SystemClock),
        workers: Arc::new(ThreadWorkerFactory::new(analysis_config.worker_settings())),
    };
    let host = ServiceContainer::new(deps, registry_config);

    if let Some(project) = &args.project {
        bridge
            .set_active_project(project)
            .context("failed to select project")?;
        host.registry.set_project(Some(project.clone()));
    }

    host.analysis.events().subscribe(log_analysis_event);
    if let Err(e) = host.initialize() {
        warn!(error = %e, "Semantic analysis unavailable; running without state tracking");
    }

    let id = host
        .registry
        .add_terminal(terminal_options(args))
        .context("failed to start terminal")?;
    let exits = bridge.exits();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            info!(terminal_id = %id, "Stopping terminal");
            break;
        }
        host.pump_timeout(PUMP_INTERVAL);
        if exits.try_iter().any(|exited| exited == id) {
            info!(terminal_id = %id, "Terminal process exited");
            break;
        }
        host.purge_expired_trash();
    }

    host.pump();
    if let Err(e) = host.registry.remove_terminal(&id) {
        warn!(terminal_id = %id, error = %e, "Failed to remove terminal");
    }
    host.dispose();
    bridge.shutdown();
    Ok(())
}
