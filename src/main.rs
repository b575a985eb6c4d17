//! dlx-orchestrator: batch pipelines and interactive sessions for the DLX
//! exact-cover solver.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dlx_orchestrator::cli::{Cli, Commands};
use dlx_orchestrator::collaborators::ServerSolver;
use dlx_orchestrator::config::{FileConfig, Overrides, ResolvedSettings, SessionConfig};
use dlx_orchestrator::error::DlxError;
use dlx_orchestrator::interactive::{InteractiveSession, InteractiveSummary};
use dlx_orchestrator::ipc::{stop_container, SolverServerSession};
use dlx_orchestrator::lifecycle::{
    LifecycleManager, LifecycleState, ShutdownSignal, ShutdownSignals, StopTrigger,
};
use dlx_orchestrator::pipelines;

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "dlx_orchestrator=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run(cli));
    // A stdin read parked on the blocking pool must not hold the exit open.
    runtime.shutdown_background();

    match result {
        Ok(code) => code,
        Err(e) => {
            let (code, category) = match e.downcast_ref::<DlxError>() {
                Some(dlx) => (dlx.exit_code(), dlx.category()),
                None => (1, "internal"),
            };
            error!(category, "Application error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    info!("Starting dlx-orchestrator v{}", env!("CARGO_PKG_VERSION"));

    let config_path = cli.config.unwrap_or_else(FileConfig::default_path);
    let file = FileConfig::load(&config_path)?;
    let mut signals = ShutdownSignals::install().context("failed to install signal handlers")?;

    match cli.command {
        Commands::Execute {
            build_folder,
            pipeline_args,
        } => {
            let overrides = Overrides {
                build_folder,
                ..Overrides::default()
            };
            let settings = ResolvedSettings::merge(overrides, file);
            execute(&pipeline_args, settings, &mut signals).await
        }
        Commands::Interactive(args) => {
            let settings = ResolvedSettings::merge(args.into(), file);
            interactive(settings, &mut signals).await
        }
    }
}

/// Batch path. A signal drops the running pipeline, which kills its stages.
async fn execute(
    tokens: &[String],
    settings: ResolvedSettings,
    signals: &mut ShutdownSignals,
) -> Result<ExitCode> {
    let invocations = pipelines::split_invocations(tokens)?;

    tokio::select! {
        result = pipelines::run_all(&invocations, &settings.build_folder) => {
            let completed = result?;
            info!(completed, "All pipelines completed");
            Ok(ExitCode::SUCCESS)
        }
        signal = signals.recv() => {
            warn!(signal = %signal, "Batch run interrupted; stages killed");
            Ok(ExitCode::from(signal.exit_code()))
        }
    }
}

enum Outcome {
    Finished(dlx_orchestrator::error::Result<InteractiveSummary>),
    Signalled(ShutdownSignal),
}

/// Interactive path. Whatever ends the loop, teardown runs exactly once
/// through the lifecycle manager.
async fn interactive(settings: ResolvedSettings, signals: &mut ShutdownSignals) -> Result<ExitCode> {
    let grace = settings.shutdown_grace;
    let config = settings.into_session_config()?;
    let lifecycle: LifecycleManager<SolverServerSession> = LifecycleManager::new(grace);

    let outcome = tokio::select! {
        result = serve(&config, &lifecycle) => Outcome::Finished(result),
        signal = signals.recv() => Outcome::Signalled(signal),
    };

    let never_started = lifecycle.state() == LifecycleState::Starting;
    let trigger = match &outcome {
        Outcome::Finished(Ok(_)) => StopTrigger::Completed,
        Outcome::Finished(Err(_)) => StopTrigger::Error,
        Outcome::Signalled(signal) => StopTrigger::Signal(*signal),
    };
    lifecycle.stop(trigger).await;
    if never_started {
        // Startup was cut short; the server process died with its handle but
        // a container may still be running.
        stop_container(&config.launch, grace).await;
    }

    match outcome {
        Outcome::Finished(Ok(summary)) => {
            info!(
                solved = summary.solved,
                rejected_lines = summary.rejected_lines,
                ignored_partial = ?summary.ignored_partial,
                "Interactive session finished"
            );
            Ok(ExitCode::SUCCESS)
        }
        Outcome::Finished(Err(e)) => Err(e.into()),
        Outcome::Signalled(signal) => Ok(ExitCode::from(signal.exit_code())),
    }
}

async fn serve(
    config: &SessionConfig,
    lifecycle: &LifecycleManager<SolverServerSession>,
) -> dlx_orchestrator::error::Result<InteractiveSummary> {
    let session = SolverServerSession::start(config).await?;
    if !lifecycle.install(session).await {
        return Ok(InteractiveSummary::default());
    }

    let solver = ServerSolver::new(config.binaries.clone(), lifecycle);
    let mut session = InteractiveSession::new(solver);
    let input = tokio::io::BufReader::new(tokio::io::stdin());
    let mut output = tokio::io::stdout();
    let mut diagnostics = tokio::io::stderr();
    session.run(input, &mut output, &mut diagnostics).await
}
