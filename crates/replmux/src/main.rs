//! replmux - REPL stdio multiplexer
//!
//! `replmux run` starts an interactive program and feeds its stdin from the
//! terminal, an optional session FIFO and the HTTP ingress at the same time.
//! `replmux send` merges its own stdin and any files and posts them to a
//! running session's ingress.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use replmux_config::{Settings, Target, load_config, load_config_or_default};
use replmux_host::{ClientStreams, OrchestratorOptions, ProcessOrchestrator, SessionOutcome};
use replmux_ingress::{IngressClient, IngressServer};
use replmux_stream::{
    BoxReader, BoxWriter, BroadcastMultiplexer, EphemeralPipe, ErrorHandler, FunnelOptions,
    MultiplexerOptions, MuxError, SharedSink, StreamFunnel,
};
use replmux_util::{Logger, REPLMUX_CONFIG_ENV, config_path_without_env};
use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code reported when a session was cancelled by a signal
const CANCELLED_EXIT_CODE: i32 = 130;

/// replmux - Multiplex the stdio of an interactive program
#[derive(Parser, Debug)]
#[command(name = "replmux", version)]
#[command(about = "Feed an interactive program's stdin from many sources", long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/replmux/config.toml)
    #[arg(short, long, env = REPLMUX_CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a session
    Run(RunArgs),
    /// Forward input to a running session
    Send(SendArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Configured target name or a literal command line
    target: Option<String>,

    /// Also accept input written to a session FIFO
    #[arg(long)]
    fifo: bool,

    /// Append everything fed to the session to this file
    #[arg(long)]
    record: Option<PathBuf>,

    /// Do not start the HTTP ingress
    #[arg(long)]
    no_ingress: bool,
}

#[derive(clap::Args, Debug)]
struct SendArgs {
    /// Configured target name; anything else uses the default ingress
    target: Option<String>,

    /// Also send the contents of this file (repeatable)
    #[arg(short, long = "file")]
    files: Vec<PathBuf>,

    /// Do not read from stdin
    #[arg(long)]
    no_stdin: bool,
}

fn load_settings(config: Option<&PathBuf>) -> Result<Settings> {
    match config {
        Some(path) => load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path)),
        None => {
            let path = config_path_without_env();
            load_config_or_default(&path)
                .with_context(|| format!("Failed to load config from {:?}", path))
        }
    }
}

fn build_logger(settings: &Settings) -> Result<Logger> {
    match &settings.log.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create log directory {:?}", parent))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {:?}", path))?;
            Ok(Logger::to_writer(settings.log.tag.clone(), file))
        }
        None => Ok(Logger::tracing(settings.log.tag.clone())),
    }
}

/// Cancel `cancel` on SIGINT or SIGTERM
fn cancel_on_signal(cancel: CancellationToken) -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to create SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, stopping"),
            _ = sigint.recv() => info!("Received SIGINT, stopping"),
            _ = cancel.cancelled() => return,
        }
        cancel.cancel();
    });
    Ok(())
}

fn report_stream_errors(context: &'static str) -> ErrorHandler {
    ErrorHandler::new(move |e| match e {
        MuxError::EndOfStream => debug!("Input source finished"),
        e => warn!(error = %e, "{}", context),
    })
}

async fn run(settings: &Settings, args: RunArgs, logger: Logger) -> Result<i32> {
    let target = settings.resolve_target(args.target.as_deref());
    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone())?;

    info!(name = %target.name, command = %target.command, "Starting session");

    let mut inputs: Vec<BoxReader> = vec![Box::new(tokio::io::stdin())];

    let pipe = if args.fifo {
        let pipe = EphemeralPipe::create(&target.name).context("Failed to create session FIFO")?;
        inputs.push(Box::new(pipe.try_clone_stream()?));
        info!(path = %pipe.path().display(), "Session FIFO ready");
        Some(pipe)
    } else {
        None
    };

    let mut outputs: Vec<BoxWriter> = Vec::new();
    if let Some(path) = &args.record {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open record file {:?}", path))?;
        outputs.push(Box::new(file));
    }

    let mut mux = BroadcastMultiplexer::with_options(
        inputs,
        outputs,
        MultiplexerOptions {
            buffer_size: settings.session.buffer_size,
            logger: logger.child("mux"),
            error_handler: report_stream_errors("Session input failed"),
            cancel: cancel.clone(),
            ..Default::default()
        },
    );
    let listener = mux.listen();

    let ingress = if settings.ingress.enabled && !args.no_ingress {
        let server = IngressServer::bind(target.listen_addr, mux.broadcaster())
            .await
            .context("Failed to start ingress")?;
        Some(tokio::spawn(server.serve(cancel.clone())))
    } else {
        None
    };

    let outcome = run_orchestrator(settings, &target, mux, logger, cancel.clone()).await;

    // Session is over: stop the ingress and the remaining input tasks
    cancel.cancel();
    if let Some(handle) = ingress {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Ingress failed"),
            Err(e) => warn!(error = %e, "Ingress task failed"),
        }
    }
    if let Err(e) = listener.await {
        warn!(error = %e, "Multiplexer task failed");
    }
    if let Some(pipe) = pipe {
        let path = pipe.path().to_path_buf();
        if let Err(e) = pipe.close() {
            warn!(path = %path.display(), error = %e, "Failed to clean up session FIFO");
        }
    }

    let code = match outcome? {
        SessionOutcome::Exited(status) => {
            info!(status = %status, "Session ended");
            status
                .code
                .or(status.signal.map(|sig| 128 + sig))
                .unwrap_or(1)
        }
        SessionOutcome::InputClosed(status) => {
            debug!(status = ?status, "Session input closed");
            0
        }
        SessionOutcome::Cancelled(_) => CANCELLED_EXIT_CODE,
    };
    Ok(code)
}

async fn run_orchestrator(
    settings: &Settings,
    target: &Target,
    input: BroadcastMultiplexer,
    logger: Logger,
    cancel: CancellationToken,
) -> Result<SessionOutcome> {
    let orchestrator = ProcessOrchestrator::with_options(
        &target.command,
        OrchestratorOptions {
            buffer_size: settings.session.buffer_size,
            stop_timeout: settings.session.stop_timeout,
            drain_timeout: settings.session.drain_timeout,
            env: target.env.clone(),
            cwd: target.cwd.clone(),
            logger,
            cancel,
        },
    )?;

    let session = orchestrator
        .start(ClientStreams {
            input: Box::new(input),
            output: SharedSink::boxed(tokio::io::stdout()),
            error: SharedSink::boxed(tokio::io::stderr()),
        })
        .with_context(|| format!("Failed to start {:?}", target.command))?;

    info!(
        session_id = %session.session_id(),
        pid = session.pid(),
        "Session running"
    );

    Ok(session.wait().await?)
}

async fn send(settings: &Settings, args: SendArgs, logger: Logger) -> Result<i32> {
    let target = settings.resolve_target(args.target.as_deref());
    let client = IngressClient::new(target.listen_addr)?;
    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone())?;

    let mut sources: Vec<BoxReader> = Vec::new();
    if !args.no_stdin {
        sources.push(Box::new(tokio::io::stdin()));
    }
    for path in &args.files {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open {:?}", path))?;
        sources.push(Box::new(file));
    }

    let mut funnel = StreamFunnel::with_options(
        sources,
        FunnelOptions {
            buffer_size: settings.session.buffer_size,
            logger: logger.child("send"),
            error_handler: report_stream_errors("Input source failed"),
            cancel,
            ..Default::default()
        },
    );

    let mut buf = vec![0u8; settings.session.buffer_size];
    let mut total = 0usize;
    loop {
        let n = funnel.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        client
            .send(&buf[..n])
            .await
            .with_context(|| format!("Failed to deliver input to {}", target.listen_addr))?;
        total += n;
    }

    info!(bytes = total, addr = %target.listen_addr, "Input forwarded");
    Ok(0)
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        config,
        log_level,
        command,
    } = Args::parse();

    // Initialize logging; stdout belongs to the inner process
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    debug!(version = env!("CARGO_PKG_VERSION"), "replmux starting");

    let result = async move {
        let settings = load_settings(config.as_ref())?;
        let logger = build_logger(&settings)?;
        match command {
            Commands::Run(run_args) => run(&settings, run_args, logger).await,
            Commands::Send(send_args) => send(&settings, send_args, logger).await,
        }
    }
    .await;

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "replmux failed");
            1
        }
    };

    // A blocking stdin read would otherwise hold up runtime shutdown
    std::process::exit(code)
}
