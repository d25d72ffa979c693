//! v2m daemon entry point.
//!
//! `v2m daemon` keeps the recognizer warm in a background process and
//! exposes the control plane on localhost. Exit codes: 0 normal shutdown,
//! 1 model load failure at startup (non-lazy), 2 port bind failure.

mod config;
mod desktop;
mod lifecycle;
mod llm;
mod orchestrator;
mod server;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use config::Settings;
use desktop::{SystemClipboard, SystemNotifier};
use orchestrator::Orchestrator;

#[derive(Parser)]
#[command(name = "v2m", version, about = "Voice-to-clipboard daemon")]
struct Cli {
    /// Path to config.toml (defaults to ./config.toml, then the user
    /// config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the background daemon
    Daemon(DaemonArgs),
}

#[derive(Args)]
struct DaemonArgs {
    /// Bind address
    #[arg(long)]
    host: Option<String>,

    /// Bind port
    #[arg(long)]
    port: Option<u16>,

    /// Recognition model name or path
    #[arg(long)]
    model: Option<String>,

    /// Inference device: cuda | cpu
    #[arg(long)]
    device: Option<String>,

    /// Weight precision: float16 | int8
    #[arg(long)]
    compute_type: Option<String>,

    /// Idle seconds before the model is released (0 keeps it resident)
    #[arg(long)]
    keep_warm_secs: Option<u64>,

    /// Defer model loading until the first request
    #[arg(long)]
    lazy_load: bool,
}

impl DaemonArgs {
    fn apply(&self, settings: &mut Settings) {
        if let Some(host) = &self.host {
            settings.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(model) = &self.model {
            settings.config.transcription.whisper.model = model.clone();
        }
        if let Some(device) = &self.device {
            settings.config.transcription.whisper.device = device.clone();
        }
        if let Some(compute) = &self.compute_type {
            settings.config.transcription.whisper.compute_type = compute.clone();
        }
        if let Some(secs) = self.keep_warm_secs {
            settings.keep_warm_secs = (secs > 0).then_some(secs);
        }
        if self.lazy_load {
            settings.lazy_load = true;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "v2m=info".parse().expect("valid default filter")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Daemon(args) => {
            let mut settings = Settings::load(cli.config.as_deref());
            args.apply(&mut settings);
            run_daemon(settings).await
        }
    }
}

async fn run_daemon(settings: Settings) -> ExitCode {
    info!(
        host = settings.host.as_str(),
        port = settings.port,
        model = settings.config.transcription.whisper.model.as_str(),
        device = settings.config.transcription.whisper.device.as_str(),
        lazy = settings.lazy(),
        "v2m daemon starting"
    );

    // One daemon per machine: clear out stale instances and crash residue.
    lifecycle::sweep_orphans();
    lifecycle::recover_stale_state(&settings.config.paths);
    if let Err(e) = lifecycle::write_pid_file(&settings.config.paths.pid_file) {
        error!(error = %e, "could not write pid file");
    }

    let paths = settings.config.paths.clone();
    let notifications = settings.config.notifications.clone();
    let lazy = settings.lazy();

    let orchestrator = Arc::new(Orchestrator::new(
        settings.clone(),
        Arc::new(SystemClipboard::new()),
        Arc::new(SystemNotifier::new(notifications)),
    ));

    // Exit code chosen by whichever path triggers shutdown.
    let exit_code = Arc::new(AtomicU8::new(0));
    let (fatal_tx, fatal_rx) = tokio::sync::oneshot::channel::<u8>();

    // Background warmup keeps startup time bounded by process launch.
    if lazy {
        info!("lazy load enabled — model loads on first use");
        drop(fatal_tx);
    } else {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            info!("warming up recognition model");
            match orchestrator.warmup().await {
                Ok(()) => info!("recognition model ready"),
                Err(e) => {
                    error!(error = %e, "model warmup failed — shutting down");
                    let _ = fatal_tx.send(1);
                }
            }
        });
    }

    let shutdown = {
        let exit_code = Arc::clone(&exit_code);
        async move {
            let fatal = async {
                match fatal_rx.await {
                    Ok(code) => code,
                    // Sender dropped without a fatal error: wait forever.
                    Err(_) => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = shutdown_signal() => info!("shutdown signal received"),
                code = fatal => exit_code.store(code, Ordering::SeqCst),
            }
        }
    };

    let serve_result = server::serve(
        Arc::clone(&orchestrator),
        &settings.host,
        settings.port,
        shutdown,
    )
    .await;

    let code = match serve_result {
        Ok(()) => exit_code.load(Ordering::SeqCst),
        Err(server::ServeError::Bind(e)) => {
            error!(
                host = settings.host.as_str(),
                port = settings.port,
                error = %e,
                "could not bind"
            );
            2
        }
        Err(e) => {
            error!(error = %e, "server failed");
            1
        }
    };

    orchestrator.shutdown().await;
    lifecycle::remove_pid_file(&paths.pid_file);
    info!(code, "v2m daemon stopped");
    ExitCode::from(code)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
