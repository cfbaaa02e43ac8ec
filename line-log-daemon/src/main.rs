use std::{io::IsTerminal, process::ExitCode};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use line_log_daemon::{
    ServerConfig,
    cli::Cli,
    daemon,
    server::{self, Server},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // The journal is the system log; stderr keeps foreground runs readable.
    let journald = tracing_journald::layer().ok();
    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(journald)
        .with(stderr)
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = ServerConfig::from_env()?;

    // Bind before detaching so a taken port is reported to the caller.
    let listener = server::bind_listener(&config)?;
    if cli.daemon {
        daemon::detach()?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async move {
        let server = Server::from_std(listener, config)?;
        server.run_until_signal().await
    })?;

    info!("exiting");
    Ok(())
}
