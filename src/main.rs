use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;

use fleet_broker::{
    broker::{Broker, BrokerConfig},
    config::{Cli, Commands, ServeCommand},
    events::init_logging,
    headless_worker::run_headless_worker,
    pty_worker::run_pty_worker,
    server::ControlServer,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(cmd) => {
            init_logging(&cmd.log_filter())?;
            match run_serve(cmd).await {
                Ok(()) => Ok(()),
                Err(ServeFailure::Startup(error)) => {
                    tracing::error!(target = "fleet::main", error = %error, "startup failed");
                    std::process::exit(1);
                }
                Err(ServeFailure::Fatal(error)) => {
                    tracing::error!(target = "fleet::main", error = %error, "broker crashed");
                    std::process::exit(2);
                }
            }
        }
        Commands::Pty(cmd) => {
            init_logging("warn")?;
            run_pty_worker(cmd).await
        }
        Commands::Headless(cmd) => {
            init_logging("warn")?;
            run_headless_worker(cmd).await
        }
    }
}

enum ServeFailure {
    /// Bind failure, PID/lock conflict: exit code 1.
    Startup(anyhow::Error),
    /// Broker core error or panic: exit code 2.
    Fatal(anyhow::Error),
}

async fn run_serve(cmd: ServeCommand) -> Result<(), ServeFailure> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let cfg = BrokerConfig::from_serve(&cmd);
    let (broker, handle) = Broker::new(
        cfg,
        cmd.workspace_dir(),
        cmd.fallback_cli(),
        cmd.max_agents,
        cmd.idle_threshold_secs,
        shutdown_tx.clone(),
    );
    let server = ControlServer::new(
        cmd.socket_path(),
        cmd.pid_path(),
        cmd.lock_path(),
        cmd.max_frame_bytes,
        handle,
    );

    spawn_signal_listener(shutdown_tx.clone());

    let mut broker_task = tokio::spawn(broker.run());
    let mut server_task = tokio::spawn(server.run(shutdown_rx));

    tokio::select! {
        server_result = &mut server_task => {
            let _ = shutdown_tx.send(true);
            let broker_result = broker_task.await;
            match server_result {
                Ok(Ok(())) => {}
                Ok(Err(error)) => return Err(ServeFailure::Startup(error)),
                Err(join_error) => {
                    return Err(ServeFailure::Fatal(anyhow::anyhow!(
                        "server task panicked: {join_error}"
                    )))
                }
            }
            match broker_result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(error)) => Err(ServeFailure::Fatal(error)),
                Err(join_error) => Err(ServeFailure::Fatal(anyhow::anyhow!(
                    "broker task panicked: {join_error}"
                ))),
            }
        }
        broker_result = &mut broker_task => {
            let _ = shutdown_tx.send(true);
            let server_result = server_task.await;
            match broker_result {
                Ok(Ok(())) => {}
                Ok(Err(error)) => return Err(ServeFailure::Fatal(error)),
                Err(join_error) => {
                    return Err(ServeFailure::Fatal(anyhow::anyhow!(
                        "broker task panicked: {join_error}"
                    )))
                }
            }
            match server_result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(error)) => Err(ServeFailure::Startup(error)),
                Err(join_error) => Err(ServeFailure::Fatal(anyhow::anyhow!(
                    "server task panicked: {join_error}"
                ))),
            }
        }
    }
}

fn spawn_signal_listener(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(error) => {
                    tracing::warn!(
                        target = "fleet::main",
                        error = %error,
                        "failed to register SIGTERM handler"
                    );
                    let _ = tokio::signal::ctrl_c().await;
                    let _ = shutdown_tx.send(true);
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!(target = "fleet::main", "shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
}
