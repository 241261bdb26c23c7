mod opts;
mod reconcile;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use opts::AgentOpts;
use reconcile::Agent;

#[derive(Parser, Debug)]
#[command(name = "galaxy-agent", version, about = "Galaxy host agent")]
struct Cli {
    #[command(flatten)]
    opts: AgentOpts,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, Default)]
enum Command {
    /// Reconcile on an interval and follow container events (default)
    #[default]
    Run,

    /// Run a single reconcile pass and exit
    Once,

    /// Unregister and stop every managed container on this host
    Drain,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging();

    let agent = Agent::connect(cli.opts).await?;
    match cli.command.unwrap_or_default() {
        Command::Run => {
            let (shutdown_tx, _) = broadcast::channel(1);
            spawn_signal_handler(shutdown_tx.clone());
            agent.run(shutdown_tx).await
        }
        Command::Once => {
            let report = agent.pass().await?;
            if !report.failed.is_empty() {
                anyhow::bail!("failed to start: {}", report.failed.join(", "));
            }
            Ok(())
        }
        Command::Drain => agent.drain().await,
    }
}

/// Send on `shutdown` at Ctrl-C or SIGTERM.
fn spawn_signal_handler(shutdown: broadcast::Sender<()>) {
    tokio::spawn(async move {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received, shutting down...");
            }
            _ = async {
                match term.as_mut() {
                    Some(t) => { t.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                tracing::info!("SIGTERM received, shutting down...");
            }
        }
        let _ = shutdown.send(());
    });
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .init();
}
