//! Terminal entry point
//!
//! `vide <prompt>` starts a network in the current directory and prints
//! the multiplexed event stream as JSON lines until the main agent goes
//! idle. `vide --hook` runs the pre-tool-use permission hook.

mod hook;

use std::path::PathBuf;

use clap::Parser;
use log::warn;
use vide_core::{EventPayload, NetworkManager, RuntimeScope};

#[derive(Parser)]
#[command(name = "vide", version, about = "Multi-agent coding runtime")]
struct Cli {
    /// Run as the pre-tool-use permission hook (invoked from the project
    /// settings file).
    #[arg(long)]
    hook: bool,

    /// Working directory for the network (defaults to the current
    /// directory).
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Initial message for a new agent network.
    prompt: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if cli.hook {
        let code = hook::run().await?;
        std::process::exit(code);
    }

    let prompt = cli.prompt.join(" ");
    if prompt.trim().is_empty() {
        anyhow::bail!("usage: vide <prompt>  (or vide --hook)");
    }
    run_network(&prompt, cli.cwd).await
}

async fn run_network(prompt: &str, cwd: Option<PathBuf>) -> anyhow::Result<()> {
    let scope = RuntimeScope::interactive()?;

    let first_run = vide_core::FirstRunFlag::new(scope.first_run_file());
    if first_run.is_first_run() {
        eprintln!("First run: state will be kept under {}", scope.config_root().display());
        first_run.mark_complete().await?;
    }

    let manager = NetworkManager::new(scope).await?;

    let network = manager.start_new(prompt, cwd).await?;
    let main_agent_id = network
        .main_agent()
        .map(|a| a.id.clone())
        .expect("a new network always has a main agent");

    let (snapshot, mut events) = manager.subscribe_events(&network.id).await?;
    for event in snapshot {
        println!("{}", serde_json::to_string(&event)?);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted; shutting down");
                break;
            }
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("event stream lagged by {}", missed);
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                println!("{}", serde_json::to_string(&event)?);
                let finished = event.agent_id == main_agent_id
                    && matches!(
                        event.payload,
                        EventPayload::Done {} | EventPayload::Error { .. }
                    );
                if finished {
                    break;
                }
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}
