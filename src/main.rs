//! netloom - network emulator
//!
//! Orchestrates containers and virtual machines into a declared network
//! topology, wiring their interfaces with kernel primitives (veth pairs,
//! namespaces, bridges, TAPs) through a privileged daemon, and serving
//! the running topology to consoles over an RPC protocol.

mod check;
mod cli;
mod config;
mod daemon;
mod error;
mod hostbridge;
mod manager;
mod node;
mod project;
mod rpc;
mod switch;
#[cfg(test)]
mod testutil;
mod topology;
mod wiring;

use cli::{Cli, Commands};
use daemon::DaemonClient;
use error::Result;
use project::Project;
use rpc::server::RpcServer;
use tracing_subscriber::EnvFilter;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    let default_filter = if cli.verbose { "netloom=debug" } else { "netloom=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let config = config::load(&cli.config)?;

    match cli.command {
        Commands::Daemon { socket } => {
            let socket = socket.unwrap_or_else(|| config.general.daemon_socket.clone());
            runtime()?.block_on(daemon::server::run(&socket))
        }

        Commands::Server { project, port, id } => {
            let id = id.unwrap_or_else(default_project_id);
            let daemon = DaemonClient::new(&config.general.daemon_socket);
            let project = Project::open(daemon, config, &id, &project)?;
            runtime()?.block_on(async {
                let server = RpcServer::bind(project, port).await?;
                server.serve().await
            })
        }

        Commands::Create { project } => {
            project::create_project(&project)?;
            println!("Created {}", project.display());
            Ok(())
        }

        Commands::Check { project } => {
            let id = default_project_id();
            let daemon = DaemonClient::new(&config.general.daemon_socket);
            let project = Project::open(daemon, config, &id, &project)?;
            match project.manager().check() {
                Ok(_) => {
                    println!("Network topology is OK");
                    Ok(())
                }
                Err(e) => {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Clean { id } => {
            let daemon = DaemonClient::new(&config.general.daemon_socket);
            daemon.clean(&id)
        }

        Commands::Completion { shell } => {
            Cli::generate_completion(shell);
            Ok(())
        }
    }
}

/// Resource prefix unique to this orchestrator process
fn default_project_id() -> String {
    format!("nl{}", std::process::id())
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Runtime::new()?)
}
