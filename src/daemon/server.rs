//! Daemon socket server
//!
//! Listens on a local Unix socket, one command per connection. Requests
//! are handled sequentially: the handler blocks only on its own read and
//! command execution, never across unrelated clients.

use crate::daemon::commands::{CommandTable, Executor};
use crate::error::Result;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info};

/// Run the daemon until interrupted, then clean up project resources
pub async fn run(socket_path: &Path) -> Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    // the orchestrator runs unprivileged
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o666))?;

    let table = CommandTable::new();
    let mut executor = Executor::new();
    info!("Start netloom daemon on {}", socket_path.display());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        if let Err(e) = handle(stream, &table, &mut executor).await {
                            error!("connection error: {}", e);
                        }
                    }
                    Err(e) => error!("accept failed: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Stop netloom daemon");
                break;
            }
        }
    }

    executor.clean_all();
    let _ = std::fs::remove_file(socket_path);
    Ok(())
}

async fn handle(
    mut stream: UnixStream,
    table: &CommandTable,
    executor: &mut Executor,
) -> Result<()> {
    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await?;
    let line = String::from_utf8_lossy(&buf[..n]).trim().to_string();
    debug!("Receive data: {}", line);

    let reply = match table
        .parse(&line)
        .and_then(|(verb, args)| executor.execute(verb, &args))
    {
        Ok(None) => "OK".to_string(),
        Ok(Some(payload)) => format!("OK {}", payload),
        Err(e) => {
            error!("{}", e);
            format!("ERROR: {}", e)
        }
    };

    stream.write_all(reply.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
