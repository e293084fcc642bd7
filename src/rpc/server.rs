//! Per-project RPC server
//!
//! Serves topology manager operations to remote consoles over loopback
//! TCP. Project mutations are serialized behind one lock; signals fan
//! out to every connected console through a broadcast channel. SIGINT
//! raises the cooperative interrupt flag observed by long operations,
//! which then resolve their answer with the interrupt state instead of
//! completing.

use crate::error::{Error, Result};
use crate::node::NodeEvent;
use crate::project::Project;
use crate::rpc::codec::{self, FrameCodec};
use crate::rpc::messages::{RpcAnswer, RpcRequest, RpcSignal, loads_request};
use serde_json::{Value, json};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify, broadcast, mpsc};
use tracing::{debug, error, info};

struct ServerState {
    project: Mutex<Project>,
    signals: broadcast::Sender<RpcSignal>,
    interrupt: Arc<AtomicBool>,
    shutdown: Notify,
}

pub struct RpcServer {
    listener: TcpListener,
    state: Arc<ServerState>,
    events: mpsc::Receiver<NodeEvent>,
}

impl RpcServer {
    /// Bind the loopback endpoint and wire the project into the server
    pub async fn bind(mut project: Project, port: u16) -> Result<Self> {
        let (signal_tx, _) = broadcast::channel(64);
        project.manager_mut().set_signal_sender(signal_tx.clone());
        let events = project
            .manager_mut()
            .take_events()
            .ok_or_else(|| Error::Protocol("event channel already taken".to_string()))?;
        let interrupt = project.manager().interrupt_flag();

        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                project: Mutex::new(project),
                signals: signal_tx,
                interrupt,
                shutdown: Notify::new(),
            }),
            events,
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until a console asks to quit
    pub async fn serve(self) -> Result<()> {
        info!("Project server listening on {}", self.listener.local_addr()?);

        // pump watcher death notifications into the manager
        let event_state = self.state.clone();
        let mut events = self.events;
        tokio::spawn(async move {
            while let Some(NodeEvent::Exited { name, code, stderr }) = events.recv().await {
                let mut project = event_state.project.lock().await;
                tokio::task::block_in_place(|| {
                    project.manager_mut().handle_node_exit(&name, code, &stderr);
                });
            }
        });

        // SIGINT raises the cooperative interrupt flag; the command in
        // flight is never killed
        let interrupt = self.state.interrupt.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                interrupt.store(true, Ordering::SeqCst);
            }
        });

        loop {
            tokio::select! {
                _ = self.state.shutdown.notified() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!("console connected from {}", peer);
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, state).await {
                            debug!("console connection closed: {}", e);
                        }
                    });
                }
            }
        }
        info!("Project server stopped");
        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(32);

    let writer_task = tokio::spawn(async move {
        while let Some(buf) = out_rx.recv().await {
            if writer.write_all(&buf).await.is_err() {
                break;
            }
        }
    });

    // fan unsolicited signals into this console
    let mut signal_rx = state.signals.subscribe();
    let signal_out = out_tx.clone();
    let signal_task = tokio::spawn(async move {
        while let Ok(signal) = signal_rx.recv().await {
            let Ok(doc) = serde_json::to_string(&signal) else {
                continue;
            };
            if signal_out.send(codec::frame(&doc)).await.is_err() {
                break;
            }
        }
    });

    let mut frames = FrameCodec::new();
    let mut buf = vec![0u8; 4096];
    'conn: loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        for raw in frames.push(&buf[..n]) {
            debug!("Receive command '{}'", raw);
            let (answer, quit) = dispatch(&state, &raw).await;
            let doc = serde_json::to_string(&answer)
                .unwrap_or_else(|_| "{\"type\":\"answer\",\"state\":\"error\"}".to_string());
            debug!("send back answer '{}'", doc);
            if out_tx.send(codec::frame(&doc)).await.is_err() {
                break 'conn;
            }
            if quit {
                state.shutdown.notify_one();
                break 'conn;
            }
        }
    }

    signal_task.abort();
    drop(out_tx);
    let _ = writer_task.await;
    Ok(())
}

enum Outcome {
    Value(Value),
    Quit,
}

async fn dispatch(state: &Arc<ServerState>, raw: &str) -> (RpcAnswer, bool) {
    let request = match loads_request(raw) {
        Ok(request) => request,
        Err(e) => return (RpcAnswer::error(None, e.to_string()), false),
    };
    let id = Some(request.id);

    let mut project = state.project.lock().await;
    let outcome = tokio::task::block_in_place(|| {
        // internal panics must never take the server down; they become a
        // generic error answer
        std::panic::catch_unwind(AssertUnwindSafe(|| execute(&mut project, &request)))
    });
    // any unobserved interrupt raised during this operation is stale now
    state.interrupt.store(false, Ordering::SeqCst);

    match outcome {
        Ok(Ok(Outcome::Value(content))) => (RpcAnswer::ok(id, content), false),
        Ok(Ok(Outcome::Quit)) => (RpcAnswer::ok(id, json!("")), true),
        Ok(Err(Error::Interrupted)) => (RpcAnswer::interrupt(id), false),
        Ok(Err(e)) => (RpcAnswer::error(id, e.to_string()), false),
        Err(panic) => {
            let mut message = panic_message(panic);
            message.truncate(200);
            error!("internal error while serving {}: {}", request.method, message);
            (
                RpcAnswer::error(id, format!("Internal error: {}", message)),
                false,
            )
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Resolve a `<node_id or "all">` parameter
fn node_targets(project: &Project, arg: &str) -> Vec<String> {
    if arg == "all" {
        project.manager().node_names()
    } else {
        vec![arg.to_string()]
    }
}

fn execute(project: &mut Project, request: &RpcRequest) -> Result<Outcome> {
    let value = match request.method.as_str() {
        "quit" => {
            request.expect_params(0)?;
            project.close();
            return Ok(Outcome::Quit);
        }
        "version" => {
            request.expect_params(0)?;
            json!(env!("CARGO_PKG_VERSION"))
        }
        "projectPath" => {
            request.expect_params(0)?;
            json!(project.path().display().to_string())
        }
        "topologyFile" => {
            request.expect_params(0)?;
            json!(project.topology_file().display().to_string())
        }
        "isTopologyModified" => {
            request.expect_params(0)?;
            json!(project.is_topology_modified())
        }
        "view" => {
            request.expect_params(0)?;
            json!(std::fs::read_to_string(project.topology_file())?)
        }
        "check" => {
            request.expect_params(0)?;
            project.manager().check()?;
            json!(true)
        }
        "load" => {
            request.expect_params(0)?;
            project.manager_mut().load()?;
            json!("")
        }
        "reload" => {
            request.expect_params(0)?;
            project.manager_mut().reload()?;
            json!("")
        }
        "save" => {
            request.expect_params(0)?;
            project.save()?;
            json!("")
        }
        "config" => {
            request.expect_params(1)?;
            project.save_config(std::path::Path::new(request.param_str(0)?))?;
            json!("")
        }
        "status" => {
            request.expect_params(0)?;
            project.status()
        }
        "start" => {
            request.expect_params(1)?;
            for name in node_targets(project, request.param_str(0)?) {
                project.manager_mut().start(&name)?;
            }
            json!("")
        }
        "stop" => {
            request.expect_params(1)?;
            for name in node_targets(project, request.param_str(0)?) {
                project.manager_mut().stop(&name)?;
            }
            json!("")
        }
        "restart" => {
            request.expect_params(1)?;
            for name in node_targets(project, request.param_str(0)?) {
                project.manager_mut().restart(&name)?;
            }
            json!("")
        }
        "console" | "shell" => {
            request.expect_params(1)?;
            for name in node_targets(project, request.param_str(0)?) {
                project.manager_mut().open_shell(&name, false)?;
            }
            json!("")
        }
        "debug" => {
            request.expect_params(1)?;
            for name in node_targets(project, request.param_str(0)?) {
                project.manager_mut().open_shell(&name, true)?;
            }
            json!("")
        }
        "ifstate" => {
            request.expect_params(2)?;
            let state = crate::node::IfState::parse(request.param_str(1)?)?;
            project
                .manager_mut()
                .set_if_state(request.param_str(0)?, state)?;
            json!("")
        }
        "capture" => {
            request.expect_params(1)?;
            project.manager_mut().capture(request.param_str(0)?)?;
            json!("")
        }
        "copy" => {
            request.expect_params(2)?;
            project
                .manager_mut()
                .copy(request.param_str(0)?, request.param_str(1)?)?;
            json!("")
        }
        method => return Err(Error::MethodNotFound(method.to_string())),
    };
    Ok(Outcome::Value(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmulatorConfig;
    use crate::project::create_project;
    use crate::rpc::messages::loads_response;
    use crate::testutil::FakeDaemon;

    async fn spawn_server(daemon: &FakeDaemon) -> (std::net::SocketAddr, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.nproj");
        create_project(&path).unwrap();
        let project = Project::open(
            daemon.client(),
            EmulatorConfig::default(),
            "nl1",
            &path,
        )
        .unwrap();

        let server = RpcServer::bind(project, 0).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.serve());
        (addr, dir)
    }

    async fn roundtrip(stream: &mut TcpStream, request: &str) -> Value {
        stream
            .write_all(&codec::frame(request))
            .await
            .unwrap();
        let mut frames = FrameCodec::new();
        let mut buf = vec![0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "server closed the connection");
            let mut decoded = frames.push(&buf[..n]);
            if let Some(raw) = decoded.pop() {
                return loads_response(&raw).unwrap();
            }
        }
    }

    fn request(method: &str, params: Value) -> String {
        serde_json::to_string(&json!({"method": method, "params": params, "id": 7}))
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_project_path_and_check() {
        let daemon = FakeDaemon::spawn();
        let (addr, _dir) = spawn_server(&daemon).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let answer = roundtrip(&mut stream, &request("projectPath", json!([]))).await;
        assert_eq!(answer["state"], "OK");
        assert_eq!(answer["id"], 7);
        assert!(answer["content"].as_str().unwrap().ends_with("demo.nproj"));

        let answer = roundtrip(&mut stream, &request("check", json!([]))).await;
        assert_eq!(answer["state"], "OK");
        assert_eq!(answer["content"], true);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_status_before_load() {
        let daemon = FakeDaemon::spawn();
        let (addr, _dir) = spawn_server(&daemon).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let answer = roundtrip(&mut stream, &request("status", json!([]))).await;
        assert_eq!(answer["state"], "OK");
        assert_eq!(answer["content"]["project"]["running"], false);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_method() {
        let daemon = FakeDaemon::spawn();
        let (addr, _dir) = spawn_server(&daemon).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let answer = roundtrip(&mut stream, &request("frobnicate", json!([]))).await;
        assert_eq!(answer["state"], "error");
        assert!(
            answer["content"]
                .as_str()
                .unwrap()
                .contains("frobnicate")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_malformed_request() {
        let daemon = FakeDaemon::spawn();
        let (addr, _dir) = spawn_server(&daemon).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let answer = roundtrip(&mut stream, "{\"method\": \"load\"}").await;
        assert_eq!(answer["state"], "error");
        assert!(answer["id"].is_null());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wrong_arity() {
        let daemon = FakeDaemon::spawn();
        let (addr, _dir) = spawn_server(&daemon).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let answer = roundtrip(&mut stream, &request("ifstate", json!(["R1.0"]))).await;
        assert_eq!(answer["state"], "error");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pipelined_requests() {
        let daemon = FakeDaemon::spawn();
        let (addr, _dir) = spawn_server(&daemon).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        // two framed requests in one write; two answers come back in order
        let mut combined = codec::frame(&request("version", json!([])));
        combined.extend_from_slice(&codec::frame(&request("projectPath", json!([]))));
        stream.write_all(&combined).await.unwrap();

        let mut frames = FrameCodec::new();
        let mut decoded = Vec::new();
        let mut buf = vec![0u8; 4096];
        while decoded.len() < 2 {
            let n = stream.read(&mut buf).await.unwrap();
            decoded.extend(frames.push(&buf[..n]));
        }
        let first = loads_response(&decoded[0]).unwrap();
        let second = loads_response(&decoded[1]).unwrap();
        assert_eq!(first["content"], env!("CARGO_PKG_VERSION"));
        assert!(second["content"].as_str().unwrap().ends_with("demo.nproj"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_quit_closes_project() {
        let daemon = FakeDaemon::spawn();
        let (addr, _dir) = spawn_server(&daemon).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let answer = roundtrip(&mut stream, &request("quit", json!([]))).await;
        assert_eq!(answer["state"], "OK");
        assert!(daemon.commands().contains(&"clean nl1".to_string()));
    }
}
