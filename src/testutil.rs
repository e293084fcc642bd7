//! In-process fake daemon for unit tests
//!
//! Listens on a Unix socket in a temp directory, records every command
//! line it receives and answers `OK` (or a scripted reply per verb).

use crate::daemon::DaemonClient;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

pub struct FakeDaemon {
    _dir: tempfile::TempDir,
    socket: PathBuf,
    commands: Arc<Mutex<Vec<String>>>,
    replies: Arc<Mutex<HashMap<String, String>>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FakeDaemon {
    pub fn spawn() -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let socket = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&socket).expect("bind fake daemon");
        listener.set_nonblocking(true).expect("nonblocking");

        let commands: Arc<Mutex<Vec<String>>> = Arc::default();
        let replies: Arc<Mutex<HashMap<String, String>>> = Arc::default();
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let commands = commands.clone();
            let replies = replies.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((mut stream, _)) => {
                            let mut line = String::new();
                            stream.set_nonblocking(false).unwrap();
                            stream.read_to_string(&mut line).unwrap();
                            let line = line.trim().to_string();
                            let verb =
                                line.split_whitespace().next().unwrap_or("").to_string();
                            commands.lock().unwrap().push(line);
                            let reply = replies
                                .lock()
                                .unwrap()
                                .get(&verb)
                                .cloned()
                                .unwrap_or_else(|| "OK".to_string());
                            let _ = stream.write_all(reply.as_bytes());
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(5));
                        }
                        Err(_) => break,
                    }
                }
            })
        };

        Self {
            _dir: dir,
            socket,
            commands,
            replies,
            stop,
            handle: Some(handle),
        }
    }

    pub fn client(&self) -> DaemonClient {
        DaemonClient::new(&self.socket)
    }

    /// Script the reply for a verb (e.g. `"OK EXIST"` for `ovs_create`)
    pub fn set_reply(&self, verb: &str, reply: &str) {
        self.replies
            .lock()
            .unwrap()
            .insert(verb.to_string(), reply.to_string());
    }

    /// Every command line received so far
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

impl Drop for FakeDaemon {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
