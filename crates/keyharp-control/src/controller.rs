// Control listener.
//
// Accepts TCP connections and dispatches incoming lines to registered
// ControlCommand handlers, writing one response line per command. Blocking
// handlers (file loads, time sync) run on the blocking pool so they cannot
// stall other connections.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::command::ControlCommand;

/// Manages the TCP listener and dispatches command lines.
pub struct ControlServer {
    commands: Vec<Arc<dyn ControlCommand>>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl ControlServer {
    pub fn new(commands: Vec<Arc<dyn ControlCommand>>) -> ControlServer {
        ControlServer {
            commands,
            shutdown_tx: None,
        }
    }

    /// Start listening. Spawns a tokio task; call from within a runtime.
    pub fn start(&mut self, addr: String) {
        let (tx, rx) = watch::channel(false);
        self.shutdown_tx = Some(tx);

        let commands = self.commands.clone();
        tokio::spawn(async move {
            if let Err(e) = run_listener(addr, commands, rx).await {
                warn!("control listener error: {}", e);
            }
        });
    }

    /// Stop the listener by sending a shutdown signal.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
            info!("control listener stop signal sent");
        }
    }

    /// Return a reference to the registered commands.
    pub fn commands(&self) -> &[Arc<dyn ControlCommand>] {
        &self.commands
    }
}

/// Dispatch a received line to the first matching command and format the
/// response line.
pub fn dispatch_line(commands: &[Arc<dyn ControlCommand>], line: &str) -> String {
    let line = line.trim();
    if line.is_empty() {
        return String::new();
    }
    for cmd in commands {
        let name = cmd.name();
        let args = if line == name {
            Some("")
        } else {
            line.strip_prefix(name)
                .and_then(|rest| rest.strip_prefix(' '))
        };
        if let Some(args) = args {
            return match cmd.run(args.trim()) {
                Ok(Some(response)) => format!("ok {response}"),
                Ok(None) => "ok".to_string(),
                Err(e) => format!("err {e}"),
            };
        }
    }
    "err unknown command".to_string()
}

async fn run_listener(
    addr: String,
    commands: Vec<Arc<dyn ControlCommand>>,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("control surface listening on {}", addr);

    let mut shutdown = shutdown_rx.clone();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        info!("control connection from {}", peer);
                        let commands = commands.clone();
                        let shutdown_rx = shutdown_rx.clone();
                        tokio::spawn(async move {
                            handle_client(stream, commands, shutdown_rx).await;
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("control listener shutting down");
                    break;
                }
            }
        }
    }

    Ok(())
}

async fn handle_client(
    stream: tokio::net::TcpStream,
    commands: Vec<Arc<dyn ControlCommand>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            result = lines.next_line() => {
                match result {
                    Ok(Some(line)) => {
                        let commands = commands.clone();
                        let response = tokio::task::spawn_blocking(move || {
                            dispatch_line(&commands, &line)
                        })
                        .await
                        .unwrap_or_else(|e| format!("err {e}"));
                        if response.is_empty() {
                            continue;
                        }
                        if let Err(e) = writer.write_all(format!("{response}\n").as_bytes()).await {
                            warn!("control write failed: {}", e);
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("control read failed: {}", e);
                        break;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
