use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tether_core::{Handle, Runtime, RuntimeError, TaskStatus};

use crate::roster::Roster;

const READ_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Relay each line to every other client.
    Chat,
    /// Write every read straight back to its sender.
    Echo,
}

/// Accept loop plus one fire-and-forget handler task per client.
pub struct ChatServer {
    rt: Arc<Runtime>,
    roster: Arc<Roster>,
    mode: Mode,
}

impl ChatServer {
    pub fn new(rt: Arc<Runtime>, mode: Mode) -> Arc<Self> {
        Arc::new(ChatServer {
            rt,
            roster: Arc::new(Roster::new()),
            mode,
        })
    }

    pub fn roster(&self) -> &Arc<Roster> {
        &self.roster
    }

    fn send_line(&self, conn: Handle, line: &str) -> tether_core::Result<()> {
        self.rt.write(conn, format!("{}\n", line).as_bytes()).map(|_| ())
    }

    /// Accept clients until `listener` is closed. Then disconnects every
    /// client and waits for their handlers to return.
    pub fn serve(self: &Arc<Self>, listener: Handle) {
        let mut handlers: Vec<Handle> = Vec::new();
        loop {
            let conn = match self.rt.accept(listener) {
                Ok(conn) => conn,
                Err(RuntimeError::Closed(_) | RuntimeError::NotFound(_)) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    thread::sleep(Duration::from_millis(100));
                    continue;
                }
            };

            self.reap(&mut handlers);
            self.admit(conn);
            let server = self.clone();
            handlers.push(
                self.rt
                    .tasks()
                    .launch_detached(move || server.handle_connection(conn)),
            );
        }

        tracing::info!(clients = self.roster.len(), "listener closed, disconnecting clients");
        for conn in self.roster.connections() {
            let _ = self.rt.close_connection(conn);
        }
        for task in handlers {
            let _ = self.rt.tasks().wait(task);
            self.rt.tasks().cleanup(task);
        }
    }

    /// Drop records of handlers that already finished.
    fn reap(&self, handlers: &mut Vec<Handle>) {
        let tasks = self.rt.tasks();
        handlers.retain(|task| match tasks.poll(*task) {
            Ok(TaskStatus::Running) => true,
            _ => {
                tasks.cleanup(*task);
                false
            }
        });
    }

    fn admit(&self, conn: Handle) {
        let name = self.roster.join(conn);
        let peer = self.rt.net().peer_addr(conn).ok();
        if self.mode == Mode::Chat {
            if let Err(e) = self.send_line(conn, &format!("USER {}", name)) {
                tracing::warn!(%conn, error = %e, "handshake failed");
            }
            let joined = format!("{} has joined the chat", name);
            self.rt.broadcast(format!("{}\n", joined).as_bytes(), Some(conn));
        }
        tracing::info!(%conn, ?peer, user = %name, "client joined");
    }

    fn handle_connection(&self, conn: Handle) {
        let name = self.roster.name(conn).unwrap_or_else(|| "unknown".to_string());
        let mut buf = [0u8; READ_BUFFER];
        let mut pending = Vec::new();
        loop {
            let n = match self.rt.read(conn, &mut buf) {
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(%conn, error = %e, "read ended");
                    break;
                }
            };
            match self.mode {
                Mode::Echo => {
                    if self.rt.write(conn, &buf[..n]).is_err() {
                        break;
                    }
                }
                Mode::Chat => {
                    pending.extend_from_slice(&buf[..n]);
                    self.relay_lines(conn, &name, &mut pending);
                }
            }
        }
        self.depart(conn);
    }

    /// Broadcast every complete line in `pending`, keeping any partial tail.
    fn relay_lines(&self, conn: Handle, name: &str, pending: &mut Vec<u8>) {
        while let Some(end) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=end).collect();
            let text = String::from_utf8_lossy(&line[..end]);
            let text = text.trim_end_matches('\r');
            if text.is_empty() {
                continue;
            }
            let report = self
                .rt
                .broadcast(format!("{}: {}\n", name, text).as_bytes(), Some(conn));
            tracing::trace!(%conn, delivered = report.delivered, failed = report.failed, "relayed");
        }
    }

    fn depart(&self, conn: Handle) {
        let _ = self.rt.close_connection(conn);
        let Some(name) = self.roster.leave(conn) else {
            return;
        };
        if self.mode == Mode::Chat {
            self.rt
                .broadcast(format!("{} has left the chat\n", name).as_bytes(), None);
        }
        tracing::info!(%conn, user = %name, "client left");
    }
}
