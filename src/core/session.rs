use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Deserialize;

use super::error::DispatchError;
use super::pty_process::{PtyProcess, Utf8Decoder};
use super::registry::Registry;
use crate::net::peer::{ClientPeer, PeerHandle, PeerReceiver};

/// 8 lowercase hex characters, unique within a running Registry (§3).
pub type SessionId = String;

/// The bounded chunk size the output pump reads from the PTY master per
/// iteration — the spec's own reference value (§4.2).
const OUTPUT_CHUNK_BYTES: usize = 1024;

#[derive(Deserialize)]
struct ResizeRequest {
    rows: i64,
    cols: i64,
}

/// Owns a `PtyProcess`, the currently attached peer (if any), and the
/// output pump / reaper tasks for its lifetime. Generalizes the teacher's
/// per-`DashMap`-entry `PtySession` bookkeeping in `process_manager.rs`
/// into a standalone object addressed by `ClientPeer` instead of a Tauri
/// `AppHandle::emit` call.
pub struct Session {
    id: SessionId,
    pty: Arc<PtyProcess>,
    peer: Mutex<Option<PeerHandle>>,
    shell_open: AtomicBool,
}

impl Session {
    /// Spawns the PTY, attaches `peer`, starts the output pump and the
    /// reaper, and immediately sends the SessionID as the first message
    /// (before any PTY output can reach the peer — §5's ordering
    /// guarantee). `registry` is only retained by the reaper task, to
    /// remove this session and broadcast the state change once the child
    /// is reaped; the `Session` itself holds no reference back to it.
    pub fn create(
        id: SessionId,
        peer: ClientPeer,
        registry: Arc<Registry>,
    ) -> Result<(Arc<Session>, PeerReceiver), DispatchError> {
        let pty = Arc::new(PtyProcess::spawn()?);
        let (peer_handle, peer_receiver) = peer.into_parts();
        peer_handle.send_text(id.clone());

        let session = Arc::new(Session {
            id,
            pty,
            peer: Mutex::new(Some(peer_handle)),
            shell_open: AtomicBool::new(true),
        });

        session.spawn_output_pump();
        session.spawn_reaper(registry);

        Ok((session, peer_receiver))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn shell_open(&self) -> bool {
        self.shell_open.load(Ordering::SeqCst)
    }

    pub fn peer_attached(&self) -> bool {
        self.peer.lock().expect("session peer lock poisoned").is_some()
    }

    /// Replaces the peer, per the `Attached`/`Detached` state machine
    /// (§4.2). The Dispatcher is expected to have already checked
    /// `!peer_attached` before calling this (§4.5); this method still
    /// enforces the precondition itself so a race between two concurrent
    /// attach attempts fails closed rather than silently stealing the
    /// connection.
    pub fn attach(&self, peer: ClientPeer) -> Result<PeerReceiver, DispatchError> {
        let mut current = self.peer.lock().expect("session peer lock poisoned");
        if current.is_some() {
            log::debug!("session {}: attach rejected, peer already attached", self.id);
            return Err(DispatchError::AlreadyAttached);
        }
        let (handle, receiver) = peer.into_parts();
        *current = Some(handle);
        log::info!("session {}: peer attached", self.id);
        Ok(receiver)
    }

    /// Runs until the current peer disconnects: reads client messages and
    /// dispatches them per §6, marking the session detached on
    /// disconnection. Never terminates the shell.
    pub async fn serve(&self, mut receiver: PeerReceiver) {
        while let Some(message) = receiver.recv_text().await {
            self.handle_input(&message);
        }
        *self.peer.lock().expect("session peer lock poisoned") = None;
        log::info!("session {}: peer detached", self.id);
    }

    /// Sends SIGTERM to the child.
    pub fn kill(&self) {
        if let Err(e) = self.pty.signal(libc::SIGTERM) {
            log::warn!("failed to signal session {}: {e}", self.id);
        }
    }

    fn handle_input(&self, message: &str) {
        // Split on the first Unicode scalar, not byte offset 1 — a leading
        // multi-byte character (e.g. "é") is a valid, if unrecognized,
        // opcode and must not panic on a non-char-boundary split (§4.2:
        // unknown opcodes are silently ignored, never fatal).
        let mut chars = message.chars();
        let opcode = match chars.next() {
            Some(c) => c,
            None => return,
        };
        let rest = chars.as_str();

        match opcode {
            'k' => {
                if let Err(e) = self.pty.write(rest.as_bytes()) {
                    log::debug!("session {}: write failed: {e}", self.id);
                }
            }
            'r' => self.handle_resize(rest),
            _ => {} // unknown opcode — silently ignored (§4.2)
        }
    }

    fn handle_resize(&self, body: &str) {
        let request: ResizeRequest = match serde_json::from_str(body) {
            Ok(r) => r,
            Err(_) => return, // malformed JSON — silently ignored
        };

        if request.rows <= 0 || request.cols <= 0 || request.rows > u16::MAX as i64 || request.cols > u16::MAX as i64 {
            return;
        }

        // Open question (§9): resize on a since-closed PTY is dropped
        // silently rather than surfaced as an error.
        if let Err(e) = self.pty.resize(request.rows as u16, request.cols as u16) {
            log::debug!("session {}: resize dropped: {e}", self.id);
        }
    }

    fn spawn_output_pump(self: &Arc<Self>) {
        let session = self.clone();
        std::thread::Builder::new()
            .name(format!("pty-output-{}", session.id))
            .spawn(move || {
                let mut decoder = Utf8Decoder::new();
                loop {
                    match session.pty.read_chunk(OUTPUT_CHUNK_BYTES) {
                        Ok(bytes) => {
                            let text = decoder.decode(&bytes);
                            if text.is_empty() {
                                continue;
                            }
                            let handle = session
                                .peer
                                .lock()
                                .expect("session peer lock poisoned")
                                .clone();
                            if let Some(handle) = handle {
                                // Drop silently on send failure — the shell
                                // must never block on a missing or slow peer.
                                let _ = handle.send_text(text);
                            }
                        }
                        Err(_) => break, // PtyClosed
                    }
                }
                log::debug!("output pump for session {} exited", session.id);
            })
            .expect("failed to spawn pty output pump thread");
    }

    fn spawn_reaper(self: &Arc<Self>, registry: Arc<Registry>) {
        let session = self.clone();
        tokio::spawn(async move {
            let pty = session.pty.clone();
            let _ = tokio::task::spawn_blocking(move || pty.wait()).await;

            session.shell_open.store(false, Ordering::SeqCst);
            if let Some(handle) = session.peer.lock().expect("session peer lock poisoned").take() {
                handle.close();
            }
            registry.reap(&session.id).await;
            log::info!("session {} reaped", session.id);
        });
    }
}
