use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream, StreamExt};
use futures::SinkExt;
use tokio::sync::mpsc;

/// A freshly upgraded, not-yet-split WebSocket connection plus its `Origin`
/// header, matching the `ClientPeer` abstraction of §3 (`recv`, `send`,
/// `close`, read-only `originHeader`) before it has been handed off to a
/// `Session` or `ManagementChannel`.
pub struct ClientPeer {
    socket: WebSocket,
    origin_header: String,
}

impl ClientPeer {
    pub fn new(socket: WebSocket, origin_header: String) -> Self {
        Self {
            socket,
            origin_header,
        }
    }

    pub fn origin_header(&self) -> &str {
        &self.origin_header
    }

    /// Reads the next text frame, skipping ping/pong/binary frames. Returns
    /// `None` once the peer closes or the connection errors.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Text(t))) => return Some(t.to_string()),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return None,
            }
        }
    }

    /// Closes the connection without ever having split it — used by the
    /// dispatcher to reject a peer during handshake (§4.5), before any
    /// `Session`/`ManagementChannel` machinery is involved.
    pub async fn close(mut self) {
        let _ = self.socket.close().await;
    }

    /// Splits the connection into a cheaply-cloneable [`PeerHandle`] for
    /// enqueueing outbound frames from any thread, and a [`PeerReceiver`]
    /// for reading inbound frames. A single forwarding task is spawned to
    /// own the sender half and drain the handle's channel, so every
    /// outbound frame for this peer is serialized through one task (§5:
    /// "direct cross-thread socket writes are forbidden").
    pub fn into_parts(self) -> (PeerHandle, PeerReceiver) {
        let (sink, stream) = self.socket.split();
        let handle = spawn_forwarder(sink);
        (handle, PeerReceiver { stream })
    }
}

/// The receiving half of a split [`ClientPeer`], used by `Session::serve`
/// and `ManagementChannel::serve` to read client messages.
pub struct PeerReceiver {
    stream: SplitStream<WebSocket>,
}

impl PeerReceiver {
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(t))) => return Some(t.to_string()),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return None,
            }
        }
    }
}

/// A cheap handle for enqueueing outbound text frames onto the task that
/// owns a peer's WebSocket sender half. Safe to call from any thread,
/// including the dedicated PTY output-pump threads — sends never block and
/// are silently dropped once the forwarder has exited.
#[derive(Clone)]
pub struct PeerHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl PeerHandle {
    /// Enqueues a text frame. Returns `false` if the forwarder has already
    /// exited (peer gone) — callers treat this the same as a dropped send.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.tx.send(Message::Text(text.into().into())).is_ok()
    }

    /// Enqueues a close frame; the forwarder closes the sink and exits
    /// after flushing it.
    pub fn close(&self) {
        let _ = self.tx.send(Message::Close(None));
    }
}

fn spawn_forwarder(mut sink: SplitSink<WebSocket, Message>) -> PeerHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() {
                break;
            }
            if is_close {
                break;
            }
        }
        let _ = sink.close().await;
    });

    PeerHandle { tx }
}
