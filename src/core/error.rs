use thiserror::Error;

/// Errors raised by [`crate::core::pty_process::PtyProcess`].
///
/// Unlike the Tauri-era version of this enum, this one is never serialized
/// back across a wire boundary — callers either log it or fold it into a
/// [`DispatchError::SpawnError`].
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to spawn shell: {0}")]
    SpawnFailed(String),

    #[error("pty closed")]
    PtyClosed,

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("resize rejected: {0}")]
    BadArgument(String),

    #[error("resize failed: {0}")]
    ResizeFailed(String),

    #[error("signal delivery failed: {0}")]
    SignalFailed(String),
}

/// Errors raised while dispatching an incoming message-channel connection.
///
/// None of these are surfaced structurally to the peer (§7): every variant
/// here results in the connection being closed without explanation. They
/// exist so the dispatcher's own logging and tests can distinguish the
/// failure modes from one another.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("origin header not in allow-list")]
    BadOrigin,

    #[error("handshake message was not valid JSON or was missing a required field")]
    BadHandshake,

    #[error("access key was missing, expired, or already consumed")]
    BadAccessKey,

    #[error("sessionID does not name a live session")]
    UnknownSession,

    #[error("session already has an attached peer")]
    AlreadyAttached,

    #[error("failed to spawn a new session: {0}")]
    SpawnError(#[from] PtyError),

    #[error("malformed management request")]
    BadManagementRequest,
}
