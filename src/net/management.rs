use std::sync::Arc;

use serde::Deserialize;

use crate::core::Registry;
use crate::net::peer::{PeerHandle, PeerReceiver};

/// Inbound management request shapes (§4.6, §6). Serde's internally
/// tagged representation matches the wire format directly: `{"type":
/// "kill", "sessionID": "..."}` deserializes straight into `Kill`.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ManagementRequest {
    Poll,
    Kill {
        #[serde(rename = "sessionID")]
        session_id: String,
    },
}

/// The bidirectional control surface: poll snapshot, kill session, and
/// (via `Registry::broadcast_state_change`, invoked elsewhere) unsolicited
/// state-change pushes.
pub struct ManagementChannel;

impl ManagementChannel {
    /// Loops reading JSON request messages until the peer closes.
    /// Malformed messages or unknown `type` values are silently skipped,
    /// keeping the channel open (§4.6).
    pub async fn serve(mut receiver: PeerReceiver, handle: PeerHandle, registry: Arc<Registry>) {
        while let Some(text) = receiver.recv_text().await {
            let request: ManagementRequest = match serde_json::from_str(&text) {
                Ok(r) => r,
                Err(_) => continue,
            };

            let response = match request {
                ManagementRequest::Poll => registry.poll_payload(),
                ManagementRequest::Kill { session_id } => kill_response(&registry, &session_id),
            };

            handle.send_text(response);
        }
    }
}

fn kill_response(registry: &Registry, session_id: &str) -> String {
    match registry.lookup(session_id) {
        Some(session) if session.shell_open() => {
            session.kill();
            serde_json::json!({
                "response": "kill",
                "result": "success",
                "sessionID": session_id,
            })
            .to_string()
        }
        _ => serde_json::json!({
            "response": "kill",
            "result": "error",
            "sessionID": session_id,
            "message": "sessionID not found",
        })
        .to_string(),
    }
}
