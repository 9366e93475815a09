use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use crate::config::Config;
use crate::core::TokenVault;

/// Ancillary, non-core stand-in for the "out of scope" content-server
/// collaborator (§1, §6.1): mints access keys via `TokenVault` and serves
/// a bare terminal page and a management page, each embedding a freshly
/// issued key. Bound to loopback only, matching the content-server
/// contract.
pub struct ContentState {
    pub token_vault: Arc<TokenVault>,
    pub config: Config,
}

#[derive(Deserialize)]
struct TerminalQuery {
    #[serde(rename = "sessionID")]
    session_id: Option<String>,
}

pub fn build_router(state: Arc<ContentState>) -> Router {
    Router::new()
        .route("/", get(terminal_page))
        .route("/manage", get(management_page))
        .with_state(state)
}

async fn terminal_page(
    State(state): State<Arc<ContentState>>,
    Query(query): Query<TerminalQuery>,
) -> Html<String> {
    let session_id = query.session_id.unwrap_or_else(|| "new".to_string());
    let access_key = state.token_vault.issue_access_key();
    Html(render_terminal_page(&session_id, &access_key, state.config.ws_port))
}

async fn management_page(State(state): State<Arc<ContentState>>) -> Html<String> {
    let access_key = state.token_vault.issue_access_key();
    Html(render_management_page(&access_key, state.config.ws_port))
}

fn render_terminal_page(session_id: &str, access_key: &str, ws_port: u16) -> String {
    format!(
        r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>shellmux</title></head>
<body>
<pre id="term" style="background:#000;color:#ddd;padding:1em;white-space:pre-wrap;"></pre>
<script>
(function() {{
  var sessionID = {session_id:?};
  var accessKey = {access_key:?};
  var ws = new WebSocket("ws://" + location.hostname + ":{ws_port}/term");
  var term = document.getElementById("term");
  ws.onopen = function() {{
    ws.send(JSON.stringify({{accessKey: accessKey, sessionID: sessionID}}));
  }};
  ws.onmessage = function(evt) {{ term.textContent += evt.data; }};
  document.addEventListener("keydown", function(e) {{
    if (e.key.length === 1) ws.send("k" + e.key);
    else if (e.key === "Enter") ws.send("k\n");
  }});
  window.addEventListener("resize", function() {{
    ws.send("r" + JSON.stringify({{rows: term.clientHeight, cols: 80}}));
  }});
}})();
</script>
</body>
</html>"#
    )
}

fn render_management_page(access_key: &str, ws_port: u16) -> String {
    format!(
        r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>shellmux — manage</title></head>
<body>
<ul id="sessions"></ul>
<script>
(function() {{
  var accessKey = {access_key:?};
  var ws = new WebSocket("ws://" + location.hostname + ":{ws_port}/manage");
  var list = document.getElementById("sessions");
  ws.onopen = function() {{
    ws.send(JSON.stringify({{accessKey: accessKey}}));
    ws.send(JSON.stringify({{type: "poll"}}));
  }};
  ws.onmessage = function(evt) {{
    var msg = JSON.parse(evt.data);
    if (msg.response === "poll") {{
      list.innerHTML = "";
      msg.result.forEach(function(s) {{
        var li = document.createElement("li");
        li.textContent = s.sessionID + (s.connected ? " (connected)" : " (detached)");
        list.appendChild(li);
      }});
    }}
  }};
}})();
</script>
</body>
</html>"#
    )
}
