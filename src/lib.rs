pub mod config;
pub mod core;
pub mod net;

use std::sync::Arc;

pub use config::Config;
pub use core::{Registry, TokenVault};

use net::content_server::{self, ContentState};
use net::dispatcher::{self, DispatchState};

/// Builds the process-wide `Registry` and `TokenVault`, starts the
/// message-channel server (`/term`, `/manage`) and the ancillary content
/// server, and runs until interrupted. Both singletons are constructed
/// once here and passed explicitly into each router's shared state (§9:
/// dependency injection, no ambient globals).
pub async fn run(config: Config) -> std::io::Result<()> {
    let registry = Arc::new(Registry::new());
    let token_vault = Arc::new(TokenVault::new());

    let dispatch_state = Arc::new(DispatchState {
        registry: registry.clone(),
        token_vault: token_vault.clone(),
        config: config.clone(),
    });
    let content_state = Arc::new(ContentState {
        token_vault: token_vault.clone(),
        config: config.clone(),
    });

    let ws_listener = tokio::net::TcpListener::bind(config.ws_addr()).await?;
    let content_listener = tokio::net::TcpListener::bind(config.content_addr()).await?;

    log::info!("message channel listening on {}", config.ws_addr());
    log::info!("content server listening on {}", config.content_addr());

    let ws_app = dispatcher::build_router(dispatch_state);
    let content_app = content_server::build_router(content_state);

    let ws_server = tokio::spawn(async move {
        if let Err(e) = axum::serve(ws_listener, ws_app).await {
            log::error!("message channel server exited: {e}");
        }
    });
    let content_server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(content_listener, content_app).await {
            log::error!("content server exited: {e}");
        }
    });

    tokio::select! {
        _ = ws_server => {}
        _ = content_server_task => {}
        _ = tokio::signal::ctrl_c() => {
            log::info!("received ctrl-c, shutting down");
        }
    }

    Ok(())
}
