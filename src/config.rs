use clap::Parser;

/// The daemon's configuration surface (§6): host, content-server port, and
/// message-channel port. The teacher is a GUI app with no CLI surface;
/// this derive-based parser follows the pattern used across the sibling
/// example repos for exactly this purpose.
#[derive(Parser, Debug, Clone)]
#[command(name = "shellmux", about = "Browser-accessible shell multiplexer")]
pub struct Cli {
    /// Hostname to bind both servers to.
    #[arg(short = 'i', long = "host", default_value = "127.0.0.1")]
    pub host: String,

    /// Port the content server (HTML/JS, access-key minting) listens on.
    #[arg(short = 'p', long = "content-server-port", default_value_t = 9423)]
    pub content_port: u16,

    /// Port the WebSocket message channel listens on.
    #[arg(short = 'w', long = "web-socket-port", default_value_t = 7700)]
    pub ws_port: u16,
}

/// Resolved configuration, passed explicitly into the dispatcher and
/// content-server routers (§9: dependency injection, no ambient globals).
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub content_port: u16,
    pub ws_port: u16,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        Self {
            host: cli.host,
            content_port: cli.content_port,
            ws_port: cli.ws_port,
        }
    }
}

impl Config {
    pub fn content_addr(&self) -> String {
        format!("{}:{}", self.host, self.content_port)
    }

    pub fn ws_addr(&self) -> String {
        format!("{}:{}", self.host, self.ws_port)
    }
}
