use clap::Parser;

use shellmux::config::{Cli, Config};

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let config: Config = cli.into();

    if let Err(e) = shellmux::run(config).await {
        log::error!("fatal: {e}");
        std::process::exit(1);
    }
}
