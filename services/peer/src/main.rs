use clap::Parser;
use peer::{Cli, Config, Peer};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match Config::try_from(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let peer = match Peer::new(config).await {
        Ok(peer) => peer,
        Err(e) => {
            eprintln!("failed to start: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = peer.run().await {
        eprintln!("fatal error: {e}");
        std::process::exit(1);
    }
}
