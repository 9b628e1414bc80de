use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use riptide::{RiptideError, Session, SessionConfig, Torrent};
use riptide_proto::Handshake;

#[derive(Parser, Debug)]
#[command(name = "riptide", about = "Leech-capable BitTorrent client", version)]
struct Cli {
    /// Path to the .torrent metadata file.
    torrent: PathBuf,

    /// Port advertised to the tracker for inbound connections.
    #[arg(long, env = "RIPTIDE_PORT", default_value_t = 8888)]
    port: u16,

    /// Directory the torrent's file tree is created under.
    #[arg(long, default_value = ".")]
    download_dir: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "session failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), RiptideError> {
    let raw = std::fs::read(&cli.torrent)?;
    let torrent = Torrent::from_bytes(&raw)?;
    info!(
        name = %torrent.info.name,
        pieces = torrent.info.num_pieces(),
        size = torrent.info.total_size(),
        infohash = %hex_hash(&torrent.info_hash),
        "torrent loaded"
    );

    let peer_id = Handshake::random_peer_id(b"-RT0001-");
    let config = SessionConfig {
        listener_port: cli.port,
        download_dir: cli.download_dir,
        ..SessionConfig::default()
    };

    let session = Session::new(torrent, peer_id, config);
    let runner = tokio::spawn(session.clone().run());

    tokio::select! {
        result = runner => result.expect("session task panicked"),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            session.shutdown();
            Ok(())
        }
    }
}

fn hex_hash(hash: &[u8; 20]) -> String {
    hash.iter().map(|b| format!("{:02x}", b)).collect()
}
