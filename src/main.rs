use std::{
    env,
    fs::File,
    io::{self, Read},
    time::Instant,
};

use tracing::{debug, error, info, warn, Level};
use tracing_appender::rolling;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    EnvFilter, Registry,
};

use crate::client::Client;
use crate::config::Config;
use crate::metainfo::Metainfo;
use crate::p2p::connection::generate_peer_id;
use crate::tracker::{AnnounceData, Event, TrackerFactory};

pub mod client;
pub mod config;
pub mod disk;
pub mod download_state;
pub mod metainfo;
pub mod monitor;
pub mod p2p;
pub mod progress;
pub mod tracker;

#[tokio::main]
async fn main() -> io::Result<()> {
    // File appender: rolling logs daily to "logs/app.log".
    let file_appender = rolling::daily("logs", "app.log");

    // Logger for terminal output (with colors).
    let terminal_layer = fmt::layer()
        .with_thread_names(true)
        .with_target(true)
        .with_span_events(FmtSpan::NONE)
        .with_ansi(true); // Enable ANSI for terminal

    // Logger for file output (no colors or ANSI escape codes).
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_thread_names(true)
        .with_target(true)
        .with_span_events(FmtSpan::NONE)
        .with_ansi(false); // Disable ANSI for file output

    // Combine the layers and apply the subscriber.
    let subscriber = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::DEBUG.into()))
        .with(terminal_layer)
        .with(file_layer);
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting BitTorrent client...");
    let start = Instant::now();

    let file_path = env::args().nth(1).ok_or_else(|| {
        error!("No torrent file provided");
        io::Error::new(io::ErrorKind::InvalidInput, "Usage: shoal <torrent file>")
    })?;

    debug!("Opening torrent file: {}", file_path);
    let mut file = File::open(&file_path).map_err(|e| {
        warn!("Failed to open torrent file: {}", e);
        e
    })?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;

    debug!("Computing info hash...");
    let info_hash = Metainfo::compute_info_hash(&buffer)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    debug!(info_hash = ?hex::encode(info_hash), "Info hash computed");

    let metainfo = Metainfo::deserialize(&buffer).map_err(|e| {
        warn!("Failed to deserialize metainfo: {}", e);
        io::Error::new(io::ErrorKind::Other, e)
    })?;
    debug!(torrent_name = ?metainfo.name(), "Successfully deserialized metainfo");

    let total_length = metainfo
        .total_length()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    let pieces = metainfo
        .build_pieces()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    debug!(
        total_length,
        piece_count = pieces.len(),
        "Parsed torrent metadata"
    );

    let peer_id = generate_peer_id();
    debug!(peer_id = ?String::from_utf8_lossy(&peer_id), "Generated session peer ID");

    let config = Config::load().map_err(|e| {
        warn!("Failed to load configuration: {}", e);
        io::Error::new(io::ErrorKind::Other, e.to_string())
    })?;

    debug!("Querying tracker...");
    let tracker = TrackerFactory::create(metainfo.announce())
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    let announce_data = AnnounceData::new(
        info_hash,
        peer_id,
        config.network.port,
        0,
        0,
        total_length,
        Event::Started,
        None,
    );
    let response = tracker.announce(announce_data).await.map_err(|e| {
        warn!("Tracker announce failed: {}", e);
        io::Error::new(io::ErrorKind::Other, e.to_string())
    })?;

    if let Some(warning) = &response.warning_message {
        warn!(warning = %warning, "Tracker returned a warning");
    }
    info!(
        peer_count = response.peers.len(),
        seeders = response.seeders,
        leechers = response.leechers,
        interval = response.interval,
        "Tracker announce completed"
    );

    info!("Initializing client...");
    let client = Client::new(
        config.disk.download_path,
        metainfo.name().to_string(),
        total_length,
        metainfo.piece_length(),
        info_hash,
        peer_id,
        response.peers,
        pieces,
        config.network.max_peer_connections as usize,
        config.network.timeout_threshold,
        config.network.connection_retries,
    );

    info!("Starting download...");
    if let Err(e) = client.run().await {
        error!("Error during client run: {}", e);
        return Err(e);
    }

    let duration = start.elapsed();
    println!("Time elapsed: {:.2?}", duration);

    Ok(())
}
