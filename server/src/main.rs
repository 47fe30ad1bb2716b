use clap::Parser;
use log::info;
use server::network::ZoneWorker;
use server::scripts::ScriptRegistry;
use server::zone::WorkerConfig;
use shared::{ZoneId, CLIENT_NETWORK_FPS, MAX_FRAME_SKIP};

#[derive(Parser, Debug)]
#[command(author, version, about = "Runs a single zone", long_about = None)]
struct Args {
    /// Port to serve the zone on
    #[arg(short, long)]
    port: u16,

    /// Instance type, e.g. "playerinstance"
    #[arg(short, long)]
    instance_type: String,

    /// Zone name, e.g. "GhibliHills"
    #[arg(short, long)]
    zone_name: String,

    /// Owner of the zone instance
    #[arg(short, long)]
    owner: String,

    /// Address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Ticks per second
    #[arg(short, long, default_value_t = CLIENT_NETWORK_FPS as u32)]
    tick_rate: u32,

    /// Most catch-up ticks run back to back before the backlog is dropped
    #[arg(short, long, default_value_t = MAX_FRAME_SKIP)]
    max_frame_skip: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let zone_id = ZoneId::new(&args.instance_type, &args.zone_name, &args.owner)?;

    let mut config = WorkerConfig::new(zone_id, &args.host, args.port).with_tick_rate(args.tick_rate);
    config.max_frame_skip = args.max_frame_skip;

    info!("Starting zone worker for {}", config.zone_id);
    let worker = ZoneWorker::bind(config, ScriptRegistry::builtin()).await?;
    let shutdown = worker.shutdown_handle();
    let running = tokio::spawn(worker.run());

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");
    shutdown.shutdown();
    running.await?;

    Ok(())
}
