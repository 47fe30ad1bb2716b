use clap::Parser;
use log::info;
use master::config::LauncherConfig;
use master::directory::{InMemoryDirectory, StaticAuthenticator};
use master::launcher::ZoneLauncher;
use master::network::MasterServer;
use master::probe::WorkerClient;
use master::registry::InstanceRegistry;
use master::supervisor::{ControlSupervisor, DirectSupervisor, ProcessSupervisor};
use shared::{MASTER_ZONE_SERVER_PORT, ZONE_END_PORT, ZONE_STARTUP_SECS, ZONE_START_PORT};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(author, version, about = "Starts and tracks zone workers", long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = MASTER_ZONE_SERVER_PORT)]
    port: u16,

    /// Host zone workers bind to
    #[arg(long, default_value = "127.0.0.1")]
    worker_host: String,

    /// First port handed to zone workers
    #[arg(long, default_value_t = ZONE_START_PORT)]
    port_start: u16,

    /// One past the last port handed to zone workers
    #[arg(long, default_value_t = ZONE_END_PORT)]
    port_end: u16,

    /// Seconds a new worker gets to answer its first probe
    #[arg(long, default_value_t = ZONE_STARTUP_SECS)]
    startup_timeout: u64,

    /// Milliseconds between probes while a worker starts
    #[arg(long, default_value = "100")]
    poll_interval_ms: u64,

    /// Seconds between registry sweeps
    #[arg(long, default_value = "300")]
    sweep_interval: u64,

    /// JSON file to keep the instance registry in
    #[arg(short, long)]
    registry: Option<PathBuf>,

    /// Zone worker binary; defaults to `server` next to this executable
    #[arg(long)]
    worker_bin: Option<PathBuf>,

    /// External supervisor control program; workers run as children if unset
    #[arg(long)]
    control_program: Option<PathBuf>,

    /// Account allowed to look up characters, as USER:PASSWORD:CHARACTER
    #[arg(short, long)]
    account: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = LauncherConfig {
        worker_host: args.worker_host.clone(),
        port_start: args.port_start,
        port_end: args.port_end,
        startup_deadline: Duration::from_secs(args.startup_timeout),
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        sweep_interval: Duration::from_secs(args.sweep_interval),
        registry_path: args.registry.clone(),
        ..LauncherConfig::default()
    }
    .validate()?;

    let registry = match &config.registry_path {
        Some(path) => InstanceRegistry::open(path).await?,
        None => InstanceRegistry::new(),
    };

    let worker_bin = match &args.worker_bin {
        Some(path) => path.clone(),
        None => std::env::current_exe()?.with_file_name("server"),
    };

    match &args.control_program {
        Some(program) => {
            info!("Zone workers are managed by {}", program.display());
            serve(&args, config, registry, ControlSupervisor::new(program, worker_bin)).await
        }
        None => {
            info!("Zone workers run as children from {}", worker_bin.display());
            serve(&args, config, registry, DirectSupervisor::new(worker_bin)).await
        }
    }
}

async fn serve<S>(
    args: &Args,
    config: LauncherConfig,
    registry: InstanceRegistry,
    supervisor: S,
) -> Result<(), Box<dyn std::error::Error>>
where
    S: ProcessSupervisor + 'static,
{
    let (auth, directory) = accounts(&args.account)?;
    let probe = WorkerClient::new(config.probe_timeout);
    let launcher = Arc::new(ZoneLauncher::new(
        config,
        Arc::new(registry),
        supervisor,
        probe,
    ));

    let (stop_tx, stop_rx) = watch::channel(false);
    let sweeper = launcher.spawn_sweeper(stop_rx.clone());

    let address = format!("{}:{}", args.host, args.port);
    let server = MasterServer::bind(
        &address,
        Arc::clone(&launcher),
        Arc::new(auth),
        Arc::new(directory),
    )
    .await?;

    tokio::select! {
        _ = server.run(stop_rx) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    stop_tx.send(true)?;
    sweeper.await?;
    Ok(())
}

fn accounts(
    specs: &[String],
) -> Result<(StaticAuthenticator, InMemoryDirectory), Box<dyn std::error::Error>> {
    let mut auth = StaticAuthenticator::new();
    let mut directory = InMemoryDirectory::new();

    for spec in specs {
        let parts: Vec<&str> = spec.splitn(3, ':').collect();
        let [user, password, character] = parts[..] else {
            return Err(format!("account `{}` is not USER:PASSWORD:CHARACTER", spec).into());
        };
        auth = auth.with_user(user, password);
        directory = directory.with_character(user, character);
    }

    Ok((auth, directory))
}
