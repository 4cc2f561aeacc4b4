//! mount-tracker daemon entry point

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use mount_tracker::bus::local::LocalBus;
use mount_tracker::bus::socket::SocketServer;
use mount_tracker::catalog::MountableCatalog;
use mount_tracker::config::Config;
use mount_tracker::launcher::ProcessLauncher;
use mount_tracker::session::SessionFactory;
use mount_tracker::tracker::MountTracker;

/// Print usage information
fn print_usage() {
    eprintln!("Usage: mount-tracker <config.yaml>");
    eprintln!();
    eprintln!("mount-tracker - keeps track of active mounts and spawns mount backends");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  config.yaml    Path to configuration file");
    eprintln!();
    eprintln!("Example:");
    eprintln!("  mount-tracker /etc/mount-tracker/config.yaml");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse arguments
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        print_usage();
        std::process::exit(1);
    }

    let config_path = PathBuf::from(&args[1]);

    // Load configuration
    let config = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("mount-tracker starting");
    info!("Loaded configuration from {:?}", config_path);

    let catalog = Arc::new(MountableCatalog::load(&config.mountable_dir));
    for mountable in catalog.iter() {
        debug!(
            "Mountable {:?}: exec={:?} dbus_name={:?} automount={}",
            mountable.kind, mountable.exec, mountable.dbus_name, mountable.automount
        );
    }

    match config.spawn.timeout {
        Some(timeout) => info!("Spawned backends must acknowledge within {:?}", timeout),
        None => info!("Waiting indefinitely for spawned backends to acknowledge"),
    }

    let listener = SocketServer::bind(&config.socket_path).await?;

    let bus = Arc::new(LocalBus::new(config.unique_name.clone()));
    let launcher = ProcessLauncher::new().with_bus_address(&config.socket_path);
    let sessions = SessionFactory::new(bus.clone(), Arc::new(launcher), config.spawn.timeout);
    let tracker = MountTracker::new(catalog, bus.clone(), sessions);
    let handle = tracker.handle();

    tokio::spawn(handle.clone().follow_owner_changes(bus.subscribe_owner_changes()));

    let server = Arc::new(SocketServer::new(bus.clone(), handle.clone()));
    let accept_task = tokio::spawn(server.serve(listener));

    // Set up signal handling for graceful shutdown
    let h = handle.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        h.shutdown();
    })?;

    info!(
        "Serving as {} on {:?} - press Ctrl+C to exit",
        config.unique_name, config.socket_path
    );
    tracker.run().await;

    info!("Shutting down");
    accept_task.abort();
    if let Err(e) = tokio::fs::remove_file(&config.socket_path).await {
        debug!("Could not remove {:?}: {}", config.socket_path, e);
    }
    Ok(())
}
