//! ZWIRE operator CLI.
//!
//! Runs a driver against a serial controller, streams notifications to the
//! terminal, and exposes the common network-management commands.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use zwire_core::{ControllerCommand, Driver, DriverOptions, Notification};
use zwire_serial::UsbPort;

/// ZWIRE - Z-Wave Serial API driver
#[derive(Parser)]
#[command(name = "zwire")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Serial device of the controller (e.g. /dev/ttyUSB0)
    #[arg(short, long, default_value = "/dev/ttyUSB0")]
    device: String,

    /// Directory for network snapshots
    #[arg(short, long, default_value = ".")]
    user_path: PathBuf,

    /// Seconds for one full sweep of the poll list
    #[arg(long, default_value_t = 30)]
    poll_interval: u64,

    /// Do not write the snapshot at shutdown
    #[arg(long)]
    no_save: bool,

    /// Enable debug output
    #[arg(short = 'v', long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the driver and stream notifications until interrupted
    Watch,

    /// Put the controller in inclusion mode and wait for a device
    Include,

    /// Put the controller in exclusion mode and wait for a device
    Exclude,

    /// Print the current network snapshot state, then exit
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let options = DriverOptions {
        user_path: cli.user_path.clone(),
        save_configuration: !cli.no_save,
        poll_interval: Duration::from_secs(cli.poll_interval),
        ..DriverOptions::default()
    };

    let port = Arc::new(UsbPort::new(&cli.device));
    let driver = Driver::new(port, options);
    let mut notifications = driver.subscribe();
    driver.start()?;

    match cli.command.unwrap_or(Commands::Watch) {
        Commands::Watch => {
            tracing::info!(device = %cli.device, "driver running, ctrl-c to stop");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    Some(notification) = notifications.recv() => print_notification(&notification),
                }
            }
        }
        Commands::Include => {
            tracing::info!("inclusion mode: press the button on the device to add");
            let mut progress = driver.begin_controller_command(ControllerCommand::AddDevice, 0, false)?;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        driver.cancel_controller_command();
                        break;
                    }
                    changed = progress.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *progress.borrow();
                        tracing::info!(?state, "inclusion progress");
                        if matches!(state, zwire_core::ControllerState::Completed | zwire_core::ControllerState::Failed) {
                            break;
                        }
                    }
                    Some(notification) = notifications.recv() => print_notification(&notification),
                }
            }
        }
        Commands::Exclude => {
            tracing::info!("exclusion mode: press the button on the device to remove");
            let mut progress = driver.begin_controller_command(ControllerCommand::RemoveDevice, 0, false)?;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        driver.cancel_controller_command();
                        break;
                    }
                    changed = progress.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *progress.borrow();
                        tracing::info!(?state, "exclusion progress");
                        if matches!(state, zwire_core::ControllerState::Completed | zwire_core::ControllerState::Failed) {
                            break;
                        }
                    }
                    Some(notification) = notifications.recv() => print_notification(&notification),
                }
            }
        }
        Commands::Status => {
            // Wait for the handshake to settle, then report.
            let mut ready = false;
            let settle = tokio::time::sleep(Duration::from_secs(10));
            tokio::pin!(settle);
            while !ready {
                tokio::select! {
                    _ = &mut settle => break,
                    Some(notification) = notifications.recv() => {
                        print_notification(&notification);
                        ready = matches!(
                            notification,
                            Notification::AllNodesQueried { .. } | Notification::AwakeNodesQueried { .. }
                        );
                    }
                }
            }
            println!("home id:    0x{:08x}", driver.home_id());
            println!("controller: node {}", driver.controller_node_id());
            println!("library:    {}", driver.library_version());
            println!("nodes:      {:?}", driver.node_ids());
        }
    }

    let stats = driver.statistics();
    driver.shutdown().await;

    tracing::info!(
        reads = stats.read_cnt,
        writes = stats.write_cnt,
        retries = stats.retries,
        dropped = stats.dropped,
        bad_checksum = stats.bad_checksum,
        "session statistics"
    );
    Ok(())
}

fn print_notification(notification: &Notification) {
    match notification {
        Notification::DriverReady { home_id, node_id } => {
            println!("driver ready: home 0x{home_id:08x}, controller node {node_id}");
        }
        Notification::NodeAdded { node_id, .. } => println!("node {node_id}: added"),
        Notification::NodeNew { node_id, .. } => println!("node {node_id}: new on the network"),
        Notification::NodeRemoved { node_id, .. } => println!("node {node_id}: removed"),
        Notification::NodeReady { node_id, .. } => println!("node {node_id}: interrogation complete"),
        Notification::AwakeNodesQueried { .. } => println!("all awake nodes queried"),
        Notification::AllNodesQueried { .. } => println!("all nodes queried"),
        Notification::ValueAdded(value) => println!("value added: {value}"),
        Notification::ValueChanged(value) => println!("value changed: {value}"),
        Notification::ValueRemoved(value) => println!("value removed: {value}"),
        Notification::Group { node_id, group_id, .. } => {
            println!("node {node_id}: group {group_id} membership changed");
        }
        Notification::DriverFailed => println!("driver failed: controller unreachable"),
        Notification::DriverReset { .. } => println!("driver reset"),
        Notification::ButtonOn { node_id, button_id } => println!("node {node_id}: button {button_id} on"),
        Notification::ButtonOff { node_id, button_id } => println!("node {node_id}: button {button_id} off"),
        Notification::ButtonCreate { node_id, button_id } => {
            println!("node {node_id}: button {button_id} created");
        }
        Notification::ButtonDelete { node_id, button_id } => {
            println!("node {node_id}: button {button_id} deleted");
        }
        Notification::MsgComplete { .. } => {}
    }
}
