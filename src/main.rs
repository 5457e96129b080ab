pub mod action;
pub mod config;
pub mod joy;
pub mod node;
pub mod teleop;

use crate::action::{channel, ActionServerEndpoint, TrajectoryServerHandle};
use crate::config::TeleopConfig;
use crate::joy::JoyHandle;
use crate::node::TeleopContext;
use color_eyre::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Requests buffered between the teleop node and the action server
const ACTION_QUEUE_CAPACITY: usize = 32;

/// Action server side kept alive for the lifetime of the node
enum ServerSide {
    Simulated(TrajectoryServerHandle),
    /// Never reports ready, so every goal waits out the availability timeout
    Absent(ActionServerEndpoint),
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = TeleopConfig::config_path();
    TeleopConfig::ensure_default_config(&config_path).await?;
    let config = TeleopConfig::load_or_default(&config_path).await?;

    let (client, endpoint) = channel(&config.node.action_name, ACTION_QUEUE_CAPACITY);
    let server = if config.simulation.enabled {
        ServerSide::Simulated(TrajectoryServerHandle::spawn(
            endpoint,
            config.simulation.clone(),
        ))
    } else {
        warn!(
            "Simulation disabled, nothing serves {}",
            config.node.action_name
        );
        ServerSide::Absent(endpoint)
    };

    let (joy_sender, joy_receiver) = mpsc::channel(config.node.joy_queue_depth.max(1));
    let joy_handle = match JoyHandle::spawn(Some(config.joystick.clone()), joy_sender) {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Running without joystick input: {}", e);
            None
        }
    };

    let shutdown = CancellationToken::new();
    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received"),
            Err(e) => error!("Failed to listen for interrupt: {}", e),
        }
        interrupt.cancel();
    });

    let context = TeleopContext::new(&config, client, joy_receiver);
    let state = node::spin(context, shutdown).await;
    info!(
        "Teleop stopped (goal accepted: {}, last result: {:?})",
        state.goal_accepted, state.last_result
    );

    // spin dropped the joy receiver, so the collector exits on its next poll
    if let Some(joy_handle) = joy_handle {
        joy_handle.join().await;
    }
    match server {
        ServerSide::Simulated(handle) => handle.shutdown().await,
        ServerSide::Absent(endpoint) => drop(endpoint),
    }
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
