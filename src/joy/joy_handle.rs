//! Joy Handle - spawns the gamepad collector and owns its lifecycle
//!
//! The collector polls gilrs on a blocking thread and publishes
//! [`JoyMessage`] snapshots on the provided bounded sender. It stops on its
//! own once every receiver of that channel is dropped.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::event_collector::{CollectorError, EventCollector, JoyMessage};
use crate::config::JoystickConfig;

pub struct JoyHandle {
    task: JoinHandle<()>,
}

impl JoyHandle {
    /// Spawns the collector publishing into `sender`
    ///
    /// Fails only if the gamepad backend cannot be initialized; a missing
    /// gamepad is not an error, the collector idles until one connects.
    pub fn spawn(
        settings: Option<JoystickConfig>,
        sender: mpsc::Sender<JoyMessage>,
    ) -> Result<Self, CollectorError> {
        info!("Spawning joystick collector with settings: {:?}", settings);

        let collector = EventCollector::create(settings, sender)?;

        let task = tokio::task::spawn_blocking(move || {
            let mut collecting = collector.initialize();
            collecting.run_collection_loop();
        });
        debug!("Joystick collector running on blocking thread");

        Ok(Self { task })
    }

    /// Waits for the collector to notice its receiver is gone
    ///
    /// Drop the receiving end first, otherwise this never returns.
    pub async fn join(self) {
        match self.task.await {
            Ok(()) => info!("Joystick collector stopped"),
            Err(e) => error!("Joystick collector failed: {}", e),
        }
    }
}
