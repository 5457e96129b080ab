//! Teleop node event loop
//!
//! All node state lives in one [`TeleopContext`] owned by [`spin`]. The loop
//! multiplexes joystick messages, goal events and shutdown, so controller
//! handlers never run concurrently.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::action::ActionClient;
use crate::config::TeleopConfig;
use crate::joy::JoyMessage;
use crate::teleop::{ControllerState, GoalEvent, TeleopController};

pub struct TeleopContext {
    name: String,
    controller: TeleopController,
    joy_receiver: mpsc::Receiver<JoyMessage>,
    goal_events: mpsc::Receiver<GoalEvent>,
}

impl TeleopContext {
    pub fn new(
        config: &TeleopConfig,
        client: ActionClient,
        joy_receiver: mpsc::Receiver<JoyMessage>,
    ) -> Self {
        let (controller, goal_events) = TeleopController::new(config.teleop.clone(), client);
        info!(
            "Node {} listening on {} (queue depth {})",
            config.node.node_name, config.node.joy_topic, config.node.joy_queue_depth
        );
        Self {
            name: config.node.node_name.clone(),
            controller,
            joy_receiver,
            goal_events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn controller(&self) -> &TeleopController {
        &self.controller
    }
}

/// Runs the node until `shutdown` fires
///
/// A closed joystick stream does not stop the node; goal events keep being
/// handled until shutdown. Returns the final controller summary.
pub async fn spin(mut context: TeleopContext, shutdown: CancellationToken) -> ControllerState {
    info!("Node {} spinning", context.name);
    let mut joy_open = true;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Node {} shutting down", context.name);
                break;
            }
            sample = context.joy_receiver.recv(), if joy_open => match sample {
                Some(sample) => {
                    context.controller.on_input_sample(&sample).await;
                }
                None => {
                    warn!("Joystick stream closed, no further goals will be sent");
                    joy_open = false;
                }
            },
            Some(event) = context.goal_events.recv() => {
                context.controller.handle_goal_event(event);
            }
        }
    }

    context.controller.shutdown().await;
    let state = context.controller.state();
    debug!("Final state of {}: {:?}", context.name, state);
    state
}
