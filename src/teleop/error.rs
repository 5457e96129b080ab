use std::time::Duration;
use thiserror::Error;

use crate::action::ActionError;

/// Failures of the teleop controller
///
/// None of these stop the node; they are logged and the offending sample or
/// goal is dropped.
#[derive(Debug, Error)]
pub enum TeleopError {
    #[error("Action server not available after waiting {waited:?} for {action_name}")]
    ServerUnavailable {
        action_name: String,
        waited: Duration,
    },

    #[error("Joy message has {axis_count} axes, axis {axis_index} is missing")]
    InvalidSample { axis_index: usize, axis_count: usize },

    #[error("Action transport error: {0}")]
    Action(#[from] ActionError),

    #[error("Invalid goal state transition: {0}")]
    InvalidTransition(String),
}
