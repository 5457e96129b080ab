//! Joystick teleoperation of a single trajectory-controlled joint

pub mod controller;
pub mod error;
pub mod goal_task;

pub use controller::{ControllerState, GoalPhase, TeleopController};
pub use error::TeleopError;
pub use goal_task::{GoalEvent, GoalEventKind};
