//! Joystick input for teleoperation
//!
//! ```text
//! Gamepad ──► EventCollector ──► JoyMessage queue ──► TeleopNode
//!             (gilrs, deadzone)  (bounded, drops when full)
//! ```

pub mod event_collector;
pub mod joy_handle;

pub use event_collector::{CollectorError, JoyMessage};
pub use joy_handle::JoyHandle;
