use chrono::{DateTime, Local};
use gilrs::{Axis, Button, Event, EventType, Gamepad, GamepadId, Gilrs};
use serde::{Deserialize, Serialize};
use statum::{machine, state};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::JoystickConfig;

/// Number of axes in a joy message: left stick X/Y, left trigger,
/// right stick X/Y, right trigger
pub const AXIS_COUNT: usize = 6;
pub const BUTTON_COUNT: usize = 11;
/// Largest usable deadzone, leaves room for the rescale
const MAX_DEADZONE: f32 = 0.95;

/// Snapshot of all joystick axes and buttons
///
/// Axes are ordered `[LeftX, LeftY, LeftZ, RightX, RightY, RightZ]`, sticks
/// in `[-1.0, 1.0]` with Y positive up. Buttons are `1` while pressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoyMessage {
    pub axes: Vec<f32>,
    pub buttons: Vec<i32>,
    pub stamp: DateTime<Local>,
}

impl JoyMessage {
    pub fn from_axes(axes: Vec<f32>) -> Self {
        Self {
            axes,
            buttons: Vec::new(),
            stamp: Local::now(),
        }
    }

    pub fn axis(&self, index: usize) -> Option<f32> {
        self.axes.get(index).copied()
    }
}

// Collector errors
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("Failed to initialize collector: {0}")]
    InitializationError(String),
}

#[state]
#[derive(Debug, Clone)]
pub enum CollectionState {
    Initializing,
    Collecting,
}

#[machine]
pub struct EventCollector<S: CollectionState> {
    gilrs: Gilrs,

    // Only events from this gamepad are published once set
    active_gamepad: Option<GamepadId>,

    settings: JoystickConfig,

    joy_sender: mpsc::Sender<JoyMessage>,

    // Latest value of every axis and button
    axes: [f32; AXIS_COUNT],
    buttons: [i32; BUTTON_COUNT],
}

impl EventCollector<Initializing> {
    pub fn create(
        settings: Option<JoystickConfig>,
        joy_sender: mpsc::Sender<JoyMessage>,
    ) -> Result<Self, CollectorError> {
        let mut settings = settings.unwrap_or_default();
        let deadzone = clamp_deadzone(settings.deadzone);
        if deadzone != settings.deadzone {
            warn!(
                "Deadzone {} out of range, using {}",
                settings.deadzone, deadzone
            );
            settings.deadzone = deadzone;
        }
        debug!("Creating joystick collector with settings: {:?}", settings);

        info!("Initializing gilrs controller interface");
        let gilrs = match Gilrs::new() {
            Ok(g) => {
                info!("Successfully initialized gilrs");
                g
            }
            Err(e) => {
                error!("Failed to initialize gilrs: {}", e);
                return Err(CollectorError::InitializationError(e.to_string()));
            }
        };

        Ok(Self::new(
            gilrs,
            None,
            settings,
            joy_sender,
            [0.0; AXIS_COUNT],
            [0; BUTTON_COUNT],
        ))
    }

    // Pick a gamepad and transition to Collecting state
    pub fn initialize(mut self) -> EventCollector<Collecting> {
        let gamepads: Vec<(GamepadId, Gamepad<'_>)> = self.gilrs.gamepads().collect();

        if gamepads.is_empty() {
            warn!("No gamepad connected, continuing in idle mode");
        } else {
            info!("Found {} gamepads:", gamepads.len());
            for (idx, (id, gamepad)) in gamepads.iter().enumerate() {
                info!("  [{}] ID: {}, Name: {}", idx, id, gamepad.name());
            }
            let (id, gamepad) = &gamepads[0];
            self.active_gamepad = Some(*id);
            info!("Selected gamepad: {} ({})", gamepad.name(), id);
        }

        info!(
            "Joystick collector initialized with deadzone {}, collecting",
            self.settings.deadzone
        );
        self.transition()
    }
}

impl EventCollector<Collecting> {
    /// Handles at most one pending gilrs event
    ///
    /// Returns `false` once the subscriber is gone.
    pub fn collect_next_event(&mut self) -> bool {
        let Some(Event { id, event, .. }) = self.gilrs.next_event() else {
            return !self.joy_sender.is_closed();
        };

        match self.active_gamepad {
            Some(active_id) if id != active_id => {
                debug!("Skipping event from non-active gamepad: {:?}", id);
                return true;
            }
            None => {
                info!("Adopting gamepad {} as active", id);
                self.active_gamepad = Some(id);
            }
            _ => {}
        }

        if !self.apply_event(event) {
            return true;
        }

        let message = JoyMessage {
            axes: self.axes.to_vec(),
            buttons: self.buttons.to_vec(),
            stamp: Local::now(),
        };
        match self.joy_sender.try_send(message) {
            Ok(_) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Joy queue full, dropping sample");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                info!("Joy subscriber gone");
                false
            }
        }
    }

    /// Polls until the subscriber is gone
    pub fn run_collection_loop(&mut self) {
        info!("Starting joystick collection loop");
        let poll_interval = std::time::Duration::from_millis(self.settings.poll_interval_ms);

        while self.collect_next_event() {
            std::thread::sleep(poll_interval);
        }
        info!("Joystick collection loop finished");
    }

    // Updates the snapshot, true if it changed
    fn apply_event(&mut self, event: EventType) -> bool {
        match event {
            EventType::AxisChanged(axis, value, _) => {
                let Some(index) = axis_index(axis) else {
                    debug!("Ignoring unsupported axis: {:?}", axis);
                    return false;
                };
                let value = if is_trigger(index) {
                    value
                } else {
                    apply_deadzone(value, self.settings.deadzone)
                };
                if self.axes[index] == value {
                    return false;
                }
                debug!("Axis {} ({:?}) = {:.4}", index, axis, value);
                self.axes[index] = value;
                true
            }
            EventType::ButtonPressed(button, _) => self.set_button(button, 1),
            EventType::ButtonReleased(button, _) => self.set_button(button, 0),
            EventType::Connected => {
                info!("Controller connected event detected");
                false
            }
            EventType::Disconnected => {
                warn!("Controller disconnected, centering axes");
                self.axes = [0.0; AXIS_COUNT];
                self.buttons = [0; BUTTON_COUNT];
                self.active_gamepad = None;
                true
            }
            _ => {
                debug!("Unhandled event type: {:?}", event);
                false
            }
        }
    }

    fn set_button(&mut self, button: Button, value: i32) -> bool {
        let Some(index) = button_index(button) else {
            debug!("Ignoring unmapped button: {:?}", button);
            return false;
        };
        if self.buttons[index] == value {
            return false;
        }
        debug!("Button {} ({:?}) = {}", index, button, value);
        self.buttons[index] = value;
        true
    }
}

fn axis_index(axis: Axis) -> Option<usize> {
    match axis {
        Axis::LeftStickX => Some(0),
        Axis::LeftStickY => Some(1),
        Axis::LeftZ => Some(2),
        Axis::RightStickX => Some(3),
        Axis::RightStickY => Some(4),
        Axis::RightZ => Some(5),
        _ => None,
    }
}

fn is_trigger(index: usize) -> bool {
    index == 2 || index == 5
}

fn button_index(button: Button) -> Option<usize> {
    match button {
        Button::South => Some(0),
        Button::East => Some(1),
        Button::West => Some(2),
        Button::North => Some(3),
        Button::LeftTrigger => Some(4),
        Button::RightTrigger => Some(5),
        Button::Select => Some(6),
        Button::Start => Some(7),
        Button::Mode => Some(8),
        Button::LeftThumb => Some(9),
        Button::RightThumb => Some(10),
        _ => None,
    }
}

fn clamp_deadzone(deadzone: f32) -> f32 {
    if deadzone.is_nan() {
        return 0.0;
    }
    deadzone.clamp(0.0, MAX_DEADZONE)
}

// Rescales the value to the range outside the deadzone
fn apply_deadzone(value: f32, deadzone: f32) -> f32 {
    if value.abs() < deadzone {
        0.0
    } else {
        let sign = if value < 0.0 { -1.0 } else { 1.0 };
        sign * (value.abs() - deadzone) / (1.0 - deadzone)
    }
}
