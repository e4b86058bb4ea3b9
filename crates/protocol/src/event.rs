//! Events published to the input-event consumer

use crate::capabilities::{Axis, Button};
use serde::{Deserialize, Serialize};

/// One input event, evdev style
///
/// A report is published as a run of `Key`/`Abs` events terminated by
/// `Sync`; the consumer applies the run atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputEvent {
    Key { button: Button, pressed: bool },
    Abs { axis: Axis, value: i32 },
    Sync,
}

impl InputEvent {
    /// evdev `(type, code, value)` triple
    pub fn as_evdev(&self) -> (u16, u16, i32) {
        const EV_SYN: u16 = 0x00;
        const EV_KEY: u16 = 0x01;
        const EV_ABS: u16 = 0x03;

        match *self {
            InputEvent::Key { button, pressed } => (EV_KEY, button.code(), pressed as i32),
            InputEvent::Abs { axis, value } => (EV_ABS, axis.code(), value),
            InputEvent::Sync => (EV_SYN, 0, 0),
        }
    }
}
