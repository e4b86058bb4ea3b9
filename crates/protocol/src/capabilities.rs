//! Capability tags announced to the input-event consumer
//!
//! The gamepad exposes a fixed set of keys and absolute axes. The codes are
//! the Linux evdev codes so that a consumer backed by uinput/evdev can use
//! them unchanged.

use serde::{Deserialize, Serialize};

/// Digital button reported by the gamepad
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Button {
    A,
    B,
    X,
    Y,
    Start,
    Select,
    Mode,
    ThumbLeft,
    ThumbRight,
    BumperLeft,
    BumperRight,
    /// D-pad directions are discrete keys, not a hat axis
    DpadLeft,
    DpadRight,
    DpadUp,
    DpadDown,
}

impl Button {
    /// evdev key code (`BTN_*`)
    pub const fn code(self) -> u16 {
        match self {
            Button::A => 0x130,
            Button::B => 0x131,
            Button::X => 0x133,
            Button::Y => 0x134,
            Button::BumperLeft => 0x136,
            Button::BumperRight => 0x137,
            Button::Select => 0x13a,
            Button::Start => 0x13b,
            Button::Mode => 0x13c,
            Button::ThumbLeft => 0x13d,
            Button::ThumbRight => 0x13e,
            // BTN_TRIGGER_HAPPY1..4
            Button::DpadLeft => 0x2c0,
            Button::DpadRight => 0x2c1,
            Button::DpadUp => 0x2c2,
            Button::DpadDown => 0x2c3,
        }
    }
}

/// Absolute axis reported by the gamepad
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    LeftX,
    LeftY,
    RightX,
    RightY,
    TriggerLeft,
    TriggerRight,
}

impl Axis {
    /// evdev absolute axis code (`ABS_*`)
    pub const fn code(self) -> u16 {
        match self {
            Axis::LeftX => 0x00,
            Axis::LeftY => 0x01,
            Axis::TriggerLeft => 0x02,
            Axis::RightX => 0x03,
            Axis::RightY => 0x04,
            Axis::TriggerRight => 0x05,
        }
    }

    /// Range and noise parameters registered for this axis
    pub const fn info(self) -> AbsInfo {
        match self {
            Axis::LeftX | Axis::LeftY | Axis::RightX | Axis::RightY => AbsInfo {
                min: -32768,
                max: 32767,
                fuzz: 16,
                flat: 128,
            },
            Axis::TriggerLeft | Axis::TriggerRight => AbsInfo {
                min: 0,
                max: 255,
                fuzz: 0,
                flat: 0,
            },
        }
    }
}

/// Absolute axis parameters, as in `struct input_absinfo`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbsInfo {
    pub min: i32,
    pub max: i32,
    pub fuzz: i32,
    pub flat: i32,
}

/// Keys in registration order: face/meta buttons, then the d-pad
pub const BUTTONS: [Button; 15] = [
    Button::A,
    Button::B,
    Button::X,
    Button::Y,
    Button::Start,
    Button::Select,
    Button::Mode,
    Button::ThumbLeft,
    Button::ThumbRight,
    Button::BumperLeft,
    Button::BumperRight,
    Button::DpadLeft,
    Button::DpadRight,
    Button::DpadUp,
    Button::DpadDown,
];

/// Axes in registration order: triggers, then the two sticks
pub const AXES: [Axis; 6] = [
    Axis::TriggerLeft,
    Axis::TriggerRight,
    Axis::LeftX,
    Axis::LeftY,
    Axis::RightX,
    Axis::RightY,
];

/// Capability set handed to a sink at registration time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub buttons: &'static [Button],
    pub axes: &'static [Axis],
}

impl Capabilities {
    /// The fixed gamepad capability set
    pub const fn gamepad() -> Self {
        Self {
            buttons: &BUTTONS,
            axes: &AXES,
        }
    }

    pub fn has_button(&self, button: Button) -> bool {
        self.buttons.contains(&button)
    }

    pub fn has_axis(&self, axis: Axis) -> bool {
        self.axes.contains(&axis)
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::gamepad()
    }
}
