//! Input report layout and decoder
//!
//! The pad sends a fixed 64-byte report on its interrupt-in endpoint:
//!
//! ```text
//! offset  contents
//! ──────  ────────────────────────────────────────────────────────────
//!   2     dpad up/down/left/right (bits 0-3), start, select, L3, R3
//!   3     LB, RB, mode, -, A, B, X, Y
//!   4     left trigger  (u8)
//!   5     right trigger (u8)
//!   6     left stick X  (i16 LE)
//!   8     left stick Y  (i16 LE, exposed bitwise-inverted)
//!  10     right stick X (i16 LE)
//!  12     right stick Y (i16 LE, exposed bitwise-inverted)
//! ```
//!
//! The Y axes are inverted with one's complement (`!raw`), not negation, so
//! `-32768` becomes `32767` and `0` becomes `-1`. The pad's own driver does
//! the same; whether that is intended has not been verified on hardware, so
//! it is reproduced exactly.

use crate::capabilities::{Axis, Button};
use crate::event::InputEvent;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Fixed report length for both directions
pub const REPORT_LEN: usize = 64;

const BUTTONS_LOW: usize = 2;
const BUTTONS_HIGH: usize = 3;
const TRIGGER_LEFT: usize = 4;
const TRIGGER_RIGHT: usize = 5;
const LEFT_X: usize = 6;
const LEFT_Y: usize = 8;
const RIGHT_X: usize = 10;
const RIGHT_Y: usize = 12;

/// Report byte and bit mask carrying a button
const fn button_bit(button: Button) -> (usize, u8) {
    match button {
        Button::DpadUp => (BUTTONS_LOW, 0x01),
        Button::DpadDown => (BUTTONS_LOW, 0x02),
        Button::DpadLeft => (BUTTONS_LOW, 0x04),
        Button::DpadRight => (BUTTONS_LOW, 0x08),
        Button::Start => (BUTTONS_LOW, 0x10),
        Button::Select => (BUTTONS_LOW, 0x20),
        Button::ThumbLeft => (BUTTONS_LOW, 0x40),
        Button::ThumbRight => (BUTTONS_LOW, 0x80),
        Button::BumperLeft => (BUTTONS_HIGH, 0x01),
        Button::BumperRight => (BUTTONS_HIGH, 0x02),
        Button::Mode => (BUTTONS_HIGH, 0x04),
        Button::A => (BUTTONS_HIGH, 0x10),
        Button::B => (BUTTONS_HIGH, 0x20),
        Button::X => (BUTTONS_HIGH, 0x40),
        Button::Y => (BUTTONS_HIGH, 0x80),
    }
}

/// Button and axis state carried by one input report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedReport {
    /// Raw button bytes (offsets 2 and 3), kept as-is
    buttons: [u8; 2],
    pub trigger_left: u8,
    pub trigger_right: u8,
    pub left_x: i16,
    pub left_y: i16,
    pub right_x: i16,
    pub right_y: i16,
}

impl DecodedReport {
    /// Whether `button` is held in this report
    pub fn pressed(&self, button: Button) -> bool {
        let (offset, mask) = button_bit(button);
        self.buttons[offset - BUTTONS_LOW] & mask != 0
    }

    /// Axis value as exposed to the consumer
    pub fn axis(&self, axis: Axis) -> i32 {
        match axis {
            Axis::LeftX => self.left_x.into(),
            Axis::LeftY => self.left_y.into(),
            Axis::RightX => self.right_x.into(),
            Axis::RightY => self.right_y.into(),
            Axis::TriggerLeft => self.trigger_left.into(),
            Axis::TriggerRight => self.trigger_right.into(),
        }
    }

    /// Buttons currently held, in capability order
    pub fn held(&self) -> impl Iterator<Item = Button> + '_ {
        crate::BUTTONS.into_iter().filter(|b| self.pressed(*b))
    }

    /// Full event frame for this report: every key, every axis, then a sync
    ///
    /// The consumer is expected to filter unchanged values the way evdev does.
    pub fn events(&self) -> Vec<InputEvent> {
        let mut events = Vec::with_capacity(crate::BUTTONS.len() + crate::AXES.len() + 1);
        events.extend(crate::BUTTONS.into_iter().map(|button| InputEvent::Key {
            button,
            pressed: self.pressed(button),
        }));
        events.extend(crate::AXES.into_iter().map(|axis| InputEvent::Abs {
            axis,
            value: self.axis(axis),
        }));
        events.push(InputEvent::Sync);
        events
    }
}

/// Decode a full input report
///
/// Pure and total: every 64-byte input yields a report.
pub fn decode(data: &[u8; REPORT_LEN]) -> DecodedReport {
    DecodedReport {
        buttons: [data[BUTTONS_LOW], data[BUTTONS_HIGH]],
        trigger_left: data[TRIGGER_LEFT],
        trigger_right: data[TRIGGER_RIGHT],
        left_x: LittleEndian::read_i16(&data[LEFT_X..LEFT_X + 2]),
        left_y: !LittleEndian::read_i16(&data[LEFT_Y..LEFT_Y + 2]),
        right_x: LittleEndian::read_i16(&data[RIGHT_X..RIGHT_X + 2]),
        right_y: !LittleEndian::read_i16(&data[RIGHT_Y..RIGHT_Y + 2]),
    }
}

/// Decode a possibly short read
///
/// Missing bytes read as zero and bytes past [`REPORT_LEN`] are ignored.
pub fn decode_slice(data: &[u8]) -> DecodedReport {
    let mut report = [0u8; REPORT_LEN];
    let len = data.len().min(REPORT_LEN);
    report[..len].copy_from_slice(&data[..len]);
    decode(&report)
}
