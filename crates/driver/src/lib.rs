//! usb-gamepad driver core
//!
//! Binds one USB gamepad interface, keeps an interrupt-in poll loop running,
//! publishes decoded reports to an input sink and throttles outbound reports.
//! The bus is reached through [`common::Transport`]; [`usb::RusbTransport`]
//! is the libusb-backed implementation used by the `usb-gamepad` binary.

pub mod config;
pub mod usb;
