//! Plain G-code line protocol
//!
//! The parser turns firmware lines into typed responses; the controller
//! drives one link with single in-flight flow control.

pub mod controller;
pub mod parser;

pub use controller::{FirmwareInfo, TextController, TextControllerConfig, TextEvent};
pub use parser::{parse_position, parse_temperature, MarlinParser, MarlinResponse, TemperatureReport};
