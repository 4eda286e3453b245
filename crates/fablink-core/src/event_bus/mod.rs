//! # Event Bus Module
//!
//! Normalized events flowing from the connection manager to its caller.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fablink_core::event_bus::{AppEvent, EventBus, EventFilter};
//!
//! let bus = EventBus::new();
//! let id = bus.subscribe(EventFilter::Names(vec!["Marlin:state"]), |event| {
//!     println!("{}", event.description());
//! });
//! bus.unsubscribe(id);
//! ```

mod bus;
mod events;

pub use bus::*;
pub use events::*;
