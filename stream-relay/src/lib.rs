//! stream-relay library crate.
//!
//! Supervises relay workers that forward external media sources into a
//! shared local broker, and the broker process itself.

pub mod broker;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod panic_hook;
pub mod probe;
pub mod process;
pub mod relay;
pub mod supervisor;
pub mod utils;

pub use error::{Error, Result};
pub use supervisor::{StreamSupervisor, SupervisorBuilder, SupervisorStatus};
