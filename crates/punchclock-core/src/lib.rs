//! # punchclock core
//!
//! Shared configuration and the error taxonomy used by the scheduler,
//! the gateway and the CLI.

pub mod config;
pub mod error;

pub use config::PunchConfig;
pub use error::{PunchError, Result};
