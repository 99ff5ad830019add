//! `tether-core` — configuration, errors, and ids shared by every tether crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::{DatabaseConfig, LeaseConfig, TetherConfig};
pub use error::{Result, TetherError};
pub use types::TaskId;
