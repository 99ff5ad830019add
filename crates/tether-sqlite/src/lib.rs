//! `tether-sqlite` — the shared SQLite connection handed out by a
//! [`tether_lease::ReservationRegistry`].

pub mod connection;
pub mod error;

pub use connection::{SqliteConnection, SqliteFactory};
pub use error::{Result, SqliteError};
