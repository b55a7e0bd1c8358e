//! Jail identity and state
//!
//! This module provides:
//! - FFI lookup of running jails
//! - Jail records (where a jail lives) and reference resolution
//! - The lifecycle state machine

pub mod ffi;
pub mod record;
pub mod resolve;
pub mod state;

pub use record::{JailRecord, Location};
pub use state::JailState;
