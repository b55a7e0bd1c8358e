//! Parsers for host command output
//!
//! Text produced by ifconfig, route, zfs, devfs and jls is only ever read
//! through these functions. Each parser is strict about the shape it
//! accepts and is tested against captured output.

pub mod devfs;
pub mod ifconfig;
pub mod jls;
pub mod route;
pub mod zfs;
