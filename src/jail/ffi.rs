//! FFI lookup of running jails via jail_get(2)
//!
//! The iovec construction follows libjail-rs
//! (https://github.com/fubarnetes/libjail-rs), BSD-3-Clause,
//! Copyright (c) 2018, Fabian Freyer.

use crate::error::{Error, Result};
use bitflags::bitflags;

#[cfg(target_os = "freebsd")]
macro_rules! iovec {
    ($key:expr => mut $value:expr) => {
        [iovec!($key), iovec!(mut $value)]
    };
    ($key:expr => $value:expr) => {
        [iovec!($key), iovec!($value)]
    };
    (mut $name:expr) => {
        libc::iovec {
            iov_base: $name.as_mut_ptr() as *mut libc::c_void,
            iov_len: $name.len(),
        }
    };
    ($name:expr) => {
        libc::iovec {
            iov_base: $name.as_ptr() as *mut libc::c_void,
            iov_len: $name.len(),
        }
    };
}

bitflags! {
    /// Flags for the jail_get syscall
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct JailFlags: i32 {
        /// Also match jails that are being torn down
        const DYING = 0x08;
    }
}

/// Look up the JID of a jail by kernel name
///
/// Dying jails are only matched when `flags` contains [`JailFlags::DYING`].
#[cfg(target_os = "freebsd")]
pub fn jail_getid_with(name: &str, flags: JailFlags) -> Result<i32> {
    use std::ffi::{CStr, CString};

    let mut errmsg: [u8; 256] = [0; 256];
    let name = CString::new(name)
        .map_err(|e| Error::InvalidConfiguration(format!("jail name: {}", e)))?
        .into_bytes_with_nul();

    let mut jiov: Vec<libc::iovec> = [iovec!(b"name\0" => name), iovec!(b"errmsg\0" => mut errmsg)]
        .into_iter()
        .flatten()
        .collect();

    let jid = unsafe { libc::jail_get(jiov.as_mut_ptr(), jiov.len() as u32, flags.bits()) };

    if jid >= 0 {
        return Ok(jid);
    }

    if errmsg[0] == 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    let msg = unsafe { CStr::from_ptr(errmsg.as_ptr() as *const libc::c_char) }
        .to_string_lossy()
        .to_string();
    Err(Error::NotFound(msg))
}

/// Jails only exist on FreeBSD; elsewhere no jail is ever found
#[cfg(not(target_os = "freebsd"))]
pub fn jail_getid_with(name: &str, _flags: JailFlags) -> Result<i32> {
    Err(Error::NotFound(format!("jail '{}'", name)))
}

/// Look up the JID of a live jail by kernel name
pub fn jail_getid(name: &str) -> Result<i32> {
    jail_getid_with(name, JailFlags::empty())
}
