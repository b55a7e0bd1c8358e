//! Deterministic MAC addresses for epair interfaces
//!
//! The host side of a jail's NIC gets `prefix + sha256(uuid + nic)[..3]`,
//! the jail side that value plus one. The same jail and NIC always get the
//! same pair, so DHCP reservations survive restarts.

use sha2::{Digest, Sha256};

const MASK_48: u64 = 0xffff_ffff_ffff;

/// Host-side and jail-side MACs as 12 lowercase hex digits
pub fn derive_mac(uuid: &str, nic: &str, prefix: &str) -> (String, String) {
    let digest = Sha256::digest(format!("{}{}", uuid, nic).as_bytes());
    let suffix = hex::encode(&digest[..3]);
    let a = format!("{}{}", prefix.to_ascii_lowercase(), suffix);
    let value = u64::from_str_radix(&a, 16).unwrap_or(0);
    let b = format!("{:012x}", (value + 1) & MASK_48);
    (a, b)
}

/// `aabbccddeeff` as `aa:bb:cc:dd:ee:ff`, the form ifconfig takes
pub fn colon_form(mac: &str) -> String {
    let digits: String = mac.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    digits
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).to_string())
        .collect::<Vec<_>>()
        .join(":")
}
