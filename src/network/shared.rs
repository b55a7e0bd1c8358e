//! Shared-stack networking
//!
//! A jail without VNET gets its addresses as aliases on host interfaces.
//! jail(8) adds them from `ip4.addr`/`ip6.addr`; stop takes them off again.

use super::epair::ifconfig;
use crate::config::address::{AddrKind, AddressSpec};
use crate::error::{Error, Result};
use crate::host::Host;

/// Give every entry an interface, falling back to the default-route one
pub fn resolve_interfaces(specs: &mut [AddressSpec], default_iface: Option<&str>) -> Result<()> {
    for spec in specs.iter_mut() {
        if matches!(spec.kind, AddrKind::AcceptRtadv) {
            return Err(Error::invalid_value(
                "ip6_addr",
                "accept_rtadv requires vnet=on",
            ));
        }
        if spec.interface.is_none() || spec.interface.as_deref() == Some("DEFAULT") {
            let iface = default_iface.ok_or_else(|| {
                Error::invalid_value(
                    "ip4_addr",
                    format!("'{}' has no interface and the host has no default route", spec),
                )
            })?;
            spec.interface = Some(iface.to_string());
        }
    }
    Ok(())
}

/// Remove the aliases of a stopped jail
///
/// An address that is already gone is skipped.
pub fn remove_aliases(host: &dyn Host, specs: &[AddressSpec]) -> Vec<Error> {
    let mut errors = Vec::new();
    for spec in specs {
        let (Some(iface), Some(ip)) = (spec.interface.as_deref(), spec.ip()) else {
            continue;
        };
        let family = if ip.is_ipv4() { "inet" } else { "inet6" };
        match ifconfig(host, [iface, family, &ip.to_string(), "-alias"]) {
            Ok(_) => tracing::debug!(interface = iface, address = %ip, "alias removed"),
            Err(Error::ExternalProcess { output, .. })
                if output.contains("Can't assign requested address") => {}
            Err(e) => errors.push(e),
        }
    }
    errors
}
