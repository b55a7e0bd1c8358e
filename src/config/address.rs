//! Address specs for `ip4_addr` / `ip6_addr`
//!
//! A value is `none` or a comma-separated list of entries, each of the form
//! `iface|ip/prefix`, `iface|ip`, `ip/prefix` or `ip`. IPv6 entries may also
//! be `iface|accept_rtadv`. The pseudo interface `DEFAULT` stands for the
//! host's default-route interface and is resolved when the value is set.

use crate::error::{Error, Result};
use std::fmt;
use std::net::IpAddr;

/// Address family of an address property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn key(&self) -> &'static str {
        match self {
            Family::V4 => "ip4_addr",
            Family::V6 => "ip6_addr",
        }
    }

    fn max_prefix(&self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }
}

/// What an entry assigns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrKind {
    Ip { addr: IpAddr, prefix: Option<u8> },
    /// Stateless autoconfiguration (IPv6, VNET only)
    AcceptRtadv,
}

/// One address entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpec {
    pub interface: Option<String>,
    pub kind: AddrKind,
}

impl AddressSpec {
    /// The IP address, if this entry carries one
    pub fn ip(&self) -> Option<IpAddr> {
        match self.kind {
            AddrKind::Ip { addr, .. } => Some(addr),
            AddrKind::AcceptRtadv => None,
        }
    }

    /// `ip/prefix` or bare `ip`, as ifconfig takes it
    pub fn address_text(&self) -> Option<String> {
        match &self.kind {
            AddrKind::Ip {
                addr,
                prefix: Some(p),
            } => Some(format!("{}/{}", addr, p)),
            AddrKind::Ip { addr, prefix: None } => Some(addr.to_string()),
            AddrKind::AcceptRtadv => None,
        }
    }
}

impl fmt::Display for AddressSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(iface) = &self.interface {
            write!(f, "{}|", iface)?;
        }
        match &self.kind {
            AddrKind::AcceptRtadv => write!(f, "accept_rtadv"),
            AddrKind::Ip { .. } => write!(f, "{}", self.address_text().unwrap_or_default()),
        }
    }
}

fn parse_entry(family: Family, entry: &str) -> Result<AddressSpec> {
    let key = family.key();
    let (interface, rest) = match entry.split_once('|') {
        Some((iface, rest)) => {
            if iface.is_empty() || iface.contains(|c: char| c.is_whitespace() || c == '/') {
                return Err(Error::invalid_value(
                    key,
                    format!("bad interface in '{}'", entry),
                ));
            }
            (Some(iface.to_string()), rest)
        }
        None => (None, entry),
    };

    if rest == "accept_rtadv" {
        if family != Family::V6 {
            return Err(Error::invalid_value(key, "accept_rtadv is IPv6 only"));
        }
        return Ok(AddressSpec {
            interface,
            kind: AddrKind::AcceptRtadv,
        });
    }

    let (addr, prefix) = match rest.split_once('/') {
        Some((a, p)) => (a, Some(p)),
        None => (rest, None),
    };

    let addr: IpAddr = addr
        .parse()
        .map_err(|_| Error::invalid_value(key, format!("'{}' is not an IP address", addr)))?;
    let matches_family = match family {
        Family::V4 => addr.is_ipv4(),
        Family::V6 => addr.is_ipv6(),
    };
    if !matches_family {
        return Err(Error::invalid_value(
            key,
            format!("'{}' is the wrong address family", addr),
        ));
    }

    let prefix = match prefix {
        Some(p) => {
            let p: u8 = p
                .parse()
                .ok()
                .filter(|p| *p <= family.max_prefix())
                .ok_or_else(|| Error::invalid_value(key, format!("bad prefix length '{}'", p)))?;
            Some(p)
        }
        None => None,
    };

    Ok(AddressSpec {
        interface,
        kind: AddrKind::Ip { addr, prefix },
    })
}

/// Parse an address property value; `none` yields an empty list
pub fn parse_addresses(family: Family, value: &str) -> Result<Vec<AddressSpec>> {
    let value = value.trim();
    if value.is_empty() || value == "none" {
        return Ok(Vec::new());
    }

    value
        .split(',')
        .map(str::trim)
        .map(|entry| parse_entry(family, entry))
        .collect()
}

/// Serialize a list back into its property form
pub fn format_addresses(specs: &[AddressSpec]) -> String {
    if specs.is_empty() {
        return "none".to_string();
    }
    specs
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Replace the `DEFAULT` interface with the host's default-route interface
pub fn resolve_default(specs: &mut [AddressSpec], default_iface: Option<&str>) -> Result<()> {
    for spec in specs.iter_mut() {
        if spec.interface.as_deref() == Some("DEFAULT") {
            let iface = default_iface.ok_or_else(|| {
                Error::invalid_value("ip4_addr", "DEFAULT used but the host has no default route")
            })?;
            spec.interface = Some(iface.to_string());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forms() {
        let specs =
            parse_addresses(Family::V4, "em0|10.0.0.5/24, 10.0.0.6,lo1|127.0.1.1").unwrap();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].interface.as_deref(), Some("em0"));
        assert_eq!(specs[0].address_text().unwrap(), "10.0.0.5/24");
        assert_eq!(specs[1].interface, None);
        assert_eq!(specs[2].ip().unwrap().to_string(), "127.0.1.1");
    }

    #[test]
    fn test_round_trip_is_equivalent() {
        for value in [
            "em0|192.168.1.10/24",
            "em0|192.168.1.10",
            "192.168.1.10",
            "vnet0|10.1.0.2/30,vnet1|10.2.0.2/30",
        ] {
            let parsed = parse_addresses(Family::V4, value).unwrap();
            let text = format_addresses(&parsed);
            assert_eq!(parse_addresses(Family::V4, &text).unwrap(), parsed);
        }

        let v6 = parse_addresses(Family::V6, "vnet0|accept_rtadv, vnet0|fd00::2/64").unwrap();
        assert_eq!(format_addresses(&v6), "vnet0|accept_rtadv,vnet0|fd00::2/64");
    }

    #[test]
    fn test_rejects() {
        assert!(parse_addresses(Family::V4, "em0|300.1.1.1").is_err());
        assert!(parse_addresses(Family::V4, "em0|10.0.0.1/33").is_err());
        assert!(parse_addresses(Family::V4, "fd00::1").is_err());
        assert!(parse_addresses(Family::V4, "|10.0.0.1").is_err());
        assert!(parse_addresses(Family::V4, "em0|accept_rtadv").is_err());
        assert!(parse_addresses(Family::V6, "em0|fd00::1/129").is_err());
    }

    #[test]
    fn test_none() {
        assert!(parse_addresses(Family::V4, "none").unwrap().is_empty());
        assert_eq!(format_addresses(&[]), "none");
    }

    #[test]
    fn test_resolve_default() {
        let mut specs = parse_addresses(Family::V4, "DEFAULT|10.0.0.5/24").unwrap();
        resolve_default(&mut specs, Some("igb0")).unwrap();
        assert_eq!(format_addresses(&specs), "igb0|10.0.0.5/24");

        let mut specs = parse_addresses(Family::V4, "DEFAULT|10.0.0.5").unwrap();
        assert!(resolve_default(&mut specs, None).is_err());
    }
}
