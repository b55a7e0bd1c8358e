//! ifconfig(8) output

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// One interface block from `ifconfig -a`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub mtu: Option<u32>,
    pub ether: Option<String>,
    pub addresses: Vec<IpAddr>,
    /// Bridge members (`member: epair0a flags=...`)
    pub members: Vec<String>,
    pub description: Option<String>,
}

/// Parse `ifconfig -l` (space-separated names)
pub fn parse_list(output: &str) -> Vec<String> {
    output.split_whitespace().map(str::to_string).collect()
}

fn parse_header(line: &str) -> Result<(String, Option<u32>)> {
    // em0: flags=8843<UP,BROADCAST,RUNNING,SIMPLEX,MULTICAST> metric 0 mtu 1500
    let (name, rest) = line
        .split_once(": ")
        .or_else(|| line.strip_suffix(':').map(|n| (n, "")))
        .ok_or_else(|| Error::InvalidConfiguration(format!("unexpected ifconfig header: {}", line)))?;
    let mut mtu = None;
    let mut words = rest.split_whitespace();
    while let Some(word) = words.next() {
        if word == "mtu" {
            mtu = words.next().and_then(|m| m.parse().ok());
        }
    }
    Ok((name.to_string(), mtu))
}

fn strip_scope(addr: &str) -> &str {
    addr.split('%').next().unwrap_or(addr)
}

/// Parse `ifconfig -a` or `ifconfig <iface>` into interface blocks
pub fn parse_interfaces(output: &str) -> Result<Vec<InterfaceInfo>> {
    let mut interfaces: Vec<InterfaceInfo> = Vec::new();

    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if !line.starts_with(char::is_whitespace) {
            let (name, mtu) = parse_header(line)?;
            interfaces.push(InterfaceInfo {
                name,
                mtu,
                ..Default::default()
            });
            continue;
        }

        let Some(current) = interfaces.last_mut() else {
            return Err(Error::InvalidConfiguration(
                "ifconfig output starts with an indented line".into(),
            ));
        };
        let mut words = line.split_whitespace();
        match words.next() {
            Some("inet") | Some("inet6") => {
                if let Some(addr) = words.next()
                    && let Ok(ip) = strip_scope(addr).parse::<IpAddr>()
                {
                    current.addresses.push(ip);
                }
            }
            Some("ether") => current.ether = words.next().map(str::to_string),
            Some("member:") => {
                if let Some(m) = words.next() {
                    current.members.push(m.to_string());
                }
            }
            Some("description:") => {
                let text = line.trim().trim_start_matches("description:").trim();
                current.description = Some(text.to_string());
            }
            _ => {}
        }
    }

    Ok(interfaces)
}

/// Every address configured on any interface, by interface
pub fn addresses_by_interface(output: &str) -> Result<BTreeMap<String, Vec<IpAddr>>> {
    Ok(parse_interfaces(output)?
        .into_iter()
        .map(|i| (i.name, i.addresses))
        .collect())
}
