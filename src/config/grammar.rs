//! Mini-grammars for structured property values
//!
//! - `nat_forwards`: `tcp(80:8080),udp(53),8443`
//! - rctl limits: `deny=4G` (legacy `4G:deny` is accepted)
//! - `interfaces`: `vnet0:bridge0,vnet1:bridge1`
//! - `vnetN_mac`: two distinct MAC addresses
//! - `cpuset`: `0,2-3`

use crate::error::{Error, Result};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, digit1, one_of},
    combinator::{all_consuming, map, opt},
    sequence::{delimited, pair, preceded, separated_pair},
    Parser,
};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// Transport protocol of a NAT forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
    TcpUdp,
}

impl Proto {
    /// Individual protocols this forward expands to
    pub fn expand(&self) -> &'static [&'static str] {
        match self {
            Proto::Tcp => &["tcp"],
            Proto::Udp => &["udp"],
            Proto::TcpUdp => &["tcp", "udp"],
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Tcp => write!(f, "tcp"),
            Proto::Udp => write!(f, "udp"),
            Proto::TcpUdp => write!(f, "tcp/udp"),
        }
    }
}

/// One port forward from the host into a NAT jail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatForward {
    pub proto: Proto,
    pub jail_port: u16,
    pub host_port: u16,
}

impl fmt::Display for NatForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.jail_port == self.host_port {
            write!(f, "{}({})", self.proto, self.jail_port)
        } else {
            write!(f, "{}({}:{})", self.proto, self.jail_port, self.host_port)
        }
    }
}

fn number(input: &str) -> nom::IResult<&str, u64> {
    map(digit1, |d: &str| d.parse::<u64>().unwrap_or(u64::MAX)).parse(input)
}

fn proto(input: &str) -> nom::IResult<&str, Proto> {
    alt((
        map(tag("tcp/udp"), |_| Proto::TcpUdp),
        map(tag("tcp"), |_| Proto::Tcp),
        map(tag("udp"), |_| Proto::Udp),
    ))
    .parse(input)
}

fn ports(input: &str) -> nom::IResult<&str, (u64, Option<u64>)> {
    pair(number, opt(preceded(char(':'), number))).parse(input)
}

fn forward(input: &str) -> nom::IResult<&str, (Proto, (u64, Option<u64>))> {
    alt((
        pair(proto, delimited(char('('), ports, char(')'))),
        map(number, |p| (Proto::Tcp, (p, None))),
    ))
    .parse(input)
}

fn port(value: u64, spec: &str) -> Result<u16> {
    if (1..=65535).contains(&value) {
        Ok(value as u16)
    } else {
        Err(Error::invalid_value(
            "nat_forwards",
            format!("port {} out of range 1-65535 in '{}'", value, spec),
        ))
    }
}

/// Parse a `nat_forwards` value; `none` yields no forwards
pub fn parse_nat_forwards(value: &str) -> Result<Vec<NatForward>> {
    let value = value.trim();
    if value.is_empty() || value == "none" {
        return Ok(Vec::new());
    }

    let mut forwards = Vec::new();
    for spec in value.split(',').map(str::trim) {
        let (_, (proto, (jail, host))) = all_consuming(forward)
            .parse(spec)
            .map_err(|_| {
                Error::invalid_value(
                    "nat_forwards",
                    format!("'{}' is not proto(jailport[:hostport]) or a port", spec),
                )
            })?;
        let jail_port = port(jail, spec)?;
        let host_port = port(host.unwrap_or(jail), spec)?;
        forwards.push(NatForward {
            proto,
            jail_port,
            host_port,
        });
    }
    Ok(forwards)
}

/// Action taken when an rctl limit is hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RctlAction {
    Deny,
    Log,
    Devctl,
    Signal,
    Throttle,
}

impl fmt::Display for RctlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RctlAction::Deny => "deny",
            RctlAction::Log => "log",
            RctlAction::Devctl => "devctl",
            RctlAction::Signal => "sigterm",
            RctlAction::Throttle => "throttle",
        };
        write!(f, "{}", s)
    }
}

/// A parsed rctl limit value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RctlLimit {
    pub action: RctlAction,
    pub amount: u64,
    pub unit: Option<char>,
}

impl RctlLimit {
    /// Amount with its unit suffix, as rctl(8) expects it
    pub fn amount_text(&self) -> String {
        match self.unit {
            Some(u) => format!("{}{}", self.amount, u),
            None => self.amount.to_string(),
        }
    }
}

impl fmt::Display for RctlLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self.action {
            RctlAction::Signal => "signal".to_string(),
            other => other.to_string(),
        };
        write!(f, "{}={}", action, self.amount_text())
    }
}

fn rctl_action(input: &str) -> nom::IResult<&str, RctlAction> {
    alt((
        map(tag("deny"), |_| RctlAction::Deny),
        map(tag("log"), |_| RctlAction::Log),
        map(tag("devctl"), |_| RctlAction::Devctl),
        map(tag("signal"), |_| RctlAction::Signal),
        map(tag("throttle"), |_| RctlAction::Throttle),
    ))
    .parse(input)
}

fn rctl_amount(input: &str) -> nom::IResult<&str, (u64, Option<char>)> {
    pair(number, opt(one_of("kKmMgGtTpPeE"))).parse(input)
}

fn rctl_value(input: &str) -> nom::IResult<&str, (RctlAction, (u64, Option<char>))> {
    alt((
        separated_pair(rctl_action, char('='), rctl_amount),
        map(
            separated_pair(rctl_amount, char(':'), rctl_action),
            |(amount, action)| (action, amount),
        ),
    ))
    .parse(input)
}

/// Keys whose amount is a count or a time and takes no unit suffix
pub const UNITLESS_RCTL: &[&str] = &[
    "maxproc",
    "openfiles",
    "pseudoterminals",
    "nthr",
    "msgqqueued",
    "nmsgq",
    "nsemop",
    "nshm",
    "pcpu",
    "cputime",
    "wallclock",
    "readiops",
    "writeiops",
];

/// Keys that accept the throttle action
pub const THROTTLE_RCTL: &[&str] = &["readbps", "writebps", "readiops", "writeiops"];

/// Parse an rctl limit for `key`; `off` yields None
pub fn parse_rctl(key: &str, value: &str) -> Result<Option<RctlLimit>> {
    let value = value.trim();
    if value == "off" || value == "none" {
        return Ok(None);
    }

    let (_, (action, (amount, unit))) = all_consuming(rctl_value)
        .parse(value)
        .map_err(|_| {
            Error::invalid_value(
                key,
                format!(
                    "'{}' must be off or ACTION=AMOUNT with ACTION one of deny, log, devctl, signal, throttle",
                    value
                ),
            )
        })?;

    if action == RctlAction::Throttle && !THROTTLE_RCTL.contains(&key) {
        return Err(Error::invalid_value(
            key,
            format!("throttle is only valid for {}", THROTTLE_RCTL.join(", ")),
        ));
    }
    if unit.is_some() && UNITLESS_RCTL.contains(&key) {
        return Err(Error::invalid_value(
            key,
            format!("'{}' does not take a unit suffix", key),
        ));
    }

    Ok(Some(RctlLimit {
        action,
        amount,
        unit: unit.map(|u| u.to_ascii_lowercase()),
    }))
}

fn ifname(input: &str) -> nom::IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.').parse(input)
}

/// Parse `interfaces` into (nic, bridge) pairs
pub fn parse_interfaces(value: &str) -> Result<Vec<(String, String)>> {
    let value = value.trim();
    if value == "none" {
        return Ok(Vec::new());
    }

    let mut pairs: Vec<(String, String)> = Vec::new();
    for spec in value.split(',').map(str::trim) {
        let (_, (nic, bridge)) = all_consuming(separated_pair(ifname, char(':'), ifname))
            .parse(spec)
            .map_err(|_| {
                Error::invalid_value(
                    "interfaces",
                    format!(
                        "'{}' is not a nic:bridge pair (example: vnet0:bridge0, vnet1:bridge1)",
                        spec
                    ),
                )
            })?;
        if pairs.iter().any(|(n, _)| n == nic) {
            return Err(Error::invalid_value(
                "interfaces",
                format!("'{}' is listed twice", nic),
            ));
        }
        pairs.push((nic.to_string(), bridge.to_string()));
    }
    Ok(pairs)
}

static MAC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{2}[-:]?[0-9a-f]{2}(?:[-:]?[0-9a-f]{2}){4}$").unwrap());

fn valid_mac(mac: &str) -> bool {
    if !MAC_RE.is_match(mac) {
        return false;
    }
    // Reject mixed separators, which the pattern alone lets through
    let seps: Vec<char> = mac.chars().filter(|c| *c == ':' || *c == '-').collect();
    seps.is_empty() || (seps.len() == 5 && seps.iter().all(|c| *c == seps[0]))
}

/// Parse a `vnetN_mac` pair; `none` or empty yields None
pub fn parse_mac_pair(key: &str, value: &str) -> Result<Option<(String, String)>> {
    let value = value.trim().to_ascii_lowercase();
    if value.is_empty() || value == "none" {
        return Ok(None);
    }

    let macs: Vec<&str> = value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .collect();

    let err = || {
        Error::invalid_value(
            key,
            "expected two valid and different space/comma-delimited MAC addresses",
        )
    };
    if macs.len() != 2 || macs[0] == macs[1] || !macs.iter().all(|m| valid_mac(m)) {
        return Err(err());
    }
    Ok(Some((macs[0].to_string(), macs[1].to_string())))
}

/// Parse a cpuset list, checking every id against the host CPU count
pub fn parse_cpuset(value: &str, ncpu: u32) -> Result<Option<Vec<u32>>> {
    let value = value.trim();
    if value == "off" {
        return Ok(None);
    }

    let bad = |msg: String| Error::invalid_value("cpuset", msg);
    let mut cpus = Vec::new();
    for part in value.split(',').map(str::trim) {
        let (lo, hi) = match part.split_once('-') {
            Some((a, b)) => (a, b),
            None => (part, part),
        };
        let lo: u32 = lo
            .parse()
            .map_err(|_| bad(format!("'{}' is not a CPU id or range", part)))?;
        let hi: u32 = hi
            .parse()
            .map_err(|_| bad(format!("'{}' is not a CPU id or range", part)))?;
        if lo > hi {
            return Err(bad(format!("range '{}' is reversed", part)));
        }
        if hi >= ncpu {
            return Err(bad(format!(
                "CPU {} does not exist (host has {} CPUs)",
                hi, ncpu
            )));
        }
        cpus.extend(lo..=hi);
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(Some(cpus))
}
