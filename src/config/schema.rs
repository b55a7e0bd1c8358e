//! Property registry
//!
//! Every jail property is declared once in [`PROPERTIES`] with its value
//! shape, its default provider, where it is stored and how it is read.
//! Lookups go through [`lookup`]; nothing dispatches on property names by
//! reflection.

use super::address::{self, Family};
use super::grammar;
use crate::error::{Error, Result};
use std::net::IpAddr;

/// Token family a boolean-like property is normalized to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolFamily {
    OnOff,
    YesNo,
    OneZero,
}

impl BoolFamily {
    pub fn tokens(&self) -> (&'static str, &'static str) {
        match self {
            BoolFamily::OnOff => ("on", "off"),
            BoolFamily::YesNo => ("yes", "no"),
            BoolFamily::OneZero => ("1", "0"),
        }
    }

    /// Canonical token for any boolean spelling
    pub fn normalize(&self, value: &str) -> Option<&'static str> {
        let (t, f) = self.tokens();
        match value.trim().to_ascii_lowercase().as_str() {
            "on" | "yes" | "1" | "true" => Some(t),
            "off" | "no" | "0" | "false" => Some(f),
            _ => None,
        }
    }
}

/// Allowed shape of a property value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Text,
    Bool(BoolFamily),
    Choice(&'static [&'static str]),
    Number,
    Range(i64, i64),
    Addresses(Family),
    Router(Family),
    Interfaces,
    MacPair,
    MacPrefix,
    Cpuset,
    Rctl,
    NatForwards,
    NatPrefix,
    /// ZFS size with an M/G/T suffix, or none
    Size,
    VnetDefaultInterface,
    Depends,
}

/// Where a property lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// In config.json
    Config,
    /// A ZFS property on the jail dataset
    Dataset,
    /// A ZFS property that can only be read
    DatasetReadOnly,
    /// In config.json, but only written by ironcage itself
    Managed,
}

/// How a property is read back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Getter {
    Plain,
    /// `none` reads as `never`
    NeverIfNone,
    /// Read from the running jail when there is one
    LiveDevfsRuleset,
}

/// Inputs available to default providers
#[derive(Debug, Clone, Default)]
pub struct DefaultInputs<'a> {
    pub facts: Option<&'a HostFacts>,
    pub uuid: Option<&'a str>,
}

/// Source of a property's default value
#[derive(Clone, Copy)]
pub enum DefaultValue {
    Fixed(&'static str),
    Derived(fn(&DefaultInputs) -> String),
}

impl std::fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DefaultValue::Fixed(v) => write!(f, "Fixed({:?})", v),
            DefaultValue::Derived(_) => write!(f, "Derived"),
        }
    }
}

impl DefaultValue {
    pub fn resolve(&self, inputs: &DefaultInputs) -> String {
        match self {
            DefaultValue::Fixed(v) => v.to_string(),
            DefaultValue::Derived(f) => f(inputs),
        }
    }
}

/// One registry entry
#[derive(Debug, Clone, Copy)]
pub struct PropertySpec {
    pub name: &'static str,
    pub shape: Shape,
    pub default: DefaultValue,
    pub storage: Storage,
    pub getter: Getter,
    /// Refused while the jail is running
    pub needs_stopped: bool,
}

const fn prop(name: &'static str, shape: Shape, default: &'static str) -> PropertySpec {
    PropertySpec {
        name,
        shape,
        default: DefaultValue::Fixed(default),
        storage: Storage::Config,
        getter: Getter::Plain,
        needs_stopped: false,
    }
}

const fn flag(name: &'static str, default: &'static str) -> PropertySpec {
    prop(name, Shape::Bool(BoolFamily::OneZero), default)
}

const fn rctl(name: &'static str) -> PropertySpec {
    prop(name, Shape::Rctl, "off")
}

const fn managed(name: &'static str, default: &'static str) -> PropertySpec {
    PropertySpec {
        storage: Storage::Managed,
        ..prop(name, Shape::Text, default)
    }
}

const fn dataset(name: &'static str, shape: Shape, default: &'static str) -> PropertySpec {
    PropertySpec {
        storage: Storage::Dataset,
        ..prop(name, shape, default)
    }
}

const fn dataset_ro(name: &'static str) -> PropertySpec {
    PropertySpec {
        storage: Storage::DatasetReadOnly,
        ..prop(name, Shape::Text, "readonly")
    }
}

const fn stopped(spec: PropertySpec) -> PropertySpec {
    PropertySpec {
        needs_stopped: true,
        ..spec
    }
}

const fn derived(name: &'static str, shape: Shape, f: fn(&DefaultInputs) -> String) -> PropertySpec {
    PropertySpec {
        default: DefaultValue::Derived(f),
        ..prop(name, shape, "")
    }
}

const ON_OFF: Shape = Shape::Bool(BoolFamily::OnOff);
const YES_NO: Shape = Shape::Bool(BoolFamily::YesNo);
const NEW_INHERIT_NONE: Shape = Shape::Choice(&["new", "inherit", "none"]);
const NEW_INHERIT_DISABLE: Shape = Shape::Choice(&["new", "inherit", "disable"]);

fn default_hostname(inputs: &DefaultInputs) -> String {
    inputs.uuid.unwrap_or("none").to_string()
}

fn default_hostid(inputs: &DefaultInputs) -> String {
    inputs
        .facts
        .and_then(|f| f.hostid.clone())
        .unwrap_or_else(|| "none".to_string())
}

fn default_mac_prefix(inputs: &DefaultInputs) -> String {
    inputs
        .facts
        .map(|f| f.mac_prefix.clone())
        .unwrap_or_else(|| "02ff60".to_string())
}

fn default_jail_zfs_dataset(inputs: &DefaultInputs) -> String {
    match inputs.uuid {
        Some(uuid) => format!("iocage/jails/{}/data", uuid),
        None => "none".to_string(),
    }
}

/// The property registry
pub static PROPERTIES: &[PropertySpec] = &[
    // Network
    prop("interfaces", Shape::Interfaces, "vnet0:bridge0"),
    prop("host_domainname", Shape::Text, "none"),
    derived("host_hostname", Shape::Text, default_hostname),
    managed("host_hostuuid", "none"),
    prop("exec_fib", Shape::Number, "0"),
    prop("ip4_addr", Shape::Addresses(Family::V4), "none"),
    flag("ip4_saddrsel", "1"),
    prop("ip4", NEW_INHERIT_NONE, "new"),
    prop("ip6_addr", Shape::Addresses(Family::V6), "none"),
    flag("ip6_saddrsel", "1"),
    prop("ip6", NEW_INHERIT_NONE, "new"),
    prop("defaultrouter", Shape::Router(Family::V4), "none"),
    prop("defaultrouter6", Shape::Router(Family::V6), "none"),
    prop("resolver", Shape::Text, "/etc/resolv.conf"),
    derived("mac_prefix", Shape::MacPrefix, default_mac_prefix),
    prop("vnet0_mac", Shape::MacPair, "none"),
    prop("vnet1_mac", Shape::MacPair, "none"),
    prop("vnet2_mac", Shape::MacPair, "none"),
    prop("vnet3_mac", Shape::MacPair, "none"),
    prop("vnet_default_interface", Shape::VnetDefaultInterface, "auto"),
    prop("vnet_interfaces", Shape::Text, "none"),
    prop("nat", ON_OFF, "off"),
    prop("nat_prefix", Shape::NatPrefix, "172.16"),
    prop("nat_interface", Shape::Text, "none"),
    prop("nat_forwards", Shape::NatForwards, "none"),
    // Jail
    PropertySpec {
        getter: Getter::LiveDevfsRuleset,
        ..prop("devfs_ruleset", Shape::Number, "4")
    },
    prop("exec_start", Shape::Text, "/bin/sh /etc/rc"),
    prop("exec_stop", Shape::Text, "/bin/sh /etc/rc.shutdown"),
    prop("exec_prestart", Shape::Text, "/usr/bin/true"),
    prop("exec_poststart", Shape::Text, "/usr/bin/true"),
    prop("exec_prestop", Shape::Text, "/usr/bin/true"),
    prop("exec_poststop", Shape::Text, "/usr/bin/true"),
    flag("exec_clean", "1"),
    prop("exec_timeout", Shape::Number, "60"),
    prop("stop_timeout", Shape::Number, "30"),
    prop("exec_jail_user", Shape::Text, "root"),
    prop("exec_system_jail_user", Shape::Text, "0"),
    prop("exec_system_user", Shape::Text, "root"),
    flag("mount_devfs", "1"),
    flag("mount_fdescfs", "1"),
    prop("enforce_statfs", Shape::Choice(&["0", "1", "2"]), "2"),
    prop("children_max", Shape::Number, "0"),
    prop("login_flags", Shape::Text, "-f root"),
    prop("securelevel", Shape::Range(-1, 3), "2"),
    prop("sysvmsg", NEW_INHERIT_DISABLE, "new"),
    prop("sysvsem", NEW_INHERIT_DISABLE, "new"),
    prop("sysvshm", NEW_INHERIT_DISABLE, "new"),
    flag("allow_set_hostname", "1"),
    flag("allow_sysvipc", "0"),
    flag("allow_raw_sockets", "0"),
    flag("allow_chflags", "0"),
    flag("allow_mlock", "0"),
    flag("allow_mount", "0"),
    flag("allow_mount_devfs", "0"),
    flag("allow_mount_fusefs", "0"),
    flag("allow_mount_nullfs", "0"),
    flag("allow_mount_procfs", "0"),
    flag("allow_mount_tmpfs", "0"),
    flag("allow_mount_zfs", "0"),
    flag("allow_quotas", "0"),
    flag("allow_socket_af", "0"),
    flag("allow_tun", "0"),
    // Resource limits
    prop("cpuset", Shape::Cpuset, "off"),
    prop("rlimits", ON_OFF, "off"),
    rctl("memoryuse"),
    rctl("memorylocked"),
    rctl("vmemoryuse"),
    rctl("maxproc"),
    rctl("cputime"),
    rctl("pcpu"),
    rctl("datasize"),
    rctl("stacksize"),
    rctl("coredumpsize"),
    rctl("openfiles"),
    rctl("pseudoterminals"),
    rctl("swapuse"),
    rctl("nthr"),
    rctl("msgqqueued"),
    rctl("msgqsize"),
    rctl("nmsgq"),
    rctl("nsemop"),
    rctl("nshm"),
    rctl("shmsize"),
    rctl("wallclock"),
    rctl("readbps"),
    rctl("writebps"),
    rctl("readiops"),
    rctl("writeiops"),
    // Custom
    managed("type", "jail"),
    prop("bpf", YES_NO, "no"),
    stopped(prop("dhcp", ON_OFF, "off")),
    prop("boot", ON_OFF, "off"),
    prop("notes", Shape::Text, "none"),
    prop("owner", Shape::Text, "root"),
    prop("priority", Shape::Range(1, 99), "99"),
    PropertySpec {
        getter: Getter::NeverIfNone,
        ..managed("last_started", "none")
    },
    prop("template", YES_NO, "no"),
    derived("hostid", Shape::Text, default_hostid),
    prop("hostid_strict_check", ON_OFF, "off"),
    stopped(prop("jail_zfs", ON_OFF, "off")),
    stopped(derived("jail_zfs_dataset", Shape::Text, default_jail_zfs_dataset)),
    stopped(prop("jail_zfs_mountpoint", Shape::Text, "none")),
    flag("mount_procfs", "0"),
    flag("mount_linprocfs", "0"),
    prop("count", Shape::Number, "1"),
    prop("vnet", ON_OFF, "off"),
    prop("basejail", YES_NO, "no"),
    prop("basejail_type", Shape::Choice(&["nullfs", "zfs"]), "nullfs"),
    prop("comment", Shape::Text, "none"),
    prop("host_time", YES_NO, "yes"),
    prop("depends", Shape::Depends, "none"),
    managed("release", "none"),
    managed("cloned_release", "none"),
    // ZFS
    dataset("compression", Shape::Text, "lz4"),
    dataset("quota", Shape::Size, "none"),
    dataset("dedup", Shape::Choice(&["on", "off", "verify", "sha256", "sha512", "skein"]), "off"),
    dataset("reservation", Shape::Size, "none"),
    dataset_ro("origin"),
    dataset_ro("mountpoint"),
    dataset_ro("compressratio"),
    dataset_ro("available"),
    dataset_ro("used"),
];

/// Find a property by name
pub fn lookup(name: &str) -> Option<&'static PropertySpec> {
    PROPERTIES.iter().find(|p| p.name == name)
}

/// Names of all rctl-backed properties
pub fn rctl_keys() -> impl Iterator<Item = &'static str> {
    PROPERTIES
        .iter()
        .filter(|p| p.shape == Shape::Rctl)
        .map(|p| p.name)
}

/// Host information some validators and defaults depend on
#[derive(Debug, Clone, Default)]
pub struct HostFacts {
    pub ncpu: u32,
    pub interfaces: Vec<String>,
    pub default_iface: Option<String>,
    pub hostid: Option<String>,
    pub mac_prefix: String,
}

fn check_mac_prefix(value: &str) -> Result<String> {
    let value = value.trim().to_ascii_lowercase().replace([':', '-'], "");
    let valid = value.len() == 6 && value.chars().all(|c| c.is_ascii_hexdigit());
    if !valid {
        return Err(Error::invalid_value(
            "mac_prefix",
            "expected 6 hex digits (3 bytes)",
        ));
    }
    let first = u8::from_str_radix(&value[..2], 16).unwrap_or(1);
    if first & 1 == 1 {
        return Err(Error::invalid_value(
            "mac_prefix",
            "prefix is a multicast address; the first byte must be even",
        ));
    }
    Ok(value)
}

fn check_size(key: &str, value: &str) -> Result<String> {
    if value == "none" {
        return Ok(value.to_string());
    }
    let upper = value.to_ascii_uppercase();
    let digits = upper.trim_end_matches(['M', 'G', 'T']);
    if digits.len() + 1 != upper.len() || digits.is_empty() {
        return Err(Error::invalid_value(
            key,
            format!("{} should have a suffix ending in M, G, or T", value),
        ));
    }
    if digits.parse::<f64>().is_err() {
        return Err(Error::invalid_value(key, format!("'{}' is not a size", value)));
    }
    Ok(upper)
}

/// Validate and normalize a value for `key`
///
/// Returns the canonical form to persist. Host-dependent checks (cpuset
/// range, interface existence, `DEFAULT`) are skipped when no facts are
/// available.
pub fn validate(key: &str, value: &str, facts: Option<&HostFacts>) -> Result<String> {
    let spec = lookup(key).ok_or_else(|| Error::InvalidProperty(key.to_string()))?;
    let value = value.trim();

    match spec.shape {
        Shape::Text => {
            if value.contains('\n') {
                return Err(Error::invalid_value(key, "value may not span lines"));
            }
            Ok(value.to_string())
        }
        Shape::Bool(family) => family.normalize(value).map(str::to_string).ok_or_else(|| {
            let (t, f) = family.tokens();
            Error::invalid_value(key, format!("value must be {} or {}", t, f))
        }),
        Shape::Choice(choices) => {
            if choices.contains(&value) {
                Ok(value.to_string())
            } else {
                Err(Error::invalid_value(
                    key,
                    format!("value must be {}", choices.join(" or ")),
                ))
            }
        }
        Shape::Number => value
            .parse::<u64>()
            .map(|n| n.to_string())
            .map_err(|_| Error::invalid_value(key, format!("'{}' is not a number", value))),
        Shape::Range(lo, hi) => match value.parse::<i64>() {
            Ok(n) if (lo..=hi).contains(&n) => Ok(n.to_string()),
            _ => Err(Error::invalid_value(
                key,
                format!("value must be between {} and {}", lo, hi),
            )),
        },
        Shape::Addresses(family) => {
            let mut specs = address::parse_addresses(family, value)?;
            if let Some(facts) = facts {
                address::resolve_default(&mut specs, facts.default_iface.as_deref())?;
            }
            Ok(address::format_addresses(&specs))
        }
        Shape::Router(family) => {
            if value == "none" || value == "auto" {
                return Ok(value.to_string());
            }
            let ip: IpAddr = value
                .parse()
                .map_err(|_| Error::invalid_value(key, format!("'{}' is not an IP address", value)))?;
            let ok = match family {
                Family::V4 => ip.is_ipv4(),
                Family::V6 => ip.is_ipv6(),
            };
            if ok {
                Ok(ip.to_string())
            } else {
                Err(Error::invalid_value(key, "wrong address family"))
            }
        }
        Shape::Interfaces => {
            let pairs = grammar::parse_interfaces(value)?;
            if pairs.is_empty() {
                return Ok("none".to_string());
            }
            Ok(pairs
                .iter()
                .map(|(n, b)| format!("{}:{}", n, b))
                .collect::<Vec<_>>()
                .join(","))
        }
        Shape::MacPair => Ok(match grammar::parse_mac_pair(key, value)? {
            Some((a, b)) => format!("{} {}", a, b),
            None => "none".to_string(),
        }),
        Shape::MacPrefix => check_mac_prefix(value),
        Shape::Cpuset => {
            if let Some(facts) = facts.filter(|f| f.ncpu > 0) {
                grammar::parse_cpuset(value, facts.ncpu)?;
            } else {
                grammar::parse_cpuset(value, u32::MAX)?;
            }
            Ok(value.to_string())
        }
        Shape::Rctl => Ok(match grammar::parse_rctl(key, value)? {
            Some(limit) => limit.to_string(),
            None => "off".to_string(),
        }),
        Shape::NatForwards => {
            let fwds = grammar::parse_nat_forwards(value)?;
            if fwds.is_empty() {
                return Ok("none".to_string());
            }
            Ok(fwds
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","))
        }
        Shape::NatPrefix => {
            let octets: Vec<&str> = value.split('.').collect();
            let valid = octets.len() == 2 && octets.iter().all(|o| o.parse::<u8>().is_ok());
            if valid {
                Ok(value.to_string())
            } else {
                Err(Error::invalid_value(
                    key,
                    "expected the first two octets of a private network, e.g. 172.16",
                ))
            }
        }
        Shape::Size => check_size(key, value),
        Shape::VnetDefaultInterface => {
            if value == "auto" || value == "none" {
                return Ok(value.to_string());
            }
            match facts {
                Some(f) if !f.interfaces.iter().any(|i| i == value) => Err(Error::invalid_value(
                    key,
                    format!("'{}' is not a NIC on this host", value),
                )),
                _ => Ok(value.to_string()),
            }
        }
        Shape::Depends => {
            if value == "none" || value.is_empty() {
                return Ok("none".to_string());
            }
            let names: Vec<&str> = value.split_whitespace().collect();
            if names.iter().any(|n| n.contains('/')) {
                return Err(Error::invalid_value(key, "jail names may not contain '/'"));
            }
            Ok(names.join(" "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts() -> HostFacts {
        HostFacts {
            ncpu: 4,
            interfaces: vec!["em0".into(), "lo0".into(), "bridge0".into()],
            default_iface: Some("em0".into()),
            hostid: Some("abc".into()),
            mac_prefix: "02aa00".into(),
        }
    }

    #[test]
    fn test_registry_unique() {
        let mut names: Vec<_> = PROPERTIES.iter().map(|p| p.name).collect();
        names.sort_unstable();
        let before = names.len();
        names.dedup();
        assert_eq!(before, names.len());
    }

    #[test]
    fn test_bool_normalization() {
        assert_eq!(validate("boot", "yes", None).unwrap(), "on");
        assert_eq!(validate("template", "1", None).unwrap(), "yes");
        assert_eq!(validate("allow_mlock", "true", None).unwrap(), "1");
        assert_eq!(validate("vnet", "OFF", None).unwrap(), "off");
        assert!(validate("vnet", "maybe", None).is_err());
    }

    #[test]
    fn test_unknown_property() {
        assert!(matches!(
            validate("no_such_thing", "1", None),
            Err(Error::InvalidProperty(_))
        ));
    }

    #[test]
    fn test_priority_range() {
        assert_eq!(validate("priority", "10", None).unwrap(), "10");
        assert!(validate("priority", "0", None).is_err());
        assert!(validate("priority", "100", None).is_err());
    }

    #[test]
    fn test_addresses_with_default() {
        let v = validate("ip4_addr", "DEFAULT|10.0.0.5/24", Some(&facts())).unwrap();
        assert_eq!(v, "em0|10.0.0.5/24");
        assert!(validate("ip4_addr", "em0|10.0.0.500", None).is_err());
    }

    #[test]
    fn test_host_dependent() {
        let f = facts();
        assert!(validate("cpuset", "0-3", Some(&f)).is_ok());
        assert!(validate("cpuset", "0-4", Some(&f)).is_err());
        assert!(validate("vnet_default_interface", "em0", Some(&f)).is_ok());
        assert!(validate("vnet_default_interface", "igb7", Some(&f)).is_err());
    }

    #[test]
    fn test_quota_suffix() {
        assert_eq!(validate("quota", "10g", None).unwrap(), "10G");
        assert_eq!(validate("quota", "none", None).unwrap(), "none");
        assert!(validate("quota", "100", None).is_err());
        assert!(validate("quota", "G", None).is_err());
    }

    #[test]
    fn test_mac_prefix() {
        assert_eq!(validate("mac_prefix", "02:FF:60", None).unwrap(), "02ff60");
        assert!(validate("mac_prefix", "01ff60", None).is_err());
        assert!(validate("mac_prefix", "02ff6", None).is_err());
    }

    #[test]
    fn test_rctl_and_nat() {
        assert_eq!(validate("memoryuse", "8g:deny", None).unwrap(), "deny=8g");
        assert!(validate("maxproc", "deny=1k", None).is_err());
        assert_eq!(
            validate("nat_forwards", "tcp(80:8080)", None).unwrap(),
            "tcp(80:8080)"
        );
        assert!(validate("nat_forwards", "xyz(99999)", None).is_err());
    }

    #[test]
    fn test_derived_defaults() {
        let f = facts();
        let inputs = DefaultInputs {
            facts: Some(&f),
            uuid: Some("web"),
        };
        let spec = lookup("jail_zfs_dataset").unwrap();
        assert_eq!(spec.default.resolve(&inputs), "iocage/jails/web/data");
        assert_eq!(lookup("host_hostname").unwrap().default.resolve(&inputs), "web");
        assert_eq!(lookup("mac_prefix").unwrap().default.resolve(&inputs), "02aa00");
        assert!(lookup("dhcp").unwrap().needs_stopped);
    }
}
