//! Runtime artifact of a running jail
//!
//! `<run_dir>/ioc-<name>.conf` holds the `key=value` parameters handed to
//! `jail -c`, followed by `ioc.*` bookkeeping entries (devfs ruleset, NAT
//! block, attached interfaces, applied limits) that stop reads back to tear
//! the jail down. The file exists from just before creation until a
//! successful stop.

use crate::config::JailConfig;
use crate::config::address::AddressSpec;
use crate::config::document::write_atomic;
use crate::error::{Error, Result};
use crate::sys::OsVersion;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

const META_PREFIX: &str = "ioc.";

/// Jail parameters plus teardown bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeArtifact {
    params: Vec<(String, Option<String>)>,
    meta: BTreeMap<String, String>,
}

impl RuntimeArtifact {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.params.push((key.to_string(), Some(value.into())));
        self
    }

    /// A parameter given without a value, like `persist`
    pub fn flag(&mut self, key: &str) -> &mut Self {
        self.params.push((key.to_string(), None));
        self
    }

    pub fn get_param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_deref().unwrap_or(""))
    }

    pub fn has_param(&self, key: &str) -> bool {
        self.params.iter().any(|(k, _)| k == key)
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<String>) {
        self.meta.insert(key.to_string(), value.into());
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    /// Comma-separated bookkeeping list
    pub fn meta_list(&self, key: &str) -> Vec<String> {
        self.meta(key)
            .map(|v| {
                v.split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Arguments for `jail -c`
    pub fn args(&self) -> Vec<String> {
        self.params
            .iter()
            .map(|(k, v)| match v {
                Some(v) => format!("{}={}", k, v),
                None => k.clone(),
            })
            .collect()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for arg in self.args() {
            out.push_str(&arg);
            out.push('\n');
        }
        for (key, value) in &self.meta {
            out.push_str(&format!("{}{}={}\n", META_PREFIX, key, value));
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut artifact = Self::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if line.contains('\0') {
                return Err(Error::InvalidConfiguration(
                    "runtime artifact contains a NUL byte".into(),
                ));
            }
            match line.split_once('=') {
                Some((key, value)) => match key.strip_prefix(META_PREFIX) {
                    Some(meta) => artifact.set_meta(meta, value),
                    None => {
                        artifact.param(key, value);
                    }
                },
                None => {
                    artifact.flag(line);
                }
            }
        }
        Ok(artifact)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(path, self.render().as_bytes())
    }

    /// Read the artifact back; a missing file is `None`
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn remove(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// What `jail -c` needs beyond the jail's own properties
pub struct ParamInputs<'a> {
    pub cfg: &'a JailConfig,
    pub kernel_name: &'a str,
    pub root: &'a Path,
    pub userland: &'a OsVersion,
    pub devfs_ruleset: u32,
    pub fstab: &'a Path,
    /// Shared-stack addresses with their interfaces resolved
    pub ip4: &'a [AddressSpec],
    pub ip6: &'a [AddressSpec],
}

fn stack_mode(value: &str) -> &str {
    match value {
        "none" => "disable",
        other => other,
    }
}

fn join_addresses(specs: &[AddressSpec]) -> String {
    specs
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Build the `jail -c` parameters for a start
pub fn jail_params(inputs: &ParamInputs) -> RuntimeArtifact {
    let cfg = inputs.cfg;
    let version = inputs.userland;
    let mut a = RuntimeArtifact::new();

    a.param("name", inputs.kernel_name)
        .param("host.hostname", cfg.get("host_hostname"))
        .param("host.hostuuid", cfg.uuid())
        .param("path", inputs.root.display().to_string())
        .param("securelevel", cfg.get("securelevel"))
        .param("devfs_ruleset", inputs.devfs_ruleset.to_string())
        .param("enforce_statfs", cfg.get("enforce_statfs"))
        .param("children.max", cfg.get("children_max"))
        .param("mount.devfs", cfg.get("mount_devfs"))
        .param("mount.fstab", inputs.fstab.display().to_string());

    let domain = cfg.get("host_domainname");
    if domain != "none" {
        a.param("host.domainname", domain);
    }

    for (param, key) in [
        ("allow.set_hostname", "allow_set_hostname"),
        ("allow.raw_sockets", "allow_raw_sockets"),
        ("allow.chflags", "allow_chflags"),
        ("allow.mount", "allow_mount"),
        ("allow.mount.devfs", "allow_mount_devfs"),
        ("allow.mount.nullfs", "allow_mount_nullfs"),
        ("allow.mount.procfs", "allow_mount_procfs"),
        ("allow.mount.zfs", "allow_mount_zfs"),
        ("allow.quotas", "allow_quotas"),
        ("allow.socket_af", "allow_socket_af"),
    ] {
        a.param(param, cfg.get(key));
    }

    if version.supports_tmpfs_fdescfs() {
        a.param("allow.mount.tmpfs", cfg.get("allow_mount_tmpfs"))
            .param("mount.fdescfs", cfg.get("mount_fdescfs"));
    }
    if version.supports_mlock_fusefs() {
        a.param("allow.mlock", cfg.get("allow_mlock"))
            .param("allow.mount.fusefs", cfg.get("allow_mount_fusefs"));
    }
    if version.supports_sysv() {
        a.param("sysvmsg", cfg.get("sysvmsg"))
            .param("sysvsem", cfg.get("sysvsem"))
            .param("sysvshm", cfg.get("sysvshm"));
    } else {
        a.param("allow.sysvipc", cfg.get("allow_sysvipc"));
    }

    if cfg.is_on("jail_zfs") {
        a.param("allow.mount", "1")
            .param("allow.mount.zfs", "1")
            .param("enforce_statfs", "1");
    }

    if cfg.is_on("vnet") {
        a.flag("vnet");
        let extra = cfg.get("vnet_interfaces");
        for iface in extra.split_whitespace().filter(|i| *i != "none") {
            a.param("vnet.interface", iface);
        }
    } else {
        if inputs.ip4.is_empty() {
            a.param("ip4", stack_mode(&cfg.get("ip4")));
        } else {
            a.param("ip4.addr", join_addresses(inputs.ip4))
                .param("ip4.saddrsel", cfg.get("ip4_saddrsel"));
        }
        if inputs.ip6.is_empty() {
            a.param("ip6", stack_mode(&cfg.get("ip6")));
        } else {
            a.param("ip6.addr", join_addresses(inputs.ip6))
                .param("ip6.saddrsel", cfg.get("ip6_saddrsel"));
        }
    }

    a.flag("persist");
    a
}
