//! Shared handles passed to every component
//!
//! A [`Context`] carries the host command runner and the host settings. It
//! is built once in `main` and borrowed by everything below it.

use crate::cancel::CancelFlag;
use crate::config::HostFacts;
use crate::host::{Host, HostCommand};
use crate::parse;
use crate::settings::Settings;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

pub struct Context {
    host: Arc<dyn Host>,
    settings: Settings,
    cancel: CancelFlag,
}

impl Context {
    pub fn new(host: Arc<dyn Host>, settings: Settings) -> Self {
        Self {
            host,
            settings,
            cancel: CancelFlag::new(),
        }
    }

    pub fn host(&self) -> &dyn Host {
        self.host.as_ref()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn cancel(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Mountpoint of the root dataset
    pub fn iocroot(&self) -> PathBuf {
        self.settings.iocroot()
    }

    /// Full dataset name for a path relative to the root dataset
    pub fn dataset(&self, relative: &str) -> String {
        format!("{}/{}", self.settings.root_dataset(), relative)
    }

    pub fn defaults_path(&self) -> PathBuf {
        self.iocroot().join("defaults.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.iocroot().join("log")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.settings.run_dir.clone()
    }

    /// Interface carrying the IPv4 default route
    pub fn default_interface(&self) -> Option<String> {
        let out = self
            .host()
            .run(&HostCommand::new("route").args(["-n", "get", "default"]))
            .ok()?;
        if !out.success() {
            return None;
        }
        parse::route::parse_default_route(&out.stdout).map(|r| r.interface)
    }

    /// Gather the host facts used by validators and derived defaults
    pub fn host_facts(&self) -> HostFacts {
        let host = self.host();

        let ncpu = host
            .check(&HostCommand::new("sysctl").args(["-n", "hw.ncpu"]))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);

        let interfaces = host
            .check(&HostCommand::new("ifconfig").arg("-l"))
            .map(|s| parse::ifconfig::parse_list(&s))
            .unwrap_or_default();

        let default_iface = self.default_interface();

        // Prefix from the default interface's MAC keeps generated addresses
        // distinct between hosts on the same segment
        let mac_prefix = default_iface
            .as_deref()
            .and_then(|iface| host.check(&HostCommand::new("ifconfig").arg(iface)).ok())
            .and_then(|out| parse::ifconfig::parse_interfaces(&out).ok())
            .and_then(|ifaces| ifaces.into_iter().find_map(|i| i.ether))
            .and_then(|mac| mac.replace(':', "").get(..6).map(str::to_string))
            .filter(|p| p.len() == 6 && u8::from_str_radix(&p[..2], 16).is_ok_and(|b| b & 1 == 0))
            .unwrap_or_else(|| format!("{:06x}", rand::random::<u32>() & 0xfeffff));

        let hostid = fs::read_to_string("/etc/hostid")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        HostFacts {
            ncpu,
            interfaces,
            default_iface,
            hostid,
            mac_prefix,
        }
    }
}
