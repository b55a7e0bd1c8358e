//! Jail networking
//!
//! Three modes, picked from the jail's properties:
//! - shared: addresses are aliases on host interfaces, added by jail(8)
//! - VNET: one epair per configured NIC, host ends on bridges
//! - NAT: a VNET jail with a single unbridged NIC behind a private block
//!
//! [`NetworkPlan::plan`] turns the properties into a checked plan before a
//! start touches anything. [`NetworkProvisioner`] carries the plan out once
//! the jail exists and undoes it from the runtime artifact on stop.

pub mod bridge;
pub mod epair;
pub mod mac;
pub mod nat;
pub mod shared;
pub mod vnet;

pub use nat::{AddressEnumerator, NatBlock};
pub use vnet::{NetworkAttachment, Routes, VnetNic};

use crate::config::JailConfig;
use crate::config::address::{self, AddrKind, AddressSpec, Family};
use crate::config::grammar::{self, NatForward};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::runtime::RuntimeArtifact;
use std::net::IpAddr;

/// Artifact key listing the VNET NICs of a running jail
pub const NICS_META: &str = "nics";

/// Artifact key listing the host ends of those NICs, recorded once the jid is known
pub const HOST_NICS_META: &str = "host_nics";

/// Checked network setup for one start
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkPlan {
    Shared {
        ip4: Vec<AddressSpec>,
        ip6: Vec<AddressSpec>,
    },
    Vnet {
        nics: Vec<VnetNic>,
        routes: Routes,
    },
    Nat {
        nic: String,
        macs: (String, String),
        prefix: String,
        interface: String,
        forwards: Vec<NatForward>,
    },
}

fn router(cfg: &JailConfig, key: &str) -> Option<String> {
    let value = cfg.get(key);
    match value.as_str() {
        "none" | "auto" | "" => None,
        _ => Some(value),
    }
}

/// Configured MAC pair of a NIC, or a derived one
fn macs_for(cfg: &JailConfig, nic: &str) -> Result<(String, String)> {
    let key = format!("{}_mac", nic);
    if cfg.is_explicit(&key)
        && let Some(pair) = grammar::parse_mac_pair(&key, &cfg.get(&key))?
    {
        return Ok(pair);
    }
    Ok(mac::derive_mac(cfg.uuid(), nic, &cfg.get("mac_prefix")))
}

/// Split address entries between NICs; entries without one go to the first
fn assign(
    specs: Vec<AddressSpec>,
    nics: &[(String, String)],
    family: Family,
) -> Result<Vec<Vec<AddressSpec>>> {
    let mut per_nic = vec![Vec::new(); nics.len()];
    for mut spec in specs {
        let index = match spec.interface.as_deref() {
            None | Some("DEFAULT") => 0,
            Some(name) => nics.iter().position(|(n, _)| n == name).ok_or_else(|| {
                Error::invalid_value(
                    family.key(),
                    format!("'{}' names a NIC missing from interfaces", spec),
                )
            })?,
        };
        spec.interface = Some(nics[index].0.clone());
        per_nic[index].push(spec);
    }
    Ok(per_nic)
}

impl NetworkPlan {
    /// Validate the network properties and build the plan
    pub fn plan(cfg: &JailConfig, default_iface: Option<&str>) -> Result<Self> {
        let vnet = cfg.is_on("vnet");
        let bpf = cfg.is_on("bpf");
        let dhcp = cfg.is_on("dhcp");
        let nat = cfg.is_on("nat");

        if dhcp && !(bpf && vnet) {
            return Err(Error::invalid_value("dhcp", "requires bpf=yes and vnet=on"));
        }
        if bpf && !vnet {
            return Err(Error::invalid_value("bpf", "requires vnet=on"));
        }
        if nat && !vnet {
            return Err(Error::invalid_value("nat", "requires vnet=on"));
        }

        let mut ip4 = address::parse_addresses(Family::V4, &cfg.get("ip4_addr"))?;
        let mut ip6 = address::parse_addresses(Family::V6, &cfg.get("ip6_addr"))?;

        if !vnet {
            shared::resolve_interfaces(&mut ip4, default_iface)?;
            shared::resolve_interfaces(&mut ip6, default_iface)?;
            return Ok(NetworkPlan::Shared { ip4, ip6 });
        }

        let interfaces = grammar::parse_interfaces(&cfg.get("interfaces"))?;

        if nat {
            let forwards = grammar::parse_nat_forwards(&cfg.get("nat_forwards"))?;
            let interface = match cfg.get("nat_interface").as_str() {
                "none" => default_iface.map(str::to_string).ok_or_else(|| {
                    Error::invalid_value("nat_interface", "unset and the host has no default route")
                })?,
                other => other.to_string(),
            };
            let nic = interfaces
                .first()
                .map(|(n, _)| n.clone())
                .unwrap_or_else(|| "vnet0".to_string());
            return Ok(NetworkPlan::Nat {
                macs: macs_for(cfg, &nic)?,
                nic,
                prefix: cfg.get("nat_prefix"),
                interface,
                forwards,
            });
        }

        if interfaces.is_empty() && !(ip4.is_empty() && ip6.is_empty()) {
            return Err(Error::invalid_value(
                "interfaces",
                "addresses are set but no VNET interface is configured",
            ));
        }

        let uplink = match cfg.get("vnet_default_interface").as_str() {
            "none" => None,
            "auto" => default_iface.map(str::to_string),
            other => Some(other.to_string()),
        };
        let mut ip4 = assign(ip4, &interfaces, Family::V4)?.into_iter();
        let mut ip6 = assign(ip6, &interfaces, Family::V6)?.into_iter();

        let mut nics = Vec::new();
        for (i, (nic, bridge)) in interfaces.iter().enumerate() {
            nics.push(VnetNic {
                nic: nic.clone(),
                bridge: Some(bridge.clone()),
                uplink: uplink.clone(),
                macs: macs_for(cfg, nic)?,
                ip4: ip4.next().unwrap_or_default(),
                ip6: ip6.next().unwrap_or_default(),
                host_address: None,
                dhcp: dhcp && i == 0,
            });
        }

        Ok(NetworkPlan::Vnet {
            nics,
            routes: Routes {
                v4: router(cfg, "defaultrouter"),
                v6: router(cfg, "defaultrouter6"),
            },
        })
    }

    /// NIC names this plan creates
    pub fn nic_names(&self) -> Vec<String> {
        match self {
            NetworkPlan::Shared { .. } => Vec::new(),
            NetworkPlan::Vnet { nics, .. } => nics.iter().map(|n| n.nic.clone()).collect(),
            NetworkPlan::Nat { nic, .. } => vec![nic.clone()],
        }
    }

    /// MAC pairs to persist as `<nic>_mac`, in `a b` form
    pub fn mac_values(&self) -> Vec<(String, String)> {
        let pairs: Vec<(&str, &(String, String))> = match self {
            NetworkPlan::Shared { .. } => Vec::new(),
            NetworkPlan::Vnet { nics, .. } => nics.iter().map(|n| (n.nic.as_str(), &n.macs)).collect(),
            NetworkPlan::Nat { nic, macs, .. } => vec![(nic.as_str(), macs)],
        };
        pairs
            .into_iter()
            .map(|(nic, (a, b))| (format!("{}_mac", nic), format!("{} {}", a, b)))
            .collect()
    }
}

/// Carries out network plans against the host
pub struct NetworkProvisioner<'a> {
    ctx: &'a Context,
}

impl<'a> NetworkProvisioner<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// Reserve a NAT block and record it in the artifact before anyone else can pick it
    pub fn allocate_nat_address(
        &self,
        prefix: &str,
        enumerator: &dyn AddressEnumerator,
        artifact: &mut RuntimeArtifact,
        artifact_path: &std::path::Path,
    ) -> Result<NatBlock> {
        nat::allocate_locked(self.ctx, prefix, enumerator, |block| {
            block.record(artifact);
            artifact.write(artifact_path)
        })
    }

    /// Bring up every NIC of a created jail
    ///
    /// All NICs are attempted; any failure comes back as one
    /// [`Error::Network`] listing each of them.
    pub fn attach(
        &self,
        kernel_name: &str,
        jid: i32,
        plan: &NetworkPlan,
        artifact: &RuntimeArtifact,
    ) -> Result<Vec<NetworkAttachment>> {
        let host = self.ctx.host();
        match plan {
            NetworkPlan::Shared { .. } => Ok(Vec::new()),
            NetworkPlan::Vnet { nics, routes } => {
                let mut attached = Vec::new();
                let mut failures = Vec::new();
                for (i, nic) in nics.iter().enumerate() {
                    let routes = (i == 0).then_some(routes);
                    match vnet::attach(host, kernel_name, jid, nic, routes) {
                        Ok(a) => attached.push(a),
                        Err(e) => failures.push(format!("{}: {}", nic.nic, e)),
                    }
                }
                if failures.is_empty() {
                    Ok(attached)
                } else {
                    Err(Error::Network(failures))
                }
            }
            NetworkPlan::Nat {
                nic,
                macs,
                interface,
                forwards,
                ..
            } => {
                let block = NatBlock::from_artifact(artifact).ok_or_else(|| {
                    Error::allocation("NAT block", "no block recorded for this start")
                })?;
                let vnic = VnetNic {
                    nic: nic.clone(),
                    bridge: None,
                    uplink: None,
                    macs: macs.clone(),
                    ip4: vec![AddressSpec {
                        interface: Some(nic.clone()),
                        kind: AddrKind::Ip {
                            addr: IpAddr::V4(block.address),
                            prefix: Some(block.prefix),
                        },
                    }],
                    ip6: Vec::new(),
                    host_address: Some(format!("{}/{}", block.gateway, block.prefix)),
                    dhcp: false,
                };
                let routes = Routes {
                    v4: Some(block.gateway.to_string()),
                    v6: None,
                };
                let attachment = vnet::attach(host, kernel_name, jid, &vnic, Some(&routes))
                    .map_err(|e| Error::Network(vec![format!("{}: {}", nic, e)]))?;
                nat::NatRules::new(self.ctx)
                    .install(&block.address, interface, forwards)
                    .map_err(|e| Error::Network(vec![format!("nat: {}", e)]))?;
                Ok(vec![attachment])
            }
        }
    }

    /// Undo whatever the artifact says was set up
    ///
    /// Every step runs; failures are returned for the caller to log.
    pub fn detach(&self, artifact: &RuntimeArtifact, jid: Option<i32>) -> Vec<Error> {
        let host = self.ctx.host();
        let mut errors = Vec::new();

        if let Some(block) = NatBlock::from_artifact(artifact)
            && let Err(e) = nat::NatRules::new(self.ctx).remove(&block.address)
        {
            errors.push(e);
        }

        let nics = artifact.meta_list(NICS_META);
        if !nics.is_empty() {
            // The host ends outlive the jail, so they go whether or not it still exists
            let mut host_ends = artifact.meta_list(HOST_NICS_META);
            if host_ends.is_empty()
                && let Some(jid) = jid
            {
                host_ends = nics.iter().map(|nic| vnet::host_interface(nic, jid)).collect();
            }
            if host_ends.is_empty() {
                tracing::warn!(nics = %nics.join(","), "no host interfaces recorded for these nics");
            }
            let attachments: Vec<NetworkAttachment> = nics
                .iter()
                .zip(host_ends)
                .map(|(nic, host_interface)| NetworkAttachment {
                    nic: nic.clone(),
                    host_interface,
                })
                .collect();
            errors.extend(vnet::detach(host, &attachments));
            return errors;
        }

        for (key, family) in [("ip4.addr", Family::V4), ("ip6.addr", Family::V6)] {
            let Some(value) = artifact.get_param(key) else {
                continue;
            };
            match address::parse_addresses(family, value) {
                Ok(specs) => errors.extend(shared::remove_aliases(host, &specs)),
                Err(e) => errors.push(e),
            }
        }
        errors
    }
}
