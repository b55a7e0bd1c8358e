//! VNET interface setup
//!
//! For each NIC of a VNET jail:
//! 1. Create an epair and rename the host end `<nic>.<jid>`
//! 2. Set both MACs
//! 3. Attach the host end to its bridge, creating the bridge if needed
//! 4. Move the `b` end into the jail and rename it `<nic>` there
//! 5. Assign addresses inside the jail; the first NIC carries the routes

use super::epair::{self, Epair, ifconfig};
use super::{bridge, mac};
use crate::config::address::{AddrKind, AddressSpec};
use crate::error::{Error, Result};
use crate::host::{Host, HostCommand};

/// Everything needed to bring up one NIC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VnetNic {
    pub nic: String,
    /// Bridge for the host end; NAT jails have none
    pub bridge: Option<String>,
    /// Host interface that should be a member of the bridge
    pub uplink: Option<String>,
    /// Host-side and jail-side MACs
    pub macs: (String, String),
    pub ip4: Vec<AddressSpec>,
    pub ip6: Vec<AddressSpec>,
    /// Address put on the host end (the NAT gateway)
    pub host_address: Option<String>,
    pub dhcp: bool,
}

/// Default routes set inside the jail through the first NIC
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Routes {
    pub v4: Option<String>,
    pub v6: Option<String>,
}

/// A NIC attached to a running jail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub nic: String,
    pub host_interface: String,
}

/// Host-side interface name for a NIC
pub fn host_interface(nic: &str, jid: i32) -> String {
    format!("{}.{}", nic, jid)
}

fn jexec(host: &dyn Host, kernel_name: &str, argv: &[&str]) -> Result<String> {
    host.check(&HostCommand::jexec_argv(kernel_name, argv.iter().copied()))
}

/// Bring up one NIC; on failure nothing of it is left on the host
pub fn attach(
    host: &dyn Host,
    kernel_name: &str,
    jid: i32,
    nic: &VnetNic,
    routes: Option<&Routes>,
) -> Result<NetworkAttachment> {
    let pair = Epair::create(host)?;
    let host_if = host_interface(&nic.nic, jid);

    if let Err(e) = ifconfig(host, [pair.host_side.as_str(), "name", &host_if]) {
        if let Err(cleanup) = epair::destroy(host, &pair.host_side) {
            tracing::warn!(interface = %pair.host_side, error = %cleanup, "could not destroy epair");
        }
        return Err(e);
    }

    let configured = configure(host, kernel_name, &pair, &host_if, nic, routes);
    if let Err(e) = configured {
        if let Err(cleanup) = epair::destroy(host, &host_if) {
            tracing::warn!(interface = %host_if, error = %cleanup, "could not destroy epair");
        }
        return Err(e);
    }

    tracing::info!(jail = kernel_name, nic = %nic.nic, interface = %host_if, "nic attached");
    Ok(NetworkAttachment {
        nic: nic.nic.clone(),
        host_interface: host_if,
    })
}

fn configure(
    host: &dyn Host,
    kernel_name: &str,
    pair: &Epair,
    host_if: &str,
    nic: &VnetNic,
    routes: Option<&Routes>,
) -> Result<()> {
    let (mac_a, mac_b) = &nic.macs;
    ifconfig(host, [host_if, "link", &mac::colon_form(mac_a)])?;
    ifconfig(host, [pair.jail_side.as_str(), "link", &mac::colon_form(mac_b)])?;
    ifconfig(
        host,
        [
            host_if,
            "description",
            &format!("associated with jail: {} as nic: {}", kernel_name, nic.nic),
        ],
    )?;

    if let Some(bridge_name) = &nic.bridge {
        let members = bridge::ensure(host, bridge_name)?;
        if let Some(uplink) = &nic.uplink
            && !members.iter().any(|m| m == uplink)
        {
            bridge::add_member(host, bridge_name, uplink)?;
        }
        bridge::add_member(host, bridge_name, host_if)?;
    }
    if let Some(addr) = &nic.host_address {
        ifconfig(host, [host_if, "inet", addr.as_str(), "alias"])?;
    }
    ifconfig(host, [host_if, "up"])?;

    ifconfig(host, [pair.jail_side.as_str(), "vnet", kernel_name])?;
    jexec(host, kernel_name, &["ifconfig", &pair.jail_side, "name", &nic.nic])?;
    jexec(host, kernel_name, &["ifconfig", &nic.nic, "up"])?;

    for spec in &nic.ip4 {
        if let Some(addr) = spec.address_text() {
            jexec(host, kernel_name, &["ifconfig", &nic.nic, "inet", &addr, "alias"])?;
        }
    }
    for spec in &nic.ip6 {
        match &spec.kind {
            AddrKind::AcceptRtadv => {
                jexec(
                    host,
                    kernel_name,
                    &["ifconfig", &nic.nic, "inet6", "-ifdisabled", "accept_rtadv", "up"],
                )?;
                jexec(host, kernel_name, &["rtsold", &nic.nic])?;
            }
            AddrKind::Ip { .. } => {
                if let Some(addr) = spec.address_text() {
                    jexec(host, kernel_name, &["ifconfig", &nic.nic, "inet6", &addr, "alias"])?;
                }
            }
        }
    }

    if nic.dhcp {
        jexec(
            host,
            kernel_name,
            &["sysrc", &format!("ifconfig_{}=SYNCDHCP", nic.nic)],
        )?;
    }

    if let Some(routes) = routes {
        if let Some(gw) = &routes.v4 {
            jexec(host, kernel_name, &["route", "add", "default", gw])?;
        }
        if let Some(gw) = &routes.v6 {
            jexec(host, kernel_name, &["route", "add", "-6", "default", gw])?;
        }
    }
    Ok(())
}

/// Destroy the host end of each NIC, which takes the jail end with it
pub fn detach(host: &dyn Host, attachments: &[NetworkAttachment]) -> Vec<Error> {
    attachments
        .iter()
        .filter_map(|a| {
            let result = epair::destroy(host, &a.host_interface);
            if result.is_ok() {
                tracing::debug!(interface = %a.host_interface, "nic detached");
            }
            result.err()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::address::{Family, parse_addresses};
    use crate::host::CommandOutput;
    use crate::host::testing::FakeHost;

    fn nic(name: &str, bridge: &str) -> VnetNic {
        VnetNic {
            nic: name.to_string(),
            bridge: Some(bridge.to_string()),
            uplink: None,
            macs: mac::derive_mac("web", name, "02ff60"),
            ip4: parse_addresses(Family::V4, "10.0.0.5/24").unwrap(),
            ip6: parse_addresses(Family::V6, "vnet0|accept_rtadv").unwrap(),
            host_address: None,
            dhcp: false,
        }
    }

    #[test]
    fn test_attach_sequence() {
        let host = FakeHost::new();
        host.respond("ifconfig epair create", CommandOutput::ok("epair7a\n"));
        let routes = Routes {
            v4: Some("10.0.0.1".into()),
            v6: None,
        };

        let att = attach(&host, "ioc-web", 4, &nic("vnet0", "bridge0"), Some(&routes)).unwrap();
        assert_eq!(att.host_interface, "vnet0.4");

        let order = [
            "ifconfig epair7a name vnet0.4",
            "ifconfig bridge0 addm vnet0.4 up",
            "ifconfig epair7b vnet ioc-web",
            "jexec ioc-web ifconfig epair7b name vnet0",
            "jexec ioc-web ifconfig vnet0 inet 10.0.0.5/24 alias",
            "jexec ioc-web ifconfig vnet0 inet6 -ifdisabled accept_rtadv up",
            "jexec ioc-web route add default 10.0.0.1",
        ];
        let positions: Vec<usize> = order.iter().map(|c| host.position(c).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(host.called("ifconfig vnet0.4 link 02:ff:60"));
    }

    #[test]
    fn test_failure_destroys_epair() {
        let host = FakeHost::new();
        host.respond("ifconfig epair create", CommandOutput::ok("epair7a\n"));
        host.respond("ifconfig bridge0 addm", CommandOutput::failed(1, "ifconfig: BRDGADD vnet0.4: File exists"));

        assert!(attach(&host, "ioc-web", 4, &nic("vnet0", "bridge0"), None).is_err());
        assert!(host.called("ifconfig vnet0.4 destroy"));
        assert!(!host.called("ifconfig epair7b vnet"));
    }

    #[test]
    fn test_rename_failure_destroys_original_name() {
        let host = FakeHost::new();
        host.respond("ifconfig epair create", CommandOutput::ok("epair7a\n"));
        host.respond("ifconfig epair7a name", CommandOutput::failed(1, "ifconfig: SIOCSIFNAME: File exists"));

        assert!(attach(&host, "ioc-web", 4, &nic("vnet0", "bridge0"), None).is_err());
        assert!(host.called("ifconfig epair7a destroy"));
    }

    #[test]
    fn test_uplink_joins_bridge_once() {
        let host = FakeHost::new();
        host.respond("ifconfig epair create", CommandOutput::ok("epair0a\n"));
        let mut vnet0 = nic("vnet0", "bridge0");
        vnet0.uplink = Some("em0".into());
        attach(&host, "ioc-web", 2, &vnet0, None).unwrap();
        assert!(host.called("ifconfig bridge0 addm em0 up"));

        let host = FakeHost::new();
        host.respond("ifconfig epair create", CommandOutput::ok("epair0a\n"));
        host.respond(
            "ifconfig bridge0",
            CommandOutput::ok("bridge0: flags=8843<UP> mtu 1500\n\tmember: em0 flags=143<LEARNING>\n"),
        );
        host.respond("ifconfig bridge0 addm", CommandOutput::ok(""));
        attach(&host, "ioc-web", 2, &vnet0, None).unwrap();
        assert!(!host.called("ifconfig bridge0 addm em0"));
    }

    #[test]
    fn test_detach() {
        let host = FakeHost::new();
        let atts = vec![
            NetworkAttachment {
                nic: "vnet0".into(),
                host_interface: "vnet0.4".into(),
            },
            NetworkAttachment {
                nic: "vnet1".into(),
                host_interface: "vnet1.4".into(),
            },
        ];
        assert!(detach(&host, &atts).is_empty());
        assert!(host.called("ifconfig vnet0.4 destroy"));
        assert!(host.called("ifconfig vnet1.4 destroy"));
    }
}
