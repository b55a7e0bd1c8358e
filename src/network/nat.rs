//! NAT for VNET jails
//!
//! A NAT jail gets a private block carved out of `nat_prefix` (`a.b` of an
//! `a.b.0.0/16`): the gateway `.1` sits on the host end of its epair, the
//! jail takes `.2`. Blocks are picked under a host-wide lock so two starts
//! never hand out the same one, and a block is skipped when any address in
//! it is already in use on the host or inside a running jail.
//!
//! Translation rules live in one file per backend. The file is rewritten on
//! every start: lines mentioning the jail's address are replaced, every
//! other line (another jail's or an administrator's) is kept as is.

use crate::config::document::write_atomic;
use crate::config::grammar::NatForward;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::host::HostCommand;
use crate::lock::FileLock;
use crate::parse;
use crate::runtime::RuntimeArtifact;
use crate::settings::{NatBackend, NatSettings};
use ipnet::Ipv4Net;
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

/// Marks rule lines written for a jail
const RULE_TAG: &str = "ironcage";

/// Source of addresses that a new block must avoid
pub trait AddressEnumerator {
    fn addresses_in_use(&self) -> Result<Vec<IpAddr>>;
}

/// A jail's NAT block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatBlock {
    pub gateway: Ipv4Addr,
    pub address: Ipv4Addr,
    pub prefix: u8,
}

impl NatBlock {
    /// Read back the block recorded in a runtime artifact
    pub fn from_artifact(artifact: &RuntimeArtifact) -> Option<Self> {
        Some(Self {
            gateway: artifact.meta("nat_gateway")?.parse().ok()?,
            address: artifact.meta("nat_address")?.parse().ok()?,
            prefix: artifact.meta("nat_prefix_len")?.parse().ok()?,
        })
    }

    pub fn record(&self, artifact: &mut RuntimeArtifact) {
        artifact.set_meta("nat_gateway", self.gateway.to_string());
        artifact.set_meta("nat_address", self.address.to_string());
        artifact.set_meta("nat_prefix_len", self.prefix.to_string());
    }
}

fn prefix_network(prefix: &str) -> Result<Ipv4Net> {
    let octets: Vec<u8> = prefix
        .split('.')
        .map(|o| o.parse::<u8>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| Error::invalid_value("nat_prefix", format!("'{}' is not a.b", prefix)))?;
    let [a, b] = octets.as_slice() else {
        return Err(Error::invalid_value(
            "nat_prefix",
            format!("'{}' is not a.b", prefix),
        ));
    };
    Ipv4Net::new(Ipv4Addr::new(*a, *b, 0, 0), 16)
        .map_err(|e| Error::invalid_value("nat_prefix", e.to_string()))
}

/// First block of size `/block` in the prefix that holds no address in use
pub fn allocate(prefix: &str, block: u8, in_use: &[IpAddr]) -> Result<NatBlock> {
    let network = prefix_network(prefix)?;
    let subnets = network
        .subnets(block)
        .map_err(|e| Error::allocation("NAT block", e.to_string()))?;

    for subnet in subnets {
        let taken = in_use.iter().any(|ip| match ip {
            IpAddr::V4(v4) => subnet.contains(v4),
            IpAddr::V6(_) => false,
        });
        if taken {
            continue;
        }
        let base = u32::from(subnet.network());
        return Ok(NatBlock {
            gateway: Ipv4Addr::from(base + 1),
            address: Ipv4Addr::from(base + 2),
            prefix: block,
        });
    }
    Err(Error::allocation(
        "NAT block",
        format!("no free /{} left in {}", block, network),
    ))
}

/// Addresses on the host, inside running jails, and reserved by starting ones
pub struct HostAddresses<'a> {
    ctx: &'a Context,
}

impl<'a> HostAddresses<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    fn interface_addresses(&self, cmd: &HostCommand) -> Result<Vec<IpAddr>> {
        let out = self.ctx.host().check(cmd)?;
        Ok(parse::ifconfig::addresses_by_interface(&out)?
            .into_values()
            .flatten()
            .collect())
    }

    fn reserved(&self) -> Result<Vec<IpAddr>> {
        let entries = match fs::read_dir(self.ctx.run_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut found = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("conf") {
                continue;
            }
            if let Ok(Some(artifact)) = RuntimeArtifact::load(&path)
                && let Some(block) = NatBlock::from_artifact(&artifact)
            {
                found.push(IpAddr::V4(block.gateway));
                found.push(IpAddr::V4(block.address));
            }
        }
        Ok(found)
    }
}

impl AddressEnumerator for HostAddresses<'_> {
    fn addresses_in_use(&self) -> Result<Vec<IpAddr>> {
        let mut all = self.interface_addresses(&HostCommand::new("ifconfig"))?;

        let jls = self
            .ctx
            .host()
            .check(&HostCommand::new("jls").args(["name", "jid"]))
            .unwrap_or_default();
        for (name, _) in parse::jls::parse_running(&jls) {
            if !name.starts_with("ioc-") {
                continue;
            }
            // Jails without their own stack show the host's table or nothing
            match self.interface_addresses(&HostCommand::jexec_argv(&name, ["ifconfig"])) {
                Ok(addrs) => all.extend(addrs),
                Err(e) => tracing::debug!(jail = %name, error = %e, "skipping jail addresses"),
            }
        }

        all.extend(self.reserved()?);
        Ok(all)
    }
}

/// Pick a block and publish it while holding the NAT lock
///
/// `publish` must make the block visible to the next allocator, normally
/// by writing it into the jail's runtime artifact.
pub fn allocate_locked<F>(
    ctx: &Context,
    prefix: &str,
    enumerator: &dyn AddressEnumerator,
    publish: F,
) -> Result<NatBlock>
where
    F: FnOnce(&NatBlock) -> Result<()>,
{
    let _lock = FileLock::acquire(&ctx.run_dir().join("nat.lock"))?;
    let in_use = enumerator.addresses_in_use()?;
    let block = allocate(prefix, ctx.settings().nat.block, &in_use)?;
    publish(&block)?;
    tracing::info!(gateway = %block.gateway, address = %block.address, prefix = block.prefix, "NAT block allocated");
    Ok(block)
}

/// Whether `line` mentions `addr` as a whole token
fn mentions(line: &str, addr: &Ipv4Addr) -> bool {
    let addr = addr.to_string();
    line.split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .any(|token| token == addr)
}

/// Replace a jail's lines in a rule file, keeping everything else
pub fn regenerate(path: &Path, addr: &Ipv4Addr, lines: &[String]) -> Result<()> {
    let existing = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };

    let mut out: Vec<&str> = existing
        .lines()
        .filter(|line| !mentions(line, addr))
        .collect();
    out.extend(lines.iter().map(String::as_str));

    let mut text = out.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    write_atomic(path, text.as_bytes())
}

/// ipfw rule and nat instance number for a jail address
///
/// Numbers start at `ipfw_rule_base`, one per block of the NAT prefix, so
/// rules outside that range are never touched.
pub fn ipfw_id(nat: &NatSettings, addr: &Ipv4Addr) -> u32 {
    let [_, _, c, d] = addr.octets();
    let offset = ((u32::from(c) << 8) | u32::from(d)) >> (32 - u32::from(nat.block));
    nat.ipfw_rule_base + offset
}

/// ipfw commands for one jail, each tagged with its address
pub fn ipfw_lines(id: u32, addr: &Ipv4Addr, iface: &str, forwards: &[NatForward]) -> Vec<String> {
    let tag = format!("# {} {}", RULE_TAG, addr);
    let mut config = format!("nat {} config if {} same_ports unreg_only reset", id, iface);
    for fwd in forwards {
        for proto in fwd.proto.expand() {
            config.push_str(&format!(
                " redirect_port {} {}:{} {}",
                proto, addr, fwd.jail_port, fwd.host_port
            ));
        }
    }

    let mut lines = vec![
        format!("{} {}", config, tag),
        format!("add {} nat {} ip4 from {} to any out via {} {}", id, id, addr, iface, tag),
    ];
    for fwd in forwards {
        for proto in fwd.proto.expand() {
            lines.push(format!(
                "add {} nat {} {} from any to me {} in via {} {}",
                id, id, proto, fwd.host_port, iface, tag
            ));
        }
    }
    lines
}

/// pf anchor rules for one jail
pub fn pf_lines(addr: &Ipv4Addr, iface: &str, forwards: &[NatForward]) -> Vec<String> {
    let mut lines = vec![format!("nat on {} from {} to any -> ({})", iface, addr, iface)];
    for fwd in forwards {
        for proto in fwd.proto.expand() {
            lines.push(format!(
                "rdr pass on {} inet proto {} from any to any port {} -> {} port {}",
                iface, proto, fwd.host_port, addr, fwd.jail_port
            ));
        }
    }
    lines
}

/// Loads and unloads a jail's translation rules
pub struct NatRules<'a> {
    ctx: &'a Context,
}

impl<'a> NatRules<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        self.ctx
            .host()
            .check(&HostCommand::new(program).args(args.iter().copied()))
    }

    fn delete_ipfw(&self, id: u32) {
        let id = id.to_string();
        // Absent rules are fine here
        if let Err(e) = self.run("ipfw", &["-q", "delete", &id]) {
            tracing::debug!(rule = %id, error = %e, "ipfw rule not deleted");
        }
        if let Err(e) = self.run("ipfw", &["-q", "nat", &id, "delete"]) {
            tracing::debug!(rule = %id, error = %e, "ipfw nat instance not deleted");
        }
    }

    /// Write and load the rules for a jail's address
    pub fn install(&self, addr: &Ipv4Addr, iface: &str, forwards: &[NatForward]) -> Result<()> {
        let nat = &self.ctx.settings().nat;
        self.run("sysctl", &["net.inet.ip.forwarding=1"])?;

        match nat.backend {
            NatBackend::Ipfw => {
                let id = ipfw_id(nat, addr);
                let lines = ipfw_lines(id, addr, iface, forwards);
                regenerate(&nat.ipfw_rules, addr, &lines)?;
                self.delete_ipfw(id);
                for line in &lines {
                    let command = line.split('#').next().unwrap_or_default();
                    let mut args = vec!["-q"];
                    args.extend(command.split_whitespace());
                    self.run("ipfw", &args)?;
                }
            }
            NatBackend::Pf => {
                regenerate(&nat.pf_rules, addr, &pf_lines(addr, iface, forwards))?;
                let file = nat.pf_rules.to_string_lossy();
                self.run("pfctl", &["-a", &nat.pf_anchor, "-f", &file])?;
            }
        }
        tracing::info!(address = %addr, interface = iface, forwards = forwards.len(), "NAT rules loaded");
        Ok(())
    }

    /// Take a jail's rules out of the file and the kernel
    pub fn remove(&self, addr: &Ipv4Addr) -> Result<()> {
        let nat = &self.ctx.settings().nat;
        match nat.backend {
            NatBackend::Ipfw => {
                regenerate(&nat.ipfw_rules, addr, &[])?;
                self.delete_ipfw(ipfw_id(nat, addr));
            }
            NatBackend::Pf => {
                regenerate(&nat.pf_rules, addr, &[])?;
                let file = nat.pf_rules.to_string_lossy();
                self.run("pfctl", &["-a", &nat.pf_anchor, "-f", &file])?;
            }
        }
        tracing::debug!(address = %addr, "NAT rules removed");
        Ok(())
    }
}
