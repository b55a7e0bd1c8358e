//! Bridge interfaces (if_bridge)

use super::epair::ifconfig;
use crate::error::Result;
use crate::host::{Host, HostCommand};
use crate::parse;

/// Create `bridge` unless the host already has it; returns its members
pub fn ensure(host: &dyn Host, bridge: &str) -> Result<Vec<String>> {
    let probe = host.run(&HostCommand::new("ifconfig").arg(bridge))?;
    if probe.success() {
        let members = parse::ifconfig::parse_interfaces(&probe.stdout)?
            .into_iter()
            .find(|i| i.name == bridge)
            .map(|i| i.members)
            .unwrap_or_default();
        return Ok(members);
    }
    ifconfig(host, [bridge, "create"])?;
    ifconfig(host, [bridge, "up"])?;
    tracing::info!(bridge, "bridge created");
    Ok(Vec::new())
}

/// Add an interface to a bridge
pub fn add_member(host: &dyn Host, bridge: &str, member: &str) -> Result<()> {
    ifconfig(host, [bridge, "addm", member, "up"])?;
    Ok(())
}
