//! Epair interfaces for VNET jails
//!
//! An epair is a virtual Ethernet pair. The `a` end stays on the host and
//! is renamed `<nic>.<jid>`; the `b` end is moved into the jail.

use crate::error::{Error, Result};
use crate::host::{Host, HostCommand};

pub(crate) fn ifconfig<I, S>(host: &dyn Host, args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    host.check(&HostCommand::new("ifconfig").args(args))
}

/// A freshly created pair, before either end is renamed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Epair {
    pub host_side: String,
    pub jail_side: String,
}

impl Epair {
    pub fn create(host: &dyn Host) -> Result<Self> {
        let out = ifconfig(host, ["epair", "create"])?;
        // Output is something like "epair0a\n"
        let host_side = out.trim().to_string();
        let jail_side = host_side
            .strip_suffix('a')
            .map(|s| format!("{}b", s))
            .ok_or_else(|| {
                Error::allocation("epair", format!("unexpected epair name '{}'", host_side))
            })?;
        tracing::debug!(host_side = %host_side, jail_side = %jail_side, "epair created");
        Ok(Self {
            host_side,
            jail_side,
        })
    }
}

/// Destroy an interface; one that is already gone is not an error
pub fn destroy(host: &dyn Host, name: &str) -> Result<()> {
    match ifconfig(host, [name, "destroy"]) {
        Ok(_) => Ok(()),
        Err(Error::ExternalProcess { output, .. }) if output.contains("does not exist") => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::CommandOutput;
    use crate::host::testing::FakeHost;

    #[test]
    fn test_create_names_both_ends() {
        let host = FakeHost::new();
        host.respond("ifconfig epair create", CommandOutput::ok("epair3a\n"));
        let epair = Epair::create(&host).unwrap();
        assert_eq!(epair.host_side, "epair3a");
        assert_eq!(epair.jail_side, "epair3b");
    }

    #[test]
    fn test_unexpected_name() {
        let host = FakeHost::new();
        host.respond("ifconfig epair create", CommandOutput::ok("tap0\n"));
        assert!(Epair::create(&host).is_err());
    }

    #[test]
    fn test_destroy_missing_is_ok() {
        let host = FakeHost::new();
        host.respond(
            "ifconfig vnet0.4 destroy",
            CommandOutput::failed(1, "ifconfig: interface vnet0.4 does not exist"),
        );
        assert!(destroy(&host, "vnet0.4").is_ok());
    }
}
