//! Dynamic devfs rulesets
//!
//! Each starting jail gets its own ruleset: the lowest id above the
//! reserved floor that the host does not report in use, filled with a copy
//! of the jail's base ruleset plus any devices the jail asks for. Stop
//! removes that id and nothing else.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::host::HostCommand;
use crate::lock::FileLock;
use crate::parse;

/// Ruleset allocation and release
pub struct DevfsRulesets<'a> {
    ctx: &'a Context,
}

impl<'a> DevfsRulesets<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    fn devfs(&self, args: &[&str]) -> Result<String> {
        self.ctx.host().check(&HostCommand::new("devfs").args(args.iter().copied()))
    }

    /// Ruleset ids the host has loaded
    pub fn in_use(&self) -> Result<Vec<u32>> {
        parse::devfs::parse_showsets(&self.devfs(&["rule", "showsets"])?)
    }

    /// Claim a ruleset cloned from `base`, with `paths` unhidden on top
    pub fn allocate(&self, base: u32, paths: &[&str]) -> Result<u32> {
        let _lock = FileLock::acquire(&self.ctx.run_dir().join("devfs.lock"))?;

        let floor = self.ctx.settings().devfs.floor;
        let used = self.in_use()?;
        let id = (floor + 1..=u16::MAX as u32)
            .find(|id| !used.contains(id))
            .ok_or_else(|| Error::allocation("devfs ruleset", "no free ruleset id"))?;

        let mut rules = parse::devfs::parse_rules(&self.devfs(&["rule", "-s", &base.to_string(), "show"])?)?;
        if rules.is_empty() {
            rules.push(format!("include {}", base));
        }
        rules.extend(paths.iter().map(|p| format!("path '{}' unhide", p)));

        let set = id.to_string();
        for rule in &rules {
            let mut args = vec!["rule", "-s", set.as_str(), "add"];
            args.extend(rule.split_whitespace().map(|t| t.trim_matches('\'')));
            if let Err(e) = self.devfs(&args) {
                // drop the half-filled set
                if let Err(cleanup) = self.devfs(&["rule", "-s", &set, "delset"]) {
                    tracing::warn!(ruleset = id, error = %cleanup, "could not remove partial devfs ruleset");
                }
                return Err(Error::allocation("devfs ruleset", e.to_string()));
            }
        }

        tracing::info!(ruleset = id, base, "devfs ruleset allocated");
        Ok(id)
    }

    /// Drop a ruleset this jail allocated; reserved ids are never touched
    pub fn release(&self, id: u32) -> Result<bool> {
        if id <= self.ctx.settings().devfs.floor {
            tracing::warn!(ruleset = id, "refusing to remove protected devfs ruleset");
            return Ok(false);
        }
        self.devfs(&["rule", "-s", &id.to_string(), "delset"])?;
        tracing::info!(ruleset = id, "devfs ruleset removed");
        Ok(true)
    }
}
