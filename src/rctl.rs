//! Resource limits
//!
//! Every rctl property of a jail is parsed before anything is applied, so
//! a bad value never leaves the jail with half of its limits. A rule that
//! the kernel rejects removes the ones already added.

use crate::config::JailConfig;
use crate::config::grammar::{self, RctlLimit};
use crate::config::schema;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::host::HostCommand;

/// One limit ready for rctl(8)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitRule {
    pub key: String,
    pub limit: RctlLimit,
}

impl LimitRule {
    /// `jail:<name>:<key>:<action>=<amount>`
    pub fn rule(&self, kernel_name: &str) -> String {
        format!(
            "jail:{}:{}:{}={}",
            kernel_name,
            self.key,
            self.limit.action,
            self.limit.amount_text()
        )
    }
}

/// Check one limit value without applying it
pub fn validate(key: &str, value: &str) -> Result<()> {
    grammar::parse_rctl(key, value).map(|_| ())
}

/// Every limit a jail sets, or the first invalid one
pub fn plan(cfg: &JailConfig) -> Result<Vec<LimitRule>> {
    let mut rules = Vec::new();
    for key in schema::rctl_keys() {
        if let Some(limit) = grammar::parse_rctl(key, &cfg.get(key))? {
            rules.push(LimitRule {
                key: key.to_string(),
                limit,
            });
        }
    }
    Ok(rules)
}

/// CPU list to pin the jail to, checked against the host CPU count
pub fn plan_cpuset(cfg: &JailConfig) -> Result<Option<String>> {
    let value = cfg.get("cpuset");
    Ok(grammar::parse_cpuset(&value, cfg.facts().ncpu)?.map(|_| value))
}

/// rctl(8) and cpuset(1) for running jails
pub struct ResourceLimiter<'a> {
    ctx: &'a Context,
}

impl<'a> ResourceLimiter<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    fn racct_enabled(&self) -> bool {
        self.ctx
            .host()
            .check(&HostCommand::new("sysctl").args(["-n", "kern.racct.enable"]))
            .map(|v| v.trim() == "1")
            .unwrap_or(false)
    }

    /// Add every rule, or none of them
    pub fn apply(&self, kernel_name: &str, rules: &[LimitRule]) -> Result<()> {
        if rules.is_empty() {
            return Ok(());
        }
        if !self.racct_enabled() {
            return Err(Error::allocation(
                "resource limits",
                "kern.racct.enable is not set; add kern.racct.enable=1 to /boot/loader.conf",
            ));
        }

        let mut applied: Vec<String> = Vec::new();
        for rule in rules {
            let text = rule.rule(kernel_name);
            if let Err(e) = self.ctx.host().check(&HostCommand::new("rctl").args(["-a", &text])) {
                for err in self.remove(kernel_name, &applied) {
                    tracing::warn!(jail = kernel_name, error = %err, "could not roll back limit");
                }
                return Err(Error::allocation("resource limits", e.to_string()));
            }
            tracing::debug!(jail = kernel_name, rule = %text, "limit applied");
            applied.push(rule.key.clone());
        }
        tracing::info!(jail = kernel_name, count = applied.len(), "resource limits applied");
        Ok(())
    }

    /// Remove the named limits; an empty list removes all of the jail's
    pub fn remove(&self, kernel_name: &str, keys: &[String]) -> Vec<Error> {
        let filters: Vec<String> = if keys.is_empty() {
            vec![format!("jail:{}", kernel_name)]
        } else {
            keys.iter()
                .map(|k| format!("jail:{}:{}", kernel_name, k))
                .collect()
        };
        filters
            .iter()
            .filter_map(|f| {
                self.ctx
                    .host()
                    .check(&HostCommand::new("rctl").args(["-r", f]))
                    .err()
            })
            .collect()
    }

    /// Pin a running jail to a CPU list
    pub fn pin(&self, jid: i32, cpus: &str) -> Result<()> {
        self.ctx.host().check(
            &HostCommand::new("cpuset")
                .args(["-l", cpus, "-j"])
                .arg(jid.to_string()),
        )?;
        Ok(())
    }
}
