//! Jail lifecycle controller
//!
//! Start and stop are ordered phases over the storage, network and limit
//! components. Each phase checks the cancel flag first and tags its
//! errors with its name. A start that fails after the first side effect
//! runs the stop sequence before the error is returned, so a jail is
//! either fully up or fully down.
//!
//! Every operation on a jail holds that jail's lock file for its whole
//! duration.

mod bulk;
mod start;
mod stop;

pub use bulk::BulkOutcome;

use crate::config::{ConfigStore, JailConfig};
use crate::context::Context;
use crate::error::Result;
use crate::hooks::{Hook, HookContext, HookPhase, HookRunner};

/// Runtime artifact bookkeeping keys
pub(crate) mod meta {
    pub const DEVFS_RULESET: &str = "devfs_ruleset";
    pub const RCTL: &str = "rctl";
    pub const JAIL_ZFS: &str = "jail_zfs";
}

/// Sequences start and stop of jails
pub struct LifecycleController<'a> {
    ctx: &'a Context,
    store: ConfigStore<'a>,
}

impl<'a> LifecycleController<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self {
            ctx,
            store: ConfigStore::new(ctx),
        }
    }

    pub fn store(&self) -> &ConfigStore<'a> {
        &self.store
    }

    /// Start a jail and, first, whatever it depends on
    pub fn start(&self, reference: &str) -> Result<()> {
        let cfg = self.store.load_ref(reference)?;
        self.start_config(cfg, &mut Vec::new())
    }

    /// Stop a jail; `force` skips the prestop hook
    pub fn stop(&self, reference: &str, force: bool) -> Result<()> {
        let cfg = self.store.load_ref(reference)?;
        self.stop_config(&cfg, force)
    }

    pub fn restart(&self, reference: &str) -> Result<()> {
        let cfg = self.store.load_ref(reference)?;
        if self.ctx.host().jail_id(&cfg.record.kernel_name()).is_some() {
            self.stop_config(&cfg, false)?;
        }
        self.start_config(cfg, &mut Vec::new())
    }

    /// Run one phase: honour cancellation and tag failures with the phase
    fn phase<T>(&self, cfg: &JailConfig, name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.ctx.cancel().check().map_err(|e| e.in_phase(name))?;
        tracing::debug!(jail = %cfg.name(), phase = name, "phase");
        f().map_err(|e| e.in_phase(name))
    }

    /// The jail's `exec_*` commands followed by the host-wide hooks
    fn hooks(&self, cfg: &JailConfig) -> HookRunner<'a> {
        let exec_timeout = cfg.number("exec_timeout").unwrap_or(60);
        let stop_timeout = cfg.number("stop_timeout").unwrap_or(30);

        let mut hooks: Vec<Hook> = [
            HookPhase::PreStart,
            HookPhase::Start,
            HookPhase::PostStart,
            HookPhase::PreStop,
            HookPhase::Stop,
            HookPhase::PostStop,
        ]
        .into_iter()
        .filter_map(|phase| {
            let timeout = match phase {
                HookPhase::PreStop | HookPhase::Stop | HookPhase::PostStop => stop_timeout,
                _ => exec_timeout,
            };
            Hook::from_property(phase, &cfg.get(phase.property()), timeout)
        })
        .collect();
        hooks.extend(self.ctx.settings().hooks.iter().cloned());

        HookRunner::new(self.ctx, hooks).console_log(cfg.record.console_log(self.ctx))
    }

    fn hook_context(&self, cfg: &JailConfig, jid: Option<i32>, ip: Option<String>) -> HookContext {
        HookContext::new(
            cfg.name(),
            &cfg.record.kernel_name(),
            &cfg.record.root_path(self.ctx),
        )
        .with_jid(jid)
        .with_ip(ip)
        .with_fib(cfg.number("exec_fib").unwrap_or(0))
        .with_user(&cfg.get("exec_jail_user"))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::context::testing::TestEnv;
    use crate::jail::record::{JailRecord, Location};
    use std::fs;

    /// Write a jail directory with the given document
    pub fn write_jail(env: &TestEnv, name: &str, json: &str) -> JailRecord {
        let record = JailRecord::new(name, Location::Jails);
        fs::create_dir_all(record.root_path(&env.ctx)).unwrap();
        fs::write(record.config_path(&env.ctx), json).unwrap();
        record
    }
}
