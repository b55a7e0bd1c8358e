//! Stop sequence
//!
//! Teardown is driven by the runtime artifact written at start, so it
//! undoes what was actually set up rather than what the configuration
//! says now. Only removing the jail itself is fatal; every other step is
//! logged and the sequence carries on.

use super::{LifecycleController, meta};
use crate::config::JailConfig;
use crate::devfs::DevfsRulesets;
use crate::error::{Error, Result};
use crate::hooks::HookPhase;
use crate::host::HostCommand;
use crate::jail::state::{JailState, Transition};
use crate::lock::FileLock;
use crate::network::NetworkProvisioner;
use crate::rctl::ResourceLimiter;
use crate::runtime::RuntimeArtifact;
use crate::storage::StorageManager;

impl LifecycleController<'_> {
    pub(super) fn stop_config(&self, cfg: &JailConfig, force: bool) -> Result<()> {
        let name = cfg.name();
        let _lock = FileLock::try_jail(&cfg.record.lock_path(self.ctx), name)?;

        let state = JailState::observe(self.ctx, &cfg.record);
        let leftovers = cfg.record.runtime_path(self.ctx).exists();
        if state != JailState::Running && !leftovers {
            return Err(Error::NotRunning(name.to_string()));
        }

        let mut transition = Transition::from_observed(name, state)?;
        let running = state == JailState::Running;
        if running {
            transition.stop()?;
            tracing::info!(jail = name, force, "stopping");
        } else {
            tracing::warn!(jail = name, "jail is gone, clearing what it left behind");
        }

        self.teardown(cfg, force)?;

        if running {
            transition.stopped()?;
        }
        tracing::info!(jail = name, "stopped");
        Ok(())
    }

    /// Undo a start, as far as it got
    ///
    /// Also the cleanup path of a failed start, which passes `force`.
    pub(super) fn teardown(&self, cfg: &JailConfig, force: bool) -> Result<()> {
        let ctx = self.ctx;
        let name = cfg.name();
        let kernel = cfg.record.kernel_name();
        let artifact_path = cfg.record.runtime_path(ctx);
        let mount_table = cfg.record.mount_table_path(ctx);
        let storage = StorageManager::new(ctx);

        let artifact = match RuntimeArtifact::load(&artifact_path) {
            Ok(artifact) => artifact.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(jail = name, error = %e, "unreadable runtime artifact");
                RuntimeArtifact::default()
            }
        };
        let jid = ctx.host().jail_id(&kernel);
        let hooks = self.hooks(cfg);
        let hctx = self.hook_context(cfg, jid, None);
        let warn = |step: &str, e: &Error| {
            tracing::warn!(jail = name, step, error = %e, "teardown step failed");
        };

        if jid.is_some() {
            if !force && let Err(e) = hooks.execute_phase(HookPhase::PreStop, &hctx) {
                warn("prestop", &e);
            }
            if let Err(e) = hooks.execute_phase(HookPhase::Stop, &hctx) {
                warn("stop", &e);
            }
            for e in storage.detach_jail_zfs(&kernel, &artifact.meta_list(meta::JAIL_ZFS)) {
                warn("jail_zfs", &e);
            }
        }

        for e in NetworkProvisioner::new(ctx).detach(&artifact, jid) {
            warn("network", &e);
        }

        let limits = artifact.meta_list(meta::RCTL);
        if !limits.is_empty() {
            for e in ResourceLimiter::new(ctx).remove(&kernel, &limits) {
                warn("limits", &e);
            }
        }

        if let Some(id) = artifact
            .meta(meta::DEVFS_RULESET)
            .and_then(|v| v.parse::<u32>().ok())
            && let Err(e) = DevfsRulesets::new(ctx).release(id)
        {
            warn("devfs", &e);
        }

        if jid.is_some() {
            ctx.host()
                .check(&HostCommand::new("jail").args(["-r", kernel.as_str()]))
                .map_err(|e| e.in_phase("remove"))?;
            tracing::info!(jail = name, "jail removed");
        }

        for e in storage.unmount_all(cfg, &mount_table) {
            warn("unmount", &e);
        }

        if let Err(e) = hooks.execute_phase(HookPhase::PostStop, &self.hook_context(cfg, None, None)) {
            warn("poststop", &e);
        }

        for path in [&artifact_path, &mount_table] {
            if let Err(e) = RuntimeArtifact::remove(path) {
                warn("cleanup", &e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::write_jail;
    use super::*;
    use crate::context::testing::TestEnv;
    use crate::error::ErrorKind;
    use crate::host::{CommandOutput, Host};

    const HOOKED: &str = r#"{
        "release": "14.1-RELEASE",
        "ip4_addr": "em0|10.0.0.5/24",
        "exec_prestop": "echo bye",
        "exec_poststop": "logger down"
    }"#;

    #[test]
    fn test_stop_sequence() {
        let env = TestEnv::new();
        let record = write_jail(&env, "web", HOOKED);
        let controller = LifecycleController::new(&env.ctx);
        controller.start("web").unwrap();

        controller.stop("web", false).unwrap();
        assert!(!env.host.is_running("ioc-web"));

        let order = [
            "/bin/sh -c echo bye",
            "jexec -U root ioc-web /bin/sh -c /bin/sh /etc/rc.shutdown",
            "ifconfig em0 inet 10.0.0.5 -alias",
            "devfs rule -s 5 delset",
            "jail -r ioc-web",
            "umount -f",
            "/bin/sh -c logger down",
        ];
        let positions: Vec<usize> = order.iter().map(|c| env.host.position(c).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));

        assert!(!record.runtime_path(&env.ctx).exists());
        assert!(!record.mount_table_path(&env.ctx).exists());
    }

    #[test]
    fn test_force_skips_prestop() {
        let env = TestEnv::new();
        write_jail(&env, "web", HOOKED);
        let controller = LifecycleController::new(&env.ctx);
        controller.start("web").unwrap();

        controller.stop("web", true).unwrap();
        assert!(!env.host.called("/bin/sh -c echo bye"));
        assert!(env.host.called("/bin/sh -c logger down"));
    }

    #[test]
    fn test_stop_not_running() {
        let env = TestEnv::new();
        write_jail(&env, "web", HOOKED);
        let err = LifecycleController::new(&env.ctx).stop("web", false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotRunning);
        assert!(!env.host.called("jail -r"));
    }

    #[test]
    fn test_teardown_continues_past_failures() {
        let env = TestEnv::new();
        let record = write_jail(&env, "web", HOOKED);
        let controller = LifecycleController::new(&env.ctx);
        controller.start("web").unwrap();

        env.host.respond("/bin/sh -c echo bye", CommandOutput::failed(1, "nope"));
        env.host.respond("ifconfig em0 inet 10.0.0.5 -alias", CommandOutput::failed(1, "ifconfig: em0: no such interface"));
        env.host.respond("devfs rule -s 5 delset", CommandOutput::failed(1, "devfs: ioctl DEVFSIO_SDEL: Device busy"));

        controller.stop("web", false).unwrap();
        assert!(!env.host.is_running("ioc-web"));
        assert!(env.host.called("/bin/sh -c logger down"));
        assert!(!record.runtime_path(&env.ctx).exists());
    }

    #[test]
    fn test_remove_failure_is_fatal() {
        let env = TestEnv::new();
        let record = write_jail(&env, "web", HOOKED);
        let controller = LifecycleController::new(&env.ctx);
        controller.start("web").unwrap();

        env.host.respond("jail -r", CommandOutput::failed(1, "jail: ioc-web: Device busy"));
        let err = controller.stop("web", false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalProcess);
        assert!(err.to_string().starts_with("remove:"));
        assert!(env.host.is_running("ioc-web"));
        // Kept so a second stop can finish the job
        assert!(record.runtime_path(&env.ctx).exists());
    }

    #[test]
    fn test_stop_clears_leftovers_of_a_vanished_jail() {
        let env = TestEnv::new();
        let record = write_jail(&env, "web", HOOKED);
        let controller = LifecycleController::new(&env.ctx);
        controller.start("web").unwrap();
        // The kernel lost the jail without us
        env.host.run(&HostCommand::new("jail").args(["-r", "ioc-web"])).unwrap();

        controller.stop("web", false).unwrap();
        assert!(!record.runtime_path(&env.ctx).exists());
        assert!(env.host.called("devfs rule -s 5 delset"));
    }

    #[test]
    fn test_vanished_vnet_jail_releases_host_epairs() {
        let env = TestEnv::new();
        write_jail(
            &env,
            "web",
            r#"{"release": "14.1-RELEASE", "vnet": "on", "ip4_addr": "10.0.0.5/24", "defaultrouter": "10.0.0.1"}"#,
        );
        env.host.respond("ifconfig epair create", CommandOutput::ok("epair0a\n"));
        let controller = LifecycleController::new(&env.ctx);
        controller.start("web").unwrap();
        env.host.run(&HostCommand::new("jail").args(["-r", "ioc-web"])).unwrap();
        assert!(!env.host.called("ifconfig vnet0.1 destroy"));

        controller.stop("web", false).unwrap();
        assert!(env.host.called("ifconfig vnet0.1 destroy"));
    }

    #[test]
    fn test_restart() {
        let env = TestEnv::new();
        write_jail(&env, "web", HOOKED);
        let controller = LifecycleController::new(&env.ctx);
        controller.start("web").unwrap();
        controller.restart("web").unwrap();

        assert!(env.host.is_running("ioc-web"));
        assert_eq!(env.host.calls_matching("jail -c").len(), 2);
        assert!(env.host.position("jail -r ioc-web").unwrap() < env.host.calls().iter().rposition(|c| c.starts_with("jail -c")).unwrap());
    }
}
