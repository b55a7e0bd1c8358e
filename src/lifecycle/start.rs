//! Start sequence
//!
//! 1. validate: templates, hostid, network, limits (no side effects)
//! 2. dependencies, recursively
//! 3. prestart hooks
//! 4. storage: datasets, pseudo filesystems, mount table, resolver
//! 5. resources: devfs ruleset, runtime artifact, NAT block
//! 6. create: `jail -c`
//! 7. network, delegated datasets, limits
//! 8. start hooks inside the jail, then poststart

use super::{LifecycleController, meta};
use crate::config::JailConfig;
use crate::config::address::AddressSpec;
use crate::devfs::DevfsRulesets;
use crate::environ;
use crate::error::{Error, Result};
use crate::hooks::HookPhase;
use crate::host::HostCommand;
use crate::jail::state::{JailState, Transition};
use crate::lock::FileLock;
use crate::network::nat::HostAddresses;
use crate::network::{self, NetworkPlan, NetworkProvisioner, vnet};
use crate::rctl::{self, LimitRule, ResourceLimiter};
use crate::runtime::{self, ParamInputs, RuntimeArtifact};
use crate::storage::StorageManager;
use crate::sys::OsVersion;
use crate::zfs::DatasetOrchestrator;

/// What a start will do, worked out before it does anything
struct StartPlan {
    network: NetworkPlan,
    limits: Vec<LimitRule>,
    cpuset: Option<String>,
}

impl StartPlan {
    /// Address handed to hooks as `${jail_ip}`
    fn first_address(&self) -> Option<String> {
        let spec = match &self.network {
            NetworkPlan::Shared { ip4, .. } => ip4.first(),
            NetworkPlan::Vnet { nics, .. } => nics.first().and_then(|n| n.ip4.first()),
            NetworkPlan::Nat { .. } => None,
        };
        spec.and_then(AddressSpec::ip).map(|ip| ip.to_string())
    }
}

/// Devices unhidden on top of the base ruleset
fn device_paths(cfg: &JailConfig) -> Vec<&'static str> {
    let mut paths = Vec::new();
    if cfg.is_on("bpf") {
        paths.push("bpf*");
    }
    if cfg.is_on("allow_tun") {
        paths.push("tun*");
    }
    paths
}

impl LifecycleController<'_> {
    /// Start a loaded jail; `chain` holds the dependents waiting on it
    pub(super) fn start_config(&self, mut cfg: JailConfig, chain: &mut Vec<String>) -> Result<()> {
        let name = cfg.name().to_string();

        if cfg.record.is_template() {
            return Err(Error::InvalidConfiguration(format!(
                "'{}' is a template and cannot be started",
                name
            )));
        }
        if self.ctx.host().jail_id(&cfg.record.kernel_name()).is_some() {
            return Err(Error::AlreadyExists(format!("running jail '{}'", name)));
        }
        let plan = self.plan(&cfg).map_err(|e| e.in_phase("validate"))?;

        let _lock = FileLock::try_jail(&cfg.record.lock_path(self.ctx), &name)?;
        let state = JailState::observe(self.ctx, &cfg.record);
        if state == JailState::Running {
            return Err(Error::AlreadyExists(format!("running jail '{}'", name)));
        }

        chain.push(name.clone());
        let dependencies = self.start_dependencies(&cfg, chain);
        chain.pop();
        dependencies?;

        let mut transition = Transition::from_observed(&name, state)?;
        transition.start()?;
        tracing::info!(jail = %name, "starting");

        let jid = match self.bring_up(&cfg, &plan) {
            Ok(jid) => jid,
            Err(primary) => {
                tracing::error!(jail = %name, error = %primary, "start failed, stopping");
                transition.stop().ok();
                if let Err(e) = self.teardown(&cfg, true) {
                    tracing::warn!(jail = %name, error = %e, "cleanup after failed start");
                }
                transition.stopped().ok();
                return Err(primary);
            }
        };
        transition.started()?;
        tracing::info!(jail = %name, jid, "started");

        let started = chrono::Utc::now().format("%F %T").to_string();
        let mut derived = vec![("last_started".to_string(), started)];
        derived.extend(
            plan.network
                .mac_values()
                .into_iter()
                .filter(|(key, _)| !cfg.is_explicit(key)),
        );
        for (key, value) in derived {
            if let Err(e) = self.store.record_derived(&mut cfg, &key, &value) {
                tracing::warn!(jail = %name, key = %key, error = %e, "could not record derived value");
            }
        }
        Ok(())
    }

    fn plan(&self, cfg: &JailConfig) -> Result<StartPlan> {
        if cfg.is_on("hostid_strict_check") {
            let host_id = cfg.facts().hostid.clone().unwrap_or_default();
            let jail_id = cfg.get("hostid");
            if jail_id != host_id {
                return Err(Error::InvalidConfiguration(format!(
                    "hostid {} does not match the host ({})",
                    jail_id, host_id
                )));
            }
        }

        Ok(StartPlan {
            network: NetworkPlan::plan(cfg, cfg.facts().default_iface.as_deref())?,
            limits: rctl::plan(cfg)?,
            cpuset: rctl::plan_cpuset(cfg)?,
        })
    }

    fn start_dependencies(&self, cfg: &JailConfig, chain: &mut Vec<String>) -> Result<()> {
        let depends = cfg.get("depends");
        for dependency in depends.split_whitespace().filter(|d| *d != "none") {
            let failure = |source: Error| Error::DependencyFailure {
                jail: cfg.name().to_string(),
                dependency: dependency.to_string(),
                source: Box::new(source),
            };

            let dep = self.store.load_ref(dependency).map_err(failure)?;
            if chain.iter().any(|n| n == dep.name()) {
                return Err(failure(Error::InvalidConfiguration(format!(
                    "dependency cycle {} -> {}",
                    chain.join(" -> "),
                    dep.name()
                ))));
            }
            if self.ctx.host().jail_id(&dep.record.kernel_name()).is_some() {
                tracing::debug!(jail = %cfg.name(), dependency = %dep.name(), "dependency already running");
                continue;
            }

            tracing::info!(jail = %cfg.name(), dependency = %dep.name(), "starting dependency");
            self.start_config(dep, chain).map_err(failure)?;
        }
        Ok(())
    }

    /// Every phase after validation; returns the new jail's id
    fn bring_up(&self, cfg: &JailConfig, plan: &StartPlan) -> Result<i32> {
        let ctx = self.ctx;
        let record = &cfg.record;
        let kernel = record.kernel_name();
        let root = record.root_path(ctx);
        let artifact_path = record.runtime_path(ctx);
        let hooks = self.hooks(cfg);
        let storage = StorageManager::new(ctx);
        let ip = plan.first_address();

        self.phase(cfg, "prestart", || {
            hooks.execute_phase(HookPhase::PreStart, &self.hook_context(cfg, None, ip.clone()))
        })?;

        let (mount_table, datasets) = self.phase(cfg, "storage", || {
            let zfs = DatasetOrchestrator::new(ctx);
            zfs.mount(&record.dataset(ctx))?;
            zfs.mount(&record.root_dataset(ctx))?;
            let datasets = storage.prepare_jail_zfs(cfg)?;
            storage.mount_pseudo(cfg)?;
            let table = storage.write_mount_table(cfg)?;
            environ::prepare(cfg, &root)?;
            Ok((table, datasets))
        })?;

        let mut artifact = self.phase(cfg, "resources", || {
            let base = cfg
                .number("devfs_ruleset")
                .unwrap_or(ctx.settings().devfs.base_ruleset);
            let ruleset = DevfsRulesets::new(ctx).allocate(base, &device_paths(cfg))?;

            // Recorded at once so a failure below still releases it
            let mut claimed = RuntimeArtifact::new();
            claimed.set_meta(meta::DEVFS_RULESET, ruleset.to_string());
            claimed.write(&artifact_path)?;

            let userland = OsVersion::userland(&root, &cfg.get("release"))?;
            let none: &[AddressSpec] = &[];
            let (ip4, ip6) = match &plan.network {
                NetworkPlan::Shared { ip4, ip6 } => (ip4.as_slice(), ip6.as_slice()),
                _ => (none, none),
            };
            let mut artifact = runtime::jail_params(&ParamInputs {
                cfg,
                kernel_name: &kernel,
                root: &root,
                userland: &userland,
                devfs_ruleset: ruleset,
                fstab: &mount_table,
                ip4,
                ip6,
            });

            artifact.set_meta(meta::DEVFS_RULESET, ruleset.to_string());
            let nics = plan.network.nic_names();
            if !nics.is_empty() {
                artifact.set_meta(network::NICS_META, nics.join(","));
            }
            if !plan.limits.is_empty() {
                let keys: Vec<&str> = plan.limits.iter().map(|l| l.key.as_str()).collect();
                artifact.set_meta(meta::RCTL, keys.join(","));
            }
            if !datasets.is_empty() {
                artifact.set_meta(meta::JAIL_ZFS, datasets.join(","));
            }
            artifact.write(&artifact_path)?;

            if let NetworkPlan::Nat { prefix, .. } = &plan.network {
                let block = NetworkProvisioner::new(ctx).allocate_nat_address(
                    prefix,
                    &HostAddresses::new(ctx),
                    &mut artifact,
                    &artifact_path,
                )?;
                tracing::info!(jail = %cfg.name(), address = %block.address, gateway = %block.gateway, "NAT block reserved");
            }
            Ok(artifact)
        })?;

        let jid = self.phase(cfg, "create", || {
            ctx.host()
                .check(&HostCommand::new("jail").arg("-c").args(artifact.args()))?;
            ctx.host()
                .jail_id(&kernel)
                .ok_or_else(|| Error::NotFound(format!("jail '{}' after creation", kernel)))
        })?;
        tracing::info!(jail = %cfg.name(), jid, "jail created");

        self.phase(cfg, "network", || {
            let host_ends: Vec<String> = plan
                .network
                .nic_names()
                .iter()
                .map(|nic| vnet::host_interface(nic, jid))
                .collect();
            if !host_ends.is_empty() {
                artifact.set_meta(network::HOST_NICS_META, host_ends.join(","));
                artifact.write(&artifact_path)?;
            }
            NetworkProvisioner::new(ctx).attach(&kernel, jid, &plan.network, &artifact)
        })?;

        self.phase(cfg, "jail_zfs", || storage.attach_jail_zfs(&kernel, &datasets))?;

        self.phase(cfg, "limits", || {
            let limiter = ResourceLimiter::new(ctx);
            limiter.apply(&kernel, &plan.limits)?;
            if let Some(cpus) = &plan.cpuset {
                limiter.pin(jid, cpus)?;
            }
            Ok(())
        })?;

        self.phase(cfg, "start", || {
            let hctx = self.hook_context(cfg, Some(jid), ip.clone());
            hooks.execute_phase(HookPhase::Start, &hctx)?;
            hooks.execute_phase(HookPhase::PostStart, &hctx)
        })?;

        Ok(jid)
    }
}
