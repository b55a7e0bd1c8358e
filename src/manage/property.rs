//! Reading and writing jail properties
//!
//! `set` validates every assignment before writing any. On a running jail
//! the values jail(8) can change in place are pushed with `jail -m`;
//! `template` moves the jail between `jails/` and `templates/`.

use super::{JailManager, relocate_dir};
use crate::config::address::{Family, parse_addresses};
use crate::config::schema::{self, Storage};
use crate::config::JailConfig;
use crate::error::{Error, Result};
use crate::host::HostCommand;
use crate::jail::record::{JailRecord, Location};
use crate::jail::resolve;
use crate::lock::FileLock;
use crate::parse;
use crate::storage::StorageManager;
use crate::zfs::DatasetOrchestrator;

/// Properties whose first underscore alone becomes a dot
const SINGLE_PERIOD: &[&str] = &["allow_raw_sockets", "allow_socket_af", "allow_set_hostname"];

/// jail(8) parameter a property maps to, if the kernel knows it
fn param_name(key: &str, params: &[String]) -> Option<String> {
    let candidates = if SINGLE_PERIOD.contains(&key) {
        vec![key.replacen('_', ".", 1)]
    } else {
        vec![key.replace('_', "."), key.replacen('_', ".", 1), key.to_string()]
    };
    candidates.into_iter().find(|c| params.contains(c))
}

impl JailManager<'_> {
    /// One property, or every property for `all`
    pub fn get(&self, reference: &str, key: &str) -> Result<Vec<(String, String)>> {
        let cfg = self.store.load_ref(reference)?;
        if key == "all" {
            return schema::PROPERTIES
                .iter()
                .map(|spec| Ok((spec.name.to_string(), self.store.get_property(&cfg, spec.name)?)))
                .collect();
        }
        Ok(vec![(key.to_string(), self.store.get_property(&cfg, key)?)])
    }

    /// Host-wide defaults, one property or `all`
    pub fn get_defaults(&self, key: &str) -> Result<Vec<(String, String)>> {
        let defaults = self.store.defaults()?;
        let value = |name: &str| defaults.get(name, None).unwrap_or_else(|| "-".to_string());
        if key == "all" {
            return Ok(schema::PROPERTIES
                .iter()
                .map(|spec| (spec.name.to_string(), value(spec.name)))
                .collect());
        }
        schema::lookup(key).ok_or_else(|| Error::InvalidProperty(key.to_string()))?;
        Ok(vec![(key.to_string(), value(key))])
    }

    pub fn set_defaults(&self, assignments: &[(String, String)]) -> Result<()> {
        self.store.set_defaults(assignments).map(|_| ())
    }

    /// Apply `key=value` assignments to a jail; an empty value drops the
    /// explicit setting
    pub fn set(&self, reference: &str, assignments: &[(String, String)]) -> Result<()> {
        let mut cfg = self.store.load_ref(reference)?;

        for (key, value) in assignments {
            let spec = schema::lookup(key).ok_or_else(|| Error::InvalidProperty(key.clone()))?;
            match spec.storage {
                Storage::Managed => return Err(Error::invalid_value(key, "is managed by ironcage")),
                Storage::DatasetReadOnly => return Err(Error::invalid_value(key, "is read-only")),
                _ => {}
            }
            if !value.is_empty() || key == "template" {
                schema::validate(key, value, Some(cfg.facts()))?;
            }
        }

        let jid = self.ctx.host().jail_id(&cfg.record.kernel_name());
        let params = match jid {
            Some(_) => self.jail_params()?,
            None => Vec::new(),
        };

        for (key, value) in assignments {
            if key == "template" {
                cfg = self.set_template(cfg, value)?;
                continue;
            }
            if value.is_empty() {
                self.store.unset_property(&mut cfg, key)?;
                tracing::info!(jail = %cfg.name(), key = %key, "property reverted to default");
                continue;
            }
            let normalized = self.store.set_property(&mut cfg, key, value)?;
            if let Some(jid) = jid {
                self.push_live(&cfg, jid, &params, key, &normalized)?;
            }
        }
        Ok(())
    }

    /// Parameters the running kernel accepts
    fn jail_params(&self) -> Result<Vec<String>> {
        let out = self
            .ctx
            .host()
            .check(&HostCommand::new("sysctl").args(["-N", "security.jail.param"]))?;
        Ok(parse::jls::parse_jail_params(&out))
    }

    fn push_live(&self, cfg: &JailConfig, jid: i32, params: &[String], key: &str, value: &str) -> Result<()> {
        let value = match key {
            "vnet" => {
                tracing::info!(jail = %cfg.name(), "vnet changes apply on the next start");
                return Ok(());
            }
            "ip4_addr" | "ip6_addr" if cfg.is_on("vnet") => return Ok(()),
            "ip4_addr" | "ip6_addr" => {
                let family = if key == "ip4_addr" { Family::V4 } else { Family::V6 };
                let addresses: Vec<String> = parse_addresses(family, value)?
                    .iter()
                    .filter_map(|spec| spec.ip())
                    .map(|ip| ip.to_string())
                    .collect();
                if addresses.is_empty() {
                    return Ok(());
                }
                addresses.join(",")
            }
            _ => value.to_string(),
        };
        let Some(param) = param_name(key, params) else {
            return Ok(());
        };

        self.ctx.host().check(&HostCommand::new("jail").args([
            "-m".to_string(),
            format!("jid={}", jid),
            format!("{}={}", param, value),
        ]))?;
        tracing::info!(jail = %cfg.name(), jid, param = %param, "applied to running jail");
        Ok(())
    }

    /// Running jails cloned from this jail's root
    fn running_clones(&self, cfg: &JailConfig) -> Result<Vec<String>> {
        let zfs = DatasetOrchestrator::new(self.ctx);
        let prefixes = [Location::Jails, Location::Templates]
            .map(|location| format!("{}@", JailRecord::new(cfg.name(), location).root_dataset(self.ctx)));

        let mut clones = Vec::new();
        for record in resolve::list_records(self.ctx)? {
            if record.name == cfg.name() || self.ctx.host().jail_id(&record.kernel_name()).is_none() {
                continue;
            }
            let root = record.root_dataset(self.ctx);
            if !zfs.exists(&root)? {
                continue;
            }
            if let Some(origin) = zfs.get(&root, "origin")?
                && prefixes.iter().any(|p| origin.starts_with(p.as_str()))
            {
                clones.push(record.name);
            }
        }
        Ok(clones)
    }

    /// Turn a jail into a template (`yes`) or back (`no`)
    fn set_template(&self, cfg: JailConfig, value: &str) -> Result<JailConfig> {
        let normalized = schema::validate("template", value, Some(cfg.facts()))?;
        let target = if normalized == "yes" { Location::Templates } else { Location::Jails };
        if cfg.record.location == target {
            return Ok(cfg);
        }

        self.ensure_stopped(&cfg, "changing template")?;
        let clones = self.running_clones(&cfg)?;
        if !clones.is_empty() {
            return Err(Error::InvalidConfiguration(format!(
                "clones of '{}' are running: {}",
                cfg.name(),
                clones.join(", ")
            )));
        }

        let name = cfg.name().to_string();
        let _lock = FileLock::try_jail(&cfg.record.lock_path(self.ctx), &name)?;
        let zfs = DatasetOrchestrator::new(self.ctx);
        let from = cfg.record.clone();
        let to = JailRecord::new(name.as_str(), target);

        if target == Location::Templates {
            for dataset in StorageManager::new(self.ctx).jail_zfs_datasets(&cfg) {
                if let Err(e) = zfs.set(&dataset, "jailed", "off") {
                    tracing::debug!(dataset = %dataset, error = %e, "could not unjail dataset");
                }
            }
        }

        zfs.rename(&from.dataset(self.ctx), &to.dataset(self.ctx))?;
        let moved = self.finish_move(&cfg, &to, &normalized).inspect_err(|e| {
            tracing::error!(jail = %name, error = %e, "template change failed, reverting");
            if let Err(e) = relocate_dir(&to.dir(self.ctx), &from.dir(self.ctx)) {
                tracing::warn!(jail = %name, error = %e, "failed to move directory back");
            }
            if let Err(e) = zfs.rename(&to.dataset(self.ctx), &from.dataset(self.ctx)) {
                tracing::warn!(jail = %name, error = %e, "failed to rename dataset back");
                return;
            }
            if from.location == Location::Jails
                && let Err(e) = zfs.set(&from.dataset(self.ctx), "readonly", "off")
            {
                tracing::warn!(jail = %name, error = %e, "failed to make dataset writable again");
            }
        })?;

        tracing::info!(jail = %name, location = %target, "template flag changed");
        Ok(moved)
    }

    /// Everything after the dataset reached its new location
    fn finish_move(&self, cfg: &JailConfig, to: &JailRecord, template: &str) -> Result<JailConfig> {
        let zfs = DatasetOrchestrator::new(self.ctx);
        relocate_dir(&cfg.record.dir(self.ctx), &to.dir(self.ctx))?;
        if to.location == Location::Jails {
            zfs.set(&to.dataset(self.ctx), "readonly", "off")?;
        }

        let mut doc = cfg.document().clone();
        doc.set("template", template);
        doc.set("type", if to.location == Location::Templates { "template" } else { "jail" });
        let moved = JailConfig::new(to.clone(), doc, self.store.defaults()?);
        self.store.save(&moved)?;
        Ok(moved)
    }
}
