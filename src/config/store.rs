//! Loading, validating and persisting jail configuration

use super::defaults::Defaults;
use super::document::ConfigDocument;
use super::migrate;
use super::schema::{self, Getter, HostFacts, Storage};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::jail::record::JailRecord;
use crate::jail::resolve;
use crate::parse;
use crate::host::HostCommand;
use crate::zfs::{DatasetOrchestrator, ReadonlyGuard};
use std::sync::{Arc, OnceLock};

/// A jail's document together with the defaults it falls back to
#[derive(Debug, Clone)]
pub struct JailConfig {
    pub record: JailRecord,
    doc: ConfigDocument,
    defaults: Arc<Defaults>,
}

impl JailConfig {
    pub fn new(record: JailRecord, doc: ConfigDocument, defaults: Arc<Defaults>) -> Self {
        Self {
            record,
            doc,
            defaults,
        }
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn document(&self) -> &ConfigDocument {
        &self.doc
    }

    /// Identifier used for derived values (MACs, default hostname)
    pub fn uuid(&self) -> &str {
        self.doc
            .get_nonempty("host_hostuuid")
            .filter(|v| *v != "none")
            .unwrap_or(&self.record.name)
    }

    /// Effective value: explicit setting, then defaults, then `none`
    pub fn get(&self, key: &str) -> String {
        if let Some(value) = self.doc.get_nonempty(key) {
            return value.to_string();
        }
        self.defaults
            .get(key, Some(self.uuid()))
            .unwrap_or_else(|| "none".to_string())
    }

    /// Whether a boolean-like property is set
    pub fn is_on(&self, key: &str) -> bool {
        matches!(self.get(key).as_str(), "on" | "yes" | "1")
    }

    pub fn number<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).parse().ok()
    }

    /// Whether a value is set explicitly on this jail
    pub fn is_explicit(&self, key: &str) -> bool {
        self.doc.get_nonempty(key).is_some()
    }

    pub fn facts(&self) -> &HostFacts {
        self.defaults.facts()
    }
}

/// Config access for one command invocation
///
/// Host facts and defaults are gathered on first use and shared by every
/// jail loaded through the store.
pub struct ConfigStore<'a> {
    ctx: &'a Context,
    defaults: OnceLock<Arc<Defaults>>,
}

impl<'a> ConfigStore<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self {
            ctx,
            defaults: OnceLock::new(),
        }
    }

    pub fn context(&self) -> &'a Context {
        self.ctx
    }

    pub fn defaults(&self) -> Result<Arc<Defaults>> {
        if let Some(defaults) = self.defaults.get() {
            return Ok(defaults.clone());
        }
        let loaded = Arc::new(Defaults::load(&self.ctx.defaults_path(), self.ctx.host_facts())?);
        Ok(self.defaults.get_or_init(|| loaded).clone())
    }

    /// Load a jail's configuration, migrating thick documents forward
    ///
    /// A missing jail directory is `NotFound`. A directory without a
    /// readable document, or a document without `release`, is corrupt and
    /// left untouched.
    pub fn load(&self, record: &JailRecord) -> Result<JailConfig> {
        if !record.dir(self.ctx).is_dir() {
            return Err(Error::NotFound(format!("jail '{}'", record.name)));
        }

        let path = record.config_path(self.ctx);
        let corrupt = |message: String| Error::CorruptConfiguration {
            jail: record.name.clone(),
            message,
        };
        if !path.exists() {
            return Err(corrupt("config.json is missing".into()));
        }
        let doc = ConfigDocument::load(&path).map_err(|e| corrupt(e.to_string()))?;
        if doc.get_nonempty("release").is_none() {
            return Err(corrupt("no release is recorded".into()));
        }

        let from = doc.version();
        let (doc, changed) = migrate::migrate(doc);
        let cfg = JailConfig::new(record.clone(), doc, self.defaults()?);
        if changed {
            tracing::info!(jail = %record.name, from = ?from, to = migrate::CURRENT_VERSION, "migrated configuration");
            self.save(&cfg)?;
        }
        Ok(cfg)
    }

    /// Resolve a reference and load it
    pub fn load_ref(&self, reference: &str) -> Result<JailConfig> {
        let record = resolve::resolve(self.ctx, reference)?;
        self.load(&record)
    }

    /// Every jail on the pool, with corrupt ones reported separately
    pub fn load_all(&self) -> Result<Vec<std::result::Result<JailConfig, (JailRecord, Error)>>> {
        Ok(resolve::list_records(self.ctx)?
            .into_iter()
            .map(|record| self.load(&record).map_err(|e| (record, e)))
            .collect())
    }

    /// Write a jail's document; templates are made writable for the write
    pub fn save(&self, cfg: &JailConfig) -> Result<()> {
        let _guard = if cfg.record.is_template() {
            Some(ReadonlyGuard::new(self.ctx, &cfg.record.dataset(self.ctx))?)
        } else {
            None
        };
        cfg.doc.save(&cfg.record.config_path(self.ctx))
    }

    fn is_running(&self, cfg: &JailConfig) -> bool {
        self.ctx.host().jail_id(&cfg.record.kernel_name()).is_some()
    }

    /// Validate and persist a user-supplied value
    ///
    /// Returns the normalized value. Nothing is written when validation
    /// fails.
    pub fn set_property(&self, cfg: &mut JailConfig, key: &str, value: &str) -> Result<String> {
        let spec = schema::lookup(key).ok_or_else(|| Error::InvalidProperty(key.to_string()))?;
        match spec.storage {
            Storage::Managed => {
                return Err(Error::invalid_value(key, "is managed by ironcage"));
            }
            Storage::DatasetReadOnly => {
                return Err(Error::invalid_value(key, "is read-only"));
            }
            _ => {}
        }

        let normalized = schema::validate(key, value, Some(cfg.facts()))?;
        if spec.needs_stopped && self.is_running(cfg) {
            return Err(Error::invalid_value(key, "cannot be changed while the jail is running"));
        }

        if spec.storage == Storage::Dataset {
            DatasetOrchestrator::new(self.ctx).set(&cfg.record.dataset(self.ctx), key, &normalized)?;
        } else {
            cfg.doc.set(key, normalized.clone());
            self.save(cfg)?;
        }
        tracing::info!(jail = %cfg.name(), key, value = %normalized, "property set");
        Ok(normalized)
    }

    /// Drop an explicit value so the default applies again
    pub fn unset_property(&self, cfg: &mut JailConfig, key: &str) -> Result<()> {
        let spec = schema::lookup(key).ok_or_else(|| Error::InvalidProperty(key.to_string()))?;
        match spec.storage {
            Storage::Managed | Storage::DatasetReadOnly => {
                Err(Error::invalid_value(key, "cannot be unset"))
            }
            Storage::Dataset => {
                self.ctx.host().check(
                    &HostCommand::new("zfs")
                        .args(["inherit", key])
                        .arg(cfg.record.dataset(self.ctx)),
                )?;
                Ok(())
            }
            Storage::Config => {
                if cfg.doc.remove(key).is_some() {
                    self.save(cfg)?;
                }
                Ok(())
            }
        }
    }

    /// Persist a value derived at runtime (generated MACs, timestamps)
    pub fn record_derived(&self, cfg: &mut JailConfig, key: &str, value: &str) -> Result<()> {
        if cfg.doc.get(key) == Some(value) {
            return Ok(());
        }
        cfg.doc.set(key, value);
        self.save(cfg)
    }

    /// Value as shown to users, including dataset-backed and live values
    pub fn get_property(&self, cfg: &JailConfig, key: &str) -> Result<String> {
        let spec = schema::lookup(key).ok_or_else(|| Error::InvalidProperty(key.to_string()))?;

        if matches!(spec.storage, Storage::Dataset | Storage::DatasetReadOnly) {
            let value = DatasetOrchestrator::new(self.ctx).get(&cfg.record.dataset(self.ctx), key)?;
            return Ok(value.unwrap_or_else(|| "-".to_string()));
        }

        let value = cfg.get(key);
        Ok(match spec.getter {
            Getter::Plain => value,
            Getter::NeverIfNone if value == "none" => "never".to_string(),
            Getter::NeverIfNone => value,
            Getter::LiveDevfsRuleset => {
                if !self.is_running(cfg) {
                    return Ok(value);
                }
                let live = self.ctx.host().check(&HostCommand::new("jls").args([
                    "-j",
                    cfg.record.kernel_name().as_str(),
                    "devfs_ruleset",
                ]))?;
                parse::jls::parse_param(&live).unwrap_or(value)
            }
        })
    }

    /// Set host-wide defaults in defaults.json
    ///
    /// Every assignment is validated before the file is written.
    pub fn set_defaults(&self, assignments: &[(String, String)]) -> Result<Vec<String>> {
        let mut defaults = (*self.defaults()?).clone();
        let normalized = assignments
            .iter()
            .map(|(key, value)| defaults.set(key, value))
            .collect::<Result<Vec<_>>>()?;
        defaults.save(&self.ctx.defaults_path())?;
        for ((key, _), value) in assignments.iter().zip(&normalized) {
            tracing::info!(key = %key, value = %value, "default set");
        }
        Ok(normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::TestEnv;
    use crate::error::ErrorKind;
    use crate::jail::record::Location;
    use std::fs;

    fn write_jail(env: &TestEnv, name: &str, json: &str) -> JailRecord {
        let record = JailRecord::new(name, Location::Jails);
        fs::create_dir_all(record.dir(&env.ctx)).unwrap();
        fs::write(record.config_path(&env.ctx), json).unwrap();
        record
    }

    #[test]
    fn test_missing_and_corrupt() {
        let env = TestEnv::new();
        let store = ConfigStore::new(&env.ctx);

        let absent = JailRecord::new("ghost", Location::Jails);
        assert_eq!(store.load(&absent).unwrap_err().kind(), ErrorKind::NotFound);

        let record = JailRecord::new("empty", Location::Jails);
        fs::create_dir_all(record.dir(&env.ctx)).unwrap();
        assert_eq!(store.load(&record).unwrap_err().kind(), ErrorKind::CorruptConfiguration);

        let record = write_jail(&env, "norel", r#"{"host_hostname": "x"}"#);
        assert_eq!(store.load(&record).unwrap_err().kind(), ErrorKind::CorruptConfiguration);

        let record = write_jail(&env, "garbage", "{not json");
        assert_eq!(store.load(&record).unwrap_err().kind(), ErrorKind::CorruptConfiguration);
        // Left as found
        assert_eq!(fs::read_to_string(record.config_path(&env.ctx)).unwrap(), "{not json");
    }

    #[test]
    fn test_load_migrates_and_saves() {
        let env = TestEnv::new();
        let store = ConfigStore::new(&env.ctx);
        let record = write_jail(
            &env,
            "old",
            r#"{"CONFIG_VERSION": "12", "release": "12.2-RELEASE-p3", "vnet_default_interface": "none"}"#,
        );

        let cfg = store.load(&record).unwrap();
        assert_eq!(cfg.document().version(), Some(migrate::CURRENT_VERSION));
        assert_eq!(cfg.get("vnet_default_interface"), "auto");
        assert_eq!(cfg.get("release"), "12.2-RELEASE");

        let on_disk = ConfigDocument::load(&record.config_path(&env.ctx)).unwrap();
        assert_eq!(on_disk.version(), Some(migrate::CURRENT_VERSION));
        assert_eq!(on_disk.get("allow_mount_fusefs"), Some("0"));
    }

    #[test]
    fn test_thin_document_falls_back_to_defaults() {
        let env = TestEnv::new();
        fs::write(env.ctx.defaults_path(), r#"{"priority": "40"}"#).unwrap();
        let store = ConfigStore::new(&env.ctx);
        let record = write_jail(&env, "thin", r#"{"release": "14.1-RELEASE", "boot": "on"}"#);

        let cfg = store.load(&record).unwrap();
        assert_eq!(cfg.document().version(), None);
        assert!(cfg.is_on("boot"));
        assert_eq!(cfg.get("priority"), "40");
        assert_eq!(cfg.get("host_hostname"), "thin");
        assert_eq!(cfg.get("exec_start"), "/bin/sh /etc/rc");
    }

    #[test]
    fn test_set_validates_before_writing() {
        let env = TestEnv::new();
        let store = ConfigStore::new(&env.ctx);
        let record = write_jail(&env, "web", r#"{"CONFIG_VERSION": "15", "release": "14.1-RELEASE"}"#);
        let mut cfg = store.load(&record).unwrap();
        let before = fs::read_to_string(record.config_path(&env.ctx)).unwrap();

        let err = store.set_property(&mut cfg, "nat_forwards", "xyz(99999)").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
        assert!(store.set_property(&mut cfg, "no_such", "1").is_err());
        assert!(store.set_property(&mut cfg, "release", "13.0-RELEASE").is_err());
        assert_eq!(fs::read_to_string(record.config_path(&env.ctx)).unwrap(), before);

        assert_eq!(store.set_property(&mut cfg, "boot", "yes").unwrap(), "on");
        let on_disk = ConfigDocument::load(&record.config_path(&env.ctx)).unwrap();
        assert_eq!(on_disk.get("boot"), Some("on"));
    }

    #[test]
    fn test_unset_reverts_to_default() {
        let env = TestEnv::new();
        let store = ConfigStore::new(&env.ctx);
        let record = write_jail(
            &env,
            "web",
            r#"{"CONFIG_VERSION": "15", "release": "14.1-RELEASE", "priority": "5"}"#,
        );
        let mut cfg = store.load(&record).unwrap();
        assert_eq!(cfg.get("priority"), "5");
        store.unset_property(&mut cfg, "priority").unwrap();
        assert_eq!(cfg.get("priority"), "99");
        assert!(store.unset_property(&mut cfg, "release").is_err());
    }

    #[test]
    fn test_needs_stopped() {
        let env = TestEnv::new();
        let store = ConfigStore::new(&env.ctx);
        let record = write_jail(&env, "web", r#"{"CONFIG_VERSION": "15", "release": "14.1-RELEASE"}"#);
        let mut cfg = store.load(&record).unwrap();
        env.host.set_running("ioc-web", 4);

        assert!(store.set_property(&mut cfg, "dhcp", "on").is_err());
        assert!(store.set_property(&mut cfg, "notes", "hello").is_ok());
    }

    #[test]
    fn test_dataset_properties() {
        let env = TestEnv::new();
        env.host.add_datasets(&["tank/iocage/jails/web"]);
        let store = ConfigStore::new(&env.ctx);
        let record = write_jail(&env, "web", r#"{"CONFIG_VERSION": "15", "release": "14.1-RELEASE"}"#);
        let mut cfg = store.load(&record).unwrap();

        assert_eq!(store.set_property(&mut cfg, "quota", "20g").unwrap(), "20G");
        assert_eq!(env.host.zfs_prop("tank/iocage/jails/web", "quota").as_deref(), Some("20G"));
        assert!(!cfg.is_explicit("quota"));
        assert_eq!(store.get_property(&cfg, "quota").unwrap(), "20G");
        assert!(store.set_property(&mut cfg, "used", "1G").is_err());
    }

    #[test]
    fn test_template_save_restores_readonly() {
        let env = TestEnv::new();
        env.host.add_datasets(&["tank/iocage/templates/base"]);
        let store = ConfigStore::new(&env.ctx);
        let record = JailRecord::new("base", Location::Templates);
        fs::create_dir_all(record.dir(&env.ctx)).unwrap();
        fs::write(
            record.config_path(&env.ctx),
            r#"{"CONFIG_VERSION": "15", "release": "14.1-RELEASE", "template": "yes"}"#,
        )
        .unwrap();

        let mut cfg = store.load(&record).unwrap();
        store.set_property(&mut cfg, "notes", "golden").unwrap();
        assert!(env.host.called("zfs set readonly=off tank/iocage/templates/base"));
        assert_eq!(
            env.host.zfs_prop("tank/iocage/templates/base", "readonly").as_deref(),
            Some("on")
        );
    }

    #[test]
    fn test_getters() {
        let env = TestEnv::new();
        let store = ConfigStore::new(&env.ctx);
        let record = write_jail(
            &env,
            "web",
            r#"{"CONFIG_VERSION": "15", "release": "14.1-RELEASE", "devfs_ruleset": "4"}"#,
        );
        let cfg = store.load(&record).unwrap();
        assert_eq!(store.get_property(&cfg, "last_started").unwrap(), "never");
        assert_eq!(store.get_property(&cfg, "devfs_ruleset").unwrap(), "4");

        env.host.set_running("ioc-web", 2);
        env.host.respond("jls -j ioc-web devfs_ruleset", crate::host::CommandOutput::ok("7\n"));
        assert_eq!(store.get_property(&cfg, "devfs_ruleset").unwrap(), "7");
    }

    #[test]
    fn test_set_defaults() {
        let env = TestEnv::new();
        let store = ConfigStore::new(&env.ctx);
        let pairs = |items: &[(&str, &str)]| -> Vec<(String, String)> {
            items.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
        };

        assert!(store.set_defaults(&pairs(&[("boot", "1"), ("priority", "500")])).is_err());
        assert!(!env.ctx.defaults_path().exists());

        let normalized = store.set_defaults(&pairs(&[("boot", "1"), ("priority", "20")])).unwrap();
        assert_eq!(normalized, vec!["on", "20"]);
        let overlay = ConfigDocument::load(&env.ctx.defaults_path()).unwrap();
        assert_eq!(overlay.get("boot"), Some("on"));
        assert_eq!(overlay.get("priority"), Some("20"));
    }
}
