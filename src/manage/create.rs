//! Creating and destroying jails

use super::JailManager;
use crate::config::defaults::Defaults;
use crate::config::migrate;
use crate::config::schema::{self, Storage};
use crate::config::JailConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::fstab::Fstab;
use crate::jail::record::{JailRecord, Location};
use crate::jail::resolve;
use crate::lifecycle::LifecycleController;
use crate::lock::FileLock;
use crate::storage::{StorageManager, Strategy};
use crate::zfs::DatasetOrchestrator;
use std::fs;
use uuid::Uuid;

/// What to create and from where
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Release to clone, e.g. `14.1-RELEASE`
    pub release: Option<String>,
    /// Template to clone instead of a release
    pub template: Option<String>,
    /// Jail name; a UUID v4 is generated when absent
    pub name: Option<String>,
    /// Truncate generated UUIDs to 8 characters
    pub short: bool,
    /// Number of jails; names get a `_N` suffix when above 1
    pub count: u32,
    pub properties: Vec<(String, String)>,
}

/// Where a new jail's root comes from
struct Source {
    root_dataset: String,
    release: String,
    cloned_release: String,
    from_template: bool,
}

/// Validated creation properties, split by where they are stored
#[derive(Default)]
struct Properties {
    config: Vec<(String, String)>,
    dataset: Vec<(String, String)>,
}

impl JailManager<'_> {
    /// Create one or more jails; returns their names
    pub fn create(&self, opts: &CreateOptions) -> Result<Vec<String>> {
        let defaults = self.store.defaults()?;
        let props = validate_properties(&opts.properties, &defaults)?;
        let source = self.source(opts)?;
        let names = self.names(opts)?;

        let mut created = Vec::with_capacity(names.len());
        for name in names {
            self.ctx.cancel().check()?;
            self.create_one(&name, &source, &props, &defaults)?;
            created.push(name);
        }
        Ok(created)
    }

    fn source(&self, opts: &CreateOptions) -> Result<Source> {
        match (&opts.release, &opts.template) {
            (Some(release), None) => {
                let root_dataset = StorageManager::new(self.ctx).release_root_dataset(release);
                if !DatasetOrchestrator::new(self.ctx).exists(&root_dataset)? {
                    return Err(Error::NotFound(format!("release '{}'", release)));
                }
                Ok(Source {
                    root_dataset,
                    release: release.clone(),
                    cloned_release: release.clone(),
                    from_template: false,
                })
            }
            (None, Some(template)) => {
                let record = resolve::resolve(self.ctx, template)?;
                if !record.is_template() {
                    return Err(Error::NotFound(format!("template '{}'", template)));
                }
                let cfg = self.store.load(&record)?;
                Ok(Source {
                    root_dataset: record.root_dataset(self.ctx),
                    release: cfg.get("release"),
                    cloned_release: cfg.get("cloned_release"),
                    from_template: true,
                })
            }
            _ => Err(Error::InvalidConfiguration(
                "a jail is created from exactly one release or template".into(),
            )),
        }
    }

    fn names(&self, opts: &CreateOptions) -> Result<Vec<String>> {
        let count = opts.count.max(1);
        let names: Vec<String> = match &opts.name {
            Some(name) if count == 1 => vec![name.clone()],
            Some(name) => (1..=count).map(|i| format!("{}_{}", name, i)).collect(),
            None => (0..count)
                .map(|_| {
                    let id = Uuid::new_v4().to_string();
                    if opts.short { id[..8].to_string() } else { id }
                })
                .collect(),
        };
        for name in &names {
            self.check_new_name(name)?;
        }
        Ok(names)
    }

    fn create_one(
        &self,
        name: &str,
        source: &Source,
        props: &Properties,
        defaults: &std::sync::Arc<Defaults>,
    ) -> Result<()> {
        let record = JailRecord::new(name, Location::Jails);
        let _lock = FileLock::try_jail(&record.lock_path(self.ctx), name)?;

        let mut doc = defaults.document(name);
        doc.set_version(migrate::CURRENT_VERSION);
        doc.set("host_hostuuid", name);
        doc.set("type", "jail");
        doc.set("release", source.release.as_str());
        doc.set("cloned_release", source.cloned_release.as_str());
        for (key, value) in &props.config {
            doc.set(key.as_str(), value.as_str());
        }
        let cfg = JailConfig::new(record.clone(), doc, defaults.clone());

        let strategy = match Strategy::for_config(&cfg) {
            Strategy::Zfs if source.from_template => {
                return Err(Error::InvalidConfiguration(
                    "zfs basejails are created from a release, not a template".into(),
                ));
            }
            // A template root is complete; nullfs mounts still apply at start
            _ if source.from_template => Strategy::Clone,
            strategy => strategy,
        };

        tracing::info!(jail = name, source = %source.root_dataset, ?strategy, "creating jail");
        if let Err(e) = self.provision(&cfg, source, props, strategy) {
            self.discard(&record);
            return Err(e);
        }
        tracing::info!(jail = name, release = %source.release, "created");
        Ok(())
    }

    fn provision(&self, cfg: &JailConfig, source: &Source, props: &Properties, strategy: Strategy) -> Result<()> {
        let record = &cfg.record;
        let dataset_props: Vec<(&str, &str)> = props
            .dataset
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        DatasetOrchestrator::new(self.ctx).create(&record.dataset(self.ctx), &dataset_props)?;
        StorageManager::new(self.ctx).provision_root(
            &source.root_dataset,
            &record.root_dataset(self.ctx),
            strategy,
            &record.name,
        )?;

        fs::create_dir_all(record.root_path(self.ctx))?;
        Fstab::default().save(&record.fstab_path(self.ctx))?;
        self.store.save(cfg)
    }

    /// Remove what a failed create left behind
    fn discard(&self, record: &JailRecord) {
        if let Err(e) = DatasetOrchestrator::new(self.ctx).destroy_recursive(&record.dataset(self.ctx)) {
            tracing::warn!(jail = %record.name, error = %e, "failed to remove dataset of failed create");
        }
        let dir = record.dir(self.ctx);
        if dir.exists()
            && let Err(e) = fs::remove_dir_all(&dir)
        {
            tracing::warn!(jail = %record.name, error = %e, "failed to remove directory of failed create");
        }
    }

    /// Destroy a jail with its datasets and directory
    ///
    /// A running jail is refused unless `force`, which stops it first. A
    /// jail with a corrupt document also needs `force`.
    pub fn destroy(&self, reference: &str, force: bool) -> Result<()> {
        let record = resolve::resolve(self.ctx, reference)?;
        let name = record.name.clone();

        match self.store.load(&record) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::CorruptConfiguration && force => {
                tracing::warn!(jail = %name, error = %e, "destroying jail with corrupt configuration");
            }
            Err(e) => return Err(e),
        }

        let running = self.ctx.host().jail_id(&record.kernel_name()).is_some();
        if running && !force {
            return Err(Error::InvalidConfiguration(format!(
                "jail '{}' is running, stop it first or force the destroy",
                name
            )));
        }
        if running || record.runtime_path(self.ctx).exists() {
            LifecycleController::new(self.ctx).stop(&name, true)?;
        }

        let _lock = FileLock::try_jail(&record.lock_path(self.ctx), &name)?;
        let zfs = DatasetOrchestrator::new(self.ctx);
        let dataset = record.dataset(self.ctx);
        let origin = if zfs.exists(&record.root_dataset(self.ctx))? {
            zfs.get(&record.root_dataset(self.ctx), "origin")?
        } else {
            None
        };

        zfs.destroy_recursive(&dataset)?;

        // The snapshot the root was cloned from is tagged with the jail name
        if let Some((source, tag)) = origin.as_deref().and_then(|o| o.split_once('@'))
            && tag == name
            && let Err(e) = zfs.destroy_snapshot(source, tag)
        {
            tracing::warn!(jail = %name, error = %e, "failed to remove origin snapshot");
        }

        let dir = record.dir(self.ctx);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        tracing::info!(jail = %name, "destroyed");
        Ok(())
    }
}

fn validate_properties(pairs: &[(String, String)], defaults: &Defaults) -> Result<Properties> {
    let mut props = Properties::default();
    for (key, value) in pairs {
        let spec = schema::lookup(key).ok_or_else(|| Error::InvalidProperty(key.clone()))?;
        if matches!(spec.storage, Storage::Managed | Storage::DatasetReadOnly) {
            return Err(Error::invalid_value(key, "cannot be set at creation"));
        }
        if key == "template" {
            return Err(Error::invalid_value(key, "is set on an existing jail"));
        }
        let normalized = schema::validate(key, value, Some(defaults.facts()))?;
        match spec.storage {
            Storage::Dataset => props.dataset.push((key.clone(), normalized)),
            _ => props.config.push((key.clone(), normalized)),
        }
    }
    Ok(props)
}
