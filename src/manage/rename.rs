//! Renaming a jail
//!
//! The dataset is renamed first, then the release or template snapshot
//! the root was cloned from, which carries the jail's name as its tag. The
//! directory, fstab paths and identity properties follow. A failure after
//! the dataset moved puts the snapshot, dataset and directory back under
//! the old name.

use super::{JailManager, relocate_dir};
use crate::config::JailConfig;
use crate::error::Result;
use crate::fstab::Fstab;
use crate::jail::record::JailRecord;
use crate::lock::FileLock;
use crate::storage::StorageManager;
use crate::zfs::DatasetOrchestrator;

impl JailManager<'_> {
    pub fn rename(&self, reference: &str, new_name: &str) -> Result<()> {
        let cfg = self.store.load_ref(reference)?;
        let old = cfg.name().to_string();
        self.ensure_stopped(&cfg, "renaming")?;
        self.check_new_name(new_name)?;

        let _lock = FileLock::try_jail(&cfg.record.lock_path(self.ctx), &old)?;
        let zfs = DatasetOrchestrator::new(self.ctx);
        let from = cfg.record.clone();
        let to = JailRecord::new(new_name, from.location);

        // Snapshot the root was cloned from, when it is tagged with this jail
        let root = from.root_dataset(self.ctx);
        let origin = if zfs.exists(&root)? { zfs.get(&root, "origin")? } else { None };
        let origin_source = origin
            .as_deref()
            .and_then(|o| o.split_once('@'))
            .filter(|(_, tag)| *tag == old)
            .map(|(source, _)| source.to_string());

        for dataset in StorageManager::new(self.ctx).jail_zfs_datasets(&cfg) {
            if let Err(e) = zfs.set(&dataset, "jailed", "off") {
                tracing::debug!(dataset = %dataset, error = %e, "could not unjail dataset");
            }
        }

        zfs.rename(&from.dataset(self.ctx), &to.dataset(self.ctx))?;

        let revert_dataset = || {
            if let Err(e) = relocate_dir(&to.dir(self.ctx), &from.dir(self.ctx)) {
                tracing::warn!(jail = %old, error = %e, "failed to move directory back");
            }
            if let Err(e) = zfs.rename(&to.dataset(self.ctx), &from.dataset(self.ctx)) {
                tracing::warn!(jail = %old, error = %e, "failed to rename dataset back");
            }
        };

        if let Some(source) = &origin_source
            && let Err(e) = zfs.rename(&format!("{}@{}", source, old), &format!("{}@{}", source, new_name))
        {
            tracing::error!(jail = %old, new_name, error = %e, "origin snapshot rename failed, reverting");
            revert_dataset();
            return Err(e);
        }

        if let Err(e) = self.follow_rename(&cfg, &to) {
            tracing::error!(jail = %old, new_name, error = %e, "rename failed, reverting");
            if let Some(source) = &origin_source
                && let Err(e) = zfs.rename(&format!("{}@{}", source, new_name), &format!("{}@{}", source, old))
            {
                tracing::warn!(jail = %old, error = %e, "failed to rename origin snapshot back");
            }
            revert_dataset();
            return Err(e);
        }

        tracing::info!(jail = %old, new_name, "renamed");
        Ok(())
    }

    /// Everything that names the jail, after its dataset moved
    fn follow_rename(&self, cfg: &JailConfig, to: &JailRecord) -> Result<()> {
        let from = &cfg.record;
        let old = from.name.as_str();
        let new = to.name.as_str();

        relocate_dir(&from.dir(self.ctx), &to.dir(self.ctx))?;

        let fstab_path = to.fstab_path(self.ctx);
        let mut fstab = Fstab::load(&fstab_path)?;
        let old_dir = from.dir(self.ctx).display().to_string();
        let new_dir = to.dir(self.ctx).display().to_string();
        if fstab.rewrite_prefix(&old_dir, &new_dir) > 0 {
            fstab.save(&fstab_path)?;
        }

        let mut doc = cfg.document().clone();
        if doc.get_nonempty("host_hostuuid").is_some() {
            doc.set("host_hostuuid", new);
        }
        if doc.get("host_hostname") == Some(old) {
            doc.set("host_hostname", new);
        }
        if doc.get("jail_zfs_dataset") == Some(format!("iocage/jails/{}/data", old).as_str()) {
            doc.set("jail_zfs_dataset", format!("iocage/jails/{}/data", new));
        }
        self.store
            .save(&JailConfig::new(to.clone(), doc, self.store.defaults()?))
    }
}
