//! Jail root filesystems and mounts
//!
//! A jail root is either a full clone of its release (or template) root, or
//! a basejail. Basejails share the release's system directories, either as
//! read-only nullfs mounts that are regenerated on every start (`nullfs`)
//! or as per-directory ZFS clones made once at creation (`zfs`).

use crate::config::JailConfig;
use crate::config::document::write_atomic;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::fstab::{self, Fstab, FstabEntry};
use crate::host::HostCommand;
use crate::zfs::DatasetOrchestrator;
use std::path::{Path, PathBuf};

/// System directories a basejail shares with its release
pub const BASEJAIL_DIRS: &[&str] = &[
    "bin",
    "boot",
    "lib",
    "libexec",
    "rescue",
    "sbin",
    "usr/bin",
    "usr/include",
    "usr/lib",
    "usr/libexec",
    "usr/sbin",
    "usr/share",
    "usr/libdata",
    "usr/lib32",
];

/// How a jail root is populated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Full clone of the source root
    Clone,
    /// Clone plus read-only nullfs mounts of the release directories
    Nullfs,
    /// Clone plus per-directory clones of the release datasets
    Zfs,
}

impl Strategy {
    pub fn for_config(cfg: &JailConfig) -> Self {
        if !cfg.is_on("basejail") {
            return Strategy::Clone;
        }
        match cfg.get("basejail_type").as_str() {
            "zfs" => Strategy::Zfs,
            _ => Strategy::Nullfs,
        }
    }
}

/// Mounts and datasets backing a jail
pub struct StorageManager<'a> {
    ctx: &'a Context,
}

impl<'a> StorageManager<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// Root dataset of a fetched release
    pub fn release_root_dataset(&self, release: &str) -> String {
        self.ctx.dataset(&format!("releases/{}/root", release))
    }

    pub fn release_root_path(&self, release: &str) -> PathBuf {
        self.ctx.iocroot().join("releases").join(release).join("root")
    }

    /// Populate a new jail root from `source_root`
    pub fn provision_root(
        &self,
        source_root: &str,
        target_root: &str,
        strategy: Strategy,
        tag: &str,
    ) -> Result<()> {
        let zfs = DatasetOrchestrator::new(self.ctx);
        zfs.clone_into(source_root, target_root, tag)?;

        if strategy == Strategy::Zfs {
            for dir in BASEJAIL_DIRS {
                let source = format!("{}/{}", source_root, dir);
                if !zfs.exists(&source)? {
                    return Err(Error::NotFound(format!("basejail dataset '{}'", source)));
                }
                zfs.clone_into(&source, &format!("{}/{}", target_root, dir), tag)?;
            }
        }
        Ok(())
    }

    /// Bind mounts a nullfs basejail gets on every start
    pub fn generated_mounts(&self, cfg: &JailConfig) -> Vec<FstabEntry> {
        if Strategy::for_config(cfg) != Strategy::Nullfs {
            return Vec::new();
        }
        let release = self.release_root_path(&cfg.get("release"));
        let root = cfg.record.root_path(self.ctx);
        BASEJAIL_DIRS
            .iter()
            .map(|dir| {
                FstabEntry::new(
                    &release.join(dir).display().to_string(),
                    &root.join(dir).display().to_string(),
                    "nullfs",
                    "ro",
                )
                .generated()
            })
            .collect()
    }

    /// Write the effective mount table for jail(8) and return its path
    pub fn write_mount_table(&self, cfg: &JailConfig) -> Result<PathBuf> {
        let user = Fstab::load(&cfg.record.fstab_path(self.ctx))?;
        let path = cfg.record.mount_table_path(self.ctx);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_atomic(&path, user.render(&self.generated_mounts(cfg)).as_bytes())?;
        Ok(path)
    }

    fn mount(&self, fstype: &str, source: &str, target: &Path) -> Result<()> {
        std::fs::create_dir_all(target)?;
        self.ctx.host().check(
            &HostCommand::new("mount")
                .args(["-t", fstype, source])
                .arg(target.display().to_string()),
        )?;
        Ok(())
    }

    /// procfs and linprocfs, when enabled
    pub fn mount_pseudo(&self, cfg: &JailConfig) -> Result<()> {
        let root = cfg.record.root_path(self.ctx);
        if cfg.is_on("mount_procfs") {
            self.mount("procfs", "proc", &root.join("proc"))?;
        }
        if cfg.is_on("mount_linprocfs") {
            self.mount("linprocfs", "linproc", &root.join("compat/linux/proc"))?;
        }
        Ok(())
    }

    /// Full names of the datasets handed to the jail
    pub fn jail_zfs_datasets(&self, cfg: &JailConfig) -> Vec<String> {
        if !cfg.is_on("jail_zfs") {
            return Vec::new();
        }
        cfg.get("jail_zfs_dataset")
            .split_whitespace()
            .filter(|d| *d != "none")
            .map(|d| format!("{}/{}", self.ctx.settings().pool, d))
            .collect()
    }

    /// Create the delegated datasets if missing and mark them jailed
    pub fn prepare_jail_zfs(&self, cfg: &JailConfig) -> Result<Vec<String>> {
        let zfs = DatasetOrchestrator::new(self.ctx);
        let datasets = self.jail_zfs_datasets(cfg);
        let mountpoint = cfg.get("jail_zfs_mountpoint");
        for dataset in &datasets {
            if !zfs.exists(dataset)? {
                zfs.create(dataset, &[("jailed", "on")])?;
            } else {
                zfs.set(dataset, "jailed", "on")?;
            }
            if mountpoint != "none" {
                zfs.set(dataset, "mountpoint", &mountpoint)?;
            }
        }
        Ok(datasets)
    }

    /// Hand prepared datasets to a running jail and mount them inside
    pub fn attach_jail_zfs(&self, kernel_name: &str, datasets: &[String]) -> Result<()> {
        if datasets.is_empty() {
            return Ok(());
        }
        let zfs = DatasetOrchestrator::new(self.ctx);
        for dataset in datasets {
            zfs.jail(kernel_name, dataset)?;
        }
        self.ctx
            .host()
            .check(&HostCommand::jexec_argv(kernel_name, ["zfs", "mount", "-a"]))?;
        Ok(())
    }

    /// Take delegated datasets back; failures are returned, not raised
    pub fn detach_jail_zfs(&self, kernel_name: &str, datasets: &[String]) -> Vec<Error> {
        let zfs = DatasetOrchestrator::new(self.ctx);
        datasets
            .iter()
            .filter_map(|dataset| zfs.unjail(kernel_name, dataset).err())
            .collect()
    }

    /// Force-unmount everything a stopped jail may have left mounted
    ///
    /// Mount-table entries go first in reverse order, then `dev/fd`, `dev`,
    /// `proc` and the linux proc. Targets that are not mounted are skipped.
    pub fn unmount_all(&self, cfg: &JailConfig, mount_table: &Path) -> Vec<Error> {
        let root = cfg.record.root_path(self.ctx);
        let table = match fstab::mount_points(mount_table) {
            Ok(Some(points)) => points,
            Ok(None) => {
                let user = Fstab::load(&cfg.record.fstab_path(self.ctx)).unwrap_or_default();
                self.generated_mounts(cfg)
                    .iter()
                    .chain(user.entries())
                    .map(|e| e.destination.clone())
                    .collect()
            }
            Err(e) => {
                tracing::warn!(jail = %cfg.name(), error = %e, "unreadable mount table");
                Vec::new()
            }
        };
        let mut targets: Vec<PathBuf> = table.into_iter().rev().map(PathBuf::from).collect();
        targets.extend(["dev/fd", "dev", "proc", "compat/linux/proc"].map(|p| root.join(p)));

        let mut errors = Vec::new();
        for target in targets {
            let cmd = HostCommand::new("umount")
                .arg("-f")
                .arg(target.display().to_string());
            match self.ctx.host().check(&cmd) {
                Ok(_) => tracing::debug!(target = %target.display(), "unmounted"),
                Err(Error::ExternalProcess { output, .. }) if is_not_mounted(&output) => {}
                Err(e) => errors.push(e),
            }
        }
        errors
    }
}

fn is_not_mounted(output: &str) -> bool {
    output.contains("not a file system root directory")
        || output.contains("No such file or directory")
        || output.contains("Invalid argument")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigDocument;
    use crate::config::defaults::Defaults;
    use crate::context::testing::TestEnv;
    use crate::host::CommandOutput;
    use crate::jail::{JailRecord, Location};
    use std::sync::Arc;

    fn config(pairs: &[(&str, &str)]) -> JailConfig {
        let mut doc = ConfigDocument::from_pairs([("release", "14.1-RELEASE")]);
        for (k, v) in pairs {
            doc.set(*k, *v);
        }
        JailConfig::new(
            JailRecord::new("web", Location::Jails),
            doc,
            Arc::new(Defaults::default()),
        )
    }

    #[test]
    fn test_strategy() {
        assert_eq!(Strategy::for_config(&config(&[])), Strategy::Clone);
        assert_eq!(Strategy::for_config(&config(&[("basejail", "yes")])), Strategy::Nullfs);
        assert_eq!(
            Strategy::for_config(&config(&[("basejail", "yes"), ("basejail_type", "zfs")])),
            Strategy::Zfs
        );
    }

    #[test]
    fn test_nullfs_mount_table_is_regenerated() {
        let env = TestEnv::new();
        let storage = StorageManager::new(&env.ctx);
        let cfg = config(&[("basejail", "yes")]);
        std::fs::create_dir_all(cfg.record.dir(&env.ctx)).unwrap();
        std::fs::write(
            cfg.record.fstab_path(&env.ctx),
            "/data /iocage/jails/web/root/data nullfs rw 0 0\n",
        )
        .unwrap();

        let path = storage.write_mount_table(&cfg).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), BASEJAIL_DIRS.len() + 1);
        assert!(text.contains("releases/14.1-RELEASE/root/usr/lib\t"));
        assert!(text.contains("# ironcage-auto"));

        // the stored fstab never receives generated lines
        let stored = std::fs::read_to_string(cfg.record.fstab_path(&env.ctx)).unwrap();
        assert!(!stored.contains("ironcage-auto"));
    }

    #[test]
    fn test_zfs_basejail_clones_each_dir() {
        let env = TestEnv::new();
        let storage = StorageManager::new(&env.ctx);
        let release = storage.release_root_dataset("14.1-RELEASE");
        let mut seeded = vec![release.clone()];
        seeded.extend(BASEJAIL_DIRS.iter().map(|d| format!("{}/{}", release, d)));
        let seeded: Vec<&str> = seeded.iter().map(String::as_str).collect();
        env.host.add_datasets(&seeded);

        let target = env.ctx.dataset("jails/web/root");
        storage
            .provision_root(&release, &target, Strategy::Zfs, "web")
            .unwrap();
        assert!(env.host.datasets_under(&target).contains(&format!("{}/usr/bin", target)));
    }

    #[test]
    fn test_zfs_basejail_needs_split_release() {
        let env = TestEnv::new();
        let storage = StorageManager::new(&env.ctx);
        let release = storage.release_root_dataset("14.1-RELEASE");
        env.host.add_datasets(&[&release]);

        let err = storage
            .provision_root(&release, &env.ctx.dataset("jails/web/root"), Strategy::Zfs, "web")
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_jail_zfs_lifecycle() {
        let env = TestEnv::new();
        let storage = StorageManager::new(&env.ctx);
        let cfg = config(&[("jail_zfs", "on"), ("jail_zfs_dataset", "iocage/jails/web/data")]);

        let datasets = storage.prepare_jail_zfs(&cfg).unwrap();
        assert_eq!(datasets, vec!["tank/iocage/jails/web/data"]);
        assert!(env.host.called("zfs create -p -o jailed=on tank/iocage/jails/web/data"));

        storage.attach_jail_zfs("ioc-web", &datasets).unwrap();
        assert!(env.host.called("zfs jail ioc-web tank/iocage/jails/web/data"));
        assert!(env.host.called("jexec ioc-web zfs mount -a"));

        assert!(storage.detach_jail_zfs("ioc-web", &datasets).is_empty());
        assert!(env.host.called("zfs unjail ioc-web tank/iocage/jails/web/data"));
    }

    #[test]
    fn test_unmount_order_and_tolerance() {
        let env = TestEnv::new();
        let storage = StorageManager::new(&env.ctx);
        let cfg = config(&[]);
        std::fs::create_dir_all(cfg.record.dir(&env.ctx)).unwrap();
        std::fs::write(cfg.record.fstab_path(&env.ctx), "/a /mnt/a nullfs rw 0 0\n").unwrap();
        let table = storage.write_mount_table(&cfg).unwrap();
        env.host.respond(
            "umount -f",
            CommandOutput::failed(1, "umount: /x: not a file system root directory"),
        );

        let errors = storage.unmount_all(&cfg, &table);
        assert!(errors.is_empty());
        let calls = env.host.calls_matching("umount -f");
        assert_eq!(calls.len(), 5);
        assert_eq!(calls[0], "umount -f /mnt/a");
        assert!(calls[1].ends_with("root/dev/fd"));
        assert!(calls[4].ends_with("root/compat/linux/proc"));
    }
}
