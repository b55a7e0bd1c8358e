//! Jail snapshots
//!
//! Snapshots are taken recursively on the jail dataset, so the root and
//! any child datasets share the snapshot name.

use super::JailManager;
use crate::error::{Error, Result};
use crate::lock::FileLock;
use crate::parse::zfs::SnapshotRow;
use crate::zfs::DatasetOrchestrator;
use chrono::Utc;

fn check_snapshot_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['@', '/']) || name.contains(char::is_whitespace) {
        return Err(Error::invalid_value("snapshot", format!("'{}' is not a valid snapshot name", name)));
    }
    Ok(())
}

impl JailManager<'_> {
    /// Snapshot a jail; the name defaults to the current UTC time
    pub fn snapshot(&self, reference: &str, name: Option<&str>) -> Result<String> {
        let cfg = self.store.load_ref(reference)?;
        let name = match name {
            Some(name) => name.to_string(),
            None => Utc::now().format("%F_%T").to_string(),
        };
        check_snapshot_name(&name)?;

        let zfs = DatasetOrchestrator::new(self.ctx);
        let dataset = cfg.record.dataset(self.ctx);
        if zfs.exists(&format!("{}@{}", dataset, name))? {
            return Err(Error::AlreadyExists(format!("snapshot '{}@{}'", dataset, name)));
        }
        zfs.snapshot(&dataset, &name)?;
        Ok(name)
    }

    /// Snapshots of a jail, oldest first
    pub fn snapshots(&self, reference: &str) -> Result<Vec<SnapshotRow>> {
        let cfg = self.store.load_ref(reference)?;
        DatasetOrchestrator::new(self.ctx).snapshots(&cfg.record.dataset(self.ctx))
    }

    /// Roll a stopped jail back to a snapshot
    ///
    /// Newer snapshots are in the way of a rollback; they are destroyed
    /// only when `destroy_newer` is set.
    pub fn rollback(&self, reference: &str, name: &str, destroy_newer: bool) -> Result<()> {
        let cfg = self.store.load_ref(reference)?;
        self.ensure_stopped(&cfg, "rolling back")?;
        let _lock = FileLock::try_jail(&cfg.record.lock_path(self.ctx), cfg.name())?;

        let zfs = DatasetOrchestrator::new(self.ctx);
        let dataset = cfg.record.dataset(self.ctx);
        let snapshots = zfs.snapshots(&dataset)?;
        let Some(position) = snapshots.iter().position(|s| s.name == name) else {
            return Err(Error::NotFound(format!("snapshot '{}@{}'", dataset, name)));
        };
        let newer: Vec<&str> = snapshots[position + 1..].iter().map(|s| s.name.as_str()).collect();
        if !newer.is_empty() && !destroy_newer {
            return Err(Error::InvalidConfiguration(format!(
                "newer snapshots exist ({}); roll back with force to destroy them",
                newer.join(", ")
            )));
        }

        zfs.rollback(&dataset, name, destroy_newer)
    }

    pub fn delete_snapshot(&self, reference: &str, name: &str) -> Result<()> {
        let cfg = self.store.load_ref(reference)?;
        let dataset = cfg.record.dataset(self.ctx);
        DatasetOrchestrator::new(self.ctx).destroy_snapshot(&dataset, name)?;
        tracing::info!(jail = %cfg.name(), snapshot = name, "snapshot deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::TestEnv;
    use crate::error::ErrorKind;
    use crate::host::CommandOutput;
    use crate::lifecycle::testing::write_jail;

    fn env() -> TestEnv {
        let env = TestEnv::new();
        write_jail(&env, "web", r#"{"release": "14.1-RELEASE"}"#);
        env.host.add_datasets(&["tank/iocage/jails/web", "tank/iocage/jails/web/root"]);
        env
    }

    #[test]
    fn test_snapshot_names() {
        let env = env();
        let manager = JailManager::new(&env.ctx);

        assert_eq!(manager.snapshot("web", Some("before-upgrade")).unwrap(), "before-upgrade");
        assert!(env.host.called("zfs snapshot -r tank/iocage/jails/web@before-upgrade"));
        let err = manager.snapshot("web", Some("before-upgrade")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert!(manager.snapshot("web", Some("a/b")).is_err());

        let generated = manager.snapshot("web", None).unwrap();
        assert_eq!(generated.len(), "2026-01-01_00:00:00".len());
        assert!(generated.contains('_'));
    }

    #[test]
    fn test_snapshots_listed() {
        let env = env();
        env.host.respond(
            "zfs list -H -p -t snapshot",
            CommandOutput::ok(
                "tank/iocage/jails/web@one\t1700000000\t4096\n\
                 tank/iocage/jails/web/root@one\t1700000000\t8192\n\
                 tank/iocage/jails/web@two\t1700000100\t0\n",
            ),
        );
        let rows = JailManager::new(&env.ctx).snapshots("web").unwrap();
        let names: Vec<_> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["one", "two"]);
    }

    #[test]
    fn test_rollback() {
        let env = env();
        let manager = JailManager::new(&env.ctx);
        env.host.respond(
            "zfs list -H -p -t snapshot",
            CommandOutput::ok("tank/iocage/jails/web@one\t1700000000\t0\ntank/iocage/jails/web@two\t1700000100\t0\n"),
        );
        env.host.add_datasets(&["tank/iocage/jails/web@one", "tank/iocage/jails/web@two"]);

        let err = manager.rollback("web", "one", false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
        assert!(err.to_string().contains("two"));
        assert_eq!(manager.rollback("web", "zero", true).unwrap_err().kind(), ErrorKind::NotFound);

        manager.rollback("web", "two", false).unwrap();
        assert!(env.host.called("zfs rollback tank/iocage/jails/web@two"));
        manager.rollback("web", "one", true).unwrap();
        assert!(env.host.called("zfs rollback -r tank/iocage/jails/web@one"));

        env.host.set_running("ioc-web", 5);
        assert!(manager.rollback("web", "two", false).is_err());
    }

    #[test]
    fn test_delete_snapshot() {
        let env = env();
        let manager = JailManager::new(&env.ctx);
        manager.snapshot("web", Some("old")).unwrap();
        manager.delete_snapshot("web", "old").unwrap();
        assert_eq!(
            env.host.datasets_under("tank/iocage/jails/web"),
            vec!["tank/iocage/jails/web", "tank/iocage/jails/web/root"]
        );
        assert_eq!(manager.delete_snapshot("web", "old").unwrap_err().kind(), ErrorKind::NotFound);
    }
}
