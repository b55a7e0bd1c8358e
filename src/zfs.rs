//! ZFS dataset orchestration
//!
//! Provides the dataset operations jails are built from:
//! - Reproducible clones (stale targets and snapshots are cleared first)
//! - Snapshots, rollback, promote and rename
//! - Recursive destroy with backoff while a dataset is busy
//! - A read-only guard for template datasets

use crate::context::Context;
use crate::error::{Error, Result};
use crate::host::HostCommand;
use crate::parse::zfs::{self as zfs_output, SnapshotRow};
use crate::settings::RetryConfig;
use chrono_machines::{BackoffStrategy, ExponentialBackoff};
use rand::rng;
use std::thread;
use std::time::Duration;

fn backoff_from_config(config: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoff::new()
        .base_delay_ms(config.base_delay_ms)
        .max_delay_ms(config.max_delay_ms)
        .multiplier(config.multiplier)
        .max_attempts(config.max_attempts)
        .jitter_factor(config.jitter_factor)
}

fn is_missing(err: &Error) -> bool {
    matches!(err, Error::ExternalProcess { output, .. } if output.contains("does not exist"))
}

fn is_busy(err: &Error) -> bool {
    matches!(err, Error::ExternalProcess { output, .. } if output.contains("busy"))
}

/// Dataset operations over the host's zfs(8)
pub struct DatasetOrchestrator<'a> {
    ctx: &'a Context,
}

impl<'a> DatasetOrchestrator<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    fn zfs<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ctx.host().check(&HostCommand::new("zfs").args(args))
    }

    /// Check if a dataset or snapshot exists
    pub fn exists(&self, dataset: &str) -> Result<bool> {
        let kind = if dataset.contains('@') { "snapshot" } else { "filesystem" };
        match self.zfs(["list", "-H", "-t", kind, "-o", "name", dataset]) {
            Ok(out) => Ok(zfs_output::parse_names(&out).iter().any(|n| n == dataset)),
            Err(e) if is_missing(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create a dataset (and missing parents) with properties
    pub fn create(&self, dataset: &str, props: &[(&str, &str)]) -> Result<()> {
        let mut args = vec!["create".to_string(), "-p".to_string()];
        for (k, v) in props {
            args.push("-o".to_string());
            args.push(format!("{}={}", k, v));
        }
        args.push(dataset.to_string());
        self.zfs(args)?;
        tracing::debug!(dataset, "created dataset");
        Ok(())
    }

    /// Get a property value; `-` reads as None
    pub fn get(&self, dataset: &str, property: &str) -> Result<Option<String>> {
        let out = self.zfs(["get", "-H", "-o", "value", property, dataset])?;
        Ok(zfs_output::parse_value(&out))
    }

    pub fn set(&self, dataset: &str, property: &str, value: &str) -> Result<()> {
        self.zfs(["set".to_string(), format!("{}={}", property, value), dataset.to_string()])?;
        Ok(())
    }

    /// Child filesystems of a dataset, excluding the dataset itself
    pub fn children(&self, dataset: &str) -> Result<Vec<String>> {
        let out = self.zfs(["list", "-H", "-r", "-t", "filesystem", "-o", "name", dataset])?;
        Ok(zfs_output::parse_names(&out)
            .into_iter()
            .filter(|n| n != dataset)
            .collect())
    }

    pub fn snapshot(&self, dataset: &str, name: &str) -> Result<()> {
        self.zfs(["snapshot", "-r", &format!("{}@{}", dataset, name)])?;
        tracing::info!(dataset, snapshot = name, "snapshot taken");
        Ok(())
    }

    /// Snapshots of exactly this dataset, oldest first
    pub fn snapshots(&self, dataset: &str) -> Result<Vec<SnapshotRow>> {
        let out = self.zfs([
            "list", "-H", "-p", "-t", "snapshot", "-s", "creation", "-o", "name,creation,used",
            "-r", dataset,
        ])?;
        Ok(zfs_output::parse_snapshots(&out)?
            .into_iter()
            .filter(|s| s.dataset == dataset)
            .collect())
    }

    pub fn destroy_snapshot(&self, dataset: &str, name: &str) -> Result<()> {
        let snap = format!("{}@{}", dataset, name);
        if !self.exists(&snap)? {
            return Err(Error::NotFound(format!("snapshot '{}'", snap)));
        }
        self.zfs(["destroy", "-r", &snap])?;
        Ok(())
    }

    /// Roll back to a snapshot, optionally destroying newer ones
    pub fn rollback(&self, dataset: &str, name: &str, destroy_newer: bool) -> Result<()> {
        let snap = format!("{}@{}", dataset, name);
        if !self.exists(&snap)? {
            return Err(Error::NotFound(format!("snapshot '{}'", snap)));
        }
        let mut datasets = vec![dataset.to_string()];
        datasets.extend(self.children(dataset)?);
        for ds in datasets {
            let snap = format!("{}@{}", ds, name);
            if destroy_newer {
                self.zfs(["rollback", "-r", &snap])?;
            } else {
                self.zfs(["rollback", &snap])?;
            }
        }
        tracing::info!(dataset, snapshot = name, "rolled back");
        Ok(())
    }

    /// Clone `source` into `target` through a snapshot tagged `tag`
    ///
    /// Any target left by an earlier attempt is destroyed first, as is a
    /// same-named snapshot on the source, so a retried clone ends with
    /// exactly one target and one snapshot.
    pub fn clone_into(&self, source: &str, target: &str, tag: &str) -> Result<String> {
        if self.exists(target)? {
            tracing::debug!(target, "removing stale clone target");
            self.destroy_recursive(target)?;
        }

        let snap = format!("{}@{}", source, tag);
        if self.exists(&snap)? {
            tracing::debug!(snapshot = %snap, "removing stale clone snapshot");
            self.zfs(["destroy", &snap])?;
        }

        self.zfs(["snapshot", &snap])?;
        self.zfs(["clone", "-p", &snap, target])?;
        self.mount(target)?;

        tracing::info!(source, target, "cloned dataset");
        Ok(target.to_string())
    }

    pub fn mount(&self, dataset: &str) -> Result<()> {
        match self.zfs(["mount", dataset]) {
            Err(Error::ExternalProcess { output, .. }) if output.contains("already mounted") => Ok(()),
            other => other.map(|_| ()),
        }
    }

    pub fn promote(&self, dataset: &str) -> Result<()> {
        self.zfs(["promote", dataset])?;
        Ok(())
    }

    /// Rename a dataset; children and snapshots follow
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        if self.exists(to)? {
            return Err(Error::AlreadyExists(format!("dataset '{}'", to)));
        }
        self.zfs(["rename", from, to])?;
        tracing::info!(from, to, "renamed dataset");
        Ok(())
    }

    /// Destroy a dataset and everything below it
    ///
    /// A busy dataset (still mounted by a dying jail) is retried with
    /// exponential backoff.
    pub fn destroy_recursive(&self, dataset: &str) -> Result<()> {
        if !self.exists(dataset)? {
            return Ok(());
        }

        let backoff = backoff_from_config(&self.ctx.settings().retry);
        let mut rng = rng();
        let mut attempt: u8 = 0;

        loop {
            attempt += 1;
            match self.zfs(["destroy", "-r", "-f", dataset]) {
                Ok(_) => {
                    tracing::info!(dataset, "destroyed dataset");
                    return Ok(());
                }
                Err(e) if is_busy(&e) => match backoff.delay(attempt, &mut rng) {
                    Some(delay_ms) => {
                        tracing::warn!(dataset, attempt, delay_ms, "dataset busy, retrying");
                        thread::sleep(Duration::from_millis(delay_ms));
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Hand a dataset to a running jail
    pub fn jail(&self, jail_name: &str, dataset: &str) -> Result<()> {
        self.zfs(["jail", jail_name, dataset])?;
        Ok(())
    }

    pub fn unjail(&self, jail_name: &str, dataset: &str) -> Result<()> {
        self.zfs(["unjail", jail_name, dataset])?;
        Ok(())
    }
}

/// Keeps a template dataset writable for the guard's lifetime
///
/// Creating the guard turns `readonly` off; dropping it turns it back on,
/// whatever path the caller leaves by.
pub struct ReadonlyGuard<'a> {
    ctx: &'a Context,
    dataset: String,
}

impl<'a> ReadonlyGuard<'a> {
    pub fn new(ctx: &'a Context, dataset: &str) -> Result<Self> {
        DatasetOrchestrator::new(ctx).set(dataset, "readonly", "off")?;
        tracing::debug!(dataset, "readonly off");
        Ok(Self {
            ctx,
            dataset: dataset.to_string(),
        })
    }
}

impl Drop for ReadonlyGuard<'_> {
    fn drop(&mut self) {
        match DatasetOrchestrator::new(self.ctx).set(&self.dataset, "readonly", "on") {
            Ok(()) => tracing::debug!(dataset = %self.dataset, "readonly on"),
            Err(e) => tracing::error!(dataset = %self.dataset, error = %e, "failed to restore readonly"),
        }
    }
}
