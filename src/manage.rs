//! Jail management verbs outside the start/stop lifecycle
//!
//! Creation and destruction, renaming, templates, snapshots and property
//! access. Every verb that changes a jail holds its lock file and refuses
//! to touch a running jail unless stated otherwise.

mod create;
mod property;
mod rename;
mod snapshot;

pub use create::CreateOptions;

use crate::config::migrate;
use crate::config::{ConfigDocument, ConfigStore, JailConfig};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::jail::resolve;
use crate::jail::state::JailState;
use regex::Regex;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap());

/// Names the command line gives a meaning of its own
const RESERVED_NAMES: &[&str] = &["default", "ALL"];

/// One row of `list`
#[derive(Debug, Clone, Serialize)]
pub struct JailSummary {
    pub name: String,
    pub state: String,
    pub jid: Option<i32>,
    pub release: String,
    pub ip4: String,
    pub boot: bool,
    pub template: bool,
}

/// What `migrate` did to each jail
#[derive(Debug, Default)]
pub struct MigrateReport {
    pub migrated: Vec<String>,
    pub current: Vec<String>,
    pub corrupt: Vec<(String, Error)>,
}

/// Management operations on jails
pub struct JailManager<'a> {
    ctx: &'a Context,
    store: ConfigStore<'a>,
}

impl<'a> JailManager<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self {
            ctx,
            store: ConfigStore::new(ctx),
        }
    }

    fn is_running(&self, cfg: &JailConfig) -> bool {
        self.ctx.host().jail_id(&cfg.record.kernel_name()).is_some()
    }

    fn ensure_stopped(&self, cfg: &JailConfig, action: &str) -> Result<()> {
        if self.is_running(cfg) {
            return Err(Error::InvalidConfiguration(format!(
                "jail '{}' is running, stop it before {}",
                cfg.name(),
                action
            )));
        }
        Ok(())
    }

    /// Reject names jail(8) or the pool cannot hold, and names in use
    fn check_new_name(&self, name: &str) -> Result<()> {
        if !NAME_RE.is_match(name) {
            return Err(Error::invalid_value(
                "name",
                format!("'{}' may only contain letters, digits, '.', '_' and '-'", name),
            ));
        }
        if RESERVED_NAMES.contains(&name) {
            return Err(Error::invalid_value("name", format!("'{}' is reserved", name)));
        }
        if resolve::list_records(self.ctx)?.iter().any(|r| r.name == name) {
            return Err(Error::AlreadyExists(format!("jail '{}'", name)));
        }
        Ok(())
    }

    /// Every jail with its state; unreadable jails are left out
    pub fn list(&self) -> Result<Vec<JailSummary>> {
        let mut rows = Vec::new();
        for loaded in self.store.load_all()? {
            let cfg = match loaded {
                Ok(cfg) => cfg,
                Err((record, e)) => {
                    tracing::warn!(jail = %record.name, error = %e, "skipping unreadable jail");
                    continue;
                }
            };
            let jid = self.ctx.host().jail_id(&cfg.record.kernel_name());
            rows.push(JailSummary {
                name: cfg.name().to_string(),
                state: JailState::observe(self.ctx, &cfg.record).to_string(),
                jid,
                release: cfg.get("release"),
                ip4: if cfg.is_on("dhcp") { "DHCP".to_string() } else { cfg.get("ip4_addr") },
                boot: cfg.is_on("boot"),
                template: cfg.record.is_template(),
            });
        }
        Ok(rows)
    }

    /// Load every jail, bringing old documents to the current version
    pub fn migrate(&self) -> Result<MigrateReport> {
        let mut report = MigrateReport::default();
        for record in resolve::list_records(self.ctx)? {
            let stale = ConfigDocument::load(&record.config_path(self.ctx))
                .map(|doc| migrate::needs_migration(&doc))
                .unwrap_or(false);
            match self.store.load(&record) {
                Ok(_) if stale => report.migrated.push(record.name),
                Ok(_) => report.current.push(record.name),
                Err(e) => {
                    tracing::warn!(jail = %record.name, error = %e, "cannot migrate");
                    report.corrupt.push((record.name, e));
                }
            }
        }
        Ok(report)
    }
}

/// Follow a dataset rename on disk
///
/// The mountpoint usually moves with the dataset; when it did not, the
/// directory is moved by hand.
fn relocate_dir(from: &Path, to: &Path) -> Result<()> {
    if to.exists() {
        // Mounted at the new place already; the old mountpoint may linger
        if from.exists()
            && let Err(e) = fs::remove_dir(from)
        {
            tracing::warn!(path = %from.display(), error = %e, "stale mountpoint left behind");
        }
        return Ok(());
    }
    if !from.exists() {
        return Ok(());
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(from, to)?;
    Ok(())
}
