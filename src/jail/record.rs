//! Where a jail lives on disk and in the pool

use crate::context::Context;
use std::fmt;
use std::path::PathBuf;

/// Top-level directory holding a jail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Jails,
    Templates,
}

impl Location {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Location::Jails => "jails",
            Location::Templates => "templates",
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

/// A managed jail: its identifier and where it is stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JailRecord {
    /// Name or UUID, unique within the pool
    pub name: String,
    pub location: Location,
}

impl JailRecord {
    pub fn new(name: impl Into<String>, location: Location) -> Self {
        Self {
            name: name.into(),
            location,
        }
    }

    pub fn is_template(&self) -> bool {
        self.location == Location::Templates
    }

    /// Name passed to jail(8); dots are not allowed there
    pub fn kernel_name(&self) -> String {
        kernel_name(&self.name)
    }

    /// Dataset path relative to the root dataset
    pub fn relative_dataset(&self) -> String {
        format!("{}/{}", self.location.dir_name(), self.name)
    }

    /// Full dataset name, e.g. `zroot/iocage/jails/web`
    pub fn dataset(&self, ctx: &Context) -> String {
        ctx.dataset(&self.relative_dataset())
    }

    pub fn root_dataset(&self, ctx: &Context) -> String {
        format!("{}/root", self.dataset(ctx))
    }

    /// Jail directory holding config.json and fstab
    pub fn dir(&self, ctx: &Context) -> PathBuf {
        ctx.iocroot().join(self.location.dir_name()).join(&self.name)
    }

    pub fn root_path(&self, ctx: &Context) -> PathBuf {
        self.dir(ctx).join("root")
    }

    pub fn config_path(&self, ctx: &Context) -> PathBuf {
        self.dir(ctx).join("config.json")
    }

    pub fn fstab_path(&self, ctx: &Context) -> PathBuf {
        self.dir(ctx).join("fstab")
    }

    /// Runtime parameter file consumed by jail(8)
    pub fn runtime_path(&self, ctx: &Context) -> PathBuf {
        ctx.run_dir().join(format!("{}.conf", self.kernel_name()))
    }

    /// Effective mount table (user plus generated lines) handed to jail(8)
    pub fn mount_table_path(&self, ctx: &Context) -> PathBuf {
        ctx.run_dir().join(format!("{}.fstab", self.kernel_name()))
    }

    /// Per-jail lock file
    pub fn lock_path(&self, ctx: &Context) -> PathBuf {
        ctx.run_dir().join(format!("{}.lock", self.kernel_name()))
    }

    pub fn console_log(&self, ctx: &Context) -> PathBuf {
        ctx.log_dir().join(format!("{}-console.log", self.name))
    }
}

/// Kernel jail name for an identifier
pub fn kernel_name(name: &str) -> String {
    format!("ioc-{}", name.replace('.', "_"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::TestEnv;

    #[test]
    fn test_names_and_paths() {
        let env = TestEnv::new();
        let rec = JailRecord::new("web.example", Location::Jails);
        assert_eq!(rec.kernel_name(), "ioc-web_example");
        assert_eq!(rec.dataset(&env.ctx), "tank/iocage/jails/web.example");
        assert_eq!(rec.root_dataset(&env.ctx), "tank/iocage/jails/web.example/root");
        assert!(rec.config_path(&env.ctx).ends_with("iocage/jails/web.example/config.json"));
        assert!(rec.runtime_path(&env.ctx).ends_with("run/ioc-web_example.conf"));

        let tpl = JailRecord::new("base", Location::Templates);
        assert!(tpl.is_template());
        assert_eq!(tpl.relative_dataset(), "templates/base");
    }
}
