//! Host-wide property defaults
//!
//! A property without an explicit value takes the value from
//! `<iocroot>/defaults.json` when set there, otherwise the registry default.

use super::document::ConfigDocument;
use super::schema::{self, DefaultInputs, HostFacts, Storage};
use crate::error::{Error, Result};
use std::path::Path;

/// Built-in defaults overlaid with the host's defaults.json
#[derive(Debug, Clone, Default)]
pub struct Defaults {
    overlay: ConfigDocument,
    facts: HostFacts,
}

impl Defaults {
    pub fn new(overlay: ConfigDocument, facts: HostFacts) -> Self {
        Self { overlay, facts }
    }

    /// Load the overlay from `path`; a missing file means no overrides
    pub fn load(path: &Path, facts: HostFacts) -> Result<Self> {
        let overlay = if path.exists() {
            ConfigDocument::load(path)?
        } else {
            ConfigDocument::new()
        };
        Ok(Self::new(overlay, facts))
    }

    pub fn facts(&self) -> &HostFacts {
        &self.facts
    }

    pub fn overlay(&self) -> &ConfigDocument {
        &self.overlay
    }

    /// Default for `key` as seen by the jail `uuid`
    pub fn get(&self, key: &str, uuid: Option<&str>) -> Option<String> {
        if let Some(value) = self.overlay.get_nonempty(key) {
            return Some(value.to_string());
        }
        let spec = schema::lookup(key)?;
        let inputs = DefaultInputs {
            facts: Some(&self.facts),
            uuid,
        };
        Some(spec.default.resolve(&inputs))
    }

    /// Every stored property at its default, for a new jail's document
    pub fn document(&self, uuid: &str) -> ConfigDocument {
        let mut doc = ConfigDocument::new();
        for spec in schema::PROPERTIES {
            if matches!(spec.storage, Storage::Dataset | Storage::DatasetReadOnly) {
                continue;
            }
            if let Some(value) = self.get(spec.name, Some(uuid)) {
                doc.set(spec.name, value);
            }
        }
        doc
    }

    /// Validate and record a host-wide default in the overlay
    pub fn set(&mut self, key: &str, value: &str) -> Result<String> {
        let spec = schema::lookup(key).ok_or_else(|| Error::InvalidProperty(key.to_string()))?;
        if matches!(spec.storage, Storage::Managed | Storage::DatasetReadOnly) {
            return Err(Error::invalid_value(key, "has no user-settable default"));
        }
        let normalized = schema::validate(key, value, Some(&self.facts))?;
        self.overlay.set(key, normalized.clone());
        Ok(normalized)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.overlay.save(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts() -> HostFacts {
        HostFacts {
            ncpu: 2,
            mac_prefix: "02aa00".into(),
            ..HostFacts::default()
        }
    }

    #[test]
    fn test_overlay_wins() {
        let overlay = ConfigDocument::from_pairs([("priority", "50")]);
        let defaults = Defaults::new(overlay, facts());
        assert_eq!(defaults.get("priority", None).as_deref(), Some("50"));
        assert_eq!(defaults.get("boot", None).as_deref(), Some("off"));
        assert_eq!(defaults.get("host_hostname", Some("web")).as_deref(), Some("web"));
        assert_eq!(defaults.get("bogus", None), None);
    }

    #[test]
    fn test_document_skips_dataset_properties() {
        let defaults = Defaults::new(ConfigDocument::new(), facts());
        let doc = defaults.document("web");
        assert_eq!(doc.get("mac_prefix"), Some("02aa00"));
        assert_eq!(doc.get("jail_zfs_dataset"), Some("iocage/jails/web/data"));
        assert!(!doc.contains("quota"));
        assert!(!doc.contains("used"));
    }

    #[test]
    fn test_set_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("defaults.json");
        let mut defaults = Defaults::load(&path, facts()).unwrap();

        assert_eq!(defaults.set("boot", "yes").unwrap(), "on");
        assert!(defaults.set("release", "14.1-RELEASE").is_err());
        assert!(defaults.set("priority", "500").is_err());
        defaults.save(&path).unwrap();

        let reloaded = Defaults::load(&path, facts()).unwrap();
        assert_eq!(reloaded.get("boot", None).as_deref(), Some("on"));
        assert_eq!(reloaded.overlay().len(), 1);
    }
}
