//! On-disk jail configuration document
//!
//! `config.json` is a flat JSON object of property name to value. Values are
//! kept as strings; numbers and booleans found in older files are
//! stringified on load. `CONFIG_VERSION` is pulled out of the map and
//! written back as a string.

use crate::error::{Error, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Key carrying the schema version
pub const VERSION_KEY: &str = "CONFIG_VERSION";

/// Key marking a document as thick even without a version
pub const TYPE_KEY: &str = "CONFIG_TYPE";

/// An ordered property map tagged with its schema version
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDocument {
    props: BTreeMap<String, String>,
    version: Option<u32>,
}

impl ConfigDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a document from key/value pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut doc = Self::new();
        for (k, v) in pairs {
            doc.set(k, v);
        }
        doc
    }

    pub fn version(&self) -> Option<u32> {
        self.version
    }

    pub fn set_version(&mut self, version: u32) {
        self.version = Some(version);
    }

    /// Thick documents store every property; thin ones only overrides
    pub fn is_thick(&self) -> bool {
        self.version.is_some() || self.get(TYPE_KEY) == Some("THICK")
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }

    /// Value of a key, treating empty strings as absent
    pub fn get_nonempty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.props.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if key == VERSION_KEY {
            self.version = value.into().parse().ok();
            return;
        }
        self.props.insert(key, value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.props.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.props.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// Parse a JSON object
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(map) = value else {
            return Err(Error::InvalidConfiguration(
                "configuration is not a JSON object".into(),
            ));
        };

        let mut doc = Self::new();
        for (key, value) in map {
            let text = match value {
                Value::String(s) => s,
                Value::Bool(b) => if b { "on" } else { "off" }.to_string(),
                Value::Number(n) => n.to_string(),
                Value::Null => "none".to_string(),
                other => other.to_string(),
            };
            if key == VERSION_KEY {
                doc.version = Some(text.trim().parse().map_err(|_| {
                    Error::InvalidConfiguration(format!("bad {}: '{}'", VERSION_KEY, text))
                })?);
            } else {
                doc.props.insert(key, text);
            }
        }
        Ok(doc)
    }

    /// Serialize with sorted keys and four-space indentation
    pub fn to_json(&self) -> Result<String> {
        let mut map = Map::new();
        for (k, v) in &self.props {
            map.insert(k.clone(), Value::String(v.clone()));
        }
        if let Some(version) = self.version {
            map.insert(VERSION_KEY.to_string(), Value::String(version.to_string()));
        }
        // preserve_order keeps insertion order; re-sort with the version key
        let sorted: BTreeMap<String, Value> = map.into_iter().collect();

        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        sorted.serialize(&mut ser)?;
        buf.push(b'\n');
        String::from_utf8(buf).map_err(|e| Error::InvalidConfiguration(e.to_string()))
    }

    /// Load a document from a file
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Write the document atomically (temp file + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, self.to_json()?.as_bytes())
    }
}

/// Replace a file's content without exposing a partially written file
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.tmp", file_name));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_as_string_or_number() {
        let doc = ConfigDocument::from_json(r#"{"CONFIG_VERSION": "14", "release": "13.2-RELEASE"}"#)
            .unwrap();
        assert_eq!(doc.version(), Some(14));
        assert!(!doc.contains(VERSION_KEY));

        let doc = ConfigDocument::from_json(r#"{"CONFIG_VERSION": 9}"#).unwrap();
        assert_eq!(doc.version(), Some(9));
    }

    #[test]
    fn test_values_stringified() {
        let doc = ConfigDocument::from_json(r#"{"priority": 10, "boot": true, "notes": null}"#)
            .unwrap();
        assert_eq!(doc.get("priority"), Some("10"));
        assert_eq!(doc.get("boot"), Some("on"));
        assert_eq!(doc.get("notes"), Some("none"));
    }

    #[test]
    fn test_serialized_form() {
        let mut doc = ConfigDocument::from_pairs([("release", "14.1-RELEASE"), ("boot", "on")]);
        doc.set_version(15);
        let json = doc.to_json().unwrap();
        assert!(json.contains("\"CONFIG_VERSION\": \"15\""));
        // sorted keys
        let boot = json.find("boot").unwrap();
        let release = json.find("release").unwrap();
        let version = json.find("CONFIG_VERSION").unwrap();
        assert!(version < boot && boot < release);
        assert!(json.contains("\n    \"boot\""));

        let back = ConfigDocument::from_json(&json).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_thick_detection() {
        let thin = ConfigDocument::from_pairs([("release", "14.1-RELEASE")]);
        assert!(!thin.is_thick());

        let marked = ConfigDocument::from_pairs([("CONFIG_TYPE", "THICK")]);
        assert!(marked.is_thick());

        let mut versioned = ConfigDocument::new();
        versioned.set_version(3);
        assert!(versioned.is_thick());
    }

    #[test]
    fn test_not_an_object() {
        assert!(ConfigDocument::from_json("[1, 2]").is_err());
        assert!(ConfigDocument::from_json("{").is_err());
    }

    #[test]
    fn test_save_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let doc = ConfigDocument::from_pairs([("host_hostname", "web")]);
        doc.save(&path).unwrap();
        doc.save(&path).unwrap();

        assert_eq!(ConfigDocument::load(&path).unwrap(), doc);
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }
}
