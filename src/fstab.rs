//! Per-jail mount table
//!
//! `<jail>/fstab` holds the user's six-field lines. Lines ironcage derives
//! itself (basejail bind mounts) carry the [`GENERATED_TAG`] comment; they
//! are dropped when the file is read and recomputed on every start, so the
//! stored file only ever contains what the user added.

use crate::config::document::write_atomic;
use crate::error::{Error, Result};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

/// Provenance comment on generated lines
pub const GENERATED_TAG: &str = "ironcage-auto";

/// One mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    pub source: String,
    pub destination: String,
    pub fstype: String,
    pub options: String,
    pub dump: u32,
    pub pass: u32,
    pub comment: Option<String>,
}

impl FstabEntry {
    pub fn new(source: &str, destination: &str, fstype: &str, options: &str) -> Self {
        Self {
            source: source.to_string(),
            destination: destination.to_string(),
            fstype: fstype.to_string(),
            options: options.to_string(),
            dump: 0,
            pass: 0,
            comment: None,
        }
    }

    /// Mark the entry as derived
    pub fn generated(mut self) -> Self {
        self.comment = Some(GENERATED_TAG.to_string());
        self
    }

    pub fn is_generated(&self) -> bool {
        self.comment.as_deref() == Some(GENERATED_TAG)
    }

    fn parse(line: &str) -> Result<Self> {
        let (fields, comment) = match line.split_once('#') {
            Some((f, c)) => (f, Some(c.trim().to_string()).filter(|c| !c.is_empty())),
            None => (line, None),
        };
        let fields: Vec<&str> = fields.split_whitespace().collect();
        let bad = || Error::InvalidConfiguration(format!("bad fstab line '{}'", line));
        let [source, destination, fstype, options, dump, pass] = fields.as_slice() else {
            return Err(bad());
        };
        Ok(Self {
            source: source.to_string(),
            destination: destination.to_string(),
            fstype: fstype.to_string(),
            options: options.to_string(),
            dump: dump.parse().map_err(|_| bad())?,
            pass: pass.parse().map_err(|_| bad())?,
            comment,
        })
    }
}

impl fmt::Display for FstabEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.source, self.destination, self.fstype, self.options, self.dump, self.pass
        )?;
        if let Some(comment) = &self.comment {
            write!(f, " # {}", comment)?;
        }
        Ok(())
    }
}

/// The user's mount table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fstab {
    entries: Vec<FstabEntry>,
}

impl Fstab {
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let entry = FstabEntry::parse(line)?;
            if !entry.is_generated() {
                entries.push(entry);
            }
        }
        Ok(Self { entries })
    }

    /// Read a jail's fstab; a missing file is an empty table
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, self.render(&[]).as_bytes())
    }

    pub fn entries(&self) -> &[FstabEntry] {
        &self.entries
    }

    pub fn add(&mut self, entry: FstabEntry) {
        self.entries.push(entry);
    }

    /// Drop the entry mounted at `destination`
    pub fn remove(&mut self, destination: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.destination != destination);
        self.entries.len() != before
    }

    /// Rewrite path prefixes after a jail moved
    pub fn rewrite_prefix(&mut self, old: &str, new: &str) -> usize {
        let mut changed = 0;
        for entry in &mut self.entries {
            for field in [&mut entry.source, &mut entry.destination] {
                if let Some(rest) = field.strip_prefix(old)
                    && (rest.is_empty() || rest.starts_with('/'))
                {
                    *field = format!("{}{}", new, rest);
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Generated lines first, then the user's
    pub fn render(&self, generated: &[FstabEntry]) -> String {
        let mut out = String::new();
        for entry in generated.iter().chain(&self.entries) {
            out.push_str(&entry.to_string());
            out.push('\n');
        }
        out
    }
}

/// Mount points of an effective table, generated lines included
///
/// `None` when the table was never written.
pub fn mount_points(path: &Path) -> Result<Option<Vec<String>>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| FstabEntry::parse(l).map(|e| e.destination))
        .collect::<Result<Vec<_>>>()
        .map(Some)
}
