//! Userland version detection and the jail parameters it gates

use crate::error::{Error, Result};
use std::fmt;
use std::fs;
use std::path::Path;

/// FreeBSD release type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseType {
    /// -CURRENT development branch
    Current,
    /// -STABLE maintenance branch
    Stable,
    /// -RELEASE official release
    Release,
    /// -BETA pre-release
    Beta(u8),
    /// -RC release candidate
    Rc(u8),
}

impl fmt::Display for ReleaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseType::Current => write!(f, "CURRENT"),
            ReleaseType::Stable => write!(f, "STABLE"),
            ReleaseType::Release => write!(f, "RELEASE"),
            ReleaseType::Beta(n) => write!(f, "BETA{}", n),
            ReleaseType::Rc(n) => write!(f, "RC{}", n),
        }
    }
}

/// FreeBSD OS version information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsVersion {
    pub major: u8,
    pub minor: u8,
    /// Patch level (from -pX suffix)
    pub patch: Option<u8>,
    pub release_type: ReleaseType,
}

impl OsVersion {
    /// Userland version of a jail or release root
    ///
    /// Reads `USERLAND_VERSION` from `bin/freebsd-version` under `root`,
    /// falling back to `fallback` (usually the jail's `release`) when the
    /// script is missing or unreadable.
    pub fn userland(root: &Path, fallback: &str) -> Result<Self> {
        let script = root.join("bin/freebsd-version");
        if let Ok(text) = fs::read_to_string(&script)
            && let Some(version) = parse_userland_script(&text)
        {
            return Self::parse(&version);
        }
        tracing::debug!(script = %script.display(), fallback, "no freebsd-version, using release name");
        Self::parse(fallback)
    }

    /// Parse a FreeBSD version string
    ///
    /// Accepts `16.0-CURRENT`, `15.0-RELEASE`, `15.0-RELEASE-p1`,
    /// `14.2-STABLE`, `15.0-BETA1` and `15.0-RC2`.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('-').collect();

        if parts.len() < 2 {
            return Err(Error::InvalidVersion(format!(
                "Invalid version format: {}",
                s
            )));
        }

        let version_nums: Vec<&str> = parts[0].split('.').collect();
        if version_nums.len() != 2 {
            return Err(Error::InvalidVersion(format!(
                "Invalid version number: {}",
                parts[0]
            )));
        }

        let major = version_nums[0].parse::<u8>().map_err(|_| {
            Error::InvalidVersion(format!("Invalid major version: {}", version_nums[0]))
        })?;

        let minor = version_nums[1].parse::<u8>().map_err(|_| {
            Error::InvalidVersion(format!("Invalid minor version: {}", version_nums[1]))
        })?;

        let numbered = |tag: &str, prefix: &str| {
            tag.strip_prefix(prefix)
                .and_then(|n| n.parse::<u8>().ok())
                .unwrap_or(1)
        };
        let release_type = match parts[1] {
            "CURRENT" => ReleaseType::Current,
            "STABLE" => ReleaseType::Stable,
            "RELEASE" => ReleaseType::Release,
            s if s.starts_with("BETA") => ReleaseType::Beta(numbered(s, "BETA")),
            s if s.starts_with("RC") => ReleaseType::Rc(numbered(s, "RC")),
            _ => {
                return Err(Error::InvalidVersion(format!(
                    "Unknown release type: {}",
                    parts[1]
                )));
            }
        };

        let patch = parts
            .get(2)
            .and_then(|p| p.strip_prefix('p'))
            .and_then(|n| n.parse::<u8>().ok());

        Ok(OsVersion {
            major,
            minor,
            patch,
            release_type,
        })
    }

    fn number(&self) -> (u8, u8) {
        (self.major, self.minor)
    }

    /// tmpfs and fdescfs mounts inside jails (newer than 9.3)
    pub fn supports_tmpfs_fdescfs(&self) -> bool {
        self.number() > (9, 3)
    }

    /// sysvmsg/sysvsem/sysvshm jail parameters (newer than 10.3)
    pub fn supports_sysv(&self) -> bool {
        self.number() > (10, 3)
    }

    /// allow.mlock and allow.mount.fusefs (12.0 and later)
    pub fn supports_mlock_fusefs(&self) -> bool {
        self.number() >= (12, 0)
    }
}

/// Pull `USERLAND_VERSION="..."` out of the freebsd-version script
fn parse_userland_script(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let value = line.trim().strip_prefix("USERLAND_VERSION=")?;
        let value = value.trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}-{}", self.major, self.minor, self.release_type)?;
        if let Some(patch) = self.patch {
            write!(f, "-p{}", patch)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_current() {
        let ver = OsVersion::parse("16.0-CURRENT").unwrap();
        assert_eq!(ver.major, 16);
        assert_eq!(ver.minor, 0);
        assert_eq!(ver.patch, None);
        assert_eq!(ver.release_type, ReleaseType::Current);
    }

    #[test]
    fn test_parse_release_with_patch() {
        let ver = OsVersion::parse("13.2-RELEASE-p4").unwrap();
        assert_eq!(ver.major, 13);
        assert_eq!(ver.minor, 2);
        assert_eq!(ver.patch, Some(4));
        assert_eq!(ver.release_type, ReleaseType::Release);
    }

    #[test]
    fn test_parse_prerelease() {
        assert_eq!(OsVersion::parse("15.0-RC2").unwrap().release_type, ReleaseType::Rc(2));
        assert_eq!(OsVersion::parse("15.0-BETA3").unwrap().release_type, ReleaseType::Beta(3));
        assert!(OsVersion::parse("15.0").is_err());
        assert!(OsVersion::parse("15.0-WEIRD").is_err());
    }

    #[test]
    fn test_parameter_gates() {
        let old = OsVersion::parse("9.3-RELEASE").unwrap();
        assert!(!old.supports_tmpfs_fdescfs());
        assert!(!old.supports_sysv());

        let ten = OsVersion::parse("10.4-RELEASE").unwrap();
        assert!(ten.supports_tmpfs_fdescfs());
        assert!(ten.supports_sysv());
        assert!(!ten.supports_mlock_fusefs());

        assert!(OsVersion::parse("12.0-RELEASE").unwrap().supports_mlock_fusefs());
    }

    #[test]
    fn test_userland_from_script() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::write(
            dir.path().join("bin/freebsd-version"),
            "#!/bin/sh\nUSERLAND_VERSION=\"14.1-RELEASE-p5\"\n",
        )
        .unwrap();
        let ver = OsVersion::userland(dir.path(), "13.0-RELEASE").unwrap();
        assert_eq!(ver.to_string(), "14.1-RELEASE-p5");

        let empty = tempfile::tempdir().unwrap();
        let ver = OsVersion::userland(empty.path(), "13.0-RELEASE").unwrap();
        assert_eq!(ver.major, 13);
    }
}
