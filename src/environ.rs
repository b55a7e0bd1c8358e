//! Host files copied into a jail root before start

use crate::config::JailConfig;
use crate::error::Result;
use std::fs;
use std::path::Path;

const HOST_RESOLV: &str = "/etc/resolv.conf";
const HOST_LOCALTIME: &str = "/etc/localtime";

/// Write `etc/resolv.conf` according to the `resolver` property
///
/// `/dev/null` leaves the jail's file alone, `none` copies the host's,
/// another absolute path copies that file and anything else is literal
/// content with `;` separating lines.
pub fn write_resolver(value: &str, jail_root: &Path, host_resolv: &Path) -> Result<()> {
    let target = jail_root.join("etc/resolv.conf");
    match value {
        "/dev/null" => Ok(()),
        "none" => copy_if_present(host_resolv, &target),
        path if path.starts_with('/') && !path.contains(';') => {
            copy_if_present(Path::new(path), &target)
        }
        lines => {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut content: String = lines
                .split(';')
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            content.push('\n');
            fs::write(&target, content)?;
            Ok(())
        }
    }
}

fn copy_if_present(source: &Path, target: &Path) -> Result<()> {
    if !source.exists() {
        tracing::warn!(source = %source.display(), "nothing to copy into jail");
        return Ok(());
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, target)?;
    Ok(())
}

/// Resolver and timezone for a starting jail
pub fn prepare(cfg: &JailConfig, jail_root: &Path) -> Result<()> {
    write_resolver(&cfg.get("resolver"), jail_root, Path::new(HOST_RESOLV))?;
    if cfg.is_on("host_time") {
        copy_if_present(Path::new(HOST_LOCALTIME), &jail_root.join("etc/localtime"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_lines() {
        let dir = tempfile::tempdir().unwrap();
        write_resolver("nameserver 10.0.0.1;search lan", dir.path(), Path::new("/absent")).unwrap();
        let text = fs::read_to_string(dir.path().join("etc/resolv.conf")).unwrap();
        assert_eq!(text, "nameserver 10.0.0.1\nsearch lan\n");
    }

    #[test]
    fn test_copies_host_or_named_file() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("host-resolv.conf");
        fs::write(&host, "nameserver 1.1.1.1\n").unwrap();
        let root = dir.path().join("root");

        write_resolver("none", &root, &host).unwrap();
        assert_eq!(fs::read_to_string(root.join("etc/resolv.conf")).unwrap(), "nameserver 1.1.1.1\n");

        let custom = dir.path().join("custom.conf");
        fs::write(&custom, "nameserver 9.9.9.9\n").unwrap();
        write_resolver(custom.to_str().unwrap(), &root, &host).unwrap();
        assert_eq!(fs::read_to_string(root.join("etc/resolv.conf")).unwrap(), "nameserver 9.9.9.9\n");
    }

    #[test]
    fn test_dev_null_leaves_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        fs::write(dir.path().join("etc/resolv.conf"), "keep\n").unwrap();
        write_resolver("/dev/null", dir.path(), Path::new("/absent")).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("etc/resolv.conf")).unwrap(), "keep\n");
    }

    #[test]
    fn test_missing_source_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_resolver("none", dir.path(), &dir.path().join("absent")).unwrap();
        assert!(!dir.path().join("etc/resolv.conf").exists());
    }
}
