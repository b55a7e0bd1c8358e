//! zfs(8) scripted output (`-H`: tab-separated, no header)

use crate::error::{Error, Result};

/// Split `zfs list -H -o a,b,c` output into rows of `columns` fields
pub fn parse_rows(output: &str, columns: usize) -> Result<Vec<Vec<String>>> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let fields: Vec<String> = line.split('\t').map(str::to_string).collect();
            if fields.len() == columns {
                Ok(fields)
            } else {
                Err(Error::InvalidConfiguration(format!(
                    "expected {} columns from zfs, got {}: '{}'",
                    columns,
                    fields.len(),
                    line
                )))
            }
        })
        .collect()
}

/// Parse `zfs list -H -o name` output
pub fn parse_names(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse the single value of `zfs get -H -o value prop ds`; `-` reads as None
pub fn parse_value(output: &str) -> Option<String> {
    let value = output.trim();
    if value.is_empty() || value == "-" {
        None
    } else {
        Some(value.to_string())
    }
}

/// A snapshot row from `zfs list -H -t snapshot -o name,creation,used -p`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRow {
    pub dataset: String,
    pub name: String,
    pub creation: i64,
    pub used: u64,
}

pub fn parse_snapshots(output: &str) -> Result<Vec<SnapshotRow>> {
    parse_rows(output, 3)?
        .into_iter()
        .map(|row| {
            let (dataset, name) = row[0].split_once('@').ok_or_else(|| {
                Error::InvalidConfiguration(format!("'{}' is not a snapshot name", row[0]))
            })?;
            let creation = row[1].parse().map_err(|_| {
                Error::InvalidConfiguration(format!("bad creation time '{}'", row[1]))
            })?;
            let used = row[2]
                .parse()
                .map_err(|_| Error::InvalidConfiguration(format!("bad size '{}'", row[2])))?;
            Ok(SnapshotRow {
                dataset: dataset.to_string(),
                name: name.to_string(),
                creation,
                used,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows() {
        let out = "zroot/iocage/jails/web\t/zroot/iocage/jails/web\n\
                   zroot/iocage/jails/db\tnone\n";
        let rows = parse_rows(out, 2).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][1], "none");
        assert!(parse_rows("a\tb\tc\n", 2).is_err());
    }

    #[test]
    fn test_value() {
        assert_eq!(parse_value("on\n").as_deref(), Some("on"));
        assert_eq!(parse_value("-\n"), None);
    }

    #[test]
    fn test_snapshots() {
        let out = "zroot/iocage/jails/web/root@ioc_2024-01-01\t1704067200\t4096\n";
        let snaps = parse_snapshots(out).unwrap();
        assert_eq!(snaps[0].dataset, "zroot/iocage/jails/web/root");
        assert_eq!(snaps[0].name, "ioc_2024-01-01");
        assert_eq!(snaps[0].creation, 1704067200);
        assert!(parse_snapshots("zroot/x\t1\t2\n").is_err());
    }

    #[test]
    fn test_names() {
        assert_eq!(parse_names("a\n\nb\n"), vec!["a", "b"]);
    }
}
