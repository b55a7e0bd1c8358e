//! Resolving user-supplied jail references
//!
//! A reference may be a full name, a unique prefix of one, or use `_` where
//! the name has `.` (jail(8) names cannot contain dots).

use super::record::{JailRecord, Location};
use crate::context::Context;
use crate::error::{Error, Result};
use std::fs;

/// Every jail and template directory under the pool root
pub fn list_records(ctx: &Context) -> Result<Vec<JailRecord>> {
    let mut records = Vec::new();
    for location in [Location::Jails, Location::Templates] {
        let dir = ctx.iocroot().join(location.dir_name());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                records.push(JailRecord::new(name, location));
            }
        }
    }
    records.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(records)
}

fn normalize(name: &str) -> String {
    name.replace('.', "_")
}

/// Pick the one record `reference` designates
pub fn resolve_in(records: &[JailRecord], reference: &str) -> Result<JailRecord> {
    if reference.is_empty() {
        return Err(Error::NotFound("jail ''".into()));
    }

    // Exact name first, then the dot/underscore-insensitive form
    if let Some(rec) = records.iter().find(|r| r.name == reference) {
        return Ok(rec.clone());
    }
    let wanted = normalize(reference);
    let exact: Vec<&JailRecord> = records
        .iter()
        .filter(|r| normalize(&r.name) == wanted)
        .collect();
    if exact.len() == 1 {
        return Ok(exact[0].clone());
    }

    let matches: Vec<&JailRecord> = records
        .iter()
        .filter(|r| normalize(&r.name).starts_with(&wanted))
        .collect();

    match matches.as_slice() {
        [] => Err(Error::NotFound(format!("jail '{}'", reference))),
        [one] => Ok((*one).clone()),
        many => Err(Error::Ambiguous {
            reference: reference.to_string(),
            candidates: many
                .iter()
                .map(|r| r.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        }),
    }
}

/// Resolve a reference against the jails on disk
pub fn resolve(ctx: &Context, reference: &str) -> Result<JailRecord> {
    resolve_in(&list_records(ctx)?, reference)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::TestEnv;
    use crate::error::ErrorKind;

    fn records() -> Vec<JailRecord> {
        vec![
            JailRecord::new("web1", Location::Jails),
            JailRecord::new("web2", Location::Jails),
            JailRecord::new("db.internal", Location::Jails),
            JailRecord::new("6f3b2c1a-1111-4a2b-9c3d-000000000001", Location::Jails),
            JailRecord::new("base", Location::Templates),
        ]
    }

    #[test]
    fn test_exact_and_prefix() {
        let recs = records();
        assert_eq!(resolve_in(&recs, "web1").unwrap().name, "web1");
        assert_eq!(resolve_in(&recs, "6f3b").unwrap().name, "6f3b2c1a-1111-4a2b-9c3d-000000000001");
        assert_eq!(resolve_in(&recs, "base").unwrap().location, Location::Templates);
    }

    #[test]
    fn test_dots_and_underscores() {
        let recs = records();
        assert_eq!(resolve_in(&recs, "db_internal").unwrap().name, "db.internal");
        assert_eq!(resolve_in(&recs, "db_int").unwrap().name, "db.internal");
    }

    #[test]
    fn test_ambiguous_and_missing() {
        let recs = records();
        let err = resolve_in(&recs, "web").unwrap_err();
        assert!(matches!(err, Error::Ambiguous { .. }));
        assert!(err.to_string().contains("web1, web2"));

        assert_eq!(resolve_in(&recs, "mail").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_list_records() {
        let env = TestEnv::new();
        let root = env.ctx.iocroot();
        fs::create_dir_all(root.join("jails/b")).unwrap();
        fs::create_dir_all(root.join("jails/a")).unwrap();
        fs::create_dir_all(root.join("templates/t")).unwrap();
        fs::write(root.join("jails/stray-file"), "").unwrap();

        let recs = list_records(&env.ctx).unwrap();
        let names: Vec<_> = recs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "t"]);
        assert_eq!(resolve(&env.ctx, "t").unwrap().location, Location::Templates);
    }
}
