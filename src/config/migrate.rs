//! Configuration version ladder
//!
//! Each rung injects the keys introduced at that version when they are
//! missing. Rungs only add; applying the ladder twice is the same as once.

use super::document::ConfigDocument;

/// Current on-disk schema version
pub const CURRENT_VERSION: u32 = 15;

type Rung = fn(&mut ConfigDocument, Option<u32>);

fn inject(doc: &mut ConfigDocument, key: &str, value: &str) {
    if doc.get_nonempty(key).is_none() {
        doc.set(key, value);
    }
}

fn v2(doc: &mut ConfigDocument, _: Option<u32>) {
    inject(doc, "sysvmsg", "new");
    inject(doc, "sysvsem", "new");
    inject(doc, "sysvshm", "new");
}

fn v4(doc: &mut ConfigDocument, _: Option<u32>) {
    inject(doc, "basejail", "no");
}

fn v5(doc: &mut ConfigDocument, _: Option<u32>) {
    inject(doc, "comment", "none");
}

fn v6(doc: &mut ConfigDocument, _: Option<u32>) {
    inject(doc, "host_time", "yes");
}

fn v7(doc: &mut ConfigDocument, _: Option<u32>) {
    inject(doc, "depends", "none");
}

fn v9(doc: &mut ConfigDocument, _: Option<u32>) {
    inject(doc, "dhcp", "off");
    inject(doc, "bpf", "no");
}

fn v10(doc: &mut ConfigDocument, _: Option<u32>) {
    inject(doc, "vnet_interfaces", "none");
}

fn v11(doc: &mut ConfigDocument, _: Option<u32>) {
    inject(doc, "hostid_strict_check", "off");
}

fn v12(doc: &mut ConfigDocument, _: Option<u32>) {
    inject(doc, "allow_mlock", "0");
}

fn v13(doc: &mut ConfigDocument, from: Option<u32>) {
    // Before 14, "none" meant what "auto" means now
    if matches!(from, Some(12) | Some(13)) && doc.get("vnet_default_interface") == Some("none") {
        doc.set("vnet_default_interface", "auto");
    }
    inject(doc, "vnet_default_interface", "auto");
}

fn v14(doc: &mut ConfigDocument, _: Option<u32>) {
    inject(doc, "allow_tun", "0");
}

fn v15(doc: &mut ConfigDocument, _: Option<u32>) {
    inject(doc, "allow_mount_fusefs", "0");
}

static LADDER: &[(u32, Rung)] = &[
    (2, v2),
    (4, v4),
    (5, v5),
    (6, v6),
    (7, v7),
    (9, v9),
    (10, v10),
    (11, v11),
    (12, v12),
    (13, v13),
    (14, v14),
    (15, v15),
];

/// Whether the document needs to go through the ladder
///
/// Thin documents carry no version and take missing keys from the
/// defaults instead.
pub fn needs_migration(doc: &ConfigDocument) -> bool {
    doc.is_thick() && doc.version() != Some(CURRENT_VERSION)
}

/// Bring a thick document up to [`CURRENT_VERSION`]
///
/// Every rung runs regardless of the starting version; since rungs only
/// fill gaps this converges to the same schema from any start. The release
/// name is normalized (patch level stripped, original kept in
/// `cloned_release`).
pub fn migrate(mut doc: ConfigDocument) -> (ConfigDocument, bool) {
    if !needs_migration(&doc) {
        return (doc, false);
    }

    let from = doc.version();
    for (_, rung) in LADDER {
        rung(&mut doc, from);
    }

    if let Some(release) = doc.get_nonempty("release").map(str::to_string) {
        let base = strip_patch(&release);
        inject(&mut doc, "cloned_release", &release);
        doc.set("release", base);
    }

    doc.set_version(CURRENT_VERSION);
    (doc, true)
}

/// `13.2-RELEASE-p4` -> `13.2-RELEASE`
pub fn strip_patch(release: &str) -> &str {
    match release.rsplit_once("-p") {
        Some((base, patch)) if !patch.is_empty() && patch.chars().all(|c| c.is_ascii_digit()) => {
            base
        }
        _ => release,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy(version: Option<u32>) -> ConfigDocument {
        let mut doc = ConfigDocument::from_pairs([
            ("release", "11.2-RELEASE-p3"),
            ("host_hostuuid", "web"),
            ("vnet_default_interface", "none"),
        ]);
        if let Some(v) = version {
            doc.set_version(v);
        } else {
            doc.set("CONFIG_TYPE", "THICK");
        }
        doc
    }

    #[test]
    fn test_idempotent_from_every_version() {
        for v in [None, Some(1), Some(3), Some(8), Some(12), Some(13), Some(14)] {
            let (once, changed) = migrate(legacy(v));
            assert!(changed);
            let (twice, changed_again) = migrate(once.clone());
            assert!(!changed_again);
            assert_eq!(once, twice, "from version {:?}", v);
            assert_eq!(once.version(), Some(CURRENT_VERSION));
        }
    }

    #[test]
    fn test_injects_missing_keys() {
        let (doc, _) = migrate(legacy(Some(3)));
        assert_eq!(doc.get("sysvmsg"), Some("new"));
        assert_eq!(doc.get("dhcp"), Some("off"));
        assert_eq!(doc.get("bpf"), Some("no"));
        assert_eq!(doc.get("allow_tun"), Some("0"));
        assert_eq!(doc.get("allow_mount_fusefs"), Some("0"));
    }

    #[test]
    fn test_keeps_existing_values() {
        let mut doc = legacy(Some(5));
        doc.set("host_time", "no");
        doc.set("comment", "");
        let (doc, _) = migrate(doc);
        assert_eq!(doc.get("host_time"), Some("no"));
        // empty counts as missing
        assert_eq!(doc.get("comment"), Some("none"));
    }

    #[test]
    fn test_vnet_default_interface_none_means_auto() {
        let (doc, _) = migrate(legacy(Some(12)));
        assert_eq!(doc.get("vnet_default_interface"), Some("auto"));

        // only for documents written by 12 and 13
        let (doc, _) = migrate(legacy(Some(14)));
        assert_eq!(doc.get("vnet_default_interface"), Some("none"));
    }

    #[test]
    fn test_release_patch_stripped() {
        let (doc, _) = migrate(legacy(Some(9)));
        assert_eq!(doc.get("release"), Some("11.2-RELEASE"));
        assert_eq!(doc.get("cloned_release"), Some("11.2-RELEASE-p3"));
        assert_eq!(strip_patch("14.1-RELEASE"), "14.1-RELEASE");
        assert_eq!(strip_patch("EMPTY"), "EMPTY");
    }

    #[test]
    fn test_thin_untouched() {
        let doc = ConfigDocument::from_pairs([("release", "14.1-RELEASE")]);
        let (out, changed) = migrate(doc.clone());
        assert!(!changed);
        assert_eq!(out, doc);
    }

    #[test]
    fn test_current_untouched() {
        let mut doc = ConfigDocument::from_pairs([("release", "14.1-RELEASE-p1")]);
        doc.set_version(CURRENT_VERSION);
        let (out, changed) = migrate(doc.clone());
        assert!(!changed);
        assert_eq!(out, doc);
    }
}
