//! Transfer planning and the remote naming scheme.
//!
//! Group names embed the snapshots they span (`backup0`,
//! `backup0_backup1`, ...), so restore tooling can recover the chain order
//! from a bucket listing alone, without this engine's state file.

pub mod downloader;
pub mod uploader;

use std::collections::BTreeMap;

use crate::snapshot::snapshot_index;

/// Whether a run ships the whole dataset or a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Full,
    Incremental,
}

/// One run's transfer, fully named.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSpec {
    pub mode: TransferMode,
    /// Chain head the stream diffs against; `None` for a full transfer.
    pub from: Option<String>,
    /// Snapshot the stream produces.
    pub to: String,
    /// Remote key group the chunks land in.
    pub group: String,
}

/// Decide full-vs-incremental and name the remote group.
pub fn plan(object_prefix: &str, chain_head: Option<&str>, new_snapshot: &str) -> TransferSpec {
    match chain_head {
        None => TransferSpec {
            mode: TransferMode::Full,
            from: None,
            to: new_snapshot.to_string(),
            group: format!("{object_prefix}{new_snapshot}"),
        },
        Some(from) => TransferSpec {
            mode: TransferMode::Incremental,
            from: Some(from.to_string()),
            to: new_snapshot.to_string(),
            group: format!("{object_prefix}{from}_{new_snapshot}"),
        },
    }
}

/// Remote key of one chunk within a group.
pub fn chunk_key(group: &str, index: u64) -> String {
    format!("{group}/{index}")
}

/// Split a group name (object prefix already stripped) back into the
/// snapshots it spans: `backup0` → `(None, "backup0")`,
/// `backup0_backup1` → `(Some("backup0"), "backup1")`.
///
/// The snapshot prefix is required because it may itself contain
/// underscores; every split point is tried against the naming scheme.
pub fn parse_group_name<'a>(
    snapshot_prefix: &str,
    name: &'a str,
) -> Option<(Option<&'a str>, &'a str)> {
    if snapshot_index(snapshot_prefix, name).is_some() {
        return Some((None, name));
    }
    for (pos, _) in name.match_indices('_') {
        let (from, to) = (&name[..pos], &name[pos + 1..]);
        if snapshot_index(snapshot_prefix, from).is_some()
            && snapshot_index(snapshot_prefix, to).is_some()
        {
            return Some((Some(from), to));
        }
    }
    None
}

/// Group name → chunk count, extracted from a raw key listing.
pub fn groups_from_keys<'a>(
    object_prefix: &str,
    keys: impl IntoIterator<Item = &'a str>,
) -> BTreeMap<String, u64> {
    let mut groups = BTreeMap::new();
    for key in keys {
        let Some(rest) = key.strip_prefix(object_prefix) else {
            continue;
        };
        let Some((group, index)) = rest.rsplit_once('/') else {
            continue;
        };
        if index.parse::<u64>().is_ok() {
            *groups.entry(group.to_string()).or_default() += 1;
        }
    }
    groups
}

/// Order groups into chain order by the index of the snapshot they produce.
/// Names that do not follow the scheme sort last.
pub fn chain_order(snapshot_prefix: &str, groups: BTreeMap<String, u64>) -> Vec<(String, u64)> {
    let mut ordered: Vec<_> = groups.into_iter().collect();
    ordered.sort_by_key(|(name, _)| {
        parse_group_name(snapshot_prefix, name)
            .and_then(|(_, to)| snapshot_index(snapshot_prefix, to))
            .unwrap_or(u64::MAX)
    });
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_chain_head_means_full() {
        let spec = plan("d/", None, "backup0");
        assert_eq!(spec.mode, TransferMode::Full);
        assert_eq!(spec.from, None);
        assert_eq!(spec.to, "backup0");
        assert_eq!(spec.group, "d/backup0");
    }

    #[test]
    fn chain_head_means_incremental_from_it() {
        let spec = plan("d/", Some("backup4"), "backup5");
        assert_eq!(spec.mode, TransferMode::Incremental);
        assert_eq!(spec.from.as_deref(), Some("backup4"));
        assert_eq!(spec.group, "d/backup4_backup5");
    }

    #[test]
    fn group_names_parse_back() {
        assert_eq!(
            parse_group_name("backup", "backup0"),
            Some((None, "backup0"))
        );
        assert_eq!(
            parse_group_name("backup", "backup0_backup1"),
            Some((Some("backup0"), "backup1"))
        );
        assert_eq!(parse_group_name("backup", "junk"), None);
    }

    #[test]
    fn group_names_parse_back_with_underscored_prefix() {
        assert_eq!(
            parse_group_name("my_backup", "my_backup0_my_backup1"),
            Some((Some("my_backup0"), "my_backup1"))
        );
    }

    #[test]
    fn listing_recovers_groups_and_counts() {
        let keys = [
            "d/backup0/0",
            "d/backup0/1",
            "d/backup0_backup1/0",
            "d/backup0_backup1/not-a-chunk",
            "other/backup9/0",
        ];
        let groups = groups_from_keys("d/", keys);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["backup0"], 2);
        assert_eq!(groups["backup0_backup1"], 1);
    }

    #[test]
    fn chain_order_follows_target_snapshot_index() {
        let mut groups = BTreeMap::new();
        groups.insert("backup1_backup2".to_string(), 1);
        groups.insert("backup0".to_string(), 3);
        groups.insert("backup0_backup1".to_string(), 2);

        let ordered = chain_order("backup", groups);
        let names: Vec<_> = ordered.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["backup0", "backup0_backup1", "backup1_backup2"]);
    }
}
