use std::collections::HashMap;

use crate::path::RqPath;
use crate::queue::Method;

/// The default listing-ignore patterns of spec §4.5: local names that
/// are never surfaced and never evicted, just skipped outright.
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[".metadata_never_index*", ".aem", ".DS_Store"];

fn matches_ignore(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => name == pattern,
    }
}

/// Which side of the merge an entry in the final listing came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Source {
    Remote,
    Local,
}

#[derive(Clone, Debug)]
pub struct MergedEntry {
    pub path: RqPath,
    pub source: Source,
}

/// What the caller (RQTree) learned from probing one locally present
/// entry, precomputed because deciding `canDelete` needs the raw
/// content timestamp as well as the sidecar (spec §4.3).
pub struct LocalProbe {
    pub path: RqPath,
    pub is_temp: bool,
    pub created_locally: bool,
    pub can_delete: bool,
}

pub struct MergeOutcome {
    /// The final listing: remote establishes the shape, local entries
    /// override or add to it (spec §4.5 step 2-3).
    pub entries: Vec<MergedEntry>,
    /// Local-only entries that were unsafe to silently evict: surfaced
    /// in the listing *and* reported as a conflict event.
    pub conflicts: Vec<RqPath>,
    /// Safe-to-evict local-only entries that should be deleted from
    /// the cache (content + sidecar, recursively if a directory).
    pub evictions: Vec<RqPath>,
}

/// The three-phase directory-listing merge of spec §4.5 — "the heart of
/// the core". Pure and independently testable: no I/O, no locking, just
/// the decision logic over already-collected inputs.
pub fn merge(
    remote: &[RqPath],
    queue: &HashMap<String, Method>,
    q_exists_locally: bool,
    local: &[LocalProbe],
    ignore_patterns: &[&str],
) -> MergeOutcome {
    let mut result: HashMap<String, MergedEntry> = HashMap::new();

    for r in remote {
        let name = r.name().to_string();
        if crate::path::is_temp_name(&name) {
            continue;
        }
        if matches!(queue.get(&name), Some(Method::Delete)) {
            continue;
        }
        result.insert(
            name,
            MergedEntry {
                path: r.clone(),
                source: Source::Remote,
            },
        );
    }

    let mut conflicts = Vec::new();
    let mut evictions = Vec::new();

    if q_exists_locally {
        for entry in local {
            let name = entry.path.name().to_string();
            if ignore_patterns.iter().any(|pat| matches_ignore(pat, &name)) {
                continue;
            }

            if entry.is_temp {
                result.insert(
                    name,
                    MergedEntry {
                        path: entry.path.clone(),
                        source: Source::Local,
                    },
                );
                continue;
            }

            if result.contains_key(&name) {
                // also present remotely: local wins.
                result.insert(
                    name,
                    MergedEntry {
                        path: entry.path.clone(),
                        source: Source::Local,
                    },
                );
                continue;
            }

            if entry.created_locally {
                result.insert(
                    name,
                    MergedEntry {
                        path: entry.path.clone(),
                        source: Source::Local,
                    },
                );
            } else if entry.can_delete {
                evictions.push(entry.path.clone());
            } else {
                result.insert(
                    name.clone(),
                    MergedEntry {
                        path: entry.path.clone(),
                        source: Source::Local,
                    },
                );
                conflicts.push(entry.path.clone());
            }
        }
    }

    MergeOutcome {
        entries: result.into_values().collect(),
        conflicts,
        evictions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> RqPath {
        RqPath::new(p).unwrap()
    }

    #[test]
    fn remote_only_listing_passes_through() {
        let remote = vec![path("/a"), path("/b"), path("/c")];
        let queue = HashMap::new();
        let outcome = merge(&remote, &queue, false, &[], DEFAULT_IGNORE_PATTERNS);
        assert_eq!(outcome.entries.len(), 3);
        assert!(outcome.conflicts.is_empty());
        assert!(outcome.evictions.is_empty());
    }

    #[test]
    fn queued_delete_hides_remote_entry() {
        let remote = vec![path("/r")];
        let mut queue = HashMap::new();
        queue.insert("r".to_string(), Method::Delete);
        let outcome = merge(&remote, &queue, false, &[], DEFAULT_IGNORE_PATTERNS);
        assert!(outcome.entries.is_empty());
    }

    #[test]
    fn safe_local_only_entry_is_evicted_silently() {
        let remote: Vec<RqPath> = vec![];
        let queue = HashMap::new();
        let local = vec![LocalProbe {
            path: path("/r"),
            is_temp: false,
            created_locally: false,
            can_delete: true,
        }];
        let outcome = merge(&remote, &queue, true, &local, DEFAULT_IGNORE_PATTERNS);
        assert!(outcome.entries.is_empty());
        assert_eq!(outcome.evictions, vec![path("/r")]);
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn unsafe_local_only_entry_surfaces_as_conflict() {
        let remote: Vec<RqPath> = vec![];
        let queue = HashMap::new();
        let local = vec![LocalProbe {
            path: path("/r"),
            is_temp: false,
            created_locally: false,
            can_delete: false,
        }];
        let outcome = merge(&remote, &queue, true, &local, DEFAULT_IGNORE_PATTERNS);
        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(outcome.conflicts, vec![path("/r")]);
        assert!(outcome.evictions.is_empty());
    }

    #[test]
    fn local_creation_is_visible_even_without_remote_counterpart() {
        let remote: Vec<RqPath> = vec![];
        let queue = HashMap::new();
        let local = vec![LocalProbe {
            path: path("/x"),
            is_temp: false,
            created_locally: true,
            can_delete: false,
        }];
        let outcome = merge(&remote, &queue, true, &local, DEFAULT_IGNORE_PATTERNS);
        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(outcome.entries[0].source, Source::Local);
    }

    #[test]
    fn local_wins_when_present_on_both_sides() {
        let remote = vec![path("/shared")];
        let queue = HashMap::new();
        let local = vec![LocalProbe {
            path: path("/shared"),
            is_temp: false,
            created_locally: false,
            can_delete: false,
        }];
        let outcome = merge(&remote, &queue, true, &local, DEFAULT_IGNORE_PATTERNS);
        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(outcome.entries[0].source, Source::Local);
    }

    #[test]
    fn ignored_names_are_skipped_entirely() {
        let remote: Vec<RqPath> = vec![];
        let queue = HashMap::new();
        let local = vec![LocalProbe {
            path: path("/.DS_Store"),
            is_temp: false,
            created_locally: false,
            can_delete: false,
        }];
        let outcome = merge(&remote, &queue, true, &local, DEFAULT_IGNORE_PATTERNS);
        assert!(outcome.entries.is_empty());
        assert!(outcome.conflicts.is_empty());
        assert!(outcome.evictions.is_empty());
    }

    #[test]
    fn temp_local_entries_are_always_included() {
        let remote: Vec<RqPath> = vec![];
        let queue = HashMap::new();
        let local = vec![LocalProbe {
            path: path("/.tmp123"),
            is_temp: true,
            created_locally: false,
            can_delete: false,
        }];
        let outcome = merge(&remote, &queue, true, &local, DEFAULT_IGNORE_PATTERNS);
        assert_eq!(outcome.entries.len(), 1);
    }

    #[test]
    fn listing_does_not_run_local_phase_when_dir_absent_locally() {
        let remote = vec![path("/r")];
        let queue = HashMap::new();
        let local = vec![LocalProbe {
            path: path("/stale"),
            is_temp: false,
            created_locally: false,
            can_delete: false,
        }];
        let outcome = merge(&remote, &queue, false, &local, DEFAULT_IGNORE_PATTERNS);
        assert_eq!(outcome.entries.len(), 1);
        assert!(outcome.conflicts.is_empty());
    }
}
