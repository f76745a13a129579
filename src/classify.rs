use std::collections::HashSet;

use crate::patch_format::{ChangeSet, FileIdentity, TreeSnapshot};

/// Partition two snapshots into new, modified and deleted files by identity.
///
/// An identity present in both trees is always reported as modified, even if the
/// bytes are unchanged: the delta tool is expected to emit a trivial patch in
/// that case. Output order follows the input snapshots.
pub fn classify(origin: &TreeSnapshot, modified: &TreeSnapshot) -> ChangeSet {
    let origin_ids: HashSet<&FileIdentity> = origin.entries.iter().collect();
    let modified_ids: HashSet<&FileIdentity> = modified.entries.iter().collect();

    let mut changes = ChangeSet::default();

    for id in &modified.entries {
        if origin_ids.contains(id) {
            changes.modified_files.push(id.clone());
        } else {
            changes.new_files.push(id.clone());
        }
    }

    changes.deleted_files = origin
        .entries
        .iter()
        .filter(|id| !modified_ids.contains(id))
        .cloned()
        .collect();

    changes
}
