//! Shared resolution of one remote entity against its local match.

use crate::entity::{Entity, SyncEntity};
use crate::types::{LocalId, Timestamp};
use chrono::{DateTime, Utc};

/// What to write locally for one remote entity.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Resolution {
    /// Local copy already has this revision.
    UpToDate,
    /// No local match: insert under a fresh local id.
    Add(Entity),
    /// Replace the local copy's fields, keeping its local id.
    Overwrite(Entity),
    /// Local copy has unsent edits: keep it under a new name without a guid,
    /// then add the remote revision separately.
    Conflict { renamed: Entity, remote: Entity },
}

impl Resolution {
    /// The entity carrying the remote revision, if anything is to be written.
    pub(crate) fn target(&self) -> Option<&Entity> {
        match self {
            Resolution::UpToDate => None,
            Resolution::Add(e) | Resolution::Overwrite(e) => Some(e),
            Resolution::Conflict { remote, .. } => Some(remote),
        }
    }

    pub(crate) fn target_mut(&mut self) -> Option<&mut Entity> {
        match self {
            Resolution::UpToDate => None,
            Resolution::Add(e) | Resolution::Overwrite(e) => Some(e),
            Resolution::Conflict { remote, .. } => Some(remote),
        }
    }
}

/// Knobs for resolution that come from configuration and the clock.
pub(crate) struct ResolveContext<'a> {
    pub now_ms: Timestamp,
    pub timestamp_format: &'a str,
}

/// Remote revision as it should be stored when nothing local matches it.
pub(crate) fn as_new(mut remote: Entity) -> Entity {
    remote.set_local_id(LocalId::new());
    remote.set_dirty(false);
    remote.set_local(false);
    remote
}

/// Compare a remote entity with its local match.
///
/// A local copy with unsent content (dirty, or never uploaded) is kept under
/// a conflict name, except for kinds where the remote revision is authoritative.
pub(crate) fn resolve(remote: &Entity, local: &Entity, ctx: &ResolveContext<'_>) -> Resolution {
    if let (Some(remote_usn), Some(local_usn)) = (remote.usn(), local.usn()) {
        if remote_usn <= local_usn {
            return Resolution::UpToDate;
        }
    }

    if local.is_dirty() || local.is_local() {
        if remote.kind().remote_is_authoritative() {
            tracing::warn!(
                local = %local.describe(),
                "local edits to {} are discarded in favour of the remote revision",
                remote.kind()
            );
        } else {
            return Resolution::Conflict {
                renamed: rename_as_conflict(local, ctx),
                remote: as_new(remote.clone()),
            };
        }
    }

    let mut merged = remote.clone();
    merged.set_local_id(local.local_id());
    merged.set_dirty(false);
    merged.set_local(false);
    Resolution::Overwrite(merged)
}

/// Local copy moved aside by a conflict: same local id, no guid, dirty, and a
/// display key naming the conflict.
pub(crate) fn rename_as_conflict(local: &Entity, ctx: &ResolveContext<'_>) -> Entity {
    let mut renamed = local.clone();
    renamed.set_guid(None);
    renamed.set_dirty(true);
    if let Some(key) = local.display_key() {
        let key = format!(
            "Conflicted {} {} ({})",
            local.kind().label(),
            key,
            format_timestamp(ctx.now_ms, ctx.timestamp_format)
        );
        renamed.set_display_key(key);
    }
    renamed
}

fn format_timestamp(now_ms: Timestamp, format: &str) -> String {
    match DateTime::<Utc>::from_timestamp_millis(now_ms) {
        Some(time) => time.format(format).to_string(),
        None => now_ms.to_string(),
    }
}
