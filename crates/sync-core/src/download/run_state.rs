//! Working state of one download run. Built fresh by `start` and dropped on
//! finish, failure, stop or `clear`.

use super::resolve::Resolution;
use super::SyncCheckpoint;
use crate::action::{RemoteResponse, TimerId};
use crate::entity::{Entity, EntityKind, SyncEntity};
use crate::storage::StorageResponse;
use crate::types::{Guid, LinkedNotebook, LocalId, RequestId, SyncChunk, SyncMode, Timestamp, Usn};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Change feed being paged: the user's account or one shared notebook.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum Scope {
    Account,
    Linked(Guid),
}

/// Paging position within one scope.
#[derive(Debug, Clone, Default)]
pub(crate) struct Cursor {
    pub after_usn: Usn,
    /// Highest account head seen in any page.
    pub update_count: Usn,
    /// Latest server time seen in any page.
    pub sync_time: Timestamp,
    pub pages: usize,
    pub in_flight: bool,
    pub retry_timer: Option<TimerId>,
    pub done: bool,
}

impl Cursor {
    pub fn new(after_usn: Usn) -> Self {
        Self {
            after_usn,
            update_count: after_usn,
            ..Default::default()
        }
    }

    /// Needs a page request to make progress.
    pub fn is_idle(&self) -> bool {
        !self.done && !self.in_flight && self.retry_timer.is_none()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct LinkedScope {
    pub notebook: LinkedNotebook,
    pub cursor: Cursor,
}

/// Remote entities collected from downloaded pages, waiting to be merged.
///
/// Keyed by (kind, guid) so an entity seen in several pages is merged once,
/// at its highest usn.
#[derive(Debug, Default)]
pub(crate) struct Accumulator {
    entities: HashMap<(EntityKind, Guid), Entity>,
    expunged: Vec<(EntityKind, Guid)>,
}

impl Accumulator {
    /// Take in a validated page. Tags and notebooks from a shared notebook are
    /// stamped with its guid.
    pub fn absorb(&mut self, chunk: SyncChunk, linked: Option<&Guid>) {
        let SyncChunk {
            notes,
            notebooks,
            tags,
            searches,
            resources,
            linked_notebooks,
            expunged_notes,
            expunged_notebooks,
            expunged_tags,
            expunged_searches,
            expunged_linked_notebooks,
            ..
        } = chunk;

        let entities = tags
            .into_iter()
            .map(Entity::from)
            .chain(searches.into_iter().map(Entity::from))
            .chain(linked_notebooks.into_iter().map(Entity::from))
            .chain(notebooks.into_iter().map(Entity::from))
            .chain(notes.into_iter().map(Entity::from))
            .chain(resources.into_iter().map(Entity::from));

        for mut entity in entities {
            if let Some(linked_guid) = linked {
                entity.set_linked_notebook_guid(linked_guid);
            }
            self.insert(entity);
        }

        let expunged = [
            (EntityKind::Note, expunged_notes),
            (EntityKind::Notebook, expunged_notebooks),
            (EntityKind::Tag, expunged_tags),
            (EntityKind::SavedSearch, expunged_searches),
            (EntityKind::LinkedNotebook, expunged_linked_notebooks),
        ];
        for (kind, guids) in expunged {
            for guid in guids {
                self.entities.remove(&(kind, guid.clone()));
                if !self.expunged.contains(&(kind, guid.clone())) {
                    self.expunged.push((kind, guid));
                }
            }
        }
    }

    fn insert(&mut self, entity: Entity) {
        let Some(guid) = entity.guid().cloned() else {
            return;
        };
        let key = (entity.kind(), guid);
        let newer = self
            .entities
            .get(&key)
            .is_none_or(|existing| entity.usn() > existing.usn());
        if newer {
            self.entities.insert(key, entity);
        }
    }

    /// Remove and return every entity of `kinds`, in `kinds` order then usn order.
    pub fn take(&mut self, kinds: &[EntityKind]) -> Vec<Entity> {
        let mut taken = Vec::new();
        for kind in kinds {
            let mut of_kind: Vec<Entity> = Vec::new();
            self.entities.retain(|(k, _), entity| {
                if k == kind {
                    of_kind.push(entity.clone());
                    false
                } else {
                    true
                }
            });
            of_kind.sort_by_key(|e| e.usn());
            taken.extend(of_kind);
        }
        taken
    }

    pub fn take_expunged(&mut self) -> Vec<(EntityKind, Guid)> {
        std::mem::take(&mut self.expunged)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }
}

/// Sub-steps of a merge phase, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MergeStep {
    /// Tags, saved searches, linked notebooks and notebooks.
    Containers,
    Notes,
    Resources,
    Expunge,
}

impl MergeStep {
    pub fn kinds(self) -> &'static [EntityKind] {
        match self {
            MergeStep::Containers => &[
                EntityKind::Tag,
                EntityKind::SavedSearch,
                EntityKind::LinkedNotebook,
                EntityKind::Notebook,
            ],
            MergeStep::Notes => &[EntityKind::Note],
            MergeStep::Resources => &[EntityKind::Resource],
            MergeStep::Expunge => &[],
        }
    }

    pub fn next(self) -> Option<MergeStep> {
        match self {
            MergeStep::Containers => Some(MergeStep::Notes),
            MergeStep::Notes => Some(MergeStep::Resources),
            MergeStep::Resources => Some(MergeStep::Expunge),
            MergeStep::Expunge => None,
        }
    }
}

/// Resolved note or resource waiting on its parent lookup or body fetch.
#[derive(Debug, Clone)]
pub(crate) struct MergeJob {
    pub guid: Guid,
    pub resolution: Resolution,
}

/// What to do when a storage response arrives.
#[derive(Debug, Clone)]
pub(crate) enum StorageStep {
    FindByGuid(Entity),
    FindByName(Entity),
    /// Lookup of a note's notebook or a resource's note.
    Parent(MergeJob),
    /// Add or update produced by a merge.
    Write { description: String },
    /// Update of a conflict-renamed local copy; the remote revision is added after it.
    ConflictRename { then_add: Entity },
    Expunge { kind: EntityKind, guid: Guid },
    ListLinkedNotebooks,
}

#[derive(Debug, Clone)]
pub(crate) enum RemoteStep {
    Chunk(Scope),
    FullNote(MergeJob),
}

#[derive(Debug, Clone)]
pub(crate) enum TimerPurpose {
    RetryChunk(Scope),
    RefetchNote(MergeJob),
}

/// Reply or timer expiry that arrived while paused.
#[derive(Debug, Clone)]
pub(crate) enum Input {
    Storage(StorageResponse),
    Remote(RemoteResponse),
    Timer(TimerId),
}

#[derive(Debug)]
pub(crate) struct RunState {
    pub checkpoint: SyncCheckpoint,
    pub mode: SyncMode,
    pub account: Cursor,
    pub linked: BTreeMap<Guid, LinkedScope>,
    pub accumulated: Accumulator,
    pub step: Option<MergeStep>,
    /// Merging shared notebook content rather than the account's.
    pub linked_phase: bool,
    pub pending_storage: HashMap<RequestId, StorageStep>,
    pub pending_remote: HashMap<RequestId, RemoteStep>,
    pub timers: HashMap<TimerId, TimerPurpose>,
    /// Full-note fetches not dispatched because the run was paused.
    pub awaiting_fetch: Vec<MergeJob>,
    /// Note guid to the local id of the notebook it was filed under.
    pub note_notebooks: HashMap<Guid, LocalId>,
    /// Local entities already matched by name to a remote entity this run.
    pub claimed_by_name: HashSet<LocalId>,
    pub awaiting_linked_tokens: bool,
    pub queued: VecDeque<Input>,
}

impl RunState {
    pub fn new(checkpoint: SyncCheckpoint) -> Self {
        Self {
            mode: SyncMode::for_after_usn(checkpoint.after_usn),
            account: Cursor::new(checkpoint.after_usn),
            checkpoint,
            linked: BTreeMap::new(),
            accumulated: Accumulator::default(),
            step: None,
            linked_phase: false,
            pending_storage: HashMap::new(),
            pending_remote: HashMap::new(),
            timers: HashMap::new(),
            awaiting_fetch: Vec::new(),
            note_notebooks: HashMap::new(),
            claimed_by_name: HashSet::new(),
            awaiting_linked_tokens: false,
            queued: VecDeque::new(),
        }
    }

    pub fn cursor_mut(&mut self, scope: &Scope) -> Option<&mut Cursor> {
        match scope {
            Scope::Account => Some(&mut self.account),
            Scope::Linked(guid) => self.linked.get_mut(guid).map(|s| &mut s.cursor),
        }
    }

    /// Requests whose replies have not been processed yet.
    pub fn outstanding(&self) -> usize {
        self.pending_storage.len() + self.pending_remote.len()
    }

    /// Nothing of the current merge step is still in progress.
    pub fn step_drained(&self) -> bool {
        self.outstanding() == 0 && self.timers.is_empty() && self.awaiting_fetch.is_empty()
    }
}
