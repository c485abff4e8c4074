//! Tagged union over the synchronized entity types plus the small capability
//! interface the merge algorithm works against.

use crate::types::{
    Guid, LinkedNotebook, LocalId, Note, Notebook, Resource, SavedSearch, Tag, Usn,
};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Kind of a synchronized entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Tag,
    SavedSearch,
    LinkedNotebook,
    Notebook,
    Note,
    Resource,
}

impl EntityKind {
    /// Human-readable label, used in conflict renames and failure messages.
    pub fn label(self) -> &'static str {
        match self {
            EntityKind::Tag => "Tag",
            EntityKind::SavedSearch => "SavedSearch",
            EntityKind::LinkedNotebook => "LinkedNotebook",
            EntityKind::Notebook => "Notebook",
            EntityKind::Note => "Note",
            EntityKind::Resource => "Resource",
        }
    }

    /// Remote copies of these kinds always win over local edits; they are
    /// never conflict-renamed.
    pub fn remote_is_authoritative(self) -> bool {
        matches!(self, EntityKind::LinkedNotebook | EntityKind::Resource)
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What the shared resolution algorithm needs to know about any entity.
pub trait SyncEntity {
    fn kind(&self) -> EntityKind;
    fn local_id(&self) -> LocalId;
    fn set_local_id(&mut self, local_id: LocalId);
    fn guid(&self) -> Option<&Guid>;
    fn set_guid(&mut self, guid: Option<Guid>);
    fn usn(&self) -> Option<Usn>;
    /// `name` for most kinds, `title` for notes, none for resources.
    fn display_key(&self) -> Option<&str>;
    fn set_display_key(&mut self, key: String);
    fn is_dirty(&self) -> bool;
    fn set_dirty(&mut self, dirty: bool);
    fn is_local(&self) -> bool;
    fn set_local(&mut self, local: bool);

    fn has_guid(&self) -> bool {
        self.guid().is_some()
    }
}

macro_rules! impl_sync_entity {
    ($ty:ty, $kind:expr, $key:ident) => {
        impl SyncEntity for $ty {
            fn kind(&self) -> EntityKind {
                $kind
            }
            fn local_id(&self) -> LocalId {
                self.local_id
            }
            fn set_local_id(&mut self, local_id: LocalId) {
                self.local_id = local_id;
            }
            fn guid(&self) -> Option<&Guid> {
                self.guid.as_ref()
            }
            fn set_guid(&mut self, guid: Option<Guid>) {
                self.guid = guid;
            }
            fn usn(&self) -> Option<Usn> {
                self.usn
            }
            fn display_key(&self) -> Option<&str> {
                Some(&self.$key)
            }
            fn set_display_key(&mut self, key: String) {
                self.$key = key;
            }
            fn is_dirty(&self) -> bool {
                self.dirty
            }
            fn set_dirty(&mut self, dirty: bool) {
                self.dirty = dirty;
            }
            fn is_local(&self) -> bool {
                self.local
            }
            fn set_local(&mut self, local: bool) {
                self.local = local;
            }
        }
    };
}

impl_sync_entity!(Tag, EntityKind::Tag, name);
impl_sync_entity!(SavedSearch, EntityKind::SavedSearch, name);
impl_sync_entity!(Notebook, EntityKind::Notebook, name);
impl_sync_entity!(LinkedNotebook, EntityKind::LinkedNotebook, share_name);
impl_sync_entity!(Note, EntityKind::Note, title);

impl SyncEntity for Resource {
    fn kind(&self) -> EntityKind {
        EntityKind::Resource
    }
    fn local_id(&self) -> LocalId {
        self.local_id
    }
    fn set_local_id(&mut self, local_id: LocalId) {
        self.local_id = local_id;
    }
    fn guid(&self) -> Option<&Guid> {
        self.guid.as_ref()
    }
    fn set_guid(&mut self, guid: Option<Guid>) {
        self.guid = guid;
    }
    fn usn(&self) -> Option<Usn> {
        self.usn
    }
    fn display_key(&self) -> Option<&str> {
        None
    }
    fn set_display_key(&mut self, _key: String) {}
    fn is_dirty(&self) -> bool {
        self.dirty
    }
    fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }
    fn is_local(&self) -> bool {
        self.local
    }
    fn set_local(&mut self, local: bool) {
        self.local = local;
    }
}

/// Any synchronized entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Entity {
    Tag(Tag),
    SavedSearch(SavedSearch),
    LinkedNotebook(LinkedNotebook),
    Notebook(Notebook),
    Note(Note),
    Resource(Resource),
}

impl Entity {
    fn inner(&self) -> &dyn SyncEntity {
        match self {
            Entity::Tag(e) => e,
            Entity::SavedSearch(e) => e,
            Entity::LinkedNotebook(e) => e,
            Entity::Notebook(e) => e,
            Entity::Note(e) => e,
            Entity::Resource(e) => e,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn SyncEntity {
        match self {
            Entity::Tag(e) => e,
            Entity::SavedSearch(e) => e,
            Entity::LinkedNotebook(e) => e,
            Entity::Notebook(e) => e,
            Entity::Note(e) => e,
            Entity::Resource(e) => e,
        }
    }

    /// Lookup query carrying only a guid.
    pub fn with_guid(kind: EntityKind, guid: Guid) -> Self {
        let mut query = Self::empty(kind);
        query.set_guid(Some(guid));
        query
    }

    fn empty(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Tag => Entity::Tag(Tag::default()),
            EntityKind::SavedSearch => Entity::SavedSearch(SavedSearch::default()),
            EntityKind::LinkedNotebook => Entity::LinkedNotebook(LinkedNotebook::default()),
            EntityKind::Notebook => Entity::Notebook(Notebook::default()),
            EntityKind::Note => Entity::Note(Note::default()),
            EntityKind::Resource => Entity::Resource(Resource::default()),
        }
    }

    /// Short description for logs and failure messages, e.g. `Tag "Work" (guid ...)`.
    pub fn describe(&self) -> String {
        let mut text = self.kind().label().to_string();
        if let Some(key) = self.display_key() {
            text.push_str(&format!(" \"{}\"", key));
        }
        match self.guid() {
            Some(guid) => text.push_str(&format!(" (guid {})", guid)),
            None => text.push_str(&format!(" (local id {})", self.local_id())),
        }
        text
    }

    pub fn as_note(&self) -> Option<&Note> {
        match self {
            Entity::Note(note) => Some(note),
            _ => None,
        }
    }

    pub fn into_note(self) -> Option<Note> {
        match self {
            Entity::Note(note) => Some(note),
            _ => None,
        }
    }

    pub fn as_notebook(&self) -> Option<&Notebook> {
        match self {
            Entity::Notebook(notebook) => Some(notebook),
            _ => None,
        }
    }

    pub fn into_linked_notebook(self) -> Option<LinkedNotebook> {
        match self {
            Entity::LinkedNotebook(linked) => Some(linked),
            _ => None,
        }
    }

    /// Record which linked notebook an entity was downloaded from.
    pub fn set_linked_notebook_guid(&mut self, guid: &Guid) {
        match self {
            Entity::Tag(tag) => tag.linked_notebook_guid = Some(guid.clone()),
            Entity::Notebook(notebook) => notebook.linked_notebook_guid = Some(guid.clone()),
            _ => {}
        }
    }
}

impl SyncEntity for Entity {
    fn kind(&self) -> EntityKind {
        self.inner().kind()
    }
    fn local_id(&self) -> LocalId {
        self.inner().local_id()
    }
    fn set_local_id(&mut self, local_id: LocalId) {
        self.inner_mut().set_local_id(local_id);
    }
    fn guid(&self) -> Option<&Guid> {
        self.inner().guid()
    }
    fn set_guid(&mut self, guid: Option<Guid>) {
        self.inner_mut().set_guid(guid);
    }
    fn usn(&self) -> Option<Usn> {
        self.inner().usn()
    }
    fn display_key(&self) -> Option<&str> {
        self.inner().display_key()
    }
    fn set_display_key(&mut self, key: String) {
        self.inner_mut().set_display_key(key);
    }
    fn is_dirty(&self) -> bool {
        self.inner().is_dirty()
    }
    fn set_dirty(&mut self, dirty: bool) {
        self.inner_mut().set_dirty(dirty);
    }
    fn is_local(&self) -> bool {
        self.inner().is_local()
    }
    fn set_local(&mut self, local: bool) {
        self.inner_mut().set_local(local);
    }
}

impl From<Tag> for Entity {
    fn from(value: Tag) -> Self {
        Entity::Tag(value)
    }
}

impl From<SavedSearch> for Entity {
    fn from(value: SavedSearch) -> Self {
        Entity::SavedSearch(value)
    }
}

impl From<LinkedNotebook> for Entity {
    fn from(value: LinkedNotebook) -> Self {
        Entity::LinkedNotebook(value)
    }
}

impl From<Notebook> for Entity {
    fn from(value: Notebook) -> Self {
        Entity::Notebook(value)
    }
}

impl From<Note> for Entity {
    fn from(value: Note) -> Self {
        Entity::Note(value)
    }
}

impl From<Resource> for Entity {
    fn from(value: Resource) -> Self {
        Entity::Resource(value)
    }
}
