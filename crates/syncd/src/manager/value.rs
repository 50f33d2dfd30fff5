//! Typed access to each collection's value.

use schema::{
    CachePatch, Collection, Contact, DataSnapshot, Groups, OnCallRow, Server, TeamLayout,
    ValidationError,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// The in-memory and on-disk value of one collection.
pub trait CollectionValue:
    Serialize + DeserializeOwned + Default + Clone + PartialEq + Send + Sync + 'static
{
    /// Which collection this value stores.
    const COLLECTION: Collection;

    /// Read the value out of a snapshot.
    fn from_snapshot(snapshot: &DataSnapshot) -> Self;

    /// Wrap the value as a cache patch.
    fn into_patch(self) -> CachePatch;

    /// The first invalid entry, if any.
    fn first_invalid(&self) -> Option<ValidationError>;
}

impl CollectionValue for Vec<Contact> {
    const COLLECTION: Collection = Collection::Contacts;

    fn from_snapshot(snapshot: &DataSnapshot) -> Self {
        snapshot.contacts.clone()
    }

    fn into_patch(self) -> CachePatch {
        CachePatch::Contacts(self)
    }

    fn first_invalid(&self) -> Option<ValidationError> {
        self.iter().find_map(|c| c.validate().err())
    }
}

impl CollectionValue for Vec<Server> {
    const COLLECTION: Collection = Collection::Servers;

    fn from_snapshot(snapshot: &DataSnapshot) -> Self {
        snapshot.servers.clone()
    }

    fn into_patch(self) -> CachePatch {
        CachePatch::Servers(self)
    }

    fn first_invalid(&self) -> Option<ValidationError> {
        self.iter().find_map(|s| s.validate().err())
    }
}

impl CollectionValue for Vec<OnCallRow> {
    const COLLECTION: Collection = Collection::OnCall;

    fn from_snapshot(snapshot: &DataSnapshot) -> Self {
        snapshot.on_call.clone()
    }

    fn into_patch(self) -> CachePatch {
        CachePatch::OnCall(self)
    }

    fn first_invalid(&self) -> Option<ValidationError> {
        self.iter().find_map(|r| r.validate().err())
    }
}

impl CollectionValue for Groups {
    const COLLECTION: Collection = Collection::Groups;

    fn from_snapshot(snapshot: &DataSnapshot) -> Self {
        snapshot.groups.clone()
    }

    fn into_patch(self) -> CachePatch {
        CachePatch::Groups(self)
    }

    fn first_invalid(&self) -> Option<ValidationError> {
        self.keys()
            .find_map(|name| schema::records::validate_name("group", name).err())
    }
}

impl CollectionValue for TeamLayout {
    const COLLECTION: Collection = Collection::TeamLayout;

    fn from_snapshot(snapshot: &DataSnapshot) -> Self {
        snapshot.team_layout.clone()
    }

    fn into_patch(self) -> CachePatch {
        CachePatch::TeamLayout(self)
    }

    fn first_invalid(&self) -> Option<ValidationError> {
        self.iter().find_map(|(team, pos)| pos.validate(team).err())
    }
}
