//! Cache snapshot and per-collection patches.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::collection::Collection;
use crate::records::{Contact, OnCallRow, Server, TeamPosition};

/// Group name to ordered member emails.
pub type Groups = BTreeMap<String, Vec<String>>;

/// Team name to board position.
pub type TeamLayout = BTreeMap<String, TeamPosition>;

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The value of every collection at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DataSnapshot {
    /// Directory contacts.
    pub contacts: Vec<Contact>,
    /// Server inventory.
    pub servers: Vec<Server>,
    /// On-call rota rows.
    pub on_call: Vec<OnCallRow>,
    /// Contact groups.
    pub groups: Groups,
    /// On-call board layout.
    pub team_layout: TeamLayout,
    /// When the snapshot last changed, in milliseconds since the Unix epoch.
    pub last_updated: u64,
}

impl DataSnapshot {
    /// Number of entries in `collection`.
    pub fn count(&self, collection: Collection) -> usize {
        match collection {
            Collection::Contacts => self.contacts.len(),
            Collection::Servers => self.servers.len(),
            Collection::OnCall => self.on_call.len(),
            Collection::Groups => self.groups.len(),
            Collection::TeamLayout => self.team_layout.len(),
        }
    }

    /// Capture the current value of `collection` as a patch.
    pub fn patch_for(&self, collection: Collection) -> CachePatch {
        match collection {
            Collection::Contacts => CachePatch::Contacts(self.contacts.clone()),
            Collection::Servers => CachePatch::Servers(self.servers.clone()),
            Collection::OnCall => CachePatch::OnCall(self.on_call.clone()),
            Collection::Groups => CachePatch::Groups(self.groups.clone()),
            Collection::TeamLayout => CachePatch::TeamLayout(self.team_layout.clone()),
        }
    }

    /// Team names in board order (first appearance in the rows).
    pub fn team_order(&self) -> Vec<String> {
        let mut teams: Vec<String> = Vec::new();
        for row in &self.on_call {
            if !teams.iter().any(|t| t == &row.team) {
                teams.push(row.team.clone());
            }
        }
        teams
    }
}

/// Full replacement value for exactly one collection.
///
/// Patches are how the snapshot changes outside of a full reload: a mutation
/// produces the new value of the collection it touched and nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "collection", content = "value", rename_all = "camelCase")]
pub enum CachePatch {
    /// New contacts list.
    Contacts(Vec<Contact>),
    /// New servers list.
    Servers(Vec<Server>),
    /// New on-call rows.
    OnCall(Vec<OnCallRow>),
    /// New groups map.
    Groups(Groups),
    /// New board layout.
    TeamLayout(TeamLayout),
}

impl CachePatch {
    /// The collection this patch replaces.
    pub fn collection(&self) -> Collection {
        match self {
            CachePatch::Contacts(_) => Collection::Contacts,
            CachePatch::Servers(_) => Collection::Servers,
            CachePatch::OnCall(_) => Collection::OnCall,
            CachePatch::Groups(_) => Collection::Groups,
            CachePatch::TeamLayout(_) => Collection::TeamLayout,
        }
    }

    /// Replace the touched collection in `snapshot`.
    ///
    /// Does not touch `last_updated`; the cache owner stamps it.
    pub fn apply_to(self, snapshot: &mut DataSnapshot) {
        match self {
            CachePatch::Contacts(v) => snapshot.contacts = v,
            CachePatch::Servers(v) => snapshot.servers = v,
            CachePatch::OnCall(v) => snapshot.on_call = v,
            CachePatch::Groups(v) => snapshot.groups = v,
            CachePatch::TeamLayout(v) => snapshot.team_layout = v,
        }
    }

    /// Number of entries carried by the patch.
    pub fn len(&self) -> usize {
        match self {
            CachePatch::Contacts(v) => v.len(),
            CachePatch::Servers(v) => v.len(),
            CachePatch::OnCall(v) => v.len(),
            CachePatch::Groups(v) => v.len(),
            CachePatch::TeamLayout(v) => v.len(),
        }
    }

    /// Whether the patch empties its collection.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
