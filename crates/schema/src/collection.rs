//! Collection identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One logical group of records, persisted as one file in the data root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    /// Directory contacts (`contacts.json`).
    Contacts,
    /// Server inventory (`servers.json`).
    Servers,
    /// On-call rota rows (`oncall.json`).
    OnCall,
    /// Contact groups (`groups.json`).
    Groups,
    /// On-call board layout (`oncall_layout.json`).
    TeamLayout,
}

impl Collection {
    /// Every collection, in load order.
    pub const ALL: [Collection; 5] = [
        Collection::Contacts,
        Collection::Servers,
        Collection::OnCall,
        Collection::Groups,
        Collection::TeamLayout,
    ];

    /// File name of this collection inside the data root.
    pub fn file_name(&self) -> &'static str {
        match self {
            Collection::Contacts => "contacts.json",
            Collection::Servers => "servers.json",
            Collection::OnCall => "oncall.json",
            Collection::Groups => "groups.json",
            Collection::TeamLayout => "oncall_layout.json",
        }
    }

    /// Map a file name back to its collection.
    ///
    /// Matching is case-insensitive because some platforms report renamed
    /// files with their on-disk casing.
    pub fn from_file_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.file_name().eq_ignore_ascii_case(name))
    }

    /// Short identifier used in logs and error payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Contacts => "contacts",
            Collection::Servers => "servers",
            Collection::OnCall => "oncall",
            Collection::Groups => "groups",
            Collection::TeamLayout => "teamLayout",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
