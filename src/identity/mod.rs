//! Mapping from raw creator ids to display identities.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Serialize;

/// Reserved id and display name for creators missing from the directory.
pub const UNKNOWN: &str = "Unknown";

/// A known actor, or the `Unknown` sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    /// The sentinel every unmapped creator resolves to.
    pub fn unknown() -> Self {
        Self::new(UNKNOWN, UNKNOWN)
    }

    pub fn is_unknown(&self) -> bool {
        self.id == UNKNOWN
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name)
    }
}

/// Static creator-id to display-name table.
#[derive(Debug, Clone, Default)]
pub struct IdentityDirectory {
    by_id: HashMap<String, String>,
}

impl IdentityDirectory {
    pub fn new(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            by_id: entries.into_iter().collect(),
        }
    }

    /// Resolves a raw creator id. Absent or unmapped ids yield
    /// [`Identity::unknown`].
    pub fn resolve(&self, raw_id: Option<&str>) -> Identity {
        raw_id
            .and_then(|id| self.by_id.get_key_value(id))
            .map(|(id, name)| Identity::new(id.clone(), name.clone()))
            .unwrap_or_else(Identity::unknown)
    }

    /// Case-insensitive exact display-name lookup.
    pub fn find_by_name(&self, name: &str) -> Option<Identity> {
        let wanted = name.trim().to_lowercase();
        self.by_id
            .iter()
            .find(|(_, display)| display.to_lowercase() == wanted)
            .map(|(id, display)| Identity::new(id.clone(), display.clone()))
    }

    /// Display names containing `query` (case-insensitive), sorted. An empty
    /// query suggests nothing.
    pub fn suggest(&self, query: &str) -> Vec<String> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return Vec::new();
        }
        let mut names: Vec<String> = self
            .by_id
            .values()
            .filter(|name| name.to_lowercase().contains(&query))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// All known identities ordered by id.
    pub fn identities(&self) -> Vec<Identity> {
        let sorted: BTreeMap<&String, &String> = self.by_id.iter().collect();
        sorted
            .into_iter()
            .map(|(id, name)| Identity::new(id.clone(), name.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
