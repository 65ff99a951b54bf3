use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const UNKNOWN_AFFILIATION: &str = "Unknown";

/// Abbreviated affiliation codes that are reported under their full name.
const AFFILIATION_ALIASES: &[(&str, &str)] = &[("RFSA", "Roscosmos")];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RosterEntry {
    pub name: String,
    pub affiliation: String,
}

impl RosterEntry {
    pub fn new(name: impl Into<String>, affiliation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            affiliation: affiliation.into(),
        }
    }
}

/// People currently present. Order is not significant; the roster is always
/// replaced wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Roster(Vec<RosterEntry>);

impl Roster {
    pub fn new(entries: Vec<RosterEntry>) -> Self {
        Self(entries)
    }

    pub fn entries(&self) -> &[RosterEntry] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn sorted(&self) -> Vec<&RosterEntry> {
        let mut entries: Vec<_> = self.0.iter().collect();
        entries.sort();
        entries
    }

    /// Order-independent comparison of the (name, affiliation) pairs.
    pub fn same_members(&self, other: &Roster) -> bool {
        self.0.len() == other.0.len() && self.sorted() == other.sorted()
    }
}

/// Maps a raw affiliation code to the label stored in the roster.
pub fn canonical_affiliation(code: Option<&str>) -> String {
    let code = match code.map(str::trim) {
        Some(value) if !value.is_empty() => value,
        _ => return UNKNOWN_AFFILIATION.to_string(),
    };
    AFFILIATION_ALIASES
        .iter()
        .find(|(alias, _)| *alias == code)
        .map(|(_, full)| (*full).to_string())
        .unwrap_or_else(|| code.to_string())
}

/// Accumulates members across several sources; the first occurrence of a
/// name wins.
#[derive(Debug, Default)]
pub struct RosterBuilder {
    seen: HashSet<String>,
    entries: Vec<RosterEntry>,
}

impl RosterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the member was skipped (blank or duplicate name).
    pub fn push(&mut self, name: &str, affiliation_code: Option<&str>) -> bool {
        let name = name.trim();
        if name.is_empty() || self.seen.contains(name) {
            return false;
        }
        self.seen.insert(name.to_string());
        self.entries
            .push(RosterEntry::new(name, canonical_affiliation(affiliation_code)));
        true
    }

    pub fn build(self) -> Roster {
        Roster(self.entries)
    }
}
