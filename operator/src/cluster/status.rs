//! Status ledger recording per component lifecycle transitions.
use std::collections::BTreeMap;

use crate::cluster::{ComponentState, ComponentStatus};

/// Component name of upgrade ledger entries.
pub const UPGRADER: &str = "Upgrader";

/// Ordered collection of component status entries keyed by (component, description).
///
/// Updating an entry whose key already exists replaces it in place, preserving
/// the original position, so an in-flight transition can be advanced without
/// appending duplicates. Iteration follows insertion order.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ComponentLedger {
    entries: Vec<ComponentStatus>,
    index: BTreeMap<(String, String), usize>,
}

impl ComponentLedger {
    /// Build a ledger from the entries of an observed status.
    ///
    /// Later duplicates of a key replace earlier ones in place.
    pub fn new(entries: Vec<ComponentStatus>) -> Self {
        let mut ledger = Self::default();
        for entry in entries {
            ledger.upsert(entry);
        }
        ledger
    }

    fn key(entry: &ComponentStatus) -> (String, String) {
        (entry.component.clone(), entry.description.clone())
    }

    /// Look up an entry by its key.
    pub fn get(&self, component: &str, description: &str) -> Option<&ComponentStatus> {
        self.index
            .get(&(component.to_owned(), description.to_owned()))
            .map(|position| &self.entries[*position])
    }

    /// Insert an entry, replacing any entry with the same key in place.
    pub fn upsert(&mut self, entry: ComponentStatus) {
        match self.index.get(&Self::key(&entry)) {
            Some(position) => self.entries[*position] = entry,
            None => {
                self.index.insert(Self::key(&entry), self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    /// Remove every entry of the given component.
    pub fn prune_component(&mut self, component: &str) {
        self.entries.retain(|entry| entry.component != component);
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(position, entry)| (Self::key(entry), position))
            .collect();
    }

    /// True when any entry of the component is in the given state.
    pub fn any_in_state(&self, component: &str, state: ComponentState) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.component == component && entry.status == state)
    }

    /// True when the component has at least one entry.
    pub fn has_component(&self, component: &str) -> bool {
        self.entries.iter().any(|entry| entry.component == component)
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &ComponentStatus> {
        self.entries.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the ledger holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flatten the ledger back into status entries.
    pub fn into_entries(self) -> Vec<ComponentStatus> {
        self.entries
    }
}
