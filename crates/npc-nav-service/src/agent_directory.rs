//! NPC id to crowd slot mapping

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::error::{ServiceError, ServiceResult};

/// External NPC identifier
pub type NpcId = String;

/// Maps NPC ids to crowd slots
///
/// Inserting never overwrites: an id that is already registered is rejected
/// with [`ServiceError::DuplicateAgent`].
#[derive(Debug, Default, Clone)]
pub struct AgentDirectory {
    slots: HashMap<NpcId, usize>,
}

impl AgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: &str, slot: usize) -> ServiceResult<()> {
        match self.slots.entry(id.to_string()) {
            Entry::Occupied(entry) => Err(ServiceError::DuplicateAgent(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(slot);
                Ok(())
            }
        }
    }

    pub fn slot(&self, id: &str) -> ServiceResult<usize> {
        self.slots
            .get(id)
            .copied()
            .ok_or_else(|| ServiceError::UnknownAgent(id.to_string()))
    }

    pub fn remove(&mut self, id: &str) -> ServiceResult<usize> {
        self.slots
            .remove(id)
            .ok_or_else(|| ServiceError::UnknownAgent(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Registered ids in ascending order
    pub fn ids(&self) -> Vec<NpcId> {
        let mut ids: Vec<NpcId> = self.slots.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_is_no_clobber() {
        let mut directory = AgentDirectory::new();
        assert!(directory.insert("wolf", 0).is_ok());
        assert!(matches!(directory.insert("wolf", 1), Err(ServiceError::DuplicateAgent(id)) if id == "wolf"));
        assert_eq!(directory.slot("wolf").ok(), Some(0));
    }

    #[test]
    fn test_remove_forgets_id() {
        let mut directory = AgentDirectory::new();
        directory.insert("orc", 2).ok();
        directory.insert("bear", 5).ok();
        assert_eq!(directory.ids(), vec!["bear".to_string(), "orc".to_string()]);

        assert_eq!(directory.remove("orc").ok(), Some(2));
        assert!(matches!(directory.slot("orc"), Err(ServiceError::UnknownAgent(_))));
        assert!(matches!(directory.remove("orc"), Err(ServiceError::UnknownAgent(_))));
        assert_eq!(directory.len(), 1);
    }
}
