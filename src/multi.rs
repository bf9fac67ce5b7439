//! Group Registry
//!
//! Maps group identities to the groups an engine hosts. Lookups come from
//! caller threads and transport callbacks; only the engine thread adds or
//! removes entries.

use crate::engine::EngineError;
use crate::group::Group;
use crate::wake::{read, write};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: RwLock<HashMap<String, Arc<Group>>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `group` under its identity.
    pub fn add(&self, group: Arc<Group>) -> Result<(), EngineError> {
        let mut groups = write(&self.groups);
        if groups.contains_key(group.identity()) {
            return Err(EngineError::GroupExists(group.identity().to_string()));
        }
        groups.insert(group.identity().to_string(), group);
        Ok(())
    }

    pub fn get(&self, identity: &str) -> Option<Arc<Group>> {
        read(&self.groups).get(identity).cloned()
    }

    pub fn remove(&self, identity: &str) -> Option<Arc<Group>> {
        write(&self.groups).remove(identity)
    }

    pub fn contains(&self, identity: &str) -> bool {
        read(&self.groups).contains_key(identity)
    }

    /// Current groups, detached from the lock.
    pub fn snapshot(&self) -> Vec<Arc<Group>> {
        read(&self.groups).values().cloned().collect()
    }

    /// Identities of every hosted group, sorted.
    pub fn identities(&self) -> Vec<String> {
        let mut identities: Vec<String> = read(&self.groups).keys().cloned().collect();
        identities.sort();
        identities
    }

    /// Removes every group, for teardown.
    pub fn drain(&self) -> Vec<Arc<Group>> {
        write(&self.groups).drain().map(|(_, group)| group).collect()
    }

    pub fn len(&self) -> usize {
        read(&self.groups).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
