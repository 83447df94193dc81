//! Registry of reader groups for independent at-most-once teams.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::reader_group::ReaderGroup;
use crate::bus::{MqError, Result};

/// Reader groups of one topic, keyed by consumer group id.
#[derive(Default)]
pub(crate) struct IdGroup {
    groups: Mutex<HashMap<String, Arc<ReaderGroup>>>,
}

impl IdGroup {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn groups(&self) -> MutexGuard<'_, HashMap<String, Arc<ReaderGroup>>> {
        self.groups.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Existing group for `group_id`. Never creates one.
    pub(crate) fn open_reader_group(&self, group_id: &str) -> Result<Arc<ReaderGroup>> {
        self.groups()
            .get(group_id)
            .cloned()
            .ok_or_else(|| MqError::GroupNotFound(group_id.to_string()))
    }

    pub(crate) fn add_reader_group(&self, group_id: &str, group: Arc<ReaderGroup>) -> Result<()> {
        let mut groups = self.groups();
        if groups.contains_key(group_id) {
            return Err(MqError::GroupAlreadyExists(group_id.to_string()));
        }
        groups.insert(group_id.to_string(), group);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.groups().len()
    }
}
