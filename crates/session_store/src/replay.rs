use std::collections::HashSet;

use crate::error::SessionStoreError;
use crate::schema::SessionEntry;
use crate::store::SessionStore;

impl SessionStore {
    /// Entries on the branch ending at `target_leaf` (default: the last
    /// appended entry), oldest first. The walk stops at the first parent that
    /// was never journaled.
    pub fn replay_leaf(
        &self,
        target_leaf: Option<&str>,
    ) -> Result<Vec<&SessionEntry>, SessionStoreError> {
        let Some(leaf_id) = target_leaf.or(self.current_leaf_id.as_deref()) else {
            return Ok(Vec::new());
        };

        let mut index = *self.index_by_id.get(leaf_id).ok_or_else(|| {
            SessionStoreError::UnknownLeafId {
                path: self.path.clone(),
                leaf_id: leaf_id.to_owned(),
            }
        })?;

        let mut visited = HashSet::new();
        let mut branch = Vec::new();
        loop {
            if !visited.insert(index) {
                return Err(SessionStoreError::ReplayCycle {
                    path: self.path.clone(),
                    leaf_id: leaf_id.to_owned(),
                });
            }
            let entry = &self.entries[index];
            branch.push(entry);

            match entry
                .parent_id
                .as_deref()
                .and_then(|parent| self.index_by_id.get(parent))
            {
                Some(parent_index) => index = *parent_index,
                None => break,
            }
        }

        branch.reverse();
        Ok(branch)
    }
}
