//! Group registry: the Group table is the only list of monitored groups.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::retry::{RetryPolicy, retry_rate_limited};
use crate::store::{SnapshotStore, StoreError};
use crate::transport::Directory;
use crate::types::{Group, GroupId};

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("group name must not be empty")]
    EmptyName,

    #[error("group {0} is not registered")]
    NotFound(GroupId),

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

/// Result of [`GroupRegistry::register_group`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub group: Group,
    /// The group was not previously active.
    pub newly_active: bool,
}

#[derive(Debug)]
pub struct GroupRegistry<S> {
    store: Arc<S>,
}

impl<S: SnapshotStore> GroupRegistry<S> {
    pub fn new(store: Arc<S>) -> Self {
        GroupRegistry { store }
    }

    /// Registers a group, or renames and reactivates an existing one.
    ///
    /// The name is trimmed and must not be empty.
    #[instrument(skip(self, name))]
    pub async fn register_group(
        &self,
        group_id: GroupId,
        name: &str,
    ) -> Result<Registration, RegisterError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RegisterError::EmptyName);
        }

        let existing = self.store.group(group_id).await?;
        let newly_active = existing.as_ref().is_none_or(|g| !g.active);
        let group = match existing {
            Some(g) => Group {
                name: name.to_string(),
                active: true,
                ..g
            },
            None => Group {
                id: group_id,
                name: name.to_string(),
                active: true,
                registered_at: Utc::now(),
            },
        };
        self.store.put_group(group.clone()).await?;

        info!(name = %group.name, newly_active, "Registered group");
        Ok(Registration {
            group,
            newly_active,
        })
    }

    /// Stops monitoring a group. The row and its name are kept.
    ///
    /// Returns `false` if the group was already inactive.
    #[instrument(skip(self))]
    pub async fn deactivate_group(&self, group_id: GroupId) -> Result<bool, RegisterError> {
        let group = self
            .store
            .group(group_id)
            .await?
            .ok_or(RegisterError::NotFound(group_id))?;
        if !group.active {
            return Ok(false);
        }

        self.store
            .put_group(Group {
                active: false,
                ..group
            })
            .await?;
        info!("Deactivated group");
        Ok(true)
    }

    /// Registers each configured group under its remote title, falling back
    /// to `Group <id>` when the title cannot be fetched. A group that fails to
    /// register is logged and skipped.
    pub async fn register_configured<D: Directory>(
        &self,
        group_ids: &[GroupId],
        directory: &D,
        shutdown: &CancellationToken,
    ) -> Vec<Registration> {
        let mut registrations = Vec::with_capacity(group_ids.len());
        for &group_id in group_ids {
            let title = retry_rate_limited(RetryPolicy::ONCE, shutdown, "group_title", || {
                directory.group_title(group_id)
            })
            .await
            .into_result()
            .and_then(Result::ok)
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| format!("Group {}", group_id));

            match self.register_group(group_id, &title).await {
                Ok(registration) => registrations.push(registration),
                Err(e) => warn!(group = %group_id, error = %e, "Failed to register configured group"),
            }
        }
        registrations
    }

    /// Active groups, ordered by id.
    pub async fn monitored_groups(&self) -> Result<Vec<Group>, StoreError> {
        Ok(self
            .store
            .groups()
            .await?
            .into_iter()
            .filter(|g| g.active)
            .collect())
    }
}
