//! Shared test utilities: proptest strategies and collaborator fakes.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use proptest::prelude::*;
use tokio::time::Instant;

use crate::store::{MemoryStore, Result as StoreResult, SnapshotStore, StoreCounts, StoreError};
use crate::transport::{DeliveryChannel, DeliveryError, Directory, MemberRecord, SourceError};
use crate::types::{
    Attribute, Attributes, ChangeRecord, Entity, EntityId, Group, GroupId, Membership,
};

// ─── Strategies ───────────────────────────────────────────────────────────────

/// Short values with occasional surrounding whitespace and mixed case.
pub fn arb_attr_value() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        "[a-zA-Z]{1,6}",
        " ?[a-zA-Z]{1,6} ?",
        "\\+[0-9]{3,8}",
    ]
}

pub fn arb_attributes() -> impl Strategy<Value = Attributes> {
    (
        prop::option::of(arb_attr_value()),
        prop::option::of(arb_attr_value()),
        prop::option::of(arb_attr_value()),
        prop::option::of(arb_attr_value()),
    )
        .prop_map(|(first, last, handle, phone)| Attributes {
            first,
            last,
            handle,
            phone,
        })
}

/// Two snapshots that carry exactly the same set of attributes.
pub fn arb_same_mask_pair() -> impl Strategy<Value = (Attributes, Attributes)> {
    (
        any::<[bool; 4]>(),
        prop::collection::vec(arb_attr_value(), 4),
        prop::collection::vec(arb_attr_value(), 4),
    )
        .prop_map(|(mask, left, right)| {
            let mut a = Attributes::default();
            let mut b = Attributes::default();
            for (i, attribute) in Attribute::ALL.into_iter().enumerate() {
                if mask[i] {
                    a.set(attribute, Some(left[i].clone()));
                    b.set(attribute, Some(right[i].clone()));
                }
            }
            (a, b)
        })
}

// ─── Fixtures ─────────────────────────────────────────────────────────────────

pub fn group(id: i64, name: &str) -> Group {
    Group {
        id: GroupId(id),
        name: name.to_string(),
        active: true,
        registered_at: Utc::now(),
    }
}

pub fn membership(entity: i64, group: i64) -> Membership {
    let now = Utc::now();
    Membership {
        entity_id: EntityId(entity),
        group_id: GroupId(group),
        active: true,
        added_at: now,
        last_seen_at: now,
    }
}

/// A store holding the given active groups.
pub async fn store_with_groups(groups: &[(i64, &str)]) -> MemoryStore {
    let store = MemoryStore::new();
    for (id, name) in groups {
        store.put_group(group(*id, name)).await.unwrap();
    }
    store
}

/// Polls `check` until it holds, advancing time in small steps.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// ─── Fakes ────────────────────────────────────────────────────────────────────

/// In-memory [`Directory`] with scripted failures and a call log.
#[derive(Debug, Default)]
pub struct FakeDirectory {
    entities: Mutex<HashMap<EntityId, Attributes>>,
    rosters: Mutex<HashMap<GroupId, Vec<MemberRecord>>>,
    titles: Mutex<HashMap<GroupId, String>>,
    fetch_errors: Mutex<HashMap<EntityId, VecDeque<SourceError>>>,
    list_errors: Mutex<HashMap<GroupId, VecDeque<SourceError>>>,
    fetch_log: Mutex<Vec<(EntityId, Instant)>>,
}

impl FakeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_entity(&self, id: i64, attributes: Attributes) {
        self.entities.lock().unwrap().insert(EntityId(id), attributes);
    }

    pub fn set_roster(&self, group: i64, members: Vec<(i64, Attributes)>) {
        let members = members
            .into_iter()
            .map(|(id, attributes)| MemberRecord {
                entity_id: EntityId(id),
                attributes,
            })
            .collect();
        self.rosters.lock().unwrap().insert(GroupId(group), members);
    }

    pub fn set_title(&self, group: i64, title: &str) {
        self.titles
            .lock()
            .unwrap()
            .insert(GroupId(group), title.to_string());
    }

    /// The next fetch of `id` fails with `error`.
    pub fn fail_next_fetch(&self, id: i64, error: SourceError) {
        self.fetch_errors
            .lock()
            .unwrap()
            .entry(EntityId(id))
            .or_default()
            .push_back(error);
    }

    /// The next roster listing of `group` fails with `error`.
    pub fn fail_next_list(&self, group: i64, error: SourceError) {
        self.list_errors
            .lock()
            .unwrap()
            .entry(GroupId(group))
            .or_default()
            .push_back(error);
    }

    /// Every `fetch_entity` call, in order, with the time it was made.
    pub fn fetch_log(&self) -> Vec<(EntityId, Instant)> {
        self.fetch_log.lock().unwrap().clone()
    }
}

impl Directory for FakeDirectory {
    async fn fetch_entity(&self, id: EntityId) -> Result<Attributes, SourceError> {
        self.fetch_log.lock().unwrap().push((id, Instant::now()));
        let scripted = self
            .fetch_errors
            .lock()
            .unwrap()
            .get_mut(&id)
            .and_then(VecDeque::pop_front);
        if let Some(error) = scripted {
            return Err(error);
        }
        self.entities
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("entity {}", id)))
    }

    async fn list_group_members(&self, group: GroupId) -> Result<Vec<MemberRecord>, SourceError> {
        let scripted = self
            .list_errors
            .lock()
            .unwrap()
            .get_mut(&group)
            .and_then(VecDeque::pop_front);
        if let Some(error) = scripted {
            return Err(error);
        }
        self.rosters
            .lock()
            .unwrap()
            .get(&group)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("group {}", group)))
    }

    async fn group_title(&self, group: GroupId) -> Result<String, SourceError> {
        self.titles
            .lock()
            .unwrap()
            .get(&group)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("group {}", group)))
    }
}

/// [`DeliveryChannel`] that records delivered texts.
#[derive(Debug, Default)]
pub struct RecordingChannel {
    delivered: Mutex<Vec<String>>,
    errors: Mutex<VecDeque<DeliveryError>>,
    attempts: Mutex<Vec<Instant>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next delivery attempt fails with `error`.
    pub fn fail_next(&self, error: DeliveryError) {
        self.errors.lock().unwrap().push_back(error);
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

impl DeliveryChannel for RecordingChannel {
    async fn deliver(&self, text: &str) -> Result<(), DeliveryError> {
        self.attempts.lock().unwrap().push(Instant::now());
        if let Some(error) = self.errors.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.delivered.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// A [`MemoryStore`] whose writes can be switched to fail.
#[derive(Debug, Default)]
pub struct FailingStore {
    inner: MemoryStore,
    failing: AtomicBool,
    failing_commits: AtomicUsize,
}

impl FailingStore {
    pub fn new(inner: MemoryStore) -> Self {
        FailingStore {
            inner,
            ..Self::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// The next `n` entity commits fail; other writes succeed.
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }

    fn check_commit(&self) -> StoreResult<()> {
        self.check()?;
        let scripted = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if scripted.is_ok() {
            return Err(StoreError::Unavailable("injected commit failure".to_string()));
        }
        Ok(())
    }
}

impl SnapshotStore for FailingStore {
    async fn entity(&self, id: EntityId) -> StoreResult<Option<Entity>> {
        self.inner.entity(id).await
    }

    async fn commit_entity(&self, entity: Entity, changes: Vec<ChangeRecord>) -> StoreResult<()> {
        self.check_commit()?;
        self.inner.commit_entity(entity, changes).await
    }

    async fn group(&self, id: GroupId) -> StoreResult<Option<Group>> {
        self.inner.group(id).await
    }

    async fn put_group(&self, group: Group) -> StoreResult<()> {
        self.check()?;
        self.inner.put_group(group).await
    }

    async fn groups(&self) -> StoreResult<Vec<Group>> {
        self.inner.groups().await
    }

    async fn membership(
        &self,
        entity_id: EntityId,
        group_id: GroupId,
    ) -> StoreResult<Option<Membership>> {
        self.inner.membership(entity_id, group_id).await
    }

    async fn put_membership(&self, membership: Membership) -> StoreResult<()> {
        self.check()?;
        self.inner.put_membership(membership).await
    }

    async fn memberships_of(&self, entity_id: EntityId) -> StoreResult<Vec<Membership>> {
        self.inner.memberships_of(entity_id).await
    }

    async fn changes_of(&self, entity_id: EntityId, limit: usize) -> StoreResult<Vec<ChangeRecord>> {
        self.inner.changes_of(entity_id, limit).await
    }

    async fn counts(&self) -> StoreResult<StoreCounts> {
        self.inner.counts().await
    }
}
