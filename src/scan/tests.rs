use super::*;
use crate::diagnostics::LastScan;
use crate::notify;
use crate::reconcile::Reconciler;
use crate::store::MemoryStore;
use crate::test_utils::{FakeDirectory, eventually, store_with_groups};
use crate::types::{Attributes, EntityId};
use tokio::time::Instant;

struct Harness {
    store: Arc<MemoryStore>,
    directory: Arc<FakeDirectory>,
    diagnostics: Arc<Diagnostics>,
    orchestrator: Arc<ScanOrchestrator<MemoryStore, FakeDirectory>>,
    notifications: mpsc::Receiver<Notification>,
}

async fn harness(groups: &[(i64, &str)], member_interval: Duration) -> Harness {
    let store = Arc::new(store_with_groups(groups).await);
    let directory = Arc::new(FakeDirectory::new());
    let diagnostics = Arc::new(Diagnostics::new());
    let (notifier, notifications) = notify::queue(diagnostics.clone(), 64);
    let tracker = Arc::new(MembershipTracker::new(
        Arc::new(Reconciler::new(store.clone())),
        true,
    ));
    let orchestrator = Arc::new(ScanOrchestrator::new(
        tracker,
        Arc::new(GroupRegistry::new(store.clone())),
        directory.clone(),
        notifier,
        diagnostics.clone(),
        ScanConfig {
            interval: Duration::from_secs(60),
            member_interval,
        },
    ));
    Harness {
        store,
        directory,
        diagnostics,
        orchestrator,
        notifications,
    }
}

impl Harness {
    async fn group(&self, id: i64) -> Group {
        self.store.group(GroupId(id)).await.unwrap().unwrap()
    }

    async fn scan(&self, id: i64) -> ScanReport {
        let group = self.group(id).await;
        self.orchestrator
            .scan_group(&group, Channel::Scan, &CancellationToken::new())
            .await
    }

    fn last_scan(&self, id: i64) -> Option<LastScan> {
        self.diagnostics
            .snapshot()
            .last_scans
            .into_iter()
            .find(|s| s.group_id == GroupId(id))
    }
}

fn named(first: &str) -> Attributes {
    Attributes::named(first)
}

// ─── Single Group ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn first_scan_registers_members_silently() {
    let mut h = harness(&[(7, "Seven")], Duration::ZERO).await;
    h.directory
        .set_roster(7, vec![(1, named("Ann")), (2, named("Bob"))]);

    let report = h.scan(7).await;

    assert_eq!(report.members, 2);
    assert_eq!(report.registered, 2);
    assert!(h.notifications.try_recv().is_err());
    assert!(h.store.entity(EntityId(2)).await.unwrap().is_some());
}

#[tokio::test]
async fn rescan_reports_a_rename_exactly_once() {
    let mut h = harness(&[(7, "Seven")], Duration::ZERO).await;
    h.directory
        .set_roster(7, vec![(1, named("Ann")), (2, named("Bob"))]);
    h.scan(7).await;

    h.directory
        .set_roster(7, vec![(1, named("Anna")), (2, named("Bob"))]);
    let report = h.scan(7).await;

    assert_eq!(report.changed, 1);
    assert_eq!(report.unchanged, 1);
    let Ok(Notification::Changed { entity, groups, .. }) = h.notifications.try_recv() else {
        panic!("expected a change notification");
    };
    assert_eq!(entity.id, EntityId(1));
    assert_eq!(groups[0].id, GroupId(7));

    let again = h.scan(7).await;
    assert_eq!(again.unchanged, 2);
    assert!(h.notifications.try_recv().is_err());
}

#[tokio::test]
async fn incomplete_records_are_fetched_and_vanished_members_skipped() {
    let h = harness(&[(7, "Seven")], Duration::ZERO).await;
    h.directory.set_roster(
        7,
        vec![(1, Attributes::default()), (2, Attributes::default())],
    );
    h.directory.set_entity(1, named("Ann").with_handle("ann"));

    let report = h.scan(7).await;

    assert_eq!(report.registered, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.errors, 0);
    let stored = h.store.entity(EntityId(1)).await.unwrap().unwrap();
    assert_eq!(stored.attributes.handle.as_deref(), Some("ann"));
}

#[tokio::test]
async fn fetch_failures_are_counted_and_scan_continues() {
    let h = harness(&[(7, "Seven")], Duration::ZERO).await;
    h.directory.set_roster(
        7,
        vec![(1, Attributes::default()), (2, named("Bob"))],
    );
    h.directory
        .fail_next_fetch(1, SourceError::Failed("boom".into()));

    let report = h.scan(7).await;

    assert_eq!(report.errors, 1);
    assert_eq!(report.registered, 1);
    assert!(
        h.diagnostics
            .snapshot()
            .last_errors
            .contains_key(&Component::Scan)
    );
}

#[tokio::test(start_paused = true)]
async fn rate_limit_suspends_for_the_signaled_wait_then_resumes() {
    let h = harness(&[(7, "Seven")], Duration::from_millis(100)).await;
    h.directory.set_roster(
        7,
        vec![
            (1, Attributes::default()),
            (2, Attributes::default()),
            (3, Attributes::default()),
        ],
    );
    for id in 1..=3 {
        h.directory.set_entity(id, named(&format!("E{}", id)));
    }
    let wait = Duration::from_secs(5);
    h.directory
        .fail_next_fetch(2, SourceError::RateLimited { wait });

    let report = h.scan(7).await;

    assert_eq!(report.registered, 3);
    let log = h.directory.fetch_log();
    let ids: Vec<i64> = log.iter().map(|(id, _)| id.0).collect();
    assert_eq!(ids, vec![1, 2, 2, 3]);
    let limited_at = log[1].1;
    assert_eq!(log[2].1 - limited_at, wait);
    assert!(log[3].1 - limited_at >= wait);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_listing_is_retried() {
    let h = harness(&[(7, "Seven")], Duration::ZERO).await;
    h.directory.set_roster(7, vec![(1, named("Ann"))]);
    h.directory.fail_next_list(
        7,
        SourceError::RateLimited {
            wait: Duration::from_secs(2),
        },
    );
    let start = Instant::now();

    let report = h.scan(7).await;

    assert_eq!(report.registered, 1);
    assert_eq!(start.elapsed(), Duration::from_secs(2));
}

#[tokio::test]
async fn deactivated_group_stops_the_scan() {
    let h = harness(&[(7, "Seven")], Duration::ZERO).await;
    h.directory.set_roster(7, vec![(1, named("Ann"))]);
    let group = h.group(7).await;
    GroupRegistry::new(h.store.clone())
        .deactivate_group(GroupId(7))
        .await
        .unwrap();

    let report = h
        .orchestrator
        .scan_group(&group, Channel::Manual, &CancellationToken::new())
        .await;

    assert_eq!(report.registered, 0);
    assert!(h.store.entity(EntityId(1)).await.unwrap().is_none());
}

#[tokio::test]
async fn claim_tracks_scanning_state() {
    let h = harness(&[(7, "Seven")], Duration::ZERO).await;
    assert_eq!(h.orchestrator.state(GroupId(7)), ScanState::Idle);

    let slot = h.orchestrator.claim(GroupId(7)).unwrap();
    assert_eq!(h.orchestrator.state(GroupId(7)), ScanState::Scanning);
    assert!(h.orchestrator.claim(GroupId(7)).is_none());

    drop(slot);
    assert_eq!(h.orchestrator.state(GroupId(7)), ScanState::Idle);
}

// ─── Orchestration ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn rate_limit_in_one_group_does_not_delay_another() {
    let h = harness(&[(1, "Slow"), (2, "Fast")], Duration::from_millis(10)).await;
    h.directory.set_roster(
        1,
        vec![(10, Attributes::default()), (11, named("Eleven"))],
    );
    h.directory.set_entity(10, named("Ten"));
    h.directory.fail_next_fetch(
        10,
        SourceError::RateLimited {
            wait: Duration::from_secs(30),
        },
    );
    h.directory
        .set_roster(2, vec![(20, named("Twenty")), (21, named("TwentyOne"))]);

    let (handle, rx) = queue();
    let shutdown = CancellationToken::new();
    tokio::spawn(h.orchestrator.clone().run(rx, shutdown.clone()));
    let start = Instant::now();
    handle.trigger(ScanTarget::All).await.unwrap();

    eventually(|| h.last_scan(2).is_some()).await;
    assert!(start.elapsed() < Duration::from_secs(30));
    assert_eq!(h.last_scan(2).unwrap().report.registered, 2);
    assert_eq!(h.orchestrator.state(GroupId(1)), ScanState::Scanning);
    assert!(h.last_scan(1).is_none());

    tokio::time::sleep(Duration::from_secs(30)).await;
    eventually(|| h.last_scan(1).is_some()).await;
    assert_eq!(h.last_scan(1).unwrap().report.registered, 2);
    shutdown.cancel();
}

#[tokio::test]
async fn listing_failure_is_isolated_to_its_group() {
    let h = harness(&[(1, "Broken"), (2, "Fine")], Duration::ZERO).await;
    h.directory.set_roster(1, vec![(10, named("Ten"))]);
    h.directory
        .fail_next_list(1, SourceError::Failed("gone".into()));
    h.directory.set_roster(2, vec![(20, named("Twenty"))]);

    let (handle, rx) = queue();
    let shutdown = CancellationToken::new();
    tokio::spawn(h.orchestrator.clone().run(rx, shutdown.clone()));
    handle.trigger(ScanTarget::All).await.unwrap();

    eventually(|| h.last_scan(1).is_some() && h.last_scan(2).is_some()).await;
    assert_eq!(h.last_scan(1).unwrap().report.errors, 1);
    assert_eq!(h.last_scan(2).unwrap().report.registered, 1);
    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn periodic_timer_scans_every_group() {
    let h = harness(&[(1, "One")], Duration::ZERO).await;
    h.directory.set_roster(1, vec![(10, named("Ten"))]);

    let (_handle, rx) = queue();
    let shutdown = CancellationToken::new();
    tokio::spawn(h.orchestrator.clone().run(rx, shutdown.clone()));

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert!(h.last_scan(1).is_none());

    tokio::time::sleep(Duration::from_secs(2)).await;
    eventually(|| h.last_scan(1).is_some()).await;
    shutdown.cancel();
}

#[tokio::test]
async fn targeted_scan_covers_only_that_group() {
    let h = harness(&[(1, "One"), (2, "Two")], Duration::ZERO).await;
    h.directory.set_roster(1, vec![(10, named("Ten"))]);
    h.directory.set_roster(2, vec![(20, named("Twenty"))]);

    let (handle, rx) = queue();
    let shutdown = CancellationToken::new();
    tokio::spawn(h.orchestrator.clone().run(rx, shutdown.clone()));
    handle.trigger(ScanTarget::Group(GroupId(2))).await.unwrap();

    eventually(|| h.last_scan(2).is_some()).await;
    assert!(h.last_scan(1).is_none());
    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_a_rate_limit_wait() {
    let h = harness(&[(7, "Seven")], Duration::ZERO).await;
    h.directory.fail_next_list(
        7,
        SourceError::RateLimited {
            wait: Duration::from_secs(3600),
        },
    );
    let group = h.group(7).await;
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });
    let start = Instant::now();

    let report = h
        .orchestrator
        .scan_group(&group, Channel::Scan, &shutdown)
        .await;

    assert_eq!(report, ScanReport::default());
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn scheduled_scans_are_tagged_as_scans_and_triggers_as_manual() {
    let (handle, mut rx) = queue();

    handle.schedule(ScanTarget::All).await.unwrap();
    handle.trigger(ScanTarget::Group(GroupId(7))).await.unwrap();

    let scheduled = rx.recv().await.unwrap();
    assert_eq!(scheduled.target(), ScanTarget::All);
    assert_eq!(scheduled.channel(), Channel::Scan);
    let triggered = rx.recv().await.unwrap();
    assert_eq!(triggered.channel(), Channel::Manual);
}
