use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use identity_watch::config::Config;
use identity_watch::diagnostics::Diagnostics;
use identity_watch::ingest::{self, INGEST_QUEUE_CAPACITY, Ingest};
use identity_watch::membership::{GroupRegistry, MembershipTracker};
use identity_watch::notify::{self, NOTIFY_QUEUE_CAPACITY, Notification, Notifier};
use identity_watch::reconcile::Reconciler;
use identity_watch::scan::{self, ScanHandle, ScanOrchestrator, ScanTarget};
use identity_watch::server::{AppState, ServerSettings, build_router};
use identity_watch::store::{FileStore, SnapshotStore};
use identity_watch::transport::HttpBridge;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "identity_watch=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("loading configuration")?;

    let store = Arc::new(
        FileStore::open(&config.state_dir, config.compact_every).with_context(|| {
            format!("opening state directory {}", config.state_dir.display())
        })?,
    );
    let bridge = Arc::new(
        HttpBridge::new(
            config.bridge_url.clone(),
            config.bridge_token.clone(),
            config.observer_id,
        )
        .context("building bridge client")?,
    );

    let diagnostics = Arc::new(Diagnostics::new());
    let tracker = Arc::new(MembershipTracker::new(
        Arc::new(Reconciler::new(store.clone())),
        config.deactivate_on_last_leave,
    ));
    let registry = Arc::new(GroupRegistry::new(store.clone()));
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received ctrl-c, shutting down");
            signal.cancel();
        }
    });

    let (notifier, notify_rx) = notify::queue(diagnostics.clone(), NOTIFY_QUEUE_CAPACITY);
    let (scans, scan_rx) = scan::queue();
    let (ingest_handle, ingest_rx) = ingest::queue(INGEST_QUEUE_CAPACITY);

    let orchestrator = Arc::new(ScanOrchestrator::new(
        tracker.clone(),
        registry.clone(),
        bridge.clone(),
        notifier.clone(),
        diagnostics.clone(),
        config.scan,
    ));
    let ingest = Ingest::new(
        tracker.clone(),
        bridge.clone(),
        notifier.clone(),
        diagnostics.clone(),
    );
    let tasks: Vec<JoinHandle<()>> = vec![
        tokio::spawn(
            Notifier::new(bridge.clone(), diagnostics.clone()).run(notify_rx, shutdown.clone()),
        ),
        tokio::spawn(orchestrator.run(scan_rx, shutdown.clone())),
        tokio::spawn(ingest.run(ingest_rx, shutdown.clone())),
    ];

    registry
        .register_configured(&config.monitored_groups, bridge.as_ref(), &shutdown)
        .await;
    start_initial_scan(&scans).await;

    let counts = store.counts().await.context("reading store counts")?;
    info!(
        tracked_entities = counts.tracked_entities,
        monitored_groups = counts.monitored_groups,
        generation = store.generation().await,
        "Started"
    );
    notifier.notify(Notification::Started {
        tracked_entities: counts.tracked_entities,
        monitored_groups: counts.monitored_groups,
    });

    let app = build_router(AppState::new(
        tracker,
        registry,
        ingest_handle,
        scans,
        diagnostics,
        ServerSettings::from(&config),
    ));

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    info!("listening on {}", config.bind);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await
        .context("serving HTTP")?;

    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    info!("Stopped");
    Ok(())
}

/// Scans every monitored group once at startup, so the baseline is current
/// before the first periodic tick.
async fn start_initial_scan(scans: &ScanHandle) {
    if let Err(e) = scans.schedule(ScanTarget::All).await {
        warn!(error = %e, "Failed to queue the initial scan");
    }
}
