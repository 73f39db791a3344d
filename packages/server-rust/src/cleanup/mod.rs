//! Cleanup service (T2): periodic archive-then-delete of idle instances.
//!
//! Each cycle lists every registered instance and applies the eligibility
//! predicate: not permanent, status `active`, older than the minimum age,
//! and idle past the inactivity timeout. Eligible instances are archived
//! (when enabled), deleted through the lifecycle manager, and announced on
//! the notifier -- in that order, with the notification strictly
//! best-effort.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use warren_core::InstanceRecord;

use crate::archive::{archive_metadata, archive_path, ArchiveObject, ArchiveSink, ARCHIVE_CONTENT_TYPE};
use crate::lifecycle::LifecycleManager;
use crate::registry::{InstanceFilter, InstanceRegistry};
use crate::store::InstanceStore;

/// Cleanup tuning. Durations mirror the service configuration.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Time between cycles.
    pub interval: Duration,
    /// Minimum instance age before deletion is allowed.
    pub minimum_age: ChronoDuration,
    /// Minimum inactivity before deletion is allowed.
    pub inactivity_timeout: ChronoDuration,
    /// Whether to archive before deleting.
    pub archive_enabled: bool,
    /// Log intent only; never archive or delete.
    pub dry_run: bool,
    /// Expired durable rows removed per cycle.
    pub expired_batch: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            minimum_age: ChronoDuration::minutes(30),
            inactivity_timeout: ChronoDuration::minutes(30),
            archive_enabled: false,
            dry_run: false,
            expired_batch: 1000,
        }
    }
}

/// What gets announced after an instance is cleaned up.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupNotice {
    pub instance_id: String,
    pub cleanup_time: DateTime<Utc>,
    pub reason: String,
    pub archived: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<String>,
}

/// Best-effort notification channel for cleanup events.
///
/// The production bus is an external collaborator; in-process variants
/// cover logging and tests.
#[async_trait]
pub trait CleanupNotifier: Send + Sync {
    /// Publishes one notice. Failures are logged by the caller and never
    /// roll back the deletion.
    async fn publish(&self, notice: &CleanupNotice) -> anyhow::Result<()>;
}

/// Notifier that writes notices to the log.
pub struct LogNotifier;

#[async_trait]
impl CleanupNotifier for LogNotifier {
    async fn publish(&self, notice: &CleanupNotice) -> anyhow::Result<()> {
        info!(
            instance_id = %notice.instance_id,
            archived = notice.archived,
            archive_path = notice.archive_path.as_deref().unwrap_or(""),
            reason = %notice.reason,
            "instance cleaned up",
        );
        Ok(())
    }
}

/// Notifier that collects notices in memory. Test support.
#[derive(Default)]
pub struct MemoryNotifier {
    notices: Mutex<Vec<CleanupNotice>>,
}

impl MemoryNotifier {
    /// Creates an empty notifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains and returns every notice received so far.
    #[must_use]
    pub fn take(&self) -> Vec<CleanupNotice> {
        std::mem::take(&mut *self.notices.lock())
    }
}

#[async_trait]
impl CleanupNotifier for MemoryNotifier {
    async fn publish(&self, notice: &CleanupNotice) -> anyhow::Result<()> {
        self.notices.lock().push(notice.clone());
        Ok(())
    }
}

/// Outcome of one cleanup cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Instances the registry listed.
    pub scanned: usize,
    /// Instances matching the eligibility predicate.
    pub eligible: usize,
    /// Instances archived before deletion.
    pub archived: usize,
    /// Instances deleted.
    pub deleted: usize,
    /// Eligible instances that failed to archive or delete.
    pub failed: usize,
    /// Expired durable rows removed by the sweep.
    pub expired_rows: u64,
}

/// The periodic cleanup loop.
pub struct CleanupService {
    registry: Arc<InstanceRegistry>,
    lifecycle: Arc<LifecycleManager>,
    store: Option<Arc<dyn InstanceStore>>,
    archive: Option<Arc<dyn ArchiveSink>>,
    notifier: Option<Arc<dyn CleanupNotifier>>,
    config: CleanupConfig,
}

impl CleanupService {
    /// Wires the service. `archive` is only consulted when
    /// [`CleanupConfig::archive_enabled`] is set; `store` enables the
    /// expired-row sweep.
    #[must_use]
    pub fn new(
        registry: Arc<InstanceRegistry>,
        lifecycle: Arc<LifecycleManager>,
        store: Option<Arc<dyn InstanceStore>>,
        archive: Option<Arc<dyn ArchiveSink>>,
        notifier: Option<Arc<dyn CleanupNotifier>>,
        config: CleanupConfig,
    ) -> Self {
        Self {
            registry,
            lifecycle,
            store,
            archive,
            notifier,
            config,
        }
    }

    /// Runs cycles at the configured interval until `shutdown` fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval() fires immediately; the first cycle should wait one
        // full period like every later one.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    debug!(?report, "cleanup cycle finished");
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("cleanup loop exited");
    }

    /// Executes one cycle immediately.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        // Expired rows first: cheap, and a dry run still benefits from it
        // not happening (nothing is touched in dry-run mode).
        if !self.config.dry_run {
            if let Some(store) = &self.store {
                match store.cleanup_expired(self.config.expired_batch).await {
                    Ok(removed) => {
                        report.expired_rows = removed;
                        if removed > 0 {
                            debug!(removed, "expired durable rows swept");
                        }
                    }
                    Err(err) => warn!(error = %err, "expired-row sweep failed"),
                }
            }
        }

        let records = match self.registry.list(&InstanceFilter::default()).await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "cleanup could not list instances");
                return report;
            }
        };
        report.scanned = records.len();

        let now = Utc::now();
        for record in records {
            if !self.is_eligible(&record, now) {
                continue;
            }
            report.eligible += 1;

            if self.config.dry_run {
                info!(
                    instance_id = %record.instance_id,
                    "dry run: instance eligible for cleanup, not touching it",
                );
                continue;
            }

            match self.clean_instance(&record, now).await {
                Ok(archived) => {
                    report.deleted += 1;
                    if archived {
                        report.archived += 1;
                    }
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        instance_id = %record.instance_id,
                        error = %err,
                        "instance cleanup failed",
                    );
                }
            }
        }
        report
    }

    fn is_eligible(&self, record: &InstanceRecord, now: DateTime<Utc>) -> bool {
        record.can_be_auto_deleted(now, self.config.minimum_age)
            && now - record.last_active >= self.config.inactivity_timeout
    }

    /// Archive (optional) then delete then notify. An archive failure aborts
    /// the deletion -- losing the only copy of the data is worse than one
    /// more idle instance.
    async fn clean_instance(
        &self,
        record: &InstanceRecord,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let instance_id = &record.instance_id;
        let mut archived_path = None;

        if self.config.archive_enabled {
            if let Some(sink) = &self.archive {
                let mut buffer = Vec::new();
                let entries = self
                    .lifecycle
                    .backup_instance(instance_id, &mut buffer)
                    .await?;
                let path = archive_path(now, instance_id);
                sink.put(
                    &path,
                    ArchiveObject {
                        data: buffer.into(),
                        content_type: ARCHIVE_CONTENT_TYPE.to_string(),
                        metadata: archive_metadata(instance_id, now),
                    },
                )
                .await?;
                debug!(instance_id, entries, path, "instance archived");
                archived_path = Some(path);
            }
        }

        self.lifecycle.delete_instance(instance_id).await?;

        if let Some(notifier) = &self.notifier {
            let notice = CleanupNotice {
                instance_id: instance_id.clone(),
                cleanup_time: now,
                reason: "inactivity".to_string(),
                archived: archived_path.is_some(),
                archive_path: archived_path.clone(),
            };
            if let Err(err) = notifier.publish(&notice).await {
                warn!(instance_id, error = %err, "cleanup notification failed");
            }
        }

        Ok(archived_path.is_some())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use warren_core::InstanceStatus;

    use super::*;
    use crate::archive::MemoryArchive;
    use crate::cache::MemoryCache;
    use crate::registry::RegistryConfig;
    use crate::store::{InstanceStore, MemoryStore};

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: Arc<InstanceRegistry>,
        archive: Arc<MemoryArchive>,
        notifier: Arc<MemoryNotifier>,
        service: CleanupService,
    }

    fn fixture(config: CleanupConfig) -> Fixture {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(InstanceRegistry::new(
            cache.clone(),
            RegistryConfig::default(),
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            registry.clone(),
            store.clone(),
            cache,
        ));
        let archive = Arc::new(MemoryArchive::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let service = CleanupService::new(
            registry.clone(),
            lifecycle,
            Some(store.clone()),
            Some(archive.clone()),
            Some(notifier.clone()),
            config,
        );
        Fixture {
            store,
            registry,
            archive,
            notifier,
            service,
        }
    }

    /// Registers a record with the given age and idle time.
    async fn seed_instance(
        registry: &InstanceRegistry,
        id: &str,
        age: ChronoDuration,
        idle: ChronoDuration,
        permanent: bool,
        status: InstanceStatus,
    ) {
        let now = Utc::now();
        let mut record = InstanceRecord::new(id, now - age);
        // last_active can never precede created_at.
        record.last_active = (now - idle).max(record.created_at);
        record.is_permanent = permanent;
        record.status = status;
        registry.register(&record).await.unwrap();
    }

    fn half_hour_policy() -> CleanupConfig {
        CleanupConfig {
            minimum_age: ChronoDuration::minutes(30),
            inactivity_timeout: ChronoDuration::minutes(30),
            ..CleanupConfig::default()
        }
    }

    #[tokio::test]
    async fn only_aged_idle_nonpermanent_active_instances_are_cleaned() {
        let f = fixture(half_hour_policy());
        let hour = ChronoDuration::hours(1);

        // Permanent, old and idle: protected.
        seed_instance(&f.registry, "g", hour, hour, true, InstanceStatus::Active).await;
        // Old enough, idle enough: the one real candidate.
        seed_instance(&f.registry, "r", hour, ChronoDuration::minutes(45), false, InstanceStatus::Active).await;
        // Too young.
        seed_instance(&f.registry, "y", ChronoDuration::minutes(15), ChronoDuration::minutes(45), false, InstanceStatus::Active).await;
        // Recently active.
        seed_instance(&f.registry, "a", hour, ChronoDuration::seconds(1), false, InstanceStatus::Active).await;
        // Already deleting.
        seed_instance(&f.registry, "d", hour, hour, false, InstanceStatus::Deleting).await;

        let report = f.service.run_cycle().await;
        assert_eq!(report.scanned, 5);
        assert_eq!(report.eligible, 1);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.failed, 0);

        assert!(f.registry.get("r").await.is_err());
        for survivor in ["g", "y", "a", "d"] {
            assert!(f.registry.get(survivor).await.is_ok(), "{survivor} must survive");
        }
    }

    #[tokio::test]
    async fn dry_run_reports_without_touching_anything() {
        let f = fixture(CleanupConfig {
            dry_run: true,
            ..half_hour_policy()
        });
        seed_instance(
            &f.registry,
            "r",
            ChronoDuration::hours(1),
            ChronoDuration::hours(1),
            false,
            InstanceStatus::Active,
        )
        .await;

        let report = f.service.run_cycle().await;
        assert_eq!(report.eligible, 1);
        assert_eq!(report.deleted, 0);
        assert!(f.registry.get("r").await.is_ok());
        assert!(f.notifier.take().is_empty());
        assert!(f.archive.is_empty());
    }

    #[tokio::test]
    async fn archival_runs_before_deletion_and_is_announced() {
        let f = fixture(CleanupConfig {
            archive_enabled: true,
            ..half_hour_policy()
        });
        seed_instance(
            &f.registry,
            "r",
            ChronoDuration::hours(1),
            ChronoDuration::hours(1),
            false,
            InstanceStatus::Active,
        )
        .await;
        f.store.set("r", "k1", br#""v1""#, Utc::now()).await.unwrap();

        let report = f.service.run_cycle().await;
        assert_eq!(report.archived, 1);
        assert_eq!(report.deleted, 1);

        let paths = f.archive.paths();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].starts_with("instance-archives/"));
        assert!(paths[0].ends_with("/r.jsonl"));

        let object = f.archive.get(&paths[0]).await.unwrap().unwrap();
        assert_eq!(object.content_type, ARCHIVE_CONTENT_TYPE);
        assert!(std::str::from_utf8(&object.data).unwrap().contains("\"k1\""));

        let notices = f.notifier.take();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].instance_id, "r");
        assert!(notices[0].archived);
        assert_eq!(notices[0].archive_path.as_deref(), Some(paths[0].as_str()));
        assert_eq!(notices[0].reason, "inactivity");
    }

    #[tokio::test]
    async fn cycle_sweeps_expired_rows() {
        let f = fixture(half_hour_policy());
        let old = Utc::now() - ChronoDuration::hours(2);
        f.store.set("t", "stale", b"1", old).await.unwrap();

        // Lapse the row's TTL, then let the cycle collect it.
        let mut entry = f.store.get("t", "stale").await.unwrap();
        entry.ttl = Some(60);
        f.store.put_entries("t", vec![entry]).await.unwrap();

        let report = f.service.run_cycle().await;
        assert_eq!(report.expired_rows, 1);
        assert!(f.store.get("t", "stale").await.is_err());
    }

    struct FailingSink;

    #[async_trait]
    impl ArchiveSink for FailingSink {
        async fn put(&self, _path: &str, _object: ArchiveObject) -> anyhow::Result<()> {
            anyhow::bail!("object store is down")
        }
        async fn get(&self, _path: &str) -> anyhow::Result<Option<ArchiveObject>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn archive_failure_aborts_the_deletion() {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(InstanceRegistry::new(
            cache.clone(),
            RegistryConfig::default(),
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            registry.clone(),
            store,
            cache,
        ));
        let service = CleanupService::new(
            registry.clone(),
            lifecycle,
            None,
            Some(Arc::new(FailingSink)),
            None,
            CleanupConfig {
                archive_enabled: true,
                ..half_hour_policy()
            },
        );
        seed_instance(
            &registry,
            "r",
            ChronoDuration::hours(1),
            ChronoDuration::hours(1),
            false,
            InstanceStatus::Active,
        )
        .await;

        let report = service.run_cycle().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.deleted, 0);
        assert!(registry.get("r").await.is_ok(), "data must outlive a dead sink");
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_cycles_and_stops_on_shutdown() {
        let f = fixture(CleanupConfig {
            interval: Duration::from_secs(60),
            ..half_hour_policy()
        });
        seed_instance(
            &f.registry,
            "r",
            ChronoDuration::hours(1),
            ChronoDuration::hours(1),
            false,
            InstanceStatus::Active,
        )
        .await;

        let (tx, rx) = watch::channel(false);
        let service = Arc::new(f.service);
        let loop_handle = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.run(rx).await })
        };

        // One interval elapses, the cycle runs, the candidate disappears.
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert!(f.registry.get("r").await.is_err());

        tx.send(true).unwrap();
        loop_handle.await.unwrap();
    }
}
