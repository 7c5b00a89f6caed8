//! The engine: one instance per device, owning the single-operation lock.
//!
//! Every mutating operation (backup, upload, delete, restore) claims the
//! engine for its duration. A caller arriving while another operation runs
//! gets `EngineBusy` immediately instead of queueing. After a restore asks
//! for a reboot the engine stays in `rebooting` and refuses everything until
//! the process goes away.

use crate::archive::naming::DeviceIdentity;
use crate::archive::{ArchiveBuilder, ArchiveCatalog, ArchiveRecord, IngestionGate};
use crate::config::Config;
use crate::fs::walker::WalkOptions;
use crate::restore::reboot::{CommandRebooter, Rebooter};
use crate::restore::{RecoveryReport, RestoreOrchestrator, RestoreOutcome, RestorePhase, RestoreStatus};
use crate::storage::{StorageLocator, StorageTarget};
use crate::{EngineError, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Maximum number of queued events per subscriber
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineState {
    Idle,
    BackingUp,
    Ingesting,
    Deleting,
    Restoring,
    Rebooting,
}

impl EngineState {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::BackingUp => "backing-up",
            EngineState::Ingesting => "ingesting",
            EngineState::Deleting => "deleting",
            EngineState::Restoring => "restoring",
            EngineState::Rebooting => "rebooting",
        }
    }
}

/// Events pushed to `/ws` subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum EngineEvent {
    #[serde(rename = "engine:state")]
    StateChanged { state: EngineState },

    #[serde(rename = "backup:created")]
    BackupCreated(ArchiveRecord),

    #[serde(rename = "backup:uploaded")]
    BackupUploaded(ArchiveRecord),

    #[serde(rename = "backup:deleted")]
    BackupDeleted { path: PathBuf },

    #[serde(rename = "restore:phase")]
    RestorePhase { phase: RestorePhase },

    #[serde(rename = "restore:completed")]
    RestoreCompleted(RestoreOutcome),

    #[serde(rename = "operation:failed")]
    OperationFailed {
        operation: EngineState,
        code: String,
        error: String,
    },
}

pub struct Engine {
    state: Mutex<EngineState>,
    locator: StorageLocator,
    builder: ArchiveBuilder,
    catalog: ArchiveCatalog,
    gate: IngestionGate,
    orchestrator: RestoreOrchestrator,
    events: broadcast::Sender<EngineEvent>,
}

/// Holds the engine in a busy state; returns it to idle when dropped.
pub(crate) struct Claim<'a> {
    engine: &'a Engine,
    operation: EngineState,
    rebooting: bool,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let next = if self.rebooting {
            EngineState::Rebooting
        } else {
            EngineState::Idle
        };
        self.engine.set_state(next);
    }
}

impl Engine {
    /// Build an engine that reboots through the configured command.
    pub fn from_config(config: &Config) -> Self {
        let rebooter = Arc::new(CommandRebooter::new(config.reboot.command.clone()));
        Self::with_rebooter(config, rebooter)
    }

    pub fn with_rebooter(config: &Config, rebooter: Arc<dyn Rebooter>) -> Self {
        let locator = StorageLocator::new(&config.storage);
        let identity = DeviceIdentity::detect(&config.agent.id, &config.overlay.release_file);
        info!(
            "Device identity: {} running {}",
            identity.device_id, identity.firmware
        );

        let catalog = ArchiveCatalog::new(locator.clone());
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);

        Self {
            state: Mutex::new(EngineState::Idle),
            builder: ArchiveBuilder::new(config, locator.clone(), identity),
            gate: IngestionGate::new(locator.clone(), config.archive.max_upload_bytes),
            orchestrator: RestoreOrchestrator::new(
                catalog.clone(),
                config.overlay.root.clone(),
                WalkOptions::excluding(&config.overlay.exclude),
                rebooter,
            ),
            catalog,
            locator,
            events,
        }
    }

    pub fn state(&self) -> EngineState {
        *self.lock_state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn discover_targets(&self) -> Vec<StorageTarget> {
        self.locator.discover_targets()
    }

    /// Name the next backup at `target` would get.
    pub fn preview_filename(&self, target: &Path) -> Result<String> {
        let target = self.locator.resolve_target(target)?;
        Ok(self.builder.preview_filename(&target.path))
    }

    pub fn create_backup(&self, target: &Path) -> Result<ArchiveRecord> {
        let claim = self.claim(EngineState::BackingUp)?;
        let result = self.builder.create_backup(target);
        self.report(&claim, &result, |record| EngineEvent::BackupCreated(record.clone()));
        result
    }

    pub fn list_backups(&self, target: &Path) -> Vec<ArchiveRecord> {
        self.catalog.list(target)
    }

    /// Resolve an archive for reading, e.g. to stream it to a client.
    pub fn resolve_backup(&self, path: &Path) -> Result<ArchiveRecord> {
        self.catalog.resolve(path)
    }

    pub fn delete_backup(&self, path: &Path) -> Result<()> {
        let claim = self.claim(EngineState::Deleting)?;
        let result = self.catalog.delete(path);
        self.report(&claim, &result, |_| EngineEvent::BackupDeleted {
            path: path.to_path_buf(),
        });
        result
    }

    pub fn upload_backup(&self, bytes: &[u8], declared_name: &str, target: &Path) -> Result<ArchiveRecord> {
        let claim = self.claim(EngineState::Ingesting)?;
        let result = self.gate.admit(bytes, declared_name, target);
        self.report(&claim, &result, |record| EngineEvent::BackupUploaded(record.clone()));
        result
    }

    pub fn restore(&self, archive: &Path, auto_reboot: bool) -> Result<RestoreOutcome> {
        let mut claim = self.claim(EngineState::Restoring)?;
        let result = self.orchestrator.restore(archive, auto_reboot, &|phase| {
            self.emit(EngineEvent::RestorePhase { phase });
        });
        if let Ok(outcome) = &result {
            claim.rebooting = outcome.status == RestoreStatus::RestoredPendingReboot;
        }
        self.report(&claim, &result, |outcome| EngineEvent::RestoreCompleted(outcome.clone()));
        result
    }

    /// Clean up after a previous run that died mid-operation. Called once at
    /// start-up, before serving requests.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let _claim = self.claim(EngineState::Restoring)?;
        let report = self.orchestrator.recover()?;
        let swept = self.catalog.sweep();
        if report.commit_completed || report.stale_dirs_removed > 0 || swept > 0 {
            info!(
                "Recovery: commit completed: {}, stale dirs removed: {}, leftover files removed: {}",
                report.commit_completed, report.stale_dirs_removed, swept
            );
        }
        Ok(report)
    }

    pub(crate) fn claim(&self, operation: EngineState) -> Result<Claim<'_>> {
        {
            let mut state = self.lock_state();
            if *state != EngineState::Idle {
                debug!("Refusing {}: engine is {}", operation.as_str(), state.as_str());
                return Err(EngineError::EngineBusy(state.as_str().to_string()));
            }
            *state = operation;
        }
        self.emit(EngineEvent::StateChanged { state: operation });
        Ok(Claim {
            engine: self,
            operation,
            rebooting: false,
        })
    }

    fn set_state(&self, next: EngineState) {
        *self.lock_state() = next;
        self.emit(EngineEvent::StateChanged { state: next });
    }

    fn report<T>(&self, claim: &Claim<'_>, result: &Result<T>, on_success: impl FnOnce(&T) -> EngineEvent) {
        let event = match result {
            Ok(value) => on_success(value),
            Err(e) => {
                warn!("{} failed: {}", claim.operation.as_str(), e);
                EngineEvent::OperationFailed {
                    operation: claim.operation,
                    code: e.code().to_string(),
                    error: e.to_string(),
                }
            }
        };
        self.emit(event);
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is the normal case.
        let _ = self.events.send(event);
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::archive::builder::tests::Fixture;
    use crate::restore::reboot::tests::RecordingRebooter;
    use std::sync::atomic::Ordering;
    use std::sync::Barrier;

    pub(crate) fn engine(fixture: &Fixture) -> (Engine, Arc<RecordingRebooter>) {
        let rebooter = Arc::new(RecordingRebooter::default());
        (Engine::with_rebooter(&fixture.config, rebooter.clone()), rebooter)
    }

    #[test]
    fn test_busy_while_operation_runs() {
        let fixture = Fixture::new();
        let (engine, _) = engine(&fixture);

        let claim = engine.claim(EngineState::BackingUp).unwrap();
        assert_eq!(engine.state(), EngineState::BackingUp);

        let err = engine.create_backup(&fixture.upload()).unwrap_err();
        assert!(matches!(err, EngineError::EngineBusy(ref s) if s == "backing-up"));
        assert!(matches!(
            engine.restore(&fixture.upload().join("x.tar.gz"), true),
            Err(EngineError::EngineBusy(_))
        ));
        assert!(matches!(
            engine.delete_backup(&fixture.upload().join("x.tar.gz")),
            Err(EngineError::EngineBusy(_))
        ));

        drop(claim);
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(engine.create_backup(&fixture.upload()).is_ok());
    }

    #[test]
    fn test_concurrent_backups_never_overlap() {
        let fixture = Fixture::new();
        let (engine, _) = engine(&fixture);
        let barrier = Barrier::new(4);

        let results: Vec<Result<ArchiveRecord>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        engine.create_backup(&fixture.upload())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let created = results.iter().filter(|r| r.is_ok()).count();
        assert!(created >= 1);
        for result in &results {
            assert!(matches!(result, Ok(_) | Err(EngineError::EngineBusy(_))));
        }
        assert_eq!(engine.list_backups(&fixture.upload()).len(), created);
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_backup_without_external_storage() {
        let fixture = Fixture::new();
        let (engine, _) = engine(&fixture);

        let targets = engine.discover_targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].path, fixture.upload());

        let record = engine.create_backup(&targets[0].path).unwrap();
        let listed = engine.list_backups(&targets[0].path);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, record.path);
    }

    #[test]
    fn test_restore_leaves_engine_rebooting() {
        let fixture = Fixture::new();
        let (engine, rebooter) = engine(&fixture);
        let record = engine.create_backup(&fixture.upload()).unwrap();

        let outcome = engine.restore(&record.path, true).unwrap();
        assert_eq!(outcome.status, RestoreStatus::RestoredPendingReboot);
        assert_eq!(rebooter.requests.load(Ordering::SeqCst), 1);
        assert_eq!(engine.state(), EngineState::Rebooting);

        assert!(matches!(
            engine.create_backup(&fixture.upload()),
            Err(EngineError::EngineBusy(ref s)) if s == "rebooting"
        ));
    }

    #[test]
    fn test_restore_without_reboot_returns_to_idle() {
        let fixture = Fixture::new();
        let (engine, rebooter) = engine(&fixture);
        let record = engine.create_backup(&fixture.upload()).unwrap();

        let outcome = engine.restore(&record.path, false).unwrap();
        assert_eq!(outcome.status, RestoreStatus::RestoredManualRebootRequired);
        assert_eq!(rebooter.requests.load(Ordering::SeqCst), 0);
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_failed_operation_is_broadcast() {
        let fixture = Fixture::new();
        let (engine, _) = engine(&fixture);
        let mut rx = engine.subscribe();

        let missing = fixture.upload().join("missing.tar.gz");
        assert!(engine.restore(&missing, true).is_err());

        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::OperationFailed { operation, code, .. } = event {
                assert_eq!(operation, EngineState::Restoring);
                assert_eq!(code, "archive_not_found");
                saw_failure = true;
            }
        }
        assert!(saw_failure);
        assert_eq!(engine.state(), EngineState::Idle);
    }
}
