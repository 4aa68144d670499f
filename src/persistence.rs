//! Snapshot persistence for the identity registry.
//!
//! The snapshot is a single JSON document with a version header. Writes go
//! to a temporary sibling first and are renamed over the live file, so a
//! crash leaves either the old or the new snapshot, never a torn one.
//! Loading is per-record tolerant: one malformed record is skipped, the rest
//! load normally.

use crate::config::RuntimeConfig;
use crate::registry::{IdentityRecord, IdentityRegistry, RegistrySnapshot};
use crate::types::{
    now_unix_ms, BlockPos, EntityKind, GrowthState, LifecycleState, OwnerId, Position, StableId,
};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use web_time::Instant;

pub const SNAPSHOT_FORMAT_VERSION: u32 = 2;
const BACKUP_DIR: &str = "backups";
const SYNC_SAVE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("snapshot io failed: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("snapshot version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("timed out after {0:?} waiting for the in-flight save")]
    SaveTimeout(Duration),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveStatus {
    /// A background write was started.
    Started,
    /// Another save is still running; this request was dropped.
    InFlight,
    /// Nothing changed since the last save.
    Clean,
    /// The background worker could not be started; the registry stays dirty.
    Failed,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedRecord {
    stable_id: Option<StableId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    transient_owner_id: Option<OwnerId>,
    owner_id: Option<OwnerId>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    kind: Option<EntityKind>,
    #[serde(default)]
    lifecycle_state: Option<LifecycleState>,
    last_position: Position,
    #[serde(default)]
    growth_state: GrowthState,
    #[serde(default)]
    captured: bool,
    #[serde(default)]
    despawned: bool,
    #[serde(default)]
    dead: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    container: Option<BlockPos>,
    #[serde(default)]
    created_at: u64,
    #[serde(default)]
    updated_at: u64,
}

impl PersistedRecord {
    fn from_record(record: &IdentityRecord) -> Self {
        Self {
            stable_id: Some(record.stable_id),
            transient_owner_id: record.captured_by,
            owner_id: Some(record.owner),
            name: record.name.clone(),
            kind: record.kind.clone(),
            lifecycle_state: Some(record.state),
            last_position: record.last_position.clone(),
            growth_state: record.growth.clone(),
            captured: record.state == LifecycleState::Captured,
            despawned: record.state == LifecycleState::Despawned,
            dead: record.state == LifecycleState::Dead,
            container: record.container.clone(),
            created_at: record.created_at_ms,
            updated_at: record.updated_at_ms,
        }
    }

    /// Version 1 snapshots only carried the boolean flags.
    fn derived_state(&self) -> LifecycleState {
        if let Some(state) = self.lifecycle_state {
            return state;
        }
        if self.dead {
            LifecycleState::Dead
        } else if self.captured {
            LifecycleState::Captured
        } else if self.despawned {
            LifecycleState::Despawned
        } else {
            LifecycleState::Active
        }
    }

    fn into_record(self) -> Option<IdentityRecord> {
        let state = self.derived_state();
        let stable_id = self.stable_id?;
        let owner = self.owner_id?;
        Some(IdentityRecord {
            stable_id,
            transient: None,
            owner,
            name: self.name,
            kind: self.kind,
            state,
            last_position: self.last_position,
            growth: self.growth_state,
            captured_by: self.transient_owner_id,
            container: self.container,
            created_at_ms: self.created_at,
            updated_at_ms: self.updated_at,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotDocument {
    version: u32,
    saved_at: u64,
    records: Vec<PersistedRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotEnvelope {
    version: u32,
    #[serde(default)]
    saved_at: u64,
    #[serde(default)]
    records: Vec<serde_json::Value>,
}

#[derive(Debug, Default)]
pub struct LoadReport {
    pub records: Vec<IdentityRecord>,
    /// Records that could not be decoded at all.
    pub skipped: usize,
    /// Records without a stable id or owner.
    pub dropped: usize,
    pub version: u32,
    pub saved_at_ms: u64,
    pub source: Option<PathBuf>,
}

pub fn encode_snapshot(snapshot: &RegistrySnapshot, saved_at_ms: u64) -> Result<Vec<u8>, PersistError> {
    let document = SnapshotDocument {
        version: SNAPSHOT_FORMAT_VERSION,
        saved_at: saved_at_ms,
        records: snapshot.values().map(PersistedRecord::from_record).collect(),
    };
    Ok(serde_json::to_vec_pretty(&document)?)
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<LoadReport, PersistError> {
    let envelope: SnapshotEnvelope = serde_json::from_slice(bytes)?;
    if envelope.version > SNAPSHOT_FORMAT_VERSION {
        return Err(PersistError::UnsupportedVersion {
            found: envelope.version,
            supported: SNAPSHOT_FORMAT_VERSION,
        });
    }

    let mut report = LoadReport {
        version: envelope.version,
        saved_at_ms: envelope.saved_at,
        ..LoadReport::default()
    };
    for (index, value) in envelope.records.into_iter().enumerate() {
        let persisted: PersistedRecord = match serde_json::from_value(value) {
            Ok(persisted) => persisted,
            Err(error) => {
                log::warn!("skipping malformed identity record #{index}: {error}");
                report.skipped += 1;
                continue;
            }
        };
        match persisted.into_record() {
            Some(record) => report.records.push(record),
            None => {
                log::warn!("dropping identity record #{index}: missing stable id or owner");
                report.dropped += 1;
            }
        }
    }
    Ok(report)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().filter(|parent| !parent.as_os_str().is_empty());
    if let Some(parent) = parent {
        std::fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "snapshot path has no file name"))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes)?;
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|error| io::Error::new(io::ErrorKind::Other, error))?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    if let Some(parent) = parent {
        fsync_directory(parent);
    }
    Ok(())
}

fn fsync_directory(path: &Path) {
    if let Ok(dir) = File::open(path) {
        let _ = dir.sync_all();
    }
}

/// Everything the background writer needs, detached from the engine.
#[derive(Clone)]
struct SnapshotWriter {
    snapshot_path: PathBuf,
    backup_dir: PathBuf,
    backup_stem: String,
    max_backups: usize,
    backup_interval: Duration,
    last_backup: Arc<Mutex<Option<Instant>>>,
}

impl SnapshotWriter {
    fn write(&self, snapshot: &RegistrySnapshot) -> Result<(), PersistError> {
        let bytes = encode_snapshot(snapshot, now_unix_ms())?;
        write_atomic(&self.snapshot_path, &bytes)?;
        log::debug!(
            "saved {} identity records to {}",
            snapshot.len(),
            self.snapshot_path.display()
        );
        if self.backup_due() {
            // The primary snapshot is already durable; a failed backup is not
            // worth another full save.
            if let Err(error) = self.write_backup(&bytes) {
                log::warn!("identity snapshot backup failed: {error}");
            }
        }
        Ok(())
    }

    fn backup_due(&self) -> bool {
        if self.max_backups == 0 {
            return false;
        }
        let mut last = self.last_backup.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let due = match *last {
            Some(at) => now.saturating_duration_since(at) >= self.backup_interval,
            None => true,
        };
        if due {
            *last = Some(now);
        }
        due
    }

    fn write_backup(&self, bytes: &[u8]) -> io::Result<PathBuf> {
        std::fs::create_dir_all(&self.backup_dir)?;
        let existing = list_backups(&self.backup_dir, &self.backup_stem)?;
        let newest = existing.last().map(|(stamp, _)| *stamp).unwrap_or(0);
        let stamp = now_unix_ms().max(newest.saturating_add(1));
        let path = self
            .backup_dir
            .join(format!("{}-{stamp}.json", self.backup_stem));
        write_atomic(&path, bytes)?;

        let mut all = existing;
        all.push((stamp, path.clone()));
        let excess = all.len().saturating_sub(self.max_backups);
        for (_, stale) in all.drain(..excess) {
            if let Err(error) = std::fs::remove_file(&stale) {
                log::warn!("could not prune backup {}: {error}", stale.display());
            }
        }
        Ok(path)
    }
}

/// Backups in `dir` named `<stem>-<unix ms>.json`, oldest first.
fn list_backups(dir: &Path, stem: &str) -> io::Result<Vec<(u64, PathBuf)>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(error),
    };
    let prefix = format!("{stem}-");
    let mut backups = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(stamp) = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".json"))
            .and_then(|stamp| stamp.parse::<u64>().ok())
        else {
            continue;
        };
        backups.push((stamp, entry.path()));
    }
    backups.sort_unstable();
    Ok(backups)
}

pub struct PersistenceEngine {
    writer: SnapshotWriter,
    sync_timeout: Duration,
    in_flight: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceEngine {
    pub fn new(config: &RuntimeConfig) -> Self {
        let snapshot_path = config.snapshot_path();
        let backup_stem = snapshot_path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("identities")
            .to_string();
        Self {
            writer: SnapshotWriter {
                backup_dir: config.data_dir.join(BACKUP_DIR),
                snapshot_path,
                backup_stem,
                max_backups: config.max_backups,
                backup_interval: config.backup_interval(),
                last_backup: Arc::new(Mutex::new(None)),
            },
            sync_timeout: config.sync_save_timeout(),
            in_flight: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.writer.snapshot_path
    }

    pub fn is_saving(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn worker(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a background save of the current registry contents. Dropped if
    /// a save is already running; the next periodic save picks the changes up.
    pub fn save(&self, registry: &Arc<IdentityRegistry>) -> SaveStatus {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("identity save skipped: previous save still running");
            return SaveStatus::InFlight;
        }

        // Clear first: a change racing the snapshot must stay dirty.
        registry.mark_clean();
        let snapshot = registry.snapshot();

        let writer = self.writer.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let registry_for_worker = Arc::clone(registry);
        let spawned = thread::Builder::new()
            .name("tether-save".to_string())
            .spawn(move || {
                if let Err(error) = writer.write(&snapshot) {
                    log::warn!("identity snapshot save failed, will retry: {error}");
                    registry_for_worker.mark_dirty();
                }
                in_flight.store(false, Ordering::Release);
            });

        match spawned {
            Ok(handle) => {
                *self.worker() = Some(handle);
                SaveStatus::Started
            }
            Err(error) => {
                log::warn!("could not start identity save worker: {error}");
                registry.mark_dirty();
                self.in_flight.store(false, Ordering::Release);
                SaveStatus::Failed
            }
        }
    }

    pub fn save_if_dirty(&self, registry: &Arc<IdentityRegistry>) -> SaveStatus {
        if !registry.is_dirty() {
            return SaveStatus::Clean;
        }
        self.save(registry)
    }

    /// Waits (bounded) for any background save, then writes synchronously.
    /// Used at shutdown where the final state must be on disk before exit.
    pub fn save_sync(&self, registry: &IdentityRegistry) -> Result<(), PersistError> {
        let deadline = Instant::now() + self.sync_timeout;
        while self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            if Instant::now() >= deadline {
                return Err(PersistError::SaveTimeout(self.sync_timeout));
            }
            thread::sleep(SYNC_SAVE_POLL);
        }
        if let Some(handle) = self.worker().take() {
            let _ = handle.join();
        }

        registry.mark_clean();
        let snapshot = registry.snapshot();
        let result = self.writer.write(&snapshot);
        if result.is_err() {
            registry.mark_dirty();
        }
        self.in_flight.store(false, Ordering::Release);
        result
    }

    /// Loads the snapshot, falling back to the newest readable backup when
    /// the primary file is unreadable. A missing snapshot loads as empty.
    pub fn load(&self) -> Result<LoadReport, PersistError> {
        let primary = self.writer.snapshot_path.clone();
        let primary_error = match read_snapshot(&primary) {
            Ok(Some(report)) => return Ok(report),
            Ok(None) => None,
            Err(error @ PersistError::UnsupportedVersion { .. }) => return Err(error),
            Err(error) => {
                log::warn!("identity snapshot {} unreadable: {error}", primary.display());
                Some(error)
            }
        };

        let backups = list_backups(&self.writer.backup_dir, &self.writer.backup_stem)?;
        for (_, path) in backups.iter().rev() {
            match read_snapshot(path) {
                Ok(Some(report)) => {
                    log::warn!("restored identities from backup {}", path.display());
                    return Ok(report);
                }
                Ok(None) => {}
                Err(error) => log::warn!("backup {} unreadable: {error}", path.display()),
            }
        }

        match primary_error {
            Some(error) => Err(error),
            None => Ok(LoadReport {
                version: SNAPSHOT_FORMAT_VERSION,
                ..LoadReport::default()
            }),
        }
    }

    /// Backup files, oldest first.
    pub fn backups(&self) -> io::Result<Vec<PathBuf>> {
        Ok(list_backups(&self.writer.backup_dir, &self.writer.backup_stem)?
            .into_iter()
            .map(|(_, path)| path)
            .collect())
    }
}

fn read_snapshot(path: &Path) -> Result<Option<LoadReport>, PersistError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error.into()),
    };
    let mut report = decode_snapshot(&bytes)?;
    report.source = Some(path.to_path_buf());
    Ok(Some(report))
}
