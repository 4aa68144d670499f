use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub data_dir: PathBuf,
    pub snapshot_file: String,
    /// Wake-up period of the maintenance thread.
    pub tick_interval_ms: u64,
    pub save_interval_secs: u64,
    pub backup_interval_secs: u64,
    pub max_backups: usize,
    pub sync_save_timeout_ms: u64,
    pub capture_ttl_ms: u64,
    pub container_hint_ttl_ms: u64,
    pub sweep_interval_ms: u64,
    /// Despawned entities respawn only within this distance of an observer.
    pub respawn_radius: f64,
    /// Search radius for container re-matching without exact-position data.
    pub proximity_match_radius: f64,
    /// Preferred radius when matching a released entity to a capture.
    pub capture_match_radius: f64,
    pub grace_max_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/tether"),
            snapshot_file: "identities.json".to_string(),
            tick_interval_ms: 250,
            save_interval_secs: 30,
            backup_interval_secs: 600,
            max_backups: 5,
            sync_save_timeout_ms: 5_000,
            capture_ttl_ms: 1_500,
            container_hint_ttl_ms: 2_000,
            sweep_interval_ms: 5_000,
            respawn_radius: 64.0,
            proximity_match_radius: 6.0,
            capture_match_radius: 16.0,
            grace_max_secs: 30,
        }
    }
}

impl RuntimeConfig {
    /// Reads a JSON config file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(&self.snapshot_file)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(10))
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup_interval_secs)
    }

    pub fn sync_save_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_save_timeout_ms)
    }

    pub fn capture_ttl(&self) -> Duration {
        Duration::from_millis(self.capture_ttl_ms)
    }

    pub fn container_hint_ttl(&self) -> Duration {
        Duration::from_millis(self.container_hint_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn grace_max(&self) -> Duration {
        Duration::from_secs(self.grace_max_secs)
    }
}
