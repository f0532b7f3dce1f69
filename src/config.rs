use anyhow::{Context, Result};
use chrono::NaiveTime;
use modelsync_controller::{ControllerConfig, SessionConfig, SnapshotConfig, StagingMode};
use modelsync_relay::RelayConfig;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config/modelsync.toml";
const DEFAULT_PORT: u16 = 7300;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelsyncConfig {
    pub relay: RelaySection,
    pub controller: ControllerSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelaySection {
    pub listen: SocketAddr,
    /// Directory shared with the modeller.
    pub working_dir: PathBuf,
    pub sink_retry_ms: u64,
    pub read_timeout_ms: u64,
    /// JSON-lines file receiving one record per file read or write.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_log: Option<PathBuf>,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            working_dir: PathBuf::from("modeller"),
            sink_retry_ms: 2000,
            read_timeout_ms: 5000,
            activity_log: None,
        }
    }
}

impl RelaySection {
    pub fn relay_config(&self) -> RelayConfig {
        let mut config = RelayConfig::new(self.listen, self.working_dir.clone());
        config.sink_retry = Duration::from_millis(self.sink_retry_ms.max(1));
        config.read_timeout = Duration::from_millis(self.read_timeout_ms.max(1));
        config.activity_log = self.activity_log.clone();
        config
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ControllerSection {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub snapshot_file: String,
    pub status_file: String,
    pub status_interval_secs: u64,
    pub camera_file: String,
    pub camera_interval_secs: u64,
    pub report_interval_secs: u64,
    /// Wall-clock time at simulation second zero, `HH:MM:SS`.
    pub day_start: NaiveTime,
    pub staging: StagingMode,
}

impl Default for ControllerSection {
    fn default() -> Self {
        let defaults = ControllerConfig::new("127.0.0.1", DEFAULT_PORT);
        Self {
            host: defaults.session.host,
            port: defaults.session.port,
            connect_timeout_ms: duration_ms(defaults.session.connect_timeout),
            read_timeout_ms: duration_ms(defaults.session.read_timeout),
            snapshot_file: defaults.snapshot_file,
            status_file: defaults.status_file,
            status_interval_secs: defaults.status_interval_secs,
            camera_file: defaults.camera_file,
            camera_interval_secs: defaults.camera_interval_secs,
            report_interval_secs: defaults.snapshot.report_interval_secs,
            day_start: defaults.snapshot.day_start,
            staging: defaults.snapshot.staging,
        }
    }
}

impl ControllerSection {
    pub fn controller_config(&self) -> ControllerConfig {
        let mut session = SessionConfig::new(self.host.clone(), self.port);
        session.connect_timeout = Duration::from_millis(self.connect_timeout_ms.max(1));
        session.read_timeout = Duration::from_millis(self.read_timeout_ms.max(1));
        ControllerConfig {
            session,
            snapshot_file: self.snapshot_file.clone(),
            status_file: self.status_file.clone(),
            status_interval_secs: self.status_interval_secs.max(1),
            camera_file: self.camera_file.clone(),
            camera_interval_secs: self.camera_interval_secs.max(1),
            snapshot: SnapshotConfig {
                report_interval_secs: self.report_interval_secs.max(1),
                day_start: self.day_start,
                staging: self.staging,
            },
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl ModelsyncConfig {
    /// Load configuration from an explicit path, falling back to defaults on errors.
    pub fn load_from_path(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<ModelsyncConfig>(&contents) {
                Ok(cfg) => cfg,
                Err(err) => {
                    warn!("Failed to parse {}: {err}. Using defaults", path.display());
                    ModelsyncConfig::default()
                }
            },
            Err(err) => {
                if path != Path::new(DEFAULT_CONFIG_PATH)
                    || err.kind() != std::io::ErrorKind::NotFound
                {
                    warn!("Failed to read {}: {err}. Using defaults", path.display());
                } else {
                    warn!("Config not found at {}. Using defaults", path.display());
                }
                ModelsyncConfig::default()
            }
        }
    }

    /// Load configuration, returning read and parse errors to the caller.
    #[cfg(test)]
    pub fn load_strict(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Save configuration to an explicit path.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let toml = toml::to_string_pretty(self).context("failed to render config")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = ModelsyncConfig::load_from_path(&dir.path().join("absent.toml"));
        assert_eq!(cfg.relay.listen.port(), DEFAULT_PORT);
        assert_eq!(cfg.controller.port, DEFAULT_PORT);
        assert_eq!(cfg.controller.staging, StagingMode::Fifo);
        assert_eq!(cfg.controller.day_start, NaiveTime::from_hms_opt(8, 0, 0).expect("time"));
    }

    #[test]
    fn shipped_sample_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH);
        let sample = ModelsyncConfig::load_strict(&path).expect("sample parses");
        let defaults = ModelsyncConfig::default();
        assert_eq!(sample.relay.listen, defaults.relay.listen);
        assert_eq!(sample.relay.working_dir, defaults.relay.working_dir);
        assert_eq!(sample.controller.camera_file, defaults.controller.camera_file);
        assert_eq!(sample.controller.day_start, defaults.controller.day_start);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("modelsync.toml");
        fs::write(
            &path,
            r#"
[relay]
working_dir = "/srv/modeller"
sink_retry_ms = 250

[controller]
host = "modeller.local"
day_start = "06:30:00"
staging = "single_slot"
"#,
        )
        .expect("write");

        let cfg = ModelsyncConfig::load_strict(&path).expect("parses");
        let relay = cfg.relay.relay_config();
        assert_eq!(relay.working_dir, PathBuf::from("/srv/modeller"));
        assert_eq!(relay.sink_retry, Duration::from_millis(250));
        assert_eq!(relay.read_timeout, Duration::from_secs(5));
        assert!(relay.activity_log.is_none());

        let controller = cfg.controller.controller_config();
        assert_eq!(controller.session.host, "modeller.local");
        assert_eq!(controller.session.port, DEFAULT_PORT);
        assert_eq!(controller.snapshot_file, "simulator.xml");
        assert_eq!(controller.camera_interval_secs, 5);
        assert_eq!(controller.snapshot.staging, StagingMode::SingleSlot);
        assert_eq!(
            controller.snapshot.day_start,
            NaiveTime::from_hms_opt(6, 30, 0).expect("time")
        );
    }

    #[test]
    fn unparsable_file_is_rejected_strictly_and_tolerated_leniently() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[controller]\nport = \"not a port\"\n").expect("write");

        assert!(ModelsyncConfig::load_strict(&path).is_err());
        let cfg = ModelsyncConfig::load_from_path(&path);
        assert_eq!(cfg.controller.port, DEFAULT_PORT);
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("modelsync.toml");
        let mut cfg = ModelsyncConfig::default();
        cfg.controller.status_interval_secs = 3;
        cfg.relay.activity_log = Some(PathBuf::from("activity.jsonl"));
        cfg.save_to_path(&path).expect("saves");

        let loaded = ModelsyncConfig::load_strict(&path).expect("loads");
        assert_eq!(loaded.controller.status_interval_secs, 3);
        assert_eq!(loaded.relay.activity_log, Some(PathBuf::from("activity.jsonl")));
    }
}
