// Persisted configuration, secrets and device identity.
//
// Layout of the data directory (provisioned by the installer):
//
//   mac_address.txt      stable device id
//   secret_config.json   {api_base_url, auth_token}, restricted permissions
//   config.json          device configuration + last known playlists
//   state.db             playback checkpoint + cache index (SQLite)
//   audio_cache/         downloaded content
//
// The directory can be overridden with AUDIO_PLAYER_DATA_DIR (or --data-dir).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::error::AgentError;
use crate::model::{de_loose_u32, de_loose_volume, playlist_from_entries, Manifest, ManifestEntry, Playlist};

pub const DEFAULT_DATA_DIR: &str = "/var/lib/audio-player";
pub const FALLBACK_DEVICE_ID: &str = "00:00:00:00:00:00";

#[derive(Debug, Clone)]
pub struct Paths {
    pub data_dir: PathBuf,
}

impl Paths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    pub fn identity_file(&self) -> PathBuf {
        self.data_dir.join("mac_address.txt")
    }

    pub fn secret_file(&self) -> PathBuf {
        self.data_dir.join("secret_config.json")
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    pub fn state_db(&self) -> PathBuf {
        self.data_dir.join("state.db")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("audio_cache")
    }

    pub fn ensure(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
            .map_err(|e| anyhow::anyhow!("failed to create {}: {e}", self.data_dir.display()))?;
        std::fs::create_dir_all(self.cache_dir())
            .map_err(|e| anyhow::anyhow!("failed to create {}: {e}", self.cache_dir().display()))?;
        Ok(())
    }
}

// --- Secrets ----------------------------------------------------------------

#[derive(Clone, Deserialize)]
pub struct Secrets {
    pub api_base_url: String,
    pub auth_token: String,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("api_base_url", &self.api_base_url)
            .field("auth_token", &"****")
            .finish()
    }
}

pub fn load_secrets(path: &Path) -> Result<Secrets, AgentError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| AgentError::configuration(format!("secret file {}: {e}", path.display())))?;
    let mut secrets: Secrets = serde_json::from_str(&raw)
        .map_err(|e| AgentError::configuration(format!("secret file {}: {e}", path.display())))?;

    secrets.api_base_url = secrets.api_base_url.trim().trim_end_matches('/').to_string();
    secrets.auth_token = secrets.auth_token.trim().to_string();
    if secrets.api_base_url.is_empty() {
        return Err(AgentError::configuration("secret file: api_base_url is empty"));
    }
    if secrets.auth_token.is_empty() {
        return Err(AgentError::configuration("secret file: auth_token is empty"));
    }
    Ok(secrets)
}

// --- Device configuration ---------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdBreakMode {
    /// Interrupt the running track and resume it after the ad.
    #[default]
    Interrupt,
    /// Wait for the running track to end.
    BetweenTracks,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_fb_path")]
    pub fb_path: String,
    #[serde(default = "default_width")]
    pub width: usize,
    #[serde(default = "default_height")]
    pub height: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fb_path: default_fb_path(),
            width: default_width(),
            height: default_height(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default = "default_volume", deserialize_with = "de_volume")]
    pub volume: u8,
    #[serde(default = "default_true", rename = "ads")]
    pub ads_enabled: bool,
    /// Minutes of playback between ad breaks. No built-in default.
    #[serde(default, deserialize_with = "de_loose_u32")]
    pub playback_interval: Option<u32>,
    #[serde(default)]
    pub ad_break: AdBreakMode,
    #[serde(default)]
    pub play_lists: Vec<ManifestEntry>,
    #[serde(default)]
    pub ads_play_lists: Vec<ManifestEntry>,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_fetch_retries")]
    pub fetch_retries: u32,
    #[serde(default = "default_fetch_backoff")]
    pub fetch_backoff_ms: u64,
    #[serde(default = "default_load_timeout")]
    pub load_timeout_secs: u64,
    #[serde(default)]
    pub display: DisplayConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            location: String::new(),
            volume: default_volume(),
            ads_enabled: true,
            playback_interval: None,
            ad_break: AdBreakMode::default(),
            play_lists: Vec::new(),
            ads_play_lists: Vec::new(),
            poll_interval_secs: default_poll_interval(),
            fetch_retries: default_fetch_retries(),
            fetch_backoff_ms: default_fetch_backoff(),
            load_timeout_secs: default_load_timeout(),
            display: DisplayConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_fb_path() -> String {
    "/dev/fb1".into()
}
fn default_width() -> usize {
    480
}
fn default_height() -> usize {
    320
}
fn default_device_name() -> String {
    "Audio Player".into()
}
fn default_volume() -> u8 {
    70
}
fn default_poll_interval() -> u64 {
    10
}
fn default_fetch_retries() -> u32 {
    3
}
fn default_fetch_backoff() -> u64 {
    500
}
fn default_load_timeout() -> u64 {
    30
}

fn de_volume<'de, D>(d: D) -> Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(de_loose_volume(d)?.unwrap_or_else(default_volume))
}

impl DeviceConfig {
    /// First configuration of a device that has never been online before.
    pub fn from_manifest(m: &Manifest) -> Self {
        let mut cfg = DeviceConfig::default();
        cfg.apply_manifest(m);
        cfg
    }

    /// `Ok(None)` when the file does not exist yet.
    pub fn load(path: &Path) -> Result<Option<Self>, AgentError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AgentError::configuration(format!("{}: {e}", path.display())));
            }
        };
        let cfg: DeviceConfig = serde_json::from_str(&raw)
            .map_err(|e| AgentError::configuration(format!("{}: {e}", path.display())))?;
        Ok(Some(cfg))
    }

    /// Writes via temp file + rename so a crash never leaves half a config.
    /// Each write gets its own temp name; concurrent writers never share one.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension(format!("json.{:08x}.tmp", fastrand::u32(..)));
        if let Err(e) = std::fs::write(&tmp, json).and_then(|()| std::fs::rename(&tmp, path)) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.ads_enabled && self.playback_interval.unwrap_or(0) == 0 {
            return Err(AgentError::configuration(
                "ads are enabled but playback_interval is missing or zero",
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(AgentError::configuration("poll_interval_secs must be > 0"));
        }
        if self.display.width == 0 || self.display.height == 0 {
            return Err(AgentError::configuration("display size must be non-zero"));
        }
        Ok(())
    }

    pub fn apply_manifest(&mut self, m: &Manifest) {
        if let Some(name) = &m.device_name {
            self.device_name = name.clone();
        }
        if let Some(location) = &m.location {
            self.location = location.clone();
        }
        if let Some(volume) = m.volume {
            self.volume = volume;
        }
        if let Some(ads) = m.ads_enabled {
            self.ads_enabled = ads;
        }
        if let Some(interval) = m.playback_interval.filter(|i| *i > 0) {
            self.playback_interval = Some(interval);
        }
        // An empty or missing list leaves the last known one in place.
        if !m.play_lists.is_empty() {
            self.play_lists = m.play_lists.clone();
        }
        if !m.ads_play_lists.is_empty() {
            self.ads_play_lists = m.ads_play_lists.clone();
        }
    }

    /// Re-reads the tuning knobs from disk, keeping playlists and server fields.
    pub fn merge_local_tuning(&mut self, local: &DeviceConfig) {
        self.ad_break = local.ad_break;
        self.poll_interval_secs = local.poll_interval_secs;
        self.fetch_retries = local.fetch_retries;
        self.fetch_backoff_ms = local.fetch_backoff_ms;
        self.load_timeout_secs = local.load_timeout_secs;
        self.display = local.display.clone();
        if local.playback_interval.is_some() {
            self.playback_interval = local.playback_interval;
        }
    }

    pub fn playlist(&self) -> Playlist {
        playlist_from_entries(&self.play_lists, &self.ads_play_lists)
    }

    pub fn ad_interval(&self) -> Option<Duration> {
        if !self.ads_enabled {
            return None;
        }
        self.playback_interval
            .filter(|m| *m > 0)
            .map(|m| Duration::from_secs(u64::from(m) * 60))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs.max(1))
    }
}

// --- Device identity --------------------------------------------------------

/// Stable device id: the saved id file, else the interface MAC (persisted once found).
pub async fn load_device_id(paths: &Paths) -> String {
    let id_file = paths.identity_file();
    if let Ok(saved) = std::fs::read_to_string(&id_file) {
        let saved = saved.trim();
        if !saved.is_empty() && saved != FALLBACK_DEVICE_ID {
            tracing::info!("using saved device id: {saved}");
            return saved.to_string();
        }
    }

    let iface = std::env::var("AUDIO_PLAYER_IFACE").unwrap_or_else(|_| "eth0".to_string());
    let sys_path = format!("/sys/class/net/{iface}/address");
    const ATTEMPTS: u32 = 5;

    for attempt in 1..=ATTEMPTS {
        match std::fs::read_to_string(&sys_path) {
            Ok(mac) => {
                let mac = mac.trim().to_string();
                if !mac.is_empty() && mac != FALLBACK_DEVICE_ID {
                    tracing::info!("found device id on {iface}: {mac}");
                    if let Err(e) = std::fs::write(&id_file, &mac) {
                        tracing::warn!("could not persist device id to {}: {e}", id_file.display());
                    }
                    return mac;
                }
            }
            Err(e) => tracing::debug!("reading {sys_path} failed (attempt {attempt}/{ATTEMPTS}): {e}"),
        }
        if attempt < ATTEMPTS {
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    tracing::error!("could not read a MAC address from {iface}, using fallback id {FALLBACK_DEVICE_ID}");
    FALLBACK_DEVICE_ID.to_string()
}
