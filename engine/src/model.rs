// Data model shared by the scheduler, the control channel and the display.
//
// Everything here is plain data. The scheduler is the only component that
// owns a live `PlaybackState`; everyone else sees `Snapshot` values.

use serde::{Deserialize, Deserializer, Serialize};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::cache::cache_key;

// --- Play items & playlists ------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Track,
    Ad,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayItem {
    pub id: String,
    pub kind: ItemKind,
    pub reference: String,
    pub title: Option<String>,
    pub duration_hint: Option<f64>,
}

impl PlayItem {
    pub fn display_title(&self) -> String {
        let base = self
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| title_from_reference(&self.reference));
        match self.kind {
            ItemKind::Track => base,
            ItemKind::Ad => format!("AD: {base}"),
        }
    }
}

/// Human title for a URL or path: file stem, underscores as spaces, words capitalised.
pub fn title_from_reference(reference: &str) -> String {
    let path = reference
        .split(['?', '#'])
        .next()
        .unwrap_or(reference)
        .trim_end_matches('/');
    let name = path.rsplit('/').next().unwrap_or(path);
    let stem = match name.rsplit_once('.') {
        Some((stem, _ext)) if !stem.is_empty() => stem,
        _ => name,
    };

    let words: Vec<String> = stem
        .replace(['_', '-'], " ")
        .split_whitespace()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect();

    if words.is_empty() {
        "Unknown".to_string()
    } else {
        words.join(" ")
    }
}

/// Track and ad sequences. Both are cyclic and never reordered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Playlist {
    pub tracks: Vec<PlayItem>,
    pub ads: Vec<PlayItem>,
}

impl Playlist {
    pub fn list(&self, kind: ItemKind) -> &[PlayItem] {
        match kind {
            ItemKind::Track => &self.tracks,
            ItemKind::Ad => &self.ads,
        }
    }

    pub fn len(&self, kind: ItemKind) -> usize {
        self.list(kind).len()
    }

    pub fn get(&self, kind: ItemKind, index: usize) -> Option<&PlayItem> {
        let list = self.list(kind);
        if list.is_empty() {
            None
        } else {
            list.get(index % list.len())
        }
    }

    pub fn next_index(&self, kind: ItemKind, index: usize) -> usize {
        match self.len(kind) {
            0 => 0,
            n => (index + 1) % n,
        }
    }

    pub fn previous_index(&self, kind: ItemKind, index: usize) -> usize {
        match self.len(kind) {
            0 => 0,
            n => (index % n + n - 1) % n,
        }
    }

    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.tracks
            .iter()
            .chain(self.ads.iter())
            .map(|it| it.reference.as_str())
    }
}

/// Where `index` into `old` lands in `new`.
///
/// An unchanged list keeps its index; otherwise the index follows the item's
/// reference, falling back to the head when it is gone.
pub fn reindex(old: &[PlayItem], new: &[PlayItem], index: usize) -> (usize, bool) {
    if old == new {
        return (index, true);
    }
    let Some(current) = old.get(index) else {
        return (0, false);
    };
    match new.iter().position(|it| it.reference == current.reference) {
        Some(i) => (i, true),
        None => (0, false),
    }
}

// --- Manifest (wire + persisted) -------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ManifestEntry {
    Url(String),
    Item {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<f64>,
    },
}

impl ManifestEntry {
    pub fn url(&self) -> &str {
        match self {
            ManifestEntry::Url(u) => u,
            ManifestEntry::Item { url, .. } => url,
        }
    }

    fn to_item(&self, kind: ItemKind) -> Option<PlayItem> {
        let reference = self.url().trim();
        if reference.is_empty() {
            return None;
        }
        let (id, title, duration_hint) = match self {
            ManifestEntry::Url(_) => (None, None, None),
            ManifestEntry::Item {
                id, title, duration, ..
            } => (id.clone(), title.clone(), *duration),
        };
        Some(PlayItem {
            id: id.unwrap_or_else(|| cache_key(reference)),
            kind,
            reference: reference.to_string(),
            title,
            duration_hint: duration_hint.filter(|d| d.is_finite() && *d > 0.0),
        })
    }
}

/// Content manifest as delivered by the control endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, deserialize_with = "de_loose_volume", skip_serializing_if = "Option::is_none")]
    pub volume: Option<u8>,
    #[serde(default, rename = "ads", skip_serializing_if = "Option::is_none")]
    pub ads_enabled: Option<bool>,
    /// Minutes of playback between ad breaks.
    #[serde(default, deserialize_with = "de_loose_u32", skip_serializing_if = "Option::is_none")]
    pub playback_interval: Option<u32>,
    #[serde(default)]
    pub play_lists: Vec<ManifestEntry>,
    #[serde(default)]
    pub ads_play_lists: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn playlist(&self) -> Playlist {
        playlist_from_entries(&self.play_lists, &self.ads_play_lists)
    }
}

pub fn playlist_from_entries(tracks: &[ManifestEntry], ads: &[ManifestEntry]) -> Playlist {
    Playlist {
        tracks: tracks
            .iter()
            .filter_map(|e| e.to_item(ItemKind::Track))
            .collect(),
        ads: ads.iter().filter_map(|e| e.to_item(ItemKind::Ad)).collect(),
    }
}

// The control endpoint has historically sent numbers as strings ("7", "5").
#[derive(Deserialize)]
#[serde(untagged)]
enum LooseNumber {
    Int(i64),
    Float(f64),
    Text(String),
}

impl LooseNumber {
    fn as_f64(&self) -> Option<f64> {
        match self {
            LooseNumber::Int(i) => Some(*i as f64),
            LooseNumber::Float(f) => Some(*f),
            LooseNumber::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }
}

pub(crate) fn de_loose_u32<'de, D>(d: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<LooseNumber> = Option::deserialize(d)?;
    Ok(raw
        .and_then(|n| n.as_f64())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v.round() as u32))
}

pub(crate) fn de_loose_volume<'de, D>(d: D) -> Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<LooseNumber> = Option::deserialize(d)?;
    Ok(raw
        .and_then(|n| n.as_f64())
        .filter(|v| v.is_finite())
        .map(clamp_volume))
}

pub fn clamp_volume(v: f64) -> u8 {
    v.round().clamp(0.0, 100.0) as u8
}

// --- Commands ---------------------------------------------------------------

/// Remote commands. New kinds are added here and nowhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Play,
    Pause,
    Stop,
    Next,
    Previous,
    Refresh,
    Reboot,
    SetVolume { level: u8 },
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Play => "play",
            CommandKind::Pause => "pause",
            CommandKind::Stop => "stop",
            CommandKind::Next => "next",
            CommandKind::Previous => "previous",
            CommandKind::Refresh => "refresh",
            CommandKind::Reboot => "reboot",
            CommandKind::SetVolume { .. } => "set_volume",
        }
    }

    /// Parses `play`, `NEXT`, `set_volume:40`, `set_volume 40`, `volume=40`.
    pub fn parse(raw: &str, level: Option<f64>) -> Option<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        let (name, arg) = match raw.split_once([':', '=', ' ']) {
            Some((n, a)) => (n.trim(), Some(a.trim())),
            None => (raw.as_str(), None),
        };
        Some(match name {
            "play" | "resume" => CommandKind::Play,
            "pause" => CommandKind::Pause,
            "stop" => CommandKind::Stop,
            "next" | "skip" => CommandKind::Next,
            "previous" | "prev" => CommandKind::Previous,
            "refresh" | "sync" => CommandKind::Refresh,
            "reboot" | "restart" => CommandKind::Reboot,
            "set_volume" | "volume" => {
                let v = level.or_else(|| arg.and_then(|a| a.parse::<f64>().ok()))?;
                if !v.is_finite() {
                    return None;
                }
                CommandKind::SetVolume {
                    level: clamp_volume(v),
                }
            }
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Command {
    pub id: String,
    pub kind: CommandKind,
    pub received_at: Instant,
}

impl Command {
    pub fn new(kind: CommandKind) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), kind)
    }

    pub fn with_id(id: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            id: id.into(),
            kind,
            received_at: Instant::now(),
        }
    }

    /// Commands with equal keys are duplicates of each other.
    pub fn dedupe_key(&self) -> &'static str {
        self.kind.name()
    }
}

/// Collapses runs of same-type commands, keeping the latest of each run.
pub fn collapse_consecutive(commands: Vec<Command>) -> Vec<Command> {
    let mut out: Vec<Command> = Vec::with_capacity(commands.len());
    for cmd in commands {
        match out.last_mut() {
            Some(last) if last.dedupe_key() == cmd.dedupe_key() => *last = cmd,
            _ => out.push(cmd),
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Executed,
    Deferred,
    Unknown,
}

impl Disposition {
    fn as_str(&self) -> &'static str {
        match self {
            Disposition::Executed => "executed",
            Disposition::Deferred => "deferred",
            Disposition::Unknown => "unknown",
        }
    }
}

/// What happened to a command, reported back over the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub command: String,
    pub disposition: Disposition,
    pub mode: PlaybackMode,
}

impl CommandOutcome {
    /// `play_executed|playing_track`, `next_deferred|playing_ad`, ...
    pub fn status_line(&self) -> String {
        format!(
            "{}_{}|{}",
            self.command,
            self.disposition.as_str(),
            self.mode.status_str()
        )
    }
}

// --- Playback state ---------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    Stopped,
    PlayingTrack,
    Paused,
    PlayingAd,
}

impl PlaybackMode {
    pub fn status_str(&self) -> &'static str {
        match self {
            PlaybackMode::Stopped => "stopped",
            PlaybackMode::PlayingTrack => "playing_track",
            PlaybackMode::Paused => "paused",
            PlaybackMode::PlayingAd => "playing_ad",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stopped" => Some(PlaybackMode::Stopped),
            "playing_track" => Some(PlaybackMode::PlayingTrack),
            "paused" => Some(PlaybackMode::Paused),
            "playing_ad" => Some(PlaybackMode::PlayingAd),
            _ => None,
        }
    }

    pub fn is_playing(&self) -> bool {
        matches!(self, PlaybackMode::PlayingTrack | PlaybackMode::PlayingAd)
    }
}

/// The scheduler's live state. Never shared; see `Snapshot`.
#[derive(Debug, Clone)]
pub struct PlaybackState {
    pub mode: PlaybackMode,
    pub current_track_index: usize,
    pub current_ad_index: usize,
    pub position_seconds: f64,
    pub volume: u8,
    pub ad_timer_deadline: Option<Instant>,
    /// Remaining ad time while the timer is frozen (not playing a track).
    pub ad_timer_frozen: Option<Duration>,
    /// Track position to return to after a pause or an ad break.
    pub paused_track_position: Option<f64>,
}

impl PlaybackState {
    pub fn new(volume: u8) -> Self {
        Self {
            mode: PlaybackMode::Stopped,
            current_track_index: 0,
            current_ad_index: 0,
            position_seconds: 0.0,
            volume,
            ad_timer_deadline: None,
            ad_timer_frozen: None,
            paused_track_position: None,
        }
    }
}

/// Read-only projection of the playback state, published by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub seq: u64,
    pub device_id: String,
    pub mode: PlaybackMode,
    pub title: String,
    pub track_index: usize,
    pub track_count: usize,
    pub ad_index: usize,
    pub ad_count: usize,
    /// Seconds into the current item.
    pub position: Option<f64>,
    pub duration: Option<f64>,
    pub volume: u8,
    /// Seconds of playback left before the next ad break.
    pub next_ad_in: Option<f64>,
    pub starved: bool,
    pub deferred_commands: usize,
}

impl Snapshot {
    pub fn empty(device_id: &str) -> Self {
        Self {
            seq: 0,
            device_id: device_id.to_string(),
            mode: PlaybackMode::Stopped,
            title: String::new(),
            track_index: 0,
            track_count: 0,
            ad_index: 0,
            ad_count: 0,
            position: None,
            duration: None,
            volume: 0,
            next_ad_in: None,
            starved: false,
            deferred_commands: 0,
        }
    }

    pub fn status(&self) -> &'static str {
        self.mode.status_str()
    }
}
