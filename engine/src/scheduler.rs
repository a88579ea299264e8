// --- Playback scheduler -------------------------------------------------------
//
// Single owner of PlaybackState. Runs as one task and is driven by:
// - inbound commands and manifests (from the control channel)
// - media-finished events (from the backend's callback)
// - a 250 ms tick (ad timer, position, checkpoints, starvation retry)
//
// Everyone else observes playback through `watch<Arc<Snapshot>>`. A snapshot is
// built completely and then swapped in, so readers see either the old or the
// new value and nothing in between.
//
// Ad protection: while an ad plays, commands are queued (collapsed by type)
// and replayed in arrival order once the ad has ended and a track is playing
// again. An ad, once started, always runs to its natural end.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::MediaBackend;
use crate::cache::ContentCache;
use crate::config::{AdBreakMode, DeviceConfig};
use crate::error::AgentError;
use crate::model::{
    reindex, Command, CommandKind, CommandOutcome, Disposition, ItemKind, Manifest, PlayItem,
    PlaybackMode, PlaybackState, Playlist, Snapshot,
};
use crate::store::{persist_checkpoint, Checkpoint};

const TICK: Duration = Duration::from_millis(250);
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(10);
const STARVATION_RETRY: Duration = Duration::from_secs(15);
/// Seeks shorter than this are not worth restarting a decoder for.
const MIN_SEEK_SECONDS: f64 = 0.5;

pub const INBOUND_CAPACITY: usize = 64;

pub enum Inbound {
    Command(Command),
    Manifest(Box<Manifest>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerExit {
    Shutdown,
    Reboot,
}

/// Channel ends handed to the rest of the process.
pub struct SchedulerHandles {
    pub inbound: mpsc::Sender<Inbound>,
    pub snapshots: watch::Receiver<Arc<Snapshot>>,
    pub outcomes: mpsc::UnboundedReceiver<CommandOutcome>,
    /// Signalled when the scheduler wants a fresh manifest.
    pub refresh: Arc<Notify>,
}

/// FIFO of commands received during an ad break.
#[derive(Debug, Default)]
pub struct DeferredQueue {
    items: VecDeque<Command>,
}

impl DeferredQueue {
    /// A command of the same type as the tail replaces it.
    pub fn push(&mut self, cmd: Command) {
        if let Some(last) = self.items.back_mut() {
            if last.dedupe_key() == cmd.dedupe_key() {
                *last = cmd;
                return;
            }
        }
        self.items.push_back(cmd);
    }

    pub fn drain(&mut self) -> Vec<Command> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub struct Scheduler {
    device_id: String,
    state: PlaybackState,
    playlist: Playlist,
    config: DeviceConfig,
    backend: Box<dyn MediaBackend>,
    cache: Arc<ContentCache>,
    deferred: DeferredQueue,

    inbound_rx: mpsc::Receiver<Inbound>,
    media_rx: mpsc::UnboundedReceiver<()>,
    snapshot_tx: watch::Sender<Arc<Snapshot>>,
    outcome_tx: mpsc::UnboundedSender<CommandOutcome>,
    refresh: Arc<Notify>,

    db_path: Option<PathBuf>,
    config_path: Option<PathBuf>,

    /// The item currently handed to the backend (track or ad).
    current_item: Option<PlayItem>,
    /// between_tracks mode: an ad break is waiting for the track to end.
    ad_due: bool,
    /// The list changed under the playing item; the next advance goes to the head.
    track_restart: bool,
    ad_restart: bool,
    /// Playback was requested but nothing was playable.
    wants_play: bool,
    reboot_requested: bool,
    last_checkpoint: Instant,
    last_starvation_retry: Instant,
}

impl Scheduler {
    pub fn new(
        device_id: &str,
        config: DeviceConfig,
        mut backend: Box<dyn MediaBackend>,
        cache: Arc<ContentCache>,
    ) -> (Self, SchedulerHandles) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(Snapshot::empty(device_id)));
        let refresh = Arc::new(Notify::new());

        backend.on_finished(Arc::new(move || {
            let _ = media_tx.send(());
        }));

        let state = PlaybackState::new(config.volume);
        if let Err(e) = backend.set_volume(state.volume) {
            warn!("initial volume not applied: {e}");
        }

        let now = Instant::now();
        let sched = Self {
            device_id: device_id.to_string(),
            state,
            playlist: config.playlist(),
            config,
            backend,
            cache,
            deferred: DeferredQueue::default(),
            inbound_rx,
            media_rx,
            snapshot_tx,
            outcome_tx,
            refresh: Arc::clone(&refresh),
            db_path: None,
            config_path: None,
            current_item: None,
            ad_due: false,
            track_restart: false,
            ad_restart: false,
            wants_play: false,
            reboot_requested: false,
            last_checkpoint: now,
            last_starvation_retry: now,
        };
        let handles = SchedulerHandles {
            inbound: inbound_tx,
            snapshots: snapshot_rx,
            outcomes: outcome_rx,
            refresh,
        };
        sched.publish();
        (sched, handles)
    }

    /// Enables checkpointing to `db_path` and config write-back to `config_path`.
    pub fn with_persistence(mut self, db_path: PathBuf, config_path: PathBuf) -> Self {
        self.db_path = Some(db_path);
        self.config_path = Some(config_path);
        self
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn playlist(&self) -> &Playlist {
        &self.playlist
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot_tx.borrow().clone()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    // --- Startup / shutdown --------------------------------------------------

    /// Applies a persisted checkpoint. Paused resumes paused at the saved
    /// position; an interrupted track or ad resumes the track.
    pub async fn restore(&mut self, checkpoint: Option<Checkpoint>) {
        let Some(cp) = checkpoint else {
            info!("no playback checkpoint, starting stopped");
            self.publish();
            return;
        };

        self.set_volume(cp.volume);

        let track_count = self.playlist.len(ItemKind::Track);
        let by_reference = cp.track_reference.as_ref().and_then(|r| {
            self.playlist
                .tracks
                .iter()
                .position(|it| &it.reference == r)
        });
        let same_track = by_reference.is_some() || cp.track_reference.is_none();
        self.state.current_track_index = match by_reference {
            Some(i) => i,
            None if track_count > 0 => cp.track_index % track_count,
            None => 0,
        };
        self.state.current_ad_index = match self.playlist.len(ItemKind::Ad) {
            0 => 0,
            n => cp.ad_index % n,
        };
        let position = if same_track { cp.position } else { 0.0 };

        info!(
            "restoring checkpoint: mode={} track={} position={:.1}s",
            cp.mode.status_str(),
            self.state.current_track_index,
            position
        );

        match cp.mode {
            PlaybackMode::Paused => {
                self.state.mode = PlaybackMode::Paused;
                self.state.paused_track_position = Some(position);
                self.state.position_seconds = position;
            }
            PlaybackMode::PlayingTrack | PlaybackMode::PlayingAd => {
                self.start_track(self.state.current_track_index, position)
                    .await;
            }
            PlaybackMode::Stopped => {
                self.state.mode = PlaybackMode::Stopped;
            }
        }
        self.publish();
    }

    async fn shutdown(&mut self) {
        info!("scheduler shutting down");
        self.checkpoint().await;
        if let Err(e) = self.backend.stop() {
            warn!("backend stop failed during shutdown: {e}");
        }
        self.publish();
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> SchedulerExit {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.shutdown().await;
                    return SchedulerExit::Shutdown;
                }
                msg = self.inbound_rx.recv() => match msg {
                    Some(Inbound::Command(cmd)) => {
                        self.handle_command(cmd).await;
                    }
                    Some(Inbound::Manifest(m)) => self.apply_manifest(*m).await,
                    None => {
                        self.shutdown().await;
                        return SchedulerExit::Shutdown;
                    }
                },
                Some(()) = self.media_rx.recv() => self.on_media_finished().await,
                _ = ticker.tick() => self.tick().await,
            }

            if self.reboot_requested {
                self.shutdown().await;
                return SchedulerExit::Reboot;
            }
        }
    }

    // --- Commands --------------------------------------------------------------

    /// Applies or defers `cmd` and reports the outcome to the control channel.
    pub async fn handle_command(&mut self, cmd: Command) -> CommandOutcome {
        let outcome = if self.state.mode == PlaybackMode::PlayingAd {
            debug!("deferring {} during ad break", cmd.kind.name());
            let name = cmd.kind.name().to_string();
            self.deferred.push(cmd);
            CommandOutcome {
                command: name,
                disposition: Disposition::Deferred,
                mode: self.state.mode,
            }
        } else {
            self.apply(cmd).await
        };

        let _ = self.outcome_tx.send(outcome.clone());
        self.publish();
        outcome
    }

    async fn apply(&mut self, cmd: Command) -> CommandOutcome {
        info!("command: {}", cmd.kind.name());
        match cmd.kind {
            CommandKind::Play => self.cmd_play().await,
            CommandKind::Pause => self.cmd_pause().await,
            CommandKind::Stop => self.cmd_stop().await,
            CommandKind::Next => self.cmd_step(true).await,
            CommandKind::Previous => self.cmd_step(false).await,
            CommandKind::Refresh => self.cmd_refresh().await,
            CommandKind::Reboot => {
                self.checkpoint().await;
                self.reboot_requested = true;
            }
            CommandKind::SetVolume { level } => {
                self.set_volume(level);
                self.config.volume = level;
                self.save_config().await;
                self.checkpoint().await;
            }
        }
        CommandOutcome {
            command: cmd.kind.name().to_string(),
            disposition: Disposition::Executed,
            mode: self.state.mode,
        }
    }

    async fn cmd_play(&mut self) {
        match self.state.mode {
            PlaybackMode::Stopped => {
                self.start_track(self.state.current_track_index, 0.0).await;
            }
            PlaybackMode::Paused => {
                let resume = self.state.paused_track_position.take().unwrap_or(0.0);
                self.start_track(self.state.current_track_index, resume).await;
            }
            PlaybackMode::PlayingTrack | PlaybackMode::PlayingAd => {}
        }
    }

    async fn cmd_pause(&mut self) {
        if self.state.mode != PlaybackMode::PlayingTrack {
            return;
        }
        let position = self.backend.position();
        if let Err(e) = self.backend.pause() {
            warn!("backend pause failed: {e}");
        }
        self.state.mode = PlaybackMode::Paused;
        self.state.position_seconds = position;
        self.state.paused_track_position = Some(position);
        self.freeze_ad_timer(Instant::now());
        self.checkpoint().await;
    }

    async fn cmd_stop(&mut self) {
        if let Err(e) = self.backend.stop() {
            warn!("backend stop failed: {e}");
        }
        self.current_item = None;
        self.state.mode = PlaybackMode::Stopped;
        self.state.position_seconds = 0.0;
        self.state.paused_track_position = None;
        self.wants_play = false;
        self.ad_due = false;
        self.freeze_ad_timer(Instant::now());
        self.checkpoint().await;
    }

    async fn cmd_step(&mut self, forward: bool) {
        let index = if forward {
            self.advance_index(ItemKind::Track)
        } else {
            self.track_restart = false;
            self.playlist
                .previous_index(ItemKind::Track, self.state.current_track_index)
        };

        match self.state.mode {
            PlaybackMode::PlayingTrack => {
                self.start_track(index, 0.0).await;
            }
            _ => {
                self.state.current_track_index = index;
                self.state.position_seconds = 0.0;
                if self.state.mode == PlaybackMode::Paused {
                    self.state.paused_track_position = Some(0.0);
                }
                self.checkpoint().await;
            }
        }
    }

    async fn cmd_refresh(&mut self) {
        if let Some(path) = self.config_path.clone() {
            let loaded = tokio::task::spawn_blocking(move || DeviceConfig::load(&path)).await;
            match loaded {
                Ok(Ok(Some(local))) => {
                    if let Err(e) = local.validate() {
                        warn!("ignoring invalid config.json on refresh: {e}");
                    } else {
                        self.config.merge_local_tuning(&local);
                        self.config.play_lists = local.play_lists.clone();
                        self.config.ads_play_lists = local.ads_play_lists.clone();
                        let playlist = self.config.playlist();
                        self.replace_playlist(playlist);
                        self.cache.set_policy(crate::cache::RetryPolicy::new(
                            self.config.fetch_retries,
                            self.config.fetch_backoff_ms,
                        ));
                        self.sync_ad_timer(Instant::now());
                    }
                }
                Ok(Ok(None)) => debug!("no config.json to reload"),
                Ok(Err(e)) => warn!("config reload failed: {e}"),
                Err(e) => warn!("config reload task failed: {e}"),
            }
        }
        self.refresh.notify_one();
    }

    fn set_volume(&mut self, level: u8) {
        self.state.volume = level.min(100);
        if let Err(e) = self.backend.set_volume(self.state.volume) {
            warn!("backend set_volume failed: {e}");
        }
    }

    // --- Manifest ------------------------------------------------------------

    pub async fn apply_manifest(&mut self, manifest: Manifest) {
        info!(
            "applying manifest: {} track(s), {} ad(s)",
            manifest.play_lists.len(),
            manifest.ads_play_lists.len()
        );

        self.config.apply_manifest(&manifest);
        self.save_config().await;
        if let Some(volume) = manifest.volume {
            if volume != self.state.volume {
                self.set_volume(volume);
            }
        }

        let playlist = self.config.playlist();
        self.replace_playlist(playlist);
        self.sync_ad_timer(Instant::now());

        let keep: HashSet<String> = self.playlist.references().map(str::to_string).collect();
        if keep.is_empty() {
            debug!("no playlist known, cache left as is");
        } else {
            let cache = Arc::clone(&self.cache);
            tokio::spawn(async move {
                if let Err(e) = cache.retain(&keep).await {
                    warn!("cache eviction failed: {e}");
                }
            });
        }
        self.cache.spawn_warm(self.warm_order());

        if self.wants_play && self.state.mode == PlaybackMode::Stopped {
            info!("new content available, retrying playback");
            self.last_starvation_retry = Instant::now();
            self.start_track(self.state.current_track_index, 0.0).await;
        }
        self.publish();
    }

    fn replace_playlist(&mut self, new: Playlist) {
        let old = std::mem::replace(&mut self.playlist, new);

        let (ti, kept) = reindex(&old.tracks, &self.playlist.tracks, self.state.current_track_index);
        if !kept {
            match self.state.mode {
                PlaybackMode::PlayingTrack => self.track_restart = true,
                PlaybackMode::Paused => self.state.paused_track_position = Some(0.0),
                PlaybackMode::PlayingAd => {
                    self.track_restart = false;
                    self.state.paused_track_position = None;
                }
                PlaybackMode::Stopped => {}
            }
        }
        self.state.current_track_index = ti;

        let (ai, kept) = reindex(&old.ads, &self.playlist.ads, self.state.current_ad_index);
        if !kept && self.state.mode == PlaybackMode::PlayingAd {
            self.ad_restart = true;
        }
        self.state.current_ad_index = ai;
    }

    /// Upcoming items first so the next plays are cached before the rest.
    fn warm_order(&self) -> Vec<String> {
        let rotate = |items: &[PlayItem], start: usize| -> Vec<String> {
            let n = items.len();
            (0..n)
                .map(|i| items[(start + i) % n].reference.clone())
                .collect()
        };
        let tracks = rotate(&self.playlist.tracks, self.state.current_track_index);
        let ads = rotate(&self.playlist.ads, self.state.current_ad_index);

        let mut order = Vec::with_capacity(tracks.len() + ads.len());
        order.extend(tracks.iter().take(3).cloned());
        order.extend(ads.iter().take(2).cloned());
        order.extend(tracks.iter().skip(3).cloned());
        order.extend(ads.iter().skip(2).cloned());
        order
    }

    /// Finishes before the next command runs; `refresh` re-reads this file.
    async fn save_config(&self) {
        let Some(path) = self.config_path.clone() else {
            return;
        };
        let cfg = self.config.clone();
        let shown = path.display().to_string();
        match tokio::task::spawn_blocking(move || cfg.save(&path)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("failed to save {shown}: {e}"),
            Err(e) => warn!("config save task failed: {e}"),
        }
    }

    // --- Playback ------------------------------------------------------------

    fn advance_index(&mut self, kind: ItemKind) -> usize {
        let (restart, current) = match kind {
            ItemKind::Track => (&mut self.track_restart, self.state.current_track_index),
            ItemKind::Ad => (&mut self.ad_restart, self.state.current_ad_index),
        };
        if std::mem::take(restart) {
            current
        } else {
            self.playlist.next_index(kind, current)
        }
    }

    async fn load_and_play(&mut self, item: &PlayItem, position: f64) -> Result<(), AgentError> {
        let timeout = self.config.load_timeout();
        let path = match tokio::time::timeout(timeout, self.cache.resolve(&item.reference)).await {
            Ok(res) => res?,
            Err(_) => {
                return Err(AgentError::content_unavailable(
                    &item.reference,
                    format!("not available within {}s", timeout.as_secs()),
                ))
            }
        };
        self.backend.load(&path)?;
        self.backend.set_volume(self.state.volume)?;
        if position > MIN_SEEK_SECONDS {
            self.backend.seek(position)?;
        }
        self.backend.play()?;
        self.current_item = Some(item.clone());
        Ok(())
    }

    /// Plays the first playable track starting at `index`. Unplayable tracks
    /// are skipped; when none plays the engine stops and asks for new content.
    async fn start_track(&mut self, index: usize, position: f64) -> bool {
        let count = self.playlist.len(ItemKind::Track);
        for step in 0..count {
            let idx = (index + step) % count;
            let Some(item) = self.playlist.get(ItemKind::Track, idx).cloned() else {
                break;
            };
            let at = if step == 0 { position } else { 0.0 };

            match self.load_and_play(&item, at).await {
                Ok(()) => {
                    info!("playing track {}: {}", idx, item.display_title());
                    self.state.current_track_index = idx;
                    self.state.mode = PlaybackMode::PlayingTrack;
                    self.state.position_seconds = at;
                    self.state.paused_track_position = None;
                    self.track_restart = false;
                    self.wants_play = false;
                    self.resume_ad_timer(Instant::now());
                    self.prefetch_next();
                    self.checkpoint().await;
                    return true;
                }
                Err(e) => warn!("skipping track {idx}: {e}"),
            }
        }

        if count == 0 {
            warn!("no tracks in playlist, waiting for content");
        } else {
            warn!("no playable track in playlist, waiting for content");
        }
        if let Err(e) = self.backend.stop() {
            debug!("backend stop failed: {e}");
        }
        self.current_item = None;
        self.state.mode = PlaybackMode::Stopped;
        self.state.position_seconds = 0.0;
        self.wants_play = true;
        self.freeze_ad_timer(Instant::now());
        self.last_starvation_retry = Instant::now();
        self.refresh.notify_one();
        self.checkpoint().await;
        false
    }

    /// Interrupts (or follows) the current track with the next playable ad.
    /// Returns false when no ad could be played.
    async fn start_ad_break(&mut self, track_position: Option<f64>) -> bool {
        let count = self.playlist.len(ItemKind::Ad);
        let start = self.state.current_ad_index;
        self.state.ad_timer_deadline = None;
        self.state.ad_timer_frozen = None;

        for step in 0..count {
            let idx = (start + step) % count;
            let Some(item) = self.playlist.get(ItemKind::Ad, idx).cloned() else {
                break;
            };
            match self.load_and_play(&item, 0.0).await {
                Ok(()) => {
                    info!("ad break: playing ad {}: {}", idx, item.display_title());
                    self.state.current_ad_index = idx;
                    self.state.paused_track_position = track_position;
                    self.state.mode = PlaybackMode::PlayingAd;
                    self.state.position_seconds = 0.0;
                    self.ad_restart = false;
                    if let Some(next) = self.playlist.get(ItemKind::Ad, self.playlist.next_index(ItemKind::Ad, idx)) {
                        self.cache.spawn_prefetch(next.reference.clone());
                    }
                    self.checkpoint().await;
                    return true;
                }
                Err(e) => warn!("skipping ad {idx}: {e}"),
            }
        }
        warn!("no playable ad, continuing with tracks");
        self.arm_ad_timer(Instant::now());
        false
    }

    fn prefetch_next(&self) {
        let next_track = self
            .playlist
            .get(ItemKind::Track, self.playlist.next_index(ItemKind::Track, self.state.current_track_index));
        if let Some(item) = next_track {
            self.cache.spawn_prefetch(item.reference.clone());
        }
        if let Some(item) = self.playlist.get(ItemKind::Ad, self.state.current_ad_index) {
            self.cache.spawn_prefetch(item.reference.clone());
        }
    }

    /// Natural end of the loaded item.
    pub async fn on_media_finished(&mut self) {
        if !self.backend.is_finished() {
            debug!("ignoring stale media-finished event");
            return;
        }

        match self.state.mode {
            PlaybackMode::PlayingAd => self.finish_ad_break().await,
            PlaybackMode::PlayingTrack => {
                let next = self.advance_index(ItemKind::Track);
                if self.ad_due {
                    self.ad_due = false;
                    self.state.current_track_index = next;
                    if self.start_ad_break(None).await {
                        self.publish();
                        return;
                    }
                }
                self.start_track(next, 0.0).await;
            }
            PlaybackMode::Paused | PlaybackMode::Stopped => {}
        }
        self.publish();
    }

    async fn finish_ad_break(&mut self) {
        let finished_ad = self.state.current_ad_index;
        self.state.current_ad_index = self.advance_index(ItemKind::Ad);
        debug!("ad {finished_ad} finished, next ad {}", self.state.current_ad_index);

        let resume = self.state.paused_track_position.take().unwrap_or(0.0);
        // A fresh interval starts only once the ad is over.
        self.state.ad_timer_deadline = None;
        self.state.ad_timer_frozen = None;
        self.start_track(self.state.current_track_index, resume).await;

        let pending = self.deferred.drain();
        if !pending.is_empty() {
            info!("replaying {} deferred command(s)", pending.len());
        }
        for cmd in pending {
            let outcome = self.apply(cmd).await;
            let _ = self.outcome_tx.send(outcome);
        }
    }

    // --- Ad timer ------------------------------------------------------------

    fn arm_ad_timer(&mut self, now: Instant) {
        self.state.ad_timer_frozen = None;
        self.state.ad_timer_deadline = self.config.ad_interval().map(|i| now + i);
    }

    fn freeze_ad_timer(&mut self, now: Instant) {
        if let Some(deadline) = self.state.ad_timer_deadline.take() {
            self.state.ad_timer_frozen = Some(deadline.saturating_duration_since(now));
        }
    }

    fn resume_ad_timer(&mut self, now: Instant) {
        if self.state.ad_timer_deadline.is_some() || self.ad_due {
            return;
        }
        match self.state.ad_timer_frozen.take() {
            Some(remaining) if self.config.ad_interval().is_some() => {
                self.state.ad_timer_deadline = Some(now + remaining);
            }
            _ => self.arm_ad_timer(now),
        }
    }

    /// Reconciles the timer with a changed ad configuration.
    fn sync_ad_timer(&mut self, now: Instant) {
        match self.config.ad_interval() {
            None => {
                self.state.ad_timer_deadline = None;
                self.state.ad_timer_frozen = None;
                self.ad_due = false;
            }
            Some(interval) => {
                if let Some(deadline) = self.state.ad_timer_deadline {
                    if deadline.saturating_duration_since(now) > interval {
                        self.state.ad_timer_deadline = Some(now + interval);
                    }
                } else if self.state.mode == PlaybackMode::PlayingTrack && !self.ad_due {
                    self.arm_ad_timer(now);
                }
            }
        }
    }

    async fn on_ad_timer_expired(&mut self, now: Instant) {
        if self.config.ad_interval().is_none() || self.playlist.ads.is_empty() {
            debug!("ad break due but ads are disabled or empty, re-arming");
            self.arm_ad_timer(now);
            return;
        }
        match self.config.ad_break {
            AdBreakMode::BetweenTracks => {
                info!("ad break due, waiting for the current track to end");
                self.state.ad_timer_deadline = None;
                self.ad_due = true;
            }
            AdBreakMode::Interrupt => {
                let position = self.backend.position();
                if !self.start_ad_break(Some(position)).await {
                    // The backend may have been handed a failing ad; put the track back.
                    self.start_track(self.state.current_track_index, position).await;
                }
            }
        }
    }

    // --- Tick ----------------------------------------------------------------

    pub async fn tick(&mut self) {
        self.tick_at(Instant::now()).await;
    }

    pub async fn tick_at(&mut self, now: Instant) {
        if self.state.mode.is_playing() {
            self.state.position_seconds = self.backend.position();
        }

        if self.state.mode == PlaybackMode::PlayingTrack {
            if let Some(deadline) = self.state.ad_timer_deadline {
                if now >= deadline {
                    self.on_ad_timer_expired(now).await;
                }
            }
        }

        if self.wants_play
            && self.state.mode == PlaybackMode::Stopped
            && now.saturating_duration_since(self.last_starvation_retry) >= STARVATION_RETRY
        {
            self.last_starvation_retry = now;
            debug!("retrying playback after starvation");
            self.start_track(self.state.current_track_index, 0.0).await;
        }

        if self.state.mode.is_playing()
            && now.saturating_duration_since(self.last_checkpoint) >= CHECKPOINT_INTERVAL
        {
            self.checkpoint().await;
        }

        self.publish();
    }

    // --- Checkpoint & snapshot -------------------------------------------------

    fn track_position(&self) -> f64 {
        match self.state.mode {
            PlaybackMode::PlayingTrack => self.backend.position(),
            PlaybackMode::Paused | PlaybackMode::PlayingAd => {
                self.state.paused_track_position.unwrap_or(0.0)
            }
            PlaybackMode::Stopped => 0.0,
        }
    }

    pub fn checkpoint_value(&self) -> Checkpoint {
        Checkpoint {
            mode: self.state.mode,
            track_index: self.state.current_track_index,
            ad_index: self.state.current_ad_index,
            position: self.track_position(),
            volume: self.state.volume,
            track_reference: self
                .playlist
                .get(ItemKind::Track, self.state.current_track_index)
                .map(|it| it.reference.clone()),
        }
    }

    async fn checkpoint(&mut self) {
        self.last_checkpoint = Instant::now();
        if let Some(path) = self.db_path.clone() {
            persist_checkpoint(path, self.checkpoint_value()).await;
        }
    }

    fn build_snapshot(&self, now: Instant) -> Snapshot {
        let mode = self.state.mode;
        let track = self
            .playlist
            .get(ItemKind::Track, self.state.current_track_index);

        let (title, position, duration) = match mode {
            PlaybackMode::PlayingAd => {
                let ad = self.current_item.as_ref().filter(|it| it.kind == ItemKind::Ad);
                (
                    ad.map(|it| it.display_title()).unwrap_or_default(),
                    Some(self.backend.position()),
                    self.backend
                        .duration()
                        .or_else(|| ad.and_then(|it| it.duration_hint)),
                )
            }
            PlaybackMode::PlayingTrack => (
                track.map(|it| it.display_title()).unwrap_or_default(),
                Some(self.backend.position()),
                self.backend
                    .duration()
                    .or_else(|| track.and_then(|it| it.duration_hint)),
            ),
            PlaybackMode::Paused => {
                let same = matches!((&self.current_item, track), (Some(a), Some(b)) if a.reference == b.reference);
                (
                    track.map(|it| it.display_title()).unwrap_or_default(),
                    self.state.paused_track_position,
                    (if same { self.backend.duration() } else { None })
                        .or_else(|| track.and_then(|it| it.duration_hint)),
                )
            }
            PlaybackMode::Stopped => (
                track.map(|it| it.display_title()).unwrap_or_default(),
                None,
                track.and_then(|it| it.duration_hint),
            ),
        };

        let next_ad_in = match (self.state.ad_timer_deadline, self.state.ad_timer_frozen) {
            (Some(deadline), _) => Some(deadline.saturating_duration_since(now).as_secs_f64().ceil()),
            (None, Some(remaining)) => Some(remaining.as_secs_f64().ceil()),
            _ if self.ad_due => Some(0.0),
            _ => None,
        };

        Snapshot {
            seq: 0,
            device_id: self.device_id.clone(),
            mode,
            title,
            track_index: self.state.current_track_index,
            track_count: self.playlist.len(ItemKind::Track),
            ad_index: self.state.current_ad_index,
            ad_count: self.playlist.len(ItemKind::Ad),
            position,
            duration,
            volume: self.state.volume,
            next_ad_in,
            starved: self.wants_play && mode == PlaybackMode::Stopped,
            deferred_commands: self.deferred.len(),
        }
    }

    /// Swaps in a new snapshot when anything visible changed.
    fn publish(&self) {
        let mut next = self.build_snapshot(Instant::now());
        self.snapshot_tx.send_if_modified(|current| {
            next.seq = current.seq;
            if **current == next {
                return false;
            }
            next.seq = current.seq + 1;
            *current = Arc::new(next.clone());
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{MockBackend, MockHandle};
    use crate::cache::testing::{open_cache, MemoryFetcher};
    use crate::model::ManifestEntry;

    const A: &str = "https://cdn.example.com/a.mp3";
    const B: &str = "https://cdn.example.com/b.mp3";
    const C: &str = "https://cdn.example.com/c.mp3";
    const AD1: &str = "https://cdn.example.com/ads/ad1.mp3";
    const AD2: &str = "https://cdn.example.com/ads/ad2.mp3";

    struct Rig {
        sched: Scheduler,
        handles: SchedulerHandles,
        media: MockHandle,
        fetcher: Arc<MemoryFetcher>,
        cache: Arc<ContentCache>,
        _dir: tempfile::TempDir,
    }

    fn entries(refs: &[&str]) -> Vec<ManifestEntry> {
        refs.iter().map(|r| ManifestEntry::Url(r.to_string())).collect()
    }

    fn config(tracks: &[&str], ads: &[&str], interval_min: Option<u32>) -> DeviceConfig {
        DeviceConfig {
            volume: 70,
            ads_enabled: interval_min.is_some(),
            playback_interval: interval_min,
            play_lists: entries(tracks),
            ads_play_lists: entries(ads),
            ..DeviceConfig::default()
        }
    }

    async fn rig_with(cfg: DeviceConfig) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MemoryFetcher::with(&[
            (A, 2048),
            (B, 2048),
            (C, 2048),
            (AD1, 2048),
            (AD2, 2048),
        ]);
        let cache = open_cache(dir.path(), fetcher.clone()).await;
        let (backend, media) = MockBackend::new();
        let (sched, handles) = Scheduler::new("aa:bb:cc:dd:ee:ff", cfg, Box::new(backend), cache.clone());
        Rig {
            sched,
            handles,
            media,
            fetcher,
            cache,
            _dir: dir,
        }
    }

    async fn rig() -> Rig {
        rig_with(config(&[A, B, C], &[AD1, AD2], Some(5))).await
    }

    fn loaded_is(media: &MockHandle, reference: &str) -> bool {
        media
            .loaded()
            .map(|p| p.to_string_lossy().contains(&crate::cache::cache_key(reference)))
            .unwrap_or(false)
    }

    async fn cmd(r: &mut Rig, kind: CommandKind) -> CommandOutcome {
        r.sched.handle_command(Command::new(kind)).await
    }

    async fn finish(r: &mut Rig) {
        r.media.finish();
        r.sched.on_media_finished().await;
    }

    fn in_secs(s: u64) -> Instant {
        Instant::now() + Duration::from_secs(s)
    }

    #[tokio::test]
    async fn worked_example_ad_interrupts_and_track_resumes() {
        let mut r = rig().await;

        let out = cmd(&mut r, CommandKind::Play).await;
        assert_eq!(out.status_line(), "play_executed|playing_track");
        assert!(loaded_is(&r.media, A));
        assert!(r.sched.state().ad_timer_deadline.is_some());

        // Nothing happens before the deadline.
        r.media.advance(200.0);
        r.sched.tick_at(in_secs(200)).await;
        assert_eq!(r.sched.state().mode, PlaybackMode::PlayingTrack);

        r.media.advance(100.0);
        r.sched.tick_at(in_secs(301)).await;
        assert_eq!(r.sched.state().mode, PlaybackMode::PlayingAd);
        assert!(loaded_is(&r.media, AD1));
        assert_eq!(r.sched.state().paused_track_position, Some(300.0));
        assert_eq!(r.sched.snapshot().title, "AD: Ad1");

        finish(&mut r).await;
        assert_eq!(r.sched.state().mode, PlaybackMode::PlayingTrack);
        assert_eq!(r.sched.state().current_track_index, 0);
        assert_eq!(r.sched.state().current_ad_index, 1);
        assert!(loaded_is(&r.media, A));
        assert_eq!(r.media.position(), 300.0);
        assert!(r.sched.state().ad_timer_deadline.is_some());
    }

    #[tokio::test]
    async fn commands_during_an_ad_are_deferred_then_replayed_in_order() {
        let mut r = rig().await;
        cmd(&mut r, CommandKind::Play).await;
        r.sched.tick_at(in_secs(301)).await;
        assert_eq!(r.sched.state().mode, PlaybackMode::PlayingAd);

        for kind in [
            CommandKind::Next,
            CommandKind::Next,
            CommandKind::Next,
            CommandKind::SetVolume { level: 20 },
            CommandKind::SetVolume { level: 35 },
            CommandKind::Pause,
            CommandKind::Stop,
        ] {
            let out = cmd(&mut r, kind).await;
            assert_eq!(out.disposition, Disposition::Deferred);
            assert_eq!(out.mode, PlaybackMode::PlayingAd);
            // The ad keeps playing no matter what arrives.
            assert_eq!(r.sched.state().mode, PlaybackMode::PlayingAd);
            assert!(loaded_is(&r.media, AD1));
        }
        assert_eq!(r.sched.deferred_len(), 4);
        assert_eq!(r.sched.snapshot().deferred_commands, 4);
        assert_eq!(r.media.volume(), 70);

        // Drain the deferred/immediate outcome reports so far.
        while r.handles.outcomes.try_recv().is_ok() {}

        finish(&mut r).await;

        let replayed: Vec<String> = std::iter::from_fn(|| r.handles.outcomes.try_recv().ok())
            .map(|o| o.status_line())
            .collect();
        assert_eq!(
            replayed,
            vec![
                "next_executed|playing_track",
                "set_volume_executed|playing_track",
                "pause_executed|paused",
                "stop_executed|stopped",
            ]
        );
        // One `next` applied, not three.
        assert_eq!(r.sched.state().current_track_index, 1);
        assert_eq!(r.media.volume(), 35);
        assert_eq!(r.sched.state().mode, PlaybackMode::Stopped);
        assert_eq!(r.sched.deferred_len(), 0);
    }

    #[tokio::test]
    async fn pause_refresh_play_resumes_at_the_same_spot() {
        let mut r = rig().await;
        cmd(&mut r, CommandKind::Play).await;
        cmd(&mut r, CommandKind::Next).await;
        r.media.advance(42.0);

        cmd(&mut r, CommandKind::Pause).await;
        assert_eq!(r.sched.state().mode, PlaybackMode::Paused);
        assert_eq!(r.sched.state().paused_track_position, Some(42.0));

        let out = cmd(&mut r, CommandKind::Refresh).await;
        assert_eq!(out.status_line(), "refresh_executed|paused");
        assert_eq!(r.sched.state().mode, PlaybackMode::Paused);

        cmd(&mut r, CommandKind::Play).await;
        assert_eq!(r.sched.state().mode, PlaybackMode::PlayingTrack);
        assert_eq!(r.sched.state().current_track_index, 1);
        assert!(loaded_is(&r.media, B));
        assert_eq!(r.media.position(), 42.0);
    }

    #[tokio::test]
    async fn next_and_previous_wrap_and_ads_rotate_independently() {
        let mut r = rig().await;
        for _ in 0..7 {
            cmd(&mut r, CommandKind::Next).await;
        }
        assert_eq!(r.sched.state().current_track_index, 7 % 3);
        assert_eq!(r.sched.state().mode, PlaybackMode::Stopped);
        assert!(r.media.loaded().is_none());

        cmd(&mut r, CommandKind::Previous).await;
        cmd(&mut r, CommandKind::Previous).await;
        assert_eq!(r.sched.state().current_track_index, 2);

        cmd(&mut r, CommandKind::Play).await;
        for expected_ad in [1usize, 0, 1] {
            r.sched.tick_at(in_secs(301)).await;
            assert_eq!(r.sched.state().mode, PlaybackMode::PlayingAd);
            finish(&mut r).await;
            assert_eq!(r.sched.state().current_ad_index, expected_ad);
            assert_eq!(r.sched.state().current_track_index, 2);
        }
    }

    #[tokio::test]
    async fn unplayable_items_are_skipped() {
        let mut r = rig().await;
        // B cannot be fetched at all.
        r.fetcher.content.lock().unwrap().remove(B);
        cmd(&mut r, CommandKind::Play).await;
        finish(&mut r).await;
        assert_eq!(r.sched.state().current_track_index, 2);
        assert!(loaded_is(&r.media, C));

        // C fetches but does not decode.
        let c_path = r.cache.resolve(C).await.unwrap();
        r.media.break_file(&c_path);
        // previous -> B (no content) -> C (broken) -> A
        cmd(&mut r, CommandKind::Previous).await;
        assert_eq!(r.sched.state().current_track_index, 0);
        assert!(loaded_is(&r.media, A));
    }

    #[tokio::test]
    async fn empty_playlist_starves_until_content_arrives() {
        let mut r = rig_with(config(&[], &[], None)).await;
        cmd(&mut r, CommandKind::Play).await;
        assert_eq!(r.sched.state().mode, PlaybackMode::Stopped);
        assert!(r.sched.snapshot().starved);

        let manifest = Manifest {
            play_lists: entries(&[A, B]),
            ..Manifest::default()
        };
        r.sched.apply_manifest(manifest).await;
        assert_eq!(r.sched.state().mode, PlaybackMode::PlayingTrack);
        assert!(loaded_is(&r.media, A));
        assert!(!r.sched.snapshot().starved);
    }

    #[tokio::test]
    async fn starvation_is_retried_on_a_timer() {
        let mut r = rig().await;
        r.fetcher.set_offline(true);
        cmd(&mut r, CommandKind::Play).await;
        assert_eq!(r.sched.state().mode, PlaybackMode::Stopped);

        r.fetcher.set_offline(false);
        r.sched.tick_at(in_secs(5)).await;
        assert_eq!(r.sched.state().mode, PlaybackMode::Stopped);
        r.sched.tick_at(in_secs(16)).await;
        assert_eq!(r.sched.state().mode, PlaybackMode::PlayingTrack);
    }

    #[tokio::test]
    async fn offline_playback_uses_the_cache() {
        let mut r = rig().await;
        cmd(&mut r, CommandKind::Play).await;
        finish(&mut r).await;
        finish(&mut r).await;
        // Let any in-flight prefetches settle into the cache first.
        for reference in [A, B, C, AD1, AD2] {
            r.cache.resolve(reference).await.unwrap();
        }
        let calls = r.fetcher.calls();

        r.fetcher.set_offline(true);
        finish(&mut r).await;
        assert!(loaded_is(&r.media, A));
        assert_eq!(r.sched.state().mode, PlaybackMode::PlayingTrack);
        assert_eq!(r.fetcher.calls(), calls);
    }

    #[tokio::test]
    async fn manifest_without_playlists_keeps_content_and_cache() {
        let mut r = rig().await;
        cmd(&mut r, CommandKind::Play).await;
        for reference in [A, B, C, AD1, AD2] {
            r.cache.resolve(reference).await.unwrap();
        }
        r.fetcher.set_offline(true);

        let partial: Manifest = serde_json::from_str(r#"{"volume": 40}"#).unwrap();
        r.sched.apply_manifest(partial).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(r.media.volume(), 40);
        assert_eq!(r.sched.playlist().tracks.len(), 3);
        assert_eq!(r.sched.playlist().ads.len(), 2);
        for reference in [A, B, C, AD1, AD2] {
            assert!(r.cache.is_cached(reference).await, "{reference} evicted");
        }

        cmd(&mut r, CommandKind::Next).await;
        assert!(loaded_is(&r.media, B));
        assert_eq!(r.sched.state().mode, PlaybackMode::PlayingTrack);
        assert!(!r.sched.snapshot().starved);
    }

    #[tokio::test]
    async fn refresh_after_a_manifest_reads_the_saved_playlist() {
        let mut r = rig().await;
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        r.sched = r.sched.with_persistence(dir.path().join("state.db"), config_path.clone());
        cmd(&mut r, CommandKind::Play).await;

        for round in 0..20u8 {
            let tracks: &[&str] = if round % 2 == 0 { &[C, B] } else { &[B, A, C] };
            r.sched
                .apply_manifest(Manifest {
                    play_lists: entries(tracks),
                    ads_play_lists: entries(&[AD1, AD2]),
                    playback_interval: Some(5),
                    ..Manifest::default()
                })
                .await;
            cmd(&mut r, CommandKind::SetVolume { level: round }).await;
            cmd(&mut r, CommandKind::Refresh).await;
            assert_eq!(r.sched.playlist().tracks.len(), tracks.len(), "round {round}");
        }

        let saved = DeviceConfig::load(&config_path).unwrap().unwrap();
        assert_eq!(saved.volume, 19);
        assert_eq!(saved.play_lists.len(), 3);
    }

    #[tokio::test]
    async fn ad_timer_only_counts_playing_time() {
        let mut r = rig().await;
        cmd(&mut r, CommandKind::Play).await;
        cmd(&mut r, CommandKind::Pause).await;
        let frozen = r.sched.state().ad_timer_frozen.unwrap();
        assert!(frozen > Duration::from_secs(299));
        assert!(r.sched.state().ad_timer_deadline.is_none());

        // A long pause does not trigger an ad.
        r.sched.tick_at(in_secs(3600)).await;
        assert_eq!(r.sched.state().mode, PlaybackMode::Paused);

        cmd(&mut r, CommandKind::Play).await;
        assert!(r.sched.state().ad_timer_frozen.is_none());
        assert!(r.sched.state().ad_timer_deadline.is_some());
    }

    #[tokio::test]
    async fn disabled_or_empty_ads_rearm_the_timer() {
        let mut r = rig_with(config(&[A, B], &[], Some(5))).await;
        cmd(&mut r, CommandKind::Play).await;
        r.sched.tick_at(in_secs(301)).await;
        assert_eq!(r.sched.state().mode, PlaybackMode::PlayingTrack);
        let deadline = r.sched.state().ad_timer_deadline.unwrap();
        assert!(deadline > Instant::now() + Duration::from_secs(290));

        let mut r = rig_with(config(&[A], &[AD1], None)).await;
        cmd(&mut r, CommandKind::Play).await;
        assert!(r.sched.state().ad_timer_deadline.is_none());
        assert_eq!(r.sched.snapshot().next_ad_in, None);
    }

    #[tokio::test]
    async fn between_tracks_mode_waits_for_the_track_to_end() {
        let mut cfg = config(&[A, B], &[AD1], Some(5));
        cfg.ad_break = AdBreakMode::BetweenTracks;
        let mut r = rig_with(cfg).await;

        cmd(&mut r, CommandKind::Play).await;
        r.sched.tick_at(in_secs(301)).await;
        assert_eq!(r.sched.state().mode, PlaybackMode::PlayingTrack);
        assert!(loaded_is(&r.media, A));

        finish(&mut r).await;
        assert_eq!(r.sched.state().mode, PlaybackMode::PlayingAd);
        finish(&mut r).await;
        assert_eq!(r.sched.state().mode, PlaybackMode::PlayingTrack);
        assert!(loaded_is(&r.media, B));
        assert_eq!(r.media.position(), 0.0);
    }

    #[tokio::test]
    async fn refresh_of_the_ad_list_keeps_the_track_position() {
        let mut r = rig().await;
        cmd(&mut r, CommandKind::Play).await;
        cmd(&mut r, CommandKind::Next).await;

        let manifest = Manifest {
            play_lists: entries(&[A, B, C]),
            ads_play_lists: entries(&[AD2]),
            playback_interval: Some(5),
            ..Manifest::default()
        };
        r.sched.apply_manifest(manifest).await;
        assert_eq!(r.sched.state().current_track_index, 1);
        assert_eq!(r.sched.state().mode, PlaybackMode::PlayingTrack);

        // Track list reordered: the index follows the playing item.
        let manifest = Manifest {
            play_lists: entries(&[C, B, A]),
            ads_play_lists: entries(&[AD2]),
            playback_interval: Some(5),
            ..Manifest::default()
        };
        r.sched.apply_manifest(manifest).await;
        assert_eq!(r.sched.state().current_track_index, 1);

        // Playing item removed: the next advance starts from the head.
        let manifest = Manifest {
            play_lists: entries(&[C, A]),
            ads_play_lists: entries(&[AD2]),
            playback_interval: Some(5),
            ..Manifest::default()
        };
        r.sched.apply_manifest(manifest).await;
        assert!(loaded_is(&r.media, B));
        finish(&mut r).await;
        assert!(loaded_is(&r.media, C));
    }

    #[tokio::test]
    async fn restore_honours_the_checkpointed_mode() {
        let mut r = rig().await;
        r.sched
            .restore(Some(Checkpoint {
                mode: PlaybackMode::Paused,
                track_index: 2,
                ad_index: 1,
                position: 12.0,
                volume: 40,
                track_reference: Some(C.into()),
            }))
            .await;
        assert_eq!(r.sched.state().mode, PlaybackMode::Paused);
        assert_eq!(r.sched.snapshot().position, Some(12.0));
        assert_eq!(r.media.volume(), 40);
        cmd(&mut r, CommandKind::Play).await;
        assert!(loaded_is(&r.media, C));
        assert_eq!(r.media.position(), 12.0);

        let mut r = rig().await;
        r.sched
            .restore(Some(Checkpoint {
                mode: PlaybackMode::PlayingAd,
                track_index: 1,
                ad_index: 1,
                position: 30.0,
                volume: 70,
                track_reference: Some(B.into()),
            }))
            .await;
        assert_eq!(r.sched.state().mode, PlaybackMode::PlayingTrack);
        assert!(loaded_is(&r.media, B));
        assert_eq!(r.media.position(), 30.0);
        assert_eq!(r.sched.state().current_ad_index, 1);
    }

    #[tokio::test]
    async fn reboot_checkpoints_and_ends_the_run_loop() {
        let mut r = rig().await;
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("state.db");
        r.sched = r.sched.with_persistence(db.clone(), dir.path().join("config.json"));

        let inbound = r.handles.inbound.clone();
        let token = CancellationToken::new();
        let run = tokio::spawn(r.sched.run(token.clone()));

        inbound.send(Inbound::Command(Command::new(CommandKind::Play))).await.unwrap();
        inbound.send(Inbound::Command(Command::new(CommandKind::Reboot))).await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(10), run).await.unwrap().unwrap();
        assert_eq!(exit, SchedulerExit::Reboot);

        let cp = crate::store::load_checkpoint(db).await.unwrap();
        assert_eq!(cp.mode, PlaybackMode::PlayingTrack);
        assert_eq!(cp.track_reference.as_deref(), Some(A));
    }

    #[tokio::test]
    async fn snapshots_are_whole_values() {
        let mut r = rig().await;
        let mut rx = r.handles.snapshots.clone();
        let before = rx.borrow_and_update().clone();

        cmd(&mut r, CommandKind::Play).await;
        assert!(rx.has_changed().unwrap());
        let after = rx.borrow_and_update().clone();

        // The old Arc is untouched by the mutation.
        assert_eq!(before.mode, PlaybackMode::Stopped);
        assert_eq!(after.mode, PlaybackMode::PlayingTrack);
        assert_eq!(after.title, "A");
        assert!(after.seq > before.seq);

        // Re-publishing an identical state does not bump the sequence.
        r.sched.tick().await;
        r.sched.tick().await;
        let seq = rx.borrow().seq;
        r.sched.tick().await;
        assert_eq!(rx.borrow().seq, seq);
    }

    #[test]
    fn deferred_queue_collapses_runs() {
        let mut q = DeferredQueue::default();
        q.push(Command::new(CommandKind::Next));
        q.push(Command::new(CommandKind::Next));
        q.push(Command::new(CommandKind::SetVolume { level: 1 }));
        q.push(Command::new(CommandKind::SetVolume { level: 9 }));
        q.push(Command::new(CommandKind::Next));
        let kinds: Vec<CommandKind> = q.drain().into_iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![CommandKind::Next, CommandKind::SetVolume { level: 9 }, CommandKind::Next]
        );
        assert!(q.is_empty());
    }
}
