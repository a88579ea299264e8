// --- Media backend ------------------------------------------------------------
//
// Narrow capability surface the scheduler drives. The production backend is
// built on ffmpeg child processes:
//
//   decoder:  ffmpeg -ss <pos> -i <file> -f s16le -ar 48000 -ac 2 pipe:1
//   sink:     ffmpeg -f s16le -ar 48000 -ac 2 -i pipe:0 -f alsa default
//
// A pump task reads 20 ms chunks from the decoder, applies software volume and
// writes them to the long-lived sink at real-time pace. Position is derived
// from the frames actually delivered to the sink.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::Duration;

use crate::error::AgentError;

const SAMPLE_RATE: u64 = 48_000;
// 20 ms @ 48 kHz = 960 frames.
const FRAMES: usize = 960;
const BYTES_PER_FRAME: usize = 2 * 2; // s16le * stereo
const CHUNK_BYTES: usize = FRAMES * BYTES_PER_FRAME;

pub type FinishedCallback = Arc<dyn Fn() + Send + Sync>;

/// Audio output capability. All calls are cheap; none blocks on media I/O.
pub trait MediaBackend: Send + Sync {
    fn load(&mut self, path: &Path) -> Result<(), AgentError>;
    fn play(&mut self) -> Result<(), AgentError>;
    fn pause(&mut self) -> Result<(), AgentError>;
    fn stop(&mut self) -> Result<(), AgentError>;
    fn seek(&mut self, position: f64) -> Result<(), AgentError>;
    /// 0..=100
    fn set_volume(&mut self, level: u8) -> Result<(), AgentError>;
    fn position(&self) -> f64;
    fn duration(&self) -> Option<f64>;
    fn is_finished(&self) -> bool;
    /// Invoked from the backend's own task when the loaded item ends naturally.
    fn on_finished(&mut self, callback: FinishedCallback);
}

/// Scales interleaved s16le samples in place.
pub fn apply_volume(buf: &mut [u8], level: u8) {
    if level >= 100 {
        return;
    }
    let gain = f32::from(level) / 100.0;
    for sample in buf.chunks_exact_mut(2) {
        let v = i16::from_le_bytes([sample[0], sample[1]]);
        let scaled = (f32::from(v) * gain).round() as i16;
        sample.copy_from_slice(&scaled.to_le_bytes());
    }
}

fn frames_to_seconds(frames: u64) -> f64 {
    frames as f64 / SAMPLE_RATE as f64
}

async fn read_full<R: AsyncRead + Unpin>(r: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[derive(Default)]
struct Shared {
    generation: AtomicU64,
    paused: AtomicBool,
    finished: AtomicBool,
    volume: AtomicU8,
    frames: AtomicU64,
    offset_ms: AtomicU64,
    /// 0 = unknown
    duration_ms: AtomicU64,
}

struct Sink {
    _child: Child,
    stdin: ChildStdin,
}

pub struct FfmpegBackend {
    ffmpeg: String,
    ffprobe: String,
    sink_cmd: Vec<String>,
    shared: Arc<Shared>,
    sink: Arc<tokio::sync::Mutex<Option<Sink>>>,
    current: Option<PathBuf>,
    pump: Option<tokio::task::JoinHandle<()>>,
    on_finished: Option<FinishedCallback>,
}

impl FfmpegBackend {
    /// Executables from AUDIO_PLAYER_FFMPEG / AUDIO_PLAYER_FFPROBE / AUDIO_PLAYER_SINK.
    pub fn from_env() -> Self {
        let ffmpeg = std::env::var("AUDIO_PLAYER_FFMPEG").unwrap_or_else(|_| "ffmpeg".to_string());
        let ffprobe = std::env::var("AUDIO_PLAYER_FFPROBE").unwrap_or_else(|_| "ffprobe".to_string());
        let sink_cmd = match std::env::var("AUDIO_PLAYER_SINK") {
            Ok(s) if !s.trim().is_empty() => s.split_whitespace().map(str::to_string).collect(),
            _ => default_sink_cmd(&ffmpeg),
        };
        Self::with_programs(ffmpeg, ffprobe, sink_cmd)
    }

    pub fn with_programs(ffmpeg: String, ffprobe: String, sink_cmd: Vec<String>) -> Self {
        let shared = Arc::new(Shared::default());
        shared.volume.store(100, Ordering::SeqCst);
        shared.paused.store(true, Ordering::SeqCst);
        Self {
            ffmpeg,
            ffprobe,
            sink_cmd,
            shared,
            sink: Arc::new(tokio::sync::Mutex::new(None)),
            current: None,
            pump: None,
            on_finished: None,
        }
    }

    fn halt_pump(&mut self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }

    fn start_pump(&mut self) -> Result<(), AgentError> {
        let Some(path) = self.current.clone() else {
            return Err(AgentError::backend("nothing loaded"));
        };
        self.halt_pump();

        let offset = self.shared.offset_ms.load(Ordering::SeqCst) as f64 / 1000.0;
        let (child, stdout) = spawn_decoder(&self.ffmpeg, &path, offset)?;

        let generation = self.shared.generation.load(Ordering::SeqCst);
        let pump = Pump {
            generation,
            shared: Arc::clone(&self.shared),
            sink: Arc::clone(&self.sink),
            sink_cmd: self.sink_cmd.clone(),
            on_finished: self.on_finished.clone(),
        };
        self.pump = Some(tokio::spawn(pump.run(child, stdout)));
        Ok(())
    }

    fn spawn_duration_probe(&self, path: PathBuf) {
        let shared = Arc::clone(&self.shared);
        let ffprobe = self.ffprobe.clone();
        let generation = shared.generation.load(Ordering::SeqCst);
        tokio::spawn(async move {
            let probed = tokio::task::spawn_blocking(move || probe_duration_seconds(&ffprobe, &path))
                .await
                .ok()
                .flatten();
            if let Some(secs) = probed {
                if shared.generation.load(Ordering::SeqCst) == generation {
                    shared.duration_ms.store((secs * 1000.0) as u64, Ordering::SeqCst);
                }
            }
        });
    }
}

fn default_sink_cmd(ffmpeg: &str) -> Vec<String> {
    [
        ffmpeg, "-hide_banner", "-loglevel", "error", "-f", "s16le", "-ar", "48000", "-ac", "2",
        "-i", "pipe:0", "-f", "alsa", "default",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn spawn_decoder(ffmpeg: &str, path: &Path, offset: f64) -> Result<(Child, ChildStdout), AgentError> {
    let mut cmd = Command::new(ffmpeg);
    cmd.arg("-hide_banner").arg("-loglevel").arg("error");
    if offset > 0.0 {
        cmd.arg("-ss").arg(format!("{offset:.3}"));
    }
    cmd.arg("-i")
        .arg(path)
        .arg("-f")
        .arg("s16le")
        .arg("-ar")
        .arg("48000")
        .arg("-ac")
        .arg("2")
        .arg("pipe:1")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| AgentError::backend(format!("decoder spawn failed for {}: {e}", path.display())))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AgentError::backend("decoder stdout unavailable"))?;
    Ok((child, stdout))
}

fn spawn_sink(sink_cmd: &[String]) -> anyhow::Result<Sink> {
    let (program, args) = sink_cmd
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("empty sink command"))?;
    let mut child = Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn()?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow::anyhow!("sink stdin unavailable"))?;
    Ok(Sink { _child: child, stdin })
}

pub fn probe_duration_seconds(ffprobe: &str, path: &Path) -> Option<f64> {
    let out = std::process::Command::new(ffprobe)
        .arg("-v")
        .arg("error")
        .arg("-show_entries")
        .arg("format=duration")
        .arg("-of")
        .arg("default=noprint_wrappers=1:nokey=1")
        .arg(path)
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let secs: f64 = String::from_utf8_lossy(&out.stdout).trim().parse().ok()?;
    (secs.is_finite() && secs > 0.0).then_some(secs)
}

struct Pump {
    generation: u64,
    shared: Arc<Shared>,
    sink: Arc<tokio::sync::Mutex<Option<Sink>>>,
    sink_cmd: Vec<String>,
    on_finished: Option<FinishedCallback>,
}

impl Pump {
    fn current(&self) -> bool {
        self.shared.generation.load(Ordering::SeqCst) == self.generation
    }

    /// Writes one chunk, respawning the sink if it went away. Audio is
    /// dropped (but paced) while no sink can be started.
    async fn write(&self, chunk: &[u8], sink_warned: &mut bool) {
        let mut guard = self.sink.lock().await;
        if guard.is_none() {
            match spawn_sink(&self.sink_cmd) {
                Ok(s) => {
                    *guard = Some(s);
                    *sink_warned = false;
                }
                Err(e) => {
                    if !*sink_warned {
                        tracing::warn!("audio sink unavailable: {e}");
                        *sink_warned = true;
                    }
                    return;
                }
            }
        }
        if let Some(sink) = guard.as_mut() {
            if let Err(e) = sink.stdin.write_all(chunk).await {
                tracing::warn!("audio sink write failed, restarting sink: {e}");
                *guard = None;
            }
        }
    }

    async fn run(self, mut child: Child, mut decoder: ChildStdout) {
        let silence = vec![0u8; CHUNK_BYTES];
        let mut buf = vec![0u8; CHUNK_BYTES];
        let mut interval = tokio::time::interval(Duration::from_millis(20));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut sink_warned = false;

        loop {
            interval.tick().await;
            if !self.current() {
                break;
            }

            if self.shared.paused.load(Ordering::SeqCst) {
                self.write(&silence, &mut sink_warned).await;
                continue;
            }

            let n = match read_full(&mut decoder, &mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!("decoder read failed: {e}");
                    0
                }
            };
            if n == 0 {
                if self.current() {
                    self.shared.finished.store(true, Ordering::SeqCst);
                    if let Some(cb) = &self.on_finished {
                        cb();
                    }
                }
                break;
            }

            apply_volume(&mut buf[..n], self.shared.volume.load(Ordering::SeqCst));
            self.write(&buf[..n], &mut sink_warned).await;
            if self.current() {
                self.shared
                    .frames
                    .fetch_add((n / BYTES_PER_FRAME) as u64, Ordering::SeqCst);
            }
        }

        let _ = child.kill().await;
    }
}

impl MediaBackend for FfmpegBackend {
    fn load(&mut self, path: &Path) -> Result<(), AgentError> {
        if !path.is_file() {
            return Err(AgentError::backend(format!("{} is not a readable file", path.display())));
        }
        self.halt_pump();
        self.shared.paused.store(true, Ordering::SeqCst);
        self.shared.finished.store(false, Ordering::SeqCst);
        self.shared.frames.store(0, Ordering::SeqCst);
        self.shared.offset_ms.store(0, Ordering::SeqCst);
        self.shared.duration_ms.store(0, Ordering::SeqCst);
        self.current = Some(path.to_path_buf());
        self.spawn_duration_probe(path.to_path_buf());
        Ok(())
    }

    fn play(&mut self) -> Result<(), AgentError> {
        if self.current.is_none() {
            return Err(AgentError::backend("play called with nothing loaded"));
        }
        if self.shared.finished.load(Ordering::SeqCst) {
            return Ok(());
        }
        let running = self.pump.as_ref().is_some_and(|p| !p.is_finished());
        if !running {
            self.start_pump()?;
        }
        self.shared.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn pause(&mut self) -> Result<(), AgentError> {
        self.shared.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AgentError> {
        self.halt_pump();
        self.shared.paused.store(true, Ordering::SeqCst);
        self.shared.frames.store(0, Ordering::SeqCst);
        self.shared.offset_ms.store(0, Ordering::SeqCst);
        self.current = None;
        Ok(())
    }

    fn seek(&mut self, position: f64) -> Result<(), AgentError> {
        if self.current.is_none() {
            return Err(AgentError::backend("seek called with nothing loaded"));
        }
        let position = if position.is_finite() { position.max(0.0) } else { 0.0 };
        let running = self.pump.as_ref().is_some_and(|p| !p.is_finished());
        self.shared.offset_ms.store((position * 1000.0) as u64, Ordering::SeqCst);
        self.shared.frames.store(0, Ordering::SeqCst);
        self.shared.finished.store(false, Ordering::SeqCst);
        if running {
            let paused = self.shared.paused.load(Ordering::SeqCst);
            self.start_pump()?;
            self.shared.paused.store(paused, Ordering::SeqCst);
        }
        Ok(())
    }

    fn set_volume(&mut self, level: u8) -> Result<(), AgentError> {
        self.shared.volume.store(level.min(100), Ordering::SeqCst);
        Ok(())
    }

    fn position(&self) -> f64 {
        let offset = self.shared.offset_ms.load(Ordering::SeqCst) as f64 / 1000.0;
        offset + frames_to_seconds(self.shared.frames.load(Ordering::SeqCst))
    }

    fn duration(&self) -> Option<f64> {
        match self.shared.duration_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(ms as f64 / 1000.0),
        }
    }

    fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }

    fn on_finished(&mut self, callback: FinishedCallback) {
        self.on_finished = Some(callback);
    }
}

impl Drop for FfmpegBackend {
    fn drop(&mut self) {
        self.halt_pump();
    }
}
