// --- Installation self-test --------------------------------------------------
//
// `audio-player self-test`: cache directory writable, first track resolvable,
// audio path alive. Meant to be run by the installer and by hand on site.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::backend::MediaBackend;
use crate::cache::ContentCache;
use crate::config::DeviceConfig;

pub const PLAYBACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct Check {
    pub name: &'static str,
    pub outcome: CheckOutcome,
}

#[derive(Debug, PartialEq)]
pub enum CheckOutcome {
    Passed(String),
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Default)]
pub struct Report {
    pub checks: Vec<Check>,
}

impl Report {
    fn record(&mut self, name: &'static str, result: anyhow::Result<String>) {
        let outcome = match result {
            Ok(detail) => CheckOutcome::Passed(detail),
            Err(e) => CheckOutcome::Failed(format!("{e:#}")),
        };
        self.checks.push(Check { name, outcome });
    }

    pub fn passed(&self) -> bool {
        !self
            .checks
            .iter()
            .any(|c| matches!(c.outcome, CheckOutcome::Failed(_)))
    }

    pub fn log(&self) {
        for c in &self.checks {
            match &c.outcome {
                CheckOutcome::Passed(d) => tracing::info!("[pass] {}: {d}", c.name),
                CheckOutcome::Skipped(d) => tracing::info!("[skip] {}: {d}", c.name),
                CheckOutcome::Failed(d) => tracing::error!("[FAIL] {}: {d}", c.name),
            }
        }
    }
}

pub async fn run(
    cfg: &DeviceConfig,
    cache: Arc<ContentCache>,
    backend: &mut dyn MediaBackend,
) -> Report {
    let mut report = Report::default();

    report.record("cache directory", probe_dir(cache.dir()).await);

    match cfg.playlist().tracks.first() {
        Some(track) => {
            let result = cache
                .resolve(&track.reference)
                .await
                .map(|p| format!("{} -> {}", track.reference, p.display()))
                .map_err(anyhow::Error::from);
            report.record("first track", result);
        }
        None => report.checks.push(Check {
            name: "first track",
            outcome: CheckOutcome::Skipped("no tracks configured".into()),
        }),
    }

    let wav = cache.dir().join("selftest.wav");
    let played = play_tone(&wav, backend).await;
    if let Err(e) = tokio::fs::remove_file(&wav).await {
        tracing::debug!("could not remove {}: {e}", wav.display());
    }
    report.record("audio output", played);

    report
}

/// Write-then-rename inside `dir`, the same sequence the cache uses.
async fn probe_dir(dir: &Path) -> anyhow::Result<String> {
    let tmp = dir.join(".selftest-probe.tmp");
    let done = dir.join(".selftest-probe");
    let payload = uuid::Uuid::new_v4().to_string();

    tokio::fs::write(&tmp, payload.as_bytes())
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, &done)
        .await
        .with_context(|| format!("rename into {}", done.display()))?;
    let back = tokio::fs::read_to_string(&done).await?;
    tokio::fs::remove_file(&done).await?;

    anyhow::ensure!(back == payload, "read back different bytes");
    Ok(format!("{} is writable", dir.display()))
}

async fn play_tone(path: &Path, backend: &mut dyn MediaBackend) -> anyhow::Result<String> {
    tokio::fs::write(path, tone_wav(1.0))
        .await
        .with_context(|| format!("write {}", path.display()))?;

    let done = Arc::new(tokio::sync::Notify::new());
    let signal = Arc::clone(&done);
    backend.on_finished(Arc::new(move || signal.notify_one()));

    backend.load(path)?;
    backend.play()?;

    let finished = tokio::time::timeout(PLAYBACK_TIMEOUT, done.notified()).await;
    if finished.is_err() && !backend.is_finished() {
        // Leave the sink idle before reporting.
        let _ = backend.stop();
        anyhow::bail!("playback did not finish within {}s", PLAYBACK_TIMEOUT.as_secs());
    }
    Ok("one second tone played to completion".into())
}

/// 48 kHz stereo s16le WAV with a quiet 440 Hz tone.
pub fn tone_wav(seconds: f64) -> Vec<u8> {
    const RATE: u32 = 48_000;
    const CHANNELS: u16 = 2;
    let frames = (RATE as f64 * seconds) as u32;
    let data_len = frames * u32::from(CHANNELS) * 2;

    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVEfmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&CHANNELS.to_le_bytes());
    out.extend_from_slice(&RATE.to_le_bytes());
    out.extend_from_slice(&(RATE * u32::from(CHANNELS) * 2).to_le_bytes());
    out.extend_from_slice(&(CHANNELS * 2).to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());

    for i in 0..frames {
        let t = i as f64 / RATE as f64;
        let s = ((t * 440.0 * std::f64::consts::TAU).sin() * 3000.0) as i16;
        for _ in 0..CHANNELS {
            out.extend_from_slice(&s.to_le_bytes());
        }
    }
    out
}
