// --- Framebuffer status panel ----------------------------------------------
//
// Renders the published snapshot into an RGB565 frame and writes it to a raw
// framebuffer device (480x320 SPI panels on /dev/fb1 by default). Redraws
// only when the visible content changed. Device trouble disables the panel;
// playback never notices.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use font8x8::{UnicodeFonts, BASIC_FONTS};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::DisplayConfig;
use crate::error::AgentError;
use crate::model::{PlaybackMode, Snapshot};

pub const RENDER_TICK: Duration = Duration::from_millis(500);
pub const TITLE_LINES: usize = 3;

const GLYPH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb565(pub u16);

impl Rgb565 {
    pub const fn from_hex(rgb: u32) -> Self {
        let r = ((rgb >> 16) & 0xff) as u16;
        let g = ((rgb >> 8) & 0xff) as u16;
        let b = (rgb & 0xff) as u16;
        Rgb565(((r & 0xf8) << 8) | ((g & 0xfc) << 3) | (b >> 3))
    }
}

mod palette {
    use super::Rgb565;

    pub const BLACK: Rgb565 = Rgb565::from_hex(0x000000);
    pub const HEADER_BG: Rgb565 = Rgb565::from_hex(0x1a1a2e);
    pub const ACCENT: Rgb565 = Rgb565::from_hex(0x00d9ff);
    pub const WHITE: Rgb565 = Rgb565::from_hex(0xffffff);
    pub const TITLE: Rgb565 = Rgb565::from_hex(0xffd700);
    pub const BAR_BG: Rgb565 = Rgb565::from_hex(0x333333);
    pub const BAR_IDLE: Rgb565 = Rgb565::from_hex(0x222222);
    pub const MUTED: Rgb565 = Rgb565::from_hex(0xaaaaaa);
    pub const DIM: Rgb565 = Rgb565::from_hex(0x666666);
    pub const LABEL: Rgb565 = Rgb565::from_hex(0x888888);
    pub const FOOTER_BG: Rgb565 = Rgb565::from_hex(0x0f0f1e);
    pub const RULE: Rgb565 = Rgb565::from_hex(0x333333);
    pub const FAR: Rgb565 = Rgb565::from_hex(0x00ff88);
    pub const SOON: Rgb565 = Rgb565::from_hex(0xffaa00);
    pub const IMMINENT: Rgb565 = Rgb565::from_hex(0xff3333);
    pub const AD: Rgb565 = Rgb565::from_hex(0xff4444);
}

pub struct Canvas {
    width: usize,
    height: usize,
    pixels: Vec<u16>,
}

impl Canvas {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![palette::BLACK.0; width * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn pixel(&self, x: usize, y: usize) -> Option<Rgb565> {
        if x < self.width && y < self.height {
            Some(Rgb565(self.pixels[y * self.width + x]))
        } else {
            None
        }
    }

    /// Clipped to the canvas.
    pub fn fill_rect(&mut self, x: usize, y: usize, w: usize, h: usize, color: Rgb565) {
        let x_end = (x + w).min(self.width);
        let y_end = (y + h).min(self.height);
        for row in y.min(y_end)..y_end {
            let start = row * self.width;
            self.pixels[start + x.min(x_end)..start + x_end].fill(color.0);
        }
    }

    pub fn text(&mut self, x: usize, y: usize, text: &str, scale: usize, color: Rgb565) {
        let mut cx = x;
        for ch in text.chars() {
            let glyph = BASIC_FONTS
                .get(ch)
                .or_else(|| BASIC_FONTS.get('?'))
                .unwrap_or([0; 8]);
            for (row, bits) in glyph.iter().enumerate() {
                for col in 0..GLYPH {
                    if bits & (1 << col) != 0 {
                        self.fill_rect(cx + col * scale, y + row * scale, scale, scale, color);
                    }
                }
            }
            cx += GLYPH * scale;
        }
    }

    pub fn text_centered(&mut self, y: usize, text: &str, scale: usize, color: Rgb565) {
        let x = self.width.saturating_sub(text_width(text, scale)) / 2;
        self.text(x, y, text, scale, color);
    }

    /// Little-endian RGB565, the layout fbtft panels expect.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pixels.len() * 2);
        for px in &self.pixels {
            out.extend_from_slice(&px.to_le_bytes());
        }
        out
    }
}

pub fn text_width(text: &str, scale: usize) -> usize {
    text.chars().count() * GLYPH * scale
}

/// `m:ss`, or `--:--` when unknown.
pub fn format_clock(seconds: Option<f64>) -> String {
    match seconds {
        Some(s) if s.is_finite() && s >= 0.0 => {
            let total = s as u64;
            format!("{}:{:02}", total / 60, total % 60)
        }
        _ => "--:--".to_string(),
    }
}

/// Greedy word wrap into at most `max_lines` lines of `max_chars`. Overlong
/// words are hard-split; overflow ends the last line with "...".
pub fn wrap_title(title: &str, max_chars: usize, max_lines: usize) -> Vec<String> {
    let max_chars = max_chars.max(4);
    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();

    for word in title.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        while word.len() > max_chars {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            lines.push(word.drain(..max_chars).collect());
        }
        let word: String = word.into_iter().collect();
        let needed = if current.is_empty() {
            word.chars().count()
        } else {
            current.chars().count() + 1 + word.chars().count()
        };
        if needed <= max_chars {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(&word);
        } else {
            lines.push(std::mem::replace(&mut current, word));
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }

    if lines.len() > max_lines {
        lines.truncate(max_lines);
        if let Some(last) = lines.last_mut() {
            let keep = max_chars - 3;
            let mut cut: String = last.chars().take(keep).collect();
            cut.push_str("...");
            *last = cut;
        }
    }
    lines
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CountdownBucket {
    Far,
    Soon,
    Imminent,
}

impl CountdownBucket {
    pub fn for_remaining(seconds: f64) -> Self {
        if seconds > 120.0 {
            CountdownBucket::Far
        } else if seconds > 60.0 {
            CountdownBucket::Soon
        } else {
            CountdownBucket::Imminent
        }
    }

    pub fn color(&self) -> Rgb565 {
        match self {
            CountdownBucket::Far => palette::FAR,
            CountdownBucket::Soon => palette::SOON,
            CountdownBucket::Imminent => palette::IMMINENT,
        }
    }
}

fn whole_seconds(v: Option<f64>) -> Option<u64> {
    v.filter(|s| s.is_finite() && *s >= 0.0).map(|s| s as u64)
}

/// Fingerprint of everything visible on the panel. Sub-second position jitter
/// does not change it.
pub fn content_hash(snap: &Snapshot) -> u64 {
    let mut h = DefaultHasher::new();
    snap.device_id.hash(&mut h);
    snap.mode.status_str().hash(&mut h);
    snap.title.hash(&mut h);
    (snap.track_count + snap.ad_count == 0).hash(&mut h);
    whole_seconds(snap.position).hash(&mut h);
    whole_seconds(snap.duration).hash(&mut h);
    whole_seconds(snap.next_ad_in).hash(&mut h);
    snap.next_ad_in
        .map(CountdownBucket::for_remaining)
        .hash(&mut h);
    snap.volume.hash(&mut h);
    h.finish()
}

struct Layout {
    header_h: usize,
    title_y: usize,
    bar_y: usize,
    footer_y: usize,
    bar_x: usize,
}

impl Layout {
    fn for_size(height: usize) -> Self {
        Self {
            header_h: 36,
            title_y: 52,
            bar_y: height * 165 / 320,
            footer_y: height * 240 / 320,
            bar_x: 20,
        }
    }
}

pub fn render(snap: &Snapshot, width: usize, height: usize) -> Canvas {
    let mut c = Canvas::new(width, height);
    let l = Layout::for_size(height);

    // header
    c.fill_rect(0, 0, width, l.header_h, palette::HEADER_BG);
    c.text(10, 10, &format!("id: {}", snap.device_id), 2, palette::ACCENT);
    let vol = format!("vol {}%", snap.volume);
    c.text(width.saturating_sub(text_width(&vol, 2) + 10), 10, &vol, 2, palette::WHITE);

    // title
    if snap.track_count + snap.ad_count == 0 {
        c.text_centered(l.title_y + 24, "waiting for content...", 2, palette::DIM);
    } else if !snap.title.is_empty() {
        let max_chars = width.saturating_sub(30) / (GLYPH * 3);
        for (i, line) in wrap_title(&snap.title, max_chars, TITLE_LINES).iter().enumerate() {
            c.text_centered(l.title_y + i * 32, line, 3, palette::TITLE);
        }
    }

    // progress
    let bar_w = width.saturating_sub(2 * l.bar_x);
    match (snap.position, snap.duration) {
        (Some(pos), Some(total)) if total > 0.0 => {
            c.fill_rect(l.bar_x, l.bar_y, bar_w, 12, palette::BAR_BG);
            let ratio = (pos / total).clamp(0.0, 1.0);
            c.fill_rect(l.bar_x, l.bar_y, (bar_w as f64 * ratio) as usize, 12, palette::ACCENT);

            let y = l.bar_y + 20;
            c.text(l.bar_x, y, &format_clock(Some(pos)), 2, palette::MUTED);
            let remaining = format!("- {}", format_clock(Some((total - pos).max(0.0))));
            c.text_centered(y, &remaining, 2, palette::WHITE);
            let total_s = format_clock(Some(total));
            let x = width.saturating_sub(l.bar_x + text_width(&total_s, 2));
            c.text(x, y, &total_s, 2, palette::MUTED);
        }
        _ => {
            c.fill_rect(l.bar_x, l.bar_y, bar_w, 12, palette::BAR_IDLE);
            c.text_centered(l.bar_y + 20, "- ready to play -", 2, palette::DIM);
        }
    }

    // footer
    c.fill_rect(0, l.footer_y, width, height.saturating_sub(l.footer_y), palette::FOOTER_BG);
    c.fill_rect(0, l.footer_y, width, 2, palette::RULE);
    if snap.mode == PlaybackMode::PlayingAd {
        c.text_centered(l.footer_y + 12, "advertisement:", 2, palette::LABEL);
        let remaining = match (snap.position, snap.duration) {
            (Some(pos), Some(total)) => Some((total - pos).max(0.0)),
            _ => None,
        };
        c.text_centered(l.footer_y + 34, &format_clock(remaining), 3, palette::AD);

        let y = l.footer_y + 64;
        c.fill_rect(l.bar_x, y, bar_w, 8, palette::BAR_BG);
        if let (Some(pos), Some(total)) = (snap.position, snap.duration) {
            if total > 0.0 {
                let ratio = (pos / total).clamp(0.0, 1.0);
                c.fill_rect(l.bar_x, y, (bar_w as f64 * ratio) as usize, 8, palette::AD);
            }
        }
    } else if let Some(left) = snap.next_ad_in {
        c.text_centered(l.footer_y + 12, "next ad break in:", 2, palette::LABEL);
        let bucket = CountdownBucket::for_remaining(left);
        c.text_centered(l.footer_y + 34, &format_clock(Some(left)), 3, bucket.color());
    } else {
        c.text_centered(l.footer_y + 24, "no ad breaks scheduled", 2, palette::DIM);
    }

    c
}

/// Remembers the last drawn content so unchanged frames are skipped.
pub struct Renderer {
    width: usize,
    height: usize,
    last_hash: Option<u64>,
}

impl Renderer {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            last_hash: None,
        }
    }

    pub fn frame_if_changed(&mut self, snap: &Snapshot) -> Option<Vec<u8>> {
        let hash = content_hash(snap);
        if self.last_hash == Some(hash) {
            return None;
        }
        self.last_hash = Some(hash);
        Some(render(snap, self.width, self.height).to_bytes())
    }
}

fn write_frame(path: &str, frame: &[u8]) -> Result<(), AgentError> {
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| AgentError::display_device(path, e))?;
    f.write_all(frame)
        .map_err(|e| AgentError::display_device(path, e))
}

/// Redraw loop. Returns on shutdown, or as soon as the device fails.
pub async fn run(
    cfg: DisplayConfig,
    mut snapshots: watch::Receiver<Arc<Snapshot>>,
    shutdown: CancellationToken,
) {
    if !cfg.enabled {
        tracing::info!("display disabled by config");
        return;
    }
    if let Err(e) = std::fs::metadata(&cfg.fb_path) {
        let err = AgentError::display_device(&cfg.fb_path, e);
        tracing::warn!("{err}; running without display");
        return;
    }
    tracing::info!("display: {}x{} on {}", cfg.width, cfg.height, cfg.fb_path);

    let mut renderer = Renderer::new(cfg.width, cfg.height);
    let mut tick = tokio::time::interval(RENDER_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }

        let snap = snapshots.borrow_and_update().clone();
        let path = cfg.fb_path.clone();

        // Rasterising and the device write both block.
        let joined = tokio::task::spawn_blocking(move || {
            let result = match renderer.frame_if_changed(&snap) {
                Some(frame) => write_frame(&path, &frame),
                None => Ok(()),
            };
            (renderer, result)
        })
        .await;

        match joined {
            Ok((r, Ok(()))) => renderer = r,
            Ok((_, Err(e))) => {
                tracing::warn!("{e}; display disabled");
                return;
            }
            Err(e) => {
                tracing::warn!("display worker failed: {e}; display disabled");
                return;
            }
        }
    }
}
