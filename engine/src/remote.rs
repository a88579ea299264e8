// --- Remote control channel -------------------------------------------------
//
// Pull-based: every poll interval we POST our status to {base}/poll and get
// back pending commands and, optionally, a content manifest. Commands go to
// the scheduler's inbound queue; each command outcome comes back to us and is
// reported right away with a heartbeat instead of waiting for the next poll.
//
// Network failures never leave this module. They are logged (once per
// connectivity transition) and the next tick simply tries again.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Secrets;
use crate::error::AgentError;
use crate::model::{collapse_consecutive, Command, CommandKind, CommandOutcome, Manifest, Snapshot};
use crate::scheduler::Inbound;
use crate::status_api::{system_summary, SystemSummary};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(3);
const SEEN_IDS: usize = 64;

/// A command as delivered by the endpoint.
#[derive(Debug)]
pub enum WireCommand {
    Known(Command),
    Unknown(String),
}

#[derive(Debug, Default)]
pub struct PollReply {
    pub commands: Vec<WireCommand>,
    pub manifest: Option<Manifest>,
}

#[derive(Serialize)]
struct PollBody<'a> {
    mac: &'a str,
    status: &'a str,
    system: SystemSummary,
}

#[derive(Serialize)]
struct HeartbeatBody<'a> {
    mac: &'a str,
    status: &'a str,
}

fn transient_if_flagged(value: &Value) -> Result<(), AgentError> {
    if value.get("error").and_then(Value::as_bool) == Some(true) {
        let msg = value
            .get("msg")
            .or_else(|| value.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("endpoint reported an error");
        return Err(AgentError::TransientNetwork(msg.to_string()));
    }
    Ok(())
}

fn decode_command(raw: &Value) -> Option<WireCommand> {
    let (name, level, id) = match raw {
        Value::String(s) => (s.clone(), None, None),
        Value::Object(o) => {
            let name = o
                .get("type")
                .or_else(|| o.get("command"))
                .and_then(Value::as_str)?
                .to_string();
            let level = o.get("level").and_then(|l| match l {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            });
            let id = o.get("id").and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
            (name, level, id)
        }
        _ => return None,
    };

    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
        return None;
    }
    Some(match CommandKind::parse(trimmed, level) {
        Some(kind) => WireCommand::Known(match id {
            Some(id) => Command::with_id(id, kind),
            None => Command::new(kind),
        }),
        None => WireCommand::Unknown(trimmed.to_ascii_lowercase()),
    })
}

/// Decodes a poll response body.
pub fn decode_poll(value: &Value) -> Result<PollReply, AgentError> {
    transient_if_flagged(value)?;

    let mut reply = PollReply::default();
    match value.get("commands") {
        Some(Value::Array(items)) => {
            reply.commands = items.iter().filter_map(decode_command).collect();
        }
        Some(other) => {
            reply.commands = decode_command(other).into_iter().collect();
        }
        None => {
            // Legacy single-command shape: {"command": "play"}.
            if let Some(raw) = value.get("command") {
                reply.commands = decode_command(raw).into_iter().collect();
            }
        }
    }

    if let Some(m) = value.get("manifest").filter(|m| m.is_object()) {
        match serde_json::from_value::<Manifest>(m.clone()) {
            Ok(manifest) => reply.manifest = Some(manifest),
            Err(e) => warn!("ignoring malformed manifest in poll response: {e}"),
        }
    }
    Ok(reply)
}

fn decode_manifest(value: Value) -> Result<Manifest, AgentError> {
    transient_if_flagged(&value)?;
    let body = match value.get("manifest") {
        Some(m) if m.is_object() => m.clone(),
        _ => value,
    };
    serde_json::from_value(body)
        .map_err(|e| AgentError::TransientNetwork(format!("malformed manifest: {e}")))
}

pub struct RemoteChannel {
    client: reqwest::Client,
    base_url: String,
    token: String,
    device_id: String,
    poll_interval: Duration,
    online: Option<bool>,
    seen_ids: VecDeque<String>,
    last_manifest: Option<Manifest>,
    sys: sysinfo::System,
}

impl RemoteChannel {
    pub fn new(secrets: &Secrets, device_id: &str, poll_interval: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("audio-player/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: secrets.api_base_url.trim_end_matches('/').to_string(),
            token: secrets.auth_token.clone(),
            device_id: device_id.to_string(),
            poll_interval,
            online: None,
            seen_ids: VecDeque::with_capacity(SEEN_IDS),
            last_manifest: None,
            sys: sysinfo::System::new(),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The manifest already applied locally; identical ones are not forwarded.
    pub fn with_known_manifest(mut self, manifest: Option<Manifest>) -> Self {
        self.last_manifest = manifest;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn query(&self) -> [(&'static str, String); 2] {
        let t = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        [("mac", self.device_id.clone()), ("_t", t.to_string())]
    }

    fn mark(&mut self, result: Result<(), &AgentError>) {
        match (result, self.online) {
            (Ok(()), Some(true)) => {}
            (Ok(()), _) => {
                info!("control endpoint reachable");
                self.online = Some(true);
            }
            (Err(e), Some(false)) => debug!("control endpoint still unreachable: {e}"),
            (Err(e), _) => {
                warn!("control endpoint unreachable, continuing offline: {e}");
                self.online = Some(false);
            }
        }
    }

    async fn post_json(&self, path: &str, body: &impl Serialize, timeout: Duration) -> Result<Value, AgentError> {
        let resp = self
            .client
            .post(self.url(path))
            .query(&self.query())
            .bearer_auth(&self.token)
            .timeout(timeout)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        if resp.content_length() == Some(0) {
            return Ok(Value::Null);
        }
        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| AgentError::TransientNetwork(format!("invalid JSON from {path}: {e}")))
    }

    pub async fn poll_once(&mut self, status: &str) -> Result<PollReply, AgentError> {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        let res = {
            let body = PollBody {
                mac: &self.device_id,
                status,
                system: system_summary(&self.sys),
            };
            self.post_json("poll", &body, REQUEST_TIMEOUT)
                .await
                .and_then(|v| decode_poll(&v))
        };
        self.mark(res.as_ref().map(|_| ()));
        res
    }

    pub async fn send_heartbeat(&mut self, status: &str) -> Result<(), AgentError> {
        let res = {
            let body = HeartbeatBody {
                mac: &self.device_id,
                status,
            };
            self.post_json("heartbeat", &body, HEARTBEAT_TIMEOUT)
                .await
                .and_then(|v| transient_if_flagged(&v))
        };
        self.mark(res.as_ref().map(|_| ()));
        res
    }

    async fn get_json(&self, path: &str) -> Result<Value, AgentError> {
        Ok(self
            .client
            .get(self.url(path))
            .query(&self.query())
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    pub async fn fetch_manifest(&mut self) -> Result<Manifest, AgentError> {
        let res = self.get_json("manifest").await.and_then(decode_manifest);
        self.mark(res.as_ref().map(|_| ()));
        res
    }

    /// Drops commands whose id was delivered recently.
    fn filter_seen(&mut self, commands: Vec<Command>) -> Vec<Command> {
        let mut fresh = Vec::with_capacity(commands.len());
        for cmd in commands {
            if self.seen_ids.contains(&cmd.id) {
                debug!("dropping redelivered command {} ({})", cmd.kind.name(), cmd.id);
                continue;
            }
            if self.seen_ids.len() == SEEN_IDS {
                self.seen_ids.pop_front();
            }
            self.seen_ids.push_back(cmd.id.clone());
            fresh.push(cmd);
        }
        fresh
    }

    /// `Some(manifest)` when it differs from the last one forwarded.
    fn take_if_changed(&mut self, manifest: Manifest) -> Option<Manifest> {
        if self.last_manifest.as_ref() == Some(&manifest) {
            return None;
        }
        self.last_manifest = Some(manifest.clone());
        Some(manifest)
    }

    async fn forward_manifest(&mut self, manifest: Manifest, inbound: &mpsc::Sender<Inbound>) -> bool {
        match self.take_if_changed(manifest) {
            Some(m) => {
                info!("manifest changed, forwarding to scheduler");
                inbound.send(Inbound::Manifest(Box::new(m))).await.is_ok()
            }
            None => {
                debug!("manifest unchanged");
                true
            }
        }
    }

    async fn dispatch(
        &mut self,
        reply: PollReply,
        inbound: &mpsc::Sender<Inbound>,
        snapshots: &watch::Receiver<Arc<Snapshot>>,
    ) -> bool {
        if let Some(manifest) = reply.manifest {
            if !self.forward_manifest(manifest, inbound).await {
                return false;
            }
        }

        let mut known = Vec::new();
        for wire in reply.commands {
            match wire {
                WireCommand::Known(cmd) => known.push(cmd),
                WireCommand::Unknown(name) => {
                    warn!("unknown command from control endpoint: {name}");
                    let status = format!("{name}_unknown|{}", snapshots.borrow().status());
                    let _ = self.send_heartbeat(&status).await;
                }
            }
        }

        let commands = self.filter_seen(collapse_consecutive(known));
        for cmd in commands {
            info!("received command: {}", cmd.kind.name());
            if inbound.send(Inbound::Command(cmd)).await.is_err() {
                return false;
            }
        }
        true
    }

    /// Poll loop. Returns itself so the caller can send a final report.
    pub async fn run(
        mut self,
        inbound: mpsc::Sender<Inbound>,
        snapshots: watch::Receiver<Arc<Snapshot>>,
        mut outcomes: mpsc::UnboundedReceiver<CommandOutcome>,
        refresh: Arc<Notify>,
        shutdown: CancellationToken,
    ) -> Self {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let status = snapshots.borrow().status().to_string();
                    match self.poll_once(&status).await {
                        Ok(reply) => {
                            if !self.dispatch(reply, &inbound, &snapshots).await {
                                break;
                            }
                        }
                        Err(e) => debug!("poll failed: {e}"),
                    }
                }
                Some(outcome) = outcomes.recv() => {
                    let _ = self.send_heartbeat(&outcome.status_line()).await;
                }
                _ = refresh.notified() => {
                    match self.fetch_manifest().await {
                        Ok(manifest) => {
                            if !self.forward_manifest(manifest, &inbound).await {
                                break;
                            }
                        }
                        Err(e) => debug!("manifest fetch failed: {e}"),
                    }
                }
            }
        }

        // Outcomes produced while shutting down (reboot, stop) still get reported.
        while let Ok(outcome) = outcomes.try_recv() {
            let _ = self.send_heartbeat(&outcome.status_line()).await;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Disposition, PlaybackMode};
    use axum::extract::Query;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;

    fn kinds(reply: &PollReply) -> Vec<String> {
        reply
            .commands
            .iter()
            .map(|c| match c {
                WireCommand::Known(c) => c.kind.name().to_string(),
                WireCommand::Unknown(n) => format!("?{n}"),
            })
            .collect()
    }

    #[test]
    fn poll_replies_accept_strings_objects_and_legacy_shape() {
        let reply = decode_poll(&json!({
            "commands": ["play", {"type": "set_volume", "level": "40", "id": 7}, "moonwalk", "none"],
            "manifest": {"play_lists": ["https://x/a.mp3"], "playback_interval": "6"}
        }))
        .unwrap();
        assert_eq!(kinds(&reply), vec!["play", "set_volume", "?moonwalk"]);
        match &reply.commands[1] {
            WireCommand::Known(c) => {
                assert_eq!(c.kind, CommandKind::SetVolume { level: 40 });
                assert_eq!(c.id, "7");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(reply.manifest.unwrap().playback_interval, Some(6));

        let legacy = decode_poll(&json!({"command": "next"})).unwrap();
        assert_eq!(kinds(&legacy), vec!["next"]);
        let idle = decode_poll(&json!({"command": "none"})).unwrap();
        assert!(idle.commands.is_empty());
    }

    #[test]
    fn error_bodies_are_transient() {
        let err = decode_poll(&json!({"error": true, "msg": "device not registered"})).unwrap_err();
        assert!(matches!(err, AgentError::TransientNetwork(m) if m == "device not registered"));
        assert!(decode_manifest(json!({"error": true})).is_err());
    }

    fn channel(base: &str) -> RemoteChannel {
        let secrets: Secrets = serde_json::from_value(json!({
            "api_base_url": base,
            "auth_token": "secret-token"
        }))
        .unwrap();
        RemoteChannel::new(&secrets, "aa:bb:cc:dd:ee:ff", Duration::from_secs(10)).unwrap()
    }

    #[test]
    fn redelivered_ids_and_unchanged_manifests_are_dropped() {
        let mut ch = channel("http://127.0.0.1:9");
        let first = ch.filter_seen(vec![
            Command::with_id("1", CommandKind::Play),
            Command::with_id("2", CommandKind::Next),
        ]);
        assert_eq!(first.len(), 2);
        let again = ch.filter_seen(vec![
            Command::with_id("2", CommandKind::Next),
            Command::with_id("3", CommandKind::Pause),
        ]);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, "3");

        for i in 0..SEEN_IDS {
            ch.filter_seen(vec![Command::with_id(format!("x{i}"), CommandKind::Play)]);
        }
        assert_eq!(ch.filter_seen(vec![Command::with_id("1", CommandKind::Play)]).len(), 1);

        let m = Manifest {
            playback_interval: Some(5),
            ..Manifest::default()
        };
        assert!(ch.take_if_changed(m.clone()).is_some());
        assert!(ch.take_if_changed(m).is_none());
    }

    async fn fake_endpoint() -> String {
        async fn poll(
            headers: HeaderMap,
            Query(q): Query<HashMap<String, String>>,
            Json(body): Json<Value>,
        ) -> Result<Json<Value>, StatusCode> {
            let auth = headers.get("authorization").and_then(|v| v.to_str().ok());
            if auth != Some("Bearer secret-token") {
                return Err(StatusCode::UNAUTHORIZED);
            }
            assert_eq!(q.get("mac").map(String::as_str), Some("aa:bb:cc:dd:ee:ff"));
            assert!(q.contains_key("_t"));
            assert_eq!(body["status"], "stopped");
            assert!(body["system"].is_object());
            Ok(Json(json!({
                "commands": ["next", "next", {"type": "pause", "id": "p1"}],
                "manifest": {"play_lists": ["https://x/a.mp3"], "ads": false}
            })))
        }

        let app = Router::new()
            .route("/api/poll", post(poll))
            .route("/api/heartbeat", post(|| async { StatusCode::NO_CONTENT }))
            .route(
                "/api/manifest",
                get(|| async { Json(json!({"manifest": {"play_lists": ["https://x/b.mp3"]}})) }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/api")
    }

    #[tokio::test]
    async fn poll_cycle_forwards_commands_and_changed_manifests() {
        let base = fake_endpoint().await;
        let mut ch = channel(&base);
        let (tx, mut rx) = mpsc::channel(16);
        let (_snap_tx, snap_rx) = watch::channel(Arc::new(Snapshot::empty("aa:bb:cc:dd:ee:ff")));

        for _ in 0..2 {
            let reply = ch.poll_once("stopped").await.unwrap();
            assert!(ch.dispatch(reply, &tx, &snap_rx).await);
        }
        assert_eq!(ch.online, Some(true));
        ch.send_heartbeat("play_executed|playing_track").await.unwrap();

        let mut got = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            got.push(match msg {
                Inbound::Command(c) => c.kind.name().to_string(),
                Inbound::Manifest(m) => format!("manifest:{}", m.play_lists.len()),
            });
        }
        // Second poll: same manifest and the "p1" pause are suppressed; the
        // id-less nexts collapse to one per poll.
        assert_eq!(got, vec!["manifest:1", "next", "pause", "next"]);

        let m = ch.fetch_manifest().await.unwrap();
        assert_eq!(m.play_lists[0].url(), "https://x/b.mp3");
    }

    /// Endpoint that records what the poll loop sends it.
    #[derive(Default)]
    struct Recorder {
        polls: std::sync::atomic::AtomicUsize,
        /// Polls answered with 503 before the endpoint recovers.
        failing_polls: std::sync::atomic::AtomicUsize,
        heartbeats: std::sync::Mutex<Vec<String>>,
    }

    impl Recorder {
        fn polls(&self) -> usize {
            self.polls.load(std::sync::atomic::Ordering::SeqCst)
        }

        fn heartbeats(&self) -> Vec<String> {
            self.heartbeats.lock().unwrap().clone()
        }
    }

    async fn recording_endpoint(rec: Arc<Recorder>) -> String {
        use axum::extract::State;
        use std::sync::atomic::Ordering;

        async fn poll(State(rec): State<Arc<Recorder>>) -> Result<Json<Value>, StatusCode> {
            rec.polls.fetch_add(1, Ordering::SeqCst);
            if rec
                .failing_polls
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StatusCode::SERVICE_UNAVAILABLE);
            }
            Ok(Json(json!({"commands": [{"type": "play", "id": "c1"}]})))
        }

        async fn heartbeat(State(rec): State<Arc<Recorder>>, Json(body): Json<Value>) -> StatusCode {
            let status = body["status"].as_str().unwrap_or_default().to_string();
            rec.heartbeats.lock().unwrap().push(status);
            StatusCode::NO_CONTENT
        }

        let app = Router::new()
            .route("/api/poll", post(poll))
            .route("/api/heartbeat", post(heartbeat))
            .route(
                "/api/manifest",
                get(|| async { Json(json!({"manifest": {"play_lists": ["https://x/b.mp3"]}})) }),
            )
            .with_state(rec);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/api")
    }

    async fn wait_for(mut ready: impl FnMut() -> bool) {
        for _ in 0..200 {
            if ready() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2 s");
    }

    fn outcome(command: &str, mode: PlaybackMode) -> CommandOutcome {
        CommandOutcome {
            command: command.to_string(),
            disposition: Disposition::Executed,
            mode,
        }
    }

    #[tokio::test]
    async fn run_loop_reports_outcomes_refreshes_and_survives_failures() {
        let rec = Arc::new(Recorder::default());
        rec.failing_polls.store(2, std::sync::atomic::Ordering::SeqCst);
        let base = recording_endpoint(rec.clone()).await;
        let ch = channel(&base).with_poll_interval(Duration::from_millis(50));

        let (tx, mut rx) = mpsc::channel(16);
        let (_snap_tx, snap_rx) = watch::channel(Arc::new(Snapshot::empty("aa:bb:cc:dd:ee:ff")));
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let refresh = Arc::new(Notify::new());
        let token = CancellationToken::new();
        let run = tokio::spawn(ch.run(tx, snap_rx, out_rx, refresh.clone(), token.clone()));

        // Two failed polls, then the loop is still polling and delivers.
        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(first, Inbound::Command(c) if c.kind == CommandKind::Play));
        assert!(rec.polls() >= 3);

        // Reported without waiting for a poll tick.
        out_tx.send(outcome("play", PlaybackMode::PlayingTrack)).unwrap();
        wait_for(|| rec.heartbeats().contains(&"play_executed|playing_track".to_string())).await;

        refresh.notify_one();
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        match msg {
            Inbound::Manifest(m) => assert_eq!(m.play_lists[0].url(), "https://x/b.mp3"),
            Inbound::Command(c) => panic!("unexpected command {}", c.kind.name()),
        }

        // Queued right before shutdown: still reported.
        out_tx.send(outcome("pause", PlaybackMode::Paused)).unwrap();
        token.cancel();
        let ch = tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
        assert!(rec.heartbeats().contains(&"pause_executed|paused".to_string()));
        assert_eq!(ch.online, Some(true));
    }

    #[tokio::test]
    async fn run_loop_keeps_going_while_the_endpoint_is_unreachable() {
        let ch = channel("http://127.0.0.1:9").with_poll_interval(Duration::from_millis(20));
        let (tx, mut rx) = mpsc::channel(16);
        let (_snap_tx, snap_rx) = watch::channel(Arc::new(Snapshot::empty("aa:bb:cc:dd:ee:ff")));
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let refresh = Arc::new(Notify::new());
        let token = CancellationToken::new();
        let run = tokio::spawn(ch.run(tx, snap_rx, out_rx, refresh.clone(), token.clone()));

        out_tx.send(outcome("stop", PlaybackMode::Stopped)).unwrap();
        refresh.notify_one();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!run.is_finished());
        assert!(rx.try_recv().is_err());

        token.cancel();
        let ch = tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
        assert_eq!(ch.online, Some(false));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transient_error() {
        let mut ch = channel("http://127.0.0.1:9");
        let err = ch.poll_once("stopped").await.unwrap_err();
        assert!(matches!(err, AgentError::TransientNetwork(_)));
        assert_eq!(ch.online, Some(false));
        assert!(ch.send_heartbeat("stopped").await.is_err());
    }
}
