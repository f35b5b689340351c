//! Live session state machine tests.
//!
//! Fake connector, microphone and speaker drive `LiveSession` through its
//! lifecycle deterministically on a paused clock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use aura::audio::pcm::{encode_pcm16, samples_to_duration};
use aura::audio::{AudioFrame, CaptureBackend, CaptureStream, PlaybackSink};
use aura::error::{AuraError, Result};
use aura::live::protocol::ClientMessage;
use aura::live::{
    LiveConnector, LiveEvent, LiveOptions, LiveSession, LiveSessionState, LiveTransport,
    SessionSetup, Speaker,
};
use aura::retry::RetryPolicy;
use base64::Engine as _;
use serde_json::{Value, json};
use tokio::sync::mpsc;

// ────────────────────────────────────────────────────────────────────────────
// Fakes
// ────────────────────────────────────────────────────────────────────────────

struct FakeTransport {
    incoming: mpsc::UnboundedReceiver<Result<Vec<u8>>>,
    sent: Arc<Mutex<Vec<Value>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl LiveTransport for FakeTransport {
    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AuraError::SessionClosed("closed".into()));
        }
        let value = serde_json::to_value(message).expect("client message serializes");
        self.sent.lock().expect("lock").push(value);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Vec<u8>>> {
        self.incoming.recv().await
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeConnector {
    attempts: AtomicUsize,
    failures: Mutex<VecDeque<AuraError>>,
    transport: Mutex<Option<FakeTransport>>,
}

#[async_trait]
impl LiveConnector for FakeConnector {
    async fn connect(&self) -> Result<Box<dyn LiveTransport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.failures.lock().expect("lock").pop_front() {
            return Err(e);
        }
        match self.transport.lock().expect("lock").take() {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(AuraError::PermanentRemote("no more connections".into())),
        }
    }
}

#[derive(Default)]
struct FakeCapture {
    deny: bool,
    frames: Mutex<Option<mpsc::Sender<AudioFrame>>>,
    stopped: Arc<AtomicBool>,
}

impl FakeCapture {
    fn speak(&self, samples: usize) {
        let frame = AudioFrame::from_samples(&vec![0.25; samples], 16_000);
        if let Some(tx) = self.frames.lock().expect("lock").as_ref() {
            tx.try_send(frame).expect("frame queued");
        }
    }
}

struct FakeCaptureStream {
    stopped: Arc<AtomicBool>,
}

impl CaptureStream for FakeCaptureStream {
    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

impl CaptureBackend for FakeCapture {
    fn open(&self, frames: mpsc::Sender<AudioFrame>) -> Result<Box<dyn CaptureStream>> {
        if self.deny {
            return Err(AuraError::DeviceAccess("microphone permission denied".into()));
        }
        *self.frames.lock().expect("lock") = Some(frames);
        Ok(Box::new(FakeCaptureStream {
            stopped: Arc::clone(&self.stopped),
        }))
    }
}

#[derive(Debug, Default)]
struct SinkLog {
    now: Duration,
    scheduled: Vec<(Duration, usize)>,
    stops: usize,
}

struct FakeSink(Arc<Mutex<SinkLog>>);

impl PlaybackSink for FakeSink {
    fn current_time(&self) -> Duration {
        self.0.lock().expect("lock").now
    }

    fn schedule(&mut self, start: Duration, samples: Vec<f32>) -> Result<()> {
        self.0
            .lock()
            .expect("lock")
            .scheduled
            .push((start, samples.len()));
        Ok(())
    }

    fn stop_all(&mut self) {
        self.0.lock().expect("lock").stops += 1;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Harness
// ────────────────────────────────────────────────────────────────────────────

struct Harness {
    session: LiveSession,
    events: mpsc::UnboundedReceiver<LiveEvent>,
    connector: Arc<FakeConnector>,
    capture: Arc<FakeCapture>,
    sink: Arc<Mutex<SinkLog>>,
    server: Option<mpsc::UnboundedSender<Result<Vec<u8>>>>,
    sent: Arc<Mutex<Vec<Value>>>,
    closed: Arc<AtomicBool>,
}

struct Scenario {
    deny_microphone: bool,
    connect_failures: Vec<AuraError>,
    policy: RetryPolicy,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            deny_microphone: false,
            connect_failures: Vec::new(),
            policy: RetryPolicy::new()
                .with_max_attempts(3)
                .with_initial_delay(Duration::from_millis(100)),
        }
    }
}

fn harness(scenario: Scenario) -> Harness {
    let (server_tx, incoming) = mpsc::unbounded_channel();
    let sent = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(AtomicBool::new(false));
    let connector = Arc::new(FakeConnector {
        attempts: AtomicUsize::new(0),
        failures: Mutex::new(scenario.connect_failures.into()),
        transport: Mutex::new(Some(FakeTransport {
            incoming,
            sent: Arc::clone(&sent),
            closed: Arc::clone(&closed),
        })),
    });
    let capture = Arc::new(FakeCapture {
        deny: scenario.deny_microphone,
        ..FakeCapture::default()
    });
    let sink = Arc::new(Mutex::new(SinkLog::default()));

    let setup = SessionSetup {
        model: "test-live".into(),
        voice_name: "Puck".into(),
        system_instruction: None,
    };
    let (session, events) = LiveSession::new(
        Arc::clone(&connector) as Arc<dyn LiveConnector>,
        Arc::clone(&capture) as Arc<dyn CaptureBackend>,
        Box::new(FakeSink(Arc::clone(&sink))),
        LiveOptions::new(setup).with_connect_policy(scenario.policy),
    );

    Harness {
        session,
        events,
        connector,
        capture,
        sink,
        server: Some(server_tx),
        sent,
        closed,
    }
}

impl Harness {
    fn push(&self, message: Value) {
        self.push_raw(message.to_string().into_bytes());
    }

    fn push_raw(&self, payload: Vec<u8>) {
        if let Some(server) = &self.server {
            server.send(Ok(payload)).expect("driver alive");
        }
    }

    async fn next_event(&mut self) -> LiveEvent {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("event before timeout")
            .expect("event channel open")
    }

    fn sent(&self) -> Vec<Value> {
        self.sent.lock().expect("lock").clone()
    }

    fn pending_events(&mut self) -> Vec<LiveEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    async fn open(&mut self) {
        self.session.start().await.expect("session starts");
        assert_eq!(
            self.next_event().await,
            LiveEvent::StateChanged(LiveSessionState::Connecting)
        );
        self.push(json!({"setupComplete": {}}));
        assert_eq!(
            self.next_event().await,
            LiveEvent::StateChanged(LiveSessionState::Open)
        );
    }
}

/// Let the driver drain everything it can; the paused clock only advances
/// once every task is idle.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn audio_message(chunks: &[usize]) -> Value {
    let parts: Vec<Value> = chunks
        .iter()
        .map(|&samples| {
            let pcm = encode_pcm16(&vec![0.1; samples]);
            json!({"inlineData": {
                "mimeType": "audio/pcm;rate=24000",
                "data": base64::engine::general_purpose::STANDARD.encode(pcm),
            }})
        })
        .collect();
    json!({"serverContent": {"modelTurn": {"parts": parts}}})
}

fn transcription(speaker: Speaker, text: &str, is_final: bool) -> LiveEvent {
    LiveEvent::Transcription {
        speaker,
        text: text.into(),
        is_final,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Lifecycle
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn setup_is_the_first_message_and_opens_the_session() {
    let mut h = harness(Scenario::default());
    h.open().await;

    let sent = h.sent();
    assert_eq!(sent[0]["setup"]["model"], "models/test-live");
    assert_eq!(h.session.state(), LiveSessionState::Open);
    assert_eq!(h.connector.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn frames_before_open_are_dropped() {
    let mut h = harness(Scenario::default());
    h.session.start().await.expect("session starts");
    h.capture.speak(4096);
    settle().await;
    assert_eq!(h.sent().len(), 1, "only the setup message");

    h.push(json!({"setupComplete": {}}));
    settle().await;
    h.capture.speak(4096);
    settle().await;

    let sent = h.sent();
    assert_eq!(sent.len(), 2);
    let chunk = &sent[1]["realtimeInput"]["mediaChunks"][0];
    assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
    let data = base64::engine::general_purpose::STANDARD
        .decode(chunk["data"].as_str().expect("data string"))
        .expect("base64");
    assert_eq!(data.len(), 4096 * 2);
}

#[tokio::test(start_paused = true)]
async fn stop_releases_everything_and_closes_once() {
    let mut h = harness(Scenario::default());
    h.open().await;

    h.session.stop().await;
    assert_eq!(
        h.pending_events(),
        vec![
            LiveEvent::StateChanged(LiveSessionState::Closing),
            LiveEvent::StateChanged(LiveSessionState::Closed),
            LiveEvent::Closed { reason: None },
        ]
    );
    assert!(h.capture.stopped.load(Ordering::SeqCst));
    assert!(h.closed.load(Ordering::SeqCst));
    assert!(h.sink.lock().expect("lock").stops >= 1);

    h.session.stop().await;
    assert!(h.pending_events().is_empty());
    assert_eq!(h.session.state(), LiveSessionState::Closed);
    assert!(matches!(
        h.session.start().await,
        Err(AuraError::SessionClosed(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn server_messages_queued_behind_stop_are_not_handled() {
    let mut h = harness(Scenario::default());
    h.open().await;

    h.push(json!({"toolCall": {"functionCalls": [
        {"id": "call-9", "name": "play_track", "args": {"query": "blue in green"}}
    ]}}));
    h.push(audio_message(&[2400]));
    h.session.stop().await;
    settle().await;

    assert_eq!(
        h.pending_events(),
        vec![
            LiveEvent::StateChanged(LiveSessionState::Closing),
            LiveEvent::StateChanged(LiveSessionState::Closed),
            LiveEvent::Closed { reason: None },
        ]
    );
    let sent = h.sent();
    assert_eq!(sent.len(), 1, "only the setup message");
    assert!(sent.iter().all(|m| m.get("toolResponse").is_none()));
    assert!(h.sink.lock().expect("lock").scheduled.is_empty());
}

#[tokio::test(start_paused = true)]
async fn dropping_the_session_releases_the_microphone() {
    let h = harness(Scenario::default());
    let Harness {
        mut session,
        capture,
        closed,
        server: _server,
        ..
    } = h;
    session.start().await.expect("session starts");
    drop(session);
    settle().await;
    assert!(capture.stopped.load(Ordering::SeqCst));
    assert!(closed.load(Ordering::SeqCst));
}

// ────────────────────────────────────────────────────────────────────────────
// Start failures
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn denied_microphone_never_touches_the_network() {
    let mut h = harness(Scenario {
        deny_microphone: true,
        ..Scenario::default()
    });
    let err = h.session.start().await.expect_err("start fails");
    assert!(err.is_device_error());
    assert_eq!(h.connector.attempts.load(Ordering::SeqCst), 0);

    let events = h.pending_events();
    assert_eq!(
        events[0],
        LiveEvent::StateChanged(LiveSessionState::Connecting)
    );
    assert!(matches!(events[1], LiveEvent::Error(_)));
    assert_eq!(
        events[2],
        LiveEvent::StateChanged(LiveSessionState::Closed)
    );
    assert!(matches!(events[3], LiveEvent::Closed { reason: Some(_) }));
    assert_eq!(events.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn transient_connect_failures_are_retried() {
    let mut h = harness(Scenario {
        connect_failures: vec![
            AuraError::TransientRemote("HTTP 503".into()),
            AuraError::TransientRemote("HTTP 429".into()),
        ],
        ..Scenario::default()
    });
    h.open().await;
    assert_eq!(h.connector.attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn connect_failure_releases_the_microphone() {
    let mut h = harness(Scenario {
        connect_failures: vec![AuraError::PermanentRemote("HTTP 403".into())],
        ..Scenario::default()
    });
    assert!(matches!(
        h.session.start().await,
        Err(AuraError::PermanentRemote(_))
    ));
    assert_eq!(h.connector.attempts.load(Ordering::SeqCst), 1);
    assert!(h.capture.stopped.load(Ordering::SeqCst));
    assert_eq!(h.session.state(), LiveSessionState::Closed);
    assert!(
        h.pending_events()
            .iter()
            .any(|e| matches!(e, LiveEvent::Closed { .. }))
    );
}

#[tokio::test(start_paused = true)]
async fn cancel_during_backoff_stops_connecting() {
    let mut h = harness(Scenario {
        connect_failures: (0..5)
            .map(|_| AuraError::TransientRemote("HTTP 503".into()))
            .collect(),
        policy: RetryPolicy::new()
            .with_max_attempts(5)
            .with_initial_delay(Duration::from_secs(10)),
        ..Scenario::default()
    });
    let cancel = h.session.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
    });

    assert!(matches!(
        h.session.start().await,
        Err(AuraError::SessionClosed(_))
    ));
    assert_eq!(h.connector.attempts.load(Ordering::SeqCst), 1);
    assert!(h.capture.stopped.load(Ordering::SeqCst));
    assert_eq!(h.session.state(), LiveSessionState::Closed);
}

// ────────────────────────────────────────────────────────────────────────────
// Server events
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn model_audio_is_scheduled_back_to_back() {
    let mut h = harness(Scenario::default());
    h.open().await;

    // 2400 samples at 24 kHz = 100 ms each
    h.push(audio_message(&[2400, 2400]));
    h.push(audio_message(&[1200]));
    settle().await;

    let log = h.sink.lock().expect("lock");
    assert_eq!(
        log.scheduled,
        vec![
            (Duration::ZERO, 2400),
            (Duration::from_millis(100), 2400),
            (Duration::from_millis(200), 1200),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn odd_length_model_audio_stays_sample_aligned() {
    let mut h = harness(Scenario::default());
    h.open().await;

    // 1001 samples is not a whole number of milliseconds at 24 kHz
    h.push(audio_message(&[1001, 1001]));
    h.push(audio_message(&[7]));
    settle().await;

    let at = |samples| samples_to_duration(samples, 24_000);
    let log = h.sink.lock().expect("lock");
    assert_eq!(
        log.scheduled,
        vec![(at(0), 1001), (at(1001), 1001), (at(2002), 7)]
    );
}

#[tokio::test(start_paused = true)]
async fn interruption_drops_queued_audio() {
    let mut h = harness(Scenario::default());
    h.open().await;

    h.push(audio_message(&[2400, 2400]));
    h.push(json!({"serverContent": {"interrupted": true}}));
    h.push(audio_message(&[2400]));
    settle().await;

    let log = h.sink.lock().expect("lock");
    assert_eq!(log.stops, 1);
    assert_eq!(log.scheduled.last(), Some(&(Duration::ZERO, 2400)));
}

#[tokio::test(start_paused = true)]
async fn transcripts_accumulate_then_finalize_on_turn_complete() {
    let mut h = harness(Scenario::default());
    h.open().await;

    h.push(json!({"serverContent": {"inputTranscription": {"text": "play some"}}}));
    h.push(json!({"serverContent": {"inputTranscription": {"text": " jazz"}}}));
    h.push(json!({"serverContent": {
        "outputTranscription": {"text": "Sure."},
        "turnComplete": true
    }}));
    settle().await;

    assert_eq!(
        h.pending_events(),
        vec![
            transcription(Speaker::User, "play some", false),
            transcription(Speaker::User, "play some jazz", false),
            transcription(Speaker::Model, "Sure.", false),
            transcription(Speaker::User, "play some jazz", true),
            transcription(Speaker::Model, "Sure.", true),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn tool_calls_are_surfaced_and_acknowledged() {
    let mut h = harness(Scenario::default());
    h.open().await;

    h.push(json!({"toolCall": {"functionCalls": [
        {"id": "call-1", "name": "play_track", "args": {"query": "so what", "artist": "Miles Davis"}}
    ]}}));
    assert_eq!(
        h.next_event().await,
        LiveEvent::ToolCall {
            id: "call-1".into(),
            name: "play_track".into(),
            args: json!({"query": "so what", "artist": "Miles Davis"}),
        }
    );
    settle().await;

    let sent = h.sent();
    let ack = &sent.last().expect("ack sent")["toolResponse"]["functionResponses"][0];
    assert_eq!(ack["id"], "call-1");
    assert_eq!(ack["name"], "play_track");
    assert_eq!(ack["response"]["result"], "ok");
}

#[tokio::test(start_paused = true)]
async fn malformed_server_message_is_ignored() {
    let mut h = harness(Scenario::default());
    h.session.start().await.expect("session starts");
    h.push_raw(b"not json".to_vec());
    h.push(json!({"setupComplete": {}}));
    settle().await;

    assert_eq!(h.session.state(), LiveSessionState::Open);
    assert!(
        !h.pending_events()
            .iter()
            .any(|e| matches!(e, LiveEvent::Error(_)))
    );
}

#[tokio::test(start_paused = true)]
async fn server_hangup_closes_with_error() {
    let mut h = harness(Scenario::default());
    h.open().await;

    h.server = None;
    settle().await;

    let events = h.pending_events();
    assert!(matches!(events[0], LiveEvent::Error(_)));
    assert_eq!(
        events[1],
        LiveEvent::StateChanged(LiveSessionState::Closed)
    );
    assert!(matches!(events[2], LiveEvent::Closed { reason: Some(_) }));
    assert!(h.capture.stopped.load(Ordering::SeqCst));
    assert!(h.closed.load(Ordering::SeqCst));

    h.session.stop().await;
    assert!(h.pending_events().is_empty());
}
