//! Live voice session controller.
//!
//! ```text
//! Idle ─start()─▶ Connecting ─setupComplete─▶ Open ─stop()─▶ Closing ─▶ Closed
//!                      │                        │
//!                      └──────── error ─────────┴──────────────────────▶ Closed
//! ```
//!
//! [`LiveSession::start`] acquires the microphone, opens the channel under
//! the retry policy and hands everything to a driver task. The driver owns
//! all session state (transport, capture handle, playback schedule,
//! transcripts) and is the only place it is mutated. [`LiveSession::stop`]
//! returns once the device is released and the channel is closed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::protocol::{self, ServerEvent, SessionSetup};
use super::transcript::{Speaker, TranscriptBuffer};
use super::transport::{LiveConnector, LiveTransport};
use crate::audio::pcm::OUTPUT_SAMPLE_RATE;
use crate::audio::{AudioFrame, CaptureBackend, CaptureStream, PlaybackScheduler, PlaybackSink};
use crate::error::{AuraError, Result};
use crate::retry::{self, RetryPolicy};

/// Captured frames buffered between the device thread and the driver.
const FRAME_CHANNEL_CAPACITY: usize = 32;

/// Lifecycle of a voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveSessionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl LiveSessionState {
    pub fn is_terminal(self) -> bool {
        self == Self::Closed
    }
}

/// Event delivered to the session owner, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    StateChanged(LiveSessionState),
    /// Transcript update. Non-final updates carry the text accumulated so far
    /// in the current turn; the final update carries the whole turn.
    Transcription {
        speaker: Speaker,
        text: String,
        is_final: bool,
    },
    /// The model invoked a tool. It has already been acknowledged.
    ToolCall {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    Error(String),
    /// Emitted exactly once per session.
    Closed { reason: Option<String> },
}

/// Static parameters of a session.
#[derive(Debug, Clone)]
pub struct LiveOptions {
    pub setup: SessionSetup,
    /// Applied to opening the channel.
    pub connect_policy: RetryPolicy,
    pub output_sample_rate: u32,
}

impl LiveOptions {
    pub fn new(setup: SessionSetup) -> Self {
        Self {
            setup,
            connect_policy: RetryPolicy::new(),
            output_sample_rate: OUTPUT_SAMPLE_RATE,
        }
    }

    pub fn with_connect_policy(mut self, policy: RetryPolicy) -> Self {
        self.connect_policy = policy;
        self
    }
}

/// State and event fan-out shared by the session handle and its driver.
#[derive(Clone)]
struct Notifier {
    state: Arc<watch::Sender<LiveSessionState>>,
    events: mpsc::UnboundedSender<LiveEvent>,
    closed: Arc<AtomicBool>,
}

impl Notifier {
    fn state(&self) -> LiveSessionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: LiveSessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = ?previous, to = ?next, "live session state");
            self.emit(LiveEvent::StateChanged(next));
        }
    }

    fn emit(&self, event: LiveEvent) {
        if self.events.send(event).is_err() {
            trace!("live event receiver dropped");
        }
    }

    /// Enter `Closed` and emit the close event, once.
    fn close(&self, reason: Option<String>) {
        self.set_state(LiveSessionState::Closed);
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.emit(LiveEvent::Closed { reason });
        }
    }

    /// Surface `error` and go straight to `Closed`.
    fn fail(&self, error: &AuraError) {
        warn!(error = %error, "live session failed");
        self.emit(LiveEvent::Error(error.to_string()));
        self.close(Some(error.to_string()));
    }
}

enum Command {
    Stop(oneshot::Sender<()>),
}

/// One voice session. Owns the device and channel handles for its lifetime.
pub struct LiveSession {
    connector: Arc<dyn LiveConnector>,
    capture: Arc<dyn CaptureBackend>,
    playback: Option<Box<dyn PlaybackSink>>,
    options: LiveOptions,
    notifier: Notifier,
    cancel: CancellationToken,
    commands: Option<mpsc::Sender<Command>>,
    driver: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for LiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSession")
            .field("state", &self.state())
            .field("setup", &self.options.setup)
            .finish_non_exhaustive()
    }
}

impl LiveSession {
    /// Create an idle session and the receiver for its events.
    pub fn new(
        connector: Arc<dyn LiveConnector>,
        capture: Arc<dyn CaptureBackend>,
        playback: Box<dyn PlaybackSink>,
        options: LiveOptions,
    ) -> (Self, mpsc::UnboundedReceiver<LiveEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(LiveSessionState::Idle);
        let session = Self {
            connector,
            capture,
            playback: Some(playback),
            options,
            notifier: Notifier {
                state: Arc::new(state),
                events,
                closed: Arc::new(AtomicBool::new(false)),
            },
            cancel: CancellationToken::new(),
            commands: None,
            driver: None,
        };
        (session, events_rx)
    }

    pub fn state(&self) -> LiveSessionState {
        self.notifier.state()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<LiveSessionState> {
        self.notifier.state.subscribe()
    }

    /// Token that tears the session down when cancelled, usable from other
    /// tasks (e.g. while `start` is still retrying the connection).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Acquire the microphone, open the channel and send the setup.
    ///
    /// Returns once the driver is running; `Open` follows when the service
    /// confirms the setup.
    ///
    /// # Errors
    ///
    /// - [`AuraError::DeviceAccess`] if the microphone cannot be acquired
    ///   (the network is not touched in that case).
    /// - The connection error after retries, or [`AuraError::SessionClosed`]
    ///   if the session was cancelled meanwhile or already used.
    ///
    /// Every failure leaves the session `Closed` with nothing held.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != LiveSessionState::Idle {
            return Err(AuraError::SessionClosed(format!(
                "cannot start a session in state {:?}",
                self.state()
            )));
        }
        let Some(playback) = self.playback.take() else {
            return Err(AuraError::SessionClosed("session already started".into()));
        };
        self.notifier.set_state(LiveSessionState::Connecting);

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let mut capture = match self.capture.open(frame_tx) {
            Ok(capture) => capture,
            Err(e) => {
                self.notifier.fail(&e);
                return Err(e);
            }
        };
        info!("microphone acquired");

        let connector = &self.connector;
        let connected =
            retry::execute_cancellable(&self.options.connect_policy, &self.cancel, || {
                connector.connect()
            })
            .await;
        let mut transport = match connected {
            Ok(transport) => transport,
            Err(e) => {
                capture.stop();
                self.notifier.fail(&e);
                return Err(e);
            }
        };

        if self.cancel.is_cancelled() {
            capture.stop();
            close_transport(transport.as_mut()).await;
            self.notifier.close(Some("cancelled while connecting".into()));
            return Err(AuraError::SessionClosed("cancelled while connecting".into()));
        }

        if let Err(e) = transport.send(&self.options.setup.to_message()).await {
            capture.stop();
            close_transport(transport.as_mut()).await;
            self.notifier.fail(&e);
            return Err(e);
        }
        debug!("setup sent");

        let (commands, command_rx) = mpsc::channel(4);
        let driver = Driver {
            transport,
            capture,
            frames: frame_rx,
            playback: PlaybackScheduler::new(playback, self.options.output_sample_rate),
            transcripts: TranscriptBuffer::new(),
            notifier: self.notifier.clone(),
            commands: command_rx,
            cancel: self.cancel.clone(),
        };
        self.commands = Some(commands);
        self.driver = Some(tokio::spawn(driver.run()));
        Ok(())
    }

    /// Stop the session: release the microphone, stop playback, close the
    /// channel. Idempotent; the `Closed` event is emitted exactly once.
    pub async fn stop(&mut self) {
        match self.state() {
            LiveSessionState::Idle => {
                self.cancel.cancel();
                self.playback = None;
                self.notifier.close(None);
                return;
            }
            LiveSessionState::Closed if self.driver.is_none() => return,
            _ => {}
        }

        if let Some(commands) = self.commands.take() {
            let (ack_tx, ack_rx) = oneshot::channel();
            if commands.send(Command::Stop(ack_tx)).await.is_ok() {
                // Err means the driver already exited on its own
                let _ = ack_rx.await;
            }
        }
        self.cancel.cancel();
        if let Some(driver) = self.driver.take()
            && let Err(e) = driver.await
        {
            warn!("live session driver panicked: {e}");
            self.notifier.close(Some("driver panicked".into()));
        }
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        // The driver shuts down on its own when cancelled.
        self.cancel.cancel();
    }
}

/// Owns every piece of mutable session state once the channel is up.
struct Driver {
    transport: Box<dyn LiveTransport>,
    capture: Box<dyn CaptureStream>,
    frames: mpsc::Receiver<AudioFrame>,
    playback: PlaybackScheduler<Box<dyn PlaybackSink>>,
    transcripts: TranscriptBuffer,
    notifier: Notifier,
    commands: mpsc::Receiver<Command>,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                // Stop commands win over queued server messages and frames
                biased;

                command = self.commands.recv() => {
                    let ack = match command {
                        Some(Command::Stop(ack)) => Some(ack),
                        None => None,
                    };
                    self.shutdown(None).await;
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    return;
                }
                () = self.cancel.cancelled() => {
                    self.shutdown(Some("cancelled".into())).await;
                    return;
                }
                incoming = self.transport.recv() => {
                    let result = match incoming {
                        Some(Ok(payload)) => self.handle_payload(&payload).await,
                        Some(Err(e)) => Err(e),
                        None => Err(AuraError::SessionClosed(
                            "live channel closed by the service".into(),
                        )),
                    };
                    if let Err(e) = result {
                        self.abort(&e).await;
                        return;
                    }
                }
                Some(frame) = self.frames.recv() => {
                    if let Err(e) = self.send_frame(&frame).await {
                        self.abort(&e).await;
                        return;
                    }
                }
            }
        }
    }

    async fn send_frame(&mut self, frame: &AudioFrame) -> Result<()> {
        if self.notifier.state() != LiveSessionState::Open {
            trace!("dropping captured frame, session not open");
            return Ok(());
        }
        self.transport.send(&protocol::audio_message(frame)).await
    }

    async fn handle_payload(&mut self, payload: &[u8]) -> Result<()> {
        let events = match protocol::parse_server_message(payload) {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "ignoring server message");
                return Ok(());
            }
        };

        for event in events {
            self.dispatch(event).await?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, event: ServerEvent) -> Result<()> {
        match event {
            ServerEvent::SetupComplete => {
                if self.notifier.state() == LiveSessionState::Connecting {
                    self.notifier.set_state(LiveSessionState::Open);
                }
            }
            ServerEvent::Interrupted => {
                debug!("model interrupted, dropping queued audio");
                self.playback.stop_all();
            }
            ServerEvent::Audio(pcm) => {
                if let Err(e) = self.playback.play(&pcm) {
                    warn!(error = %e, "cannot schedule model audio");
                }
            }
            ServerEvent::InputTranscript(delta) => self.transcribe(Speaker::User, &delta),
            ServerEvent::OutputTranscript(delta) => self.transcribe(Speaker::Model, &delta),
            ServerEvent::TurnComplete => {
                for (speaker, text) in self.transcripts.flush() {
                    self.notifier.emit(LiveEvent::Transcription {
                        speaker,
                        text,
                        is_final: true,
                    });
                }
            }
            ServerEvent::ToolCalls(calls) => {
                for call in &calls {
                    info!(id = %call.id, name = %call.name, "tool call");
                    self.notifier.emit(LiveEvent::ToolCall {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        args: call.args.clone(),
                    });
                }
                self.transport.send(&protocol::tool_ack(&calls)).await?;
            }
            ServerEvent::GoAway(time_left) => {
                warn!(?time_left, "service will close the live channel soon");
            }
        }
        Ok(())
    }

    fn transcribe(&mut self, speaker: Speaker, delta: &str) {
        let text = self.transcripts.append(speaker, delta).to_owned();
        self.notifier.emit(LiveEvent::Transcription {
            speaker,
            text,
            is_final: false,
        });
    }

    fn release_audio(&mut self) {
        self.capture.stop();
        self.frames.close();
        self.playback.stop_all();
        info!("microphone released");
    }

    /// Orderly stop: Closing → release → close channel → Closed.
    async fn shutdown(&mut self, reason: Option<String>) {
        self.notifier.set_state(LiveSessionState::Closing);
        self.release_audio();
        close_transport(self.transport.as_mut()).await;
        self.notifier.close(reason);
    }

    /// Unrecoverable error: straight to Closed.
    async fn abort(&mut self, error: &AuraError) {
        self.release_audio();
        close_transport(self.transport.as_mut()).await;
        self.notifier.fail(error);
    }
}

async fn close_transport(transport: &mut dyn LiveTransport) {
    if let Err(e) = transport.close().await {
        debug!(error = %e, "error closing live channel");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_closed_is_terminal() {
        assert!(LiveSessionState::Closed.is_terminal());
        assert!(!LiveSessionState::Closing.is_terminal());
        assert!(!LiveSessionState::Idle.is_terminal());
    }

    #[test]
    fn notifier_emits_closed_once() {
        let (events, mut rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(LiveSessionState::Open);
        let notifier = Notifier {
            state: Arc::new(state),
            events,
            closed: Arc::new(AtomicBool::new(false)),
        };

        notifier.close(None);
        notifier.fail(&AuraError::Protocol("late".into()));

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                LiveEvent::StateChanged(LiveSessionState::Closed),
                LiveEvent::Closed { reason: None },
                LiveEvent::Error("[PROTOCOL] late".into()),
            ]
        );
        assert_eq!(notifier.state(), LiveSessionState::Closed);
    }

    #[tokio::test]
    async fn stopping_idle_session_closes_it() {
        struct NoConnector;
        #[async_trait::async_trait]
        impl LiveConnector for NoConnector {
            async fn connect(&self) -> Result<Box<dyn LiveTransport>> {
                unreachable!("never connected")
            }
        }
        struct NoCapture;
        impl CaptureBackend for NoCapture {
            fn open(&self, _frames: mpsc::Sender<AudioFrame>) -> Result<Box<dyn CaptureStream>> {
                unreachable!("never opened")
            }
        }
        struct NoSink;
        impl PlaybackSink for NoSink {
            fn current_time(&self) -> std::time::Duration {
                std::time::Duration::ZERO
            }
            fn schedule(&mut self, _start: std::time::Duration, _samples: Vec<f32>) -> Result<()> {
                Ok(())
            }
            fn stop_all(&mut self) {}
        }

        let setup = SessionSetup {
            model: "m".into(),
            voice_name: "v".into(),
            system_instruction: None,
        };
        let (mut session, mut rx) = LiveSession::new(
            Arc::new(NoConnector),
            Arc::new(NoCapture),
            Box::new(NoSink),
            LiveOptions::new(setup),
        );
        session.stop().await;
        session.stop().await;
        assert_eq!(session.state(), LiveSessionState::Closed);

        let mut closed = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, LiveEvent::Closed { .. }) {
                closed += 1;
            }
        }
        assert_eq!(closed, 1);
        assert!(matches!(
            session.start().await,
            Err(AuraError::SessionClosed(_))
        ));
    }
}
