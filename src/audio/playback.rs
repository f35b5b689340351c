//! Gapless scheduled playback of inbound PCM.
//!
//! [`PlaybackScheduler`] owns the schedule: a monotonic "next start" cursor
//! and the buffers currently in flight. It places each decoded buffer at
//! `max(now, previous end)` on a [`PlaybackSink`]'s clock, so arrival order
//! alone decides playback order. [`CpalPlayback`] is the speaker sink.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{debug, error, info, trace, warn};

use super::pcm::{decode_pcm16, duration_to_samples, samples_to_duration};
use crate::config::AudioConfig;
use crate::error::{AuraError, Result};

/// An output device with its own monotonic clock.
pub trait PlaybackSink: Send {
    /// Current position of the output clock.
    fn current_time(&self) -> Duration;

    /// Play `samples` (mono, at the scheduler's rate) starting at `start`.
    ///
    /// # Errors
    ///
    /// Returns an error when the device has gone away.
    fn schedule(&mut self, start: Duration, samples: Vec<f32>) -> Result<()>;

    /// Silence everything scheduled or playing.
    fn stop_all(&mut self);
}

/// One buffer placed on the output timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledBuffer {
    pub start: Duration,
    pub end: Duration,
}

impl ScheduledBuffer {
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

/// Orders inbound audio frames back to back on a sink.
///
/// The cursor is kept in whole samples so consecutive buffers abut exactly
/// whatever their length; durations are derived from it, never summed.
#[derive(Debug)]
pub struct PlaybackScheduler<S> {
    sink: S,
    sample_rate: u32,
    /// Sample index where the next buffer starts.
    cursor: u64,
    in_flight: VecDeque<ScheduledBuffer>,
}

impl<S: PlaybackSink> PlaybackScheduler<S> {
    pub fn new(sink: S, sample_rate: u32) -> Self {
        Self {
            sink,
            sample_rate,
            cursor: 0,
            in_flight: VecDeque::new(),
        }
    }

    /// Decode a 16-bit PCM frame and queue it after everything already
    /// scheduled. Returns `None` for an empty frame.
    ///
    /// # Errors
    ///
    /// Propagates sink failures; the cursor is unchanged in that case.
    pub fn play(&mut self, frame: &[u8]) -> Result<Option<ScheduledBuffer>> {
        let samples = decode_pcm16(frame);
        if samples.is_empty() {
            trace!("empty playback frame ignored");
            return Ok(None);
        }

        let now = self.sink.current_time();
        self.prune(now);

        let start_sample = duration_to_samples(now, self.sample_rate).max(self.cursor);
        let end_sample = start_sample + samples.len() as u64;
        let buffer = ScheduledBuffer {
            start: self.at(start_sample),
            end: self.at(end_sample),
        };
        self.sink.schedule(buffer.start, samples)?;
        self.cursor = end_sample;
        self.in_flight.push_back(buffer);
        trace!(
            start = ?buffer.start,
            end = ?buffer.end,
            in_flight = self.in_flight.len(),
            "frame scheduled"
        );
        Ok(Some(buffer))
    }

    /// Halt all audio, forget the in-flight set and reset the cursor to zero.
    pub fn stop_all(&mut self) {
        self.sink.stop_all();
        let dropped = self.in_flight.len();
        self.in_flight.clear();
        self.cursor = 0;
        debug!(dropped, "playback stopped");
    }

    /// End of the last scheduled buffer (zero after a stop).
    pub fn next_start(&self) -> Duration {
        self.at(self.cursor)
    }

    /// Buffers scheduled and not yet finished as of the last `play`.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn at(&self, sample: u64) -> Duration {
        samples_to_duration(usize::try_from(sample).unwrap_or(usize::MAX), self.sample_rate)
    }

    fn prune(&mut self, now: Duration) {
        while self.in_flight.front().is_some_and(|b| b.end <= now) {
            self.in_flight.pop_front();
        }
    }
}

impl<S: PlaybackSink + ?Sized> PlaybackSink for Box<S> {
    fn current_time(&self) -> Duration {
        (**self).current_time()
    }

    fn schedule(&mut self, start: Duration, samples: Vec<f32>) -> Result<()> {
        (**self).schedule(start, samples)
    }

    fn stop_all(&mut self) {
        (**self).stop_all();
    }
}

// ── cpal sink ──

/// A buffer waiting for, or in the middle of, playback.
struct Voice {
    start_sample: u64,
    samples: Vec<f32>,
}

/// Sample-accurate output timeline shared with the audio callback.
#[derive(Default)]
struct Timeline {
    /// Samples rendered since the stream started.
    position: u64,
    voices: Vec<Voice>,
}

impl Timeline {
    fn render(&mut self, out: &mut [f32], channels: usize) {
        for frame in out.chunks_mut(channels) {
            let pos = self.position;
            let mut mixed = 0.0f32;
            for voice in &self.voices {
                if let Some(offset) = pos.checked_sub(voice.start_sample)
                    && let Some(sample) = usize::try_from(offset)
                        .ok()
                        .and_then(|i| voice.samples.get(i))
                {
                    mixed += sample;
                }
            }
            frame.fill(mixed.clamp(-1.0, 1.0));
            self.position += 1;
        }
        let position = self.position;
        self.voices
            .retain(|v| v.start_sample + v.samples.len() as u64 > position);
    }

    fn now(&self, sample_rate: u32) -> Duration {
        samples_to_duration(usize::try_from(self.position).unwrap_or(usize::MAX), sample_rate)
    }

    /// Queue `samples` at the sample nearest to `start`.
    fn add_voice(&mut self, start: Duration, sample_rate: u32, samples: Vec<f32>) {
        self.voices.push(Voice {
            start_sample: duration_to_samples(start, sample_rate),
            samples,
        });
    }
}

/// Speaker output via cpal, driven by a sample-position clock.
pub struct CpalPlayback {
    timeline: Arc<Mutex<Timeline>>,
    sample_rate: u32,
    stop_tx: Option<crossbeam_channel::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for CpalPlayback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpalPlayback")
            .field("sample_rate", &self.sample_rate)
            .finish_non_exhaustive()
    }
}

impl CpalPlayback {
    /// Open the output device and start an always-running stream.
    ///
    /// # Errors
    ///
    /// [`AuraError::DeviceAccess`] if no output device can be opened.
    pub fn open(config: &AudioConfig) -> Result<Self> {
        let timeline = Arc::new(Mutex::new(Timeline::default()));
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

        let device_name = config.output_device.clone();
        let sample_rate = config.output_sample_rate;
        let thread_timeline = Arc::clone(&timeline);
        let thread = std::thread::Builder::new()
            .name("aura-playback".into())
            .spawn(move || {
                match start_output(device_name.as_deref(), sample_rate, thread_timeline) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        let _ = stop_rx.recv();
                        drop(stream);
                        info!("audio playback stopped");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| AuraError::DeviceAccess(format!("cannot spawn playback thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                timeline,
                sample_rate,
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AuraError::DeviceAccess(
                    "playback thread exited before the device started".into(),
                ))
            }
        }
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| AuraError::Audio(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Timeline>> {
        self.timeline
            .lock()
            .map_err(|e| AuraError::Audio(format!("playback timeline lock poisoned: {e}")))
    }
}

impl PlaybackSink for CpalPlayback {
    fn current_time(&self) -> Duration {
        self.lock()
            .map(|t| t.now(self.sample_rate))
            .unwrap_or(Duration::ZERO)
    }

    fn schedule(&mut self, start: Duration, samples: Vec<f32>) -> Result<()> {
        let sample_rate = self.sample_rate;
        self.lock()?.add_voice(start, sample_rate, samples);
        Ok(())
    }

    fn stop_all(&mut self) {
        match self.lock() {
            Ok(mut timeline) => timeline.voices.clear(),
            Err(e) => warn!("cannot clear playback: {e}"),
        }
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn start_output(
    device_name: Option<&str>,
    sample_rate: u32,
    timeline: Arc<Mutex<Timeline>>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = if let Some(name) = device_name {
        host.output_devices()
            .map_err(|e| AuraError::DeviceAccess(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| AuraError::DeviceAccess(format!("output device '{name}' not found")))?
    } else {
        host.default_output_device()
            .ok_or_else(|| AuraError::DeviceAccess("no default output device".into()))?
    };

    let device_name = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("using output device: {device_name}");

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };
    let channels = usize::from(stream_config.channels);

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| match timeline.lock() {
                Ok(mut t) => t.render(data, channels),
                Err(_) => data.fill(0.0),
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| AuraError::DeviceAccess(format!("failed to build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| AuraError::DeviceAccess(format!("failed to start output stream: {e}")))?;
    info!("audio playback started at {sample_rate}Hz");
    Ok(stream)
}
