//! Microphone capture using cpal.
//!
//! Captures at the device's native format, converts to mono at the live
//! input rate with a [`StreamResampler`] that persists across callbacks, and
//! cuts the result into fixed-size PCM frames.
//!
//! [`CaptureBackend`] is the seam the live session acquires the microphone
//! through; [`CpalCapture`] is the real device.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::pcm::{AudioFrame, FrameEncoder};
use super::resample::StreamResampler;
use crate::config::AudioConfig;
use crate::error::{AuraError, Result};

/// Acquires a capture device and streams encoded frames.
pub trait CaptureBackend: Send + Sync {
    /// Acquire the device and start sending frames to `frames`.
    ///
    /// Blocks until the device is running.
    ///
    /// # Errors
    ///
    /// [`AuraError::DeviceAccess`] when the device is missing, busy or
    /// permission was denied.
    fn open(&self, frames: mpsc::Sender<AudioFrame>) -> Result<Box<dyn CaptureStream>>;
}

/// A running capture. Dropping it releases the device.
pub trait CaptureStream: Send {
    /// Stop producing frames and release the device. Idempotent.
    ///
    /// No frame is sent after this returns; a partial frame is discarded.
    fn stop(&mut self);
}

/// Microphone capture via cpal.
#[derive(Debug, Clone)]
pub struct CpalCapture {
    device_name: Option<String>,
    target_sample_rate: u32,
    frame_samples: usize,
}

impl CpalCapture {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device_name: config.input_device.clone(),
            target_sample_rate: config.input_sample_rate,
            frame_samples: config.frame_samples,
        }
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| AuraError::Audio(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }

    fn select_device(&self) -> Result<cpal::Device> {
        let host = cpal::default_host();
        let device = if let Some(ref name) = self.device_name {
            host.input_devices()
                .map_err(|e| AuraError::DeviceAccess(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| AuraError::DeviceAccess(format!("input device '{name}' not found")))?
        } else {
            host.default_input_device()
                .ok_or_else(|| AuraError::DeviceAccess("no default input device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using input device: {device_name}");
        Ok(device)
    }

    /// Build and start the input stream. Runs on the capture thread.
    fn start_stream(
        &self,
        frames: mpsc::Sender<AudioFrame>,
        active: Arc<AtomicBool>,
    ) -> Result<cpal::Stream> {
        let device = self.select_device()?;
        let default_config = device
            .default_input_config()
            .map_err(|e| AuraError::DeviceAccess(format!("no default input config: {e}")))?;

        let native_rate = default_config.sample_rate();
        let native_channels = default_config.channels();
        let stream_config = StreamConfig {
            channels: native_channels,
            sample_rate: native_rate,
            buffer_size: cpal::BufferSize::Default,
        };
        let target_rate = self.target_sample_rate;
        info!(
            "native input config: {}Hz, {} channels -> {}Hz mono",
            native_rate, native_channels, target_rate
        );

        let mut converter = StreamResampler::new(native_rate, target_rate, native_channels);
        let mut encoder = FrameEncoder::new(target_rate, self.frame_samples);
        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    if !active.load(Ordering::Acquire) {
                        return;
                    }
                    for frame in encoder.push(&converter.process(data)) {
                        // Never block the audio thread
                        if frames.try_send(frame).is_err() {
                            debug!("capture channel full, dropping frame");
                        }
                    }
                },
                move |err| {
                    error!("audio input stream error: {err}");
                },
                None,
            )
            .map_err(|e| AuraError::DeviceAccess(format!("failed to build input stream: {e}")))?;

        stream
            .play()
            .map_err(|e| AuraError::DeviceAccess(format!("failed to start input stream: {e}")))?;
        Ok(stream)
    }
}

impl CaptureBackend for CpalCapture {
    fn open(&self, frames: mpsc::Sender<AudioFrame>) -> Result<Box<dyn CaptureStream>> {
        let active = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

        // cpal streams are not Send on every platform, so the stream lives
        // and dies on its own thread.
        let capture = self.clone();
        let thread_active = Arc::clone(&active);
        let thread = std::thread::Builder::new()
            .name("aura-capture".into())
            .spawn(move || match capture.start_stream(frames, thread_active) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Returns on stop() or when the handle is dropped
                    let _ = stop_rx.recv();
                    drop(stream);
                    info!("audio capture stopped");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| AuraError::DeviceAccess(format!("cannot spawn capture thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("audio capture started");
                Ok(Box::new(CpalCaptureStream {
                    active,
                    stop_tx: Some(stop_tx),
                    thread: Some(thread),
                }))
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AuraError::DeviceAccess(
                    "capture thread exited before the device started".into(),
                ))
            }
        }
    }
}

/// Handle to a running cpal capture thread.
struct CpalCaptureStream {
    active: Arc<AtomicBool>,
    stop_tx: Option<crossbeam_channel::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureStream for CpalCaptureStream {
    fn stop(&mut self) {
        self.active.store(false, Ordering::Release);
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("capture thread panicked");
        }
    }
}

impl Drop for CpalCaptureStream {
    fn drop(&mut self) {
        self.stop();
    }
}
