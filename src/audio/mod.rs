//! Audio capture, PCM framing and scheduled playback via cpal.

pub mod capture;
pub mod pcm;
pub mod playback;
pub mod resample;

pub use capture::{CaptureBackend, CaptureStream, CpalCapture};
pub use pcm::{AudioFrame, FrameEncoder};
pub use playback::{CpalPlayback, PlaybackScheduler, PlaybackSink, ScheduledBuffer};
pub use resample::StreamResampler;
