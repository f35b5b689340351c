//! 16-bit PCM conversion and fixed-size framing.
//!
//! Wire format is signed 16-bit little-endian, mono. Outbound audio is
//! 16 kHz, inbound 24 kHz.

use std::time::Duration;

/// Sample rate of audio sent to the live service.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of audio received from the live service.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
/// Samples per outbound frame (256 ms at 16 kHz).
pub const FRAME_SAMPLES: usize = 4096;

const SCALE: f32 = 32768.0;

/// Quantize one sample in `[-1.0, 1.0]` to `i16`: `round(sample * 32768)`,
/// saturated. NaN maps to zero.
pub fn quantize(sample: f32) -> i16 {
    let scaled = (sample * SCALE).round();
    scaled.clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

/// Encode float samples as 16-bit little-endian PCM.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| quantize(s).to_le_bytes())
        .collect()
}

/// Decode 16-bit little-endian PCM into floats (`sample / 32768.0`).
///
/// A trailing odd byte is ignored.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / SCALE)
        .collect()
}

/// Playback length of `samples` mono samples at `sample_rate`.
pub fn samples_to_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let nanos = samples as u128 * 1_000_000_000 / u128::from(sample_rate);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Nearest sample index of `duration` on a `sample_rate` clock.
///
/// Inverse of [`samples_to_duration`], whose truncation to whole
/// nanoseconds is always far below half a sample.
pub fn duration_to_samples(duration: Duration, sample_rate: u32) -> u64 {
    let scaled = duration.as_nanos() * u128::from(sample_rate) + 500_000_000;
    u64::try_from(scaled / 1_000_000_000).unwrap_or(u64::MAX)
}

/// One block of encoded PCM tagged with its format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    data: Vec<u8>,
    sample_rate: u32,
    channels: u16,
}

impl AudioFrame {
    /// Encode mono float samples into a frame.
    pub fn from_samples(samples: &[f32], sample_rate: u32) -> Self {
        Self {
            data: encode_pcm16(samples),
            sample_rate,
            channels: 1,
        }
    }

    /// Wrap already-encoded PCM bytes.
    pub fn from_bytes(data: Vec<u8>, sample_rate: u32, channels: u16) -> Self {
        Self {
            data,
            sample_rate,
            channels: channels.max(1),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Samples per channel.
    pub fn sample_count(&self) -> usize {
        self.data.len() / 2 / usize::from(self.channels)
    }

    /// Logical duration: sample count / rate.
    pub fn duration(&self) -> Duration {
        samples_to_duration(self.sample_count(), self.sample_rate)
    }

    /// MIME type announced on the wire, e.g. `audio/pcm;rate=16000`.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    /// Decode back to float samples.
    pub fn decode(&self) -> Vec<f32> {
        decode_pcm16(&self.data)
    }
}

/// Accumulates a continuous sample stream into fixed-size frames.
#[derive(Debug)]
pub struct FrameEncoder {
    sample_rate: u32,
    frame_samples: usize,
    pending: Vec<f32>,
}

impl FrameEncoder {
    pub fn new(sample_rate: u32, frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            sample_rate,
            frame_samples,
            pending: Vec::with_capacity(frame_samples),
        }
    }

    /// Append samples and return every frame they complete, in order.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        let mut rest = samples;
        while !rest.is_empty() {
            let room = self.frame_samples - self.pending.len();
            let take = room.min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() == self.frame_samples {
                frames.push(AudioFrame::from_samples(&self.pending, self.sample_rate));
                self.pending.clear();
            }
        }
        frames
    }

    /// Samples waiting for the current frame to fill.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drop the partial frame.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new(INPUT_SAMPLE_RATE, FRAME_SAMPLES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_rounds_and_saturates() {
        assert_eq!(quantize(0.0), 0);
        assert_eq!(quantize(0.5), 16384);
        assert_eq!(quantize(-0.5), -16384);
        assert_eq!(quantize(-1.0), i16::MIN);
        assert_eq!(quantize(1.0), i16::MAX);
        assert_eq!(quantize(3.0), i16::MAX);
        assert_eq!(quantize(-3.0), i16::MIN);
        assert_eq!(quantize(f32::NAN), 0);
        // 0.3 * 32768 = 9830.4
        assert_eq!(quantize(0.3), 9830);
    }

    #[test]
    fn encoding_is_little_endian() {
        assert_eq!(encode_pcm16(&[0.5, -1.0]), vec![0x00, 0x40, 0x00, 0x80]);
    }

    #[test]
    fn round_trip_within_one_lsb() {
        let samples: Vec<f32> = (0..=2000).map(|i| -1.0 + i as f32 / 1000.0).collect();
        let decoded = decode_pcm16(&encode_pcm16(&samples));
        assert_eq!(decoded.len(), samples.len());
        for (original, back) in samples.iter().zip(&decoded) {
            assert!(
                (original - back).abs() <= 1.0 / 32768.0 + f32::EPSILON,
                "{original} -> {back}"
            );
        }
    }

    #[test]
    fn decode_ignores_trailing_odd_byte() {
        assert_eq!(decode_pcm16(&[0x00, 0x40, 0x7f]), vec![0.5]);
    }

    #[test]
    fn frame_metadata() {
        let frame = AudioFrame::from_samples(&[0.0; FRAME_SAMPLES], INPUT_SAMPLE_RATE);
        assert_eq!(frame.data().len(), FRAME_SAMPLES * 2);
        assert_eq!(frame.sample_count(), FRAME_SAMPLES);
        assert_eq!(frame.duration(), Duration::from_millis(256));
        assert_eq!(frame.mime_type(), "audio/pcm;rate=16000");
    }

    #[test]
    fn stereo_frame_counts_per_channel() {
        let frame = AudioFrame::from_bytes(vec![0; 8], 24_000, 2);
        assert_eq!(frame.sample_count(), 2);
    }

    #[test]
    fn duration_of_inbound_audio() {
        assert_eq!(
            samples_to_duration(2400, OUTPUT_SAMPLE_RATE),
            Duration::from_millis(100)
        );
        assert_eq!(samples_to_duration(10, 0), Duration::ZERO);
    }

    #[test]
    fn sample_position_survives_duration_conversion() {
        // 1001 samples at 24 kHz is 41_708_333.3 ns, truncated
        for n in [0usize, 1, 2, 1001, 2002, 24_000, 123_457] {
            let d = samples_to_duration(n, OUTPUT_SAMPLE_RATE);
            assert_eq!(duration_to_samples(d, OUTPUT_SAMPLE_RATE), n as u64, "{n}");
        }
        assert_eq!(duration_to_samples(Duration::from_millis(30), OUTPUT_SAMPLE_RATE), 720);
    }

    #[test]
    fn encoder_emits_fixed_frames() {
        let mut encoder = FrameEncoder::new(INPUT_SAMPLE_RATE, 4);
        assert!(encoder.push(&[0.1, 0.2, 0.3]).is_empty());
        assert_eq!(encoder.pending(), 3);

        let frames = encoder.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].sample_count(), 4);
        assert_eq!(frames[0].decode()[3], decode_pcm16(&encode_pcm16(&[0.4]))[0]);
        assert_eq!(encoder.pending(), 1);

        encoder.clear();
        assert_eq!(encoder.pending(), 0);
    }

    #[test]
    fn default_encoder_uses_256ms_frames() {
        let mut encoder = FrameEncoder::default();
        let frames = encoder.push(&vec![0.0; FRAME_SAMPLES * 2 + 10]);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.duration() == Duration::from_millis(256)));
        assert_eq!(encoder.pending(), 10);
    }
}
