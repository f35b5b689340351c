//! Streaming conversion of device audio to mono at the wire rate.
//!
//! Device callbacks deliver arbitrary-sized interleaved blocks. The
//! converter carries its interpolation phase and the last input sample from
//! one block to the next, so the output is the same as converting the whole
//! recording at once: no dropped fractional samples and no restart at
//! block boundaries.

/// Interleaved device audio in, mono samples at `dst_rate` out.
#[derive(Debug, Clone)]
pub struct StreamResampler {
    channels: usize,
    /// Source samples per output sample.
    step: f64,
    /// Source position of the next output sample, relative to the start of
    /// the next block. `-1.0 <= phase` once a block has been seen; negative
    /// values reach back to `carry`.
    phase: f64,
    /// Last mono sample of the previous block.
    carry: f32,
    passthrough: bool,
}

impl StreamResampler {
    pub fn new(src_rate: u32, dst_rate: u32, channels: u16) -> Self {
        let passthrough = src_rate == dst_rate || src_rate == 0 || dst_rate == 0;
        Self {
            channels: usize::from(channels.max(1)),
            step: if passthrough {
                1.0
            } else {
                f64::from(src_rate) / f64::from(dst_rate)
            },
            phase: 0.0,
            carry: 0.0,
            passthrough,
        }
    }

    /// Convert one block. A trailing partial multi-channel frame is ignored.
    pub fn process(&mut self, interleaved: &[f32]) -> Vec<f32> {
        let mono = self.downmix(interleaved);
        if self.passthrough || mono.is_empty() {
            return mono;
        }

        let last = mono.len() - 1;
        let sample_at = |i: isize| -> f32 {
            match usize::try_from(i) {
                Ok(i) => mono[i],
                Err(_) => self.carry,
            }
        };

        let mut out = Vec::with_capacity((mono.len() as f64 / self.step) as usize + 1);
        // Interpolation needs the sample after `floor(phase)`; a position
        // landing on the final sample is emitted with the next block.
        while self.phase < last as f64 {
            let base = self.phase.floor();
            let frac = (self.phase - base) as f32;
            let i = base as isize;
            let a = sample_at(i);
            let b = sample_at(i + 1);
            out.push(a + (b - a) * frac);
            self.phase += self.step;
        }

        self.phase -= mono.len() as f64;
        self.carry = mono[last];
        out
    }

    /// Forget carried state, e.g. after the device restarted.
    pub fn reset(&mut self) {
        self.phase = 0.0;
        self.carry = 0.0;
    }

    fn downmix(&self, interleaved: &[f32]) -> Vec<f32> {
        if self.channels == 1 {
            return interleaved.to_vec();
        }
        let gain = 1.0 / self.channels as f32;
        interleaved
            .chunks_exact(self.channels)
            .map(|frame| frame.iter().copied().fold(0.0, |acc, s| acc + s * gain))
            .collect()
    }
}
