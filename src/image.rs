//! Image generation and text-art rendering.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::RenderConfig;
use crate::error::{AuraError, Result};
use crate::gemini::GenerativeBackend;
use crate::retry::{self, RetryPolicy};

/// Glyphs from lightest to densest.
const RAMP: &[u8] = b" .:-=+*#%@";

/// Character cells are roughly twice as tall as they are wide.
const DEFAULT_CELL_ASPECT: f32 = 0.5;

/// Remote image generation behind the retry executor.
pub struct ImageService {
    backend: Arc<dyn GenerativeBackend>,
    policy: RetryPolicy,
}

impl ImageService {
    pub fn new(backend: Arc<dyn GenerativeBackend>, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    /// Generate an image and return its encoded bytes.
    ///
    /// # Errors
    ///
    /// [`AuraError::EmptyPayload`] when the service answered without an image
    /// (not retried), otherwise the remote error after retries.
    pub async fn generate(&self, prompt: &str) -> Result<Vec<u8>> {
        let backend = &self.backend;
        let bytes = retry::execute(&self.policy, || async move {
            backend
                .generate_image(prompt)
                .await
                .into_result("image generation")
        })
        .await?;
        info!(bytes = bytes.len(), "image generated");
        Ok(bytes)
    }
}

/// Options for [`render_text_art`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextArtOptions {
    /// Maximum output width in characters.
    pub columns: u32,
    /// Dense glyphs for bright pixels (for light-on-dark terminals).
    pub invert: bool,
    /// Width/height ratio of one character cell.
    pub cell_aspect: f32,
}

impl Default for TextArtOptions {
    fn default() -> Self {
        Self {
            columns: 80,
            invert: false,
            cell_aspect: DEFAULT_CELL_ASPECT,
        }
    }
}

impl From<&RenderConfig> for TextArtOptions {
    fn from(config: &RenderConfig) -> Self {
        Self {
            columns: config.columns,
            invert: config.invert,
            ..Self::default()
        }
    }
}

/// Pixel range `[start, end)` covered by cell `index` of `cells` along an
/// axis of `len` pixels. Never empty.
fn cell_span(index: u32, cells: u32, len: u32) -> (u32, u32) {
    let start = (u64::from(index) * u64::from(len) / u64::from(cells)) as u32;
    let end = (u64::from(index + 1) * u64::from(len) / u64::from(cells)) as u32;
    (start, end.max(start + 1).min(len))
}

/// Render encoded image bytes as luminance-sampled text art.
///
/// Each character is the mean luminance of the pixels under its cell. The
/// image is never upscaled horizontally; rows are scaled by the cell aspect
/// so the picture keeps its proportions in a terminal.
///
/// # Errors
///
/// Returns [`AuraError::Image`] when the bytes are not a decodable image.
pub fn render_text_art(bytes: &[u8], options: &TextArtOptions) -> Result<String> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| AuraError::Image(format!("cannot decode image: {e}")))?;
    let luma = decoded.to_luma8();
    let (width, height) = luma.dimensions();
    if width == 0 || height == 0 {
        return Err(AuraError::Image("image has no pixels".into()));
    }

    let cols = options.columns.clamp(1, width);
    let scale = cols as f32 / width as f32;
    let rows = ((height as f32 * scale * options.cell_aspect).round() as u32).max(1);
    debug!(width, height, cols, rows, "rendering text art");

    let last = RAMP.len() - 1;
    let mut out = String::with_capacity(((cols + 1) * rows) as usize);
    for row in 0..rows {
        if row > 0 {
            out.push('\n');
        }
        let (y0, y1) = cell_span(row, rows, height);
        for col in 0..cols {
            let (x0, x1) = cell_span(col, cols, width);
            let mut sum = 0u64;
            for y in y0..y1 {
                for x in x0..x1 {
                    sum += u64::from(luma.get_pixel(x, y).0[0]);
                }
            }
            let count = u64::from((x1 - x0) * (y1 - y0));
            let lum = (sum / count) as usize;
            let level = if options.invert { lum } else { 255 - lum };
            out.push(char::from(RAMP[level * last / 255]));
        }
    }
    Ok(out)
}
