use anyhow::{bail, Result};

use crate::ascii_frame::AsciiFrame;

const BT709_R_WEIGHT: u32 = 2126;
const BT709_G_WEIGHT: u32 = 7152;
const BT709_B_WEIGHT: u32 = 722;
const BT709_WEIGHT_SUM: u32 = 10_000;

pub const DEFAULT_GAMMA: f32 = 0.8;

/// Ten-step ramp, darkest glyph first.
const RAMP_DEFAULT: &[u8] = b" .:-=+*#%@";
/// Dense 69-step ramp for finer gradation, darkest glyph first.
const RAMP_DENSE: &[u8] = b" .'`^\",:;Il!i<>~+_-?][}{1)(|/tfjrxnuvczXYUJCLQ0OZmwqpdbkhao*#MW&8%B@$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlyphRamp {
    Default,
    Dense,
}

impl GlyphRamp {
    pub fn from_keyword(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "dense" => Ok(Self::Dense),
            _ => bail!("invalid glyph ramp '{value}' (allowed: default, dense)"),
        }
    }

    /// Glyphs ordered darkest to lightest.
    pub fn bytes(self) -> &'static [u8] {
        match self {
            Self::Default => RAMP_DEFAULT,
            Self::Dense => RAMP_DENSE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub cols: u16,
    pub rows: u16,
}

/// Output of one render pass. `dimensions_changed` is set whenever the
/// viewport differs from the previous render; the caller must then repaint
/// the whole grid instead of diffing against a grid of the old size.
#[derive(Debug, Clone)]
pub struct RenderedFrame {
    pub grid: AsciiFrame,
    pub dimensions_changed: bool,
}

/// Maps raw frames to glyph grids. Holds the ramp, the gamma exponent, and
/// the viewport of the previous render for resize detection.
pub struct AsciiRenderer {
    ramp: &'static [u8],
    gamma: f32,
    last_viewport: Option<Viewport>,
}

fn bt709_luma_u8(r: u8, g: u8, b: u8) -> u8 {
    let weighted = BT709_R_WEIGHT * u32::from(r)
        + BT709_G_WEIGHT * u32::from(g)
        + BT709_B_WEIGHT * u32::from(b);
    ((weighted + (BT709_WEIGHT_SUM / 2)) / BT709_WEIGHT_SUM) as u8
}

/// Linear brightness-to-ramp mapping: normalize, gamma-correct, then scale
/// into the index range. Monotonic and defined at zero brightness, unlike
/// the reciprocal `ramp_len / brightness` mapping seen in some ancestors.
fn gamma_ramp_index(brightness: u8, gamma: f32, ramp_len: usize) -> usize {
    if ramp_len <= 1 {
        return 0;
    }
    let normalized = f32::from(brightness) / 255.0;
    let corrected = normalized.powf(gamma);
    let index = (corrected * (ramp_len - 1) as f32).round() as usize;
    index.min(ramp_len - 1)
}

impl AsciiRenderer {
    pub fn new(ramp: GlyphRamp, gamma: f32) -> Self {
        Self::from_ramp(ramp.bytes(), gamma)
    }

    /// Renderer over an arbitrary darkest-first ramp (the edge overlay uses
    /// a sparse one).
    pub fn from_ramp(ramp: &'static [u8], gamma: f32) -> Self {
        Self {
            ramp,
            gamma,
            last_viewport: None,
        }
    }

    pub fn ramp(&self) -> &'static [u8] {
        self.ramp
    }

    /// Render one raw frame into a glyph grid sized to `viewport`.
    ///
    /// `frame` is row-major with `channels` samples per pixel: 1 (gray,
    /// used directly) or 3 (RGB, collapsed to BT.709 luminance). Each output
    /// cell averages brightness over its source block; block dimensions are
    /// clamped to at least one pixel so a viewport larger than the source
    /// still renders.
    pub fn render(
        &mut self,
        frame: &[u8],
        src_width: usize,
        src_height: usize,
        channels: usize,
        viewport: Viewport,
    ) -> Result<RenderedFrame> {
        if channels != 1 && channels != 3 {
            bail!("unsupported channel count {channels} (expected 1 or 3)");
        }
        if src_width == 0 || src_height == 0 {
            bail!("source dimensions must be non-zero");
        }
        let expected = src_width * src_height * channels;
        if frame.len() != expected {
            bail!(
                "frame length mismatch: expected {expected} bytes, got {}",
                frame.len()
            );
        }

        let cols = viewport.cols.max(1) as usize;
        let rows = viewport.rows.max(1) as usize;

        let step_x = src_width as f32 / cols as f32;
        let step_y = src_height as f32 / rows as f32;
        let block_w = (step_x as usize).max(1);
        let block_h = (step_y as usize).max(1);

        let mut cells = vec![b' '; cols * rows];
        for row in 0..rows {
            for col in 0..cols {
                let x = ((step_x * col as f32) as usize).min(src_width - 1);
                let y = ((step_y * row as f32) as usize).min(src_height - 1);
                let w = block_w.min(src_width - x);
                let h = block_h.min(src_height - y);

                let mut sum: u32 = 0;
                for py in y..y + h {
                    for px in x..x + w {
                        let offset = (py * src_width + px) * channels;
                        sum += match channels {
                            1 => u32::from(frame[offset]),
                            _ => u32::from(bt709_luma_u8(
                                frame[offset],
                                frame[offset + 1],
                                frame[offset + 2],
                            )),
                        };
                    }
                }
                let average = (sum / (w * h) as u32) as u8;
                let index = gamma_ramp_index(average, self.gamma, self.ramp.len());
                cells[row * cols + col] = self.ramp[index];
            }
        }

        let dimensions_changed = self.last_viewport != Some(viewport);
        self.last_viewport = Some(viewport);

        Ok(RenderedFrame {
            grid: AsciiFrame::from_cells(cols as u16, rows as u16, cells),
            dimensions_changed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{gamma_ramp_index, AsciiRenderer, GlyphRamp, Viewport, DEFAULT_GAMMA};

    const VIEW_2X2: Viewport = Viewport { cols: 2, rows: 2 };

    #[test]
    fn uniform_frame_renders_uniform_grid() {
        let mut renderer = AsciiRenderer::new(GlyphRamp::Default, DEFAULT_GAMMA);
        let frame = vec![128u8; 16 * 8];
        let rendered = renderer
            .render(&frame, 16, 8, 1, Viewport { cols: 4, rows: 2 })
            .expect("render");
        let first = rendered.grid.cell(0, 0);
        assert!(rendered.grid.cells().iter().all(|&cell| cell == first));
    }

    #[test]
    fn brightness_endpoints_map_to_ramp_endpoints() {
        let mut renderer = AsciiRenderer::new(GlyphRamp::Default, DEFAULT_GAMMA);
        let dark = vec![0u8; 8 * 8];
        let light = vec![255u8; 8 * 8];
        let ramp = GlyphRamp::Default.bytes();

        let rendered = renderer.render(&dark, 8, 8, 1, VIEW_2X2).expect("render");
        assert!(rendered.grid.cells().iter().all(|&cell| cell == ramp[0]));

        let rendered = renderer.render(&light, 8, 8, 1, VIEW_2X2).expect("render");
        assert!(rendered
            .grid
            .cells()
            .iter()
            .all(|&cell| cell == ramp[ramp.len() - 1]));
    }

    #[test]
    fn gamma_mapping_is_monotonic() {
        for ramp_len in [2usize, 10, 69] {
            let mut previous = 0;
            for value in 0..=255u8 {
                let index = gamma_ramp_index(value, DEFAULT_GAMMA, ramp_len);
                assert!(
                    index >= previous,
                    "index regressed at value {value} (ramp_len {ramp_len})"
                );
                assert!(index < ramp_len);
                previous = index;
            }
        }
    }

    #[test]
    fn zero_brightness_is_defined_and_darkest() {
        assert_eq!(gamma_ramp_index(0, DEFAULT_GAMMA, 10), 0);
        assert_eq!(gamma_ramp_index(255, DEFAULT_GAMMA, 10), 9);
    }

    #[test]
    fn quadrant_frame_maps_to_known_indices() {
        // 4x4 gray frame with quadrant values 0, 85, 170, 255 rendered to a
        // 2x2 grid: each cell averages one uniform 2x2 block. With gamma 0.8
        // and a 10-glyph ramp the expected indices are 0, 4, 7, 9.
        #[rustfmt::skip]
        let frame = vec![
            0, 0, 85, 85,
            0, 0, 85, 85,
            170, 170, 255, 255,
            170, 170, 255, 255,
        ];
        let mut renderer = AsciiRenderer::new(GlyphRamp::Default, 0.8);
        let rendered = renderer.render(&frame, 4, 4, 1, VIEW_2X2).expect("render");
        let ramp = GlyphRamp::Default.bytes();
        assert_eq!(rendered.grid.cell(0, 0), ramp[0]);
        assert_eq!(rendered.grid.cell(0, 1), ramp[4]);
        assert_eq!(rendered.grid.cell(1, 0), ramp[7]);
        assert_eq!(rendered.grid.cell(1, 1), ramp[9]);
    }

    #[test]
    fn viewport_larger_than_source_clamps_block_to_one_pixel() {
        let mut renderer = AsciiRenderer::new(GlyphRamp::Default, DEFAULT_GAMMA);
        let frame = vec![200u8; 4]; // 2x2 source
        let rendered = renderer
            .render(&frame, 2, 2, 1, Viewport { cols: 8, rows: 6 })
            .expect("render");
        assert_eq!(rendered.grid.cols(), 8);
        assert_eq!(rendered.grid.rows(), 6);
        let first = rendered.grid.cell(0, 0);
        assert!(rendered.grid.cells().iter().all(|&cell| cell == first));
    }

    #[test]
    fn rgb_luminance_weights_green_highest() {
        let mut renderer = AsciiRenderer::new(GlyphRamp::Default, DEFAULT_GAMMA);
        let red = vec![255, 0, 0];
        let green = vec![0, 255, 0];
        let view = Viewport { cols: 1, rows: 1 };
        let ramp = GlyphRamp::Default.bytes();

        let red_cell = renderer.render(&red, 1, 1, 3, view).expect("render").grid.cell(0, 0);
        let green_cell = renderer
            .render(&green, 1, 1, 3, view)
            .expect("render")
            .grid
            .cell(0, 0);
        let red_index = ramp.iter().position(|&g| g == red_cell).expect("in ramp");
        let green_index = ramp.iter().position(|&g| g == green_cell).expect("in ramp");
        assert!(green_index > red_index);
    }

    #[test]
    fn dimensions_changed_fires_on_resize_only() {
        let mut renderer = AsciiRenderer::new(GlyphRamp::Default, DEFAULT_GAMMA);
        let frame = vec![90u8; 16];

        let first = renderer.render(&frame, 4, 4, 1, VIEW_2X2).expect("render");
        assert!(first.dimensions_changed);

        let second = renderer.render(&frame, 4, 4, 1, VIEW_2X2).expect("render");
        assert!(!second.dimensions_changed);

        let third = renderer
            .render(&frame, 4, 4, 1, Viewport { cols: 4, rows: 2 })
            .expect("render");
        assert!(third.dimensions_changed);
    }

    #[test]
    fn rejects_bad_channel_counts_and_short_frames() {
        let mut renderer = AsciiRenderer::new(GlyphRamp::Default, DEFAULT_GAMMA);
        assert!(renderer.render(&[0; 8], 2, 2, 2, VIEW_2X2).is_err());
        assert!(renderer.render(&[0; 3], 2, 2, 1, VIEW_2X2).is_err());
    }
}
