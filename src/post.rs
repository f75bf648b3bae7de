//! Optional edge-overlay pass: difference-of-Gaussians edge extraction on
//! the raw frame, rendered through a sparse ramp and composited over the
//! base glyph grid.

use anyhow::Result;

use crate::ascii_frame::AsciiFrame;
use crate::ascii_render::{AsciiRenderer, Viewport};

/// Mostly-blank ramp so faint responses disappear instead of dotting the
/// whole screen.
const EDGE_RAMP: &[u8] = b"      .:|#";

const FINE_SIGMA: f32 = 1.0;
const FINE_RADIUS: usize = 2;
const COARSE_SIGMA: f32 = 2.0;
const COARSE_RADIUS: usize = 4;
/// Differences at or above this are promoted to full intensity.
const EDGE_THRESHOLD: u8 = 10;

fn gaussian_kernel(radius: usize, sigma: f32) -> Vec<Vec<f32>> {
    let size = 2 * radius + 1;
    let mut kernel = vec![vec![0.0f32; size]; size];
    let mut sum = 0.0f32;

    for (i, row) in kernel.iter_mut().enumerate() {
        for (j, value) in row.iter_mut().enumerate() {
            let x = i as f32 - radius as f32;
            let y = j as f32 - radius as f32;
            *value = (1.0 / (2.0 * std::f32::consts::PI * sigma * sigma))
                * (-(x * x + y * y) / (2.0 * sigma * sigma)).exp();
            sum += *value;
        }
    }
    for row in &mut kernel {
        for value in row {
            *value /= sum;
        }
    }
    kernel
}

/// 2D Gaussian blur of a single-channel frame. The kernel is renormalized
/// per pixel where it overhangs the frame edge, so uniform input stays
/// uniform all the way to the borders.
fn gaussian_blur(frame: &[u8], width: usize, height: usize, sigma: f32, radius: usize) -> Vec<u8> {
    let kernel = gaussian_kernel(radius, sigma);
    let mut blurred = vec![0u8; width * height];

    for y in 0..height {
        for x in 0..width {
            let mut accumulated = 0.0f32;
            let mut weight = 0.0f32;
            for ky in -(radius as isize)..=radius as isize {
                for kx in -(radius as isize)..=radius as isize {
                    let sx = x as isize + kx;
                    let sy = y as isize + ky;
                    if sx < 0 || sx >= width as isize || sy < 0 || sy >= height as isize {
                        continue;
                    }
                    let k = kernel[(kx + radius as isize) as usize][(ky + radius as isize) as usize];
                    accumulated += f32::from(frame[sy as usize * width + sx as usize]) * k;
                    weight += k;
                }
            }
            blurred[y * width + x] = (accumulated / weight).round().clamp(0.0, 255.0) as u8;
        }
    }
    blurred
}

/// Band-pass edge response: blur at two scales and keep where they disagree.
/// Strong differences are promoted to full intensity.
fn difference_of_gaussians(frame: &[u8], width: usize, height: usize) -> Vec<u8> {
    let fine = gaussian_blur(frame, width, height, FINE_SIGMA, FINE_RADIUS);
    let coarse = gaussian_blur(frame, width, height, COARSE_SIGMA, COARSE_RADIUS);

    fine.iter()
        .zip(&coarse)
        .map(|(&a, &b)| {
            let difference = a.abs_diff(b);
            if difference < EDGE_THRESHOLD {
                difference
            } else {
                255
            }
        })
        .collect()
}

/// Renders the edge layer for a raw gray frame. Keeps its own renderer so
/// edge cells line up with the base grid for the same viewport.
pub struct EdgeOverlay {
    renderer: AsciiRenderer,
}

impl EdgeOverlay {
    pub fn new() -> Self {
        Self {
            // Edges are already binary-ish; no gamma shaping.
            renderer: AsciiRenderer::from_ramp(EDGE_RAMP, 1.0),
        }
    }

    pub fn render(
        &mut self,
        frame: &[u8],
        src_width: usize,
        src_height: usize,
        viewport: Viewport,
    ) -> Result<AsciiFrame> {
        let edges = difference_of_gaussians(frame, src_width, src_height);
        Ok(self
            .renderer
            .render(&edges, src_width, src_height, 1, viewport)?
            .grid)
    }
}

impl Default for EdgeOverlay {
    fn default() -> Self {
        Self::new()
    }
}

/// Composite `edges` over `base`: non-blank edge glyphs win, blanks let the
/// base cell through. Grids must be the same size.
pub fn overlay(base: &AsciiFrame, edges: &AsciiFrame) -> AsciiFrame {
    debug_assert!(base.same_size(edges), "overlay requires equal-size grids");
    let cells = base
        .cells()
        .iter()
        .zip(edges.cells())
        .map(|(&under, &over)| if over == b' ' { under } else { over })
        .collect();
    AsciiFrame::from_cells(base.cols(), base.rows(), cells)
}

#[cfg(test)]
mod tests {
    use super::{
        difference_of_gaussians, gaussian_blur, gaussian_kernel, overlay, EdgeOverlay,
    };
    use crate::ascii_frame::AsciiFrame;
    use crate::ascii_render::Viewport;

    #[test]
    fn kernel_is_normalized() {
        for (radius, sigma) in [(1usize, 0.8f32), (2, 1.0), (4, 2.0)] {
            let kernel = gaussian_kernel(radius, sigma);
            let sum: f32 = kernel.iter().flatten().sum();
            assert!((sum - 1.0).abs() < 1e-4, "kernel sum {sum} for r={radius}");
        }
    }

    #[test]
    fn blur_preserves_uniform_frames() {
        let frame = vec![137u8; 12 * 9];
        let blurred = gaussian_blur(&frame, 12, 9, 1.0, 2);
        assert!(blurred.iter().all(|&value| value == 137));
    }

    #[test]
    fn uniform_frame_has_no_edges() {
        let frame = vec![90u8; 16 * 16];
        let edges = difference_of_gaussians(&frame, 16, 16);
        assert!(edges.iter().all(|&value| value == 0));
    }

    #[test]
    fn step_edge_produces_a_response() {
        let width = 16;
        let height = 8;
        let mut frame = vec![0u8; width * height];
        for y in 0..height {
            for x in width / 2..width {
                frame[y * width + x] = 255;
            }
        }
        let edges = difference_of_gaussians(&frame, width, height);
        assert!(edges.iter().any(|&value| value > 0));
    }

    #[test]
    fn overlay_lets_blank_cells_through() {
        let base = AsciiFrame::from_cells(3, 1, b"abc".to_vec());
        let edges = AsciiFrame::from_cells(3, 1, b" # ".to_vec());
        let combined = overlay(&base, &edges);
        assert_eq!(combined.cells(), b"a#c");
    }

    #[test]
    fn edge_overlay_renders_to_viewport_size() {
        let mut pass = EdgeOverlay::new();
        let frame = vec![60u8; 8 * 8];
        let grid = pass
            .render(&frame, 8, 8, Viewport { cols: 4, rows: 2 })
            .expect("render");
        assert_eq!((grid.cols(), grid.rows()), (4, 2));
    }
}
