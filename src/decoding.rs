use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Serialize;

/// The decoder is asked for single-channel gray frames; the renderer also
/// accepts 3-channel RGB for other frame sources.
pub const FRAME_CHANNELS: usize = 1;

/// One-shot metadata probe result for a video file.
#[derive(Debug, Clone, Serialize)]
pub struct VideoMetadata {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub duration_ms: u64,
    pub total_frames: u32,
}

impl VideoMetadata {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * FRAME_CHANNELS
    }
}

/// Resolve the ffmpeg binary. The default build uses the system `ffmpeg`;
/// with the `sidecar_ffmpeg` feature the sidecar binary is used and
/// auto-downloaded when missing.
pub fn ffmpeg_executable() -> Result<PathBuf> {
    #[cfg(feature = "sidecar_ffmpeg")]
    {
        let path = ffmpeg_sidecar::paths::ffmpeg_path();
        if !path.exists() {
            ffmpeg_sidecar::download::auto_download()
                .context("failed to auto-download ffmpeg sidecar binary")?;
        }
        Ok(path)
    }
    #[cfg(not(feature = "sidecar_ffmpeg"))]
    {
        Ok(PathBuf::from("ffmpeg"))
    }
}

/// Probe a video file by parsing the diagnostic stderr of `ffmpeg -i`.
///
/// ffmpeg exits non-zero when invoked without an output target, so the exit
/// status is ignored; only the stderr text matters.
pub fn probe(path: &Path) -> Result<VideoMetadata> {
    let output = Command::new(ffmpeg_executable()?)
        .arg("-hide_banner")
        .arg("-i")
        .arg(path)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                anyhow!("ffmpeg executable not found. Install ffmpeg or build with `--features sidecar_ffmpeg`.")
            } else {
                anyhow!("failed to run ffmpeg probe: {error}")
            }
        })?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    parse_probe_output(&stderr)
        .with_context(|| format!("could not read video metadata from '{}'", path.display()))
}

fn parse_probe_output(output: &str) -> Result<VideoMetadata> {
    let dimensions =
        Regex::new(r", (\d+)x(\d+)[, ]").expect("dimensions regex should compile");
    let fps_pattern =
        Regex::new(r"\b(\d+(?:\.\d+)?)\s*fps\b").expect("fps regex should compile");
    let duration_pattern = Regex::new(r"Duration:\s+(\d{2}):(\d{2}):(\d{2})\.(\d{2})")
        .expect("duration regex should compile");

    let captures = dimensions
        .captures(output)
        .ok_or_else(|| anyhow!("no video stream dimensions found (not a video file?)"))?;
    let width: u32 = captures[1].parse().context("failed to parse width")?;
    let height: u32 = captures[2].parse().context("failed to parse height")?;

    let captures = fps_pattern
        .captures(output)
        .ok_or_else(|| anyhow!("no frame rate found in stream info"))?;
    let fps: f64 = captures[1].parse().context("failed to parse frame rate")?;
    if fps <= 0.0 {
        return Err(anyhow!("frame rate must be positive, got {fps}"));
    }

    let captures = duration_pattern
        .captures(output)
        .ok_or_else(|| anyhow!("no duration found in stream info"))?;
    let hours: u64 = captures[1].parse().context("failed to parse duration hours")?;
    let minutes: u64 = captures[2].parse().context("failed to parse duration minutes")?;
    let seconds: u64 = captures[3].parse().context("failed to parse duration seconds")?;
    let centis: u64 = captures[4].parse().context("failed to parse duration fraction")?;
    let duration_ms = (hours * 3600 + minutes * 60 + seconds) * 1000 + centis * 10;

    let total_frames = (duration_ms as f64 / 1000.0 * fps) as u32;

    Ok(VideoMetadata {
        width,
        height,
        fps,
        duration_ms,
        total_frames,
    })
}

/// A windowed raw-frame stream from an ffmpeg child process.
///
/// A named reader thread pulls fixed-size gray frames from the child's
/// stdout into a small bounded channel, so the decoder stays ahead without
/// unbounded memory and the consumer never blocks on a pipe read directly.
pub struct FfmpegStream {
    receiver: mpsc::Receiver<Vec<u8>>,
    worker: Option<JoinHandle<Result<()>>>,
    child: Child,
}

impl FfmpegStream {
    /// Start decoding `count` frames beginning at 1-based `start_frame`.
    pub fn spawn(
        path: &Path,
        metadata: &VideoMetadata,
        start_frame: u32,
        count: u32,
    ) -> Result<Self> {
        let start_secs = f64::from(start_frame.saturating_sub(1)) / metadata.fps;
        let mut child = Command::new(ffmpeg_executable()?)
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-ss")
            .arg(format!("{start_secs:.6}"))
            .arg("-i")
            .arg(path)
            .arg("-frames:v")
            .arg(count.to_string())
            .arg("-vf")
            .arg(format!("fps={:.5},format=gray", metadata.fps))
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("gray")
            .arg("-")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    anyhow!("ffmpeg executable not found. Install ffmpeg or build with `--features sidecar_ffmpeg`.")
                } else {
                    anyhow!("failed to spawn ffmpeg decoder: {error}")
                }
            })?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture ffmpeg stdout"))?;
        let frame_size = metadata.frame_size();
        let (sender, receiver) = mpsc::sync_channel::<Vec<u8>>(4);

        let worker = thread::Builder::new()
            .name("crt-ffmpeg-decoder".to_owned())
            .spawn(move || loop {
                let mut buffer = vec![0u8; frame_size];
                let filled = read_up_to(&mut stdout, &mut buffer)?;
                if filled == 0 {
                    return Ok(());
                }
                if filled < frame_size {
                    // A short read means the decoder died mid-frame; the
                    // partial frame is discarded, never delivered.
                    return Err(anyhow!(
                        "truncated frame from ffmpeg: expected {frame_size} bytes, got {filled}"
                    ));
                }
                if sender.send(buffer).is_err() {
                    return Ok(());
                }
            })
            .context("failed to spawn ffmpeg reader thread")?;

        Ok(Self {
            receiver,
            worker: Some(worker),
            child,
        })
    }

    /// Next decoded frame, or `None` once the stream has ended (cleanly or
    /// not — call `finish` to learn which).
    pub fn next_frame(&self) -> Option<Vec<u8>> {
        self.receiver.recv().ok()
    }

    pub fn finish(mut self) -> Result<()> {
        let _ = self.child.kill();
        let _ = self.child.wait();

        match self.worker.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(anyhow!("ffmpeg reader thread panicked")),
            },
            None => Ok(()),
        }
    }
}

impl Drop for FfmpegStream {
    fn drop(&mut self) {
        // Abandoned streams (seek, quit) must not leak the child process.
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

fn read_up_to(reader: &mut impl Read, buffer: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(error) if error.kind() == ErrorKind::Interrupted => {}
            Err(error) => return Err(anyhow!("failed to read from ffmpeg: {error}")),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::parse_probe_output;

    const SAMPLE_PROBE: &str = "\
Input #0, mov,mp4,m4a,3gp,3g2,mj2, from 'clip.mp4':
  Metadata:
    major_brand     : isom
  Duration: 00:03:25.54, start: 0.000000, bitrate: 1205 kb/s
  Stream #0:0[0x1](und): Video: h264 (High) (avc1 / 0x31637661), yuv420p(progressive), 1280x720 [SAR 1:1 DAR 16:9], 1070 kb/s, 30 fps, 30 tbr, 15360 tbn (default)
  Stream #0:1[0x2](und): Audio: aac (LC) (mp4a / 0x6134706D), 44100 Hz, stereo, fltp, 128 kb/s (default)
At least one output file must be specified
";

    #[test]
    fn parses_dimensions_fps_and_duration() {
        let metadata = parse_probe_output(SAMPLE_PROBE).expect("probe should parse");
        assert_eq!(metadata.width, 1280);
        assert_eq!(metadata.height, 720);
        assert_eq!(metadata.fps, 30.0);
        assert_eq!(metadata.duration_ms, 205_540);
        assert_eq!(metadata.total_frames, 6166);
        assert_eq!(metadata.frame_size(), 1280 * 720);
    }

    #[test]
    fn parses_fractional_frame_rates() {
        let probe = SAMPLE_PROBE.replace("30 fps", "29.97 fps");
        let metadata = parse_probe_output(&probe).expect("probe should parse");
        assert!((metadata.fps - 29.97).abs() < 1e-9);
    }

    #[test]
    fn rejects_output_without_video_stream() {
        let output = "clip.txt: Invalid data found when processing input\n";
        assert!(parse_probe_output(output).is_err());
    }

    #[test]
    fn rejects_output_without_duration() {
        let output = "Stream #0:0: Video: h264, yuv420p, 640x480, 25 fps\n";
        assert!(parse_probe_output(output).is_err());
    }
}
