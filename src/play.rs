use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::ascii_frame::{frame_diff, AsciiFrame};
use crate::ascii_render::{AsciiRenderer, GlyphRamp};
use crate::decoding::FRAME_CHANNELS;
use crate::post::{self, EdgeOverlay};
use crate::session::Session;
use crate::terminal::{self, ControlRequest, Screen};

/// Sleep between retries while the buffer is empty: bounded polling, not a
/// busy-wait.
const EMPTY_BUFFER_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy)]
pub struct PlayArgs {
    pub gamma: f32,
    pub ramp: GlyphRamp,
    pub paused: bool,
    pub start_frame: u32,
    pub edges: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlayerState {
    Initializing,
    Playing,
    Paused,
    Terminated,
}

impl PlayerState {
    fn label(self) -> &'static str {
        match self {
            Self::Initializing => "buffering",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Terminated => "done",
        }
    }

    fn toggled(self) -> Self {
        match self {
            Self::Playing => Self::Paused,
            Self::Paused => Self::Playing,
            other => other,
        }
    }
}

/// Paces the display loop at the video frame rate. Processing time is
/// subtracted from the interval; when it exceeds the interval the sleep is
/// zero and the next frame is simply late.
struct FramePacer {
    interval: Duration,
}

impl FramePacer {
    fn new(fps: f64) -> Self {
        Self {
            interval: Duration::from_secs_f64(1.0 / fps),
        }
    }

    fn remainder(&self, elapsed: Duration) -> Duration {
        self.interval.saturating_sub(elapsed)
    }

    fn sleep_remainder(&self, started: Instant) {
        let remainder = self.remainder(started.elapsed());
        if !remainder.is_zero() {
            thread::sleep(remainder);
        }
    }
}

/// Play `path` in the terminal until the stream ends or the user quits.
pub fn run_play(path: &Path, args: PlayArgs) -> Result<()> {
    let mut session = Session::open(path, args.start_frame)?;
    let metadata = session.metadata();
    println!(
        "[crt] {}: {}x{} @ {:.2} fps, {} frames, {:.1}s",
        path.display(),
        metadata.width,
        metadata.height,
        metadata.fps,
        metadata.total_frames,
        metadata.duration().as_secs_f64(),
    );

    session.start_buffering();

    let mut screen = Screen::new()?;
    let stop_input = Arc::new(AtomicBool::new(false));
    let (request_tx, request_rx) = mpsc::channel();
    let input = terminal::spawn_input_thread(request_tx, Arc::clone(&stop_input))?;

    let result = run_loop(&mut session, &mut screen, &request_rx, &args);

    session.request_quit();
    stop_input.store(true, Ordering::Relaxed);
    drop(screen);
    let _ = input.join();
    result
}

fn run_loop(
    session: &mut Session,
    screen: &mut Screen,
    requests: &Receiver<ControlRequest>,
    args: &PlayArgs,
) -> Result<()> {
    let metadata = session.metadata().clone();
    let src_width = metadata.width as usize;
    let src_height = metadata.height as usize;

    let mut renderer = AsciiRenderer::new(args.ramp, args.gamma);
    let mut edge_pass = args.edges.then(EdgeOverlay::new);
    let pacer = FramePacer::new(metadata.fps);

    let mut state = PlayerState::Initializing;
    let resume_state = if args.paused {
        PlayerState::Paused
    } else {
        PlayerState::Playing
    };
    let mut previous: Option<AsciiFrame> = None;
    let mut needs_full_redraw = true;

    screen.draw_header()?;

    loop {
        let started = Instant::now();

        // Control messages are drained once per iteration; a seek or step
        // clears the buffer, moves the position, and forces a full redraw
        // since the content jumps discontinuously.
        loop {
            match requests.try_recv() {
                Ok(ControlRequest::TogglePause) => state = state.toggled(),
                Ok(ControlRequest::StepForward) => {
                    session.step_forward();
                    previous = None;
                    needs_full_redraw = true;
                }
                Ok(ControlRequest::StepBackward) => {
                    session.step_backward();
                    previous = None;
                    needs_full_redraw = true;
                }
                Ok(ControlRequest::SeekDecile(decile)) => {
                    session.seek_decile(decile);
                    previous = None;
                    needs_full_redraw = true;
                }
                Ok(ControlRequest::Resized) => {
                    screen.draw_header()?;
                    previous = None;
                    needs_full_redraw = true;
                }
                Ok(ControlRequest::Quit) => state = PlayerState::Terminated,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => state = PlayerState::Terminated,
            }
            if state == PlayerState::Terminated {
                return Ok(());
            }
        }

        // A fill failure mid-playback is fatal; the raw-mode guard restores
        // the terminal as the error unwinds.
        session.poll_fill_events()?;

        let Some(frame) = session.buffer().peek() else {
            if session.buffering_complete() && state != PlayerState::Paused {
                // Stream exhausted: nothing left to display.
                return Ok(());
            }
            thread::sleep(EMPTY_BUFFER_POLL);
            continue;
        };

        if state == PlayerState::Initializing {
            state = resume_state;
        }

        let viewport = screen.viewport()?;
        let rendered = renderer.render(&frame.data, src_width, src_height, FRAME_CHANNELS, viewport)?;
        let mut grid = rendered.grid;
        if let Some(pass) = edge_pass.as_mut() {
            let edges = pass.render(&frame.data, src_width, src_height, viewport)?;
            grid = post::overlay(&grid, &edges);
        }

        if needs_full_redraw || rendered.dimensions_changed || previous.is_none() {
            screen.draw_full(&grid)?;
        } else if let Some(old) = &previous {
            let runs = frame_diff(old, &grid);
            screen.apply_diff(&runs)?;
        }
        needs_full_redraw = false;
        previous = Some(grid);

        screen.draw_status(
            viewport,
            frame.index,
            metadata.total_frames,
            metadata.fps,
            state.label(),
        )?;

        if state == PlayerState::Playing {
            session.consume_frame();
            session.maybe_refill();
            if session.at_end() {
                return Ok(());
            }
        }

        pacer.sleep_remainder(started);
    }
}

#[cfg(test)]
mod tests {
    use super::{FramePacer, PlayerState};
    use std::time::Duration;

    #[test]
    fn pacer_sleeps_the_interval_remainder() {
        let pacer = FramePacer::new(25.0);
        let remainder = pacer.remainder(Duration::from_millis(15));
        assert_eq!(remainder, Duration::from_millis(25));
    }

    #[test]
    fn pacer_never_sleeps_negative() {
        // Processing slower than the frame interval: the sleep clamps to
        // zero and playback falls behind instead of erroring.
        let pacer = FramePacer::new(30.0);
        assert_eq!(pacer.remainder(Duration::from_millis(500)), Duration::ZERO);
    }

    #[test]
    fn pause_toggle_flips_between_playing_and_paused() {
        assert_eq!(PlayerState::Playing.toggled(), PlayerState::Paused);
        assert_eq!(PlayerState::Paused.toggled(), PlayerState::Playing);
        assert_eq!(PlayerState::Terminated.toggled(), PlayerState::Terminated);
    }
}
