//! Terminal frontend: raw-mode lifecycle, glyph output, and the key-input
//! path. Output goes through queued cursor-control writes so one frame's
//! updates land in a single flush.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::event::{Event, KeyCode, KeyEventKind};
use crossterm::{cursor, event, execute, queue, style, terminal};

use crate::ascii_frame::{AsciiFrame, DiffRun};
use crate::ascii_render::Viewport;

/// Rows reserved above the glyph grid for the key help line.
pub const HEADER_ROWS: u16 = 1;
/// Rows reserved below the glyph grid for the status line.
pub const FOOTER_ROWS: u16 = 1;

const INPUT_POLL: Duration = Duration::from_millis(50);

/// A discrete control message from the input path to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    TogglePause,
    StepForward,
    StepBackward,
    SeekDecile(u8),
    Resized,
    Quit,
}

/// Raw-mode + alternate-screen guard. Construction switches the terminal
/// over; drop restores it on every exit path, including panics and decode
/// failures mid-playback.
struct RawGuard;

impl RawGuard {
    fn enter() -> Result<Self> {
        terminal::enable_raw_mode().context("failed to enable raw terminal mode")?;
        let mut stdout = io::stdout();
        execute!(
            stdout,
            terminal::EnterAlternateScreen,
            cursor::Hide,
            terminal::Clear(terminal::ClearType::All),
        )
        .context("failed to initialize terminal screen")?;
        Ok(Self)
    }
}

impl Drop for RawGuard {
    fn drop(&mut self) {
        let mut stdout = io::stdout();
        let _ = execute!(
            stdout,
            style::ResetColor,
            terminal::Clear(terminal::ClearType::All),
            cursor::MoveTo(0, 0),
            cursor::Show,
            terminal::LeaveAlternateScreen,
        );
        let _ = terminal::disable_raw_mode();
    }
}

/// The output sink: owns the raw-mode guard and draws grids, diffs, and
/// the header/footer chrome.
pub struct Screen {
    stdout: io::Stdout,
    _raw: RawGuard,
}

impl Screen {
    pub fn new() -> Result<Self> {
        let raw = RawGuard::enter()?;
        Ok(Self {
            stdout: io::stdout(),
            _raw: raw,
        })
    }

    /// Current glyph viewport: terminal size minus the reserved rows.
    pub fn viewport(&self) -> Result<Viewport> {
        let (cols, rows) = terminal::size().context("failed to query terminal size")?;
        Ok(Viewport {
            cols: cols.max(1),
            rows: rows.saturating_sub(HEADER_ROWS + FOOTER_ROWS).max(1),
        })
    }

    /// Repaint the whole grid (used on start, seek, and resize).
    pub fn draw_full(&mut self, grid: &AsciiFrame) -> Result<()> {
        for row in 0..grid.rows() {
            queue!(
                self.stdout,
                cursor::MoveTo(0, row + HEADER_ROWS),
                style::Print(grid.row_str(row)),
            )?;
        }
        self.stdout.flush()?;
        Ok(())
    }

    /// Apply a diff stream on top of the previously drawn grid.
    pub fn apply_diff(&mut self, runs: &[DiffRun]) -> Result<()> {
        for run in runs {
            queue!(
                self.stdout,
                cursor::MoveTo(run.col, run.row + HEADER_ROWS),
                style::Print(&run.text),
            )?;
        }
        self.stdout.flush()?;
        Ok(())
    }

    pub fn draw_header(&mut self) -> Result<()> {
        queue!(
            self.stdout,
            cursor::MoveTo(0, 0),
            terminal::Clear(terminal::ClearType::CurrentLine),
            style::Print(" space pause | arrows/h/l skip 10s | 0-9 jump | q quit"),
        )?;
        self.stdout.flush()?;
        Ok(())
    }

    pub fn draw_status(
        &mut self,
        viewport: Viewport,
        current_frame: u32,
        total_frames: u32,
        fps: f64,
        state_label: &str,
    ) -> Result<()> {
        let seconds = if fps > 0.0 {
            f64::from(current_frame.saturating_sub(1)) / fps
        } else {
            0.0
        };
        let status = format!(
            " frame {current_frame:06}/{total_frames:06}  t {seconds:7.1}s  {state_label}"
        );
        queue!(
            self.stdout,
            cursor::MoveTo(0, viewport.rows + HEADER_ROWS),
            terminal::Clear(terminal::ClearType::CurrentLine),
            style::Print(status),
        )?;
        self.stdout.flush()?;
        Ok(())
    }
}

fn request_for_key(code: KeyCode) -> Option<ControlRequest> {
    match code {
        KeyCode::Char(' ') => Some(ControlRequest::TogglePause),
        KeyCode::Right | KeyCode::Char('l') => Some(ControlRequest::StepForward),
        KeyCode::Left | KeyCode::Char('h') => Some(ControlRequest::StepBackward),
        KeyCode::Char('q') | KeyCode::Esc => Some(ControlRequest::Quit),
        KeyCode::Char(digit @ '0'..='9') => {
            Some(ControlRequest::SeekDecile(digit as u8 - b'0'))
        }
        _ => None,
    }
}

/// Poll keystrokes on a dedicated thread and forward them as discrete
/// requests. The thread exits on quit, on `stop`, or when the receiving
/// side goes away.
pub fn spawn_input_thread(
    requests: Sender<ControlRequest>,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("crt-input".to_owned())
        .spawn(move || loop {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            match event::poll(INPUT_POLL) {
                Ok(false) => {}
                Ok(true) => {
                    let request = match event::read() {
                        Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => {
                            request_for_key(key.code)
                        }
                        Ok(Event::Resize(_, _)) => Some(ControlRequest::Resized),
                        Ok(_) => None,
                        Err(_) => return,
                    };
                    if let Some(request) = request {
                        let quit = request == ControlRequest::Quit;
                        if requests.send(request).is_err() || quit {
                            return;
                        }
                    }
                }
                Err(_) => return,
            }
        })
        .context("failed to spawn input thread")
}
