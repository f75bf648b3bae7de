use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{anyhow, Context, Result};

use crate::decoding::{self, FfmpegStream, VideoMetadata};

/// Upper bound on buffered frames.
pub const BUFFER_CAPACITY: usize = 120;
/// Frames requested per background fill.
pub const FILL_WINDOW: u32 = 60;
/// Refill once consumption drains the buffer below this.
pub const LOW_WATER_MARK: usize = 30;
/// Step offset in seconds for step-forward / step-backward.
pub const SKIP_SECONDS: u32 = 10;

const _: () = assert!(LOW_WATER_MARK + FILL_WINDOW as usize <= BUFFER_CAPACITY);

/// One decoded frame. The pixel data is shared so a `peek` hands out the
/// head frame without copying it out of the buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: u32,
    pub data: Arc<[u8]>,
}

impl Frame {
    pub fn new(index: u32, data: Vec<u8>) -> Self {
        Self {
            index,
            data: data.into(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// The buffer was cleared after this fill started; the frame belongs to
    /// a pre-seek window and must not be delivered.
    Stale,
    Full,
}

struct BufferState {
    frames: VecDeque<Frame>,
    epoch: u64,
    end_of_stream: bool,
}

/// Bounded, order-preserving queue of decoded frames.
///
/// The mutex is held for the duration of one operation only, never across a
/// decoder read. `clear` bumps the epoch so fills started before a seek can
/// no longer append (the ordering guarantee of the seek path).
pub struct FrameBuffer {
    capacity: usize,
    state: Mutex<BufferState>,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(BufferState {
                frames: VecDeque::with_capacity(capacity),
                epoch: 0,
                end_of_stream: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BufferState> {
        // A poisoned buffer mutex means a fill thread panicked mid-append;
        // the queue itself is still structurally sound.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frames.is_empty()
    }

    /// Head frame without removing it; repeated peeks return the same frame.
    pub fn peek(&self) -> Option<Frame> {
        self.lock().frames.front().cloned()
    }

    /// Remove and return the head frame.
    pub fn advance(&self) -> Option<Frame> {
        self.lock().frames.pop_front()
    }

    /// Append under the epoch guard. Frames must arrive in strictly
    /// increasing index order within an epoch.
    pub fn push(&self, frame: Frame, epoch: u64) -> PushOutcome {
        let mut state = self.lock();
        if state.epoch != epoch {
            return PushOutcome::Stale;
        }
        if state.frames.len() >= self.capacity {
            return PushOutcome::Full;
        }
        debug_assert!(
            state.frames.back().map_or(true, |back| back.index < frame.index),
            "frame indices must be strictly increasing"
        );
        state.frames.push_back(frame);
        PushOutcome::Accepted
    }

    /// Discard all buffered content and invalidate in-flight fills.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.frames.clear();
        state.epoch += 1;
        state.end_of_stream = false;
    }

    pub fn mark_end_of_stream(&self, epoch: u64) {
        let mut state = self.lock();
        if state.epoch == epoch {
            state.end_of_stream = true;
        }
    }

    pub fn end_of_stream(&self) -> bool {
        self.lock().end_of_stream
    }
}

/// Outcome of one background fill, reported to the scheduler.
pub struct FillOutcome {
    pub start_frame: u32,
    pub requested: u32,
    pub epoch: u64,
    pub result: Result<u32>,
}

/// Step / seek target arithmetic. Frame indices are 1-based and clamped to
/// `[1, total_frames]`.
pub fn step_forward_target(current: u32, total_frames: u32, fps: f64) -> u32 {
    let offset = (f64::from(SKIP_SECONDS) * fps) as u32;
    current.saturating_add(offset).min(total_frames)
}

pub fn step_backward_target(current: u32, fps: f64) -> u32 {
    let offset = (f64::from(SKIP_SECONDS) * fps) as u32;
    current.saturating_sub(offset).max(1)
}

pub fn decile_target(total_frames: u32, decile: u8) -> u32 {
    debug_assert!(decile <= 9);
    ((u64::from(total_frames) * u64::from(decile) / 10) as u32).max(1)
}

/// One playback session: immutable metadata, the shared frame buffer, the
/// current position, and the fill bookkeeping.
pub struct Session {
    path: PathBuf,
    metadata: VideoMetadata,
    buffer: Arc<FrameBuffer>,
    current_frame: u32,
    next_fill_start: u32,
    fills_in_flight: usize,
    fill_tx: Sender<FillOutcome>,
    fill_rx: Receiver<FillOutcome>,
    quit: Arc<AtomicBool>,
}

impl Session {
    /// Probe `path` and prepare a session starting at `start_frame`.
    pub fn open(path: &Path, start_frame: u32) -> Result<Self> {
        let metadata = decoding::probe(path)?;
        Ok(Self::from_metadata(path, metadata, start_frame))
    }

    pub fn from_metadata(path: &Path, metadata: VideoMetadata, start_frame: u32) -> Self {
        let start = start_frame.clamp(1, metadata.total_frames.max(1));
        let (fill_tx, fill_rx) = mpsc::channel();
        Self {
            path: path.to_path_buf(),
            metadata,
            buffer: Arc::new(FrameBuffer::new(BUFFER_CAPACITY)),
            current_frame: start,
            next_fill_start: start,
            fills_in_flight: 0,
            fill_tx,
            fill_rx,
            quit: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn metadata(&self) -> &VideoMetadata {
        &self.metadata
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    pub fn current_frame(&self) -> u32 {
        self.current_frame
    }

    pub fn at_end(&self) -> bool {
        self.current_frame >= self.metadata.total_frames
    }

    /// All frames up to the end have been requested or the decoder ran dry.
    pub fn buffering_complete(&self) -> bool {
        self.next_fill_start > self.metadata.total_frames || self.buffer.end_of_stream()
    }

    /// Pop the head frame and take its index as the new position.
    pub fn consume_frame(&mut self) -> Option<Frame> {
        let frame = self.buffer.advance()?;
        self.current_frame = frame.index;
        Some(frame)
    }

    pub fn step_forward(&mut self) {
        self.jump_to(step_forward_target(
            self.current_frame,
            self.metadata.total_frames,
            self.metadata.fps,
        ));
    }

    pub fn step_backward(&mut self) {
        self.jump_to(step_backward_target(self.current_frame, self.metadata.fps));
    }

    pub fn seek_decile(&mut self, decile: u8) {
        self.jump_to(decile_target(self.metadata.total_frames, decile));
    }

    /// Seek core: clear the buffer (invalidating in-flight fills), move the
    /// position, then start a fresh fill from the target.
    fn jump_to(&mut self, target: u32) {
        self.buffer.clear();
        self.current_frame = target;
        self.next_fill_start = target;
        self.spawn_fill_window();
    }

    /// Kick off the initial fill for the session start position.
    pub fn start_buffering(&mut self) {
        self.spawn_fill_window();
    }

    /// Low-water-mark policy: once consumption depletes the buffer below the
    /// threshold and no fill is running, request the window immediately
    /// beyond the last requested frame.
    pub fn maybe_refill(&mut self) {
        if self.fills_in_flight > 0 || self.buffering_complete() {
            return;
        }
        if self.buffer.len() < LOW_WATER_MARK {
            self.spawn_fill_window();
        }
    }

    fn spawn_fill_window(&mut self) {
        let total = self.metadata.total_frames;
        if self.next_fill_start > total {
            return;
        }
        let count = FILL_WINDOW.min(total - self.next_fill_start + 1);
        if count == 0 {
            return;
        }
        self.spawn_fill(self.next_fill_start, count);
        self.next_fill_start += count;
    }

    fn spawn_fill(&mut self, start_frame: u32, count: u32) {
        let path = self.path.clone();
        let metadata = self.metadata.clone();
        let buffer = Arc::clone(&self.buffer);
        let epoch = buffer.epoch();
        let quit = Arc::clone(&self.quit);
        let events = self.fill_tx.clone();

        self.fills_in_flight += 1;
        let spawned = thread::Builder::new()
            .name("crt-buffer-fill".to_owned())
            .spawn(move || {
                let result = run_fill(&path, &metadata, start_frame, count, epoch, &buffer, &quit);
                let _ = events.send(FillOutcome {
                    start_frame,
                    requested: count,
                    epoch,
                    result,
                });
            });
        if let Err(error) = spawned {
            let _ = self.fill_tx.send(FillOutcome {
                start_frame,
                requested: count,
                epoch,
                result: Err(anyhow!("failed to spawn fill thread: {error}")),
            });
        }
    }

    /// Drain fill outcomes. Outcomes from a pre-seek epoch are ignored (the
    /// fill was abandoned); a failed fill for the live epoch is
    /// session-fatal and the error propagates to the caller, which restores
    /// the terminal on its way out. A short-delivered window that is not
    /// end-of-stream is reclaimed so the skipped frames get requested again.
    pub fn poll_fill_events(&mut self) -> Result<()> {
        loop {
            match self.fill_rx.try_recv() {
                Ok(outcome) => {
                    self.fills_in_flight = self.fills_in_flight.saturating_sub(1);
                    if outcome.epoch != self.buffer.epoch() {
                        continue;
                    }
                    let delivered = outcome.result.with_context(|| {
                        format!("buffering failed at frame {}", outcome.start_frame)
                    })?;
                    if delivered < outcome.requested && !self.buffer.end_of_stream() {
                        self.next_fill_start = outcome.start_frame + delivered;
                    }
                }
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return Ok(()),
            }
        }
    }

    /// Request termination of all background work. In-flight fills notice
    /// the flag at their next frame boundary and abandon the window.
    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::Relaxed);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.request_quit();
    }
}

/// Decode `count` frames starting at `start_frame` and append them to the
/// buffer. Returns the number of frames delivered. Stops early when the
/// session quits, a seek invalidates the epoch, or the buffer is full; a
/// decoder failure or truncated frame is an error.
fn run_fill(
    path: &Path,
    metadata: &VideoMetadata,
    start_frame: u32,
    count: u32,
    epoch: u64,
    buffer: &FrameBuffer,
    quit: &AtomicBool,
) -> Result<u32> {
    let stream = FfmpegStream::spawn(path, metadata, start_frame, count)?;
    let mut delivered = 0u32;
    let mut hit_capacity = false;

    while delivered < count {
        if quit.load(Ordering::Relaxed) {
            return Ok(delivered);
        }
        let Some(data) = stream.next_frame() else {
            break;
        };
        match buffer.push(Frame::new(start_frame + delivered, data), epoch) {
            PushOutcome::Accepted => delivered += 1,
            PushOutcome::Stale => return Ok(delivered),
            PushOutcome::Full => {
                hit_capacity = true;
                break;
            }
        }
    }

    stream.finish()?;
    if delivered < count && !hit_capacity {
        // The decoder ran out before the requested window was satisfied:
        // the stream is over.
        buffer.mark_end_of_stream(epoch);
    }
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::{
        decile_target, step_backward_target, step_forward_target, Frame, FrameBuffer,
        PushOutcome,
    };

    fn frame(index: u32) -> Frame {
        Frame::new(index, vec![index as u8; 4])
    }

    #[test]
    fn length_never_exceeds_capacity() {
        let buffer = FrameBuffer::new(3);
        let epoch = buffer.epoch();
        for index in 1..=3 {
            assert_eq!(buffer.push(frame(index), epoch), PushOutcome::Accepted);
        }
        assert_eq!(buffer.push(frame(4), epoch), PushOutcome::Full);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn fifo_order_is_preserved() {
        let buffer = FrameBuffer::new(8);
        let epoch = buffer.epoch();
        for index in 10..15 {
            buffer.push(frame(index), epoch);
        }
        // Repeated peeks return the same head frame.
        assert_eq!(buffer.peek().expect("head").index, 10);
        assert_eq!(buffer.peek().expect("head").index, 10);
        for expected in 10..15 {
            assert_eq!(buffer.advance().expect("frame").index, expected);
        }
        assert!(buffer.advance().is_none());
    }

    #[test]
    fn clear_empties_and_invalidates_old_epoch() {
        let buffer = FrameBuffer::new(8);
        let old_epoch = buffer.epoch();
        buffer.push(frame(1), old_epoch);
        buffer.push(frame(2), old_epoch);

        buffer.clear();
        assert_eq!(buffer.len(), 0);
        assert!(buffer.peek().is_none());

        // A fill started before the clear may no longer append.
        assert_eq!(buffer.push(frame(3), old_epoch), PushOutcome::Stale);
        assert!(buffer.is_empty());

        let new_epoch = buffer.epoch();
        assert_eq!(buffer.push(frame(7), new_epoch), PushOutcome::Accepted);
    }

    #[test]
    fn end_of_stream_respects_epoch() {
        let buffer = FrameBuffer::new(4);
        let old_epoch = buffer.epoch();
        buffer.clear();
        buffer.mark_end_of_stream(old_epoch);
        assert!(!buffer.end_of_stream());

        buffer.mark_end_of_stream(buffer.epoch());
        assert!(buffer.end_of_stream());
    }

    #[test]
    fn step_backward_clamps_to_first_frame() {
        // 10 s at 30 fps is a 300-frame offset; from frame 5 that clamps to 1.
        assert_eq!(step_backward_target(5, 30.0), 1);
        assert_eq!(step_backward_target(500, 30.0), 200);
    }

    #[test]
    fn step_forward_clamps_to_total_frames() {
        assert_eq!(step_forward_target(950, 1000, 30.0), 1000);
        assert_eq!(step_forward_target(100, 1000, 30.0), 400);
    }

    #[test]
    fn decile_targets_cover_the_timeline() {
        assert_eq!(decile_target(1000, 0), 1);
        assert_eq!(decile_target(1000, 3), 300);
        assert_eq!(decile_target(1000, 9), 900);
        // Tiny videos still land on a valid frame.
        assert_eq!(decile_target(4, 1), 1);
    }
}
