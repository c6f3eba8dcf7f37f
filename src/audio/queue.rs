//! Bounded frame queues between pipeline stages.
//!
//! A full queue blocks the producer and an empty queue blocks the consumer.
//! Every blocking wait re-checks a shared [`ShutdownFlag`] at least every
//! [`POLL_INTERVAL`], so a stalled stage always notices `stop()`.

use crate::audio::frame::AudioFrame;
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Upper bound on how long a blocked stage goes without checking for shutdown.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Shared stop signal for a group of stages.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Re-arm for another run.
    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Why a push or pop gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueClosed {
    /// The pipeline is stopping.
    Shutdown,
    /// The other end was dropped.
    Disconnected,
}

/// Producer end of a bounded frame queue.
#[derive(Clone)]
pub struct QueueSender {
    name: &'static str,
    tx: Sender<AudioFrame>,
    shutdown: ShutdownFlag,
    overrun_threshold: Duration,
}

/// Consumer end of a bounded frame queue.
#[derive(Clone)]
pub struct QueueReceiver {
    name: &'static str,
    rx: Receiver<AudioFrame>,
    shutdown: ShutdownFlag,
}

/// Create a bounded queue of `capacity` frames.
#[must_use]
pub fn frame_queue(
    name: &'static str,
    capacity: usize,
    shutdown: &ShutdownFlag,
    overrun_threshold: Duration,
) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    (
        QueueSender {
            name,
            tx,
            shutdown: shutdown.clone(),
            overrun_threshold,
        },
        QueueReceiver {
            name,
            rx,
            shutdown: shutdown.clone(),
        },
    )
}

impl QueueSender {
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Push, blocking while the queue is full.
    ///
    /// `on_overrun` fires once if the wait exceeds the overrun threshold;
    /// the push keeps waiting afterwards; frames are never dropped here.
    ///
    /// # Errors
    ///
    /// Returns [`QueueClosed`] if shutdown was triggered or the consumer is gone.
    pub fn push_with<F>(&self, frame: AudioFrame, on_overrun: F) -> Result<(), QueueClosed>
    where
        F: FnMut(Duration),
    {
        self.push_until(frame, on_overrun, || false).map(|_| ())
    }

    /// Like [`QueueSender::push_with`], but gives the frame up once
    /// `withdraw` returns true while waiting for space.
    ///
    /// Returns `Ok(false)` for a withdrawn frame.
    ///
    /// # Errors
    ///
    /// Returns [`QueueClosed`] if shutdown was triggered or the consumer is gone.
    pub fn push_until<F, W>(
        &self,
        frame: AudioFrame,
        mut on_overrun: F,
        withdraw: W,
    ) -> Result<bool, QueueClosed>
    where
        F: FnMut(Duration),
        W: Fn() -> bool,
    {
        let started = Instant::now();
        let mut reported = false;
        let mut pending = frame;
        loop {
            if self.shutdown.is_triggered() {
                return Err(QueueClosed::Shutdown);
            }
            match self.tx.send_timeout(pending, POLL_INTERVAL) {
                Ok(()) => return Ok(true),
                Err(SendTimeoutError::Timeout(frame)) => {
                    if withdraw() {
                        debug!("{} push withdrawn", self.name);
                        return Ok(false);
                    }
                    pending = frame;
                    let waited = started.elapsed();
                    if !reported && waited >= self.overrun_threshold {
                        reported = true;
                        warn!(
                            "{} queue full for {}ms, producer stalled",
                            self.name,
                            waited.as_millis()
                        );
                        on_overrun(waited);
                    }
                }
                Err(SendTimeoutError::Disconnected(_)) => return Err(QueueClosed::Disconnected),
            }
        }
    }

    /// Push without overrun reporting.
    ///
    /// # Errors
    ///
    /// Returns [`QueueClosed`] if shutdown was triggered or the consumer is gone.
    pub fn push(&self, frame: AudioFrame) -> Result<(), QueueClosed> {
        self.push_with(frame, |_| {})
    }

    /// Frames currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.tx.is_full()
    }
}

/// Outcome of a bounded wait on an empty queue.
#[derive(Debug)]
pub enum Popped {
    Frame(AudioFrame),
    TimedOut,
    Closed(QueueClosed),
}

impl QueueReceiver {
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Pop, blocking until a frame arrives or the queue is shut down.
    pub fn pop(&self) -> Option<AudioFrame> {
        loop {
            match self.pop_timeout(POLL_INTERVAL) {
                Popped::Frame(frame) => return Some(frame),
                Popped::TimedOut => {}
                Popped::Closed(_) => return None,
            }
        }
    }

    /// Pop, giving up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Popped {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shutdown.is_triggered() {
                return Popped::Closed(QueueClosed::Shutdown);
            }
            let now = Instant::now();
            if now >= deadline {
                return Popped::TimedOut;
            }
            let wait = (deadline - now).min(POLL_INTERVAL);
            match self.rx.recv_timeout(wait) {
                Ok(frame) => return Popped::Frame(frame),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Popped::Closed(QueueClosed::Disconnected);
                }
            }
        }
    }

    /// Discard everything queued. Returns the number of frames dropped.
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
