//! Frame pacing for the client capture stream.
//!
//! Camera frames arrive faster than the server wants them. `pace` limits a
//! stream to the server's target frame rate with latest-wins semantics:
//! frames that arrive between emissions are superseded, not queued, so the
//! server always sees the freshest capture. The rate is read from a watch
//! channel and can change mid-stream when the server adjusts quality.

use futures::{Stream, ready};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Interval, interval, interval_at};

/// Extension trait to pace any stream at a dynamically updated frame rate.
pub trait PaceExt: Stream {
    /// Emit at most `fps` items per second, where `fps` follows the watch
    /// channel. Latest-wins: intermediate items are discarded.
    fn pace(self, fps: watch::Receiver<u32>) -> Paced<Self>
    where
        Self: Sized,
    {
        Paced::new(self, fps)
    }
}

impl<T: Stream> PaceExt for T {}

pin_project! {
    /// A stream combinator that limits emission rate to a live target fps.
    pub struct Paced<S: Stream> {
        #[pin]
        stream: S,
        interval: Interval,
        fps: watch::Receiver<u32>,
        current_fps: u32,
        pending: Option<S::Item>,
        // An interval tick was consumed but nothing has been emitted yet.
        tick_ready: bool,
        done: bool,
    }
}

fn interval_for(fps: u32) -> Interval {
    let fps = fps.max(1);
    let mut interval = interval(Duration::from_secs_f64(1.0 / fps as f64));
    // Missed ticks delay rather than burst.
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

/// Interval for a mid-stream rate change: the first tick waits a full
/// period at the new rate instead of firing immediately.
fn interval_after(fps: u32) -> Interval {
    let fps = fps.max(1);
    let period = Duration::from_secs_f64(1.0 / fps as f64);
    let mut interval = interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

impl<S: Stream> Paced<S> {
    pub fn new(stream: S, fps: watch::Receiver<u32>) -> Self {
        let current_fps = (*fps.borrow()).max(1);
        Self {
            stream,
            interval: interval_for(current_fps),
            fps,
            current_fps,
            pending: None,
            tick_ready: false,
            done: false,
        }
    }
}

impl<S: Stream> Stream for Paced<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if *this.done && this.pending.is_none() {
            return Poll::Ready(None);
        }

        // Pick up a rate change before waiting out the old interval.
        let target = (*this.fps.borrow()).max(1);
        if target != *this.current_fps {
            *this.current_fps = target;
            *this.interval = interval_after(target);
        }

        // The consumed tick is remembered across polls: a source slower
        // than the interval emits as soon as its next frame arrives.
        if !*this.tick_ready {
            ready!(this.interval.poll_tick(cx));
            *this.tick_ready = true;
        }

        // Drain everything available, keeping only the latest frame.
        if !*this.done {
            loop {
                match this.stream.as_mut().poll_next(cx) {
                    Poll::Ready(Some(item)) => *this.pending = Some(item),
                    Poll::Ready(None) => {
                        *this.done = true;
                        break;
                    }
                    Poll::Pending => break,
                }
            }
        }

        match this.pending.take() {
            Some(item) => {
                *this.tick_ready = false;
                Poll::Ready(Some(item))
            }
            // The source holds the waker; an empty tick waits for the next
            // frame instead of ending the stream.
            None if !*this.done => Poll::Pending,
            None => Poll::Ready(None),
        }
    }
}
