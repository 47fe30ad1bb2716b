//! Fixed-timestep tick scheduling with bounded catch-up
//!
//! The scheduler keeps a "next due" marker that advances by one update
//! interval per tick. When the zone falls behind it runs several ticks back
//! to back, but never more than `max_frame_skip` in one go; any backlog left
//! after that is dropped instead of being replayed.

use log::{debug, info, warn};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Frame accounting for the tick loop, kept free of any clock so it can be
/// driven with synthetic instants.
#[derive(Debug, Clone)]
pub struct FrameClock {
    interval: Duration,
    max_frame_skip: u32,
    next_due: Instant,
    ran_this_frame: u32,
}

impl FrameClock {
    pub fn new(interval: Duration, max_frame_skip: u32, start: Instant) -> Self {
        Self {
            interval,
            max_frame_skip: max_frame_skip.max(1),
            next_due: start,
            ran_this_frame: 0,
        }
    }

    pub fn begin_frame(&mut self) {
        self.ran_this_frame = 0;
    }

    /// True while a tick is due and the catch-up bound has not been reached.
    pub fn should_tick(&self, now: Instant) -> bool {
        now >= self.next_due && self.ran_this_frame < self.max_frame_skip
    }

    pub fn ticked(&mut self) {
        self.next_due += self.interval;
        self.ran_this_frame += 1;
    }

    /// Closes the frame. If the bound was hit and ticks are still due, the
    /// backlog is discarded and the number of dropped ticks returned.
    pub fn end_frame(&mut self, now: Instant) -> u64 {
        if self.ran_this_frame < self.max_frame_skip || now < self.next_due {
            return 0;
        }

        let behind = now.duration_since(self.next_due);
        let dropped = (behind.as_nanos() / self.interval.as_nanos().max(1)) as u64 + 1;
        self.next_due = now + self.interval;
        dropped
    }

    pub fn next_due(&self) -> Instant {
        self.next_due
    }

    pub fn ran_this_frame(&self) -> u32 {
        self.ran_this_frame
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub frames: u64,
    pub dropped: u64,
    pub max_ticks_in_frame: u32,
}

pub struct TickScheduler {
    interval: Duration,
    max_frame_skip: u32,
}

impl TickScheduler {
    pub fn new(interval: Duration, max_frame_skip: u32) -> Self {
        Self {
            interval,
            max_frame_skip,
        }
    }

    /// Calls `tick` at the configured rate until `stop` turns true or its
    /// sender goes away. Ticks never overlap: each one is awaited before the
    /// next starts.
    pub async fn run<F, Fut>(&self, mut tick: F, mut stop: watch::Receiver<bool>) -> SchedulerStats
    where
        F: FnMut(u64) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut clock = FrameClock::new(self.interval, self.max_frame_skip, Instant::now());
        let mut stats = SchedulerStats::default();

        info!(
            "Tick scheduler started: {:?} interval, at most {} catch-up ticks",
            self.interval, self.max_frame_skip
        );

        loop {
            if *stop.borrow() {
                break;
            }

            clock.begin_frame();
            while clock.should_tick(Instant::now()) {
                stats.ticks += 1;
                tick(stats.ticks).await;
                clock.ticked();
            }
            stats.frames += 1;
            stats.max_ticks_in_frame = stats.max_ticks_in_frame.max(clock.ran_this_frame());

            let dropped = clock.end_frame(Instant::now());
            if dropped > 0 {
                stats.dropped += dropped;
                warn!("Zone is overloaded, dropped {} ticks of backlog", dropped);
            }

            let wake = tokio::time::Instant::from_std(clock.next_due());
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!("Tick scheduler stopped: {:?}", stats);
        stats
    }
}
